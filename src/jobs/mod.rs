//! Job identity, lifecycle states and progress events.

pub mod broadcaster;
pub mod image_queue;
pub mod registry;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};

pub use broadcaster::ProgressBroadcaster;
pub use image_queue::{ImageJob, ImageOptimizationQueue};
pub use registry::JobRegistry;

/// A job is identified by the (album, filename) pair it writes outputs for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobId {
    pub album: String,
    pub filename: String,
}

impl JobId {
    pub fn new(album: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            album: album.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.album, self.filename)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    /// Classify an upload by file extension. Unknown extensions are rejected
    /// at the upload boundary.
    pub fn from_filename(filename: &str) -> Option<MediaType> {
        let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp4" | "mov" | "m4v" | "webm" | "mkv" | "avi" => Some(MediaType::Video),
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" => Some(MediaType::Photo),
            _ => None,
        }
    }
}

/// Lifecycle stage of a job, serialized as the wire-level state string.
///
/// `queued → (uploading, kind-specific stages…) → complete | error`; the two
/// terminal states have no outgoing transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStage {
    Queued,
    Uploading,
    Optimizing,
    GeneratingTitle,
    Rotation,
    /// Per-rendition encode stage, named after the profile (e.g. "720p").
    Resolution(String),
    Thumbnail,
    ModalPreview,
    Complete,
    Error,
}

impl JobStage {
    pub fn as_str(&self) -> &str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Uploading => "uploading",
            JobStage::Optimizing => "optimizing",
            JobStage::GeneratingTitle => "generating-title",
            JobStage::Rotation => "rotation",
            JobStage::Resolution(name) => name,
            JobStage::Thumbnail => "thumbnail",
            JobStage::ModalPreview => "modal-preview",
            JobStage::Complete => "complete",
            JobStage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Complete | JobStage::Error)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One progress update on a job's event stream. Immutable once published.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub album: String,
    pub filename: String,
    pub progress: u8,
    pub state: JobStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ProgressEvent {
    pub fn new(id: &JobId, state: JobStage, progress: u8) -> Self {
        Self {
            album: id.album.clone(),
            filename: id.filename.clone(),
            progress,
            state,
            message: None,
            error: None,
            title: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Derive a human-readable title from an uploaded filename: drop the
/// extension, split on separators, capitalize each word.
pub fn derive_title(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());

    stem.split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
