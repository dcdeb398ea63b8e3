//! Environment configuration and resolution profiles.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// One resolution/bitrate rendition target.
///
/// The effective set used by a job is the subset with `enabled = true` and
/// `height <= source height`, sorted ascending by height.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolutionProfile {
    pub name: String,
    pub height: u32,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Built-in fallback used when no profile file is configured.
pub fn default_profiles() -> Vec<ResolutionProfile> {
    let tiers = [
        ("240p", 240, 400, 64),
        ("360p", 360, 800, 96),
        ("480p", 480, 1400, 128),
        ("720p", 720, 2800, 128),
        ("1080p", 1080, 5000, 192),
    ];
    tiers
        .iter()
        .map(|&(name, height, video_kbps, audio_kbps)| ResolutionProfile {
            name: name.to_string(),
            height,
            video_kbps,
            audio_kbps,
            enabled: true,
        })
        .collect()
}

/// Service configuration, loaded from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Root of the gallery tree (uploads/, video/, optimized/)
    pub gallery_dir: PathBuf,
    /// ffmpeg binary name or path
    pub ffmpeg_bin: String,
    /// ffprobe binary name or path
    pub ffprobe_bin: String,
    /// Image optimizer binary name or path
    pub optimizer_bin: String,
    /// Optional JSON file with resolution profiles; falls back to built-ins
    pub profiles_path: Option<PathBuf>,
    /// Optional command to regenerate the static site after a job completes
    pub site_regen_cmd: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            gallery_dir: PathBuf::from(
                env::var("GALLERY_DIR").unwrap_or_else(|_| String::from("./gallery")),
            ),
            ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or_else(|_| String::from("ffmpeg")),
            ffprobe_bin: env::var("FFPROBE_BIN").unwrap_or_else(|_| String::from("ffprobe")),
            optimizer_bin: env::var("IMAGE_OPTIMIZER_BIN")
                .unwrap_or_else(|_| String::from("optimize-image")),
            profiles_path: env::var("PROFILES_PATH").ok().map(PathBuf::from),
            site_regen_cmd: env::var("SITE_REGEN_CMD").ok(),
        }
    }

    /// Load the resolution profile set: the configured JSON file when present,
    /// otherwise the compiled-in defaults.
    pub fn load_profiles(&self) -> Result<Vec<ResolutionProfile>, PipelineError> {
        let Some(path) = &self.profiles_path else {
            return Ok(default_profiles());
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|err| {
                PipelineError::Configuration(format!(
                    "invalid profiles file {}: {}",
                    path.display(),
                    err
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(default_profiles()),
            Err(err) => Err(PipelineError::Configuration(format!(
                "unreadable profiles file {}: {}",
                path.display(),
                err
            ))),
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.gallery_dir.join("uploads")
    }

    pub fn upload_path(&self, album: &str, filename: &str) -> PathBuf {
        self.upload_dir().join(album).join(filename)
    }

    pub fn video_dir(&self) -> PathBuf {
        self.gallery_dir.join("video")
    }

    /// `video/<album>/<filename>/` — master manifest plus per-rendition subdirs.
    pub fn video_job_dir(&self, album: &str, filename: &str) -> PathBuf {
        self.video_dir().join(album).join(filename)
    }

    pub fn thumbnail_path(&self, album: &str, filename: &str) -> PathBuf {
        self.gallery_dir
            .join("optimized")
            .join("thumbnail")
            .join(album)
            .join(still_name(filename))
    }

    pub fn modal_path(&self, album: &str, filename: &str) -> PathBuf {
        self.gallery_dir
            .join("optimized")
            .join("modal")
            .join(album)
            .join(still_name(filename))
    }
}

/// Preview stills are always JPEGs named after the source file's stem.
fn still_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    format!("{}.jpg", stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config(gallery_dir: PathBuf) -> Config {
        Config {
            addr: String::from("127.0.0.1"),
            port: String::from("3000"),
            gallery_dir,
            ffmpeg_bin: String::from("ffmpeg"),
            ffprobe_bin: String::from("ffprobe"),
            optimizer_bin: String::from("optimize-image"),
            profiles_path: None,
            site_regen_cmd: None,
        }
    }

    #[test]
    fn test_default_profiles_ascending_and_enabled() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), 5);
        assert!(profiles.windows(2).all(|w| w[0].height < w[1].height));
        assert!(profiles.iter().all(|p| p.enabled));
    }

    #[test]
    fn test_load_profiles_falls_back_to_defaults() {
        let config = test_config(PathBuf::from("/tmp/gallery"));
        let profiles = config.load_profiles().unwrap();
        assert_eq!(profiles, default_profiles());
    }

    #[test]
    fn test_load_profiles_missing_file_falls_back() {
        let mut config = test_config(PathBuf::from("/tmp/gallery"));
        config.profiles_path = Some(PathBuf::from("/nonexistent/profiles.json"));
        let profiles = config.load_profiles().unwrap();
        assert_eq!(profiles, default_profiles());
    }

    #[test]
    fn test_load_profiles_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"540p","height":540,"video_kbps":1800,"audio_kbps":128}}]"#
        )
        .unwrap();

        let mut config = test_config(PathBuf::from("/tmp/gallery"));
        config.profiles_path = Some(file.path().to_path_buf());
        let profiles = config.load_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "540p");
        assert!(profiles[0].enabled, "enabled should default to true");
    }

    #[test]
    fn test_load_profiles_malformed_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let mut config = test_config(PathBuf::from("/tmp/gallery"));
        config.profiles_path = Some(file.path().to_path_buf());
        let err = config.load_profiles().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_artifact_paths() {
        let config = test_config(PathBuf::from("/srv/gallery"));
        assert_eq!(
            config.video_job_dir("trip", "beach.mp4"),
            PathBuf::from("/srv/gallery/video/trip/beach.mp4")
        );
        assert_eq!(
            config.thumbnail_path("trip", "beach.mp4"),
            PathBuf::from("/srv/gallery/optimized/thumbnail/trip/beach.jpg")
        );
        assert_eq!(
            config.modal_path("trip", "photo.png"),
            PathBuf::from("/srv/gallery/optimized/modal/trip/photo.jpg")
        );
    }
}
