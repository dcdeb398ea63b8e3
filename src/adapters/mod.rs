//! Concrete implementations of the metadata and site-generation ports.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::MediaType;
use crate::ports::{MetadataStore, SiteGenerator};

#[derive(Debug, Serialize, Deserialize)]
struct ImageRecord {
    title: String,
    description: String,
    media_type: MediaType,
}

/// Stores one JSON document per media item under
/// `<meta_dir>/<album>/<filename>.json`. The static site generator reads
/// these when rendering album pages.
pub struct JsonMetadataStore {
    meta_dir: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(meta_dir: PathBuf) -> Self {
        Self { meta_dir }
    }

    fn record_path(&self, album: &str, filename: &str) -> PathBuf {
        self.meta_dir.join(album).join(format!("{}.json", filename))
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn save_image_metadata(
        &self,
        album: &str,
        filename: &str,
        title: &str,
        description: &str,
        media_type: MediaType,
    ) -> io::Result<()> {
        let record = ImageRecord {
            title: title.to_string(),
            description: description.to_string(),
            media_type,
        };
        let path = self.record_path(album, filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tokio::fs::write(&path, json).await
    }

    async fn delete_image_metadata(&self, album: &str, filename: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.record_path(album, filename)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    async fn delete_album_metadata(&self, album: &str) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.meta_dir.join(album)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}

/// Runs a configured shell-free command (program plus arguments, split on
/// whitespace) to regenerate the static site. With no command configured it
/// is a logged no-op.
pub struct CommandSiteGenerator {
    command: Option<Vec<String>>,
}

impl CommandSiteGenerator {
    pub fn new(command: Option<String>) -> Self {
        let command = command
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .filter(|parts: &Vec<String>| !parts.is_empty());
        Self { command }
    }
}

#[async_trait]
impl SiteGenerator for CommandSiteGenerator {
    async fn regenerate(&self) -> io::Result<()> {
        let Some(parts) = &self.command else {
            tracing::debug!("no site regeneration command configured");
            return Ok(());
        };

        tracing::info!(command = %parts.join(" "), "regenerating site");
        let status = tokio::process::Command::new(&parts[0])
            .args(&parts[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("site generator exited with {}", status),
            ));
        }
        Ok(())
    }
}
