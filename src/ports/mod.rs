//! Trait seams for external collaborators.
//!
//! The pipeline treats both of these as fire-and-forget: a failure is logged
//! by the caller and never changes a job's outcome.

use std::io;

use async_trait::async_trait;

use crate::jobs::MediaType;

/// The relational metadata store the gallery frontend reads from.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait MetadataStore: Send + Sync {
    async fn save_image_metadata(
        &self,
        album: &str,
        filename: &str,
        title: &str,
        description: &str,
        media_type: MediaType,
    ) -> io::Result<()>;

    async fn delete_image_metadata(&self, album: &str, filename: &str) -> io::Result<()>;

    async fn delete_album_metadata(&self, album: &str) -> io::Result<()>;
}

/// Regenerates the static site after a job completes. The result is not
/// consumed by the pipeline.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait SiteGenerator: Send + Sync {
    async fn regenerate(&self) -> io::Result<()>;
}
