//! Media service: accepts finished uploads and drives them to completion.

use std::path::PathBuf;
use std::sync::Arc;

use crate::av::cmd::ProcessRunner;
use crate::av::pipeline::VideoPipeline;
use crate::av::stills;
use crate::config::Config;
use crate::error::PipelineError;
use crate::jobs::broadcaster::JobProgress;
use crate::jobs::{
    derive_title, ImageJob, ImageOptimizationQueue, JobId, JobRegistry, JobStage, MediaType,
    ProgressBroadcaster, ProgressEvent,
};
use crate::ports::{MetadataStore, SiteGenerator};

/// Orchestrates jobs after the HTTP layer has written the uploaded bytes to
/// disk. Videos each get their own task; images go through the single-worker
/// optimization queue.
pub struct MediaService<R, M, G> {
    runner: Arc<R>,
    metadata: Arc<M>,
    site: Arc<G>,
    registry: Arc<JobRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    config: Arc<Config>,
    image_queue: ImageOptimizationQueue,
}

impl<R, M, G> MediaService<R, M, G>
where
    R: ProcessRunner + 'static,
    M: MetadataStore + 'static,
    G: SiteGenerator + 'static,
{
    pub fn new(
        runner: Arc<R>,
        metadata: Arc<M>,
        site: Arc<G>,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        config: Arc<Config>,
    ) -> Self {
        let image_queue = ImageOptimizationQueue::start(
            runner.clone(),
            metadata.clone(),
            site.clone(),
            registry.clone(),
            broadcaster.clone(),
            config.clone(),
        );
        Self {
            runner,
            metadata,
            site,
            registry,
            broadcaster,
            config,
            image_queue,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Admit a job and publish its initial `queued` event, before any bytes
    /// are streamed for it.
    ///
    /// Returns false when a job for the same (album, filename) is still in
    /// flight; the caller should reject the upload as a duplicate.
    pub fn admit(&self, id: &JobId, kind: MediaType) -> bool {
        if !self.registry.admit(id, kind) {
            tracing::warn!(job = %id, "rejected duplicate submission");
            return false;
        }
        self.broadcaster
            .publish(ProgressEvent::new(id, JobStage::Queued, 0));
        tracing::info!(job = %id, kind = ?kind, "job admitted");
        true
    }

    /// Start processing an admitted job whose bytes are on disk at `input`.
    pub fn dispatch(self: &Arc<Self>, id: JobId, kind: MediaType, input: PathBuf) {
        match kind {
            MediaType::Video => {
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    service.run_video(id, input).await;
                });
            }
            MediaType::Photo => {
                let queued = self.image_queue.enqueue(ImageJob {
                    id: id.clone(),
                    input,
                });
                if !queued {
                    self.fail_job(&id, "image optimization queue is unavailable".to_string());
                }
            }
        }
    }

    /// Admit and immediately dispatch in one step.
    pub fn submit(self: &Arc<Self>, id: JobId, kind: MediaType, input: PathBuf) -> bool {
        if !self.admit(&id, kind) {
            return false;
        }
        self.dispatch(id, kind, input);
        true
    }

    /// Terminate an admitted job that never reached its pipeline, e.g. when
    /// streaming its bytes to disk failed.
    pub fn fail_job(&self, id: &JobId, message: String) {
        JobProgress::new(id.clone(), self.broadcaster.clone(), self.registry.clone())
            .fail(message);
    }

    async fn run_video(&self, id: JobId, input: PathBuf) {
        let progress =
            JobProgress::new(id.clone(), self.broadcaster.clone(), self.registry.clone());
        let pipeline = VideoPipeline::new(self.runner.clone(), self.config.clone());

        match pipeline
            .process(&input, &id.album, &id.filename, &progress)
            .await
        {
            Ok(()) => {
                progress.update(JobStage::GeneratingTitle, 0, None);
                let title = derive_title(&id.filename);

                if let Err(err) = self
                    .metadata
                    .save_image_metadata(&id.album, &id.filename, &title, "", MediaType::Video)
                    .await
                {
                    tracing::warn!(job = %id, error = %err, "metadata save failed");
                }

                progress.update(JobStage::GeneratingTitle, 100, None);
                progress.complete(Some(title));

                if let Err(err) = self.site.regenerate().await {
                    tracing::warn!(job = %id, error = %err, "site regeneration failed");
                }
            }
            Err(failure) => {
                tracing::error!(job = %id, error = %failure, "video pipeline failed");
                progress.fail(failure.to_string());
            }
        }
    }

    /// Re-extract both preview stills from the retained upload at the given
    /// timestamp, replacing the ones taken during processing.
    pub async fn extract_stills(
        &self,
        id: &JobId,
        timestamp: f64,
    ) -> Result<(), PipelineError> {
        let source = self.config.upload_path(&id.album, &id.filename);
        stills::extract_stills(
            &*self.runner,
            &self.config,
            &source,
            &id.album,
            &id.filename,
            timestamp,
        )
        .await
    }

    /// Remove every artifact of one media item: the retained upload, the HLS
    /// tree, both stills, and its metadata row. Missing pieces are skipped.
    pub async fn delete_media(&self, id: &JobId) {
        remove_file_if_present(self.config.upload_path(&id.album, &id.filename)).await;
        remove_dir_if_present(self.config.video_job_dir(&id.album, &id.filename)).await;
        remove_file_if_present(self.config.thumbnail_path(&id.album, &id.filename)).await;
        remove_file_if_present(self.config.modal_path(&id.album, &id.filename)).await;

        if let Err(err) = self.metadata.delete_image_metadata(&id.album, &id.filename).await {
            tracing::warn!(job = %id, error = %err, "metadata delete failed");
        }
        if let Err(err) = self.site.regenerate().await {
            tracing::warn!(job = %id, error = %err, "site regeneration failed");
        }
    }

    /// Remove an entire album's artifacts and metadata.
    pub async fn delete_album(&self, album: &str) {
        remove_dir_if_present(self.config.upload_dir().join(album)).await;
        remove_dir_if_present(self.config.video_dir().join(album)).await;
        remove_dir_if_present(self.config.gallery_dir.join("optimized").join("thumbnail").join(album))
            .await;
        remove_dir_if_present(self.config.gallery_dir.join("optimized").join("modal").join(album))
            .await;

        if let Err(err) = self.metadata.delete_album_metadata(album).await {
            tracing::warn!(album, error = %err, "album metadata delete failed");
        }
        if let Err(err) = self.site.regenerate().await {
            tracing::warn!(album, error = %err, "site regeneration failed");
        }
    }
}

async fn remove_file_if_present(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}

async fn remove_dir_if_present(path: PathBuf) {
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove directory")
        }
    }
}
