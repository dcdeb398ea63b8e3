//! Single-worker FIFO queue for image optimization subprocesses.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::av::cmd::{OutputLine, ProcessRunner};
use crate::av::progress::parse_optimizer_line;
use crate::config::Config;
use crate::error::PipelineError;
use crate::jobs::broadcaster::JobProgress;
use crate::jobs::{derive_title, JobId, JobRegistry, JobStage, MediaType, ProgressBroadcaster};
use crate::ports::{MetadataStore, SiteGenerator};

/// One queued image optimization.
#[derive(Debug)]
pub struct ImageJob {
    pub id: JobId,
    pub input: PathBuf,
}

/// Admits exactly one image-optimization subprocess at a time.
///
/// The queue itself is an unbounded channel drained by a single worker task,
/// so jobs run strictly in enqueue order and an error simply frees the slot
/// for the next one. There is no backpressure signal to callers and no
/// timeout: a wedged optimizer holds the slot and starves the queue.
pub struct ImageOptimizationQueue {
    tx: mpsc::UnboundedSender<ImageJob>,
}

impl ImageOptimizationQueue {
    pub fn start<R, M, G>(
        runner: Arc<R>,
        metadata: Arc<M>,
        site: Arc<G>,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        config: Arc<Config>,
    ) -> Self
    where
        R: ProcessRunner + 'static,
        M: MetadataStore + 'static,
        G: SiteGenerator + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ImageJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let id = job.id.clone();
                tracing::info!(job = %id, "image queue: starting");
                process_image(&*runner, &*metadata, &*site, &registry, &broadcaster, &config, job)
                    .await;
                tracing::info!(job = %id, "image queue: slot freed");
            }
        });

        Self { tx }
    }

    /// Append a job; it starts as soon as every job ahead of it has reached a
    /// terminal outcome. Returns false only if the worker task is gone.
    pub fn enqueue(&self, job: ImageJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

async fn process_image<R, M, G>(
    runner: &R,
    metadata: &M,
    site: &G,
    registry: &Arc<JobRegistry>,
    broadcaster: &Arc<ProgressBroadcaster>,
    config: &Config,
    job: ImageJob,
) where
    R: ProcessRunner,
    M: MetadataStore,
    G: SiteGenerator,
{
    let progress = JobProgress::new(job.id.clone(), broadcaster.clone(), registry.clone());

    if !job.input.exists() {
        progress.fail(PipelineError::NotFound(job.input.clone()).to_string());
        return;
    }

    let thumbnail = config.thumbnail_path(&job.id.album, &job.id.filename);
    let modal = config.modal_path(&job.id.album, &job.id.filename);
    for path in [&thumbnail, &modal] {
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                progress.fail(PipelineError::Io(err).to_string());
                return;
            }
        }
    }

    progress.update(JobStage::Optimizing, 0, None);

    let args: Vec<String> = vec![
        job.input.to_string_lossy().into_owned(),
        thumbnail.to_string_lossy().into_owned(),
        modal.to_string_lossy().into_owned(),
    ];

    // The optimizer reports progress as PROGRESS:<percent>:<message> lines on
    // stdout; they are forwarded unmodified.
    let (tx, mut lines) = mpsc::unbounded_channel();
    let reporter = progress.clone();
    let consumer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let OutputLine::Stdout(text) = line {
                if let Some((percent, message)) = parse_optimizer_line(&text) {
                    reporter.update(JobStage::Optimizing, percent, Some(message));
                }
            }
        }
    });

    let outcome = runner.run(&config.optimizer_bin, &args, tx).await;
    let _ = consumer.await;

    match outcome {
        Err(err) => {
            progress.fail(PipelineError::spawn(&config.optimizer_bin, err).to_string());
        }
        Ok(outcome) if !outcome.success() => {
            progress.fail(PipelineError::exit(&config.optimizer_bin, &outcome).to_string());
        }
        Ok(_) => {
            progress.update(JobStage::Optimizing, 100, None);
            progress.update(JobStage::GeneratingTitle, 0, None);
            let title = derive_title(&job.id.filename);

            if let Err(err) = metadata
                .save_image_metadata(&job.id.album, &job.id.filename, &title, "", MediaType::Photo)
                .await
            {
                tracing::warn!(job = %job.id, error = %err, "metadata save failed");
            }

            progress.update(JobStage::GeneratingTitle, 100, None);
            progress.complete(Some(title));

            if let Err(err) = site.regenerate().await {
                tracing::warn!(job = %job.id, error = %err, "site regeneration failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::cmd::{MockProcessRunner, RunOutcome};
    use crate::jobs::ProgressEvent;
    use crate::ports::{MockMetadataStore, MockSiteGenerator};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        Config {
            addr: String::new(),
            port: String::new(),
            gallery_dir: dir.to_path_buf(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            optimizer_bin: "optimize-image".to_string(),
            profiles_path: None,
            site_regen_cmd: None,
        }
    }

    async fn write_input(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, b"fake image").await.unwrap();
        path
    }

    async fn wait_terminal(
        rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
    ) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event stream closed early");
                if event.state.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("job never reached a terminal state")
    }

    fn input_name(args: &[String]) -> String {
        Path::new(&args[0])
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let input_a = write_input(dir.path(), "a.jpg").await;
        let input_b = write_input(dir.path(), "b.jpg").await;

        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut runner = MockProcessRunner::new();
        let run_log = log.clone();
        runner.expect_run().times(2).returning(move |_, args, _| {
            let name = input_name(args);
            let log = run_log.clone();
            log.lock().unwrap().push(format!("start:{}", name));
            Box::pin(async move {
                // Hold the slot briefly so an eager second job would interleave.
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push(format!("exit:{}", name));
                Ok(RunOutcome {
                    exit_code: 0,
                    stderr_tail: String::new(),
                })
            })
        });

        let mut metadata = MockMetadataStore::new();
        let save_log = log.clone();
        metadata
            .expect_save_image_metadata()
            .times(2)
            .returning(move |_, filename, _, _, _| {
                save_log.lock().unwrap().push(format!("save:{}", filename));
                Box::pin(async { Ok(()) })
            });
        let mut site = MockSiteGenerator::new();
        site.expect_regenerate()
            .times(2)
            .returning(|| Box::pin(async { Ok(()) }));

        let registry = Arc::new(JobRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let id_a = JobId::new("trip", "a.jpg");
        let id_b = JobId::new("trip", "b.jpg");
        registry.admit(&id_a, MediaType::Photo);
        registry.admit(&id_b, MediaType::Photo);
        let (_, mut rx_b) = broadcaster.subscribe(&id_b);

        let queue = ImageOptimizationQueue::start(
            Arc::new(runner),
            Arc::new(metadata),
            Arc::new(site),
            registry,
            broadcaster,
            Arc::new(test_config(dir.path())),
        );

        assert!(queue.enqueue(ImageJob {
            id: id_a,
            input: input_a
        }));
        assert!(queue.enqueue(ImageJob {
            id: id_b,
            input: input_b
        }));

        wait_terminal(&mut rx_b).await;

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                "start:a.jpg",
                "exit:a.jpg",
                "save:a.jpg",
                "start:b.jpg",
                "exit:b.jpg",
                "save:b.jpg"
            ]
        );
    }

    #[tokio::test]
    async fn test_optimizer_progress_lines_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "photo.jpg").await;

        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_, _, lines| {
            let _ = lines.send(OutputLine::Stdout("PROGRESS:30:resizing".to_string()));
            let _ = lines.send(OutputLine::Stdout("PROGRESS:80:compressing".to_string()));
            let _ = lines.send(OutputLine::Stdout("unrelated noise".to_string()));
            Box::pin(async move {
                Ok(RunOutcome {
                    exit_code: 0,
                    stderr_tail: String::new(),
                })
            })
        });
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_save_image_metadata()
            .withf(|album, filename, title, _, media_type| {
                album == "trip"
                    && filename == "photo.jpg"
                    && title == "Photo"
                    && *media_type == MediaType::Photo
            })
            .times(1)
            .returning(|_, _, _, _, _| Box::pin(async { Ok(()) }));
        let mut site = MockSiteGenerator::new();
        site.expect_regenerate()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        let registry = Arc::new(JobRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let id = JobId::new("trip", "photo.jpg");
        registry.admit(&id, MediaType::Photo);
        let (_, mut rx) = broadcaster.subscribe(&id);

        let queue = ImageOptimizationQueue::start(
            Arc::new(runner),
            Arc::new(metadata),
            Arc::new(site),
            registry,
            broadcaster,
            Arc::new(test_config(dir.path())),
        );
        queue.enqueue(ImageJob { id, input });

        let mut seen = Vec::new();
        let terminal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                let done = event.state.is_terminal();
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await;
        terminal.unwrap();

        let forwarded: Vec<(u8, Option<String>)> = seen
            .iter()
            .filter(|e| e.state == JobStage::Optimizing && e.message.is_some())
            .map(|e| (e.progress, e.message.clone()))
            .collect();
        assert_eq!(
            forwarded,
            vec![
                (30, Some("resizing".to_string())),
                (80, Some("compressing".to_string()))
            ]
        );

        // The title stage closes at exactly 100 before the terminal event.
        let penultimate = &seen[seen.len() - 2];
        assert_eq!(penultimate.state, JobStage::GeneratingTitle);
        assert_eq!(penultimate.progress, 100);

        let last = seen.last().unwrap();
        assert_eq!(last.state, JobStage::Complete);
        assert_eq!(last.progress, 100);
        assert_eq!(last.title.as_deref(), Some("Photo"));
    }

    #[tokio::test]
    async fn test_failed_job_frees_the_slot_for_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let input_a = write_input(dir.path(), "bad.jpg").await;
        let input_b = write_input(dir.path(), "good.jpg").await;

        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| input_name(args) == "bad.jpg")
            .times(1)
            .returning(|_, _, _| {
                Box::pin(async move {
                    Ok(RunOutcome {
                        exit_code: 2,
                        stderr_tail: "unsupported pixel format".to_string(),
                    })
                })
            });
        runner
            .expect_run()
            .withf(|_, args, _| input_name(args) == "good.jpg")
            .times(1)
            .returning(|_, _, _| {
                Box::pin(async move {
                    Ok(RunOutcome {
                        exit_code: 0,
                        stderr_tail: String::new(),
                    })
                })
            });

        // Only the successful job writes metadata and refreshes the site.
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_save_image_metadata()
            .withf(|_, filename, _, _, _| filename == "good.jpg")
            .times(1)
            .returning(|_, _, _, _, _| Box::pin(async { Ok(()) }));
        let mut site = MockSiteGenerator::new();
        site.expect_regenerate()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        let registry = Arc::new(JobRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let id_a = JobId::new("trip", "bad.jpg");
        let id_b = JobId::new("trip", "good.jpg");
        registry.admit(&id_a, MediaType::Photo);
        registry.admit(&id_b, MediaType::Photo);
        let (_, mut rx_a) = broadcaster.subscribe(&id_a);
        let (_, mut rx_b) = broadcaster.subscribe(&id_b);

        let queue = ImageOptimizationQueue::start(
            Arc::new(runner),
            Arc::new(metadata),
            Arc::new(site),
            registry,
            broadcaster,
            Arc::new(test_config(dir.path())),
        );
        queue.enqueue(ImageJob {
            id: id_a,
            input: input_a,
        });
        queue.enqueue(ImageJob {
            id: id_b,
            input: input_b,
        });

        let failed = wait_terminal(&mut rx_a).await;
        assert_eq!(failed.state, JobStage::Error);
        assert!(failed
            .error
            .as_deref()
            .unwrap()
            .contains("unsupported pixel format"));

        let succeeded = wait_terminal(&mut rx_b).await;
        assert_eq!(succeeded.state, JobStage::Complete);
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockProcessRunner::new(); // no expectations: must not run

        let registry = Arc::new(JobRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let id = JobId::new("trip", "ghost.jpg");
        registry.admit(&id, MediaType::Photo);
        let (_, mut rx) = broadcaster.subscribe(&id);

        let queue = ImageOptimizationQueue::start(
            Arc::new(runner),
            Arc::new(MockMetadataStore::new()),
            Arc::new(MockSiteGenerator::new()),
            registry,
            broadcaster,
            Arc::new(test_config(dir.path())),
        );
        queue.enqueue(ImageJob {
            id,
            input: dir.path().join("ghost.jpg"),
        });

        let event = wait_terminal(&mut rx).await;
        assert_eq!(event.state, JobStage::Error);
        assert!(event.error.as_deref().unwrap().contains("not found"));
    }
}
