//! The video transcoding pipeline.
//!
//! Stages run in a fixed order: probe, rotation normalize, resolution
//! selection, per-rendition segmented encode (ascending height), master
//! manifest synthesis, still extraction, cleanup. Any stage failure aborts
//! the rest and surfaces the failing stage; artifacts already written stay in
//! place, and a re-run overwrites them.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::av::cmd::{OutputLine, ProcessRunner};
use crate::av::probe::probe_metadata;
use crate::av::progress::FfmpegProgress;
use crate::av::stills::{extract_still, DEFAULT_STILL_TIMESTAMP, MODAL_WIDTH, THUMBNAIL_WIDTH};
use crate::config::{Config, ResolutionProfile};
use crate::error::{PipelineError, StageFailure};
use crate::hls::MasterManifest;
use crate::jobs::broadcaster::JobProgress;
use crate::jobs::JobStage;

/// Segment length target for rendition playlists, in seconds.
const SEGMENT_SECONDS: u32 = 4;

/// The enabled profiles that fit the source, ascending by height. This is the
/// exact rendition set a job encodes and lists in its master manifest.
pub fn select_profiles(
    profiles: &[ResolutionProfile],
    source_height: u32,
) -> Vec<ResolutionProfile> {
    let mut selected: Vec<ResolutionProfile> = profiles
        .iter()
        .filter(|p| p.enabled && p.height <= source_height)
        .cloned()
        .collect();
    selected.sort_by_key(|p| p.height);
    selected
}

/// Encoder preset/quality tier: taller targets trade speed for quality.
pub fn encoder_tuning(height: u32) -> (&'static str, u8) {
    if height >= 1080 {
        ("slow", 20)
    } else if height >= 720 {
        ("medium", 22)
    } else {
        ("veryfast", 25)
    }
}

/// ffmpeg filter normalizing display rotation, or None for a plain byte-copy.
pub fn rotation_filter(rotation: i32) -> Option<&'static str> {
    match rotation {
        90 | -270 => Some("transpose=1"),
        -90 | 270 => Some("transpose=2"),
        180 | -180 => Some("transpose=2,transpose=2"),
        _ => None,
    }
}

pub struct VideoPipeline<R> {
    runner: Arc<R>,
    config: Arc<Config>,
}

impl<R: ProcessRunner + 'static> VideoPipeline<R> {
    pub fn new(runner: Arc<R>, config: Arc<Config>) -> Self {
        Self { runner, config }
    }

    /// Run the whole pipeline for one uploaded video.
    pub async fn process(
        &self,
        input: &Path,
        album: &str,
        filename: &str,
        progress: &JobProgress,
    ) -> Result<(), StageFailure> {
        if !input.exists() {
            return Err(StageFailure::new(
                "probe",
                PipelineError::NotFound(input.to_path_buf()),
            ));
        }

        let metadata = probe_metadata(&*self.runner, &self.config.ffprobe_bin, input)
            .await
            .map_err(|err| StageFailure::new("probe", err))?;
        tracing::info!(
            album,
            filename,
            width = metadata.width,
            height = metadata.height,
            rotation = metadata.rotation,
            "probed source video"
        );

        // Resolve the rendition set before spawning anything beyond the
        // probe: an unencodable source must not pay for a rotation transcode.
        let profiles = self
            .config
            .load_profiles()
            .map_err(|err| StageFailure::new("profiles", err))?;
        let selected = select_profiles(&profiles, metadata.height);
        if selected.is_empty() {
            return Err(StageFailure::new(
                "profiles",
                PipelineError::Configuration(format!(
                    "no enabled resolution profile fits source height {}",
                    metadata.height
                )),
            ));
        }

        let job_dir = self.config.video_job_dir(album, filename);
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|err| StageFailure::new("rotation", err.into()))?;
        let normalized = job_dir.join("normalized.mp4");

        self.normalize_rotation(input, &normalized, metadata.rotation, progress)
            .await
            .map_err(|err| StageFailure::new("rotation", err))?;

        for profile in &selected {
            self.encode_rendition(&normalized, profile, &job_dir, progress)
                .await
                .map_err(|err| StageFailure::new(profile.name.clone(), err))?;
        }

        // Pure local computation, no subprocess.
        let manifest = MasterManifest::from_profiles(&selected);
        manifest
            .write_to(&job_dir.join("master.m3u8"))
            .await
            .map_err(|err| StageFailure::new("manifest", err.into()))?;

        self.extract_previews(&normalized, album, filename, progress)
            .await?;

        // The working file goes only after every consumer of it has written
        // its outputs.
        tokio::fs::remove_file(&normalized)
            .await
            .map_err(|err| StageFailure::new("cleanup", err.into()))?;

        Ok(())
    }

    async fn normalize_rotation(
        &self,
        input: &Path,
        normalized: &Path,
        rotation: i32,
        progress: &JobProgress,
    ) -> Result<(), PipelineError> {
        progress.update(JobStage::Rotation, 0, None);
        match rotation_filter(rotation) {
            Some(filter) => {
                let args: Vec<String> = vec![
                    "-y".into(),
                    "-i".into(),
                    input.to_string_lossy().into_owned(),
                    "-vf".into(),
                    filter.into(),
                    "-c:a".into(),
                    "copy".into(),
                    normalized.to_string_lossy().into_owned(),
                ];
                self.run_ffmpeg_stage(JobStage::Rotation, args, progress)
                    .await
            }
            None => {
                tokio::fs::copy(input, normalized).await?;
                progress.update(JobStage::Rotation, 100, None);
                Ok(())
            }
        }
    }

    async fn encode_rendition(
        &self,
        normalized: &Path,
        profile: &ResolutionProfile,
        job_dir: &Path,
        progress: &JobProgress,
    ) -> Result<(), PipelineError> {
        let rendition_dir = job_dir.join(&profile.name);
        tokio::fs::create_dir_all(&rendition_dir).await?;

        let stage = JobStage::Resolution(profile.name.clone());
        progress.update(stage.clone(), 0, None);

        let args = encode_args(normalized, profile, &rendition_dir);
        self.run_ffmpeg_stage(stage, args, progress).await
    }

    async fn extract_previews(
        &self,
        normalized: &Path,
        album: &str,
        filename: &str,
        progress: &JobProgress,
    ) -> Result<(), StageFailure> {
        progress.update(JobStage::Thumbnail, 0, None);
        extract_still(
            &*self.runner,
            &self.config.ffmpeg_bin,
            normalized,
            DEFAULT_STILL_TIMESTAMP,
            THUMBNAIL_WIDTH,
            &self.config.thumbnail_path(album, filename),
        )
        .await
        .map_err(|err| StageFailure::new("thumbnail", err))?;
        progress.update(JobStage::Thumbnail, 100, None);

        progress.update(JobStage::ModalPreview, 0, None);
        extract_still(
            &*self.runner,
            &self.config.ffmpeg_bin,
            normalized,
            DEFAULT_STILL_TIMESTAMP,
            MODAL_WIDTH,
            &self.config.modal_path(album, filename),
        )
        .await
        .map_err(|err| StageFailure::new("modal-preview", err))?;
        progress.update(JobStage::ModalPreview, 100, None);
        Ok(())
    }

    /// Run one ffmpeg invocation, streaming 0..=99 percent from its stderr
    /// markers and reporting exactly 100 on a clean exit.
    async fn run_ffmpeg_stage(
        &self,
        stage: JobStage,
        args: Vec<String>,
        progress: &JobProgress,
    ) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reporter = progress.clone();
        let report_stage = stage.clone();
        let consumer = tokio::spawn(async move {
            let mut parser = FfmpegProgress::new();
            let mut last = 0u8;
            while let Some(line) = rx.recv().await {
                if let OutputLine::Stderr(text) = line {
                    if let Some(percent) = parser.observe(&text) {
                        if percent > last {
                            last = percent;
                            reporter.update(report_stage.clone(), percent, None);
                        }
                    }
                }
            }
        });

        let outcome = self
            .runner
            .run(&self.config.ffmpeg_bin, &args, tx)
            .await
            .map_err(|err| PipelineError::spawn(&self.config.ffmpeg_bin, err))?;
        let _ = consumer.await;

        if !outcome.success() {
            return Err(PipelineError::exit(&self.config.ffmpeg_bin, &outcome));
        }
        progress.update(stage, 100, None);
        Ok(())
    }
}

fn encode_args(normalized: &Path, profile: &ResolutionProfile, rendition_dir: &Path) -> Vec<String> {
    let (preset, crf) = encoder_tuning(profile.height);
    vec![
        "-y".into(),
        "-i".into(),
        normalized.to_string_lossy().into_owned(),
        "-vf".into(),
        format!("scale=-2:{}", profile.height),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        preset.into(),
        "-crf".into(),
        crf.to_string(),
        "-maxrate".into(),
        format!("{}k", profile.video_kbps),
        "-bufsize".into(),
        format!("{}k", profile.video_kbps * 2),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        format!("{}k", profile.audio_kbps),
        "-hls_time".into(),
        SEGMENT_SECONDS.to_string(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_segment_filename".into(),
        rendition_dir.join("segment%03d.ts").to_string_lossy().into_owned(),
        rendition_dir.join("playlist.m3u8").to_string_lossy().into_owned(),
    ]
}
