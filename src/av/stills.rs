//! Preview still extraction.

use std::path::Path;

use tokio::sync::mpsc;

use crate::av::cmd::ProcessRunner;
use crate::config::Config;
use crate::error::PipelineError;

/// Where stills are taken from when no timestamp was chosen by an admin.
pub const DEFAULT_STILL_TIMESTAMP: f64 = 1.0;

pub const THUMBNAIL_WIDTH: u32 = 320;
pub const MODAL_WIDTH: u32 = 1280;

/// Extract a single frame at `timestamp`, scaled to `width`, as a JPEG.
pub async fn extract_still<R: ProcessRunner>(
    runner: &R,
    ffmpeg_bin: &str,
    source: &Path,
    timestamp: f64,
    width: u32,
    output: &Path,
) -> Result<(), PipelineError> {
    if !source.exists() {
        return Err(PipelineError::NotFound(source.to_path_buf()));
    }
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let args: Vec<String> = vec![
        "-y".into(),
        "-ss".into(),
        format!("{}", timestamp),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-vframes".into(),
        "1".into(),
        "-vf".into(),
        format!("scale={}:-2", width),
        output.to_string_lossy().into_owned(),
    ];

    // Single-frame extraction is near-instant; no progress feed needed.
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = runner
        .run(ffmpeg_bin, &args, tx)
        .await
        .map_err(|err| PipelineError::spawn(ffmpeg_bin, err))?;

    if !outcome.success() {
        return Err(PipelineError::exit(ffmpeg_bin, &outcome));
    }
    Ok(())
}

/// Extract both preview stills (thumbnail and modal) for a video at the given
/// timestamp. Also invoked standalone when an admin picks a new frame.
pub async fn extract_stills<R: ProcessRunner>(
    runner: &R,
    config: &Config,
    source: &Path,
    album: &str,
    filename: &str,
    timestamp: f64,
) -> Result<(), PipelineError> {
    extract_still(
        runner,
        &config.ffmpeg_bin,
        source,
        timestamp,
        THUMBNAIL_WIDTH,
        &config.thumbnail_path(album, filename),
    )
    .await?;
    extract_still(
        runner,
        &config.ffmpeg_bin,
        source,
        timestamp,
        MODAL_WIDTH,
        &config.modal_path(album, filename),
    )
    .await
}
