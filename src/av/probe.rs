//! Source metadata extraction via ffprobe.

use std::path::Path;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::av::cmd::{collect_stdout, ProcessRunner};
use crate::error::PipelineError;

/// Probed facts about a source video. Derived once per job, immutable after.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    /// Duration in seconds.
    pub duration: f64,
    /// Display rotation in degrees: 0, ±90, 180, 270.
    pub rotation: i32,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Deserialize)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    // ffprobe reports duration as a string in JSON output
    duration: Option<String>,
}

/// Run ffprobe against `input` and parse its JSON output.
/// Any failure here (spawn, exit, parse) is a ProbeError.
pub async fn probe_metadata<R: ProcessRunner>(
    runner: &R,
    ffprobe_bin: &str,
    input: &Path,
) -> Result<VideoMetadata, PipelineError> {
    let args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "v:0".into(),
        "-show_entries".into(),
        "stream=width,height:stream_side_data=rotation:format=duration".into(),
        "-of".into(),
        "json".into(),
        input.to_string_lossy().into_owned(),
    ];

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = runner
        .run(ffprobe_bin, &args, tx)
        .await
        .map_err(|err| PipelineError::Probe(format!("failed to run {}: {}", ffprobe_bin, err)))?;

    if !outcome.success() {
        return Err(PipelineError::Probe(format!(
            "{} exited with code {}: {}",
            ffprobe_bin,
            outcome.exit_code,
            outcome.stderr_tail.trim()
        )));
    }

    let stdout = collect_stdout(&mut rx);
    parse_probe_output(&stdout)
}

fn parse_probe_output(json: &str) -> Result<VideoMetadata, PipelineError> {
    let parsed: FfprobeOutput = serde_json::from_str(json)
        .map_err(|err| PipelineError::Probe(format!("unparseable ffprobe output: {}", err)))?;

    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| PipelineError::Probe("no video stream found".to_string()))?;

    let width = stream
        .width
        .ok_or_else(|| PipelineError::Probe("stream has no width".to_string()))?;
    let height = stream
        .height
        .ok_or_else(|| PipelineError::Probe("stream has no height".to_string()))?;

    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| PipelineError::Probe("missing or invalid duration".to_string()))?;

    let rotation = stream
        .side_data_list
        .iter()
        .find_map(|sd| sd.rotation)
        .unwrap_or(0.0) as i32;

    Ok(VideoMetadata {
        width,
        height,
        duration,
        rotation,
    })
}
