use std::fmt;
use std::path::PathBuf;

use crate::av::cmd::RunOutcome;

/// Errors surfaced by the processing core.
///
/// A failing stage turns one of these into a terminal `error` progress event
/// for its own job; it never takes down the coordinator or other jobs.
#[derive(Debug)]
pub enum PipelineError {
    /// No usable resolution profiles for this source (or the profile file is
    /// malformed). Fails fast, no retry.
    Configuration(String),
    /// Metadata extraction (ffprobe) failed.
    Probe(String),
    /// A subprocess exited non-zero, or could not be spawned at all.
    Subprocess { program: String, message: String },
    /// An expected input or working file is missing.
    NotFound(PathBuf),
    /// Write/rename/copy failure on the output tree.
    Io(std::io::Error),
}

impl PipelineError {
    /// Spawn failure: the binary is missing or not executable.
    pub fn spawn(program: &str, err: std::io::Error) -> Self {
        PipelineError::Subprocess {
            program: program.to_string(),
            message: format!("failed to start: {}", err),
        }
    }

    /// Non-zero exit, carrying the captured stderr tail.
    pub fn exit(program: &str, outcome: &RunOutcome) -> Self {
        PipelineError::Subprocess {
            program: program.to_string(),
            message: format!(
                "exited with code {}: {}",
                outcome.exit_code,
                outcome.stderr_tail.trim()
            ),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            PipelineError::Probe(msg) => write!(f, "probe error: {}", msg),
            PipelineError::Subprocess { program, message } => {
                write!(f, "{}: {}", program, message)
            }
            PipelineError::NotFound(path) => write!(f, "file not found: {}", path.display()),
            PipelineError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

/// A pipeline abort, naming the stage that failed.
///
/// Artifacts written by stages that completed before the failure are left in
/// place; re-running the job overwrites them.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: String,
    pub error: PipelineError,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, error: PipelineError) -> Self {
        Self {
            stage: stage.into(),
            error,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
