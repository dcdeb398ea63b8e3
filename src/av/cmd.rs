//! Subprocess execution with streamed output lines.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// How many trailing stderr lines are kept for error reporting.
const STDERR_TAIL_LINES: usize = 16;

/// One line of subprocess output, tagged by the stream it came from.
/// ffmpeg reports progress on stderr; the image optimizer and ffprobe use stdout.
#[derive(Clone, Debug)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Result of a finished subprocess.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Process exit code; -1 if terminated by a signal.
    pub exit_code: i32,
    /// The last few stderr lines, joined with newlines.
    pub stderr_tail: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam for everything that spawns an external tool.
///
/// Output lines are pushed into `lines` as they arrive so callers can parse
/// progress markers live; the call resolves when the process exits. No timeout
/// is enforced: a hung subprocess blocks its caller indefinitely.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> io::Result<RunOutcome>;
}

/// Real runner backed by `tokio::process::Command`.
pub struct SubprocessRunner;

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> io::Result<RunOutcome> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_task = child.stdout.take().map(|stdout| {
            let lines = lines.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = lines.send(OutputLine::Stdout(line));
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let lines = lines.clone();
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    push_capped(&mut tail.lock().expect("stderr tail lock"), &line);
                    let _ = lines.send(OutputLine::Stderr(line));
                }
            })
        });

        let status = child.wait().await?;
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let stderr_tail = tail
            .lock()
            .expect("stderr tail lock")
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(RunOutcome {
            exit_code: status.code().unwrap_or(-1),
            stderr_tail,
        })
    }
}

fn push_capped(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

/// Collect the stdout half of a finished run's buffered lines into one string.
/// Used by callers that want the whole output (ffprobe JSON) rather than a
/// live progress feed.
pub fn collect_stdout(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> String {
    let mut out = String::new();
    while let Ok(line) = rx.try_recv() {
        if let OutputLine::Stdout(text) = line {
            out.push_str(&text);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_capped_keeps_only_the_tail() {
        let mut tail = VecDeque::new();
        for i in 0..STDERR_TAIL_LINES + 5 {
            push_capped(&mut tail, &format!("line {}", i));
        }
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.front().unwrap(), "line 5");
        assert_eq!(
            tail.back().unwrap(),
            &format!("line {}", STDERR_TAIL_LINES + 4)
        );
    }

    #[test]
    fn test_collect_stdout_ignores_stderr() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(OutputLine::Stdout("{\"streams\":".to_string()))
            .unwrap();
        tx.send(OutputLine::Stderr("warning: something".to_string()))
            .unwrap();
        tx.send(OutputLine::Stdout("[]}".to_string())).unwrap();
        drop(tx);

        let collected = collect_stdout(&mut rx);
        assert_eq!(collected, "{\"streams\":\n[]}\n");
    }

    #[tokio::test]
    async fn test_mock_runner_streams_lines() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_, _, lines| {
            let _ = lines.send(OutputLine::Stderr("time=00:00:01.00".to_string()));
            Box::pin(async move {
                Ok(RunOutcome {
                    exit_code: 0,
                    stderr_tail: String::new(),
                })
            })
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = runner
            .run("ffmpeg", &["-i".to_string()], tx)
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(matches!(rx.try_recv(), Ok(OutputLine::Stderr(_))));
    }
}
