//! Parsing of textual progress markers from external tools.
//!
//! The underlying tools report progress as free-form text; keeping the parsing
//! here means a format change in a tool touches one place only.

use regex::Regex;

/// Incremental parser for ffmpeg's stderr progress markers.
///
/// ffmpeg prints the input duration once (`Duration: 00:01:30.05, ...`) and
/// then repeated `time=00:00:12.34` markers while encoding. Percent is
/// clamped to 0..=99; the caller reports 100 itself once the process exits
/// successfully.
pub struct FfmpegProgress {
    total_seconds: Option<f64>,
    duration_re: Regex,
    time_re: Regex,
}

impl FfmpegProgress {
    pub fn new() -> Self {
        Self {
            total_seconds: None,
            duration_re: Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")
                .expect("duration regex"),
            time_re: Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("time regex"),
        }
    }

    /// Feed one output line; returns a percent when the line advances progress.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        if self.total_seconds.is_none() {
            if let Some(total) = capture_seconds(&self.duration_re, line) {
                if total > 0.0 {
                    self.total_seconds = Some(total);
                }
                return None;
            }
        }

        let total = self.total_seconds?;
        let current = capture_seconds(&self.time_re, line)?;
        let percent = (current / total * 100.0).clamp(0.0, 99.0);
        Some(percent as u8)
    }
}

impl Default for FfmpegProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn capture_seconds(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse one image-optimizer progress line of the fixed shape
/// `PROGRESS:<percent>:<message>`. The message is forwarded unmodified.
pub fn parse_optimizer_line(line: &str) -> Option<(u8, String)> {
    let rest = line.strip_prefix("PROGRESS:")?;
    let (percent, message) = rest.split_once(':')?;
    let percent: u32 = percent.trim().parse().ok()?;
    Some((percent.min(100) as u8, message.to_string()))
}
