//! Render progress reporting.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One progress observation for a job.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    /// Fraction complete in `[0.0, 1.0]`.
    pub fraction: f32,
    /// Last frame reported by the renderer, if it reports frames.
    pub frame: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Handle given to a backend render to publish progress.
///
/// Sending never blocks: if the consumer falls behind, updates are dropped
/// and the next one supersedes them.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    total_frames: u32,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, total_frames: u32, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            job_id: job_id.into(),
            total_frames,
            tx,
        }
    }

    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(job_id, 0, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report a fraction in `[0.0, 1.0]`; out-of-range values are clamped.
    pub fn report(&self, fraction: f32) {
        self.send(fraction, None);
    }

    /// Report the number of frames rendered so far.
    pub fn report_frame(&self, frame: u32) {
        if self.total_frames == 0 {
            return;
        }
        let fraction = frame as f32 / self.total_frames as f32;
        self.send(fraction, Some(frame));
    }

    fn send(&self, fraction: f32, frame: Option<u32>) {
        if !fraction.is_finite() {
            return;
        }
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id.clone(),
            fraction: fraction.clamp(0.0, 1.0),
            frame,
            updated_at: Utc::now(),
        });
    }
}

/// Parse one line of renderer stdout into a progress fraction.
///
/// Understands `frame=N` (relative to `total_frames`), `percent=P` and
/// `progress=end`. Anything else is ignored.
pub fn parse_progress_line(line: &str, total_frames: u32) -> Option<f32> {
    let (name, value) = line.trim().split_once('=')?;
    let value = value.trim();

    match name.trim() {
        "frame" if total_frames > 0 => value
            .parse::<u32>()
            .ok()
            .map(|frame| (frame as f32 / total_frames as f32).clamp(0.0, 1.0)),
        "percent" => value
            .parse::<f32>()
            .ok()
            .filter(|p| p.is_finite())
            .map(|p| (p / 100.0).clamp(0.0, 1.0)),
        "progress" if value == "end" => Some(1.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_progress_lines() {
        assert_eq!(parse_progress_line("frame=75", 150), Some(0.5));
        assert_eq!(parse_progress_line("percent=25", 150), Some(0.25));
        assert_eq!(parse_progress_line(" progress=end ", 150), Some(1.0));
        assert_eq!(parse_progress_line("frame=300", 150), Some(1.0));
    }

    #[test]
    fn ignores_other_output() {
        assert_eq!(parse_progress_line("Bundling...", 150), None);
        assert_eq!(parse_progress_line("frame=abc", 150), None);
        assert_eq!(parse_progress_line("frame=10", 0), None);
        assert_eq!(parse_progress_line("progress=continue", 150), None);
    }

    #[tokio::test]
    async fn reporter_clamps_and_tags_updates() {
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = ProgressReporter::new("job-1", 100, tx);

        reporter.report(1.5);
        reporter.report_frame(25);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id, "job-1");
        assert_eq!(first.fraction, 1.0);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.fraction, 0.25);
        assert_eq!(second.frame, Some(25));
    }
}
