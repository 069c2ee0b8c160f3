//! Throughput and completion tracking for a pass.
use crate::chunk::Chunk;
use crate::error::Result;
use crate::event::PassKind;
use crate::transform::Transform;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default minimum time between two progress notifications.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// A snapshot of a pass's progress.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressState {
    pub kind: PassKind,
    /// Clamped to `0..=100`; estimated lengths can be exceeded.
    pub percentage: u8,
    pub transferred: u64,
    pub length: u64,
    /// Bytes per second, averaged since the pass started.
    pub speed: f64,
    pub eta: Option<Duration>,
}

/// Renders the short status text shown next to a progress bar.
pub fn status_line(state: &ProgressState) -> String {
    if state.percentage == 0 && state.speed == 0.0 {
        "Starting...".to_string()
    } else if state.percentage == 100 {
        "Finishing...".to_string()
    } else {
        match state.kind {
            PassKind::Write => format!("{}% Flashing", state.percentage),
            PassKind::Verify => format!("{}% Validating", state.percentage),
        }
    }
}

type ProgressCallback = Box<dyn FnMut(ProgressState) + Send>;

/// A pass-through stage that counts bytes and reports progress.
pub struct Progress {
    kind: PassKind,
    length: u64,
    interval: Duration,
    transferred: u64,
    started: Instant,
    last_report: Instant,
    on_progress: Option<ProgressCallback>,
}

impl Progress {
    pub fn new(kind: PassKind, length: u64) -> Self {
        let now = Instant::now();
        Self {
            kind,
            length,
            interval: DEFAULT_PROGRESS_INTERVAL,
            transferred: 0,
            started: now,
            last_report: now,
            on_progress: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(ProgressState) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn state(&self) -> ProgressState {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.transferred as f64 / elapsed
        } else {
            0.0
        };

        let percentage = if self.length == 0 {
            100
        } else {
            (self.transferred.saturating_mul(100) / self.length).min(100) as u8
        };

        let remaining = self.length.saturating_sub(self.transferred);
        let eta = (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed));

        ProgressState {
            kind: self.kind,
            percentage,
            transferred: self.transferred,
            length: self.length,
            speed,
            eta,
        }
    }

    fn report(&mut self) {
        self.last_report = Instant::now();
        let state = self.state();
        trace!(kind = %state.kind, transferred = state.transferred, "progress");
        if let Some(callback) = self.on_progress.as_mut() {
            callback(state);
        }
    }
}

impl Transform for Progress {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        self.transferred += chunk.len() as u64;
        out.push(chunk);
        if self.last_report.elapsed() >= self.interval {
            self.report();
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<Chunk>) -> Result<()> {
        self.report();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn state(kind: PassKind, percentage: u8, speed: f64) -> ProgressState {
        ProgressState {
            kind,
            percentage,
            transferred: 0,
            length: 0,
            speed,
            eta: None,
        }
    }

    #[test]
    fn test_status_line() {
        assert_eq!(status_line(&state(PassKind::Write, 0, 0.0)), "Starting...");
        assert_eq!(status_line(&state(PassKind::Write, 0, 10.0)), "0% Flashing");
        assert_eq!(status_line(&state(PassKind::Write, 55, 2049.0)), "55% Flashing");
        assert_eq!(status_line(&state(PassKind::Verify, 42, 1.0)), "42% Validating");
        assert_eq!(status_line(&state(PassKind::Verify, 100, 1.0)), "Finishing...");
    }

    #[test]
    fn test_reports_final_state_once_at_end() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut progress = Progress::new(PassKind::Write, 2048)
            .with_interval(Duration::from_secs(3600))
            .on_progress(move |state| sink.lock().unwrap().push(state));

        let mut out = Vec::new();
        progress.push(Chunk::new(vec![0u8; 1024]), &mut out).unwrap();
        progress.push(Chunk::new(vec![0u8; 1024]), &mut out).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(out.len(), 2);

        progress.finish(&mut out).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].percentage, 100);
        assert_eq!(seen[0].transferred, 2048);
        assert_eq!(seen[0].kind, PassKind::Write);
    }

    #[test]
    fn test_zero_interval_reports_every_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut progress = Progress::new(PassKind::Verify, 4096)
            .with_interval(Duration::ZERO)
            .on_progress(move |state| sink.lock().unwrap().push(state.percentage));

        let mut out = Vec::new();
        progress.push(Chunk::new(vec![0u8; 1024]), &mut out).unwrap();
        progress.push(Chunk::new(vec![0u8; 1024]), &mut out).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![25, 50]);
    }

    #[test]
    fn test_percentage_is_clamped_for_estimates() {
        let mut progress = Progress::new(PassKind::Write, 1000);
        let mut out = Vec::new();
        progress.push(Chunk::new(vec![0u8; 4000]), &mut out).unwrap();

        let state = progress.state();
        assert_eq!(state.percentage, 100);
        assert_eq!(state.transferred, 4000);
    }
}
