//! Queue run tracking.
//!
//! A run starts when the queue goes from empty to non-empty and ends when it
//! drains. The tracker logs the start, a periodic overrun line while the run
//! lasts (with the head of the queue, keys redacted) and the run's total
//! duration.

use crate::wallet::sync::task::SyncTask;

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// How many queued tasks an overrun line shows
const OVERRUN_SAMPLE: usize = 3;

/// What an observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Started,
    Running,
    /// The run has lasted another threshold period
    Overrun,
    /// The queue drained after the given time
    Drained(Duration),
}

#[derive(Debug, Clone)]
pub struct QueueRunTracker {
    name: &'static str,
    threshold: Duration,
    started_at: Option<Instant>,
    last_report: Option<Instant>,
}

impl QueueRunTracker {
    pub fn new(name: &'static str, threshold: Duration) -> Self {
        Self {
            name,
            threshold,
            started_at: None,
            last_report: None,
        }
    }

    /// Record the queue state after a mutation.
    pub fn observe(&mut self, queue: &[SyncTask], now: Instant) -> RunPhase {
        match (self.started_at, queue.is_empty()) {
            (None, true) => RunPhase::Idle,
            (None, false) => {
                info!("{} started executing with {} items", self.name, queue.len());
                self.started_at = Some(now);
                self.last_report = Some(now);
                RunPhase::Started
            }
            (Some(started_at), true) => {
                let elapsed = now.saturating_duration_since(started_at);
                info!("{} finished executing in {:.1}s", self.name, elapsed.as_secs_f64());
                self.started_at = None;
                self.last_report = None;
                RunPhase::Drained(elapsed)
            }
            (Some(started_at), false) => {
                let last = self.last_report.unwrap_or(started_at);
                if now.saturating_duration_since(last) < self.threshold {
                    return RunPhase::Running;
                }

                let head = queue
                    .iter()
                    .take(OVERRUN_SAMPLE)
                    .map(|task| task.to_string())
                    .collect::<Vec<_>>();
                warn!(
                    "{} still executing after {:.0}s with {} items, next: [{}]",
                    self.name,
                    now.saturating_duration_since(started_at).as_secs_f64(),
                    queue.len(),
                    head.join("; ")
                );
                self.last_report = Some(now);
                RunPhase::Overrun
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }
}
