//! Typed outcomes of queue ticks.
//!
//! Every tick of the execution queue returns a `TickReport` listing what
//! happened to each executed task. Callers (the queue's own loop, tests,
//! diagnostics) consume these values directly; there is no listener
//! registration.

use crate::wallet::sync::retry::Removal;
use crate::wallet::sync::task::{RateLimitDomain, SyncTask, TaskKind};

use std::time::Duration;

/// Something that happened to the queue during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The task finished and left the queue
    Completed { task: SyncTask },
    /// The task made partial progress and stays queued in its new form
    Advanced { task: SyncTask },
    /// The task failed and will be retried
    Retrying { task: SyncTask, error: String },
    /// A status check was rescheduled
    BackingOff { task: SyncTask, backoff: Duration },
    /// The task left the queue without finishing
    Dropped {
        task: SyncTask,
        removal: Removal,
        error: Option<String>,
    },
    /// A rate-limit window was opened
    Paused {
        domain: RateLimitDomain,
        duration: Duration,
    },
    /// A previously opened rate-limit window elapsed
    PauseExpired { domain: RateLimitDomain },
    /// A whole batch failed before producing results
    BatchFailed { kind: TaskKind, tasks: usize },
    /// Tasks produced by an executed task were added to the queue
    FollowUpsEnqueued { added: usize },
}

/// Everything one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// The tick was skipped because the connectivity gate was closed
    pub offline: bool,
    /// Number of tasks handed to the executor
    pub executed: usize,
    pub events: Vec<QueueEvent>,
    /// Queue length after the tick
    pub queue_len: usize,
}

impl TickReport {
    pub fn offline(queue_len: usize) -> Self {
        Self {
            offline: true,
            queue_len,
            ..Self::default()
        }
    }

    pub fn push(&mut self, event: QueueEvent) {
        self.events.push(event);
    }

    pub fn count(&self, predicate: impl Fn(&QueueEvent) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    /// Get a human-readable summary of the tick
    pub fn summary(&self) -> String {
        if self.offline {
            return format!("offline, {} tasks waiting", self.queue_len);
        }

        format!(
            "executed {}: {} completed, {} advanced, {} retrying, {} backing off, {} dropped; {} queued",
            self.executed,
            self.count(|e| matches!(e, QueueEvent::Completed { .. })),
            self.count(|e| matches!(e, QueueEvent::Advanced { .. })),
            self.count(|e| matches!(e, QueueEvent::Retrying { .. })),
            self.count(|e| matches!(e, QueueEvent::BackingOff { .. })),
            self.count(|e| matches!(e, QueueEvent::Dropped { .. })),
            self.queue_len,
        )
    }
}
