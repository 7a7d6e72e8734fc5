//! Retry and backoff policy.
//!
//! `RetryController::decide` maps one execution result onto one queue
//! mutation. It is pure: the queue applies the decision, logs it and owns
//! the pause windows.
//!
//! Status checks that have not settled back off exponentially
//! (`base * multiplier^n`) and are dropped once the backoff outgrows the
//! resync interval. Other failing tasks get a small retry budget.

use super::executor::{ExecutionResult, TaskProgress};
use super::task::{SyncTask, TaskDetail};
use crate::config::QueueConfig;

use std::time::Duration;

/// Why a task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
	Completed,
	RetriesExhausted,
	Permanent,
	/// A status check's backoff exceeded the resync interval
	BackoffExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueAction {
	Remove(Removal),
	/// Keep the task in the queue in its updated form
	Replace(SyncTask),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
	pub action: QueueAction,
	/// Pause the task's rate-limit domain for this long
	pub pause_for: Option<Duration>,
}

impl RetryDecision {
	fn remove(removal: Removal) -> Self {
		Self {
			action: QueueAction::Remove(removal),
			pause_for: None,
		}
	}

	fn replace(task: SyncTask) -> Self {
		Self {
			action: QueueAction::Replace(task),
			pause_for: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RetryController {
	max_retries: u32,
	backoff_base: Duration,
	backoff_multiplier: u32,
	resync_interval: Duration,
}

impl RetryController {
	pub fn new(max_retries: u32, backoff_base: Duration, backoff_multiplier: u32, resync_interval: Duration) -> Self {
		Self {
			max_retries,
			backoff_base,
			backoff_multiplier,
			resync_interval,
		}
	}

	pub fn from_config(config: &QueueConfig) -> Self {
		Self::new(
			config.max_retries,
			config.status_backoff_base(),
			config.status_backoff_multiplier,
			config.resync_interval(),
		)
	}

	pub fn max_retries(&self) -> u32 {
		self.max_retries
	}

	pub fn decide(&self, result: &ExecutionResult) -> RetryDecision {
		if matches!(result.task.detail, TaskDetail::TxnStatus(_)) {
			return self.decide_status(result);
		}

		if result.is_failed {
			if result.can_retry && result.task.retries < self.max_retries {
				let mut retried = result.task.clone();
				retried.retries += 1;
				return RetryDecision {
					action: QueueAction::Replace(retried),
					pause_for: result.delay,
				};
			}
			return RetryDecision::remove(if result.can_retry {
				Removal::RetriesExhausted
			} else {
				Removal::Permanent
			});
		}

		match &result.process_result {
			Some(TaskProgress::History(cursor)) => match result.task.with_history_cursor(cursor.clone()) {
				Some(advanced) => RetryDecision::replace(advanced),
				None => RetryDecision::remove(Removal::Completed),
			},
			None => RetryDecision::remove(Removal::Completed),
		}
	}

	/// Unsettled status checks back off whether the check failed or the
	/// transaction is simply still pending. Permanent failures drop.
	fn decide_status(&self, result: &ExecutionResult) -> RetryDecision {
		if result.is_complete && !result.is_failed {
			return RetryDecision::remove(Removal::Completed);
		}
		if result.is_failed && !result.can_retry {
			return RetryDecision::remove(Removal::Permanent);
		}

		let mut next = result.task.clone();
		let TaskDetail::TxnStatus(state) = &mut next.detail else {
			return RetryDecision::remove(Removal::Permanent);
		};

		state.backoff_factor = state.backoff_factor.saturating_mul(self.backoff_multiplier);
		state.backoff_time = self.backoff_base.saturating_mul(state.backoff_factor);
		if state.backoff_time > self.resync_interval {
			return RetryDecision::remove(Removal::BackoffExceeded);
		}

		RetryDecision {
			action: QueueAction::Replace(next),
			pause_for: result.delay,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::indexer::{HistoryCursor, IndexerError};
	use crate::wallet::sync::task::{TaskOptions, TaskTarget, XpubBranch};
	use crate::wallet::types::CoinGroup;

	fn controller() -> RetryController {
		RetryController::from_config(&QueueConfig::default())
	}

	fn balance_task() -> SyncTask {
		SyncTask::balance(
			TaskTarget::account("w1", "eth", "xpub", CoinGroup::Ethereum),
			&TaskOptions::default(),
		)
	}

	fn status_task() -> SyncTask {
		SyncTask::txn_status(
			TaskTarget::account("w1", "eth", "xpub", CoinGroup::Ethereum),
			"0xabc",
			None,
			Duration::from_secs(10),
			&TaskOptions::default(),
		)
	}

	#[test]
	fn test_success_removes() {
		let decision = controller().decide(&ExecutionResult::completed(balance_task()));
		assert_eq!(decision.action, QueueAction::Remove(Removal::Completed));
	}

	#[test]
	fn test_history_progress_replaces_without_retry() {
		let task = SyncTask::history(
			TaskTarget::account("w1", "eth", "xpub", CoinGroup::Ethereum),
			XpubBranch::Primary,
			HistoryCursor::first_page(),
			&TaskOptions::default(),
		);
		let next = HistoryCursor {
			page: 2,
			..HistoryCursor::default()
		};

		let decision = controller().decide(&ExecutionResult::progressed(task.clone(), next.clone()));
		let QueueAction::Replace(updated) = decision.action else {
			panic!("expected replace");
		};
		assert_eq!(updated.retries, 0);
		assert_eq!(updated, task.with_history_cursor(next).unwrap());
	}

	#[test]
	fn test_retry_budget_terminates() {
		let controller = controller();
		let mut task = balance_task();
		let mut attempts = 0;

		loop {
			attempts += 1;
			let result = ExecutionResult::from_error(task.clone(), &IndexerError::Unavailable("502".into()));
			match controller.decide(&result).action {
				QueueAction::Replace(next) => task = next,
				QueueAction::Remove(removal) => {
					assert_eq!(removal, Removal::RetriesExhausted);
					break;
				}
			}
		}

		assert_eq!(attempts, controller.max_retries() + 1);
	}

	#[test]
	fn test_permanent_failure_removes_immediately() {
		let result = ExecutionResult::from_error(balance_task(), &IndexerError::InvalidRequest("bad".into()));
		assert_eq!(controller().decide(&result).action, QueueAction::Remove(Removal::Permanent));
	}

	#[test]
	fn test_rate_limit_requests_pause() {
		let result = ExecutionResult::from_error(balance_task(), &IndexerError::RateLimited { delay_ms: 60_000 });
		let decision = controller().decide(&result);
		assert!(matches!(decision.action, QueueAction::Replace(ref t) if t.retries == 1));
		assert_eq!(decision.pause_for, Some(Duration::from_secs(60)));
	}

	#[test]
	fn test_status_backoff_doubles_until_dropped() {
		let controller = controller();
		let mut task = status_task();
		let mut backoffs = vec![task.status_state().unwrap().backoff_time.as_secs()];

		loop {
			match controller.decide(&ExecutionResult::pending(task.clone())).action {
				QueueAction::Replace(next) => {
					backoffs.push(next.status_state().unwrap().backoff_time.as_secs());
					task = next;
				}
				QueueAction::Remove(removal) => {
					assert_eq!(removal, Removal::BackoffExceeded);
					break;
				}
			}
		}

		// The next step (320 s) exceeds the 300 s resync interval.
		assert_eq!(backoffs, vec![10, 20, 40, 80, 160]);
		assert_eq!(task.retries, 0);
	}

	#[test]
	fn test_status_failure_backs_off_without_retry() {
		let result = ExecutionResult::from_error(status_task(), &IndexerError::Unavailable("timeout".into()));
		let QueueAction::Replace(next) = controller().decide(&result).action else {
			panic!("expected replace");
		};
		assert_eq!(next.retries, 0);
		assert_eq!(next.status_state().unwrap().backoff_time, Duration::from_secs(20));
		assert_eq!(next.status_state().unwrap().backoff_factor, 2);

		let settled = ExecutionResult::completed(status_task());
		assert_eq!(controller().decide(&settled).action, QueueAction::Remove(Removal::Completed));
	}
}
