//! The execution queue.
//!
//! `ExecutionQueue` owns the task list, the identity index, the module
//! tracker and the rate-limit windows. It is driven by a single loop
//! (`run`) that serializes commands from producers with fixed-period ticks,
//! so the queue state has exactly one writer and ticks never overlap.
//!
//! On each connected tick the queue groups eligible tasks by kind, takes up
//! to the kind's batch size in queue order, runs every kind's batch
//! concurrently on the executor and applies the retry controller's decision
//! for each result.

use super::connectivity::ConnectivityGate;
use super::events::{QueueEvent, TickReport};
use super::executor::{BatchExecutor, ExecutionResult, fail_all};
use super::modules::ModuleTracker;
use super::progress_tracker::QueueRunTracker;
use super::retry::{QueueAction, Removal, RetryController};
use super::task::{RateLimitDomain, SyncTask, TaskKey, TaskKind};
use crate::config::QueueConfig;
use crate::wallet::types::WalletSyncError;

use futures::future::join_all;
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Interval between overrun log lines of a long queue run
const OVERRUN_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Observable queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
	/// Queue non-empty, connected and initial setup done
	pub is_syncing: bool,
	/// Queue non-empty and offline, after initial setup
	pub is_waiting_for_connection: bool,
	pub modules_present: BTreeSet<String>,
	pub queue_len: usize,
}

/// Messages from producers to the queue loop.
#[derive(Debug, Clone)]
pub enum QueueCommand {
	Enqueue(Vec<SyncTask>),
	InitialSetupDone,
}

/// Producer handle of the queue loop.
#[derive(Debug, Clone)]
pub struct QueueSender {
	tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueSender {
	pub fn enqueue(&self, tasks: Vec<SyncTask>) -> Result<(), WalletSyncError> {
		if tasks.is_empty() {
			return Ok(());
		}
		self.send(QueueCommand::Enqueue(tasks))
	}

	pub fn initial_setup_done(&self) -> Result<(), WalletSyncError> {
		self.send(QueueCommand::InitialSetupDone)
	}

	fn send(&self, command: QueueCommand) -> Result<(), WalletSyncError> {
		self.tx.send(command).map_err(|_| WalletSyncError::QueueClosed)
	}
}

pub fn command_channel() -> (QueueSender, mpsc::UnboundedReceiver<QueueCommand>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(QueueSender { tx }, rx)
}

pub struct ExecutionQueue {
	config: QueueConfig,
	tasks: Vec<SyncTask>,
	keys: HashSet<TaskKey>,
	modules: ModuleTracker,
	/// Rate-limit windows: no task of the domain runs before the deadline
	pauses: HashMap<RateLimitDomain, Instant>,
	retry: RetryController,
	executor: Arc<dyn BatchExecutor>,
	connectivity: ConnectivityGate,
	initial_setup_done: bool,
	run_tracker: QueueRunTracker,
	status_tx: watch::Sender<SyncStatus>,
}

impl ExecutionQueue {
	/// Create a queue and the receiver its status is published on.
	pub fn new(
		config: QueueConfig,
		executor: Arc<dyn BatchExecutor>,
		connectivity: ConnectivityGate,
	) -> (Self, watch::Receiver<SyncStatus>) {
		let (status_tx, status_rx) = watch::channel(SyncStatus::default());
		let queue = Self {
			retry: RetryController::from_config(&config),
			config,
			tasks: Vec::new(),
			keys: HashSet::new(),
			modules: ModuleTracker::new(),
			pauses: HashMap::new(),
			executor,
			connectivity,
			initial_setup_done: false,
			run_tracker: QueueRunTracker::new("Sync queue", OVERRUN_LOG_INTERVAL),
			status_tx,
		};
		(queue, status_rx)
	}

	/// Add a task unless an identity-equal task is already queued.
	pub fn enqueue(&mut self, task: SyncTask) -> bool {
		let key = task.key();
		if self.keys.contains(&key) {
			debug!("Skipping duplicate task {}", task);
			return false;
		}

		self.keys.insert(key);
		self.modules.add(&task.module);
		self.tasks.push(task);
		true
	}

	/// Add several tasks; returns how many were new.
	pub fn enqueue_all(&mut self, tasks: impl IntoIterator<Item = SyncTask>) -> usize {
		let added = tasks.into_iter().map(|task| self.enqueue(task)).filter(|added| *added).count();
		self.after_mutation();
		added
	}

	pub fn mark_initial_setup_done(&mut self) {
		self.initial_setup_done = true;
		self.publish_status();
	}

	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.is_empty()
	}

	pub fn tasks(&self) -> &[SyncTask] {
		&self.tasks
	}

	pub fn modules_present(&self) -> BTreeSet<String> {
		self.modules.snapshot()
	}

	pub fn status(&self) -> SyncStatus {
		let connected = self.connectivity.is_connected();
		let pending = !self.tasks.is_empty() && self.initial_setup_done;
		SyncStatus {
			is_syncing: pending && connected,
			is_waiting_for_connection: pending && !connected,
			modules_present: self.modules.snapshot(),
			queue_len: self.tasks.len(),
		}
	}

	fn publish_status(&self) {
		let status = self.status();
		self.status_tx.send_if_modified(|current| {
			if *current == status {
				return false;
			}
			*current = status;
			true
		});
	}

	fn after_mutation(&mut self) {
		self.run_tracker.observe(&self.tasks, Instant::now());
		self.publish_status();
	}

	fn is_paused(&self, kind: TaskKind, now: Instant) -> bool {
		self.pauses
			.get(&kind.rate_limit_domain())
			.is_some_and(|until| *until > now)
	}

	/// Run one tick. A no-op while offline.
	///
	/// Returns once every kind-batch has finished, so a slow remote call holds
	/// back the other kinds and queued commands until its request times out.
	pub async fn tick(&mut self) -> TickReport {
		if !self.connectivity.is_connected() {
			self.publish_status();
			return TickReport::offline(self.tasks.len());
		}

		let mut report = TickReport::default();
		let now = Instant::now();
		let tick_interval = self.config.tick_interval();

		for task in &mut self.tasks {
			task.elapse_backoff(tick_interval);
		}

		self.pauses.retain(|domain, until| {
			if *until > now {
				return true;
			}
			info!("Rate-limit pause for {:?} elapsed", domain);
			report.push(QueueEvent::PauseExpired { domain: *domain });
			false
		});

		let batches = self.select_batches(now);
		report.executed = batches.iter().map(|(_, batch)| batch.len()).sum();
		if report.executed == 0 {
			report.queue_len = self.tasks.len();
			self.after_mutation();
			return report;
		}

		let results = self.execute_batches(batches, &mut report).await;
		for result in results {
			self.apply(result, &mut report);
		}

		report.queue_len = self.tasks.len();
		self.after_mutation();
		debug!("Sync tick: {}", report.summary());
		report
	}

	/// Per kind, the first `batch_size` eligible tasks in queue order.
	fn select_batches(&self, now: Instant) -> Vec<(TaskKind, Vec<SyncTask>)> {
		let tick_interval = self.config.tick_interval();
		let mut grouped = self
			.tasks
			.iter()
			.filter(|task| task.is_eligible(tick_interval) && !self.is_paused(task.kind(), now))
			.cloned()
			.into_group_map_by(|task| task.kind());

		TaskKind::ALL
			.iter()
			.filter_map(|kind| {
				let mut batch = grouped.remove(kind)?;
				batch.truncate(self.config.batch_size(*kind));
				Some((*kind, batch))
			})
			.collect()
	}

	/// Run every batch concurrently. Each batch runs in its own task so a
	/// panicking executor fails only that batch.
	async fn execute_batches(
		&self,
		batches: Vec<(TaskKind, Vec<SyncTask>)>,
		report: &mut TickReport,
	) -> Vec<ExecutionResult> {
		let (submitted, joins): (Vec<_>, Vec<_>) = batches
			.into_iter()
			.map(|(kind, batch)| {
				let executor = self.executor.clone();
				let meta = (kind, batch.clone());
				(meta, tokio::spawn(async move { executor.execute(kind, batch).await }))
			})
			.unzip();

		let mut results = Vec::new();
		for ((kind, submitted), joined) in submitted.into_iter().zip(join_all(joins).await) {
			match joined {
				Ok(batch_results) => results.extend(Self::reconcile(kind, submitted, batch_results)),
				Err(e) => {
					error!("{} batch of {} tasks failed: {}", kind, submitted.len(), e);
					report.push(QueueEvent::BatchFailed {
						kind,
						tasks: submitted.len(),
					});
					results.extend(fail_all(submitted, &format!("batch execution failed: {}", e), true));
				}
			}
		}
		results
	}

	/// Pair each submitted task with its result; tasks the executor did not
	/// answer for get a retryable failure.
	fn reconcile(kind: TaskKind, submitted: Vec<SyncTask>, results: Vec<ExecutionResult>) -> Vec<ExecutionResult> {
		let mut by_key: HashMap<TaskKey, ExecutionResult> =
			results.into_iter().map(|result| (result.task.key(), result)).collect();

		submitted
			.into_iter()
			.map(|task| match by_key.remove(&task.key()) {
				Some(result) => result,
				None => {
					warn!("Executor returned no result for {} task {}", kind, task);
					ExecutionResult::failed(task, "no result from executor".to_string(), true)
				}
			})
			.collect()
	}

	fn apply(&mut self, result: ExecutionResult, report: &mut TickReport) {
		let decision = self.retry.decide(&result);

		if let Some(duration) = decision.pause_for {
			let domain = result.task.kind().rate_limit_domain();
			let until = Instant::now() + duration;
			let entry = self.pauses.entry(domain).or_insert(until);
			*entry = (*entry).max(until);
			info!("Pausing {:?} for {:?} after rate limiting", domain, duration);
			report.push(QueueEvent::Paused { domain, duration });
		}

		let key = result.task.key();
		match decision.action {
			QueueAction::Remove(removal) => {
				self.remove(&key);
				match removal {
					Removal::Completed => {
						debug!("Completed {}", result.task);
						report.push(QueueEvent::Completed {
							task: result.task.clone(),
						});
					}
					Removal::BackoffExceeded => {
						info!("Dropping status check {}: backoff exceeds resync interval", result.task);
						report.push(QueueEvent::Dropped {
							task: result.task.clone(),
							removal,
							error: result.error.clone(),
						});
					}
					Removal::RetriesExhausted | Removal::Permanent => {
						error!(
							"Sync failed for {} ({:?}): {}",
							result.task,
							removal,
							result.error.as_deref().unwrap_or("unknown error")
						);
						report.push(QueueEvent::Dropped {
							task: result.task.clone(),
							removal,
							error: result.error.clone(),
						});
					}
				}
			}
			QueueAction::Replace(updated) => {
				let event = if result.is_failed && updated.retries > result.task.retries {
					warn!(
						"Sync error for {}, retrying: {}",
						updated,
						result.error.as_deref().unwrap_or("unknown error")
					);
					QueueEvent::Retrying {
						task: updated.clone(),
						error: result.error.clone().unwrap_or_default(),
					}
				} else if let Some(state) = updated.status_state() {
					debug!("Status check {} backing off {:?}", updated, state.backoff_time);
					QueueEvent::BackingOff {
						task: updated.clone(),
						backoff: state.backoff_time,
					}
				} else {
					QueueEvent::Advanced { task: updated.clone() }
				};
				self.replace(&key, updated);
				report.push(event);
			}
		}

		if !result.follow_ups.is_empty() {
			let added = result
				.follow_ups
				.into_iter()
				.map(|task| self.enqueue(task))
				.filter(|added| *added)
				.count();
			info!("Enqueued {} follow-up tasks after {}", added, result.task);
			report.push(QueueEvent::FollowUpsEnqueued { added });
		}
	}

	fn remove(&mut self, key: &TaskKey) {
		let Some(index) = self.tasks.iter().position(|task| task.key() == *key) else {
			warn!("Cannot find task to remove from sync queue");
			return;
		};
		let task = self.tasks.remove(index);
		self.keys.remove(key);
		self.modules.remove(&task.module);
	}

	fn replace(&mut self, key: &TaskKey, updated: SyncTask) {
		match self.tasks.iter_mut().find(|task| task.key() == *key) {
			Some(slot) => *slot = updated,
			None => warn!("Cannot find task to update in sync queue"),
		}
	}

	fn handle(&mut self, command: QueueCommand) {
		match command {
			QueueCommand::Enqueue(tasks) => {
				let submitted = tasks.len();
				let added = self.enqueue_all(tasks);
				if added > 0 {
					debug!("Enqueued {} of {} submitted tasks", added, submitted);
				}
			}
			QueueCommand::InitialSetupDone => self.mark_initial_setup_done(),
		}
	}

	/// Drive the queue until `shutdown` flips or every producer is gone.
	pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<QueueCommand>, mut shutdown: watch::Receiver<bool>) {
		let mut interval = tokio::time::interval(self.config.tick_interval());
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut connectivity = self.connectivity.clone();
		let mut connectivity_open = true;

		info!("Sync queue started");
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				command = commands.recv() => match command {
					Some(command) => self.handle(command),
					None => break,
				},
				changed = connectivity.changed(), if connectivity_open => {
					match changed {
						Some(connected) => info!("Connectivity changed, connected: {}", connected),
						None => connectivity_open = false,
					}
					self.publish_status();
				}
				_ = interval.tick() => {
					self.tick().await;
				}
			}
		}
		info!("Sync queue stopped with {} pending tasks", self.tasks.len());
	}
}
