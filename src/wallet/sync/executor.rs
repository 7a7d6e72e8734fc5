//! Batch execution of sync tasks.
//!
//! A `BatchExecutor` receives a batch of same-kind tasks and returns exactly
//! one `ExecutionResult` per task, in input order. It never fails as a whole:
//! remote and local errors are folded into the per-task results so the queue
//! can apply its retry policy.

use super::repositories::{BalanceKey, WalletStore};
use super::seeding::{TaskFactory, branch_label};
use super::task::{HistoryState, StatusState, SyncTask, TaskDetail, TaskKind};
use crate::indexer::{
	BalanceReport, ChainAccount, ChainReader, ChainTxnStatus, HistoryCursor, IndexerError, PriceReader, PriceTarget,
	RemoteTransaction,
};
use crate::wallet::types::{CoinGroup, PriceHistory, Transaction, TxnStatus};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Progress a task made without finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProgress {
	/// More history pages remain, starting at this cursor
	History(HistoryCursor),
}

/// Outcome of one task execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
	pub task: SyncTask,
	pub is_failed: bool,
	/// False for permanent errors
	pub can_retry: bool,
	/// Present iff `is_failed`
	pub error: Option<String>,
	/// Status checks: the chain reported a terminal state
	pub is_complete: bool,
	pub process_result: Option<TaskProgress>,
	/// Pause requested by a rate-limited upstream
	pub delay: Option<Duration>,
	/// Tasks to enqueue as a consequence of this one
	pub follow_ups: Vec<SyncTask>,
}

impl ExecutionResult {
	fn success(task: SyncTask, is_complete: bool) -> Self {
		Self {
			task,
			is_failed: false,
			can_retry: false,
			error: None,
			is_complete,
			process_result: None,
			delay: None,
			follow_ups: Vec::new(),
		}
	}

	/// The task finished.
	pub fn completed(task: SyncTask) -> Self {
		Self::success(task, true)
	}

	/// A status check whose transaction is still pending.
	pub fn pending(task: SyncTask) -> Self {
		Self::success(task, false)
	}

	/// A history task with more pages to fetch.
	pub fn progressed(task: SyncTask, cursor: HistoryCursor) -> Self {
		Self {
			process_result: Some(TaskProgress::History(cursor)),
			..Self::success(task, false)
		}
	}

	/// Failure classified from a remote error.
	pub fn from_error(task: SyncTask, error: &IndexerError) -> Self {
		Self {
			delay: error.rate_limit_delay(),
			..Self::failed(task, error.to_string(), error.is_retryable())
		}
	}

	pub fn failed(task: SyncTask, error: String, can_retry: bool) -> Self {
		Self {
			task,
			is_failed: true,
			can_retry,
			error: Some(error),
			is_complete: false,
			process_result: None,
			delay: None,
			follow_ups: Vec::new(),
		}
	}

	pub fn with_follow_ups(mut self, follow_ups: Vec<SyncTask>) -> Self {
		self.follow_ups = follow_ups;
		self
	}
}

/// Expand a batch-wide failure into one result per task.
pub fn fail_all(tasks: Vec<SyncTask>, error: &str, can_retry: bool) -> Vec<ExecutionResult> {
	tasks
		.into_iter()
		.map(|task| ExecutionResult::failed(task, error.to_string(), can_retry))
		.collect()
}

/// Executes batches of same-kind tasks.
#[async_trait::async_trait]
pub trait BatchExecutor: Send + Sync {
	/// Run `tasks` (all of kind `kind`) and return one result per task, in
	/// input order.
	async fn execute(&self, kind: TaskKind, tasks: Vec<SyncTask>) -> Vec<ExecutionResult>;
}

/// Executor backed by chain readers, the price reader and the wallet store.
pub struct ChainBatchExecutor {
	readers: HashMap<CoinGroup, Arc<dyn ChainReader>>,
	price_reader: Arc<dyn PriceReader>,
	store: Arc<dyn WalletStore>,
	factory: Arc<TaskFactory>,
	/// Bound on in-flight calls within a batch
	concurrency: usize,
}

impl ChainBatchExecutor {
	/// Create an executor.
	///
	/// # Arguments
	/// * `readers` - Chain reader per family, keyed by `CoinGroup::reader_group()`.
	/// * `price_reader` - Price API reader.
	/// * `store` - Destination of every fetched result.
	/// * `factory` - Derives the follow-up tasks of settled status checks.
	/// * `concurrency` - Bound on concurrent calls within one batch.
	pub fn new(
		readers: HashMap<CoinGroup, Arc<dyn ChainReader>>,
		price_reader: Arc<dyn PriceReader>,
		store: Arc<dyn WalletStore>,
		factory: Arc<TaskFactory>,
		concurrency: usize,
	) -> Self {
		Self {
			readers,
			price_reader,
			store,
			factory,
			concurrency: concurrency.max(1),
		}
	}

	fn reader_for(&self, task: &SyncTask) -> Result<&Arc<dyn ChainReader>, IndexerError> {
		let group = task.target.coin_group.reader_group();
		self.readers
			.get(&group)
			.ok_or_else(|| IndexerError::Unsupported(format!("no reader for {}", group)))
	}

	fn account_for(task: &SyncTask) -> Result<ChainAccount, IndexerError> {
		task.chain_account()
			.ok_or_else(|| IndexerError::InvalidRequest(format!("{} has no account", task)))
	}

	async fn execute_one(&self, task: SyncTask) -> ExecutionResult {
		let outcome = match &task.detail {
			TaskDetail::Balance => self.sync_balance(&task).await,
			TaskDetail::History(state) => self.sync_history(&task, state).await,
			TaskDetail::Price { interval, .. } => self.sync_price(&task, interval.days()).await,
			TaskDetail::CustomAccount => self.sync_custom_accounts(&task).await,
			TaskDetail::TxnStatus(state) => self.check_status(&task, state).await,
			TaskDetail::LatestPrice { .. } => Err(StepError::Remote(IndexerError::Unsupported(
				"latest prices are only fetched in bulk".to_string(),
			))),
		};

		match outcome {
			Ok(step) => self.finish(task, step).await,
			Err(StepError::Remote(e)) => {
				debug!("Remote read failed for {}: {}", task, e);
				ExecutionResult::from_error(task, &e)
			}
			Err(StepError::Store(e)) => {
				warn!("Failed to persist result of {}: {}", task, e);
				ExecutionResult::failed(task, e, true)
			}
		}
	}

	async fn finish(&self, task: SyncTask, step: Step) -> ExecutionResult {
		match step {
			Step::Done => ExecutionResult::completed(task),
			Step::More(cursor) => ExecutionResult::progressed(task, cursor),
			Step::Pending => ExecutionResult::pending(task),
			Step::Settled => {
				let follow_ups = match self.factory.status_follow_ups(&task).await {
					Ok(follow_ups) => follow_ups,
					Err(e) => {
						error!("Failed to derive follow-up tasks for {}: {}", task, e);
						Vec::new()
					}
				};
				ExecutionResult::completed(task).with_follow_ups(follow_ups)
			}
		}
	}

	async fn sync_balance(&self, task: &SyncTask) -> Result<Step, StepError> {
		let reader = self.reader_for(task)?;
		let account = Self::account_for(task)?;
		let balance = reader.fetch_balance(&account).await?;
		self.store
			.upsert_balance(balance_key(task, &account), balance)
			.await
			.map_err(|e| StepError::Store(e.to_string()))?;
		Ok(Step::Done)
	}

	async fn sync_history(&self, task: &SyncTask, state: &HistoryState) -> Result<Step, StepError> {
		let reader = self.reader_for(task)?;
		let account = Self::account_for(task)?;
		let page = reader.fetch_history_page(&account, &state.cursor).await?;

		let branch = match task.target.coin_group {
			CoinGroup::BitcoinForks => Some(branch_label(state.branch).to_string()),
			_ => None,
		};
		let transactions = page
			.transactions
			.iter()
			.map(|remote| wallet_transaction(task, branch.clone(), remote))
			.collect::<Vec<_>>();
		let fetched = transactions.len();

		self.store
			.insert_transactions(transactions)
			.await
			.map_err(|e| StepError::Store(e.to_string()))?;

		if let Some(balance) = page.balance {
			let report = BalanceReport {
				balance,
				unconfirmed_balance: None,
			};
			self.store
				.upsert_balance(balance_key(task, &account), report)
				.await
				.map_err(|e| StepError::Store(e.to_string()))?;
		}

		debug!("{}: stored {} transactions for {}", reader.name(), fetched, task);
		Ok(match page.next_cursor {
			Some(cursor) => Step::More(cursor),
			None => Step::Done,
		})
	}

	async fn sync_price(&self, task: &SyncTask, days: u16) -> Result<Step, StepError> {
		let target = task.price_target();
		let data = self.price_reader.fetch_price_history(&target, days).await?;
		self.store
			.upsert_price_history(PriceHistory {
				slug: target.slug,
				interval_days: days,
				data,
			})
			.await
			.map_err(|e| StepError::Store(e.to_string()))?;
		Ok(Step::Done)
	}

	async fn sync_custom_accounts(&self, task: &SyncTask) -> Result<Step, StepError> {
		let reader = self.reader_for(task)?;
		let account = Self::account_for(task)?;
		let names = reader.fetch_custom_accounts(&account).await?;
		self.store
			.upsert_custom_accounts(&account.wallet_id, &account.coin, names)
			.await
			.map_err(|e| StepError::Store(e.to_string()))?;
		Ok(Step::Done)
	}

	async fn check_status(&self, task: &SyncTask, state: &StatusState) -> Result<Step, StepError> {
		let reader = self.reader_for(task)?;
		let account = Self::account_for(task)?;
		let report = reader
			.fetch_txn_status(&account, &state.txn_hash, state.sender.as_deref())
			.await?;

		if !report.is_terminal() {
			return Ok(Step::Pending);
		}

		self.store
			.update_txn_status(&account.wallet_id, &state.txn_hash, &report)
			.await
			.map_err(|e| StepError::Store(e.to_string()))?;
		Ok(Step::Settled)
	}

	/// Latest prices are fetched with one request for the whole batch.
	async fn sync_latest_prices(&self, tasks: Vec<SyncTask>) -> Vec<ExecutionResult> {
		let targets: Vec<PriceTarget> = tasks.iter().map(SyncTask::price_target).collect();
		let prices = match self.price_reader.fetch_latest_prices(&targets).await {
			Ok(prices) => prices,
			Err(e) => {
				warn!("Latest price request for {} coins failed: {}", tasks.len(), e);
				return tasks
					.into_iter()
					.map(|task| ExecutionResult::from_error(task, &e))
					.collect();
			}
		};

		let mut results = Vec::with_capacity(tasks.len());
		for (task, target) in tasks.into_iter().zip(targets) {
			let Some(price) = prices.get(target.api_id()) else {
				results.push(ExecutionResult::from_error(task, &IndexerError::NoData));
				continue;
			};
			let stored = self
				.store
				.upsert_latest_price(&target.slug, target.parent_coin.as_deref(), *price)
				.await;
			results.push(match stored {
				Ok(()) => ExecutionResult::completed(task),
				Err(e) => ExecutionResult::failed(task, e.to_string(), true),
			});
		}
		results
	}
}

#[async_trait::async_trait]
impl BatchExecutor for ChainBatchExecutor {
	async fn execute(&self, kind: TaskKind, tasks: Vec<SyncTask>) -> Vec<ExecutionResult> {
		if kind == TaskKind::LatestPrice {
			return self.sync_latest_prices(tasks).await;
		}

		stream::iter(tasks)
			.map(|task| self.execute_one(task))
			.buffered(self.concurrency)
			.collect()
			.await
	}
}

/// Successful outcome of one remote step.
enum Step {
	Done,
	More(HistoryCursor),
	Pending,
	Settled,
}

enum StepError {
	Remote(IndexerError),
	Store(String),
}

impl From<IndexerError> for StepError {
	fn from(e: IndexerError) -> Self {
		StepError::Remote(e)
	}
}

fn balance_key(task: &SyncTask, account: &ChainAccount) -> BalanceKey {
	BalanceKey {
		wallet_id: account.wallet_id.clone(),
		slug: task.target.coin_type.clone(),
		parent_coin: task.target.parent_coin.clone(),
		custom_account: task.target.custom_account.clone(),
	}
}

fn wallet_transaction(task: &SyncTask, wallet_branch: Option<String>, remote: &RemoteTransaction) -> Transaction {
	let timestamp = remote.timestamp.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
	let status = match remote.status {
		ChainTxnStatus::Pending => TxnStatus::Pending,
		ChainTxnStatus::Success => TxnStatus::Success,
		ChainTxnStatus::Failed => TxnStatus::Failed,
	};

	Transaction {
		hash: remote.hash.clone(),
		wallet_id: task.target.wallet_id.clone().unwrap_or_default(),
		slug: task.target.coin_type.clone(),
		coin: task.target.parent_coin.clone(),
		custom_account: task.target.custom_account.clone(),
		wallet_branch,
		status,
		block_height: remote.block_height,
		confirmations: remote.confirmations,
		is_token_transfer: remote.is_token_transfer,
		sender: remote.sender.clone(),
		amount: remote.amount.clone(),
		confirmed_at: if remote.status.is_terminal() { timestamp } else { None },
		created_at: timestamp.unwrap_or_else(Utc::now),
	}
}
