//! Refresh scheduler.
//!
//! Seeds the execution queue from campaigns:
//! - startup: initial resync, expiry of stale pending transactions and the
//!   pending-transaction status bootstrap, then the initial-setup signal
//! - manual resync on request (also refreshes notifications)
//! - auto resync once no resync module has been queued for a quiet period
//! - hourly price history refresh with notification and expiry housekeeping
//! - latest prices and custom accounts every 15 minutes
//!
//! Campaigns only enqueue; identity deduplication in the queue makes
//! overlapping campaigns harmless.

use super::connectivity::ConnectivityGate;
use super::modules::{self, is_resync_executing};
use super::notifications::NotificationService;
use super::queue::{QueueSender, SyncStatus};
use super::repositories::WalletStore;
use super::seeding::TaskFactory;
use super::task::{SyncTask, TaskOptions};
use crate::config::RefreshConfig;
use crate::wallet::types::WalletSyncError;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Requests to the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCommand {
	ManualResync,
}

/// Edge-triggered quiet-period timer.
///
/// The timer arms when the queue goes from "a resync module is present" to
/// "none present" and is cancelled when one reappears before it fires.
/// Firing counts as a resync edge, so an idle queue gets a new auto resync
/// every quiet period.
#[derive(Debug, Clone)]
pub struct IdleDebounce {
	quiet_period: Duration,
	was_executing: bool,
	armed_at: Option<Instant>,
}

impl IdleDebounce {
	/// Starts as if a resync were executing, so the first quiet observation
	/// arms the timer.
	pub fn new(quiet_period: Duration) -> Self {
		Self {
			quiet_period,
			was_executing: true,
			armed_at: None,
		}
	}

	pub fn observe(&mut self, executing: bool, now: Instant) {
		if executing {
			if self.armed_at.take().is_some() {
				debug!("Resync running again, auto resync cancelled");
			}
		} else if self.was_executing {
			debug!("No resync running, auto resync armed for {:?}", self.quiet_period);
			self.armed_at = Some(now);
		}
		self.was_executing = executing;
	}

	pub fn deadline(&self) -> Option<Instant> {
		self.armed_at.map(|armed_at| armed_at + self.quiet_period)
	}

	pub fn is_armed(&self) -> bool {
		self.armed_at.is_some()
	}

	/// Returns true once when the armed timer has elapsed.
	pub fn poll(&mut self, now: Instant) -> bool {
		match self.deadline() {
			Some(deadline) if now >= deadline => {
				self.armed_at = None;
				self.was_executing = true;
				true
			}
			_ => false,
		}
	}
}

pub struct RefreshScheduler {
	config: RefreshConfig,
	factory: Arc<TaskFactory>,
	store: Arc<dyn WalletStore>,
	notifications: Arc<dyn NotificationService>,
	queue: QueueSender,
	connectivity: ConnectivityGate,
	debounce: IdleDebounce,
}

impl RefreshScheduler {
	pub fn new(
		config: RefreshConfig,
		factory: Arc<TaskFactory>,
		store: Arc<dyn WalletStore>,
		notifications: Arc<dyn NotificationService>,
		queue: QueueSender,
		connectivity: ConnectivityGate,
	) -> Self {
		Self {
			debounce: IdleDebounce::new(config.auto_resync_quiet_period()),
			config,
			factory,
			store,
			notifications,
			queue,
			connectivity,
		}
	}

	fn submit(&self, campaign: &str, tasks: Vec<SyncTask>) -> Result<usize, WalletSyncError> {
		let count = tasks.len();
		info!("{}: enqueueing {} tasks", campaign, count);
		self.queue.enqueue(tasks)?;
		Ok(count)
	}

	/// Startup seeding. Always ends by signalling that initial setup is done.
	pub async fn startup(&self) -> Result<(), WalletSyncError> {
		if self.config.seed_on_startup {
			self.expire_pending().await;

			let options = TaskOptions::new(modules::INITIAL_RESYNC, true);
			match self.factory.resync_tasks(&options).await {
				Ok(tasks) => {
					self.submit("Initial resync", tasks)?;
				}
				Err(e) => error!("Failed to seed initial resync: {}", e),
			}

			match self.factory.pending_status_tasks().await {
				Ok(tasks) => {
					self.submit("Pending transaction checks", tasks)?;
				}
				Err(e) => error!("Failed to load pending transactions: {}", e),
			}
		} else {
			info!("Startup seeding disabled");
		}

		self.queue.initial_setup_done()
	}

	/// Full resync of every account, forced.
	pub async fn manual_resync(&self) -> Result<usize, WalletSyncError> {
		self.refresh_notifications().await;
		let tasks = self
			.factory
			.resync_tasks(&TaskOptions::new(modules::MANUAL_RESYNC, false))
			.await?;
		self.submit("Manual resync", tasks)
	}

	/// Balances and history of every account.
	pub async fn auto_resync(&self) -> Result<usize, WalletSyncError> {
		let options = TaskOptions::new(modules::AUTO_RESYNC, true);
		let mut tasks = self.factory.balance_refresh_tasks(&options).await?;
		tasks.extend(self.factory.history_refresh_tasks(&options).await?);
		self.submit("Auto resync", tasks)
	}

	/// Hourly: price history plus notification and expiry housekeeping.
	pub async fn refresh_prices(&self) -> Result<usize, WalletSyncError> {
		if self.connectivity.is_connected() {
			self.refresh_notifications().await;
		}
		self.expire_pending().await;

		let tasks = self
			.factory
			.price_refresh_tasks(&TaskOptions::new(modules::PRICE_RESYNC, true))
			.await?;
		self.submit("Price refresh", tasks)
	}

	/// Latest prices and custom accounts.
	pub async fn refresh_latest(&self) -> Result<usize, WalletSyncError> {
		let mut tasks = self
			.factory
			.latest_price_refresh_tasks(&TaskOptions::new(modules::LATEST_PRICE_RESYNC, true))
			.await?;
		tasks.extend(
			self.factory
				.custom_account_refresh_tasks(&TaskOptions::new(modules::LATEST_PRICE_RESYNC, true))
				.await?,
		);
		self.submit("Latest price refresh", tasks)
	}

	async fn refresh_notifications(&self) {
		if let Err(e) = self.notifications.refresh().await {
			warn!("Notification refresh failed: {}", e);
		}
	}

	async fn expire_pending(&self) {
		let cutoff = chrono::Duration::from_std(self.config.pending_txn_expiry())
			.ok()
			.and_then(|age| Utc::now().checked_sub_signed(age));
		let Some(cutoff) = cutoff else {
			warn!("Pending transaction expiry out of range, skipping");
			return;
		};

		match self.store.fail_expired_transactions(cutoff).await {
			Ok(0) => {}
			Ok(count) => debug!("Expired {} pending transactions", count),
			Err(e) => error!("Failed to expire pending transactions: {}", e),
		}
	}

	fn log_outcome(campaign: &str, outcome: Result<usize, WalletSyncError>) {
		if let Err(e) = outcome {
			error!("{} failed: {}", campaign, e);
		}
	}

	/// Run the campaigns until `shutdown` flips.
	pub async fn run(
		mut self,
		mut commands: mpsc::UnboundedReceiver<RefreshCommand>,
		mut status: watch::Receiver<SyncStatus>,
		mut shutdown: watch::Receiver<bool>,
	) {
		if let Err(e) = self.startup().await {
			error!("Startup seeding failed: {}", e);
		}

		let now = Instant::now();
		let price_period = self.config.price_refresh_interval();
		let latest_period = self.config.latest_price_refresh_interval();
		let mut price_timer = interval_at(now + price_period, price_period);
		let mut latest_timer = interval_at(now + latest_period, latest_period);
		price_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
		latest_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let executing = is_resync_executing(&status.borrow_and_update().modules_present);
		self.debounce.observe(executing, now);
		let mut commands_open = true;

		loop {
			let deadline = self.debounce.deadline();
			tokio::select! {
				_ = shutdown.changed() => break,
				command = commands.recv(), if commands_open => match command {
					Some(RefreshCommand::ManualResync) => Self::log_outcome("Manual resync", self.manual_resync().await),
					None => commands_open = false,
				},
				changed = status.changed() => {
					if changed.is_err() {
						info!("Sync queue gone, stopping refresh scheduler");
						break;
					}
					let executing = is_resync_executing(&status.borrow_and_update().modules_present);
					self.debounce.observe(executing, Instant::now());
				}
				_ = tokio::time::sleep_until(deadline.unwrap_or(now)), if deadline.is_some() => {
					if self.debounce.poll(Instant::now()) {
						Self::log_outcome("Auto resync", self.auto_resync().await);
						let executing = is_resync_executing(&status.borrow().modules_present);
						self.debounce.observe(executing, Instant::now());
					}
				}
				_ = price_timer.tick() => Self::log_outcome("Price refresh", self.refresh_prices().await),
				_ = latest_timer.tick() => Self::log_outcome("Latest price refresh", self.refresh_latest().await),
			}
		}
		info!("Refresh scheduler stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::coins::CoinRegistry;
	use crate::wallet::sync::connectivity::ConnectivitySignal;
	use crate::wallet::sync::notifications::NoopNotifications;
	use crate::wallet::sync::queue::{QueueCommand, command_channel};
	use crate::wallet::sync::repositories::InMemoryWalletStore;
	use crate::wallet::sync::task::TaskKind;
	use crate::wallet::types::{Coin, Transaction, TxnStatus};
	use std::collections::BTreeSet;

	const QUIET: Duration = Duration::from_secs(300);

	struct Harness {
		scheduler: RefreshScheduler,
		commands: mpsc::UnboundedReceiver<QueueCommand>,
		notifications: Arc<NoopNotifications>,
		store: Arc<InMemoryWalletStore>,
		_signal: ConnectivitySignal,
	}

	async fn harness(config: RefreshConfig) -> Harness {
		let store = Arc::new(InMemoryWalletStore::new());
		store
			.add_coin(Coin {
				wallet_id: "w1".into(),
				slug: "eth".into(),
				xpub: "xpub-eth".into(),
				zpub: None,
			})
			.await;
		let factory = Arc::new(TaskFactory::new(
			Arc::new(CoinRegistry::builtin()),
			store.clone(),
			Duration::from_secs(10),
		));
		let notifications = Arc::new(NoopNotifications::new());
		let (sender, commands) = command_channel();
		let (signal, gate) = ConnectivitySignal::new(true);
		let scheduler = RefreshScheduler::new(config, factory, store.clone(), notifications.clone(), sender, gate);
		Harness {
			scheduler,
			commands,
			notifications,
			store,
			_signal: signal,
		}
	}

	fn drain(commands: &mut mpsc::UnboundedReceiver<QueueCommand>) -> (Vec<SyncTask>, bool) {
		let mut tasks = Vec::new();
		let mut setup_done = false;
		while let Ok(command) = commands.try_recv() {
			match command {
				QueueCommand::Enqueue(batch) => tasks.extend(batch),
				QueueCommand::InitialSetupDone => setup_done = true,
			}
		}
		(tasks, setup_done)
	}

	fn status_with(modules: &[&str]) -> SyncStatus {
		SyncStatus {
			modules_present: modules.iter().map(|m| m.to_string()).collect::<BTreeSet<_>>(),
			queue_len: modules.len(),
			..SyncStatus::default()
		}
	}

	#[test]
	fn test_debounce_fires_after_quiet_period() {
		let mut debounce = IdleDebounce::new(QUIET);
		let t0 = Instant::now();

		debounce.observe(true, t0);
		assert!(!debounce.is_armed());
		debounce.observe(false, t0);
		assert_eq!(debounce.deadline(), Some(t0 + QUIET));
		// level repeats do not re-arm
		debounce.observe(false, t0 + Duration::from_secs(100));
		assert_eq!(debounce.deadline(), Some(t0 + QUIET));

		assert!(!debounce.poll(t0 + Duration::from_secs(299)));
		assert!(debounce.poll(t0 + QUIET));
		assert!(!debounce.poll(t0 + QUIET));
	}

	#[test]
	fn test_debounce_cancelled_by_resync() {
		let mut debounce = IdleDebounce::new(QUIET);
		let t0 = Instant::now();

		debounce.observe(false, t0);
		assert!(debounce.is_armed());
		debounce.observe(true, t0 + Duration::from_secs(200));
		assert!(!debounce.is_armed());
		assert!(!debounce.poll(t0 + QUIET));

		let t1 = t0 + Duration::from_secs(400);
		debounce.observe(false, t1);
		assert_eq!(debounce.deadline(), Some(t1 + QUIET));
	}

	#[tokio::test]
	async fn test_startup_seeds_and_signals_setup() {
		let mut h = harness(RefreshConfig::default()).await;
		let mut pending = Transaction {
			hash: "0xpending".into(),
			wallet_id: "w1".into(),
			slug: "eth".into(),
			coin: None,
			custom_account: None,
			wallet_branch: None,
			status: TxnStatus::Pending,
			block_height: None,
			confirmations: 0,
			is_token_transfer: false,
			sender: None,
			amount: "1".into(),
			confirmed_at: None,
			created_at: Utc::now(),
		};
		h.store.add_transaction(pending.clone()).await;
		pending.hash = "0xstale".into();
		pending.created_at = Utc::now() - chrono::Duration::days(2);
		h.store.add_transaction(pending).await;

		h.scheduler.startup().await.unwrap();
		let (tasks, setup_done) = drain(&mut h.commands);

		assert!(setup_done);
		let status_checks: Vec<_> = tasks.iter().filter(|t| t.kind() == TaskKind::TxnStatus).collect();
		assert_eq!(status_checks.len(), 1);
		assert_eq!(status_checks[0].status_state().unwrap().txn_hash, "0xpending");
		assert_eq!(status_checks[0].module, modules::REFRESH);

		let resync: Vec<_> = tasks.iter().filter(|t| t.module == modules::INITIAL_RESYNC).collect();
		let kinds: BTreeSet<_> = resync.iter().map(|t| t.kind()).collect();
		assert_eq!(
			kinds,
			BTreeSet::from([TaskKind::Balance, TaskKind::History, TaskKind::Price, TaskKind::LatestPrice])
		);
		assert!(resync.iter().all(|t| t.is_refresh));
	}

	#[tokio::test]
	async fn test_startup_without_seeding_only_signals() {
		let config = RefreshConfig {
			seed_on_startup: false,
			..RefreshConfig::default()
		};
		let mut h = harness(config).await;

		h.scheduler.startup().await.unwrap();
		let (tasks, setup_done) = drain(&mut h.commands);
		assert!(tasks.is_empty());
		assert!(setup_done);
	}

	#[tokio::test]
	async fn test_manual_resync_refreshes_notifications() {
		let mut h = harness(RefreshConfig::default()).await;

		let count = h.scheduler.manual_resync().await.unwrap();
		let (tasks, _) = drain(&mut h.commands);
		assert_eq!(count, tasks.len());
		assert!(!tasks.is_empty());
		assert!(tasks.iter().all(|t| t.module == modules::MANUAL_RESYNC && !t.is_refresh));
		assert_eq!(h.notifications.refresh_count(), 1);
	}

	#[tokio::test]
	async fn test_latest_refresh_includes_custom_accounts() {
		let mut h = harness(RefreshConfig::default()).await;
		h.store
			.add_coin(Coin {
				wallet_id: "w1".into(),
				slug: "near".into(),
				xpub: "xpub-near".into(),
				zpub: None,
			})
			.await;

		h.scheduler.refresh_latest().await.unwrap();
		let (tasks, _) = drain(&mut h.commands);

		let custom: Vec<_> = tasks.iter().filter(|t| t.kind() == TaskKind::CustomAccount).collect();
		assert_eq!(custom.len(), 1);
		assert!(tasks.iter().any(|t| t.kind() == TaskKind::LatestPrice));
		assert!(
			tasks
				.iter()
				.all(|t| t.module == modules::LATEST_PRICE_RESYNC && t.is_refresh)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_run_auto_resync_after_quiet_period() {
		let config = RefreshConfig {
			seed_on_startup: false,
			..RefreshConfig::default()
		};
		let h = harness(config).await;
		let mut commands = h.commands;
		let (status_tx, status_rx) = watch::channel(status_with(&[modules::INITIAL_RESYNC]));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (_refresh_tx, refresh_rx) = mpsc::unbounded_channel();
		let handle = tokio::spawn(h.scheduler.run(refresh_rx, status_rx, shutdown_rx));

		tokio::time::sleep(Duration::from_secs(10)).await;
		status_tx.send(status_with(&[])).unwrap();

		// A resync reappearing mid-wait cancels the pending auto resync.
		tokio::time::sleep(Duration::from_secs(200)).await;
		status_tx.send(status_with(&[modules::MANUAL_RESYNC])).unwrap();
		tokio::time::sleep(Duration::from_secs(200)).await;
		let (tasks, _) = drain(&mut commands);
		assert!(tasks.iter().all(|t| t.module != modules::AUTO_RESYNC));

		status_tx.send(status_with(&[])).unwrap();
		tokio::time::sleep(Duration::from_secs(299)).await;
		let (tasks, _) = drain(&mut commands);
		assert!(tasks.iter().all(|t| t.module != modules::AUTO_RESYNC));

		tokio::time::sleep(Duration::from_secs(2)).await;
		let (tasks, _) = drain(&mut commands);
		let auto: Vec<_> = tasks.iter().filter(|t| t.module == modules::AUTO_RESYNC).collect();
		let kinds: Vec<_> = auto.iter().map(|t| t.kind()).collect();
		assert_eq!(kinds, vec![TaskKind::Balance, TaskKind::History]);
		assert!(auto.iter().all(|t| t.is_refresh));

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_run_interval_refreshes() {
		let config = RefreshConfig {
			seed_on_startup: false,
			auto_resync_quiet_period_ms: 24 * 3_600_000,
			..RefreshConfig::default()
		};
		let h = harness(config).await;
		let mut commands = h.commands;
		let notifications = h.notifications.clone();
		let (_status_tx, status_rx) = watch::channel(SyncStatus::default());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
		let handle = tokio::spawn(h.scheduler.run(refresh_rx, status_rx, shutdown_rx));

		tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;
		let (tasks, setup_done) = drain(&mut commands);
		assert!(setup_done);
		assert!(!tasks.is_empty());
		assert!(tasks.iter().all(|t| t.kind() == TaskKind::LatestPrice));
		assert!(tasks.iter().all(|t| t.module == modules::LATEST_PRICE_RESYNC));

		tokio::time::sleep(Duration::from_secs(45 * 60)).await;
		let (tasks, _) = drain(&mut commands);
		let price: Vec<_> = tasks.iter().filter(|t| t.kind() == TaskKind::Price).collect();
		assert_eq!(price.len(), 2);
		assert!(price.iter().all(|t| t.module == modules::PRICE_RESYNC));
		assert_eq!(notifications.refresh_count(), 1);

		refresh_tx.send(RefreshCommand::ManualResync).unwrap();
		tokio::time::sleep(Duration::from_millis(10)).await;
		let (tasks, _) = drain(&mut commands);
		assert!(tasks.iter().any(|t| t.module == modules::MANUAL_RESYNC));
		assert_eq!(notifications.refresh_count(), 2);

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}
}
