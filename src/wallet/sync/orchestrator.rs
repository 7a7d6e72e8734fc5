//! Wallet sync service and integration point for all sync components.
//!
//! `SyncService::start` wires the task factory, the chain-backed batch
//! executor, the execution queue and the refresh scheduler together and
//! spawns the two long-running loops:
//! - the queue loop, the single writer of the task list
//! - the refresh scheduler, which seeds the queue from its campaigns
//!
//! The rest of the application talks to the subsystem through the clonable
//! `SyncHandle`: enqueue operations derive tasks with the factory and send
//! them over the queue's command channel; status is read from a watch channel
//! the queue publishes on. `SyncService::shutdown` stops both loops and
//! waits for them.

use crate::config::SyncServiceConfig;
use crate::indexer::{ChainReader, PriceReader};
use crate::wallet::WalletSyncError;
use crate::wallet::coins::CoinRegistry;
use crate::wallet::sync::{
    connectivity::ConnectivityGate,
    executor::ChainBatchExecutor,
    notifications::NotificationService,
    queue::{ExecutionQueue, QueueSender, SyncStatus, command_channel},
    refresh::{RefreshCommand, RefreshScheduler},
    repositories::WalletStore,
    seeding::TaskFactory,
    task::{SyncTask, TaskOptions},
};
use crate::wallet::types::{Coin, CoinGroup, Transaction};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators the sync service reads from and writes to.
pub struct SyncDependencies {
    pub registry: Arc<CoinRegistry>,
    pub store: Arc<dyn WalletStore>,
    /// Chain reader per family, keyed by `CoinGroup::reader_group()`
    pub readers: HashMap<CoinGroup, Arc<dyn ChainReader>>,
    pub price_reader: Arc<dyn PriceReader>,
    pub notifications: Arc<dyn NotificationService>,
}

/// Running sync subsystem.
///
/// Owns the spawned loops; dropping it without calling `shutdown` leaves
/// them running until every handle is gone.
pub struct SyncService {
    handle: SyncHandle,
    shutdown_tx: watch::Sender<bool>,
    queue_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
}

impl SyncService {
    /// Start the queue loop and the refresh scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SyncServiceConfig,
        deps: SyncDependencies,
        connectivity: ConnectivityGate,
    ) -> Self {
        let factory = Arc::new(TaskFactory::new(
            deps.registry,
            deps.store.clone(),
            config.queue.status_backoff_base(),
        ));

        let executor = Arc::new(ChainBatchExecutor::new(
            deps.readers,
            deps.price_reader,
            deps.store.clone(),
            factory.clone(),
            config.queue.executor_concurrency,
        ));

        let (queue, status) = ExecutionQueue::new(config.queue.clone(), executor, connectivity.clone());
        let (sender, commands) = command_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = RefreshScheduler::new(
            config.refresh.clone(),
            factory.clone(),
            deps.store,
            deps.notifications,
            sender.clone(),
            connectivity,
        );

        let queue_task = tokio::spawn(queue.run(commands, shutdown_rx.clone()));
        let refresh_task = tokio::spawn(scheduler.run(refresh_rx, status.clone(), shutdown_rx));

        info!(
            "Sync service started (tick {:?}, max retries {})",
            config.queue.tick_interval(),
            config.queue.max_retries
        );

        Self {
            handle: SyncHandle {
                queue: sender,
                refresh: refresh_tx,
                factory,
                status,
            },
            shutdown_tx,
            queue_task,
            refresh_task,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stop both loops and wait for them to exit. Queued tasks are dropped.
    pub async fn shutdown(self) {
        info!("Stopping sync service");
        if self.shutdown_tx.send(true).is_err() {
            warn!("Sync loops already stopped");
        }

        for (name, task) in [("queue", self.queue_task), ("refresh scheduler", self.refresh_task)] {
            if let Err(e) = task.await {
                error!("Sync {} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// How a wait for one sync pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Work was queued and the queue has since drained.
    Drained,
    /// No work showed up within the wait.
    NothingQueued,
    /// The queue loop stopped first.
    Stopped,
}

/// Application-facing API of the sync subsystem. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    queue: QueueSender,
    refresh: mpsc::UnboundedSender<RefreshCommand>,
    factory: Arc<TaskFactory>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    fn submit(&self, tasks: Vec<SyncTask>) -> Result<usize, WalletSyncError> {
        let count = tasks.len();
        self.queue.enqueue(tasks)?;
        Ok(count)
    }

    /// Queue balance sync for a coin account. Returns how many tasks were
    /// submitted; the queue may still drop duplicates.
    pub async fn enqueue_balance_sync(&self, coin: &Coin, options: &TaskOptions) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.balance_tasks(coin, options).await?;
        self.submit(tasks)
    }

    pub async fn enqueue_history_sync(&self, coin: &Coin, options: &TaskOptions) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.history_tasks(coin, options).await?;
        self.submit(tasks)
    }

    /// Queue price history sync for a coin, or a token when `parent` is set.
    pub async fn enqueue_price_sync(
        &self,
        slug: &str,
        parent: Option<&str>,
        options: &TaskOptions,
    ) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.price_tasks(slug, parent, options).await?;
        self.submit(tasks)
    }

    pub fn enqueue_latest_price_sync(
        &self,
        slug: &str,
        parent: Option<&str>,
        options: &TaskOptions,
    ) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.latest_price_task(slug, parent, options).into_iter().collect();
        self.submit(tasks)
    }

    pub fn enqueue_custom_account_sync(&self, coin: &Coin, options: &TaskOptions) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.custom_account_tasks(coin, options);
        self.submit(tasks)
    }

    /// Start polling a broadcast transaction until it settles.
    pub async fn enqueue_status_check(
        &self,
        txn: &Transaction,
        options: &TaskOptions,
    ) -> Result<usize, WalletSyncError> {
        let task = self.factory.status_task(txn, options).await?;
        self.submit(vec![task])
    }

    /// Seed everything a newly added coin account needs.
    pub async fn add_coin_task(&self, coin: &Coin, module: &str) -> Result<usize, WalletSyncError> {
        let tasks = self.factory.coin_tasks(coin, module).await;
        info!("Adding coin {} for wallet {}: {} tasks", coin.slug, coin.wallet_id, tasks.len());
        self.submit(tasks)
    }

    /// Seed everything a newly added token needs. A token whose parent coin
    /// is not recorded yet is skipped.
    pub async fn add_token_task(&self, wallet_id: &str, token: &str, parent: &str) -> Result<usize, WalletSyncError> {
        match self.factory.token_tasks(wallet_id, token, parent).await {
            Ok(tasks) => self.submit(tasks),
            Err(WalletSyncError::MissingParentCoin { wallet_id, parent }) => {
                warn!(
                    "Skipping token {}: parent coin {} not found in wallet {}",
                    token, parent, wallet_id
                );
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    pub fn trigger_manual_resync(&self) -> Result<(), WalletSyncError> {
        self.refresh
            .send(RefreshCommand::ManualResync)
            .map_err(|_| WalletSyncError::QueueClosed)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.status.borrow().is_syncing
    }

    pub fn is_waiting_for_connection(&self) -> bool {
        self.status.borrow().is_waiting_for_connection
    }

    pub fn modules_present(&self) -> BTreeSet<String> {
        self.status.borrow().modules_present.clone()
    }

    /// Wait up to `first_work` for work to be queued, then for the queue to
    /// drain.
    pub async fn wait_for_pass(&self, first_work: Duration) -> PassOutcome {
        let mut status = self.status.clone();
        // Drop each watch guard before awaiting again, the queue publishes
        // through the same lock.
        let started = tokio::time::timeout(first_work, async {
            status.wait_for(|s| s.queue_len > 0).await.map(|_| ())
        })
        .await;
        match started {
            Err(_) => return PassOutcome::NothingQueued,
            Ok(Err(_)) => return PassOutcome::Stopped,
            Ok(Ok(())) => {}
        }

        let drained = status
            .wait_for(|s| {
                debug!(
                    "Sync status: {} queued, syncing: {}, modules: {:?}",
                    s.queue_len, s.is_syncing, s.modules_present
                );
                s.queue_len == 0
            })
            .await
            .map(|_| ());
        match drained {
            Ok(()) => PassOutcome::Drained,
            Err(_) => PassOutcome::Stopped,
        }
    }

    /// Receiver that is notified whenever the status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }
}
