use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use wallet_state_sync::indexer::{
	BalanceReport, ChainAccount, ChainReader, ChainTxnStatus, HistoryCursor, HistoryPage, IndexerError, PricePoint,
	PriceReader, PriceTarget, TxnStatusReport,
};
use wallet_state_sync::wallet::coins::CoinRegistry;
use wallet_state_sync::wallet::sync::connectivity::{ConnectivityGate, ConnectivitySignal};
use wallet_state_sync::wallet::sync::modules;
use wallet_state_sync::wallet::sync::PassOutcome;
use wallet_state_sync::wallet::sync::notifications::NoopNotifications;
use wallet_state_sync::wallet::sync::repositories::{BalanceKey, InMemoryWalletStore};
use wallet_state_sync::wallet::types::{Coin, CoinGroup, Transaction, TxnStatus};
use wallet_state_sync::{SyncDependencies, SyncService, SyncServiceConfig, WalletSyncError};

/// Explorer fake: fixed balance, empty history, and a transaction that stays
/// pending for a configurable number of checks.
struct FakeExplorer {
	balance_calls: AtomicUsize,
	history_calls: AtomicUsize,
	status_calls: AtomicUsize,
	pending_checks: usize,
}

impl FakeExplorer {
	fn new(pending_checks: usize) -> Arc<Self> {
		Arc::new(Self {
			balance_calls: AtomicUsize::new(0),
			history_calls: AtomicUsize::new(0),
			status_calls: AtomicUsize::new(0),
			pending_checks,
		})
	}

	fn remote_calls(&self) -> usize {
		self.balance_calls.load(Ordering::SeqCst)
			+ self.history_calls.load(Ordering::SeqCst)
			+ self.status_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ChainReader for FakeExplorer {
	async fn fetch_balance(&self, _account: &ChainAccount) -> Result<BalanceReport, IndexerError> {
		self.balance_calls.fetch_add(1, Ordering::SeqCst);
		Ok(BalanceReport {
			balance: "42".into(),
			unconfirmed_balance: None,
		})
	}

	async fn fetch_history_page(
		&self,
		_account: &ChainAccount,
		_cursor: &HistoryCursor,
	) -> Result<HistoryPage, IndexerError> {
		self.history_calls.fetch_add(1, Ordering::SeqCst);
		Ok(HistoryPage::default())
	}

	async fn fetch_txn_status(
		&self,
		_account: &ChainAccount,
		_txn_hash: &str,
		_sender: Option<&str>,
	) -> Result<TxnStatusReport, IndexerError> {
		let call = self.status_calls.fetch_add(1, Ordering::SeqCst);
		let status = if call < self.pending_checks {
			ChainTxnStatus::Pending
		} else {
			ChainTxnStatus::Success
		};
		Ok(TxnStatusReport {
			status,
			confirmations: 1,
			block_height: Some(100),
		})
	}

	async fn fetch_custom_accounts(&self, _account: &ChainAccount) -> Result<Vec<String>, IndexerError> {
		Ok(Vec::new())
	}

	fn name(&self) -> &'static str {
		"fake-explorer"
	}
}

struct FakePrices;

#[async_trait::async_trait]
impl PriceReader for FakePrices {
	async fn fetch_price_history(&self, _target: &PriceTarget, _days: u16) -> Result<Vec<PricePoint>, IndexerError> {
		Ok(vec![(1_700_000_000_000, 2_000.0)])
	}

	async fn fetch_latest_prices(&self, targets: &[PriceTarget]) -> Result<HashMap<String, f64>, IndexerError> {
		Ok(targets.iter().map(|t| (t.api_id().to_string(), 2_000.0)).collect())
	}
}

fn eth_coin() -> Coin {
	Coin {
		wallet_id: "w1".into(),
		slug: "eth".into(),
		xpub: "xpub-eth".into(),
		zpub: None,
	}
}

fn pending_txn(hash: &str) -> Transaction {
	Transaction {
		hash: hash.into(),
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
	}
}

fn start(store: Arc<InMemoryWalletStore>, explorer: Arc<FakeExplorer>, gate: ConnectivityGate) -> SyncService {
	let mut readers: HashMap<CoinGroup, Arc<dyn ChainReader>> = HashMap::new();
	readers.insert(CoinGroup::Ethereum, explorer);
	SyncService::start(
		SyncServiceConfig::default(),
		SyncDependencies {
			registry: Arc::new(CoinRegistry::builtin()),
			store,
			readers,
			price_reader: Arc::new(FakePrices),
			notifications: Arc::new(NoopNotifications::new()),
		},
		gate,
	)
}

#[tokio::test(start_paused = true)]
async fn test_startup_sync_settles_pending_transaction() {
	let store = Arc::new(InMemoryWalletStore::new());
	store.add_coin(eth_coin()).await;
	store.add_transaction(pending_txn("0xpending")).await;
	let explorer = FakeExplorer::new(1);
	let (_signal, gate) = ConnectivitySignal::new(true);

	let service = start(store.clone(), explorer.clone(), gate);
	let mut status = service.handle().subscribe_status();

	status.wait_for(|s| s.queue_len > 0).await.unwrap();
	status.wait_for(|s| s.queue_len == 0).await.unwrap();

	// One pending answer, then settled: two checks.
	assert_eq!(explorer.status_calls.load(Ordering::SeqCst), 2);
	let txns = store.transactions("w1").await;
	let settled = txns.iter().find(|t| t.hash == "0xpending").unwrap();
	assert_eq!(settled.status, TxnStatus::Success);

	// Initial resync plus the balance and history follow-ups.
	assert_eq!(explorer.balance_calls.load(Ordering::SeqCst), 2);
	assert_eq!(explorer.history_calls.load(Ordering::SeqCst), 2);
	let key = BalanceKey {
		wallet_id: "w1".into(),
		slug: "eth".into(),
		parent_coin: None,
		custom_account: None,
	};
	assert_eq!(store.balance(&key).await.map(|b| b.balance), Some("42".to_string()));
	assert_eq!(store.latest_price("eth", None).await, Some(2_000.0));

	let handle = service.handle();
	service.shutdown().await;
	assert!(matches!(handle.trigger_manual_resync(), Err(WalletSyncError::QueueClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_offline_queue_waits_for_connection() {
	let store = Arc::new(InMemoryWalletStore::new());
	store.add_coin(eth_coin()).await;
	let explorer = FakeExplorer::new(0);
	let (signal, gate) = ConnectivitySignal::new(false);

	let service = start(store, explorer.clone(), gate);
	let handle = service.handle();
	let mut status = handle.subscribe_status();

	status.wait_for(|s| s.is_waiting_for_connection).await.unwrap();
	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(explorer.remote_calls(), 0);
	assert!(!handle.is_syncing());
	assert!(handle.modules_present().contains(modules::INITIAL_RESYNC));

	signal.set(true);
	status.wait_for(|s| s.queue_len == 0).await.unwrap();
	assert!(explorer.remote_calls() > 0);
	assert!(!handle.is_waiting_for_connection());

	service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handle_operations_enqueue_work() {
	let store = Arc::new(InMemoryWalletStore::new());
	let explorer = FakeExplorer::new(0);
	let (_signal, gate) = ConnectivitySignal::new(true);

	let service = start(store.clone(), explorer.clone(), gate);
	let handle = service.handle();

	// Nothing recorded yet: a token without its parent coin is skipped.
	assert_eq!(handle.add_token_task("w1", "usdt", "eth").await.unwrap(), 0);

	store.add_coin(eth_coin()).await;
	let submitted = handle.add_coin_task(&eth_coin(), modules::DEFAULT).await.unwrap();
	assert!(submitted > 0);
	assert!(handle.add_token_task("w1", "usdt", "eth").await.unwrap() > 0);

	let mut status = handle.subscribe_status();
	status.wait_for(|s| s.queue_len > 0).await.unwrap();
	status.wait_for(|s| s.queue_len == 0).await.unwrap();
	assert!(explorer.balance_calls.load(Ordering::SeqCst) >= 2);
	assert_eq!(store.latest_price("usdt", Some("eth")).await, Some(2_000.0));

	handle.trigger_manual_resync().unwrap();
	status
		.wait_for(|s| s.modules_present.contains(modules::MANUAL_RESYNC))
		.await
		.unwrap();
	status.wait_for(|s| s.queue_len == 0).await.unwrap();

	service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_pass_outcomes() {
	let store = Arc::new(InMemoryWalletStore::new());
	store.add_coin(eth_coin()).await;
	let explorer = FakeExplorer::new(0);
	let (_signal, gate) = ConnectivitySignal::new(true);

	let service = start(store, explorer.clone(), gate);
	let handle = service.handle();
	assert_eq!(handle.wait_for_pass(Duration::from_secs(10)).await, PassOutcome::Drained);
	assert!(explorer.remote_calls() > 0);
	// Status keeps publishing after the pass.
	assert_eq!(handle.status().queue_len, 0);

	service.shutdown().await;
	assert_eq!(handle.wait_for_pass(Duration::from_secs(10)).await, PassOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_pass_without_accounts() {
	let store = Arc::new(InMemoryWalletStore::new());
	let explorer = FakeExplorer::new(0);
	let (_signal, gate) = ConnectivitySignal::new(true);

	let service = start(store, explorer.clone(), gate);
	let outcome = service.handle().wait_for_pass(Duration::from_secs(10)).await;
	assert_eq!(outcome, PassOutcome::NothingQueued);
	assert_eq!(explorer.remote_calls(), 0);

	service.shutdown().await;
}
