use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use wallet_state_sync::indexer::{ChainReader, HttpChainReader, HttpPriceReader};
use wallet_state_sync::wallet::coins::CoinRegistry;
use wallet_state_sync::wallet::sync::connectivity::ConnectivitySignal;
use wallet_state_sync::wallet::sync::PassOutcome;
use wallet_state_sync::wallet::sync::notifications::NoopNotifications;
use wallet_state_sync::wallet::sync::repositories::InMemoryWalletStore;
use wallet_state_sync::wallet::types::{Coin, CoinGroup};
use wallet_state_sync::{SyncDependencies, SyncService, SyncServiceConfig, WalletSyncError};

/// How long to wait for the first queued work before giving up
const FIRST_WORK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Wallet sync failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), WalletSyncError> {
	info!("Starting wallet sync service");

	let config = match std::env::var("WALLET_SYNC_CONFIG") {
		Ok(path) => {
			info!("Loading config from {}", path);
			SyncServiceConfig::load(path).await?
		}
		Err(_) => SyncServiceConfig::default(),
	};

	let store = Arc::new(InMemoryWalletStore::new());
	if let Ok(path) = std::env::var("WALLET_SYNC_ACCOUNTS") {
		let raw = tokio::fs::read(&path).await?;
		let coins: Vec<Coin> =
			serde_json::from_slice(&raw).map_err(|e| WalletSyncError::ConfigError(format!("{}: {}", path, e)))?;
		info!("Loaded {} coin accounts from {}", coins.len(), path);
		for coin in coins {
			store.add_coin(coin).await;
		}
	}

	let timeout = config.endpoints.request_timeout();
	let mut readers: HashMap<CoinGroup, Arc<dyn ChainReader>> = HashMap::new();
	for (group, name) in [
		(CoinGroup::BitcoinForks, "bitcoin"),
		(CoinGroup::Ethereum, "ethereum"),
		(CoinGroup::Near, "near"),
		(CoinGroup::Solana, "solana"),
	] {
		let url = config.endpoints.chain_url(group).to_string();
		readers.insert(group, Arc::new(HttpChainReader::new(name, url, timeout)?));
	}
	let price_reader = HttpPriceReader::new(
		config.endpoints.price_url.clone(),
		config.endpoints.vs_currency.clone(),
		timeout,
	)?;

	info!("Created remote readers");

	let (signal, gate) = ConnectivitySignal::new(true);
	let service = SyncService::start(
		config,
		SyncDependencies {
			registry: Arc::new(CoinRegistry::builtin()),
			store,
			readers,
			price_reader: Arc::new(price_reader),
			notifications: Arc::new(NoopNotifications::new()),
		},
		gate,
	);

	// Run one pass: wait for the startup resync to be queued, then for the
	// queue to drain.
	match service.handle().wait_for_pass(FIRST_WORK_TIMEOUT).await {
		PassOutcome::Drained => info!("Initial sync pass finished"),
		PassOutcome::NothingQueued => info!("Nothing to sync"),
		PassOutcome::Stopped => error!("Sync queue stopped unexpectedly"),
	}

	service.shutdown().await;
	drop(signal);
	Ok(())
}
