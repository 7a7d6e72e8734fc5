//! Service configuration.
//!
//! Every section deserializes with defaults, so a config file only needs to
//! name the values it changes. Durations are stored as milliseconds.

use crate::wallet::sync::task::TaskKind;
use crate::wallet::types::{CoinGroup, WalletSyncError};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncServiceConfig {
	pub queue: QueueConfig,
	pub refresh: RefreshConfig,
	pub endpoints: EndpointConfig,
}

impl SyncServiceConfig {
	/// Load configuration from a JSON file.
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, WalletSyncError> {
		let path = path.as_ref();
		let content = tokio::fs::read_to_string(path).await?;
		let config: Self = serde_json::from_str(&content)
			.map_err(|e| WalletSyncError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))?;
		config.validate()?;
		Ok(config)
	}

	/// Reject values the timers and the status backoff cannot run with.
	pub fn validate(&self) -> Result<(), WalletSyncError> {
		let periods = [
			("queue.tick_interval_ms", self.queue.tick_interval_ms),
			("queue.status_backoff_base_ms", self.queue.status_backoff_base_ms),
			("refresh.auto_resync_quiet_period_ms", self.refresh.auto_resync_quiet_period_ms),
			("refresh.price_refresh_interval_ms", self.refresh.price_refresh_interval_ms),
			("refresh.latest_price_refresh_interval_ms", self.refresh.latest_price_refresh_interval_ms),
			("endpoints.request_timeout_ms", self.endpoints.request_timeout_ms),
		];
		if let Some((name, _)) = periods.into_iter().find(|(_, ms)| *ms == 0) {
			return Err(WalletSyncError::ConfigError(format!("{} must be non-zero", name)));
		}

		// The status backoff has to grow to ever reach the drop threshold.
		if self.queue.status_backoff_multiplier < 2 {
			return Err(WalletSyncError::ConfigError(format!(
				"queue.status_backoff_multiplier must be at least 2, got {}",
				self.queue.status_backoff_multiplier
			)));
		}
		Ok(())
	}
}

/// Execution queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	/// Period of the queue tick
	pub tick_interval_ms: u64,
	/// Retry budget for failing tasks; a task runs at most `max_retries + 1` times
	pub max_retries: u32,
	pub balance_batch_size: usize,
	pub history_batch_size: usize,
	pub price_batch_size: usize,
	pub latest_price_batch_size: usize,
	pub custom_account_batch_size: usize,
	pub txn_status_batch_size: usize,
	/// Base interval of the status-check backoff
	pub status_backoff_base_ms: u64,
	pub status_backoff_multiplier: u32,
	/// Status checks whose backoff grows past this are dropped
	pub resync_interval_ms: u64,
	/// Bound on concurrent remote calls inside one batch
	pub executor_concurrency: usize,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			tick_interval_ms: 1000,
			max_retries: 2,
			balance_batch_size: 5,
			history_batch_size: 5,
			price_batch_size: 1,
			latest_price_batch_size: 50,
			custom_account_batch_size: 5,
			txn_status_batch_size: 5,
			status_backoff_base_ms: 10_000,
			status_backoff_multiplier: 2,
			resync_interval_ms: 300_000,
			executor_concurrency: 5,
		}
	}
}

impl QueueConfig {
	pub fn tick_interval(&self) -> Duration {
		Duration::from_millis(self.tick_interval_ms)
	}

	pub fn status_backoff_base(&self) -> Duration {
		Duration::from_millis(self.status_backoff_base_ms)
	}

	pub fn resync_interval(&self) -> Duration {
		Duration::from_millis(self.resync_interval_ms)
	}

	pub fn batch_size(&self, kind: TaskKind) -> usize {
		let size = match kind {
			TaskKind::Balance => self.balance_batch_size,
			TaskKind::History => self.history_batch_size,
			TaskKind::Price => self.price_batch_size,
			TaskKind::LatestPrice => self.latest_price_batch_size,
			TaskKind::CustomAccount => self.custom_account_batch_size,
			TaskKind::TxnStatus => self.txn_status_batch_size,
		};
		size.max(1)
	}
}

/// Refresh scheduler timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
	/// Run the initial resync and the pending-transaction bootstrap at startup
	pub seed_on_startup: bool,
	/// Quiet period after the last resync before an auto resync fires
	pub auto_resync_quiet_period_ms: u64,
	pub price_refresh_interval_ms: u64,
	pub latest_price_refresh_interval_ms: u64,
	/// Pending transactions older than this are marked failed
	pub pending_txn_expiry_ms: u64,
}

impl Default for RefreshConfig {
	fn default() -> Self {
		Self {
			seed_on_startup: true,
			auto_resync_quiet_period_ms: 300_000,
			price_refresh_interval_ms: 3_600_000,
			latest_price_refresh_interval_ms: 900_000,
			pending_txn_expiry_ms: 86_400_000,
		}
	}
}

impl RefreshConfig {
	pub fn auto_resync_quiet_period(&self) -> Duration {
		Duration::from_millis(self.auto_resync_quiet_period_ms)
	}

	pub fn price_refresh_interval(&self) -> Duration {
		Duration::from_millis(self.price_refresh_interval_ms)
	}

	pub fn latest_price_refresh_interval(&self) -> Duration {
		Duration::from_millis(self.latest_price_refresh_interval_ms)
	}

	pub fn pending_txn_expiry(&self) -> Duration {
		Duration::from_millis(self.pending_txn_expiry_ms)
	}
}

/// Remote provider endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
	pub bitcoin_url: String,
	pub ethereum_url: String,
	pub near_url: String,
	pub solana_url: String,
	pub price_url: String,
	/// Quote currency for prices
	pub vs_currency: String,
	pub request_timeout_ms: u64,
}

impl Default for EndpointConfig {
	fn default() -> Self {
		Self {
			bitcoin_url: "http://localhost:8080/v2/btc".to_string(),
			ethereum_url: "http://localhost:8080/v2/eth".to_string(),
			near_url: "http://localhost:8080/v2/near".to_string(),
			solana_url: "http://localhost:8080/v2/sol".to_string(),
			price_url: "https://api.coingecko.com/api/v3".to_string(),
			vs_currency: "usd".to_string(),
			request_timeout_ms: 30_000,
		}
	}
}

impl EndpointConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}

	/// Explorer URL for a reader family. Tokens use their parent chain's.
	pub fn chain_url(&self, group: CoinGroup) -> &str {
		match group.reader_group() {
			CoinGroup::BitcoinForks => &self.bitcoin_url,
			CoinGroup::Ethereum | CoinGroup::Erc20Tokens => &self.ethereum_url,
			CoinGroup::Near => &self.near_url,
			CoinGroup::Solana => &self.solana_url,
		}
	}
}
