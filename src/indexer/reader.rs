//! Reader traits for remote data providers.
//!
//! One `ChainReader` serves each coin family; a single `PriceReader` serves
//! price history and spot prices for every coin. The batch executor only
//! talks to providers through these traits.

use super::types::*;

use std::collections::HashMap;

/// Read access to one chain family's explorer or RPC.
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
	/// Current balance of an account.
	async fn fetch_balance(&self, account: &ChainAccount) -> Result<BalanceReport, IndexerError>;

	/// One page of account history starting at `cursor`.
	async fn fetch_history_page(
		&self,
		account: &ChainAccount,
		cursor: &HistoryCursor,
	) -> Result<HistoryPage, IndexerError>;

	/// Confirmation state of a broadcast transaction.
	async fn fetch_txn_status(
		&self,
		account: &ChainAccount,
		txn_hash: &str,
		sender: Option<&str>,
	) -> Result<TxnStatusReport, IndexerError>;

	/// Named accounts owned by the account's key (Near).
	async fn fetch_custom_accounts(&self, account: &ChainAccount) -> Result<Vec<String>, IndexerError>;

	/// Get the name of this reader for logging
	fn name(&self) -> &'static str;
}

/// Read access to the price API.
#[async_trait::async_trait]
pub trait PriceReader: Send + Sync {
	/// Price points covering the last `days` days.
	async fn fetch_price_history(
		&self,
		target: &PriceTarget,
		days: u16,
	) -> Result<Vec<PricePoint>, IndexerError>;

	/// Spot prices for several coins in one request, keyed by `api_id()`.
	async fn fetch_latest_prices(
		&self,
		targets: &[PriceTarget],
	) -> Result<HashMap<String, f64>, IndexerError>;
}
