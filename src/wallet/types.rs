use crate::indexer::IndexerError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chain family a coin belongs to. Selects the remote reader and the
/// task derivation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinGroup {
	BitcoinForks,
	Ethereum,
	Near,
	Solana,
	Erc20Tokens,
}

impl CoinGroup {
	/// Family whose reader serves this group. Tokens are read through their
	/// parent chain.
	pub fn reader_group(&self) -> CoinGroup {
		match self {
			CoinGroup::Erc20Tokens => CoinGroup::Ethereum,
			other => *other,
		}
	}
}

impl std::fmt::Display for CoinGroup {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			CoinGroup::BitcoinForks => "bitcoin-forks",
			CoinGroup::Ethereum => "ethereum",
			CoinGroup::Near => "near",
			CoinGroup::Solana => "solana",
			CoinGroup::Erc20Tokens => "erc20",
		};
		f.write_str(name)
	}
}

/// A wallet account for one coin, as recorded by the wallet store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
	pub wallet_id: String,
	pub slug: String,
	pub xpub: String,
	/// Segwit branch key for Bitcoin-like coins that have one.
	pub zpub: Option<String>,
}

/// A token tracked under a parent coin account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
	pub wallet_id: String,
	pub slug: String,
	/// Slug of the parent coin (e.g. `eth`).
	pub coin: String,
}

/// Named on-chain account (Near) attached to a coin account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAccount {
	pub wallet_id: String,
	pub coin: String,
	pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus {
	Pending,
	Success,
	Failed,
}

/// A wallet transaction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub hash: String,
	pub wallet_id: String,
	pub slug: String,
	/// Parent coin slug for token transfers.
	pub coin: Option<String>,
	pub custom_account: Option<String>,
	/// Extended key branch the transaction was discovered under.
	pub wallet_branch: Option<String>,
	pub status: TxnStatus,
	pub block_height: Option<u64>,
	pub confirmations: u64,
	/// Set for token transfers seen through the parent chain.
	pub is_token_transfer: bool,
	pub sender: Option<String>,
	pub amount: String,
	pub confirmed_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

impl Transaction {
	/// Slug the transaction's coin metadata lives under.
	pub fn coin_slug(&self) -> &str {
		self.coin.as_deref().unwrap_or(&self.slug)
	}
}

/// Price history bucket for one coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
	pub slug: String,
	pub interval_days: u16,
	/// `(timestamp_ms, price)` pairs, oldest first.
	pub data: Vec<(i64, f64)>,
}

/// Error types for the wallet sync subsystem
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Indexer error: {0}")]
	IndexerError(#[from] IndexerError),

	#[error("Store error: {0}")]
	StoreError(String),

	#[error("Unknown coin: {0}")]
	UnknownCoin(String),

	#[error("Parent coin {parent} not found for wallet {wallet_id}")]
	MissingParentCoin { wallet_id: String, parent: String },

	#[error("Sync queue is no longer running")]
	QueueClosed,

	#[error("Config error: {0}")]
	ConfigError(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Notification error: {0}")]
	NotificationError(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_transaction_reads_rfc3339_timestamps() {
		let raw = r#"{
			"hash": "0xabc",
			"wallet_id": "w1",
			"slug": "usdt",
			"coin": "eth",
			"custom_account": null,
			"wallet_branch": null,
			"status": "pending",
			"block_height": null,
			"confirmations": 0,
			"is_token_transfer": true,
			"sender": "0xfrom",
			"amount": "5",
			"confirmed_at": null,
			"created_at": "2024-05-01T12:00:00Z"
		}"#;

		let txn: Transaction = serde_json::from_str(raw).unwrap();
		assert_eq!(txn.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
		assert_eq!(txn.status, TxnStatus::Pending);
		assert_eq!(txn.coin_slug(), "eth");

		let back: Transaction = serde_json::from_value(serde_json::to_value(&txn).unwrap()).unwrap();
		assert_eq!(back, txn);
	}
}
