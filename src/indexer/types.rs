//! Types for the per-chain and price provider boundary

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Account description handed to a chain reader.
///
/// Built by the batch executor from a task's identity fields. Readers
/// only need enough to address the right account on the right chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAccount {
    pub wallet_id: String,
    /// Coin (or token) slug being read.
    pub coin: String,
    /// Parent chain slug when `coin` is a token.
    pub parent_coin: Option<String>,
    pub xpub: String,
    /// Set when reading the segwit branch of a Bitcoin-like account.
    pub zpub: Option<String>,
    /// Named account (Near).
    pub custom_account: Option<String>,
}

/// Pagination state for a history fetch.
///
/// Different chain families use different subsets: Bitcoin-like explorers
/// page by number after a block, Ethereum tracks a separate token-transfer
/// block, Solana pages by signature hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCursor {
    pub page: u32,
    pub after_block: Option<u64>,
    pub after_hash: Option<String>,
    pub before_hash: Option<String>,
    pub after_token_block: Option<u64>,
}

impl HistoryCursor {
    pub fn first_page() -> Self {
        Self {
            page: 1,
            ..Self::default()
        }
    }
}

/// Confirmation state reported by a chain for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainTxnStatus {
    Pending,
    Success,
    Failed,
}

impl ChainTxnStatus {
    /// Whether the chain will not report a different status for this
    /// transaction anymore
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainTxnStatus::Pending)
    }
}

/// Transaction as returned by an explorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTransaction {
    pub hash: String,
    pub status: ChainTxnStatus,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub sender: Option<String>,
    pub amount: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub is_token_transfer: bool,
}

/// One page of account history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub transactions: Vec<RemoteTransaction>,
    /// Cursor for the next page; `None` once the history is exhausted.
    #[serde(default)]
    pub next_cursor: Option<HistoryCursor>,
    /// Balance reported alongside history (Bitcoin-like explorers).
    #[serde(default)]
    pub balance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceReport {
    pub balance: String,
    #[serde(default)]
    pub unconfirmed_balance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnStatusReport {
    pub status: ChainTxnStatus,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub block_height: Option<u64>,
}

impl TxnStatusReport {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Coin addressed on the price API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PriceTarget {
    pub slug: String,
    pub parent_coin: Option<String>,
    pub coin_gecko_id: Option<String>,
}

impl PriceTarget {
    /// Identifier used on the wire: the price-API id when known, the slug
    /// otherwise.
    pub fn api_id(&self) -> &str {
        self.coin_gecko_id.as_deref().unwrap_or(&self.slug)
    }
}

/// `(timestamp_ms, price)` pair.
pub type PricePoint = (i64, f64);

/// Error types for remote reads.
///
/// The classification drives the retry policy: `is_retryable` separates
/// transient failures from permanent ones and `rate_limit_delay` carries
/// the upstream's requested pause.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Rate limited, retry after {delay_ms} ms")]
    RateLimited { delay_ms: u64 },

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("No data returned")]
    NoData,
}

impl IndexerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexerError::HttpError(_)
            | IndexerError::RateLimited { .. }
            | IndexerError::Unavailable(_)
            | IndexerError::NoData => true,
            IndexerError::JsonError(_)
            | IndexerError::InvalidRequest(_)
            | IndexerError::Unsupported(_) => false,
        }
    }

    pub fn rate_limit_delay(&self) -> Option<Duration> {
        match self {
            IndexerError::RateLimited { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(IndexerError::Unavailable("502".into()).is_retryable());
        assert!(IndexerError::NoData.is_retryable());
        assert!(!IndexerError::InvalidRequest("bad address".into()).is_retryable());
        assert!(!IndexerError::Unsupported("coin".into()).is_retryable());

        let limited = IndexerError::RateLimited { delay_ms: 60_000 };
        assert!(limited.is_retryable());
        assert_eq!(limited.rate_limit_delay(), Some(Duration::from_secs(60)));
        assert_eq!(IndexerError::NoData.rate_limit_delay(), None);
    }

    #[test]
    fn test_history_page_wire_format() {
        let json = r#"{
            "transactions": [
                {"hash": "0xabc", "status": "success", "blockHeight": 10, "amount": "5"}
            ],
            "nextCursor": {"page": 2, "afterBlock": 9}
        }"#;
        let page: HistoryPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.transactions.len(), 1);
        assert_eq!(page.transactions[0].status, ChainTxnStatus::Success);
        let next = page.next_cursor.unwrap();
        assert_eq!(next.page, 2);
        assert_eq!(next.after_block, Some(9));
        assert_eq!(page.balance, None);
    }
}
