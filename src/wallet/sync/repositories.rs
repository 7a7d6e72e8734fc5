use crate::indexer::{BalanceReport, ChainTxnStatus, TxnStatusReport};
use crate::wallet::types::{Coin, CustomAccount, PriceHistory, Token, Transaction, TxnStatus, WalletSyncError};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Filter for the newest confirmed transaction of an account.
///
/// Failed and pending transactions never count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopTransactionQuery {
	pub wallet_id: String,
	pub slug: String,
	pub wallet_branch: Option<String>,
	pub custom_account: Option<String>,
	/// Restrict to token transfers (`Some(true)`) or native transfers
	pub token_transfers: Option<bool>,
	pub min_confirmations: u64,
}

/// Address of a stored balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceKey {
	pub wallet_id: String,
	pub slug: String,
	pub parent_coin: Option<String>,
	pub custom_account: Option<String>,
}

/// Coin, token, transaction, price and custom-account persistence.
///
/// Every write is an upsert, so re-running a sync task is harmless.
#[async_trait::async_trait]
pub trait WalletStore: Send + Sync {
	async fn coins(&self) -> Result<Vec<Coin>, WalletSyncError>;
	async fn coin(&self, wallet_id: &str, slug: &str) -> Result<Option<Coin>, WalletSyncError>;
	async fn tokens(&self) -> Result<Vec<Token>, WalletSyncError>;
	async fn custom_accounts(&self, wallet_id: &str, coin: &str) -> Result<Vec<CustomAccount>, WalletSyncError>;
	async fn pending_transactions(&self) -> Result<Vec<Transaction>, WalletSyncError>;

	/// Block height of the newest transaction matching `query`.
	async fn top_block(&self, query: &TopTransactionQuery) -> Result<Option<u64>, WalletSyncError>;
	/// Hash of the newest transaction matching `query`.
	async fn top_hash(&self, query: &TopTransactionQuery) -> Result<Option<String>, WalletSyncError>;

	async fn price_history(&self, slug: &str, interval_days: u16) -> Result<Option<PriceHistory>, WalletSyncError>;

	async fn upsert_balance(&self, key: BalanceKey, balance: BalanceReport) -> Result<(), WalletSyncError>;
	async fn insert_transactions(&self, transactions: Vec<Transaction>) -> Result<(), WalletSyncError>;
	async fn update_txn_status(
		&self,
		wallet_id: &str,
		hash: &str,
		report: &TxnStatusReport,
	) -> Result<(), WalletSyncError>;
	async fn upsert_price_history(&self, history: PriceHistory) -> Result<(), WalletSyncError>;
	async fn upsert_latest_price(&self, slug: &str, parent_coin: Option<&str>, price: f64) -> Result<(), WalletSyncError>;
	async fn upsert_custom_accounts(
		&self,
		wallet_id: &str,
		coin: &str,
		names: Vec<String>,
	) -> Result<(), WalletSyncError>;

	/// Mark pending transactions created before `created_before` as failed.
	/// Returns how many were changed.
	async fn fail_expired_transactions(&self, created_before: DateTime<Utc>) -> Result<usize, WalletSyncError>;
}

#[derive(Debug, Default)]
struct StoreState {
	coins: Vec<Coin>,
	tokens: Vec<Token>,
	custom_accounts: Vec<CustomAccount>,
	transactions: Vec<Transaction>,
	balances: HashMap<BalanceKey, BalanceReport>,
	price_history: HashMap<(String, u16), PriceHistory>,
	latest_prices: HashMap<String, f64>,
}

/// In-memory implementation of `WalletStore`
#[derive(Debug, Default)]
pub struct InMemoryWalletStore {
	state: RwLock<StoreState>,
}

fn price_key(slug: &str, parent_coin: Option<&str>) -> String {
	match parent_coin {
		Some(parent) => format!("{}/{}", parent, slug),
		None => slug.to_string(),
	}
}

impl InMemoryWalletStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn add_coin(&self, coin: Coin) {
		self.state.write().await.coins.push(coin);
	}

	pub async fn add_token(&self, token: Token) {
		self.state.write().await.tokens.push(token);
	}

	pub async fn add_custom_account(&self, account: CustomAccount) {
		self.state.write().await.custom_accounts.push(account);
	}

	pub async fn add_transaction(&self, transaction: Transaction) {
		self.state.write().await.transactions.push(transaction);
	}

	pub async fn balance(&self, key: &BalanceKey) -> Option<BalanceReport> {
		self.state.read().await.balances.get(key).cloned()
	}

	pub async fn latest_price(&self, slug: &str, parent_coin: Option<&str>) -> Option<f64> {
		self.state.read().await.latest_prices.get(&price_key(slug, parent_coin)).copied()
	}

	pub async fn transactions(&self, wallet_id: &str) -> Vec<Transaction> {
		self.state
			.read()
			.await
			.transactions
			.iter()
			.filter(|t| t.wallet_id == wallet_id)
			.cloned()
			.collect()
	}

	fn top_transaction<'a>(state: &'a StoreState, query: &TopTransactionQuery) -> Option<&'a Transaction> {
		state
			.transactions
			.iter()
			.filter(|t| t.wallet_id == query.wallet_id && t.slug == query.slug)
			.filter(|t| query.wallet_branch.is_none() || t.wallet_branch == query.wallet_branch)
			.filter(|t| query.custom_account.is_none() || t.custom_account == query.custom_account)
			.filter(|t| query.token_transfers.is_none_or(|token| t.is_token_transfer == token))
			.filter(|t| t.status == TxnStatus::Success && t.confirmations >= query.min_confirmations)
			.max_by_key(|t| (t.block_height, t.confirmed_at))
	}
}

#[async_trait::async_trait]
impl WalletStore for InMemoryWalletStore {
	async fn coins(&self) -> Result<Vec<Coin>, WalletSyncError> {
		Ok(self.state.read().await.coins.clone())
	}

	async fn coin(&self, wallet_id: &str, slug: &str) -> Result<Option<Coin>, WalletSyncError> {
		Ok(self
			.state
			.read()
			.await
			.coins
			.iter()
			.find(|c| c.wallet_id == wallet_id && c.slug == slug)
			.cloned())
	}

	async fn tokens(&self) -> Result<Vec<Token>, WalletSyncError> {
		Ok(self.state.read().await.tokens.clone())
	}

	async fn custom_accounts(&self, wallet_id: &str, coin: &str) -> Result<Vec<CustomAccount>, WalletSyncError> {
		Ok(self
			.state
			.read()
			.await
			.custom_accounts
			.iter()
			.filter(|a| a.wallet_id == wallet_id && a.coin == coin)
			.cloned()
			.collect())
	}

	async fn pending_transactions(&self) -> Result<Vec<Transaction>, WalletSyncError> {
		Ok(self
			.state
			.read()
			.await
			.transactions
			.iter()
			.filter(|t| t.status == TxnStatus::Pending)
			.cloned()
			.collect())
	}

	async fn top_block(&self, query: &TopTransactionQuery) -> Result<Option<u64>, WalletSyncError> {
		let state = self.state.read().await;
		Ok(Self::top_transaction(&state, query).and_then(|t| t.block_height))
	}

	async fn top_hash(&self, query: &TopTransactionQuery) -> Result<Option<String>, WalletSyncError> {
		let state = self.state.read().await;
		Ok(Self::top_transaction(&state, query).map(|t| t.hash.clone()))
	}

	async fn price_history(&self, slug: &str, interval_days: u16) -> Result<Option<PriceHistory>, WalletSyncError> {
		Ok(self
			.state
			.read()
			.await
			.price_history
			.get(&(slug.to_string(), interval_days))
			.cloned())
	}

	async fn upsert_balance(&self, key: BalanceKey, balance: BalanceReport) -> Result<(), WalletSyncError> {
		debug!("Storing balance {} for {}/{}", balance.balance, key.wallet_id, key.slug);
		self.state.write().await.balances.insert(key, balance);
		Ok(())
	}

	async fn insert_transactions(&self, transactions: Vec<Transaction>) -> Result<(), WalletSyncError> {
		let mut state = self.state.write().await;
		for txn in transactions {
			let existing = state
				.transactions
				.iter()
				.position(|t| t.wallet_id == txn.wallet_id && t.hash == txn.hash && t.slug == txn.slug);
			match existing {
				Some(index) => state.transactions[index] = txn,
				None => state.transactions.push(txn),
			}
		}
		Ok(())
	}

	async fn update_txn_status(
		&self,
		wallet_id: &str,
		hash: &str,
		report: &TxnStatusReport,
	) -> Result<(), WalletSyncError> {
		let status = match report.status {
			ChainTxnStatus::Pending => TxnStatus::Pending,
			ChainTxnStatus::Success => TxnStatus::Success,
			ChainTxnStatus::Failed => TxnStatus::Failed,
		};

		let mut state = self.state.write().await;
		for row in state
			.transactions
			.iter_mut()
			.filter(|t| t.wallet_id == wallet_id && t.hash == hash)
		{
			row.status = status;
			row.confirmations = report.confirmations;
			if report.block_height.is_some() {
				row.block_height = report.block_height;
			}
			if report.is_terminal() && row.confirmed_at.is_none() {
				row.confirmed_at = Some(Utc::now());
			}
		}
		Ok(())
	}

	async fn upsert_price_history(&self, history: PriceHistory) -> Result<(), WalletSyncError> {
		self.state
			.write()
			.await
			.price_history
			.insert((history.slug.clone(), history.interval_days), history);
		Ok(())
	}

	async fn upsert_latest_price(&self, slug: &str, parent_coin: Option<&str>, price: f64) -> Result<(), WalletSyncError> {
		self.state
			.write()
			.await
			.latest_prices
			.insert(price_key(slug, parent_coin), price);
		Ok(())
	}

	async fn upsert_custom_accounts(
		&self,
		wallet_id: &str,
		coin: &str,
		names: Vec<String>,
	) -> Result<(), WalletSyncError> {
		let mut state = self.state.write().await;
		for name in names {
			let known = state
				.custom_accounts
				.iter()
				.any(|a| a.wallet_id == wallet_id && a.coin == coin && a.name == name);
			if !known {
				state.custom_accounts.push(CustomAccount {
					wallet_id: wallet_id.to_string(),
					coin: coin.to_string(),
					name,
				});
			}
		}
		Ok(())
	}

	async fn fail_expired_transactions(&self, created_before: DateTime<Utc>) -> Result<usize, WalletSyncError> {
		let mut state = self.state.write().await;
		let mut failed = 0;
		for row in state
			.transactions
			.iter_mut()
			.filter(|t| t.status == TxnStatus::Pending && t.created_at < created_before)
		{
			row.status = TxnStatus::Failed;
			failed += 1;
		}
		if failed > 0 {
			info!("Marked {} expired pending transactions as failed", failed);
		}
		Ok(failed)
	}
}
