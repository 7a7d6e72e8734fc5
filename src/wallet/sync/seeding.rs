//! Task derivation.
//!
//! `TaskFactory` turns wallet entities (coins, tokens, pending transactions)
//! into sync tasks following each chain family's rules. It never touches the
//! queue: callers enqueue what it returns.
//!
//! Per-entity functions skip unknown slugs with a warning and report a
//! missing parent coin as an error. Campaign functions (`*_refresh_tasks`,
//! `resync_tasks`) log those per-entity problems and carry on with the rest.

use super::modules;
use super::repositories::{TopTransactionQuery, WalletStore};
use super::task::{PriceInterval, SyncTask, TaskOptions, TaskTarget, XpubBranch};
use crate::indexer::HistoryCursor;
use crate::wallet::coins::{CoinData, CoinRegistry};
use crate::wallet::types::{Coin, CoinGroup, Token, Transaction, WalletSyncError};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Confirmations a Bitcoin-like transaction needs before history sync
/// resumes after it.
const BTC_MIN_CONFIRMATIONS: u64 = 6;

/// Branch label stored on Bitcoin-like transactions.
pub fn branch_label(branch: XpubBranch) -> &'static str {
	match branch {
		XpubBranch::Primary => "primary",
		XpubBranch::Segwit => "segwit",
	}
}

pub struct TaskFactory {
	registry: Arc<CoinRegistry>,
	store: Arc<dyn WalletStore>,
	/// Initial wait of a fresh status check
	status_backoff_base: Duration,
}

impl TaskFactory {
	pub fn new(registry: Arc<CoinRegistry>, store: Arc<dyn WalletStore>, status_backoff_base: Duration) -> Self {
		Self {
			registry,
			store,
			status_backoff_base,
		}
	}

	fn lookup(&self, slug: &str, parent: Option<&str>) -> Option<&CoinData> {
		let data = self.registry.resolve(slug, parent);
		if data.is_none() {
			warn!("Skipping unknown coin {} (parent {:?})", slug, parent);
		}
		data
	}

	fn coin_target(coin: &Coin, group: CoinGroup) -> TaskTarget {
		TaskTarget::account(&coin.wallet_id, &coin.slug, &coin.xpub, group).with_zpub(coin.zpub.as_deref())
	}

	/// Custom-account discovery; Near only.
	pub fn custom_account_tasks(&self, coin: &Coin, options: &TaskOptions) -> Vec<SyncTask> {
		match self.lookup(&coin.slug, None) {
			Some(data) if data.group == CoinGroup::Near => {
				vec![SyncTask::custom_account(Self::coin_target(coin, data.group), options)]
			}
			_ => Vec::new(),
		}
	}

	/// Balance tasks for a coin account. Bitcoin-like balances arrive with
	/// history, so those coins get their history tasks instead.
	pub async fn balance_tasks(&self, coin: &Coin, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let Some(data) = self.lookup(&coin.slug, None) else {
			return Ok(Vec::new());
		};

		let target = Self::coin_target(coin, data.group);
		match data.group {
			CoinGroup::Ethereum | CoinGroup::Solana => Ok(vec![SyncTask::balance(target, options)]),
			CoinGroup::Near => Ok(self
				.store
				.custom_accounts(&coin.wallet_id, &coin.slug)
				.await?
				.iter()
				.map(|account| SyncTask::balance(target.clone().with_custom_account(&account.name), options))
				.collect()),
			CoinGroup::BitcoinForks => self.history_tasks(coin, options).await,
			CoinGroup::Erc20Tokens => Ok(Vec::new()),
		}
	}

	/// Balance task for a token, read through its parent coin account.
	pub fn token_balance_task(&self, token: &Token, parent: &Coin, options: &TaskOptions) -> SyncTask {
		let target = TaskTarget::account(&token.wallet_id, &token.slug, &parent.xpub, CoinGroup::Erc20Tokens)
			.with_parent(&parent.slug);
		SyncTask::balance(target, options)
	}

	/// History tasks for a coin account, positioned after what the store
	/// already holds.
	pub async fn history_tasks(&self, coin: &Coin, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let Some(data) = self.lookup(&coin.slug, None) else {
			return Ok(Vec::new());
		};

		let target = Self::coin_target(coin, data.group);
		let base_query = TopTransactionQuery {
			wallet_id: coin.wallet_id.clone(),
			slug: coin.slug.clone(),
			..Default::default()
		};

		let mut tasks = Vec::new();
		match data.group {
			CoinGroup::BitcoinForks => {
				let mut branches = vec![XpubBranch::Primary];
				if coin.zpub.is_some() {
					branches.push(XpubBranch::Segwit);
				}
				for branch in branches {
					let after_block = self
						.store
						.top_block(&TopTransactionQuery {
							wallet_branch: Some(branch_label(branch).to_string()),
							min_confirmations: BTC_MIN_CONFIRMATIONS,
							..base_query.clone()
						})
						.await?;
					let cursor = HistoryCursor {
						after_block,
						..HistoryCursor::first_page()
					};
					tasks.push(SyncTask::history(target.clone(), branch, cursor, options));
				}
			}
			CoinGroup::Ethereum => {
				let after_block = self
					.store
					.top_block(&TopTransactionQuery {
						token_transfers: Some(false),
						..base_query.clone()
					})
					.await?;
				let after_token_block = self
					.store
					.top_block(&TopTransactionQuery {
						token_transfers: Some(true),
						..base_query.clone()
					})
					.await?;
				let cursor = HistoryCursor {
					after_block,
					after_token_block,
					..HistoryCursor::first_page()
				};
				tasks.push(SyncTask::history(target, XpubBranch::Primary, cursor, options));
			}
			CoinGroup::Near => {
				for account in self.store.custom_accounts(&coin.wallet_id, &coin.slug).await? {
					let after_block = self
						.store
						.top_block(&TopTransactionQuery {
							custom_account: Some(account.name.clone()),
							..base_query.clone()
						})
						.await?;
					let cursor = HistoryCursor {
						after_block,
						..HistoryCursor::first_page()
					};
					tasks.push(SyncTask::history(
						target.clone().with_custom_account(&account.name),
						XpubBranch::Primary,
						cursor,
						options,
					));
				}
			}
			CoinGroup::Solana => {
				let after_hash = self.store.top_hash(&base_query).await?;
				let cursor = HistoryCursor {
					after_hash,
					..HistoryCursor::first_page()
				};
				tasks.push(SyncTask::history(target, XpubBranch::Primary, cursor, options));
			}
			CoinGroup::Erc20Tokens => {}
		}

		Ok(tasks)
	}

	/// Price history buckets that are missing or stale. Test-net coins have
	/// no price.
	pub async fn price_tasks(
		&self,
		slug: &str,
		parent: Option<&str>,
		options: &TaskOptions,
	) -> Result<Vec<SyncTask>, WalletSyncError> {
		let Some(data) = self.lookup(slug, parent) else {
			return Ok(Vec::new());
		};
		if data.is_test {
			return Ok(Vec::new());
		}

		let now_ms = Utc::now().timestamp_millis();
		let mut tasks = Vec::new();
		for interval in PriceInterval::ALL {
			if interval == PriceInterval::Week && data.coin_gecko_id.is_some() {
				continue;
			}

			if let Some(history) = self.store.price_history(&data.abbr, interval.days()).await? {
				let refresh_ms = interval.refresh_age().as_millis() as i64;
				let fresh = history.data.len() > 2
					&& history
						.data
						.last()
						.is_some_and(|(latest_ms, _)| latest_ms + refresh_ms > now_ms);
				if fresh {
					debug!("Price history for {} ({} days) is current", data.abbr, interval.days());
					continue;
				}
			}

			let target = TaskTarget::coin(&data.abbr, parent, data.group);
			tasks.push(SyncTask::price(target, interval, data.coin_gecko_id.clone(), options));
		}

		Ok(tasks)
	}

	pub fn latest_price_task(&self, slug: &str, parent: Option<&str>, options: &TaskOptions) -> Option<SyncTask> {
		let data = self.lookup(slug, parent)?;
		if data.is_test {
			return None;
		}
		let target = TaskTarget::coin(&data.abbr, parent, data.group);
		Some(SyncTask::latest_price(target, data.coin_gecko_id.clone(), options))
	}

	/// Status check for a broadcast transaction.
	pub async fn status_task(&self, txn: &Transaction, options: &TaskOptions) -> Result<SyncTask, WalletSyncError> {
		let data = self
			.registry
			.resolve(&txn.slug, txn.coin.as_deref())
			.ok_or_else(|| WalletSyncError::UnknownCoin(txn.slug.clone()))?;

		let account_slug = txn.coin_slug();
		let coin = self
			.store
			.coin(&txn.wallet_id, account_slug)
			.await?
			.ok_or_else(|| WalletSyncError::MissingParentCoin {
				wallet_id: txn.wallet_id.clone(),
				parent: account_slug.to_string(),
			})?;

		let mut target =
			TaskTarget::account(&txn.wallet_id, &txn.slug, &coin.xpub, data.group).with_zpub(coin.zpub.as_deref());
		if let Some(parent) = &txn.coin {
			target = target.with_parent(parent);
		}
		if let Some(account) = &txn.custom_account {
			target = target.with_custom_account(account);
		}

		Ok(SyncTask::txn_status(
			target,
			&txn.hash,
			txn.sender.as_deref(),
			self.status_backoff_base,
			options,
		))
	}

	/// Tasks that resume normal sync for an account once one of its
	/// transactions settled. Tokens refresh their own balance and the parent
	/// chain's history.
	pub async fn status_follow_ups(&self, task: &SyncTask) -> Result<Vec<SyncTask>, WalletSyncError> {
		let Some(wallet_id) = task.target.wallet_id.as_deref() else {
			return Ok(Vec::new());
		};
		let options = TaskOptions::default();
		let account_slug = task.target.parent_coin.as_deref().unwrap_or(&task.target.coin_type);
		let coin = self
			.store
			.coin(wallet_id, account_slug)
			.await?
			.ok_or_else(|| WalletSyncError::MissingParentCoin {
				wallet_id: wallet_id.to_string(),
				parent: account_slug.to_string(),
			})?;

		let mut tasks = Vec::new();
		match &task.target.parent_coin {
			Some(_) => {
				let token = Token {
					wallet_id: wallet_id.to_string(),
					slug: task.target.coin_type.clone(),
					coin: coin.slug.clone(),
				};
				tasks.push(self.token_balance_task(&token, &coin, &options));
			}
			None => tasks.extend(self.balance_tasks(&coin, &options).await?),
		}
		tasks.extend(self.history_tasks(&coin, &options).await?);
		Ok(tasks)
	}

	/// Everything a freshly added coin needs.
	pub async fn coin_tasks(&self, coin: &Coin, module: &str) -> Vec<SyncTask> {
		let options = TaskOptions::new(module, true);
		let mut tasks = self.custom_account_tasks(coin, &options);

		let derived = [
			self.balance_tasks(coin, &options).await,
			self.history_tasks(coin, &options).await,
			self.price_tasks(&coin.slug, None, &options).await,
		];
		for result in derived {
			match result {
				Ok(derived) => tasks.extend(derived),
				Err(e) => error!("Failed to derive tasks for {}/{}: {}", coin.wallet_id, coin.slug, e),
			}
		}

		tasks.extend(self.latest_price_task(&coin.slug, None, &options));
		tasks
	}

	/// Everything a freshly added token needs.
	pub async fn token_tasks(
		&self,
		wallet_id: &str,
		token_slug: &str,
		parent_slug: &str,
	) -> Result<Vec<SyncTask>, WalletSyncError> {
		let parent = self
			.store
			.coin(wallet_id, parent_slug)
			.await?
			.ok_or_else(|| WalletSyncError::MissingParentCoin {
				wallet_id: wallet_id.to_string(),
				parent: parent_slug.to_string(),
			})?;

		let options = TaskOptions::new(modules::DEFAULT, true);
		let token = Token {
			wallet_id: wallet_id.to_string(),
			slug: token_slug.to_string(),
			coin: parent_slug.to_string(),
		};

		let mut tasks = vec![self.token_balance_task(&token, &parent, &options)];
		tasks.extend(self.price_tasks(token_slug, Some(parent_slug), &options).await?);
		tasks.extend(self.latest_price_task(token_slug, Some(parent_slug), &options));
		Ok(tasks)
	}

	pub async fn custom_account_refresh_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		Ok(self
			.store
			.coins()
			.await?
			.iter()
			.flat_map(|coin| self.custom_account_tasks(coin, options))
			.collect())
	}

	pub async fn balance_refresh_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let mut tasks = Vec::new();
		for coin in self.store.coins().await? {
			match self.balance_tasks(&coin, options).await {
				Ok(derived) => tasks.extend(derived),
				Err(e) => error!("Failed to derive balance tasks for {}/{}: {}", coin.wallet_id, coin.slug, e),
			}
		}

		for token in self.store.tokens().await? {
			match self.store.coin(&token.wallet_id, &token.coin).await {
				Ok(Some(parent)) => tasks.push(self.token_balance_task(&token, &parent, options)),
				Ok(None) => warn!(
					"Parent coin {} missing for token {} in wallet {}",
					token.coin, token.slug, token.wallet_id
				),
				Err(e) => error!("Failed to look up parent coin {}: {}", token.coin, e),
			}
		}

		Ok(tasks)
	}

	pub async fn history_refresh_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let mut tasks = Vec::new();
		for coin in self.store.coins().await? {
			match self.history_tasks(&coin, options).await {
				Ok(derived) => tasks.extend(derived),
				Err(e) => error!("Failed to derive history tasks for {}/{}: {}", coin.wallet_id, coin.slug, e),
			}
		}
		Ok(tasks)
	}

	pub async fn price_refresh_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let mut tasks = Vec::new();
		for (slug, parent) in self.priced_coins().await? {
			match self.price_tasks(&slug, parent.as_deref(), options).await {
				Ok(derived) => tasks.extend(derived),
				Err(e) => error!("Failed to derive price tasks for {}: {}", slug, e),
			}
		}
		Ok(tasks)
	}

	pub async fn latest_price_refresh_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		Ok(self
			.priced_coins()
			.await?
			.iter()
			.filter_map(|(slug, parent)| self.latest_price_task(slug, parent.as_deref(), options))
			.collect())
	}

	/// `(slug, parent)` of every coin and token held by any wallet.
	async fn priced_coins(&self) -> Result<Vec<(String, Option<String>)>, WalletSyncError> {
		let mut coins: Vec<(String, Option<String>)> =
			self.store.coins().await?.into_iter().map(|c| (c.slug, None)).collect();
		coins.extend(self.store.tokens().await?.into_iter().map(|t| (t.slug, Some(t.coin))));
		coins.sort();
		coins.dedup();
		Ok(coins)
	}

	/// Full resync of every account: custom accounts, balances, history,
	/// price history and latest prices.
	pub async fn resync_tasks(&self, options: &TaskOptions) -> Result<Vec<SyncTask>, WalletSyncError> {
		let mut tasks = self.custom_account_refresh_tasks(options).await?;
		tasks.extend(self.balance_refresh_tasks(options).await?);
		tasks.extend(self.history_refresh_tasks(options).await?);
		tasks.extend(self.price_refresh_tasks(options).await?);
		tasks.extend(self.latest_price_refresh_tasks(options).await?);
		Ok(tasks)
	}

	/// Status checks for every pending transaction in the store.
	pub async fn pending_status_tasks(&self) -> Result<Vec<SyncTask>, WalletSyncError> {
		let options = TaskOptions::new(modules::REFRESH, true);
		let mut tasks = Vec::new();
		for txn in self.store.pending_transactions().await? {
			match self.status_task(&txn, &options).await {
				Ok(task) => tasks.push(task),
				Err(e) => warn!("Skipping status check for {}: {}", txn.hash, e),
			}
		}
		Ok(tasks)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::sync::repositories::InMemoryWalletStore;
	use crate::wallet::sync::task::{TaskDetail, TaskKind};
	use crate::wallet::types::{CustomAccount, PriceHistory, TxnStatus};

	fn coin(slug: &str, zpub: Option<&str>) -> Coin {
		Coin {
			wallet_id: "w1".into(),
			slug: slug.into(),
			xpub: format!("xpub-{}", slug),
			zpub: zpub.map(str::to_string),
		}
	}

	fn txn(hash: &str, slug: &str, parent: Option<&str>, branch: Option<&str>, block: u64) -> Transaction {
		Transaction {
			hash: hash.into(),
			wallet_id: "w1".into(),
			slug: slug.into(),
			coin: parent.map(str::to_string),
			custom_account: None,
			wallet_branch: branch.map(str::to_string),
			status: TxnStatus::Success,
			block_height: Some(block),
			confirmations: 10,
			is_token_transfer: false,
			sender: None,
			amount: "1".into(),
			confirmed_at: None,
			created_at: Utc::now(),
		}
	}

	fn factory(store: Arc<InMemoryWalletStore>) -> TaskFactory {
		TaskFactory::new(Arc::new(CoinRegistry::builtin()), store, Duration::from_secs(10))
	}

	#[tokio::test]
	async fn test_bitcoin_history_per_branch() {
		let store = Arc::new(InMemoryWalletStore::new());
		store.add_transaction(txn("a", "btc", None, Some("primary"), 700)).await;
		store.add_transaction(txn("b", "btc", None, Some("segwit"), 750)).await;
		let factory = factory(store);

		let btc = coin("btc", Some("zpub-btc"));
		let tasks = factory.history_tasks(&btc, &TaskOptions::default()).await.unwrap();
		assert_eq!(tasks.len(), 2);
		assert!(!tasks[0].same_unit(&tasks[1]));

		let blocks: Vec<_> = tasks
			.iter()
			.map(|t| match &t.detail {
				TaskDetail::History(state) => (state.branch, state.cursor.after_block, state.cursor.page),
				_ => panic!("expected history"),
			})
			.collect();
		assert_eq!(
			blocks,
			vec![(XpubBranch::Primary, Some(700), 1), (XpubBranch::Segwit, Some(750), 1)]
		);

		// Bitcoin-like balances come from the history tasks.
		let balance = factory.balance_tasks(&btc, &TaskOptions::default()).await.unwrap();
		assert!(balance.iter().all(|t| t.kind() == TaskKind::History));
	}

	#[tokio::test]
	async fn test_near_tasks_per_custom_account() {
		let store = Arc::new(InMemoryWalletStore::new());
		for name in ["alice.near", "bob.near"] {
			store
				.add_custom_account(CustomAccount {
					wallet_id: "w1".into(),
					coin: "near".into(),
					name: name.into(),
				})
				.await;
		}
		let factory = factory(store);
		let near = coin("near", None);
		let options = TaskOptions::default();

		let balances = factory.balance_tasks(&near, &options).await.unwrap();
		let accounts: Vec<_> = balances
			.iter()
			.map(|t| t.target.custom_account.clone().unwrap())
			.collect();
		assert_eq!(accounts, vec!["alice.near", "bob.near"]);
		assert_eq!(factory.history_tasks(&near, &options).await.unwrap().len(), 2);
		assert_eq!(factory.custom_account_tasks(&near, &options).len(), 1);
		assert!(factory.custom_account_tasks(&coin("eth", None), &options).is_empty());
	}

	#[tokio::test]
	async fn test_price_buckets_skip_fresh_and_week_with_id() {
		let store = Arc::new(InMemoryWalletStore::new());
		let now = Utc::now().timestamp_millis();
		store
			.upsert_price_history(PriceHistory {
				slug: "btc".into(),
				interval_days: 30,
				data: vec![(now - 3_000_000, 1.0), (now - 2_000_000, 2.0), (now - 1_000_000, 3.0)],
			})
			.await
			.unwrap();
		let factory = factory(store);
		let options = TaskOptions::default();

		let tasks = factory.price_tasks("btc", None, &options).await.unwrap();
		let days: Vec<_> = tasks
			.iter()
			.map(|t| match &t.detail {
				TaskDetail::Price { interval, .. } => interval.days(),
				_ => panic!("expected price"),
			})
			.collect();
		assert_eq!(days, vec![365]);

		assert!(factory.price_tasks("btct", None, &options).await.unwrap().is_empty());
		assert!(factory.price_tasks("unknown", None, &options).await.unwrap().is_empty());
		assert!(factory.latest_price_task("btct", None, &options).is_none());

		let token = factory.latest_price_task("usdt", Some("eth"), &options).unwrap();
		assert_eq!(token.target.parent_coin.as_deref(), Some("eth"));
		assert_eq!(token.price_target().api_id(), "tether");
	}

	#[tokio::test]
	async fn test_token_tasks_require_parent() {
		let store = Arc::new(InMemoryWalletStore::new());
		let factory = factory(store.clone());

		let missing = factory.token_tasks("w1", "usdt", "eth").await;
		assert!(matches!(missing, Err(WalletSyncError::MissingParentCoin { .. })));

		store.add_coin(coin("eth", None)).await;
		let tasks = factory.token_tasks("w1", "usdt", "eth").await.unwrap();
		let kinds: Vec<_> = tasks.iter().map(|t| t.kind()).collect();
		assert_eq!(
			kinds,
			vec![TaskKind::Balance, TaskKind::Price, TaskKind::Price, TaskKind::LatestPrice]
		);
		assert!(tasks.iter().all(|t| t.is_refresh));
	}

	#[tokio::test]
	async fn test_resync_tolerates_unknown_and_orphans() {
		let store = Arc::new(InMemoryWalletStore::new());
		store.add_coin(coin("eth", None)).await;
		store.add_coin(coin("not-a-coin", None)).await;
		store
			.add_token(Token {
				wallet_id: "w2".into(),
				slug: "usdt".into(),
				coin: "eth".into(),
			})
			.await;
		let factory = factory(store);

		let tasks = factory
			.resync_tasks(&TaskOptions::new(modules::INITIAL_RESYNC, false))
			.await
			.unwrap();

		assert!(tasks.iter().all(|t| t.target.coin_type != "not-a-coin"));
		assert!(tasks.iter().any(|t| t.kind() == TaskKind::Balance && t.target.coin_type == "eth"));
		assert!(tasks.iter().any(|t| t.kind() == TaskKind::History));
		// The token's wallet has no eth account, so only its prices are seeded.
		assert!(!tasks
			.iter()
			.any(|t| t.kind() == TaskKind::Balance && t.target.coin_type == "usdt"));
		assert!(tasks
			.iter()
			.any(|t| t.kind() == TaskKind::LatestPrice && t.target.coin_type == "usdt"));
		assert!(tasks.iter().all(|t| t.module == modules::INITIAL_RESYNC));
	}

	#[tokio::test]
	async fn test_status_follow_ups_for_token() {
		let store = Arc::new(InMemoryWalletStore::new());
		store.add_coin(coin("eth", None)).await;
		let factory = factory(store);

		let pending = Transaction {
			status: TxnStatus::Pending,
			..txn("0xabc", "usdt", Some("eth"), None, 1)
		};
		let status = factory.status_task(&pending, &TaskOptions::default()).await.unwrap();
		assert_eq!(status.status_state().unwrap().backoff_time, Duration::from_secs(10));

		let follow_ups = factory.status_follow_ups(&status).await.unwrap();
		let summary: Vec<_> = follow_ups
			.iter()
			.map(|t| (t.kind(), t.target.coin_type.as_str(), t.target.parent_coin.as_deref()))
			.collect();
		assert_eq!(
			summary,
			vec![
				(TaskKind::Balance, "usdt", Some("eth")),
				(TaskKind::History, "eth", None),
			]
		);
	}
}
