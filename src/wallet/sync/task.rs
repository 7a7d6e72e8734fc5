//! Sync task descriptors.
//!
//! A `SyncTask` describes one unit of synchronization work for one account
//! (or, for prices, one coin) against one data kind. Tasks are values: the
//! queue replaces them wholesale when cursors, retry counters or backoff
//! state move forward.
//!
//! Two tasks are the same logical unit when their `TaskKey`s are equal. The
//! key covers the identity fields only (wallet, coin, parent, custom account,
//! coin group and the kind's own discriminator); module, refresh flag, retry
//! counter, cursors and backoff state are excluded.

use crate::indexer::{ChainAccount, HistoryCursor, PriceTarget};
use crate::wallet::types::CoinGroup;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Discriminant of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
	Balance,
	History,
	Price,
	LatestPrice,
	CustomAccount,
	TxnStatus,
}

impl TaskKind {
	pub const ALL: [TaskKind; 6] = [
		TaskKind::Balance,
		TaskKind::History,
		TaskKind::Price,
		TaskKind::LatestPrice,
		TaskKind::CustomAccount,
		TaskKind::TxnStatus,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			TaskKind::Balance => "balance",
			TaskKind::History => "history",
			TaskKind::Price => "price",
			TaskKind::LatestPrice => "latestPrice",
			TaskKind::CustomAccount => "customAccount",
			TaskKind::TxnStatus => "txnStatus",
		}
	}

	/// Pause window this kind is gated by. Both price kinds hit the same
	/// API and share one window; every other kind has its own.
	pub fn rate_limit_domain(&self) -> RateLimitDomain {
		match self {
			TaskKind::Price | TaskKind::LatestPrice => RateLimitDomain::PriceApi,
			other => RateLimitDomain::Kind(*other),
		}
	}
}

impl fmt::Display for TaskKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitDomain {
	PriceApi,
	Kind(TaskKind),
}

/// Which extended key of a Bitcoin-like account a history task walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XpubBranch {
	Primary,
	Segwit,
}

/// Price history buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceInterval {
	Week,
	Month,
	Year,
}

impl PriceInterval {
	pub const ALL: [PriceInterval; 3] = [PriceInterval::Week, PriceInterval::Month, PriceInterval::Year];

	pub fn days(&self) -> u16 {
		match self {
			PriceInterval::Week => 7,
			PriceInterval::Month => 30,
			PriceInterval::Year => 365,
		}
	}

	/// Spacing of the points the price API returns for this bucket; stored
	/// history younger than this is still current.
	pub fn refresh_age(&self) -> Duration {
		match self {
			PriceInterval::Month => Duration::from_secs(60 * 60),
			PriceInterval::Week | PriceInterval::Year => Duration::from_secs(24 * 60 * 60),
		}
	}
}

/// Who/what a task syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTarget {
	/// Absent for wallet-independent kinds (prices).
	pub wallet_id: Option<String>,
	pub coin_type: String,
	pub parent_coin: Option<String>,
	pub custom_account: Option<String>,
	pub coin_group: CoinGroup,
	pub xpub: Option<String>,
	pub zpub: Option<String>,
}

impl TaskTarget {
	/// Target for a coin-level (wallet independent) task.
	pub fn coin(coin_type: &str, parent_coin: Option<&str>, coin_group: CoinGroup) -> Self {
		Self {
			wallet_id: None,
			coin_type: coin_type.to_string(),
			parent_coin: parent_coin.map(str::to_string),
			custom_account: None,
			coin_group,
			xpub: None,
			zpub: None,
		}
	}

	/// Target for an account-level task.
	pub fn account(wallet_id: &str, coin_type: &str, xpub: &str, coin_group: CoinGroup) -> Self {
		Self {
			wallet_id: Some(wallet_id.to_string()),
			coin_type: coin_type.to_string(),
			parent_coin: None,
			custom_account: None,
			coin_group,
			xpub: Some(xpub.to_string()),
			zpub: None,
		}
	}

	pub fn with_parent(mut self, parent_coin: &str) -> Self {
		self.parent_coin = Some(parent_coin.to_string());
		self
	}

	pub fn with_custom_account(mut self, name: &str) -> Self {
		self.custom_account = Some(name.to_string());
		self
	}

	pub fn with_zpub(mut self, zpub: Option<&str>) -> Self {
		self.zpub = zpub.map(str::to_string);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryState {
	pub branch: XpubBranch,
	pub cursor: HistoryCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusState {
	pub txn_hash: String,
	pub sender: Option<String>,
	pub backoff_factor: u32,
	/// Time left before the check is eligible again.
	pub backoff_time: Duration,
}

/// Kind-specific part of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDetail {
	Balance,
	History(HistoryState),
	Price {
		interval: PriceInterval,
		coin_gecko_id: Option<String>,
	},
	LatestPrice {
		coin_gecko_id: Option<String>,
	},
	CustomAccount,
	TxnStatus(StatusState),
}

/// Origin of a task: the campaign that produced it and whether it was forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
	pub module: String,
	pub is_refresh: bool,
}

impl TaskOptions {
	pub fn new(module: &str, is_refresh: bool) -> Self {
		Self {
			module: module.to_string(),
			is_refresh,
		}
	}
}

impl Default for TaskOptions {
	fn default() -> Self {
		Self::new(super::modules::DEFAULT, false)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
	pub target: TaskTarget,
	pub module: String,
	pub is_refresh: bool,
	pub retries: u32,
	pub detail: TaskDetail,
}

/// Identity key of a task; see the module docs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
	kind: TaskKind,
	wallet_id: Option<String>,
	coin_type: String,
	parent_coin: Option<String>,
	custom_account: Option<String>,
	coin_group: CoinGroup,
	discriminator: KeyDiscriminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyDiscriminator {
	None,
	Branch(XpubBranch),
	Interval(PriceInterval),
	Txn(String),
}

impl SyncTask {
	pub fn new(target: TaskTarget, detail: TaskDetail, options: &TaskOptions) -> Self {
		Self {
			target,
			module: options.module.clone(),
			is_refresh: options.is_refresh,
			retries: 0,
			detail,
		}
	}

	pub fn balance(target: TaskTarget, options: &TaskOptions) -> Self {
		Self::new(target, TaskDetail::Balance, options)
	}

	pub fn history(target: TaskTarget, branch: XpubBranch, cursor: HistoryCursor, options: &TaskOptions) -> Self {
		Self::new(target, TaskDetail::History(HistoryState { branch, cursor }), options)
	}

	pub fn price(
		target: TaskTarget,
		interval: PriceInterval,
		coin_gecko_id: Option<String>,
		options: &TaskOptions,
	) -> Self {
		Self::new(target, TaskDetail::Price { interval, coin_gecko_id }, options)
	}

	pub fn latest_price(target: TaskTarget, coin_gecko_id: Option<String>, options: &TaskOptions) -> Self {
		Self::new(target, TaskDetail::LatestPrice { coin_gecko_id }, options)
	}

	pub fn custom_account(target: TaskTarget, options: &TaskOptions) -> Self {
		Self::new(target, TaskDetail::CustomAccount, options)
	}

	/// Status check that first becomes eligible after `initial_backoff`.
	pub fn txn_status(
		target: TaskTarget,
		txn_hash: &str,
		sender: Option<&str>,
		initial_backoff: Duration,
		options: &TaskOptions,
	) -> Self {
		let state = StatusState {
			txn_hash: txn_hash.to_string(),
			sender: sender.map(str::to_string),
			backoff_factor: 1,
			backoff_time: initial_backoff,
		};
		Self::new(target, TaskDetail::TxnStatus(state), options)
	}

	pub fn kind(&self) -> TaskKind {
		match &self.detail {
			TaskDetail::Balance => TaskKind::Balance,
			TaskDetail::History(_) => TaskKind::History,
			TaskDetail::Price { .. } => TaskKind::Price,
			TaskDetail::LatestPrice { .. } => TaskKind::LatestPrice,
			TaskDetail::CustomAccount => TaskKind::CustomAccount,
			TaskDetail::TxnStatus(_) => TaskKind::TxnStatus,
		}
	}

	pub fn key(&self) -> TaskKey {
		let discriminator = match &self.detail {
			TaskDetail::History(state) => KeyDiscriminator::Branch(state.branch),
			TaskDetail::Price { interval, .. } => KeyDiscriminator::Interval(*interval),
			TaskDetail::TxnStatus(state) => KeyDiscriminator::Txn(state.txn_hash.clone()),
			TaskDetail::Balance | TaskDetail::LatestPrice { .. } | TaskDetail::CustomAccount => {
				KeyDiscriminator::None
			}
		};

		TaskKey {
			kind: self.kind(),
			wallet_id: self.target.wallet_id.clone(),
			coin_type: self.target.coin_type.clone(),
			parent_coin: self.target.parent_coin.clone(),
			custom_account: self.target.custom_account.clone(),
			coin_group: self.target.coin_group,
			discriminator,
		}
	}

	/// Whether `other` describes the same logical unit of work.
	pub fn same_unit(&self, other: &SyncTask) -> bool {
		self.key() == other.key()
	}

	/// Copy of this history task positioned at `cursor`. `None` for other
	/// kinds.
	pub fn with_history_cursor(&self, cursor: HistoryCursor) -> Option<SyncTask> {
		match &self.detail {
			TaskDetail::History(state) => {
				let mut updated = self.clone();
				updated.detail = TaskDetail::History(HistoryState {
					branch: state.branch,
					cursor,
				});
				Some(updated)
			}
			_ => None,
		}
	}

	pub fn status_state(&self) -> Option<&StatusState> {
		match &self.detail {
			TaskDetail::TxnStatus(state) => Some(state),
			_ => None,
		}
	}

	/// Count down a status check's backoff by one tick. Other kinds are
	/// unaffected.
	pub fn elapse_backoff(&mut self, tick: Duration) {
		if let TaskDetail::TxnStatus(state) = &mut self.detail {
			state.backoff_time = state.backoff_time.saturating_sub(tick);
		}
	}

	/// Whether the task may be picked on a tick of length `tick`. Only
	/// status checks carry a backoff; they run once it is within one tick.
	pub fn is_eligible(&self, tick: Duration) -> bool {
		match &self.detail {
			TaskDetail::TxnStatus(state) => state.backoff_time <= tick,
			_ => true,
		}
	}

	/// Account description for chain readers. `None` for coin-level tasks.
	pub fn chain_account(&self) -> Option<ChainAccount> {
		let wallet_id = self.target.wallet_id.clone()?;
		let xpub = self.target.xpub.clone()?;
		let zpub = match &self.detail {
			TaskDetail::History(state) if state.branch == XpubBranch::Segwit => self.target.zpub.clone(),
			TaskDetail::History(_) => None,
			_ => self.target.zpub.clone(),
		};

		Some(ChainAccount {
			wallet_id,
			coin: self.target.coin_type.clone(),
			parent_coin: self.target.parent_coin.clone(),
			xpub,
			zpub,
			custom_account: self.target.custom_account.clone(),
		})
	}

	pub fn price_target(&self) -> PriceTarget {
		let coin_gecko_id = match &self.detail {
			TaskDetail::Price { coin_gecko_id, .. } | TaskDetail::LatestPrice { coin_gecko_id } => {
				coin_gecko_id.clone()
			}
			_ => None,
		};

		PriceTarget {
			slug: self.target.coin_type.clone(),
			parent_coin: self.target.parent_coin.clone(),
			coin_gecko_id,
		}
	}
}

/// Identity fields only; extended keys are never printed.
impl fmt::Display for SyncTask {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.kind(), self.target.coin_type)?;
		if let Some(parent) = &self.target.parent_coin {
			write!(f, " (parent {})", parent)?;
		}
		if let Some(wallet_id) = &self.target.wallet_id {
			write!(f, " wallet={}", wallet_id)?;
		}
		if let Some(account) = &self.target.custom_account {
			write!(f, " account={}", account)?;
		}
		match &self.detail {
			TaskDetail::History(state) => write!(f, " branch={:?} page={}", state.branch, state.cursor.page)?,
			TaskDetail::Price { interval, .. } => write!(f, " days={}", interval.days())?,
			TaskDetail::TxnStatus(state) => write!(f, " txn={}", state.txn_hash)?,
			_ => {}
		}
		write!(f, " module={} retries={}", self.module, self.retries)
	}
}
