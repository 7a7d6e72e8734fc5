//! Coin registry.
//!
//! Static metadata for every supported coin: ticker, chain family, price-API
//! id, test-net flag and, for parent chains, the tokens they carry. Seeding
//! consults the registry to decide which tasks a coin gets; slugs that are
//! not in the registry are skipped with a warning.

use crate::wallet::types::CoinGroup;

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct CoinData {
	pub abbr: String,
	pub name: String,
	pub group: CoinGroup,
	pub coin_gecko_id: Option<String>,
	pub is_test: bool,
	pub decimals: u32,
	/// Tokens keyed by slug. Only populated for parent chains.
	pub tokens: HashMap<String, CoinData>,
}

impl CoinData {
	fn new(abbr: &str, name: &str, group: CoinGroup, coin_gecko_id: Option<&str>, decimals: u32) -> Self {
		Self {
			abbr: abbr.to_string(),
			name: name.to_string(),
			group,
			coin_gecko_id: coin_gecko_id.map(str::to_string),
			is_test: false,
			decimals,
			tokens: HashMap::new(),
		}
	}

	fn test_net(mut self) -> Self {
		self.is_test = true;
		self
	}

	fn with_token(mut self, token: CoinData) -> Self {
		self.tokens.insert(token.abbr.clone(), token);
		self
	}
}

#[derive(Debug, Clone, Default)]
pub struct CoinRegistry {
	coins: HashMap<String, CoinData>,
}

impl CoinRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with the coins the wallet ships with.
	pub fn builtin() -> Self {
		let erc20 = |abbr: &str, name: &str, id: &str, decimals: u32| {
			CoinData::new(abbr, name, CoinGroup::Erc20Tokens, Some(id), decimals)
		};

		Self::new()
			.with_coin(CoinData::new("btc", "Bitcoin", CoinGroup::BitcoinForks, Some("bitcoin"), 8))
			.with_coin(CoinData::new("btct", "Bitcoin Testnet", CoinGroup::BitcoinForks, None, 8).test_net())
			.with_coin(CoinData::new("ltc", "Litecoin", CoinGroup::BitcoinForks, Some("litecoin"), 8))
			.with_coin(CoinData::new("doge", "Dogecoin", CoinGroup::BitcoinForks, Some("dogecoin"), 8))
			.with_coin(CoinData::new("dash", "Dash", CoinGroup::BitcoinForks, Some("dash"), 8))
			.with_coin(
				CoinData::new("eth", "Ethereum", CoinGroup::Ethereum, Some("ethereum"), 18)
					.with_token(erc20("usdt", "Tether", "tether", 6))
					.with_token(erc20("usdc", "USD Coin", "usd-coin", 6))
					.with_token(erc20("link", "Chainlink", "chainlink", 18)),
			)
			.with_coin(
				CoinData::new("matic", "Polygon", CoinGroup::Ethereum, Some("matic-network"), 18)
					.with_token(erc20("usdt", "Tether", "tether", 6)),
			)
			.with_coin(CoinData::new("near", "Near", CoinGroup::Near, Some("near"), 24))
			.with_coin(CoinData::new("sol", "Solana", CoinGroup::Solana, Some("solana"), 9))
	}

	pub fn with_coin(mut self, coin: CoinData) -> Self {
		self.coins.insert(coin.abbr.clone(), coin);
		self
	}

	pub fn get(&self, slug: &str) -> Option<&CoinData> {
		self.coins.get(slug)
	}

	/// Look up a token through its parent chain's token list.
	pub fn token(&self, parent: &str, slug: &str) -> Option<&CoinData> {
		self.coins.get(parent).and_then(|coin| coin.tokens.get(slug))
	}

	/// Resolve metadata for a coin or, when `parent` is set, a token.
	pub fn resolve(&self, slug: &str, parent: Option<&str>) -> Option<&CoinData> {
		match parent {
			Some(parent) => self.token(parent, slug),
			None => self.get(slug),
		}
	}
}
