//! HTTP JSON readers for chain explorers and the price API.
//!
//! Each coin family is served by an explorer exposing a small REST surface
//! (balance, paged history, transaction status, named accounts). Prices come
//! from a CoinGecko-style API. HTTP status codes are mapped onto the
//! `IndexerError` taxonomy so the sync queue can tell transient failures,
//! rate limiting and permanent errors apart.

use super::reader::{ChainReader, PriceReader};
use super::types::*;

use backoff::{ExponentialBackoffBuilder, future::retry};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause used when the upstream rate-limits without a `Retry-After` header.
const DEFAULT_RATE_LIMIT_DELAY_MS: u64 = 60_000;

/// Build the shared HTTP client.
fn build_http_client(timeout: Duration) -> Result<Client, IndexerError> {
	Ok(Client::builder().timeout(timeout).build()?)
}

/// Send a GET request, retrying briefly when the connection itself cannot be
/// established. Everything else is left to the caller's retry policy.
async fn get(client: &Client, url: &str, query: &[(&str, String)]) -> Result<Response, IndexerError> {
	let policy = ExponentialBackoffBuilder::new()
		.with_initial_interval(Duration::from_millis(250))
		.with_max_elapsed_time(Some(Duration::from_secs(2)))
		.build();

	let response = retry(policy, || async {
		client.get(url).query(query).send().await.map_err(|e| {
			if e.is_connect() {
				debug!("Connection to {} failed, retrying: {}", url, e);
				backoff::Error::transient(e)
			} else {
				backoff::Error::permanent(e)
			}
		})
	})
	.await?;

	check_status(response)
}

/// Map HTTP status codes onto the error taxonomy.
fn check_status(response: Response) -> Result<Response, IndexerError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}

	if status == StatusCode::TOO_MANY_REQUESTS {
		let delay_ms = response
			.headers()
			.get(reqwest::header::RETRY_AFTER)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.trim().parse::<u64>().ok())
			.map(|secs| secs * 1000)
			.unwrap_or(DEFAULT_RATE_LIMIT_DELAY_MS);
		warn!("Upstream rate limited {}, pausing {} ms", response.url(), delay_ms);
		return Err(IndexerError::RateLimited { delay_ms });
	}

	if status.is_server_error() {
		return Err(IndexerError::Unavailable(format!("HTTP error: {}", status)));
	}

	if status == StatusCode::NOT_FOUND {
		return Err(IndexerError::NoData);
	}

	Err(IndexerError::InvalidRequest(format!("HTTP error: {}", status)))
}

async fn get_json<T: DeserializeOwned>(
	client: &Client,
	url: &str,
	query: &[(&str, String)],
) -> Result<T, IndexerError> {
	let response = get(client, url, query).await?;
	let body = response.bytes().await?;
	Ok(serde_json::from_slice(&body)?)
}

/// Explorer client for one coin family.
#[derive(Clone)]
pub struct HttpChainReader {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL of the explorer API.
	base_url: String,
	name: &'static str,
}

impl HttpChainReader {
	/// Create a new explorer client.
	///
	/// # Arguments
	/// * `name` - Reader name used in logs.
	/// * `base_url` - Explorer API root, without trailing slash.
	/// * `timeout` - Per-request timeout.
	pub fn new(name: &'static str, base_url: String, timeout: Duration) -> Result<Self, IndexerError> {
		Ok(Self {
			http_client: build_http_client(timeout)?,
			base_url: base_url.trim_end_matches('/').to_string(),
			name,
		})
	}

	fn account_url(&self, account: &ChainAccount, path: &str) -> String {
		let key = account.zpub.as_deref().unwrap_or(&account.xpub);
		let coin = account.parent_coin.as_deref().unwrap_or(&account.coin);
		format!("{}/{}/accounts/{}/{}", self.base_url, coin, key, path)
	}

	fn account_query(account: &ChainAccount) -> Vec<(&'static str, String)> {
		let mut query = Vec::new();
		if account.parent_coin.is_some() {
			query.push(("token", account.coin.clone()));
		}
		if let Some(name) = &account.custom_account {
			query.push(("customAccount", name.clone()));
		}
		query
	}
}

#[async_trait::async_trait]
impl ChainReader for HttpChainReader {
	async fn fetch_balance(&self, account: &ChainAccount) -> Result<BalanceReport, IndexerError> {
		let url = self.account_url(account, "balance");
		get_json(&self.http_client, &url, &Self::account_query(account)).await
	}

	async fn fetch_history_page(
		&self,
		account: &ChainAccount,
		cursor: &HistoryCursor,
	) -> Result<HistoryPage, IndexerError> {
		let url = self.account_url(account, "history");
		let mut query = Self::account_query(account);
		query.push(("page", cursor.page.to_string()));
		if let Some(block) = cursor.after_block {
			query.push(("afterBlock", block.to_string()));
		}
		if let Some(hash) = &cursor.after_hash {
			query.push(("until", hash.clone()));
		}
		if let Some(hash) = &cursor.before_hash {
			query.push(("before", hash.clone()));
		}
		if let Some(block) = cursor.after_token_block {
			query.push(("afterTokenBlock", block.to_string()));
		}

		let page: HistoryPage = get_json(&self.http_client, &url, &query).await?;
		debug!(
			"{}: fetched {} transactions for {} (page {})",
			self.name,
			page.transactions.len(),
			account.coin,
			cursor.page
		);
		Ok(page)
	}

	async fn fetch_txn_status(
		&self,
		account: &ChainAccount,
		txn_hash: &str,
		sender: Option<&str>,
	) -> Result<TxnStatusReport, IndexerError> {
		let coin = account.parent_coin.as_deref().unwrap_or(&account.coin);
		let url = format!("{}/{}/transactions/{}/status", self.base_url, coin, txn_hash);
		let mut query = Vec::new();
		if let Some(sender) = sender {
			query.push(("sender", sender.to_string()));
		}
		get_json(&self.http_client, &url, &query).await
	}

	async fn fetch_custom_accounts(&self, account: &ChainAccount) -> Result<Vec<String>, IndexerError> {
		let url = self.account_url(account, "custom-accounts");
		get_json(&self.http_client, &url, &[]).await
	}

	fn name(&self) -> &'static str {
		self.name
	}
}

#[derive(Deserialize)]
struct MarketChart {
	prices: Vec<(f64, f64)>,
}

/// CoinGecko-style price API client.
#[derive(Clone)]
pub struct HttpPriceReader {
	http_client: Client,
	base_url: String,
	vs_currency: String,
}

impl HttpPriceReader {
	pub fn new(base_url: String, vs_currency: String, timeout: Duration) -> Result<Self, IndexerError> {
		Ok(Self {
			http_client: build_http_client(timeout)?,
			base_url: base_url.trim_end_matches('/').to_string(),
			vs_currency,
		})
	}
}

#[async_trait::async_trait]
impl PriceReader for HttpPriceReader {
	async fn fetch_price_history(
		&self,
		target: &PriceTarget,
		days: u16,
	) -> Result<Vec<PricePoint>, IndexerError> {
		let url = format!("{}/coins/{}/market_chart", self.base_url, target.api_id());
		let query = [
			("vs_currency", self.vs_currency.clone()),
			("days", days.to_string()),
		];
		let chart: MarketChart = get_json(&self.http_client, &url, &query).await?;
		if chart.prices.is_empty() {
			return Err(IndexerError::NoData);
		}

		Ok(chart
			.prices
			.into_iter()
			.map(|(ts, price)| (ts as i64, price))
			.collect())
	}

	async fn fetch_latest_prices(
		&self,
		targets: &[PriceTarget],
	) -> Result<HashMap<String, f64>, IndexerError> {
		let ids = targets
			.iter()
			.map(|t| t.api_id())
			.collect::<Vec<_>>()
			.join(",");
		let url = format!("{}/simple/price", self.base_url);
		let query = [("ids", ids), ("vs_currencies", self.vs_currency.clone())];

		let response: HashMap<String, HashMap<String, f64>> =
			get_json(&self.http_client, &url, &query).await?;

		Ok(response
			.into_iter()
			.filter_map(|(id, quotes)| quotes.get(&self.vs_currency).map(|price| (id, *price)))
			.collect())
	}
}
