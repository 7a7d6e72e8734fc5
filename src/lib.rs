//! Connectivity-aware sync queue for multi-asset wallets.
//!
//! The `wallet::sync` module holds the execution queue, its retry and backoff
//! policy and the refresh scheduler; `indexer` holds the remote readers they
//! consume.

pub mod config;
pub mod indexer;
pub mod wallet;

pub use config::SyncServiceConfig;
pub use wallet::{SyncDependencies, SyncHandle, SyncService, WalletSyncError};
