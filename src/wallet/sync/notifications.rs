//! Notification collaborator.
//!
//! Refreshing notifications is fire-and-forget from the scheduler's point of
//! view: failures are logged by the caller and never retried.

use crate::wallet::types::WalletSyncError;

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[async_trait::async_trait]
pub trait NotificationService: Send + Sync {
	/// Pull fresh notifications from wherever they live.
	async fn refresh(&self) -> Result<(), WalletSyncError>;
}

/// Notification service that only counts refresh requests.
#[derive(Debug, Default)]
pub struct NoopNotifications {
	refreshes: AtomicUsize,
}

impl NoopNotifications {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn refresh_count(&self) -> usize {
		self.refreshes.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl NotificationService for NoopNotifications {
	async fn refresh(&self) -> Result<(), WalletSyncError> {
		let count = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
		debug!("Notification refresh #{} requested", count);
		Ok(())
	}
}
