//! Connectivity gate.
//!
//! The network-status collaborator is the single writer; the queue and the
//! refresh scheduler read the current value or await changes.

use tokio::sync::watch;

/// Writer side of the gate.
#[derive(Debug)]
pub struct ConnectivitySignal {
	tx: watch::Sender<bool>,
}

/// Reader side of the gate. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectivityGate {
	rx: watch::Receiver<bool>,
}

impl ConnectivitySignal {
	/// Create a signal/gate pair starting at `connected`.
	pub fn new(connected: bool) -> (Self, ConnectivityGate) {
		let (tx, rx) = watch::channel(connected);
		(Self { tx }, ConnectivityGate { rx })
	}

	/// Publish a connectivity change. Unchanged values do not wake readers.
	pub fn set(&self, connected: bool) {
		self.tx.send_if_modified(|current| {
			if *current == connected {
				return false;
			}
			*current = connected;
			true
		});
	}

	pub fn gate(&self) -> ConnectivityGate {
		ConnectivityGate {
			rx: self.tx.subscribe(),
		}
	}
}

impl ConnectivityGate {
	pub fn is_connected(&self) -> bool {
		*self.rx.borrow()
	}

	/// Wait for the next change and return the new value. Returns `None`
	/// once the signal is dropped.
	pub async fn changed(&mut self) -> Option<bool> {
		self.rx.changed().await.ok()?;
		Some(*self.rx.borrow_and_update())
	}
}
