//! Module tags and the tracker of which modules have work in the queue.
//!
//! A module names the campaign that produced a task. Modules are used for
//! coordination only (the idle debounce watches the resync modules), never
//! for task identity.

use std::collections::{BTreeSet, HashMap};

pub const DEFAULT: &str = "default";
pub const REFRESH: &str = "refresh";
pub const INITIAL_RESYNC: &str = "initial-resync";
pub const AUTO_RESYNC: &str = "auto-resync";
pub const MANUAL_RESYNC: &str = "manual-resync";
pub const PRICE_RESYNC: &str = "price-resync";
pub const LATEST_PRICE_RESYNC: &str = "latest-price-resync";

/// Modules whose presence counts as "a resync is executing".
pub const RESYNC_MODULES: [&str; 3] = [INITIAL_RESYNC, AUTO_RESYNC, MANUAL_RESYNC];

/// Reference-counted set of modules present in the queue.
///
/// A module is present while at least one queued task carries it.
#[derive(Debug, Clone, Default)]
pub struct ModuleTracker {
	counts: HashMap<String, usize>,
}

impl ModuleTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, module: &str) {
		*self.counts.entry(module.to_string()).or_insert(0) += 1;
	}

	pub fn remove(&mut self, module: &str) {
		if let Some(count) = self.counts.get_mut(module) {
			*count -= 1;
			if *count == 0 {
				self.counts.remove(module);
			}
		}
	}

	pub fn contains(&self, module: &str) -> bool {
		self.counts.contains_key(module)
	}

	/// Sorted snapshot of the present modules.
	pub fn snapshot(&self) -> BTreeSet<String> {
		self.counts.keys().cloned().collect()
	}

	pub fn is_empty(&self) -> bool {
		self.counts.is_empty()
	}
}

/// Whether a snapshot contains any resync module.
pub fn is_resync_executing(modules: &BTreeSet<String>) -> bool {
	RESYNC_MODULES.iter().any(|m| modules.contains(*m))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_module_present_while_any_task_carries_it() {
		let mut tracker = ModuleTracker::new();
		tracker.add(INITIAL_RESYNC);
		tracker.add(INITIAL_RESYNC);
		tracker.add(REFRESH);

		tracker.remove(INITIAL_RESYNC);
		assert!(tracker.contains(INITIAL_RESYNC));
		assert!(is_resync_executing(&tracker.snapshot()));

		tracker.remove(INITIAL_RESYNC);
		assert!(!tracker.contains(INITIAL_RESYNC));
		assert!(!is_resync_executing(&tracker.snapshot()));
		assert_eq!(tracker.snapshot().into_iter().collect::<Vec<_>>(), vec![REFRESH.to_string()]);

		// Removing an absent module is a no-op.
		tracker.remove(MANUAL_RESYNC);
		tracker.remove(REFRESH);
		assert!(tracker.is_empty());
	}
}
