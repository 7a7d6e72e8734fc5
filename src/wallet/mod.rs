pub mod coins;
pub mod sync;
pub mod types;

pub use sync::{SyncDependencies, SyncHandle, SyncService};
pub use types::*;
