//! Wallet Synchronization Module
//!
//! This module holds the connectivity-aware execution queue that keeps wallet
//! balances, transaction history, prices, custom accounts and pending
//! transaction states in sync with remote providers. It is composed of several
//! submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The main entry point. Starts the queue loop and the refresh scheduler and exposes the `SyncHandle` API.
//! - `task`: Sync task descriptors and their identity keys.
//! - `queue`: The execution queue engine and its command channel.
//! - `executor`: Batch execution of same-kind tasks against chain readers and the wallet store.
//! - `retry`: The retry and backoff decision table.
//! - `refresh`: Campaigns that seed the queue (startup, manual, idle auto resync, interval refreshes).
//! - `seeding`: Per-chain-family derivation of tasks from wallet entities.
//! - `events`: Typed outcomes of queue ticks.
//!
//! The queue owns all mutable sync state and is only ever mutated from its own loop; everything
//! else communicates with it through channels.

/// Connectivity gate shared by the queue and the scheduler
pub mod connectivity;
/// Typed outcomes of queue ticks
pub mod events;
/// Batch execution of sync tasks
pub mod executor;
/// Module tags and the tracker of modules present in the queue
pub mod modules;
/// Notification collaborator
pub mod notifications;
/// Main coordinator for the wallet sync process
pub mod orchestrator;
/// Queue run logging
pub mod progress_tracker;
/// The execution queue
pub mod queue;
/// Refresh campaigns and the idle debounce
pub mod refresh;
/// Wallet store collaborator
pub mod repositories;
/// Retry and backoff policy
pub mod retry;
/// Task derivation from wallet entities
pub mod seeding;
/// Sync task descriptors
pub mod task;

pub use orchestrator::*;
