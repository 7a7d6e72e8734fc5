//! Remote provider integration
//!
//! This module provides the reader traits the sync queue consumes, the error
//! taxonomy shared by all remote reads, and HTTP implementations for chain
//! explorers and the price API.

/// HTTP clients for explorers and the price API
mod client;
/// Reader traits, one per provider kind
mod reader;
/// Type definitions for provider data structures
mod types;

pub use client::{HttpChainReader, HttpPriceReader};
pub use reader::{ChainReader, PriceReader};
pub use types::*;
