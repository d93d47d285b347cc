//! Core types for the liquidity aggregator
//!
//! This crate provides shared types used across all components:
//! - Exchange quotes and symbol listings
//! - Aggregated best-bid/best-ask views with arbitrage signals
//! - Arbitrage filters
//! - Configuration
//! - The error taxonomy

pub mod types;
pub mod prices;
pub mod opportunities;
pub mod config;
pub mod errors;

pub use types::*;
pub use prices::*;
pub use opportunities::*;
pub use config::*;
pub use errors::*;
