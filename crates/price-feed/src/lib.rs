//! Concurrent price aggregation across exchanges
//!
//! Features:
//! - Parallel fan-out to every registered price source
//! - Per-call deadlines layered under caller cancellation
//! - Bounded concurrency for bulk ticker fetches
//! - Stampede-protected TTL caching with background eviction
//! - Keyed async locks with idle-entry reaping

pub mod aggregator;
pub mod cache;
pub mod call;
pub mod keyed_lock;
pub mod sources;

pub use aggregator::{AggregatorCacheStats, LiquidityAggregator};
pub use cache::{CacheError, CacheStats, TtlCache};
pub use call::{execute_call, CallFailure, ExchangeCallResult};
pub use keyed_lock::{KeyedLock, KeyedLockGuard, LockError};
pub use sources::PriceSource;
pub use tokio_util::sync::CancellationToken;
