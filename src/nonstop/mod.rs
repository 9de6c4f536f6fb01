// ============================================================================
// Nonstop Module
// ============================================================================
//
// Keeps client cache operations answering within a bounded time when the
// server tier is unreachable, degrading according to a configured behavior.
//
// ============================================================================

pub mod cache;
pub mod config;
pub mod remote;

pub use cache::NonStopCache;
pub use config::{NonStopConfig, NonStopTimeoutBehavior};
pub use remote::{ClusteredStore, InMemoryClusteredStore};
