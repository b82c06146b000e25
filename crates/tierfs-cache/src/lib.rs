#![forbid(unsafe_code)]
//! Local-cache accounting and eviction.
//!
//! Three pieces: the process-wide counters live in
//! [`tierfs_types::SystemStats`]; [`CacheGate`] parks writers when the
//! cache hits the hard limit; [`CacheManager`] scans the block tree into
//! a [`UsageTable`] and demotes uploaded blocks until usage drops below
//! the soft limit.

mod evict;
mod gate;
mod usage;

pub use evict::{CacheManager, EvictionReport};
pub use gate::CacheGate;
pub use usage::{build_usage_table, UsageEntry, UsageTable};
