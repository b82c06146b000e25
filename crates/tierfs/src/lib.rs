#![forbid(unsafe_code)]
//! TierFS public API facade.
//!
//! Re-exports the storage-tiering core through one crate: the inode
//! registry and its queues, per-file metadata and block placement, the
//! object-store seam, cache accounting and eviction, and the sync
//! pipelines. Downstream consumers depend on this crate rather than on
//! the members directly.

pub use tierfs_backend::{
    data_object_name, is_success, meta_object_name, open_backend, BackendKind, DirBackend,
    MemoryBackend, ObjectBackend, STATUS_NOT_FOUND, STATUS_UNAUTHORIZED,
};
pub use tierfs_cache::{
    build_usage_table, CacheGate, CacheManager, EvictionReport, UsageEntry, UsageTable,
};
pub use tierfs_error::{Result, TierError};
pub use tierfs_meta::{block_count, MetaStore};
pub use tierfs_registry::Registry;
pub use tierfs_sync::{
    DeletePipeline, DsyncReport, InFlightTable, PinScheduler, SyncPipeline, SyncReport,
};
pub use tierfs_types::{
    BlockNumber, BlockStatus, Generation, InodeNumber, InodeStat, PinState, QueueStatus,
    RegistryEntry, RegistryHeader, SystemStats, TierConfig,
};
