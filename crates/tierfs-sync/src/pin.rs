//! Pin scheduler: fetches every block of queue inodes into the local
//! cache, then promotes them Pinning → Pinned.
//!
//! Quota is two-tiered: a caller-scoped allowance is drawn down first,
//! then the system-wide pinned headroom; a request neither can cover
//! fails with NoSpace and no partial effect. A terminal fetch failure
//! puts the scheduler into a deep-sleep backoff so a wedged store is
//! not hammered.

use crate::transfer::get_object;
use crate::workers::Semaphore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tierfs_backend::{data_object_name, ObjectBackend};
use tierfs_error::{Result, TierError};
use tierfs_meta::{block_count, MetaStore};
use tierfs_registry::Registry;
use tierfs_types::{BlockNumber, BlockStatus, InodeNumber, PinState, SystemStats, TierConfig};

pub struct PinScheduler {
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
    backend: Arc<dyn ObjectBackend>,
    stats: Arc<SystemStats>,
    pin_sem: Arc<Semaphore>,
    max_retries: u32,
    max_block_size: u64,
    max_pinned_size: i64,
    cache_hard_limit: i64,
    deep_sleep_secs: u64,
    deep_sleep: AtomicBool,
}

impl PinScheduler {
    #[must_use]
    pub fn new(
        cfg: &TierConfig,
        registry: Arc<Registry>,
        meta: Arc<MetaStore>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        let stats = Arc::clone(registry.stats());
        Self {
            registry,
            meta,
            backend,
            stats,
            pin_sem: Arc::new(Semaphore::new(cfg.max_pin_concurrency)),
            max_retries: cfg.max_object_retries,
            max_block_size: cfg.max_block_size,
            max_pinned_size: cfg.max_pinned_size,
            cache_hard_limit: cfg.cache_hard_limit,
            deep_sleep_secs: cfg.pin_deep_sleep_secs,
            deep_sleep: AtomicBool::new(false),
        }
    }

    /// Draws `size` bytes of pin quota: the caller's allowance first,
    /// the system headroom for the rest. On NoSpace neither is touched.
    ///
    /// Admission step for a pin request: reserve here, then call
    /// `Registry::mark_pin`; a refused reservation leaves the inode's
    /// pin state untouched. `release_pin_quota` returns the system
    /// portion if `mark_pin` is never reached or the inode is later
    /// unpinned or removed.
    pub fn reserve_pin_quota(&self, size: i64, remaining: &mut i64) -> Result<()> {
        if size <= *remaining {
            *remaining -= size;
            return Ok(());
        }
        let from_system = size - *remaining;
        loop {
            let pinned = self.stats.pinned_size.load(Ordering::SeqCst);
            if pinned + from_system > self.max_pinned_size {
                return Err(TierError::NoSpace(format!(
                    "pin quota exhausted: need {from_system} over {pinned} pinned"
                )));
            }
            if self
                .stats
                .pinned_size
                .compare_exchange(
                    pinned,
                    pinned + from_system,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                *remaining = 0;
                return Ok(());
            }
        }
    }

    /// Returns `size` bytes of previously reserved system quota.
    pub fn release_pin_quota(&self, size: i64) {
        self.stats.pinned_size.fetch_sub(size, Ordering::SeqCst);
    }

    /// Scheduler thread body.
    pub fn pinning_loop(self: &Arc<Self>) {
        tracing::info!("pin scheduler started");
        while !self.stats.is_going_down() {
            if self.deep_sleep.swap(false, Ordering::SeqCst) {
                self.backoff();
                continue;
            }
            match self.run_pin_pass() {
                Ok(0) => self.idle_wait(),
                Ok(pinned) => tracing::debug!(pinned, "pin pass complete"),
                Err(e) => {
                    tracing::error!(error = %e, "pin pass failed");
                    self.idle_wait();
                }
            }
        }
        tracing::info!("pin scheduler stopped");
    }

    /// One walk of the pin-pending queue; every fetch driver has
    /// finished by the time this returns.
    pub fn run_pin_pass(self: &Arc<Self>) -> Result<usize> {
        let pending = self.registry.pinning_snapshot()?;
        let mut handles = Vec::new();
        for inode in pending {
            if self.stats.is_going_down() {
                break;
            }
            let permit = self.pin_sem.acquire();
            let scheduler = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                match scheduler.pin_single_inode(inode) {
                    Ok(fetched) => {
                        tracing::debug!(%inode, fetched, "inode pinned");
                    }
                    Err(e) => {
                        tracing::warn!(%inode, error = %e, "pin fetch failed");
                        if matches!(e, TierError::NoSpace(_) | TierError::Io(_)) {
                            scheduler.deep_sleep.store(true, Ordering::SeqCst);
                        }
                    }
                }
                drop(permit);
            }));
        }
        let dispatched = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("pin driver panicked");
            }
        }
        Ok(dispatched)
    }

    /// Fetches every cloud-only block of one queued inode, then
    /// promotes it to Pinned.
    pub fn pin_single_inode(self: &Arc<Self>, inode: InodeNumber) -> Result<u64> {
        let entry = self.registry.read_entry(inode)?;
        if entry.pin_state != PinState::Pinning {
            // Unpinned or removed while queued; nothing to fetch.
            return Ok(0);
        }
        let mut fetched = 0_u64;
        if entry.stat.is_regular() {
            let blocks = block_count(entry.stat.size, self.max_block_size);
            for raw in 0..blocks {
                if self.stats.is_going_down() {
                    return Ok(fetched);
                }
                fetched += u64::from(self.fetch_block(inode, BlockNumber(raw))?);
            }
        }
        self.registry.finish_pinning(inode)?;
        Ok(fetched)
    }

    /// Brings one block local if it lives only in the cloud. Returns
    /// true when a download happened.
    fn fetch_block(&self, inode: InodeNumber, block: BlockNumber) -> Result<bool> {
        let (_, claimed) = self.meta.transition_block(inode, block, |s| {
            (s == BlockStatus::Cloud).then_some(BlockStatus::CToL)
        })?;
        if claimed.is_none() {
            return Ok(false);
        }

        let fetch = || -> Result<i64> {
            let data = get_object(
                self.backend.as_ref(),
                self.max_retries,
                &data_object_name(inode, block),
            )?;
            let bytes = data.len() as i64;
            if self.stats.cache_size.load(Ordering::SeqCst) + bytes > self.cache_hard_limit {
                return Err(TierError::NoSpace(format!(
                    "cache full pinning block {block} of inode {inode}"
                )));
            }
            let path = self.meta.block_path(inode, block);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &data)?;
            Ok(bytes)
        };

        match fetch() {
            Ok(bytes) => {
                self.stats.add_cache_block(bytes);
                self.meta.transition_block(inode, block, |s| {
                    (s == BlockStatus::CToL).then_some(BlockStatus::Both)
                })?;
                Ok(true)
            }
            Err(e) => {
                // Give the claim back so a retry (or a plain read
                // fault) can have the block.
                self.meta.transition_block(inode, block, |s| {
                    (s == BlockStatus::CToL).then_some(BlockStatus::Cloud)
                })?;
                Err(e)
            }
        }
    }

    fn backoff(&self) {
        tracing::warn!(secs = self.deep_sleep_secs, "pin scheduler backing off");
        for _ in 0..self.deep_sleep_secs.saturating_mul(4) {
            if self.stats.is_going_down() {
                return;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    fn idle_wait(&self) {
        for _ in 0..8 {
            if self.stats.is_going_down() {
                return;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }
}
