//! The eviction scanner: demotes fully uploaded blocks out of the local
//! cache until usage falls below the soft limit.
//!
//! Victim selection is a round-robin over the usage table. The first
//! round leaves recently touched inodes alone; a round that frees
//! nothing drops that courtesy, and a fruitless round without it ends
//! the pass so the caller rebuilds the table. Only `Both` blocks are
//! demoted; a local-only block is the sole copy of its data.

use crate::gate::CacheGate;
use crate::usage::{self, build_usage_table, UsageTable};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tierfs_error::{Result, TierError};
use tierfs_meta::{block_count, MetaStore};
use tierfs_registry::Registry;
use tierfs_types::{BlockNumber, BlockStatus, InodeNumber, PinState, SystemStats, TierConfig};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EvictionReport {
    pub scanned_inodes: u64,
    pub evicted_blocks: u64,
    pub evicted_bytes: i64,
}

pub struct CacheManager {
    meta: Arc<MetaStore>,
    registry: Arc<Registry>,
    stats: Arc<SystemStats>,
    gate: Arc<CacheGate>,
    soft_limit: i64,
    hard_limit: i64,
    delta: i64,
    recent_secs: i64,
    max_block_size: u64,
}

impl CacheManager {
    #[must_use]
    pub fn new(cfg: &TierConfig, meta: Arc<MetaStore>, registry: Arc<Registry>) -> Self {
        let stats = Arc::clone(registry.stats());
        let gate = Arc::new(CacheGate::new(Arc::clone(&stats), cfg.cache_hard_limit));
        Self {
            meta,
            registry,
            stats,
            gate,
            soft_limit: cfg.cache_soft_limit,
            hard_limit: cfg.cache_hard_limit,
            delta: cfg.cache_delta,
            recent_secs: cfg.recent_secs,
            max_block_size: cfg.max_block_size,
        }
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<CacheGate> {
        &self.gate
    }

    fn over_soft_limit(&self) -> bool {
        self.stats.cache_size.load(Ordering::SeqCst) >= self.soft_limit
    }

    /// Scanner thread body: build a usage table whenever the cache is
    /// over the soft limit and run an eviction pass over it.
    pub fn run_cache_loop(&self) {
        tracing::info!(
            soft = self.soft_limit,
            hard = self.hard_limit,
            "eviction scanner started"
        );
        while !self.stats.is_going_down() {
            if self.over_soft_limit() {
                match build_usage_table(&self.meta) {
                    Ok(mut table) => match self.run_eviction_pass(&mut table) {
                        Ok(report) if report.evicted_blocks > 0 => {
                            tracing::info!(
                                blocks = report.evicted_blocks,
                                bytes = report.evicted_bytes,
                                "eviction pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "eviction pass failed"),
                    },
                    Err(e) => tracing::error!(error = %e, "usage table build failed"),
                }
            }
            self.idle_wait();
        }
        self.gate.wake_all();
        tracing::info!("eviction scanner stopped");
    }

    /// One pass over a usage table. Returns once usage is below the
    /// soft limit, shutdown begins, or the table has nothing more to
    /// give (the caller then rebuilds it).
    pub fn run_eviction_pass(&self, table: &mut UsageTable) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut skip_recent = true;
        'passes: while self.over_soft_limit() && !self.stats.is_going_down() {
            let now = usage::now();
            let round: Vec<InodeNumber> = table.entries.keys().copied().collect();
            if round.is_empty() {
                break;
            }
            let mut progressed = false;
            for inode in round {
                if !self.over_soft_limit() || self.stats.is_going_down() {
                    break 'passes;
                }
                let Some(entry) = table.entries.get(&inode) else {
                    continue;
                };
                if skip_recent && now - entry.last_touched < self.recent_secs {
                    continue;
                }
                table.entries.remove(&inode);
                report.scanned_inodes += 1;
                let (blocks, bytes) = self.evict_inode(inode)?;
                if blocks > 0 {
                    progressed = true;
                    report.evicted_blocks += blocks;
                    report.evicted_bytes += bytes;
                }
            }
            if !progressed {
                if skip_recent {
                    tracing::debug!("round freed nothing, including recent inodes");
                    skip_recent = false;
                } else {
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Demotes the inode's `Both` blocks to `Cloud` until the cache is
    /// below the soft limit. Pinned (or pinning, or mid-removal) inodes
    /// are never victims.
    fn evict_inode(&self, inode: InodeNumber) -> Result<(u64, i64)> {
        let entry = match self.registry.read_entry(inode) {
            Ok(entry) => entry,
            Err(TierError::NotFound(_)) => return Ok((0, 0)),
            Err(e) => return Err(e),
        };
        if entry.pin_state != PinState::Unpinned || entry.stat.ino == 0 {
            return Ok((0, 0));
        }
        let blocks = block_count(entry.stat.size, self.max_block_size);
        let mut freed_blocks = 0_u64;
        let mut freed_bytes = 0_i64;
        for raw in 0..blocks {
            if !self.over_soft_limit() {
                break;
            }
            let block = BlockNumber(raw);
            let guard = self.meta.lock(inode);
            let status = match self.meta.block_status(inode, block) {
                Ok(status) => status,
                // Metadata vanished under us; the inode is being
                // removed, leave its blocks to the delete path.
                Err(TierError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };
            if !status.is_evictable() {
                drop(guard);
                continue;
            }
            self.meta.set_block_status(inode, block, BlockStatus::Cloud)?;
            let path = self.meta.block_path(inode, block);
            let bytes = std::fs::metadata(&path).map_or(0, |m| m.len() as i64);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            drop(guard);
            self.stats.remove_cache_block(bytes);
            freed_blocks += 1;
            freed_bytes += bytes;
            if self.stats.cache_size.load(Ordering::SeqCst) < self.hard_limit - self.delta {
                self.gate.notify_sleep_on_cache();
            }
        }
        if freed_blocks > 0 {
            // The placement change has to reach the cloud metadata
            // copy.
            self.registry.mark_dirty(inode)?;
            tracing::debug!(%inode, freed_blocks, freed_bytes, "demoted blocks to cloud");
        }
        Ok((freed_blocks, freed_bytes))
    }

    fn idle_wait(&self) {
        for _ in 0..10 {
            if self.stats.is_going_down() {
                return;
            }
            if self.over_soft_limit() {
                return;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}
