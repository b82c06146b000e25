//! Upload pipeline: drains the dirty queue, pushing each inode's
//! not-yet-uploaded blocks and then its metadata to the object store.
//!
//! One long-lived loop walks the queue and dispatches per-inode
//! drivers, each bounded by the sync semaphore. A driver marks every
//! uploadable block `LToC`, fans the transfers out to block workers
//! bounded by the shared transfer semaphore, joins them all, and only
//! then uploads the metadata object, so blocks always land before the
//! metadata that references them. Completion is reported through
//! `update_transit`, which retires the inode from the dirty queue
//! unless it was written again mid-flight.

use crate::transfer::{delete_object, put_object};
use crate::workers::{InFlightTable, Semaphore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tierfs_backend::{data_object_name, meta_object_name, ObjectBackend};
use tierfs_error::Result;
use tierfs_meta::{block_count, MetaStore};
use tierfs_registry::Registry;
use tierfs_types::{BlockNumber, BlockStatus, InodeNumber, SystemStats, TierConfig};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncReport {
    pub uploaded_blocks: u64,
    pub deleted_blocks: u64,
    pub failed: bool,
}

pub struct SyncPipeline {
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
    backend: Arc<dyn ObjectBackend>,
    stats: Arc<SystemStats>,
    inflight: Arc<InFlightTable>,
    sync_sem: Arc<Semaphore>,
    transfer_sem: Arc<Semaphore>,
    max_retries: u32,
    max_block_size: u64,
}

impl SyncPipeline {
    #[must_use]
    pub fn new(
        cfg: &TierConfig,
        registry: Arc<Registry>,
        meta: Arc<MetaStore>,
        backend: Arc<dyn ObjectBackend>,
        inflight: Arc<InFlightTable>,
    ) -> Self {
        let stats = Arc::clone(registry.stats());
        Self {
            registry,
            meta,
            backend,
            stats,
            inflight,
            sync_sem: Arc::new(Semaphore::new(cfg.max_sync_concurrency)),
            transfer_sem: Arc::new(Semaphore::new(cfg.max_upload_concurrency)),
            max_retries: cfg.max_object_retries,
            max_block_size: cfg.max_block_size,
        }
    }

    /// Pipeline thread body. Passes run back to back while there is
    /// dirty work; an idle pass sleeps up to 30 s, cut short by dirty
    /// cache pressure or shutdown.
    pub fn upload_loop(self: &Arc<Self>) {
        tracing::info!("upload pipeline started");
        while !self.stats.is_going_down() {
            match self.run_upload_pass() {
                Ok(0) => self.sleep_between_passes(),
                Ok(synced) => tracing::debug!(synced, "upload pass complete"),
                Err(e) => {
                    tracing::error!(error = %e, "upload pass failed");
                    self.sleep_between_passes();
                }
            }
        }
        tracing::info!("upload pipeline stopped");
    }

    /// One walk of the dirty queue. Returns how many inodes were
    /// dispatched; every driver has finished by the time this returns.
    pub fn run_upload_pass(self: &Arc<Self>) -> Result<usize> {
        let dirty = self.registry.dirty_snapshot()?;
        let mut handles = Vec::new();
        for inode in dirty {
            if self.stats.is_going_down() {
                break;
            }
            if !self.inflight.try_insert(inode) {
                continue;
            }
            if !self.registry.try_claim_sync(inode)? {
                self.inflight.remove(inode);
                continue;
            }
            let permit = self.sync_sem.acquire();
            let pipeline = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                let result = pipeline.sync_single_inode(inode);
                match result {
                    Ok(report) if report.failed => {
                        tracing::warn!(%inode, "sync left inode dirty for a later pass");
                    }
                    Ok(report) => {
                        tracing::debug!(
                            %inode,
                            uploaded = report.uploaded_blocks,
                            "inode synced"
                        );
                    }
                    Err(e) => tracing::error!(%inode, error = %e, "sync driver failed"),
                }
                pipeline.inflight.remove(inode);
                drop(permit);
            }));
        }
        let dispatched = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("sync driver panicked");
            }
        }
        Ok(dispatched)
    }

    /// Per-inode sync driver. Assumes the caller claimed the inode
    /// (`in_transit`) and holds its in-flight slot.
    pub fn sync_single_inode(self: &Arc<Self>, inode: InodeNumber) -> Result<SyncReport> {
        let entry = match self.registry.read_entry(inode) {
            Ok(entry) => entry,
            Err(e) => {
                // Clear ownership before surfacing the error.
                self.registry.update_transit(inode, false, true)?;
                return Err(e);
            }
        };
        let mut report = SyncReport::default();

        if entry.stat.is_regular() {
            let blocks = block_count(entry.stat.size, self.max_block_size);
            let mut workers = Vec::new();
            for raw in 0..blocks {
                let block = BlockNumber(raw);
                let (was, claimed) = self.meta.transition_block(inode, block, |s| {
                    s.needs_upload().then_some(BlockStatus::LToC)
                })?;
                if claimed.is_some() {
                    workers.push(self.dispatch_block_worker(inode, block, BlockJob::Upload));
                } else if was == BlockStatus::ToDelete {
                    // Deferred removal of a truncated-away block rides
                    // the sync path.
                    workers.push(self.dispatch_block_worker(inode, block, BlockJob::Delete));
                }
            }
            // Every block lands (or fails) before the metadata step.
            for worker in workers {
                match worker.join() {
                    Ok(Ok(BlockJob::Upload)) => report.uploaded_blocks += 1,
                    Ok(Ok(BlockJob::Delete)) => report.deleted_blocks += 1,
                    Ok(Err(e)) => {
                        tracing::warn!(%inode, error = %e, "block transfer failed");
                        report.failed = true;
                    }
                    Err(_) => report.failed = true,
                }
            }
        }

        if !report.failed {
            if let Err(e) = self.upload_meta(inode) {
                tracing::warn!(%inode, error = %e, "metadata upload failed");
                report.failed = true;
            }
        }
        self.registry.update_transit(inode, false, report.failed)?;
        Ok(report)
    }

    fn dispatch_block_worker(
        self: &Arc<Self>,
        inode: InodeNumber,
        block: BlockNumber,
        job: BlockJob,
    ) -> std::thread::JoinHandle<Result<BlockJob>> {
        let permit = self.transfer_sem.acquire();
        let pipeline = Arc::clone(self);
        std::thread::spawn(move || {
            let result = match job {
                BlockJob::Upload => pipeline.upload_block(inode, block),
                BlockJob::Delete => pipeline.delete_block(inode, block),
            };
            drop(permit);
            result.map(|()| job)
        })
    }

    fn upload_block(&self, inode: InodeNumber, block: BlockNumber) -> Result<()> {
        let path = self.meta.block_path(inode, block);
        let data = std::fs::read(&path)?;
        put_object(
            self.backend.as_ref(),
            self.max_retries,
            &data_object_name(inode, block),
            &data,
        )?;
        // A writer that touched the block mid-upload moved it off LToC;
        // its next sync re-uploads, so leave it alone here.
        let (_, flipped) = self.meta.transition_block(inode, block, |s| {
            (s == BlockStatus::LToC).then_some(BlockStatus::Both)
        })?;
        if flipped.is_some() {
            self.stats
                .dirty_cache_size
                .fetch_sub(data.len() as i64, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    fn delete_block(&self, inode: InodeNumber, block: BlockNumber) -> Result<()> {
        delete_object(
            self.backend.as_ref(),
            self.max_retries,
            &data_object_name(inode, block),
        )?;
        self.meta.transition_block(inode, block, |s| {
            (s == BlockStatus::ToDelete).then_some(BlockStatus::None)
        })?;
        Ok(())
    }

    fn upload_meta(&self, inode: InodeNumber) -> Result<()> {
        let bytes = std::fs::read(self.meta.meta_path(inode))?;
        put_object(
            self.backend.as_ref(),
            self.max_retries,
            &meta_object_name(inode),
            &bytes,
        )
    }

    fn sleep_between_passes(&self) {
        for _ in 0..60 {
            if self.stats.is_going_down() {
                return;
            }
            // Dirty cache pressure cuts the nap short.
            if self
                .stats
                .dirty_cache_size
                .load(std::sync::atomic::Ordering::SeqCst)
                > 0
            {
                std::thread::sleep(Duration::from_millis(500));
                return;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BlockJob {
    Upload,
    Delete,
}
