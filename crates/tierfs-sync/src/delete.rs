//! Delete pipeline: destroys the cloud footprint of removed inodes.
//!
//! `to_delete` stages the inode's metadata aside by rename before the
//! registry entry joins the to-delete queue, so the pipeline can still
//! enumerate block placements after the live metadata is gone. A driver
//! waits out any sync still in flight for the inode (a racing upload
//! would re-create objects behind the deletes), removes every block
//! object with a cloud footprint and then the metadata object, and
//! finishes with `registry.delete`, which queues the number for reclaim.

use crate::transfer::delete_object;
use crate::workers::{InFlightTable, Semaphore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tierfs_backend::{data_object_name, meta_object_name, ObjectBackend};
use tierfs_error::{Result, TierError};
use tierfs_meta::{block_count, MetaStore};
use tierfs_registry::Registry;
use tierfs_types::{BlockNumber, InodeNumber, SystemStats, TierConfig};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DsyncReport {
    pub deleted_objects: u64,
    pub failed: bool,
}

pub struct DeletePipeline {
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
    backend: Arc<dyn ObjectBackend>,
    stats: Arc<SystemStats>,
    /// Shared with the upload pipeline.
    inflight: Arc<InFlightTable>,
    dsync_sem: Arc<Semaphore>,
    transfer_sem: Arc<Semaphore>,
    max_retries: u32,
    max_block_size: u64,
}

impl DeletePipeline {
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
            dsync_sem: Arc::new(Semaphore::new(cfg.max_dsync_concurrency)),
            transfer_sem: Arc::new(Semaphore::new(cfg.max_upload_concurrency)),
            max_retries: cfg.max_object_retries,
            max_block_size: cfg.max_block_size,
        }
    }

    /// Pipeline thread body.
    pub fn delete_loop(self: &Arc<Self>) {
        tracing::info!("delete pipeline started");
        while !self.stats.is_going_down() {
            match self.run_delete_pass() {
                Ok(0) => self.idle_wait(),
                Ok(removed) => tracing::debug!(removed, "delete pass complete"),
                Err(e) => {
                    tracing::error!(error = %e, "delete pass failed");
                    self.idle_wait();
                }
            }
        }
        tracing::info!("delete pipeline stopped");
    }

    /// One walk of the to-delete queue; every driver has finished by
    /// the time this returns.
    pub fn run_delete_pass(self: &Arc<Self>) -> Result<usize> {
        let doomed = self.registry.todelete_snapshot()?;
        let mut handles = Vec::new();
        for inode in doomed {
            if self.stats.is_going_down() {
                break;
            }
            let permit = self.dsync_sem.acquire();
            let pipeline = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                match pipeline.dsync_single_inode(inode) {
                    Ok(report) if report.failed => {
                        tracing::warn!(%inode, "removal incomplete, inode stays queued");
                    }
                    Ok(report) => {
                        tracing::debug!(%inode, objects = report.deleted_objects, "inode removed");
                    }
                    Err(e) => tracing::error!(%inode, error = %e, "delete driver failed"),
                }
                drop(permit);
            }));
        }
        let dispatched = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("delete driver panicked");
            }
        }
        Ok(dispatched)
    }

    /// Per-inode removal driver.
    pub fn dsync_single_inode(self: &Arc<Self>, inode: InodeNumber) -> Result<DsyncReport> {
        self.inflight.wait_absent(inode);
        let mut report = DsyncReport::default();

        let staged_stat = match self.meta.read_todelete_stat(inode) {
            Ok(stat) => Some(stat),
            // Nothing was staged: the inode never had a metadata file
            // (or a previous pass already consumed it). Only the
            // registry step remains.
            Err(TierError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(stat) = staged_stat {
            if stat.is_regular() {
                let blocks = block_count(stat.size, self.max_block_size);
                let mut workers = Vec::new();
                for raw in 0..blocks {
                    let block = BlockNumber(raw);
                    let status = self.meta.todelete_block_status(inode, block)?;
                    if !status.has_cloud_footprint() {
                        continue;
                    }
                    let permit = self.transfer_sem.acquire();
                    let pipeline = Arc::clone(self);
                    workers.push(std::thread::spawn(move || {
                        let result = delete_object(
                            pipeline.backend.as_ref(),
                            pipeline.max_retries,
                            &data_object_name(inode, block),
                        );
                        drop(permit);
                        result
                    }));
                }
                for worker in workers {
                    match worker.join() {
                        Ok(Ok(())) => report.deleted_objects += 1,
                        Ok(Err(e)) => {
                            tracing::warn!(%inode, error = %e, "block object removal failed");
                            report.failed = true;
                        }
                        Err(_) => report.failed = true,
                    }
                }
            }
            if report.failed {
                // Leave the staged copy and the queue entry; a later
                // pass finishes the job.
                return Ok(report);
            }
            delete_object(
                self.backend.as_ref(),
                self.max_retries,
                &meta_object_name(inode),
            )?;
            report.deleted_objects += 1;
            self.meta.remove_todelete(inode)?;
        }

        self.registry.delete(inode)?;
        Ok(report)
    }

    fn idle_wait(&self) {
        for _ in 0..20 {
            if self.stats.is_going_down() {
                return;
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }
}
