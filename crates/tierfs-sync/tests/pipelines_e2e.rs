//! End-to-end pipeline scenarios against an in-memory object store:
//! upload ordering and retirement, deferred block deletion, removal of
//! a cloud footprint, the upload/delete rendezvous, and pin fetching.

use std::sync::Arc;
use std::time::Duration;
use tierfs_backend::{data_object_name, meta_object_name, MemoryBackend, ObjectBackend};
use tierfs_meta::MetaStore;
use tierfs_registry::Registry;
use tierfs_sync::{DeletePipeline, InFlightTable, PinScheduler, SyncPipeline};
use tierfs_types::{
    BlockNumber, BlockStatus, InodeNumber, InodeStat, PinState, QueueStatus, SystemStats,
    TierConfig, S_IFREG,
};

const BLOCK: u64 = 4096;

struct Rig {
    cfg: TierConfig,
    registry: Arc<Registry>,
    meta: Arc<MetaStore>,
    backend: Arc<MemoryBackend>,
    stats: Arc<SystemStats>,
    inflight: Arc<InFlightTable>,
    _dir: tempfile::TempDir,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let cfg = TierConfig {
            meta_root: dir.path().join("meta"),
            block_root: dir.path().join("block"),
            max_block_size: BLOCK,
            max_object_retries: 2,
            ..TierConfig::default()
        };
        let stats = Arc::new(SystemStats::new());
        let registry = Arc::new(Registry::open(&cfg, Arc::clone(&stats)).expect("registry"));
        let meta = Arc::new(MetaStore::open(&cfg).expect("meta"));
        Rig {
            registry,
            meta,
            backend: Arc::new(MemoryBackend::new()),
            stats,
            inflight: Arc::new(InFlightTable::new()),
            cfg,
            _dir: dir,
        }
    }

    fn sync_pipeline(&self) -> Arc<SyncPipeline> {
        Arc::new(SyncPipeline::new(
            &self.cfg,
            Arc::clone(&self.registry),
            Arc::clone(&self.meta),
            self.dyn_backend(),
            Arc::clone(&self.inflight),
        ))
    }

    fn delete_pipeline(&self) -> Arc<DeletePipeline> {
        Arc::new(DeletePipeline::new(
            &self.cfg,
            Arc::clone(&self.registry),
            Arc::clone(&self.meta),
            self.dyn_backend(),
            Arc::clone(&self.inflight),
        ))
    }

    fn pin_scheduler(&self) -> Arc<PinScheduler> {
        Arc::new(PinScheduler::new(
            &self.cfg,
            Arc::clone(&self.registry),
            Arc::clone(&self.meta),
            self.dyn_backend(),
        ))
    }

    fn dyn_backend(&self) -> Arc<dyn ObjectBackend> {
        Arc::clone(&self.backend) as Arc<dyn ObjectBackend>
    }

    /// Allocates a regular file of `blocks` blocks, each in `status`,
    /// with local block files where the status implies one.
    fn file_with_blocks(&self, blocks: u64, status: BlockStatus) -> InodeNumber {
        let stat = InodeStat {
            mode: S_IFREG | 0o644,
            nlink: 1,
            size: blocks * BLOCK,
            ..InodeStat::default()
        };
        let ino = self.registry.new_inode(&stat, false).expect("alloc");
        self.meta.create_meta(ino, &stat).expect("meta");
        for raw in 0..blocks {
            self.set_block(ino, raw, status);
        }
        ino
    }

    fn set_block(&self, ino: InodeNumber, raw: u64, status: BlockStatus) {
        let block = BlockNumber(raw);
        if status.is_local() {
            let path = self.meta.block_path(ino, block);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(&path, vec![raw as u8; BLOCK as usize]).expect("block file");
        }
        self.meta.set_block_status(ino, block, status).expect("status");
    }
}

#[test]
fn upload_pass_pushes_blocks_then_meta_and_retires_inode() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(2, BlockStatus::LDisk);
    rig.registry.mark_dirty(ino).expect("dirty");

    let pipeline = rig.sync_pipeline();
    assert_eq!(pipeline.run_upload_pass().expect("pass"), 1);

    for raw in 0..2 {
        assert!(rig.backend.contains(&data_object_name(ino, BlockNumber(raw))));
        assert_eq!(
            rig.meta.block_status(ino, BlockNumber(raw)).expect("status"),
            BlockStatus::Both
        );
    }
    assert!(rig.backend.contains(&meta_object_name(ino)));
    // The uploaded metadata copy already reflects the Both placement.
    let (_, meta_bytes) = rig.backend.get(&meta_object_name(ino)).expect("get");
    assert!(!meta_bytes.is_empty());

    let entry = rig.registry.read_entry(ino).expect("entry");
    assert_eq!(entry.status, QueueStatus::None);
    assert!(!entry.in_transit);
    assert!(entry.last_sync_time > 0);
    assert_eq!(rig.registry.header().num_dirty, 0);
    assert!(!rig.inflight.contains(ino));
}

#[test]
fn failed_upload_leaves_inode_dirty_for_a_later_pass() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::LDisk);
    rig.registry.mark_dirty(ino).expect("dirty");
    rig.backend.inject_failures(503, 100);

    let pipeline = rig.sync_pipeline();
    assert_eq!(pipeline.run_upload_pass().expect("pass"), 1);

    let entry = rig.registry.read_entry(ino).expect("entry");
    assert_eq!(entry.status, QueueStatus::Dirty);
    assert!(!entry.in_transit);
    // The claim survives as LToC, still uploadable next pass.
    assert_eq!(
        rig.meta.block_status(ino, BlockNumber(0)).expect("status"),
        BlockStatus::LToC
    );
    assert!(!rig.backend.contains(&meta_object_name(ino)));
}

#[test]
fn modification_during_sync_requeues_the_inode() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::LDisk);
    rig.registry.mark_dirty(ino).expect("dirty");

    // Claim by hand, write again mid-flight, then let the driver run.
    assert!(rig.registry.try_claim_sync(ino).expect("claim"));
    assert!(rig.inflight.try_insert(ino));
    rig.registry.mark_dirty(ino).expect("write during sync");

    let pipeline = rig.sync_pipeline();
    let report = pipeline.sync_single_inode(ino).expect("sync");
    rig.inflight.remove(ino);
    assert!(!report.failed);

    let entry = rig.registry.read_entry(ino).expect("entry");
    assert_eq!(entry.status, QueueStatus::Dirty);
    assert!(!entry.mod_after_in_transit);
}

#[test]
fn truncated_blocks_are_deleted_from_the_sync_path() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::LDisk);
    // Block 1 was truncated away after an earlier upload; its object
    // still exists in the cloud.
    rig.set_block(ino, 1, BlockStatus::ToDelete);
    let stale = data_object_name(ino, BlockNumber(1));
    rig.backend.put(&stale, b"stale").expect("seed");
    let stat = InodeStat {
        size: 2 * BLOCK,
        ..rig.registry.read_entry(ino).expect("entry").stat
    };
    rig.registry.update_stat(ino, &stat, false).expect("stat");

    let pipeline = rig.sync_pipeline();
    assert_eq!(pipeline.run_upload_pass().expect("pass"), 1);

    assert!(!rig.backend.contains(&stale));
    assert_eq!(
        rig.meta.block_status(ino, BlockNumber(1)).expect("status"),
        BlockStatus::None
    );
    assert!(rig.backend.contains(&data_object_name(ino, BlockNumber(0))));
    assert_eq!(rig.registry.header().num_dirty, 0);
}

#[test]
fn delete_pass_destroys_the_cloud_footprint() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::Both);
    rig.set_block(ino, 1, BlockStatus::Cloud);
    rig.set_block(ino, 2, BlockStatus::LDisk);
    let stat = InodeStat {
        size: 3 * BLOCK,
        ..rig.registry.read_entry(ino).expect("entry").stat
    };
    rig.registry.update_stat(ino, &stat, true).expect("stat");
    rig.meta.write_stat(ino, &stat).expect("meta stat");
    for raw in [0_u64, 1] {
        rig.backend
            .put(&data_object_name(ino, BlockNumber(raw)), b"data")
            .expect("seed");
    }
    rig.backend.put(&meta_object_name(ino), b"meta").expect("seed");

    rig.meta.stage_todelete(ino).expect("stage");
    rig.registry.to_delete(ino).expect("to_delete");
    assert_eq!(rig.registry.header().num_to_delete, 1);

    let pipeline = rig.delete_pipeline();
    assert_eq!(pipeline.run_delete_pass().expect("pass"), 1);

    assert_eq!(rig.backend.object_count(), 0);
    assert_eq!(
        rig.registry.read_entry(ino).expect("entry").status,
        QueueStatus::ToReclaim
    );
    assert_eq!(rig.registry.header().num_to_delete, 0);
    assert_eq!(rig.registry.header().num_to_reclaim, 1);
    assert!(rig.registry.todelete_snapshot().expect("snapshot").is_empty());
    assert!(rig.meta.read_todelete_stat(ino).is_err());
}

#[test]
fn removal_waits_for_an_inflight_sync() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::Both);
    rig.meta.stage_todelete(ino).expect("stage");
    rig.registry.to_delete(ino).expect("to_delete");
    rig.backend
        .put(&data_object_name(ino, BlockNumber(0)), b"data")
        .expect("seed");

    assert!(rig.inflight.try_insert(ino));
    let pipeline = rig.delete_pipeline();
    let handle = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || pipeline.dsync_single_inode(ino))
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());
    assert!(rig.backend.contains(&data_object_name(ino, BlockNumber(0))));

    rig.inflight.remove(ino);
    let report = handle.join().expect("join").expect("dsync");
    assert!(!report.failed);
    assert!(!rig.backend.contains(&data_object_name(ino, BlockNumber(0))));
    assert_eq!(
        rig.registry.read_entry(ino).expect("entry").status,
        QueueStatus::ToReclaim
    );
}

#[test]
fn pin_pass_fetches_cloud_blocks_and_promotes() {
    let rig = Rig::new();
    let ino = rig.file_with_blocks(1, BlockStatus::Both);
    rig.set_block(ino, 1, BlockStatus::Cloud);
    let stat = InodeStat {
        size: 2 * BLOCK,
        ..rig.registry.read_entry(ino).expect("entry").stat
    };
    rig.registry.update_stat(ino, &stat, true).expect("stat");
    rig.backend
        .put(&data_object_name(ino, BlockNumber(1)), &vec![7_u8; 100])
        .expect("seed");

    assert!(rig.registry.mark_pin(ino, S_IFREG | 0o644).expect("pin"));
    let cache_before = rig.stats.cache_size.load(std::sync::atomic::Ordering::SeqCst);

    let scheduler = rig.pin_scheduler();
    assert_eq!(scheduler.run_pin_pass().expect("pass"), 1);

    assert!(rig.meta.block_path(ino, BlockNumber(1)).exists());
    assert_eq!(
        rig.meta.block_status(ino, BlockNumber(1)).expect("status"),
        BlockStatus::Both
    );
    assert_eq!(
        rig.stats.cache_size.load(std::sync::atomic::Ordering::SeqCst),
        cache_before + 100
    );
    let entry = rig.registry.read_entry(ino).expect("entry");
    assert_eq!(entry.pin_state, PinState::Pinned);
    assert_eq!(rig.registry.header().num_pinning, 0);
}

#[test]
fn pin_quota_draws_caller_then_system_then_fails_cleanly() {
    let rig = Rig::new();
    let mut cfg = rig.cfg.clone();
    cfg.max_pinned_size = 30;
    let scheduler = Arc::new(PinScheduler::new(
        &cfg,
        Arc::clone(&rig.registry),
        Arc::clone(&rig.meta),
        rig.dyn_backend(),
    ));

    let mut remaining = 100_i64;
    scheduler.reserve_pin_quota(60, &mut remaining).expect("caller quota");
    assert_eq!(remaining, 40);
    assert_eq!(rig.stats.pinned_size.load(std::sync::atomic::Ordering::SeqCst), 0);

    scheduler.reserve_pin_quota(60, &mut remaining).expect("spillover");
    assert_eq!(remaining, 0);
    assert_eq!(rig.stats.pinned_size.load(std::sync::atomic::Ordering::SeqCst), 20);

    // 40 more would exceed the 30-byte system cap; nothing changes.
    let mut untouched = 10_i64;
    let err = scheduler.reserve_pin_quota(50, &mut untouched).unwrap_err();
    assert!(matches!(err, tierfs_error::TierError::NoSpace(_)));
    assert_eq!(untouched, 10);
    assert_eq!(rig.stats.pinned_size.load(std::sync::atomic::Ordering::SeqCst), 20);

    scheduler.release_pin_quota(20);
    assert_eq!(rig.stats.pinned_size.load(std::sync::atomic::Ordering::SeqCst), 0);
}
