#![forbid(unsafe_code)]
//! Core types for TierFS: id newtypes, placement/queue status enums,
//! fixed on-disk record layouts for the inode registry, and the runtime
//! configuration structure.
//!
//! This crate is pure data: no I/O, no side effects. Record encoding is
//! hand-rolled little-endian so that the registry file layout is stable
//! across builds and never depends on a serialization framework.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use thiserror::Error;

// ── Layout constants ────────────────────────────────────────────────────────

/// Size in bytes of the encoded [`InodeStat`] payload.
pub const STAT_SIZE: usize = 56;
/// Size in bytes of one encoded [`RegistryEntry`] record.
pub const ENTRY_SIZE: usize = 128;
/// Size in bytes of the encoded [`RegistryHeader`] record at file start.
pub const HEAD_SIZE: usize = 128;

/// Block-status entries per metadata page.
pub const BLOCK_ENTRIES_PER_PAGE: u64 = 512;
/// Size in bytes of one encoded block-status entry.
pub const BLOCK_ENTRY_SIZE: usize = 8;

/// File-type mask and bits (POSIX `st_mode` layout).
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

// ── Id newtypes ─────────────────────────────────────────────────────────────

/// Inode number. Zero is never a valid inode; it doubles as the list
/// terminator in the registry's intrusive queues.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data-block index within one file (block 0 holds the first
/// `max_block_size` bytes).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode-number reuse counter; distinguishes successive lives of one
/// inode number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

// ── Queue and pin status ────────────────────────────────────────────────────

/// Registry queue membership; mutually exclusive per entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Not on any queue.
    #[default]
    None,
    /// Local changes not yet reflected in the cloud copy.
    Dirty,
    /// Logically removed; cloud objects pending deletion.
    ToDelete,
    /// Cloud deletion done; number pending return to the free pool.
    ToReclaim,
    /// On the free list, available for reuse.
    Reclaimed,
}

impl QueueStatus {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Dirty => 1,
            Self::ToDelete => 2,
            Self::ToReclaim => 3,
            Self::Reclaimed => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, LayoutError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Dirty),
            2 => Ok(Self::ToDelete),
            3 => Ok(Self::ToReclaim),
            4 => Ok(Self::Reclaimed),
            other => Err(LayoutError::InvalidField {
                field: "status",
                value: u64::from(other),
            }),
        }
    }
}

/// Pin policy state of one inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    /// Inode is in the removal flow; pinning no longer applies.
    Deleted,
    /// Subject to normal cache eviction.
    #[default]
    Unpinned,
    /// Queued for pinning; blocks are being fetched.
    Pinning,
    /// All blocks forced locally resident.
    Pinned,
}

impl PinState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Deleted => 0,
            Self::Unpinned => 1,
            Self::Pinning => 2,
            Self::Pinned => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, LayoutError> {
        match value {
            0 => Ok(Self::Deleted),
            1 => Ok(Self::Unpinned),
            2 => Ok(Self::Pinning),
            3 => Ok(Self::Pinned),
            other => Err(LayoutError::InvalidField {
                field: "pin_state",
                value: u64::from(other),
            }),
        }
    }
}

// ── Block placement state ───────────────────────────────────────────────────

/// Placement state of one data block.
///
/// Transitions: `None` → `LDisk` (first local write) → `Both` (upload) →
/// `Cloud` (eviction) → `CToL` (read fault) → `Both`. `LToC`/`CToL` are
/// transient in-progress markers; `ToDelete` defers cloud-object removal
/// to the delete pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    None,
    /// Local disk only. Evicting this would lose data.
    LDisk,
    /// Cloud only; no local copy.
    Cloud,
    /// Resident both locally and in the cloud.
    Both,
    /// Upload in progress (local → cloud).
    LToC,
    /// Download in progress (cloud → local).
    CToL,
    /// Logically removed; cloud object deletion deferred.
    ToDelete,
}

impl BlockStatus {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::LDisk => 1,
            Self::Cloud => 2,
            Self::Both => 3,
            Self::LToC => 4,
            Self::CToL => 5,
            Self::ToDelete => 6,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, LayoutError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::LDisk),
            2 => Ok(Self::Cloud),
            3 => Ok(Self::Both),
            4 => Ok(Self::LToC),
            5 => Ok(Self::CToL),
            6 => Ok(Self::ToDelete),
            other => Err(LayoutError::InvalidField {
                field: "block_status",
                value: u64::from(other),
            }),
        }
    }

    /// Blocks the upload pipeline must (re-)upload.
    #[must_use]
    pub fn needs_upload(self) -> bool {
        matches!(self, Self::LDisk | Self::LToC)
    }

    /// Blocks the eviction scanner may demote to `Cloud`.
    #[must_use]
    pub fn is_evictable(self) -> bool {
        matches!(self, Self::Both)
    }

    /// Blocks with a backing object the delete pipeline must remove.
    #[must_use]
    pub fn has_cloud_footprint(self) -> bool {
        !matches!(self, Self::None | Self::LDisk)
    }

    /// Blocks with a local artifact on disk.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::LDisk | Self::Both | Self::LToC)
    }
}

// ── Stat payload ────────────────────────────────────────────────────────────

/// Ownership/size/mode/timestamps of one inode. Opaque to the tiering
/// core beyond `size` and the file-type bits of `mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeStat {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl InodeStat {
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// True once `to_delete` has cleared the payload; used to detect
    /// inodes in the removal flow.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.ino == 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; STAT_SIZE] {
        let mut buf = [0_u8; STAT_SIZE];
        buf[0..8].copy_from_slice(&self.ino.to_le_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_le_bytes());
        buf[12..16].copy_from_slice(&self.uid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.gid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.nlink.to_le_bytes());
        buf[24..32].copy_from_slice(&self.size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.atime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.mtime.to_le_bytes());
        buf[48..56].copy_from_slice(&self.ctime.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        ensure_len(bytes, STAT_SIZE, "inode_stat")?;
        Ok(Self {
            ino: read_le_u64(bytes, 0),
            mode: read_le_u32(bytes, 8),
            uid: read_le_u32(bytes, 12),
            gid: read_le_u32(bytes, 16),
            nlink: read_le_u32(bytes, 20),
            size: read_le_u64(bytes, 24),
            atime: read_le_i64(bytes, 32),
            mtime: read_le_i64(bytes, 40),
            ctime: read_le_i64(bytes, 48),
        })
    }
}

// ── Registry records ────────────────────────────────────────────────────────

/// One fixed-size record in the inode registry, addressed as
/// `HEAD_SIZE + (inode - 1) * ENTRY_SIZE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryEntry {
    pub stat: InodeStat,
    pub status: QueueStatus,
    pub in_transit: bool,
    pub mod_after_in_transit: bool,
    pub pin_state: PinState,
    pub util_ll_next: InodeNumber,
    pub util_ll_prev: InodeNumber,
    pub pin_ll_next: InodeNumber,
    pub pin_ll_prev: InodeNumber,
    /// Self-identifying inode number; validates free-list walks after a
    /// crash. Zero means the record was never written.
    pub this_index: InodeNumber,
    pub generation: Generation,
    /// Dirty metadata bytes attributed to the system counter while the
    /// entry sits on the dirty queue.
    pub dirty_meta_size: i64,
    pub last_sync_time: i64,
}

impl RegistryEntry {
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0_u8; ENTRY_SIZE];
        buf[0..STAT_SIZE].copy_from_slice(&self.stat.encode());
        buf[56] = self.status.as_u8();
        buf[57] = u8::from(self.in_transit);
        buf[58] = u8::from(self.mod_after_in_transit);
        buf[59] = self.pin_state.as_u8();
        buf[64..72].copy_from_slice(&self.util_ll_next.0.to_le_bytes());
        buf[72..80].copy_from_slice(&self.util_ll_prev.0.to_le_bytes());
        buf[80..88].copy_from_slice(&self.pin_ll_next.0.to_le_bytes());
        buf[88..96].copy_from_slice(&self.pin_ll_prev.0.to_le_bytes());
        buf[96..104].copy_from_slice(&self.this_index.0.to_le_bytes());
        buf[104..112].copy_from_slice(&self.generation.0.to_le_bytes());
        buf[112..120].copy_from_slice(&self.dirty_meta_size.to_le_bytes());
        buf[120..128].copy_from_slice(&self.last_sync_time.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        ensure_len(bytes, ENTRY_SIZE, "registry_entry")?;
        Ok(Self {
            stat: InodeStat::decode(&bytes[0..STAT_SIZE])?,
            status: QueueStatus::from_u8(bytes[56])?,
            in_transit: bytes[57] != 0,
            mod_after_in_transit: bytes[58] != 0,
            pin_state: PinState::from_u8(bytes[59])?,
            util_ll_next: InodeNumber(read_le_u64(bytes, 64)),
            util_ll_prev: InodeNumber(read_le_u64(bytes, 72)),
            pin_ll_next: InodeNumber(read_le_u64(bytes, 80)),
            pin_ll_prev: InodeNumber(read_le_u64(bytes, 88)),
            this_index: InodeNumber(read_le_u64(bytes, 96)),
            generation: Generation(read_le_u64(bytes, 104)),
            dirty_meta_size: read_le_i64(bytes, 112),
            last_sync_time: read_le_i64(bytes, 120),
        })
    }
}

/// The single header record at the start of the registry file: queue
/// head/tail pointers and aggregate counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryHeader {
    pub num_reclaimed: i64,
    pub first_reclaimed: InodeNumber,
    pub last_reclaimed: InodeNumber,
    pub first_dirty: InodeNumber,
    pub last_dirty: InodeNumber,
    pub first_to_delete: InodeNumber,
    pub last_to_delete: InodeNumber,
    pub first_pin: InodeNumber,
    pub last_pin: InodeNumber,
    pub num_pinning: i64,
    pub num_to_reclaim: i64,
    pub num_to_delete: i64,
    pub num_dirty: i64,
    /// High-water mark of allocated inode numbers, in use or pending
    /// reclaim.
    pub num_total_inodes: i64,
    pub num_active_inodes: i64,
}

impl RegistryHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let mut buf = [0_u8; HEAD_SIZE];
        buf[0..8].copy_from_slice(&self.num_reclaimed.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_reclaimed.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_reclaimed.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_dirty.0.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_dirty.0.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_to_delete.0.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_to_delete.0.to_le_bytes());
        buf[56..64].copy_from_slice(&self.first_pin.0.to_le_bytes());
        buf[64..72].copy_from_slice(&self.last_pin.0.to_le_bytes());
        buf[72..80].copy_from_slice(&self.num_pinning.to_le_bytes());
        buf[80..88].copy_from_slice(&self.num_to_reclaim.to_le_bytes());
        buf[88..96].copy_from_slice(&self.num_to_delete.to_le_bytes());
        buf[96..104].copy_from_slice(&self.num_dirty.to_le_bytes());
        buf[104..112].copy_from_slice(&self.num_total_inodes.to_le_bytes());
        buf[112..120].copy_from_slice(&self.num_active_inodes.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        ensure_len(bytes, HEAD_SIZE, "registry_header")?;
        Ok(Self {
            num_reclaimed: read_le_i64(bytes, 0),
            first_reclaimed: InodeNumber(read_le_u64(bytes, 8)),
            last_reclaimed: InodeNumber(read_le_u64(bytes, 16)),
            first_dirty: InodeNumber(read_le_u64(bytes, 24)),
            last_dirty: InodeNumber(read_le_u64(bytes, 32)),
            first_to_delete: InodeNumber(read_le_u64(bytes, 40)),
            last_to_delete: InodeNumber(read_le_u64(bytes, 48)),
            first_pin: InodeNumber(read_le_u64(bytes, 56)),
            last_pin: InodeNumber(read_le_u64(bytes, 64)),
            num_pinning: read_le_i64(bytes, 72),
            num_to_reclaim: read_le_i64(bytes, 80),
            num_to_delete: read_le_i64(bytes, 88),
            num_dirty: read_le_i64(bytes, 96),
            num_total_inodes: read_le_i64(bytes, 104),
            num_active_inodes: read_le_i64(bytes, 112),
        })
    }
}

// ── Byte helpers ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("insufficient data for {record}: need {needed} bytes, got {actual}")]
    InsufficientData {
        record: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("invalid field {field}: value {value}")]
    InvalidField { field: &'static str, value: u64 },
}

fn ensure_len(bytes: &[u8], needed: usize, record: &'static str) -> Result<(), LayoutError> {
    if bytes.len() < needed {
        return Err(LayoutError::InsufficientData {
            record,
            needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

#[must_use]
pub fn read_le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[must_use]
pub fn read_le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[must_use]
pub fn read_le_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

// ── System counters ─────────────────────────────────────────────────────────

/// Process-wide tiering counters and the shutdown flag.
///
/// Counters are plain atomics; each is adjusted in the same call that
/// performs the physical effect it describes (block create/unlink,
/// registry growth), so readers see a value at most one operation stale.
#[derive(Debug, Default)]
pub struct SystemStats {
    /// Bytes of block data resident in the local cache.
    pub cache_size: AtomicI64,
    /// Count of locally resident blocks.
    pub cache_blocks: AtomicI64,
    /// Bytes of locally cached block data not yet uploaded.
    pub dirty_cache_size: AtomicI64,
    /// Bytes of metadata attributed to dirty-queued inodes.
    pub dirty_meta_size: AtomicI64,
    /// Total metadata bytes (registry plus per-file metadata).
    pub meta_size: AtomicI64,
    /// Bytes pinned locally by policy.
    pub pinned_size: AtomicI64,
    /// Logical bytes stored system-wide.
    pub system_size: AtomicI64,
    /// Cooperative shutdown flag, checked at pipeline loop boundaries.
    pub going_down: AtomicBool,
}

impl SystemStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_going_down(&self) -> bool {
        self.going_down.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.going_down.store(true, Ordering::SeqCst);
    }

    /// Account one block entering the local cache.
    pub fn add_cache_block(&self, bytes: i64) {
        self.cache_size.fetch_add(bytes, Ordering::SeqCst);
        self.cache_blocks.fetch_add(1, Ordering::SeqCst);
    }

    /// Account one block leaving the local cache.
    pub fn remove_cache_block(&self, bytes: i64) {
        self.cache_size.fetch_sub(bytes, Ordering::SeqCst);
        self.cache_blocks.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Runtime configuration for the tiering core.
///
/// Loaded by the (out-of-scope) bootstrap code; every field has a
/// production default so tests can build one with struct-update syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Root of the metadata tree (registry file, sharded meta files,
    /// unclaimed logs).
    pub meta_root: PathBuf,
    /// Root of the sharded local block cache.
    pub block_root: PathBuf,
    /// Number of `sub_<n>` shard directories under each root.
    pub num_subdirs: u64,
    /// Maximum bytes per data block.
    pub max_block_size: u64,
    /// Cache bytes above which the eviction scanner starts demoting.
    pub cache_soft_limit: i64,
    /// Cache bytes above which writers block in `sleep_on_cache_full`.
    pub cache_hard_limit: i64,
    /// Hysteresis below the hard limit before blocked writers are woken.
    pub cache_delta: i64,
    /// Entries touched within this many seconds are skipped by the first
    /// eviction pass.
    pub recent_secs: i64,
    /// Minimum pending count before a non-fullscan reclaim does work.
    pub reclaim_trigger: i64,
    /// Metadata-space budget; `new_inode` fails with `NoSpace` beyond it.
    pub meta_space_limit: i64,
    /// System-wide pinned-bytes budget.
    pub max_pinned_size: i64,
    /// Concurrent per-inode sync drivers.
    pub max_sync_concurrency: usize,
    /// Concurrent block upload/delete workers (shared pool).
    pub max_upload_concurrency: usize,
    /// Concurrent per-inode delete drivers.
    pub max_dsync_concurrency: usize,
    /// Concurrent pin-fetch workers.
    pub max_pin_concurrency: usize,
    /// Bounded retries per object transfer before surfacing the error.
    pub max_object_retries: u32,
    /// Seconds the pin scheduler backs off after a terminal fetch error.
    pub pin_deep_sleep_secs: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            meta_root: PathBuf::from("/var/lib/tierfs/meta"),
            block_root: PathBuf::from("/var/lib/tierfs/block"),
            num_subdirs: 64,
            max_block_size: 1 << 20,
            cache_soft_limit: 4 << 30,
            cache_hard_limit: 5 << 30,
            cache_delta: 64 << 20,
            recent_secs: 300,
            reclaim_trigger: 1024,
            meta_space_limit: i64::MAX,
            max_pinned_size: i64::MAX,
            max_sync_concurrency: 4,
            max_upload_concurrency: 8,
            max_dsync_concurrency: 2,
            max_pin_concurrency: 2,
            max_object_retries: 4,
            pin_deep_sleep_secs: 60,
        }
    }
}
