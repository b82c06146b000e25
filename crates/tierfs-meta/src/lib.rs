#![forbid(unsafe_code)]
//! Per-file metadata files and the block placement state machine.
//!
//! Each inode owns one metadata file under the sharded metadata tree:
//! the stat payload, a small fixed header, then dense pages of one-byte
//! block placement states indexed by block number. All mutation happens
//! under that inode's slot in a shared lock table, so a placement
//! transition and the physical block create/unlink it describes are one
//! critical section.

pub mod paths;

use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tierfs_error::{Result, TierError};
use tierfs_types::{
    BlockNumber, BlockStatus, InodeNumber, InodeStat, TierConfig, BLOCK_ENTRIES_PER_PAGE,
    BLOCK_ENTRY_SIZE, STAT_SIZE,
};

pub use paths::{fetch_block_path, fetch_meta_path, fetch_todelete_path, parse_block_filename};

// ── Meta file layout ────────────────────────────────────────────────────────

const META_MAGIC: [u8; 4] = *b"TFM1";
const FILE_HEADER_SIZE: usize = 16;
/// Byte offset of the first block-status page.
const PAGES_OFFSET: u64 = (STAT_SIZE + FILE_HEADER_SIZE) as u64;
const PAGE_SIZE: u64 = BLOCK_ENTRIES_PER_PAGE * BLOCK_ENTRY_SIZE as u64;

fn block_entry_offset(block: BlockNumber) -> u64 {
    let page = block.0 / BLOCK_ENTRIES_PER_PAGE;
    let slot = block.0 % BLOCK_ENTRIES_PER_PAGE;
    PAGES_OFFSET + page * PAGE_SIZE + slot * BLOCK_ENTRY_SIZE as u64
}

/// Number of data blocks covering `size` bytes.
#[must_use]
pub fn block_count(size: u64, max_block_size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        (size - 1) / max_block_size + 1
    }
}

const LOCK_SHARDS: usize = 64;

/// Metadata store rooted at the configured meta/block trees.
pub struct MetaStore {
    meta_root: PathBuf,
    block_root: PathBuf,
    num_subdirs: u64,
    max_block_size: u64,
    locks: Vec<Mutex<()>>,
}

/// Held for the duration of one metadata critical section.
pub struct MetaGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl MetaStore {
    pub fn open(cfg: &TierConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.meta_root)?;
        fs::create_dir_all(&cfg.block_root)?;
        fs::create_dir_all(cfg.meta_root.join(paths::TODELETE_DIR))?;
        let mut locks = Vec::with_capacity(LOCK_SHARDS);
        locks.resize_with(LOCK_SHARDS, Mutex::default);
        Ok(Self {
            meta_root: cfg.meta_root.clone(),
            block_root: cfg.block_root.clone(),
            num_subdirs: cfg.num_subdirs,
            max_block_size: cfg.max_block_size,
            locks,
        })
    }

    #[must_use]
    pub fn meta_root(&self) -> &Path {
        &self.meta_root
    }

    #[must_use]
    pub fn block_root(&self) -> &Path {
        &self.block_root
    }

    #[must_use]
    pub fn max_block_size(&self) -> u64 {
        self.max_block_size
    }

    /// Locks the inode's metadata slot. Callers hold the guard across a
    /// placement transition and its physical effect.
    #[must_use]
    pub fn lock(&self, inode: InodeNumber) -> MetaGuard<'_> {
        MetaGuard {
            _guard: self.locks[(inode.0 as usize) % LOCK_SHARDS].lock(),
        }
    }

    #[must_use]
    pub fn meta_path(&self, inode: InodeNumber) -> PathBuf {
        fetch_meta_path(&self.meta_root, self.num_subdirs, inode)
    }

    #[must_use]
    pub fn block_path(&self, inode: InodeNumber, block: BlockNumber) -> PathBuf {
        fetch_block_path(&self.block_root, self.num_subdirs, inode, block)
    }

    #[must_use]
    pub fn todelete_path(&self, inode: InodeNumber) -> PathBuf {
        fetch_todelete_path(&self.meta_root, inode)
    }

    // ── Meta file lifecycle ─────────────────────────────────────────────

    /// Creates the metadata file for a fresh inode. Fails if one already
    /// exists (a reclaimed number must not be reused while its old
    /// metadata survives).
    pub fn create_meta(&self, inode: InodeNumber, stat: &InodeStat) -> Result<()> {
        let path = self.meta_path(inode);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all_at(&stat.encode(), 0)?;
        let mut header = [0_u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&META_MAGIC);
        header[4] = 1;
        file.write_all_at(&header, STAT_SIZE as u64)?;
        Ok(())
    }

    pub fn read_stat(&self, inode: InodeNumber) -> Result<InodeStat> {
        let file = self.open_meta(inode)?;
        let mut buf = [0_u8; STAT_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        InodeStat::decode(&buf).map_err(|e| TierError::Corruption(e.to_string()))
    }

    pub fn write_stat(&self, inode: InodeNumber, stat: &InodeStat) -> Result<()> {
        let file = self.open_meta_rw(inode)?;
        file.write_all_at(&stat.encode(), 0)?;
        Ok(())
    }

    /// Moves the metadata file to the to-delete staging area, where the
    /// delete pipeline reads it after the inode is logically gone.
    pub fn stage_todelete(&self, inode: InodeNumber) -> Result<()> {
        let from = self.meta_path(inode);
        let to = self.todelete_path(inode);
        fs::rename(&from, &to)?;
        Ok(())
    }

    pub fn remove_todelete(&self, inode: InodeNumber) -> Result<()> {
        match fs::remove_file(self.todelete_path(inode)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stat of the staged removal copy, if one exists.
    pub fn read_todelete_stat(&self, inode: InodeNumber) -> Result<InodeStat> {
        let file = File::open(self.todelete_path(inode))?;
        let mut buf = [0_u8; STAT_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        InodeStat::decode(&buf).map_err(|e| TierError::Corruption(e.to_string()))
    }

    // ── Block placement ─────────────────────────────────────────────────

    /// Placement state of one block. Blocks past the end of the written
    /// pages have never been touched and are `None`.
    pub fn block_status(&self, inode: InodeNumber, block: BlockNumber) -> Result<BlockStatus> {
        let file = self.open_meta(inode)?;
        self.block_status_in(&file, block)
    }

    /// Placement state read from the staged removal copy.
    pub fn todelete_block_status(
        &self,
        inode: InodeNumber,
        block: BlockNumber,
    ) -> Result<BlockStatus> {
        let file = File::open(self.todelete_path(inode))?;
        self.block_status_in(&file, block)
    }

    fn block_status_in(&self, file: &File, block: BlockNumber) -> Result<BlockStatus> {
        let offset = block_entry_offset(block);
        let len = file.metadata()?.len();
        if offset + BLOCK_ENTRY_SIZE as u64 > len {
            return Ok(BlockStatus::None);
        }
        let mut buf = [0_u8; BLOCK_ENTRY_SIZE];
        file.read_exact_at(&mut buf, offset)?;
        BlockStatus::from_u8(buf[0]).map_err(|e| {
            tracing::warn!(block = block.0, "undecodable block status byte");
            TierError::Corruption(e.to_string())
        })
    }

    pub fn set_block_status(
        &self,
        inode: InodeNumber,
        block: BlockNumber,
        status: BlockStatus,
    ) -> Result<()> {
        let file = self.open_meta_rw(inode)?;
        let mut buf = [0_u8; BLOCK_ENTRY_SIZE];
        buf[0] = status.as_u8();
        file.write_all_at(&buf, block_entry_offset(block))?;
        Ok(())
    }

    /// Conditional placement transition. `next` sees the current state
    /// and returns the replacement, or `None` to leave it untouched. The
    /// whole exchange runs under the inode's metadata lock; the previous
    /// state is returned so callers can tell a skip from a transition.
    pub fn transition_block(
        &self,
        inode: InodeNumber,
        block: BlockNumber,
        next: impl FnOnce(BlockStatus) -> Option<BlockStatus>,
    ) -> Result<(BlockStatus, Option<BlockStatus>)> {
        let _guard = self.lock(inode);
        let current = self.block_status(inode, block)?;
        let replacement = next(current);
        if let Some(status) = replacement {
            self.set_block_status(inode, block, status)?;
        }
        Ok((current, replacement))
    }

    fn open_meta(&self, inode: InodeNumber) -> Result<File> {
        Ok(File::open(self.meta_path(inode))?)
    }

    fn open_meta_rw(&self, inode: InodeNumber) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.meta_path(inode))?)
    }
}
