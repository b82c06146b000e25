//! Deterministic sharded naming for metadata and block files.
//!
//! Both trees fan out over `sub_<n>` shard directories so no single
//! directory grows unbounded. The scheme is pure arithmetic on the inode
//! and block numbers; every component can recompute any path without
//! coordination.

use std::path::{Path, PathBuf};
use tierfs_types::{BlockNumber, InodeNumber};

/// Directory under the metadata root holding staged removal copies.
pub const TODELETE_DIR: &str = "todelete";

#[must_use]
pub fn fetch_meta_path(meta_root: &Path, num_subdirs: u64, inode: InodeNumber) -> PathBuf {
    meta_root
        .join(format!("sub_{}", inode.0 % num_subdirs))
        .join(format!("meta{}", inode.0))
}

#[must_use]
pub fn fetch_block_path(
    block_root: &Path,
    num_subdirs: u64,
    inode: InodeNumber,
    block: BlockNumber,
) -> PathBuf {
    block_root
        .join(format!("sub_{}", (inode.0 + block.0) % num_subdirs))
        .join(format!("block{}_{}", inode.0, block.0))
}

#[must_use]
pub fn fetch_todelete_path(meta_root: &Path, inode: InodeNumber) -> PathBuf {
    meta_root.join(TODELETE_DIR).join(format!("meta{}", inode.0))
}

/// Inverse of the block-file naming, used by the cache scanner when it
/// walks the shard directories. Returns `None` for foreign files.
#[must_use]
pub fn parse_block_filename(name: &str) -> Option<(InodeNumber, BlockNumber)> {
    let rest = name.strip_prefix("block")?;
    let (ino, blk) = rest.split_once('_')?;
    let ino: u64 = ino.parse().ok()?;
    let blk: u64 = blk.parse().ok()?;
    if ino == 0 {
        return None;
    }
    Some((InodeNumber(ino), BlockNumber(blk)))
}
