//! Usage-table construction: one scan of the sharded block tree
//! yielding, per inode, how many locally cached bytes it holds (split
//! clean/dirty) and when it was last touched.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use tierfs_error::Result;
use tierfs_meta::{parse_block_filename, MetaStore};
use tierfs_types::InodeNumber;

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageEntry {
    /// Locally cached bytes whose blocks are already in the cloud.
    pub clean_bytes: i64,
    /// Locally cached bytes not yet uploaded.
    pub dirty_bytes: i64,
    /// Last access or modification of any block, unix seconds.
    pub last_touched: i64,
    pub block_files: u64,
}

/// Keyed by inode; BTreeMap so the eviction round-robin walks in a
/// stable order.
#[derive(Debug, Default)]
pub struct UsageTable {
    pub entries: BTreeMap<InodeNumber, UsageEntry>,
    pub built_at: i64,
}

impl UsageTable {
    #[must_use]
    pub fn total_cached_bytes(&self) -> i64 {
        self.entries
            .values()
            .map(|e| e.clean_bytes + e.dirty_bytes)
            .sum()
    }
}

/// Builds the table by walking every `sub_*` shard under the block
/// root. Foreign files are ignored; a block whose metadata cannot be
/// consulted is counted clean (eviction re-checks placement before
/// touching it anyway).
pub fn build_usage_table(meta: &MetaStore) -> Result<UsageTable> {
    let mut table = UsageTable {
        built_at: now(),
        ..UsageTable::default()
    };
    let root = meta.block_root();
    for shard in std::fs::read_dir(root)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(shard.path())? {
            let file = file?;
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((inode, block)) = parse_block_filename(name) else {
                continue;
            };
            let md = match file.metadata() {
                Ok(md) => md,
                // Raced with an unlink; the block is simply gone.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let bytes = md.len() as i64;
            let touched = md.atime().max(md.mtime());
            let dirty = meta
                .block_status(inode, block)
                .map_or(false, |s| s.needs_upload());

            let entry = table.entries.entry(inode).or_default();
            if dirty {
                entry.dirty_bytes += bytes;
            } else {
                entry.clean_bytes += bytes;
            }
            entry.last_touched = entry.last_touched.max(touched);
            entry.block_files += 1;
        }
    }
    tracing::debug!(
        inodes = table.entries.len(),
        bytes = table.total_cached_bytes(),
        "usage table built"
    );
    Ok(table)
}

pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierfs_types::{BlockNumber, BlockStatus, InodeStat, TierConfig, S_IFREG};

    fn store() -> (MetaStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let cfg = TierConfig {
            meta_root: dir.path().join("meta"),
            block_root: dir.path().join("block"),
            ..TierConfig::default()
        };
        (MetaStore::open(&cfg).expect("open"), dir)
    }

    fn put_block(meta: &MetaStore, ino: u64, blk: u64, len: usize, status: BlockStatus) {
        let inode = InodeNumber(ino);
        let block = BlockNumber(blk);
        let path = meta.block_path(inode, block);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, vec![0_u8; len]).expect("write block");
        meta.set_block_status(inode, block, status).expect("status");
    }

    #[test]
    fn table_splits_clean_and_dirty_bytes() {
        let (meta, _dir) = store();
        for ino in [1_u64, 2] {
            meta.create_meta(
                InodeNumber(ino),
                &InodeStat {
                    ino,
                    mode: S_IFREG | 0o644,
                    size: 3000,
                    ..InodeStat::default()
                },
            )
            .expect("meta");
        }
        put_block(&meta, 1, 0, 1000, BlockStatus::Both);
        put_block(&meta, 1, 1, 500, BlockStatus::LDisk);
        put_block(&meta, 2, 0, 2000, BlockStatus::Both);

        let table = build_usage_table(&meta).expect("build");
        assert_eq!(table.entries.len(), 2);
        let one = table.entries[&InodeNumber(1)];
        assert_eq!(one.clean_bytes, 1000);
        assert_eq!(one.dirty_bytes, 500);
        assert_eq!(one.block_files, 2);
        assert!(one.last_touched > 0);
        let two = table.entries[&InodeNumber(2)];
        assert_eq!(two.clean_bytes, 2000);
        assert_eq!(two.dirty_bytes, 0);
        assert_eq!(table.total_cached_bytes(), 3500);
    }

    #[test]
    fn foreign_files_are_ignored() {
        let (meta, _dir) = store();
        let shard = meta.block_root().join("sub_0");
        std::fs::create_dir_all(&shard).expect("mkdir");
        std::fs::write(shard.join("not_a_block"), b"x").expect("write");
        let table = build_usage_table(&meta).expect("build");
        assert!(table.entries.is_empty());
    }
}
