#![forbid(unsafe_code)]
//! The inode registry: one file holding a header record plus a dense
//! array of fixed-size entries, addressed by inode number.
//!
//! The header carries the heads/tails of four intrusive queues (dirty,
//! to-delete, to-reclaim via the unclaimed log, reclaimed/free) whose
//! links are inode numbers threaded through the entries themselves. The
//! registry is the crash-consistency surface of the tiering core: after
//! a restart, the queues alone say what still needs uploading, deleting,
//! and reclaiming.
//!
//! All state lives behind one mutex as a typed in-memory header mirror
//! plus the backing file; every mutation writes through before the lock
//! is released.

mod alloc;
mod pin;
mod queue;

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tierfs_error::{Result, TierError};
use tierfs_types::{
    InodeNumber, PinState, QueueStatus, RegistryEntry, RegistryHeader, SystemStats, TierConfig,
    ENTRY_SIZE, HEAD_SIZE,
};

const REGISTRY_FILE: &str = "registry";
const UNCLAIMED_FILE: &str = "registry_unclaimed";

pub struct Registry {
    inner: Mutex<RegistryInner>,
    stats: Arc<SystemStats>,
}

pub(crate) struct RegistryInner {
    file: std::fs::File,
    head: RegistryHeader,
    unclaimed_path: PathBuf,
    meta_root: PathBuf,
    num_subdirs: u64,
    reclaim_trigger: i64,
    meta_space_limit: i64,
    max_pinned_size: i64,
    stats: Arc<SystemStats>,
    /// Present while a fullscan is running; `delete` diverts inode
    /// numbers here instead of the unclaimed log.
    temp_unclaimed: Option<Vec<InodeNumber>>,
}

fn entry_offset(inode: InodeNumber) -> u64 {
    HEAD_SIZE as u64 + (inode.0 - 1) * ENTRY_SIZE as u64
}

impl Registry {
    /// Opens (or creates) the registry under `cfg.meta_root`. A header
    /// that does not survive validation against the file size is
    /// discarded and reconstructed from a full entry scan.
    pub fn open(cfg: &TierConfig, stats: Arc<SystemStats>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.meta_root)?;
        let path = cfg.meta_root.join(REGISTRY_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        let mut inner = RegistryInner {
            file,
            head: RegistryHeader::default(),
            unclaimed_path: cfg.meta_root.join(UNCLAIMED_FILE),
            meta_root: cfg.meta_root.clone(),
            num_subdirs: cfg.num_subdirs,
            reclaim_trigger: cfg.reclaim_trigger,
            meta_space_limit: cfg.meta_space_limit,
            max_pinned_size: cfg.max_pinned_size,
            stats: Arc::clone(&stats),
            temp_unclaimed: None,
        };

        if len < HEAD_SIZE as u64 {
            if len != 0 {
                tracing::warn!(len, "registry shorter than its header, reinitializing");
            }
            inner.write_header()?;
            stats.meta_size.fetch_add(HEAD_SIZE as i64, Ordering::SeqCst);
        } else {
            // The registry owns the meta-size counter; on reopen the
            // existing file re-enters the quota.
            stats.meta_size.fetch_add(len as i64, Ordering::SeqCst);
            let mut buf = [0_u8; HEAD_SIZE];
            inner.file.read_exact_at(&mut buf, 0)?;
            inner.head =
                RegistryHeader::decode(&buf).map_err(|e| TierError::Corruption(e.to_string()))?;
            let total_by_size = ((len - HEAD_SIZE as u64) / ENTRY_SIZE as u64) as i64;
            if !header_consistent(&inner.head, total_by_size) {
                tracing::warn!(
                    num_total = inner.head.num_total_inodes,
                    total_by_size,
                    "registry header failed validation, rebuilding from entry scan"
                );
                inner.recover(total_by_size)?;
            }
        }

        Ok(Self {
            inner: Mutex::new(inner),
            stats,
        })
    }

    /// Snapshot of the header record.
    #[must_use]
    pub fn header(&self) -> RegistryHeader {
        self.inner.lock().head
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<SystemStats> {
        &self.stats
    }

    pub fn read_entry(&self, inode: InodeNumber) -> Result<RegistryEntry> {
        self.inner.lock().read_entry(inode)
    }

    /// Replaces a whole entry record. Queue fields are the caller's
    /// responsibility; the queue operations below are the normal path.
    pub fn write_entry(&self, inode: InodeNumber, entry: &RegistryEntry) -> Result<()> {
        self.inner.lock().write_entry(inode, entry)
    }
}

fn header_consistent(head: &RegistryHeader, total_by_size: i64) -> bool {
    let total = head.num_total_inodes;
    if total != total_by_size {
        return false;
    }
    let counts = [
        head.num_dirty,
        head.num_to_delete,
        head.num_to_reclaim,
        head.num_reclaimed,
        head.num_pinning,
        head.num_active_inodes,
        total,
    ];
    if counts.iter().any(|c| *c < 0) {
        return false;
    }
    let in_range = |ino: InodeNumber| (ino.0 as i64) <= total;
    let pairs = [
        (head.first_dirty, head.last_dirty, head.num_dirty),
        (head.first_to_delete, head.last_to_delete, head.num_to_delete),
        (head.first_reclaimed, head.last_reclaimed, head.num_reclaimed),
        (head.first_pin, head.last_pin, head.num_pinning),
    ];
    for (first, last, count) in pairs {
        if !in_range(first) || !in_range(last) {
            return false;
        }
        if (count == 0) != (first.is_null() && last.is_null()) {
            return false;
        }
    }
    true
}

impl RegistryInner {
    pub(crate) fn check_range(&self, inode: InodeNumber) -> Result<()> {
        if inode.is_null() || inode.0 as i64 > self.head.num_total_inodes {
            return Err(TierError::NotFound(format!(
                "inode {inode} outside registry range 1..={}",
                self.head.num_total_inodes
            )));
        }
        Ok(())
    }

    pub(crate) fn read_entry(&self, inode: InodeNumber) -> Result<RegistryEntry> {
        self.check_range(inode)?;
        let mut buf = [0_u8; ENTRY_SIZE];
        self.file.read_exact_at(&mut buf, entry_offset(inode))?;
        RegistryEntry::decode(&buf).map_err(|e| TierError::Corruption(e.to_string()))
    }

    pub(crate) fn write_entry(&self, inode: InodeNumber, entry: &RegistryEntry) -> Result<()> {
        self.check_range(inode)?;
        self.file.write_all_at(&entry.encode(), entry_offset(inode))?;
        Ok(())
    }

    /// Write of a fresh entry at a slot that may extend the file; range
    /// check against the already-bumped `num_total_inodes`.
    pub(crate) fn write_new_entry(&self, inode: InodeNumber, entry: &RegistryEntry) -> Result<()> {
        self.file.write_all_at(&entry.encode(), entry_offset(inode))?;
        Ok(())
    }

    pub(crate) fn write_header(&self) -> Result<()> {
        self.file.write_all_at(&self.head.encode(), 0)?;
        Ok(())
    }

    /// Size on disk of the inode's metadata file, for dirty-size
    /// attribution. A missing file attributes zero.
    pub(crate) fn meta_size_of(&self, inode: InodeNumber) -> i64 {
        let path = tierfs_meta::fetch_meta_path(&self.meta_root, self.num_subdirs, inode);
        std::fs::metadata(path).map_or(0, |m| m.len() as i64)
    }

    /// Full reconstruction of the header and every queue from an entry
    /// scan. Undecodable records are cleared to empty slots (the next
    /// fullscan reclaims them).
    fn recover(&mut self, total: i64) -> Result<()> {
        self.head = RegistryHeader {
            num_total_inodes: total,
            ..RegistryHeader::default()
        };

        let mut dirty = Vec::new();
        let mut to_delete = Vec::new();
        let mut to_reclaim = Vec::new();
        let mut free = Vec::new();
        let mut pinning = Vec::new();
        let mut active: i64 = 0;

        for raw in 1..=total {
            let inode = InodeNumber(raw as u64);
            let entry = match self.read_entry(inode) {
                Ok(entry) => entry,
                Err(_) => {
                    tracing::warn!(inode = raw, "clearing undecodable registry entry");
                    let cleared = RegistryEntry::default();
                    self.write_entry(inode, &cleared)?;
                    cleared
                }
            };
            match entry.status {
                QueueStatus::Dirty => dirty.push(inode),
                QueueStatus::ToDelete => to_delete.push(inode),
                QueueStatus::ToReclaim => to_reclaim.push(inode),
                QueueStatus::Reclaimed => free.push(inode),
                QueueStatus::None => {}
            }
            if entry.stat.ino != 0
                && matches!(entry.status, QueueStatus::None | QueueStatus::Dirty)
            {
                active += 1;
            }
            if entry.pin_state == PinState::Pinning
                && matches!(entry.status, QueueStatus::None | QueueStatus::Dirty)
            {
                pinning.push(inode);
            }
        }

        self.relink_util(&dirty, QueueStatus::Dirty)?;
        self.relink_util(&to_delete, QueueStatus::ToDelete)?;
        self.relink_pin(&pinning)?;
        self.relink_free(&free)?;
        self.rewrite_unclaimed_log(&to_reclaim)?;
        self.head.num_to_reclaim = to_reclaim.len() as i64;
        self.head.num_active_inodes = active;
        self.write_header()?;
        tracing::info!(
            total,
            dirty = dirty.len(),
            to_delete = to_delete.len(),
            to_reclaim = to_reclaim.len(),
            free = free.len(),
            "registry rebuilt from entry scan"
        );
        Ok(())
    }

    /// Rewrites one utility queue's links over the given inodes in
    /// order, and sets the matching header fields.
    pub(crate) fn relink_util(&mut self, list: &[InodeNumber], status: QueueStatus) -> Result<()> {
        for (i, &inode) in list.iter().enumerate() {
            let mut entry = self.read_entry(inode)?;
            entry.status = status;
            entry.util_ll_prev = if i == 0 { InodeNumber::NULL } else { list[i - 1] };
            entry.util_ll_next = list.get(i + 1).copied().unwrap_or(InodeNumber::NULL);
            self.write_entry(inode, &entry)?;
        }
        let first = list.first().copied().unwrap_or(InodeNumber::NULL);
        let last = list.last().copied().unwrap_or(InodeNumber::NULL);
        match status {
            QueueStatus::Dirty => {
                self.head.first_dirty = first;
                self.head.last_dirty = last;
                self.head.num_dirty = list.len() as i64;
            }
            QueueStatus::ToDelete => {
                self.head.first_to_delete = first;
                self.head.last_to_delete = last;
                self.head.num_to_delete = list.len() as i64;
            }
            _ => {}
        }
        Ok(())
    }

    fn relink_pin(&mut self, list: &[InodeNumber]) -> Result<()> {
        for (i, &inode) in list.iter().enumerate() {
            let mut entry = self.read_entry(inode)?;
            entry.pin_ll_prev = if i == 0 { InodeNumber::NULL } else { list[i - 1] };
            entry.pin_ll_next = list.get(i + 1).copied().unwrap_or(InodeNumber::NULL);
            self.write_entry(inode, &entry)?;
        }
        self.head.first_pin = list.first().copied().unwrap_or(InodeNumber::NULL);
        self.head.last_pin = list.last().copied().unwrap_or(InodeNumber::NULL);
        self.head.num_pinning = list.len() as i64;
        Ok(())
    }

    /// Free list is singly linked through `util_ll_next`; ascending
    /// order so the allocator reuses low numbers first.
    fn relink_free(&mut self, list: &[InodeNumber]) -> Result<()> {
        for (i, &inode) in list.iter().enumerate() {
            let mut entry = self.read_entry(inode)?;
            entry.util_ll_prev = InodeNumber::NULL;
            entry.util_ll_next = list.get(i + 1).copied().unwrap_or(InodeNumber::NULL);
            self.write_entry(inode, &entry)?;
        }
        self.head.first_reclaimed = list.first().copied().unwrap_or(InodeNumber::NULL);
        self.head.last_reclaimed = list.last().copied().unwrap_or(InodeNumber::NULL);
        self.head.num_reclaimed = list.len() as i64;
        Ok(())
    }

    pub(crate) fn rewrite_unclaimed_log(&self, list: &[InodeNumber]) -> Result<()> {
        let mut bytes = Vec::with_capacity(list.len() * 8);
        for inode in list {
            bytes.extend_from_slice(&inode.0.to_le_bytes());
        }
        std::fs::write(&self.unclaimed_path, bytes)?;
        Ok(())
    }

    pub(crate) fn append_unclaimed_log(&self, inode: InodeNumber) -> Result<()> {
        use std::io::Write;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.unclaimed_path)?;
        file.write_all(&inode.0.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn read_unclaimed_log(&self) -> Result<Vec<InodeNumber>> {
        let bytes = match std::fs::read(&self.unclaimed_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| InodeNumber(tierfs_types::read_le_u64(chunk, 0)))
            .collect())
    }
}
