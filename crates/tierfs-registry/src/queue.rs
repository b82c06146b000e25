//! Intrusive queue engine: enqueue/dequeue over the dirty and to-delete
//! lists, dirty marking, transit ownership, and crash rebuild.

use crate::{Registry, RegistryInner};
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tierfs_error::{Result, TierError};
use tierfs_types::{InodeNumber, InodeStat, QueueStatus, RegistryEntry};

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

impl Registry {
    /// Puts the inode on the dirty queue. Idempotent: an inode already
    /// dirty stays where it is; if a worker owns it (`in_transit`) the
    /// modification is recorded so the worker's completion cannot retire
    /// it early.
    pub fn mark_dirty(&self, inode: InodeNumber) -> Result<()> {
        self.inner.lock().mark_dirty(inode)
    }

    /// Replaces the stat payload. Unless `no_sync`, the inode is also
    /// marked dirty. No-op on a removed or never-used inode.
    pub fn update_stat(&self, inode: InodeNumber, stat: &InodeStat, no_sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if entry.stat.ino == 0
            || !matches!(entry.status, QueueStatus::None | QueueStatus::Dirty)
        {
            return Ok(());
        }
        entry.stat = *stat;
        entry.stat.ino = inode.0;
        inner.write_entry(inode, &entry)?;
        if !no_sync {
            inner.mark_dirty(inode)?;
        }
        Ok(())
    }

    /// Transfers transit ownership of the inode to or from a sync
    /// worker. Clearing a completed transfer (`incomplete == false`)
    /// retires the inode from the dirty queue unless it was modified
    /// again meanwhile; a failed transfer leaves it dirty for a later
    /// pass either way.
    pub fn update_transit(
        &self,
        inode: InodeNumber,
        starting: bool,
        incomplete: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if starting {
            if entry.status == QueueStatus::Dirty {
                entry.in_transit = true;
                entry.mod_after_in_transit = false;
                inner.write_entry(inode, &entry)?;
            }
            return Ok(());
        }
        if !entry.in_transit {
            return Ok(());
        }
        if !incomplete {
            entry.last_sync_time = unix_now();
            if !entry.mod_after_in_transit && entry.status == QueueStatus::Dirty {
                inner.ll_dequeue(inode, &mut entry)?;
                inner.write_header()?;
            }
        }
        entry.in_transit = false;
        entry.mod_after_in_transit = false;
        inner.write_entry(inode, &entry)
    }

    /// Atomically claims a dirty inode for the upload pipeline. Returns
    /// false if it is not dirty or another worker already owns it.
    pub fn try_claim_sync(&self, inode: InodeNumber) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if entry.status != QueueStatus::Dirty || entry.in_transit {
            return Ok(false);
        }
        entry.in_transit = true;
        entry.mod_after_in_transit = false;
        inner.write_entry(inode, &entry)?;
        Ok(true)
    }

    /// Rebuilds the dirty queue from a full entry scan. A nonzero
    /// `hint` inode is promoted to dirty first if it is live and
    /// unqueued.
    pub fn rebuild_dirty(&self, hint: InodeNumber) -> Result<()> {
        self.inner.lock().rebuild_queue(QueueStatus::Dirty, hint)
    }

    /// Inode numbers on the dirty queue, head to tail.
    pub fn dirty_snapshot(&self) -> Result<Vec<InodeNumber>> {
        self.inner.lock().snapshot_queue(QueueStatus::Dirty)
    }

    /// Inode numbers on the to-delete queue, head to tail.
    pub fn todelete_snapshot(&self) -> Result<Vec<InodeNumber>> {
        self.inner.lock().snapshot_queue(QueueStatus::ToDelete)
    }
}

impl RegistryInner {
    fn util_first(&self, queue: QueueStatus) -> InodeNumber {
        match queue {
            QueueStatus::Dirty => self.head.first_dirty,
            QueueStatus::ToDelete => self.head.first_to_delete,
            _ => InodeNumber::NULL,
        }
    }

    fn util_last(&self, queue: QueueStatus) -> InodeNumber {
        match queue {
            QueueStatus::Dirty => self.head.last_dirty,
            QueueStatus::ToDelete => self.head.last_to_delete,
            _ => InodeNumber::NULL,
        }
    }

    fn set_util_first(&mut self, queue: QueueStatus, inode: InodeNumber) {
        match queue {
            QueueStatus::Dirty => self.head.first_dirty = inode,
            QueueStatus::ToDelete => self.head.first_to_delete = inode,
            _ => {}
        }
    }

    fn set_util_last(&mut self, queue: QueueStatus, inode: InodeNumber) {
        match queue {
            QueueStatus::Dirty => self.head.last_dirty = inode,
            QueueStatus::ToDelete => self.head.last_to_delete = inode,
            _ => {}
        }
    }

    fn util_count(&self, queue: QueueStatus) -> i64 {
        match queue {
            QueueStatus::Dirty => self.head.num_dirty,
            QueueStatus::ToDelete => self.head.num_to_delete,
            _ => 0,
        }
    }

    fn bump_util_count(&mut self, queue: QueueStatus, delta: i64) {
        match queue {
            QueueStatus::Dirty => self.head.num_dirty += delta,
            QueueStatus::ToDelete => self.head.num_to_delete += delta,
            _ => {}
        }
    }

    pub(crate) fn mark_dirty(&mut self, inode: InodeNumber) -> Result<()> {
        let mut entry = self.read_entry(inode)?;
        match entry.status {
            QueueStatus::None => {
                if entry.stat.ino == 0 {
                    return Ok(());
                }
                self.ll_enqueue(inode, QueueStatus::Dirty, &mut entry)?;
                self.refresh_dirty_attribution(inode, &mut entry);
                self.write_entry(inode, &entry)?;
                self.write_header()
            }
            QueueStatus::Dirty => {
                if entry.in_transit {
                    entry.mod_after_in_transit = true;
                }
                self.refresh_dirty_attribution(inode, &mut entry);
                self.write_entry(inode, &entry)
            }
            _ => Ok(()),
        }
    }

    fn refresh_dirty_attribution(&self, inode: InodeNumber, entry: &mut RegistryEntry) {
        let size = self.meta_size_of(inode);
        let delta = size - entry.dirty_meta_size;
        entry.dirty_meta_size = size;
        self.stats.dirty_meta_size.fetch_add(delta, Ordering::SeqCst);
    }

    /// Appends the entry at the tail of `target`, first dequeuing it
    /// from wherever it currently sits. Appending to the allocator's
    /// lists (ToReclaim/Reclaimed) is a no-op. The entry itself is not
    /// written here; the caller persists entry and header together.
    pub(crate) fn ll_enqueue(
        &mut self,
        inode: InodeNumber,
        target: QueueStatus,
        entry: &mut RegistryEntry,
    ) -> Result<()> {
        if entry.status == target {
            return Ok(());
        }
        if entry.status != QueueStatus::None {
            self.ll_dequeue(inode, entry)?;
        }
        if !matches!(target, QueueStatus::Dirty | QueueStatus::ToDelete) {
            return Ok(());
        }
        let last = self.util_last(target);
        entry.util_ll_prev = last;
        entry.util_ll_next = InodeNumber::NULL;
        if last.is_null() {
            self.set_util_first(target, inode);
        } else {
            let mut tail = self.read_entry(last)?;
            tail.util_ll_next = inode;
            self.write_entry(last, &tail)?;
        }
        self.set_util_last(target, inode);
        self.bump_util_count(target, 1);
        entry.status = target;
        Ok(())
    }

    /// Splices the entry out of its queue, fixing neighbor links or the
    /// header pointers. A dirty entry whose neighbor links contradict
    /// the list is treated as corruption and triggers a queue rebuild
    /// before the dequeue proceeds.
    pub(crate) fn ll_dequeue(
        &mut self,
        inode: InodeNumber,
        entry: &mut RegistryEntry,
    ) -> Result<()> {
        let queue = entry.status;
        if !matches!(queue, QueueStatus::Dirty | QueueStatus::ToDelete) {
            return Ok(());
        }

        if queue == QueueStatus::Dirty && !self.links_consistent(inode, entry) {
            tracing::warn!(%inode, "dirty queue links inconsistent, rebuilding");
            self.rebuild_queue(QueueStatus::Dirty, InodeNumber::NULL)?;
            *entry = self.read_entry(inode)?;
            if entry.status != QueueStatus::Dirty {
                return Ok(());
            }
        }

        let prev = entry.util_ll_prev;
        let next = entry.util_ll_next;
        if prev.is_null() {
            self.set_util_first(queue, next);
        } else {
            let mut prev_entry = self.read_entry(prev)?;
            prev_entry.util_ll_next = next;
            self.write_entry(prev, &prev_entry)?;
        }
        if next.is_null() {
            self.set_util_last(queue, prev);
        } else {
            let mut next_entry = self.read_entry(next)?;
            next_entry.util_ll_prev = prev;
            self.write_entry(next, &next_entry)?;
        }
        self.bump_util_count(queue, -1);

        if queue == QueueStatus::Dirty {
            self.stats
                .dirty_meta_size
                .fetch_sub(entry.dirty_meta_size, Ordering::SeqCst);
            entry.dirty_meta_size = 0;
        }
        entry.status = QueueStatus::None;
        entry.util_ll_next = InodeNumber::NULL;
        entry.util_ll_prev = InodeNumber::NULL;
        Ok(())
    }

    /// A link pointing out of range or at an entry that does not point
    /// back counts as inconsistent, not as an error.
    fn links_consistent(&self, inode: InodeNumber, entry: &RegistryEntry) -> bool {
        let queue = entry.status;
        let prev_ok = if entry.util_ll_prev.is_null() {
            self.util_first(queue) == inode
        } else {
            match self.read_entry(entry.util_ll_prev) {
                Ok(prev) => prev.util_ll_next == inode,
                Err(_) => false,
            }
        };
        if !prev_ok {
            return false;
        }
        if entry.util_ll_next.is_null() {
            self.util_last(queue) == inode
        } else {
            match self.read_entry(entry.util_ll_next) {
                Ok(next) => next.util_ll_prev == inode,
                Err(_) => false,
            }
        }
    }

    /// Reconstructs one utility queue by linear rescan, linking members
    /// in inode order.
    pub(crate) fn rebuild_queue(&mut self, queue: QueueStatus, hint: InodeNumber) -> Result<()> {
        if !hint.is_null() && hint.0 as i64 <= self.head.num_total_inodes {
            let mut entry = self.read_entry(hint)?;
            if entry.status == QueueStatus::None && entry.stat.ino != 0 {
                entry.status = queue;
                self.write_entry(hint, &entry)?;
            }
        }
        let total = self.head.num_total_inodes;
        let mut members = Vec::new();
        for raw in 1..=total {
            let inode = InodeNumber(raw as u64);
            if self.read_entry(inode)?.status == queue {
                members.push(inode);
            }
        }
        self.relink_util(&members, queue)?;
        self.write_header()?;
        tracing::info!(?queue, count = members.len(), "queue rebuilt by rescan");
        Ok(())
    }

    /// Walks a queue head to tail. A walk that exceeds the recorded
    /// count or ends early is inconsistent; the queue is rebuilt and
    /// walked once more.
    fn snapshot_queue(&mut self, queue: QueueStatus) -> Result<Vec<InodeNumber>> {
        match self.try_snapshot_queue(queue)? {
            Some(list) => Ok(list),
            None => {
                tracing::warn!(?queue, "queue walk inconsistent, rebuilding");
                self.rebuild_queue(queue, InodeNumber::NULL)?;
                self.try_snapshot_queue(queue)?.ok_or_else(|| {
                    TierError::Corruption(format!("queue {queue:?} invalid after rebuild"))
                })
            }
        }
    }

    fn try_snapshot_queue(&self, queue: QueueStatus) -> Result<Option<Vec<InodeNumber>>> {
        let count = self.util_count(queue);
        let mut out = Vec::with_capacity(count.max(0) as usize);
        let mut cursor = self.util_first(queue);
        while !cursor.is_null() {
            if out.len() as i64 >= count {
                return Ok(None);
            }
            out.push(cursor);
            cursor = self.read_entry(cursor)?.util_ll_next;
        }
        if out.len() as i64 != count {
            return Ok(None);
        }
        Ok(Some(out))
    }
}
