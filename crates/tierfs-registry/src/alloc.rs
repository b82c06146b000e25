//! Inode-number allocator and reclaimer.
//!
//! Freed numbers travel ToDelete → ToReclaim → Reclaimed. The ToReclaim
//! step is made crash-durable by an append-only log of raw inode
//! numbers; `reclaim` replays the log in bulk once enough numbers are
//! pending, and `reclaim_fullscan` rebuilds the free list from nothing
//! by walking every entry.

use crate::{Registry, RegistryInner};
use std::sync::atomic::Ordering;
use tierfs_error::{Result, TierError};
use tierfs_types::{
    Generation, InodeNumber, InodeStat, PinState, QueueStatus, RegistryEntry, ENTRY_SIZE,
};

impl Registry {
    /// Allocates an inode number: the free-list head when one exists,
    /// otherwise the next number past the high-water mark. The returned
    /// entry is live, unqueued, and carries a generation one above the
    /// number's previous life.
    pub fn new_inode(&self, stat: &InodeStat, pinned: bool) -> Result<InodeNumber> {
        let mut inner = self.inner.lock();

        let meta_size = inner.stats.meta_size.load(Ordering::SeqCst);
        if meta_size + ENTRY_SIZE as i64 > inner.meta_space_limit {
            return Err(TierError::NoSpace(format!(
                "metadata space limit {} reached",
                inner.meta_space_limit
            )));
        }
        if pinned {
            let pinned_now = inner.stats.pinned_size.load(Ordering::SeqCst);
            if pinned_now + stat.size as i64 > inner.max_pinned_size {
                return Err(TierError::NoSpace(format!(
                    "pinned space limit {} reached",
                    inner.max_pinned_size
                )));
            }
        }

        let (inode, generation) = match inner.pop_free_head()? {
            Some(reused) => reused,
            None => {
                inner.head.num_total_inodes += 1;
                inner
                    .stats
                    .meta_size
                    .fetch_add(ENTRY_SIZE as i64, Ordering::SeqCst);
                (
                    InodeNumber(inner.head.num_total_inodes as u64),
                    Generation(1),
                )
            }
        };

        let mut entry = RegistryEntry {
            stat: *stat,
            pin_state: if pinned {
                PinState::Pinned
            } else {
                PinState::Unpinned
            },
            this_index: inode,
            generation,
            ..RegistryEntry::default()
        };
        entry.stat.ino = inode.0;
        if pinned {
            inner
                .stats
                .pinned_size
                .fetch_add(stat.size as i64, Ordering::SeqCst);
        }
        inner.write_new_entry(inode, &entry)?;
        inner.head.num_active_inodes += 1;
        inner.write_header()?;
        tracing::debug!(%inode, generation = generation.0, "allocated inode");
        Ok(inode)
    }

    /// Begins inode removal: moves the entry to the to-delete queue,
    /// clears the stat payload (index and generation survive), drops
    /// transit ownership, and detaches it from the pin queue if it was
    /// waiting there.
    pub fn to_delete(&self, inode: InodeNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if !matches!(entry.status, QueueStatus::None | QueueStatus::Dirty) {
            return Ok(());
        }
        if entry.pin_state == PinState::Pinning {
            inner.pin_dequeue(inode, &mut entry)?;
        }
        entry.pin_state = PinState::Deleted;
        inner.ll_enqueue(inode, QueueStatus::ToDelete, &mut entry)?;
        entry.in_transit = false;
        entry.mod_after_in_transit = false;
        entry.stat = InodeStat::default();
        inner.head.num_active_inodes -= 1;
        inner.write_entry(inode, &entry)?;
        inner.write_header()
    }

    /// Finishes inode removal after the delete pipeline has destroyed
    /// the cloud objects: ToDelete → ToReclaim, with the number logged
    /// durably for a later `reclaim`. During a fullscan the number is
    /// diverted to the scan's temporary list instead.
    pub fn delete(&self, inode: InodeNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if matches!(entry.status, QueueStatus::ToReclaim | QueueStatus::Reclaimed) {
            return Ok(());
        }
        inner.ll_dequeue(inode, &mut entry)?;
        entry.status = QueueStatus::ToReclaim;
        entry.in_transit = false;
        inner.write_entry(inode, &entry)?;
        if let Some(temp) = inner.temp_unclaimed.as_mut() {
            temp.push(inode);
        } else {
            inner.append_unclaimed_log(inode)?;
        }
        inner.head.num_to_reclaim += 1;
        inner.write_header()
    }

    /// Replays the unclaimed log into the free list. Returns without
    /// work while fewer than `reclaim_trigger` numbers are pending, or
    /// while a fullscan owns the lists.
    pub fn reclaim(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.head.num_to_reclaim < inner.reclaim_trigger || inner.temp_unclaimed.is_some() {
            return Ok(());
        }
        let mut pending = inner.read_unclaimed_log()?;
        // Descending, so pushing each at the free-list front leaves the
        // list ascending and the allocator reusing low numbers first.
        pending.sort_unstable_by(|a, b| b.cmp(a));
        pending.dedup();

        let mut reclaimed = 0_i64;
        for inode in pending {
            if inode.is_null() || inode.0 as i64 > inner.head.num_total_inodes {
                tracing::warn!(%inode, "unclaimed log names an out-of-range inode");
                continue;
            }
            let mut entry = inner.read_entry(inode)?;
            if entry.status != QueueStatus::ToReclaim {
                continue;
            }
            entry.status = QueueStatus::Reclaimed;
            entry.util_ll_prev = InodeNumber::NULL;
            entry.util_ll_next = inner.head.first_reclaimed;
            inner.write_entry(inode, &entry)?;
            if inner.head.first_reclaimed.is_null() {
                inner.head.last_reclaimed = inode;
            }
            inner.head.first_reclaimed = inode;
            inner.head.num_reclaimed += 1;
            reclaimed += 1;
        }
        inner.rewrite_unclaimed_log(&[])?;
        inner.head.num_to_reclaim = 0;
        inner.write_header()?;
        tracing::info!(reclaimed, "reclaimed pending inode numbers");
        Ok(())
    }

    /// Rebuilds the free list from a walk of every entry, reclaiming
    /// anything ToReclaim, already Reclaimed, or an empty slot that is
    /// not mid-removal. O(registry) by design; numbers freed while the
    /// scan runs are folded back in at the end.
    pub fn reclaim_fullscan(&self) -> Result<()> {
        let total = match self.begin_fullscan()? {
            Some(total) => total,
            None => return Ok(()),
        };
        let scan = self.fullscan_pass(total);
        let drain = self.finish_fullscan();
        scan.and(drain)
    }

    /// Takes ownership of the free lists for a fullscan. `None` if a
    /// scan is already running.
    pub(crate) fn begin_fullscan(&self) -> Result<Option<i64>> {
        let mut inner = self.inner.lock();
        if inner.temp_unclaimed.is_some() {
            return Ok(None);
        }
        inner.temp_unclaimed = Some(Vec::new());
        inner.head.first_reclaimed = InodeNumber::NULL;
        inner.head.last_reclaimed = InodeNumber::NULL;
        inner.head.num_reclaimed = 0;
        inner.head.num_to_reclaim = 0;
        inner.write_header()?;
        Ok(Some(inner.head.num_total_inodes))
    }

    /// One pass over `1..=total`, locking per entry so concurrent
    /// operations interleave.
    pub(crate) fn fullscan_pass(&self, total: i64) -> Result<()> {
        for raw in 1..=total {
            let inode = InodeNumber(raw as u64);
            let mut inner = self.inner.lock();
            let entry = match inner.read_entry(inode) {
                Ok(entry) => entry,
                Err(TierError::Corruption(detail)) => {
                    tracing::warn!(%inode, detail, "fullscan clearing undecodable entry");
                    RegistryEntry::default()
                }
                Err(e) => return Err(e),
            };
            let reclaimable = matches!(
                entry.status,
                QueueStatus::ToReclaim | QueueStatus::Reclaimed
            ) || (entry.stat.ino == 0
                && !matches!(entry.status, QueueStatus::ToDelete | QueueStatus::Dirty));
            if !reclaimable {
                continue;
            }
            let fresh = RegistryEntry {
                this_index: inode,
                generation: entry.generation,
                status: QueueStatus::Reclaimed,
                ..RegistryEntry::default()
            };
            let tail = inner.head.last_reclaimed;
            if tail.is_null() {
                inner.head.first_reclaimed = inode;
            } else {
                let mut tail_entry = inner.read_entry(tail)?;
                tail_entry.util_ll_next = inode;
                inner.write_entry(tail, &tail_entry)?;
            }
            inner.head.last_reclaimed = inode;
            inner.head.num_reclaimed += 1;
            inner.write_entry(inode, &fresh)?;
            inner.write_header()?;
        }
        Ok(())
    }

    /// Folds the temporary unclaimed list back into the durable log,
    /// keeping only numbers still pending reclaim.
    pub(crate) fn finish_fullscan(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let temp = inner.temp_unclaimed.take().unwrap_or_default();
        let mut still_pending = Vec::new();
        for inode in temp {
            match inner.read_entry(inode) {
                Ok(entry) if entry.status == QueueStatus::ToReclaim => still_pending.push(inode),
                Ok(_) => {}
                Err(_) => still_pending.push(inode),
            }
        }
        inner.rewrite_unclaimed_log(&still_pending)?;
        inner.head.num_to_reclaim = still_pending.len() as i64;
        inner.write_header()?;
        tracing::info!(
            free = inner.head.num_reclaimed,
            pending = still_pending.len(),
            "fullscan reclaim complete"
        );
        Ok(())
    }
}

impl RegistryInner {
    /// Pops the free-list head, validating its self-index. A corrupt
    /// head abandons the free list (the next fullscan rebuilds it) and
    /// falls back to growing the registry.
    fn pop_free_head(&mut self) -> Result<Option<(InodeNumber, Generation)>> {
        let inode = self.head.first_reclaimed;
        if inode.is_null() {
            return Ok(None);
        }
        let entry = self.read_entry(inode)?;
        if entry.this_index != inode || entry.status != QueueStatus::Reclaimed {
            tracing::warn!(
                %inode,
                this_index = entry.this_index.0,
                "free-list head fails validation, abandoning free list"
            );
            self.head.first_reclaimed = InodeNumber::NULL;
            self.head.last_reclaimed = InodeNumber::NULL;
            self.head.num_reclaimed = 0;
            return Ok(None);
        }
        self.head.first_reclaimed = entry.util_ll_next;
        if self.head.first_reclaimed.is_null() {
            self.head.last_reclaimed = InodeNumber::NULL;
        }
        self.head.num_reclaimed -= 1;
        Ok(Some((inode, Generation(entry.generation.0 + 1))))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::{open_registry, regular_stat};
    use tierfs_types::{InodeNumber, PinState, QueueStatus};

    #[test]
    fn numbers_allocate_sequentially_from_one() {
        let (reg, _stats, _dir) = open_registry();
        for want in 1..=5_u64 {
            let ino = reg.new_inode(&regular_stat(0, 0), false).expect("alloc");
            assert_eq!(ino, InodeNumber(want));
        }
        let head = reg.header();
        assert_eq!(head.num_total_inodes, 5);
        assert_eq!(head.num_active_inodes, 5);
    }

    #[test]
    fn removal_round_trip_reuses_number_with_bumped_generation() {
        let (reg, _stats, _dir) = open_registry();
        let ino = reg.new_inode(&regular_stat(0, 10), false).expect("alloc");
        assert_eq!(reg.read_entry(ino).expect("entry").generation.0, 1);

        reg.to_delete(ino).expect("to_delete");
        let entry = reg.read_entry(ino).expect("entry");
        assert_eq!(entry.status, QueueStatus::ToDelete);
        assert_eq!(entry.stat.ino, 0);
        assert_eq!(entry.this_index, ino);
        assert_eq!(reg.header().num_active_inodes, 0);

        reg.delete(ino).expect("delete");
        assert_eq!(
            reg.read_entry(ino).expect("entry").status,
            QueueStatus::ToReclaim
        );
        assert_eq!(reg.header().num_to_reclaim, 1);

        reg.reclaim_fullscan().expect("fullscan");
        let head = reg.header();
        assert_eq!(head.num_reclaimed, 1);
        assert_eq!(head.num_to_reclaim, 0);
        assert_eq!(head.first_reclaimed, ino);

        let reused = reg.new_inode(&regular_stat(0, 20), false).expect("realloc");
        assert_eq!(reused, ino);
        assert_eq!(reg.read_entry(reused).expect("entry").generation.0, 2);
        assert_eq!(reg.header().num_reclaimed, 0);
    }

    #[test]
    fn reclaim_is_noop_below_trigger() {
        let (reg, _stats, _dir) = open_registry();
        // Trigger is 4 in the test config; free 3.
        let inos: Vec<_> = (0..3)
            .map(|_| reg.new_inode(&regular_stat(0, 0), false).expect("alloc"))
            .collect();
        for &ino in &inos {
            reg.to_delete(ino).expect("to_delete");
            reg.delete(ino).expect("delete");
        }
        reg.reclaim().expect("reclaim");
        let head = reg.header();
        assert_eq!(head.num_reclaimed, 0);
        assert_eq!(head.num_to_reclaim, 3);

        // One more crosses the trigger.
        let extra = reg.new_inode(&regular_stat(0, 0), false).expect("alloc");
        reg.to_delete(extra).expect("to_delete");
        reg.delete(extra).expect("delete");
        reg.reclaim().expect("reclaim");
        let head = reg.header();
        assert_eq!(head.num_reclaimed, 4);
        assert_eq!(head.num_to_reclaim, 0);
        // Free list hands numbers back ascending.
        assert_eq!(head.first_reclaimed, inos[0]);
        assert_eq!(
            reg.new_inode(&regular_stat(0, 0), false).expect("realloc"),
            inos[0]
        );
    }

    #[test]
    fn to_delete_detaches_pinning_inode_from_pin_queue() {
        let (reg, _stats, _dir) = open_registry();
        let ino = reg.new_inode(&regular_stat(0, 10), false).expect("alloc");
        assert!(reg
            .mark_pin(ino, tierfs_types::S_IFREG | 0o644)
            .expect("pin"));
        assert_eq!(reg.header().num_pinning, 1);
        reg.to_delete(ino).expect("to_delete");
        let head = reg.header();
        assert_eq!(head.num_pinning, 0);
        assert!(head.first_pin.is_null());
        assert_eq!(reg.read_entry(ino).expect("entry").pin_state, PinState::Deleted);
    }

    #[test]
    fn delete_during_fullscan_routes_through_temp_list() {
        let (reg, _stats, _dir) = open_registry();
        let keep = reg.new_inode(&regular_stat(0, 1), false).expect("alloc");
        let victim = reg.new_inode(&regular_stat(0, 2), false).expect("alloc");
        reg.to_delete(victim).expect("to_delete");

        let total = reg.begin_fullscan().expect("begin").expect("not running");
        // Scan runs to completion first; the late delete must not land
        // in the durable log mid-scan.
        reg.fullscan_pass(total).expect("pass");
        reg.delete(victim).expect("delete during scan");
        reg.finish_fullscan().expect("finish");

        let head = reg.header();
        assert_eq!(head.num_to_reclaim, 1);
        assert_eq!(
            reg.read_entry(victim).expect("entry").status,
            QueueStatus::ToReclaim
        );
        // A regular reclaim replay later picks it up.
        assert_eq!(
            reg.read_entry(keep).expect("entry").status,
            QueueStatus::None
        );
    }

    #[test]
    fn second_fullscan_is_refused_while_one_runs() {
        let (reg, _stats, _dir) = open_registry();
        let first = reg.begin_fullscan().expect("begin");
        assert!(first.is_some());
        assert!(reg.begin_fullscan().expect("second begin").is_none());
        reg.finish_fullscan().expect("finish");
    }

    #[test]
    fn meta_space_quota_rejects_allocation() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut cfg = crate::test_util::test_config(dir.path());
        cfg.meta_space_limit = tierfs_types::HEAD_SIZE as i64 + tierfs_types::ENTRY_SIZE as i64;
        let stats = std::sync::Arc::new(tierfs_types::SystemStats::new());
        let reg = crate::Registry::open(&cfg, std::sync::Arc::clone(&stats)).expect("open");
        reg.new_inode(&regular_stat(0, 0), false).expect("first fits");
        let err = reg.new_inode(&regular_stat(0, 0), false).unwrap_err();
        assert!(matches!(err, tierfs_error::TierError::NoSpace(_)));
    }

    #[test]
    fn meta_space_quota_survives_reopen() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut cfg = crate::test_util::test_config(dir.path());
        cfg.meta_space_limit = tierfs_types::HEAD_SIZE as i64 + tierfs_types::ENTRY_SIZE as i64;
        {
            let stats = std::sync::Arc::new(tierfs_types::SystemStats::new());
            let reg = crate::Registry::open(&cfg, stats).expect("open");
            reg.new_inode(&regular_stat(0, 0), false).expect("first fits");
        }

        // A fresh process inherits the on-disk registry's footprint.
        let stats = std::sync::Arc::new(tierfs_types::SystemStats::new());
        let reg = crate::Registry::open(&cfg, std::sync::Arc::clone(&stats)).expect("reopen");
        assert_eq!(
            stats.meta_size.load(std::sync::atomic::Ordering::SeqCst),
            cfg.meta_space_limit
        );
        let err = reg.new_inode(&regular_stat(0, 0), false).unwrap_err();
        assert!(matches!(err, tierfs_error::TierError::NoSpace(_)));
    }
}
