//! Pin-state entry points and the pin-pending queue.
//!
//! Regular files transit Unpinned → Pinning → Pinned: they join the pin
//! queue and the pin scheduler fetches their blocks before
//! `finish_pinning` retires them. Directories and symlinks have no
//! blocks and flip straight to Pinned.

use crate::{Registry, RegistryInner};
use tierfs_error::{Result, TierError};
use tierfs_types::{InodeNumber, PinState, QueueStatus, RegistryEntry, S_IFMT, S_IFREG};

impl Registry {
    /// Requests local pinning. Returns true when the inode joined the
    /// pin queue and needs a block fetch, false when the request was
    /// already satisfied.
    ///
    /// Admission control happens before this call: the caller reserves
    /// the inode's size against the pin quota (the pin scheduler's
    /// `reserve_pin_quota`) first, so a request the quota cannot cover
    /// fails with `NoSpace` before any pin state changes.
    pub fn mark_pin(&self, inode: InodeNumber, mode: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        match entry.pin_state {
            PinState::Deleted => Err(TierError::InvalidOperation(format!(
                "inode {inode} is being removed"
            ))),
            PinState::Pinned | PinState::Pinning => Ok(false),
            PinState::Unpinned => {
                if mode & S_IFMT == S_IFREG {
                    entry.pin_state = PinState::Pinning;
                    inner.pin_enqueue(inode, &mut entry)?;
                    inner.write_entry(inode, &entry)?;
                    inner.write_header()?;
                    Ok(true)
                } else {
                    entry.pin_state = PinState::Pinned;
                    inner.write_entry(inode, &entry)?;
                    Ok(false)
                }
            }
        }
    }

    /// Releases a pin. Returns true when the state changed.
    pub fn mark_unpin(&self, inode: InodeNumber) -> Result<bool> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        match entry.pin_state {
            PinState::Deleted => Err(TierError::InvalidOperation(format!(
                "inode {inode} is being removed"
            ))),
            PinState::Unpinned => Ok(false),
            PinState::Pinning => {
                inner.pin_dequeue(inode, &mut entry)?;
                entry.pin_state = PinState::Unpinned;
                inner.write_entry(inode, &entry)?;
                inner.write_header()?;
                Ok(true)
            }
            PinState::Pinned => {
                entry.pin_state = PinState::Unpinned;
                inner.write_entry(inode, &entry)?;
                Ok(true)
            }
        }
    }

    /// Called by the pin scheduler once every block is locally
    /// resident: Pinning → Pinned and off the pin queue.
    pub fn finish_pinning(&self, inode: InodeNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.read_entry(inode)?;
        if entry.pin_state != PinState::Pinning {
            return Ok(());
        }
        inner.pin_dequeue(inode, &mut entry)?;
        entry.pin_state = PinState::Pinned;
        inner.write_entry(inode, &entry)?;
        inner.write_header()
    }

    /// Inodes waiting on the pin queue, head to tail. A walk that does
    /// not land on exactly `num_pinning` entries is corruption.
    pub fn pinning_snapshot(&self) -> Result<Vec<InodeNumber>> {
        let inner = self.inner.lock();
        let count = inner.head.num_pinning;
        let mut out = Vec::with_capacity(count.max(0) as usize);
        let mut cursor = inner.head.first_pin;
        while !cursor.is_null() {
            if out.len() as i64 >= count {
                return Err(TierError::Corruption(
                    "pin queue walk exceeds recorded count".into(),
                ));
            }
            out.push(cursor);
            cursor = inner.read_entry(cursor)?.pin_ll_next;
        }
        if out.len() as i64 != count {
            return Err(TierError::Corruption(format!(
                "pin queue walk found {} entries, header records {count}",
                out.len()
            )));
        }
        Ok(out)
    }
}

impl RegistryInner {
    pub(crate) fn pin_enqueue(
        &mut self,
        inode: InodeNumber,
        entry: &mut RegistryEntry,
    ) -> Result<()> {
        let last = self.head.last_pin;
        entry.pin_ll_prev = last;
        entry.pin_ll_next = InodeNumber::NULL;
        if last.is_null() {
            self.head.first_pin = inode;
        } else {
            let mut tail = self.read_entry(last)?;
            tail.pin_ll_next = inode;
            self.write_entry(last, &tail)?;
        }
        self.head.last_pin = inode;
        self.head.num_pinning += 1;
        Ok(())
    }

    pub(crate) fn pin_dequeue(
        &mut self,
        inode: InodeNumber,
        entry: &mut RegistryEntry,
    ) -> Result<()> {
        let prev = entry.pin_ll_prev;
        let next = entry.pin_ll_next;
        if prev.is_null() {
            self.head.first_pin = next;
        } else {
            let mut prev_entry = self.read_entry(prev)?;
            prev_entry.pin_ll_next = next;
            self.write_entry(prev, &prev_entry)?;
        }
        if next.is_null() {
            self.head.last_pin = prev;
        } else {
            let mut next_entry = self.read_entry(next)?;
            next_entry.pin_ll_prev = prev;
            self.write_entry(next, &next_entry)?;
        }
        self.head.num_pinning -= 1;
        entry.pin_ll_next = InodeNumber::NULL;
        entry.pin_ll_prev = InodeNumber::NULL;
        Ok(())
    }
}
