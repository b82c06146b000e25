//! Worker-pool primitives shared by the pipelines: a counting semaphore
//! bounding thread fan-out, and the in-flight table recording which
//! inodes the upload pipeline currently owns.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use tierfs_types::InodeNumber;

/// Counting semaphore. Permits are RAII and may cross threads, so a
/// dispatched worker carries its permit and releases it on exit.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is free.
    pub fn acquire(self: &Arc<Self>) -> SemaphorePermit {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit {
            sem: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }
}

pub struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Inodes the upload pipeline currently owns. The delete pipeline waits
/// here before finishing a removal, so a racing sync cannot resurrect
/// objects it has already destroyed.
#[derive(Default)]
pub struct InFlightTable {
    set: Mutex<HashSet<u64>>,
    cond: Condvar,
}

impl InFlightTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// False if the inode is already in flight.
    pub fn try_insert(&self, inode: InodeNumber) -> bool {
        self.set.lock().insert(inode.0)
    }

    pub fn remove(&self, inode: InodeNumber) {
        let mut set = self.set.lock();
        set.remove(&inode.0);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn contains(&self, inode: InodeNumber) -> bool {
        self.set.lock().contains(&inode.0)
    }

    /// Blocks until the inode is not in flight.
    pub fn wait_absent(&self, inode: InodeNumber) {
        let mut set = self.set.lock();
        while set.contains(&inode.0) {
            self.cond.wait(&mut set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn semaphore_bounds_concurrency() {
        let sem = Arc::new(Semaphore::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _permit = sem.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn inflight_insert_is_exclusive() {
        let table = InFlightTable::new();
        assert!(table.try_insert(InodeNumber(5)));
        assert!(!table.try_insert(InodeNumber(5)));
        assert!(table.contains(InodeNumber(5)));
        table.remove(InodeNumber(5));
        assert!(table.try_insert(InodeNumber(5)));
    }

    #[test]
    fn wait_absent_blocks_until_removal() {
        let table = Arc::new(InFlightTable::new());
        assert!(table.try_insert(InodeNumber(9)));
        let waiter = Arc::clone(&table);
        let handle = std::thread::spawn(move || waiter.wait_absent(InodeNumber(9)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        table.remove(InodeNumber(9));
        handle.join().expect("waiter released");
    }
}
