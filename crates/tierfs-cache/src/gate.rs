//! Rendezvous for writers blocked on a full cache.
//!
//! A writer that would push the cache past the hard limit parks in
//! `sleep_on_cache_full`; the eviction scanner wakes parked writers one
//! at a time as it frees space, so a burst of writers cannot stampede
//! the freshly reclaimed headroom.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tierfs_types::SystemStats;

pub struct CacheGate {
    waiters: Mutex<usize>,
    cond: Condvar,
    stats: Arc<SystemStats>,
    hard_limit: i64,
}

impl CacheGate {
    #[must_use]
    pub fn new(stats: Arc<SystemStats>, hard_limit: i64) -> Self {
        Self {
            waiters: Mutex::new(0),
            cond: Condvar::new(),
            stats,
            hard_limit,
        }
    }

    /// Blocks while the cache sits at or above the hard limit. Returns
    /// immediately once there is room, or when shutdown begins.
    pub fn sleep_on_cache_full(&self) {
        let mut waiters = self.waiters.lock();
        while self.stats.cache_size.load(Ordering::SeqCst) >= self.hard_limit
            && !self.stats.is_going_down()
        {
            *waiters += 1;
            self.cond.wait(&mut waiters);
            *waiters -= 1;
        }
    }

    /// Releases one parked writer, if any.
    pub fn notify_sleep_on_cache(&self) {
        let waiters = self.waiters.lock();
        if *waiters > 0 {
            self.cond.notify_one();
        }
    }

    /// Shutdown: releases every parked writer.
    pub fn wake_all(&self) {
        let _waiters = self.waiters.lock();
        self.cond.notify_all();
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        *self.waiters.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn writer_parks_until_notified() {
        let stats = Arc::new(SystemStats::new());
        stats.cache_size.store(100, Ordering::SeqCst);
        let gate = Arc::new(CacheGate::new(Arc::clone(&stats), 50));

        let parked = Arc::clone(&gate);
        let handle = std::thread::spawn(move || parked.sleep_on_cache_full());

        // Writer must be parked, not spinning through.
        for _ in 0..100 {
            if gate.waiter_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(gate.waiter_count(), 1);

        // A notify without room re-parks the writer.
        gate.notify_sleep_on_cache();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(gate.waiter_count(), 1);

        // Room plus notify releases it.
        stats.cache_size.store(10, Ordering::SeqCst);
        gate.notify_sleep_on_cache();
        handle.join().expect("writer released");
        assert_eq!(gate.waiter_count(), 0);
    }

    #[test]
    fn below_limit_does_not_block() {
        let stats = Arc::new(SystemStats::new());
        let gate = CacheGate::new(Arc::clone(&stats), 50);
        gate.sleep_on_cache_full();
    }

    #[test]
    fn shutdown_releases_all_waiters() {
        let stats = Arc::new(SystemStats::new());
        stats.cache_size.store(100, Ordering::SeqCst);
        let gate = Arc::new(CacheGate::new(Arc::clone(&stats), 50));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.sleep_on_cache_full())
            })
            .collect();
        while gate.waiter_count() < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }
        stats.shutdown();
        gate.wake_all();
        for handle in handles {
            handle.join().expect("released on shutdown");
        }
    }
}
