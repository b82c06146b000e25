//! In-memory object store. Doubles as the fault-injection harness for
//! pipeline tests: callers can queue failure statuses and revoke
//! credentials to exercise retry paths.

use crate::{ObjectBackend, STATUS_NOT_FOUND, STATUS_UNAUTHORIZED};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tierfs_error::Result;

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    authed: AtomicBool,
    /// Next N mutating requests answer with `inject_status`.
    inject_remaining: AtomicU32,
    inject_status: AtomicU32,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let backend = Self::default();
        backend.authed.store(true, Ordering::SeqCst);
        backend
    }

    /// Revokes credentials; requests answer 401 until `authenticate`
    /// runs again.
    pub fn revoke_auth(&self) {
        self.authed.store(false, Ordering::SeqCst);
    }

    /// Queues `count` failures with the given status on subsequent
    /// requests.
    pub fn inject_failures(&self, status: u16, count: u32) {
        self.inject_status.store(u32::from(status), Ordering::SeqCst);
        self.inject_remaining.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().contains_key(name)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn gate(&self) -> Option<u16> {
        if !self.authed.load(Ordering::SeqCst) {
            return Some(STATUS_UNAUTHORIZED);
        }
        let remaining = self.inject_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .inject_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Some(self.inject_status.load(Ordering::SeqCst) as u16);
        }
        None
    }
}

impl ObjectBackend for MemoryBackend {
    fn authenticate(&self) -> Result<u16> {
        self.authed.store(true, Ordering::SeqCst);
        Ok(200)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<u16> {
        if let Some(status) = self.gate() {
            return Ok(status);
        }
        self.objects.lock().insert(name.to_owned(), data.to_vec());
        Ok(200)
    }

    fn get(&self, name: &str) -> Result<(u16, Vec<u8>)> {
        if let Some(status) = self.gate() {
            return Ok((status, Vec::new()));
        }
        match self.objects.lock().get(name) {
            Some(data) => Ok((200, data.clone())),
            None => Ok((STATUS_NOT_FOUND, Vec::new())),
        }
    }

    fn delete(&self, name: &str) -> Result<u16> {
        if let Some(status) = self.gate() {
            return Ok(status);
        }
        match self.objects.lock().remove(name) {
            Some(_) => Ok(200),
            None => Ok(STATUS_NOT_FOUND),
        }
    }
}
