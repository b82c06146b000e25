#![forbid(unsafe_code)]
//! Object-store seam for the sync pipelines.
//!
//! [`ObjectBackend`] is the capability the upload/delete/pin code
//! programs against: four verbs returning HTTP-style status codes, with
//! the 2xx band meaning success. Which implementation serves a process
//! is a configuration choice ([`BackendKind`]), never a compile-time
//! one. Two implementations ship here: a filesystem-directory store and
//! an in-memory store.

mod dir;
mod memory;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tierfs_error::Result;
use tierfs_types::{BlockNumber, InodeNumber};

pub use dir::DirBackend;
pub use memory::MemoryBackend;

/// Missing object on get/delete.
pub const STATUS_NOT_FOUND: u16 = 404;
/// Credentials rejected; re-authenticate and retry.
pub const STATUS_UNAUTHORIZED: u16 = 401;

#[must_use]
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// The object-store verbs the tiering core needs.
///
/// Implementations are shared across worker threads. Transport-level
/// failures surface as errors; a reachable store that refuses a request
/// returns its status code instead.
pub trait ObjectBackend: Send + Sync {
    /// (Re-)establishes credentials.
    fn authenticate(&self) -> Result<u16>;
    fn put(&self, name: &str, data: &[u8]) -> Result<u16>;
    /// On success the body accompanies the status; on a non-2xx status
    /// the body is empty.
    fn get(&self, name: &str) -> Result<(u16, Vec<u8>)>;
    /// Deleting an absent object returns [`STATUS_NOT_FOUND`]; callers
    /// treat that as success.
    fn delete(&self, name: &str) -> Result<u16>;
}

/// Object name of one data block.
#[must_use]
pub fn data_object_name(inode: InodeNumber, block: BlockNumber) -> String {
    format!("data_{}_{}", inode.0, block.0)
}

/// Object name of an inode's metadata copy.
#[must_use]
pub fn meta_object_name(inode: InodeNumber) -> String {
    format!("meta_{}", inode.0)
}

/// Configuration-time backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Objects stored as files under a local directory.
    Dir { root: PathBuf },
    /// Objects held in process memory; volatile.
    Memory,
}

pub fn open_backend(kind: &BackendKind) -> Result<Box<dyn ObjectBackend>> {
    match kind {
        BackendKind::Dir { root } => Ok(Box::new(DirBackend::open(root)?)),
        BackendKind::Memory => Ok(Box::new(MemoryBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_embed_both_ids() {
        assert_eq!(data_object_name(InodeNumber(7), BlockNumber(3)), "data_7_3");
        assert_eq!(meta_object_name(InodeNumber(7)), "meta_7");
    }

    #[test]
    fn success_band_is_2xx() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(!is_success(301));
        assert!(!is_success(404));
        assert!(!is_success(503));
    }

    #[test]
    fn backend_kind_deserializes_from_config() {
        let kind: BackendKind =
            serde_json::from_str(r#"{"kind":"dir","root":"/tmp/objs"}"#).expect("parse");
        assert!(matches!(kind, BackendKind::Dir { .. }));
        let kind: BackendKind = serde_json::from_str(r#"{"kind":"memory"}"#).expect("parse");
        assert!(matches!(kind, BackendKind::Memory));
    }
}
