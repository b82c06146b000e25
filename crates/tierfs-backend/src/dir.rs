//! Directory-backed object store: one file per object under a flat
//! root, written via a temp file and rename so a torn put never leaves
//! a half object.

use crate::{ObjectBackend, STATUS_NOT_FOUND};
use std::fs;
use std::path::{Path, PathBuf};
use tierfs_error::{Result, TierError};

pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(TierError::Format(format!("invalid object name {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

impl ObjectBackend for DirBackend {
    fn authenticate(&self) -> Result<u16> {
        // Reachability check; a directory store has no credentials.
        fs::metadata(&self.root)?;
        Ok(200)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<u16> {
        let path = self.object_path(name)?;
        let tmp = self.root.join(format!(".{name}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(200)
    }

    fn get(&self, name: &str) -> Result<(u16, Vec<u8>)> {
        let path = self.object_path(name)?;
        match fs::read(&path) {
            Ok(data) => Ok((200, data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((STATUS_NOT_FOUND, Vec::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<u16> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(200),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(STATUS_NOT_FOUND),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_success;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let backend = DirBackend::open(dir.path()).expect("open");
        assert!(is_success(backend.authenticate().expect("auth")));
        assert!(is_success(backend.put("data_1_0", b"hello").expect("put")));
        let (status, body) = backend.get("data_1_0").expect("get");
        assert!(is_success(status));
        assert_eq!(body, b"hello");
        assert!(is_success(backend.delete("data_1_0").expect("delete")));
        assert_eq!(backend.delete("data_1_0").expect("redelete"), STATUS_NOT_FOUND);
        assert_eq!(backend.get("data_1_0").expect("reget").0, STATUS_NOT_FOUND);
    }

    #[test]
    fn traversal_names_are_rejected() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let backend = DirBackend::open(dir.path()).expect("open");
        assert!(backend.put("../escape", b"x").is_err());
        assert!(backend.put("a/b", b"x").is_err());
        assert!(backend.put("", b"x").is_err());
    }
}
