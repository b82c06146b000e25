#![forbid(unsafe_code)]
//! Workspace-wide error type.
//!
//! Every fallible operation in the workspace returns [`TierError`].
//! The crate stays dependency-free (beyond `thiserror`) so that every
//! other crate can depend on it without cycles. Variants carry owned
//! strings rather than source errors to keep the type `Clone` and
//! comparable in tests.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TierError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TierError {
    /// Underlying read/write/unlink failed, or a positioned access came
    /// back short.
    #[error("i/o failure: {0}")]
    Io(String),

    /// Persisted state contradicts itself (bad queue link, wrong
    /// self-index, undecodable record).
    #[error("corrupt state: {0}")]
    Corruption(String),

    /// A record or value violates the expected layout.
    #[error("format error: {0}")]
    Format(String),

    /// Inode number out of the allocated range, or the object named does
    /// not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata-space or pin quota exhausted.
    #[error("no space: {0}")]
    NoSpace(String),

    /// Object backend returned a non-success status after bounded
    /// retries.
    #[error("backend failure: status {status}, {detail}")]
    Backend { status: u16, detail: String },

    /// Operation refused in the current state (e.g. pinning a removed
    /// inode).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl TierError {
    /// Maps each variant to the single POSIX errno callers surface at
    /// the filesystem boundary.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            TierError::Io(_) => libc_consts::EIO,
            TierError::Corruption(_) => libc_consts::EIO,
            TierError::Format(_) => libc_consts::EINVAL,
            TierError::NotFound(_) => libc_consts::ENOENT,
            TierError::NoSpace(_) => libc_consts::ENOSPC,
            TierError::Backend { .. } => libc_consts::EIO,
            TierError::InvalidOperation(_) => libc_consts::EPERM,
        }
    }

    /// True for failures a later pipeline pass may clear (transient
    /// backend or I/O trouble), false for logic/state errors.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TierError::Io(_) | TierError::Backend { .. })
    }
}

impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            TierError::NotFound(err.to_string())
        } else {
            TierError::Io(err.to_string())
        }
    }
}

mod libc_consts {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(TierError::Io("x".into()).to_errno(), 5);
        assert_eq!(TierError::Corruption("x".into()).to_errno(), 5);
        assert_eq!(TierError::Format("x".into()).to_errno(), 22);
        assert_eq!(TierError::NotFound("x".into()).to_errno(), 2);
        assert_eq!(TierError::NoSpace("x".into()).to_errno(), 28);
        assert_eq!(
            TierError::Backend {
                status: 503,
                detail: "x".into()
            }
            .to_errno(),
            5
        );
        assert_eq!(TierError::InvalidOperation("x".into()).to_errno(), 1);
    }

    #[test]
    fn io_not_found_converts_to_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(TierError::from(err), TierError::NotFound(_)));
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(TierError::from(err), TierError::Io(_)));
    }

    #[test]
    fn recoverable_covers_transient_failures() {
        assert!(TierError::Io("x".into()).is_recoverable());
        assert!(TierError::Backend {
            status: 500,
            detail: "x".into()
        }
        .is_recoverable());
        assert!(!TierError::NoSpace("x".into()).is_recoverable());
    }
}
