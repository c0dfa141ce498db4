#![forbid(unsafe_code)]
//! Error types for mdfs.
//!
//! Defines `MdfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for host filesystem replies.

use mdfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all mdfs operations.
#[derive(Debug, Error)]
pub enum MdfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(String),

    #[error("invalid on-disc format: {0}")]
    Format(#[from] ParseError),

    #[error("overlay record too large: {encoded} bytes exceeds {max}")]
    TfsOverflow { encoded: usize, max: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("access denied")]
    AccessDenied,

    #[error("not a directory")]
    NotDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("no free track id on disc")]
    NoSpace,

    #[error("timed out waiting for track data")]
    Timeout,
}

impl MdfsError {
    /// Convert this error into a POSIX errno suitable for host replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device(_) | Self::Format(_) | Self::TfsOverflow { .. } | Self::Timeout => {
                libc::EIO
            }
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EPERM,
            Self::AccessDenied => libc::EACCES,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
        }
    }
}

/// Result alias using `MdfsError`.
pub type Result<T> = std::result::Result<T, MdfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table() {
        assert_eq!(MdfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(MdfsError::PermissionDenied.to_errno(), libc::EPERM);
        assert_eq!(MdfsError::AccessDenied.to_errno(), libc::EACCES);
        assert_eq!(MdfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(MdfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            MdfsError::TfsOverflow {
                encoded: 4000,
                max: 2300
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(MdfsError::Device("usb stall".into()).to_errno(), libc::EIO);
    }
}
