//! Error types for the buffered object-file layer
//!
//! Every error maps onto the negative errno the storage-object layer expects
//! through [`Error::errno`], so callers that speak the POSIX-style return
//! channel can forward failures unchanged.

use thiserror::Error;

use crate::store::{Fd, IoType};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the buffering layer and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid argument (unallocated region, oversized request, zero capacity)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure reported by the object store
    #[error("Transport {op} failed with errno {errno}")]
    Transport { op: IoType, errno: i32 },

    /// Flushing staged writes failed while closing the file
    #[error("Flush on close failed for fd {fd}: {source}")]
    FlushOnClose {
        fd: Fd,
        #[source]
        source: Box<Error>,
    },

    /// An asynchronous operation is still outstanding on this file
    #[error("Asynchronous I/O still in flight on fd {fd} ({outstanding} outstanding)")]
    AioInFlight { fd: Fd, outstanding: usize },

    /// Operation on a file that is not open
    #[error("File is not open")]
    NotOpen,

    /// Object not found in the store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a transport error from a (positive or negative) errno.
    pub fn transport(op: IoType, errno: i32) -> Self {
        Error::Transport {
            op,
            errno: -errno.abs(),
        }
    }

    /// The negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => -e.raw_os_error().map_or(libc::EIO, i32::abs),
            Error::InvalidArgument(_) | Error::Config(_) => -libc::EINVAL,
            Error::Transport { errno, .. } => *errno,
            Error::FlushOnClose { source, .. } => source.errno(),
            Error::AioInFlight { .. } => -libc::EBUSY,
            Error::NotOpen => -libc::EBADF,
            Error::NotFound(_) => -libc::ENOENT,
            Error::Internal(_) => -libc::EIO,
        }
    }

    /// Whether this is an invalid-argument condition.
    pub fn is_invalid_argument(&self) -> bool {
        self.errno() == -libc::EINVAL
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidArgument("x".into()).errno(), -libc::EINVAL);
        assert_eq!(Error::NotOpen.errno(), -libc::EBADF);
        assert_eq!(
            Error::AioInFlight {
                fd: Fd(3),
                outstanding: 1
            }
            .errno(),
            -libc::EBUSY
        );
    }

    #[test]
    fn test_transport_errno_is_negative() {
        assert_eq!(Error::transport(IoType::Write, libc::ENOSPC).errno(), -libc::ENOSPC);
        assert_eq!(Error::transport(IoType::Read, -libc::EIO).errno(), -libc::EIO);
    }

    #[test]
    fn test_flush_on_close_keeps_source_errno() {
        let err = Error::FlushOnClose {
            fd: Fd(7),
            source: Box::new(Error::transport(IoType::Write, libc::EROFS)),
        };
        assert_eq!(err.errno(), -libc::EROFS);
        assert!(err.to_string().contains("fd 7"));
    }

    #[test]
    fn test_os_error_mapping() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), -libc::EACCES);

        let err = Error::from(std::io::Error::other("opaque"));
        assert_eq!(err.errno(), -libc::EIO);
    }
}
