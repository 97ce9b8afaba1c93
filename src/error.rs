//! Error types for the engine.
//!
//! Two layers:
//! - [`EngineError`]: returned by the engine API itself (bad handle,
//!   backpressure, configuration, ring setup).
//! - [`ErrorKind`]: the terminal failure of a single request, surfaced
//!   through `poll`/`wait` as `Outcome::Failed`.

use crate::runtime::RequestId;
use std::io;

/// Errors returned by [`Engine`](crate::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Buffer slots are exhausted. Transient: retry after retrieving results.
    #[error("backpressure: no free buffer slots, retry later")]
    Backpressure,

    /// Unknown handle, or one whose result was already retrieved.
    #[error("request {0} not found")]
    NotFound(RequestId),

    /// The request can never fit in the buffer pool.
    #[error("request of {requested} bytes exceeds the engine limit of {limit} bytes")]
    SizeLimitExceeded { requested: usize, limit: usize },

    /// Malformed request (zero length, missing or mismatched write data).
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// `wait` gave up before the request reached a terminal state.
    #[error("timed out waiting for request")]
    TimedOut,

    /// The engine is draining or stopped and accepts no new work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Ring or buffer setup failed.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Why a request ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The kernel reported an error; the value is the positive errno.
    #[error("kernel error: {}", io::Error::from_raw_os_error(*.0))]
    Kernel(i32),

    /// Cancelled by the caller or forced by shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// A read hit end-of-file before the requested range was filled.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// A write transferred zero bytes before the range was drained.
    #[error("write transferred zero bytes")]
    WriteZero,
}

impl ErrorKind {
    /// Convert into a `std::io::Error` for callers that want one.
    pub fn to_io_error(self) -> io::Error {
        match self {
            ErrorKind::Kernel(errno) => io::Error::from_raw_os_error(errno),
            ErrorKind::Cancelled => io::Error::new(io::ErrorKind::Interrupted, self.to_string()),
            ErrorKind::UnexpectedEof => io::Error::from(io::ErrorKind::UnexpectedEof),
            ErrorKind::WriteZero => io::Error::from(io::ErrorKind::WriteZero),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_display() {
        let kind = ErrorKind::Kernel(libc::EBADF);
        let msg = kind.to_string();
        assert!(msg.starts_with("kernel error"));
        assert_eq!(kind.to_io_error().raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_error_kind_io_mapping() {
        assert_eq!(
            ErrorKind::UnexpectedEof.to_io_error().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert_eq!(
            ErrorKind::WriteZero.to_io_error().kind(),
            io::ErrorKind::WriteZero
        );
    }
}
