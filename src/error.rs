//! Error kinds of the server runtime and their wire status mapping.

use std::error;
use std::fmt;
use std::io;

/// Result alias used throughout the runtime.
pub type FsResult<T> = Result<T, FsError>;

/// Errors produced by the server runtime.
///
/// Driver statuses pass through unchanged because the kernel understands
/// them; everything else is a runtime condition with a fixed status code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    /// The capability bit for the requested operation is clear.
    UnsupportedOperation,
    /// Malformed frame, unknown operation code, or argument out of range.
    BadRequest,
    /// The driver returned a non-success status; carried verbatim.
    Driver(i32),
    /// I/O failure in the block cache, as a raw OS error code.
    Cache(i32),
    /// The port was closed underneath a blocked operation.
    TransportClosed,
    /// A receive timed out.
    TimedOut,
    /// Allocation failure in the cache or cookie tables.
    OutOfMemory,
    /// Invariant violation. Reported via the debugger hook; the process
    /// does not continue past one of these.
    Fatal(&'static str),
}

impl FsError {
    /// Encodes the error as a wire status. `0` means success and is never
    /// produced here; driver statuses are forwarded untouched.
    pub fn to_status(&self) -> i32 {
        match self {
            FsError::UnsupportedOperation => -libc::ENOSYS,
            FsError::BadRequest => -libc::EINVAL,
            FsError::Driver(status) => *status,
            FsError::Cache(errno) => -errno.abs(),
            FsError::TransportClosed => -libc::EPIPE,
            FsError::TimedOut => -libc::ETIMEDOUT,
            FsError::OutOfMemory => -libc::ENOMEM,
            FsError::Fatal(_) => -libc::EFAULT,
        }
    }

    /// Decodes a wire status. Statuses the runtime itself produces map back
    /// to their kind; any other non-zero status is a driver status.
    pub fn from_status(status: i32) -> Option<FsError> {
        if status == 0 {
            return None;
        }
        Some(match -status {
            libc::ENOSYS => FsError::UnsupportedOperation,
            libc::EPIPE => FsError::TransportClosed,
            libc::ETIMEDOUT => FsError::TimedOut,
            libc::ENOMEM => FsError::OutOfMemory,
            _ => FsError::Driver(status),
        })
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::UnsupportedOperation => write!(f, "operation not supported by the driver"),
            FsError::BadRequest => write!(f, "malformed request"),
            FsError::Driver(status) => write!(f, "driver error ({})", status),
            FsError::Cache(errno) => write!(f, "block cache I/O error ({})", errno),
            FsError::TransportClosed => write!(f, "transport closed"),
            FsError::TimedOut => write!(f, "timed out"),
            FsError::OutOfMemory => write!(f, "out of memory"),
            FsError::Fatal(message) => write!(f, "fatal: {}", message),
        }
    }
}

impl error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> FsError {
        FsError::Cache(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Reports an invariant violation and terminates the server. The dispatcher
/// is expected to respawn the process.
pub(crate) fn fatal(message: &'static str) -> ! {
    log::error!("fatal: {}", message);
    panic!("{}", message);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trip() {
        for err in [
            FsError::UnsupportedOperation,
            FsError::TransportClosed,
            FsError::TimedOut,
            FsError::OutOfMemory,
        ] {
            assert_eq!(FsError::from_status(err.to_status()), Some(err));
        }
        assert_eq!(FsError::from_status(0), None);
    }

    #[test]
    fn driver_status_is_verbatim() {
        let err = FsError::Driver(-libc::ENOENT);
        assert_eq!(err.to_status(), -libc::ENOENT);
        assert_eq!(
            FsError::from_status(-libc::ENOENT),
            Some(FsError::Driver(-libc::ENOENT))
        );
    }
}
