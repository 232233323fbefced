//! Error types for stream operations.
//!
//! Device drivers report completion with an integer status: zero or positive
//! means success (positive is a byte count for reads), negative is an error
//! code. Negative codes follow the `-errno` convention, plus a synthetic
//! end-of-file code, and map to a stable `(name, message)` pair.

use std::io;

use thiserror::Error;

/// Synthetic status for end-of-file, outside the errno range.
pub const STATUS_EOF: i32 = -4095;

/// A negative completion status mapped to its symbolic name and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct DeviceError {
    pub status: i32,
    pub name: &'static str,
    pub message: &'static str,
}

const STATUS_TABLE: &[(i32, &str, &str)] = &[
    (-libc::EPERM, "EPERM", "operation not permitted"),
    (-libc::ENOENT, "ENOENT", "no such file or directory"),
    (-libc::EINTR, "EINTR", "interrupted system call"),
    (-libc::EIO, "EIO", "i/o error"),
    (-libc::EBADF, "EBADF", "bad file descriptor"),
    (-libc::EAGAIN, "EAGAIN", "resource temporarily unavailable"),
    (-libc::ENOMEM, "ENOMEM", "not enough memory"),
    (-libc::EACCES, "EACCES", "permission denied"),
    (-libc::EFAULT, "EFAULT", "bad address in system call argument"),
    (-libc::EBUSY, "EBUSY", "resource busy or locked"),
    (-libc::EEXIST, "EEXIST", "file already exists"),
    (-libc::ENODEV, "ENODEV", "no such device"),
    (-libc::EINVAL, "EINVAL", "invalid argument"),
    (-libc::ENOTTY, "ENOTTY", "inappropriate ioctl for device"),
    (-libc::EPIPE, "EPIPE", "broken pipe"),
    (-libc::ECONNRESET, "ECONNRESET", "connection reset by peer"),
    (-libc::ENOTCONN, "ENOTCONN", "socket is not connected"),
    (-libc::ETIMEDOUT, "ETIMEDOUT", "connection timed out"),
    (-libc::ECONNREFUSED, "ECONNREFUSED", "connection refused"),
    (STATUS_EOF, "EOF", "end of file"),
];

impl DeviceError {
    /// Maps a negative driver status to its symbolic form. Codes not in the
    /// table come back as `EUNKNOWN` rather than panicking.
    pub fn from_status(status: i32) -> Self {
        for &(code, name, message) in STATUS_TABLE {
            if code == status {
                return Self {
                    status,
                    name,
                    message,
                };
            }
        }
        Self {
            status,
            name: "EUNKNOWN",
            message: "unknown error",
        }
    }

    /// Maps a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        Self::from_status(-errno)
    }
}

/// Errors surfaced by [`TtyStream`](crate::TtyStream) operations.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Asynchronous connect resolved with a negative status; the stream
    /// never became usable.
    #[error("connect failed: {0}")]
    Connect(#[source] DeviceError),

    /// A read completion reported an error. Fatal: the stream destroys
    /// itself when this happens.
    #[error("read failed: {0}")]
    Read(#[source] DeviceError),

    /// A write batch completion reported an error. Local to that batch; the
    /// stream stays up and the caller decides whether to destroy it.
    #[error("write failed: {0}")]
    Write(#[source] DeviceError),

    /// The end-of-output (half-close) request failed.
    #[error("end failed: {0}")]
    End(#[source] DeviceError),

    /// A synchronous device call (mode change, window size query) failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The operation needs a connected device.
    #[error("stream is not connected")]
    NotConnected,

    /// The stream has been destroyed or is tearing down.
    #[error("stream has been destroyed")]
    Destroyed,

    /// The writable side was already ended.
    #[error("stream already ended")]
    Ended,

    /// The device driver does not implement this operation.
    #[error("operation not supported by this device: {op}")]
    Unsupported { op: &'static str },

    /// The configured slab pool has no free read buffer.
    #[error("slab pool exhausted")]
    NoBuffer,
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> io::Error {
        let kind = match &err {
            StreamError::Connect(_) | StreamError::NotConnected => io::ErrorKind::NotConnected,
            StreamError::Destroyed | StreamError::Ended => io::ErrorKind::BrokenPipe,
            StreamError::Unsupported { .. } => io::ErrorKind::Unsupported,
            StreamError::NoBuffer => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
