//! Error taxonomy shared by the dispatcher and its collaborators.
//!
//! Platform failures are folded into an [`ErrorCode`] at the boundary. The raw
//! OS text survives only as `detail`, which ends up in logs and reply text.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameter,
    AccessDenied,
    ServiceNotFound,
    ProcessNotFound,
    ChannelConnectionFailed,
    UnknownError,
}

impl ErrorCode {
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "Invalid parameter",
            ErrorCode::AccessDenied => "Access denied",
            ErrorCode::ServiceNotFound => "Service not found",
            ErrorCode::ProcessNotFound => "Process not found",
            ErrorCode::ChannelConnectionFailed => "Channel connection failed",
            ErrorCode::UnknownError => "Unknown error",
        }
    }

    /// Map an I/O error kind; `NotFound` needs context, so the caller supplies it.
    pub fn from_io(err: &io::Error, not_found: ErrorCode) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::NotFound => not_found,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidParameter,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => ErrorCode::ChannelConnectionFailed,
            _ => ErrorCode::UnknownError,
        }
    }

    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EPERM | Errno::EACCES => ErrorCode::AccessDenied,
            Errno::ESRCH => ErrorCode::ProcessNotFound,
            Errno::EINVAL => ErrorCode::InvalidParameter,
            _ => ErrorCode::UnknownError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A classified failure with the context that produced it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct WlmError {
    pub code: ErrorCode,
    pub detail: String,
}

impl WlmError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn io(err: &io::Error, not_found: ErrorCode, context: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::from_io(err, not_found),
            format!("{}: {}", context, err),
        )
    }
}

pub type WlmResult<T> = std::result::Result<T, WlmError>;
