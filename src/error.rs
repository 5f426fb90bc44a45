//! Error and result model shared by the engine and every device.
//!
//! Operations in this crate do not panic and do not return `Result` for the
//! common control paths. Instead they return a tri-valued [`Status`] and
//! record the most recent failure on the engine or device it occurred on,
//! where it can be retrieved with `last_error()`. This keeps readiness
//! callbacks total: a failed send or a refused registration never unwinds
//! through the dispatch loop.

use std::fmt;
use std::io;

/// Outcome of an engine or device operation.
///
/// `Passable` marks a benign no-op, such as registering a device that is
/// already registered or stopping a timer that is already stopped. `Nok`
/// means a failure was recorded and can be read back through the owner's
/// `last_error()`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Passable,
    Nok,
}

impl Status {
    /// Returns `true` for `Ok`.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Returns `true` for `Ok` or `Passable`.
    pub fn is_acceptable(self) -> bool {
        self != Status::Nok
    }

    /// Returns `true` for `Nok`.
    pub fn is_nok(self) -> bool {
        self == Status::Nok
    }
}

/// Internal failure kinds recordable on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceErrorKind {
    #[error("no error")]
    NoError,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid logic")]
    InvalidLogic,
    #[error("device not ready")]
    DeviceNotReady,
    #[error("poll error")]
    PollError,
    #[error("timeout")]
    Timeout,
    #[error("general error")]
    GeneralError,
}

/// Failure kinds recordable on an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineErrorKind {
    #[error("no error")]
    NoError,
    #[error("device already registered")]
    DeviceAlreadyRegistered,
    #[error("device does not exist")]
    DeviceDoesNotExist,
    #[error("invalid argument")]
    InvalidArgument,
}

/// A device failure is either one of the internal [`DeviceErrorKind`]s or a
/// raw OS error code captured from `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Internal(DeviceErrorKind),
    Os(i32),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Internal(kind) => write!(f, "internal error: {kind}"),
            ErrorCode::Os(code) => {
                write!(f, "system error {code}: {}", io::Error::from_raw_os_error(*code))
            }
        }
    }
}

impl From<DeviceErrorKind> for ErrorCode {
    fn from(kind: DeviceErrorKind) -> Self {
        ErrorCode::Internal(kind)
    }
}

impl From<i32> for ErrorCode {
    fn from(errno: i32) -> Self {
        ErrorCode::Os(errno)
    }
}

/// The last error recorded on a device: a typed code plus a human
/// description of the operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct DeviceError {
    pub code: ErrorCode,
    pub description: String,
}

impl DeviceError {
    pub(crate) fn internal(kind: DeviceErrorKind, description: impl Into<String>) -> Self {
        Self { code: ErrorCode::Internal(kind), description: description.into() }
    }

    pub(crate) fn os(errno: i32, description: impl Into<String>) -> Self {
        Self { code: ErrorCode::Os(errno), description: description.into() }
    }

    /// Captures the calling thread's current `errno`.
    pub(crate) fn last_os(description: impl Into<String>) -> Self {
        Self::os(io::Error::last_os_error().raw_os_error().unwrap_or(0), description)
    }

    /// Whether this error is the non-blocking "nothing buffered" condition.
    pub fn is_would_block(&self) -> bool {
        matches!(self.code, ErrorCode::Os(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK)
    }
}

impl Default for DeviceError {
    fn default() -> Self {
        Self::internal(DeviceErrorKind::NoError, "")
    }
}

/// The last error recorded on an engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct EngineError {
    pub code: EngineErrorKind,
    pub description: String,
}

impl EngineError {
    pub(crate) fn new(code: EngineErrorKind, description: impl Into<String>) -> Self {
        Self { code, description: description.into() }
    }
}

impl Default for EngineError {
    fn default() -> Self {
        Self::new(EngineErrorKind::NoError, "")
    }
}
