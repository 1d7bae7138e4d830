//! Error types for the bridge engine.
//!
//! Protocol-level failures (malformed frames, duplicate ids, unknown
//! operations) and filesystem-level failures share one enum so that every
//! error can be turned into exactly one wire status code. Filesystem errors
//! never terminate the connection; they travel back inside a response frame.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error that does not map to a more specific filesystem condition
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame body could not be decoded, or declared length exceeded the limit
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Request id already in flight for this session
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(u64),

    /// Operation tag not part of the protocol
    #[error("unknown operation tag {0}")]
    UnknownOperation(u8),

    /// Handle id was never issued, or was already released
    #[error("handle {0} not found")]
    HandleNotFound(u64),

    /// Open-handle limit for the session reached
    #[error("open handle limit reached ({0})")]
    HandleExhausted(usize),

    /// Path resolves outside the configured root directory
    #[error("path escapes shared root: {0}")]
    PathEscape(String),

    /// File or directory does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Access denied by the underlying filesystem
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// File where a directory was expected, or vice versa
    #[error("wrong resource type: {0}")]
    WrongType(String),

    /// Target name already exists
    #[error("already exists: {0}")]
    NameConflict(String),

    /// Directory not empty
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// No space left on device
    #[error("no space left on device")]
    NoSpace,

    /// Path component longer than the filesystem allows
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Executor call exceeded the per-operation deadline
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// Operation valid on the wire but not supported here
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Handle marked degraded after a timeout; must be released
    #[error("stale handle {0}")]
    StaleHandle(u64),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Status code carried in the response frame header.
    pub fn wire_code(&self) -> crate::protocol::ErrorCode {
        use crate::protocol::ErrorCode;

        match self {
            Error::MalformedFrame(_) => ErrorCode::MalformedFrame,
            Error::DuplicateRequestId(_) => ErrorCode::DuplicateRequestId,
            Error::UnknownOperation(_) => ErrorCode::UnknownOperation,
            Error::HandleNotFound(_) => ErrorCode::HandleNotFound,
            Error::HandleExhausted(_) => ErrorCode::HandleExhausted,
            Error::PathEscape(_) => ErrorCode::PathEscape,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::WrongType(_) => ErrorCode::WrongType,
            Error::NameConflict(_) => ErrorCode::NameConflict,
            Error::NotEmpty(_) => ErrorCode::NotEmpty,
            Error::NoSpace => ErrorCode::NoSpace,
            Error::NameTooLong(_) => ErrorCode::NameTooLong,
            Error::OperationTimeout(_) => ErrorCode::OperationTimeout,
            Error::Unsupported(_) => ErrorCode::Unsupported,
            Error::StaleHandle(_) => ErrorCode::StaleHandle,
            Error::Io(_) | Error::Config(_) | Error::Connection(_) => ErrorCode::Io,
        }
    }

    /// Translate an OS error into the engine's filesystem error taxonomy.
    ///
    /// `what` names the path or handle the operation was acting on; it ends
    /// up in the response detail string, never in logs alone.
    pub fn from_io(err: std::io::Error, what: impl Into<String>) -> Self {
        use std::io::ErrorKind;

        let what = what.into();

        // Conditions std::io does not surface as a stable ErrorKind are
        // matched on the raw errno.
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::ENOTEMPTY => return Error::NotEmpty(what),
                libc::ENOSPC => return Error::NoSpace,
                libc::ENAMETOOLONG => return Error::NameTooLong(what),
                libc::EISDIR => return Error::WrongType(format!("{what}: is a directory")),
                libc::ENOTDIR => return Error::WrongType(format!("{what}: not a directory")),
                _ => {}
            }
        }

        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(what),
            ErrorKind::PermissionDenied => Error::PermissionDenied(what),
            ErrorKind::AlreadyExists => Error::NameConflict(what),
            _ => Error::Io(err),
        }
    }

    /// Whether the error leaves the session usable.
    ///
    /// Everything except a transport failure is reported per-request; only
    /// connection errors tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Create a malformed-frame error with context
    pub fn malformed(context: impl Into<String>) -> Self {
        Error::MalformedFrame(context.into())
    }

    /// Create an unsupported-operation error with context
    pub fn unsupported(context: impl Into<String>) -> Self {
        Error::Unsupported(context.into())
    }
}
