//! Error types for fsrelay
//!
//! One taxonomy shared by the queue, the wire exchange, the meta-caches and
//! the directory consumer.

use crate::types::{Hint, Status};
use thiserror::Error;

/// Common result type for fsrelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for fsrelay
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Queue errors
    #[error("operation queue is full")]
    Full,

    #[error("operation queue is stopped")]
    Stopped,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    // Buffer errors
    #[error("buffer too small: required {required} bytes, available {available} bytes")]
    BufferTooSmall { required: usize, available: usize },

    #[error("cache item too large: {size} bytes exceeds {max} bytes")]
    ItemTooLarge { size: usize, max: usize },

    // Wire errors
    #[error("no operation matches correlation hint {0}")]
    InvalidCorrelation(Hint),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("remote returned status {0}")]
    Remote(Status),

    // Directory enumeration
    #[error("no more entries")]
    NoMoreEntries,

    #[error("no such entry")]
    NoSuchEntry,

    // General errors
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a malformed-record error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Map a remote status onto the error taxonomy.
    ///
    /// Statuses with a dedicated variant come back as that variant so
    /// callers can match on them without decoding NT codes.
    #[must_use]
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::CANCELLED => Self::Cancelled,
            Status::IO_TIMEOUT => Self::Timeout,
            Status::NO_MORE_FILES => Self::NoMoreEntries,
            Status::NO_SUCH_FILE => Self::NoSuchEntry,
            Status::BUFFER_TOO_SMALL => Self::BufferTooSmall {
                required: 0,
                available: 0,
            },
            other => Self::Remote(other),
        }
    }

    /// Check if the caller may retry the triggering call later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Check if this error means the operation was cancelled
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Stopped | Self::Cancelled)
    }

    /// Wire status reported for this error
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::Full => Status::INSUFFICIENT_RESOURCES,
            Self::Stopped | Self::Cancelled => Status::CANCELLED,
            Self::Timeout => Status::IO_TIMEOUT,
            Self::BufferTooSmall { .. } | Self::ItemTooLarge { .. } => Status::BUFFER_TOO_SMALL,
            Self::InvalidCorrelation(_) | Self::Malformed(_) => Status::INVALID_DEVICE_REQUEST,
            Self::Remote(status) => *status,
            Self::NoMoreEntries => Status::NO_MORE_FILES,
            Self::NoSuchEntry => Status::NO_SUCH_FILE,
            Self::InvalidParameter(_) | Self::Configuration(_) => Status::INVALID_PARAMETER,
        }
    }
}
