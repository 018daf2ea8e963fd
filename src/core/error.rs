//! Error types and category mapping.
//!
//! Store-layer failures are converted into [`StoreError`] once, at the
//! transport boundary. Everything above that boundary matches on the
//! variants directly or on the abstract [`ErrorCategory`] they report.

use thiserror::Error;

/// Abstract failure categories shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Corruption,
    Aborted,
    DeadlineExceeded,
    Canceled,
    Unavailable,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::InvalidArgument => "InvalidArgument",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Corruption => "Corruption",
            Self::Aborted => "Aborted",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Canceled => "Canceled",
            Self::Unavailable => "Unavailable",
        };
        f.write_str(s)
    }
}

/// Errors produced by the coordination substrate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// A key, record or index entry does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// No device session matched an uplink.
    #[error("no device matches uplink")]
    NoUplinkMatch,

    /// A unique index entry is already taken.
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// A write touched a field that can not be set.
    #[error("read-only field `{path}`")]
    ReadOnlyField { path: String },

    /// A field mask contains an unknown path.
    #[error("invalid field mask path `{path}`")]
    InvalidFieldmask { path: String },

    /// Identifiers are malformed or do not match the addressed record.
    #[error("invalid identifiers: {message}")]
    InvalidIdentifiers { message: String },

    /// A downlink carries no transmission correlation ID.
    #[error("downlink has no `ns:transmission:` correlation ID")]
    MissingDownlinkCorrelationId,

    /// Any other malformed request.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A relay-served device is already served by another serving device.
    #[error("device `{served}` is already served by `{serving}`")]
    RelayServed { served: String, serving: String },

    /// A commit-time precondition failed.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// Stored bytes or key shapes could not be interpreted.
    #[error("corruption: {message}")]
    Corruption { message: String },

    /// A watched key changed before commit.
    #[error("transaction aborted: watched key modified")]
    Aborted,

    /// The context deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The context was canceled.
    #[error("canceled")]
    Canceled,

    /// The store could not be reached.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_identifiers(message: impl Into<String>) -> Self {
        Self::InvalidIdentifiers {
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// The abstract category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } | Self::NoUplinkMatch => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            Self::ReadOnlyField { .. }
            | Self::InvalidFieldmask { .. }
            | Self::InvalidIdentifiers { .. }
            | Self::MissingDownlinkCorrelationId
            | Self::InvalidArgument { .. } => ErrorCategory::InvalidArgument,
            Self::RelayServed { .. } | Self::FailedPrecondition { .. } => {
                ErrorCategory::FailedPrecondition
            }
            Self::Corruption { .. } => ErrorCategory::Corruption,
            Self::Aborted => ErrorCategory::Aborted,
            Self::DeadlineExceeded => ErrorCategory::DeadlineExceeded,
            Self::Canceled => ErrorCategory::Canceled,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// Check if the operation may succeed when retried as-is.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Aborted | Self::Unavailable { .. })
    }

    /// Check if this error means the caller's context ended.
    ///
    /// Long-running workers treat these as a clean shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::Canceled)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::unavailable(format!("i/o timeout: {err}")),
            _ => Self::unavailable(err.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::invalid_argument(format!("failed to encode record: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::corruption(format!("failed to decode record: {err}"))
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_kinds_report_categories() {
        assert_eq!(
            StoreError::ReadOnlyField {
                path: "created_at".into()
            }
            .category(),
            ErrorCategory::InvalidArgument
        );
        assert_eq!(
            StoreError::RelayServed {
                served: "a.b".into(),
                serving: "a.c".into()
            }
            .category(),
            ErrorCategory::FailedPrecondition
        );
        assert_eq!(StoreError::NoUplinkMatch.category(), ErrorCategory::NotFound);
        assert_eq!(
            StoreError::MissingDownlinkCorrelationId.category(),
            ErrorCategory::InvalidArgument
        );
    }

    #[test]
    fn test_retriable_and_shutdown() {
        assert!(StoreError::Aborted.is_retriable());
        assert!(StoreError::unavailable("down").is_retriable());
        assert!(!StoreError::not_found("x").is_retriable());
        assert!(StoreError::Canceled.is_shutdown());
        assert!(StoreError::DeadlineExceeded.is_shutdown());
        assert!(!StoreError::Aborted.is_shutdown());
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let err: StoreError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(err.category(), ErrorCategory::Unavailable);
    }
}
