use std::fmt;

/// Errors surfaced by storage backends.
///
/// Callers retry `Transient` failures with bounded backoff and surface
/// `Permanent` ones; `NotFound` is part of the normal control flow.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up, e.g. "notification request_id=abc".
        what: String,
    },

    /// A retriable infrastructure failure (connection drop, timeout,
    /// serialization conflict).
    #[error("transient storage error: {message}")]
    Transient { message: String },

    /// A non-retriable failure (constraint violation, malformed data,
    /// unsupported operation).
    #[error("permanent storage error: {message}")]
    Permanent { message: String },
}

impl StorageError {
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
        }
    }
}

/// Coarse categories for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Transient,
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}
