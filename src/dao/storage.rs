use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the operation.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What failed, for logs and error payloads.
        message: String,
        /// Backend error that caused the failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The backend answered but returned records that contradict each other.
    #[error("storage inconsistent: {message}")]
    Inconsistent { message: String },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct an inconsistency error (dangling pointers, undecodable documents).
    pub fn inconsistent(message: impl Into<String>) -> Self {
        StorageError::Inconsistent {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error as _, io};

    use super::*;

    #[test]
    fn unavailable_keeps_the_backend_cause() {
        let err = StorageError::unavailable(
            "ballot write failed".into(),
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.to_string(), "storage unavailable: ballot write failed");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("refused"));
    }

    #[test]
    fn inconsistent_records_have_no_cause() {
        let err = StorageError::inconsistent("region points at a missing session");
        assert_eq!(
            err.to_string(),
            "storage inconsistent: region points at a missing session"
        );
        assert!(err.source().is_none());
    }
}
