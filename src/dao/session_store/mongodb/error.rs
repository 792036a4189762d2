use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Result alias for MongoDB backend operations.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Failures of the MongoDB backend.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// Required environment variable is missing.
    #[error("missing MongoDB environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// The connection URI could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        /// URI as configured.
        uri: String,
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// The driver rejected the client options.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// The server never answered the startup ping.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        /// Pings attempted.
        attempts: u32,
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// A ping on an established client failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// Creating an index failed.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Target collection.
        collection: &'static str,
        /// Index name.
        index: &'static str,
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// A read or write failed.
    #[error("MongoDB {operation} on `{collection}` failed")]
    Operation {
        /// Target collection.
        collection: &'static str,
        /// Driver call that failed.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: MongoError,
    },
    /// The region pointer changed on every attempt.
    #[error("region `{region}` pointer kept changing after {attempts} attempt(s)")]
    RegionContention { region: String, attempts: u32 },
    /// The ballot changed on every attempt.
    #[error("ballot `{key}` kept changing after {attempts} attempt(s)")]
    BallotContention { key: String, attempts: u32 },
}

impl MongoDaoError {
    pub(super) fn operation(
        collection: &'static str,
        operation: &'static str,
    ) -> impl FnOnce(MongoError) -> Self {
        move |source| MongoDaoError::Operation {
            collection,
            operation,
            source,
        }
    }
}

/// Whether the write was rejected by a unique index.
pub(super) fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}
