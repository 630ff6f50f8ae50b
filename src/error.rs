//! Error taxonomy.
//!
//! [`PulseError`] is the only error type surfaced by public APIs. Each kind
//! keeps its category across component boundaries so callers can pattern
//! match on the class of failure: validation problems are never retried,
//! transaction aborts may be retried by the caller, corruption is fatal and
//! flips the handle into read-only safe mode.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Top-level error for all PulseDB operations.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Input failed validation; never retryable.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An entity required by the operation does not exist.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// Storage layer failure (I/O, corruption, transactions, versioning).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Timed out waiting for the writer lock.
    #[error("timed out after {waited_ms} ms waiting for the writer lock")]
    LockTimeout {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// A read scan exceeded its configured deadline.
    #[error("query exceeded its deadline of {deadline_ms} ms")]
    QueryTimeout {
        /// The deadline that was exceeded.
        deadline_ms: u64,
    },

    /// A configured resource quota was exceeded.
    #[error("resource limit exceeded: {resource} (limit {limit})")]
    ResourceLimit {
        /// Which quota was hit.
        resource: &'static str,
        /// The configured limit.
        limit: u64,
    },

    /// Embedding generation or validation failure. No silent fallback.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Vector index failure.
    #[error("vector index error: {0}")]
    Vector(String),

    /// Invalid configuration, rejected at open time.
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl PulseError {
    /// Builds a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Builds an embedding error.
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Builds a vector index error.
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::Vector(msg.into())
    }

    /// True for validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// True for missing-entity failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for storage-layer failures.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// True for vector-index failures.
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    /// True if the database detected corruption and entered safe mode.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Corrupted(_)))
    }

    /// True if the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::Transaction(_)) | Self::LockTimeout { .. }
        )
    }
}

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// On-disk data failed an integrity check. Fatal: the database stays in
    /// read-only safe mode until reopened.
    #[error("database corrupted: {0}")]
    Corrupted(String),

    /// Underlying I/O failure; the current transaction is aborted cleanly.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// A transaction failed to begin or commit. Transient; retryable.
    #[error("transaction aborted: {0}")]
    Transaction(String),

    /// Row (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The database file belongs to a newer schema than this build knows.
    #[error("schema version mismatch: stored {stored}, supported {supported}")]
    SchemaVersionMismatch {
        /// Version recorded in the database file.
        stored: u32,
        /// Newest version this build can open.
        supported: u32,
    },

    /// Another process holds the database lock.
    #[error("database is locked by another process")]
    DatabaseLocked,
}

impl StorageError {
    /// Builds a corruption error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Builds a transaction error.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Builds a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A vector's length does not match the collective's frozen dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension frozen into the collective.
        expected: usize,
        /// Dimension the caller provided.
        got: usize,
    },

    /// A field holds a value outside its allowed range or shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why the value is rejected.
        reason: String,
    },

    /// Text content exceeds its size limit.
    #[error("content too large: {size} bytes (max {max})")]
    ContentTooLarge {
        /// Provided size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A required field is missing or empty.
    #[error("required field missing: {field}")]
    RequiredField {
        /// Field name.
        field: &'static str,
    },

    /// A list field holds more items than allowed.
    #[error("too many items in '{field}': {count} (max {max})")]
    TooManyItems {
        /// Field name.
        field: &'static str,
        /// Provided count.
        count: usize,
        /// Maximum allowed count.
        max: usize,
    },

    /// A float field holds NaN or an infinity.
    #[error("non-finite value in '{field}'")]
    NonFinite {
        /// Field name.
        field: &'static str,
    },
}

impl ValidationError {
    /// Builds a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Builds an invalid-field error.
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Builds a content-too-large error.
    pub fn content_too_large(size: usize, max: usize) -> Self {
        Self::ContentTooLarge { size, max }
    }

    /// Builds a required-field error.
    pub fn required_field(field: &'static str) -> Self {
        Self::RequiredField { field }
    }

    /// Builds a too-many-items error.
    pub fn too_many_items(field: &'static str, count: usize, max: usize) -> Self {
        Self::TooManyItems { field, count, max }
    }

    /// Builds a non-finite-value error.
    pub fn non_finite(field: &'static str) -> Self {
        Self::NonFinite { field }
    }
}

/// Missing-entity errors, one variant per entity kind.
///
/// Single-entity getters return `Ok(None)` instead; these errors are for
/// operations that require the entity to exist (update, delete, cascade).
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// No collective with the given id.
    #[error("collective not found: {0}")]
    Collective(String),

    /// No experience with the given id.
    #[error("experience not found: {0}")]
    Experience(String),

    /// No relation with the given id.
    #[error("relation not found: {0}")]
    Relation(String),

    /// No insight with the given id.
    #[error("insight not found: {0}")]
    Insight(String),

    /// No activity registered for the given (collective, agent) pair.
    #[error("activity not found: {0}")]
    Activity(String),
}

impl NotFoundError {
    /// Builds a collective-not-found error.
    pub fn collective(id: impl ToString) -> Self {
        Self::Collective(id.to_string())
    }

    /// Builds an experience-not-found error.
    pub fn experience(id: impl ToString) -> Self {
        Self::Experience(id.to_string())
    }

    /// Builds a relation-not-found error.
    pub fn relation(id: impl ToString) -> Self {
        Self::Relation(id.to_string())
    }

    /// Builds an insight-not-found error.
    pub fn insight(id: impl ToString) -> Self {
        Self::Insight(id.to_string())
    }

    /// Builds an activity-not-found error.
    pub fn activity(id: impl ToString) -> Self {
        Self::Activity(id.to_string())
    }
}

// redb error types fold into the storage taxonomy. Lock contention is
// surfaced as DatabaseLocked, everything else keeps its message.

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::DatabaseAlreadyOpen => StorageError::DatabaseLocked,
            redb::DatabaseError::RepairAborted => {
                StorageError::Corrupted("repair aborted".to_string())
            }
            redb::DatabaseError::Storage(e) => e.into(),
            other => StorageError::Transaction(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("commit failed: {err}"))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Corrupted(format!("table error: {err}"))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => StorageError::Corrupted(msg),
            redb::StorageError::Io(e) => StorageError::Io(e),
            other => StorageError::Transaction(other.to_string()),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<redb::DatabaseError> for PulseError {
    fn from(err: redb::DatabaseError) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<redb::TransactionError> for PulseError {
    fn from(err: redb::TransactionError) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<redb::CommitError> for PulseError {
    fn from(err: redb::CommitError) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<redb::TableError> for PulseError {
    fn from(err: redb::TableError) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<redb::StorageError> for PulseError {
    fn from(err: redb::StorageError) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<bincode::Error> for PulseError {
    fn from(err: bincode::Error) -> Self {
        PulseError::Storage(err.into())
    }
}

impl From<io::Error> for PulseError {
    fn from(err: io::Error) -> Self {
        PulseError::Storage(StorageError::Io(err))
    }
}
