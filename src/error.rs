use crate::types::{DataType, Version};
use thiserror::Error;

/// Error type for chunk merge, aggregation and the surrounding write path.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    /// A chunk's encoded block cannot be parsed. Fatal for the query.
    #[error("Decode error in chunk {chunk}: {details}")]
    Decode { chunk: Version, details: String },

    /// Duplicate versions, non-monotonic timestamps or metadata that disagrees with the data.
    #[error("Integrity violation in series {series}: {details}")]
    Integrity { series: String, details: String },

    #[error("Type mismatch for series {series}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        series: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("Aggregate {aggregate} is not supported for {data_type:?} series")]
    UnsupportedAggregate {
        aggregate: &'static str,
        data_type: DataType,
    },

    #[error("Refusing to build an empty chunk for series {0}")]
    EmptyChunk(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub(crate) fn decode(chunk: Version, details: impl Into<String>) -> Self {
        DbError::Decode {
            chunk,
            details: details.into(),
        }
    }

    pub(crate) fn integrity(series: &str, details: impl Into<String>) -> Self {
        DbError::Integrity {
            series: series.to_string(),
            details: details.into(),
        }
    }

    /// True for errors that come from stored data rather than from the caller.
    pub fn is_data_error(&self) -> bool {
        matches!(self, DbError::Decode { .. } | DbError::Integrity { .. })
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
