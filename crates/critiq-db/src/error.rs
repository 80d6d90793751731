//! Database errors

use thiserror::Error;

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Record not found
    #[error("record not found")]
    NotFound,

    /// Conditional write lost: the record changed since it was read, or a
    /// uniqueness rule (one current subscription per user, one record per
    /// gateway subscription) rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded into its domain type
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Whether this is a lost conditional write or uniqueness conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Map unique-constraint violations to [`DbError::Conflict`]
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::Conflict(db_err.message().to_string());
            }
        }
        Self::Sqlx(err)
    }
}

/// Result alias for repository operations
pub type DbResult<T> = Result<T, DbError>;
