//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata store is not open")]
    StoreUnavailable,

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("transaction aborted during {operation}: {source}")]
    TransactionAborted {
        operation: &'static str,
        #[source]
        source: Box<MetadataError>,
    },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(#[from] crate::transfer::TransitionError),

    #[error("invalid database key: {0}")]
    InvalidKey(String),

    #[error("linked SQLite does not support page encryption (build with the `sqlcipher` feature)")]
    EncryptionUnavailable,

    #[error("secret store error: {0}")]
    Secret(#[from] crate::secret::SecretError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetadataError {
    /// The innermost error, looking through aborted transactions.
    pub fn root_cause(&self) -> &MetadataError {
        match self {
            MetadataError::TransactionAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_integrity_violation(&self) -> bool {
        matches!(self.root_cause(), MetadataError::IntegrityViolation(_))
    }

    pub(crate) fn aborted(operation: &'static str, source: MetadataError) -> Self {
        MetadataError::TransactionAborted {
            operation,
            source: Box::new(source),
        }
    }
}

impl From<sqlx::Error> for MetadataError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation()
                    || matches!(db.kind(), sqlx::error::ErrorKind::NotNullViolation) =>
            {
                MetadataError::IntegrityViolation(db.message().to_string())
            }
            _ => MetadataError::Statement(err.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
