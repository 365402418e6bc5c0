//! Error types for the transaction manager.

use thiserror::Error;
use uuid::Uuid;

/// Top-level application error
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The local node does not hold the submitter's lease.
    #[error("Node is not the leader for submitter {submitter} (current token {fencing_token})")]
    NotLeader {
        submitter: String,
        fencing_token: i64,
    },

    /// A fenced write affected zero rows because the presented token is no
    /// longer current.
    #[error("Fenced write rejected during {operation} (transaction {transaction_id:?})")]
    FencedRejection {
        operation: &'static str,
        transaction_id: Option<Uuid>,
    },

    #[error("Writer batch aborted: {0}")]
    BatchAborted(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Leadership problems are never retried by the call that hit them.
    #[must_use]
    pub fn is_leadership_loss(&self) -> bool {
        matches!(self, Self::NotLeader { .. } | Self::FencedRejection { .. })
    }
}

/// Database-specific errors
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                Self::Duplicate(db_err.message().to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

/// Chain connector errors
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Request validation errors
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("{0}")]
    Multiple(String),
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leadership_loss_classification() {
        let not_leader = AppError::NotLeader {
            submitter: "s1".to_string(),
            fencing_token: 4,
        };
        let fenced = AppError::FencedRejection {
            operation: "finalize",
            transaction_id: None,
        };
        let chain = AppError::Chain(ChainError::Timeout("slow".to_string()));

        assert!(not_leader.is_leadership_loss());
        assert!(fenced.is_leadership_loss());
        assert!(!chain.is_leadership_loss());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::NotLeader {
            submitter: "0xabc".to_string(),
            fencing_token: 7,
        };
        assert_eq!(
            err.to_string(),
            "Node is not the leader for submitter 0xabc (current token 7)"
        );

        let err = AppError::Database(DatabaseError::Duplicate("request_id".to_string()));
        assert_eq!(
            err.to_string(),
            "Database error: Duplicate record: request_id"
        );
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
