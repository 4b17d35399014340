use crate::error::{AppError, AppErrorKind, InfrastructureError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("foreign key violated: {constraint}")]
    ForeignKeyViolation { constraint: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("serialization failure, transaction can be retried")]
    SerializationFailure,

    #[error("database error: {message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        })
    }

    /// Classifies an sqlx error by SQLSTATE where one is available
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => DatabaseErrorKind::PoolExhausted,
            sqlx::Error::Io(e) => DatabaseErrorKind::ConnectionError {
                message: e.to_string(),
            },
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                match db_err.code().as_deref() {
                    Some("23505") => DatabaseErrorKind::UniqueViolation { constraint },
                    Some("23503") => DatabaseErrorKind::ForeignKeyViolation { constraint },
                    Some("40001") | Some("40P01") => DatabaseErrorKind::SerializationFailure,
                    _ => DatabaseErrorKind::Unknown {
                        message: db_err.message().to_string(),
                    },
                }
            }
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };

        Self::new(kind)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. }
                | DatabaseErrorKind::PoolExhausted
                | DatabaseErrorKind::SerializationFailure
        )
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let is_retryable = err.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable,
        }))
    }
}
