//! Errores de persistencia.
//! Mapea errores de Diesel / pool a variantes semánticas, y de ahí al
//! `StoreError` que entiende el core.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use cauce_core::errors::StoreError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => {
                    Self::UniqueViolation(info.message().to_string())
                }
                DatabaseErrorKind::CheckViolation => {
                    Self::CheckViolation(info.message().to_string())
                }
                DatabaseErrorKind::ForeignKeyViolation => {
                    Self::ForeignKeyViolation(info.message().to_string())
                }
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Unknown(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Unknown(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => {
                Self::TransientIo("broken transaction manager".into())
            }
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<PersistenceError> for StoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::UniqueViolation(m) => StoreError::UniqueViolation(m),
            PersistenceError::NotFound => StoreError::NotFound("row not found".into()),
            PersistenceError::SerializationConflict => {
                StoreError::TransientIo("serialization conflict".into())
            }
            PersistenceError::TransientIo(m) => StoreError::TransientIo(m),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Errores transitorios: recomendado reintentar con backoff.
pub fn is_retryable(err: &PersistenceError) -> bool {
    match err {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}
