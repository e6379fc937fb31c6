use thiserror::Error;
use unigate_core::GatewayError;

/// Store-level failures, with the row-lock conflict carved out as its own
/// kind so the HTTP layer can map it to 409.
#[derive(Error, Debug)]
pub enum StoreError {
    /// `FOR UPDATE NOWAIT` hit a concurrently held row lock (SQLSTATE 55P03).
    #[error("row is locked by a concurrent operation")]
    LockConflict,

    #[error("api key not found")]
    KeyNotFound,

    #[error("api key is revoked")]
    KeyRevoked,

    /// The session left the pending state between read and write.
    #[error("session is no longer pending")]
    SessionNotPending,

    #[error("numeric column held a non-decimal value: {0}")]
    Numeric(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.code().as_deref() == Some("55P03") {
                return StoreError::LockConflict;
            }
        }
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockConflict => GatewayError::LockConflict,
            StoreError::KeyNotFound => GatewayError::BadRequest("Invalid API key".into()),
            StoreError::KeyRevoked => GatewayError::BadRequest("API key is revoked".into()),
            StoreError::SessionNotPending => {
                GatewayError::PaymentRequired("Session is not pending".into())
            }
            other => GatewayError::Store(other.to_string()),
        }
    }
}
