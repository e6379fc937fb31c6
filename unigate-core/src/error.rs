use thiserror::Error;

/// Unified error type for unigate.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    PaymentRequired(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Another payment operation is in progress for this key")]
    LockConflict,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("No shard configuration loaded")]
    RoutingUnavailable,

    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfig(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::PaymentRequired(_) => 402,
            GatewayError::NotFound(_) => 404,
            GatewayError::LockConflict => 409,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::RoutingUnavailable => 503,
            GatewayError::InvalidShardConfig(_) => 500,
            GatewayError::UpstreamUnreachable(_) => 502,
            GatewayError::UpstreamTimeout(_) => 504,
            _ => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = serde_json::to_string(&self.to_string()).unwrap_or_else(|_| "\"error\"".into());
        format!(r#"{{"error":{},"status":{}}}"#, msg, status).into_bytes()
    }
}
