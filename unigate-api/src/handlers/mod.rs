pub mod admin;
pub mod health;
pub mod payment;

use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};
use unigate_core::GatewayError;

/// Error shape shared by every API handler.
pub(crate) fn error_json(err: &GatewayError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "error": err.to_string(), "status": status.as_u16() })),
    )
}

pub(crate) fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    error_json(&GatewayError::BadRequest(message.to_string()))
}
