use crate::handlers::{bad_request, error_json};
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use unigate_payment::service::{CompleteRequest, InitiateRequest};
use unigate_store::PricingPlan;
use uuid::Uuid;

fn plan_json(plan: &PricingPlan) -> Value {
    json!({
        "planId": plan.id,
        "name": plan.name,
        "requestsPerSecond": plan.requests_per_second,
        "requestsPerDay": plan.requests_per_day,
        "price": plan.price.to_string(),
    })
}

/// `GET /api/payment/plans`
pub async fn list_plans(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.payments.plans().await {
        Ok(plans) => (
            StatusCode::OK,
            Json(json!({
                "availablePlans": plans.iter().map(plan_json).collect::<Vec<_>>(),
            })),
        ),
        Err(e) => error_json(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateBody {
    pub api_key: Option<String>,
    pub target_plan_id: i64,
    /// base64
    pub token_id: String,
    /// base64
    pub token_type: String,
}

/// `POST /api/payment/initiate`
pub async fn initiate(
    State(state): State<AppState>,
    Json(body): Json<InitiateBody>,
) -> (StatusCode, Json<Value>) {
    let Ok(token_id) = BASE64.decode(&body.token_id) else {
        return bad_request("tokenId is not valid base64");
    };
    let Ok(token_type) = BASE64.decode(&body.token_type) else {
        return bad_request("tokenType is not valid base64");
    };

    let request = InitiateRequest {
        api_key: body.api_key,
        target_plan_id: body.target_plan_id,
        token_id,
        token_type,
    };

    match state.payments.initiate(request).await {
        Ok(opened) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": opened.session_id,
                "apiKey": opened.api_key,
                "paymentAddress": opened.payment_address,
                "amountRequired": opened.amount_required.to_string(),
                "expiresAt": opened.expires_at.to_rfc3339(),
            })),
        ),
        Err(e) => error_json(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody {
    pub session_id: String,
    /// base64; accepted and carried, consumed only if verification needs it
    #[serde(default)]
    pub salt: String,
    pub transfer_commitment_json: Value,
    pub source_token_json: Value,
}

/// `POST /api/payment/complete`
pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> (StatusCode, Json<Value>) {
    let Ok(session_id) = Uuid::parse_str(&body.session_id) else {
        return bad_request("Invalid session ID");
    };
    let Ok(salt) = BASE64.decode(&body.salt) else {
        return bad_request("salt is not valid base64");
    };
    let Some(transfer_commitment) = embedded_json(body.transfer_commitment_json) else {
        return bad_request("transferCommitmentJson is not valid JSON");
    };
    let Some(source_token) = embedded_json(body.source_token_json) else {
        return bad_request("sourceTokenJson is not valid JSON");
    };

    let request = CompleteRequest {
        session_id,
        salt,
        transfer_commitment,
        source_token,
    };

    match state.payments.complete(request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": outcome.success,
                "message": outcome.message,
                "newPlanId": outcome.new_plan_id,
                "apiKey": outcome.api_key,
            })),
        ),
        Err(e) => error_json(&e),
    }
}

/// The commitment and token arrive either as embedded objects or as strings
/// of JSON; both shapes are accepted.
fn embedded_json(value: Value) -> Option<Value> {
    match value {
        Value::String(raw) => serde_json::from_str(&raw).ok(),
        Value::Object(obj) => Some(Value::Object(obj)),
        _ => None,
    }
}

/// `GET /api/payment/session/{id}`
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Ok(session_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid session ID");
    };

    match state.payments.payment_status(session_id).await {
        Ok(Some(session)) => (
            StatusCode::OK,
            Json(json!({
                "id": session.id,
                "status": session.status.as_str(),
                "amountRequired": session.amount_required.to_string(),
                "createdAt": session.created_at.to_rfc3339(),
                "completedAt": session.completed_at.map(|t| t.to_rfc3339()),
                "expiresAt": session.expires_at.to_rfc3339(),
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Invalid session ID", "status": 404 })),
        ),
        Err(e) => error_json(&e),
    }
}

/// `GET /api/payment/key/{apiKey}`
pub async fn key_details(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.payments.key_details(&api_key).await {
        Ok(details) => (
            StatusCode::OK,
            Json(json!({
                "status": details.status.as_str(),
                "expiresAt": details.active_until.map(|t| t.to_rfc3339()),
                "pricingPlan": details.plan.as_ref().map(plan_json),
            })),
        ),
        Err(e) => error_json(&e),
    }
}
