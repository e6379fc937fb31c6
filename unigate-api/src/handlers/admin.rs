use crate::handlers::{bad_request, error_json};
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use unigate_core::router::ShardRouter;
use unigate_core::shard::ShardConfig;
use unigate_store::ApiKeyRecord;
use uuid::Uuid;

fn key_json(record: &ApiKeyRecord) -> Value {
    json!({
        "id": record.id,
        "apiKey": record.api_key,
        "description": record.description,
        "status": record.status.as_str(),
        "pricingPlanId": record.pricing_plan_id,
        "activeUntil": record.active_until.map(|t| t.to_rfc3339()),
        "createdAt": record.created_at.to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default)]
    pub description: String,
}

/// `POST /admin/keys`: mint a fresh key with no plan.
pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyBody>,
) -> (StatusCode, Json<Value>) {
    let api_key = format!("sk_{}", Uuid::new_v4().simple());
    match state.keys.create_key(&api_key, &body.description).await {
        Ok(record) => {
            // A probe for this key may have left a negative cache entry.
            state.cache.invalidate(&record.api_key);
            info!(key_id = record.id, "api key created");
            (StatusCode::OK, Json(key_json(&record)))
        }
        Err(e) => error_json(&e.into()),
    }
}

pub async fn get_key(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.keys.find_key(&api_key).await {
        Ok(Some(record)) => (StatusCode::OK, Json(key_json(&record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "API key not found", "status": 404 })),
        ),
        Err(e) => error_json(&e.into()),
    }
}

pub async fn list_keys(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.keys.list_keys().await {
        Ok(records) => {
            let list: Vec<Value> = records.iter().map(key_json).collect();
            (
                StatusCode::OK,
                Json(json!({ "list": list, "total": records.len() })),
            )
        }
        Err(e) => error_json(&e.into()),
    }
}

/// `DELETE /admin/keys/{apiKey}`: revoke. The cache entry and the key's
/// rate-limit buckets drop synchronously with the write.
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.keys.revoke_key(&api_key).await {
        Ok(true) => {
            state.cache.invalidate(&api_key);
            state.limiter.forget(&api_key);
            info!(api_key = %api_key, "api key revoked");
            (StatusCode::OK, Json(json!({ "revoked": true })))
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "API key not found", "status": 404 })),
        ),
        Err(e) => error_json(&e.into()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanBody {
    pub name: String,
    pub requests_per_second: i32,
    pub requests_per_day: i32,
    /// decimal integer, up to 78 digits
    pub price: String,
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(body): Json<CreatePlanBody>,
) -> (StatusCode, Json<Value>) {
    let Some(price) = BigUint::parse_bytes(body.price.as_bytes(), 10) else {
        return bad_request("price is not a decimal integer");
    };
    if body.requests_per_second <= 0 || body.requests_per_day <= 0 {
        return bad_request("plan limits must be positive");
    }

    match state
        .keys
        .create_plan(
            &body.name,
            body.requests_per_second,
            body.requests_per_day,
            &price,
        )
        .await
    {
        Ok(plan) => (
            StatusCode::OK,
            Json(json!({
                "planId": plan.id,
                "name": plan.name,
                "requestsPerSecond": plan.requests_per_second,
                "requestsPerDay": plan.requests_per_day,
                "price": plan.price.to_string(),
            })),
        ),
        Err(e) => error_json(&e.into()),
    }
}

pub async fn list_plans(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.keys.plans().await {
        Ok(plans) => {
            let list: Vec<Value> = plans
                .iter()
                .map(|plan| {
                    json!({
                        "planId": plan.id,
                        "name": plan.name,
                        "requestsPerSecond": plan.requests_per_second,
                        "requestsPerDay": plan.requests_per_day,
                        "price": plan.price.to_string(),
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({ "list": list, "total": plans.len() })),
            )
        }
        Err(e) => error_json(&e.into()),
    }
}

/// `POST /admin/shard-config`: validate and persist a new configuration.
/// The poller publishes it to the live router within one tick.
pub async fn save_shard_config(
    State(state): State<AppState>,
    Json(config): Json<ShardConfig>,
) -> (StatusCode, Json<Value>) {
    let router = match ShardRouter::from_config(&config) {
        Ok(router) => router,
        Err(e) => return bad_request(&e.to_string()),
    };
    if let Err(e) = router.validate() {
        return bad_request(&e.to_string());
    }

    match state.shard_configs.save(&config, "admin").await {
        Ok(id) => {
            info!(config_id = id, shards = config.shards.len(), "shard config saved");
            (StatusCode::OK, Json(json!({ "configId": id })))
        }
        Err(e) => error_json(&e.into()),
    }
}
