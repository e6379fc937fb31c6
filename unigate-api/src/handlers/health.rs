use crate::server::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};

/// `GET /health`: reports router mode, live config id, and DB reachability.
/// Stays green on a failsafe router so operators can reach the admin surface
/// and fix the configuration.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let router = state.router.load();
    let database = match &state.pool {
        Some(pool) => {
            if unigate_store::db::ping(pool).await {
                "up"
            } else {
                "down"
            }
        }
        None => "unconfigured",
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "router": if router.is_failsafe() { "failsafe" } else { "routing" },
            "configId": router.config_id(),
            "shards": router.shard_count(),
            "database": database,
        })),
    )
}
