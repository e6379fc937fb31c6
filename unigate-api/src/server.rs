use crate::cors;
use crate::handlers;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use unigate_core::router::SharedRouter;
use unigate_observability::MetricsCollector;
use unigate_payment::PaymentService;
use unigate_proxy::{ProxyContext, RateLimiter};
use unigate_store::shard_config::ShardConfigStore;
use unigate_store::{ApiKeyCache, KeyStore};

/// Shared state for the whole HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ProxyContext>,
    pub payments: Arc<PaymentService>,
    pub keys: Arc<dyn KeyStore>,
    pub shard_configs: Arc<dyn ShardConfigStore>,
    pub cache: Arc<ApiKeyCache>,
    pub limiter: Arc<RateLimiter>,
    pub router: SharedRouter,
    pub metrics: Arc<MetricsCollector>,
    /// Absent in handler tests; health reports the database as unconfigured.
    pub pool: Option<PgPool>,
}

/// Build the axum app: payment surface, admin surface, health, metrics, and
/// the proxy fallback that carries all remaining traffic to the shards.
pub fn build_router(state: AppState) -> AxumRouter {
    let payment_api = AxumRouter::new()
        .route("/plans", get(handlers::payment::list_plans))
        .route("/initiate", post(handlers::payment::initiate))
        .route("/complete", post(handlers::payment::complete))
        .route("/session/{id}", get(handlers::payment::session_status))
        .route("/key/{api_key}", get(handlers::payment::key_details));

    let admin_api = AxumRouter::new()
        .route(
            "/keys",
            get(handlers::admin::list_keys).post(handlers::admin::create_key),
        )
        .route(
            "/keys/{api_key}",
            get(handlers::admin::get_key).delete(handlers::admin::revoke_key),
        )
        .route(
            "/plans",
            get(handlers::admin::list_plans).post(handlers::admin::create_plan),
        )
        .route("/shard-config", post(handlers::admin::save_shard_config));

    AxumRouter::new()
        .nest("/api/payment", payment_api)
        .nest("/admin", admin_api)
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(cors::cors))
        .fallback(proxy_fallback)
        .with_state(state)
}

/// Everything that is not an API route is proxied to the shards.
async fn proxy_fallback(State(state): State<AppState>, req: Request) -> Response {
    unigate_proxy::handler::handle(&state.proxy, req).await
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.gather_text()
}
