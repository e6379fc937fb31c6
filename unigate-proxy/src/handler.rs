use crate::classify::{self, RoutingDirective};
use crate::forward::{header_value_from_int, Forwarder, X_RATE_LIMIT_REMAINING};
use crate::rate_limit::{RateDecision, RateLimiter};
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use http::HeaderMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use unigate_core::clock::TimeMeter;
use unigate_core::config::ProxyConfig;
use unigate_core::router::{SharedRouter, ShardTarget};
use unigate_core::GatewayError;
use unigate_observability::MetricsCollector;
use unigate_store::ApiKeyCache;

pub const X_API_KEY: &str = "x-api-key";

/// Everything the request pipeline needs, shared across requests.
pub struct ProxyContext {
    pub router: SharedRouter,
    pub cache: Arc<ApiKeyCache>,
    pub limiter: Arc<RateLimiter>,
    pub forwarder: Forwarder,
    pub clock: Arc<dyn TimeMeter>,
    pub metrics: Arc<MetricsCollector>,
    pub protected_methods: HashSet<String>,
    pub max_body_bytes: usize,
    pub max_header_count: usize,
}

impl ProxyContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProxyConfig,
        router: SharedRouter,
        cache: Arc<ApiKeyCache>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn TimeMeter>,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            router,
            cache,
            limiter,
            forwarder: Forwarder::new(config)?,
            clock,
            metrics,
            protected_methods: config.protected_methods.iter().cloned().collect(),
            max_body_bytes: config.max_body_bytes,
            max_header_count: config.max_header_count,
        })
    }
}

/// End-to-end pipeline for one proxied request:
/// classify → route → auth gate → rate limit → forward → decorate.
pub async fn handle(ctx: &ProxyContext, req: Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match run(ctx, req).await {
        Ok((target, remaining, mut response)) => {
            if let Some(remaining) = remaining {
                response.headers_mut().insert(
                    HeaderName::from_static(X_RATE_LIMIT_REMAINING),
                    header_value_from_int(remaining as i64),
                );
            }
            let latency = started.elapsed();
            ctx.metrics
                .record_proxy(target.shard_id, response.status().as_u16(), latency.as_secs_f64());
            info!(
                method = %method,
                path = %path,
                shard = target.shard_id,
                status = response.status().as_u16(),
                latency_ms = latency.as_millis() as u64,
                "proxied"
            );
            response
        }
        Err(err) => {
            warn!(method = %method, path = %path, error = %err, "request rejected");
            error_response(&err)
        }
    }
}

async fn run(
    ctx: &ProxyContext,
    req: Request,
) -> Result<(ShardTarget, Option<u64>, Response), GatewayError> {
    if req.headers().len() > ctx.max_header_count {
        return Err(GatewayError::BadRequest("too many request headers".into()));
    }

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, ctx.max_body_bytes)
        .await
        .map_err(|_| GatewayError::BadRequest("request body exceeds the size limit".into()))?;

    let classified = classify::classify(&parts.method, &parts.headers, &body)?;

    // One snapshot per request: a concurrent config swap cannot be observed
    // inconsistently past this point.
    let router = ctx.router.load_full();

    let target = match &classified.directive {
        RoutingDirective::ByRequestId(id) => router.route_by_request_id(id)?,
        RoutingDirective::ByShardId(id) => router
            .route_by_shard_id(*id)?
            .ok_or_else(|| GatewayError::BadRequest(format!("Unknown shard ID: {id}")))?,
        RoutingDirective::Random => router.random_target()?,
    };

    let mut remaining = None;
    if let Some(rpc_method) = &classified.rpc_method {
        if ctx.protected_methods.contains(rpc_method) {
            let info = authenticate(ctx, &parts.headers).await?;
            match ctx.limiter.try_consume(&info) {
                RateDecision::Allowed { remaining: left } => remaining = Some(left),
                RateDecision::Denied { retry_after_secs } => {
                    ctx.metrics
                        .rate_limited_total
                        .with_label_values(&[&info.api_key])
                        .inc();
                    return Err(GatewayError::RateLimited { retry_after_secs });
                }
            }
        }
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let response = ctx
        .forwarder
        .forward(&target, parts.method, path_and_query, &parts.headers, body)
        .await?;

    Ok((target, remaining, response))
}

async fn authenticate(
    ctx: &ProxyContext,
    headers: &HeaderMap,
) -> Result<unigate_store::CachedKeyInfo, GatewayError> {
    let Some(api_key) = extract_credential(headers) else {
        ctx.metrics
            .auth_failures_total
            .with_label_values(&["missing"])
            .inc();
        return Err(GatewayError::Unauthorized);
    };

    let Some(info) = ctx.cache.get(&api_key).await? else {
        ctx.metrics
            .auth_failures_total
            .with_label_values(&["unknown"])
            .inc();
        return Err(GatewayError::Unauthorized);
    };

    if let Some(active_until) = info.active_until {
        if active_until <= ctx.clock.now() {
            ctx.metrics
                .auth_failures_total
                .with_label_values(&["expired"])
                .inc();
            return Err(GatewayError::Unauthorized);
        }
    }

    Ok(info)
}

/// Credential sources, in order: `X-API-Key`, then `Authorization: Bearer`.
fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(X_API_KEY) {
        if let Ok(key) = value.to_str() {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
    }

    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let key = value.strip_prefix("Bearer ")?.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Map a pipeline error to its HTTP shape.
pub fn error_response(err: &GatewayError) -> Response {
    let status = err.status_code();
    let builder = Response::builder().status(status);

    match err {
        GatewayError::Unauthorized => builder
            .header(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .body(Body::from("Unauthorized")),
        GatewayError::RateLimited { retry_after_secs } => builder
            .header(RETRY_AFTER, header_value_from_int(*retry_after_secs as i64))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(Body::from(err.to_json_body())),
        other => builder
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(Body::from(other.to_json_body())),
    }
    .expect("static error responses are well-formed")
}
