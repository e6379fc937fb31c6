use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::time::Duration;
use unigate_core::config::ProxyConfig;
use unigate_core::router::ShardTarget;
use unigate_core::GatewayError;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound credentials stripped before forwarding; the upstream never learns
/// the caller's key.
const CREDENTIAL_HEADERS: &[&str] = &["x-api-key", "authorization"];

/// Headers the client owns that reqwest re-derives for the outbound request.
const MANAGED_HEADERS: &[&str] = &["host", "content-length"];

pub const X_SHARD_ID: &str = "x-shard-id";
pub const X_RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";

/// Forwards requests to shard targets over a pooled HTTP client.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;
        Ok(Self { client })
    }

    /// Forward one request to its shard and stream the response back.
    ///
    /// Preserves method, path, query, body, and headers minus the hop-by-hop
    /// and credential sets; `Host` is rewritten for the target. The response
    /// carries `X-Shard-ID`, and no retry happens across shards: a failed
    /// forward surfaces as 502/504.
    pub async fn forward(
        &self,
        target: &ShardTarget,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, GatewayError> {
        let url = format!("{}{}", target.url, path_and_query);

        let mut outbound = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if strip_request_header(name.as_str()) {
                continue;
            }
            outbound.append(name.clone(), value.clone());
        }

        let upstream = self
            .client
            .request(method, &url)
            .headers(outbound)
            .body(body)
            .send()
            .await
            .map_err(|e| map_send_error(&target.url, e))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if HOP_BY_HOP.contains(&name.as_str()) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            headers.insert(
                HeaderName::from_static(X_SHARD_ID),
                header_value_from_int(target.shard_id as i64),
            );
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn strip_request_header(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
        || CREDENTIAL_HEADERS.contains(&name)
        || MANAGED_HEADERS.contains(&name)
}

fn map_send_error(url: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout(url.to_string())
    } else {
        GatewayError::UpstreamUnreachable(format!("{url}: {e}"))
    }
}

pub fn header_value_from_int(v: i64) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).expect("decimal integers are valid header values")
}
