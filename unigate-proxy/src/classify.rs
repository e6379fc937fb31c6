use http::header::COOKIE;
use http::{HeaderMap, Method};
use unigate_core::GatewayError;

pub const REQUEST_ID_COOKIE: &str = "UNICITY_REQUEST_ID";
pub const SHARD_ID_COOKIE: &str = "UNICITY_SHARD_ID";

const BOTH_PARAMS: &str = "Cannot specify both requestId and shardId";
const NEITHER_PARAM: &str = "JSON-RPC requests must include either requestId or shardId";

/// How the request picks its shard.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDirective {
    ByRequestId(String),
    ByShardId(i32),
    Random,
}

/// The result of inspecting a request: whether it is JSON-RPC (and which
/// method), plus the routing directive extracted from its params or cookies.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRequest {
    /// JSON-RPC method name; `None` for plain HTTP traffic.
    pub rpc_method: Option<String>,
    pub directive: RoutingDirective,
}

/// Classify a request and extract its routing directive.
///
/// JSON-RPC means: POST whose body is a JSON object carrying a string
/// `method` and an object `params` (plus the usual `jsonrpc` marker, which is
/// tolerated but not required). JSON-RPC requests must name exactly one of
/// `params.requestId` / `params.shardId`; everything else falls back to the
/// `UNICITY_*` cookies under the same exactly-one rule, with absence meaning
/// a random target.
pub fn classify(
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ClassifiedRequest, GatewayError> {
    if method == Method::POST {
        if let Some((rpc_method, directive)) = try_json_rpc(body)? {
            return Ok(ClassifiedRequest {
                rpc_method: Some(rpc_method),
                directive,
            });
        }
    }

    Ok(ClassifiedRequest {
        rpc_method: None,
        directive: cookie_directive(headers)?,
    })
}

/// Returns `Ok(None)` when the body is not a JSON-RPC envelope at all.
fn try_json_rpc(body: &[u8]) -> Result<Option<(String, RoutingDirective)>, GatewayError> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return Ok(None),
    };

    let method = match obj.get("method").and_then(|m| m.as_str()) {
        Some(m) => m,
        None => return Ok(None),
    };

    let params = match obj.get("params").and_then(|p| p.as_object()) {
        Some(p) => p,
        None => return Ok(None),
    };

    let request_id = params.get("requestId").and_then(|v| v.as_str());
    let shard_id = params.get("shardId");

    let directive = match (request_id, shard_id) {
        (Some(_), Some(_)) => return Err(GatewayError::BadRequest(BOTH_PARAMS.into())),
        (Some(id), None) => RoutingDirective::ByRequestId(id.to_string()),
        (None, Some(v)) => RoutingDirective::ByShardId(parse_shard_id_value(v)?),
        (None, None) => return Err(GatewayError::BadRequest(NEITHER_PARAM.into())),
    };

    Ok(Some((method.to_string(), directive)))
}

fn parse_shard_id_value(v: &serde_json::Value) -> Result<i32, GatewayError> {
    let parsed = match v {
        serde_json::Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        serde_json::Value::String(s) => parse_shard_id_str(s),
        _ => None,
    };
    parsed
        .filter(|id| *id >= 0)
        .ok_or_else(|| GatewayError::BadRequest("invalid shard ID format".into()))
}

fn parse_shard_id_str(s: &str) -> Option<i32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn cookie_directive(headers: &HeaderMap) -> Result<RoutingDirective, GatewayError> {
    let mut request_id = None;
    let mut shard_id = None;

    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            match name.trim() {
                REQUEST_ID_COOKIE => request_id = Some(value.trim().to_string()),
                SHARD_ID_COOKIE => shard_id = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    match (request_id, shard_id) {
        (Some(_), Some(_)) => Err(GatewayError::BadRequest(BOTH_PARAMS.into())),
        (Some(id), None) => Ok(RoutingDirective::ByRequestId(id)),
        (None, Some(s)) => {
            let id = parse_shard_id_str(&s)
                .ok_or_else(|| GatewayError::BadRequest("invalid shard ID format".into()))?;
            Ok(RoutingDirective::ByShardId(id))
        }
        (None, None) => Ok(RoutingDirective::Random),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn rpc_body(params: serde_json::Value) -> Vec<u8> {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "submit_commitment",
            "params": params,
        })
        .to_string()
        .into_bytes()
    }

    fn long_hex() -> String {
        "0".repeat(63) + "f"
    }

    #[test]
    fn json_rpc_with_request_id() {
        let body = rpc_body(serde_json::json!({ "requestId": long_hex() }));
        let c = classify(&Method::POST, &HeaderMap::new(), &body).unwrap();
        assert_eq!(c.rpc_method.as_deref(), Some("submit_commitment"));
        assert_eq!(c.directive, RoutingDirective::ByRequestId(long_hex()));
    }

    #[test]
    fn json_rpc_with_shard_id_number_or_string() {
        let body = rpc_body(serde_json::json!({ "shardId": 5 }));
        let c = classify(&Method::POST, &HeaderMap::new(), &body).unwrap();
        assert_eq!(c.directive, RoutingDirective::ByShardId(5));

        let body = rpc_body(serde_json::json!({ "shardId": "7" }));
        let c = classify(&Method::POST, &HeaderMap::new(), &body).unwrap();
        assert_eq!(c.directive, RoutingDirective::ByShardId(7));
    }

    #[test]
    fn json_rpc_with_both_params_is_rejected() {
        let body = rpc_body(serde_json::json!({ "requestId": long_hex(), "shardId": 5 }));
        let err = classify(&Method::POST, &HeaderMap::new(), &body).unwrap_err();
        assert_eq!(err.to_string(), "Cannot specify both requestId and shardId");
    }

    #[test]
    fn json_rpc_with_neither_param_is_rejected() {
        let body = rpc_body(serde_json::json!({}));
        let err = classify(&Method::POST, &HeaderMap::new(), &body).unwrap_err();
        assert_eq!(
            err.to_string(),
            "JSON-RPC requests must include either requestId or shardId"
        );
    }

    #[test]
    fn negative_or_garbled_shard_ids_are_rejected() {
        for bad in [
            serde_json::json!({ "shardId": -2 }),
            serde_json::json!({ "shardId": "2x" }),
            serde_json::json!({ "shardId": true }),
            serde_json::json!({ "shardId": "" }),
        ] {
            let body = rpc_body(bad);
            assert!(classify(&Method::POST, &HeaderMap::new(), &body).is_err());
        }
    }

    #[test]
    fn non_post_is_never_json_rpc() {
        let body = rpc_body(serde_json::json!({ "requestId": long_hex() }));
        let c = classify(&Method::GET, &HeaderMap::new(), &body).unwrap();
        assert_eq!(c.rpc_method, None);
        assert_eq!(c.directive, RoutingDirective::Random);
    }

    #[test]
    fn post_without_rpc_envelope_is_plain_http() {
        for body in [&b"not json"[..], br#"{"method":"x"}"#, br#"[1,2,3]"#, br#""str""#] {
            let c = classify(&Method::POST, &HeaderMap::new(), body).unwrap();
            assert_eq!(c.rpc_method, None);
        }
    }

    #[test]
    fn jsonrpc_marker_is_optional() {
        let body = serde_json::json!({
            "method": "get_inclusion_proof",
            "params": { "requestId": long_hex() },
        })
        .to_string();
        let c = classify(&Method::POST, &HeaderMap::new(), body.as_bytes()).unwrap();
        assert_eq!(c.rpc_method.as_deref(), Some("get_inclusion_proof"));
        assert_eq!(c.directive, RoutingDirective::ByRequestId(long_hex()));
    }

    #[test]
    fn rpc_envelope_requires_object_params() {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "get_block",
            "params": [1, 2],
        })
        .to_string();
        let c = classify(&Method::POST, &HeaderMap::new(), body.as_bytes()).unwrap();
        assert_eq!(c.rpc_method, None);
    }

    #[test]
    fn cookies_route_plain_traffic() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("a=b; UNICITY_REQUEST_ID={}", long_hex())).unwrap(),
        );
        let c = classify(&Method::GET, &headers, b"").unwrap();
        assert_eq!(c.directive, RoutingDirective::ByRequestId(long_hex()));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("UNICITY_SHARD_ID=4"));
        let c = classify(&Method::GET, &headers, b"").unwrap();
        assert_eq!(c.directive, RoutingDirective::ByShardId(4));
    }

    #[test]
    fn both_cookies_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!(
                "UNICITY_REQUEST_ID={}; UNICITY_SHARD_ID=4",
                long_hex()
            ))
            .unwrap(),
        );
        let err = classify(&Method::GET, &headers, b"").unwrap_err();
        assert_eq!(err.to_string(), "Cannot specify both requestId and shardId");
    }

    #[test]
    fn no_cookies_means_random_target() {
        let c = classify(&Method::GET, &HeaderMap::new(), b"").unwrap();
        assert_eq!(c.directive, RoutingDirective::Random);
    }
}
