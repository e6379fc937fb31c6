use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::header::{HeaderValue, ORIGIN};
use http::{Method, StatusCode};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str =
    "Content-Type, Authorization, X-API-Key, X-Requested-With, Accept, Origin";
const MAX_AGE: &str = "3600";

/// Permissive CORS for the payment and admin surface.
///
/// Echoes the request `Origin` (falling back to `*`), answers preflight
/// `OPTIONS` with 204, and decorates every other response.
pub async fn cors(req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    if req.method() == Method::OPTIONS {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("static preflight response is well-formed");
        apply_headers(&mut response, origin);
        return response;
    }

    let mut response = next.run(req).await;
    apply_headers(&mut response, origin);
    response
}

fn apply_headers(response: &mut Response, origin: HeaderValue) {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", origin);
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static(MAX_AGE));
}
