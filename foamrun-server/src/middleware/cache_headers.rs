use axum::body::Body;
use axum::http::{header, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;

/// Cache policy for API responses: anything carrying a validator (ETag
/// or Last-Modified) is revalidate-always (`no-cache`); JSON without a
/// validator is sensitive and must not be stored at all.
pub async fn apply_cache_policy(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;

    let has_validator = response.headers().contains_key(header::ETAG)
        || response.headers().contains_key(header::LAST_MODIFIED);

    if has_validator {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
    } else if is_json(&response) {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, max-age=0"),
        );
    }

    response
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}
