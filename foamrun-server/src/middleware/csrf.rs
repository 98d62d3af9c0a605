use crate::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

const COOKIE_NAME: &str = "csrf_token";
const HEADER_NAME: &str = "x-csrf-token";
const COOKIE_MAX_AGE_SECS: u32 = 3600;

/// Fresh random CSRF token, URL-safe for cookie and header transport.
pub fn generate_token() -> String {
    let entropy: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(entropy)
}

/// Lowercase hex SHA-256 of a token, the form used for comparisons.
pub fn hash_token(token: &str) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Render the Set-Cookie value for a token. The `Secure` attribute is
/// attached only when the request arrived over HTTPS; a plain-HTTP
/// deployment would otherwise never see the cookie back.
pub fn create_csrf_cookie(token: &str, secure: bool) -> String {
    let mut attrs = vec![
        format!("{COOKIE_NAME}={token}"),
        "Path=/".to_string(),
        "SameSite=Strict".to_string(),
        format!("Max-Age={COOKIE_MAX_AGE_SECS}"),
    ];
    if secure {
        attrs.push("Secure".to_string());
    }
    attrs.join("; ")
}

/// Pull the CSRF token out of the request's Cookie header, if present.
pub fn extract_csrf_from_cookies(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(COOKIE_NAME) {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// Double-submit CSRF middleware: safe methods get a cookie issued;
/// mutating methods must echo it in `X-CSRF-Token` when enforcement is
/// on.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let secure = is_https(req.headers());
    let cookie_token = extract_csrf_from_cookies(req.headers());

    let safe_method = matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    );

    if !safe_method && state.enforce_csrf {
        let header_token = req
            .headers()
            .get(HEADER_NAME)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let valid = match (&cookie_token, &header_token) {
            (Some(cookie), Some(header)) => hash_token(cookie) == hash_token(header),
            _ => false,
        };
        if !valid {
            return (StatusCode::FORBIDDEN, "CSRF token missing or invalid").into_response();
        }
    }

    let mut response = next.run(req).await;

    if safe_method && cookie_token.is_none() {
        let cookie = create_csrf_cookie(&generate_token(), secure);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_secure_only_under_https() {
        let https = create_csrf_cookie("tok", true);
        assert!(https.ends_with("; Secure"));

        let http = create_csrf_cookie("tok", false);
        assert!(!http.contains("Secure"));
        assert!(http.contains("SameSite=Strict"));
        assert!(http.starts_with("csrf_token=tok"));
    }

    #[test]
    fn cookie_extraction_handles_multiple_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; csrf_token=tok123; theme=dark"),
        );
        assert_eq!(extract_csrf_from_cookies(&headers), Some("tok123".into()));

        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        assert_eq!(extract_csrf_from_cookies(&headers), None);
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn token_hash_is_hex_sha256() {
        let digest = hash_token("abc");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable digest of a known input.
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
