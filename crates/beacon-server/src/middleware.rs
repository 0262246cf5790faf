use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::AppState;

/// Extracts `(username, password)` from an `Authorization: Basic` header value.
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Compares a presented secret with the configured one in constant time.
///
/// Both sides are hashed first so the comparison length does not depend on
/// the configured value.
pub fn credentials_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given.as_slice().ct_eq(expected.as_slice()).into()
}

/// Rejects hub requests that do not carry the configured agent credentials.
pub async fn hub_auth_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let (username, password) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Non-short-circuit `&` so a wrong username costs the same as a wrong password.
    let accepted = credentials_match(&username, &state.hub.username)
        & credentials_match(&password, &state.hub.password);
    if !accepted {
        tracing::warn!(username = %username, path = %req.uri().path(), "rejected hub credentials");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header_parsing() {
        let header = format!("Basic {}", STANDARD.encode("agent:s3:cret"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("agent".to_string(), "s3:cret".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer token"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
        assert_eq!(
            parse_basic_auth(&format!("Basic {}", STANDARD.encode("no-colon"))),
            None
        );
    }

    #[test]
    fn credentials_match_only_identical_secrets() {
        assert!(credentials_match("s3:cret", "s3:cret"));
        assert!(!credentials_match("s3:cret", "s3:creT"));
        assert!(!credentials_match("s3:cre", "s3:cret"));
        assert!(!credentials_match("", "s3:cret"));
        assert!(credentials_match("", ""));
    }
}
