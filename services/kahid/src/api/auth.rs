//! Per-request authentication guard for the `/api/v1` routes.
//!
//! Requests arriving over the Unix socket bypass authentication, as do
//! all requests when no username is configured.  TCP requests otherwise
//! need HTTP Basic credentials: the username must match and the
//! password is checked against the stored value — bcrypt when the
//! stored value has a `$2` prefix, plain string equality otherwise
//! (test setups only; a plaintext password in production config is a
//! misconfiguration).

use super::{AppState, Transport, response};
use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;

pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.extensions().get::<Transport>().copied() == Some(Transport::Unix) {
        return next.run(request).await;
    }
    let Some(credentials) = state.auth.clone() else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
        .is_some_and(|(username, password)| {
            username == credentials.username && check_password(&password, &credentials.password)
        });
    if authorized {
        next.run(request).await
    } else {
        challenge()
    }
}

fn challenge() -> Response {
    let mut response = response::unauthorized("authentication required");
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"kahi\""),
    );
    response
}

/// Decode `Basic <base64(user:pass)>`.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// Compare a presented password against the stored value.
pub fn check_password(plaintext: &str, stored: &str) -> bool {
    if stored.is_empty() {
        return plaintext.is_empty();
    }
    if stored.starts_with("$2") {
        return bcrypt::verify(plaintext, stored).unwrap_or(false);
    }
    plaintext == stored
}
