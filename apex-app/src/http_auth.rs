//! HMAC request signing.
//!
//! A signed request carries `X-TS` (unix seconds) and `X-SIG`, the hex
//! `HMAC-SHA256(key, ts + "." + body)`. Requests outside a 300 s window are rejected.

use crate::api_error::ApiError;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const REPLAY_WINDOW_SECONDS: i64 = 300;
pub const TS_HEADER: &str = "x-ts";
pub const SIG_HEADER: &str = "x-sig";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("server misconfigured: {0}")]
    ServerMisconfigured(&'static str),
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::ServerMisconfigured(_) => "server_misconfigured",
        }
    }
}

fn mac_for(key: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| AuthError::ServerMisconfigured("shared key rejected by hmac"))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

pub fn sign(key: &str, timestamp: &str, body: &[u8]) -> Result<String, AuthError> {
    if key.is_empty() {
        return Err(AuthError::ServerMisconfigured("shared key not set"));
    }
    Ok(hex::encode(mac_for(key, timestamp, body)?.finalize().into_bytes()))
}

/// Pure check of one signed request. `now` is unix seconds.
pub fn verify(
    signature: Option<&str>,
    timestamp: Option<&str>,
    body: &[u8],
    key: Option<&str>,
    now: i64,
) -> Result<(), AuthError> {
    let Some(key) = key.filter(|k| !k.is_empty()) else {
        return Err(AuthError::ServerMisconfigured("shared key not set"));
    };
    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
        return Err(AuthError::Unauthorized("missing signature headers"));
    };
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| AuthError::Unauthorized("timestamp is not an integer"))?;
    if now.abs_diff(ts) > REPLAY_WINDOW_SECONDS.unsigned_abs() {
        return Err(AuthError::Unauthorized("timestamp outside allowed window"));
    }
    let provided =
        hex::decode(signature.trim()).map_err(|_| AuthError::Unauthorized("signature is not hex"))?;
    mac_for(key, timestamp.trim(), body)?
        .verify_slice(&provided)
        .map_err(|_| AuthError::Unauthorized("signature mismatch"))
}

/// Shared key and limits for the signature middleware, passed as a request extension.
#[derive(Debug, Clone, Default)]
pub struct SignaturePolicy {
    pub shared_key: Option<String>,
    pub max_body_bytes: usize,
    pub exempt_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignaturePolicyExt(pub SignaturePolicy);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Requires a valid signature on every POST outside `exempt_paths`. The body is buffered for
/// verification and handed on unchanged.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_signature(req: Request<Body>, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let policy = req
        .extensions()
        .get::<SignaturePolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();
    if policy.exempt_paths.iter().any(|p| p == req.uri().path()) {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let limit = if policy.max_body_bytes == 0 {
        usize::MAX
    } else {
        policy.max_body_bytes
    };
    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to buffer signed request body");
            return ApiError::with_status(
                StatusCode::PAYLOAD_TOO_LARGE,
                "validation_error",
                "request body too large",
            )
            .into_response();
        }
    };

    let now = chrono::Utc::now().timestamp();
    if let Err(e) = verify(
        header(&parts.headers, SIG_HEADER),
        header(&parts.headers, TS_HEADER),
        &bytes,
        policy.shared_key.as_deref(),
        now,
    ) {
        tracing::warn!(kind = e.kind(), error = %e, path = %parts.uri.path(), "signed request rejected");
        return ApiError::from(e).into_response();
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
