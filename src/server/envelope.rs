//! Envelope decryption middleware
//!
//! For non-GET/HEAD `/api/*` requests whose JSON body carries the string
//! field `gameData`, this middleware decrypts the envelope, replaces the
//! request body with the decrypted metadata object, and attaches the binary
//! tail of the frame as a request extension. v2 frames additionally pass
//! replay validation here, immediately after decryption — the single
//! enforcement point.
//!
//! Bodies without `gameData` pass through unchanged for legacy routes.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use super::routes::AppState;
use crate::error::RelayError;
use crate::transport::EnvelopeVersion;

/// Cap on the encrypted request body (the base64 envelope).
pub const MAX_BODY_BYTES: usize = 128 * 1024 * 1024;

/// Decrypted binary payload of the request frame, handed to handlers
/// out-of-band from the JSON body.
#[derive(Debug, Clone)]
pub struct BinaryPayload(pub Bytes);

/// Decrypt `gameData` envelopes into metadata body + binary extension.
pub async fn decrypt_envelope(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::GET || req.method() == Method::HEAD {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return RelayError::InvalidInput("request body too large or unreadable".into())
                .into_response()
        }
    };

    let envelope_b64 = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("gameData").and_then(Value::as_str).map(str::to_owned));

    let Some(envelope_b64) = envelope_b64 else {
        // Not an encrypted request; hand the original body through.
        let req = Request::from_parts(parts, Body::from(bytes));
        return next.run(req).await;
    };

    let payload = match BASE64.decode(envelope_b64.as_bytes()) {
        Ok(payload) => payload,
        Err(e) => {
            return RelayError::Decryption(format!("gameData is not valid base64: {e}"))
                .into_response()
        }
    };

    let mut frame = match state.opener.open(&payload) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(target: "envelope", "envelope rejected: {e}");
            return RelayError::from(e).into_response();
        }
    };

    if frame.version == EnvelopeVersion::V2 {
        if let Err(e) = state.replay.validate(&mut frame.metadata) {
            debug!(target: "envelope", "replay rejected: {e}");
            return RelayError::from(e).into_response();
        }
    }

    let metadata_bytes = match serde_json::to_vec(&Value::Object(frame.metadata)) {
        Ok(bytes) => bytes,
        Err(e) => return RelayError::Internal(e.to_string()).into_response(),
    };

    parts.extensions.insert(BinaryPayload(Bytes::from(frame.binary)));
    let req = Request::from_parts(parts, Body::from(metadata_bytes));
    next.run(req).await
}
