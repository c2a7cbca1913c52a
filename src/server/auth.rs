//! Authentication middleware
//!
//! Every `/api/*` request must present the shared secret in the
//! `x-server-key` header. The comparison is timing-safe and runs before any
//! decryption work.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::routes::AppState;
use crate::error::RelayError;

/// Header carrying the shared API secret.
pub const API_KEY_HEADER: &str = "x-server-key";

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Reject requests without a valid `x-server-key` header.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(value) if timing_safe_eq(value, &state.config.api_key) => next.run(req).await,
        _ => {
            debug!(target: "auth", path = %req.uri().path(), "rejected request without valid api key");
            RelayError::Unauthorized.into_response()
        }
    }
}
