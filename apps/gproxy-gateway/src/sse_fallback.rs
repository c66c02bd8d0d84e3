//! HTTP/SSE fallback path (spec.md §1 non-goal: "does not re-specify HTTP
//! streaming (used only as fallback)"). This core's hard engineering is the
//! WS path; when an account is in [`gproxy_account::fallback::CooldownLevel`]
//! cooldown the protocol resolver described in spec.md §2's data-flow
//! paragraph is expected to route here instead. The actual SSE relay loop
//! has no invariants this core owns, so it is left as a 503 stub rather
//! than a half-built duplicate of the WS forwarder.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::bootstrap::AppState;

pub async fn fallback(State(_state): State<AppState>, Json(_body): Json<Value>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {
                "type": "server_error",
                "code": "ws_required",
                "message": "HTTP/SSE fallback is not implemented by this core; connect over /v1/responses/ws",
            }
        })),
    )
}
