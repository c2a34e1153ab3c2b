use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;

/// Rejects any request whose `X-API-Key` header doesn't match the configured
/// key. `/api/health` is exempted at the router level, not here, so this
/// middleware can stay a single unconditional check.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if state.config.api_key.is_empty() || provided != state.config.api_key {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({ "error": "unauthorized", "code": "unauthorized" })),
        )
            .into_response();
    }

    next.run(request).await
}
