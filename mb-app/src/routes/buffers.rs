use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use mb_channels::UserKey;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/buffers/{user_key}",
        get(get_buffer).delete(delete_buffer),
    )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_buffer(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_key): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.scheduler.status(&UserKey::new(user_key)) {
        Some(status) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "buffer_status": status })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "no_buffer" })),
        ),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn delete_buffer(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_key): Path<String>,
) -> Json<serde_json::Value> {
    let user_key = UserKey::new(user_key);
    state.scheduler.cleanup(&user_key);
    let session_removed = state.sessions.remove(&user_key);
    Json(serde_json::json!({
        "status": "cleaned",
        "user_key": user_key,
        "session_removed": session_removed,
    }))
}
