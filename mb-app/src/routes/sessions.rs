use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use mb_channels::UserKey;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{user_key}", get(get_session))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_key): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.sessions.get(&UserKey::new(user_key)) {
        Some(session) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "session": session })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "no_session" })),
        ),
    }
}
