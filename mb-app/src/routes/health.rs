use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.scheduler.config();
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "buffer": {
            "initial_timeout_seconds": config.initial_timeout.as_secs(),
            "inter_message_timeout_seconds": config.inter_message_timeout.as_secs(),
        },
        "scheduler": state.scheduler.stats(),
        "sessions": state.sessions.list().len(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{app, call, get, test_state};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn health_reports_scheduler_stats() {
        let (state, _) = test_state();
        let (status, body) = call(app(state), get("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["buffer"]["inter_message_timeout_seconds"], 15);
        assert_eq!(body["scheduler"]["accepted"], 0);
        assert_eq!(body["scheduler"]["active_buffers"], 0);
    }
}
