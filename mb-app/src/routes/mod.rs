pub mod buffers;
pub mod health;
pub mod messages;
pub mod sessions;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(buffers::router())
        .merge(sessions::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::server::AppState;
    use crate::session::SessionManager;
    use axum::Extension;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use mb_buffer::{BatchHandler, BufferedMessage, CoalescingScheduler, SchedulerConfig};
    use mb_channels::UserKey;
    use std::sync::{Arc, Mutex};
    use tower::util::ServiceExt;

    pub(crate) type Delivered = Arc<Mutex<Vec<(UserKey, Vec<BufferedMessage>)>>>;

    pub(crate) fn test_state() -> (Arc<AppState>, Delivered) {
        let delivered: Delivered = Arc::default();
        let sink = delivered.clone();
        let handler = Arc::new(move |user: UserKey, batch: Vec<BufferedMessage>| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("lock").push((user, batch));
                Ok::<(), anyhow::Error>(())
            }
        });
        let state = Arc::new(AppState::new(
            CoalescingScheduler::new(SchedulerConfig::default()),
            handler as Arc<dyn BatchHandler>,
            Arc::new(SessionManager::new()),
        ));
        (state, delivered)
    }

    pub(crate) fn app(state: Arc<AppState>) -> axum::Router {
        super::router().layer(Extension(state))
    }

    pub(crate) async fn call(
        app: axum::Router,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        (status, serde_json::from_slice(&body).expect("response json"))
    }

    pub(crate) fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    pub(crate) fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }
}
