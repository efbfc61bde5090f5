use crate::server::AppState;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use mb_buffer::{BufferedMessage, SchedulerError, SubmitOutcome};
use mb_channels::InboundMessage;
use std::sync::Arc;

type Reply = (StatusCode, Json<serde_json::Value>);

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/messages", post(receive_message))
}

fn error_reply(status: StatusCode, error: impl ToString) -> Reply {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error.to_string() })),
    )
}

/// Maps a bridge webhook payload onto a valid buffered message. Nothing is
/// registered for a user until this succeeds.
fn to_buffered(inbound: &InboundMessage) -> Result<BufferedMessage, String> {
    let kind = inbound
        .kind()
        .ok_or_else(|| format!("unsupported message type {:?}", inbound.message_type))?;
    let media = inbound.decode_media().map_err(|e| e.to_string())?;
    let mut message = BufferedMessage::new(
        inbound.user_key(),
        kind,
        inbound.body.clone(),
        inbound.conversation_key(),
    );
    if let Some(media) = media {
        message = message.with_media(media);
    }
    if let Some(sent_at) = inbound.sent_at() {
        message = message.with_received_at(sent_at);
    }
    message.validate().map_err(|e| e.to_string())?;
    Ok(message)
}

#[tracing::instrument(level = "info", skip_all)]
async fn receive_message(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<InboundMessage>, JsonRejection>,
) -> Reply {
    let inbound = match payload {
        Ok(Json(inbound)) => inbound,
        Err(rejection) => return error_reply(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if inbound.is_group {
        tracing::debug!(message_id = %inbound.message_id, "group message ignored");
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ignored", "reason": "group" })),
        );
    }
    let message = match to_buffered(&inbound) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(message_id = %inbound.message_id, error = %e, "inbound message rejected");
            return error_reply(StatusCode::BAD_REQUEST, e);
        }
    };

    let user_key = message.user_key.clone();
    state
        .scheduler
        .register_handler_if_absent(&user_key, state.batch_handler.clone());

    match state.scheduler.submit(&user_key, message) {
        Ok(SubmitOutcome::Accepted { .. }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "buffered",
                "buffer_status": state.scheduler.status(&user_key),
            })),
        ),
        Ok(SubmitOutcome::RejectedWhileProcessing) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "rejected", "reason": "processing" })),
        ),
        Err(SchedulerError::InvalidInput(e)) => error_reply(StatusCode::BAD_REQUEST, e),
        Err(e) => {
            tracing::error!(user_key = %user_key, error = %e, "submit failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
