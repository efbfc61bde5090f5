//! msgbuf server: wires the scheduler to the batch pipeline and mounts the HTTP routes.

use crate::config::{AppConfig, RuntimeConfig, default_config_path};
use crate::pipeline::BatchPipeline;
use crate::routes;
use crate::services::{HttpAgentResponder, HttpAudioService};
use crate::session::SessionManager;
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use mb_buffer::{BatchHandler, CoalescingScheduler};
use mb_channels::{ChannelAdapter, WhatsAppBridgeAdapter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub scheduler: CoalescingScheduler,
    /// Handler bound to every user on their first message.
    pub batch_handler: Arc<dyn BatchHandler>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(
        scheduler: CoalescingScheduler,
        batch_handler: Arc<dyn BatchHandler>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            scheduler,
            batch_handler,
            sessions,
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(default_config_path);
    let cfg = AppConfig::load(config_path).await?;
    let scheduler = cfg.scheduler_config();
    tracing::info!(
        config_path = %path.display(),
        listen_addr = %cfg.listen_addr(),
        initial_timeout_seconds = scheduler.initial_timeout.as_secs(),
        inter_message_timeout_seconds = scheduler.inter_message_timeout.as_secs(),
        poll_granularity_seconds = scheduler.poll_granularity.as_secs(),
        whatsapp_service_url = %cfg.services.whatsapp_service_url,
        audio_service_url = %cfg.services.audio_service_url,
        agent_service_url = %cfg.services.agent_service_url,
        prefer_audio = cfg.services.prefer_audio,
        "config ok"
    );
    println!(
        "msgbuf doctor: config ok (burst closes after {}s of silence, hard cap {}s, listening on {})",
        scheduler.inter_message_timeout.as_secs(),
        scheduler.initial_timeout.as_secs(),
        cfg.listen_addr(),
    );
    Ok(())
}

pub fn build_state(cfg: &AppConfig) -> Result<Arc<AppState>> {
    let channel: Arc<dyn ChannelAdapter> =
        Arc::new(WhatsAppBridgeAdapter::new(&cfg.services.whatsapp_service_url)?);
    let audio = Arc::new(
        HttpAudioService::new(&cfg.services.audio_service_url, &cfg.services.tts_voice)
            .context("build audio service client")?,
    );
    let responder = Arc::new(
        HttpAgentResponder::new(&cfg.services.agent_service_url)
            .context("build agent service client")?,
    );
    let sessions = Arc::new(SessionManager::new());
    let pipeline = Arc::new(BatchPipeline::new(
        audio,
        responder,
        channel,
        sessions.clone(),
        cfg.services.prefer_audio,
    ));
    let scheduler = CoalescingScheduler::new(cfg.scheduler_config());
    Ok(Arc::new(AppState::new(scheduler, pipeline, sessions)))
}

pub fn build_router(state: Arc<AppState>, runtime: &RuntimeConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(runtime.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path).await?;
    let addr = cfg.listen_addr();
    let listener = preflight_bind_listener(addr).await?;

    let state = build_state(&cfg)?;
    let scheduler = state.scheduler.clone();
    let app = build_router(state, &cfg.runtime);
    let shutdown = CancellationToken::new();

    let scheduler_cfg = scheduler.config();
    tracing::info!(
        %addr,
        initial_timeout_seconds = scheduler_cfg.initial_timeout.as_secs(),
        inter_message_timeout_seconds = scheduler_cfg.inter_message_timeout.as_secs(),
        "msgbuf serving"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    let stats = scheduler.stats();
    scheduler.shutdown();
    tracing::info!(
        pending_messages = stats.pending_messages,
        batches_dispatched = stats.batches_dispatched,
        "scheduler shutdown completed"
    );
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
