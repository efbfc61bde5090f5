//! Clients for the collaborators a batch is handed to: speech services and
//! the agent responder.

use async_trait::async_trait;
use bytes::Bytes;
use mb_channels::MediaRef;
use reqwest::Url;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_AUDIO_MIME: &str = "audio/ogg";
const AUDIO_TIMEOUT_SECONDS: u64 = 60;
const AGENT_TIMEOUT_SECONDS: u64 = 120;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[async_trait]
pub trait AudioService: Send + Sync {
    /// Speech-to-text for a voice note or audio attachment.
    async fn transcribe(&self, media: &MediaRef) -> Result<String>;

    /// Text-to-speech; returns a URL the chat bridge can fetch.
    async fn synthesize(&self, text: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRequest {
    pub user_message: String,
    pub user_id: String,
    pub session_id: String,
    /// "text" or "audio".
    pub message_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentReply {
    pub response_text: String,
    #[serde(default)]
    pub auxiliary_text: Option<String>,
    #[serde(default)]
    pub should_send_audio: bool,
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &AgentRequest) -> Result<AgentReply>;
}

fn join_url(base_url: &str, path: &str) -> Result<Url> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ServiceError::InvalidInput("service url is empty".to_string()));
    }
    Url::parse(&format!("{base}{path}"))
        .map_err(|e| ServiceError::InvalidInput(format!("invalid service url {base:?}: {e}")))
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Http(format!("status={status} body={body}")))
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    audio_url: String,
}

/// Audio processing API: `POST /speech-to-text` (multipart `file`) and
/// `POST /text-to-speech` (JSON).
#[derive(Clone)]
pub struct HttpAudioService {
    http: reqwest::Client,
    stt_url: Url,
    tts_url: Url,
    voice: String,
}

impl HttpAudioService {
    pub fn new(base_url: &str, voice: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(AUDIO_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            http,
            stt_url: join_url(base_url, "/speech-to-text")?,
            tts_url: join_url(base_url, "/text-to-speech")?,
            voice: voice.trim().to_string(),
        })
    }

    async fn fetch_media(&self, url: &str) -> Result<Bytes> {
        let response = error_for_status(self.http.get(url).send().await?).await?;
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl AudioService for HttpAudioService {
    #[tracing::instrument(level = "info", skip_all)]
    async fn transcribe(&self, media: &MediaRef) -> Result<String> {
        let data = match media {
            MediaRef::Inline { data, .. } => data.clone(),
            MediaRef::Remote { url, .. } => self.fetch_media(url).await?,
        };
        if data.is_empty() {
            return Err(ServiceError::InvalidInput("audio payload is empty".to_string()));
        }
        let mime = media.mime_type().unwrap_or(DEFAULT_AUDIO_MIME);
        let part = Part::bytes(data.to_vec())
            .file_name("audio.ogg")
            .mime_str(mime)?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(self.stt_url.clone())
            .multipart(form)
            .send()
            .await?;
        let body: TranscriptionResponse = error_for_status(response).await?.json().await?;
        tracing::debug!(chars = body.text.len(), "transcription received");
        Ok(body.text)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn synthesize(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidInput("nothing to synthesize".to_string()));
        }
        let response = self
            .http
            .post(self.tts_url.clone())
            .json(&SynthesisRequest {
                text,
                voice: &self.voice,
            })
            .send()
            .await?;
        let body: SynthesisResponse = error_for_status(response).await?.json().await?;
        if body.audio_url.trim().is_empty() {
            return Err(ServiceError::ResponseFormat(
                "text-to-speech returned an empty audio_url".to_string(),
            ));
        }
        Ok(body.audio_url)
    }
}

/// Agent service: `POST /agent/process`.
#[derive(Clone)]
pub struct HttpAgentResponder {
    http: reqwest::Client,
    process_url: Url,
}

impl HttpAgentResponder {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(AGENT_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            http,
            process_url: join_url(base_url, "/agent/process")?,
        })
    }
}

#[async_trait]
impl Responder for HttpAgentResponder {
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %request.user_id))]
    async fn respond(&self, request: &AgentRequest) -> Result<AgentReply> {
        let response = self
            .http
            .post(self.process_url.clone())
            .json(request)
            .send()
            .await?;
        let raw = error_for_status(response).await?.text().await?;
        let reply: AgentReply = serde_json::from_str(&raw)?;
        Ok(reply)
    }
}
