//! Batch pipeline: turns one coalesced burst into one agent reply.

use crate::services::{AgentReply, AgentRequest, AudioService, Responder};
use crate::session::{ProcessedExchange, SessionManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use mb_buffer::{BatchHandler, BufferedMessage};
use mb_channels::{ChannelAdapter, ConversationKey, OutboundMessage, UserKey};
use std::sync::Arc;

pub const PART_SEPARATOR: &str = "\n---\n";
pub const APOLOGY_MESSAGE: &str =
    "Sorry, something went wrong while processing your message. Please try again.";
const REPLY_AUDIO_MIME: &str = "audio/ogg";

pub struct BatchPipeline {
    audio: Arc<dyn AudioService>,
    responder: Arc<dyn Responder>,
    channel: Arc<dyn ChannelAdapter>,
    sessions: Arc<SessionManager>,
    prefer_audio: bool,
}

impl BatchPipeline {
    pub fn new(
        audio: Arc<dyn AudioService>,
        responder: Arc<dyn Responder>,
        channel: Arc<dyn ChannelAdapter>,
        sessions: Arc<SessionManager>,
        prefer_audio: bool,
    ) -> Self {
        Self {
            audio,
            responder,
            channel,
            sessions,
            prefer_audio,
        }
    }

    /// Joins the batch into one text, transcribing voice notes and audio.
    pub async fn combine(&self, user_key: &UserKey, batch: &[BufferedMessage]) -> String {
        let mut parts = Vec::with_capacity(batch.len());
        for (index, msg) in batch.iter().enumerate() {
            if msg.kind.is_text() {
                parts.push(msg.content.clone());
                continue;
            }
            if msg.kind.is_audio() {
                if let Some(media) = &msg.media {
                    match self.audio.transcribe(media).await {
                        Ok(text) if !text.trim().is_empty() => {
                            parts.push(text.trim().to_string());
                        }
                        Ok(_) => {
                            tracing::warn!(user_key = %user_key, index, "empty transcription; skipping");
                        }
                        Err(e) => {
                            tracing::warn!(user_key = %user_key, index, error = %e, "transcription failed; skipping");
                        }
                    }
                    continue;
                }
            }
            if msg.content.trim().is_empty() {
                tracing::warn!(user_key = %user_key, index, kind = %msg.kind, "message has nothing to combine; skipping");
            } else {
                parts.push(msg.content.clone());
            }
        }
        parts.join(PART_SEPARATOR)
    }

    async fn run(&self, user_key: &UserKey, batch: Vec<BufferedMessage>) -> Result<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };
        let chat_id = last.conversation_key.clone();
        let session_id = self.sessions.get_or_create(user_key);

        let combined = self.combine(user_key, &batch).await;
        if combined.trim().is_empty() {
            tracing::warn!(user_key = %user_key, batch_size = batch.len(), "batch produced no text; nothing to answer");
            return Ok(());
        }
        tracing::info!(
            user_key = %user_key,
            batch_size = batch.len(),
            combined_chars = combined.chars().count(),
            "batch combined"
        );

        let request = AgentRequest {
            user_message: combined,
            user_id: user_key.to_string(),
            session_id,
            message_type: if batch.iter().any(|m| m.kind.is_audio()) {
                "audio".to_string()
            } else {
                "text".to_string()
            },
        };
        let reply = match self.responder.respond(&request).await {
            Ok(reply) if !reply.response_text.trim().is_empty() => reply,
            Ok(_) => {
                self.send_apology(&chat_id).await;
                anyhow::bail!("responder returned an empty reply");
            }
            Err(e) => {
                self.send_apology(&chat_id).await;
                return Err(e).context("responder failed");
            }
        };

        let outbound = self.build_reply(user_key, chat_id, &reply).await;
        self.channel
            .send(outbound)
            .await
            .context("deliver reply")?;

        self.sessions.record_exchange(
            user_key,
            ProcessedExchange::from_batch(&batch, &reply.response_text),
        );
        tracing::info!(user_key = %user_key, batch_size = batch.len(), "batch answered");
        Ok(())
    }

    async fn build_reply(
        &self,
        user_key: &UserKey,
        chat_id: ConversationKey,
        reply: &AgentReply,
    ) -> OutboundMessage {
        let mut outbound = OutboundMessage::text(chat_id, reply.response_text.clone());
        outbound.auxiliary_text = reply.auxiliary_text.clone();
        if reply.should_send_audio || self.prefer_audio {
            match self.audio.synthesize(&reply.response_text).await {
                Ok(url) => {
                    outbound.media_url = Some(url);
                    outbound.mime_type = Some(REPLY_AUDIO_MIME.to_string());
                }
                Err(e) => {
                    tracing::warn!(user_key = %user_key, error = %e, "speech synthesis failed; replying with text only");
                }
            }
        }
        outbound
    }

    async fn send_apology(&self, chat_id: &ConversationKey) {
        if let Err(e) = self
            .channel
            .send(OutboundMessage::text(chat_id.clone(), APOLOGY_MESSAGE))
            .await
        {
            tracing::error!(chat_id = %chat_id, error = %e, "failed to deliver apology");
        }
    }
}

#[async_trait]
impl BatchHandler for BatchPipeline {
    async fn handle(&self, user_key: UserKey, batch: Vec<BufferedMessage>) -> Result<()> {
        self.run(&user_key, batch).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::{self, ServiceError};
    use bytes::Bytes;
    use mb_channels::{MediaRef, MessageKind};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeAudio {
        pub fail_transcription: bool,
        pub fail_synthesis: bool,
        pub synthesized: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioService for FakeAudio {
        async fn transcribe(&self, media: &MediaRef) -> services::Result<String> {
            if self.fail_transcription {
                return Err(ServiceError::Http("stt down".to_string()));
            }
            match media {
                MediaRef::Inline { data, .. } => Ok(String::from_utf8_lossy(data).to_string()),
                MediaRef::Remote { url, .. } => Ok(format!("transcript of {url}")),
            }
        }

        async fn synthesize(&self, text: &str) -> services::Result<String> {
            if self.fail_synthesis {
                return Err(ServiceError::Http("tts down".to_string()));
            }
            self.synthesized.lock().expect("lock").push(text.to_string());
            Ok("https://cdn.example/reply.ogg".to_string())
        }
    }

    pub(crate) struct FakeResponder {
        pub reply: Option<AgentReply>,
        pub requests: Mutex<Vec<AgentRequest>>,
    }

    impl FakeResponder {
        pub fn answering(text: &str) -> Self {
            Self {
                reply: Some(AgentReply {
                    response_text: text.to_string(),
                    auxiliary_text: None,
                    should_send_audio: false,
                }),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: None,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Responder for FakeResponder {
        async fn respond(&self, request: &AgentRequest) -> services::Result<AgentReply> {
            self.requests.lock().expect("lock").push(request.clone());
            self.reply
                .clone()
                .ok_or_else(|| ServiceError::Http("agent down".to_string()))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeChannel {
        pub sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
            self.sent.lock().expect("lock").push(message);
            Ok(())
        }
    }

    struct Harness {
        audio: Arc<FakeAudio>,
        responder: Arc<FakeResponder>,
        channel: Arc<FakeChannel>,
        sessions: Arc<SessionManager>,
        pipeline: BatchPipeline,
    }

    fn harness(audio: FakeAudio, responder: FakeResponder, prefer_audio: bool) -> Harness {
        let audio = Arc::new(audio);
        let responder = Arc::new(responder);
        let channel = Arc::new(FakeChannel::default());
        let sessions = Arc::new(SessionManager::new());
        let pipeline = BatchPipeline::new(
            audio.clone(),
            responder.clone(),
            channel.clone(),
            sessions.clone(),
            prefer_audio,
        );
        Harness {
            audio,
            responder,
            channel,
            sessions,
            pipeline,
        }
    }

    fn voice(user: &str, transcript: &str) -> BufferedMessage {
        BufferedMessage::new(user, MessageKind::VoiceNote, "", "chat-1").with_media(MediaRef::Inline {
            mime_type: Some("audio/ogg".to_string()),
            data: Bytes::from(transcript.to_string()),
        })
    }

    #[tokio::test]
    async fn combine_transcribes_audio_and_keeps_order() {
        let h = harness(FakeAudio::default(), FakeResponder::answering("ok"), false);
        let user = UserKey::new("u1");
        let batch = vec![
            BufferedMessage::text("u1", "hello", "chat-1"),
            voice("u1", "spoken words"),
            BufferedMessage::new("u1", MessageKind::Image, "look at this", "chat-1"),
            BufferedMessage::new("u1", MessageKind::Document, " ", "chat-1").with_media(
                MediaRef::Remote {
                    mime_type: None,
                    url: "https://cdn.example/doc.pdf".to_string(),
                },
            ),
        ];
        let combined = h.pipeline.combine(&user, &batch).await;
        assert_eq!(combined, "hello\n---\nspoken words\n---\nlook at this");
    }

    #[tokio::test]
    async fn combine_skips_failed_transcriptions() {
        let h = harness(
            FakeAudio {
                fail_transcription: true,
                ..FakeAudio::default()
            },
            FakeResponder::answering("ok"),
            false,
        );
        let user = UserKey::new("u1");
        let batch = vec![voice("u1", "lost"), BufferedMessage::text("u1", "kept", "chat-1")];
        assert_eq!(h.pipeline.combine(&user, &batch).await, "kept");
    }

    #[tokio::test]
    async fn handle_answers_batch_and_records_history() {
        let h = harness(FakeAudio::default(), FakeResponder::answering("the answer"), false);
        let user = UserKey::new("u1");
        let batch = vec![
            BufferedMessage::text("u1", "first", "chat-1"),
            voice("u1", "second"),
        ];
        h.pipeline.handle(user.clone(), batch).await.expect("handled");

        let requests = h.responder.requests.lock().expect("lock").clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_message, "first\n---\nsecond");
        assert_eq!(requests[0].message_type, "audio");
        assert!(requests[0].session_id.starts_with("sess_u1_"));

        let sent = h.channel.sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id.as_str(), "chat-1");
        assert_eq!(sent[0].content, "the answer");
        assert!(sent[0].media_url.is_none());

        let session = h.sessions.get(&user).expect("session");
        assert_eq!(session.exchanges.len(), 1);
        assert_eq!(session.exchanges[0].grouped_count, 2);
    }

    #[tokio::test]
    async fn responder_failure_sends_apology_and_reports_error() {
        let h = harness(FakeAudio::default(), FakeResponder::failing(), false);
        let user = UserKey::new("u1");
        let err = h
            .pipeline
            .handle(user.clone(), vec![BufferedMessage::text("u1", "hi", "chat-1")])
            .await
            .expect_err("responder failure surfaces");
        assert!(format!("{err:#}").contains("agent down"));

        let sent = h.channel.sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, APOLOGY_MESSAGE);
        assert!(h.sessions.get(&user).is_none());
    }

    #[tokio::test]
    async fn audio_reply_attaches_synthesized_url() {
        let mut responder = FakeResponder::answering("spoken reply");
        if let Some(reply) = responder.reply.as_mut() {
            reply.should_send_audio = true;
            reply.auxiliary_text = Some("see the link".to_string());
        }
        let h = harness(FakeAudio::default(), responder, false);
        h.pipeline
            .handle(UserKey::new("u1"), vec![BufferedMessage::text("u1", "talk to me", "chat-1")])
            .await
            .expect("handled");

        let sent = h.channel.sent.lock().expect("lock").clone();
        assert_eq!(sent[0].media_url.as_deref(), Some("https://cdn.example/reply.ogg"));
        assert_eq!(sent[0].mime_type.as_deref(), Some("audio/ogg"));
        assert_eq!(sent[0].auxiliary_text.as_deref(), Some("see the link"));
        assert_eq!(
            h.audio.synthesized.lock().expect("lock").clone(),
            vec!["spoken reply".to_string()]
        );
    }

    #[tokio::test]
    async fn synthesis_failure_degrades_to_text() {
        let h = harness(
            FakeAudio {
                fail_synthesis: true,
                ..FakeAudio::default()
            },
            FakeResponder::answering("text only"),
            true,
        );
        h.pipeline
            .handle(UserKey::new("u1"), vec![BufferedMessage::text("u1", "hi", "chat-1")])
            .await
            .expect("handled");
        let sent = h.channel.sent.lock().expect("lock").clone();
        assert_eq!(sent[0].content, "text only");
        assert!(sent[0].media_url.is_none());
    }

    #[tokio::test]
    async fn batch_without_text_skips_responder() {
        let h = harness(
            FakeAudio {
                fail_transcription: true,
                ..FakeAudio::default()
            },
            FakeResponder::answering("unused"),
            false,
        );
        h.pipeline
            .handle(UserKey::new("u1"), vec![voice("u1", "inaudible")])
            .await
            .expect("nothing to do is not an error");
        assert!(h.responder.requests.lock().expect("lock").is_empty());
        assert!(h.channel.sent.lock().expect("lock").is_empty());
    }
}
