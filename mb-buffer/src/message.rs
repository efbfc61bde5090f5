use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use mb_channels::{ConversationKey, MediaRef, MessageKind, UserKey};

/// One inbound message waiting in a user's buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub user_key: UserKey,
    pub kind: MessageKind,
    /// Text payload. May be empty for media kinds pending transcription.
    pub content: String,
    pub conversation_key: ConversationKey,
    pub media: Option<MediaRef>,
    pub received_at: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(
        user_key: impl Into<UserKey>,
        kind: MessageKind,
        content: impl Into<String>,
        conversation_key: impl Into<ConversationKey>,
    ) -> Self {
        Self {
            user_key: user_key.into(),
            kind,
            content: content.into(),
            conversation_key: conversation_key.into(),
            media: None,
            received_at: Utc::now(),
        }
    }

    pub fn text(
        user_key: impl Into<UserKey>,
        content: impl Into<String>,
        conversation_key: impl Into<ConversationKey>,
    ) -> Self {
        Self::new(user_key, MessageKind::Text, content, conversation_key)
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_key.is_blank() {
            return Err(SchedulerError::InvalidInput(
                "message user key is empty".to_string(),
            ));
        }
        if self.conversation_key.is_blank() {
            return Err(SchedulerError::InvalidInput(
                "message conversation key is empty".to_string(),
            ));
        }
        if self.kind.is_text() && self.content.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "text message has no content".to_string(),
            ));
        }
        if !self.kind.is_text() && self.media.is_none() && self.content.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(format!(
                "{} message carries neither media nor content",
                self.kind
            )));
        }
        Ok(())
    }

    /// First `max_chars` characters of the content, with `...` when cut.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn validate_rejects_malformed_messages() {
        assert!(BufferedMessage::text("", "hi", "chat").validate().is_err());
        assert!(BufferedMessage::text("u1", "hi", " ").validate().is_err());
        assert!(BufferedMessage::text("u1", "   ", "chat").validate().is_err());
        assert!(
            BufferedMessage::new("u1", MessageKind::VoiceNote, "", "chat")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn media_message_without_content_is_valid() {
        let msg = BufferedMessage::new("u1", MessageKind::VoiceNote, "", "chat").with_media(
            MediaRef::Inline {
                mime_type: Some("audio/ogg".to_string()),
                data: Bytes::from_static(b"ogg"),
            },
        );
        msg.validate().expect("voice note with media");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let msg = BufferedMessage::text("u1", "ação rápida demais", "chat");
        assert_eq!(msg.preview(4), "ação...");
        assert_eq!(msg.preview(100), "ação rápida demais");
    }
}
