use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// True when the id is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(UserKey);
id_newtype!(ConversationKey);
id_newtype!(MessageId);

/// Kind of an inbound chat message. Wire names follow the chat bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "chat")]
    Text,
    #[serde(rename = "ptt")]
    VoiceNote,
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "document")]
    Document,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chat" | "text" => Some(Self::Text),
            "ptt" | "voice" | "voice_note" => Some(Self::VoiceNote),
            "audio" => Some(Self::Audio),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "chat",
            Self::VoiceNote => "ptt",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::Text)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::VoiceNote | Self::Audio)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media attached to a message: either carried inline or fetched later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    Inline {
        mime_type: Option<String>,
        data: Bytes,
    },
    Remote {
        mime_type: Option<String>,
        url: String,
    },
}

impl MediaRef {
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::Inline { mime_type, .. } | Self::Remote { mime_type, .. } => mime_type.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMedia {
    #[serde(default, alias = "mimeType")]
    pub mimetype: Option<String>,
    /// Base64 payload.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Webhook payload posted by the chat bridge for every message it receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "type")]
    pub message_type: String,
    /// Unix seconds as reported by the bridge.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub sender: Option<serde_json::Value>,
    #[serde(default)]
    pub media: Option<InboundMedia>,
}

impl InboundMessage {
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.from.trim())
    }

    /// Chat the reply is addressed to. The bridge reports the sender's chat in `from`.
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.from.trim())
    }

    /// Bot account that received the message.
    pub fn account(&self) -> &str {
        self.to.trim()
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.message_type)
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.timestamp, 0).single()
    }

    /// Decodes the attached media, if any. Inline base64 wins over a URL.
    pub fn decode_media(&self) -> anyhow::Result<Option<MediaRef>> {
        let Some(media) = &self.media else {
            return Ok(None);
        };
        if let Some(data) = media.data.as_deref().filter(|d| !d.trim().is_empty()) {
            let decoded = STANDARD
                .decode(data.trim())
                .map_err(|e| anyhow::anyhow!("invalid base64 media for {}: {e}", self.message_id))?;
            return Ok(Some(MediaRef::Inline {
                mime_type: media.mimetype.clone(),
                data: Bytes::from(decoded),
            }));
        }
        if let Some(url) = media.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(Some(MediaRef::Remote {
                mime_type: media.mimetype.clone(),
                url: url.trim().to_string(),
            }));
        }
        Ok(None)
    }
}

/// Reply handed to the chat bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub chat_id: ConversationKey,
    #[serde(rename = "message")]
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub auxiliary_text: Option<String>,
}

impl OutboundMessage {
    pub fn text(chat_id: impl Into<ConversationKey>, content: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: content.into(),
            media_url: None,
            mime_type: None,
            auxiliary_text: None,
        }
    }
}
