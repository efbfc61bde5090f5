use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp".
    fn channel_id(&self) -> &str;

    /// Deliver a reply to the conversation named in `message.chat_id`.
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}
