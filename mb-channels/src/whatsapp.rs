use crate::traits::ChannelAdapter;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};
use reqwest::Url;

const SEND_TIMEOUT_SECONDS: u64 = 10;

/// Delivers replies through the WhatsApp bridge service (`POST /send-message`).
#[derive(Clone)]
pub struct WhatsAppBridgeAdapter {
    http: reqwest::Client,
    send_url: Url,
}

impl WhatsAppBridgeAdapter {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(anyhow!("whatsapp service url is required"));
        }
        let send_url = Url::parse(&format!("{base_url}/send-message"))
            .map_err(|e| anyhow!("invalid whatsapp service url {base_url:?}: {e}"))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(SEND_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self { http, send_url })
    }

    pub fn send_url(&self) -> &Url {
        &self.send_url
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppBridgeAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %message.chat_id))]
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if message.chat_id.is_blank() {
            return Err(anyhow!("chat_id is required"));
        }
        if message.content.trim().is_empty() && message.media_url.is_none() {
            return Err(anyhow!("message content is empty"));
        }

        let response = self
            .http
            .post(self.send_url.clone())
            .json(&message)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }

        tracing::info!(status = status.as_u16(), "reply delivered to whatsapp bridge");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_send_url_from_base() {
        let adapter = WhatsAppBridgeAdapter::new("http://localhost:3000/").expect("adapter");
        assert_eq!(adapter.send_url().as_str(), "http://localhost:3000/send-message");
        assert_eq!(adapter.channel_id(), "whatsapp");
    }

    #[test]
    fn rejects_blank_base_url() {
        assert!(WhatsAppBridgeAdapter::new("  ").is_err());
    }

    #[tokio::test]
    async fn send_rejects_empty_reply_before_network() {
        let adapter = WhatsAppBridgeAdapter::new("http://127.0.0.1:9").expect("adapter");
        let err = adapter
            .send(OutboundMessage::text("chat-1", "   "))
            .await
            .expect_err("empty reply must fail");
        assert!(err.to_string().contains("message content is empty"));
    }
}
