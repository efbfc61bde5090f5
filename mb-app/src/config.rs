//! msgbuf configuration loader.

use anyhow::Context;
use mb_buffer::SchedulerConfig;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8002
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Hard cap, measured from the last accepted message.
    #[serde(default = "default_initial_timeout_seconds")]
    pub initial_timeout_seconds: u64,
    /// Quiet period that closes a burst.
    #[serde(default = "default_inter_message_timeout_seconds")]
    pub inter_message_timeout_seconds: u64,
    #[serde(default = "default_poll_granularity_seconds")]
    pub poll_granularity_seconds: u64,
}

fn default_initial_timeout_seconds() -> u64 {
    mb_buffer::DEFAULT_INITIAL_TIMEOUT_SECONDS
}

fn default_inter_message_timeout_seconds() -> u64 {
    mb_buffer::DEFAULT_INTER_MESSAGE_TIMEOUT_SECONDS
}

fn default_poll_granularity_seconds() -> u64 {
    mb_buffer::DEFAULT_POLL_GRANULARITY_SECONDS
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_timeout_seconds: default_initial_timeout_seconds(),
            inter_message_timeout_seconds: default_inter_message_timeout_seconds(),
            poll_granularity_seconds: default_poll_granularity_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_whatsapp_service_url")]
    pub whatsapp_service_url: String,
    #[serde(default = "default_audio_service_url")]
    pub audio_service_url: String,
    #[serde(default = "default_agent_service_url")]
    pub agent_service_url: String,
    /// Always answer with synthesized audio, even when the agent does not ask for it.
    #[serde(default)]
    pub prefer_audio: bool,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
}

fn default_whatsapp_service_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_audio_service_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_agent_service_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_tts_voice() -> String {
    "nova".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            whatsapp_service_url: default_whatsapp_service_url(),
            audio_service_url: default_audio_service_url(),
            agent_service_url: default_agent_service_url(),
            prefer_audio: false,
            tts_voice: default_tts_voice(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the default location. Only a missing default file falls back
    /// to built-in defaults; an explicit path must exist.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`; blank or unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MESSAGE_BATCH_TIMEOUT_SECONDS") {
            match v.trim().parse() {
                Ok(secs) => self.buffer.initial_timeout_seconds = secs,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring invalid MESSAGE_BATCH_TIMEOUT_SECONDS")
                }
            }
        }
        if let Some(v) = get("MESSAGE_INTER_TIMEOUT_SECONDS") {
            match v.trim().parse() {
                Ok(secs) => self.buffer.inter_message_timeout_seconds = secs,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring invalid MESSAGE_INTER_TIMEOUT_SECONDS")
                }
            }
        }
        if let Some(v) = get("MSGBUF_PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid MSGBUF_PORT"),
            }
        }
        if let Some(v) = get("WHATSAPP_SERVICE_URL") {
            self.services.whatsapp_service_url = v;
        }
        if let Some(v) = get("AUDIO_SERVICE_URL") {
            self.services.audio_service_url = v;
        }
        if let Some(v) = get("AGENT_SERVICE_URL") {
            self.services.agent_service_url = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        self.scheduler_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("buffer: {e}"))?;
        for (name, url) in [
            ("services.whatsapp_service_url", &self.services.whatsapp_service_url),
            ("services.audio_service_url", &self.services.audio_service_url),
            ("services.agent_service_url", &self.services.agent_service_url),
        ] {
            if url.trim().is_empty() {
                return Err(anyhow::anyhow!("{name} is required"));
            }
        }
        if self.runtime.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("runtime.http_timeout_seconds must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::from_seconds(
            self.buffer.initial_timeout_seconds,
            self.buffer.inter_message_timeout_seconds,
            self.buffer.poll_granularity_seconds,
        )
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".msgbuf").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = AppConfig::from_toml("").expect("parse empty config");
        assert_eq!(cfg.server.port, 8002);
        assert_eq!(cfg.buffer.initial_timeout_seconds, 30);
        assert_eq!(cfg.buffer.inter_message_timeout_seconds, 15);
        assert_eq!(cfg.buffer.poll_granularity_seconds, 1);
        assert!(!cfg.services.prefer_audio);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = AppConfig::from_toml(
            r#"
            [buffer]
            initial_timeout_seconds = 40
            inter_message_timeout_seconds = 20
            "#,
        )
        .expect("parse");
        let env: HashMap<&str, &str> = HashMap::from([
            ("MESSAGE_BATCH_TIMEOUT_SECONDS", "12"),
            ("MESSAGE_INTER_TIMEOUT_SECONDS", "not-a-number"),
            ("AGENT_SERVICE_URL", "http://agent:9000"),
            ("WHATSAPP_SERVICE_URL", "  "),
            ("MSGBUF_PORT", "9100"),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.buffer.initial_timeout_seconds, 12);
        assert_eq!(cfg.buffer.inter_message_timeout_seconds, 20);
        assert_eq!(cfg.services.agent_service_url, "http://agent:9000");
        assert_eq!(cfg.services.whatsapp_service_url, "http://localhost:3000");
        assert_eq!(cfg.server.port, 9100);

        let scheduler = cfg.scheduler_config();
        assert_eq!(scheduler.initial_timeout, Duration::from_secs(12));
        assert_eq!(scheduler.inter_message_timeout, Duration::from_secs(20));
    }

    #[test]
    fn validate_rejects_zero_timeouts_and_empty_urls() {
        let mut cfg = AppConfig::default();
        cfg.buffer.inter_message_timeout_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.services.audio_service_url = String::new();
        let err = cfg.validate().expect_err("empty url");
        assert!(err.to_string().contains("audio_service_url"));

        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
            [server]
            bind = "127.0.0.1"
            port = 8123

            [services]
            prefer_audio = true
            "#,
        )
        .await
        .expect("write config");

        let cfg = AppConfig::load(Some(path)).await.expect("load");
        assert_eq!(cfg.listen_addr().port(), 8123);
        assert!(cfg.listen_addr().ip().is_loopback());
        assert!(cfg.services.prefer_audio);
    }

    #[tokio::test]
    async fn load_fails_for_missing_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = AppConfig::load(Some(dir.path().join("absent.toml")))
            .await
            .expect_err("explicit path must exist");
        assert!(err.to_string().contains("read config"));
    }

    #[tokio::test]
    async fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[buffer\ninitial = ")
            .await
            .expect("write config");
        let err = AppConfig::load(Some(path)).await.expect_err("malformed");
        assert!(err.to_string().contains("parse config"));
    }
}
