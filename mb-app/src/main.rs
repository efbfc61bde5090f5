//! msgbuf main binary.

mod config;
mod pipeline;
mod routes;
mod server;
mod services;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "msgbuf",
    version,
    about = "Per-user message coalescing in front of a chat agent"
)]
struct Cli {
    /// Config file (default: ~/.msgbuf/config.toml).
    #[arg(long, global = true, env = "MSGBUF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the msgbuf server (default).
    Serve,
    /// Validate config and print the effective timeouts.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv_loaded = dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();
    if let Some(path) = dotenv_loaded {
        tracing::debug!(path = %path.display(), ".env loaded");
    }

    let cli = Cli::parse();

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
    }
}

const DEFAULT_LOG_FILTER: &str =
    "info,msgbuf=debug,mb_buffer=debug,mb_channels=debug,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> anyhow::Result<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("json") => Ok(Self::Json),
            Some("pretty") => Ok(Self::Pretty),
            Some("compact") => Ok(Self::Compact),
            Some(other) => Err(anyhow::anyhow!(
                "unsupported MSGBUF_LOG_FORMAT={other:?}; expected json, pretty or compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let format = LogFormat::from_env_value(std::env::var("MSGBUF_LOG_FORMAT").ok().as_deref())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(log_format = ?format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            panic_location = %location,
            panic_payload = %panic_message(info.payload()),
            "panic captured"
        );
        default_hook(info);
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg;
    }
    payload
        .downcast_ref::<String>()
        .map_or("non-string panic payload", String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve_and_accepts_config() {
        let cli = Cli::try_parse_from(["msgbuf", "doctor", "--config", "/tmp/msgbuf.toml"])
            .expect("parse cli");
        assert!(matches!(cli.command, Some(Command::Doctor)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/msgbuf.toml")));

        let cli = Cli::try_parse_from(["msgbuf"]).expect("parse cli");
        assert!(cli.command.is_none());
    }

    #[test]
    fn panic_message_handles_both_string_types() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn log_format_defaults_to_json_and_rejects_unknown() {
        assert_eq!(LogFormat::from_env_value(None).expect("default"), LogFormat::Json);
        assert_eq!(
            LogFormat::from_env_value(Some(" Pretty ")).expect("pretty"),
            LogFormat::Pretty
        );
        assert_eq!(
            LogFormat::from_env_value(Some("compact")).expect("compact"),
            LogFormat::Compact
        );
        let err = LogFormat::from_env_value(Some("xml")).expect_err("unknown format");
        assert!(err.to_string().contains("MSGBUF_LOG_FORMAT"));
    }
}
