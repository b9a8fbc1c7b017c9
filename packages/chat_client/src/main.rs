use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod api;
mod config;
mod render;
mod repl;
mod session;

use crate::config::{Backoff, ClientConfig, Overrides};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for the streaming chat service")]
struct Cli {
    /// Session to join (default: start a new one)
    #[arg(short, long)]
    session: Option<String>,

    /// WebSocket endpoint, e.g. ws://localhost:8080/ws/chat
    #[arg(long)]
    ws_url: Option<String>,

    /// HTTP API base, e.g. http://localhost:8080/api
    #[arg(long)]
    api_url: Option<String>,

    /// User id sent with every message
    #[arg(short, long)]
    user: Option<String>,

    /// Reconnect delay strategy
    #[arg(long, value_enum)]
    backoff: Option<Backoff>,

    /// Custom config directory (defaults to ~/.chatsync)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with the transcript.
    let default_directive = if cli.debug {
        "chat=debug,convo_sync=debug,ws_supervisor=debug,info"
    } else {
        "chat=info,convo_sync=warn,ws_supervisor=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = config::config_dir(cli.config_dir)?;
    let config = ClientConfig::load(
        &config_dir,
        Overrides {
            ws_url: cli.ws_url,
            api_url: cli.api_url,
            user_id: cli.user,
            backoff: cli.backoff,
        },
    )?;

    repl::run(config, cli.session).await
}
