//! ube-replay: runs a JSON-lines file of inbound messages through the
//! catalogue pipeline over in-memory storage and queues, feeding
//! republished records back until the retry queue drains.

mod config;
mod input;
mod model;
mod rig;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use ube_engine::EventHandler;

use crate::config::ReplayConfig;
use crate::rig::Rig;

#[derive(Parser)]
#[command(name = "ube-replay", about = "Replay inbound events through the unified batch pipeline")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "replay.toml", env = "UBE_CONFIG")]
    config: String,

    /// JSON-lines file of inbound messages.
    #[arg(long, env = "UBE_INPUT")]
    input: String,

    /// Override `max_rounds` from the configuration.
    #[arg(long)]
    rounds: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match ReplayConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.config, "failed to load config");
            std::process::exit(1);
        }
    };

    let inputs = match input::read_lines(&cli.input).await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.input, "failed to read input");
            std::process::exit(1);
        }
    };

    let rig = Rig::new(&config);
    let pipeline = match rig.pipeline(&config.pipeline) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to build pipeline");
            std::process::exit(1);
        }
    };
    for (action, calls) in pipeline.dep_call_names() {
        tracing::debug!(action = %action, calls = ?calls, "action dependencies");
    }
    let handler = EventHandler::new(Arc::new(pipeline), rig.inbound.clone());

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down, finishing the current batch");
            ctrl_c.cancel();
        }
    });

    tracing::info!(inputs = inputs.len(), batch_size = config.batch_size, "replay starting");
    let max_rounds = cli.rounds.unwrap_or(config.max_rounds);
    let summary = match rig.replay(&handler, token, inputs, config.batch_size, max_rounds).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "replay aborted");
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to render summary"),
    }
    if summary.failed > 0 {
        tracing::warn!(failed = summary.failed, "replay finished with failed records");
    }
}
