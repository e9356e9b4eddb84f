//! effectlink requester: entry point.
//!
//! Connects to (or accepts) executors, logs every EFFECT_STATUS they send
//! and, with `--effect`, starts one effect as soon as an executor is ready
//! and logs its responses until the effect ends.
//!
//! # Usage
//!
//! ```text
//! effectlink-requester [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --mode <MODE>          client | server
//!   --bind <ADDR>          Listen address in server mode
//!   --port <PORT>          TCP port (listen or dial)
//!   --remote-host <HOST>   Executor host in client mode
//!   --password <PASSWORD>  Password to present when asked
//!   --timeout-ms <MS>      Response timeout per request
//!   --auto-retry           Resend requests answered with RETRY
//!   --effect <NAME>        Start this effect once, then exit
//!   --target <ID>          Target id for --effect (repeatable)
//!   --duration-ms <MS>     Duration for --effect
//!   --viewer <NAME>        Viewer credited with --effect
//!   --log-level <FILTER>   tracing filter when RUST_LOG is unset
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use effectlink_core::protocol::{RequestConfig, RequestType, Target};
use effectlink_core::session::ConnectionMode;
use effectlink_requester::infrastructure::network::{RequesterNode, RequesterSessionFactory};
use effectlink_requester::infrastructure::storage::config::{load_config, RequesterConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// effectlink requester: asks executors to run effects.
#[derive(Debug, Parser)]
#[command(name = "effectlink-requester", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "EFFECTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Connection role: `client` dials the executor, `server` listens.
    #[arg(long, env = "EFFECTLINK_MODE", value_parser = parse_mode)]
    mode: Option<ConnectionMode>,

    #[arg(long, env = "EFFECTLINK_BIND")]
    bind: Option<String>,

    #[arg(long, env = "EFFECTLINK_PORT")]
    port: Option<u16>,

    #[arg(long, env = "EFFECTLINK_REMOTE_HOST")]
    remote_host: Option<String>,

    #[arg(long, env = "EFFECTLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "EFFECTLINK_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[arg(long, env = "EFFECTLINK_AUTO_RETRY")]
    auto_retry: bool,

    /// Effect to start once an executor is ready.
    #[arg(long)]
    effect: Option<String>,

    #[arg(long = "target", requires = "effect")]
    targets: Vec<String>,

    #[arg(long, requires = "effect")]
    duration_ms: Option<u64>,

    #[arg(long, requires = "effect")]
    viewer: Option<String>,

    #[arg(long, env = "EFFECTLINK_LOG")]
    log_level: Option<String>,
}

fn parse_mode(value: &str) -> Result<ConnectionMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "server" => Ok(ConnectionMode::Server),
        "client" => Ok(ConnectionMode::Client),
        other => Err(format!("unknown mode `{other}` (expected client or server)")),
    }
}

impl Cli {
    /// The one-shot START request asked for on the command line, if any.
    fn effect_request(&self) -> Option<RequestConfig> {
        let effect = self.effect.as_deref()?;
        Some(RequestConfig {
            viewer: self.viewer.clone(),
            targets: self.targets.iter().map(Target::with_id).collect(),
            duration: self.duration_ms.map(Duration::from_millis),
            ..RequestConfig::effect(RequestType::Start, effect)
        })
    }

    /// Loads the config file and layers the CLI values on top.
    fn into_requester_config(self) -> anyhow::Result<RequesterConfig> {
        let mut config =
            load_config(self.config.as_deref()).context("loading requester config")?;
        if let Some(mode) = self.mode {
            config.network.mode = mode;
        }
        if let Some(bind) = self.bind {
            config.network.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(host) = self.remote_host {
            config.network.remote_host = host;
        }
        if let Some(password) = self.password {
            config.auth.password = Some(password);
            config.auth.password_hash = None;
        }
        if let Some(timeout) = self.timeout_ms {
            config.requests.timeout_ms = Some(timeout);
        }
        if self.auto_retry {
            config.requests.auto_retry = true;
        }
        if let Some(level) = self.log_level {
            config.general.log_level = level;
        }
        Ok(config)
    }
}

// ── One-shot effect ───────────────────────────────────────────────────────────

async fn run_effect(node: RequesterNode, request: RequestConfig) {
    node.wait_ready().await;
    let effect = request.effect.clone().unwrap_or_default();

    let mut responses = match node.send_request(request) {
        Ok(stream) => stream,
        Err(e) => {
            error!(%effect, error = %e, "could not send request");
            node.shutdown();
            return;
        }
    };
    info!(%effect, request_id = responses.id(), "request sent");

    while let Some(item) = responses.next().await {
        match item {
            Ok(response) => info!(
                %effect,
                result = ?response.result_type(),
                message = ?response.message(),
                time_remaining = ?response.time_remaining(),
                "response"
            ),
            Err(e) => warn!(%effect, error = %e, "request failed"),
        }
    }

    info!(%effect, "request finished");
    node.shutdown();
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let effect = cli.effect_request();
    let config = cli.into_requester_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let factory = RequesterSessionFactory::new(config.settings());
    let node = match config.network.mode {
        ConnectionMode::Server => RequesterNode::listen(&config.listen_addr(), factory)
            .await
            .context("starting requester server")?,
        ConnectionMode::Client => {
            RequesterNode::connect(&config.remote_addr(), factory, config.max_backoff())
        }
    };

    // ── Status log ────────────────────────────────────────────────────────────
    let mut statuses = node.subscribe_status();
    tokio::spawn(async move {
        loop {
            match statuses.recv().await {
                Ok(status) => info!(
                    effect = ?status.effect(),
                    status = ?status.result_type(),
                    "effect status"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "status log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(request) = effect {
        tokio::spawn(run_effect(node.clone(), request));
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let signal_node = node.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal_node.shutdown();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    node.run().await;

    info!("effectlink requester stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
