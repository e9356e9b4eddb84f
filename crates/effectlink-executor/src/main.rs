//! effectlink executor: entry point.
//!
//! Loads the TOML config, applies CLI and environment overrides, registers a
//! small set of demonstration effects and serves requesters until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! effectlink-executor [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --mode <MODE>          server | client
//!   --bind <ADDR>          Listen address in server mode
//!   --port <PORT>          TCP port (listen or dial)
//!   --remote-host <HOST>   Requester host in client mode
//!   --password <PASSWORD>  Require this password from requesters
//!   --log-level <FILTER>   tracing filter when RUST_LOG is unset
//! ```
//!
//! Every option also reads an `EFFECTLINK_*` environment variable; values
//! given here win over the config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use effectlink_core::session::ConnectionMode;
use effectlink_core::{ResponseConfig, ResultType};
use effectlink_executor::application::{EffectContext, EffectRegistry, TimedOptions};
use effectlink_executor::infrastructure::network::{ExecutorNode, ExecutorSessionFactory};
use effectlink_executor::infrastructure::storage::config::{load_config, ExecutorConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// effectlink executor: runs effects on behalf of a requester.
#[derive(Debug, Parser)]
#[command(name = "effectlink-executor", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "EFFECTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Connection role: `server` listens, `client` dials the requester.
    #[arg(long, env = "EFFECTLINK_MODE", value_parser = parse_mode)]
    mode: Option<ConnectionMode>,

    /// Address to bind in server mode.
    #[arg(long, env = "EFFECTLINK_BIND")]
    bind: Option<String>,

    #[arg(long, env = "EFFECTLINK_PORT")]
    port: Option<u16>,

    /// Requester host to dial in client mode.
    #[arg(long, env = "EFFECTLINK_REMOTE_HOST")]
    remote_host: Option<String>,

    /// Password requesters must present.
    #[arg(long, env = "EFFECTLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "EFFECTLINK_LOG")]
    log_level: Option<String>,
}

fn parse_mode(value: &str) -> Result<ConnectionMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "server" => Ok(ConnectionMode::Server),
        "client" => Ok(ConnectionMode::Client),
        other => Err(format!("unknown mode `{other}` (expected server or client)")),
    }
}

impl Cli {
    /// Loads the config file and layers the CLI values on top.
    fn into_executor_config(self) -> anyhow::Result<ExecutorConfig> {
        let mut config = load_config(self.config.as_deref()).context("loading executor config")?;
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
        if let Some(level) = self.log_level {
            config.general.log_level = level;
        }
        Ok(config)
    }
}

// ── Demonstration effects ─────────────────────────────────────────────────────

fn demo_registry() -> EffectRegistry {
    let mut registry = EffectRegistry::default();

    registry.register("heal", |ctx: EffectContext| async move {
        info!(viewer = ?ctx.request.viewer(), quantity = ?ctx.request.quantity(), "heal");
        Ok::<_, anyhow::Error>(ctx.outcome(ResultType::Success))
    });

    registry.register_timed(
        "freeze",
        TimedOptions {
            duration: Some(Duration::from_secs(15)),
            ..TimedOptions::default()
        },
        |request| {
            info!(request_id = request.id(), "freeze started");
            Ok(None)
        },
    );

    registry.register_timed("invert_controls", TimedOptions::default(), |request| {
        if request.targets().len() > 1 {
            return Ok(Some(
                ResponseConfig::for_request(request, ResultType::Unavailable)
                    .with_message("one target at a time"),
            ));
        }
        Ok(None)
    });

    registry.on_player_info(|request| {
        info!(player = ?request.player(), "player info received");
        Ok(())
    });

    registry
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_executor_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let registry = demo_registry();
    info!(effects = ?registry.names(), "effect registry ready");
    let factory = ExecutorSessionFactory::new(config.settings(), Arc::new(registry));

    let node = match config.network.mode {
        ConnectionMode::Server => ExecutorNode::listen(&config.listen_addr(), factory)
            .await
            .context("starting executor server")?,
        ConnectionMode::Client => {
            ExecutorNode::connect(&config.remote_addr(), factory, config.max_backoff())
        }
    };

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

    info!("effectlink executor stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_config() -> PathBuf {
        std::env::temp_dir().join(format!("effectlink-cli-{}.toml", std::process::id()))
    }

    #[test]
    fn test_cli_overrides_config_defaults() {
        // Arrange
        let path = missing_config();
        let cli = Cli::parse_from([
            "effectlink-executor",
            "--config",
            path.to_str().unwrap(),
            "--mode",
            "client",
            "--port",
            "7000",
            "--password",
            "secret",
        ]);

        // Act
        let config = cli.into_executor_config().unwrap();

        // Assert
        assert_eq!(config.network.mode, ConnectionMode::Client);
        assert_eq!(config.remote_addr(), "127.0.0.1:7000");
        assert_eq!(
            config.password_hash(),
            Some(effectlink_core::protocol::hash_password("secret"))
        );
    }

    #[test]
    fn test_parse_mode_rejects_unknown_values() {
        assert_eq!(parse_mode("SERVER"), Ok(ConnectionMode::Server));
        assert!(parse_mode("peer").is_err());
    }

    #[test]
    fn test_demo_registry_registers_effects() {
        let registry = demo_registry();
        assert_eq!(registry.names(), vec!["freeze", "heal", "invert_controls"]);
    }
}
