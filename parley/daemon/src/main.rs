//! Parley Daemon - Chat Relay Server
//!
//! Listens for TCP connections and serves the relay methods on each one.
//! Clients can call `echo`, `ping`, `peer_name` and `send_message`; the
//! daemon pushes `receive_message` back to them.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:6543)
//! parley-daemon
//!
//! # Custom listen address
//! parley-daemon --bind 127.0.0.1:7000
//!
//! # With config file
//! parley-daemon --config /etc/parley/parley.toml
//!
//! # Verbose logging
//! RUST_LOG=debug parley-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod relay;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use parley_core::{
    default_config_path, load_config_from_path, Caller, ConfigOverrides, ParleyConfig, Server,
};
use relay::Relay;

/// Parley Daemon - symmetric RPC chat relay
#[derive(Parser, Debug)]
#[command(name = "parley-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short = 'b', long, env = "PARLEY_BIND", value_name = "ADDR")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "PARLEY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum number of concurrent connections
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// Call timeout in milliseconds for pushes to clients
    #[arg(long, value_name = "MS")]
    call_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PARLEY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("parley_daemon={level},parley_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Merge file, environment and command-line settings
fn resolve_config(args: &Args) -> Result<ParleyConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    overrides.bind_addr.clone_from(&args.bind);
    overrides.max_connections = args.max_connections;
    overrides.call_timeout_ms = args.call_timeout_ms;
    overrides.apply(&mut config);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Flip `shutdown` on SIGTERM or SIGINT
#[cfg(unix)]
fn spawn_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.store(true, Ordering::SeqCst);
    });
    Ok(())
}

/// Flip `shutdown` on Ctrl-C
#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, initiating shutdown");
        }
        shutdown.store(true, Ordering::SeqCst);
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Parley Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        bind = %config.server.bind_addr,
        max_connections = config.server.max_connections,
        call_timeout_ms = config.rpc.call_timeout_ms,
        "Configuration loaded"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown))?;

    let server = Server::bind(config.server.clone(), config.rpc.clone())
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind_addr))?;

    let relay = Relay::new();
    let factory = {
        let relay = relay.clone();
        Arc::new(move |caller: Caller| relay.handler(caller))
    };

    match server.run(factory, shutdown).await {
        Ok(()) => {
            info!(remaining_peers = relay.peer_count(), "Parley daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["parley-daemon"]);
        assert_eq!(args.log_level, "info");
        assert!(args.max_connections.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[server]\nbind_addr = \"127.0.0.1:7000\"\nmax_connections = 5\n")
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from([
            "parley-daemon",
            "--config",
            path.as_str(),
            "--bind",
            "127.0.0.1:7001",
        ]);
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:7001");
        assert_eq!(config.server.max_connections, 5);
    }

    #[test]
    fn test_cli_fixes_invalid_file_value() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[server]\nmax_connections = 0\n").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from([
            "parley-daemon",
            "--config",
            path.as_str(),
            "--max-connections",
            "5",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.server.max_connections, 5);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.toml");

        let args = Args::parse_from([
            "parley-daemon",
            "--config",
            path.to_str().unwrap(),
            "--max-connections",
            "0",
        ]);
        assert!(resolve_config(&args).is_err());
    }
}
