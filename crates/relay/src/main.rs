//! # relay
//!
//! Fan-out relay binary: loads settings, connects the bus, serves
//! `/ws`, `/health` and `/metrics`, and shuts down cleanly on SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_server::auth::verifier_from_settings;
use relay_server::bus::bus_from_settings;
use relay_server::server::RelayServer;
use relay_settings::{BusKind, RelaySettings};
use tracing::{info, warn};

/// Real-time WebSocket fan-out relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time WebSocket fan-out relay")]
struct Cli {
    /// Settings file (JSON). Defaults to `$RELAY_CONFIG` when set.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Bus implementation.
    #[arg(long, value_enum)]
    bus: Option<BusArg>,

    /// Redis URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// Log filter directive (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BusArg {
    Redis,
    Memory,
}

impl From<BusArg> for BusKind {
    fn from(arg: BusArg) -> Self {
        match arg {
            BusArg::Redis => Self::Redis,
            BusArg::Memory => Self::Memory,
        }
    }
}

impl Cli {
    /// CLI flags take precedence over file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(bus) = self.bus {
            settings.bus.kind = bus.into();
        }
        if let Some(url) = &self.redis_url {
            settings.bus.url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        relay_settings::load_settings(cli.config.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    relay_server::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics_handle =
        relay_server::metrics::install_recorder().context("failed to install metrics recorder")?;
    let bus = bus_from_settings(&settings.bus);
    let verifier = verifier_from_settings(&settings.auth).context("invalid auth settings")?;

    let server = RelayServer::new(&settings, bus, verifier).with_metrics(metrics_handle);
    server.start().await;
    let (addr, listener) = server
        .listen()
        .await
        .with_context(|| {
            format!(
                "failed to bind {}:{}",
                settings.server.host, settings.server.port
            )
        })?;
    info!(%addr, bus = ?settings.bus.kind, auth = ?settings.auth.mode, "relay ready");

    wait_for_signal().await;
    server.shutdown_gracefully(Some(listener)).await;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
