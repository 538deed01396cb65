//! # subrelay-gateway
//!
//! Gateway binary: loads settings from the environment, starts the
//! subscription relay on `PORT + 1` and stops it on ctrl-c or SIGTERM.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use subrelay_server::{GraphqlWsConnector, RelayServer, ServerConfig};
use subrelay_settings::{LogFormat, RelaySettings};

/// GraphQL subscription relay.
#[derive(Parser, Debug)]
#[command(name = "subrelay-gateway", about = "GraphQL subscription relay gateway")]
struct Cli {
    /// Host to bind (overrides `RELAY_HOST`).
    #[arg(long)]
    host: Option<String>,

    /// Relay port (overrides `PORT + 1`).
    #[arg(long)]
    relay_port: Option<u16>,

    /// Log filter directive (overrides `LOG_LEVEL`).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines (overrides `LOG_FORMAT`).
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Listener config from settings, with command-line overrides applied.
    fn server_config(&self, settings: &RelaySettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.relay_port {
            config.port = port;
        }
        config
    }

    fn log_level<'a>(&'a self, settings: &'a RelaySettings) -> &'a str {
        self.log_level.as_deref().unwrap_or(&settings.log_level)
    }

    fn log_format(&self, settings: &RelaySettings) -> LogFormat {
        if self.json_logs {
            LogFormat::Json
        } else {
            settings.log_format
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = subrelay_settings::load_settings().context("Failed to load settings")?;

    subrelay_logging::init_subscriber(args.log_level(&settings), args.log_format(&settings));

    tracing::info!(
        executor_port = settings.port,
        subgraphs = settings.subgraphs.len(),
        "settings loaded"
    );
    for subgraph in &settings.subgraphs {
        tracing::info!(
            subgraph = %subgraph.name,
            url = %subgraph.url,
            ws_url = subgraph.ws_url.as_deref().unwrap_or("-"),
            "subgraph configured"
        );
    }
    if let Some(loki_host) = &settings.loki_host {
        tracing::info!(loki_host = %loki_host, "log aggregation host configured");
    }

    let metrics_handle =
        subrelay_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let config = args.server_config(&settings);
    let server = RelayServer::new(
        config,
        settings.subgraphs.clone(),
        Arc::new(GraphqlWsConnector),
        metrics_handle,
    );
    let addr = server
        .listen()
        .await
        .context("Failed to bind subscription relay")?;

    tracing::info!("Subscription relay listening on ws://{addr}{}", server.config().path);

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    if !server.stop().await {
        tracing::warn!("shutdown did not finish within the timeout");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}
