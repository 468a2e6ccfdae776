#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tlmserver::config::Config;
use tlmserver::display::CmdLineTelemetry;
use tlmserver::mission::MissionDb;
use tlmserver::TelemetryServer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tlmserver.toml")]
    config: String,

    /// Dump every received datagram and its decoded fields
    #[arg(short, long)]
    monitor_port: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("Error loading config: {:#}", e);
            return Err(e);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_path = config
        .mission
        .database
        .clone()
        .context("mission.database is not set")?;
    let db = Arc::new(MissionDb::load(&db_path).await?);

    let system_string = format!(
        "Mission: {}, Target: {}, Host: {}, Telemetry Port {}",
        config.mission.name, config.mission.target, config.target.host_addr, config.target.recv_tlm_port
    );

    let mut server = TelemetryServer::new(config.target.clone(), db.topic_map(), db.clone());
    let _observer = CmdLineTelemetry::attach_all(&server, args.monitor_port);
    info!("Telemetry server created for {}", system_string);

    if let Err(e) = server.start().await {
        error!("Error starting telemetry server for {}: {}", system_string, e);
        return Err(e.into());
    }

    // Stats Reporting Task
    let stats_token = CancellationToken::new();
    let log_interval = config.general.stats_log_interval_secs;
    let stats_handle = if log_interval > 0 {
        let token = stats_token.clone();
        let registry = server.registry().clone();
        let stats = server.stats_handle();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(log_interval));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Stats Reporter shutting down.");
                        break;
                    }
                    _ = interval.tick() => {
                        let s = stats.snapshot();
                        info!(
                            "Stats: received={} routed={} unrouted={} decode_failures={} too_short={} subscriber_failures={} socket_errors={} channels={}",
                            s.datagrams_received,
                            s.routed,
                            s.unrouted,
                            s.decode_failures,
                            s.frames_too_short,
                            s.subscriber_failures,
                            s.socket_errors,
                            registry.len()
                        );
                    }
                }
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received. Initiating graceful shutdown...");

    stats_token.cancel();
    if let Some(handle) = stats_handle {
        let _ = handle.await;
    }
    server.stop().await;
    info!("Shutdown complete.");

    Ok(())
}
