//! Simple telemetry server example
//!
//! Listens on UDP port 1235 for ES housekeeping telemetry and prints the
//! command counters of every packet.
//!
//! Run with: cargo run --example simple_server

use std::sync::Arc;
use tlmserver::channel::{Channel, Subscriber, TelemetryUpdate};
use tlmserver::config::TargetConfig;
use tlmserver::mission::MissionDb;
use tlmserver::TelemetryServer;

const DB: &str = r#"
mission = "samplemission"
target = "cpu1"

[[message]]
topic = "CFE_ES/Application/HousekeepingTlm"
topic_id = 88
fields = [
    { name = "CommandCounter", type = "u8" },
    { name = "CommandErrorCounter", type = "u8" },
]
"#;

struct Counters;

impl Subscriber for Counters {
    fn update(&self, channel: &Channel, update: &TelemetryUpdate) -> anyhow::Result<()> {
        let payload = &update.message.payload;
        println!(
            "{} seq {}: cmd={} err={}",
            channel.topic(),
            update.message.primary.sequence_count,
            payload.field("CommandCounter").map(ToString::to_string).unwrap_or_default(),
            payload.field("CommandErrorCounter").map(ToString::to_string).unwrap_or_default(),
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let db = Arc::new(MissionDb::parse(DB)?);
    let mut server = TelemetryServer::new(TargetConfig::default(), db.topic_map(), db.clone());
    server.add_subscriber("CFE_ES/Application/HousekeepingTlm", Arc::new(Counters))?;

    server.start().await?;
    tracing::info!("Telemetry server started on {:?}", server.local_addr());

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    server.stop().await;

    Ok(())
}
