//! CSMS node - OCPP 1.6 central system server
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port with two provisioned stations
//! csms-node --station cp-001 --station cp-002
//!
//! # Custom address and heartbeat cadence
//! csms-node --listen 0.0.0.0:9900 --heartbeat-interval 30 --station cp-001
//! ```
//!
//! Charge points connect to `ws://<listen>/ws/evcharger/<station-id>`;
//! unprovisioned identities are rejected at connect time.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use csms_core::{AuditLog, CsmsConfig, CsmsServer, InMemoryDirectory, StationRecord};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 central system server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address for charge point WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Provisioned station ID (can be repeated)
    #[arg(short, long)]
    station: Vec<String>,

    /// Connectors per provisioned station
    #[arg(long, default_value = "2")]
    connectors: u32,

    /// Heartbeat interval answered to stations, seconds
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - OCPP 1.6 Central System             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:    {:<49} ║", args.listen);
    println!("║  Stations:  {:<49} ║", args.station.len());
    println!("║  Heartbeat: {:<49} ║", format!("{}s", args.heartbeat_interval));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut directory = InMemoryDirectory::new();
    for station_id in &args.station {
        directory.provision(StationRecord::new(station_id, args.connectors));
        info!("provisioned station {station_id}");
    }

    let config = CsmsConfig::new(&args.listen)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval));

    let (audit, mut audit_rx) = AuditLog::new(config.audit_buffer);
    // Drain the audit channel to the log; a real deployment hands this
    // receiver to its persistence layer instead.
    tokio::spawn(async move {
        while let Some(entry) = audit_rx.recv().await {
            debug!(
                station = %entry.station_id,
                direction = ?entry.direction,
                action = %entry.action,
                "audit: {}",
                entry.payload
            );
        }
    });

    info!("starting CSMS server...");
    let server = CsmsServer::new(config, Arc::new(directory), audit);
    server.run().await?;

    Ok(())
}
