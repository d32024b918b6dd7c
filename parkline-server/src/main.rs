// Parkline Server - HTTP API, edge gateways and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Parkline Server
//!
//! Runs the parking core behind a JSON API, with one edge gateway per lot, a
//! periodic pricing pass and an optional sensor simulator.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory demo with simulated sensors
//! parkline-server --simulate
//!
//! # Persistent state on a custom port
//! parkline-server --state parkline.json --port 8080
//! ```

mod api;
mod error;
mod metrics;
mod seed;
mod simulator;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parkline::{
    JsonFileRepository, LedgerConfig, LotId, MemoryRepository, ParkingService, Repository,
    ServiceConfig,
};
use parkline_gateway::{EdgeGateway, GatewayConfig, LocalTransport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::error::{Result, ServerError};
use crate::simulator::SensorSimulator;

/// Parkline server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PARKLINE_PORT", default_value = "5000")]
    port: u16,

    /// JSON state file (in-memory when omitted)
    #[arg(short, long, env = "PARKLINE_STATE")]
    state: Option<PathBuf>,

    /// Seconds between pricing passes
    #[arg(long, default_value = "60")]
    pricing_interval: u64,

    /// Seconds between gateway sync attempts
    #[arg(long, default_value = "4")]
    sync_interval: u64,

    /// Events each gateway buffers before evicting the oldest
    #[arg(long, default_value = "100")]
    buffer_capacity: usize,

    /// Maximum events per sync batch
    #[arg(long, default_value = "50")]
    batch_size: usize,

    /// Run the sensor simulator
    #[arg(long)]
    simulate: bool,

    /// Seconds between simulated sensor readings
    #[arg(long, default_value = "3")]
    sensor_interval: u64,

    /// Probability that a simulated sensor changes state per reading
    #[arg(long, default_value = "0.2")]
    change_probability: f64,

    /// Seed for reproducible simulated readings
    #[arg(long)]
    seed: Option<u64>,

    /// Lots created on first run
    #[arg(long, default_value = "5")]
    lots: u32,

    /// Slots per lot created on first run
    #[arg(long, default_value = "6")]
    slots_per_lot: u32,

    /// Keep new bookings Pending until confirmed
    #[arg(long)]
    no_auto_confirm: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PARKLINE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.change_probability) {
            return Err(ServerError::InvalidArgument(format!(
                "change probability must be within [0, 1], got {}",
                self.change_probability
            )));
        }
        if self.pricing_interval == 0 || self.sync_interval == 0 || self.sensor_interval == 0 {
            return Err(ServerError::InvalidArgument(
                "intervals must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Parkline Server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    args.validate()?;

    let repo: Arc<dyn Repository> = match &args.state {
        Some(path) => {
            info!(path = %path.display(), "using JSON state file");
            Arc::new(JsonFileRepository::open(path)?)
        }
        None => {
            warn!("no state file given, state is lost on exit");
            Arc::new(MemoryRepository::new())
        }
    };

    let lots = seed::lots(args.lots, args.slots_per_lot);
    if ParkingService::provision(repo.as_ref(), &lots, &seed::users())? {
        info!(
            lots = args.lots,
            slots_per_lot = args.slots_per_lot,
            "seeded a new store"
        );
    }

    let ledger = if args.no_auto_confirm {
        LedgerConfig::default()
    } else {
        LedgerConfig::auto_confirming()
    };
    let service = Arc::new(ParkingService::open(
        repo,
        ServiceConfig {
            ledger,
            ..Default::default()
        },
    )?);

    let (stop, shutdown) = watch::channel(false);

    // One gateway per lot, each with its own sender task
    let mut gateways: BTreeMap<LotId, Arc<EdgeGateway>> = BTreeMap::new();
    for lot in service.coordinator().lots() {
        let config = GatewayConfig::for_gateway(lot.gateway_id.clone())
            .with_buffer_capacity(args.buffer_capacity)
            .with_batch_size(args.batch_size)
            .with_sync_interval(Duration::from_secs(args.sync_interval));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&service)));
        let gateway = Arc::new(EdgeGateway::new(config, transport)?);
        tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let shutdown = shutdown.clone();
            async move { gateway.run(shutdown).await }
        });
        gateways.insert(lot.id, gateway);
    }

    tokio::spawn(pricing_loop(
        Arc::clone(&service),
        Duration::from_secs(args.pricing_interval),
        shutdown.clone(),
    ));

    if args.simulate {
        let simulator = match args.seed {
            Some(seed) => SensorSimulator::seeded(&service, args.change_probability, seed),
            None => SensorSimulator::new(&service, args.change_probability, StdRng::from_entropy()),
        };
        tokio::spawn(simulator.run(
            gateways.clone(),
            Duration::from_secs(args.sensor_interval),
            shutdown.clone(),
        ));
    }

    let state = Arc::new(AppState::new(Arc::clone(&service), gateways));
    let app = api::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("shutting down background tasks");
    // Receivers may already be gone
    let _ = stop.send(true);
    Ok(())
}

/// Recompute every lot's price on a fixed cadence
async fn pricing_loop(
    service: Arc<ParkingService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let svc = Arc::clone(&service);
        let pass =
            tokio::task::spawn_blocking(move || svc.recompute_prices(chrono::Utc::now())).await;
        match pass {
            Ok(Ok(snapshots)) => {
                for snapshot in &snapshots {
                    metrics::update_pricing(snapshot);
                }
                info!(lots = snapshots.len(), "prices recomputed");
            }
            Ok(Err(e)) => error!(error = %e, "pricing pass failed"),
            Err(e) => error!(error = %e, "pricing task panicked"),
        }
    }
    info!("pricing loop stopped");
}
