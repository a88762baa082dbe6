use std::{fs::File, io::LineWriter, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use fleet_booking::{
    BookingError, BookingRequest, BookingSystem, EventSink, JsonLinesSink, ScalingDecision,
    SystemConfig, TracingSink,
};
use futures::future::join_all;
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drives a simulated booking rush against one route and reports fleet metrics
#[derive(Parser)]
#[command(name = "fleet-sim", version, about)]
struct Cli {
    /// JSON configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent booking clients
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// Fraction of successful bookings cancelled afterwards
    #[arg(long, default_value_t = 0.2)]
    cancel_rate: f64,

    /// Write events as JSON lines to this file instead of the log
    #[arg(long)]
    events: Option<PathBuf>,

    /// Sampler ticks to run after the rush
    #[arg(long, default_value_t = 5)]
    ticks: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "fleet_booking=info,fleet_sim=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => SystemConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SystemConfig::default(),
    };

    let sink: Arc<dyn EventSink> = match &cli.events {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating event file {}", path.display()))?;
            Arc::new(JsonLinesSink::new(LineWriter::new(file)))
        }
        None => Arc::new(TracingSink),
    };

    let route = config.route_id.clone();
    let system = Arc::new(BookingSystem::new(config, sink).context("invalid configuration")?);
    info!(clients = cli.clients, route = %route, "starting booking rush");

    let clients = (0..cli.clients).map(|n| {
        let system = system.clone();
        let request = BookingRequest::new(route.clone(), format!("passenger-{n:04}"));
        tokio::spawn(async move { system.submit_booking(request).await })
    });

    let mut booked = Vec::new();
    let mut rejected = 0usize;
    for result in join_all(clients).await {
        match result.context("booking client panicked")? {
            Ok(handle) => booked.push(handle),
            Err(BookingError::NoCapacity | BookingError::Overloaded { .. }) => rejected += 1,
            Err(e) => warn!(error = %e, "booking failed"),
        }
    }
    info!(booked = booked.len(), rejected, "booking rush finished");

    let cancel_rate = cli.cancel_rate.clamp(0.0, 1.0);
    let to_cancel: Vec<_> = {
        let mut rng = rand::thread_rng();
        booked
            .iter()
            .filter(|_| rng.gen_bool(cancel_rate))
            .map(|handle| handle.reservation_id)
            .collect()
    };
    let cancels = to_cancel.iter().map(|&id| {
        let system = system.clone();
        tokio::spawn(async move { system.submit_cancel(id).await })
    });
    for result in join_all(cancels).await {
        if let Err(e) = result.context("cancel client panicked")? {
            warn!(error = %e, "cancellation failed");
        }
    }

    let period = system.config().sampler_period().min(Duration::from_millis(200));
    for tick in 0..cli.ticks {
        let decision = system.tick();
        if decision != ScalingDecision::NoOp {
            info!(tick, ?decision, "control loop acted");
        }
        tokio::time::sleep(period).await;
    }

    system
        .verify_invariants()
        .context("booking invariants violated")?;
    let metrics = system.metrics();
    system.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
