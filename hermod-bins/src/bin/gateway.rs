//! Order gateway against the simulated exchange
//!
//! Owns the order request/response queues and the client store. Strategy
//! processes attach to these segments, so the gateway must start first and
//! stop last.

use anyhow::Result;
use clap::Parser;
use hermod_bins::common::{
    destroy_segments, init_logging, load_config, setup_performance, shutdown_flag, spawn_metrics_logger,
    CommonArgs,
};
use hermod_core::execution::{AsyncJournal, OrderGateway, OrderRequest, OrderResponse, SimulatedConfig, SimulatedConnector};
use hermod_core::monitoring::MetricsRegistry;
use hermod_core::resilience::install_panic_handler;
use hermod_core::shm::{ClientStore, MwmrQueue};
use std::sync::Arc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "hermod-gateway", author, version, about = "Serve order requests from shared memory")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Override the simulated reject probability
    #[arg(long)]
    reject_probability: Option<f64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.common)?;
    if let Some(p) = args.reject_probability {
        config.gateway.reject_probability = p;
        config.validate()?;
    }
    init_logging(&config)?;

    info!("=== Hermod: order gateway ===");
    let metrics = MetricsRegistry::new()?;
    let transport = &config.transport;

    let requests = MwmrQueue::<OrderRequest>::create(
        &transport.order_request.key,
        transport.order_request.capacity,
        transport.order_request.slot_size,
        "order_request",
    )?
    .with_metrics(&metrics);
    let responses = MwmrQueue::<OrderResponse>::create(
        &transport.order_response.key,
        transport.order_response.capacity,
        transport.order_response.slot_size,
        "order_response",
    )?
    .with_metrics(&metrics);
    let clients = ClientStore::create(&transport.client_store, transport.first_client_id)?;

    let segments = vec![
        Arc::clone(requests.segment()),
        Arc::clone(responses.segment()),
        Arc::clone(clients.segment()),
    ];
    let on_panic = segments.clone();
    install_panic_handler(Some(Box::new(move || destroy_segments(&on_panic))));

    info!(
        requests = %transport.order_request.key,
        responses = %transport.order_response.key,
        clients = %transport.client_store,
        first_client_id = transport.first_client_id,
        "Transport segments created"
    );

    let connector = SimulatedConnector::new(SimulatedConfig::from(&config.gateway));
    let mut gateway = OrderGateway::new(connector, requests.reader(), responses.writer());
    if let Some(path) = &config.monitoring.journal_path {
        gateway = gateway.with_journal(AsyncJournal::new(path.clone())?);
    }

    let shutdown = shutdown_flag()?;
    let metrics_log = spawn_metrics_logger(metrics.clone(), config.monitoring.metrics_log_secs, Arc::clone(&shutdown))?;

    setup_performance(&args.common);
    let stats = gateway.run(&shutdown);
    // Flushes the journal
    drop(gateway);

    if let Some(handle) = metrics_log {
        if handle.join().is_err() {
            warn!("Metrics logger panicked");
        }
    }

    info!("=== Final Statistics ===");
    info!("Requests: {}", stats.total_requests);
    info!("Accepted: {} rejected: {}", stats.accepted, stats.rejected);
    info!("Fills: {} cancels: {}", stats.filled, stats.cancelled);
    if stats.request_gaps > 0 {
        warn!(gaps = stats.request_gaps, missed = stats.missed_requests, "Request queue overran during the session");
    }
    info!(clients_issued = clients.peek() - clients.first_client_id(), "Client ids handed out");

    destroy_segments(&segments);
    Ok(())
}
