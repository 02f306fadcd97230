//! Strategy process running a single order coordinator
//!
//! Attaches to the gateway's order queues and to the market data segment,
//! then runs four threads:
//! - market data: feed -> router, quotes into the coordinator
//! - responses: drains the response queue into the coordinator
//! - risk: periodic risk evaluation and control transitions
//! - main: a demo strategy that quotes one lot at the touch and flips
//!
//! On interrupt the strategy exits through the control state machine, so
//! open positions are flattened before the process stops.

use anyhow::{Context, Result};
use clap::Parser;
use hermod_bins::common::{
    init_logging, load_config, setup_performance, shutdown_flag, sleep_unless_shutdown, spawn_metrics_logger,
    CommonArgs,
};
use hermod_core::core::{FlattenReason, InstrumentSpec, Side, Symbol};
use hermod_core::data::{MarketDataFeed, MarketTick, TickRouter};
use hermod_core::engine::{CoordinatorSettings, OrderCoordinator, OrderEventSink};
use hermod_core::execution::{OrderRequest, OrderResponse, ResponseKind};
use hermod_core::monitoring::MetricsRegistry;
use hermod_core::position::{load_snapshot, save_snapshot, OrderIntent, PositionLedger};
use hermod_core::resilience::install_panic_handler;
use hermod_core::shm::{ClientStore, MwmrQueue, OrderIdAllocator, SpscQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "hermod-trader", author, version, about = "Run a strategy against the order gateway")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Override the configured strategy id
    #[arg(long)]
    strategy_id: Option<i32>,

    /// Lots per demo order
    #[arg(long, default_value = "1")]
    lots: u32,

    /// Stop submitting after this many tickets (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_tickets: u64,

    /// Seconds to wait for the exit flatten to complete
    #[arg(long, default_value = "10")]
    exit_timeout: u64,
}

/// Logs fills and rejects as they reach the coordinator
struct LogSink;

impl OrderEventSink for LogSink {
    fn on_fill_or_reject(&self, response: &OrderResponse) {
        match response.kind() {
            Some(ResponseKind::Reject) => warn!(
                id = %response.id(),
                symbol = %response.symbol,
                reason = response.reject_reason().as_str(),
                "Order rejected"
            ),
            kind => debug!(
                id = %response.id(),
                symbol = %response.symbol,
                ?kind,
                price = response.price,
                quantity = response.quantity,
                "Order event"
            ),
        }
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("failed to spawn {name} thread"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.common)?;
    if let Some(id) = args.strategy_id {
        config.strategy.strategy_id = id;
    }
    init_logging(&config)?;
    install_panic_handler(None);

    info!("=== Hermod: trader ===");
    let metrics = MetricsRegistry::new()?;
    let transport = &config.transport;

    let requests = MwmrQueue::<OrderRequest>::attach(
        &transport.order_request.key,
        transport.order_request.capacity,
        transport.order_request.slot_size,
        "order_request",
    )
    .context("order gateway not running?")?
    .with_metrics(&metrics);
    let responses = MwmrQueue::<OrderResponse>::attach(
        &transport.order_response.key,
        transport.order_response.capacity,
        transport.order_response.slot_size,
        "order_response",
    )?
    .with_metrics(&metrics);
    let clients = ClientStore::attach(&transport.client_store)?;
    let md = &transport.market_data;
    let md_queue = SpscQueue::<MarketTick>::attach(&md.key, md.capacity, md.slot_size, "market_data")
        .context("market data feeder not running?")?
        .with_metrics(&metrics);

    let client_id = u64::try_from(clients.next_client_id()).context("client store handed out a negative id")?;
    info!(client_id, strategy_id = config.strategy.strategy_id, "Attached to transport");

    let ledger = Arc::new(PositionLedger::new());
    if let Some(path) = &config.monitoring.snapshot_path {
        if path.exists() {
            ledger.restore(&load_snapshot(path)?);
        }
    }

    let coordinator = Arc::new(
        OrderCoordinator::new(
            CoordinatorSettings::from_config(&config),
            Arc::clone(&ledger),
            requests.writer(),
            OrderIdAllocator::new(client_id),
            metrics.clone(),
        )
        .with_sink(Arc::new(LogSink)),
    );

    let shutdown = shutdown_flag()?;
    // Workers outlive the interrupt so the exit flatten can complete
    let workers_stop = Arc::new(AtomicBool::new(false));
    let router = Arc::new(TickRouter::default());

    let mut handles = Vec::new();
    {
        let coordinator = Arc::clone(&coordinator);
        let router = Arc::clone(&router);
        let stop = Arc::clone(&workers_stop);
        let mut feed = MarketDataFeed::new(md_queue.reader(), "market_data").with_metrics(&metrics);
        handles.push(spawn_named("md", move || {
            while !stop.load(Ordering::Acquire) {
                if let Some(tick) = feed.next_timeout(Duration::from_millis(50)) {
                    coordinator.on_market_tick(&tick);
                    router.dispatch(&tick);
                }
            }
            info!(stats = ?feed.stats(), "Market data thread stopped");
        })?);
    }
    {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&workers_stop);
        let mut reader = responses.reader();
        let common = args.common.clone();
        handles.push(spawn_named("responses", move || {
            setup_performance(&common);
            while !stop.load(Ordering::Acquire) {
                if coordinator.poll_responses(&mut reader) == 0 {
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        })?);
    }
    {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&workers_stop);
        handles.push(spawn_named("risk", move || coordinator.run_risk_loop(&stop))?);
    }
    if let Some(handle) = spawn_metrics_logger(metrics.clone(), config.monitoring.metrics_log_secs, Arc::clone(&workers_stop))? {
        handles.push(handle);
    }

    let instruments = config.strategy.instruments.clone();
    run_demo_strategy(&coordinator, &router, &instruments, &args, &shutdown);

    // Exit through the state machine: cancel, flatten, then stop
    if let Err(e) = coordinator.request_exit(FlattenReason::Shutdown, true) {
        warn!(error = %e, "Exit request refused");
    }
    let deadline = Duration::from_secs(args.exit_timeout);
    let started = Instant::now();
    while !coordinator.is_stopped() && started.elapsed() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if !coordinator.is_stopped() {
        error!(
            pending = coordinator.pending_count(),
            flat = coordinator.is_flat(),
            "Exit did not complete before timeout"
        );
    }

    workers_stop.store(true, Ordering::Release);
    for handle in handles {
        if handle.join().is_err() {
            warn!("Worker thread panicked");
        }
    }

    if let Some(path) = &config.monitoring.snapshot_path {
        save_snapshot(path, &ledger)?;
    }

    info!("=== Final Statistics ===");
    info!("Phase: {}", coordinator.phase());
    info!("Realized PnL: {:.2}", coordinator.realized_pnl());
    info!("Rejects: {} response gaps: {}", coordinator.reject_count(), coordinator.response_gaps());
    info!("Ticks routed: {} dropped: {}", router.dispatched(), router.dropped());
    Ok(())
}

/// Quote one side at the touch: buy at the bid while flat, sell at the ask
/// while long, one ticket outstanding per instrument
fn run_demo_strategy(
    coordinator: &OrderCoordinator,
    router: &TickRouter,
    instruments: &[InstrumentSpec],
    args: &Args,
    shutdown: &AtomicBool,
) {
    let feeds: Vec<_> = instruments
        .iter()
        .map(|spec| (*spec, router.subscribe(spec.symbol)))
        .collect();
    let mut working: HashMap<Symbol, Vec<hermod_core::CorrelationId>> = HashMap::new();
    let mut tickets = 0u64;

    info!(instruments = feeds.len(), lots = args.lots, "Demo strategy running");
    while !shutdown.load(Ordering::Acquire) && !coordinator.is_stopped() {
        let mut idle = true;
        for (spec, rx) in &feeds {
            let Ok(tick) = rx.try_recv() else { continue };
            idle = false;

            let ids = working.entry(spec.symbol).or_default();
            ids.retain(|id| coordinator.pending_order(*id).is_some());
            if !ids.is_empty() || !coordinator.can_send_new_orders() {
                continue;
            }
            if args.max_tickets > 0 && tickets >= args.max_tickets {
                continue;
            }

            let net = coordinator.ledger().net_position(&spec.symbol);
            let (side, level) = if net <= 0 {
                (Side::Buy, tick.best_bid())
            } else {
                (Side::Sell, tick.best_ask())
            };
            let Some(level) = level else { continue };

            let intent = OrderIntent::limit(spec.symbol, spec.exchange, side, args.lots, level.price);
            match coordinator.submit(intent) {
                Ok(ticket) => {
                    tickets += 1;
                    ids.extend(ticket.ids());
                }
                Err(e) => debug!(symbol = %spec.symbol, error = %e, "Intent not submitted"),
            }
        }
        if idle && !sleep_unless_shutdown(Duration::from_millis(1), shutdown) {
            break;
        }
    }
    info!(tickets, "Demo strategy stopped");
}
