//! Simulated market data feeder
//!
//! Owns the market data SPSC segment and publishes a random-walk depth book
//! for every configured instrument at a fixed rate.

use anyhow::{bail, Result};
use clap::Parser;
use hermod_bins::common::{
    destroy_segments, init_logging, load_config, setup_performance, shutdown_flag, CommonArgs,
};
use hermod_core::core::{InstrumentSpec, SystemClock};
use hermod_core::data::{BookLevel, MarketDataPublisher, MarketTick};
use hermod_core::resilience::install_panic_handler;
use hermod_core::shm::SpscQueue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "hermod-md-feeder", author, version, about = "Publish simulated depth ticks")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Ticks per second per instrument
    #[arg(long, default_value = "100")]
    rate: u32,

    /// Stop after this many ticks in total (0 = until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Starting price for every instrument
    #[arg(long, default_value = "3500")]
    base_price: f64,

    /// Book levels per side
    #[arg(long, default_value = "5")]
    depth: u8,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,
}

/// Random-walk book for one instrument
struct SimBook {
    spec: InstrumentSpec,
    /// Best bid in ticks
    bid_ticks: i64,
    upper_limit: f64,
    lower_limit: f64,
}

impl SimBook {
    fn new(spec: InstrumentSpec, base_price: f64) -> Self {
        let bid_ticks = (base_price / spec.tick_size).round() as i64;
        // Daily limits at +/- 5% of the opening price
        Self {
            spec,
            bid_ticks,
            upper_limit: base_price * 1.05,
            lower_limit: base_price * 0.95,
        }
    }

    fn step(&mut self, rng: &mut StdRng) {
        let min = (self.lower_limit / self.spec.tick_size).ceil() as i64;
        let max = (self.upper_limit / self.spec.tick_size).floor() as i64 - 1;
        self.bid_ticks = (self.bid_ticks + rng.gen_range(-1..=1)).clamp(min, max.max(min));
    }

    fn tick(&self, depth: u8, rng: &mut StdRng) -> MarketTick {
        let tick_size = self.spec.tick_size;
        let mut tick = MarketTick {
            symbol: self.spec.symbol,
            exchange: self.spec.exchange as u8,
            depth,
            upper_limit: self.upper_limit,
            lower_limit: self.lower_limit,
            ..MarketTick::default()
        };
        for level in 0..depth as usize {
            let offset = level as i64;
            tick.bids[level] = BookLevel::new((self.bid_ticks - offset) as f64 * tick_size, rng.gen_range(1..=50));
            tick.asks[level] = BookLevel::new((self.bid_ticks + 1 + offset) as f64 * tick_size, rng.gen_range(1..=50));
        }
        let trade_at_ask = rng.gen_bool(0.5);
        tick.last_price = if trade_at_ask { tick.asks[0].price } else { tick.bids[0].price };
        tick.last_volume = rng.gen_range(1..=20);
        tick
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.common)?;
    init_logging(&config)?;

    if args.rate == 0 {
        bail!("--rate must be > 0");
    }
    if args.depth == 0 || args.depth as usize > hermod_core::config::constants::BOOK_DEPTH {
        bail!("--depth must be within 1..={}", hermod_core::config::constants::BOOK_DEPTH);
    }
    if config.strategy.instruments.is_empty() {
        bail!("no instruments configured");
    }

    info!("=== Hermod: market data feeder ===");
    let md = &config.transport.market_data;
    let queue = SpscQueue::<MarketTick>::create(&md.key, md.capacity, md.slot_size, "market_data")?;
    let segments = vec![Arc::clone(queue.segment())];
    let on_panic = segments.clone();
    install_panic_handler(Some(Box::new(move || destroy_segments(&on_panic))));
    info!(key = %md.key, capacity = queue.capacity(), "Market data segment created");

    let mut publisher = MarketDataPublisher::new(queue.writer(), Arc::new(SystemClock));
    let mut rng = match args.seed.or(config.gateway.seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut books: Vec<SimBook> = config
        .strategy
        .instruments
        .iter()
        .map(|spec| SimBook::new(*spec, args.base_price))
        .collect();

    let shutdown = shutdown_flag()?;
    setup_performance(&args.common);

    let interval = Duration::from_secs_f64(1.0 / args.rate as f64);
    let mut next_round = Instant::now();
    'outer: while !shutdown.load(Ordering::Acquire) {
        for book in books.iter_mut() {
            book.step(&mut rng);
            let mut tick = book.tick(args.depth, &mut rng);
            publisher.publish(&mut tick);
            if args.count > 0 && publisher.published() >= args.count {
                break 'outer;
            }
        }

        next_round += interval;
        let now = Instant::now();
        if next_round > now {
            std::thread::sleep(next_round - now);
        } else {
            // Fell behind; do not try to catch up in a burst
            next_round = now;
        }
    }

    info!(
        published = publisher.published(),
        instruments = books.len(),
        "Market data feeder stopped"
    );
    destroy_segments(&segments);
    Ok(())
}
