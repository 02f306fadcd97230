//! Market data publisher and consumer over the SPSC queue
//!
//! Two kinds of loss are tracked separately:
//! - ticks overwritten in the ring before the reader saw them (transport
//!   drops, reported by [`SpscReader::dropped`])
//! - ticks the publisher never delivered, detected from `source_seq`

use crate::core::clock::Clock;
use crate::data::types::MarketTick;
use crate::monitoring::metrics::MetricsRegistry;
use crate::resilience::gap_detector::{GapDetector, SeqStatus};
use crate::shm::spsc::{SpscReader, SpscWriter};
use prometheus::IntCounter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stamps and publishes ticks; the single writer of a market data queue
pub struct MarketDataPublisher {
    writer: SpscWriter<MarketTick>,
    clock: Arc<dyn Clock>,
    next_source_seq: u64,
    published: u64,
}

impl MarketDataPublisher {
    pub fn new(writer: SpscWriter<MarketTick>, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer,
            clock,
            next_source_seq: 1,
            published: 0,
        }
    }

    /// Assign the next source sequence, fill a missing exchange timestamp and
    /// publish. Returns the source sequence.
    #[inline]
    pub fn publish(&mut self, tick: &mut MarketTick) -> u64 {
        let seq = self.next_source_seq;
        tick.source_seq = seq;
        if tick.exchange_ts_ns == 0 {
            tick.exchange_ts_ns = self.clock.now_nanos();
        }
        self.writer.publish(tick);
        self.next_source_seq += 1;
        self.published += 1;
        seq
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Source sequence the next tick will carry
    pub fn next_source_seq(&self) -> u64 {
        self.next_source_seq
    }
}

/// Statistics for one market data feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub received: u64,
    pub empty_polls: u64,
    /// Gap events in the source sequence
    pub source_gaps: u64,
    /// Ticks the publisher skipped
    pub source_missed: u64,
    pub duplicates: u64,
    pub restarts: u64,
    /// Ticks overwritten in the ring before they were read
    pub transport_dropped: u64,
}

/// Consumer side of a market data queue
pub struct MarketDataFeed {
    reader: SpscReader<MarketTick>,
    name: String,
    detector: GapDetector,
    stats: FeedStats,
    source_gaps_counter: Option<IntCounter>,
}

impl MarketDataFeed {
    pub fn new(reader: SpscReader<MarketTick>, name: impl Into<String>) -> Self {
        let name = name.into();
        info!(feed = %name, "Market data feed attached");
        Self {
            reader,
            name,
            detector: GapDetector::new(),
            stats: FeedStats::default(),
            source_gaps_counter: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
        self.source_gaps_counter = Some(
            metrics
                .transport()
                .source_gaps_total
                .with_label_values(&[self.name.as_str()]),
        );
        self
    }

    /// Next tick, if any. Never blocks.
    pub fn try_next(&mut self) -> Option<MarketTick> {
        let dropped_before = self.reader.dropped();
        let Some(tick) = self.reader.try_recv() else {
            self.stats.empty_polls += 1;
            return None;
        };
        self.on_tick(&tick, dropped_before);
        Some(tick)
    }

    /// Next tick, waiting at most `timeout`
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<MarketTick> {
        let dropped_before = self.reader.dropped();
        let tick = self.reader.recv_timeout(timeout)?;
        self.on_tick(&tick, dropped_before);
        Some(tick)
    }

    fn on_tick(&mut self, tick: &MarketTick, dropped_before: u64) {
        self.stats.received += 1;
        self.stats.transport_dropped = self.reader.dropped();
        let lapped = self.stats.transport_dropped.saturating_sub(dropped_before);
        self.track_source_seq(tick, lapped);
    }

    /// `lapped` ticks were overwritten in the ring just before this one;
    /// they account for that much of any jump in `source_seq`
    fn track_source_seq(&mut self, tick: &MarketTick, lapped: u64) {
        match self.detector.check(tick.source_seq) {
            SeqStatus::First | SeqStatus::InOrder => {}
            SeqStatus::Gap { missed } => {
                let missed = missed.saturating_sub(lapped);
                if missed == 0 {
                    debug!(
                        feed = %self.name,
                        source_seq = tick.source_seq,
                        lapped,
                        "Sequence jump explained by ring overwrite"
                    );
                    return;
                }
                self.stats.source_gaps += 1;
                self.stats.source_missed += missed;
                if let Some(c) = &self.source_gaps_counter {
                    c.inc();
                }
                warn!(
                    feed = %self.name,
                    symbol = %tick.symbol,
                    source_seq = tick.source_seq,
                    missed,
                    lapped,
                    "Market data source gap"
                );
            }
            SeqStatus::Duplicate => {
                self.stats.duplicates += 1;
                debug!(feed = %self.name, source_seq = tick.source_seq, "Duplicate tick");
            }
            SeqStatus::Restart { previous } => {
                self.stats.restarts += 1;
                warn!(
                    feed = %self.name,
                    previous,
                    source_seq = tick.source_seq,
                    "Market data publisher restarted"
                );
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    /// Ticks published but not yet read
    pub fn backlog(&self) -> u64 {
        self.reader.backlog()
    }
}
