//! In-process fan-out of ticks to per-instrument subscribers
//!
//! Each subscriber gets its own bounded channel. A full channel drops the tick
//! for that subscriber only; the router never blocks the feed thread.

use crate::core::types::Symbol;
use crate::data::types::MarketTick;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub struct TickRouter {
    subscribers: DashMap<Symbol, Vec<Sender<MarketTick>>>,
    capacity: usize,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    unrouted: AtomicU64,
}

impl TickRouter {
    /// `capacity` bounds each subscriber's channel
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }

    /// Stream of ticks for `symbol`
    pub fn subscribe(&self, symbol: Symbol) -> Receiver<MarketTick> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.entry(symbol).or_default().push(tx);
        debug!(%symbol, "Tick subscriber added");
        rx
    }

    /// Deliver a tick to every subscriber of its symbol. Returns the number of
    /// subscribers that received it.
    pub fn dispatch(&self, tick: &MarketTick) -> usize {
        let Some(mut senders) = self.subscribers.get_mut(&tick.symbol) else {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        let mut delivered = 0;
        senders.retain(|tx| match tx.try_send(*tick) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!(
                        symbol = %tick.symbol,
                        source_seq = tick.source_seq,
                        total_dropped = total,
                        "Tick subscriber full, dropping"
                    );
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(symbol = %tick.symbol, "Tick subscriber gone");
                false
            }
        });
        self.dispatched.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.subscribers.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Ticks dropped because a subscriber's channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ticks for symbols nobody subscribed to
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }
}

impl Default for TickRouter {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExchangeId;
    use crate::data::types::BookLevel;

    fn tick(symbol: &str, seq: u64) -> MarketTick {
        let mut t = MarketTick::quote(
            Symbol::new(symbol).unwrap(),
            ExchangeId::Dce,
            BookLevel::new(100.0, 1),
            BookLevel::new(101.0, 1),
        );
        t.source_seq = seq;
        t
    }

    #[test]
    fn test_routes_by_symbol() {
        let router = TickRouter::new(8);
        let m = router.subscribe(Symbol::new("m2509").unwrap());
        let y = router.subscribe(Symbol::new("y2509").unwrap());

        assert_eq!(router.dispatch(&tick("m2509", 1)), 1);
        assert_eq!(router.dispatch(&tick("p2509", 2)), 0);

        assert_eq!(m.try_recv().unwrap().source_seq, 1);
        assert!(y.try_recv().is_err());
        assert_eq!(router.unrouted(), 1);
    }

    #[test]
    fn test_full_subscriber_drops() {
        let router = TickRouter::new(2);
        let rx = router.subscribe(Symbol::new("m2509").unwrap());
        for seq in 1..=5 {
            router.dispatch(&tick("m2509", seq));
        }
        assert_eq!(router.dropped(), 3);
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv().unwrap().source_seq, 1);
    }

    #[test]
    fn test_disconnected_subscriber_removed() {
        let router = TickRouter::new(2);
        let sym = Symbol::new("m2509").unwrap();
        let rx = router.subscribe(sym);
        let _keep = router.subscribe(sym);
        drop(rx);

        assert_eq!(router.dispatch(&tick("m2509", 1)), 1);
        assert_eq!(router.subscriber_count(&sym), 1);
    }
}
