use crate::config::constants::BOOK_DEPTH;
use crate::core::types::{ExchangeId, Symbol};
use crate::shm::ring::ShmPayload;
use std::fmt;

/// One price level of a ladder (16 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: u32,
    pub orders: u32,
}

impl BookLevel {
    pub fn new(price: f64, quantity: u32) -> Self {
        Self {
            price,
            quantity,
            orders: 0,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.quantity == 0 || self.price <= 0.0
    }
}

/// Market data snapshot for one instrument (400 bytes)
///
/// ```text
/// offset   0  symbol          [u8; 32]
/// offset  32  exchange_ts_ns  u64
/// offset  40  source_seq      u64
/// offset  48  last_price      f64
/// offset  56  upper_limit     f64   (0 = none)
/// offset  64  lower_limit     f64   (0 = none)
/// offset  72  last_volume     u32
/// offset  76  exchange        u8
/// offset  77  depth           u8    (levels populated per side)
/// offset  78  _pad            [u8; 2]
/// offset  80  bids            [BookLevel; 10]  best first
/// offset 240  asks            [BookLevel; 10]  best first
/// ```
#[derive(Clone, Copy, PartialEq)]
#[repr(C)]
pub struct MarketTick {
    pub symbol: Symbol,
    pub exchange_ts_ns: u64,
    /// Publisher sequence, starts at 1 and increases by one per tick
    pub source_seq: u64,
    pub last_price: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub last_volume: u32,
    pub exchange: u8,
    pub depth: u8,
    pub _pad: [u8; 2],
    pub bids: [BookLevel; BOOK_DEPTH],
    pub asks: [BookLevel; BOOK_DEPTH],
}

const _: () = assert!(std::mem::size_of::<BookLevel>() == 16);
const _: () = assert!(std::mem::size_of::<MarketTick>() == 400);
const _: () = assert!(std::mem::align_of::<MarketTick>() == 8);

// SAFETY: repr(C), no pointers, explicit padding, all-zero is a valid value
unsafe impl ShmPayload for MarketTick {}

impl Default for MarketTick {
    fn default() -> Self {
        Self {
            symbol: Symbol::EMPTY,
            exchange_ts_ns: 0,
            source_seq: 0,
            last_price: 0.0,
            upper_limit: 0.0,
            lower_limit: 0.0,
            last_volume: 0,
            exchange: ExchangeId::Unknown as u8,
            depth: 0,
            _pad: [0; 2],
            bids: [BookLevel::default(); BOOK_DEPTH],
            asks: [BookLevel::default(); BOOK_DEPTH],
        }
    }
}

impl MarketTick {
    /// Top-of-book tick
    pub fn quote(symbol: Symbol, exchange: ExchangeId, bid: BookLevel, ask: BookLevel) -> Self {
        let mut tick = Self {
            symbol,
            exchange: exchange as u8,
            depth: 1,
            ..Self::default()
        };
        tick.bids[0] = bid;
        tick.asks[0] = ask;
        tick
    }

    #[inline]
    pub fn exchange(&self) -> ExchangeId {
        ExchangeId::from_u8(self.exchange).unwrap_or(ExchangeId::Unknown)
    }

    #[inline]
    pub fn best_bid(&self) -> Option<BookLevel> {
        Some(self.bids[0]).filter(|l| !l.is_empty())
    }

    #[inline]
    pub fn best_ask(&self) -> Option<BookLevel> {
        Some(self.asks[0]).filter(|l| !l.is_empty())
    }

    /// Mid price, falling back to the last trade when one side is empty
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ if self.last_price > 0.0 => Some(self.last_price),
            _ => None,
        }
    }

    /// Last trade at the daily up or down limit
    pub fn at_price_limit(&self) -> bool {
        if self.last_price <= 0.0 {
            return false;
        }
        (self.upper_limit > 0.0 && self.last_price >= self.upper_limit)
            || (self.lower_limit > 0.0 && self.last_price <= self.lower_limit)
    }

    /// Populated bid levels
    pub fn bid_levels(&self) -> &[BookLevel] {
        &self.bids[..(self.depth as usize).min(BOOK_DEPTH)]
    }

    /// Populated ask levels
    pub fn ask_levels(&self) -> &[BookLevel] {
        &self.asks[..(self.depth as usize).min(BOOK_DEPTH)]
    }
}

impl fmt::Debug for MarketTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketTick")
            .field("symbol", &self.symbol)
            .field("exchange", &self.exchange())
            .field("source_seq", &self.source_seq)
            .field("bid", &self.best_bid())
            .field("ask", &self.best_ask())
            .field("last_price", &self.last_price)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout() {
        assert_eq!(offset_of!(MarketTick, exchange_ts_ns), 32);
        assert_eq!(offset_of!(MarketTick, source_seq), 40);
        assert_eq!(offset_of!(MarketTick, last_volume), 72);
        assert_eq!(offset_of!(MarketTick, bids), 80);
        assert_eq!(offset_of!(MarketTick, asks), 240);
    }

    #[test]
    fn test_quote_helpers() {
        let tick = MarketTick::quote(
            Symbol::new("rb2510").unwrap(),
            ExchangeId::Shfe,
            BookLevel::new(3_500.0, 10),
            BookLevel::new(3_502.0, 4),
        );
        assert_eq!(tick.exchange(), ExchangeId::Shfe);
        assert_eq!(tick.mid(), Some(3_501.0));
        assert_eq!(tick.bid_levels().len(), 1);
        assert!(!tick.at_price_limit());
    }

    #[test]
    fn test_price_limit() {
        let mut tick = MarketTick::default();
        tick.upper_limit = 110.0;
        tick.lower_limit = 90.0;
        tick.last_price = 110.0;
        assert!(tick.at_price_limit());
        tick.last_price = 100.0;
        assert!(!tick.at_price_limit());
        tick.last_price = 89.0;
        assert!(tick.at_price_limit());
    }

    #[test]
    fn test_empty_book() {
        let tick = MarketTick::default();
        assert_eq!(tick.best_bid(), None);
        assert_eq!(tick.mid(), None);
    }
}
