//! Per-instrument position ledger
//!
//! Each instrument has a [`PositionEntry`] holding a long and a short
//! [`SideBook`], split into volume opened today and volume carried from
//! previous sessions. Entries are created lazily, never removed, and each
//! sits behind its own lock so fills on different instruments never contend.
//!
//! Book invariants, held after every operation:
//! - `total == today + yesterday`
//! - `frozen_today <= today`, `frozen_yesterday <= yesterday`
//! - `avg_price == 0` and `cost_basis == 0` whenever `total == 0`

use crate::core::types::{OffsetFlag, Side, Symbol};
use crate::position::offset::{resolve_offset, OffsetPlan, OrderIntent, Reservation, SplitPolicy};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// One direction of a position
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SideBook {
    pub total: u64,
    pub today: u64,
    pub yesterday: u64,
    /// Volume-weighted average open price
    pub avg_price: f64,
    /// `avg_price * total`, kept separately to avoid drift
    pub cost_basis: f64,
    /// Volume reserved by working close orders
    pub frozen_today: u64,
    pub frozen_yesterday: u64,
}

impl SideBook {
    /// Book with carried and same-day volume at one price
    pub fn with_volume(today: u64, yesterday: u64, avg_price: f64) -> Self {
        let total = today + yesterday;
        let avg_price = if total == 0 { 0.0 } else { avg_price };
        Self {
            total,
            today,
            yesterday,
            avg_price,
            cost_basis: avg_price * total as f64,
            frozen_today: 0,
            frozen_yesterday: 0,
        }
    }

    #[inline]
    pub fn available_today(&self) -> u64 {
        self.today.saturating_sub(self.frozen_today)
    }

    #[inline]
    pub fn available_yesterday(&self) -> u64 {
        self.yesterday.saturating_sub(self.frozen_yesterday)
    }

    pub fn is_flat(&self) -> bool {
        self.total == 0
    }

    /// Whether the book invariants hold
    pub fn is_consistent(&self) -> bool {
        self.total == self.today + self.yesterday
            && self.frozen_today <= self.today
            && self.frozen_yesterday <= self.yesterday
            && (self.total != 0 || (self.avg_price == 0.0 && self.cost_basis == 0.0))
    }

    fn open(&mut self, quantity: u64, price: f64) {
        self.cost_basis += quantity as f64 * price;
        self.total += quantity;
        self.today += quantity;
        self.avg_price = self.cost_basis / self.total as f64;
    }

    /// Remove closed volume; returns `(from_today, from_yesterday)`
    ///
    /// Volume reserved by `reservation` is consumed first so that other
    /// working orders keep their frozen lots.
    fn close(&mut self, offset: OffsetFlag, quantity: u64, reservation: &mut Reservation) -> (u64, u64) {
        let (use_today, use_yesterday) = match offset {
            OffsetFlag::CloseToday => (true, false),
            OffsetFlag::CloseYesterday => (false, true),
            _ => (true, true),
        };
        let mut left = quantity;
        let mut from_today = 0;
        let mut from_yesterday = 0;

        if use_yesterday {
            let n = left.min(reservation.yesterday).min(self.frozen_yesterday);
            self.frozen_yesterday -= n;
            reservation.yesterday -= n;
            from_yesterday += n;
            left -= n;
        }
        if use_today {
            let n = left.min(reservation.today).min(self.frozen_today);
            self.frozen_today -= n;
            reservation.today -= n;
            from_today += n;
            left -= n;
        }
        if use_yesterday {
            let n = left.min(self.available_yesterday_after(from_yesterday));
            from_yesterday += n;
            left -= n;
        }
        if use_today {
            let n = left.min(self.available_today_after(from_today));
            from_today += n;
        }

        self.yesterday -= from_yesterday;
        self.today -= from_today;
        let closed = from_today + from_yesterday;
        self.cost_basis -= self.avg_price * closed as f64;
        self.total -= closed;
        if self.total == 0 {
            self.avg_price = 0.0;
            self.cost_basis = 0.0;
        }
        (from_today, from_yesterday)
    }

    fn available_today_after(&self, taken: u64) -> u64 {
        self.today.saturating_sub(self.frozen_today + taken)
    }

    fn available_yesterday_after(&self, taken: u64) -> u64 {
        self.yesterday.saturating_sub(self.frozen_yesterday + taken)
    }

    fn freeze(&mut self, reservation: &Reservation) {
        self.frozen_today = (self.frozen_today + reservation.today).min(self.today);
        self.frozen_yesterday = (self.frozen_yesterday + reservation.yesterday).min(self.yesterday);
    }

    fn thaw(&mut self, reservation: &Reservation) {
        self.frozen_today = self.frozen_today.saturating_sub(reservation.today);
        self.frozen_yesterday = self.frozen_yesterday.saturating_sub(reservation.yesterday);
    }

    fn roll_day(&mut self) {
        self.yesterday += self.today;
        self.today = 0;
        self.frozen_yesterday += self.frozen_today;
        self.frozen_today = 0;
    }
}

/// Long and short books for one instrument
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub long: SideBook,
    pub short: SideBook,
    pub realized_pnl: f64,
}

impl PositionEntry {
    /// Book that an order on `side` would close against
    #[inline]
    pub fn closable_book(&self, side: Side) -> &SideBook {
        match side {
            Side::Buy => &self.short,
            Side::Sell => &self.long,
        }
    }

    fn closable_book_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.short,
            Side::Sell => &mut self.long,
        }
    }

    fn opening_book_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.long,
            Side::Sell => &mut self.short,
        }
    }

    /// Long minus short
    pub fn net(&self) -> i64 {
        self.long.total as i64 - self.short.total as i64
    }

    pub fn is_flat(&self) -> bool {
        self.long.is_flat() && self.short.is_flat()
    }

    pub fn is_consistent(&self) -> bool {
        self.long.is_consistent() && self.short.is_consistent()
    }

    /// Mark-to-market P&L of the open books at `mark`
    pub fn unrealized_pnl(&self, mark: f64, multiplier: f64) -> f64 {
        let long = (mark - self.long.avg_price) * self.long.total as f64;
        let short = (self.short.avg_price - mark) * self.short.total as f64;
        (long + short) * multiplier
    }
}

/// An execution to book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub symbol: Symbol,
    pub side: Side,
    /// Offset the exchange applied to the order
    pub offset: OffsetFlag,
    pub quantity: u64,
    pub price: f64,
    pub multiplier: f64,
}

/// What a fill did to the books
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillEffect {
    pub opened: u64,
    pub closed_today: u64,
    pub closed_yesterday: u64,
    /// Quantity that had nothing left to close
    pub overflow: u64,
    pub realized_pnl: f64,
    pub net_after: i64,
}

/// Serializable copy of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: Symbol,
    pub entry: PositionEntry,
}

/// Point-in-time copy of the whole ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Wall clock milliseconds since the epoch
    pub taken_at_ms: u64,
    pub positions: Vec<PositionRecord>,
}

impl LedgerSnapshot {
    pub fn get(&self, symbol: &Symbol) -> Option<&PositionEntry> {
        self.positions.iter().find(|r| &r.symbol == symbol).map(|r| &r.entry)
    }
}

/// Thread-safe map of instrument to position entry
#[derive(Default)]
pub struct PositionLedger {
    entries: DashMap<Symbol, Arc<Mutex<PositionEntry>>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `symbol`, created empty on first use
    pub fn entry(&self, symbol: Symbol) -> Arc<Mutex<PositionEntry>> {
        self.entries
            .entry(symbol)
            .or_insert_with(|| Arc::new(Mutex::new(PositionEntry::default())))
            .value()
            .clone()
    }

    /// Run `f` with the entry locked
    pub fn with_entry<R>(&self, symbol: Symbol, f: impl FnOnce(&mut PositionEntry) -> R) -> R {
        let entry = self.entry(symbol);
        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// Copy of the entry, if the instrument was ever touched
    pub fn get(&self, symbol: &Symbol) -> Option<PositionEntry> {
        self.entries.get(symbol).map(|e| *e.value().lock())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Resolve offsets for `intent` and freeze the volume the plan closes
    ///
    /// Resolution and freezing happen under one lock acquisition.
    pub fn resolve(&self, intent: &OrderIntent, policy: SplitPolicy) -> OffsetPlan {
        self.with_entry(intent.symbol, |entry| {
            let plan = resolve_offset(intent, entry, intent.exchange, policy);
            let book = entry.closable_book_mut(intent.side);
            for leg in plan.legs() {
                book.freeze(&leg.reservation);
            }
            plan
        })
    }

    /// Thaw the unfilled remainder of a rejected or cancelled close order
    pub fn release(&self, symbol: Symbol, reservation: &Reservation) {
        if reservation.is_empty() {
            return;
        }
        self.with_entry(symbol, |entry| {
            entry.closable_book_mut(reservation.side).thaw(reservation);
        });
        debug!(
            symbol = %symbol,
            today = reservation.today,
            yesterday = reservation.yesterday,
            "Released reserved volume"
        );
    }

    /// Book a fill, consuming from `reservation` where it applies
    pub fn apply_fill(&self, fill: &Fill, reservation: &mut Reservation) -> FillEffect {
        self.with_entry(fill.symbol, |entry| {
            let mut effect = FillEffect::default();
            match fill.offset {
                OffsetFlag::Open | OffsetFlag::Unknown => {
                    entry.opening_book_mut(fill.side).open(fill.quantity, fill.price);
                    effect.opened = fill.quantity;
                }
                close => {
                    let book = entry.closable_book_mut(fill.side);
                    let avg = book.avg_price;
                    let (from_today, from_yesterday) = book.close(close, fill.quantity, reservation);
                    let closed = from_today + from_yesterday;
                    let per_lot = match fill.side {
                        // Buying back a short
                        Side::Buy => avg - fill.price,
                        Side::Sell => fill.price - avg,
                    };
                    effect.realized_pnl = per_lot * closed as f64 * fill.multiplier;
                    effect.closed_today = from_today;
                    effect.closed_yesterday = from_yesterday;
                    effect.overflow = fill.quantity - closed;
                    entry.realized_pnl += effect.realized_pnl;

                    if effect.overflow > 0 {
                        error!(
                            symbol = %fill.symbol,
                            side = %fill.side,
                            offset = %close,
                            quantity = fill.quantity,
                            closed,
                            "Close fill exceeds position, clamped"
                        );
                    }
                }
            }
            effect.net_after = entry.net();
            effect
        })
    }

    /// Start a new trading day: today's volume becomes yesterday's
    pub fn roll_day(&self) {
        for item in self.entries.iter() {
            let mut entry = item.value().lock();
            entry.long.roll_day();
            entry.short.roll_day();
        }
    }

    /// Copy of every entry, sorted by symbol
    pub fn snapshot(&self, taken_at_ms: u64) -> LedgerSnapshot {
        let mut positions: Vec<PositionRecord> = self
            .entries
            .iter()
            .map(|item| PositionRecord {
                symbol: *item.key(),
                entry: *item.value().lock(),
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        LedgerSnapshot {
            taken_at_ms,
            positions,
        }
    }

    /// Load a snapshot from a previous session
    ///
    /// All volume is carried as yesterday volume and no reservations survive.
    pub fn restore(&self, snapshot: &LedgerSnapshot) {
        for record in &snapshot.positions {
            let carry = |book: &SideBook| SideBook::with_volume(0, book.total, book.avg_price);
            self.with_entry(record.symbol, |entry| {
                entry.long = carry(&record.entry.long);
                entry.short = carry(&record.entry.short);
                entry.realized_pnl = record.entry.realized_pnl;
            });
        }
    }

    pub fn net_position(&self, symbol: &Symbol) -> i64 {
        self.get(symbol).map(|e| e.net()).unwrap_or(0)
    }

    pub fn is_flat(&self, symbol: &Symbol) -> bool {
        self.get(symbol).map(|e| e.is_flat()).unwrap_or(true)
    }

    pub fn all_flat(&self) -> bool {
        self.entries.iter().all(|item| item.value().lock().is_flat())
    }

    pub fn realized_pnl(&self) -> f64 {
        self.entries.iter().map(|item| item.value().lock().realized_pnl).sum()
    }

    pub fn unrealized_pnl(&self, symbol: &Symbol, mark: f64, multiplier: f64) -> f64 {
        self.get(symbol)
            .map(|e| e.unrealized_pnl(mark, multiplier))
            .unwrap_or(0.0)
    }
}
