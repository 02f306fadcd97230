//! Offset resolution: decide whether an order opens or closes
//!
//! Exchanges that distinguish same-day closes (SHFE, INE) need
//! `CloseToday` for volume opened today and `Close` for carried volume.
//! Everywhere else a single `Close` covers both buckets.
//!
//! Resolution looks at *available* volume only (bucket minus volume already
//! reserved by working close orders), so two intents resolved back to back
//! can never close the same lots twice. Each close leg carries the
//! [`Reservation`] it took; the ledger freezes it when the plan is accepted
//! and thaws it as the leg fills, is rejected, or is cancelled.

use crate::config::constants::MAX_PLAN_LEGS;
use crate::core::types::{ExchangeId, OffsetFlag, OrderType, Side, Symbol, TimeInForce};
use crate::position::ledger::{PositionEntry, SideBook};
use serde::{Deserialize, Serialize};

/// What a strategy wants to trade, before offset resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub exchange: ExchangeId,
    pub side: Side,
    pub quantity: u32,
    pub price: f64,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    /// `Unknown` lets the resolver decide; anything else is honoured as is
    pub offset: OffsetFlag,
}

impl OrderIntent {
    /// Limit GFD intent with the offset left to the resolver
    pub fn limit(symbol: Symbol, exchange: ExchangeId, side: Side, quantity: u32, price: f64) -> Self {
        Self {
            symbol,
            exchange,
            side,
            quantity,
            price,
            order_type: OrderType::Limit,
            tif: TimeInForce::Gfd,
            offset: OffsetFlag::Unknown,
        }
    }

    pub fn with_offset(mut self, offset: OffsetFlag) -> Self {
        self.offset = offset;
        self
    }
}

/// Whether one intent may become several orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Close whatever is available, open the remainder
    #[default]
    Split,
    /// One order per intent; opens when no single bucket covers the quantity
    NoSplit,
}

/// Closable volume frozen by a working close order
///
/// `side` is the order side; the frozen volume lives on the opposite book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub side: Side,
    pub today: u64,
    pub yesterday: u64,
}

impl Reservation {
    pub fn none(side: Side) -> Self {
        Self {
            side,
            today: 0,
            yesterday: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.today + self.yesterday
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Move the today part into yesterday, mirroring a ledger day roll
    pub fn roll_day(&mut self) {
        self.yesterday += self.today;
        self.today = 0;
    }
}

/// One order produced by resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetLeg {
    pub offset: OffsetFlag,
    pub quantity: u32,
    pub reservation: Reservation,
}

impl OffsetLeg {
    fn open(side: Side, quantity: u32) -> Self {
        Self {
            offset: OffsetFlag::Open,
            quantity,
            reservation: Reservation::none(side),
        }
    }
}

/// Up to [`MAX_PLAN_LEGS`] legs, stored inline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPlan {
    legs: [Option<OffsetLeg>; MAX_PLAN_LEGS],
    len: usize,
}

impl OffsetPlan {
    fn new() -> Self {
        Self {
            legs: [None; MAX_PLAN_LEGS],
            len: 0,
        }
    }

    fn single(leg: OffsetLeg) -> Self {
        let mut plan = Self::new();
        plan.push(leg);
        plan
    }

    fn push(&mut self, leg: OffsetLeg) {
        if leg.quantity == 0 {
            return;
        }
        debug_assert!(self.len < MAX_PLAN_LEGS);
        self.legs[self.len] = Some(leg);
        self.len += 1;
    }

    pub fn legs(&self) -> impl Iterator<Item = &OffsetLeg> {
        self.legs[..self.len].iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<&OffsetLeg> {
        self.legs[0].as_ref()
    }

    pub fn total_quantity(&self) -> u64 {
        self.legs().map(|l| l.quantity as u64).sum()
    }

    /// Quantity resolved to an opening order
    pub fn open_quantity(&self) -> u64 {
        self.legs()
            .filter(|l| l.offset == OffsetFlag::Open)
            .map(|l| l.quantity as u64)
            .sum()
    }
}

/// Resolve the offset legs for `intent` against `entry`
///
/// A BUY closes short volume, a SELL closes long volume. Pure: the caller
/// freezes the returned reservations under the same lock it read `entry`
/// with.
pub fn resolve_offset(
    intent: &OrderIntent,
    entry: &PositionEntry,
    exchange: ExchangeId,
    policy: SplitPolicy,
) -> OffsetPlan {
    let side = intent.side;
    let q = intent.quantity;
    if q == 0 {
        return OffsetPlan::new();
    }

    let book = entry.closable_book(side);
    let today = book.available_today();
    let yesterday = book.available_yesterday();

    if intent.offset != OffsetFlag::Unknown {
        return OffsetPlan::single(preset_leg(intent.offset, side, q, book, exchange));
    }

    let q64 = q as u64;
    let mut plan = OffsetPlan::new();

    if exchange.distinguishes_close_today() {
        match policy {
            SplitPolicy::Split => {
                let ct = q64.min(today);
                let cy = (q64 - ct).min(yesterday);
                plan.push(close_leg(OffsetFlag::CloseToday, side, ct, 0, ct));
                plan.push(close_leg(OffsetFlag::Close, side, cy, cy, 0));
                plan.push(OffsetLeg::open(side, (q64 - ct - cy) as u32));
            }
            SplitPolicy::NoSplit => {
                if q64 <= today {
                    plan.push(close_leg(OffsetFlag::CloseToday, side, q64, 0, q64));
                } else if q64 <= yesterday {
                    plan.push(close_leg(OffsetFlag::Close, side, q64, q64, 0));
                } else {
                    plan.push(OffsetLeg::open(side, q));
                }
            }
        }
    } else {
        let closable = today + yesterday;
        match policy {
            SplitPolicy::Split => {
                let c = q64.min(closable);
                let (from_y, from_t) = yesterday_first(c, yesterday);
                plan.push(close_leg(OffsetFlag::Close, side, c, from_y, from_t));
                plan.push(OffsetLeg::open(side, (q64 - c) as u32));
            }
            SplitPolicy::NoSplit => {
                if q64 <= closable {
                    let (from_y, from_t) = yesterday_first(q64, yesterday);
                    plan.push(close_leg(OffsetFlag::Close, side, q64, from_y, from_t));
                } else {
                    plan.push(OffsetLeg::open(side, q));
                }
            }
        }
    }
    plan
}

/// A caller-chosen offset; reserve what the flag can close, up to `q`
fn preset_leg(offset: OffsetFlag, side: Side, q: u32, book: &SideBook, exchange: ExchangeId) -> OffsetLeg {
    let q64 = q as u64;
    let today = book.available_today();
    let yesterday = book.available_yesterday();
    let (from_y, from_t) = match offset {
        OffsetFlag::CloseToday => (0, q64.min(today)),
        OffsetFlag::CloseYesterday => (q64.min(yesterday), 0),
        OffsetFlag::Close if exchange.distinguishes_close_today() => (q64.min(yesterday), 0),
        OffsetFlag::Close => yesterday_first(q64.min(today + yesterday), yesterday),
        OffsetFlag::Open | OffsetFlag::Unknown => (0, 0),
    };
    OffsetLeg {
        offset,
        quantity: q,
        reservation: Reservation {
            side,
            today: from_t,
            yesterday: from_y,
        },
    }
}

fn close_leg(offset: OffsetFlag, side: Side, quantity: u64, yesterday: u64, today: u64) -> OffsetLeg {
    OffsetLeg {
        offset,
        quantity: quantity as u32,
        reservation: Reservation {
            side,
            today,
            yesterday,
        },
    }
}

/// Split `q` (already bounded by the closable total) into yesterday then today
fn yesterday_first(q: u64, yesterday: u64) -> (u64, u64) {
    let from_y = q.min(yesterday);
    (from_y, q - from_y)
}
