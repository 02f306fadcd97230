//! Position ledger and offset resolution tests
//!
//! These tests verify:
//! 1. SHFE/INE split close-today, close and open legs in that order
//! 2. Other exchanges close carried volume first with a single CLOSE
//! 3. NoSplit never produces more than one order
//! 4. Reserved volume cannot be closed twice, and is released on reject
//! 5. Book invariants hold under arbitrary fill sequences

use approx::assert_relative_eq;
use hermod_core::core::{ExchangeId, OffsetFlag, Side, Symbol};
use hermod_core::position::{Fill, OrderIntent, PositionLedger, Reservation, SplitPolicy};
use proptest::prelude::*;

fn sym() -> Symbol {
    Symbol::new("rb2510").unwrap()
}

fn open_fill(side: Side, quantity: u64, price: f64) -> Fill {
    Fill {
        symbol: sym(),
        side,
        offset: OffsetFlag::Open,
        quantity,
        price,
        multiplier: 10.0,
    }
}

/// Long 5 carried from yesterday at 3500, long 3 opened today at 3520
fn seeded_long() -> PositionLedger {
    let ledger = PositionLedger::new();
    ledger.apply_fill(&open_fill(Side::Buy, 5, 3500.0), &mut Reservation::none(Side::Buy));
    ledger.roll_day();
    ledger.apply_fill(&open_fill(Side::Buy, 3, 3520.0), &mut Reservation::none(Side::Buy));
    ledger
}

fn legs(plan: &hermod_core::position::OffsetPlan) -> Vec<(OffsetFlag, u32)> {
    plan.legs().map(|l| (l.offset, l.quantity)).collect()
}

// ============================================================================
// OFFSET RESOLUTION
// ============================================================================

/// Test: shfe_split
///
/// Verifies that:
/// - today's volume closes with CLOSE_TODAY, carried volume with CLOSE
/// - the remainder opens the opposite side
#[test]
fn test_shfe_split() {
    let ledger = seeded_long();
    let intent = OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, 10, 3510.0);
    let plan = ledger.resolve(&intent, SplitPolicy::Split);

    assert_eq!(
        legs(&plan),
        vec![(OffsetFlag::CloseToday, 3), (OffsetFlag::Close, 5), (OffsetFlag::Open, 2)]
    );
    assert_eq!(plan.total_quantity(), 10);
    assert_eq!(plan.open_quantity(), 2);

    let long = ledger.get(&sym()).unwrap().long;
    assert_eq!(long.frozen_today, 3);
    assert_eq!(long.frozen_yesterday, 5);
    assert_eq!(long.available_today() + long.available_yesterday(), 0);
}

/// Test: shfe_no_split
///
/// Verifies that:
/// - a single bucket that covers the quantity is used
/// - otherwise the whole intent opens
#[test]
fn test_shfe_no_split() {
    let ledger = seeded_long();
    let sell = |q| OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, q, 3510.0);

    let plan = ledger.resolve(&sell(2), SplitPolicy::NoSplit);
    assert_eq!(legs(&plan), vec![(OffsetFlag::CloseToday, 2)]);

    // Today has 1 left, yesterday 5
    let plan = ledger.resolve(&sell(4), SplitPolicy::NoSplit);
    assert_eq!(legs(&plan), vec![(OffsetFlag::Close, 4)]);

    // Neither bucket covers 3 any more (1 today, 1 yesterday)
    let plan = ledger.resolve(&sell(3), SplitPolicy::NoSplit);
    assert_eq!(legs(&plan), vec![(OffsetFlag::Open, 3)]);
}

/// Test: dce_single_close
///
/// Verifies that:
/// - exchanges without CLOSE_TODAY close both buckets with one CLOSE
/// - carried volume is reserved first
#[test]
fn test_dce_single_close() {
    let ledger = seeded_long();
    let intent = OrderIntent::limit(sym(), ExchangeId::Dce, Side::Sell, 6, 3510.0);
    let plan = ledger.resolve(&intent, SplitPolicy::Split);

    assert_eq!(legs(&plan), vec![(OffsetFlag::Close, 6)]);
    let leg = plan.first().unwrap();
    assert_eq!(leg.reservation.yesterday, 5);
    assert_eq!(leg.reservation.today, 1);
}

/// Test: explicit_offset_is_honoured
///
/// Verifies that:
/// - an intent with a preset offset produces exactly that leg
#[test]
fn test_explicit_offset_is_honoured() {
    let ledger = seeded_long();
    let intent = OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, 2, 3510.0)
        .with_offset(OffsetFlag::Open);
    let plan = ledger.resolve(&intent, SplitPolicy::Split);
    assert_eq!(legs(&plan), vec![(OffsetFlag::Open, 2)]);
}

/// Test: buy_closes_short
///
/// Verifies that:
/// - a BUY resolves against the short book, never the long one
#[test]
fn test_buy_closes_short() {
    let ledger = seeded_long();
    let intent = OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Buy, 2, 3510.0);
    let plan = ledger.resolve(&intent, SplitPolicy::Split);
    assert_eq!(legs(&plan), vec![(OffsetFlag::Open, 2)]);
}

/// Test: zero_quantity_is_empty
#[test]
fn test_zero_quantity_is_empty() {
    let ledger = seeded_long();
    let intent = OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, 0, 3510.0);
    assert!(ledger.resolve(&intent, SplitPolicy::Split).is_empty());
}

// ============================================================================
// RESERVATIONS
// ============================================================================

/// Test: reserved_volume_cannot_close_twice
///
/// Verifies that:
/// - a second intent resolved before the first fills opens instead of
///   closing the same lots
/// - releasing the first reservation makes the lots closable again
#[test]
fn test_reserved_volume_cannot_close_twice() {
    let ledger = seeded_long();
    let sell = |q| OrderIntent::limit(sym(), ExchangeId::Dce, Side::Sell, q, 3510.0);

    let first = ledger.resolve(&sell(8), SplitPolicy::Split);
    assert_eq!(legs(&first), vec![(OffsetFlag::Close, 8)]);

    let second = ledger.resolve(&sell(1), SplitPolicy::Split);
    assert_eq!(legs(&second), vec![(OffsetFlag::Open, 1)]);

    ledger.release(sym(), &first.first().unwrap().reservation);
    let third = ledger.resolve(&sell(1), SplitPolicy::Split);
    assert_eq!(legs(&third), vec![(OffsetFlag::Close, 1)]);
}

/// Test: partial_close_fills_consume_reservation
///
/// Verifies that:
/// - close fills consume the order's reservation as they arrive
/// - realized P&L uses the average open price and the multiplier
/// - the position is flat with zeroed averages once everything closes
#[test]
fn test_partial_close_fills_consume_reservation() {
    let ledger = PositionLedger::new();
    ledger.apply_fill(&open_fill(Side::Buy, 4, 3500.0), &mut Reservation::none(Side::Buy));

    let plan = ledger.resolve(
        &OrderIntent::limit(sym(), ExchangeId::Dce, Side::Sell, 4, 3510.0),
        SplitPolicy::Split,
    );
    let mut reservation = plan.first().unwrap().reservation;
    assert_eq!(reservation.total(), 4);

    let close = |q| Fill {
        offset: OffsetFlag::Close,
        side: Side::Sell,
        price: 3510.0,
        ..open_fill(Side::Sell, q, 0.0)
    };
    let effect = ledger.apply_fill(&close(1), &mut reservation);
    assert_eq!(effect.closed_today, 1);
    assert_eq!(reservation.total(), 3);
    assert_relative_eq!(effect.realized_pnl, 100.0);

    let effect = ledger.apply_fill(&close(3), &mut reservation);
    assert!(reservation.is_empty());
    assert_eq!(effect.net_after, 0);
    assert_eq!(effect.overflow, 0);

    let entry = ledger.get(&sym()).unwrap();
    assert!(entry.is_flat());
    assert!(entry.is_consistent());
    assert_eq!(entry.long.avg_price, 0.0);
    assert_relative_eq!(ledger.realized_pnl(), 400.0);
}

/// Test: close_overflow_is_clamped
///
/// Verifies that:
/// - a close fill larger than the position closes only what exists
#[test]
fn test_close_overflow_is_clamped() {
    let ledger = PositionLedger::new();
    ledger.apply_fill(&open_fill(Side::Sell, 2, 3500.0), &mut Reservation::none(Side::Sell));
    let fill = Fill {
        offset: OffsetFlag::Close,
        ..open_fill(Side::Buy, 5, 3490.0)
    };
    let effect = ledger.apply_fill(&fill, &mut Reservation::none(Side::Buy));
    assert_eq!(effect.overflow, 3);
    assert_relative_eq!(effect.realized_pnl, 200.0);
    assert!(ledger.is_flat(&sym()));
}

/// Test: roll_day_moves_reservations
///
/// Verifies that:
/// - today volume and frozen today volume move to yesterday together
#[test]
fn test_roll_day_moves_reservations() {
    let ledger = PositionLedger::new();
    ledger.apply_fill(&open_fill(Side::Buy, 3, 3500.0), &mut Reservation::none(Side::Buy));
    let plan = ledger.resolve(
        &OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, 2, 3510.0),
        SplitPolicy::Split,
    );
    let mut reservation = plan.first().unwrap().reservation;
    ledger.roll_day();
    reservation.roll_day();

    let long = ledger.get(&sym()).unwrap().long;
    assert_eq!((long.today, long.yesterday), (0, 3));
    assert_eq!((long.frozen_today, long.frozen_yesterday), (0, 2));
    assert_eq!((reservation.today, reservation.yesterday), (0, 2));
}

// ============================================================================
// INVARIANTS
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Open(Side, u64),
    /// Resolve a closing intent and fill `filled` of it, releasing the rest
    Close(Side, u32, u32, bool),
    Roll,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let side = prop_oneof![Just(Side::Buy), Just(Side::Sell)];
    prop_oneof![
        (side.clone(), 1u64..10).prop_map(|(s, q)| Op::Open(s, q)),
        (side, 1u32..12, 0u32..12, any::<bool>()).prop_map(|(s, q, f, shfe)| Op::Close(s, q, f, shfe)),
        Just(Op::Roll),
    ]
}

proptest! {
    /// Test: ledger_invariants_hold
    ///
    /// Verifies that:
    /// - total == today + yesterday and frozen <= bucket after every step
    /// - nothing stays frozen once every order is filled or released
    #[test]
    fn prop_ledger_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ledger = PositionLedger::new();
        for op in ops {
            match op {
                Op::Open(side, q) => {
                    ledger.apply_fill(&open_fill(side, q, 3500.0), &mut Reservation::none(side));
                }
                Op::Close(side, q, filled, shfe) => {
                    let exchange = if shfe { ExchangeId::Shfe } else { ExchangeId::Dce };
                    let plan = ledger.resolve(
                        &OrderIntent::limit(sym(), exchange, side, q, 3500.0),
                        SplitPolicy::Split,
                    );
                    let mut left = filled;
                    for leg in plan.legs() {
                        let mut reservation = leg.reservation;
                        let n = left.min(leg.quantity);
                        left -= n;
                        if n > 0 {
                            let fill = Fill { offset: leg.offset, ..open_fill(side, n as u64, 3500.0) };
                            ledger.apply_fill(&fill, &mut reservation);
                        }
                        ledger.release(sym(), &reservation);
                    }
                }
                Op::Roll => ledger.roll_day(),
            }
            let entry = ledger.get(&sym()).unwrap_or_default();
            prop_assert!(entry.is_consistent(), "inconsistent entry: {:?}", entry);
            prop_assert_eq!(entry.net(), entry.long.total as i64 - entry.short.total as i64);
        }
        let entry = ledger.get(&sym()).unwrap_or_default();
        prop_assert_eq!(entry.long.frozen_today + entry.long.frozen_yesterday, 0);
        prop_assert_eq!(entry.short.frozen_today + entry.short.frozen_yesterday, 0);
        // Opens and closes at one price never realize P&L
        prop_assert!(ledger.realized_pnl().abs() < 1e-6);
    }
}
