//! Fuzz target for ledger bookkeeping
//!
//! Interprets the input as a stream of opens, resolved closes with partial
//! fills, releases and day rolls, and checks the book invariants after
//! every step.

#![no_main]

use hermod_core::core::{ExchangeId, OffsetFlag, Side, Symbol};
use hermod_core::position::{Fill, OrderIntent, PositionLedger, Reservation, SplitPolicy};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(symbol) = Symbol::new("fz2501") else { return };
    let ledger = PositionLedger::new();

    for chunk in data.chunks_exact(4) {
        let side = if chunk[0] & 1 == 0 { Side::Buy } else { Side::Sell };
        let quantity = (chunk[1] % 32) as u32;
        let price = 1000.0 + chunk[3] as f64;
        let fill = |offset, quantity: u32| Fill {
            symbol,
            side,
            offset,
            quantity: quantity as u64,
            price,
            multiplier: 10.0,
        };

        match (chunk[0] >> 1) & 3 {
            0 => {
                ledger.apply_fill(&fill(OffsetFlag::Open, quantity), &mut Reservation::none(side));
            }
            1 | 2 => {
                let exchange = if chunk[0] & 8 == 0 { ExchangeId::Shfe } else { ExchangeId::Czce };
                let policy = if chunk[0] & 16 == 0 { SplitPolicy::Split } else { SplitPolicy::NoSplit };
                let plan = ledger.resolve(&OrderIntent::limit(symbol, exchange, side, quantity, price), policy);
                let mut left = chunk[2] as u32;
                for leg in plan.legs() {
                    let mut reservation = leg.reservation;
                    let n = left.min(leg.quantity);
                    left -= n;
                    if n > 0 {
                        let effect = ledger.apply_fill(&fill(leg.offset, n), &mut reservation);
                        assert_eq!(effect.overflow, 0, "reserved close overflowed");
                    }
                    ledger.release(symbol, &reservation);
                }
            }
            _ => ledger.roll_day(),
        }

        if let Some(entry) = ledger.get(&symbol) {
            assert!(entry.is_consistent(), "inconsistent entry: {:?}", entry);
            assert!(entry.long.avg_price.is_finite() && entry.short.avg_price.is_finite());
        }
    }

    if let Some(entry) = ledger.get(&symbol) {
        assert_eq!(entry.long.frozen_today + entry.long.frozen_yesterday, 0);
        assert_eq!(entry.short.frozen_today + entry.short.frozen_yesterday, 0);
    }
});
