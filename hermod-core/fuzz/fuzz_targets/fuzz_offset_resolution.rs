//! Fuzz target for offset resolution
//!
//! Builds an arbitrary position entry and intent, resolves it under both
//! policies and checks the plan never closes more than is available.

#![no_main]

use hermod_core::core::{ExchangeId, OffsetFlag, Side, Symbol};
use hermod_core::position::{resolve_offset, OrderIntent, PositionEntry, SideBook, SplitPolicy};
use libfuzzer_sys::fuzz_target;

fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 22 {
        return;
    }

    let book = |at: usize| {
        let today = (u32_at(data, at) % 10_000) as u64;
        let yesterday = (u32_at(data, at + 4) % 10_000) as u64;
        let mut b = SideBook::with_volume(today, yesterday, 1000.0);
        b.frozen_today = (data[at + 8] as u64).min(today);
        b
    };
    let entry = PositionEntry {
        long: book(0),
        short: book(9),
        realized_pnl: 0.0,
    };

    let side = if data[18] & 1 == 0 { Side::Buy } else { Side::Sell };
    let exchange = ExchangeId::from_u8(data[19] % 7).unwrap_or(ExchangeId::Shfe);
    let offset = OffsetFlag::from_u8(data[20]).unwrap_or(OffsetFlag::Unknown);
    let quantity = (data[21] as u32) * 7;

    let Ok(symbol) = Symbol::new("fz2501") else { return };
    let intent = OrderIntent::limit(symbol, exchange, side, quantity, 1000.0).with_offset(offset);
    let closable = match side {
        Side::Buy => &entry.short,
        Side::Sell => &entry.long,
    };

    for policy in [SplitPolicy::Split, SplitPolicy::NoSplit] {
        let plan = resolve_offset(&intent, &entry, exchange, policy);

        if quantity == 0 {
            assert!(plan.is_empty());
            continue;
        }
        assert_eq!(plan.total_quantity(), quantity as u64, "plan must cover the intent");
        if policy == SplitPolicy::NoSplit || offset != OffsetFlag::Unknown {
            assert_eq!(plan.len(), 1);
        }

        let (mut today, mut yesterday) = (0, 0);
        for leg in plan.legs() {
            assert!(leg.reservation.total() <= leg.quantity as u64);
            today += leg.reservation.today;
            yesterday += leg.reservation.yesterday;
        }
        assert!(today <= closable.available_today());
        assert!(yesterday <= closable.available_yesterday());
    }
});
