//! Offset resolution and ledger benchmarks
//!
//! Resolution runs under the instrument lock on every submit, and fills
//! are booked under the same lock, so both sit on the order path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hermod_core::core::{ExchangeId, OffsetFlag, Side, Symbol};
use hermod_core::position::{
    resolve_offset, Fill, OrderIntent, PositionEntry, PositionLedger, Reservation, SideBook, SplitPolicy,
};

fn sym() -> Symbol {
    Symbol::new("ag2512").unwrap()
}

fn long_entry() -> PositionEntry {
    PositionEntry {
        long: SideBook::with_volume(6, 10, 7800.0),
        ..PositionEntry::default()
    }
}

fn resolve_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("offset/resolve");
    let entry = long_entry();

    for (name, exchange) in [("shfe", ExchangeId::Shfe), ("dce", ExchangeId::Dce)] {
        for policy in [SplitPolicy::Split, SplitPolicy::NoSplit] {
            let intent = OrderIntent::limit(sym(), exchange, Side::Sell, 20, 7810.0);
            group.bench_with_input(BenchmarkId::new(name, format!("{policy:?}")), &intent, |b, intent| {
                b.iter(|| black_box(resolve_offset(intent, &entry, intent.exchange, policy)));
            });
        }
    }

    group.finish();
}

fn ledger_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("offset/ledger");

    group.bench_function("resolve_and_release", |b| {
        let ledger = PositionLedger::new();
        ledger.with_entry(sym(), |e| *e = long_entry());
        let intent = OrderIntent::limit(sym(), ExchangeId::Shfe, Side::Sell, 12, 7810.0);
        b.iter(|| {
            let plan = ledger.resolve(black_box(&intent), SplitPolicy::Split);
            for leg in plan.legs() {
                ledger.release(sym(), &leg.reservation);
            }
        });
    });

    group.bench_function("open_then_close_fill", |b| {
        let ledger = PositionLedger::new();
        let open = Fill {
            symbol: sym(),
            side: Side::Buy,
            offset: OffsetFlag::Open,
            quantity: 1,
            price: 7800.0,
            multiplier: 15.0,
        };
        let close = Fill {
            side: Side::Sell,
            offset: OffsetFlag::CloseToday,
            price: 7801.0,
            ..open
        };
        b.iter(|| {
            ledger.apply_fill(black_box(&open), &mut Reservation::none(Side::Buy));
            black_box(ledger.apply_fill(black_box(&close), &mut Reservation::none(Side::Sell)))
        });
    });

    group.finish();
}

criterion_group!(benches, resolve_bench, ledger_bench);
criterion_main!(benches);
