//! Positions: ledger, offset resolution, snapshots

pub mod ledger;
pub mod offset;
pub mod persistence;

pub use ledger::{Fill, FillEffect, LedgerSnapshot, PositionEntry, PositionLedger, PositionRecord, SideBook};
pub use offset::{resolve_offset, OffsetLeg, OffsetPlan, OrderIntent, Reservation, SplitPolicy};
pub use persistence::{load_snapshot, save_snapshot};
