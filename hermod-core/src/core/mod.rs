//! Core types shared by every layer
//!
//! - `types`: fixed-width wire enums, `Symbol`, `CorrelationId`, instrument specs
//! - `errors`: typed library errors
//! - `clock`: injectable wall clock
//! - `control_fsm`: the strategy control state machine
//!
//! Everything that crosses a process boundary is `Copy` with an explicit
//! width, so it can be written into shared memory as is.

pub mod clock;
pub mod control_fsm;
pub mod errors;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control_fsm::{ControlPhase, CooldownTable, FlattenReason, PhaseKind, StrategyControl, Transition};
pub use errors::{ControlError, ShmError, SubmitError, TransportGap};
pub use types::{
    CorrelationId, ExchangeId, InstrumentSpec, OffsetFlag, OrderType, Side, Symbol, SymbolError,
    TimeInForce,
};
