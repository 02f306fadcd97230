//! Strategy-side order engine
//!
//! - `risk`: pre-trade checks and periodic limit evaluation
//! - `coordinator`: gate, resolve, enqueue, and book responses

pub mod coordinator;
pub mod risk;

pub use coordinator::{
    CoordinatorSettings, NullSink, OrderCoordinator, OrderEventSink, OrderTicket, PendingOrder, Quote,
    TicketLeg,
};
pub use risk::{evaluate, RiskAction, RiskLimits, RiskSnapshot};
