//! Hermod Core - Shared-Memory Order Routing for Futures Trading
//!
//! Hermod moves market data and orders between an exchange-facing gateway
//! process and strategy processes through lock-free shared-memory queues,
//! and keeps each strategy's positions and control state consistent with
//! what the exchange reports.
//!
//! ## Architecture
//! ```text
//!  md feeder ──SPSC──► trader: feed ─► router ─► strategy
//!                                                   │ intent
//!                                             OrderCoordinator
//!                                                   │
//!                          ┌──── MWMR request ──────┘
//!                          ▼
//!                      gateway ──► exchange connector
//!                          │
//!                          └──── MWMR response ───► OrderCoordinator
//! ```
//!
//! ## Core Modules
//! - `shm`: segments with explicit ownership, ring buffer, SPSC and MWMR queues
//! - `position`: today/yesterday ledger, offset resolver, snapshots
//! - `core`: wire enums, errors, clock, strategy control state machine
//! - `engine`: risk evaluation and the order lifecycle coordinator
//! - `execution`: order wire types, connector trait, gateway, journal
//! - `data`: market tick layout, feed, per-instrument router
//! - `config`: JSON configuration, constants, profiles

pub mod config;
pub mod core;
pub mod data;
pub mod engine;
pub mod execution;
pub mod monitoring;
pub mod perf;
pub mod position;
pub mod resilience;
pub mod shm;
pub mod utils;

pub use crate::core::{
    ControlPhase, CorrelationId, ExchangeId, FlattenReason, InstrumentSpec, OffsetFlag, OrderType,
    PhaseKind, Side, StrategyControl, Symbol, TimeInForce,
};
pub use config::HermodConfig;
pub use data::{MarketDataFeed, MarketDataPublisher, MarketTick, TickRouter};
pub use engine::{CoordinatorSettings, OrderCoordinator, OrderEventSink, OrderTicket};
pub use execution::{OrderGateway, OrderRequest, OrderResponse};
pub use position::{OrderIntent, PositionLedger, SplitPolicy};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{
        Clock, CorrelationId, ExchangeId, FlattenReason, InstrumentSpec, OffsetFlag, PhaseKind, Side,
        SubmitError, Symbol, SystemClock,
    };

    pub use crate::config::HermodConfig;
    pub use crate::data::{BookLevel, MarketDataFeed, MarketDataPublisher, MarketTick, TickRouter};
    pub use crate::engine::{CoordinatorSettings, OrderCoordinator, OrderEventSink, RiskLimits};
    pub use crate::execution::{
        ExchangeConnector, OrderGateway, OrderRequest, OrderResponse, SimulatedConfig, SimulatedConnector,
    };
    pub use crate::position::{OrderIntent, PositionLedger, SplitPolicy};
    pub use crate::shm::{ClientStore, MwmrQueue, OrderIdAllocator, ShmKey, SpscQueue};

    pub use crate::perf::{optimize_for_hft, pin_to_core};

    pub use crate::{Error, Result};
}
