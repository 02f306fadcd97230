//! Order execution: wire types, exchange connectors, the gateway worker and
//! the order journal

pub mod connector;
pub mod gateway;
pub mod journal;
pub mod simulated;
pub mod types;

pub use connector::{ConnectorCallbacks, ExchangeConnector, ExecutionReport};
pub use gateway::{GatewayStats, GatewayStatsSnapshot, OrderGateway};
pub use journal::{AsyncJournal, JournalEntry, JournalEvent};
pub use simulated::{SimulatedConfig, SimulatedConnector};
pub use types::{OrderRequest, OrderResponse, RejectReason, RequestKind, ResponseKind};
