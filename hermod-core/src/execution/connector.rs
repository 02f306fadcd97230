//! Exchange connector abstraction
//!
//! The gateway forwards requests to a connector and receives execution
//! events back through [`ConnectorCallbacks`] when it polls. Implementations:
//! [`SimulatedConnector`](super::simulated::SimulatedConnector) for tests and
//! paper trading; live exchange adapters plug in behind the same trait.

use crate::core::types::{CorrelationId, OffsetFlag};
use crate::execution::types::{OrderRequest, RejectReason};
use anyhow::Result;

/// One execution reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionReport {
    pub id: CorrelationId,
    pub quantity: u32,
    pub price: f64,
    /// Lots still working after this execution
    pub leaves: u32,
    /// Offset the exchange booked the trade under, which can differ from
    /// the one requested
    pub offset: OffsetFlag,
}

/// Receiver of exchange events, implemented by the gateway
pub trait ConnectorCallbacks {
    fn on_order_ack(&mut self, id: CorrelationId);

    fn on_fill(&mut self, report: &ExecutionReport);

    /// Order refused; `unfilled` lots will never trade
    fn on_reject(&mut self, id: CorrelationId, reason: RejectReason, unfilled: u32);

    /// Cancel confirmed; `unfilled` lots were pulled
    fn on_cancel(&mut self, id: CorrelationId, unfilled: u32);

    fn on_cancel_reject(&mut self, id: CorrelationId, reason: RejectReason);
}

/// Order entry to one exchange or counter
pub trait ExchangeConnector: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Submit a new order; acknowledgement and fills arrive through `poll`
    ///
    /// An `Err` means the order never left this process.
    fn send_order(&mut self, request: &OrderRequest) -> Result<CorrelationId>;

    /// Request cancellation of a working order
    fn cancel_order(&mut self, id: CorrelationId) -> Result<()>;

    /// Deliver pending exchange events; returns how many were delivered
    fn poll(&mut self, callbacks: &mut dyn ConnectorCallbacks) -> usize;

    /// Orders sent and not yet finished
    fn working_orders(&self) -> usize;
}
