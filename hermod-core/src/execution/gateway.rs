//! Order gateway: request queue → exchange connector → response queue
//!
//! One gateway drains the shared request queue, forwards new orders and
//! cancels to its connector, and turns every connector callback into an
//! [`OrderResponse`] on the shared response queue. Every trader attached to
//! the response queue sees every response and keeps the ones whose
//! correlation ids it allocated.
//!
//! A gap on the request queue means orders were lost before reaching the
//! exchange. The reader already logs it at `error!`; the gateway counts it,
//! journals it, and keeps serving.

use crate::core::clock::{Clock, SystemClock};
use crate::core::types::CorrelationId;
use crate::execution::connector::{ConnectorCallbacks, ExchangeConnector, ExecutionReport};
use crate::execution::journal::AsyncJournal;
use crate::execution::types::{OrderRequest, OrderResponse, RejectReason, RequestKind, ResponseKind};
use crate::shm::mwmr::{MwmrReader, MwmrWriter};
use crossbeam_utils::Backoff;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requests handled per `poll_once` before the connector is polled
const REQUEST_BATCH: usize = 256;

/// Idle sleep once spinning and yielding found nothing to do
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Gateway counters, shared with whoever reports them
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub total_requests: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub filled: AtomicU64,
    pub cancelled: AtomicU64,
    pub cancel_rejected: AtomicU64,
    pub request_gaps: AtomicU64,
    pub missed_requests: AtomicU64,
}

/// Plain copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStatsSnapshot {
    pub total_requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub filled: u64,
    pub cancelled: u64,
    pub cancel_rejected: u64,
    pub request_gaps: u64,
    pub missed_requests: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            filled: self.filled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cancel_rejected: self.cancel_rejected.load(Ordering::Relaxed),
            request_gaps: self.request_gaps.load(Ordering::Relaxed),
            missed_requests: self.missed_requests.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for GatewayStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} accepted={} rejected={} filled={} cancelled={} gaps={} missed={}",
            self.total_requests,
            self.accepted,
            self.rejected,
            self.filled,
            self.cancelled,
            self.request_gaps,
            self.missed_requests
        )
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Order the connector is still working
#[derive(Debug, Clone, Copy)]
struct WorkingOrder {
    request: OrderRequest,
    leaves: u32,
}

pub struct OrderGateway<C: ExchangeConnector> {
    connector: C,
    requests: MwmrReader<OrderRequest>,
    responses: MwmrWriter<OrderResponse>,
    working: HashMap<CorrelationId, WorkingOrder>,
    cancels: HashMap<CorrelationId, OrderRequest>,
    stats: Arc<GatewayStats>,
    journal: Option<AsyncJournal>,
    clock: Arc<dyn Clock>,
}

impl<C: ExchangeConnector> OrderGateway<C> {
    pub fn new(connector: C, requests: MwmrReader<OrderRequest>, responses: MwmrWriter<OrderResponse>) -> Self {
        info!(connector = connector.name(), "Order gateway initialized");
        Self {
            connector,
            requests,
            responses,
            working: HashMap::new(),
            cancels: HashMap::new(),
            stats: Arc::new(GatewayStats::default()),
            journal: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_journal(mut self, journal: AsyncJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn working_orders(&self) -> usize {
        self.working.len()
    }

    /// Drain available requests, then deliver connector events
    ///
    /// Returns the number of requests and events handled.
    pub fn poll_once(&mut self) -> usize {
        let mut handled = 0;
        while handled < REQUEST_BATCH {
            match self.requests.try_dequeue() {
                Ok(Some(request)) => {
                    self.handle_request(&request);
                    handled += 1;
                }
                Ok(None) => break,
                Err(gap) => {
                    bump(&self.stats.request_gaps);
                    self.stats.missed_requests.fetch_add(gap.missed, Ordering::Relaxed);
                    if let Some(journal) = &self.journal {
                        journal.record((&gap).into());
                    }
                }
            }
        }

        let mut emitter = Emitter {
            responses: &self.responses,
            working: &mut self.working,
            cancels: &mut self.cancels,
            stats: &self.stats,
            journal: self.journal.as_ref(),
            now_ns: self.clock.now_nanos(),
        };
        handled + self.connector.poll(&mut emitter)
    }

    /// Serve until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> GatewayStatsSnapshot {
        info!(connector = self.connector.name(), "Order gateway running");
        let backoff = Backoff::new();
        while !shutdown.load(Ordering::Acquire) {
            if self.poll_once() > 0 {
                backoff.reset();
            } else if backoff.is_completed() {
                std::thread::sleep(IDLE_SLEEP);
            } else {
                backoff.snooze();
            }
        }
        let stats = self.stats.snapshot();
        info!(%stats, working = self.working.len(), "Order gateway stopped");
        stats
    }

    fn handle_request(&mut self, request: &OrderRequest) {
        bump(&self.stats.total_requests);
        if let Some(journal) = &self.journal {
            journal.record_request(request);
        }

        match request.kind() {
            Some(RequestKind::New) => self.handle_new(request),
            Some(RequestKind::Cancel) => self.handle_cancel(request),
            None => {
                warn!(id = %request.id(), kind = request.kind, "Request with unknown kind");
                self.reject(request, RejectReason::Invalid, request.quantity);
            }
        }
    }

    fn handle_new(&mut self, request: &OrderRequest) {
        if request.quantity == 0 || request.side().is_none() || request.order_type().is_none() {
            warn!(?request, "Malformed order request");
            self.reject(request, RejectReason::Invalid, request.quantity);
            return;
        }
        if self.working.contains_key(&request.id()) {
            warn!(id = %request.id(), "Duplicate correlation id");
            self.reject(request, RejectReason::Invalid, request.quantity);
            return;
        }

        match self.connector.send_order(request) {
            Ok(id) => {
                bump(&self.stats.accepted);
                self.working.insert(
                    id,
                    WorkingOrder {
                        request: *request,
                        leaves: request.quantity,
                    },
                );
                debug!(id = %id, symbol = %request.symbol, "Order forwarded");
            }
            Err(e) => {
                warn!(id = %request.id(), error = %e, "Connector refused order");
                self.reject(request, RejectReason::NotConnected, request.quantity);
            }
        }
    }

    fn handle_cancel(&mut self, request: &OrderRequest) {
        let id = request.id();
        if !self.working.contains_key(&id) {
            bump(&self.stats.cancel_rejected);
            let mut resp = OrderResponse::for_request(request, ResponseKind::CancelReject, self.clock.now_nanos());
            resp.reject_reason = RejectReason::UnknownOrder as u8;
            self.publish(&resp);
            return;
        }
        match self.connector.cancel_order(id) {
            Ok(()) => {
                self.cancels.insert(id, *request);
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Connector refused cancel");
                bump(&self.stats.cancel_rejected);
                let mut resp = OrderResponse::for_request(request, ResponseKind::CancelReject, self.clock.now_nanos());
                resp.reject_reason = RejectReason::NotConnected as u8;
                self.publish(&resp);
            }
        }
    }

    fn reject(&mut self, request: &OrderRequest, reason: RejectReason, unfilled: u32) {
        bump(&self.stats.rejected);
        let mut resp = OrderResponse::for_request(request, ResponseKind::Reject, self.clock.now_nanos());
        resp.quantity = unfilled;
        resp.reject_reason = reason as u8;
        self.publish(&resp);
    }

    fn publish(&self, resp: &OrderResponse) {
        self.responses.enqueue(resp);
        if let Some(journal) = &self.journal {
            journal.record_response(resp);
        }
    }
}

/// Translates connector callbacks into response-queue messages
struct Emitter<'a> {
    responses: &'a MwmrWriter<OrderResponse>,
    working: &'a mut HashMap<CorrelationId, WorkingOrder>,
    cancels: &'a mut HashMap<CorrelationId, OrderRequest>,
    stats: &'a GatewayStats,
    journal: Option<&'a AsyncJournal>,
    now_ns: u64,
}

impl Emitter<'_> {
    fn publish(&self, resp: &OrderResponse) {
        self.responses.enqueue(resp);
        if let Some(journal) = self.journal {
            journal.record_response(resp);
        }
    }

    fn working(&self, id: CorrelationId, event: &'static str) -> Option<WorkingOrder> {
        let order = self.working.get(&id).copied();
        if order.is_none() {
            warn!(id = %id, event, "Connector event for unknown order");
        }
        order
    }
}

impl ConnectorCallbacks for Emitter<'_> {
    fn on_order_ack(&mut self, id: CorrelationId) {
        if let Some(order) = self.working(id, "ack") {
            let mut resp = OrderResponse::for_request(&order.request, ResponseKind::Ack, self.now_ns);
            resp.leaves = order.leaves;
            self.publish(&resp);
        }
    }

    fn on_fill(&mut self, report: &ExecutionReport) {
        let Some(order) = self.working(report.id, "fill") else {
            return;
        };
        bump(&self.stats.filled);
        let mut resp = OrderResponse::for_request(&order.request, ResponseKind::Fill, self.now_ns);
        resp.quantity = report.quantity;
        resp.price = report.price;
        resp.leaves = report.leaves;
        resp.offset = report.offset as u8;
        self.publish(&resp);

        if report.leaves == 0 {
            self.working.remove(&report.id);
        } else if let Some(w) = self.working.get_mut(&report.id) {
            w.leaves = report.leaves;
        }
    }

    fn on_reject(&mut self, id: CorrelationId, reason: RejectReason, unfilled: u32) {
        let Some(order) = self.working.remove(&id) else {
            warn!(id = %id, "Reject for unknown order");
            return;
        };
        bump(&self.stats.rejected);
        let mut resp = OrderResponse::for_request(&order.request, ResponseKind::Reject, self.now_ns);
        resp.quantity = unfilled;
        resp.reject_reason = reason as u8;
        self.publish(&resp);
    }

    fn on_cancel(&mut self, id: CorrelationId, unfilled: u32) {
        self.cancels.remove(&id);
        let Some(order) = self.working.remove(&id) else {
            warn!(id = %id, "Cancel confirm for unknown order");
            return;
        };
        bump(&self.stats.cancelled);
        let mut resp = OrderResponse::for_request(&order.request, ResponseKind::CancelConfirm, self.now_ns);
        resp.quantity = unfilled;
        self.publish(&resp);
    }

    fn on_cancel_reject(&mut self, id: CorrelationId, reason: RejectReason) {
        bump(&self.stats.cancel_rejected);
        let template = self
            .cancels
            .remove(&id)
            .or_else(|| self.working.get(&id).map(|w| w.request));
        let Some(request) = template else {
            warn!(id = %id, "Cancel reject for unknown order");
            return;
        };
        let mut resp = OrderResponse::for_request(&request, ResponseKind::CancelReject, self.now_ns);
        resp.reject_reason = reason as u8;
        self.publish(&resp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExchangeId, OffsetFlag, OrderType, Side, Symbol, TimeInForce};
    use crate::execution::simulated::{SimulatedConfig, SimulatedConnector};
    use crate::shm::mwmr::MwmrQueue;

    struct Rig {
        gateway: OrderGateway<SimulatedConnector>,
        submit: MwmrWriter<OrderRequest>,
        replies: MwmrReader<OrderResponse>,
    }

    fn rig(config: SimulatedConfig) -> Rig {
        let requests = MwmrQueue::<OrderRequest>::anonymous(64, "order_request").unwrap();
        let responses = MwmrQueue::<OrderResponse>::anonymous(64, "order_response").unwrap();
        let replies = responses.reader();
        let gateway = OrderGateway::new(SimulatedConnector::new(config), requests.reader(), responses.writer());
        Rig {
            gateway,
            submit: requests.writer(),
            replies,
        }
    }

    fn new_order(id: u64, quantity: u32) -> OrderRequest {
        OrderRequest::new_order(
            CorrelationId(id),
            1,
            Symbol::new("ag2506").unwrap(),
            ExchangeId::Shfe,
            Side::Buy,
            OffsetFlag::Open,
            quantity,
            5_000.0,
            OrderType::Limit,
            TimeInForce::Gfd,
            0,
        )
    }

    fn drain(replies: &mut MwmrReader<OrderResponse>) -> Vec<(ResponseKind, u32, u32)> {
        let mut out = Vec::new();
        while let Ok(Some(r)) = replies.try_dequeue() {
            out.push((r.kind().unwrap(), r.quantity, r.leaves));
        }
        out
    }

    #[test]
    fn test_order_is_acked_and_filled() {
        let mut rig = rig(SimulatedConfig::instant());
        rig.submit.enqueue(&new_order(1, 3));
        rig.gateway.poll_once();

        assert_eq!(
            drain(&mut rig.replies),
            vec![(ResponseKind::Ack, 0, 3), (ResponseKind::Fill, 3, 0)]
        );
        let stats = rig.gateway.stats().snapshot();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.filled, 1);
        assert_eq!(rig.gateway.working_orders(), 0);
    }

    #[test]
    fn test_cancel_resting_order() {
        let mut rig = rig(SimulatedConfig::resting());
        rig.submit.enqueue(&new_order(1, 2));
        rig.gateway.poll_once();
        rig.submit.enqueue(&OrderRequest::cancel(CorrelationId(1), 1, Symbol::new("ag2506").unwrap(), 0));
        rig.gateway.poll_once();

        assert_eq!(
            drain(&mut rig.replies),
            vec![(ResponseKind::Ack, 0, 2), (ResponseKind::CancelConfirm, 2, 0)]
        );
        assert_eq!(rig.gateway.stats().snapshot().cancelled, 1);
    }

    #[test]
    fn test_cancel_unknown_order_is_rejected() {
        let mut rig = rig(SimulatedConfig::instant());
        rig.submit.enqueue(&OrderRequest::cancel(CorrelationId(5), 1, Symbol::new("ag2506").unwrap(), 0));
        rig.gateway.poll_once();
        let replies = drain(&mut rig.replies);
        assert_eq!(replies, vec![(ResponseKind::CancelReject, 0, 0)]);
    }

    #[test]
    fn test_malformed_request_is_rejected() {
        let mut rig = rig(SimulatedConfig::instant());
        rig.submit.enqueue(&new_order(1, 0));
        rig.gateway.poll_once();
        assert_eq!(drain(&mut rig.replies), vec![(ResponseKind::Reject, 0, 0)]);
        assert_eq!(rig.gateway.stats().snapshot().rejected, 1);
    }

    #[test]
    fn test_request_gap_is_counted() {
        let requests = MwmrQueue::<OrderRequest>::anonymous(4, "order_request").unwrap();
        let responses = MwmrQueue::<OrderResponse>::anonymous(64, "order_response").unwrap();
        let mut gateway = OrderGateway::new(
            SimulatedConnector::new(SimulatedConfig::instant()),
            requests.reader(),
            responses.writer(),
        );
        let w = requests.writer();
        for id in 1..=6 {
            w.enqueue(&new_order(id, 1));
        }
        gateway.poll_once();
        let stats = gateway.stats().snapshot();
        assert_eq!(stats.request_gaps, 1);
        assert_eq!(stats.missed_requests, 2);
        assert_eq!(stats.total_requests, 4);
    }

    /// Fills everything in full, booking every trade as CLOSE_TODAY
    #[derive(Default)]
    struct CloseTodayDesk {
        sent: Vec<OrderRequest>,
    }

    impl ExchangeConnector for CloseTodayDesk {
        fn name(&self) -> &'static str {
            "close-today"
        }

        fn send_order(&mut self, request: &OrderRequest) -> anyhow::Result<CorrelationId> {
            self.sent.push(*request);
            Ok(request.id())
        }

        fn cancel_order(&mut self, _id: CorrelationId) -> anyhow::Result<()> {
            Ok(())
        }

        fn poll(&mut self, callbacks: &mut dyn ConnectorCallbacks) -> usize {
            let sent = std::mem::take(&mut self.sent);
            for request in &sent {
                callbacks.on_order_ack(request.id());
                callbacks.on_fill(&ExecutionReport {
                    id: request.id(),
                    quantity: request.quantity,
                    price: request.price,
                    leaves: 0,
                    offset: OffsetFlag::CloseToday,
                });
            }
            sent.len() * 2
        }

        fn working_orders(&self) -> usize {
            self.sent.len()
        }
    }

    #[test]
    fn test_fill_carries_offset_applied_by_exchange() {
        let requests = MwmrQueue::<OrderRequest>::anonymous(64, "order_request").unwrap();
        let responses = MwmrQueue::<OrderResponse>::anonymous(64, "order_response").unwrap();
        let mut replies = responses.reader();
        let mut gateway = OrderGateway::new(CloseTodayDesk::default(), requests.reader(), responses.writer());

        let mut close = new_order(9, 2);
        close.side = Side::Sell as u8;
        close.offset = OffsetFlag::Close as u8;
        requests.writer().enqueue(&close);
        gateway.poll_once();

        let ack = replies.try_dequeue().unwrap().unwrap();
        assert_eq!(ack.kind(), Some(ResponseKind::Ack));
        assert_eq!(ack.offset(), OffsetFlag::Close);
        let fill = replies.try_dequeue().unwrap().unwrap();
        assert_eq!(fill.kind(), Some(ResponseKind::Fill));
        assert_eq!(fill.offset(), OffsetFlag::CloseToday);
        assert_eq!(fill.quantity, 2);
    }
}
