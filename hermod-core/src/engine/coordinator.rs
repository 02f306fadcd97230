//! Order Lifecycle Coordinator
//!
//! One coordinator per strategy. It is the only writer of that strategy's
//! control state and the only place its orders touch the position ledger.
//!
//! ```text
//!  intent ──► gate ──► resolve + freeze ──► exposure ──► request queue
//!                                                              │
//!                                                           gateway
//!                                                              │
//!  sink ◄── ledger update ◄── on_response ◄──────────── response queue
//!                                 │
//!                            risk_check ──► control FSM ──► execute_flatten
//! ```
//!
//! Locks are per strategy (control) and per instrument (ledger entry and
//! pending-order shards). None is held while a queue is written.

use crate::config::constants::RISK_CHECK_INTERVAL_MS;
use crate::config::HermodConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::control_fsm::{ControlPhase, CooldownTable, FlattenReason, PhaseKind, StrategyControl};
use crate::core::errors::{ControlError, SubmitError, TransportGap};
use crate::core::types::{CorrelationId, ExchangeId, InstrumentSpec, OffsetFlag, Side, Symbol};
use crate::data::types::MarketTick;
use crate::engine::risk::{check_exposure, check_intent, evaluate, RiskAction, RiskLimits, RiskSnapshot};
use crate::execution::types::{OrderRequest, OrderResponse, ResponseKind};
use crate::monitoring::metrics::MetricsRegistry;
use crate::position::ledger::{Fill, PositionLedger};
use crate::position::offset::{OffsetPlan, OrderIntent, Reservation, SplitPolicy};
use crate::shm::client_store::OrderIdAllocator;
use crate::shm::mwmr::{MwmrReader, MwmrWriter};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Responses handled per `poll_responses` call
const RESPONSE_BATCH: usize = 256;

/// Receives every fill and reject for the strategy's orders
pub trait OrderEventSink: Send + Sync {
    fn on_fill_or_reject(&self, response: &OrderResponse);
}

/// Sink that ignores everything
pub struct NullSink;

impl OrderEventSink for NullSink {
    fn on_fill_or_reject(&self, _response: &OrderResponse) {}
}

/// An order on the request queue that has not reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingOrder {
    pub id: CorrelationId,
    pub symbol: Symbol,
    pub side: Side,
    pub offset: OffsetFlag,
    pub price: f64,
    pub quantity: u32,
    pub leaves: u32,
    /// Closable volume still frozen for this order
    pub reservation: Reservation,
    pub is_flatten: bool,
    pub acked: bool,
    pub cancel_requested: bool,
}

/// One order created from an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketLeg {
    pub id: CorrelationId,
    pub offset: OffsetFlag,
    pub quantity: u32,
}

/// Orders created for one accepted intent, one per offset leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderTicket {
    legs: Vec<TicketLeg>,
}

impl OrderTicket {
    pub fn legs(&self) -> &[TicketLeg] {
        &self.legs
    }

    pub fn ids(&self) -> impl Iterator<Item = CorrelationId> + '_ {
        self.legs.iter().map(|l| l.id)
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn total_quantity(&self) -> u64 {
        self.legs.iter().map(|l| l.quantity as u64).sum()
    }
}

/// Latest top of book for one instrument
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: f64,
    pub at_limit: bool,
    pub exchange_ts_ns: u64,
}

impl Quote {
    pub fn from_tick(tick: &MarketTick) -> Self {
        Self {
            bid: tick.best_bid().map(|l| l.price),
            ask: tick.best_ask().map(|l| l.price),
            last: tick.last_price,
            at_limit: tick.at_price_limit(),
            exchange_ts_ns: tick.exchange_ts_ns,
        }
    }

    /// Price used to mark open positions
    pub fn mark(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ if self.last > 0.0 => Some(self.last),
            (Some(p), None) | (None, Some(p)) => Some(p),
            (None, None) => None,
        }
    }
}

/// Everything a coordinator needs from configuration
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub strategy_id: i32,
    pub auto_activate: bool,
    pub cooldowns: CooldownTable,
    pub risk: RiskLimits,
    pub split_policy: SplitPolicy,
    pub exit_on_response_gap: bool,
    pub instruments: Vec<InstrumentSpec>,
    pub risk_check_interval: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &HermodConfig) -> Self {
        Self {
            strategy_id: config.strategy.strategy_id,
            auto_activate: config.control.auto_activate,
            cooldowns: config.control.cooldowns.clone(),
            risk: config.risk.clone(),
            split_policy: config.strategy.split_policy,
            exit_on_response_gap: config.strategy.exit_on_response_gap,
            instruments: config.strategy.instruments.clone(),
            risk_check_interval: Duration::from_millis(config.control.risk_check_interval_ms),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            strategy_id: 1,
            auto_activate: true,
            cooldowns: CooldownTable::default(),
            risk: RiskLimits::default(),
            split_policy: SplitPolicy::default(),
            exit_on_response_gap: false,
            instruments: Vec::new(),
            risk_check_interval: Duration::from_millis(RISK_CHECK_INTERVAL_MS),
        }
    }
}

pub struct OrderCoordinator {
    strategy_id: i32,
    label: String,
    control: Mutex<StrategyControl>,
    ledger: Arc<PositionLedger>,
    pending: DashMap<CorrelationId, PendingOrder>,
    quotes: DashMap<Symbol, Quote>,
    instruments: HashMap<Symbol, InstrumentSpec>,
    requests: MwmrWriter<OrderRequest>,
    ids: OrderIdAllocator,
    sink: Arc<dyn OrderEventSink>,
    metrics: MetricsRegistry,
    clock: Arc<dyn Clock>,
    limits: RiskLimits,
    policy: SplitPolicy,
    exit_on_response_gap: bool,
    risk_check_interval: Duration,
    reject_count: AtomicU32,
    response_gaps: AtomicU64,
}

impl OrderCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        ledger: Arc<PositionLedger>,
        requests: MwmrWriter<OrderRequest>,
        ids: OrderIdAllocator,
        metrics: MetricsRegistry,
    ) -> Self {
        let instruments = settings
            .instruments
            .iter()
            .map(|spec| (spec.symbol, *spec))
            .collect();
        info!(
            strategy_id = settings.strategy_id,
            client_id = ids.client_id(),
            policy = ?settings.split_policy,
            instruments = settings.instruments.len(),
            "Order coordinator created"
        );
        Self {
            strategy_id: settings.strategy_id,
            label: settings.strategy_id.to_string(),
            control: Mutex::new(StrategyControl::new(
                settings.strategy_id,
                settings.auto_activate,
                settings.cooldowns,
            )),
            ledger,
            pending: DashMap::new(),
            quotes: DashMap::new(),
            instruments,
            requests,
            ids,
            sink: Arc::new(NullSink),
            metrics,
            clock: Arc::new(SystemClock),
            limits: settings.risk,
            policy: settings.split_policy,
            exit_on_response_gap: settings.exit_on_response_gap,
            risk_check_interval: settings.risk_check_interval,
            reject_count: AtomicU32::new(0),
            response_gaps: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OrderEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Gate, resolve and enqueue one intent
    pub fn submit(&self, intent: OrderIntent) -> Result<OrderTicket, SubmitError> {
        check_intent(&intent)?;
        let spec = self.instrument(&intent.symbol)?;
        let mut intent = intent;
        if intent.exchange == ExchangeId::Unknown {
            intent.exchange = spec.exchange;
        }

        {
            let control = self.control.lock();
            if !control.can_send_new_orders() {
                let phase = control.kind();
                let active = control.is_activated();
                drop(control);
                self.metrics
                    .orders()
                    .blocked_total
                    .with_label_values(&[self.label.as_str(), phase.as_str()])
                    .inc();
                debug!(
                    strategy_id = self.strategy_id,
                    symbol = %intent.symbol,
                    side = %intent.side,
                    quantity = intent.quantity,
                    %phase,
                    active,
                    "Intent dropped, sending blocked"
                );
                return Err(SubmitError::Blocked { phase, active });
            }
        }

        let plan = self.ledger.resolve(&intent, self.policy);
        let net = self.ledger.net_position(&intent.symbol);
        if let Err(e) = check_exposure(&self.limits, &intent, &plan, net) {
            self.release_plan(&intent.symbol, &plan);
            warn!(
                strategy_id = self.strategy_id,
                symbol = %intent.symbol,
                side = %intent.side,
                quantity = intent.quantity,
                net,
                error = %e,
                "Intent dropped by pre-trade check"
            );
            return Err(e);
        }

        Ok(self.emit_plan(&intent, &plan, false))
    }

    /// Enqueue a cancel for a pending order
    ///
    /// Cancels are never gated: a flattening or exiting strategy must still
    /// be able to pull its resting orders.
    pub fn cancel(&self, id: CorrelationId) -> Result<(), SubmitError> {
        let symbol = {
            let mut order = self.pending.get_mut(&id).ok_or(SubmitError::NotPending { id })?;
            order.cancel_requested = true;
            order.symbol
        };
        self.requests
            .enqueue(&OrderRequest::cancel(id, self.strategy_id, symbol, self.clock.now_nanos()));
        self.metrics
            .orders()
            .cancels_total
            .with_label_values(&[self.label.as_str()])
            .inc();
        debug!(strategy_id = self.strategy_id, id = %id, %symbol, "Cancel requested");
        Ok(())
    }

    /// Cancel every pending order without an outstanding cancel. Returns the
    /// number of cancels sent.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|o| !o.cancel_requested)
            .map(|o| o.id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id).is_ok()).count()
    }

    fn emit_plan(&self, intent: &OrderIntent, plan: &OffsetPlan, is_flatten: bool) -> OrderTicket {
        let now_ns = self.clock.now_nanos();
        let mut ticket = OrderTicket {
            legs: Vec::with_capacity(plan.len()),
        };

        for leg in plan.legs() {
            let id = self.ids.next_id();
            // Registered before the request is visible so no response can
            // arrive for an unknown id
            self.pending.insert(
                id,
                PendingOrder {
                    id,
                    symbol: intent.symbol,
                    side: intent.side,
                    offset: leg.offset,
                    price: intent.price,
                    quantity: leg.quantity,
                    leaves: leg.quantity,
                    reservation: leg.reservation,
                    is_flatten,
                    acked: false,
                    cancel_requested: false,
                },
            );

            let request = OrderRequest::new_order(
                id,
                self.strategy_id,
                intent.symbol,
                intent.exchange,
                intent.side,
                leg.offset,
                leg.quantity,
                intent.price,
                intent.order_type,
                intent.tif,
                now_ns,
            );
            self.requests.enqueue(&request);
            self.metrics
                .orders()
                .submitted_total
                .with_label_values(&[self.label.as_str(), leg.offset.as_str()])
                .inc();
            debug!(
                strategy_id = self.strategy_id,
                id = %id,
                symbol = %intent.symbol,
                side = %intent.side,
                offset = %leg.offset,
                quantity = leg.quantity,
                price = intent.price,
                is_flatten,
                "Order enqueued"
            );

            ticket.legs.push(TicketLeg {
                id,
                offset: leg.offset,
                quantity: leg.quantity,
            });
        }
        ticket
    }

    fn release_plan(&self, symbol: &Symbol, plan: &OffsetPlan) {
        for leg in plan.legs() {
            self.ledger.release(*symbol, &leg.reservation);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Apply one response. Returns false for responses to other clients'
    /// orders, which every trader on the response queue also sees.
    pub fn on_response(&self, response: &OrderResponse) -> bool {
        let id = response.id();
        if !self.ids.owns(id) {
            return false;
        }

        match response.kind() {
            Some(ResponseKind::Ack) => {
                if let Some(mut order) = self.pending.get_mut(&id) {
                    order.acked = true;
                } else {
                    debug!(id = %id, "Ack for order no longer pending");
                }
            }
            Some(ResponseKind::Fill) => self.handle_fill(response),
            Some(ResponseKind::Reject) => self.handle_reject(response),
            Some(ResponseKind::CancelConfirm) => self.handle_cancel_confirm(response),
            Some(ResponseKind::CancelReject) => {
                if let Some(mut order) = self.pending.get_mut(&id) {
                    order.cancel_requested = false;
                }
                warn!(
                    strategy_id = self.strategy_id,
                    id = %id,
                    reason = %response.reject_reason(),
                    "Cancel rejected"
                );
            }
            None => {
                warn!(id = %id, kind = response.kind, "Response with unknown kind");
                return false;
            }
        }

        self.risk_check();
        true
    }

    fn handle_fill(&self, response: &OrderResponse) {
        let id = response.id();
        let Some(mut order) = self.pending.get(&id).map(|o| *o) else {
            error!(
                strategy_id = self.strategy_id,
                id = %id,
                symbol = %response.symbol,
                quantity = response.quantity,
                "Fill for unknown order, ledger not updated"
            );
            return;
        };

        let quantity = response.quantity.min(order.leaves);
        if response.quantity > order.leaves {
            error!(
                id = %id,
                filled = response.quantity,
                leaves = order.leaves,
                "Fill exceeds working quantity"
            );
        }
        let multiplier = self
            .instruments
            .get(&order.symbol)
            .map(|s| s.multiplier)
            .unwrap_or(1.0);

        // The exchange decides which bucket a close comes out of
        let offset = match response.offset() {
            OffsetFlag::Unknown => order.offset,
            applied => applied,
        };
        if offset != order.offset {
            warn!(
                strategy_id = self.strategy_id,
                id = %id,
                symbol = %order.symbol,
                requested = %order.offset,
                applied = %offset,
                "Exchange applied a different offset"
            );
        }

        let fill = Fill {
            symbol: order.symbol,
            side: order.side,
            offset,
            quantity: quantity as u64,
            price: response.price,
            multiplier,
        };
        let effect = self.ledger.apply_fill(&fill, &mut order.reservation);
        order.leaves -= quantity;

        if order.leaves == 0 {
            self.pending.remove(&id);
            self.ledger.release(order.symbol, &order.reservation);
        } else if let Some(mut working) = self.pending.get_mut(&id) {
            working.leaves = order.leaves;
            working.reservation = order.reservation;
        }

        let orders = self.metrics.orders();
        orders
            .fills_total
            .with_label_values(&[self.label.as_str(), order.side.to_string().as_str()])
            .inc();
        orders
            .net_position
            .with_label_values(&[self.label.as_str(), order.symbol.as_str()])
            .set(effect.net_after);
        orders
            .realized_pnl
            .with_label_values(&[self.label.as_str()])
            .set(self.realized_pnl());

        info!(
            strategy_id = self.strategy_id,
            id = %id,
            symbol = %order.symbol,
            side = %order.side,
            %offset,
            quantity,
            price = response.price,
            leaves = order.leaves,
            net = effect.net_after,
            realized = effect.realized_pnl,
            "Fill booked"
        );
        self.sink.on_fill_or_reject(response);
    }

    fn handle_reject(&self, response: &OrderResponse) {
        let id = response.id();
        let rejects = self.reject_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics
            .orders()
            .rejects_total
            .with_label_values(&[self.label.as_str()])
            .inc();

        match self.pending.remove(&id) {
            Some((_, order)) => {
                self.ledger.release(order.symbol, &order.reservation);
                warn!(
                    strategy_id = self.strategy_id,
                    id = %id,
                    symbol = %order.symbol,
                    side = %order.side,
                    offset = %order.offset,
                    quantity = order.quantity,
                    reason = %response.reject_reason(),
                    rejects,
                    "Order rejected"
                );
            }
            None => warn!(id = %id, reason = %response.reject_reason(), "Reject for unknown order"),
        }
        self.sink.on_fill_or_reject(response);
    }

    fn handle_cancel_confirm(&self, response: &OrderResponse) {
        let id = response.id();
        match self.pending.remove(&id) {
            Some((_, order)) => {
                self.ledger.release(order.symbol, &order.reservation);
                info!(
                    strategy_id = self.strategy_id,
                    id = %id,
                    symbol = %order.symbol,
                    unfilled = response.quantity,
                    "Order cancelled"
                );
            }
            None => debug!(id = %id, "Cancel confirm for order no longer pending"),
        }
    }

    /// Drain the response queue
    ///
    /// A gap means fills may have been lost and the ledger can no longer be
    /// trusted; with `exit_on_response_gap` the strategy exits.
    pub fn poll_responses(&self, reader: &mut MwmrReader<OrderResponse>) -> usize {
        let mut handled = 0;
        for _ in 0..RESPONSE_BATCH {
            match reader.try_dequeue() {
                Ok(Some(response)) => {
                    if self.on_response(&response) {
                        handled += 1;
                    }
                }
                Ok(None) => break,
                Err(gap) => self.on_response_gap(&gap),
            }
        }
        handled
    }

    fn on_response_gap(&self, gap: &TransportGap) {
        self.response_gaps.fetch_add(1, Ordering::Relaxed);
        error!(
            strategy_id = self.strategy_id,
            queue = gap.queue,
            expected = gap.expected,
            found = gap.found,
            missed = gap.missed,
            pending = self.pending.len(),
            "Order responses lost, ledger may be out of sync"
        );
        if self.exit_on_response_gap {
            if let Err(e) = self.request_exit(FlattenReason::TransportGap, false) {
                warn!(error = %e, "Exit after response gap refused");
            }
        }
    }

    /// Record the latest quote for a traded instrument
    pub fn on_market_tick(&self, tick: &MarketTick) {
        if self.instruments.contains_key(&tick.symbol) {
            self.quotes.insert(tick.symbol, Quote::from_tick(tick));
        }
    }

    // ------------------------------------------------------------------------
    // Risk and control
    // ------------------------------------------------------------------------

    /// Current P&L and exposure over this strategy's instruments
    pub fn risk_snapshot(&self) -> RiskSnapshot {
        let mut realized = 0.0;
        let mut unrealized = 0.0;
        let mut max_abs_position = 0;
        let mut at_price_limit = false;

        for spec in self.instruments.values() {
            let Some(entry) = self.ledger.get(&spec.symbol) else {
                continue;
            };
            realized += entry.realized_pnl;
            let quote = self.quote(&spec.symbol);
            if let Some(mark) = quote.and_then(|q| q.mark()) {
                unrealized += entry.unrealized_pnl(mark, spec.multiplier);
            }
            max_abs_position = max_abs_position.max(entry.net().abs());
            if !entry.is_flat() && quote.is_some_and(|q| q.at_limit) {
                at_price_limit = true;
            }
        }

        let mut snapshot = RiskSnapshot::new(realized, unrealized, self.reject_count());
        snapshot.max_abs_position = max_abs_position;
        snapshot.at_price_limit = at_price_limit;
        snapshot
    }

    /// Evaluate limits, route the result through the control state machine,
    /// attempt recovery or exit completion, and drive flattening
    pub fn risk_check(&self) -> RiskAction {
        let snapshot = self.risk_snapshot();
        let action = evaluate(&self.limits, &snapshot);
        let now = self.clock.now();
        let flat = self.is_flat();
        let pending = self.pending.len();

        let (before, after, flattening) = {
            let mut control = self.control.lock();
            let before = control.kind();
            match action {
                RiskAction::Exit(reason) => {
                    if !control.is_exiting() && !control.is_stopped() {
                        error!(
                            strategy_id = self.strategy_id,
                            %reason,
                            realized = snapshot.realized,
                            unrealized = snapshot.unrealized,
                            net = snapshot.net,
                            rejects = snapshot.reject_count,
                            "Risk limit breached, exiting"
                        );
                        if let Err(e) = control.trigger_exit(reason, false, now) {
                            warn!(error = %e, "Exit refused");
                        }
                    }
                }
                RiskAction::Flatten(reason) => {
                    if before == PhaseKind::Active {
                        warn!(
                            strategy_id = self.strategy_id,
                            %reason,
                            realized = snapshot.realized,
                            unrealized = snapshot.unrealized,
                            net = snapshot.net,
                            max_abs_position = snapshot.max_abs_position,
                            "Risk limit breached, flattening"
                        );
                        if let Err(e) = control.trigger_flatten(reason, false, now) {
                            warn!(error = %e, "Flatten refused");
                        }
                    }
                }
                RiskAction::None => {}
            }

            // Recovery is attempted whatever the limits say; a breach that
            // persists after recovery flattens again on the next check
            if before == PhaseKind::Flattening && matches!(control.phase(), ControlPhase::Flattening { .. }) {
                if let Err(e) = control.try_recover(now, flat) {
                    debug!(strategy_id = self.strategy_id, error = %e, "Not recovered yet");
                }
            }

            if control.is_exiting() {
                if let Err(e) = control.complete_exit(now, flat, pending) {
                    debug!(strategy_id = self.strategy_id, error = %e, "Exit not complete yet");
                }
            }
            (before, control.kind(), control.is_flattening())
        };

        if before != after {
            self.record_transition(after);
        }
        if flattening {
            self.execute_flatten();
        }
        action
    }

    /// Cancel resting orders and send closing orders for every open book
    ///
    /// At most one flatten order is outstanding per instrument and side.
    /// Flatten orders bypass the send gate. Returns the number of closing
    /// orders sent.
    pub fn execute_flatten(&self) -> usize {
        let aggressive = {
            let control = self.control.lock();
            if !control.is_flattening() {
                return 0;
            }
            control.flatten_aggressive()
        };

        let resting: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|o| !o.is_flatten && !o.cancel_requested)
            .map(|o| o.id)
            .collect();
        for id in resting {
            if let Err(e) = self.cancel(id) {
                debug!(id = %id, error = %e, "Resting order already gone");
            }
        }

        let mut sent = 0;
        for spec in self.instruments.values() {
            let Some(entry) = self.ledger.get(&spec.symbol) else {
                continue;
            };
            for side in [Side::Sell, Side::Buy] {
                let book = entry.closable_book(side);
                let closable = book.available_today() + book.available_yesterday();
                if closable == 0 || self.has_flatten_order(&spec.symbol, side) {
                    continue;
                }
                let Some(price) = self.flatten_price(spec, side, aggressive) else {
                    warn!(
                        strategy_id = self.strategy_id,
                        symbol = %spec.symbol,
                        %side,
                        closable,
                        "No quote to price flatten order"
                    );
                    continue;
                };

                let quantity = u32::try_from(closable).unwrap_or(u32::MAX);
                let intent = OrderIntent::limit(spec.symbol, spec.exchange, side, quantity, price);
                // Split so the whole closable volume goes out as close legs
                let plan = self.ledger.resolve(&intent, SplitPolicy::Split);
                if plan.open_quantity() > 0 {
                    self.release_plan(&spec.symbol, &plan);
                    continue;
                }

                let ticket = self.emit_plan(&intent, &plan, true);
                self.metrics
                    .orders()
                    .flatten_orders_total
                    .with_label_values(&[self.label.as_str()])
                    .inc_by(ticket.len() as u64);
                info!(
                    strategy_id = self.strategy_id,
                    symbol = %spec.symbol,
                    %side,
                    quantity,
                    price,
                    aggressive,
                    legs = ticket.len(),
                    "Flatten order sent"
                );
                sent += ticket.len();
            }
        }
        sent
    }

    fn has_flatten_order(&self, symbol: &Symbol, side: Side) -> bool {
        self.pending
            .iter()
            .any(|o| o.is_flatten && &o.symbol == symbol && o.side == side)
    }

    fn flatten_price(&self, spec: &InstrumentSpec, side: Side, aggressive: bool) -> Option<f64> {
        let quote = self.quote(&spec.symbol)?;
        let price = match (side, aggressive) {
            (Side::Sell, true) => quote.bid.map(|b| b - spec.tick_size),
            (Side::Buy, true) => quote.ask.map(|a| a + spec.tick_size),
            (Side::Sell, false) => quote.ask,
            (Side::Buy, false) => quote.bid,
        };
        price
            .or_else(|| (quote.last > 0.0).then_some(quote.last))
            .filter(|p| *p > 0.0)
    }

    fn record_transition(&self, to: PhaseKind) {
        self.metrics
            .orders()
            .transitions_total
            .with_label_values(&[self.label.as_str(), to.as_str()])
            .inc();
    }

    /// Grant manual permission to trade
    pub fn activate(&self) -> Result<(), ControlError> {
        self.control.lock().activate()
    }

    pub fn deactivate(&self) {
        self.control.lock().deactivate();
    }

    /// Manually enter flatten mode
    pub fn flatten(&self, reason: FlattenReason, aggressive: bool) -> Result<(), ControlError> {
        self.control
            .lock()
            .trigger_flatten(reason, aggressive, self.clock.now())?;
        self.record_transition(PhaseKind::Flattening);
        self.execute_flatten();
        Ok(())
    }

    /// Begin an irreversible exit. Repeating it while exiting is a no-op.
    pub fn request_exit(&self, reason: FlattenReason, aggressive: bool) -> Result<(), ControlError> {
        let changed = {
            let mut control = self.control.lock();
            let was_exiting = control.is_exiting();
            control.trigger_exit(reason, aggressive, self.clock.now())?;
            !was_exiting
        };
        if changed {
            self.record_transition(PhaseKind::Exiting);
        }
        self.risk_check();
        Ok(())
    }

    /// Start a new trading day: today's volume and reservations become
    /// yesterday's
    ///
    /// Working CLOSE_TODAY orders are cancelled: the lots they target are
    /// now yesterday's, so a later fill under that flag would find nothing
    /// to close. A fill racing the cancel is clamped by the ledger.
    pub fn roll_day(&self) {
        self.ledger.roll_day();
        let mut stale = Vec::new();
        for mut order in self.pending.iter_mut() {
            order.reservation.roll_day();
            if order.offset == OffsetFlag::CloseToday && !order.cancel_requested {
                stale.push(order.id);
            }
        }
        let cancelled = stale.into_iter().filter(|id| self.cancel(*id).is_ok()).count();
        info!(
            strategy_id = self.strategy_id,
            pending = self.pending.len(),
            cancelled,
            "Trading day rolled"
        );
    }

    /// Run `risk_check` every configured interval until `shutdown` is set
    pub fn run_risk_loop(&self, shutdown: &AtomicBool) {
        info!(
            strategy_id = self.strategy_id,
            interval_ms = self.risk_check_interval.as_millis() as u64,
            "Risk loop running"
        );
        while !shutdown.load(Ordering::Acquire) {
            self.risk_check();
            if self.is_stopped() {
                info!(strategy_id = self.strategy_id, "Strategy stopped, risk loop exiting");
                break;
            }
            std::thread::sleep(self.risk_check_interval);
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn strategy_id(&self) -> i32 {
        self.strategy_id
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn instrument(&self, symbol: &Symbol) -> Result<&InstrumentSpec, SubmitError> {
        self.instruments
            .get(symbol)
            .ok_or(SubmitError::UnknownInstrument { symbol: *symbol })
    }

    /// Copy of the control state
    pub fn control(&self) -> StrategyControl {
        self.control.lock().clone()
    }

    pub fn phase(&self) -> PhaseKind {
        self.control.lock().kind()
    }

    pub fn can_send_new_orders(&self) -> bool {
        self.control.lock().can_send_new_orders()
    }

    pub fn is_stopped(&self) -> bool {
        self.control.lock().is_stopped()
    }

    pub fn quote(&self, symbol: &Symbol) -> Option<Quote> {
        self.quotes.get(symbol).map(|q| *q)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_order(&self, id: CorrelationId) -> Option<PendingOrder> {
        self.pending.get(&id).map(|o| *o)
    }

    pub fn reject_count(&self) -> u32 {
        self.reject_count.load(Ordering::Relaxed)
    }

    pub fn response_gaps(&self) -> u64 {
        self.response_gaps.load(Ordering::Relaxed)
    }

    /// Every traded instrument is flat
    pub fn is_flat(&self) -> bool {
        self.instruments.keys().all(|s| self.ledger.is_flat(s))
    }

    /// Realized P&L over this strategy's instruments
    pub fn realized_pnl(&self) -> f64 {
        self.instruments
            .keys()
            .filter_map(|s| self.ledger.get(s))
            .map(|e| e.realized_pnl)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::data::types::BookLevel;
    use crate::execution::types::{RejectReason, RequestKind};
    use crate::shm::mwmr::MwmrQueue;
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(AtomicUsize);

    impl OrderEventSink for CountingSink {
        fn on_fill_or_reject(&self, _response: &OrderResponse) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Rig {
        coordinator: OrderCoordinator,
        requests: MwmrReader<OrderRequest>,
        clock: Arc<ManualClock>,
        sink: Arc<CountingSink>,
    }

    fn rb() -> Symbol {
        Symbol::new("rb2510").unwrap()
    }

    fn rig_with(settings: CoordinatorSettings) -> Rig {
        let queue = MwmrQueue::<OrderRequest>::anonymous(64, "order_request").unwrap();
        let requests = queue.reader();
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let coordinator = OrderCoordinator::new(
            settings,
            Arc::new(PositionLedger::new()),
            queue.writer(),
            OrderIdAllocator::new(3),
            MetricsRegistry::new().unwrap(),
        )
        .with_clock(clock.clone())
        .with_sink(sink.clone());
        Rig {
            coordinator,
            requests,
            clock,
            sink,
        }
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            risk: RiskLimits {
                stop_loss: 1_000.0,
                max_loss: 10_000.0,
                max_rejects: 2,
                max_position: 20,
            },
            instruments: vec![InstrumentSpec::new(rb(), ExchangeId::Shfe, 1.0, 10.0)],
            ..CoordinatorSettings::default()
        }
    }

    fn rig() -> Rig {
        rig_with(settings())
    }

    fn drain(reader: &mut MwmrReader<OrderRequest>) -> Vec<OrderRequest> {
        std::iter::from_fn(|| reader.try_dequeue().unwrap()).collect()
    }

    fn fill(request: &OrderRequest, quantity: u32, price: f64) -> OrderResponse {
        let mut resp = OrderResponse::for_request(request, ResponseKind::Fill, 0);
        resp.quantity = quantity;
        resp.price = price;
        resp.leaves = request.quantity - quantity;
        resp
    }

    fn quote(coordinator: &OrderCoordinator, bid: f64, ask: f64) {
        let tick = MarketTick::quote(rb(), ExchangeId::Shfe, BookLevel::new(bid, 10), BookLevel::new(ask, 10));
        coordinator.on_market_tick(&tick);
    }

    #[test]
    fn test_blocked_intent_is_not_enqueued() {
        let mut rig = rig_with(CoordinatorSettings {
            auto_activate: false,
            ..settings()
        });
        let err = rig
            .coordinator
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 1, 3_500.0))
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Blocked {
                phase: PhaseKind::Active,
                active: false
            }
        );
        assert!(drain(&mut rig.requests).is_empty());
    }

    #[test]
    fn test_open_then_close_round_trip() {
        let mut rig = rig();
        let c = &rig.coordinator;

        let ticket = c
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 5, 3_500.0))
            .unwrap();
        assert_eq!(ticket.len(), 1);
        let reqs = drain(&mut rig.requests);
        assert_eq!(reqs[0].offset(), OffsetFlag::Open);
        assert!(c.on_response(&fill(&reqs[0], 5, 3_500.0)));
        assert_eq!(c.ledger().net_position(&rb()), 5);
        assert_eq!(c.pending_count(), 0);

        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 5, 3_510.0))
            .unwrap();
        let reqs = drain(&mut rig.requests);
        assert_eq!(reqs[0].offset(), OffsetFlag::CloseToday);
        c.on_response(&fill(&reqs[0], 5, 3_510.0));

        let entry = c.ledger().get(&rb()).unwrap();
        assert!(entry.is_flat());
        assert_eq!(entry.long.avg_price, 0.0);
        assert_relative_eq!(c.realized_pnl(), 500.0);
        assert_eq!(rig.sink.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_working_close_reserves_volume() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 4, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 4, 3_500.0));

        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 4, 3_520.0))
            .unwrap();
        // The long volume is frozen by the first sell, so this one opens short
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 2, 3_530.0))
            .unwrap();
        let reqs = drain(&mut rig.requests);
        assert_eq!(reqs[0].offset(), OffsetFlag::CloseToday);
        assert_eq!(reqs[1].offset(), OffsetFlag::Open);
    }

    #[test]
    fn test_partial_fill_keeps_order_pending() {
        let mut rig = rig();
        let c = &rig.coordinator;
        let ticket = c
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 6, 3_500.0))
            .unwrap();
        let reqs = drain(&mut rig.requests);
        c.on_response(&fill(&reqs[0], 2, 3_500.0));

        let id = ticket.legs()[0].id;
        assert_eq!(c.pending_order(id).unwrap().leaves, 4);
        assert_eq!(c.ledger().net_position(&rb()), 2);
    }

    #[test]
    fn test_reject_releases_reservation() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 3, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 3, 3_500.0));

        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 3, 3_490.0))
            .unwrap();
        let close = drain(&mut rig.requests);
        assert_eq!(c.ledger().get(&rb()).unwrap().long.frozen_today, 3);

        let mut reject = OrderResponse::for_request(&close[0], ResponseKind::Reject, 0);
        reject.quantity = 3;
        reject.reject_reason = RejectReason::Exchange as u8;
        c.on_response(&reject);

        assert_eq!(c.ledger().get(&rb()).unwrap().long.frozen_today, 0);
        assert_eq!(c.reject_count(), 1);
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn test_reject_storm_exits_and_stops() {
        let mut rig = rig();
        let c = &rig.coordinator;
        for _ in 0..3 {
            c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 1, 3_500.0))
                .unwrap();
            let reqs = drain(&mut rig.requests);
            let mut reject = OrderResponse::for_request(&reqs[0], ResponseKind::Reject, 0);
            reject.reject_reason = RejectReason::Exchange as u8;
            c.on_response(&reject);
        }
        // Flat with nothing pending: the exit completes immediately
        assert_eq!(c.phase(), PhaseKind::Stopped);
        assert!(c
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 1, 3_500.0))
            .is_err());
    }

    #[test]
    fn test_stop_loss_flattens_and_recovers() {
        let mut rig = rig();
        let c = &rig.coordinator;
        quote(c, 3_500.0, 3_501.0);
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 10, 3_501.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 10, 3_501.0));
        assert_eq!(c.phase(), PhaseKind::Active);

        // 10 lots * 10 multiplier * -20 = -2000 unrealized
        quote(c, 3_480.0, 3_482.0);
        assert_eq!(c.risk_check(), RiskAction::Flatten(FlattenReason::StopLoss));
        assert_eq!(c.phase(), PhaseKind::Flattening);

        let flatten = drain(&mut rig.requests);
        assert_eq!(flatten.len(), 1);
        assert_eq!(flatten[0].side(), Some(Side::Sell));
        assert_eq!(flatten[0].offset(), OffsetFlag::CloseToday);
        // Passive: sell at the ask
        assert_eq!(flatten[0].price, 3_482.0);

        // A second check does not duplicate the flatten order
        c.risk_check();
        assert!(drain(&mut rig.requests).is_empty());

        // Market recovers before the close fills, realized loss stays small
        quote(c, 3_500.0, 3_501.0);
        c.on_response(&fill(&flatten[0], 10, 3_500.0));
        assert!(c.is_flat());
        assert_relative_eq!(c.realized_pnl(), -100.0);
        assert_eq!(c.phase(), PhaseKind::Flattening);

        rig.clock.advance(Duration::from_secs(15 * 60));
        c.risk_check();
        assert_eq!(c.phase(), PhaseKind::Active);
    }

    #[test]
    fn test_realized_stop_loss_recovers_after_cooldown() {
        let mut rig = rig();
        let c = &rig.coordinator;
        quote(c, 3_500.0, 3_501.0);
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 10, 3_501.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 10, 3_501.0));

        quote(c, 3_480.0, 3_482.0);
        c.risk_check();
        let flatten = drain(&mut rig.requests);
        c.on_response(&fill(&flatten[0], 10, 3_480.0));
        assert!(c.is_flat());
        // -21 * 10 lots * 10 multiplier, still past the stop-loss
        assert_relative_eq!(c.realized_pnl(), -2_100.0);

        c.risk_check();
        assert_eq!(c.phase(), PhaseKind::Flattening);

        // The breach persists, but the cooldown has elapsed and the book is flat
        rig.clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(c.risk_check(), RiskAction::Flatten(FlattenReason::StopLoss));
        assert_eq!(c.phase(), PhaseKind::Active);

        // The next check flattens again with a fresh cooldown
        c.risk_check();
        assert_eq!(c.phase(), PhaseKind::Flattening);
        assert!(drain(&mut rig.requests).is_empty());
    }

    #[test]
    fn test_flatten_cancels_resting_orders() {
        let mut rig = rig();
        let c = &rig.coordinator;
        quote(c, 3_500.0, 3_501.0);
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 1, 3_400.0))
            .unwrap();
        drain(&mut rig.requests);

        c.flatten(FlattenReason::Manual, true).unwrap();
        let reqs = drain(&mut rig.requests);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind(), Some(RequestKind::Cancel));
        assert!(c.pending_order(reqs[0].id()).unwrap().cancel_requested);
    }

    #[test]
    fn test_aggressive_flatten_crosses_spread() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 2, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 2, 3_500.0));

        quote(c, 3_500.0, 3_502.0);
        c.flatten(FlattenReason::Manual, true).unwrap();
        let reqs = drain(&mut rig.requests);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].side(), Some(Side::Buy));
        assert_eq!(reqs[0].price, 3_503.0);
    }

    #[test]
    fn test_foreign_responses_ignored() {
        let rig = rig();
        let foreign = OrderRequest::new_order(
            CorrelationId(99 * crate::config::constants::ORDER_ID_RANGE + 1),
            1,
            rb(),
            ExchangeId::Shfe,
            Side::Buy,
            OffsetFlag::Open,
            1,
            3_500.0,
            crate::core::types::OrderType::Limit,
            crate::core::types::TimeInForce::Gfd,
            0,
        );
        assert!(!rig.coordinator.on_response(&fill(&foreign, 1, 3_500.0)));
        assert_eq!(rig.coordinator.ledger().net_position(&rb()), 0);
    }

    #[test]
    fn test_position_limit_blocks_opening() {
        let mut rig = rig();
        let err = rig
            .coordinator
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 21, 3_500.0))
            .unwrap_err();
        assert!(matches!(err, SubmitError::PositionLimit { projected: 21, .. }));
        assert!(drain(&mut rig.requests).is_empty());
    }

    #[test]
    fn test_unknown_instrument_rejected() {
        let rig = rig();
        let other = Symbol::new("hc2510").unwrap();
        assert_eq!(
            rig.coordinator
                .submit(OrderIntent::limit(other, ExchangeId::Shfe, Side::Buy, 1, 3_500.0)),
            Err(SubmitError::UnknownInstrument { symbol: other })
        );
    }

    #[test]
    fn test_response_gap_triggers_exit_when_configured() {
        let rig = rig_with(CoordinatorSettings {
            exit_on_response_gap: true,
            ..settings()
        });
        let responses = MwmrQueue::<OrderResponse>::anonymous(4, "order_response").unwrap();
        let mut reader = responses.reader();
        let writer = responses.writer();
        let template = OrderRequest::cancel(CorrelationId(1), 1, rb(), 0);
        for _ in 0..6 {
            writer.enqueue(&OrderResponse::for_request(&template, ResponseKind::Ack, 0));
        }

        rig.coordinator.poll_responses(&mut reader);
        assert_eq!(rig.coordinator.response_gaps(), 1);
        assert!(matches!(
            rig.coordinator.phase(),
            PhaseKind::Exiting | PhaseKind::Stopped
        ));
    }

    #[test]
    fn test_roll_day_moves_reservations() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 2, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 2, 3_500.0));
        let ticket = c
            .submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 2, 3_600.0))
            .unwrap();

        let close = drain(&mut rig.requests);
        assert_eq!(close[0].offset(), OffsetFlag::CloseToday);

        c.roll_day();
        let id = ticket.legs()[0].id;
        let order = c.pending_order(id).unwrap();
        assert_eq!(order.reservation.today, 0);
        assert_eq!(order.reservation.yesterday, 2);
        assert!(order.cancel_requested);
        let entry = c.ledger().get(&rb()).unwrap();
        assert_eq!(entry.long.frozen_yesterday, 2);

        // The CLOSE_TODAY order no longer has lots to close
        let cancels = drain(&mut rig.requests);
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].kind(), Some(RequestKind::Cancel));
        assert_eq!(cancels[0].id(), id);

        // A second roll does not cancel again
        c.roll_day();
        assert!(drain(&mut rig.requests).is_empty());
    }

    #[test]
    fn test_fill_books_offset_applied_by_exchange() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 2, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 2, 3_500.0));
        c.roll_day();
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 2, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        c.on_response(&fill(&open[0], 2, 3_500.0));
        let long = c.ledger().get(&rb()).unwrap().long;
        assert_eq!((long.today, long.yesterday), (2, 2));

        c.submit(
            OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Sell, 2, 3_510.0).with_offset(OffsetFlag::Close),
        )
        .unwrap();
        let close = drain(&mut rig.requests);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].offset(), OffsetFlag::Close);

        // The exchange booked the trade against today's lots
        let mut resp = fill(&close[0], 2, 3_510.0);
        resp.offset = OffsetFlag::CloseToday as u8;
        c.on_response(&resp);

        let long = c.ledger().get(&rb()).unwrap().long;
        assert_eq!((long.today, long.yesterday), (0, 2));
        assert_eq!((long.frozen_today, long.frozen_yesterday), (0, 0));
        assert_eq!(c.pending_count(), 0);
        assert_relative_eq!(c.realized_pnl(), 200.0);
    }

    #[test]
    fn test_fill_without_offset_uses_requested() {
        let mut rig = rig();
        let c = &rig.coordinator;
        c.submit(OrderIntent::limit(rb(), ExchangeId::Shfe, Side::Buy, 3, 3_500.0))
            .unwrap();
        let open = drain(&mut rig.requests);
        let mut resp = fill(&open[0], 3, 3_500.0);
        resp.offset = OffsetFlag::Unknown as u8;
        c.on_response(&resp);

        let long = c.ledger().get(&rb()).unwrap().long;
        assert_eq!(long.today, 3);
        assert_eq!(c.ledger().net_position(&rb()), 3);
    }
}
