//! Prometheus metrics for the transport and order lifecycle
//!
//! Provides metrics for:
//! - Queue traffic and sequence gaps, per queue
//! - Market-data source gaps
//! - Order submission, fills, rejects and flatten activity, per strategy
//! - Position and P&L gauges
//!
//! Every process owns its own [`MetricsRegistry`]; nothing is registered
//! globally, so tests never see each other's counters.

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    transport: Arc<TransportMetrics>,
    orders: Arc<OrderMetrics>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metric families
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let transport = Arc::new(TransportMetrics::new(&registry)?);
        let orders = Arc::new(OrderMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            transport,
            orders,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &TransportMetrics {
        &self.transport
    }

    pub fn orders(&self) -> &OrderMetrics {
        &self.orders
    }

    /// Render every metric family in the text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared-memory queue metrics
pub struct TransportMetrics {
    /// Messages written, by queue
    pub enqueued_total: IntCounterVec,
    /// Messages read, by queue
    pub dequeued_total: IntCounterVec,
    /// Gap events observed by readers, by queue
    pub gaps_total: IntCounterVec,
    /// Messages lost to gaps, by queue
    pub missed_total: IntCounterVec,
    /// Gaps in the market-data source sequence, by feed
    pub source_gaps_total: IntCounterVec,
}

impl TransportMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let enqueued_total = IntCounterVec::new(
            Opts::new("transport_enqueued_total", "Messages written to a queue")
                .namespace("hermod"),
            &["queue"],
        )?;
        registry.register(Box::new(enqueued_total.clone()))?;

        let dequeued_total = IntCounterVec::new(
            Opts::new("transport_dequeued_total", "Messages read from a queue")
                .namespace("hermod"),
            &["queue"],
        )?;
        registry.register(Box::new(dequeued_total.clone()))?;

        let gaps_total = IntCounterVec::new(
            Opts::new("transport_gaps_total", "Sequence gaps observed by queue readers")
                .namespace("hermod"),
            &["queue"],
        )?;
        registry.register(Box::new(gaps_total.clone()))?;

        let missed_total = IntCounterVec::new(
            Opts::new(
                "transport_missed_total",
                "Messages overwritten before a reader could see them",
            )
            .namespace("hermod"),
            &["queue"],
        )?;
        registry.register(Box::new(missed_total.clone()))?;

        let source_gaps_total = IntCounterVec::new(
            Opts::new(
                "feed_source_gaps_total",
                "Gaps in the market data source sequence",
            )
            .namespace("hermod"),
            &["feed"],
        )?;
        registry.register(Box::new(source_gaps_total.clone()))?;

        Ok(Self {
            enqueued_total,
            dequeued_total,
            gaps_total,
            missed_total,
            source_gaps_total,
        })
    }

    /// Resolve the per-queue counters once so hot paths skip label lookup
    pub fn queue(&self, label: &str) -> QueueCounters {
        QueueCounters {
            enqueued: self.enqueued_total.with_label_values(&[label]),
            dequeued: self.dequeued_total.with_label_values(&[label]),
            gaps: self.gaps_total.with_label_values(&[label]),
            missed: self.missed_total.with_label_values(&[label]),
        }
    }
}

/// Pre-resolved counters for one queue
#[derive(Clone)]
pub struct QueueCounters {
    pub enqueued: IntCounter,
    pub dequeued: IntCounter,
    pub gaps: IntCounter,
    pub missed: IntCounter,
}

impl QueueCounters {
    #[inline]
    pub fn record_gap(&self, missed: u64) {
        self.gaps.inc();
        self.missed.inc_by(missed);
    }
}

/// Order lifecycle metrics
pub struct OrderMetrics {
    /// Orders put on the request queue, by strategy and offset flag
    pub submitted_total: IntCounterVec,
    /// Intents dropped by the send gate, by strategy and phase
    pub blocked_total: IntCounterVec,
    /// Fills received, by strategy and side
    pub fills_total: IntCounterVec,
    /// Rejects received, by strategy
    pub rejects_total: IntCounterVec,
    /// Cancel requests sent, by strategy
    pub cancels_total: IntCounterVec,
    /// Closing orders emitted while flattening, by strategy
    pub flatten_orders_total: IntCounterVec,
    /// Control phase changes, by strategy and target phase
    pub transitions_total: IntCounterVec,
    /// Net position in lots, by strategy and instrument
    pub net_position: IntGaugeVec,
    /// Realized P&L, by strategy
    pub realized_pnl: GaugeVec,
}

impl OrderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let submitted_total = IntCounterVec::new(
            Opts::new("orders_submitted_total", "Orders enqueued for the gateway")
                .namespace("hermod"),
            &["strategy", "offset"],
        )?;
        registry.register(Box::new(submitted_total.clone()))?;

        let blocked_total = IntCounterVec::new(
            Opts::new("orders_blocked_total", "Intents dropped by the send gate")
                .namespace("hermod"),
            &["strategy", "phase"],
        )?;
        registry.register(Box::new(blocked_total.clone()))?;

        let fills_total = IntCounterVec::new(
            Opts::new("orders_fills_total", "Fill notifications received")
                .namespace("hermod"),
            &["strategy", "side"],
        )?;
        registry.register(Box::new(fills_total.clone()))?;

        let rejects_total = IntCounterVec::new(
            Opts::new("orders_rejects_total", "Reject notifications received")
                .namespace("hermod"),
            &["strategy"],
        )?;
        registry.register(Box::new(rejects_total.clone()))?;

        let cancels_total = IntCounterVec::new(
            Opts::new("orders_cancels_total", "Cancel requests enqueued")
                .namespace("hermod"),
            &["strategy"],
        )?;
        registry.register(Box::new(cancels_total.clone()))?;

        let flatten_orders_total = IntCounterVec::new(
            Opts::new(
                "orders_flatten_total",
                "Closing orders emitted while flattening",
            )
            .namespace("hermod"),
            &["strategy"],
        )?;
        registry.register(Box::new(flatten_orders_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new("control_transitions_total", "Strategy control phase changes")
                .namespace("hermod"),
            &["strategy", "phase"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let net_position = IntGaugeVec::new(
            Opts::new("position_net_lots", "Net position in lots").namespace("hermod"),
            &["strategy", "symbol"],
        )?;
        registry.register(Box::new(net_position.clone()))?;

        let realized_pnl = GaugeVec::new(
            Opts::new("position_realized_pnl", "Realized P&L").namespace("hermod"),
            &["strategy"],
        )?;
        registry.register(Box::new(realized_pnl.clone()))?;

        Ok(Self {
            submitted_total,
            blocked_total,
            fills_total,
            rejects_total,
            cancels_total,
            flatten_orders_total,
            transitions_total,
            net_position,
            realized_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();
        a.transport().queue("order_request").gaps.inc();
        assert_eq!(a.transport().gaps_total.with_label_values(&["order_request"]).get(), 1);
        assert_eq!(b.transport().gaps_total.with_label_values(&["order_request"]).get(), 0);
    }

    #[test]
    fn test_queue_counters_record_gap() {
        let m = MetricsRegistry::new().unwrap();
        let q = m.transport().queue("md");
        q.record_gap(5);
        q.record_gap(2);
        assert_eq!(q.gaps.get(), 2);
        assert_eq!(q.missed.get(), 7);
    }

    #[test]
    fn test_gather_text_contains_namespace() {
        let m = MetricsRegistry::new().unwrap();
        m.orders().rejects_total.with_label_values(&["1"]).inc();
        let text = m.gather_text().unwrap();
        assert!(text.contains("hermod_orders_rejects_total"));
    }
}
