//! Monitoring and observability
//!
//! Prometheus counters and gauges for the transport and order lifecycle.
//! Binaries render them periodically through the log; there is no scrape
//! endpoint.

pub mod metrics;

pub use metrics::{MetricsRegistry, OrderMetrics, QueueCounters, TransportMetrics};
