use super::constants::*;
use crate::core::control_fsm::CooldownTable;
use crate::core::types::InstrumentSpec;
use crate::engine::risk::RiskLimits;
use crate::position::offset::SplitPolicy;
use crate::shm::segment::ShmKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HermodConfig {
    pub transport: TransportConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskLimits,
    pub control: ControlConfig,
    pub gateway: GatewayConfig,
    pub monitoring: MonitoringConfig,
}

/// One shared-memory queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub key: ShmKey,

    /// Slot count; rounded up to a power of two
    #[serde(default = "default_queue_size")]
    pub capacity: usize,

    /// Slot stride override for peers built with different packing
    #[serde(default)]
    pub slot_size: Option<usize>,
}

impl QueueConfig {
    pub fn new(key: ShmKey, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            slot_size: None,
        }
    }
}

/// Shared-memory endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub market_data: QueueConfig,
    pub order_request: QueueConfig,
    pub order_response: QueueConfig,
    pub client_store: ShmKey,
    pub first_client_id: i64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            market_data: QueueConfig::new(ShmKey::dev_shm(MD_SEGMENT_NAME), DEFAULT_MD_QUEUE_SIZE),
            order_request: QueueConfig::new(ShmKey::SysV(REQUEST_QUEUE_KEY), DEFAULT_QUEUE_SIZE),
            order_response: QueueConfig::new(ShmKey::SysV(RESPONSE_QUEUE_KEY), DEFAULT_QUEUE_SIZE),
            client_store: ShmKey::SysV(CLIENT_STORE_KEY),
            first_client_id: FIRST_CLIENT_ID,
        }
    }
}

/// Per-strategy coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub strategy_id: i32,

    /// Whether one intent may be split into close and open legs
    pub split_policy: SplitPolicy,

    /// Treat a gap on the response queue as fatal for the strategy
    pub exit_on_response_gap: bool,

    /// Tradable instruments with tick size and multiplier
    pub instruments: Vec<InstrumentSpec>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy_id: 1,
            split_policy: SplitPolicy::default(),
            exit_on_response_gap: false,
            instruments: Vec::new(),
        }
    }
}

/// Control state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Start with trading permission granted; live setups activate manually
    pub auto_activate: bool,
    pub cooldowns: CooldownTable,
    pub risk_check_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            auto_activate: true,
            cooldowns: CooldownTable::default(),
            risk_check_interval_ms: RISK_CHECK_INTERVAL_MS,
        }
    }
}

/// Gateway worker and simulated connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Probability that the simulated exchange rejects a new order
    pub reject_probability: f64,

    /// Probability that a working order trades on a given poll
    pub fill_probability: f64,

    /// Largest lot count filled per simulated execution report (0 = all at once)
    pub fill_chunk: u32,

    /// RNG seed for reproducible simulations
    pub seed: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reject_probability: 0.05,
            fill_probability: 1.0,
            fill_chunk: 0,
            seed: None,
        }
    }
}

/// Logging, journal and persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,

    /// JSONL order event journal
    pub journal_path: Option<PathBuf>,

    /// Position snapshot written on shutdown and restored on start
    pub snapshot_path: Option<PathBuf>,

    /// Interval for logging the metrics text dump (0 disables)
    pub metrics_log_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            journal_path: None,
            snapshot_path: None,
            metrics_log_secs: 0,
        }
    }
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
