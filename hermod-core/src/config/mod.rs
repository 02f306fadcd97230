pub mod constants;
pub mod profiles;
pub mod types;

pub use profiles::{ConfigProfile, ProfileName};
pub use types::*;

use anyhow::{bail, Context, Result};
use std::path::Path;

impl HermodConfig {
    /// Load configuration from a JSON file; absent fields take defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: HermodConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for (name, queue) in [
            ("market_data", &self.transport.market_data),
            ("order_request", &self.transport.order_request),
            ("order_response", &self.transport.order_response),
        ] {
            if queue.capacity == 0 {
                bail!("transport.{}.capacity must be > 0", name);
            }
            if let Some(slot) = queue.slot_size {
                if slot % 8 != 0 {
                    bail!("transport.{}.slot_size must be a multiple of 8", name);
                }
            }
        }
        if self.transport.order_request.key == self.transport.order_response.key {
            bail!("order request and response queues must use different keys");
        }

        for spec in &self.strategy.instruments {
            if !(spec.tick_size > 0.0 && spec.tick_size.is_finite()) {
                bail!("instrument {} has invalid tick_size {}", spec.symbol, spec.tick_size);
            }
            if !(spec.multiplier > 0.0 && spec.multiplier.is_finite()) {
                bail!("instrument {} has invalid multiplier {}", spec.symbol, spec.multiplier);
            }
        }

        self.risk.validate()?;

        if self.control.risk_check_interval_ms == 0 {
            bail!("control.risk_check_interval_ms must be > 0");
        }
        if !(0.0..=1.0).contains(&self.gateway.reject_probability) {
            bail!("gateway.reject_probability must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.gateway.fill_probability) {
            bail!("gateway.fill_probability must be within [0, 1]");
        }
        Ok(())
    }
}
