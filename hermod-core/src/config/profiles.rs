//! Configuration profiles for different environments
//!
//! - Development: simulated gateway with a fixed seed, debug logging,
//!   strategies activate themselves
//! - Production: manual activation, structured logs, journal and position
//!   snapshot enabled

use super::types::*;
use crate::core::types::{ExchangeId, InstrumentSpec, Symbol};
use crate::engine::risk::RiskLimits;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration profile name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileName {
    /// Local testing against the simulated exchange
    Development,
    /// Live trading
    Production,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            other => Err(format!("unknown profile '{}'", other)),
        }
    }
}

/// Configuration profile with environment-specific defaults
pub struct ConfigProfile;

impl ConfigProfile {
    /// Development configuration
    ///
    /// Small risk limits and a reproducible simulated exchange.
    pub fn development() -> HermodConfig {
        let mut cfg = HermodConfig::default();
        cfg.risk = RiskLimits {
            stop_loss: 2_000.0,
            max_loss: 10_000.0,
            max_rejects: 20,
            max_position: 10,
        };
        cfg.strategy.instruments = [
            ("rb2510", ExchangeId::Shfe, 1.0, 10.0),
            ("ag2512", ExchangeId::Shfe, 1.0, 15.0),
            ("m2509", ExchangeId::Dce, 1.0, 10.0),
        ]
        .into_iter()
        .filter_map(|(code, exchange, tick, multiplier)| {
            Symbol::new(code)
                .ok()
                .map(|symbol| InstrumentSpec::new(symbol, exchange, tick, multiplier))
        })
        .collect();
        cfg.gateway.seed = Some(7);
        cfg.gateway.reject_probability = 0.02;
        cfg.gateway.fill_chunk = 2;
        cfg.monitoring.log_level = "debug".to_string();
        cfg.monitoring.journal_path = Some(PathBuf::from("./dev-data/orders.jsonl"));
        cfg.monitoring.metrics_log_secs = 10;
        cfg
    }

    /// Production configuration
    ///
    /// Strategies wait for manual activation; a response gap is fatal.
    pub fn production() -> HermodConfig {
        let mut cfg = HermodConfig::default();
        cfg.strategy.exit_on_response_gap = true;
        cfg.control.auto_activate = false;
        cfg.gateway.reject_probability = 0.0;
        cfg.monitoring.log_level = "info".to_string();
        cfg.monitoring.json_logs = true;
        cfg.monitoring.journal_path = Some(PathBuf::from("/var/lib/hermod/orders.jsonl"));
        cfg.monitoring.snapshot_path = Some(PathBuf::from("/var/lib/hermod/positions.json"));
        cfg.monitoring.metrics_log_secs = 60;
        cfg
    }

    /// Load profile by name
    pub fn load(profile: ProfileName) -> HermodConfig {
        match profile {
            ProfileName::Development => Self::development(),
            ProfileName::Production => Self::production(),
        }
    }

    /// Load profile from environment variable HERMOD_PROFILE
    pub fn from_env() -> HermodConfig {
        let profile = std::env::var("HERMOD_PROFILE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ProfileName::Development);

        Self::load(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_name_from_str() {
        assert_eq!("dev".parse(), Ok(ProfileName::Development));
        assert_eq!("Production".parse(), Ok(ProfileName::Production));
        assert!("staging".parse::<ProfileName>().is_err());
    }

    #[test]
    fn test_development_profile() {
        let config = ConfigProfile::development();
        assert_eq!(config.gateway.seed, Some(7));
        assert_eq!(config.monitoring.log_level, "debug");
        assert!(config.control.auto_activate);
        assert_eq!(config.risk.max_position, 10);
        assert_eq!(config.strategy.instruments.len(), 3);
        assert_eq!(config.strategy.instruments[0].symbol.as_str(), "rb2510");
    }

    #[test]
    fn test_production_profile() {
        let config = ConfigProfile::production();
        assert!(!config.control.auto_activate);
        assert!(config.strategy.exit_on_response_gap);
        assert!(config.monitoring.json_logs);
        assert!(config.monitoring.snapshot_path.is_some());
    }

    #[test]
    fn test_profile_validation() {
        assert!(ConfigProfile::development().validate().is_ok());
        assert!(ConfigProfile::production().validate().is_ok());
    }
}
