//! Strategy Risk Evaluation
//!
//! Two layers:
//! - Pre-trade: every intent is checked before it is resolved and enqueued
//! - Periodic: [`evaluate`] turns a P&L / exposure snapshot into an action
//!   that the coordinator routes through the control state machine
//!
//! Breaches that can heal (stop loss, price limit, delta) flatten with a
//! cooldown; breaches that cannot (max loss, reject storm) exit for good.
//! When both apply, exit wins.

use crate::config::constants::MAX_REJECTS;
use crate::core::control_fsm::FlattenReason;
use crate::core::errors::SubmitError;
use crate::core::types::OrderType;
use crate::position::offset::{OffsetPlan, OrderIntent};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Loss and exposure limits for one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Flatten when unrealized or net P&L drops below `-stop_loss`
    pub stop_loss: f64,

    /// Exit when net P&L drops below `-max_loss`
    pub max_loss: f64,

    /// Exit when more orders than this have been rejected
    pub max_rejects: u32,

    /// Largest absolute net position per instrument, in lots
    pub max_position: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            stop_loss: 100_000.0,
            max_loss: 100_000.0,
            max_rejects: MAX_REJECTS,
            max_position: 100,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<()> {
        if !(self.stop_loss > 0.0 && self.stop_loss.is_finite()) {
            bail!("risk.stop_loss must be a positive number");
        }
        if !(self.max_loss > 0.0 && self.max_loss.is_finite()) {
            bail!("risk.max_loss must be a positive number");
        }
        if self.max_position <= 0 {
            bail!("risk.max_position must be > 0");
        }
        Ok(())
    }
}

/// Inputs to a periodic risk evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiskSnapshot {
    pub realized: f64,
    pub unrealized: f64,
    /// `realized + unrealized`
    pub net: f64,
    pub reject_count: u32,
    /// Largest absolute net position across instruments
    pub max_abs_position: i64,
    /// An instrument with open volume is quoted at its limit price
    pub at_price_limit: bool,
}

impl RiskSnapshot {
    pub fn new(realized: f64, unrealized: f64, reject_count: u32) -> Self {
        Self {
            realized,
            unrealized,
            net: realized + unrealized,
            reject_count,
            max_abs_position: 0,
            at_price_limit: false,
        }
    }
}

/// What the coordinator should do after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAction {
    None,
    Flatten(FlattenReason),
    Exit(FlattenReason),
}

/// Evaluate a snapshot against limits
#[inline]
pub fn evaluate(limits: &RiskLimits, snapshot: &RiskSnapshot) -> RiskAction {
    if snapshot.net < -limits.max_loss {
        return RiskAction::Exit(FlattenReason::MaxLoss);
    }
    if snapshot.reject_count > limits.max_rejects {
        return RiskAction::Exit(FlattenReason::RejectLimit);
    }
    if snapshot.unrealized < -limits.stop_loss || snapshot.net < -limits.stop_loss {
        return RiskAction::Flatten(FlattenReason::StopLoss);
    }
    if snapshot.at_price_limit {
        return RiskAction::Flatten(FlattenReason::PriceLimit);
    }
    if snapshot.max_abs_position > limits.max_position {
        return RiskAction::Flatten(FlattenReason::DeltaLimit);
    }
    RiskAction::None
}

/// Validate an intent's fields before resolution
#[inline]
pub fn check_intent(intent: &OrderIntent) -> Result<(), SubmitError> {
    if intent.quantity == 0 {
        return Err(SubmitError::InvalidQuantity {
            quantity: intent.quantity,
        });
    }
    let price_ok = match intent.order_type {
        OrderType::Limit => intent.price.is_finite() && intent.price > 0.0,
        OrderType::Market => intent.price.is_finite() && intent.price >= 0.0,
    };
    if !price_ok {
        return Err(SubmitError::InvalidPrice {
            price: intent.price,
        });
    }
    Ok(())
}

/// Check that the opening part of a plan keeps the position within limits
///
/// Closing legs only ever reduce exposure and are always allowed.
#[inline]
pub fn check_exposure(
    limits: &RiskLimits,
    intent: &OrderIntent,
    plan: &OffsetPlan,
    current_net: i64,
) -> Result<(), SubmitError> {
    let closing = (plan.total_quantity() - plan.open_quantity()) as i64;
    let opening = plan.open_quantity() as i64;
    let sign = intent.side.sign();
    let projected = current_net + sign * (closing + opening);
    if opening > 0 && projected.abs() > limits.max_position {
        return Err(SubmitError::PositionLimit {
            symbol: intent.symbol,
            projected,
            limit: limits.max_position,
        });
    }
    Ok(())
}
