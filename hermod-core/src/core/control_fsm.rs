//! Strategy Control State Machine
//!
//! Gates when a strategy may emit orders, and drives force-flatten and
//! permanent shutdown.
//!
//! # State Diagram
//!
//! ```text
//!            ┌────────── try_recover() ──────────┐
//!            ▼    (cooldown elapsed, flat)       │
//!         ACTIVE ──── trigger_flatten() ────► FLATTENING
//!            │                                   │
//!       trigger_exit()                     trigger_exit()
//!            │                                   │
//!            └──────────────► EXITING ◄──────────┘
//!                                │
//!                         complete_exit()
//!                       (flat, nothing pending)
//!                                ▼
//!                             STOPPED
//!                            (terminal)
//! ```
//!
//! **Key Invariants:**
//! - The phase is a single tagged variant; flatten/exit flags are derived from
//!   it and cannot be set independently
//! - Exiting never returns to Active; the only way out is Stopped
//! - `recoverable_at` exists only inside the Flattening variant
//! - Illegal calls return `ControlError` and leave the state untouched
//!
//! Every transition takes `now` explicitly so callers decide which clock is
//! authoritative.
//!
//! # Usage
//!
//! ```
//! use hermod_core::core::control_fsm::*;
//! use std::time::{Duration, SystemTime};
//!
//! let mut control = StrategyControl::new(7, true, CooldownTable::default());
//! let t0 = SystemTime::now();
//!
//! control.trigger_flatten(FlattenReason::PriceLimit, false, t0).unwrap();
//! assert!(!control.can_send_new_orders());
//!
//! // Too early
//! assert!(control.try_recover(t0, true).is_err());
//!
//! // After the one-minute price-limit cooldown, with a flat book
//! control.try_recover(t0 + Duration::from_secs(60), true).unwrap();
//! assert!(control.can_send_new_orders());
//! ```

use crate::core::errors::ControlError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Number of transitions retained for diagnostics
const HISTORY_LEN: usize = 64;

// ============================================================================
// Reasons and cooldowns
// ============================================================================

/// Why a strategy left the Active phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlattenReason {
    StopLoss,
    PriceLimit,
    DeltaLimit,
    MaxLoss,
    RejectLimit,
    Manual,
    Shutdown,
    /// A gap on the order-response path desynchronised the ledger
    TransportGap,
}

impl FlattenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlattenReason::StopLoss => "stop_loss",
            FlattenReason::PriceLimit => "price_limit",
            FlattenReason::DeltaLimit => "delta_limit",
            FlattenReason::MaxLoss => "max_loss",
            FlattenReason::RejectLimit => "reject_limit",
            FlattenReason::Manual => "manual",
            FlattenReason::Shutdown => "shutdown",
            FlattenReason::TransportGap => "transport_gap",
        }
    }
}

impl fmt::Display for FlattenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason-dependent recovery cooldowns
///
/// Only stop-loss, price-limit and delta-limit breaches can auto-recover.
/// Every other reason has no cooldown and therefore never recovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownTable {
    pub stop_loss_secs: Option<u64>,
    pub price_limit_secs: Option<u64>,
    pub delta_limit_secs: Option<u64>,
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self {
            stop_loss_secs: Some(15 * 60),
            price_limit_secs: Some(60),
            delta_limit_secs: Some(5 * 60),
        }
    }
}

impl CooldownTable {
    /// No reason recovers
    pub fn never() -> Self {
        Self {
            stop_loss_secs: None,
            price_limit_secs: None,
            delta_limit_secs: None,
        }
    }

    pub fn cooldown(&self, reason: FlattenReason) -> Option<Duration> {
        let secs = match reason {
            FlattenReason::StopLoss => self.stop_loss_secs,
            FlattenReason::PriceLimit => self.price_limit_secs,
            FlattenReason::DeltaLimit => self.delta_limit_secs,
            _ => None,
        };
        secs.map(Duration::from_secs)
    }

    pub fn is_recoverable(&self, reason: FlattenReason) -> bool {
        self.cooldown(reason).is_some()
    }
}

// ============================================================================
// Phase
// ============================================================================

/// Discriminant-only view of [`ControlPhase`], used in errors and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseKind {
    Active,
    Flattening,
    Exiting,
    Stopped,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Active => "active",
            PhaseKind::Flattening => "flattening",
            PhaseKind::Exiting => "exiting",
            PhaseKind::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running phase with the data that only exists in that phase
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPhase {
    Active,
    Flattening {
        reason: FlattenReason,
        since: SystemTime,
        /// `None` means the reason never auto-recovers
        recoverable_at: Option<SystemTime>,
        aggressive: bool,
    },
    Exiting {
        reason: FlattenReason,
        since: SystemTime,
        aggressive: bool,
    },
    Stopped {
        reason: FlattenReason,
        at: SystemTime,
    },
}

impl ControlPhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            ControlPhase::Active => PhaseKind::Active,
            ControlPhase::Flattening { .. } => PhaseKind::Flattening,
            ControlPhase::Exiting { .. } => PhaseKind::Exiting,
            ControlPhase::Stopped { .. } => PhaseKind::Stopped,
        }
    }
}

/// One recorded phase change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: PhaseKind,
    pub to: PhaseKind,
    pub reason: Option<FlattenReason>,
    pub at: SystemTime,
}

// ============================================================================
// StrategyControl
// ============================================================================

/// Control state for one strategy instance
#[derive(Debug, Clone)]
pub struct StrategyControl {
    strategy_id: i32,
    /// Manual permission to trade, independent of the phase
    active: bool,
    phase: ControlPhase,
    cooldowns: CooldownTable,
    history: VecDeque<Transition>,
    flatten_count: u64,
}

impl StrategyControl {
    /// Create a control state in the Active phase
    ///
    /// Live deployments pass `auto_activate = false` and require a manual
    /// [`activate`](Self::activate) before any order leaves.
    pub fn new(strategy_id: i32, auto_activate: bool, cooldowns: CooldownTable) -> Self {
        Self {
            strategy_id,
            active: auto_activate,
            phase: ControlPhase::Active,
            cooldowns,
            history: VecDeque::with_capacity(HISTORY_LEN),
            flatten_count: 0,
        }
    }

    pub fn strategy_id(&self) -> i32 {
        self.strategy_id
    }

    pub fn phase(&self) -> &ControlPhase {
        &self.phase
    }

    pub fn kind(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn is_activated(&self) -> bool {
        self.active
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    /// Number of times the strategy entered Flattening
    pub fn flatten_count(&self) -> u64 {
        self.flatten_count
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Grant manual permission to trade. A stopped strategy cannot be revived.
    pub fn activate(&mut self) -> Result<(), ControlError> {
        if let ControlPhase::Stopped { .. } = self.phase {
            return Err(ControlError::IllegalTransition {
                from: PhaseKind::Stopped,
                action: "activate",
            });
        }
        self.active = true;
        info!(strategy_id = self.strategy_id, "Strategy activated");
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        info!(strategy_id = self.strategy_id, "Strategy deactivated");
    }

    /// The single gate consulted before every new order
    #[inline]
    pub fn can_send_new_orders(&self) -> bool {
        self.active && matches!(self.phase, ControlPhase::Active)
    }

    /// True while closing orders must be driven (Flattening or Exiting)
    #[inline]
    pub fn is_flattening(&self) -> bool {
        matches!(
            self.phase,
            ControlPhase::Flattening { .. } | ControlPhase::Exiting { .. }
        )
    }

    #[inline]
    pub fn is_exiting(&self) -> bool {
        matches!(self.phase, ControlPhase::Exiting { .. })
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self.phase, ControlPhase::Stopped { .. })
    }

    /// Whether flatten orders must cross the spread
    pub fn flatten_aggressive(&self) -> bool {
        match self.phase {
            ControlPhase::Flattening { aggressive, .. } | ControlPhase::Exiting { aggressive, .. } => {
                aggressive
            }
            _ => false,
        }
    }

    pub fn flatten_reason(&self) -> Option<FlattenReason> {
        match self.phase {
            ControlPhase::Active => None,
            ControlPhase::Flattening { reason, .. }
            | ControlPhase::Exiting { reason, .. }
            | ControlPhase::Stopped { reason, .. } => Some(reason),
        }
    }

    pub fn recoverable_at(&self) -> Option<SystemTime> {
        match self.phase {
            ControlPhase::Flattening { recoverable_at, .. } => recoverable_at,
            _ => None,
        }
    }

    /// Transition: Active → Flattening
    pub fn trigger_flatten(
        &mut self,
        reason: FlattenReason,
        aggressive: bool,
        now: SystemTime,
    ) -> Result<(), ControlError> {
        if !matches!(self.phase, ControlPhase::Active) {
            return Err(ControlError::IllegalTransition {
                from: self.kind(),
                action: "trigger_flatten",
            });
        }

        let recoverable_at = self.cooldowns.cooldown(reason).map(|c| now + c);
        self.flatten_count += 1;
        self.transition(
            ControlPhase::Flattening {
                reason,
                since: now,
                recoverable_at,
                aggressive,
            },
            Some(reason),
            now,
        );

        warn!(
            strategy_id = self.strategy_id,
            %reason,
            aggressive,
            recoverable = recoverable_at.is_some(),
            "Strategy entering flatten mode"
        );
        Ok(())
    }

    /// Transition: Flattening → Active
    ///
    /// Succeeds only once the cooldown has elapsed and the position is flat.
    pub fn try_recover(&mut self, now: SystemTime, position_flat: bool) -> Result<(), ControlError> {
        let (reason, recoverable_at) = match self.phase {
            ControlPhase::Flattening {
                reason,
                recoverable_at,
                ..
            } => (reason, recoverable_at),
            _ => {
                return Err(ControlError::IllegalTransition {
                    from: self.kind(),
                    action: "try_recover",
                })
            }
        };

        let deadline = recoverable_at.ok_or(ControlError::NotRecoverable { reason })?;
        if now < deadline {
            let remaining = deadline.duration_since(now).unwrap_or(Duration::ZERO);
            return Err(ControlError::RecoveryNotReady { remaining });
        }
        if !position_flat {
            return Err(ControlError::PositionNotFlat);
        }

        self.transition(ControlPhase::Active, Some(reason), now);
        info!(strategy_id = self.strategy_id, %reason, "Strategy recovered from flatten");
        Ok(())
    }

    /// Transition: Active | Flattening → Exiting (irreversible)
    ///
    /// Calling it again while already exiting is a no-op.
    pub fn trigger_exit(
        &mut self,
        reason: FlattenReason,
        aggressive: bool,
        now: SystemTime,
    ) -> Result<(), ControlError> {
        let aggressive = match self.phase {
            ControlPhase::Active => aggressive,
            ControlPhase::Flattening {
                aggressive: was, ..
            } => aggressive || was,
            ControlPhase::Exiting { .. } => return Ok(()),
            ControlPhase::Stopped { .. } => {
                return Err(ControlError::IllegalTransition {
                    from: PhaseKind::Stopped,
                    action: "trigger_exit",
                })
            }
        };

        self.transition(
            ControlPhase::Exiting {
                reason,
                since: now,
                aggressive,
            },
            Some(reason),
            now,
        );
        warn!(strategy_id = self.strategy_id, %reason, aggressive, "Strategy exit requested");
        Ok(())
    }

    /// Transition: Exiting → Stopped
    pub fn complete_exit(
        &mut self,
        now: SystemTime,
        position_flat: bool,
        pending_orders: usize,
    ) -> Result<(), ControlError> {
        let reason = match self.phase {
            ControlPhase::Exiting { reason, .. } => reason,
            _ => {
                return Err(ControlError::IllegalTransition {
                    from: self.kind(),
                    action: "complete_exit",
                })
            }
        };
        if !position_flat {
            return Err(ControlError::PositionNotFlat);
        }
        if pending_orders > 0 {
            return Err(ControlError::OrdersPending {
                pending: pending_orders,
            });
        }

        self.active = false;
        self.transition(ControlPhase::Stopped { reason, at: now }, Some(reason), now);
        info!(strategy_id = self.strategy_id, %reason, "Strategy stopped");
        Ok(())
    }

    fn transition(&mut self, to: ControlPhase, reason: Option<FlattenReason>, at: SystemTime) {
        let record = Transition {
            from: self.phase.kind(),
            to: to.kind(),
            reason,
            at,
        };
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(record);
        self.phase = to;
    }
}

impl fmt::Display for StrategyControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "strategy={} phase={} active={} aggressive={}",
            self.strategy_id,
            self.kind(),
            self.active,
            self.flatten_aggressive()
        )?;
        if let Some(reason) = self.flatten_reason() {
            write!(f, " reason={}", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn control() -> StrategyControl {
        StrategyControl::new(1, true, CooldownTable::default())
    }

    #[test]
    fn test_initial_state() {
        let c = control();
        assert_eq!(c.kind(), PhaseKind::Active);
        assert!(c.can_send_new_orders());
        assert!(!c.is_flattening());
        assert!(c.flatten_reason().is_none());

        let inactive = StrategyControl::new(2, false, CooldownTable::default());
        assert!(!inactive.can_send_new_orders());
    }

    #[test]
    fn test_flatten_blocks_sending() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::StopLoss, true, t0()).unwrap();
        assert!(!c.can_send_new_orders());
        assert!(c.is_flattening());
        assert!(c.flatten_aggressive());
        assert_eq!(c.recoverable_at(), Some(t0() + Duration::from_secs(900)));
        assert_eq!(c.flatten_count(), 1);
    }

    #[test]
    fn test_flatten_only_from_active() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::StopLoss, false, t0()).unwrap();
        let before = c.phase().clone();
        let err = c
            .trigger_flatten(FlattenReason::PriceLimit, true, t0())
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::IllegalTransition {
                from: PhaseKind::Flattening,
                action: "trigger_flatten"
            }
        );
        assert_eq!(c.phase(), &before);
    }

    #[test]
    fn test_recover_respects_cooldown_and_flatness() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::PriceLimit, false, t0()).unwrap();

        let early = t0() + Duration::from_secs(59);
        assert!(matches!(
            c.try_recover(early, true),
            Err(ControlError::RecoveryNotReady { .. })
        ));

        let due = t0() + Duration::from_secs(60);
        assert_eq!(c.try_recover(due, false), Err(ControlError::PositionNotFlat));
        assert!(c.is_flattening());

        c.try_recover(due, true).unwrap();
        assert_eq!(c.kind(), PhaseKind::Active);
        assert!(c.can_send_new_orders());
        assert!(c.recoverable_at().is_none());
    }

    #[test]
    fn test_non_recoverable_reason() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::Manual, false, t0()).unwrap();
        assert!(c.recoverable_at().is_none());
        let far = t0() + Duration::from_secs(86_400);
        assert_eq!(
            c.try_recover(far, true),
            Err(ControlError::NotRecoverable {
                reason: FlattenReason::Manual
            })
        );
    }

    #[test]
    fn test_exit_is_irreversible() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::StopLoss, false, t0()).unwrap();
        c.trigger_exit(FlattenReason::MaxLoss, false, t0()).unwrap();
        assert!(c.is_exiting());
        assert!(c.is_flattening());

        let far = t0() + Duration::from_secs(10 * 86_400);
        assert!(c.try_recover(far, true).is_err());
        assert!(c.trigger_flatten(FlattenReason::StopLoss, false, far).is_err());
        assert!(c.is_exiting());
    }

    #[test]
    fn test_exit_preserves_aggressive_flatten() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::StopLoss, true, t0()).unwrap();
        c.trigger_exit(FlattenReason::RejectLimit, false, t0()).unwrap();
        assert!(c.flatten_aggressive());
        assert_eq!(c.flatten_reason(), Some(FlattenReason::RejectLimit));
    }

    #[test]
    fn test_repeated_exit_keeps_first_reason() {
        let mut c = control();
        c.trigger_exit(FlattenReason::MaxLoss, false, t0()).unwrap();
        c.trigger_exit(FlattenReason::Manual, true, t0()).unwrap();
        assert_eq!(c.flatten_reason(), Some(FlattenReason::MaxLoss));
        assert!(!c.flatten_aggressive());
    }

    #[test]
    fn test_complete_exit_requirements() {
        let mut c = control();
        assert!(c.complete_exit(t0(), true, 0).is_err());

        c.trigger_exit(FlattenReason::Shutdown, false, t0()).unwrap();
        assert_eq!(c.complete_exit(t0(), false, 0), Err(ControlError::PositionNotFlat));
        assert_eq!(
            c.complete_exit(t0(), true, 2),
            Err(ControlError::OrdersPending { pending: 2 })
        );

        c.complete_exit(t0(), true, 0).unwrap();
        assert!(c.is_stopped());
        assert!(!c.is_activated());
        assert!(c.activate().is_err());
        assert!(c.trigger_exit(FlattenReason::Manual, false, t0()).is_err());
    }

    #[test]
    fn test_deactivate_blocks_without_phase_change() {
        let mut c = control();
        c.deactivate();
        assert!(!c.can_send_new_orders());
        assert_eq!(c.kind(), PhaseKind::Active);
        c.activate().unwrap();
        assert!(c.can_send_new_orders());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut c = StrategyControl::new(1, true, CooldownTable {
            price_limit_secs: Some(0),
            ..CooldownTable::default()
        });
        for _ in 0..100 {
            c.trigger_flatten(FlattenReason::PriceLimit, false, t0()).unwrap();
            c.try_recover(t0(), true).unwrap();
        }
        assert_eq!(c.history().count(), HISTORY_LEN);
        let last = c.history().last().unwrap();
        assert_eq!(last.from, PhaseKind::Flattening);
        assert_eq!(last.to, PhaseKind::Active);
    }

    #[test]
    fn test_display_summary() {
        let mut c = control();
        c.trigger_flatten(FlattenReason::DeltaLimit, false, t0()).unwrap();
        let s = c.to_string();
        assert!(s.contains("phase=flattening"));
        assert!(s.contains("reason=delta_limit"));
    }
}
