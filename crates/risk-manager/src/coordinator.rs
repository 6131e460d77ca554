//! Risk decision coordinator.
//!
//! Routes each event through the circuit breaker and the exit controller,
//! passes any resulting alert through the deduplicator, and returns a single
//! decision. Evaluation never fails: errors degrade to `Hold`.

use chrono::{DateTime, Duration, Utc};
use guard_core::types::{
    ensure_positive, Action, Alert, AlertKind, Decision, LockRecord, LockStatus, RiskEvent,
};
use guard_core::{Error, Result};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alert_dedup::{AlertDeduplicator, DedupStats};
use crate::circuit_breaker::CircuitBreakerEngine;
use crate::config::GuardConfig;
use crate::exit_controller::PositionExitController;

/// Owns the risk components for the lifetime of the process. Share it
/// between scan loops behind an `Arc`.
pub struct RiskDecisionCoordinator {
    breaker: CircuitBreakerEngine,
    exits: PositionExitController,
    dedup: AlertDeduplicator,
}

impl RiskDecisionCoordinator {
    /// Build all components from a validated configuration.
    pub fn new(config: GuardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            breaker: CircuitBreakerEngine::new(config.circuit_breaker)?,
            exits: PositionExitController::new(config.exit, config.sizing)?,
            dedup: AlertDeduplicator::new(config.dedup)?,
        })
    }

    /// Assemble from already-built components.
    pub fn from_parts(
        breaker: CircuitBreakerEngine,
        exits: PositionExitController,
        dedup: AlertDeduplicator,
    ) -> Self {
        Self {
            breaker,
            exits,
            dedup,
        }
    }

    pub fn breaker(&self) -> &CircuitBreakerEngine {
        &self.breaker
    }

    pub fn exits(&self) -> &PositionExitController {
        &self.exits
    }

    pub fn dedup(&self) -> &AlertDeduplicator {
        &self.dedup
    }

    /// Decide what to do for one event.
    pub fn evaluate(&self, event: &RiskEvent, now: DateTime<Utc>) -> Decision {
        match self.try_evaluate(event, now) {
            Ok(decision) => {
                debug!(
                    code = %decision.code,
                    action = %decision.action,
                    tier = ?decision.tier,
                    alert = decision.alert.is_some(),
                    "Decision"
                );
                decision
            }
            Err(e) => {
                warn!(code = %event.code, error = %e, "Event evaluation failed, holding");
                Decision::degraded(event.code.clone(), format!("evaluation failed, holding: {}", e), now)
            }
        }
    }

    /// Evaluate events in submission order.
    pub fn evaluate_batch(&self, events: &[RiskEvent], now: DateTime<Utc>) -> Vec<Decision> {
        events.iter().map(|event| self.evaluate(event, now)).collect()
    }

    fn try_evaluate(&self, event: &RiskEvent, now: DateTime<Utc>) -> Result<Decision> {
        let code = event.code.as_str();
        if code.trim().is_empty() {
            return Err(Error::invalid_input("code", "instrument code is empty"));
        }

        // 1. Circuit breaker
        let lock = if event.has_fact() {
            self.breaker.check_and_lock(
                code,
                event.fact_text.as_deref().unwrap_or(""),
                event.capital_flow.unwrap_or(Decimal::ZERO),
                now,
            )?
        } else {
            self.breaker.lock_status(code, now)
        };

        if let LockStatus::Locked {
            reason,
            locked_at,
            remaining_secs,
        } = &lock
        {
            let alert = self.emit(
                code,
                AlertKind::CircuitBreakTripped,
                now,
                json!({
                    "reason": reason,
                    "locked_at": locked_at,
                    "remaining_secs": remaining_secs,
                    "current_price": event.current_price,
                    "fact_text": event.fact_text,
                    "capital_flow": event.capital_flow,
                }),
            );
            let decision = if event.is_open_position() {
                Decision::new(code, Action::ForceSell, format!("instrument locked: {}", reason), now)
            } else {
                Decision::new(code, Action::Hold, format!("entry blocked: {}", reason), now)
            };
            return Ok(decision
                .with_lock_remaining(Duration::seconds(*remaining_secs))
                .with_alert(alert));
        }

        ensure_positive("current_price", event.current_price)?;

        // 2. Open position exit check
        if let Some(snapshot) = event.snapshot() {
            let signal = self.exits.check_snapshot(&snapshot)?;
            let defense = &signal.defense;

            if signal.should_exit() {
                let alert = self.emit(
                    code,
                    AlertKind::for_tier(defense.tier),
                    now,
                    json!({
                        "tier": defense.tier,
                        "stop_price": defense.stop_price,
                        "current_price": signal.current_price,
                        "cost_price": snapshot.cost_price,
                        "peak_price": snapshot.peak_price,
                        "forced_exit": defense.forced_exit,
                        "reason": defense.reason,
                    }),
                );
                let reason = if defense.forced_exit {
                    defense.reason.clone()
                } else {
                    format!(
                        "price {} at or below stop {}: {}",
                        signal.current_price, defense.stop_price, defense.reason
                    )
                };
                info!(
                    code = %code,
                    tier = %defense.tier,
                    stop_price = %defense.stop_price,
                    current_price = %signal.current_price,
                    "Exit signal"
                );
                return Ok(Decision::new(code, Action::ForceSell, reason, now)
                    .with_defense(defense.tier, defense.stop_price)
                    .with_alert(alert));
            }

            return Ok(Decision::new(code, Action::Hold, format!("holding: {}", defense.reason), now)
                .with_defense(defense.tier, defense.stop_price));
        }

        // 3. No position and no lock
        Ok(Decision::new(code, Action::AllowEntry, "no active lock", now))
    }

    fn emit(&self, code: &str, kind: AlertKind, now: DateTime<Utc>, payload: serde_json::Value) -> Option<Alert> {
        self.dedup
            .admit(code, kind, now, kind.default_confidence(), payload)
    }

    // Operator surface

    pub fn is_locked(&self, code: &str, now: DateTime<Utc>) -> bool {
        self.breaker.is_locked(code, now)
    }

    pub fn locked_instruments(&self, now: DateTime<Utc>) -> Vec<LockRecord> {
        self.breaker.locked_instruments(now)
    }

    pub fn unlock(&self, code: &str) -> bool {
        self.breaker.unlock(code)
    }

    pub fn unlock_all(&self) -> usize {
        self.breaker.unlock_all()
    }

    pub fn recent_alerts(&self, within: Duration, now: DateTime<Utc>) -> Vec<Alert> {
        self.dedup.recent(within, now)
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }
}
