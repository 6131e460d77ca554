//! Tiered trailing-stop controller for open positions.
//!
//! The controller is stateless. Every call re-derives the stop from the
//! caller's snapshot, so the ratchet lives in the caller-maintained peak
//! price rather than in hidden controller state.
//!
//! Tiers, evaluated in order (the highest stop wins):
//!
//! 1. `None`: hard stop at `cost * (1 - initial_stop_ratio)`.
//! 2. `CostProtect`: current profit above the threshold lifts the stop to
//!    `cost * (1 + cost_protect_buffer)`.
//! 3. `DrawdownLock`: peak profit above the threshold trails the stop at
//!    `peak * (1 - drawdown_retrace_ratio)`.
//! 4. `BreakEscape`: after a limit-up, a break of more than
//!    `break_escape_ratio` below the limit-up price forces an exit at market.

use guard_core::types::{
    ensure_positive, DefenseResult, DefenseTier, ExitAction, ExitSignal, PositionSnapshot,
};
use guard_core::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sizing::SizingConfig;

/// Thresholds and ratios for the defense tiers. All values are fractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Initial stop distance below cost (0.08 = -8%).
    pub initial_stop_ratio: Decimal,
    /// Current profit above which the stop moves to cost.
    pub cost_protect_threshold: Decimal,
    /// Buffer above cost for the cost-protect stop.
    pub cost_protect_buffer: Decimal,
    /// Peak profit above which the stop trails the peak.
    pub drawdown_lock_threshold: Decimal,
    /// Allowed retrace from peak before the trailing stop is hit.
    pub drawdown_retrace_ratio: Decimal,
    /// Break below the limit-up price that forces an exit.
    pub break_escape_ratio: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            initial_stop_ratio: Decimal::new(8, 2),      // 8%
            cost_protect_threshold: Decimal::new(3, 2),  // 3%
            cost_protect_buffer: Decimal::new(5, 3),     // 0.5%
            drawdown_lock_threshold: Decimal::new(7, 2), // 7%
            drawdown_retrace_ratio: Decimal::new(3, 2),  // 3%
            break_escape_ratio: Decimal::new(2, 2),      // 2%
        }
    }
}

impl ExitConfig {
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("exit.initial_stop_ratio", self.initial_stop_ratio),
            ("exit.cost_protect_threshold", self.cost_protect_threshold),
            ("exit.cost_protect_buffer", self.cost_protect_buffer),
            ("exit.drawdown_lock_threshold", self.drawdown_lock_threshold),
            ("exit.drawdown_retrace_ratio", self.drawdown_retrace_ratio),
            ("exit.break_escape_ratio", self.break_escape_ratio),
        ];
        for (name, value) in ratios {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                return Err(Error::config(format!(
                    "{} must be between 0 and 1 (exclusive), got {}",
                    name, value
                )));
            }
        }
        if self.cost_protect_threshold >= self.drawdown_lock_threshold {
            return Err(Error::config(format!(
                "exit.cost_protect_threshold ({}) must be below exit.drawdown_lock_threshold ({})",
                self.cost_protect_threshold, self.drawdown_lock_threshold
            )));
        }
        Ok(())
    }
}

/// Stateless exit controller. Safe to share between scan loops without locking.
#[derive(Debug, Clone)]
pub struct PositionExitController {
    config: ExitConfig,
    pub(crate) sizing: SizingConfig,
}

impl PositionExitController {
    /// Create a controller, validating both configuration sections.
    pub fn new(config: ExitConfig, sizing: SizingConfig) -> Result<Self> {
        config.validate()?;
        sizing.validate()?;
        Ok(Self { config, sizing })
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Compute the active stop price and defense tier.
    pub fn compute_defense(
        &self,
        current_price: Decimal,
        cost_price: Decimal,
        peak_price: Decimal,
        ever_limit_up: bool,
        limit_up_price: Option<Decimal>,
    ) -> Result<DefenseResult> {
        ensure_positive("current_price", current_price)?;
        ensure_positive("cost_price", cost_price)?;
        ensure_positive("peak_price", peak_price)?;
        if let Some(limit_up) = limit_up_price {
            ensure_positive("limit_up_price", limit_up)?;
        }

        let cfg = &self.config;
        let current_profit = profit_ratio("current_price", current_price, cost_price)?;
        let peak_profit = profit_ratio("peak_price", peak_price, cost_price)?;

        // Tier 1
        let mut stop_price = scale("cost_price", cost_price, Decimal::ONE - cfg.initial_stop_ratio)?;
        let mut tier = DefenseTier::None;
        let mut reason = format!(
            "initial stop {}% below cost",
            pct(cfg.initial_stop_ratio)?
        );

        // Tier 2
        if current_profit > cfg.cost_protect_threshold {
            let candidate = scale("cost_price", cost_price, Decimal::ONE + cfg.cost_protect_buffer)?;
            if candidate > stop_price {
                stop_price = candidate;
                tier = DefenseTier::CostProtect;
                reason = format!(
                    "profit {}% above {}%, stop lifted to cost +{}%",
                    pct(current_profit)?,
                    pct(cfg.cost_protect_threshold)?,
                    pct(cfg.cost_protect_buffer)?
                );
            }
        }

        // Tier 3
        if peak_profit > cfg.drawdown_lock_threshold {
            let candidate = scale("peak_price", peak_price, Decimal::ONE - cfg.drawdown_retrace_ratio)?;
            if candidate > stop_price {
                stop_price = candidate;
                tier = DefenseTier::DrawdownLock;
                reason = format!(
                    "peak profit {}% above {}%, stop trails peak {} by {}%",
                    pct(peak_profit)?,
                    pct(cfg.drawdown_lock_threshold)?,
                    peak_price,
                    pct(cfg.drawdown_retrace_ratio)?
                );
            }
        }

        // Tier 4 wins outright.
        if ever_limit_up {
            if let Some(limit_up) = limit_up_price {
                let escape_line = scale("limit_up_price", limit_up, Decimal::ONE - cfg.break_escape_ratio)?;
                if current_price < escape_line {
                    let drop = -profit_ratio("current_price", current_price, limit_up)?;
                    let drop_pct = pct(drop)?;
                    debug!(
                        current_price = %current_price,
                        limit_up = %limit_up,
                        drop_pct = %drop_pct,
                        "Limit-up break detected"
                    );
                    return Ok(DefenseResult {
                        stop_price: current_price,
                        tier: DefenseTier::BreakEscape,
                        reason: format!(
                            "broke {}% below limit-up {} (limit {}%), exit at market",
                            drop_pct,
                            limit_up,
                            pct(cfg.break_escape_ratio)?
                        ),
                        forced_exit: true,
                        current_profit,
                        peak_profit,
                    });
                }
            }
        }

        Ok(DefenseResult {
            stop_price,
            tier,
            reason,
            forced_exit: false,
            current_profit,
            peak_profit,
        })
    }

    /// Compute the defense and decide whether the position must be sold now.
    pub fn check_exit_signal(
        &self,
        code: &str,
        current_price: Decimal,
        cost_price: Decimal,
        peak_price: Decimal,
        ever_limit_up: bool,
        limit_up_price: Option<Decimal>,
    ) -> Result<ExitSignal> {
        if code.trim().is_empty() {
            return Err(Error::invalid_input("code", "instrument code is empty"));
        }
        let defense = self.compute_defense(
            current_price,
            cost_price,
            peak_price,
            ever_limit_up,
            limit_up_price,
        )?;

        let triggered = current_price <= defense.stop_price;
        let action = if triggered || defense.forced_exit {
            ExitAction::ForceSell
        } else {
            ExitAction::Hold
        };

        Ok(ExitSignal {
            code: code.to_string(),
            action,
            triggered,
            current_price,
            defense,
        })
    }

    /// `check_exit_signal` over a position snapshot.
    pub fn check_snapshot(&self, snapshot: &PositionSnapshot) -> Result<ExitSignal> {
        self.check_exit_signal(
            &snapshot.code,
            snapshot.current_price,
            snapshot.cost_price,
            snapshot.peak_price,
            snapshot.ever_limit_up,
            snapshot.limit_up_price,
        )
    }
}

/// `(price - base) / base`. Fails instead of panicking on overflow.
fn profit_ratio(field: &str, price: Decimal, base: Decimal) -> Result<Decimal> {
    price
        .checked_sub(base)
        .and_then(|diff| diff.checked_div(base))
        .ok_or_else(|| overflow(field, format!("({} - {}) / {}", price, base, base)))
}

/// `price * factor`. Fails instead of panicking on overflow.
fn scale(field: &str, price: Decimal, factor: Decimal) -> Result<Decimal> {
    price
        .checked_mul(factor)
        .ok_or_else(|| overflow(field, format!("{} * {}", price, factor)))
}

/// Ratio as a percentage with two decimals.
fn pct(ratio: Decimal) -> Result<Decimal> {
    ratio
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|p| p.round_dp(2).normalize())
        .ok_or_else(|| overflow("profit", format!("{} as a percentage", ratio)))
}

pub(crate) fn overflow(field: &str, expr: String) -> Error {
    Error::invalid_input(field, format!("arithmetic overflow in {}", expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn controller() -> PositionExitController {
        PositionExitController::new(ExitConfig::default(), SizingConfig::default()).unwrap()
    }

    #[test]
    fn test_initial_stop_below_cost() {
        let result = controller()
            .compute_defense(dec!(101), dec!(100), dec!(101), false, None)
            .unwrap();
        assert_eq!(result.tier, DefenseTier::None);
        assert_eq!(result.stop_price, dec!(92));
        assert!(!result.forced_exit);
    }

    #[test]
    fn test_profit_at_threshold_stays_in_tier_one() {
        // Exactly 3% profit does not activate cost protection.
        let result = controller()
            .compute_defense(dec!(103), dec!(100), dec!(103), false, None)
            .unwrap();
        assert_eq!(result.tier, DefenseTier::None);
        assert_eq!(result.stop_price, dec!(92));
    }

    #[test]
    fn test_cost_protect_scenario() {
        let result = controller()
            .compute_defense(dec!(103.5), dec!(100), dec!(103.5), false, None)
            .unwrap();
        assert_eq!(result.tier, DefenseTier::CostProtect);
        assert_eq!(result.stop_price, dec!(100.5));
        assert_eq!(result.current_profit, dec!(0.035));
    }

    #[test]
    fn test_drawdown_lock_scenario() {
        let result = controller()
            .compute_defense(dec!(105), dec!(100), dec!(108), false, None)
            .unwrap();
        assert_eq!(result.tier, DefenseTier::DrawdownLock);
        assert_eq!(result.stop_price, dec!(104.76));
        assert!(!result.forced_exit);
    }

    #[test]
    fn test_drawdown_lock_survives_profit_giveback() {
        // Current profit is back under 3%, but the peak keeps tier 3 active.
        let result = controller()
            .compute_defense(dec!(102), dec!(100), dec!(110), false, None)
            .unwrap();
        assert_eq!(result.tier, DefenseTier::DrawdownLock);
        assert_eq!(result.stop_price, dec!(106.7));
    }

    #[test]
    fn test_break_escape_scenario() {
        let result = controller()
            .compute_defense(dec!(107.5), dec!(100), dec!(110), true, Some(dec!(110)))
            .unwrap();
        assert_eq!(result.tier, DefenseTier::BreakEscape);
        assert!(result.forced_exit);
        assert_eq!(result.stop_price, dec!(107.5));
        assert!(result.reason.contains("2.27%"));
    }

    #[test]
    fn test_break_within_tolerance_is_not_forced() {
        // 110 * 0.98 = 107.8; 107.8 is not strictly below the line.
        let result = controller()
            .compute_defense(dec!(107.8), dec!(100), dec!(110), true, Some(dec!(110)))
            .unwrap();
        assert!(!result.forced_exit);
        assert_eq!(result.tier, DefenseTier::DrawdownLock);
    }

    #[test]
    fn test_limit_up_price_without_flag_is_ignored() {
        let result = controller()
            .compute_defense(dec!(100), dec!(100), dec!(110), false, Some(dec!(110)))
            .unwrap();
        assert!(!result.forced_exit);

        let result = controller()
            .compute_defense(dec!(100), dec!(100), dec!(110), true, None)
            .unwrap();
        assert!(!result.forced_exit);
    }

    #[test]
    fn test_break_escape_forces_exit_in_any_profit_state() {
        let controller = controller();
        // From deep loss to large profit, a limit-up break always forces exit.
        for (cost, current) in [
            (dec!(120), dec!(95)),
            (dec!(100), dec!(97)),
            (dec!(100), dec!(97.9)),
            (dec!(90), dec!(97)),
            (dec!(60), dec!(97)),
        ] {
            let result = controller
                .compute_defense(current, cost, dec!(110), true, Some(dec!(100)))
                .unwrap();
            assert!(result.forced_exit, "cost {} current {}", cost, current);
            assert_eq!(result.tier, DefenseTier::BreakEscape);
            assert_eq!(result.stop_price, current);
        }
    }

    #[test]
    fn test_stop_is_monotonic_in_peak() {
        let controller = controller();
        let cost = dec!(100);
        for current in [dec!(90), dec!(100), dec!(103.5), dec!(106)] {
            let mut previous = Decimal::MIN;
            let mut peak = dec!(100);
            while peak <= dec!(130) {
                let result = controller
                    .compute_defense(current, cost, peak, false, None)
                    .unwrap();
                assert!(
                    result.stop_price >= previous,
                    "stop decreased at current {} peak {}",
                    current,
                    peak
                );
                previous = result.stop_price;
                peak += dec!(0.25);
            }
        }
    }

    #[test]
    fn test_extreme_prices_fail_without_panicking() {
        let controller = controller();
        let tiny = Decimal::new(1, 28);

        // Profit ratio overflows
        assert!(matches!(
            controller.compute_defense(Decimal::MAX, tiny, Decimal::MAX, false, None),
            Err(Error::InvalidInput { .. })
        ));
        // Peak profit fits, its percentage does not
        assert!(matches!(
            controller.compute_defense(dec!(1), dec!(1), Decimal::MAX, false, None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(controller
            .check_exit_signal("600000", Decimal::MAX, tiny, Decimal::MAX, true, Some(Decimal::MAX))
            .is_err());

        // Large but representable prices still work.
        let result = controller
            .compute_defense(dec!(1000000000), dec!(1000000000), dec!(1000000000), false, None)
            .unwrap();
        assert_eq!(result.stop_price, dec!(920000000));
    }

    #[test]
    fn test_invalid_prices_rejected() {
        let controller = controller();
        assert!(matches!(
            controller.compute_defense(dec!(0), dec!(100), dec!(100), false, None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            controller.compute_defense(dec!(100), dec!(-1), dec!(100), false, None),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            controller.compute_defense(dec!(100), dec!(100), dec!(100), true, Some(dec!(-5))),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_exit_signal_triggered_at_stop() {
        let controller = controller();
        // Peak 108 -> stop 104.76
        let signal = controller
            .check_exit_signal("600519", dec!(104.76), dec!(100), dec!(108), false, None)
            .unwrap();
        assert!(signal.triggered);
        assert_eq!(signal.action, ExitAction::ForceSell);

        let signal = controller
            .check_exit_signal("600519", dec!(105), dec!(100), dec!(108), false, None)
            .unwrap();
        assert!(!signal.triggered);
        assert_eq!(signal.action, ExitAction::Hold);
    }

    #[test]
    fn test_exit_signal_hard_stop() {
        let signal = controller()
            .check_exit_signal("600519", dec!(91.5), dec!(100), dec!(100), false, None)
            .unwrap();
        assert!(signal.triggered);
        assert!(signal.should_exit());
        assert_eq!(signal.defense.tier, DefenseTier::None);
    }

    #[test]
    fn test_forced_exit_sells_even_when_not_triggered() {
        let snapshot = PositionSnapshot::new("600519", dec!(100), dec!(107.5), dec!(110))
            .with_limit_up(dec!(110));
        let signal = controller().check_snapshot(&snapshot).unwrap();
        // stop == current, so the comparison also holds, but the forced flag drives it.
        assert!(signal.defense.forced_exit);
        assert_eq!(signal.action, ExitAction::ForceSell);
    }

    #[test]
    fn test_config_rejects_inverted_thresholds() {
        let config = ExitConfig {
            cost_protect_threshold: dec!(0.07),
            drawdown_lock_threshold: dec!(0.07),
            ..Default::default()
        };
        assert!(matches!(
            PositionExitController::new(config, SizingConfig::default()),
            Err(Error::Config { .. })
        ));

        let config = ExitConfig {
            initial_stop_ratio: dec!(1.2),
            ..Default::default()
        };
        assert!(PositionExitController::new(config, SizingConfig::default()).is_err());
    }
}
