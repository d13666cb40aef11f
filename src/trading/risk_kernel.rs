//! Deterministic risk kernel: trade approval against capital limits, and the
//! bot's kill switch.
//!
//! The kernel does no I/O and never reads the clock. Every input it judges is
//! supplied by the caller; the only state it owns is the kill flag, which is
//! terminal. Nothing in the kernel clears it: resetting means an operator
//! constructs a fresh kernel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::{CapitalState, Position};

use super::RiskConfig;

/// Outcome category of a risk check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Approved,
    RejectedDailyStop,
    RejectedHardKill,
    RejectedPerTradeCap,
    RejectedPositionLimit,
    RejectedAnomalousLoss,
    Killed,
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Approved => "APPROVED",
            RiskStatus::RejectedDailyStop => "REJECTED_DAILY_STOP",
            RiskStatus::RejectedHardKill => "REJECTED_HARD_KILL",
            RiskStatus::RejectedPerTradeCap => "REJECTED_PER_TRADE_CAP",
            RiskStatus::RejectedPositionLimit => "REJECTED_POSITION_LIMIT",
            RiskStatus::RejectedAnomalousLoss => "REJECTED_ANOMALOUS_LOSS",
            RiskStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one kernel call. Rejections are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskDecision {
    pub status: RiskStatus,
    pub reason: String,
    /// Largest size the kernel would accept instead, when one exists
    pub adjusted_size: Option<Decimal>,
}

impl RiskDecision {
    fn approve() -> Self {
        Self {
            status: RiskStatus::Approved,
            reason: "All risk checks passed".to_string(),
            adjusted_size: None,
        }
    }

    fn reject(status: RiskStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            adjusted_size: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == RiskStatus::Approved
    }
}

/// Risk kernel shared by every executor task.
pub struct RiskKernel {
    config: RiskConfig,
    killed: AtomicBool,
    kill_reason: Mutex<Option<String>>,
}

impl RiskKernel {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            killed: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Why the kernel was killed, if it was.
    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason.lock().ok().and_then(|r| r.clone())
    }

    /// Manual kill. Irreversible for this kernel instance.
    pub fn kill(&self, reason: &str) {
        self.set_killed(format!("Manual kill: {}", reason));
    }

    /// Decide whether a trade of `size` USDC may be placed.
    ///
    /// Checks run in a fixed order and the first failure wins:
    /// killed, hard kill, daily stop, position limit, per-trade cap.
    pub fn approve_trade(
        &self,
        size: Decimal,
        open_positions: &[Position],
        capital: &CapitalState,
    ) -> RiskDecision {
        if self.is_killed() {
            return self.killed_decision();
        }

        if capital.total_pnl_pct() <= self.config.hard_kill_pct {
            let reason = format!(
                "Total P&L {}% at or below hard kill {}%",
                pct(capital.total_pnl_pct()),
                pct(self.config.hard_kill_pct)
            );
            self.set_killed(reason.clone());
            return RiskDecision::reject(RiskStatus::RejectedHardKill, reason);
        }

        if capital.daily_pnl_pct() <= self.config.daily_stop_pct {
            let reason = format!(
                "Daily P&L {}% at or below daily stop {}%",
                pct(capital.daily_pnl_pct()),
                pct(self.config.daily_stop_pct)
            );
            warn!(reason = %reason, "Daily stop active");
            return RiskDecision::reject(RiskStatus::RejectedDailyStop, reason);
        }

        if open_positions.len() >= self.config.max_positions {
            return RiskDecision::reject(
                RiskStatus::RejectedPositionLimit,
                format!(
                    "Too many positions: {} >= {}",
                    open_positions.len(),
                    self.config.max_positions
                ),
            );
        }

        let max_size = capital.current_capital() * self.config.per_trade_cap_pct;
        if size > max_size {
            let mut decision = RiskDecision::reject(
                RiskStatus::RejectedPerTradeCap,
                format!(
                    "Trade size {} exceeds {}% of capital ({})",
                    size,
                    pct(self.config.per_trade_cap_pct),
                    max_size
                ),
            );
            decision.adjusted_size = Some(max_size.max(Decimal::ZERO));
            return decision;
        }

        // A kill may have landed while the checks ran.
        if self.is_killed() {
            return self.killed_decision();
        }

        RiskDecision::approve()
    }

    /// Inspect a closed trade's realized return; an outsized loss kills the kernel.
    pub fn check_post_trade_anomaly(&self, realized_pnl_pct: Decimal) -> Option<RiskDecision> {
        if realized_pnl_pct > self.config.anomalous_loss_pct {
            return None;
        }

        let reason = format!(
            "Single trade lost {}% (threshold {}%), halting for review",
            pct(realized_pnl_pct),
            pct(self.config.anomalous_loss_pct)
        );
        self.set_killed(reason.clone());
        Some(RiskDecision::reject(RiskStatus::RejectedAnomalousLoss, reason))
    }

    fn set_killed(&self, reason: String) {
        let was_killed = self.killed.swap(true, Ordering::SeqCst);
        if was_killed {
            info!(reason = %reason, "Kill requested on already-killed kernel");
            return;
        }

        error!(reason = %reason, "Risk kernel KILLED, trading halted until manual reset");
        if let Ok(mut slot) = self.kill_reason.lock() {
            *slot = Some(reason);
        }
    }

    fn killed_decision(&self) -> RiskDecision {
        let reason = self
            .kill_reason()
            .unwrap_or_else(|| "Kernel killed".to_string());
        RiskDecision::reject(RiskStatus::Killed, reason)
    }
}

fn pct(fraction: Decimal) -> Decimal {
    (fraction * dec!(100)).round_dp(2)
}
