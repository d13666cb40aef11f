//! Executor-side portfolio snapshots consumed by the risk kernel.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::intent::{Outcome, TradeSide};

/// An open exposure held by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Market condition ID
    pub market_id: String,

    /// Outcome token held
    pub outcome: Outcome,

    pub side: TradeSide,

    /// Number of outcome tokens held
    pub size: Decimal,

    /// Average entry price per token
    pub entry_price: Decimal,

    /// Current market price per token
    #[serde(default)]
    pub current_price: Decimal,

    /// Unrealized P&L in USDC
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Create a new long position at the given entry price.
    pub fn new(market_id: String, outcome: Outcome, size: Decimal, entry_price: Decimal) -> Self {
        Self {
            market_id,
            outcome,
            side: TradeSide::Buy,
            size,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }

    /// Update position P&L based on current market price.
    pub fn update_price(&mut self, current_price: Decimal) {
        self.current_price = current_price;
        let diff = current_price - self.entry_price;
        self.unrealized_pnl = match self.side {
            TradeSide::Buy => self.size * diff,
            TradeSide::Sell => self.size * -diff,
        };
        self.last_updated = Utc::now();
    }

    /// Cost basis in USDC.
    pub fn cost_basis(&self) -> Decimal {
        self.size * self.entry_price
    }
}

/// Capital snapshot supplied by the executor on every risk check.
///
/// Daily and total P&L percentages are always relative to `starting_capital`;
/// they are derived here so callers cannot mix baselines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalState {
    starting_capital: Decimal,
    current_capital: Decimal,
    daily_pnl: Decimal,
    daily_pnl_pct: Decimal,
    total_pnl: Decimal,
    total_pnl_pct: Decimal,
}

impl CapitalState {
    /// Build a snapshot. Total P&L is `current_capital - starting_capital`.
    pub fn new(starting_capital: Decimal, current_capital: Decimal, daily_pnl: Decimal) -> Self {
        let total_pnl = current_capital - starting_capital;
        let pct = |pnl: Decimal| {
            if starting_capital > Decimal::ZERO {
                pnl / starting_capital
            } else {
                Decimal::ZERO
            }
        };

        Self {
            starting_capital,
            current_capital,
            daily_pnl,
            daily_pnl_pct: pct(daily_pnl),
            total_pnl,
            total_pnl_pct: pct(total_pnl),
        }
    }

    /// Fresh snapshot with no P&L.
    pub fn flat(capital: Decimal) -> Self {
        Self::new(capital, capital, Decimal::ZERO)
    }

    pub fn starting_capital(&self) -> Decimal {
        self.starting_capital
    }

    pub fn current_capital(&self) -> Decimal {
        self.current_capital
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    pub fn daily_pnl_pct(&self) -> Decimal {
        self.daily_pnl_pct
    }

    pub fn total_pnl(&self) -> Decimal {
        self.total_pnl
    }

    pub fn total_pnl_pct(&self) -> Decimal {
        self.total_pnl_pct
    }
}
