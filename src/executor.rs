//! Dry-run executor: drains validated intents and decides what would be traded.
//!
//! BUYs go through the risk kernel; SELLs are sized from the purchase ledger.
//! Nothing is ever sent to an exchange. Intents carry no token ID, so the
//! ledger's asset key is the outcome name (`YES` / `NO`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::PurchaseLedger;
use crate::ingest::{IngestStats, IntentIngestor};
use crate::models::{CapitalState, Outcome, Position, TradeIntent, TradeSide};
use crate::trading::{RiskDecision, RiskKernel};

/// What the executor would have done with one intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DryRunOutcome {
    WouldBuy { intent_id: String, usdc: Decimal },
    BuyRejected { intent_id: String, decision: RiskDecision },
    WouldSell { intent_id: String, tokens: Decimal, tracked: Decimal },
    SellSkipped { intent_id: String, reason: String },
}

/// Totals for a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub killed: bool,
    pub kill_reason: Option<String>,
    pub ingest: IngestStats,
}

pub struct DryRunExecutor {
    kernel: Arc<RiskKernel>,
    ledger: Arc<PurchaseLedger>,
    capital: CapitalState,
    poll_timeout: Duration,
    processed: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl DryRunExecutor {
    pub fn new(kernel: Arc<RiskKernel>, ledger: Arc<PurchaseLedger>, capital: CapitalState) -> Self {
        Self {
            kernel,
            ledger,
            capital,
            poll_timeout: Duration::from_millis(500),
            processed: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled or the kernel is killed.
    pub async fn run(&self, ingestor: &dyn IntentIngestor) -> Result<RunSummary> {
        ingestor.start().await?;
        info!(
            capital = %self.capital.current_capital(),
            daily_pnl = %self.capital.daily_pnl(),
            "Dry-run executor started"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            if self.kernel.is_killed() {
                error!(reason = ?self.kernel.kill_reason(), "Risk kernel killed, halting intake");
                break;
            }

            let Some(intent) = ingestor.get_next_intent(self.poll_timeout).await else {
                continue;
            };

            if let Err(e) = self.process(&intent).await {
                warn!(intent_id = %intent.intent_id(), error = %e, "Failed to process intent");
            }
        }

        ingestor.stop().await?;

        let summary = RunSummary {
            processed: self.processed.load(Ordering::Relaxed),
            killed: self.kernel.is_killed(),
            kill_reason: self.kernel.kill_reason(),
            ingest: ingestor.get_stats(),
        };
        info!(
            processed = summary.processed,
            validated = summary.ingest.validated,
            rejected = summary.ingest.rejected,
            parse_errors = summary.ingest.parse_errors,
            "Dry-run executor stopped"
        );
        Ok(summary)
    }

    /// Decide what to do with one validated intent.
    pub async fn process(&self, intent: &TradeIntent) -> Result<DryRunOutcome> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let outcome = match intent.side() {
            TradeSide::Buy => self.process_buy(intent).await?,
            TradeSide::Sell => self.process_sell(intent).await?,
        };

        match &outcome {
            DryRunOutcome::WouldBuy { intent_id, usdc } => {
                info!(intent_id = %intent_id, market = %intent.market_id(), usdc = %usdc, "DRY RUN: would BUY")
            }
            DryRunOutcome::BuyRejected { intent_id, decision } => warn!(
                intent_id = %intent_id,
                status = %decision.status,
                reason = %decision.reason,
                adjusted_size = ?decision.adjusted_size,
                "BUY refused by risk kernel"
            ),
            DryRunOutcome::WouldSell { intent_id, tokens, tracked } => {
                info!(intent_id = %intent_id, market = %intent.market_id(), tokens = %tokens, tracked = %tracked, "DRY RUN: would SELL")
            }
            DryRunOutcome::SellSkipped { intent_id, reason } => {
                warn!(intent_id = %intent_id, reason = %reason, "SELL skipped")
            }
        }
        Ok(outcome)
    }

    async fn process_buy(&self, intent: &TradeIntent) -> Result<DryRunOutcome> {
        let positions = self.open_positions().await?;
        let size = intent.size().amount();
        let decision = self.kernel.approve_trade(size, &positions, &self.capital);

        let intent_id = intent.intent_id().to_string();
        if decision.is_approved() {
            Ok(DryRunOutcome::WouldBuy { intent_id, usdc: size })
        } else {
            Ok(DryRunOutcome::BuyRejected { intent_id, decision })
        }
    }

    async fn process_sell(&self, intent: &TradeIntent) -> Result<DryRunOutcome> {
        let market = intent.market_id();
        let asset = intent.outcome().as_str();
        let intent_id = intent.intent_id().to_string();

        let sell = match intent.metadata().trader_sell_fraction() {
            Some(fraction) => self.ledger.calculate_sell_amount(market, asset, fraction).await?,
            None => {
                // Without the trader's balance, mirror the requested size up to what we hold.
                debug!(intent_id = %intent_id, "No trader sell fraction, capping requested size");
                let mut full = self.ledger.calculate_sell_amount(market, asset, Decimal::ONE).await?;
                full.amount = full.amount.min(intent.size().amount());
                full
            }
        };

        if let Some(reason) = sell.warning {
            return Ok(DryRunOutcome::SellSkipped { intent_id, reason });
        }
        Ok(DryRunOutcome::WouldSell {
            intent_id,
            tokens: sell.amount,
            tracked: sell.tracked_total,
        })
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        let holdings = self.ledger.open_holdings().await?;
        Ok(holdings
            .into_iter()
            .map(|h| {
                // Lots recorded by hand may carry a raw token ID. They still
                // occupy a position slot.
                let outcome = match h.asset_id.parse::<Outcome>() {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            market = %h.market_id,
                            asset = %h.asset_id,
                            "Ledger asset is not an outcome name, counting it as YES"
                        );
                        Outcome::Yes
                    }
                };
                Position::new(h.market_id, outcome, h.tokens_remaining, h.average_price)
            })
            .collect())
    }
}
