//! Purchase ledger: what we actually bought, consumed FIFO by sells.
//!
//! Sell sizing is computed from these rows, never from the copied trader's
//! reported position.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::PurchaseRecord;

use super::Database;

/// Tokens taken from a single purchase lot by a sale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotAllocation {
    pub record_id: String,
    pub tokens: Decimal,
    pub price: Decimal,
}

/// Result of allocating a sale across purchase lots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleAllocation {
    pub requested: Decimal,
    pub allocated: Decimal,
    /// Tokens sold beyond what the ledger holds
    pub shortfall: Decimal,
    pub lots: Vec<LotAllocation>,
}

impl SaleAllocation {
    pub fn is_oversold(&self) -> bool {
        self.shortfall > Decimal::ZERO
    }

    /// USDC originally paid for the allocated tokens.
    pub fn cost_basis(&self) -> Decimal {
        self.lots.iter().map(|l| l.tokens * l.price).sum()
    }
}

/// Sell size derived from tracked holdings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SellAmount {
    pub tracked_total: Decimal,
    pub fraction: Decimal,
    pub amount: Decimal,
    pub warning: Option<String>,
}

/// Remaining tokens for one market/asset pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenHolding {
    pub market_id: String,
    pub asset_id: String,
    pub tokens_remaining: Decimal,
    /// Remaining-weighted average purchase price
    pub average_price: Decimal,
    pub lots: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct PurchaseRow {
    id: String,
    market_id: String,
    asset_id: String,
    tokens_bought: String,
    tokens_remaining: String,
    price: String,
    usdc_spent: String,
    purchased_at: i64,
    source_trader: String,
    intent_id: String,
    order_id: Option<String>,
}

impl TryFrom<PurchaseRow> for PurchaseRecord {
    type Error = anyhow::Error;

    fn try_from(row: PurchaseRow) -> Result<Self> {
        let purchased_at = Utc
            .timestamp_millis_opt(row.purchased_at)
            .single()
            .with_context(|| format!("Invalid purchased_at for {}", row.id))?;

        Ok(Self {
            tokens_bought: parse_decimal(&row.tokens_bought, "tokens_bought")?,
            tokens_remaining: parse_decimal(&row.tokens_remaining, "tokens_remaining")?,
            price: parse_decimal(&row.price, "price")?,
            usdc_spent: parse_decimal(&row.usdc_spent, "usdc_spent")?,
            id: row.id,
            market_id: row.market_id,
            asset_id: row.asset_id,
            purchased_at,
            source_trader: row.source_trader,
            intent_id: row.intent_id,
            order_id: row.order_id,
        })
    }
}

fn parse_decimal(raw: &str, column: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Corrupt {} value {:?}", column, raw))
}

const SELECT_COLUMNS: &str = "id, market_id, asset_id, tokens_bought, tokens_remaining, price, \
     usdc_spent, purchased_at, source_trader, intent_id, order_id";

/// FIFO purchase ledger.
///
/// All mutations go through one write lock and one SQL transaction each, so
/// concurrent sells can never allocate the same tokens twice.
pub struct PurchaseLedger {
    db: Database,
    write_lock: Mutex<()>,
}

impl PurchaseLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Append a BUY fill. Tokens remaining start equal to tokens bought.
    pub async fn record_purchase(&self, record: &PurchaseRecord) -> Result<()> {
        anyhow::ensure!(
            record.tokens_bought > Decimal::ZERO,
            "tokens_bought must be positive, got {}",
            record.tokens_bought
        );
        anyhow::ensure!(
            record.price >= Decimal::ZERO,
            "price must not be negative, got {}",
            record.price
        );

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO purchases (
                id, market_id, asset_id, tokens_bought, tokens_remaining, price,
                usdc_spent, purchased_at, source_trader, intent_id, order_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.market_id)
        .bind(&record.asset_id)
        .bind(record.tokens_bought.to_string())
        .bind(record.tokens_bought.to_string())
        .bind(record.price.to_string())
        .bind(record.usdc_spent.to_string())
        .bind(record.purchased_at.timestamp_millis())
        .bind(&record.source_trader)
        .bind(&record.intent_id)
        .bind(&record.order_id)
        .execute(self.db.pool())
        .await
        .context("Failed to record purchase")?;

        info!(
            market = %record.market_id,
            asset = %record.asset_id,
            tokens = %record.tokens_bought,
            price = %record.price,
            intent_id = %record.intent_id,
            "Recorded purchase"
        );
        Ok(())
    }

    /// Allocate a sale against every lot still holding tokens, oldest first.
    ///
    /// `at_time` is the sale's timestamp and only feeds the log. Fill clocks
    /// and sale clocks are not comparable, so lots stamped after it still
    /// count. Overselling allocates everything available and reports the rest as
    /// `shortfall`; remaining quantities never go negative.
    pub async fn record_sale(
        &self,
        market_id: &str,
        asset_id: &str,
        tokens_sold: Decimal,
        at_time: DateTime<Utc>,
    ) -> Result<SaleAllocation> {
        anyhow::ensure!(
            tokens_sold > Decimal::ZERO,
            "tokens_sold must be positive, got {}",
            tokens_sold
        );

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.pool().begin().await?;

        let rows: Vec<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM purchases \
             WHERE market_id = ? AND asset_id = ? \
             ORDER BY purchased_at ASC, seq ASC",
            SELECT_COLUMNS
        ))
        .bind(market_id)
        .bind(asset_id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load purchase lots")?;

        let mut outstanding = tokens_sold;
        let mut lots = Vec::new();

        for row in rows {
            if outstanding <= Decimal::ZERO {
                break;
            }
            let remaining = parse_decimal(&row.tokens_remaining, "tokens_remaining")?;
            if remaining <= Decimal::ZERO {
                continue;
            }

            let take = remaining.min(outstanding);
            let left = remaining - take;
            sqlx::query("UPDATE purchases SET tokens_remaining = ? WHERE id = ?")
                .bind(left.to_string())
                .bind(&row.id)
                .execute(&mut *tx)
                .await?;

            outstanding -= take;
            lots.push(LotAllocation {
                record_id: row.id,
                tokens: take,
                price: parse_decimal(&row.price, "price")?,
            });
        }

        tx.commit().await.context("Failed to commit sale allocation")?;

        let allocation = SaleAllocation {
            requested: tokens_sold,
            allocated: tokens_sold - outstanding,
            shortfall: outstanding,
            lots,
        };

        if allocation.is_oversold() {
            warn!(
                market = %market_id,
                asset = %asset_id,
                requested = %allocation.requested,
                allocated = %allocation.allocated,
                shortfall = %allocation.shortfall,
                at = %at_time,
                "Sale exceeds tracked holdings, ledger has drifted"
            );
        } else {
            debug!(
                market = %market_id,
                asset = %asset_id,
                tokens = %allocation.allocated,
                lots = allocation.lots.len(),
                at = %at_time,
                "Allocated sale"
            );
        }

        Ok(allocation)
    }

    /// Tokens we still hold for a market/asset according to the ledger.
    pub async fn get_total_bought(&self, market_id: &str, asset_id: &str) -> Result<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT tokens_remaining FROM purchases WHERE market_id = ? AND asset_id = ?",
        )
        .bind(market_id)
        .bind(asset_id)
        .fetch_all(self.db.pool())
        .await?;

        let mut total = Decimal::ZERO;
        for (raw,) in rows {
            total += parse_decimal(&raw, "tokens_remaining")?;
        }
        Ok(total)
    }

    /// Size a sell as a fraction of tracked holdings.
    ///
    /// With nothing tracked the amount is zero and a warning is attached; the
    /// copied trader's own position is never used as a fallback.
    pub async fn calculate_sell_amount(
        &self,
        market_id: &str,
        asset_id: &str,
        trader_sell_fraction: Decimal,
    ) -> Result<SellAmount> {
        let tracked_total = self.get_total_bought(market_id, asset_id).await?;
        let fraction = trader_sell_fraction.max(Decimal::ZERO).min(Decimal::ONE);

        if tracked_total.is_zero() {
            let warning = format!(
                "No tracked purchases for {}/{}, refusing to size sell",
                market_id, asset_id
            );
            warn!(market = %market_id, asset = %asset_id, "{}", warning);
            return Ok(SellAmount {
                tracked_total,
                fraction,
                amount: Decimal::ZERO,
                warning: Some(warning),
            });
        }

        Ok(SellAmount {
            tracked_total,
            fraction,
            amount: tracked_total * fraction,
            warning: None,
        })
    }

    /// Delete every lot for a fully closed position. Returns rows removed.
    pub async fn clear_position(&self, market_id: &str, asset_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM purchases WHERE market_id = ? AND asset_id = ?")
            .bind(market_id)
            .bind(asset_id)
            .execute(self.db.pool())
            .await?;

        info!(
            market = %market_id,
            asset = %asset_id,
            rows = result.rows_affected(),
            "Cleared position from ledger"
        );
        Ok(result.rows_affected())
    }

    /// Lots for a market/asset in FIFO order.
    pub async fn list_purchases(&self, market_id: &str, asset_id: &str) -> Result<Vec<PurchaseRecord>> {
        let rows: Vec<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {} FROM purchases WHERE market_id = ? AND asset_id = ? \
             ORDER BY purchased_at ASC, seq ASC",
            SELECT_COLUMNS
        ))
        .bind(market_id)
        .bind(asset_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(PurchaseRecord::try_from).collect()
    }

    /// Market/asset pairs that still hold tokens.
    pub async fn open_holdings(&self) -> Result<Vec<OpenHolding>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT market_id, asset_id, tokens_remaining, price FROM purchases",
        )
        .fetch_all(self.db.pool())
        .await?;

        // (tokens remaining, cost of remaining, lot count)
        let mut grouped: BTreeMap<(String, String), (Decimal, Decimal, usize)> = BTreeMap::new();
        for (market_id, asset_id, raw_remaining, raw_price) in rows {
            let remaining = parse_decimal(&raw_remaining, "tokens_remaining")?;
            let price = parse_decimal(&raw_price, "price")?;
            let entry = grouped
                .entry((market_id, asset_id))
                .or_insert((Decimal::ZERO, Decimal::ZERO, 0));
            entry.0 += remaining;
            entry.1 += remaining * price;
            entry.2 += 1;
        }

        Ok(grouped
            .into_iter()
            .filter(|(_, (remaining, _, _))| *remaining > Decimal::ZERO)
            .map(|((market_id, asset_id), (tokens_remaining, cost, lots))| OpenHolding {
                market_id,
                asset_id,
                average_price: cost / tokens_remaining,
                tokens_remaining,
                lots,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const MARKET: &str = "0xmarket";
    const ASSET: &str = "yes-token";

    async fn ledger() -> PurchaseLedger {
        PurchaseLedger::new(Database::in_memory().await.unwrap())
    }

    fn lot(tokens: Decimal, at: DateTime<Utc>) -> PurchaseRecord {
        PurchaseRecord::new(MARKET, ASSET, tokens, dec!(0.5), at, "0xtrader", "intent")
    }

    /// P1 at t0 and P2 at t0+1s, 10 tokens each.
    async fn seeded() -> PurchaseLedger {
        let ledger = ledger().await;
        let t0 = Utc::now() - Duration::minutes(5);
        ledger.record_purchase(&lot(dec!(10), t0)).await.unwrap();
        ledger
            .record_purchase(&lot(dec!(10), t0 + Duration::seconds(1)))
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_fifo_allocation() {
        let ledger = seeded().await;

        let sale = ledger
            .record_sale(MARKET, ASSET, dec!(15), Utc::now())
            .await
            .unwrap();
        assert_eq!(sale.allocated, dec!(15));
        assert!(!sale.is_oversold());
        assert_eq!(sale.lots.len(), 2);
        assert_eq!(sale.cost_basis(), dec!(7.5));

        let lots = ledger.list_purchases(MARKET, ASSET).await.unwrap();
        assert_eq!(lots[0].tokens_remaining, dec!(0));
        assert_eq!(lots[1].tokens_remaining, dec!(5));
        assert!(lots[0].is_exhausted());
        assert!(!lots[1].is_exhausted());
        assert_eq!(ledger.get_total_bought(MARKET, ASSET).await.unwrap(), dec!(5));
    }

    #[tokio::test]
    async fn test_fifo_follows_timestamps_not_insert_order() {
        let ledger = ledger().await;
        let t0 = Utc::now() - Duration::minutes(5);
        let late = lot(dec!(10), t0 + Duration::seconds(30));
        let early = lot(dec!(10), t0);
        ledger.record_purchase(&late).await.unwrap();
        ledger.record_purchase(&early).await.unwrap();

        let sale = ledger.record_sale(MARKET, ASSET, dec!(4), Utc::now()).await.unwrap();
        assert_eq!(sale.lots[0].record_id, early.id);
    }

    #[tokio::test]
    async fn test_oversell_reports_shortfall() {
        let ledger = seeded().await;

        let sale = ledger
            .record_sale(MARKET, ASSET, dec!(25), Utc::now())
            .await
            .unwrap();
        assert_eq!(sale.allocated, dec!(20));
        assert_eq!(sale.shortfall, dec!(5));
        assert!(sale.is_oversold());

        let lots = ledger.list_purchases(MARKET, ASSET).await.unwrap();
        assert!(lots.iter().all(|l| l.tokens_remaining == Decimal::ZERO));
        assert_eq!(ledger.get_total_bought(MARKET, ASSET).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_sale_allocates_fills_stamped_after_sale_time() {
        let ledger = ledger().await;
        let now = Utc::now();
        let fill = lot(dec!(10), now + Duration::milliseconds(50));
        ledger.record_purchase(&fill).await.unwrap();

        let sale = ledger.record_sale(MARKET, ASSET, dec!(10), now).await.unwrap();
        assert_eq!(sale.allocated, dec!(10));
        assert_eq!(sale.shortfall, dec!(0));
        assert!(!sale.is_oversold());
        assert_eq!(sale.lots[0].record_id, fill.id);
        assert_eq!(ledger.get_total_bought(MARKET, ASSET).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_calculate_sell_amount() {
        let ledger = seeded().await;

        let half = ledger
            .calculate_sell_amount(MARKET, ASSET, dec!(0.5))
            .await
            .unwrap();
        assert_eq!(half.tracked_total, dec!(20));
        assert_eq!(half.amount, dec!(10));
        assert!(half.warning.is_none());

        let clamped = ledger
            .calculate_sell_amount(MARKET, ASSET, dec!(1.7))
            .await
            .unwrap();
        assert_eq!(clamped.amount, dec!(20));
    }

    #[tokio::test]
    async fn test_sell_amount_without_holdings_warns() {
        let ledger = ledger().await;

        let amount = ledger
            .calculate_sell_amount(MARKET, ASSET, dec!(0.5))
            .await
            .unwrap();
        assert_eq!(amount.amount, Decimal::ZERO);
        assert!(amount.warning.is_some());
    }

    #[tokio::test]
    async fn test_clear_position() {
        let ledger = seeded().await;
        ledger
            .record_purchase(&PurchaseRecord::new(
                "0xother",
                ASSET,
                dec!(3),
                dec!(0.2),
                Utc::now(),
                "0xtrader",
                "intent-2",
            ))
            .await
            .unwrap();

        assert_eq!(ledger.clear_position(MARKET, ASSET).await.unwrap(), 2);
        assert!(ledger.list_purchases(MARKET, ASSET).await.unwrap().is_empty());

        let open = ledger.open_holdings().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].market_id, "0xother");
        assert_eq!(open[0].tokens_remaining, dec!(3));
        assert_eq!(open[0].average_price, dec!(0.2));
    }

    #[tokio::test]
    async fn test_concurrent_sales_never_double_allocate() {
        let ledger = seeded().await;
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .record_sale(MARKET, ASSET, dec!(3), Utc::now())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut allocated = Decimal::ZERO;
        let mut shortfall = Decimal::ZERO;
        for handle in handles {
            let sale = handle.await.unwrap();
            allocated += sale.allocated;
            shortfall += sale.shortfall;
        }

        assert_eq!(allocated, dec!(20));
        assert_eq!(shortfall, dec!(10));
        assert_eq!(ledger.get_total_bought(MARKET, ASSET).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_quantities() {
        let ledger = ledger().await;
        assert!(ledger
            .record_purchase(&lot(dec!(0), Utc::now()))
            .await
            .is_err());
        assert!(ledger
            .record_sale(MARKET, ASSET, dec!(-1), Utc::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ledger.db").display());

        {
            let ledger = PurchaseLedger::new(Database::new(&url).await.unwrap());
            ledger
                .record_purchase(&lot(dec!(12.5), Utc::now()).with_order_id("order-1"))
                .await
                .unwrap();
        }

        let ledger = PurchaseLedger::new(Database::new(&url).await.unwrap());
        let lots = ledger.list_purchases(MARKET, ASSET).await.unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].tokens_remaining, dec!(12.5));
        assert_eq!(lots[0].order_id.as_deref(), Some("order-1"));
    }
}
