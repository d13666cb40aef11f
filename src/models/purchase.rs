//! Purchase ledger rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::intent::TradeIntent;

/// Tokens actually acquired by one BUY fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    /// Ledger row identifier (UUID v4)
    pub id: String,

    pub market_id: String,

    /// Outcome token (asset) identifier
    pub asset_id: String,

    pub tokens_bought: Decimal,

    /// Tokens not yet allocated to a sale
    pub tokens_remaining: Decimal,

    /// Price paid per token
    pub price: Decimal,

    /// USDC spent on the fill
    pub usdc_spent: Decimal,

    pub purchased_at: DateTime<Utc>,

    /// Address of the copied trader
    pub source_trader: String,

    pub intent_id: String,

    #[serde(default)]
    pub order_id: Option<String>,
}

impl PurchaseRecord {
    pub fn new(
        market_id: impl Into<String>,
        asset_id: impl Into<String>,
        tokens_bought: Decimal,
        price: Decimal,
        purchased_at: DateTime<Utc>,
        source_trader: impl Into<String>,
        intent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.into(),
            asset_id: asset_id.into(),
            tokens_bought,
            tokens_remaining: tokens_bought,
            price,
            usdc_spent: tokens_bought * price,
            purchased_at,
            source_trader: source_trader.into(),
            intent_id: intent_id.into(),
            order_id: None,
        }
    }

    /// Record for a fill of `intent` on the given outcome token.
    pub fn from_fill(
        intent: &TradeIntent,
        asset_id: impl Into<String>,
        tokens_bought: Decimal,
        price: Decimal,
        filled_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            intent.market_id(),
            asset_id,
            tokens_bought,
            price,
            filled_at,
            intent.source_trader(),
            intent.intent_id(),
        )
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.tokens_remaining <= Decimal::ZERO
    }
}
