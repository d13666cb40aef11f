//! Data models for intents, positions, capital snapshots and ledger rows.

mod intent;
mod position;
mod purchase;

pub use intent::{
    IntentError, IntentMetadata, IntentSize, Outcome, TradeIntent, TradeSide, MAX_BUY_LIMIT,
    MIN_SELL_LIMIT,
};
pub use position::{CapitalState, Position};
pub use purchase::PurchaseRecord;
