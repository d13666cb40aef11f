//! Trade-intent intake for a Polymarket copy trader.
//!
//! Untrusted intents arrive over a JSONL file tail or HTTP, are parsed into
//! [`models::TradeIntent`], pass the [`trading::Firewall`], and wait in a
//! bounded queue. The executor side gates BUYs with the [`trading::RiskKernel`]
//! and sizes SELLs from the [`db::PurchaseLedger`].

pub mod db;
pub mod executor;
pub mod ingest;
pub mod models;
pub mod trading;
