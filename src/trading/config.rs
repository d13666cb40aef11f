//! Firewall, risk and ingestion configuration.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Thresholds applied by the validation firewall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Trader addresses whose intents may be copied (compared lowercase)
    pub allowed_traders: Vec<String>,

    /// Markets intents may target; empty permits every market
    pub allowed_markets: Vec<String>,

    /// Maximum intent age before it is considered stale (seconds)
    pub max_intent_age_secs: i64,

    /// How long a seen intent ID is rejected as a duplicate (seconds)
    pub dedup_window_secs: i64,

    /// How often the seen-ID map is swept (seconds)
    pub cleanup_interval_secs: i64,

    /// Largest BUY accepted, in USDC
    pub max_size_usdc: Decimal,

    /// Largest SELL accepted, in tokens
    pub max_size_tokens: Decimal,

    /// Venue minimum order, in USDC
    pub min_order_usdc: Decimal,

    /// Venue minimum order, in tokens
    pub min_order_tokens: Decimal,
}

impl FirewallConfig {
    pub fn max_intent_age(&self) -> Duration {
        Duration::seconds(self.max_intent_age_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::seconds(self.dedup_window_secs)
    }

    /// Seen IDs are kept for twice the dedup window.
    pub fn dedup_retention(&self) -> Duration {
        Duration::seconds(self.dedup_window_secs.saturating_mul(2))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::seconds(self.cleanup_interval_secs)
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            allowed_traders: Vec::new(),
            allowed_markets: Vec::new(),
            max_intent_age_secs: 10,
            dedup_window_secs: 300,       // 5 minutes
            cleanup_interval_secs: 60,
            max_size_usdc: dec!(1000),
            max_size_tokens: dec!(5000),
            min_order_usdc: dec!(1),      // Polymarket min $1
            min_order_tokens: dec!(5),
        }
    }
}

/// Capital limits enforced by the risk kernel.
///
/// All percentages are fractions: `-0.05` means a 5% loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Capital the account started with, in USDC
    pub starting_capital: Decimal,

    /// Daily P&L at or below which new trades are refused for the day
    pub daily_stop_pct: Decimal,

    /// Total P&L at or below which the kernel kills itself
    pub hard_kill_pct: Decimal,

    /// Largest single trade as a fraction of current capital
    pub per_trade_cap_pct: Decimal,

    /// Maximum number of concurrent open positions
    pub max_positions: usize,

    /// Single-trade loss at or below which the kernel kills itself
    pub anomalous_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_capital: dec!(1000),
            daily_stop_pct: dec!(-0.05),
            hard_kill_pct: dec!(-0.20),
            per_trade_cap_pct: dec!(0.03),
            max_positions: 10,
            anomalous_loss_pct: dec!(-0.05),
        }
    }
}

/// Transport settings shared by the ingestors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Capacity of the validated-intent queue
    pub queue_capacity: usize,

    /// File-tail poll interval (milliseconds)
    pub poll_interval_ms: u64,

    /// Start tailing at the current end of file instead of replaying it
    pub start_at_end: bool,

    /// HTTP listen address
    pub http_bind: String,

    /// HTTP route accepting intents
    pub http_path: String,

    /// Upper bound for `stop()` (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            poll_interval_ms: 100,
            start_at_end: false,
            http_bind: "127.0.0.1:8787".to_string(),
            http_path: "/intent".to_string(),
            shutdown_timeout_ms: 5000,
        }
    }
}

/// Everything the intake side needs, assembled from defaults and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierConfig {
    pub firewall: FirewallConfig,
    pub risk: RiskConfig,
    pub ingest: IngestConfig,

    /// Purchase ledger location
    pub database_url: String,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            firewall: FirewallConfig::default(),
            risk: RiskConfig::default(),
            ingest: IngestConfig::default(),
            database_url: "sqlite:./intent_ledger.db?mode=rwc".to_string(),
        }
    }
}

impl CopierConfig {
    /// Load configuration from `COPIER_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("COPIER_ALLOWED_TRADERS") {
            config.firewall.allowed_traders = split_list(&v);
        }
        if let Some(v) = lookup("COPIER_ALLOWED_MARKETS") {
            config.firewall.allowed_markets = split_list(&v);
        }

        let fw = &mut config.firewall;
        override_parsed(&lookup, "COPIER_MAX_INTENT_AGE_SECS", &mut fw.max_intent_age_secs)?;
        override_parsed(&lookup, "COPIER_DEDUP_WINDOW_SECS", &mut fw.dedup_window_secs)?;
        override_parsed(&lookup, "COPIER_CLEANUP_INTERVAL_SECS", &mut fw.cleanup_interval_secs)?;
        override_parsed(&lookup, "COPIER_MAX_SIZE_USDC", &mut fw.max_size_usdc)?;
        override_parsed(&lookup, "COPIER_MAX_SIZE_TOKENS", &mut fw.max_size_tokens)?;
        override_parsed(&lookup, "COPIER_MIN_ORDER_USDC", &mut fw.min_order_usdc)?;
        override_parsed(&lookup, "COPIER_MIN_ORDER_TOKENS", &mut fw.min_order_tokens)?;

        let risk = &mut config.risk;
        override_parsed(&lookup, "COPIER_STARTING_CAPITAL", &mut risk.starting_capital)?;
        override_parsed(&lookup, "COPIER_DAILY_STOP_PCT", &mut risk.daily_stop_pct)?;
        override_parsed(&lookup, "COPIER_HARD_KILL_PCT", &mut risk.hard_kill_pct)?;
        override_parsed(&lookup, "COPIER_PER_TRADE_CAP_PCT", &mut risk.per_trade_cap_pct)?;
        override_parsed(&lookup, "COPIER_MAX_POSITIONS", &mut risk.max_positions)?;
        override_parsed(&lookup, "COPIER_ANOMALOUS_LOSS_PCT", &mut risk.anomalous_loss_pct)?;

        let ingest = &mut config.ingest;
        override_parsed(&lookup, "COPIER_QUEUE_CAPACITY", &mut ingest.queue_capacity)?;
        override_parsed(&lookup, "COPIER_POLL_INTERVAL_MS", &mut ingest.poll_interval_ms)?;
        override_parsed(&lookup, "COPIER_START_AT_END", &mut ingest.start_at_end)?;
        override_parsed(&lookup, "COPIER_SHUTDOWN_TIMEOUT_MS", &mut ingest.shutdown_timeout_ms)?;
        if let Some(v) = lookup("COPIER_HTTP_BIND") {
            ingest.http_bind = v;
        }
        if let Some(v) = lookup("COPIER_HTTP_PATH") {
            ingest.http_path = v;
        }
        if let Some(v) = lookup("COPIER_DATABASE_URL") {
            config.database_url = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the firewall or kernel meaningless.
    pub fn validate(&self) -> Result<()> {
        let fw = &self.firewall;
        anyhow::ensure!(fw.max_intent_age_secs > 0, "max intent age must be positive");
        anyhow::ensure!(fw.dedup_window_secs > 0, "dedup window must be positive");
        anyhow::ensure!(fw.cleanup_interval_secs > 0, "cleanup interval must be positive");
        anyhow::ensure!(
            fw.min_order_usdc <= fw.max_size_usdc,
            "min_order_usdc {} exceeds max_size_usdc {}",
            fw.min_order_usdc,
            fw.max_size_usdc
        );
        anyhow::ensure!(
            fw.min_order_tokens <= fw.max_size_tokens,
            "min_order_tokens {} exceeds max_size_tokens {}",
            fw.min_order_tokens,
            fw.max_size_tokens
        );

        let risk = &self.risk;
        anyhow::ensure!(risk.starting_capital > Decimal::ZERO, "starting capital must be positive");
        anyhow::ensure!(
            risk.per_trade_cap_pct > Decimal::ZERO && risk.per_trade_cap_pct <= Decimal::ONE,
            "per-trade cap must be in (0, 1]"
        );
        for (name, pct) in [
            ("daily stop", risk.daily_stop_pct),
            ("hard kill", risk.hard_kill_pct),
            ("anomalous loss", risk.anomalous_loss_pct),
        ] {
            anyhow::ensure!(pct < Decimal::ZERO, "{} threshold must be negative, got {}", name, pct);
        }

        anyhow::ensure!(self.ingest.queue_capacity > 0, "queue capacity must be positive");
        anyhow::ensure!(
            self.ingest.http_path.starts_with('/'),
            "HTTP path must start with '/'"
        );
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", key, raw))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CopierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.firewall.dedup_retention(), Duration::seconds(600));
        assert_eq!(config.risk.per_trade_cap_pct, dec!(0.03));
    }

    #[test]
    fn test_env_overrides() {
        let config = CopierConfig::from_lookup(lookup_from(&[
            ("COPIER_ALLOWED_TRADERS", "0xAAA, 0xbbb,,"),
            ("COPIER_MAX_INTENT_AGE_SECS", "30"),
            ("COPIER_PER_TRADE_CAP_PCT", "0.05"),
            ("COPIER_MAX_POSITIONS", "3"),
            ("COPIER_START_AT_END", "true"),
            ("COPIER_DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();

        assert_eq!(config.firewall.allowed_traders, vec!["0xAAA", "0xbbb"]);
        assert_eq!(config.firewall.max_intent_age_secs, 30);
        assert_eq!(config.risk.per_trade_cap_pct, dec!(0.05));
        assert_eq!(config.risk.max_positions, 3);
        assert!(config.ingest.start_at_end);
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = CopierConfig::from_lookup(lookup_from(&[("COPIER_MAX_POSITIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("COPIER_MAX_POSITIONS"));

        let err = CopierConfig::from_lookup(lookup_from(&[("COPIER_HARD_KILL_PCT", "0.2")]))
            .unwrap_err();
        assert!(err.to_string().contains("hard kill"));
    }
}
