//! Validation firewall: the single boundary between the untrusted intent source
//! and everything that can move money.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. source trader allowlist
//! 2. market allowlist (empty = permit all)
//! 3. staleness
//! 4. size bounds for the intent's denomination
//! 5. duplicate intent ID within the dedup window
//!
//! An ID is remembered only once an intent passes every check, so a rejected
//! intent can be corrected and resubmitted under the same ID.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{IntentSize, TradeIntent};

use super::FirewallConfig;

/// Why the firewall refused an intent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("source trader {0} is not on the allowlist")]
    TraderNotAllowed(String),

    #[error("market {0} is not on the allowlist")]
    MarketNotAllowed(String),

    #[error("intent age {age_ms}ms outside allowed window of {max_age_ms}ms")]
    Stale { age_ms: i64, max_age_ms: i64 },

    #[error("{denomination} size {size} outside [{min}, {max}]")]
    SizeOutOfBounds {
        denomination: &'static str,
        size: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("intent {intent_id} already seen {seen_ms_ago}ms ago")]
    Duplicate { intent_id: String, seen_ms_ago: i64 },
}

impl ValidationError {
    /// Stable machine-readable reason.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::TraderNotAllowed(_) => "trader_not_allowed",
            ValidationError::MarketNotAllowed(_) => "market_not_allowed",
            ValidationError::Stale { .. } => "stale_intent",
            ValidationError::SizeOutOfBounds { .. } => "size_out_of_bounds",
            ValidationError::Duplicate { .. } => "duplicate_intent",
        }
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallStats {
    pub passed: u64,
    pub trader_not_allowed: u64,
    pub market_not_allowed: u64,
    pub stale: u64,
    pub size_out_of_bounds: u64,
    pub duplicate: u64,
    /// IDs currently remembered for deduplication
    pub tracked_ids: usize,
}

impl FirewallStats {
    pub fn rejected(&self) -> u64 {
        self.trader_not_allowed
            + self.market_not_allowed
            + self.stale
            + self.size_out_of_bounds
            + self.duplicate
    }
}

#[derive(Default)]
struct Counters {
    passed: AtomicU64,
    trader_not_allowed: AtomicU64,
    market_not_allowed: AtomicU64,
    stale: AtomicU64,
    size_out_of_bounds: AtomicU64,
    duplicate: AtomicU64,
}

impl Counters {
    fn record(&self, err: &ValidationError) {
        let counter = match err {
            ValidationError::TraderNotAllowed(_) => &self.trader_not_allowed,
            ValidationError::MarketNotAllowed(_) => &self.market_not_allowed,
            ValidationError::Stale { .. } => &self.stale,
            ValidationError::SizeOutOfBounds { .. } => &self.size_out_of_bounds,
            ValidationError::Duplicate { .. } => &self.duplicate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct SeenIds {
    first_seen: HashMap<String, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

/// Intent firewall. Safe to share between ingestors behind an `Arc`.
pub struct Firewall {
    config: FirewallConfig,
    allowed_traders: HashSet<String>,
    allowed_markets: HashSet<String>,
    seen: Mutex<SeenIds>,
    counters: Counters,
}

impl Firewall {
    pub fn new(config: FirewallConfig) -> Self {
        let allowed_traders = config
            .allowed_traders
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .collect();
        let allowed_markets = config
            .allowed_markets
            .iter()
            .map(|m| m.trim().to_string())
            .collect();

        Self {
            config,
            allowed_traders,
            allowed_markets,
            seen: Mutex::new(SeenIds {
                first_seen: HashMap::new(),
                last_sweep: Utc::now(),
            }),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// Validate an intent against the current wall-clock time.
    pub fn validate(&self, intent: &TradeIntent) -> Result<(), ValidationError> {
        self.validate_at(intent, Utc::now())
    }

    /// Validate an intent as of `now`.
    pub fn validate_at(
        &self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let result = self.run_checks(intent, now);
        match &result {
            Ok(()) => {
                self.counters.passed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    intent_id = %intent.intent_id(),
                    trader = %intent.source_trader(),
                    market = %intent.market_id(),
                    side = %intent.side(),
                    "Intent passed firewall"
                );
            }
            Err(e) => {
                self.counters.record(e);
                warn!(
                    intent_id = %intent.intent_id(),
                    trader = %intent.source_trader(),
                    market = %intent.market_id(),
                    reason = e.reason_code(),
                    detail = %e,
                    "Intent rejected by firewall"
                );
            }
        }
        result
    }

    fn run_checks(&self, intent: &TradeIntent, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.check_trader(intent)?;
        self.check_market(intent)?;
        self.check_staleness(intent, now)?;
        self.check_size(intent)?;
        self.check_duplicate(intent, now)
    }

    fn check_trader(&self, intent: &TradeIntent) -> Result<(), ValidationError> {
        // Intent addresses are already lowercase.
        if self.allowed_traders.contains(intent.source_trader()) {
            Ok(())
        } else {
            Err(ValidationError::TraderNotAllowed(intent.source_trader().to_string()))
        }
    }

    fn check_market(&self, intent: &TradeIntent) -> Result<(), ValidationError> {
        if self.allowed_markets.is_empty() || self.allowed_markets.contains(intent.market_id()) {
            Ok(())
        } else {
            Err(ValidationError::MarketNotAllowed(intent.market_id().to_string()))
        }
    }

    fn check_staleness(
        &self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let age = intent.age_at(now);
        let max_age = self.config.max_intent_age();
        // A timestamp further in the future than the window is as untrustworthy as an old one.
        if age > max_age || age < -max_age {
            return Err(ValidationError::Stale {
                age_ms: age.num_milliseconds(),
                max_age_ms: max_age.num_milliseconds(),
            });
        }
        Ok(())
    }

    fn check_size(&self, intent: &TradeIntent) -> Result<(), ValidationError> {
        let (denomination, size, min, max) = match intent.size() {
            IntentSize::Usdc(v) => ("USDC", v, self.config.min_order_usdc, self.config.max_size_usdc),
            IntentSize::Tokens(v) => (
                "token",
                v,
                self.config.min_order_tokens,
                self.config.max_size_tokens,
            ),
        };

        if size < min || size > max {
            return Err(ValidationError::SizeOutOfBounds {
                denomination,
                size,
                min,
                max,
            });
        }
        Ok(())
    }

    fn check_duplicate(
        &self,
        intent: &TradeIntent,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if now - seen.last_sweep >= self.config.cleanup_interval() {
            Self::sweep(&mut seen, now, self.config.dedup_retention());
        }

        if let Some(first_seen) = seen.first_seen.get(intent.intent_id()) {
            let since = now - *first_seen;
            if since <= self.config.dedup_window() {
                return Err(ValidationError::Duplicate {
                    intent_id: intent.intent_id().to_string(),
                    seen_ms_ago: since.num_milliseconds(),
                });
            }
        }

        seen.first_seen.insert(intent.intent_id().to_string(), now);
        Ok(())
    }

    /// Drop remembered IDs older than the retention period. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::sweep(&mut seen, now, self.config.dedup_retention())
    }

    fn sweep(seen: &mut SeenIds, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = seen.first_seen.len();
        seen.first_seen.retain(|_, first| now - *first <= retention);
        seen.last_sweep = now;

        let removed = before - seen.first_seen.len();
        if removed > 0 {
            debug!(removed, remaining = seen.first_seen.len(), "Swept dedup cache");
        }
        removed
    }

    pub fn stats(&self) -> FirewallStats {
        let tracked_ids = self
            .seen
            .lock()
            .map(|s| s.first_seen.len())
            .unwrap_or_default();

        FirewallStats {
            passed: self.counters.passed.load(Ordering::Relaxed),
            trader_not_allowed: self.counters.trader_not_allowed.load(Ordering::Relaxed),
            market_not_allowed: self.counters.market_not_allowed.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            size_out_of_bounds: self.counters.size_out_of_bounds.load(Ordering::Relaxed),
            duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            tracked_ids,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};

    pub(crate) const TRADER: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdef0123";

    pub(crate) fn test_config() -> FirewallConfig {
        FirewallConfig {
            allowed_traders: vec![format!("0x{}", TRADER[2..].to_uppercase())],
            ..FirewallConfig::default()
        }
    }

    pub(crate) fn payload(id: &str, created: DateTime<Utc>) -> Value {
        json!({
            "intent_id": id,
            "timestamp": created.to_rfc3339(),
            "source_trader": TRADER,
            "market_id": "0xmarket",
            "outcome": "YES",
            "side": "BUY",
            "limit_price": "0.5",
            "size_usdc": "25",
        })
    }

    fn intent(id: &str, created: DateTime<Utc>) -> TradeIntent {
        TradeIntent::from_value(payload(id, created)).unwrap()
    }

    #[test]
    fn test_trader_allowlist_is_case_insensitive() {
        let firewall = Firewall::new(test_config());
        let now = Utc::now();
        assert!(firewall.validate_at(&intent("a", now), now).is_ok());

        let mut other = payload("b", now);
        other["source_trader"] = json!("0x2222222222222222222222222222222222222222");
        let err = firewall
            .validate_at(&TradeIntent::from_value(other).unwrap(), now)
            .unwrap_err();
        assert_eq!(err.reason_code(), "trader_not_allowed");
    }

    #[test]
    fn test_market_allowlist() {
        let now = Utc::now();

        let open = Firewall::new(test_config());
        assert!(open.validate_at(&intent("a", now), now).is_ok());

        let restricted = Firewall::new(FirewallConfig {
            allowed_markets: vec!["0xother".to_string()],
            ..test_config()
        });
        let err = restricted.validate_at(&intent("a", now), now).unwrap_err();
        assert_eq!(err, ValidationError::MarketNotAllowed("0xmarket".to_string()));
    }

    #[test]
    fn test_staleness_boundary() {
        let firewall = Firewall::new(test_config());
        let now = Utc::now();

        let old = intent("old", now - Duration::seconds(11));
        assert_eq!(
            firewall.validate_at(&old, now).unwrap_err().reason_code(),
            "stale_intent"
        );

        let fresh = intent("fresh", now - Duration::seconds(9));
        assert!(firewall.validate_at(&fresh, now).is_ok());

        let future = intent("future", now + Duration::seconds(60));
        assert_eq!(
            firewall.validate_at(&future, now).unwrap_err().reason_code(),
            "stale_intent"
        );
    }

    #[test]
    fn test_size_bounds_per_denomination() {
        let firewall = Firewall::new(test_config());
        let now = Utc::now();

        let mut big = payload("big", now);
        big["size_usdc"] = json!("1000.01");
        let err = firewall
            .validate_at(&TradeIntent::from_value(big).unwrap(), now)
            .unwrap_err();
        assert!(matches!(err, ValidationError::SizeOutOfBounds { denomination: "USDC", .. }));

        let mut dust = payload("dust", now);
        dust["size_usdc"] = json!("0.5");
        let err = firewall
            .validate_at(&TradeIntent::from_value(dust).unwrap(), now)
            .unwrap_err();
        assert_eq!(err.reason_code(), "size_out_of_bounds");

        let mut sell = payload("sell", now);
        sell["side"] = json!("SELL");
        sell.as_object_mut().unwrap().remove("size_usdc");
        sell["size_tokens"] = json!("4");
        let err = firewall
            .validate_at(&TradeIntent::from_value(sell.clone()).unwrap(), now)
            .unwrap_err();
        assert!(matches!(err, ValidationError::SizeOutOfBounds { denomination: "token", .. }));

        sell["size_tokens"] = json!("5");
        assert!(firewall
            .validate_at(&TradeIntent::from_value(sell).unwrap(), now)
            .is_ok());
    }

    #[test]
    fn test_duplicate_within_window() {
        let firewall = Firewall::new(test_config());
        let now = Utc::now();
        let first = intent("dup", now);

        assert!(firewall.validate_at(&first, now).is_ok());
        let err = firewall
            .validate_at(&first, now + Duration::seconds(1))
            .unwrap_err();
        assert_eq!(err.reason_code(), "duplicate_intent");

        let stats = firewall.stats();
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.duplicate, 1);
        assert_eq!(stats.rejected(), 1);
    }

    #[test]
    fn test_rejected_intent_is_not_remembered() {
        let firewall = Firewall::new(test_config());
        let now = Utc::now();

        let stale = intent("retry", now - Duration::seconds(30));
        assert!(firewall.validate_at(&stale, now).is_err());

        let corrected = intent("retry", now);
        assert!(firewall.validate_at(&corrected, now).is_ok());
    }

    #[test]
    fn test_id_expires_after_window_and_is_swept() {
        let config = test_config();
        let window = config.dedup_window();
        let firewall = Firewall::new(config);
        let t0 = Utc::now();

        assert!(firewall.validate_at(&intent("x", t0), t0).is_ok());

        let later = t0 + window + Duration::seconds(1);
        assert!(firewall.validate_at(&intent("x", later), later).is_ok());

        let much_later = later + window * 2 + Duration::seconds(1);
        assert_eq!(firewall.cleanup_expired_at(much_later), 1);
        assert_eq!(firewall.stats().tracked_ids, 0);
    }

    #[test]
    fn test_concurrent_validate_admits_one() {
        let firewall = std::sync::Arc::new(Firewall::new(test_config()));
        let now = Utc::now();
        let shared = intent("race", now);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let firewall = firewall.clone();
                let intent = shared.clone();
                std::thread::spawn(move || firewall.validate_at(&intent, now).is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(firewall.stats().duplicate, 7);
    }

    #[test]
    fn test_check_order_trader_before_staleness() {
        let firewall = Firewall::new(FirewallConfig {
            allowed_traders: vec![],
            ..test_config()
        });
        let now = Utc::now();
        let stale_unknown = intent("z", now - Duration::seconds(120));

        let err = firewall.validate_at(&stale_unknown, now).unwrap_err();
        assert_eq!(err.reason_code(), "trader_not_allowed");
    }
}
