//! Trade intent model: the canonical form of a proposed trade observed from an
//! untrusted source.
//!
//! Intents are built only through [`TradeIntent::parse`] / [`TradeIntent::from_value`],
//! which fail closed. Once constructed an intent is never mutated.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::Address;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Highest limit price a BUY may carry before it is treated as mis-specified.
pub const MAX_BUY_LIMIT: Decimal = dec!(0.99);

/// Lowest limit price a SELL may carry before it is treated as mis-specified.
pub const MIN_SELL_LIMIT: Decimal = dec!(0.01);

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            _ => Err(()),
        }
    }
}

/// Binary outcome token of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Ok(Outcome::Yes),
            "NO" => Ok(Outcome::No),
            _ => Err(()),
        }
    }
}

/// The populated size of an intent together with its denomination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSize {
    /// Quote currency (USDC), used by BUY intents
    Usdc(Decimal),
    /// Outcome-token units, used by SELL intents
    Tokens(Decimal),
}

impl IntentSize {
    pub fn amount(&self) -> Decimal {
        match self {
            IntentSize::Usdc(v) | IntentSize::Tokens(v) => *v,
        }
    }
}

/// What the observer saw when it detected the source trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<Decimal>,

    /// Time between the source trade and its detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_latency_ms: Option<u64>,

    /// Estimated size of the source trader's order (tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_order_size: Option<Decimal>,

    /// Estimated balance the source trader held before the order (tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_balance: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl IntentMetadata {
    /// Bid/ask spread at observation time.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Fraction of their holding the source trader sold, clamped to (0, 1].
    pub fn trader_sell_fraction(&self) -> Option<Decimal> {
        let order = self.source_order_size?;
        let balance = self.source_balance?;
        if balance <= Decimal::ZERO || order <= Decimal::ZERO {
            return None;
        }
        Some((order / balance).min(Decimal::ONE))
    }
}

/// Reasons a raw payload cannot become a [`TradeIntent`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntentError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid source_trader address: {0}")]
    InvalidAddress(String),

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("exactly one of size_usdc or size_tokens must be set")]
    SizeFieldCount,

    #[error("{side} intents must be denominated in {expected}")]
    WrongDenomination {
        side: TradeSide,
        expected: &'static str,
    },

    #[error("limit_price {0} outside the open interval (0, 1)")]
    LimitOutOfRange(Decimal),

    #[error("{side} limit_price {limit} is implausible")]
    ImplausibleLimit { side: TradeSide, limit: Decimal },
}

impl IntentError {
    /// Name of the offending field, when the error is tied to one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            IntentError::Malformed(_) => None,
            IntentError::MissingField(f) => Some(*f),
            IntentError::InvalidAddress(_) => Some("source_trader"),
            IntentError::InvalidField { field, .. } => Some(*field),
            IntentError::SizeFieldCount | IntentError::WrongDenomination { .. } => Some("size"),
            IntentError::LimitOutOfRange(_) | IntentError::ImplausibleLimit { .. } => {
                Some("limit_price")
            }
        }
    }

    pub fn reason_code(&self) -> &'static str {
        "parse_error"
    }
}

/// Wire shape of an intent; every field optional so absence is reported by name.
#[derive(Debug, Deserialize)]
struct RawIntent {
    intent_id: Option<String>,
    timestamp: Option<Value>,
    source_trader: Option<String>,
    market_id: Option<String>,
    outcome: Option<String>,
    side: Option<String>,
    limit_price: Option<Decimal>,
    size_usdc: Option<Decimal>,
    size_tokens: Option<Decimal>,
    #[serde(default)]
    metadata: Option<IntentMetadata>,
}

/// A proposed trade that has passed structural validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeIntent {
    intent_id: String,
    timestamp: DateTime<Utc>,
    source_trader: String,
    market_id: String,
    outcome: Outcome,
    side: TradeSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_usdc: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_tokens: Option<Decimal>,
    metadata: IntentMetadata,
}

impl TradeIntent {
    /// Parse a raw JSON payload.
    pub fn parse(raw: &str) -> Result<Self, IntentError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| IntentError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a raw payload that has not been decoded yet. Invalid UTF-8 is malformed.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, IntentError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| IntentError::Malformed(format!("payload is not valid UTF-8: {}", e)))?;
        Self::parse(text)
    }

    /// Build an intent from an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, IntentError> {
        if !value.is_object() {
            return Err(IntentError::Malformed("expected a JSON object".to_string()));
        }
        let raw: RawIntent =
            serde_json::from_value(value).map_err(|e| IntentError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawIntent) -> Result<Self, IntentError> {
        let intent_id = required_text(raw.intent_id, "intent_id")?;
        let timestamp = parse_timestamp(raw.timestamp.ok_or(IntentError::MissingField("timestamp"))?)?;
        let source_trader =
            normalize_address(&raw.source_trader.ok_or(IntentError::MissingField("source_trader"))?)?;
        let market_id = required_text(raw.market_id, "market_id")?;

        let outcome_raw = raw.outcome.ok_or(IntentError::MissingField("outcome"))?;
        let outcome = Outcome::from_str(&outcome_raw).map_err(|_| IntentError::InvalidField {
            field: "outcome",
            reason: format!("expected YES or NO, got {:?}", outcome_raw),
        })?;

        let side_raw = raw.side.ok_or(IntentError::MissingField("side"))?;
        let side = TradeSide::from_str(&side_raw).map_err(|_| IntentError::InvalidField {
            field: "side",
            reason: format!("expected BUY or SELL, got {:?}", side_raw),
        })?;

        match (side, raw.size_usdc, raw.size_tokens) {
            (_, Some(_), Some(_)) | (_, None, None) => return Err(IntentError::SizeFieldCount),
            (TradeSide::Buy, None, Some(_)) => {
                return Err(IntentError::WrongDenomination {
                    side,
                    expected: "size_usdc",
                })
            }
            (TradeSide::Sell, Some(_), None) => {
                return Err(IntentError::WrongDenomination {
                    side,
                    expected: "size_tokens",
                })
            }
            _ => {}
        }
        for (field, size) in [("size_usdc", raw.size_usdc), ("size_tokens", raw.size_tokens)] {
            if let Some(v) = size {
                if v <= Decimal::ZERO {
                    return Err(IntentError::InvalidField {
                        field,
                        reason: format!("must be positive, got {}", v),
                    });
                }
            }
        }

        if let Some(limit) = raw.limit_price {
            if limit <= Decimal::ZERO || limit >= Decimal::ONE {
                return Err(IntentError::LimitOutOfRange(limit));
            }
            let implausible = match side {
                TradeSide::Buy => limit > MAX_BUY_LIMIT,
                TradeSide::Sell => limit < MIN_SELL_LIMIT,
            };
            if implausible {
                return Err(IntentError::ImplausibleLimit { side, limit });
            }
        }

        Ok(Self {
            intent_id,
            timestamp,
            source_trader,
            market_id,
            outcome,
            side,
            limit_price: raw.limit_price,
            size_usdc: raw.size_usdc,
            size_tokens: raw.size_tokens,
            metadata: raw.metadata.unwrap_or_default(),
        })
    }

    pub fn intent_id(&self) -> &str {
        &self.intent_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Lowercase 0x-prefixed address of the observed trader.
    pub fn source_trader(&self) -> &str {
        &self.source_trader
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn side(&self) -> TradeSide {
        self.side
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        self.limit_price
    }

    pub fn size_usdc(&self) -> Option<Decimal> {
        self.size_usdc
    }

    pub fn size_tokens(&self) -> Option<Decimal> {
        self.size_tokens
    }

    pub fn metadata(&self) -> &IntentMetadata {
        &self.metadata
    }

    /// The populated size field.
    pub fn size(&self) -> IntentSize {
        match (self.size_usdc, self.size_tokens) {
            (Some(usdc), _) => IntentSize::Usdc(usdc),
            (None, Some(tokens)) => IntentSize::Tokens(tokens),
            // Unreachable: construction guarantees exactly one size.
            (None, None) => IntentSize::Usdc(Decimal::ZERO),
        }
    }

    /// Time elapsed since the intent was created.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(max_age, Utc::now())
    }

    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) > max_age
    }
}

fn required_text(value: Option<String>, field: &'static str) -> Result<String, IntentError> {
    let value = value.ok_or(IntentError::MissingField(field))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IntentError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// Accepts RFC 3339 strings or Unix seconds (integer or fractional).
fn parse_timestamp(value: Value) -> Result<DateTime<Utc>, IntentError> {
    let invalid = |reason: String| IntentError::InvalidField {
        field: "timestamp",
        reason,
    };

    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(format!("{:?}: {}", s, e))),
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| invalid(format!("unrepresentable number {}", n)))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(invalid(format!("out of range: {}", n)));
            }
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| invalid(format!("out of range: {}", n)))
        }
        other => Err(invalid(format!("expected string or number, got {}", other))),
    }
}

fn normalize_address(raw: &str) -> Result<String, IntentError> {
    let trimmed = raw.trim();
    let well_formed = trimmed.len() == 42
        && (trimmed.starts_with("0x") || trimmed.starts_with("0X"))
        && Address::from_str(&trimmed[2..]).is_ok();
    if !well_formed {
        return Err(IntentError::InvalidAddress(raw.to_string()));
    }
    Ok(format!("0x{}", trimmed[2..].to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRADER: &str = "0xAbCdEf0123456789abcdef0123456789ABCDEF01";

    fn buy_payload() -> Value {
        json!({
            "intent_id": "intent-1",
            "timestamp": Utc::now().to_rfc3339(),
            "source_trader": TRADER,
            "market_id": "0xmarket",
            "outcome": "YES",
            "side": "BUY",
            "limit_price": 0.55,
            "size_usdc": "25",
            "metadata": {
                "best_bid": 0.54,
                "best_ask": 0.56,
                "detection_latency_ms": 120,
                "extra": {"venue": "clob"}
            }
        })
    }

    #[test]
    fn test_parse_buy_intent() {
        let intent = TradeIntent::from_value(buy_payload()).unwrap();

        assert_eq!(intent.intent_id(), "intent-1");
        assert_eq!(intent.source_trader(), TRADER.to_ascii_lowercase());
        assert_eq!(intent.side(), TradeSide::Buy);
        assert_eq!(intent.outcome(), Outcome::Yes);
        assert_eq!(intent.limit_price(), Some(dec!(0.55)));
        assert_eq!(intent.size(), IntentSize::Usdc(dec!(25)));
        assert_eq!(intent.size_tokens(), None);
        assert_eq!(intent.metadata().spread(), Some(dec!(0.02)));
        assert_eq!(intent.metadata().extra["venue"], "clob");
    }

    #[test]
    fn test_parse_rejects_both_and_neither_size() {
        let mut both = buy_payload();
        both["size_tokens"] = json!(10);
        assert_eq!(
            TradeIntent::from_value(both).unwrap_err(),
            IntentError::SizeFieldCount
        );

        let mut neither = buy_payload();
        neither.as_object_mut().unwrap().remove("size_usdc");
        assert_eq!(
            TradeIntent::from_value(neither).unwrap_err(),
            IntentError::SizeFieldCount
        );
    }

    #[test]
    fn test_parse_enforces_denomination_per_side() {
        let mut sell_in_usdc = buy_payload();
        sell_in_usdc["side"] = json!("SELL");
        sell_in_usdc["limit_price"] = json!(0.5);
        let err = TradeIntent::from_value(sell_in_usdc).unwrap_err();
        assert!(matches!(err, IntentError::WrongDenomination { side: TradeSide::Sell, .. }));

        let mut buy_in_tokens = buy_payload();
        buy_in_tokens.as_object_mut().unwrap().remove("size_usdc");
        buy_in_tokens["size_tokens"] = json!(10);
        let err = TradeIntent::from_value(buy_in_tokens).unwrap_err();
        assert!(matches!(err, IntentError::WrongDenomination { side: TradeSide::Buy, .. }));
    }

    #[test]
    fn test_parse_rejects_bad_address() {
        for bad in [
            "0x123",
            "abcdef0123456789abcdef0123456789abcdef0101",
            "0xZZcdef0123456789abcdef0123456789abcdef01",
        ] {
            let mut payload = buy_payload();
            payload["source_trader"] = json!(bad);
            let err = TradeIntent::from_value(payload).unwrap_err();
            assert!(matches!(err, IntentError::InvalidAddress(_)), "{}", bad);
            assert_eq!(err.field(), Some("source_trader"));
        }
    }

    #[test]
    fn test_parse_limit_price_bounds() {
        let mut payload = buy_payload();
        payload["limit_price"] = json!(1.0);
        assert!(matches!(
            TradeIntent::from_value(payload).unwrap_err(),
            IntentError::LimitOutOfRange(_)
        ));

        let mut payload = buy_payload();
        payload["limit_price"] = json!(0.995);
        assert!(matches!(
            TradeIntent::from_value(payload).unwrap_err(),
            IntentError::ImplausibleLimit { side: TradeSide::Buy, .. }
        ));

        let mut payload = buy_payload();
        payload["side"] = json!("SELL");
        payload.as_object_mut().unwrap().remove("size_usdc");
        payload["size_tokens"] = json!(10);
        payload["limit_price"] = json!(0.005);
        assert!(matches!(
            TradeIntent::from_value(payload).unwrap_err(),
            IntentError::ImplausibleLimit { side: TradeSide::Sell, .. }
        ));
    }

    #[test]
    fn test_parse_missing_fields_and_garbage() {
        let mut payload = buy_payload();
        payload.as_object_mut().unwrap().remove("market_id");
        assert_eq!(
            TradeIntent::from_value(payload).unwrap_err(),
            IntentError::MissingField("market_id")
        );

        assert!(matches!(
            TradeIntent::parse("{not json").unwrap_err(),
            IntentError::Malformed(_)
        ));
        assert!(matches!(
            TradeIntent::parse("[1, 2]").unwrap_err(),
            IntentError::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_bytes_rejects_invalid_utf8() {
        let mut payload = buy_payload();
        payload["intent_id"] = json!("@@");
        let text = payload.to_string();
        let at = text.find("@@").unwrap();

        let mut bytes = text.into_bytes();
        assert!(TradeIntent::parse_bytes(&bytes).is_ok());

        bytes[at] = 0xFF;
        bytes[at + 1] = b'!';
        assert!(matches!(
            TradeIntent::parse_bytes(&bytes).unwrap_err(),
            IntentError::Malformed(_)
        ));
    }

    #[test]
    fn test_epoch_timestamp_and_age() {
        let created = Utc::now() - Duration::seconds(11);
        let mut payload = buy_payload();
        payload["timestamp"] = json!(created.timestamp());
        let intent = TradeIntent::from_value(payload).unwrap();

        let now = created + Duration::seconds(11);
        assert_eq!(intent.age_at(now).num_seconds(), 11);
        assert!(intent.is_stale_at(Duration::seconds(10), now));
        assert!(!intent.is_stale_at(Duration::seconds(12), now));
    }

    #[test]
    fn test_serialized_intent_parses_back() {
        let intent = TradeIntent::from_value(buy_payload()).unwrap();
        let raw = serde_json::to_string(&intent).unwrap();
        assert_eq!(TradeIntent::parse(&raw).unwrap(), intent);
    }

    #[test]
    fn test_trader_sell_fraction() {
        let meta = IntentMetadata {
            source_order_size: Some(dec!(25)),
            source_balance: Some(dec!(100)),
            ..Default::default()
        };
        assert_eq!(meta.trader_sell_fraction(), Some(dec!(0.25)));

        let oversized = IntentMetadata {
            source_order_size: Some(dec!(150)),
            source_balance: Some(dec!(100)),
            ..Default::default()
        };
        assert_eq!(oversized.trader_sell_fraction(), Some(Decimal::ONE));

        assert_eq!(IntentMetadata::default().trader_sell_fraction(), None);
    }
}
