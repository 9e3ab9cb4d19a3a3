// =============================================================================
// Ingestion Normaliser — vendor frames to canonical records
// =============================================================================
//
// The upstream feed names fields per the vendor (`volUsd`, `exName`, numbers
// as strings) and has drifted across API versions, so every alias is handled
// here and nowhere else. Everything below this seam sees decimal numerics and
// canonical names.
//
// A record is rejected — never the connection — when the symbol is missing,
// the price or notional fails to parse, or either is non-positive. Rejections
// are counted by reason.
// =============================================================================

use rust_decimal::Decimal;
use serde_json::Value;

use crate::types::{Liquidation, LiquidationSide, Trade, TradeSide};

/// A parsed upstream frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Keepalive from the feed (`ping`/`pong`).
    Heartbeat,
    /// Acknowledgement of a channel subscription.
    SubscriptionAck { channel: String },
    /// A data event batch on a channel.
    Data { channel: String, events: Vec<Value> },
    /// Anything else — ignored upstream noise.
    Other,
}

/// Why a record was rejected at the normalisation seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingSymbol,
    BadPrice,
    BadNotional,
    Unparseable,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingSymbol => "missing_symbol",
            Self::BadPrice => "bad_price",
            Self::BadNotional => "bad_notional",
            Self::Unparseable => "unparseable",
        }
    }
}

/// Channel carrying all-symbol liquidation events.
pub const LIQUIDATION_CHANNEL: &str = "liquidationOrders";
/// Channel carrying per-symbol aggregated trades.
pub const TRADE_CHANNEL: &str = "aggTrade";

/// Parse the outer frame envelope. Frame-level JSON errors surface as `Err`;
/// the caller counts them and keeps the connection.
pub fn parse_frame(text: &str) -> Result<Frame, RejectReason> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") || trimmed.eq_ignore_ascii_case("pong") {
        return Ok(Frame::Heartbeat);
    }

    let root: Value = serde_json::from_str(trimmed).map_err(|_| RejectReason::Unparseable)?;

    let channel = root["channel"]
        .as_str()
        .or_else(|| root["ch"].as_str())
        .unwrap_or("");

    if channel.eq_ignore_ascii_case("ping") || channel.eq_ignore_ascii_case("pong") {
        return Ok(Frame::Heartbeat);
    }

    if root["event"].as_str() == Some("subscribe") || root["success"].as_bool() == Some(true) {
        return Ok(Frame::SubscriptionAck {
            channel: channel.to_string(),
        });
    }

    match root.get("data") {
        Some(Value::Array(events)) => Ok(Frame::Data {
            channel: channel.to_string(),
            events: events.clone(),
        }),
        Some(single) if single.is_object() => Ok(Frame::Data {
            channel: channel.to_string(),
            events: vec![single.clone()],
        }),
        _ => Ok(Frame::Other),
    }
}

/// Normalise one liquidation event object.
pub fn normalize_liquidation(event: &Value) -> Result<Liquidation, RejectReason> {
    let symbol = string_field(event, &["symbol", "s", "sym"]).ok_or(RejectReason::MissingSymbol)?;
    let price = decimal_field(event, &["price", "p"]).ok_or(RejectReason::BadPrice)?;
    if price <= Decimal::ZERO {
        return Err(RejectReason::BadPrice);
    }
    let notional =
        decimal_field(event, &["volUsd", "vol_usd", "notional", "v"]).ok_or(RejectReason::BadNotional)?;
    if notional <= Decimal::ZERO {
        return Err(RejectReason::BadNotional);
    }

    let side = liquidation_side(event).ok_or(RejectReason::Unparseable)?;
    let ts = ts_field(event).ok_or(RejectReason::Unparseable)?;
    let exchange = string_field(event, &["exName", "exchangeName", "exchange", "ex"])
        .unwrap_or_else(|| "aggregated".to_string());

    Ok(Liquidation {
        symbol: symbol.to_uppercase(),
        exchange,
        price,
        side,
        notional_usd: notional,
        ts,
    })
}

/// Normalise one aggregated-trade event object.
pub fn normalize_trade(event: &Value) -> Result<Trade, RejectReason> {
    let symbol = string_field(event, &["symbol", "s", "sym"]).ok_or(RejectReason::MissingSymbol)?;
    let price = decimal_field(event, &["price", "p"]).ok_or(RejectReason::BadPrice)?;
    if price <= Decimal::ZERO {
        return Err(RejectReason::BadPrice);
    }
    let notional =
        decimal_field(event, &["volUsd", "vol_usd", "notional", "v"]).ok_or(RejectReason::BadNotional)?;
    if notional <= Decimal::ZERO {
        return Err(RejectReason::BadNotional);
    }

    let side = trade_side(event).ok_or(RejectReason::Unparseable)?;
    let ts = ts_field(event).ok_or(RejectReason::Unparseable)?;
    let exchange = string_field(event, &["exName", "exchangeName", "exchange", "ex"])
        .unwrap_or_else(|| "aggregated".to_string());

    Ok(Trade {
        symbol: symbol.to_uppercase(),
        exchange,
        price,
        side,
        notional_usd: notional,
        ts,
    })
}

// -----------------------------------------------------------------------------
// Field helpers
// -----------------------------------------------------------------------------

fn string_field(event: &Value, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(s) = event[*name].as_str() {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Numeric field that may arrive as a JSON number or a numeric string.
fn decimal_field(event: &Value, names: &[&str]) -> Option<Decimal> {
    for name in names {
        match &event[*name] {
            Value::String(s) => return s.trim().parse().ok(),
            Value::Number(n) => return n.to_string().parse().ok(),
            Value::Null => continue,
            _ => return None,
        }
    }
    None
}

fn ts_field(event: &Value) -> Option<i64> {
    for name in ["ts", "time", "t"] {
        match &event[name] {
            Value::Number(n) => return n.as_i64(),
            Value::String(s) => return s.parse().ok(),
            _ => continue,
        }
    }
    None
}

/// The vendor encodes liquidation side as 1/2 or as a string.
/// 1 = long positions liquidated, 2 = short positions liquidated.
fn liquidation_side(event: &Value) -> Option<LiquidationSide> {
    for name in ["side", "posSide", "positionSide"] {
        match &event[name] {
            Value::Number(n) => {
                return match n.as_i64()? {
                    1 => Some(LiquidationSide::LongLiquidated),
                    2 => Some(LiquidationSide::ShortLiquidated),
                    _ => None,
                }
            }
            Value::String(s) => {
                return match s.to_lowercase().as_str() {
                    "1" | "long" => Some(LiquidationSide::LongLiquidated),
                    "2" | "short" => Some(LiquidationSide::ShortLiquidated),
                    _ => None,
                }
            }
            _ => continue,
        }
    }
    None
}

fn trade_side(event: &Value) -> Option<TradeSide> {
    for name in ["side", "direction"] {
        match &event[name] {
            Value::Number(n) => {
                return match n.as_i64()? {
                    1 => Some(TradeSide::Buy),
                    2 => Some(TradeSide::Sell),
                    _ => None,
                }
            }
            Value::String(s) => {
                return match s.to_lowercase().as_str() {
                    "1" | "buy" => Some(TradeSide::Buy),
                    "2" | "sell" => Some(TradeSide::Sell),
                    _ => None,
                }
            }
            _ => continue,
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
