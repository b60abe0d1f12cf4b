// =============================================================================
// Exchange wire types — defensive decoding of Indodax payloads
// =============================================================================
//
// The exchange serializes most numbers as strings, keys several maps by the
// wire pair id ("btc_idr") while channels use the compact form ("btcidr"),
// and names private-API amount fields after the currency they are
// denominated in ("order_idr", "remain_btc", "receive_btc"). Everything here
// rewrites those shapes into stable internal structs; the wire is never the
// internal schema.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::Side;

// =============================================================================
// Pair id normalization
// =============================================================================

/// Quote currencies the exchange lists, longest first so suffix matching is
/// unambiguous.
const QUOTE_CURRENCIES: &[&str] = &["usdt", "idr", "btc", "eth"];

/// Normalize any pair spelling to the internal compact lowercase form:
/// `"BTC_IDR"` / `"btc_idr"` / `"btcidr"` all become `"btcidr"`.
pub fn normalize_pair(raw: &str) -> String {
    raw.to_lowercase().replace('_', "")
}

/// Split an internal pair id into `(base, quote)`.
pub fn split_pair(pair: &str) -> EngineResult<(String, String)> {
    if let Some((base, quote)) = pair.split_once('_') {
        return Ok((base.to_lowercase(), quote.to_lowercase()));
    }
    let lower = pair.to_lowercase();
    for quote in QUOTE_CURRENCIES {
        if let Some(base) = lower.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok((base.to_string(), quote.to_string()));
            }
        }
    }
    Err(EngineError::Validation(format!("unrecognized pair id: {pair}")))
}

/// The underscore form used by REST endpoints ("btc_idr").
pub fn wire_pair(pair: &str) -> EngineResult<String> {
    let (base, quote) = split_pair(pair)?;
    Ok(format!("{base}_{quote}"))
}

// =============================================================================
// Numeric parsing
// =============================================================================

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Like [`parse_f64`] but missing / malformed values collapse to 0.0.
pub fn parse_f64_or_zero(val: &serde_json::Value) -> f64 {
    parse_f64(val).unwrap_or(0.0)
}

// =============================================================================
// Pair metadata
// =============================================================================

/// Exchange-declared static data for one pair (`GET /api/pairs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairInfo {
    /// Internal pair id, compact lowercase.
    pub id: String,
    pub base_currency: String,
    pub quote_currency: String,
    /// Decimal places allowed for an order amount.
    pub volume_precision: u32,
    /// Decimal places for price display.
    pub price_precision: u32,
    /// Minimum tradable amount in base units.
    pub trade_min_traded_currency: f64,
    /// Minimum order value in quote units.
    pub trade_min_base_currency: f64,
    /// Exchange-published minimum price step.
    #[serde(default)]
    pub price_increment: f64,
}

impl PairInfo {
    /// Decode one entry of the `/api/pairs` response array.
    pub fn from_wire(raw: &serde_json::Value) -> Result<Self> {
        let id = raw["id"]
            .as_str()
            .or_else(|| raw["ticker_id"].as_str())
            .context("pair entry missing id")?;

        Ok(Self {
            id: normalize_pair(id),
            base_currency: raw["traded_currency"]
                .as_str()
                .context("pair entry missing traded_currency")?
                .to_lowercase(),
            quote_currency: raw["base_currency"]
                .as_str()
                .context("pair entry missing base_currency")?
                .to_lowercase(),
            volume_precision: raw["volume_precision"].as_u64().unwrap_or(8) as u32,
            price_precision: raw["price_precision"].as_u64().unwrap_or(0) as u32,
            trade_min_traded_currency: parse_f64_or_zero(&raw["trade_min_traded_currency"]),
            trade_min_base_currency: parse_f64_or_zero(&raw["trade_min_base_currency"]),
            price_increment: 0.0,
        })
    }
}

// =============================================================================
// Summaries / ticker
// =============================================================================

/// One pair's entry from `GET /api/summaries` or `GET /api/ticker/{pair}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerSummary {
    pub pair: String,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    /// Best bid.
    pub buy: f64,
    /// Best ask.
    pub sell: f64,
    /// 24h volume in base units.
    pub vol_base: f64,
    /// 24h volume in quote units (IDR).
    pub vol_quote: f64,
}

impl TickerSummary {
    /// Decode a ticker object. `vol_{coin}` is a dynamic field named after
    /// the base currency.
    pub fn from_wire(pair: &str, raw: &serde_json::Value) -> EngineResult<Self> {
        let pair = normalize_pair(pair);
        let (base, quote) = split_pair(&pair)?;

        Ok(Self {
            last: parse_f64_or_zero(&raw["last"]),
            high: parse_f64_or_zero(&raw["high"]),
            low: parse_f64_or_zero(&raw["low"]),
            buy: parse_f64_or_zero(&raw["buy"]),
            sell: parse_f64_or_zero(&raw["sell"]),
            vol_base: parse_f64_or_zero(&raw[format!("vol_{base}")]),
            vol_quote: parse_f64_or_zero(&raw[format!("vol_{quote}")]),
            pair,
        })
    }
}

// =============================================================================
// Account info
// =============================================================================

/// Decrypted balances from the private `getInfo` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountBalances {
    /// currency -> free amount.
    pub free: std::collections::HashMap<String, f64>,
    /// currency -> amount locked in open orders.
    pub hold: std::collections::HashMap<String, f64>,
}

impl AccountBalances {
    pub fn from_wire(ret: &serde_json::Value) -> Self {
        let decode = |val: &serde_json::Value| {
            val.as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.to_lowercase(), parse_f64_or_zero(v)))
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            free: decode(&ret["balance"]),
            hold: decode(&ret["balance_hold"]),
        }
    }

    pub fn free_of(&self, currency: &str) -> f64 {
        self.free.get(&currency.to_lowercase()).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// Orders
// =============================================================================

/// A private-API order rewritten into stable field names. Amounts are in
/// base units regardless of which currency the wire denominated them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    /// Original order amount in base units.
    pub amount: f64,
    /// Unfilled remainder in base units.
    pub remaining: f64,
    /// Wire status string: "open" / "filled" / "cancelled".
    pub status: String,
}

impl ExchangeOrder {
    pub fn filled(&self) -> f64 {
        (self.amount - self.remaining).max(0.0)
    }

    /// Decode one order object from `openOrders` / `getOrder` /
    /// `orderHistory`.
    ///
    /// Buy orders are denominated in quote currency (`order_idr`,
    /// `remain_idr`); sells in base (`order_btc`, `remain_btc`). Both are
    /// rewritten to base units using the order price.
    pub fn from_wire(pair: &str, raw: &serde_json::Value) -> EngineResult<Self> {
        let pair = normalize_pair(pair);
        let (base, quote) = split_pair(&pair)?;

        let order_id = match &raw["order_id"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return Err(EngineError::Internal("order missing order_id".into())),
        };

        let side = match raw["type"].as_str() {
            Some("buy") => Side::Buy,
            Some("sell") => Side::Sell,
            other => {
                return Err(EngineError::Internal(format!(
                    "order {order_id} has unknown type {other:?}"
                )))
            }
        };

        let price = parse_f64_or_zero(&raw["price"]);

        let (amount, remaining) = match side {
            Side::Sell => (
                parse_f64_or_zero(&raw[format!("order_{base}")]),
                parse_f64_or_zero(&raw[format!("remain_{base}")]),
            ),
            Side::Buy => {
                let order_quote = parse_f64_or_zero(&raw[format!("order_{quote}")]);
                let remain_quote = parse_f64_or_zero(&raw[format!("remain_{quote}")]);
                if price > 0.0 {
                    (order_quote / price, remain_quote / price)
                } else {
                    (0.0, 0.0)
                }
            }
        };

        let status = raw["status"].as_str().unwrap_or("open").to_string();

        Ok(Self {
            order_id,
            pair,
            side,
            price,
            amount,
            remaining,
            status,
        })
    }
}

/// Result of a `trade` call: the exchange reports how much was received /
/// spent immediately plus the resting order id.
#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub order_id: String,
    /// Base units received immediately (buy) or quote received (sell).
    pub immediate_fill: f64,
    /// Remaining unfilled, denominated as the wire denominates the order.
    pub remaining: f64,
}

impl TradeReceipt {
    pub fn from_wire(pair: &str, ret: &serde_json::Value, side: Side) -> EngineResult<Self> {
        let pair = normalize_pair(pair);
        let (base, _quote) = split_pair(&pair)?;

        let order_id = match &ret["order_id"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return Err(EngineError::Internal("trade result missing order_id".into())),
        };

        let immediate_fill = match side {
            Side::Buy => parse_f64_or_zero(&ret[format!("receive_{base}")]),
            Side::Sell => parse_f64_or_zero(&ret["receive_rp"]),
        };
        let remaining = match side {
            Side::Buy => parse_f64_or_zero(&ret["remain_rp"]),
            Side::Sell => parse_f64_or_zero(&ret[format!("remain_{base}")]),
        };

        Ok(Self {
            order_id,
            immediate_fill,
            remaining,
        })
    }
}

// =============================================================================
// Depth
// =============================================================================

/// Best bid/ask extracted from a depth snapshot or order-book message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BestPrices {
    pub bid: f64,
    pub bid_volume: f64,
    pub ask: f64,
    pub ask_volume: f64,
}

/// Parse best bid/ask from the first entries of `bid`/`ask` (or
/// `buy`/`sell`) arrays of `[price, amount]` rows.
pub fn parse_best_prices(raw: &serde_json::Value) -> BestPrices {
    let first_level = |keys: [&str; 2]| -> (f64, f64) {
        for key in keys {
            if let Some(rows) = raw[key].as_array() {
                if let Some(row) = rows.first().and_then(|r| r.as_array()) {
                    let price = row.first().map(parse_f64_or_zero).unwrap_or(0.0);
                    let volume = row.get(1).map(parse_f64_or_zero).unwrap_or(0.0);
                    return (price, volume);
                }
            }
        }
        (0.0, 0.0)
    };

    let (bid, bid_volume) = first_level(["bid", "buy"]);
    let (ask, ask_volume) = first_level(["ask", "sell"]);

    BestPrices {
        bid,
        bid_volume,
        ask,
        ask_volume,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_normalization_forms() {
        assert_eq!(normalize_pair("BTC_IDR"), "btcidr");
        assert_eq!(normalize_pair("btcidr"), "btcidr");
        assert_eq!(wire_pair("btcidr").unwrap(), "btc_idr");
        assert_eq!(wire_pair("eth_idr").unwrap(), "eth_idr");
    }

    #[test]
    fn split_pair_by_suffix() {
        assert_eq!(
            split_pair("btcidr").unwrap(),
            ("btc".to_string(), "idr".to_string())
        );
        assert_eq!(
            split_pair("dogeusdt").unwrap(),
            ("doge".to_string(), "usdt".to_string())
        );
        assert!(split_pair("zzz").is_err());
    }

    #[test]
    fn ticker_summary_dynamic_volume_fields() {
        let raw = serde_json::json!({
            "last": "650000000",
            "high": "660000000",
            "low": "640000000",
            "buy": "649000000",
            "sell": "651000000",
            "vol_btc": "12.5",
            "vol_idr": "8100000000"
        });
        let summary = TickerSummary::from_wire("btc_idr", &raw).unwrap();
        assert_eq!(summary.pair, "btcidr");
        assert_eq!(summary.last, 650_000_000.0);
        assert_eq!(summary.vol_base, 12.5);
        assert_eq!(summary.vol_quote, 8_100_000_000.0);
    }

    #[test]
    fn sell_order_amounts_in_base_units() {
        let raw = serde_json::json!({
            "order_id": 59632,
            "type": "sell",
            "price": "650000000",
            "order_btc": "0.5",
            "remain_btc": "0.2",
            "status": "open"
        });
        let order = ExchangeOrder::from_wire("btcidr", &raw).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.amount, 0.5);
        assert_eq!(order.remaining, 0.2);
        assert!((order.filled() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn buy_order_rewritten_from_quote_units() {
        let raw = serde_json::json!({
            "order_id": "77",
            "type": "buy",
            "price": "1000",
            "order_idr": "50000",
            "remain_idr": "20000",
            "status": "open"
        });
        let order = ExchangeOrder::from_wire("eth_idr", &raw).unwrap();
        assert_eq!(order.amount, 50.0);
        assert_eq!(order.remaining, 20.0);
        assert_eq!(order.filled(), 30.0);
    }

    #[test]
    fn trade_receipt_buy_receives_base() {
        let ret = serde_json::json!({
            "order_id": 11,
            "receive_btc": "0.0015",
            "remain_rp": "0"
        });
        let receipt = TradeReceipt::from_wire("btcidr", &ret, Side::Buy).unwrap();
        assert_eq!(receipt.order_id, "11");
        assert_eq!(receipt.immediate_fill, 0.0015);
        assert_eq!(receipt.remaining, 0.0);
    }

    #[test]
    fn best_prices_from_first_entries() {
        let raw = serde_json::json!({
            "bid": [["650000000", "0.4"], ["649000000", "1.0"]],
            "ask": [["650100000", "0.2"]]
        });
        let best = parse_best_prices(&raw);
        assert_eq!(best.bid, 650_000_000.0);
        assert_eq!(best.bid_volume, 0.4);
        assert_eq!(best.ask, 650_100_000.0);
    }

    #[test]
    fn best_prices_accepts_depth_key_names() {
        let raw = serde_json::json!({
            "buy": [[1000.0, 2.0]],
            "sell": [[1010.0, 3.0]]
        });
        let best = parse_best_prices(&raw);
        assert_eq!(best.bid, 1000.0);
        assert_eq!(best.ask, 1010.0);
    }

    #[test]
    fn account_balances_lowercased() {
        let ret = serde_json::json!({
            "balance": {"IDR": "1500000", "btc": "0.25"},
            "balance_hold": {"idr": "0"}
        });
        let balances = AccountBalances::from_wire(&ret);
        assert_eq!(balances.free_of("idr"), 1_500_000.0);
        assert_eq!(balances.free_of("BTC"), 0.25);
    }
}
