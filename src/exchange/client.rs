// =============================================================================
// Indodax REST API Client — HMAC-SHA512 signed requests
// =============================================================================
//
// SECURITY: secrets are never logged or serialized. Private calls POST to
// /tapi with a form-encoded payload signed by HMAC-SHA512 and carry the
// `Key` / `Sign` headers. The nonce is unix-millis, forced monotonic across
// concurrent callers.
//
// The client is shared by every user: credentials are passed per call, so a
// single instance (and a single set of rate limiters) serves the whole
// process.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha512;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::rate_limit::{RateLimits, TokenBucket};
use crate::exchange::types::{
    normalize_pair, parse_f64_or_zero, wire_pair, AccountBalances, BestPrices, ExchangeOrder,
    PairInfo, TickerSummary, TradeReceipt,
};
use crate::types::Side;

type HmacSha512 = Hmac<Sha512>;

/// Default timeout applied to every REST call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Decrypted per-user credentials, held only for the duration of a call
/// sequence.
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub struct IndodaxClient {
    http: reqwest::Client,
    base_url: String,
    limits: Arc<RateLimits>,
    cancel: CancellationToken,
    nonce: AtomicU64,
}

impl IndodaxClient {
    pub fn new(base_url: impl Into<String>, cancel: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into(),
            limits: Arc::new(RateLimits::new()),
            cancel,
            nonce: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA512 hex signature of a form-encoded payload.
    fn sign(secret: &str, payload: &str) -> String {
        let mut mac =
            HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Monotonic nonce in unix-millis. Concurrent callers never observe the
    /// same value twice.
    fn next_nonce(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.nonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now)
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// GET a public endpoint, retrying once on transport errors.
    async fn public_get(&self, path: &str) -> EngineResult<serde_json::Value> {
        self.limits.public.acquire(&self.cancel).await?;
        let url = format!("{}{}", self.base_url, path);

        let mut last_err = None;
        for attempt in 0..2 {
            match self.http.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_err = Some(EngineError::Transient(format!(
                            "GET {path} returned {status}"
                        )));
                    } else {
                        return resp.json().await.map_err(|e| {
                            EngineError::Internal(format!("decode GET {path}: {e}"))
                        });
                    }
                }
                Err(e) => {
                    last_err = Some(EngineError::Transient(format!("GET {path}: {e}")));
                }
            }
            if attempt == 0 {
                debug!(path, "public request failed — retrying once");
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Transient(format!("GET {path} failed"))))
    }

    /// POST a signed private call and unwrap the `{success, return, error}`
    /// envelope, returning the `return` payload.
    async fn private_call(
        &self,
        creds: &Credentials,
        bucket: &TokenBucket,
        method: &str,
        params: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        bucket.acquire(&self.cancel).await?;

        let mut payload = format!("method={method}&nonce={}", self.next_nonce());
        for (name, value) in params {
            payload.push('&');
            payload.push_str(name);
            payload.push('=');
            payload.push_str(value);
        }

        let sign = Self::sign(&creds.secret, &payload);
        let url = format!("{}/tapi", self.base_url);

        let mut last_err = None;
        for attempt in 0..2 {
            let result = self
                .http
                .post(&url)
                .header("Key", &creds.key)
                .header("Sign", &sign)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(payload.clone())
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_err = Some(EngineError::Transient(format!(
                            "{method} returned {status}"
                        )));
                    } else {
                        let body: serde_json::Value = resp.json().await.map_err(|e| {
                            EngineError::Internal(format!("decode {method}: {e}"))
                        })?;
                        return unwrap_envelope(method, body);
                    }
                }
                Err(e) => {
                    last_err = Some(EngineError::Transient(format!("{method}: {e}")));
                }
            }
            if attempt == 0 {
                debug!(method, "private request failed — retrying once");
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Transient(format!("{method} failed"))))
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/pairs — static metadata for every listed pair.
    #[instrument(skip(self), name = "indodax::get_pairs")]
    pub async fn get_pairs(&self) -> EngineResult<Vec<PairInfo>> {
        let body = self.public_get("/api/pairs").await?;
        let raw = body
            .as_array()
            .ok_or_else(|| EngineError::Internal("pairs response is not an array".into()))?;

        let mut pairs = Vec::with_capacity(raw.len());
        for entry in raw {
            match PairInfo::from_wire(entry) {
                Ok(info) => pairs.push(info),
                Err(e) => warn!(error = %e, "skipping malformed pair entry"),
            }
        }
        debug!(count = pairs.len(), "pairs fetched");
        Ok(pairs)
    }

    /// GET /api/price_increments — pair id -> minimum price step.
    #[instrument(skip(self), name = "indodax::get_price_increments")]
    pub async fn get_price_increments(&self) -> EngineResult<HashMap<String, f64>> {
        let body = self.public_get("/api/price_increments").await?;
        let increments = body["increments"]
            .as_object()
            .ok_or_else(|| EngineError::Internal("price_increments missing increments".into()))?;

        Ok(increments
            .iter()
            .map(|(pair, v)| (normalize_pair(pair), parse_f64_or_zero(v)))
            .collect())
    }

    /// GET /api/summaries — tickers for every pair, including best bid/ask.
    #[instrument(skip(self), name = "indodax::get_summaries")]
    pub async fn get_summaries(&self) -> EngineResult<Vec<TickerSummary>> {
        let body = self.public_get("/api/summaries").await?;
        let tickers = body["tickers"]
            .as_object()
            .ok_or_else(|| EngineError::Internal("summaries missing tickers".into()))?;

        let mut out = Vec::with_capacity(tickers.len());
        for (pair, raw) in tickers {
            match TickerSummary::from_wire(pair, raw) {
                Ok(summary) => out.push(summary),
                Err(e) => warn!(%pair, error = %e, "skipping malformed summary entry"),
            }
        }
        Ok(out)
    }

    /// GET /api/ticker/{pair}.
    #[instrument(skip(self), name = "indodax::get_ticker")]
    pub async fn get_ticker(&self, pair: &str) -> EngineResult<TickerSummary> {
        let wire = wire_pair(pair)?;
        let body = self.public_get(&format!("/api/ticker/{wire}")).await?;
        TickerSummary::from_wire(pair, &body["ticker"])
    }

    /// GET /api/depth/{pair} — best bid/ask from the top of the book.
    #[instrument(skip(self), name = "indodax::get_depth")]
    pub async fn get_depth(&self, pair: &str) -> EngineResult<BestPrices> {
        let wire = wire_pair(pair)?;
        let body = self.public_get(&format!("/api/depth/{wire}")).await?;
        Ok(crate::exchange::types::parse_best_prices(&body))
    }

    /// GET /api/server_time — unix-millis.
    pub async fn get_server_time(&self) -> EngineResult<i64> {
        let body = self.public_get("/api/server_time").await?;
        Ok(body["server_time"].as_i64().unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // Private account / orders
    // -------------------------------------------------------------------------

    /// `getInfo` — account balances. Also the validate-on-submit probe: a
    /// credential error here means the key is unusable.
    #[instrument(skip(self, creds), name = "indodax::get_info")]
    pub async fn get_info(&self, creds: &Credentials) -> EngineResult<AccountBalances> {
        let ret = self
            .private_call(creds, &self.limits.trade, "getInfo", &[])
            .await?;
        Ok(AccountBalances::from_wire(&ret))
    }

    async fn trade(
        &self,
        creds: &Credentials,
        pair: &str,
        side: Side,
        order_type: &str,
        price: Option<f64>,
        amount_param: (&str, f64),
    ) -> EngineResult<TradeReceipt> {
        let wire = wire_pair(pair)?;
        let (amount_name, amount) = amount_param;

        let mut params = vec![
            ("pair", wire),
            ("type", side.as_str().to_string()),
            ("order_type", order_type.to_string()),
            (amount_name, format_amount(amount)),
        ];
        if let Some(p) = price {
            params.push(("price", format_amount(p)));
        }

        debug!(pair, %side, order_type, amount, "placing order");
        let ret = self
            .private_call(creds, &self.limits.trade, "trade", &params)
            .await?;
        TradeReceipt::from_wire(pair, &ret, side)
    }

    /// Limit buy: `amount_quote` is the IDR to spend.
    pub async fn place_limit_buy(
        &self,
        creds: &Credentials,
        pair: &str,
        price: f64,
        amount_quote: f64,
    ) -> EngineResult<TradeReceipt> {
        let (_, quote) = crate::exchange::types::split_pair(pair)?;
        // Param name is the quote currency code ("idr").
        let name: &'static str = match quote.as_str() {
            "idr" => "idr",
            "usdt" => "usdt",
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported quote currency: {other}"
                )))
            }
        };
        self.trade(creds, pair, Side::Buy, "limit", Some(price), (name, amount_quote))
            .await
    }

    /// Limit sell: `amount_base` is the coin amount to sell. The wire param
    /// is named after the base currency ("btc", "eth", ...).
    pub async fn place_limit_sell(
        &self,
        creds: &Credentials,
        pair: &str,
        price: f64,
        amount_base: f64,
    ) -> EngineResult<TradeReceipt> {
        let (base, _) = crate::exchange::types::split_pair(pair)?;
        self.trade(
            creds,
            pair,
            Side::Sell,
            "limit",
            Some(price),
            (base.as_str(), amount_base),
        )
        .await
    }

    /// Market sell the given base amount.
    pub async fn place_market_sell(
        &self,
        creds: &Credentials,
        pair: &str,
        amount_base: f64,
    ) -> EngineResult<TradeReceipt> {
        let (base, _) = crate::exchange::types::split_pair(pair)?;
        self.trade(creds, pair, Side::Sell, "market", None, (base.as_str(), amount_base))
            .await
    }

    /// Market buy spending the given quote amount.
    pub async fn place_market_buy(
        &self,
        creds: &Credentials,
        pair: &str,
        amount_quote: f64,
    ) -> EngineResult<TradeReceipt> {
        self.trade(creds, pair, Side::Buy, "market", None, ("idr", amount_quote))
            .await
    }

    /// `openOrders` — open orders for one pair, or all pairs when `None`.
    #[instrument(skip(self, creds), name = "indodax::open_orders")]
    pub async fn open_orders(
        &self,
        creds: &Credentials,
        pair: Option<&str>,
    ) -> EngineResult<Vec<ExchangeOrder>> {
        let mut params = Vec::new();
        if let Some(p) = pair {
            params.push(("pair", wire_pair(p)?));
        }
        let ret = self
            .private_call(creds, &self.limits.trade, "openOrders", &params)
            .await?;

        let mut out = Vec::new();
        match &ret["orders"] {
            // Single-pair form: a flat array.
            serde_json::Value::Array(orders) => {
                let p = pair.unwrap_or_default();
                for raw in orders {
                    match ExchangeOrder::from_wire(p, raw) {
                        Ok(order) => out.push(order),
                        Err(e) => warn!(error = %e, "skipping malformed open order"),
                    }
                }
            }
            // All-pairs form: pair id -> array.
            serde_json::Value::Object(by_pair) => {
                for (p, orders) in by_pair {
                    if let Some(orders) = orders.as_array() {
                        for raw in orders {
                            match ExchangeOrder::from_wire(p, raw) {
                                Ok(order) => out.push(order),
                                Err(e) => warn!(error = %e, "skipping malformed open order"),
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(out)
    }

    /// `getOrder` — a single order by id. `OrderNotFound` is a normal
    /// outcome here (already filled or cancelled and pruned).
    #[instrument(skip(self, creds), name = "indodax::get_order")]
    pub async fn get_order(
        &self,
        creds: &Credentials,
        pair: &str,
        order_id: &str,
    ) -> EngineResult<ExchangeOrder> {
        let params = vec![("pair", wire_pair(pair)?), ("order_id", order_id.to_string())];
        let ret = self
            .private_call(creds, &self.limits.trade, "getOrder", &params)
            .await?;
        ExchangeOrder::from_wire(pair, &ret["order"])
    }

    /// `cancelOrder`.
    #[instrument(skip(self, creds), name = "indodax::cancel_order")]
    pub async fn cancel_order(
        &self,
        creds: &Credentials,
        pair: &str,
        order_id: &str,
        side: Side,
    ) -> EngineResult<()> {
        let params = vec![
            ("pair", wire_pair(pair)?),
            ("order_id", order_id.to_string()),
            ("type", side.as_str().to_string()),
        ];
        self.private_call(creds, &self.limits.cancel, "cancelOrder", &params)
            .await?;
        debug!(pair, order_id, "order cancelled");
        Ok(())
    }

    /// `orderHistory` — recent closed orders for a pair.
    pub async fn order_history(
        &self,
        creds: &Credentials,
        pair: &str,
        count: u32,
    ) -> EngineResult<Vec<ExchangeOrder>> {
        let params = vec![("pair", wire_pair(pair)?), ("count", count.to_string())];
        let ret = self
            .private_call(creds, &self.limits.trade, "orderHistory", &params)
            .await?;

        let mut out = Vec::new();
        if let Some(orders) = ret["orders"].as_array() {
            for raw in orders {
                match ExchangeOrder::from_wire(pair, raw) {
                    Ok(order) => out.push(order),
                    Err(e) => warn!(error = %e, "skipping malformed history order"),
                }
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Private WebSocket token
    // -------------------------------------------------------------------------

    /// Signed POST to /api/private_ws/v1/generate_token. The returned token
    /// authenticates a private WS connection for a bounded time.
    #[instrument(skip(self, creds), name = "indodax::generate_ws_token")]
    pub async fn generate_private_ws_token(&self, creds: &Credentials) -> EngineResult<String> {
        self.limits.trade.acquire(&self.cancel).await?;

        let payload = format!("nonce={}", self.next_nonce());
        let sign = Self::sign(&creds.secret, &payload);
        let url = format!("{}/api/private_ws/v1/generate_token", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("Key", &creds.key)
            .header("Sign", &sign)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("generate_token: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("decode generate_token: {e}")))?;

        body["data"]["token"]
            .as_str()
            .or_else(|| body["token"].as_str())
            .map(String::from)
            .ok_or_else(|| EngineError::Credential("private ws token request rejected".into()))
    }
}

// =============================================================================
// Envelope / error classification
// =============================================================================

/// Unwrap the `{success, return, error, error_code}` envelope of /tapi.
fn unwrap_envelope(method: &str, body: serde_json::Value) -> EngineResult<serde_json::Value> {
    let success = body["success"].as_i64().unwrap_or(0);
    if success == 1 {
        return Ok(body["return"].clone());
    }

    let message = body["error"].as_str().unwrap_or("unknown error").to_string();
    let code = body["error_code"].as_str().unwrap_or_default().to_string();
    warn!(method, %code, %message, "private call rejected");
    Err(classify_api_error(&message, &code))
}

/// Map an exchange error string to the semantic taxonomy.
fn classify_api_error(message: &str, code: &str) -> EngineError {
    let lower = message.to_lowercase();
    if code == "invalid_credentials"
        || lower.contains("invalid credentials")
        || lower.contains("invalid key")
        || lower.contains("bad sign")
        || lower.contains("unauthorized")
    {
        EngineError::Credential(message.to_string())
    } else if lower.contains("order not found") || lower.contains("invalid order") {
        EngineError::OrderNotFound
    } else if lower.contains("insufficient")
        || lower.contains("minimum")
        || lower.contains("too small")
    {
        EngineError::Invariant(message.to_string())
    } else {
        EngineError::Internal(format!("exchange: {message}"))
    }
}

/// Format a monetary amount without scientific notation and without a
/// trailing fraction for integral values.
fn format_amount(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let formatted = format!("{value:.8}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

impl std::fmt::Debug for IndodaxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndodaxClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex_sha512() {
        let sig = IndodaxClient::sign("secret", "method=getInfo&nonce=1");
        assert_eq!(sig.len(), 128);
        assert_eq!(sig, IndodaxClient::sign("secret", "method=getInfo&nonce=1"));
        assert_ne!(sig, IndodaxClient::sign("other", "method=getInfo&nonce=1"));
    }

    #[test]
    fn nonce_is_strictly_monotonic() {
        let client = IndodaxClient::new("https://example.test", CancellationToken::new());
        let a = client.next_nonce();
        let b = client.next_nonce();
        let c = client.next_nonce();
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn envelope_success_returns_payload() {
        let body = serde_json::json!({"success": 1, "return": {"ok": true}});
        let ret = unwrap_envelope("getInfo", body).unwrap();
        assert_eq!(ret["ok"], true);
    }

    #[test]
    fn envelope_classifies_credential_errors() {
        let body = serde_json::json!({"success": 0, "error": "Invalid credentials. Bad sign"});
        assert!(matches!(
            unwrap_envelope("getInfo", body),
            Err(EngineError::Credential(_))
        ));
    }

    #[test]
    fn envelope_classifies_order_not_found() {
        let body = serde_json::json!({"success": 0, "error": "Order not found"});
        assert!(matches!(
            unwrap_envelope("getOrder", body),
            Err(EngineError::OrderNotFound)
        ));
    }

    #[test]
    fn envelope_classifies_invariants() {
        let body = serde_json::json!({"success": 0, "error": "Insufficient balance."});
        assert!(matches!(
            unwrap_envelope("trade", body),
            Err(EngineError::Invariant(_))
        ));
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(650_000_000.0), "650000000");
        assert_eq!(format_amount(0.00153846), "0.00153846");
        assert_eq!(format_amount(0.5), "0.5");
    }
}
