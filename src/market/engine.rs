// =============================================================================
// Market Data Engine — per-pair state, analytics, and fan-out
// =============================================================================
//
// Ownership of mutations (never concurrent for one pair):
//   - summary stream  -> OHLC, volumes, price ticks
//   - REST gap poller -> best bid/ask
//   - timeframe sweep -> bucket resets
//
// Subscriber handlers run synchronously on the ingesting task under the
// shared lock, so they must be non-blocking (bots push into their own
// channels). KV mirroring is decoupled through an unbounded queue so WS
// ingest never awaits the store.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exchange::types::{parse_f64_or_zero, TickerSummary};
use crate::exchange::IndodaxClient;
use crate::market::coin::Coin;
use crate::store::KvStore;

/// Channel used for lightweight market pushes to the realtime hub.
pub const MARKET_UPDATE_CHANNEL: &str = "market.update";

/// Non-blocking observer of coin updates.
pub type CoinHandler = Arc<dyn Fn(&Coin) + Send + Sync>;

pub struct MarketDataEngine {
    coins: RwLock<HashMap<String, Coin>>,
    subscribers: RwLock<Vec<(u64, CoinHandler)>>,
    next_sub_id: AtomicU64,
    store: Arc<dyn KvStore>,
    mirror_tx: mpsc::UnboundedSender<Coin>,
    mirror_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Coin>>>,
}

impl MarketDataEngine {
    pub fn new(store: Arc<dyn KvStore>) -> Arc<Self> {
        let (mirror_tx, mirror_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            coins: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            store,
            mirror_tx,
            mirror_rx: parking_lot::Mutex::new(Some(mirror_rx)),
        })
    }

    /// Spawn the KV mirror task. Call once.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = self.clone();
        let mut rx = self
            .mirror_rx
            .lock()
            .take()
            .expect("MarketDataEngine::start called twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("market mirror task shutting down");
                        return;
                    }
                    coin = rx.recv() => {
                        match coin {
                            Some(coin) => {
                                if let Err(e) = engine.mirror(&coin).await {
                                    warn!(pair = %coin.pair, error = %e, "coin mirror failed");
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe(&self, handler: CoinHandler) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    fn notify(&self, coin: &Coin) {
        let subscribers = self.subscribers.read();
        for (_, handler) in subscribers.iter() {
            handler(coin);
        }
    }

    // -------------------------------------------------------------------------
    // Ingest paths
    // -------------------------------------------------------------------------

    /// Ingest a batch of summary-24h rows from the public stream. Each row is
    /// `[pair, _, last, low, high, open, volume_quote, volume_base, ...]`.
    pub fn ingest_summary_rows(&self, data: &serde_json::Value, now: i64) {
        let Some(rows) = data.as_array() else {
            debug!("summary push without row array");
            return;
        };

        for row in rows {
            let Some(cols) = row.as_array() else { continue };
            let Some(pair_raw) = cols.first().and_then(|v| v.as_str()) else {
                continue;
            };
            let pair = crate::exchange::types::normalize_pair(pair_raw);

            let last = cols.get(2).map(parse_f64_or_zero).unwrap_or(0.0);
            let low = cols.get(3).map(parse_f64_or_zero).unwrap_or(0.0);
            let high = cols.get(4).map(parse_f64_or_zero).unwrap_or(0.0);
            let open = cols.get(5).map(parse_f64_or_zero).unwrap_or(0.0);
            let vol_quote = cols.get(6).map(parse_f64_or_zero).unwrap_or(0.0);
            let vol_base = cols.get(7).map(parse_f64_or_zero).unwrap_or(0.0);

            if last <= 0.0 {
                continue;
            }

            let updated = {
                let mut coins = self.coins.write();
                let coin = coins
                    .entry(pair.clone())
                    .or_insert_with(|| Coin::new(&pair, now));
                coin.apply_summary(last, low, high, open, vol_quote, vol_base, now);
                coin.clone()
            };

            self.notify(&updated);
            let _ = self.mirror_tx.send(updated);
        }
    }

    /// Ingest one REST summary entry: best bid/ask for a pair.
    pub fn ingest_rest_summary(&self, summary: &TickerSummary, now: i64) {
        if summary.buy <= 0.0 && summary.sell <= 0.0 {
            return;
        }

        let updated = {
            let mut coins = self.coins.write();
            let coin = coins
                .entry(summary.pair.clone())
                .or_insert_with(|| Coin::new(&summary.pair, now));
            if coin.volume_idr == 0.0 {
                coin.volume_idr = summary.vol_quote;
            }
            coin.apply_best_prices(summary.buy, 0.0, summary.sell, 0.0, now);
            coin.clone()
        };

        self.notify(&updated);
        let _ = self.mirror_tx.send(updated);
    }

    /// Reset every elapsed timeframe bucket across all pairs. Pairs whose
    /// buckets changed are re-scored, re-published, and re-mirrored.
    pub fn sweep_timeframes(&self, now: i64) -> usize {
        let mut changed = Vec::new();
        {
            let mut coins = self.coins.write();
            for coin in coins.values_mut() {
                if coin.reset_due_timeframes(now) {
                    changed.push(coin.clone());
                }
            }
        }

        let count = changed.len();
        for coin in changed {
            self.notify(&coin);
            let _ = self.mirror_tx.send(coin);
        }
        count
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// 10-second ticker that walks active pairs and resets elapsed buckets.
    pub async fn run_timeframe_manager(self: Arc<Self>, period_secs: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period_secs));
        info!(period_secs, "timeframe manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("timeframe manager shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let reset = self.sweep_timeframes(Utc::now().timestamp());
                    if reset > 0 {
                        debug!(pairs = reset, "timeframe buckets reset");
                    }
                }
            }
        }
    }

    /// Periodic REST poll for bid/ask, which the summary stream does not
    /// carry. Failures are logged and retried next tick.
    pub async fn run_gap_poller(
        self: Arc<Self>,
        client: Arc<IndodaxClient>,
        period_secs: u64,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period_secs));
        info!(period_secs, "gap poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("gap poller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match client.get_summaries().await {
                        Ok(summaries) => {
                            let now = Utc::now().timestamp();
                            let count = summaries.len();
                            for summary in &summaries {
                                self.ingest_rest_summary(summary, now);
                            }
                            debug!(count, "rest summaries applied");
                        }
                        Err(e) => error!(error = %e, "rest summary poll failed"),
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_coin(&self, pair: &str) -> Option<Coin> {
        self.coins.read().get(pair).cloned()
    }

    pub fn price_of(&self, pair: &str) -> Option<f64> {
        self.coins.read().get(pair).map(|c| c.price).filter(|p| *p > 0.0)
    }

    pub fn all_coins(&self) -> Vec<Coin> {
        self.coins.read().values().cloned().collect()
    }

    pub fn pair_count(&self) -> usize {
        self.coins.read().len()
    }

    // -------------------------------------------------------------------------
    // KV mirror
    // -------------------------------------------------------------------------

    /// Mirror one coin to the store: hash, the four ranking sorted sets, the
    /// active-pairs set, and a lightweight pub/sub push.
    pub(crate) async fn mirror(&self, coin: &Coin) -> crate::error::EngineResult<()> {
        let key = format!("coin:{}", coin.pair);
        self.store.hash_set(&key, &coin.to_hash()).await?;

        self.store
            .zset_add("market:sorted:pump_score", &coin.pair, coin.pump_score)
            .await?;
        self.store
            .zset_add(
                "market:sorted:gap_percentage",
                &coin.pair,
                coin.gap_percentage,
            )
            .await?;
        self.store
            .zset_add("market:sorted:volume_idr", &coin.pair, coin.volume_idr)
            .await?;
        self.store
            .zset_add("market:sorted:change_24h", &coin.pair, coin.change_24h)
            .await?;
        self.store.set_add("market:active_pairs", &coin.pair).await?;

        let push = serde_json::json!({
            "pair": coin.pair,
            "price": coin.price,
            "change_24h": coin.change_24h,
            "pump_score": coin.pump_score,
            "gap_percentage": coin.gap_percentage,
            "volume_idr": coin.volume_idr,
            "last_update": coin.last_update,
        });
        self.store
            .publish(MARKET_UPDATE_CHANNEL, &push.to_string())
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MarketDataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataEngine")
            .field("pairs", &self.coins.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn engine() -> (Arc<MarketDataEngine>, Arc<MemoryKv>) {
        let store = Arc::new(MemoryKv::new());
        (MarketDataEngine::new(store.clone()), store)
    }

    #[test]
    fn summary_rows_create_and_update_coins() {
        let (engine, _) = engine();
        let rows = serde_json::json!([
            ["btc_idr", 0, "650000000", "640000000", "660000000", "645000000", "8100000000", "12.5"]
        ]);

        engine.ingest_summary_rows(&rows, 1_000);

        let coin = engine.get_coin("btcidr").expect("coin created");
        assert_eq!(coin.price, 650_000_000.0);
        assert_eq!(coin.volume_idr, 8.1e9);
        assert!((coin.change_24h - (5_000_000.0 / 645_000_000.0 * 100.0)).abs() < 1e-9);
        assert_eq!(coin.timeframes[0].trx, 1);
    }

    #[test]
    fn subscribers_see_each_update() {
        let (engine, _) = engine();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        engine.subscribe(Arc::new(move |coin: &Coin| {
            seen_clone.lock().push((coin.pair.clone(), coin.price));
        }));

        let rows = serde_json::json!([
            ["btc_idr", 0, "100", "90", "110", "95", "2000000000", "5"],
            ["eth_idr", 0, "50", "45", "55", "48", "1500000000", "10"]
        ]);
        engine.ingest_summary_rows(&rows, 1_000);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&("btcidr".to_string(), 100.0)));
        assert!(seen.contains(&("ethidr".to_string(), 50.0)));
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let (engine, _) = engine();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let id = engine.subscribe(Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        }));

        let rows =
            serde_json::json!([["btc_idr", 0, "100", "90", "110", "95", "1", "1"]]);
        engine.ingest_summary_rows(&rows, 1_000);
        engine.unsubscribe(id);
        engine.ingest_summary_rows(&rows, 1_001);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rest_summary_sets_bid_ask_and_gap() {
        let (engine, _) = engine();
        let rows = serde_json::json!([
            ["btc_idr", 0, "650000000", "640000000", "660000000", "645000000", "8100000000", "12.5"]
        ]);
        engine.ingest_summary_rows(&rows, 1_000);

        let rest = TickerSummary {
            pair: "btcidr".into(),
            buy: 650_000_000.0,
            sell: 653_250_000.0,
            ..Default::default()
        };
        engine.ingest_rest_summary(&rest, 1_001);

        let coin = engine.get_coin("btcidr").unwrap();
        assert_eq!(coin.best_bid, 650_000_000.0);
        assert_eq!(coin.best_ask, 653_250_000.0);
        assert!((coin.gap_percentage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sweep_resets_elapsed_buckets() {
        let (engine, _) = engine();
        let rows =
            serde_json::json!([["btc_idr", 0, "100", "90", "110", "95", "1", "1"]]);
        engine.ingest_summary_rows(&rows, 0);

        // 61s later only the 1m bucket is due.
        assert_eq!(engine.sweep_timeframes(61), 1);
        let coin = engine.get_coin("btcidr").unwrap();
        assert_eq!(coin.timeframes[0].trx, 0);
        assert_eq!(coin.timeframes[1].trx, 1);

        // Nothing else due immediately after.
        assert_eq!(engine.sweep_timeframes(62), 0);
    }

    #[tokio::test]
    async fn mirror_writes_hash_sorted_sets_and_active_pairs() {
        let (engine, store) = engine();
        let rows = serde_json::json!([
            ["btc_idr", 0, "650000000", "640000000", "660000000", "645000000", "8100000000", "12.5"]
        ]);
        engine.ingest_summary_rows(&rows, 1_000);

        let coin = engine.get_coin("btcidr").unwrap();
        engine.mirror(&coin).await.unwrap();

        let hash = store.hash_get_all("coin:btcidr").await.unwrap();
        assert_eq!(hash.get("pair").map(String::as_str), Some("btcidr"));

        let vols = store
            .zset_range_desc("market:sorted:volume_idr", 10)
            .await
            .unwrap();
        assert_eq!(vols[0].0, "btcidr");
        assert_eq!(vols[0].1, 8.1e9);

        let active = store.set_members("market:active_pairs").await.unwrap();
        assert_eq!(active, vec!["btcidr".to_string()]);
    }
}
