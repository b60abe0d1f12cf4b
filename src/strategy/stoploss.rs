// =============================================================================
// Stop-Loss Monitor — price-driven protective sell for copilot trades
// =============================================================================
//
// Holds an in-memory watch set of filled copilot trades. Every second it
// reads the latest price from the market engine and fires the copilot's
// stop-loss path for any trade at or below its threshold. Entries are added
// when the auto-sell is placed and removed on sell fill or manual cancel.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::market::MarketDataEngine;

/// Sweep period.
const CHECK_INTERVAL_SECS: u64 = 1;

/// One watched trade.
#[derive(Debug, Clone)]
pub struct StopWatch {
    pub trade_id: String,
    pub user_id: String,
    pub pair: String,
    pub buy_price: f64,
    pub stop_loss_percent: f64,
}

/// Narrow callback surface into the copilot, breaking the copilot <->
/// monitor dependency cycle.
#[async_trait]
pub trait StopTrigger: Send + Sync {
    async fn trigger_stop_loss(&self, trade_id: &str);
}

pub struct StopLossMonitor {
    watches: Mutex<HashMap<String, StopWatch>>,
    market: Arc<MarketDataEngine>,
}

impl StopLossMonitor {
    pub fn new(market: Arc<MarketDataEngine>) -> Arc<Self> {
        Arc::new(Self {
            watches: Mutex::new(HashMap::new()),
            market,
        })
    }

    pub fn add(&self, watch: StopWatch) {
        debug!(
            trade_id = %watch.trade_id,
            pair = %watch.pair,
            buy_price = watch.buy_price,
            stop_loss_percent = watch.stop_loss_percent,
            "stop-loss watch added"
        );
        self.watches.lock().insert(watch.trade_id.clone(), watch);
    }

    pub fn remove(&self, trade_id: &str) {
        if self.watches.lock().remove(trade_id).is_some() {
            debug!(trade_id, "stop-loss watch removed");
        }
    }

    pub fn contains(&self, trade_id: &str) -> bool {
        self.watches.lock().contains_key(trade_id)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// One sweep: collect triggered trades (removing them from the watch set
    /// first so a slow trigger cannot fire twice).
    fn collect_triggered(&self) -> Vec<StopWatch> {
        let mut triggered = Vec::new();
        let mut watches = self.watches.lock();

        watches.retain(|_, watch| {
            let Some(price) = self.market.price_of(&watch.pair) else {
                return true;
            };
            if should_trigger(price, watch.buy_price, watch.stop_loss_percent) {
                triggered.push(watch.clone());
                false
            } else {
                true
            }
        });

        triggered
    }

    /// Run until cancelled, invoking `trigger` for each tripped watch.
    pub async fn run(self: Arc<Self>, trigger: Arc<dyn StopTrigger>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(CHECK_INTERVAL_SECS));
        info!("stop-loss monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop-loss monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    for watch in self.collect_triggered() {
                        warn!(
                            trade_id = %watch.trade_id,
                            pair = %watch.pair,
                            "stop-loss triggered"
                        );
                        trigger.trigger_stop_loss(&watch.trade_id).await;
                    }
                }
            }
        }
    }
}

/// `current ≤ buy × (1 − stop_loss/100)`.
pub fn should_trigger(current: f64, buy_price: f64, stop_loss_percent: f64) -> bool {
    if current <= 0.0 || buy_price <= 0.0 {
        return false;
    }
    current <= buy_price * (1.0 - stop_loss_percent / 100.0)
}

impl std::fmt::Debug for StopLossMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopLossMonitor")
            .field("watches", &self.watches.lock().len())
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

    #[test]
    fn trigger_threshold_is_inclusive() {
        // 650M buy, 3% stop: threshold is exactly 630.5M.
        assert!(should_trigger(630_500_000.0, 650_000_000.0, 3.0));
        assert!(should_trigger(630_499_999.0, 650_000_000.0, 3.0));
        assert!(!should_trigger(630_500_001.0, 650_000_000.0, 3.0));
    }

    #[test]
    fn zero_prices_never_trigger() {
        assert!(!should_trigger(0.0, 650_000_000.0, 3.0));
        assert!(!should_trigger(100.0, 0.0, 3.0));
    }

    #[test]
    fn sweep_removes_only_triggered_watches() {
        let store = Arc::new(MemoryKv::new());
        let market = crate::market::MarketDataEngine::new(store);
        let rows = serde_json::json!([
            ["btc_idr", 0, "630500000", "620000000", "660000000", "650000000", "1", "1"],
            ["eth_idr", 0, "100", "90", "110", "95", "1", "1"]
        ]);
        market.ingest_summary_rows(&rows, 1_000);

        let monitor = StopLossMonitor::new(market);
        monitor.add(StopWatch {
            trade_id: "t1".into(),
            user_id: "u1".into(),
            pair: "btcidr".into(),
            buy_price: 650_000_000.0,
            stop_loss_percent: 3.0,
        });
        monitor.add(StopWatch {
            trade_id: "t2".into(),
            user_id: "u1".into(),
            pair: "ethidr".into(),
            buy_price: 100.0,
            stop_loss_percent: 3.0,
        });

        let triggered = monitor.collect_triggered();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].trade_id, "t1");
        assert!(!monitor.contains("t1"));
        assert!(monitor.contains("t2"));
    }

    #[test]
    fn unknown_pair_stays_watched() {
        let store = Arc::new(MemoryKv::new());
        let market = crate::market::MarketDataEngine::new(store);
        let monitor = StopLossMonitor::new(market);
        monitor.add(StopWatch {
            trade_id: "t1".into(),
            user_id: "u1".into(),
            pair: "nopair".into(),
            buy_price: 100.0,
            stop_loss_percent: 5.0,
        });
        assert!(monitor.collect_triggered().is_empty());
        assert!(monitor.contains("t1"));
    }
}
