// =============================================================================
// Subscription Manager — ref-counted per-pair order-book multiplexing
// =============================================================================
//
// Many bots want best bid/ask for their pair; the exchange wants exactly one
// `order-book-{pair}` subscription per pair. This manager opens the
// underlying channel on the first subscriber and closes it with the last.
//
// Handlers run on the WS reader task and must not block.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::exchange::public_ws::{order_book_channel, PublicWs, SubscriptionId};
use crate::exchange::types::{parse_best_prices, BestPrices};

/// Non-blocking observer of best-price updates for one pair.
pub type TickerHandler = Arc<dyn Fn(&BestPrices) + Send + Sync>;

/// Handle returned by [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone)]
pub struct TickerSubscription {
    pub pair: String,
    id: u64,
}

struct PairEntry {
    ws_sub: SubscriptionId,
    handlers: Vec<(u64, TickerHandler)>,
}

pub struct SubscriptionManager {
    ws: Arc<PublicWs>,
    pairs: Mutex<HashMap<String, PairEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(ws: Arc<PublicWs>) -> Arc<Self> {
        Arc::new(Self {
            ws,
            pairs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a handler for a pair's best bid/ask. The first subscriber
    /// opens the underlying WS channel.
    pub fn subscribe(self: &Arc<Self>, pair: &str, handler: TickerHandler) -> TickerSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pairs = self.pairs.lock();

        match pairs.get_mut(pair) {
            Some(entry) => {
                entry.handlers.push((id, handler));
                debug!(pair, subscribers = entry.handlers.len(), "pair subscriber added");
            }
            None => {
                let weak: Weak<SubscriptionManager> = Arc::downgrade(self);
                let pair_owned = pair.to_string();
                let ws_sub = self.ws.subscribe(
                    &order_book_channel(pair),
                    Arc::new(move |data| {
                        if let Some(manager) = weak.upgrade() {
                            manager.dispatch(&pair_owned, data);
                        }
                    }),
                );
                pairs.insert(
                    pair.to_string(),
                    PairEntry {
                        ws_sub,
                        handlers: vec![(id, handler)],
                    },
                );
                debug!(pair, "pair channel opened");
            }
        }

        TickerSubscription {
            pair: pair.to_string(),
            id,
        }
    }

    /// Remove a handler. The last subscriber for a pair drops the underlying
    /// WS channel entirely.
    pub fn unsubscribe(&self, sub: &TickerSubscription) {
        let mut pairs = self.pairs.lock();
        let Some(entry) = pairs.get_mut(&sub.pair) else {
            return;
        };

        entry.handlers.retain(|(id, _)| *id != sub.id);
        if entry.handlers.is_empty() {
            let entry = pairs.remove(&sub.pair).expect("entry exists");
            self.ws.unsubscribe(&entry.ws_sub);
            debug!(pair = %sub.pair, "pair channel closed");
        }
    }

    /// Number of handlers currently registered for a pair.
    pub fn subscriber_count(&self, pair: &str) -> usize {
        self.pairs.lock().get(pair).map_or(0, |e| e.handlers.len())
    }

    /// Number of pairs with an open underlying channel.
    pub fn active_pair_count(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Parse best bid/ask from an order-book push and fan out.
    fn dispatch(&self, pair: &str, data: &serde_json::Value) {
        let best = parse_best_prices(data);
        if best.bid <= 0.0 && best.ask <= 0.0 {
            return;
        }

        let handlers: Vec<TickerHandler> = {
            let pairs = self.pairs.lock();
            match pairs.get(pair) {
                Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(&best);
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("pairs", &self.pairs.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn manager() -> Arc<SubscriptionManager> {
        let ws = PublicWs::new("wss://example.test", "tok", CancellationToken::new());
        SubscriptionManager::new(ws)
    }

    #[test]
    fn first_subscriber_opens_channel_last_closes_it() {
        let mgr = manager();
        let noop: TickerHandler = Arc::new(|_| {});

        let a = mgr.subscribe("btcidr", noop.clone());
        assert_eq!(mgr.subscriber_count("btcidr"), 1);
        assert_eq!(mgr.ws.handler_count(&order_book_channel("btcidr")), 1);

        let b = mgr.subscribe("btcidr", noop.clone());
        assert_eq!(mgr.subscriber_count("btcidr"), 2);
        // Still only one underlying channel subscription.
        assert_eq!(mgr.ws.handler_count(&order_book_channel("btcidr")), 1);

        mgr.unsubscribe(&a);
        assert_eq!(mgr.subscriber_count("btcidr"), 1);
        assert_eq!(mgr.ws.handler_count(&order_book_channel("btcidr")), 1);

        mgr.unsubscribe(&b);
        assert_eq!(mgr.subscriber_count("btcidr"), 0);
        assert_eq!(mgr.ws.handler_count(&order_book_channel("btcidr")), 0);

        // Unsubscribing twice is a no-op.
        mgr.unsubscribe(&b);
        assert_eq!(mgr.subscriber_count("btcidr"), 0);
    }

    #[test]
    fn identical_subscription_twice_counts_twice() {
        let mgr = manager();
        let noop: TickerHandler = Arc::new(|_| {});
        let _a = mgr.subscribe("ethidr", noop.clone());
        let _b = mgr.subscribe("ethidr", noop);
        assert_eq!(mgr.subscriber_count("ethidr"), 2);
    }

    #[test]
    fn dispatch_parses_and_fans_out() {
        let mgr = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            mgr.subscribe(
                "btcidr",
                Arc::new(move |best: &BestPrices| {
                    seen.lock().push(*best);
                }),
            );
        }

        let data = serde_json::json!({
            "bid": [["650000000", "0.4"]],
            "ask": [["650100000", "0.2"]]
        });
        mgr.dispatch("btcidr", &data);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].bid, 650_000_000.0);
        assert_eq!(seen[0].ask, 650_100_000.0);
    }

    #[test]
    fn empty_book_pushes_are_dropped() {
        let mgr = manager();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        mgr.subscribe(
            "btcidr",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );

        mgr.dispatch("btcidr", &serde_json::json!({"bid": [], "ask": []}));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }
}
