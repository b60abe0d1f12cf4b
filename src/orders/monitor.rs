// =============================================================================
// Order Monitor — lifecycle tracking for every live exchange order
// =============================================================================
//
// One instance serves the whole process. Strategies register live orders
// with a FillSink; the monitor polls each user's open orders, disambiguates
// absentees via getOrder, classifies the terminal state, and invokes the
// sink exactly once (the tracked entry is removed before the callback is
// spawned). Private-WS order events feed the same resolution path as
// low-latency hints.
//
// Paper orders never reach this monitor — they are resolved synthetically
// inside their strategy.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::exchange::client::Credentials;
use crate::exchange::types::ExchangeOrder;
use crate::exchange::IndodaxClient;
use crate::orders::Order;
use crate::vault::CredentialVault;

/// Terminal classification of a tracked order.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// `filled_amount == amount`.
    Filled { filled: f64, price: f64 },
    /// Cancelled with a partial fill; the filled part is real.
    PartialCancelled { filled: f64, price: f64 },
    /// Cancelled untouched.
    Cancelled,
}

/// Callback surface a strategy registers with each order. Implementations
/// must return quickly; heavy work belongs on the strategy's own task.
#[async_trait]
pub trait FillSink: Send + Sync {
    async fn on_fill(&self, order: Order, outcome: FillOutcome);

    /// The user's API key was rejected while monitoring this order. The
    /// order has been detached; the owning strategy should treat this as
    /// fatal for anything holding that key.
    async fn on_credential_error(&self, order: Order, message: String) {
        error!(
            order_id = %order.id,
            user_id = %order.user_id,
            %message,
            "credential error while monitoring order"
        );
    }
}

struct TrackedOrder {
    order: Order,
    sink: Arc<dyn FillSink>,
}

/// Consecutive failures after which a user's polling backs off, and the cap
/// on skipped polls.
const BACKOFF_AFTER_FAILURES: u32 = 2;
const BACKOFF_MAX_SKIPS: u32 = 6;

#[derive(Default)]
struct UserBackoff {
    consecutive_failures: u32,
    skips_remaining: u32,
}

pub struct OrderMonitor {
    client: Arc<IndodaxClient>,
    vault: Arc<CredentialVault>,
    tracked: Mutex<HashMap<String, TrackedOrder>>,
    backoff: Mutex<HashMap<String, UserBackoff>>,
}

impl OrderMonitor {
    pub fn new(client: Arc<IndodaxClient>, vault: Arc<CredentialVault>) -> Arc<Self> {
        Arc::new(Self {
            client,
            vault,
            tracked: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Track a live order. Paper orders are refused: their strategy resolves
    /// them synthetically.
    pub fn track(&self, order: Order, sink: Arc<dyn FillSink>) {
        if order.paper {
            warn!(order_id = %order.id, "paper order not trackable — ignored");
            return;
        }
        debug!(
            order_id = %order.id,
            exchange_order_id = %order.exchange_order_id,
            pair = %order.pair,
            side = %order.side,
            "order tracked"
        );
        self.tracked
            .lock()
            .insert(order.exchange_order_id.clone(), TrackedOrder { order, sink });
    }

    /// Stop tracking without invoking the sink (manual cancellation paths).
    pub fn untrack(&self, exchange_order_id: &str) {
        if self.tracked.lock().remove(exchange_order_id).is_some() {
            debug!(exchange_order_id, "order untracked");
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Resolve a tracked order with a terminal outcome. The entry is removed
    /// before the callback is spawned, so each order resolves at most once.
    fn resolve(&self, exchange_order_id: &str, outcome: FillOutcome) {
        let Some(tracked) = self.tracked.lock().remove(exchange_order_id) else {
            return;
        };

        info!(
            order_id = %tracked.order.id,
            exchange_order_id,
            outcome = ?outcome,
            "order resolved"
        );

        // Callbacks must not block the monitor.
        tokio::spawn(async move {
            tracked.sink.on_fill(tracked.order, outcome).await;
        });
    }

    fn detach_with_credential_error(&self, exchange_order_id: &str, message: &str) {
        let Some(tracked) = self.tracked.lock().remove(exchange_order_id) else {
            return;
        };
        let message = message.to_string();
        tokio::spawn(async move {
            tracked
                .sink
                .on_credential_error(tracked.order, message)
                .await;
        });
    }

    /// Feed an order event from the private WebSocket. Terminal events
    /// resolve the order through the same exactly-once path as the poller.
    pub fn note_order_update(&self, update: &ExchangeOrder) {
        if let Some(outcome) = classify(update) {
            self.resolve(&update.order_id, outcome);
        }
    }

    // -------------------------------------------------------------------------
    // Polling loop
    // -------------------------------------------------------------------------

    /// Run the monitor until cancelled. One pass per `poll_secs`, iterating
    /// users sequentially so a single user is never polled concurrently.
    pub async fn run(self: Arc<Self>, poll_secs: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(poll_secs));
        info!(poll_secs, "order monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("order monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&self) {
        // Snapshot user -> exchange order ids so the lock is not held across
        // awaits.
        let by_user: HashMap<String, Vec<String>> = {
            let tracked = self.tracked.lock();
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for (ex_id, t) in tracked.iter() {
                map.entry(t.order.user_id.clone())
                    .or_default()
                    .push(ex_id.clone());
            }
            map
        };

        for (user_id, order_ids) in by_user {
            if self.should_skip(&user_id) {
                continue;
            }
            match self.poll_user(&user_id, &order_ids).await {
                Ok(()) => self.note_success(&user_id),
                Err(e) => {
                    warn!(%user_id, error = %e, "order poll failed for user");
                    self.note_failure(&user_id);
                }
            }
        }
    }

    async fn poll_user(&self, user_id: &str, order_ids: &[String]) -> Result<(), EngineError> {
        let creds = match self.vault.decrypt(user_id).await {
            Ok((key, secret)) => Credentials { key, secret },
            Err(EngineError::Credential(msg)) => {
                // Fatal for everything this user has in flight.
                for ex_id in order_ids {
                    self.detach_with_credential_error(ex_id, &msg);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let open = self.client.open_orders(&creds, None).await;
        let open = match open {
            Ok(orders) => orders,
            Err(EngineError::Credential(msg)) => {
                for ex_id in order_ids {
                    self.detach_with_credential_error(ex_id, &msg);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let open_ids: std::collections::HashSet<&str> =
            open.iter().map(|o| o.order_id.as_str()).collect();

        for ex_id in order_ids {
            if open_ids.contains(ex_id.as_str()) {
                continue;
            }

            // No longer open: fully filled or cancelled. Disambiguate.
            let pair = match self.tracked.lock().get(ex_id) {
                Some(t) => t.order.pair.clone(),
                None => continue,
            };

            match self.client.get_order(&creds, &pair, ex_id).await {
                Ok(final_state) => {
                    if let Some(outcome) = classify(&final_state) {
                        self.resolve(ex_id, outcome);
                    } else {
                        // Exchange still reports it open; openOrders lagged.
                        debug!(%ex_id, "order absent from openOrders but still open");
                    }
                }
                Err(EngineError::OrderNotFound) => {
                    // Benign: already processed on the exchange side.
                    warn!(%ex_id, "order vanished — detaching");
                    self.untrack(ex_id);
                }
                Err(EngineError::Credential(msg)) => {
                    self.detach_with_credential_error(ex_id, &msg);
                }
                Err(e) => {
                    debug!(%ex_id, error = %e, "getOrder failed — will retry");
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-user backoff
    // -------------------------------------------------------------------------

    fn should_skip(&self, user_id: &str) -> bool {
        let mut backoff = self.backoff.lock();
        if let Some(state) = backoff.get_mut(user_id) {
            if state.skips_remaining > 0 {
                state.skips_remaining -= 1;
                return true;
            }
        }
        false
    }

    fn note_success(&self, user_id: &str) {
        self.backoff.lock().remove(user_id);
    }

    fn note_failure(&self, user_id: &str) {
        let mut backoff = self.backoff.lock();
        let state = backoff.entry(user_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BACKOFF_AFTER_FAILURES {
            state.skips_remaining = (state.consecutive_failures - BACKOFF_AFTER_FAILURES + 1)
                .min(BACKOFF_MAX_SKIPS);
        }
    }
}

/// Classify a final order state. `None` means the order is still open.
pub fn classify(order: &ExchangeOrder) -> Option<FillOutcome> {
    match order.status.as_str() {
        "filled" => Some(FillOutcome::Filled {
            filled: if order.filled() > 0.0 {
                order.filled()
            } else {
                order.amount
            },
            price: order.price,
        }),
        "cancelled" | "canceled" => {
            if order.filled() > 0.0 {
                Some(FillOutcome::PartialCancelled {
                    filled: order.filled(),
                    price: order.price,
                })
            } else {
                Some(FillOutcome::Cancelled)
            }
        }
        _ => {
            // Open orders with zero remainder are effectively filled even if
            // the status string lags.
            if order.amount > 0.0 && order.remaining == 0.0 {
                Some(FillOutcome::Filled {
                    filled: order.amount,
                    price: order.price,
                })
            } else {
                None
            }
        }
    }
}

impl std::fmt::Debug for OrderMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderMonitor")
            .field("tracked", &self.tracked.lock().len())
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
    use crate::types::{ParentType, Side};

    struct RecordingSink {
        fills: Mutex<Vec<(String, FillOutcome)>>,
        credential_errors: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fills: Mutex::new(Vec::new()),
                credential_errors: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FillSink for RecordingSink {
        async fn on_fill(&self, order: Order, outcome: FillOutcome) {
            self.fills.lock().push((order.exchange_order_id, outcome));
        }

        async fn on_credential_error(&self, order: Order, _message: String) {
            self.credential_errors.lock().push(order.exchange_order_id);
        }
    }

    fn live_order(ex_id: &str) -> Order {
        Order::new(
            "u1",
            "trade-1",
            ParentType::Trade,
            ex_id,
            "btcidr",
            Side::Buy,
            650_000_000.0,
            1.0,
            false,
        )
    }

    fn monitor() -> Arc<OrderMonitor> {
        let cancel = CancellationToken::new();
        let client = Arc::new(IndodaxClient::new("https://example.test", cancel));
        let store: Arc<dyn crate::store::KvStore> = Arc::new(MemoryKv::new());
        let vault = Arc::new(CredentialVault::new([0u8; 32], store));
        OrderMonitor::new(client, vault)
    }

    fn wire_order(status: &str, amount: f64, remaining: f64) -> ExchangeOrder {
        ExchangeOrder {
            order_id: "ex-1".into(),
            pair: "btcidr".into(),
            side: Side::Buy,
            price: 650_000_000.0,
            amount,
            remaining,
            status: status.into(),
        }
    }

    #[test]
    fn classify_fully_filled() {
        let outcome = classify(&wire_order("filled", 1.0, 0.0)).unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled {
                filled: 1.0,
                price: 650_000_000.0
            }
        );
    }

    #[test]
    fn classify_partial_then_cancel() {
        let outcome = classify(&wire_order("cancelled", 1.0, 0.7)).unwrap();
        assert_eq!(
            outcome,
            FillOutcome::PartialCancelled {
                filled: 0.3,
                price: 650_000_000.0
            }
        );
    }

    #[test]
    fn classify_cancelled_untouched() {
        let outcome = classify(&wire_order("cancelled", 1.0, 1.0)).unwrap();
        assert_eq!(outcome, FillOutcome::Cancelled);
    }

    #[test]
    fn classify_open_is_none() {
        assert!(classify(&wire_order("open", 1.0, 0.5)).is_none());
    }

    #[test]
    fn classify_open_with_zero_remainder_is_filled() {
        assert!(matches!(
            classify(&wire_order("open", 1.0, 0.0)),
            Some(FillOutcome::Filled { .. })
        ));
    }

    #[tokio::test]
    async fn private_ws_hint_resolves_exactly_once() {
        let monitor = monitor();
        let sink = RecordingSink::new();
        monitor.track(live_order("ex-1"), sink.clone());
        assert_eq!(monitor.tracked_count(), 1);

        let update = wire_order("filled", 1.0, 0.0);
        monitor.note_order_update(&update);
        monitor.note_order_update(&update);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sink.fills.lock().len(), 1);
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn paper_orders_are_refused() {
        let monitor = monitor();
        let sink = RecordingSink::new();
        let mut order = live_order("ex-2");
        order.paper = true;
        monitor.track(order, sink);
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn untrack_prevents_delivery() {
        let monitor = monitor();
        let sink = RecordingSink::new();
        monitor.track(live_order("ex-3"), sink.clone());
        monitor.untrack("ex-3");

        monitor.note_order_update(&wire_order("filled", 1.0, 0.0));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(sink.fills.lock().is_empty());
    }

    #[test]
    fn backoff_skips_after_repeated_failures() {
        let monitor = monitor();
        assert!(!monitor.should_skip("u1"));
        monitor.note_failure("u1");
        assert!(!monitor.should_skip("u1"));
        monitor.note_failure("u1");
        assert!(monitor.should_skip("u1"));
        // One skip consumed; next poll proceeds.
        assert!(!monitor.should_skip("u1"));
        monitor.note_success("u1");
        assert!(!monitor.should_skip("u1"));
    }
}
