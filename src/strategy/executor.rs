// =============================================================================
// Trade Executor — live exchange routing and paper simulation
// =============================================================================
//
// Strategies place orders through `TradeExecutor` and register them with an
// `OrderTracker`; the pairing decides the mode:
//   - live:  LiveExecutor (signed REST) + the shared OrderMonitor
//   - paper: PaperExecutor for both — synthetic order ids, and fills
//     simulated after a fixed delay straight into the same FillSink path.
//
// Paper fills mutate nothing themselves; the owning strategy's sink performs
// identical balance accounting for both modes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exchange::client::Credentials;
use crate::exchange::IndodaxClient;
use crate::market::MarketDataEngine;
use crate::orders::{FillOutcome, FillSink, Order, OrderMonitor};
use crate::types::Side;
use crate::vault::CredentialVault;

/// Result of placing an order, normalized across live and paper.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    /// Base units filled immediately at placement (market/aggressive fills).
    pub immediate_fill: f64,
    /// Price the order rests at (or the mark used for paper fills).
    pub price: f64,
}

#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Limit buy spending `quote_amount` IDR at `price`.
    async fn limit_buy(
        &self,
        user_id: &str,
        pair: &str,
        price: f64,
        quote_amount: f64,
    ) -> EngineResult<PlacedOrder>;

    /// Limit sell of `base_amount` coins at `price`.
    async fn limit_sell(
        &self,
        user_id: &str,
        pair: &str,
        price: f64,
        base_amount: f64,
    ) -> EngineResult<PlacedOrder>;

    /// Market sell of `base_amount` coins.
    async fn market_sell(&self, user_id: &str, pair: &str, base_amount: f64)
        -> EngineResult<PlacedOrder>;

    /// Market buy spending `quote_amount` IDR.
    async fn market_buy(&self, user_id: &str, pair: &str, quote_amount: f64)
        -> EngineResult<PlacedOrder>;

    async fn cancel(
        &self,
        user_id: &str,
        pair: &str,
        exchange_order_id: &str,
        side: Side,
    ) -> EngineResult<()>;

    fn is_paper(&self) -> bool;
}

/// Narrow registration surface: strategies hand an order and a sink to
/// whatever will deliver its fill (the monitor for live, the paper executor
/// for paper).
pub trait OrderTracker: Send + Sync {
    fn register(&self, order: Order, sink: Arc<dyn FillSink>);
    fn deregister(&self, exchange_order_id: &str);
}

impl OrderTracker for OrderMonitor {
    fn register(&self, order: Order, sink: Arc<dyn FillSink>) {
        self.track(order, sink);
    }

    fn deregister(&self, exchange_order_id: &str) {
        self.untrack(exchange_order_id);
    }
}

// =============================================================================
// Live executor
// =============================================================================

pub struct LiveExecutor {
    client: Arc<IndodaxClient>,
    vault: Arc<CredentialVault>,
}

impl LiveExecutor {
    pub fn new(client: Arc<IndodaxClient>, vault: Arc<CredentialVault>) -> Arc<Self> {
        Arc::new(Self { client, vault })
    }

    async fn creds(&self, user_id: &str) -> EngineResult<Credentials> {
        let (key, secret) = self.vault.decrypt(user_id).await?;
        Ok(Credentials { key, secret })
    }
}

#[async_trait]
impl TradeExecutor for LiveExecutor {
    async fn limit_buy(
        &self,
        user_id: &str,
        pair: &str,
        price: f64,
        quote_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.creds(user_id).await?;
        let receipt = self
            .client
            .place_limit_buy(&creds, pair, price, quote_amount)
            .await?;
        Ok(PlacedOrder {
            exchange_order_id: receipt.order_id,
            immediate_fill: receipt.immediate_fill,
            price,
        })
    }

    async fn limit_sell(
        &self,
        user_id: &str,
        pair: &str,
        price: f64,
        base_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.creds(user_id).await?;
        let receipt = self
            .client
            .place_limit_sell(&creds, pair, price, base_amount)
            .await?;
        Ok(PlacedOrder {
            exchange_order_id: receipt.order_id,
            immediate_fill: receipt.immediate_fill,
            price,
        })
    }

    async fn market_sell(
        &self,
        user_id: &str,
        pair: &str,
        base_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.creds(user_id).await?;
        let receipt = self.client.place_market_sell(&creds, pair, base_amount).await?;
        Ok(PlacedOrder {
            exchange_order_id: receipt.order_id,
            immediate_fill: receipt.immediate_fill,
            price: 0.0,
        })
    }

    async fn market_buy(
        &self,
        user_id: &str,
        pair: &str,
        quote_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        let creds = self.creds(user_id).await?;
        let receipt = self.client.place_market_buy(&creds, pair, quote_amount).await?;
        Ok(PlacedOrder {
            exchange_order_id: receipt.order_id,
            immediate_fill: receipt.immediate_fill,
            price: 0.0,
        })
    }

    async fn cancel(
        &self,
        user_id: &str,
        pair: &str,
        exchange_order_id: &str,
        side: Side,
    ) -> EngineResult<()> {
        let creds = self.creds(user_id).await?;
        self.client
            .cancel_order(&creds, pair, exchange_order_id, side)
            .await
    }

    fn is_paper(&self) -> bool {
        false
    }
}

// =============================================================================
// Paper executor
// =============================================================================

/// Synthetic execution: order ids are generated locally and fills arrive
/// after a fixed delay. Cancelling before the delay elapses suppresses the
/// fill.
pub struct PaperExecutor {
    market: Arc<MarketDataEngine>,
    fill_delay: std::time::Duration,
    pending: Arc<Mutex<HashMap<String, CancellationToken>>>,
    cancel: CancellationToken,
}

impl PaperExecutor {
    pub fn new(
        market: Arc<MarketDataEngine>,
        fill_delay_secs: u64,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            market,
            fill_delay: std::time::Duration::from_secs(fill_delay_secs),
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        })
    }

    fn synthetic_id() -> String {
        format!("paper-{}", Uuid::new_v4())
    }

    fn place(&self, pair: &str, price: f64) -> PlacedOrder {
        let mark = if price > 0.0 {
            price
        } else {
            self.market.price_of(pair).unwrap_or(0.0)
        };
        let placed = PlacedOrder {
            exchange_order_id: Self::synthetic_id(),
            immediate_fill: 0.0,
            price: mark,
        };
        debug!(pair, order_id = %placed.exchange_order_id, price = mark, "paper order placed");
        placed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    async fn limit_buy(
        &self,
        _user_id: &str,
        pair: &str,
        price: f64,
        _quote_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        Ok(self.place(pair, price))
    }

    async fn limit_sell(
        &self,
        _user_id: &str,
        pair: &str,
        price: f64,
        _base_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        Ok(self.place(pair, price))
    }

    async fn market_sell(
        &self,
        _user_id: &str,
        pair: &str,
        _base_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        Ok(self.place(pair, 0.0))
    }

    async fn market_buy(
        &self,
        _user_id: &str,
        pair: &str,
        _quote_amount: f64,
    ) -> EngineResult<PlacedOrder> {
        Ok(self.place(pair, 0.0))
    }

    async fn cancel(
        &self,
        _user_id: &str,
        _pair: &str,
        exchange_order_id: &str,
        _side: Side,
    ) -> EngineResult<()> {
        match self.pending.lock().remove(exchange_order_id) {
            Some(token) => {
                token.cancel();
                debug!(exchange_order_id, "paper order cancelled before fill");
                Ok(())
            }
            None => Err(EngineError::OrderNotFound),
        }
    }

    fn is_paper(&self) -> bool {
        true
    }
}

impl OrderTracker for PaperExecutor {
    /// Schedule the simulated fill. The full amount fills at the order's
    /// price after the configured delay.
    fn register(&self, order: Order, sink: Arc<dyn FillSink>) {
        if !order.paper {
            warn!(order_id = %order.id, "live order registered with paper executor — ignored");
            return;
        }

        let token = self.cancel.child_token();
        let ex_id = order.exchange_order_id.clone();
        self.pending.lock().insert(ex_id.clone(), token.clone());

        let delay = self.fill_delay;
        let pending = self.pending.clone();
        let fill_price = order.price;
        let fill_amount = order.amount;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(exchange_order_id = %ex_id, "paper fill suppressed");
                }
                _ = tokio::time::sleep(delay) => {
                    pending.lock().remove(&ex_id);
                    info!(
                        exchange_order_id = %ex_id,
                        fill_amount,
                        fill_price,
                        "paper fill"
                    );
                    sink.on_fill(
                        order,
                        FillOutcome::Filled {
                            filled: fill_amount,
                            price: fill_price,
                        },
                    )
                    .await;
                }
            }
        });
    }

    fn deregister(&self, exchange_order_id: &str) {
        if let Some(token) = self.pending.lock().remove(exchange_order_id) {
            token.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
