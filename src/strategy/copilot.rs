// =============================================================================
// Copilot — one-shot assisted trade: buy -> auto-sell -> stop-loss
// =============================================================================
//
// Lifecycle:
//   pending   buy submitted
//   filled    buy complete, auto-sell resting, stop-loss armed
//   completed sell complete
//   cancelled manual cancel before the buy filled
//   stopped   stop-loss fired (sell cancelled, market sell placed)
//   error     credential failure mid-flight
//
// The service is the FillSink for every order it creates; `parent_id` on the
// order record routes each fill back to its trade.
// =============================================================================

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::client::Credentials;
use crate::exchange::types::normalize_pair;
use crate::exchange::IndodaxClient;
use crate::market::pairs::{align_price, floor_amount, is_price_aligned, validate_order};
use crate::market::{MarketDataEngine, PairRegistry};
use crate::orders::{FillOutcome, FillSink, Order};
use crate::store::{self, KvStore};
use crate::strategy::executor::{OrderTracker, TradeExecutor};
use crate::strategy::stoploss::{StopLossMonitor, StopTrigger, StopWatch};
use crate::types::{ParentType, Side, TradeStatus};
use crate::vault::CredentialVault;

/// Channel for trade lifecycle pushes.
pub const TRADE_UPDATE_CHANNEL: &str = "trade.update";

/// Smallest accepted order volume.
const MIN_VOLUME_IDR: f64 = 10_000.0;

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub pair: String,
    pub status: TradeStatus,
    pub paper: bool,

    pub buying_price: f64,
    pub volume_idr: f64,
    /// Base amount implied by volume/price, floored to volume precision.
    pub amount: f64,
    pub target_profit_percent: f64,
    pub stop_loss_percent: f64,

    #[serde(default)]
    pub buy_exchange_order_id: String,
    #[serde(default)]
    pub buy_filled_amount: f64,

    #[serde(default)]
    pub sell_price: f64,
    #[serde(default)]
    pub sell_exchange_order_id: String,
    #[serde(default)]
    pub sell_filled_amount: f64,
    #[serde(default)]
    pub avg_sell_price: f64,

    #[serde(default)]
    pub profit_idr: f64,
    #[serde(default)]
    pub profit_percent: f64,
    #[serde(default)]
    pub stop_loss_triggered: bool,
    #[serde(default)]
    pub error_message: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}

impl Trade {
    fn key(id: &str) -> String {
        format!("trade:{id}")
    }

    fn user_index(user_id: &str) -> String {
        format!("user_trades:{user_id}")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TradeStatus::Completed | TradeStatus::Cancelled | TradeStatus::Stopped | TradeStatus::Error
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopilotRequest {
    pub pair: String,
    pub buying_price: f64,
    pub volume_idr: f64,
    pub target_profit_percent: f64,
    pub stop_loss_percent: f64,
    #[serde(default)]
    pub paper: bool,
}

// =============================================================================
// Service
// =============================================================================

pub struct CopilotService {
    me: Weak<CopilotService>,
    store: Arc<dyn KvStore>,
    market: Arc<MarketDataEngine>,
    registry: Arc<PairRegistry>,
    client: Arc<IndodaxClient>,
    vault: Arc<CredentialVault>,
    live_exec: Arc<dyn TradeExecutor>,
    live_tracker: Arc<dyn OrderTracker>,
    paper_exec: Arc<dyn TradeExecutor>,
    paper_tracker: Arc<dyn OrderTracker>,
    stoploss: Arc<StopLossMonitor>,
}

impl CopilotService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        market: Arc<MarketDataEngine>,
        registry: Arc<PairRegistry>,
        client: Arc<IndodaxClient>,
        vault: Arc<CredentialVault>,
        live_exec: Arc<dyn TradeExecutor>,
        live_tracker: Arc<dyn OrderTracker>,
        paper_exec: Arc<dyn TradeExecutor>,
        paper_tracker: Arc<dyn OrderTracker>,
        stoploss: Arc<StopLossMonitor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            market,
            registry,
            client,
            vault,
            live_exec,
            live_tracker,
            paper_exec,
            paper_tracker,
            stoploss,
        })
    }

    /// The service's own Arc, used to register itself as the FillSink for
    /// orders it creates.
    fn sink(&self) -> Arc<dyn FillSink> {
        self.me.upgrade().expect("copilot service alive") as Arc<dyn FillSink>
    }

    fn executor(&self, paper: bool) -> &Arc<dyn TradeExecutor> {
        if paper {
            &self.paper_exec
        } else {
            &self.live_exec
        }
    }

    fn tracker(&self, paper: bool) -> &Arc<dyn OrderTracker> {
        if paper {
            &self.paper_tracker
        } else {
            &self.live_tracker
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    pub async fn submit(&self, user_id: &str, req: CopilotRequest) -> EngineResult<Trade> {
        let pair = normalize_pair(&req.pair);
        let info = self.registry.require(&pair)?;

        // ── Validation ──────────────────────────────────────────────
        if req.volume_idr < MIN_VOLUME_IDR {
            return Err(EngineError::Validation(format!(
                "volume must be at least {MIN_VOLUME_IDR} IDR"
            )));
        }
        if req.buying_price <= 0.0 {
            return Err(EngineError::Validation("buying price must be positive".into()));
        }
        if !is_price_aligned(&info, req.buying_price) {
            return Err(EngineError::Validation(format!(
                "buying price is not aligned to the {} increment",
                crate::market::pairs::tick_size(&info)
            )));
        }
        if req.stop_loss_percent <= 0.0 || req.stop_loss_percent >= req.target_profit_percent {
            return Err(EngineError::Validation(
                "stop-loss must be positive and below target profit".into(),
            ));
        }

        let amount = floor_amount(&info, req.volume_idr / req.buying_price);
        validate_order(&info, amount, req.buying_price)?;

        // ── Balance check (live only; paper draws virtual funds) ────
        if !req.paper {
            let (key, secret) = self.vault.decrypt(user_id).await?;
            let balances = self.client.get_info(&Credentials { key, secret }).await?;
            let free_idr = balances.free_of(&info.quote_currency);
            if free_idr < req.volume_idr {
                return Err(EngineError::Invariant(format!(
                    "insufficient balance: {free_idr:.0} {} available",
                    info.quote_currency
                )));
            }
        }

        // ── Place the buy ───────────────────────────────────────────
        let placed = self
            .executor(req.paper)
            .limit_buy(user_id, &pair, req.buying_price, req.volume_idr)
            .await?;

        let now = Utc::now();
        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            pair: pair.clone(),
            status: TradeStatus::Pending,
            paper: req.paper,
            buying_price: req.buying_price,
            volume_idr: req.volume_idr,
            amount,
            target_profit_percent: req.target_profit_percent,
            stop_loss_percent: req.stop_loss_percent,
            buy_exchange_order_id: placed.exchange_order_id.clone(),
            buy_filled_amount: 0.0,
            sell_price: 0.0,
            sell_exchange_order_id: String::new(),
            sell_filled_amount: 0.0,
            avg_sell_price: 0.0,
            profit_idr: 0.0,
            profit_percent: 0.0,
            stop_loss_triggered: false,
            error_message: None,
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
        };

        let order = Order::new(
            user_id,
            &trade.id,
            ParentType::Trade,
            &placed.exchange_order_id,
            &pair,
            Side::Buy,
            req.buying_price,
            amount,
            req.paper,
        );
        order.save(self.store.as_ref()).await?;

        self.save(&trade).await?;
        self.store
            .zset_add(
                &Trade::user_index(user_id),
                &trade.id,
                now.timestamp() as f64,
            )
            .await?;

        self.tracker(req.paper).register(order, self.sink());

        info!(
            trade_id = %trade.id,
            user_id,
            %pair,
            price = req.buying_price,
            amount,
            paper = req.paper,
            "copilot buy submitted"
        );
        self.publish(&trade).await;
        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // Fill transitions
    // -------------------------------------------------------------------------

    async fn handle_buy_filled(&self, order: &Order, filled: f64) {
        let Ok(Some(mut trade)) = self.load(&order.parent_id).await else {
            warn!(trade_id = %order.parent_id, "buy fill for unknown trade");
            return;
        };
        if trade.status != TradeStatus::Pending {
            return;
        }
        let Ok(info) = self.registry.require(&trade.pair) else {
            return;
        };

        trade.buy_filled_amount = filled;

        // Auto-sell at the target, for exactly what the buy delivered.
        let sell_price = align_price(
            &info,
            trade.buying_price * (1.0 + trade.target_profit_percent / 100.0),
        );
        let sell_amount = floor_amount(&info, filled);

        let placed = match self
            .executor(trade.paper)
            .limit_sell(&trade.user_id, &trade.pair, sell_price, sell_amount)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                error!(trade_id = %trade.id, error = %e, "auto-sell placement failed");
                trade.status = TradeStatus::Error;
                trade.error_message = Some(format!("auto-sell failed: {e}"));
                trade.updated_at = Utc::now().to_rfc3339();
                let _ = self.save(&trade).await;
                self.publish(&trade).await;
                return;
            }
        };

        let sell_order = Order::new(
            &trade.user_id,
            &trade.id,
            ParentType::Trade,
            &placed.exchange_order_id,
            &trade.pair,
            Side::Sell,
            sell_price,
            sell_amount,
            trade.paper,
        );
        let _ = sell_order.save(self.store.as_ref()).await;

        trade.sell_price = sell_price;
        trade.sell_exchange_order_id = placed.exchange_order_id.clone();
        trade.status = TradeStatus::Filled;
        trade.updated_at = Utc::now().to_rfc3339();

        self.tracker(trade.paper).register(sell_order, self.sink());
        self.stoploss.add(StopWatch {
            trade_id: trade.id.clone(),
            user_id: trade.user_id.clone(),
            pair: trade.pair.clone(),
            buy_price: trade.buying_price,
            stop_loss_percent: trade.stop_loss_percent,
        });

        info!(
            trade_id = %trade.id,
            filled,
            sell_price,
            "buy filled — auto-sell placed"
        );
        let _ = self.save(&trade).await;
        self.publish(&trade).await;
    }

    async fn handle_sell_filled(&self, order: &Order, filled: f64, avg_price: f64) {
        let Ok(Some(mut trade)) = self.load(&order.parent_id).await else {
            warn!(trade_id = %order.parent_id, "sell fill for unknown trade");
            return;
        };
        if trade.is_terminal() && trade.status != TradeStatus::Stopped {
            return;
        }

        let avg = if avg_price > 0.0 {
            avg_price
        } else if order.price > 0.0 {
            order.price
        } else {
            self.market.price_of(&trade.pair).unwrap_or(trade.sell_price)
        };

        trade.sell_filled_amount = filled;
        trade.avg_sell_price = avg;
        trade.profit_idr = filled * avg - trade.buy_filled_amount * trade.buying_price;
        let cost = trade.buy_filled_amount * trade.buying_price;
        trade.profit_percent = if cost > 0.0 {
            trade.profit_idr / cost * 100.0
        } else {
            0.0
        };
        if trade.status != TradeStatus::Stopped {
            trade.status = TradeStatus::Completed;
        }
        trade.updated_at = Utc::now().to_rfc3339();

        self.stoploss.remove(&trade.id);

        info!(
            trade_id = %trade.id,
            filled,
            avg_price = avg,
            profit_idr = trade.profit_idr,
            profit_percent = trade.profit_percent,
            status = %trade.status,
            "sell filled"
        );
        let _ = self.save(&trade).await;
        self.publish(&trade).await;
    }

    // -------------------------------------------------------------------------
    // Manual operations
    // -------------------------------------------------------------------------

    /// Cancel a pending trade (the buy has not filled).
    pub async fn cancel(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        let mut trade = self.owned(user_id, trade_id).await?;
        if trade.status != TradeStatus::Pending {
            return Err(EngineError::Validation(
                "only pending trades can be cancelled".into(),
            ));
        }

        self.tracker(trade.paper)
            .deregister(&trade.buy_exchange_order_id);
        self.executor(trade.paper)
            .cancel(
                user_id,
                &trade.pair,
                &trade.buy_exchange_order_id,
                Side::Buy,
            )
            .await
            .or_else(|e| match e {
                // Paper cancel after deregister, or the exchange pruned it.
                EngineError::OrderNotFound => Ok(()),
                other => Err(other),
            })?;

        trade.status = TradeStatus::Cancelled;
        trade.updated_at = Utc::now().to_rfc3339();
        self.save(&trade).await?;
        self.publish(&trade).await;
        info!(trade_id, user_id, "copilot trade cancelled");
        Ok(trade)
    }

    /// Sell a filled trade immediately at market, abandoning the target.
    pub async fn sell_now(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        let mut trade = self.owned(user_id, trade_id).await?;
        if trade.status != TradeStatus::Filled {
            return Err(EngineError::Validation(
                "only filled trades can be sold immediately".into(),
            ));
        }

        self.abandon_resting_sell(&trade).await;
        self.stoploss.remove(&trade.id);

        let placed = self
            .executor(trade.paper)
            .market_sell(user_id, &trade.pair, trade.buy_filled_amount)
            .await?;

        let sell_order = Order::new(
            user_id,
            &trade.id,
            ParentType::Trade,
            &placed.exchange_order_id,
            &trade.pair,
            Side::Sell,
            placed.price,
            trade.buy_filled_amount,
            trade.paper,
        );
        let _ = sell_order.save(self.store.as_ref()).await;
        self.tracker(trade.paper).register(sell_order, self.sink());

        trade.sell_exchange_order_id = placed.exchange_order_id;
        trade.updated_at = Utc::now().to_rfc3339();
        self.save(&trade).await?;
        self.publish(&trade).await;
        info!(trade_id, user_id, "manual market sell placed");
        Ok(trade)
    }

    /// Cancel the resting limit sell, tolerating every failure: the sell may
    /// already be filling, which the fill path will sort out.
    async fn abandon_resting_sell(&self, trade: &Trade) {
        if trade.sell_exchange_order_id.is_empty() {
            return;
        }
        self.tracker(trade.paper)
            .deregister(&trade.sell_exchange_order_id);
        if let Err(e) = self
            .executor(trade.paper)
            .cancel(
                &trade.user_id,
                &trade.pair,
                &trade.sell_exchange_order_id,
                Side::Sell,
            )
            .await
        {
            warn!(trade_id = %trade.id, error = %e, "resting sell cancel failed");
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn list(&self, user_id: &str) -> EngineResult<Vec<Trade>> {
        let ids = self
            .store
            .zset_range_desc(&Trade::user_index(user_id), 200)
            .await?;
        let mut trades = Vec::with_capacity(ids.len());
        for (id, _) in ids {
            if let Some(trade) = self.load(&id).await? {
                trades.push(trade);
            }
        }
        Ok(trades)
    }

    pub async fn get(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        self.owned(user_id, trade_id).await
    }

    pub async fn delete(&self, user_id: &str, trade_id: &str) -> EngineResult<()> {
        let trade = self.owned(user_id, trade_id).await?;
        if !trade.is_terminal() {
            return Err(EngineError::Validation(
                "only finished trades can be deleted".into(),
            ));
        }
        self.store.delete(&Trade::key(trade_id)).await?;
        self.store
            .zset_remove(&Trade::user_index(user_id), trade_id)
            .await?;
        Ok(())
    }

    async fn owned(&self, user_id: &str, trade_id: &str) -> EngineResult<Trade> {
        match self.load(trade_id).await? {
            Some(trade) if trade.user_id == user_id => Ok(trade),
            _ => Err(EngineError::NotFound(format!("trade {trade_id}"))),
        }
    }

    // -------------------------------------------------------------------------
    // Persistence / events
    // -------------------------------------------------------------------------

    async fn load(&self, trade_id: &str) -> EngineResult<Option<Trade>> {
        store::get_json(self.store.as_ref(), &Trade::key(trade_id)).await
    }

    async fn save(&self, trade: &Trade) -> EngineResult<()> {
        store::put_json(self.store.as_ref(), &Trade::key(&trade.id), trade).await
    }

    async fn publish(&self, trade: &Trade) {
        let payload = serde_json::json!({
            "user_id": trade.user_id,
            "trade": trade,
        });
        if let Err(e) = self
            .store
            .publish(TRADE_UPDATE_CHANNEL, &payload.to_string())
            .await
        {
            warn!(trade_id = %trade.id, error = %e, "trade update publish failed");
        }
    }
}

// =============================================================================
// Fill routing
// =============================================================================

#[async_trait]
impl FillSink for CopilotService {
    async fn on_fill(&self, order: Order, outcome: FillOutcome) {
        // Keep the stored order record in sync with its terminal state.
        {
            let mut record = order.clone();
            record.apply_outcome(&outcome);
            let _ = record.save(self.store.as_ref()).await;
        }

        match (order.side, outcome) {
            (Side::Buy, FillOutcome::Filled { filled, .. })
            | (Side::Buy, FillOutcome::PartialCancelled { filled, .. }) => {
                self.handle_buy_filled(&order, filled).await;
            }
            (Side::Buy, FillOutcome::Cancelled) => {
                if let Ok(Some(mut trade)) = self.load(&order.parent_id).await {
                    if trade.status == TradeStatus::Pending {
                        trade.status = TradeStatus::Cancelled;
                        trade.updated_at = Utc::now().to_rfc3339();
                        let _ = self.save(&trade).await;
                        self.publish(&trade).await;
                    }
                }
            }
            (Side::Sell, FillOutcome::Filled { filled, price })
            | (Side::Sell, FillOutcome::PartialCancelled { filled, price }) => {
                self.handle_sell_filled(&order, filled, price).await;
            }
            (Side::Sell, FillOutcome::Cancelled) => {
                // Cancels of resting sells are initiated by this service.
            }
        }
    }

    async fn on_credential_error(&self, order: Order, message: String) {
        if let Ok(Some(mut trade)) = self.load(&order.parent_id).await {
            trade.status = TradeStatus::Error;
            trade.error_message = Some(message);
            trade.updated_at = Utc::now().to_rfc3339();
            let _ = self.save(&trade).await;
            self.publish(&trade).await;
        }
    }
}

#[async_trait]
impl StopTrigger for CopilotService {
    /// Cancel the resting sell (best effort) and dump the position at
    /// market.
    async fn trigger_stop_loss(&self, trade_id: &str) {
        let Ok(Some(mut trade)) = self.load(trade_id).await else {
            return;
        };
        if trade.status != TradeStatus::Filled {
            return;
        }

        self.abandon_resting_sell(&trade).await;

        let placed = match self
            .executor(trade.paper)
            .market_sell(&trade.user_id, &trade.pair, trade.buy_filled_amount)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                error!(trade_id, error = %e, "stop-loss market sell failed");
                trade.status = TradeStatus::Error;
                trade.error_message = Some(format!("stop-loss sell failed: {e}"));
                trade.updated_at = Utc::now().to_rfc3339();
                let _ = self.save(&trade).await;
                self.publish(&trade).await;
                return;
            }
        };

        let sell_order = Order::new(
            &trade.user_id,
            &trade.id,
            ParentType::Trade,
            &placed.exchange_order_id,
            &trade.pair,
            Side::Sell,
            placed.price,
            trade.buy_filled_amount,
            trade.paper,
        );
        let _ = sell_order.save(self.store.as_ref()).await;
        self.tracker(trade.paper).register(sell_order, self.sink());

        trade.sell_exchange_order_id = placed.exchange_order_id;
        trade.status = TradeStatus::Stopped;
        trade.stop_loss_triggered = true;
        trade.updated_at = Utc::now().to_rfc3339();
        // The sweep already dropped the watch; manual invocations have not.
        self.stoploss.remove(trade_id);
        let _ = self.save(&trade).await;
        self.publish(&trade).await;
        warn!(trade_id, pair = %trade.pair, "stop-loss executed");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::PairInfo;
    use crate::store::MemoryKv;
    use crate::strategy::executor::PaperExecutor;
    use crate::strategy::LiveExecutor;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        service: Arc<CopilotService>,
        paper: Arc<PaperExecutor>,
        stoploss: Arc<StopLossMonitor>,
        market: Arc<MarketDataEngine>,
    }

    fn harness(fill_delay_secs: u64) -> Harness {
        let cancel = CancellationToken::new();
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let market = MarketDataEngine::new(store.clone());
        let registry = Arc::new(PairRegistry::new(store.clone()));
        registry.insert_for_tests(PairInfo {
            id: "btcidr".into(),
            base_currency: "btc".into(),
            quote_currency: "idr".into(),
            volume_precision: 8,
            price_precision: 0,
            trade_min_traded_currency: 1e-6,
            trade_min_base_currency: 10_000.0,
            price_increment: 1.0,
        });
        registry.insert_for_tests(PairInfo {
            id: "ethidr".into(),
            base_currency: "eth".into(),
            quote_currency: "idr".into(),
            volume_precision: 8,
            price_precision: 0,
            trade_min_traded_currency: 1e-4,
            trade_min_base_currency: 10_000.0,
            price_increment: 1_000.0,
        });

        let client = Arc::new(IndodaxClient::new("https://example.test", cancel.clone()));
        let vault = Arc::new(CredentialVault::new([0u8; 32], store.clone()));
        let live = LiveExecutor::new(client.clone(), vault.clone());
        let monitor = crate::orders::OrderMonitor::new(client.clone(), vault.clone());
        let paper = PaperExecutor::new(market.clone(), fill_delay_secs, cancel);
        let stoploss = StopLossMonitor::new(market.clone());

        let service = CopilotService::new(
            store,
            market.clone(),
            registry,
            client,
            vault,
            live,
            monitor,
            paper.clone(),
            paper.clone(),
            stoploss.clone(),
        );

        Harness {
            service,
            paper,
            stoploss,
            market,
        }
    }

    fn set_price(market: &MarketDataEngine, pair_wire: &str, price: &str) {
        let rows = serde_json::json!([[pair_wire, 0, price, price, price, price, "1", "1"]]);
        market.ingest_summary_rows(&rows, 1_000);
    }

    fn btc_request(paper: bool) -> CopilotRequest {
        CopilotRequest {
            pair: "btcidr".into(),
            buying_price: 650_000_000.0,
            volume_idr: 1_000_000.0,
            target_profit_percent: 5.0,
            stop_loss_percent: 3.0,
            paper,
        }
    }

    fn buy_order_for(trade: &Trade) -> Order {
        Order::new(
            &trade.user_id,
            &trade.id,
            ParentType::Trade,
            &trade.buy_exchange_order_id,
            &trade.pair,
            Side::Buy,
            trade.buying_price,
            trade.amount,
            trade.paper,
        )
    }

    #[tokio::test]
    async fn paper_happy_path_completes_with_target_profit() {
        let h = harness(0);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert!((trade.amount - 0.00153846).abs() < 1e-12);
        assert!(trade.buy_exchange_order_id.starts_with("paper-"));

        // Zero-delay paper fills drive buy -> auto-sell -> completion.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let done = h.service.get("u1", &trade.id).await.unwrap();
        assert_eq!(done.status, TradeStatus::Completed);
        assert_eq!(done.sell_price, 682_500_000.0);
        assert!((done.buy_filled_amount - 0.00153846).abs() < 1e-12);
        assert!((done.profit_idr - 50_000.0).abs() < 1.0);
        assert!((done.profit_percent - 5.0).abs() < 0.01);
        assert!(!h.stoploss.contains(&done.id));
    }

    #[tokio::test]
    async fn buy_fill_places_aligned_auto_sell_and_arms_stop() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        let sink: Arc<dyn FillSink> = h.service.clone();
        sink.on_fill(
            buy_order_for(&trade),
            FillOutcome::Filled {
                filled: trade.amount,
                price: trade.buying_price,
            },
        )
        .await;

        let filled = h.service.get("u1", &trade.id).await.unwrap();
        assert_eq!(filled.status, TradeStatus::Filled);
        assert_eq!(filled.sell_price, 682_500_000.0);
        assert!(!filled.sell_exchange_order_id.is_empty());
        assert!(h.stoploss.contains(&trade.id));
    }

    #[tokio::test]
    async fn stop_loss_cancels_sell_and_dumps_at_market() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        let sink: Arc<dyn FillSink> = h.service.clone();
        sink.on_fill(
            buy_order_for(&trade),
            FillOutcome::Filled {
                filled: trade.amount,
                price: trade.buying_price,
            },
        )
        .await;

        // Price drops to exactly buy * 0.97.
        set_price(&h.market, "btc_idr", "630500000");
        assert!(crate::strategy::stoploss::should_trigger(
            630_500_000.0,
            650_000_000.0,
            3.0
        ));

        let trigger: Arc<dyn StopTrigger> = h.service.clone();
        trigger.trigger_stop_loss(&trade.id).await;

        let stopped = h.service.get("u1", &trade.id).await.unwrap();
        assert_eq!(stopped.status, TradeStatus::Stopped);
        assert!(stopped.stop_loss_triggered);
        assert!(!h.stoploss.contains(&trade.id));

        // The eventual market-sell fill records the realized loss but keeps
        // the stopped status.
        let mut sell_order = buy_order_for(&stopped);
        sell_order.side = Side::Sell;
        sell_order.exchange_order_id = stopped.sell_exchange_order_id.clone();
        sink.on_fill(
            sell_order,
            FillOutcome::Filled {
                filled: stopped.buy_filled_amount,
                price: 630_500_000.0,
            },
        )
        .await;

        let final_state = h.service.get("u1", &trade.id).await.unwrap();
        assert_eq!(final_state.status, TradeStatus::Stopped);
        assert!(final_state.profit_idr < 0.0);
        assert!((final_state.profit_idr - (-30_000.0)).abs() < 10.0);
    }

    #[tokio::test]
    async fn partial_buy_then_cancel_sells_the_partial() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        let partial = trade.amount * 0.3;
        let sink: Arc<dyn FillSink> = h.service.clone();
        sink.on_fill(
            buy_order_for(&trade),
            FillOutcome::PartialCancelled {
                filled: partial,
                price: trade.buying_price,
            },
        )
        .await;

        let filled = h.service.get("u1", &trade.id).await.unwrap();
        assert_eq!(filled.status, TradeStatus::Filled);
        assert!((filled.buy_filled_amount - partial).abs() < 1e-12);
        assert!(!filled.sell_exchange_order_id.is_empty());
    }

    #[tokio::test]
    async fn manual_cancel_of_pending_trade() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        assert_eq!(h.paper.pending_count(), 1);

        let cancelled = h.service.cancel("u1", &trade.id).await.unwrap();
        assert_eq!(cancelled.status, TradeStatus::Cancelled);
        assert_eq!(h.paper.pending_count(), 0);

        // Cancelling again is a validation error.
        assert!(matches!(
            h.service.cancel("u1", &trade.id).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn validation_rejections() {
        let h = harness(600);

        let mut req = btc_request(true);
        req.volume_idr = 5_000.0;
        assert!(matches!(
            h.service.submit("u1", req).await,
            Err(EngineError::Validation(_))
        ));

        let mut req = btc_request(true);
        req.stop_loss_percent = 6.0;
        assert!(matches!(
            h.service.submit("u1", req).await,
            Err(EngineError::Validation(_))
        ));

        // Price off the 1000-IDR increment grid.
        let req = CopilotRequest {
            pair: "ethidr".into(),
            buying_price: 650_000_500.0,
            volume_idr: 1_000_000.0,
            target_profit_percent: 5.0,
            stop_loss_percent: 3.0,
            paper: true,
        };
        assert!(matches!(
            h.service.submit("u1", req).await,
            Err(EngineError::Validation(_))
        ));

        let req = CopilotRequest {
            pair: "nopair".into(),
            ..btc_request(true)
        };
        assert!(matches!(
            h.service.submit("u1", req).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_per_user_newest_first() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let first = h.service.submit("u1", btc_request(true)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        let second = h.service.submit("u1", btc_request(true)).await.unwrap();
        h.service.submit("u2", btc_request(true)).await.unwrap();

        let trades = h.service.list("u1").await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].id, second.id);
        assert_eq!(trades[1].id, first.id);

        // Other users cannot see or touch the trade.
        assert!(matches!(
            h.service.get("u2", &first.id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_requires_terminal_status() {
        let h = harness(600);
        set_price(&h.market, "btc_idr", "650000000");

        let trade = h.service.submit("u1", btc_request(true)).await.unwrap();
        assert!(matches!(
            h.service.delete("u1", &trade.id).await,
            Err(EngineError::Validation(_))
        ));

        h.service.cancel("u1", &trade.id).await.unwrap();
        h.service.delete("u1", &trade.id).await.unwrap();
        assert!(h.service.list("u1").await.unwrap().is_empty());
    }
}
