// =============================================================================
// Market Maker — inventory-aware single-pair quoting bot
// =============================================================================
//
// One instance per running bot. The event loop multiplexes three sources:
// best-price ticks from the subscription manager, fill events from the
// order monitor (or paper scheduler), and the stop signal. At most one
// order is open at a time; side selection is inventory-driven (sell the
// coins if we hold any, otherwise deploy IDR).
//
// Ticker events may be dropped under pressure (the next tick is a second
// away); fill events are always delivered.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::types::{BestPrices, PairInfo};
use crate::market::pairs::{floor_amount, tick_size, validate_order};
use crate::market::SubscriptionManager;
use crate::orders::{FillOutcome, FillSink, Order};
use crate::store::{self, KvStore};
use crate::strategy::bots::{publish_bot_update, save_bot, BotConfig, BotExit};
use crate::strategy::executor::{OrderTracker, TradeExecutor};
use crate::types::{sanitize_coin_balance, sanitize_idr_balance, ParentType, Side};

/// Minimum time between two order actions.
const DEBOUNCE_MS: u128 = 500;
/// Event channel depth; tickers beyond this are dropped.
const EVENT_BUFFER: usize = 64;

// =============================================================================
// Params
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMakerParams {
    /// Capital allocated to this bot. Live IDR is capped here so the bot
    /// never deploys funds that belong to other bots of the same user.
    pub initial_balance_idr: f64,
    /// IDR spent per buy order.
    pub order_size_idr: f64,
    /// Minimum bid/ask gap worth quoting into.
    pub min_gap_percent: f64,
    /// Price deviation (strictly) beyond which the resting order is pulled.
    pub reposition_threshold_percent: f64,
    /// Circuit breaker: accumulated loss at which the bot stops itself.
    pub max_loss_idr: f64,
}

impl MarketMakerParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.initial_balance_idr <= 0.0
            || self.order_size_idr <= 0.0
            || self.min_gap_percent <= 0.0
            || self.reposition_threshold_percent <= 0.0
            || self.max_loss_idr <= 0.0
        {
            return Err(EngineError::Validation(
                "all market maker parameters must be positive".into(),
            ));
        }
        if self.order_size_idr > self.initial_balance_idr {
            return Err(EngineError::Validation(
                "order size cannot exceed the initial balance".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug)]
pub enum BotEvent {
    Ticker(BestPrices),
    Fill { order: Order, outcome: FillOutcome },
    CredentialError(String),
}

/// Forwards fills into the bot's event loop. Fill events must never be
/// dropped, so this awaits channel capacity.
struct EventSink {
    tx: mpsc::Sender<BotEvent>,
}

#[async_trait]
impl FillSink for EventSink {
    async fn on_fill(&self, order: Order, outcome: FillOutcome) {
        let _ = self.tx.send(BotEvent::Fill { order, outcome }).await;
    }

    async fn on_credential_error(&self, _order: Order, message: String) {
        let _ = self.tx.send(BotEvent::CredentialError(message)).await;
    }
}

// =============================================================================
// Pure quoting logic
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Quote {
    /// Sell the whole coin inventory one tick inside the ask.
    Sell { price: f64, amount: f64 },
    /// Deploy one order-size of IDR one tick inside the bid.
    Buy {
        price: f64,
        amount: f64,
        spend_idr: f64,
    },
}

/// Choose the next quote from inventory, or `None` when balances cannot
/// support one (or the rounded order would violate exchange minimums).
pub(crate) fn decide_quote(
    info: &PairInfo,
    params: &MarketMakerParams,
    balances: &HashMap<String, f64>,
    best: &BestPrices,
) -> Option<Quote> {
    if best.bid <= 0.0 || best.ask <= 0.0 {
        return None;
    }
    let tick = tick_size(info);
    let coin = balances.get(&info.base_currency).copied().unwrap_or(0.0);
    let idr = balances.get(&info.quote_currency).copied().unwrap_or(0.0);

    if coin >= info.trade_min_traded_currency {
        let price = best.ask - tick;
        let amount = floor_amount(info, coin);
        if validate_order(info, amount, price).is_err() {
            return None;
        }
        return Some(Quote::Sell { price, amount });
    }

    if idr >= params.order_size_idr {
        let price = best.bid + tick;
        let amount = floor_amount(info, params.order_size_idr / price);
        if validate_order(info, amount, price).is_err() {
            return None;
        }
        return Some(Quote::Buy {
            price,
            amount,
            spend_idr: params.order_size_idr,
        });
    }

    None
}

/// Bid/ask gap in percent.
pub(crate) fn gap_percent(best: &BestPrices) -> f64 {
    if best.bid <= 0.0 {
        return 0.0;
    }
    (best.ask - best.bid) / best.bid * 100.0
}

/// Reposition when the order has drifted STRICTLY beyond the threshold from
/// its side of the book.
pub(crate) fn should_reposition(
    order_price: f64,
    side: Side,
    best: &BestPrices,
    threshold_percent: f64,
) -> bool {
    if order_price <= 0.0 {
        return false;
    }
    let side_price = match side {
        Side::Buy => best.bid,
        Side::Sell => best.ask,
    };
    if side_price <= 0.0 {
        return false;
    }
    let deviation = (order_price - side_price).abs() / order_price * 100.0;
    deviation > threshold_percent
}

/// Realize profit for a sell against the FIFO buy ledger. Inventory the
/// ledger cannot account for contributes zero.
pub(crate) fn fifo_profit(
    ledger: &mut VecDeque<(f64, f64)>,
    mut sell_amount: f64,
    sell_price: f64,
) -> f64 {
    let mut profit = 0.0;
    while sell_amount > 0.0 {
        let Some((lot_amount, lot_price)) = ledger.front_mut() else {
            break;
        };
        let used = sell_amount.min(*lot_amount);
        profit += (sell_price - *lot_price) * used;
        *lot_amount -= used;
        sell_amount -= used;
        if *lot_amount <= 1e-12 {
            ledger.pop_front();
        }
    }
    profit
}

// =============================================================================
// Instance
// =============================================================================

pub struct MarketMakerInstance {
    bot: BotConfig,
    params: MarketMakerParams,
    info: PairInfo,
    pair: String,

    store: Arc<dyn KvStore>,
    submgr: Arc<SubscriptionManager>,
    executor: Arc<dyn TradeExecutor>,
    tracker: Arc<dyn OrderTracker>,

    tx: mpsc::Sender<BotEvent>,
    rx: mpsc::Receiver<BotEvent>,

    balances: HashMap<String, f64>,
    ledger: VecDeque<(f64, f64)>,
    active: Option<Order>,
    last_action: Option<Instant>,
}

impl MarketMakerInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot: BotConfig,
        params: MarketMakerParams,
        info: PairInfo,
        balances: HashMap<String, f64>,
        store: Arc<dyn KvStore>,
        submgr: Arc<SubscriptionManager>,
        executor: Arc<dyn TradeExecutor>,
        tracker: Arc<dyn OrderTracker>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pair = info.id.clone();
        Self {
            bot,
            params,
            info,
            pair,
            store,
            submgr,
            executor,
            tracker,
            tx,
            rx,
            balances,
            ledger: VecDeque::new(),
            active: None,
            last_action: None,
        }
    }

    pub fn event_sender(&self) -> mpsc::Sender<BotEvent> {
        self.tx.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) -> BotExit {
        info!(
            bot_id = %self.bot.id,
            pair = %self.pair,
            paper = self.bot.paper,
            "market maker started"
        );

        let ticker_tx = self.tx.clone();
        let sub = self.submgr.subscribe(
            &self.pair,
            Arc::new(move |best: &BestPrices| {
                // Dropping a tick is fine; the next one is moments away.
                let _ = ticker_tx.try_send(BotEvent::Ticker(*best));
            }),
        );

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break BotExit::default(),
                event = self.rx.recv() => {
                    let Some(event) = event else { break BotExit::default() };
                    match event {
                        BotEvent::Ticker(best) => {
                            if let Some(exit) = self.on_ticker(best).await {
                                break exit;
                            }
                        }
                        BotEvent::Fill { order, outcome } => {
                            if let Some(exit) = self.on_fill(order, outcome).await {
                                break exit;
                            }
                        }
                        BotEvent::CredentialError(message) => {
                            break BotExit {
                                error: Some(format!("api key rejected: {message}")),
                            };
                        }
                    }
                }
            }
        };

        self.submgr.unsubscribe(&sub);
        self.withdraw_active_order().await;
        let _ = self.persist().await;
        info!(bot_id = %self.bot.id, "market maker stopped");
        exit
    }

    // -------------------------------------------------------------------------
    // Ticker handling
    // -------------------------------------------------------------------------

    async fn on_ticker(&mut self, best: BestPrices) -> Option<BotExit> {
        if let Some(last) = self.last_action {
            if last.elapsed().as_millis() < DEBOUNCE_MS {
                return None;
            }
        }

        if gap_percent(&best) < self.params.min_gap_percent {
            return None;
        }

        if self.active.is_none() {
            return self.place_quote(&best).await;
        }

        let needs_reposition = {
            let order = self.active.as_ref().expect("checked above");
            should_reposition(
                order.price,
                order.side,
                &best,
                self.params.reposition_threshold_percent,
            )
        };
        if needs_reposition {
            let order = self.active.take().expect("checked above");
            debug!(
                bot_id = %self.bot.id,
                order_price = order.price,
                bid = best.bid,
                ask = best.ask,
                "repositioning — cancelling resting order"
            );
            if let Err(e) = self
                .executor
                .cancel(
                    &self.bot.user_id,
                    &self.pair,
                    &order.exchange_order_id,
                    order.side,
                )
                .await
            {
                // A fill may have beaten the cancel; the fill event will
                // arrive and update balances.
                warn!(bot_id = %self.bot.id, error = %e, "reposition cancel failed");
            }
            self.last_action = Some(Instant::now());
        }
        None
    }

    async fn place_quote(&mut self, best: &BestPrices) -> Option<BotExit> {
        let quote = decide_quote(&self.info, &self.params, &self.balances, best)?;

        let placed = match &quote {
            Quote::Sell { price, amount } => {
                self.executor
                    .limit_sell(&self.bot.user_id, &self.pair, *price, *amount)
                    .await
            }
            Quote::Buy {
                price, spend_idr, ..
            } => {
                self.executor
                    .limit_buy(&self.bot.user_id, &self.pair, *price, *spend_idr)
                    .await
            }
        };

        let placed = match placed {
            Ok(placed) => placed,
            Err(EngineError::Credential(msg)) => {
                return Some(BotExit {
                    error: Some(format!("api key rejected: {msg}")),
                });
            }
            Err(e) => {
                warn!(bot_id = %self.bot.id, error = %e, "quote placement failed");
                return None;
            }
        };

        let (side, price, amount) = match quote {
            Quote::Sell { price, amount } => (Side::Sell, price, amount),
            Quote::Buy { price, amount, .. } => (Side::Buy, price, amount),
        };

        let order = Order::new(
            &self.bot.user_id,
            &self.bot.id,
            ParentType::Bot,
            &placed.exchange_order_id,
            &self.pair,
            side,
            price,
            amount,
            self.bot.paper,
        );
        let _ = order.save(self.store.as_ref()).await;
        self.tracker.register(
            order.clone(),
            Arc::new(EventSink {
                tx: self.tx.clone(),
            }),
        );

        info!(
            bot_id = %self.bot.id,
            side = %side,
            price,
            amount,
            "quote placed"
        );
        self.active = Some(order);
        self.last_action = Some(Instant::now());
        None
    }

    // -------------------------------------------------------------------------
    // Fill handling
    // -------------------------------------------------------------------------

    async fn on_fill(&mut self, order: Order, outcome: FillOutcome) -> Option<BotExit> {
        {
            let mut record = order.clone();
            record.apply_outcome(&outcome);
            let _ = record.save(self.store.as_ref()).await;
        }

        let (filled, price) = match outcome {
            FillOutcome::Filled { filled, price }
            | FillOutcome::PartialCancelled { filled, price } => {
                (filled, if price > 0.0 { price } else { order.price })
            }
            FillOutcome::Cancelled => {
                if self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.exchange_order_id == order.exchange_order_id)
                {
                    self.active = None;
                }
                return None;
            }
        };

        let base = self.info.base_currency.clone();
        let quote = self.info.quote_currency.clone();
        let mut exit = None;

        match order.side {
            Side::Buy => {
                let idr = self.balances.entry(quote.clone()).or_insert(0.0);
                *idr -= filled * price;
                let coin = self.balances.entry(base.clone()).or_insert(0.0);
                *coin += filled;
                self.ledger.push_back((filled, price));
                debug!(bot_id = %self.bot.id, filled, price, "buy filled");
            }
            Side::Sell => {
                let coin = self.balances.entry(base.clone()).or_insert(0.0);
                *coin -= filled;
                let idr = self.balances.entry(quote.clone()).or_insert(0.0);
                *idr += filled * price;

                let profit = fifo_profit(&mut self.ledger, filled, price);
                self.bot.stats.total_trades += 1;
                if profit > 0.0 {
                    self.bot.stats.winning_trades += 1;
                }
                self.bot.stats.total_profit_idr += profit;
                info!(
                    bot_id = %self.bot.id,
                    filled,
                    price,
                    profit,
                    total_profit = self.bot.stats.total_profit_idr,
                    "cycle completed"
                );

                if self.bot.stats.total_profit_idr < -self.params.max_loss_idr {
                    exit = Some(BotExit {
                        error: Some(format!(
                            "max loss reached: {:.0} IDR",
                            self.bot.stats.total_profit_idr
                        )),
                    });
                }
            }
        }

        let idr_value = self.balances.get(&quote).copied().unwrap_or(0.0);
        self.balances
            .insert(quote, sanitize_idr_balance(idr_value, "market maker"));
        let coin_value = self.balances.get(&base).copied().unwrap_or(0.0);
        self.balances
            .insert(base, sanitize_coin_balance(coin_value, "market maker"));

        if self
            .active
            .as_ref()
            .is_some_and(|a| a.exchange_order_id == order.exchange_order_id)
        {
            self.active = None;
        }

        if let Err(e) = self.persist().await {
            warn!(bot_id = %self.bot.id, error = %e, "state persist failed");
        }
        publish_bot_update(self.store.as_ref(), &self.bot).await;
        exit
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    async fn withdraw_active_order(&mut self) {
        if let Some(order) = self.active.take() {
            self.tracker.deregister(&order.exchange_order_id);
            if let Err(e) = self
                .executor
                .cancel(
                    &self.bot.user_id,
                    &self.pair,
                    &order.exchange_order_id,
                    order.side,
                )
                .await
            {
                warn!(bot_id = %self.bot.id, error = %e, "shutdown cancel failed");
            }
        }
    }

    async fn persist(&mut self) -> EngineResult<()> {
        self.bot.virtual_balances = self.balances.clone();
        self.bot.updated_at = Utc::now().to_rfc3339();
        store::put_json(
            self.store.as_ref(),
            &format!("bot_balance:{}", self.bot.id),
            &self.balances,
        )
        .await?;
        save_bot(self.store.as_ref(), &self.bot).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketDataEngine;
    use crate::store::MemoryKv;
    use crate::strategy::executor::PaperExecutor;
    use crate::types::{BotStatus, BotType};

    fn info() -> PairInfo {
        PairInfo {
            id: "btcidr".into(),
            base_currency: "btc".into(),
            quote_currency: "idr".into(),
            volume_precision: 8,
            price_precision: 0,
            trade_min_traded_currency: 1e-6,
            trade_min_base_currency: 10_000.0,
            price_increment: 1.0,
        }
    }

    fn params() -> MarketMakerParams {
        MarketMakerParams {
            initial_balance_idr: 10_000_000.0,
            order_size_idr: 100_000.0,
            min_gap_percent: 0.5,
            reposition_threshold_percent: 0.3,
            max_loss_idr: 500_000.0,
        }
    }

    fn best(bid: f64, ask: f64) -> BestPrices {
        BestPrices {
            bid,
            bid_volume: 1.0,
            ask,
            ask_volume: 1.0,
        }
    }

    #[test]
    fn params_validation() {
        assert!(params().validate().is_ok());
        let mut bad = params();
        bad.order_size_idr = 20_000_000.0;
        assert!(bad.validate().is_err());
        let mut bad = params();
        bad.min_gap_percent = 0.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn gap_calculation() {
        assert!((gap_percent(&best(650_000_000.0, 653_250_000.0)) - 0.5).abs() < 1e-9);
        assert!((gap_percent(&best(650_000_000.0, 650_100_000.0)) - 0.01538).abs() < 1e-3);
        assert_eq!(gap_percent(&best(0.0, 100.0)), 0.0);
    }

    #[test]
    fn quote_buys_when_only_idr_held() {
        let balances = HashMap::from([("idr".to_string(), 10_000_000.0)]);
        let quote = decide_quote(&info(), &params(), &balances, &best(650_000_000.0, 653_250_000.0))
            .expect("should quote");
        match quote {
            Quote::Buy {
                price,
                amount,
                spend_idr,
            } => {
                assert_eq!(price, 650_000_001.0);
                assert_eq!(spend_idr, 100_000.0);
                assert!((amount - 0.00015384).abs() < 1e-8);
            }
            other => panic!("expected buy, got {other:?}"),
        }
    }

    #[test]
    fn quote_sells_inventory_first() {
        let balances = HashMap::from([
            ("idr".to_string(), 10_000_000.0),
            ("btc".to_string(), 0.00015384),
        ]);
        let quote = decide_quote(&info(), &params(), &balances, &best(650_000_000.0, 653_250_000.0))
            .expect("should quote");
        match quote {
            Quote::Sell { price, amount } => {
                assert_eq!(price, 653_249_999.0);
                assert!((amount - 0.00015384).abs() < 1e-12);
            }
            other => panic!("expected sell, got {other:?}"),
        }
    }

    #[test]
    fn quote_none_when_insufficient() {
        let balances = HashMap::from([("idr".to_string(), 50_000.0)]);
        assert!(decide_quote(&info(), &params(), &balances, &best(650_000_000.0, 653_250_000.0))
            .is_none());
    }

    #[test]
    fn quote_none_when_below_exchange_minimums() {
        // Tiny dust inventory that rounds below the minimum notional.
        let balances = HashMap::from([("btc".to_string(), 2e-6)]);
        let quote = decide_quote(&info(), &params(), &balances, &best(100.0, 105.0));
        assert!(quote.is_none());
    }

    #[test]
    fn reposition_is_strictly_greater() {
        // 0.3% drift at exactly the threshold must NOT trigger.
        let exactly = best(99.7, 100.3);
        assert!(!should_reposition(100.0, Side::Buy, &exactly, 0.3));

        let beyond = best(99.69, 100.3);
        assert!(should_reposition(100.0, Side::Buy, &beyond, 0.3));

        // Sell orders measure against the ask.
        let sell_beyond = best(99.0, 100.5);
        assert!(should_reposition(100.0, Side::Sell, &sell_beyond, 0.3));
    }

    #[test]
    fn fifo_profit_walks_lots_in_order() {
        let mut ledger = VecDeque::from([(1.0, 100.0), (1.0, 110.0)]);
        let profit = fifo_profit(&mut ledger, 1.5, 120.0);
        assert!((profit - 25.0).abs() < 1e-9);
        assert_eq!(ledger.len(), 1);
        assert!((ledger[0].0 - 0.5).abs() < 1e-9);

        // Selling more than the ledger holds realizes only the known lots.
        let profit = fifo_profit(&mut ledger, 2.0, 120.0);
        assert!((profit - 5.0).abs() < 1e-9);
        assert!(ledger.is_empty());
    }

    fn paper_bot() -> BotConfig {
        let now = Utc::now().to_rfc3339();
        BotConfig {
            id: "bot-1".into(),
            user_id: "u1".into(),
            name: "mm".into(),
            bot_type: BotType::MarketMaker,
            pair: Some("btcidr".into()),
            paper: true,
            status: BotStatus::Running,
            error_message: None,
            stats: Default::default(),
            virtual_balances: HashMap::new(),
            market_maker: Some(params()),
            pump_hunter: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn paper_cycle_buy_then_sell_updates_stats() {
        let cancel = CancellationToken::new();
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let market = MarketDataEngine::new(store.clone());
        let paper = PaperExecutor::new(market, 0, cancel.clone());
        let ws = crate::exchange::PublicWs::new("wss://example.test", "t", cancel.clone());
        let submgr = SubscriptionManager::new(ws);

        let instance = MarketMakerInstance::new(
            paper_bot(),
            params(),
            info(),
            HashMap::from([("idr".to_string(), 10_000_000.0)]),
            store.clone(),
            submgr,
            paper.clone(),
            paper.clone(),
        );
        let tx = instance.event_sender();
        let run_cancel = cancel.child_token();
        let handle = tokio::spawn(instance.run(run_cancel.clone()));

        // Tight spread: gap 0.015% < 0.5% — no order.
        tx.send(BotEvent::Ticker(best(650_000_000.0, 650_100_000.0)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(paper.pending_count(), 0);

        // Wide spread: buy placed at bid + tick, then paper-filled.
        tx.send(BotEvent::Ticker(best(650_000_000.0, 653_250_000.0)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let balances: HashMap<String, f64> =
            store::get_json(store.as_ref(), "bot_balance:bot-1")
                .await
                .unwrap()
                .expect("balances persisted");
        assert!((balances["idr"] - 9_900_000.0).abs() < 50.0);
        assert!((balances["btc"] - 0.00015384).abs() < 1e-7);

        // Past the debounce, the next tick quotes the sell side; its fill
        // completes the cycle.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        tx.send(BotEvent::Ticker(best(650_000_000.0, 653_250_000.0)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        run_cancel.cancel();
        let exit = handle.await.unwrap();
        assert!(exit.error.is_none());

        let bot = crate::strategy::bots::load_bot(store.as_ref(), "bot-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bot.stats.total_trades, 1);
        assert_eq!(bot.stats.winning_trades, 1);
        assert!(bot.stats.total_profit_idr > 400.0 && bot.stats.total_profit_idr < 600.0);
        assert_eq!(bot.virtual_balances.get("btc").copied().unwrap_or(0.0), 0.0);
        assert!((bot.virtual_balances["idr"] - 10_000_500.0).abs() < 100.0);
    }

    #[tokio::test]
    async fn credential_error_is_fatal() {
        let cancel = CancellationToken::new();
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let market = MarketDataEngine::new(store.clone());
        let paper = PaperExecutor::new(market, 0, cancel.clone());
        let ws = crate::exchange::PublicWs::new("wss://example.test", "t", cancel.clone());
        let submgr = SubscriptionManager::new(ws);

        let instance = MarketMakerInstance::new(
            paper_bot(),
            params(),
            info(),
            HashMap::new(),
            store,
            submgr,
            paper.clone(),
            paper,
        );
        let tx = instance.event_sender();
        let handle = tokio::spawn(instance.run(cancel.child_token()));

        tx.send(BotEvent::CredentialError("invalid key".into()))
            .await
            .unwrap();
        let exit = handle.await.unwrap();
        assert!(exit.error.unwrap().contains("invalid key"));
    }
}
