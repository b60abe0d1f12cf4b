// =============================================================================
// Pump Hunter — multi-pair momentum bot
// =============================================================================
//
// Subscribes to every coin update. Qualifying entry signals are buffered by
// pair (the strongest score wins) and drained once per signal window in
// descending score order, so simultaneous pumps compete for the limited
// position slots by strength. Exits are evaluated on a periodic sweep and
// opportunistically on each tick of a held pair; the first matching rule
// closes the position.
//
// Daily realized losses accumulate per calendar day; hitting the limit
// pauses entries until the next day, while open positions keep being
// managed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::market::coin::Coin;
use crate::market::pairs::floor_amount;
use crate::market::{MarketDataEngine, PairRegistry};
use crate::orders::{FillOutcome, FillSink, Order};
use crate::store::{self, KvStore};
use crate::strategy::bots::{publish_bot_update, save_bot, BotConfig, BotExit, BotTunables};
use crate::strategy::executor::{OrderTracker, TradeExecutor};
use crate::types::{ParentType, PositionStatus, Side};

/// Channels for position lifecycle and entry-signal pushes.
pub const POSITION_UPDATE_CHANNEL: &str = "position.update";
pub const PUMP_SIGNAL_CHANNEL: &str = "market.pump_signal";

/// Floor below which a computed position size is not worth submitting.
const MIN_POSITION_IDR: f64 = 10_000.0;
/// Event channel depth; coin ticks beyond this are dropped.
const EVENT_BUFFER: usize = 256;

// =============================================================================
// Params
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRules {
    pub min_pump_score: f64,
    pub min_timeframes_positive: u32,
    pub min_24h_volume_idr: f64,
    pub min_price_idr: f64,
    #[serde(default)]
    pub excluded_pairs: Vec<String>,
    /// Empty means every pair is allowed.
    #[serde(default)]
    pub allowed_pairs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRules {
    pub target_profit_percent: f64,
    pub stop_loss_percent: f64,
    #[serde(default)]
    pub trailing_stop_enabled: bool,
    #[serde(default)]
    pub trailing_stop_percent: f64,
    pub max_hold_minutes: i64,
    #[serde(default)]
    pub pump_score_drop_enabled: bool,
    #[serde(default)]
    pub pump_score_drop_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRules {
    pub max_concurrent_positions: usize,
    pub max_position_idr: f64,
    #[serde(default)]
    pub min_balance_reserve_idr: f64,
    pub daily_loss_limit_idr: f64,
    #[serde(default)]
    pub cooldown_after_loss_minutes: i64,
    /// Virtual capital for paper runs; the live cap comes from the account.
    pub initial_balance_idr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpHunterParams {
    pub entry: EntryRules,
    pub exit: ExitRules,
    pub risk: RiskRules,
}

impl PumpHunterParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.entry.min_pump_score <= 0.0 {
            return Err(EngineError::Validation("min pump score must be positive".into()));
        }
        if self.exit.target_profit_percent <= 0.0 || self.exit.stop_loss_percent <= 0.0 {
            return Err(EngineError::Validation(
                "target profit and stop loss must be positive".into(),
            ));
        }
        if self.exit.trailing_stop_enabled && self.exit.trailing_stop_percent <= 0.0 {
            return Err(EngineError::Validation(
                "trailing stop percent must be positive when enabled".into(),
            ));
        }
        if self.exit.max_hold_minutes <= 0 {
            return Err(EngineError::Validation("max hold must be positive".into()));
        }
        if self.risk.max_concurrent_positions == 0 {
            return Err(EngineError::Validation(
                "at least one concurrent position is required".into(),
            ));
        }
        if self.risk.max_position_idr < MIN_POSITION_IDR {
            return Err(EngineError::Validation(format!(
                "max position must be at least {MIN_POSITION_IDR} IDR"
            )));
        }
        if self.risk.initial_balance_idr <= 0.0 || self.risk.daily_loss_limit_idr <= 0.0 {
            return Err(EngineError::Validation(
                "initial balance and daily loss limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Position model
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub bot_id: String,
    pub user_id: String,
    pub pair: String,
    pub status: PositionStatus,
    pub paper: bool,

    pub entry_price: f64,
    pub entry_quantity: f64,
    pub entry_amount_idr: f64,
    #[serde(default)]
    pub entry_order_id: String,
    pub entry_pump_score: f64,
    pub entry_trx_count: u64,

    #[serde(default)]
    pub exit_price: f64,
    #[serde(default)]
    pub exit_quantity: f64,
    #[serde(default)]
    pub exit_order_id: String,

    pub highest_price: f64,
    pub lowest_price: f64,

    #[serde(default)]
    pub profit_idr: f64,
    #[serde(default)]
    pub profit_percent: f64,
    #[serde(default)]
    pub close_reason: Option<String>,

    /// Unix seconds of the entry fill; drives the max-hold rule.
    #[serde(default)]
    pub opened_ts: i64,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
}

impl Position {
    fn key(id: &str) -> String {
        format!("position:{id}")
    }

    fn bot_index(bot_id: &str) -> String {
        format!("bot_positions:{bot_id}")
    }
}

pub async fn load_position(store: &dyn KvStore, id: &str) -> EngineResult<Option<Position>> {
    store::get_json(store, &Position::key(id)).await
}

// =============================================================================
// Pure rules
// =============================================================================

/// All entry conditions derived from the coin itself.
pub(crate) fn entry_signal(coin: &Coin, rules: &EntryRules) -> bool {
    if coin.pump_score < rules.min_pump_score {
        return false;
    }
    if coin.timeframes_positive() < rules.min_timeframes_positive {
        return false;
    }
    if coin.volume_idr < rules.min_24h_volume_idr {
        return false;
    }
    if coin.price < rules.min_price_idr {
        return false;
    }
    if rules.excluded_pairs.iter().any(|p| p == &coin.pair) {
        return false;
    }
    if !rules.allowed_pairs.is_empty() && !rules.allowed_pairs.iter().any(|p| p == &coin.pair) {
        return false;
    }
    true
}

/// First matching exit rule, in priority order.
pub(crate) fn check_exit(
    pos: &Position,
    current_price: f64,
    pump_score: f64,
    now: i64,
    rules: &ExitRules,
) -> Option<&'static str> {
    if pos.entry_price <= 0.0 || current_price <= 0.0 {
        return None;
    }
    let change = (current_price - pos.entry_price) / pos.entry_price * 100.0;

    if change >= rules.target_profit_percent {
        return Some("take_profit");
    }
    if change <= -rules.stop_loss_percent {
        return Some("stop_loss");
    }
    if rules.trailing_stop_enabled && pos.highest_price > 0.0 {
        let drawdown = (pos.highest_price - current_price) / pos.highest_price * 100.0;
        if drawdown >= rules.trailing_stop_percent {
            return Some("trailing_stop");
        }
    }
    if now - pos.opened_ts >= rules.max_hold_minutes * 60 {
        return Some("max_hold");
    }
    if rules.pump_score_drop_enabled && pump_score < rules.pump_score_drop_threshold {
        return Some("pump_score_drop");
    }
    None
}

/// `min(max_position, available − reserve)`, or `None` below the floor.
pub(crate) fn position_size(risk: &RiskRules, available_idr: f64) -> Option<f64> {
    let size = risk
        .max_position_idr
        .min(available_idr - risk.min_balance_reserve_idr);
    (size >= MIN_POSITION_IDR).then_some(size)
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug)]
enum HunterEvent {
    Coin(Box<Coin>),
    Fill { order: Order, outcome: FillOutcome },
    CredentialError(String),
}

struct EventSink {
    tx: mpsc::Sender<HunterEvent>,
}

#[async_trait]
impl FillSink for EventSink {
    async fn on_fill(&self, order: Order, outcome: FillOutcome) {
        let _ = self.tx.send(HunterEvent::Fill { order, outcome }).await;
    }

    async fn on_credential_error(&self, _order: Order, message: String) {
        let _ = self.tx.send(HunterEvent::CredentialError(message)).await;
    }
}

#[derive(Debug, Clone)]
struct BufferedSignal {
    pair: String,
    score: f64,
    price: f64,
    volume_idr: f64,
    trx_1m: u64,
}

// =============================================================================
// Instance
// =============================================================================

pub struct PumpHunterInstance {
    bot: BotConfig,
    params: PumpHunterParams,

    store: Arc<dyn KvStore>,
    market: Arc<MarketDataEngine>,
    registry: Arc<PairRegistry>,
    executor: Arc<dyn TradeExecutor>,
    tracker: Arc<dyn OrderTracker>,
    tunables: BotTunables,

    tx: mpsc::Sender<HunterEvent>,
    rx: mpsc::Receiver<HunterEvent>,

    /// Open/in-flight positions keyed by pair.
    positions: HashMap<String, Position>,
    signal_buffer: HashMap<String, BufferedSignal>,
    idr_balance: f64,

    daily_loss_idr: f64,
    daily_loss_date: String,
    last_loss_ts: Option<i64>,
    paused_until_next_day: bool,
}

impl PumpHunterInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot: BotConfig,
        params: PumpHunterParams,
        balances: HashMap<String, f64>,
        store: Arc<dyn KvStore>,
        market: Arc<MarketDataEngine>,
        registry: Arc<PairRegistry>,
        executor: Arc<dyn TradeExecutor>,
        tracker: Arc<dyn OrderTracker>,
        tunables: BotTunables,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let idr_balance = balances.get("idr").copied().unwrap_or(0.0);
        Self {
            bot,
            params,
            store,
            market,
            registry,
            executor,
            tracker,
            tunables,
            tx,
            rx,
            positions: HashMap::new(),
            signal_buffer: HashMap::new(),
            idr_balance,
            daily_loss_idr: 0.0,
            daily_loss_date: today(),
            last_loss_ts: None,
            paused_until_next_day: false,
        }
    }

    fn sink(&self) -> Arc<dyn FillSink> {
        Arc::new(EventSink {
            tx: self.tx.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Restart recovery
    // -------------------------------------------------------------------------

    /// Load this bot's in-flight positions and re-register their exchange
    /// orders, so fills that landed while the process was down still drive
    /// `buying -> open` and `selling -> closed`.
    pub async fn recover_positions(&mut self) -> EngineResult<()> {
        let ids = self
            .store
            .set_members(&Position::bot_index(&self.bot.id))
            .await?;

        for id in ids {
            let Some(pos) = load_position(self.store.as_ref(), &id).await? else {
                continue;
            };
            match pos.status {
                PositionStatus::Buying => {
                    let order = Order::new(
                        &pos.user_id,
                        &pos.id,
                        ParentType::Position,
                        &pos.entry_order_id,
                        &pos.pair,
                        Side::Buy,
                        pos.entry_price,
                        pos.entry_quantity,
                        pos.paper,
                    );
                    self.tracker.register(order, self.sink());
                    info!(position_id = %pos.id, pair = %pos.pair, "re-tracking entry order");
                    self.positions.insert(pos.pair.clone(), pos);
                }
                PositionStatus::Selling => {
                    let order = Order::new(
                        &pos.user_id,
                        &pos.id,
                        ParentType::Position,
                        &pos.exit_order_id,
                        &pos.pair,
                        Side::Sell,
                        pos.exit_price,
                        pos.entry_quantity,
                        pos.paper,
                    );
                    self.tracker.register(order, self.sink());
                    info!(position_id = %pos.id, pair = %pos.pair, "re-tracking exit order");
                    self.positions.insert(pos.pair.clone(), pos);
                }
                PositionStatus::Open | PositionStatus::Pending => {
                    info!(position_id = %pos.id, pair = %pos.pair, "resuming open position");
                    self.positions.insert(pos.pair.clone(), pos);
                }
                PositionStatus::Closed | PositionStatus::Error => {}
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self, cancel: CancellationToken) -> BotExit {
        info!(
            bot_id = %self.bot.id,
            paper = self.bot.paper,
            positions = self.positions.len(),
            "pump hunter started"
        );

        let coin_tx = self.tx.clone();
        let sub_id = self.market.subscribe(Arc::new(move |coin: &Coin| {
            // Coin ticks are droppable; the periodic sweeps catch up.
            let _ = coin_tx.try_send(HunterEvent::Coin(Box::new(coin.clone())));
        }));

        let mut signal_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.tunables.signal_window_secs.max(1),
        ));
        let mut exit_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.tunables.exit_check_secs.max(1),
        ));

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break BotExit::default(),
                event = self.rx.recv() => {
                    let Some(event) = event else { break BotExit::default() };
                    match event {
                        HunterEvent::Coin(coin) => self.on_coin(&coin).await,
                        HunterEvent::Fill { order, outcome } => {
                            self.on_fill(order, outcome).await;
                        }
                        HunterEvent::CredentialError(message) => {
                            break BotExit {
                                error: Some(format!("api key rejected: {message}")),
                            };
                        }
                    }
                }
                _ = signal_tick.tick() => self.process_signals().await,
                _ = exit_tick.tick() => self.evaluate_exits().await,
            }
        };

        self.market.unsubscribe(sub_id);
        let _ = self.persist_bot().await;
        info!(bot_id = %self.bot.id, "pump hunter stopped");
        exit
    }

    // -------------------------------------------------------------------------
    // Coin updates
    // -------------------------------------------------------------------------

    async fn on_coin(&mut self, coin: &Coin) {
        // Held pair: refresh extremes and check exits opportunistically.
        if self.positions.contains_key(&coin.pair) {
            let close = {
                let pos = self.positions.get_mut(&coin.pair).expect("checked above");
                if pos.status == PositionStatus::Open {
                    pos.highest_price = pos.highest_price.max(coin.price);
                    pos.lowest_price = if pos.lowest_price == 0.0 {
                        coin.price
                    } else {
                        pos.lowest_price.min(coin.price)
                    };
                    let now = Utc::now().timestamp();
                    check_exit(pos, coin.price, coin.pump_score, now, &self.params.exit)
                        .map(|reason| (pos.clone(), reason))
                } else {
                    None
                }
            };
            if let Some((pos, reason)) = close {
                self.close_position(pos, reason).await;
            }
            return;
        }

        // Entry evaluation.
        if !entry_signal(coin, &self.params.entry) {
            return;
        }

        let signal = BufferedSignal {
            pair: coin.pair.clone(),
            score: coin.pump_score,
            price: coin.price,
            volume_idr: coin.volume_idr,
            trx_1m: coin.timeframes[0].trx,
        };

        let stronger = self
            .signal_buffer
            .get(&coin.pair)
            .map_or(true, |existing| signal.score > existing.score);
        if stronger {
            debug!(pair = %coin.pair, score = signal.score, "entry signal buffered");
            self.publish_pump_signal(&signal).await;
            self.signal_buffer.insert(coin.pair.clone(), signal);
        }
    }

    // -------------------------------------------------------------------------
    // Signal window
    // -------------------------------------------------------------------------

    /// Drain the buffer strongest-first, opening positions while admission
    /// rules allow.
    async fn process_signals(&mut self) {
        if self.signal_buffer.is_empty() {
            return;
        }
        let mut signals: Vec<BufferedSignal> = self.signal_buffer.drain().map(|(_, s)| s).collect();
        signals.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        self.roll_daily_window();
        let now = Utc::now().timestamp();

        for signal in signals {
            if self.positions.len() >= self.params.risk.max_concurrent_positions {
                debug!(pair = %signal.pair, "signal dropped: at position limit");
                continue;
            }
            if self.positions.contains_key(&signal.pair) {
                continue;
            }
            if let Some(last_loss) = self.last_loss_ts {
                if now - last_loss < self.params.risk.cooldown_after_loss_minutes * 60 {
                    debug!(pair = %signal.pair, "signal dropped: loss cooldown");
                    continue;
                }
            }
            if self.paused_until_next_day {
                debug!(pair = %signal.pair, "signal dropped: daily loss limit reached");
                continue;
            }

            let Some(size_idr) = position_size(&self.params.risk, self.idr_balance) else {
                debug!(pair = %signal.pair, balance = self.idr_balance, "signal dropped: size below minimum");
                continue;
            };

            self.open_position(&signal, size_idr).await;
        }
    }

    async fn open_position(&mut self, signal: &BufferedSignal, size_idr: f64) {
        let placed = match self
            .executor
            .market_buy(&self.bot.user_id, &signal.pair, size_idr)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                warn!(pair = %signal.pair, error = %e, "entry buy failed");
                return;
            }
        };

        let mark_price = if placed.price > 0.0 {
            placed.price
        } else {
            signal.price
        };
        let quantity = match self.registry.get(&signal.pair) {
            Some(info) => floor_amount(&info, size_idr / mark_price),
            None => size_idr / mark_price,
        };

        let now = Utc::now();
        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: self.bot.id.clone(),
            user_id: self.bot.user_id.clone(),
            pair: signal.pair.clone(),
            status: PositionStatus::Buying,
            paper: self.bot.paper,
            entry_price: mark_price,
            entry_quantity: quantity,
            entry_amount_idr: size_idr,
            entry_order_id: placed.exchange_order_id.clone(),
            entry_pump_score: signal.score,
            entry_trx_count: signal.trx_1m,
            exit_price: 0.0,
            exit_quantity: 0.0,
            exit_order_id: String::new(),
            highest_price: mark_price,
            lowest_price: mark_price,
            profit_idr: 0.0,
            profit_percent: 0.0,
            close_reason: None,
            opened_ts: now.timestamp(),
            opened_at: now.to_rfc3339(),
            closed_at: None,
        };

        let order = Order::new(
            &self.bot.user_id,
            &position.id,
            ParentType::Position,
            &placed.exchange_order_id,
            &signal.pair,
            Side::Buy,
            mark_price,
            quantity,
            self.bot.paper,
        );
        let _ = order.save(self.store.as_ref()).await;
        self.tracker.register(order, self.sink());

        self.idr_balance -= size_idr;
        info!(
            bot_id = %self.bot.id,
            position_id = %position.id,
            pair = %signal.pair,
            score = signal.score,
            size_idr,
            "position entry submitted"
        );
        self.save_position(&position).await;
        self.positions.insert(signal.pair.clone(), position);
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    async fn evaluate_exits(&mut self) {
        let now = Utc::now().timestamp();
        let mut to_close = Vec::new();

        for pos in self.positions.values_mut() {
            if pos.status != PositionStatus::Open {
                continue;
            }
            let Some(coin) = self.market.get_coin(&pos.pair) else {
                continue;
            };
            if coin.price > 0.0 {
                pos.highest_price = pos.highest_price.max(coin.price);
                pos.lowest_price = if pos.lowest_price == 0.0 {
                    coin.price
                } else {
                    pos.lowest_price.min(coin.price)
                };
            }
            if let Some(reason) = check_exit(pos, coin.price, coin.pump_score, now, &self.params.exit)
            {
                to_close.push((pos.clone(), reason));
            }
        }

        for (pos, reason) in to_close {
            self.close_position(pos, reason).await;
        }
    }

    async fn close_position(&mut self, mut pos: Position, reason: &'static str) {
        info!(
            position_id = %pos.id,
            pair = %pos.pair,
            reason,
            "closing position"
        );

        let placed = match self
            .executor
            .market_sell(&self.bot.user_id, &pos.pair, pos.entry_quantity)
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                warn!(position_id = %pos.id, error = %e, "exit sell failed — will retry next sweep");
                return;
            }
        };

        let mark = if placed.price > 0.0 {
            placed.price
        } else {
            self.market.price_of(&pos.pair).unwrap_or(pos.entry_price)
        };

        pos.status = PositionStatus::Selling;
        pos.close_reason = Some(reason.to_string());
        pos.exit_order_id = placed.exchange_order_id.clone();
        pos.exit_price = mark;

        let order = Order::new(
            &self.bot.user_id,
            &pos.id,
            ParentType::Position,
            &placed.exchange_order_id,
            &pos.pair,
            Side::Sell,
            mark,
            pos.entry_quantity,
            self.bot.paper,
        );
        let _ = order.save(self.store.as_ref()).await;
        self.tracker.register(order, self.sink());

        self.save_position(&pos).await;
        self.positions.insert(pos.pair.clone(), pos);
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    async fn on_fill(&mut self, order: Order, outcome: FillOutcome) {
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
                if order.side == Side::Buy {
                    // Entry never happened; free the slot and the funds.
                    if let Some(mut pos) = self.positions.remove(&order.pair) {
                        self.idr_balance += pos.entry_amount_idr;
                        pos.status = PositionStatus::Error;
                        pos.close_reason = Some("entry cancelled".into());
                        pos.closed_at = Some(Utc::now().to_rfc3339());
                        self.save_position(&pos).await;
                    }
                }
                return;
            }
        };

        if !self.positions.contains_key(&order.pair) {
            warn!(pair = %order.pair, "fill for unknown position");
            return;
        }

        match order.side {
            Side::Buy => {
                let pos = self.positions.get_mut(&order.pair).expect("checked above");
                pos.status = PositionStatus::Open;
                pos.entry_price = price;
                pos.entry_quantity = filled;
                pos.highest_price = price;
                pos.lowest_price = price;
                pos.opened_ts = Utc::now().timestamp();
                info!(
                    position_id = %pos.id,
                    pair = %pos.pair,
                    entry_price = price,
                    quantity = filled,
                    "position open"
                );
                let snapshot = pos.clone();
                self.save_position(&snapshot).await;
            }
            Side::Sell => {
                let mut pos = self.positions.remove(&order.pair).expect("checked above");
                pos.exit_price = price;
                pos.exit_quantity = filled;
                pos.profit_idr = filled * price - pos.entry_quantity * pos.entry_price;
                let cost = pos.entry_quantity * pos.entry_price;
                pos.profit_percent = if cost > 0.0 {
                    pos.profit_idr / cost * 100.0
                } else {
                    0.0
                };
                pos.status = PositionStatus::Closed;
                pos.closed_at = Some(Utc::now().to_rfc3339());

                self.idr_balance += filled * price;
                self.bot.stats.total_trades += 1;
                if pos.profit_idr > 0.0 {
                    self.bot.stats.winning_trades += 1;
                } else {
                    self.roll_daily_window();
                    self.daily_loss_idr += -pos.profit_idr;
                    self.last_loss_ts = Some(Utc::now().timestamp());
                    if self.daily_loss_idr >= self.params.risk.daily_loss_limit_idr {
                        warn!(
                            bot_id = %self.bot.id,
                            daily_loss = self.daily_loss_idr,
                            "daily loss limit reached — entries paused until tomorrow"
                        );
                        self.paused_until_next_day = true;
                    }
                }
                self.bot.stats.total_profit_idr += pos.profit_idr;

                info!(
                    position_id = %pos.id,
                    pair = %pos.pair,
                    profit_idr = pos.profit_idr,
                    profit_percent = pos.profit_percent,
                    reason = pos.close_reason.as_deref().unwrap_or(""),
                    "position closed"
                );
                self.save_position(&pos).await;
                let _ = self.persist_bot().await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Daily window
    // -------------------------------------------------------------------------

    fn roll_daily_window(&mut self) {
        let today = today();
        if self.daily_loss_date != today {
            self.daily_loss_date = today;
            self.daily_loss_idr = 0.0;
            self.paused_until_next_day = false;
        }
    }

    // -------------------------------------------------------------------------
    // Persistence / events
    // -------------------------------------------------------------------------

    async fn save_position(&self, pos: &Position) {
        if let Err(e) = store::put_json(self.store.as_ref(), &Position::key(&pos.id), pos).await {
            warn!(position_id = %pos.id, error = %e, "position persist failed");
        }
        if let Err(e) = self
            .store
            .set_add(&Position::bot_index(&pos.bot_id), &pos.id)
            .await
        {
            warn!(position_id = %pos.id, error = %e, "position index update failed");
        }

        let payload = serde_json::json!({
            "user_id": pos.user_id,
            "position": pos,
        });
        let _ = self
            .store
            .publish(POSITION_UPDATE_CHANNEL, &payload.to_string())
            .await;
    }

    async fn persist_bot(&mut self) -> EngineResult<()> {
        self.bot
            .virtual_balances
            .insert("idr".to_string(), self.idr_balance);
        self.bot.updated_at = Utc::now().to_rfc3339();
        store::put_json(
            self.store.as_ref(),
            &format!("bot_balance:{}", self.bot.id),
            &self.bot.virtual_balances,
        )
        .await?;
        save_bot(self.store.as_ref(), &self.bot).await?;
        publish_bot_update(self.store.as_ref(), &self.bot).await;
        Ok(())
    }

    async fn publish_pump_signal(&self, signal: &BufferedSignal) {
        let payload = serde_json::json!({
            "user_id": self.bot.user_id,
            "bot_id": self.bot.id,
            "pair": signal.pair,
            "pump_score": signal.score,
            "price": signal.price,
            "volume_idr": signal.volume_idr,
        });
        let _ = self
            .store
            .publish(PUMP_SIGNAL_CHANNEL, &payload.to_string())
            .await;
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::strategy::executor::PaperExecutor;
    use crate::types::{BotStatus, BotType};

    fn entry_rules() -> EntryRules {
        EntryRules {
            min_pump_score: 50.0,
            min_timeframes_positive: 2,
            min_24h_volume_idr: 1e9,
            min_price_idr: 50.0,
            excluded_pairs: vec![],
            allowed_pairs: vec![],
        }
    }

    fn exit_rules() -> ExitRules {
        ExitRules {
            target_profit_percent: 10.0,
            stop_loss_percent: 5.0,
            trailing_stop_enabled: true,
            trailing_stop_percent: 1.0,
            max_hold_minutes: 60,
            pump_score_drop_enabled: false,
            pump_score_drop_threshold: 0.0,
        }
    }

    fn risk_rules() -> RiskRules {
        RiskRules {
            max_concurrent_positions: 2,
            max_position_idr: 1_000_000.0,
            min_balance_reserve_idr: 100_000.0,
            daily_loss_limit_idr: 500_000.0,
            cooldown_after_loss_minutes: 0,
            initial_balance_idr: 10_000_000.0,
        }
    }

    fn params() -> PumpHunterParams {
        PumpHunterParams {
            entry: entry_rules(),
            exit: exit_rules(),
            risk: risk_rules(),
        }
    }

    /// A coin that satisfies every entry rule, with the pump score pinned.
    fn qualifying_coin(pair: &str, score: f64) -> Coin {
        let mut coin = Coin::new(pair, 0);
        coin.apply_tick(100.0, 1);
        coin.apply_tick(105.0, 2);
        coin.volume_idr = 2e9;
        coin.pump_score = score;
        coin
    }

    fn position_at(entry: f64) -> Position {
        Position {
            id: "p1".into(),
            bot_id: "b1".into(),
            user_id: "u1".into(),
            pair: "btcidr".into(),
            status: PositionStatus::Open,
            paper: true,
            entry_price: entry,
            entry_quantity: 1.0,
            entry_amount_idr: entry,
            entry_order_id: "ex-1".into(),
            entry_pump_score: 60.0,
            entry_trx_count: 5,
            exit_price: 0.0,
            exit_quantity: 0.0,
            exit_order_id: String::new(),
            highest_price: entry,
            lowest_price: entry,
            profit_idr: 0.0,
            profit_percent: 0.0,
            close_reason: None,
            opened_ts: 1_000,
            opened_at: "t".into(),
            closed_at: None,
        }
    }

    #[test]
    fn entry_signal_requires_every_rule() {
        let rules = entry_rules();
        assert!(entry_signal(&qualifying_coin("btcidr", 60.0), &rules));

        let weak = qualifying_coin("btcidr", 40.0);
        assert!(!entry_signal(&weak, &rules));

        let mut thin = qualifying_coin("btcidr", 60.0);
        thin.volume_idr = 1e8;
        assert!(!entry_signal(&thin, &rules));

        let mut cheap = qualifying_coin("btcidr", 60.0);
        cheap.price = 10.0;
        assert!(!entry_signal(&cheap, &rules));
    }

    #[test]
    fn entry_signal_pair_filters() {
        let mut rules = entry_rules();
        rules.excluded_pairs = vec!["btcidr".into()];
        assert!(!entry_signal(&qualifying_coin("btcidr", 60.0), &rules));
        assert!(entry_signal(&qualifying_coin("ethidr", 60.0), &rules));

        let mut rules = entry_rules();
        rules.allowed_pairs = vec!["ethidr".into()];
        assert!(!entry_signal(&qualifying_coin("btcidr", 60.0), &rules));
        assert!(entry_signal(&qualifying_coin("ethidr", 60.0), &rules));
    }

    #[test]
    fn exit_take_profit_first() {
        let pos = position_at(100.0);
        assert_eq!(
            check_exit(&pos, 110.0, 60.0, 1_100, &exit_rules()),
            Some("take_profit")
        );
    }

    #[test]
    fn exit_stop_loss() {
        let pos = position_at(100.0);
        assert_eq!(
            check_exit(&pos, 95.0, 60.0, 1_100, &exit_rules()),
            Some("stop_loss")
        );
    }

    #[test]
    fn exit_trailing_stop_on_one_percent_drawdown() {
        // Price path 100 -> 105 -> 104 -> 103.95.
        let mut pos = position_at(100.0);
        let rules = exit_rules();

        pos.highest_price = pos.highest_price.max(105.0);
        assert_eq!(check_exit(&pos, 105.0, 60.0, 1_100, &rules), None);
        assert_eq!(check_exit(&pos, 104.0, 60.0, 1_100, &rules), None);
        // (105 - 103.95) / 105 = exactly 1% — triggers (inclusive).
        assert_eq!(
            check_exit(&pos, 103.95, 60.0, 1_100, &rules),
            Some("trailing_stop")
        );
    }

    #[test]
    fn exit_max_hold() {
        let pos = position_at(100.0);
        let now = pos.opened_ts + 60 * 60;
        assert_eq!(
            check_exit(&pos, 101.0, 60.0, now, &exit_rules()),
            Some("max_hold")
        );
    }

    #[test]
    fn exit_pump_score_drop_only_when_enabled() {
        let pos = position_at(100.0);
        let mut rules = exit_rules();
        assert_eq!(check_exit(&pos, 101.0, -5.0, 1_100, &rules), None);

        rules.pump_score_drop_enabled = true;
        rules.pump_score_drop_threshold = 0.0;
        assert_eq!(
            check_exit(&pos, 101.0, -5.0, 1_100, &rules),
            Some("pump_score_drop")
        );
    }

    #[test]
    fn sizing_respects_cap_reserve_and_floor() {
        let risk = risk_rules();
        assert_eq!(position_size(&risk, 10_000_000.0), Some(1_000_000.0));
        assert_eq!(position_size(&risk, 600_000.0), Some(500_000.0));
        assert_eq!(position_size(&risk, 105_000.0), None);
        assert_eq!(position_size(&risk, 0.0), None);
    }

    #[test]
    fn params_validation() {
        assert!(params().validate().is_ok());
        let mut bad = params();
        bad.risk.max_concurrent_positions = 0;
        assert!(bad.validate().is_err());
        let mut bad = params();
        bad.exit.trailing_stop_enabled = true;
        bad.exit.trailing_stop_percent = 0.0;
        assert!(bad.validate().is_err());
    }

    fn paper_bot() -> BotConfig {
        let now = Utc::now().to_rfc3339();
        BotConfig {
            id: "hunter-1".into(),
            user_id: "u1".into(),
            name: "hunter".into(),
            bot_type: BotType::PumpHunter,
            pair: None,
            paper: true,
            status: BotStatus::Running,
            error_message: None,
            stats: Default::default(),
            virtual_balances: HashMap::new(),
            market_maker: None,
            pump_hunter: Some(params()),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn instance(store: Arc<dyn KvStore>) -> (PumpHunterInstance, Arc<PaperExecutor>) {
        let cancel = CancellationToken::new();
        let market = MarketDataEngine::new(store.clone());
        let registry = Arc::new(PairRegistry::new(store.clone()));
        // Fill delay long enough that entries stay in `buying` during tests.
        let paper = PaperExecutor::new(market.clone(), 600, cancel);
        let inst = PumpHunterInstance::new(
            paper_bot(),
            params(),
            HashMap::from([("idr".to_string(), 10_000_000.0)]),
            store,
            market,
            registry,
            paper.clone(),
            paper.clone(),
            BotTunables {
                signal_window_secs: 1,
                exit_check_secs: 10,
            },
        );
        (inst, paper)
    }

    #[tokio::test]
    async fn signal_window_opens_strongest_first_up_to_limit() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mut inst, _paper) = instance(store.clone());

        // Three qualifying signals land inside one window: 75, 85, 60.
        inst.on_coin(&qualifying_coin("btcidr", 75.0)).await;
        inst.on_coin(&qualifying_coin("ethidr", 85.0)).await;
        inst.on_coin(&qualifying_coin("dogeidr", 60.0)).await;
        assert_eq!(inst.signal_buffer.len(), 3);

        inst.process_signals().await;

        // Only the two strongest fit max_concurrent_positions = 2.
        assert_eq!(inst.positions.len(), 2);
        assert!(inst.positions.contains_key("ethidr"));
        assert!(inst.positions.contains_key("btcidr"));
        assert!(!inst.positions.contains_key("dogeidr"));
        assert!(inst.signal_buffer.is_empty());

        // 2 x 1M reserved from the balance.
        assert!((inst.idr_balance - 8_000_000.0).abs() < 1.0);

        let ids = store.set_members("bot_positions:hunter-1").await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn higher_score_overwrites_buffered_signal() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mut inst, _paper) = instance(store);

        inst.on_coin(&qualifying_coin("btcidr", 60.0)).await;
        inst.on_coin(&qualifying_coin("btcidr", 90.0)).await;
        inst.on_coin(&qualifying_coin("btcidr", 70.0)).await;

        assert_eq!(inst.signal_buffer.len(), 1);
        assert_eq!(inst.signal_buffer["btcidr"].score, 90.0);
    }

    #[tokio::test]
    async fn buy_fill_opens_position_and_sell_fill_closes_it() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mut inst, _paper) = instance(store.clone());

        inst.on_coin(&qualifying_coin("btcidr", 75.0)).await;
        inst.process_signals().await;
        let pos = inst.positions["btcidr"].clone();
        assert_eq!(pos.status, PositionStatus::Buying);

        let buy = Order::new(
            "u1",
            &pos.id,
            ParentType::Position,
            &pos.entry_order_id,
            "btcidr",
            Side::Buy,
            105.0,
            pos.entry_quantity,
            true,
        );
        inst.on_fill(
            buy,
            FillOutcome::Filled {
                filled: pos.entry_quantity,
                price: 105.0,
            },
        )
        .await;
        assert_eq!(inst.positions["btcidr"].status, PositionStatus::Open);

        // Take-profit close path.
        let open = inst.positions["btcidr"].clone();
        inst.close_position(open, "take_profit").await;
        let selling = inst.positions["btcidr"].clone();
        assert_eq!(selling.status, PositionStatus::Selling);

        let sell = Order::new(
            "u1",
            &selling.id,
            ParentType::Position,
            &selling.exit_order_id,
            "btcidr",
            Side::Sell,
            120.0,
            selling.entry_quantity,
            true,
        );
        inst.on_fill(
            sell,
            FillOutcome::Filled {
                filled: selling.entry_quantity,
                price: 120.0,
            },
        )
        .await;

        assert!(inst.positions.is_empty());
        assert_eq!(inst.bot.stats.total_trades, 1);
        assert_eq!(inst.bot.stats.winning_trades, 1);

        let stored = load_position(store.as_ref(), &selling.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PositionStatus::Closed);
        assert_eq!(stored.close_reason.as_deref(), Some("take_profit"));
        assert!(stored.profit_idr > 0.0);
    }

    #[tokio::test]
    async fn losing_close_feeds_daily_loss_and_pauses_at_limit() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mut inst, _paper) = instance(store);
        inst.params.risk.daily_loss_limit_idr = 100.0;

        inst.on_coin(&qualifying_coin("btcidr", 75.0)).await;
        inst.process_signals().await;
        let pos = inst.positions["btcidr"].clone();

        let buy = Order::new(
            "u1", &pos.id, ParentType::Position, &pos.entry_order_id,
            "btcidr", Side::Buy, 105.0, pos.entry_quantity, true,
        );
        inst.on_fill(buy, FillOutcome::Filled { filled: pos.entry_quantity, price: 105.0 })
            .await;

        let open = inst.positions["btcidr"].clone();
        inst.close_position(open, "stop_loss").await;
        let selling = inst.positions["btcidr"].clone();
        let sell = Order::new(
            "u1", &selling.id, ParentType::Position, &selling.exit_order_id,
            "btcidr", Side::Sell, 90.0, selling.entry_quantity, true,
        );
        inst.on_fill(sell, FillOutcome::Filled { filled: selling.entry_quantity, price: 90.0 })
            .await;

        assert!(inst.daily_loss_idr > 100.0);
        assert!(inst.paused_until_next_day);

        // Paused: a fresh signal is dropped by admission.
        inst.on_coin(&qualifying_coin("ethidr", 95.0)).await;
        inst.process_signals().await;
        assert!(inst.positions.is_empty());
    }

    #[tokio::test]
    async fn recovery_reregisters_inflight_positions() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

        // A crashed run left one buying position behind.
        let mut pos = position_at(105.0);
        pos.bot_id = "hunter-1".into();
        pos.status = PositionStatus::Buying;
        pos.paper = true;
        store::put_json(store.as_ref(), "position:p1", &pos).await.unwrap();
        store.set_add("bot_positions:hunter-1", "p1").await.unwrap();

        let (mut inst, paper) = instance(store);
        inst.recover_positions().await.unwrap();

        assert_eq!(inst.positions.len(), 1);
        assert_eq!(inst.positions["btcidr"].id, "p1");
        // The entry order is back under paper tracking.
        assert_eq!(paper.pending_count(), 1);
    }
}
