// =============================================================================
// Bot Manager — user-owned strategy instances and their lifecycle
// =============================================================================
//
// A BotConfig is the durable record; a running bot is a spawned task built
// from it. Transitions follow `stopped -> starting -> running ->
// stopped | error`; the manager owns every transition and persists it before
// or after the instance task runs.
//
// While a bot runs, its instance is the only writer of the bot record
// (stats, balances); the manager touches it again only after the task ends.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exchange::client::Credentials;
use crate::exchange::types::normalize_pair;
use crate::exchange::IndodaxClient;
use crate::market::{MarketDataEngine, PairRegistry, SubscriptionManager};
use crate::orders::OrderMonitor;
use crate::store::{self, KvStore};
use crate::strategy::executor::{LiveExecutor, PaperExecutor};
use crate::strategy::market_maker::{MarketMakerInstance, MarketMakerParams};
use crate::strategy::pump_hunter::{PumpHunterInstance, PumpHunterParams};
use crate::types::{BotStatus, BotType};

/// Channel for bot lifecycle / stats pushes.
pub const BOT_UPDATE_CHANNEL: &str = "bot.update";

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BotStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_profit_idr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub bot_type: BotType,
    /// Required for market makers; pump hunters scan every pair.
    #[serde(default)]
    pub pair: Option<String>,
    pub paper: bool,
    pub status: BotStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stats: BotStats,
    /// currency -> amount. Authoritative for paper bots; a cached view for
    /// live ones.
    #[serde(default)]
    pub virtual_balances: HashMap<String, f64>,
    #[serde(default)]
    pub market_maker: Option<MarketMakerParams>,
    #[serde(default)]
    pub pump_hunter: Option<PumpHunterParams>,
    pub created_at: String,
    pub updated_at: String,
}

impl BotConfig {
    pub fn key(id: &str) -> String {
        format!("bot:{id}")
    }

    fn user_index(user_id: &str) -> String {
        format!("user_bots:{user_id}")
    }

    /// Global index used for crash recovery at startup.
    const ALL_INDEX: &'static str = "bots:all";
}

pub async fn load_bot(store: &dyn KvStore, id: &str) -> EngineResult<Option<BotConfig>> {
    store::get_json(store, &BotConfig::key(id)).await
}

pub async fn save_bot(store: &dyn KvStore, bot: &BotConfig) -> EngineResult<()> {
    store::put_json(store, &BotConfig::key(&bot.id), bot).await
}

pub async fn publish_bot_update(store: &dyn KvStore, bot: &BotConfig) {
    let payload = serde_json::json!({
        "user_id": bot.user_id,
        "bot": bot,
    });
    if let Err(e) = store.publish(BOT_UPDATE_CHANNEL, &payload.to_string()).await {
        warn!(bot_id = %bot.id, error = %e, "bot update publish failed");
    }
}

/// How an instance task ended. `None` is a clean stop; `Some` carries the
/// fatal reason and lands the bot in `error`.
#[derive(Debug, Default)]
pub struct BotExit {
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotRequest {
    pub name: String,
    pub bot_type: BotType,
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub paper: bool,
    #[serde(default)]
    pub market_maker: Option<MarketMakerParams>,
    #[serde(default)]
    pub pump_hunter: Option<PumpHunterParams>,
}

// =============================================================================
// Manager
// =============================================================================

/// Windows the bot engines tick on, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct BotTunables {
    pub signal_window_secs: u64,
    pub exit_check_secs: u64,
}

struct RunningBot {
    cancel: CancellationToken,
}

pub struct BotManager {
    store: Arc<dyn KvStore>,
    registry: Arc<PairRegistry>,
    market: Arc<MarketDataEngine>,
    submgr: Arc<SubscriptionManager>,
    monitor: Arc<OrderMonitor>,
    live_exec: Arc<LiveExecutor>,
    paper_exec: Arc<PaperExecutor>,
    client: Arc<IndodaxClient>,
    vault: Arc<crate::vault::CredentialVault>,
    tunables: BotTunables,
    /// Private-WS endpoint; one order stream per user with live bots.
    private_ws_url: String,
    running: Mutex<HashMap<String, RunningBot>>,
    private_streams: Mutex<HashMap<String, CancellationToken>>,
    root_cancel: CancellationToken,
}

impl BotManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Arc<PairRegistry>,
        market: Arc<MarketDataEngine>,
        submgr: Arc<SubscriptionManager>,
        monitor: Arc<OrderMonitor>,
        live_exec: Arc<LiveExecutor>,
        paper_exec: Arc<PaperExecutor>,
        client: Arc<IndodaxClient>,
        vault: Arc<crate::vault::CredentialVault>,
        tunables: BotTunables,
        private_ws_url: String,
        root_cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            market,
            submgr,
            monitor,
            live_exec,
            paper_exec,
            client,
            vault,
            tunables,
            private_ws_url,
            running: Mutex::new(HashMap::new()),
            private_streams: Mutex::new(HashMap::new()),
            root_cancel,
        })
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    pub async fn create(&self, user_id: &str, req: BotRequest) -> EngineResult<BotConfig> {
        if req.name.trim().is_empty() {
            return Err(EngineError::Validation("bot name is required".into()));
        }

        let pair = match req.bot_type {
            BotType::MarketMaker => {
                let raw = req.pair.as_deref().ok_or_else(|| {
                    EngineError::Validation("market maker bots require a pair".into())
                })?;
                let pair = normalize_pair(raw);
                self.registry.require(&pair)?;
                Some(pair)
            }
            BotType::PumpHunter => None,
        };

        match req.bot_type {
            BotType::MarketMaker => {
                let params = req
                    .market_maker
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("market maker params required".into()))?;
                params.validate()?;
            }
            BotType::PumpHunter => {
                let params = req
                    .pump_hunter
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("pump hunter params required".into()))?;
                params.validate()?;
            }
        }

        let now = Utc::now().to_rfc3339();
        let bot = BotConfig {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: req.name.trim().to_string(),
            bot_type: req.bot_type,
            pair,
            paper: req.paper,
            status: BotStatus::Stopped,
            error_message: None,
            stats: BotStats::default(),
            virtual_balances: HashMap::new(),
            market_maker: req.market_maker,
            pump_hunter: req.pump_hunter,
            created_at: now.clone(),
            updated_at: now,
        };

        save_bot(self.store.as_ref(), &bot).await?;
        self.store
            .set_add(&BotConfig::user_index(user_id), &bot.id)
            .await?;
        self.store.set_add(BotConfig::ALL_INDEX, &bot.id).await?;
        info!(bot_id = %bot.id, user_id, bot_type = %bot.bot_type, "bot created");
        Ok(bot)
    }

    pub async fn get(&self, user_id: &str, bot_id: &str) -> EngineResult<BotConfig> {
        match load_bot(self.store.as_ref(), bot_id).await? {
            Some(bot) if bot.user_id == user_id => Ok(bot),
            _ => Err(EngineError::NotFound(format!("bot {bot_id}"))),
        }
    }

    pub async fn list(&self, user_id: &str) -> EngineResult<Vec<BotConfig>> {
        let ids = self
            .store
            .set_members(&BotConfig::user_index(user_id))
            .await?;
        let mut bots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(bot) = load_bot(self.store.as_ref(), &id).await? {
                bots.push(bot);
            }
        }
        bots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(bots)
    }

    pub async fn update(&self, user_id: &str, bot_id: &str, req: BotRequest) -> EngineResult<BotConfig> {
        let mut bot = self.get(user_id, bot_id).await?;
        if bot.status != BotStatus::Stopped && bot.status != BotStatus::Error {
            return Err(EngineError::Validation(
                "stop the bot before editing it".into(),
            ));
        }
        if req.bot_type != bot.bot_type {
            return Err(EngineError::Validation("bot type cannot change".into()));
        }

        if !req.name.trim().is_empty() {
            bot.name = req.name.trim().to_string();
        }
        if let Some(params) = req.market_maker {
            params.validate()?;
            bot.market_maker = Some(params);
        }
        if let Some(params) = req.pump_hunter {
            params.validate()?;
            bot.pump_hunter = Some(params);
        }
        if let Some(raw) = req.pair.as_deref() {
            let pair = normalize_pair(raw);
            self.registry.require(&pair)?;
            bot.pair = Some(pair);
        }
        bot.paper = req.paper;
        bot.updated_at = Utc::now().to_rfc3339();

        save_bot(self.store.as_ref(), &bot).await?;
        Ok(bot)
    }

    pub async fn delete(&self, user_id: &str, bot_id: &str) -> EngineResult<()> {
        let bot = self.get(user_id, bot_id).await?;
        if bot.status != BotStatus::Stopped && bot.status != BotStatus::Error {
            return Err(EngineError::Validation(
                "stop the bot before deleting it".into(),
            ));
        }

        self.store.delete(&BotConfig::key(bot_id)).await?;
        self.store.delete(&format!("bot_balance:{bot_id}")).await?;
        self.store
            .set_remove(&BotConfig::user_index(user_id), bot_id)
            .await?;
        self.store.set_remove(BotConfig::ALL_INDEX, bot_id).await?;
        info!(bot_id, user_id, "bot deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>, user_id: &str, bot_id: &str) -> EngineResult<BotConfig> {
        let mut bot = self.get(user_id, bot_id).await?;
        if !bot.status.can_transition_to(BotStatus::Starting) {
            return Err(EngineError::Validation(format!(
                "cannot start a bot in status {}",
                bot.status
            )));
        }
        if self.running.lock().contains_key(bot_id) {
            return Err(EngineError::Validation("bot is already running".into()));
        }

        bot.status = BotStatus::Starting;
        bot.error_message = None;
        bot.updated_at = Utc::now().to_rfc3339();
        save_bot(self.store.as_ref(), &bot).await?;
        publish_bot_update(self.store.as_ref(), &bot).await;

        match self.spawn_instance(&mut bot).await {
            Ok(()) => {
                if !bot.paper {
                    self.ensure_private_stream(&bot.user_id).await;
                }
                bot.status = BotStatus::Running;
                bot.updated_at = Utc::now().to_rfc3339();
                save_bot(self.store.as_ref(), &bot).await?;
                publish_bot_update(self.store.as_ref(), &bot).await;
                info!(bot_id, user_id, "bot running");
                Ok(bot)
            }
            Err(e) => {
                bot.status = BotStatus::Error;
                bot.error_message = Some(e.to_string());
                bot.updated_at = Utc::now().to_rfc3339();
                save_bot(self.store.as_ref(), &bot).await?;
                publish_bot_update(self.store.as_ref(), &bot).await;
                Err(e)
            }
        }
    }

    /// Build and launch the instance task. The bot must already be persisted
    /// as `starting`; the caller flips it to `running` on success.
    async fn spawn_instance(self: &Arc<Self>, bot: &mut BotConfig) -> EngineResult<()> {
        let balances = self.starting_balances(bot).await?;
        bot.virtual_balances = balances.clone();

        let cancel = self.root_cancel.child_token();
        let bot_id = bot.id.clone();

        let task = match bot.bot_type {
            BotType::MarketMaker => {
                let params = bot
                    .market_maker
                    .clone()
                    .ok_or_else(|| EngineError::Internal("market maker params missing".into()))?;
                let pair = bot
                    .pair
                    .clone()
                    .ok_or_else(|| EngineError::Internal("market maker pair missing".into()))?;
                let info = self.registry.require(&pair)?;

                let instance = MarketMakerInstance::new(
                    bot.clone(),
                    params,
                    info,
                    balances,
                    self.store.clone(),
                    self.submgr.clone(),
                    self.executor_for(bot),
                    self.tracker_for(bot),
                );
                let run_cancel = cancel.clone();
                tokio::spawn(async move { instance.run(run_cancel).await })
            }
            BotType::PumpHunter => {
                let params = bot
                    .pump_hunter
                    .clone()
                    .ok_or_else(|| EngineError::Internal("pump hunter params missing".into()))?;

                let mut instance = PumpHunterInstance::new(
                    bot.clone(),
                    params,
                    balances,
                    self.store.clone(),
                    self.market.clone(),
                    self.registry.clone(),
                    self.executor_for(bot),
                    self.tracker_for(bot),
                    self.tunables,
                );
                instance.recover_positions().await?;
                let run_cancel = cancel.clone();
                tokio::spawn(async move { instance.run(run_cancel).await })
            }
        };

        // Watch the task: whatever way it ends, persist the final status.
        let manager = self.clone();
        let watched_id = bot_id.clone();
        tokio::spawn(async move {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(bot_id = %watched_id, error = %e, "bot task panicked");
                    BotExit {
                        error: Some(format!("bot task crashed: {e}")),
                    }
                }
            };
            manager.finalize(&watched_id, exit).await;
        });

        self.running.lock().insert(bot_id, RunningBot { cancel });
        Ok(())
    }

    /// Persist the terminal status after an instance task ends.
    async fn finalize(&self, bot_id: &str, exit: BotExit) {
        self.running.lock().remove(bot_id);

        let Ok(Some(mut bot)) = load_bot(self.store.as_ref(), bot_id).await else {
            return;
        };
        match exit.error {
            Some(message) => {
                warn!(bot_id, %message, "bot stopped with error");
                bot.status = BotStatus::Error;
                bot.error_message = Some(message);
            }
            None => {
                info!(bot_id, "bot stopped");
                bot.status = BotStatus::Stopped;
            }
        }
        bot.updated_at = Utc::now().to_rfc3339();
        let _ = save_bot(self.store.as_ref(), &bot).await;
        publish_bot_update(self.store.as_ref(), &bot).await;
    }

    pub async fn stop(&self, user_id: &str, bot_id: &str) -> EngineResult<()> {
        // Ownership check before touching the registry.
        let bot = self.get(user_id, bot_id).await?;

        let Some(running) = self.running.lock().remove(bot_id) else {
            return Err(EngineError::Validation(format!(
                "bot is not running (status {})",
                bot.status
            )));
        };
        running.cancel.cancel();
        info!(bot_id, user_id, "bot stop requested");
        Ok(())
    }

    /// Restart bots that were running when the process last died. Their
    /// instances re-register in-flight exchange orders with the monitor so
    /// fills arriving after the restart still drive state transitions.
    pub async fn recover(self: &Arc<Self>) {
        let ids = match self.store.set_members(BotConfig::ALL_INDEX).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "bot recovery scan failed");
                return;
            }
        };

        for id in ids {
            let Ok(Some(bot)) = load_bot(self.store.as_ref(), &id).await else {
                continue;
            };
            if bot.status != BotStatus::Running && bot.status != BotStatus::Starting {
                continue;
            }

            info!(bot_id = %bot.id, user_id = %bot.user_id, "recovering bot after restart");
            // Rewind to stopped so the normal start path applies.
            let mut rewound = bot.clone();
            rewound.status = BotStatus::Stopped;
            if save_bot(self.store.as_ref(), &rewound).await.is_err() {
                continue;
            }
            if let Err(e) = self.start(&bot.user_id, &bot.id).await {
                warn!(bot_id = %bot.id, error = %e, "bot recovery failed");
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Open the user's private order stream if none is running. Events feed
    /// the monitor as low-latency hints; the poller stays the fallback.
    async fn ensure_private_stream(&self, user_id: &str) {
        {
            let streams = self.private_streams.lock();
            if streams.contains_key(user_id) {
                return;
            }
        }

        let creds = match self.vault.decrypt(user_id).await {
            Ok((key, secret)) => Credentials { key, secret },
            Err(e) => {
                warn!(user_id, error = %e, "private stream skipped: no usable credentials");
                return;
            }
        };

        let token = self.root_cancel.child_token();
        self.private_streams
            .lock()
            .insert(user_id.to_string(), token.clone());

        let monitor = self.monitor.clone();
        let client = self.client.clone();
        let url = self.private_ws_url.clone();
        let uid = user_id.to_string();
        tokio::spawn(async move {
            crate::exchange::private_ws::run_private_order_stream(
                url,
                client,
                creds,
                uid,
                Arc::new(move |order| monitor.note_order_update(&order)),
                token,
            )
            .await;
        });
    }

    // -------------------------------------------------------------------------
    // Mode plumbing
    // -------------------------------------------------------------------------

    fn executor_for(&self, bot: &BotConfig) -> Arc<dyn crate::strategy::executor::TradeExecutor> {
        if bot.paper {
            self.paper_exec.clone()
        } else {
            self.live_exec.clone()
        }
    }

    fn tracker_for(&self, bot: &BotConfig) -> Arc<dyn crate::strategy::executor::OrderTracker> {
        if bot.paper {
            self.paper_exec.clone()
        } else {
            self.monitor.clone()
        }
    }

    /// Determine the balances an instance begins with.
    ///
    /// Paper bots reuse persisted balances (resuming a paper run keeps its
    /// state) or seed from the configured initial IDR. Live bots snapshot
    /// the exchange balance, with market-maker IDR capped to the configured
    /// initial so one bot cannot deploy the user's whole account.
    async fn starting_balances(&self, bot: &BotConfig) -> EngineResult<HashMap<String, f64>> {
        let initial_idr = match bot.bot_type {
            BotType::MarketMaker => bot
                .market_maker
                .as_ref()
                .map(|p| p.initial_balance_idr)
                .unwrap_or(0.0),
            BotType::PumpHunter => bot
                .pump_hunter
                .as_ref()
                .map(|p| p.risk.initial_balance_idr)
                .unwrap_or(0.0),
        };

        if bot.paper {
            let persisted: Option<HashMap<String, f64>> =
                store::get_json(self.store.as_ref(), &format!("bot_balance:{}", bot.id)).await?;
            return Ok(persisted.unwrap_or_else(|| HashMap::from([("idr".to_string(), initial_idr)])));
        }

        let (key, secret) = self.vault.decrypt(&bot.user_id).await?;
        let account = self.client.get_info(&Credentials { key, secret }).await?;

        let mut balances = HashMap::new();
        balances.insert(
            "idr".to_string(),
            account.free_of("idr").min(initial_idr),
        );
        if let Some(pair) = &bot.pair {
            let (base, _) = crate::exchange::types::split_pair(pair)?;
            balances.insert(base.clone(), account.free_of(&base));
        }
        Ok(balances)
    }
}

impl std::fmt::Debug for BotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotManager")
            .field("running", &self.running.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::PairInfo;
    use crate::exchange::PublicWs;
    use crate::store::MemoryKv;
    use crate::strategy::pump_hunter::{EntryRules, ExitRules, RiskRules};
    use crate::vault::CredentialVault;

    fn manager() -> Arc<BotManager> {
        let cancel = CancellationToken::new();
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
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

        let market = MarketDataEngine::new(store.clone());
        let ws = PublicWs::new("wss://example.test", "t", cancel.clone());
        let submgr = SubscriptionManager::new(ws);
        let client = Arc::new(IndodaxClient::new("https://example.test", cancel.clone()));
        let vault = Arc::new(CredentialVault::new([0u8; 32], store.clone()));
        let monitor = OrderMonitor::new(client.clone(), vault.clone());
        let live = LiveExecutor::new(client.clone(), vault.clone());
        let paper = PaperExecutor::new(market.clone(), 600, cancel.clone());

        BotManager::new(
            store,
            registry,
            market,
            submgr,
            monitor,
            live,
            paper,
            client,
            vault,
            BotTunables {
                signal_window_secs: 1,
                exit_check_secs: 10,
            },
            "wss://example.test/private".into(),
            cancel,
        )
    }

    fn mm_request() -> BotRequest {
        BotRequest {
            name: "quoter".into(),
            bot_type: BotType::MarketMaker,
            pair: Some("btc_idr".into()),
            paper: true,
            market_maker: Some(MarketMakerParams {
                initial_balance_idr: 10_000_000.0,
                order_size_idr: 100_000.0,
                min_gap_percent: 0.5,
                reposition_threshold_percent: 0.3,
                max_loss_idr: 500_000.0,
            }),
            pump_hunter: None,
        }
    }

    fn hunter_request() -> BotRequest {
        BotRequest {
            name: "hunter".into(),
            bot_type: BotType::PumpHunter,
            pair: None,
            paper: true,
            market_maker: None,
            pump_hunter: Some(PumpHunterParams {
                entry: EntryRules {
                    min_pump_score: 50.0,
                    min_timeframes_positive: 2,
                    min_24h_volume_idr: 1e9,
                    min_price_idr: 50.0,
                    excluded_pairs: vec![],
                    allowed_pairs: vec![],
                },
                exit: ExitRules {
                    target_profit_percent: 10.0,
                    stop_loss_percent: 5.0,
                    trailing_stop_enabled: false,
                    trailing_stop_percent: 0.0,
                    max_hold_minutes: 60,
                    pump_score_drop_enabled: false,
                    pump_score_drop_threshold: 0.0,
                },
                risk: RiskRules {
                    max_concurrent_positions: 2,
                    max_position_idr: 1_000_000.0,
                    min_balance_reserve_idr: 100_000.0,
                    daily_loss_limit_idr: 500_000.0,
                    cooldown_after_loss_minutes: 0,
                    initial_balance_idr: 10_000_000.0,
                },
            }),
        }
    }

    #[tokio::test]
    async fn create_normalizes_pair_and_validates_params() {
        let mgr = manager();
        let bot = mgr.create("u1", mm_request()).await.unwrap();
        assert_eq!(bot.pair.as_deref(), Some("btcidr"));
        assert_eq!(bot.status, BotStatus::Stopped);

        let mut missing_pair = mm_request();
        missing_pair.pair = None;
        assert!(matches!(
            mgr.create("u1", missing_pair).await,
            Err(EngineError::Validation(_))
        ));

        let mut missing_params = mm_request();
        missing_params.market_maker = None;
        assert!(matches!(
            mgr.create("u1", missing_params).await,
            Err(EngineError::Validation(_))
        ));

        let mut unknown_pair = mm_request();
        unknown_pair.pair = Some("zzz_idr".into());
        assert!(matches!(
            mgr.create("u1", unknown_pair).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_scoped_per_user() {
        let mgr = manager();
        mgr.create("u1", mm_request()).await.unwrap();
        mgr.create("u1", hunter_request()).await.unwrap();
        mgr.create("u2", mm_request()).await.unwrap();

        assert_eq!(mgr.list("u1").await.unwrap().len(), 2);
        assert_eq!(mgr.list("u2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_stop_paper_market_maker_lifecycle() {
        let mgr = manager();
        let bot = mgr.create("u1", mm_request()).await.unwrap();

        let started = mgr.start("u1", &bot.id).await.unwrap();
        assert_eq!(started.status, BotStatus::Running);
        assert_eq!(mgr.running_count(), 1);
        assert!((started.virtual_balances["idr"] - 10_000_000.0).abs() < 1e-9);

        // Double-start is rejected.
        assert!(matches!(
            mgr.start("u1", &bot.id).await,
            Err(EngineError::Validation(_))
        ));

        mgr.stop("u1", &bot.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let stopped = mgr.get("u1", &bot.id).await.unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
        assert_eq!(mgr.running_count(), 0);
    }

    #[tokio::test]
    async fn start_stop_paper_pump_hunter_lifecycle() {
        let mgr = manager();
        let bot = mgr.create("u1", hunter_request()).await.unwrap();

        let started = mgr.start("u1", &bot.id).await.unwrap();
        assert_eq!(started.status, BotStatus::Running);

        mgr.stop("u1", &bot.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(
            mgr.get("u1", &bot.id).await.unwrap().status,
            BotStatus::Stopped
        );
    }

    #[tokio::test]
    async fn delete_and_update_require_a_stopped_bot() {
        let mgr = manager();
        let bot = mgr.create("u1", mm_request()).await.unwrap();
        mgr.start("u1", &bot.id).await.unwrap();

        assert!(matches!(
            mgr.delete("u1", &bot.id).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            mgr.update("u1", &bot.id, mm_request()).await,
            Err(EngineError::Validation(_))
        ));

        mgr.stop("u1", &bot.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut renamed = mm_request();
        renamed.name = "quoter-2".into();
        let updated = mgr.update("u1", &bot.id, renamed).await.unwrap();
        assert_eq!(updated.name, "quoter-2");

        mgr.delete("u1", &bot.id).await.unwrap();
        assert!(mgr.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopping_a_stopped_bot_is_an_error() {
        let mgr = manager();
        let bot = mgr.create("u1", mm_request()).await.unwrap();
        assert!(matches!(
            mgr.stop("u1", &bot.id).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn other_users_cannot_touch_the_bot() {
        let mgr = manager();
        let bot = mgr.create("u1", mm_request()).await.unwrap();
        assert!(matches!(
            mgr.get("u2", &bot.id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            mgr.start("u2", &bot.id).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
