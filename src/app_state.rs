// =============================================================================
// Central Application State — Tuyul Trading Engine
// =============================================================================
//
// The long-lived services, wired once in main and shared with every HTTP
// handler via `Arc<AppState>`. Each service manages its own interior
// mutability; this struct only ties them together.
// =============================================================================

use std::sync::Arc;

use crate::config::Config;
use crate::exchange::IndodaxClient;
use crate::hub::RealtimeHub;
use crate::market::{MarketDataEngine, PairRegistry, SubscriptionManager};
use crate::orders::OrderMonitor;
use crate::store::KvStore;
use crate::strategy::{BotManager, CopilotService, StopLossMonitor};
use crate::vault::CredentialVault;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub client: Arc<IndodaxClient>,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<PairRegistry>,
    pub market: Arc<MarketDataEngine>,
    pub submgr: Arc<SubscriptionManager>,
    pub monitor: Arc<OrderMonitor>,
    pub stoploss: Arc<StopLossMonitor>,
    pub copilot: Arc<CopilotService>,
    pub bots: Arc<BotManager>,
    pub hub: Arc<RealtimeHub>,
    /// Engine start instant, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("pairs", &self.market.pair_count())
            .field("subscribed_pairs", &self.submgr.active_pair_count())
            .field("running_bots", &self.bots.running_count())
            .field("hub_sessions", &self.hub.session_count())
            .finish()
    }
}
