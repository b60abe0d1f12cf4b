// =============================================================================
// Tuyul Engine — Main Entry Point
// =============================================================================
//
// Composition root: load configuration, connect the store, build the
// services, spawn the background tasks, serve the API, and shut everything
// down through one cancellation token.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod exchange;
mod hub;
mod market;
mod orders;
mod store;
mod strategy;
mod types;
mod vault;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::exchange::{IndodaxClient, PublicWs};
use crate::hub::RealtimeHub;
use crate::market::{MarketDataEngine, PairRegistry, SubscriptionManager};
use crate::orders::OrderMonitor;
use crate::store::{KvStore, RedisKv};
use crate::strategy::bots::{BotManager, BotTunables};
use crate::strategy::executor::{LiveExecutor, PaperExecutor};
use crate::strategy::stoploss::StopTrigger;
use crate::strategy::{CopilotService, StopLossMonitor};
use crate::vault::CredentialVault;

/// Grace period for background tasks after the cancel broadcast.
const SHUTDOWN_GRACE_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config = Config::from_env()?;
    init_tracing(&config);

    info!(env = %config.server_env, "tuyul engine starting");

    let cancel = CancellationToken::new();

    // ── 2. KV store (fatal if unreachable) ───────────────────────────────
    let store: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect(&config.redis_url(), &config.key_prefix)
            .await
            .map_err(|e| anyhow::anyhow!("kv store unreachable: {e}"))?,
    );
    info!("kv store connected");

    // ── 3. Exchange client & credential vault ────────────────────────────
    let client = Arc::new(IndodaxClient::new(
        config.exchange_api_url.clone(),
        cancel.clone(),
    ));
    let vault = Arc::new(CredentialVault::new(config.encryption_key, store.clone()));

    // ── 4. Pair metadata: cache first, exchange as fallback ──────────────
    let registry = Arc::new(PairRegistry::new(store.clone()));
    let _ = registry.load_cached().await;
    if registry.is_empty() {
        if let Err(e) = registry.sync(&client).await {
            warn!(error = %e, "startup metadata sync failed — /market/sync can retry");
        }
    }
    info!(pairs = registry.len(), "pair metadata ready");

    // ── 5. Market data engine + public stream ────────────────────────────
    let market = MarketDataEngine::new(store.clone());
    market.start(cancel.clone());

    let public_ws = PublicWs::new(
        config.exchange_ws_url.clone(),
        config.exchange_ws_token.clone(),
        cancel.clone(),
    );
    public_ws.start();

    {
        let engine = market.clone();
        public_ws.subscribe(
            &exchange::public_ws::summary_channel(),
            Arc::new(move |data| {
                engine.ingest_summary_rows(data, chrono::Utc::now().timestamp());
            }),
        );
    }

    let submgr = SubscriptionManager::new(public_ws.clone());

    tokio::spawn(
        market
            .clone()
            .run_timeframe_manager(config.timeframe_sweep_secs, cancel.clone()),
    );
    tokio::spawn(market.clone().run_gap_poller(
        client.clone(),
        config.gap_poll_secs,
        cancel.clone(),
    ));

    // ── 6. Order monitor ─────────────────────────────────────────────────
    let monitor = OrderMonitor::new(client.clone(), vault.clone());
    tokio::spawn(monitor.clone().run(config.order_poll_secs, cancel.clone()));

    // ── 7. Executors & strategies ────────────────────────────────────────
    let live_exec = LiveExecutor::new(client.clone(), vault.clone());
    let paper_exec = PaperExecutor::new(market.clone(), config.paper_fill_secs, cancel.clone());

    let stoploss = StopLossMonitor::new(market.clone());
    let copilot = CopilotService::new(
        store.clone(),
        market.clone(),
        registry.clone(),
        client.clone(),
        vault.clone(),
        live_exec.clone(),
        monitor.clone(),
        paper_exec.clone(),
        paper_exec.clone(),
        stoploss.clone(),
    );
    tokio::spawn(
        stoploss
            .clone()
            .run(copilot.clone() as Arc<dyn StopTrigger>, cancel.clone()),
    );

    let bots = BotManager::new(
        store.clone(),
        registry.clone(),
        market.clone(),
        submgr.clone(),
        monitor.clone(),
        live_exec,
        paper_exec,
        client.clone(),
        vault.clone(),
        BotTunables {
            signal_window_secs: config.signal_window_secs,
            exit_check_secs: config.exit_check_secs,
        },
        config.exchange_private_ws_url.clone(),
        cancel.clone(),
    );
    bots.recover().await;

    // ── 8. Realtime hub ──────────────────────────────────────────────────
    let hub = RealtimeHub::new(store.clone());
    tokio::spawn(hub.clone().run(cancel.clone()));

    // ── 9. HTTP server ───────────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        client,
        vault,
        registry,
        market,
        submgr,
        monitor,
        stoploss,
        copilot,
        bots,
        hub,
        start_time: std::time::Instant::now(),
    });

    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr())
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {e}", config.bind_addr()))?;
    info!(addr = %config.bind_addr(), "api server listening");

    let server_cancel = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_cancel.cancelled().await;
    });
    let server_handle = tokio::spawn(async move { server.await });

    info!("all subsystems running");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining");
    cancel.cancel();

    let drain = tokio::time::timeout(
        std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS),
        server_handle,
    )
    .await;
    if drain.is_err() {
        error!("drain window elapsed — aborting remaining tasks");
    }

    info!("tuyul engine shut down");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
