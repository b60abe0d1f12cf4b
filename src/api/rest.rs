// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Liveness endpoints are public; every
// other route requires a bearer session token resolved by the `AuthUser`
// extractor. Responses follow one envelope:
//
//   success: { "success": true,  "data": ... }
//   failure: { "success": false, "error": { "code", "message" } }
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthUser;
use crate::app_state::AppState;
use crate::error::EngineError;
use crate::exchange::client::Credentials;
use crate::exchange::types::normalize_pair;
use crate::strategy::bots::BotRequest;
use crate::strategy::copilot::CopilotRequest;
use crate::strategy::pump_hunter::load_position;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.cors_allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // ── Liveness ────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        .route("/api/v1/ping", get(ping))
        // ── Market ──────────────────────────────────────────────────
        .route("/api/v1/market/summary", get(market_summary))
        .route("/api/v1/market/pump-scores", get(market_pump_scores))
        .route("/api/v1/market/gaps", get(market_gaps))
        .route("/api/v1/market/sync", post(market_sync))
        .route("/api/v1/market/:pair", get(market_pair))
        .route("/api/v1/market/:pair/depth", get(market_depth))
        // ── API keys ────────────────────────────────────────────────
        .route("/api/v1/api-keys", post(api_key_submit))
        .route("/api/v1/api-keys", get(api_key_get))
        .route("/api/v1/api-keys", delete(api_key_delete))
        .route("/api/v1/api-keys/validate", post(api_key_validate))
        .route("/api/v1/api-keys/account-info", get(api_key_account_info))
        // ── Copilot ─────────────────────────────────────────────────
        .route("/api/v1/copilot/trade", post(copilot_submit))
        .route("/api/v1/copilot/trades", get(copilot_list))
        .route("/api/v1/copilot/trades/:id", get(copilot_get))
        .route("/api/v1/copilot/trades/:id", delete(copilot_delete))
        .route("/api/v1/copilot/trades/:id/cancel", post(copilot_cancel))
        .route("/api/v1/copilot/trades/:id/sell", post(copilot_sell_now))
        // ── Bots ────────────────────────────────────────────────────
        .route("/api/v1/bots", post(bot_create))
        .route("/api/v1/bots", get(bot_list))
        .route("/api/v1/bots/:id", get(bot_get))
        .route("/api/v1/bots/:id", put(bot_update))
        .route("/api/v1/bots/:id", delete(bot_delete))
        .route("/api/v1/bots/:id/start", post(bot_start))
        .route("/api/v1/bots/:id/stop", post(bot_stop))
        .route("/api/v1/bots/:id/summary", get(bot_summary))
        .route("/api/v1/bots/:id/positions", get(bot_positions))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Success envelope.
fn ok<T: serde::Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({"success": true, "data": data}))
}

// =============================================================================
// Liveness
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "pairs": state.market.pair_count(),
        "running_bots": state.bots.running_count(),
        "tracked_orders": state.monitor.tracked_count(),
        "stop_watches": state.stoploss.watch_count(),
    }))
}

async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({
        "pong": true,
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Market
// =============================================================================

#[derive(Deserialize)]
struct RankQuery {
    #[serde(default)]
    limit: Option<usize>,
    /// Minimum 24h IDR volume for gap ranking (the stored gap field is
    /// already 0 for illiquid pairs; this filters the ranking itself).
    #[serde(default)]
    min_volume: Option<f64>,
}

async fn market_summary(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mut coins = state.market.all_coins();
    coins.sort_by(|a, b| {
        b.volume_idr
            .partial_cmp(&a.volume_idr)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ok(coins)
}

async fn market_pump_scores(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RankQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let ranked = state
        .store
        .zset_range_desc("market:sorted:pump_score", limit)
        .await?;
    let data: Vec<_> = ranked
        .into_iter()
        .map(|(pair, score)| serde_json::json!({"pair": pair, "pump_score": score}))
        .collect();
    Ok(ok(data))
}

/// Default ranking floor for gap queries — far below the gap-suppression
/// volume so moderately liquid pairs still rank.
const DEFAULT_GAP_MIN_VOLUME: f64 = 1e8;

async fn market_gaps(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RankQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let min_volume = query.min_volume.unwrap_or(DEFAULT_GAP_MIN_VOLUME);

    let ranked = state
        .store
        .zset_range_desc("market:sorted:gap_percentage", limit * 4)
        .await?;

    let mut data = Vec::new();
    for (pair, gap) in ranked {
        if gap <= 0.0 {
            continue;
        }
        let volume = state
            .store
            .zset_score("market:sorted:volume_idr", &pair)
            .await?
            .unwrap_or(0.0);
        if volume < min_volume {
            continue;
        }
        data.push(serde_json::json!({
            "pair": pair,
            "gap_percentage": gap,
            "volume_idr": volume,
        }));
        if data.len() >= limit {
            break;
        }
    }
    Ok(ok(data))
}

async fn market_pair(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let pair = normalize_pair(&pair);
    if let Some(coin) = state.market.get_coin(&pair) {
        return Ok(ok(coin));
    }
    // Not seen on the stream yet; fall back to a live ticker fetch.
    let ticker = state.client.get_ticker(&pair).await?;
    Ok(ok(ticker))
}

async fn market_depth(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let pair = normalize_pair(&pair);
    let best = state.client.get_depth(&pair).await?;
    Ok(ok(best))
}

async fn market_sync(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let count = state.registry.sync(&state.client).await?;
    info!(pairs = count, "manual metadata sync");
    Ok(ok(serde_json::json!({"pairs": count})))
}

// =============================================================================
// API keys
// =============================================================================

#[derive(Deserialize)]
struct ApiKeyRequest {
    api_key: String,
    api_secret: String,
}

async fn api_key_submit(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiKeyRequest>,
) -> Result<impl IntoResponse, EngineError> {
    // Validate on submit: the key must work before it is stored.
    let creds = Credentials {
        key: req.api_key.clone(),
        secret: req.api_secret.clone(),
    };
    state.client.get_info(&creds).await?;

    state
        .vault
        .store_credentials(&user_id, &req.api_key, &req.api_secret, true)
        .await?;
    let meta = state.vault.meta(&user_id).await?;
    Ok(ok(meta))
}

async fn api_key_get(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let meta = state.vault.meta(&user_id).await?;
    Ok(ok(meta))
}

async fn api_key_delete(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    state.vault.delete(&user_id).await?;
    Ok(ok(serde_json::json!({"deleted": true})))
}

async fn api_key_validate(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let (key, secret) = state.vault.decrypt(&user_id).await?;
    let valid = state
        .client
        .get_info(&Credentials { key, secret })
        .await
        .is_ok();
    state.vault.set_valid(&user_id, valid).await?;
    Ok(ok(serde_json::json!({"valid": valid})))
}

async fn api_key_account_info(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let (key, secret) = state.vault.decrypt(&user_id).await?;
    let balances = state.client.get_info(&Credentials { key, secret }).await?;
    Ok(ok(balances))
}

// =============================================================================
// Copilot
// =============================================================================

async fn copilot_submit(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CopilotRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let trade = state.copilot.submit(&user_id, req).await?;
    Ok(ok(trade))
}

async fn copilot_list(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let trades = state.copilot.list(&user_id).await?;
    Ok(ok(trades))
}

async fn copilot_get(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let trade = state.copilot.get(&user_id, &id).await?;
    Ok(ok(trade))
}

async fn copilot_delete(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    state.copilot.delete(&user_id, &id).await?;
    Ok(ok(serde_json::json!({"deleted": true})))
}

async fn copilot_cancel(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let trade = state.copilot.cancel(&user_id, &id).await?;
    Ok(ok(trade))
}

async fn copilot_sell_now(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let trade = state.copilot.sell_now(&user_id, &id).await?;
    Ok(ok(trade))
}

// =============================================================================
// Bots
// =============================================================================

async fn bot_create(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BotRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let bot = state.bots.create(&user_id, req).await?;
    Ok(ok(bot))
}

async fn bot_list(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let bots = state.bots.list(&user_id).await?;
    Ok(ok(bots))
}

async fn bot_get(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let bot = state.bots.get(&user_id, &id).await?;
    Ok(ok(bot))
}

async fn bot_update(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<BotRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let bot = state.bots.update(&user_id, &id, req).await?;
    Ok(ok(bot))
}

async fn bot_delete(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    state.bots.delete(&user_id, &id).await?;
    Ok(ok(serde_json::json!({"deleted": true})))
}

async fn bot_start(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let bot = state.bots.start(&user_id, &id).await?;
    Ok(ok(bot))
}

async fn bot_stop(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    state.bots.stop(&user_id, &id).await?;
    Ok(ok(serde_json::json!({"stopping": true})))
}

async fn bot_summary(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let bot = state.bots.get(&user_id, &id).await?;
    let win_rate = if bot.stats.total_trades > 0 {
        bot.stats.winning_trades as f64 / bot.stats.total_trades as f64 * 100.0
    } else {
        0.0
    };
    Ok(ok(serde_json::json!({
        "bot": bot,
        "win_rate": win_rate,
    })))
}

async fn bot_positions(
    AuthUser(user_id): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    // Ownership check first.
    let bot = state.bots.get(&user_id, &id).await?;

    let ids = state
        .store
        .set_members(&format!("bot_positions:{}", bot.id))
        .await?;
    let mut positions = Vec::with_capacity(ids.len());
    for pos_id in ids {
        if let Some(pos) = load_position(state.store.as_ref(), &pos_id).await? {
            positions.push(pos);
        }
    }
    positions.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
    Ok(ok(positions))
}

// =============================================================================
// Helpers
// =============================================================================

/// Keep `EngineResult` usable directly as a handler return type.
impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

