// =============================================================================
// Realtime Hub — per-user fan-out of engine events
// =============================================================================
//
// Browser sessions register here after authenticating on the WebSocket. The
// hub subscribes to the engine's pub/sub channels and forwards:
//   - user-scoped events (bot / trade / position / pump-signal) to every
//     session of that user;
//   - market updates to sessions that opted into the market feed.
//
// Outbound writes never block: each session has a bounded queue, and a
// session that cannot keep up is dropped.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::KvStore;

/// Depth of each session's outbound queue.
const SESSION_BUFFER: usize = 128;

/// Channels the hub listens on.
const SUBSCRIBED_CHANNELS: [&str; 5] = [
    "market.update",
    "market.pump_signal",
    "bot.update",
    "trade.*",
    "position.*",
];

/// Opt-in topic for the full market feed.
pub const TOPIC_MARKET: &str = "market";

struct Session {
    id: u64,
    user_id: String,
    tx: mpsc::Sender<String>,
    topics: HashSet<String>,
}

pub struct RealtimeHub {
    store: Arc<dyn KvStore>,
    sessions: RwLock<Vec<Session>>,
    next_id: AtomicU64,
}

impl RealtimeHub {
    pub fn new(store: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    // -------------------------------------------------------------------------
    // Session registry
    // -------------------------------------------------------------------------

    /// Register an authenticated session; returns its id and the outbound
    /// message stream.
    pub fn register(&self, user_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().push(Session {
            id,
            user_id: user_id.to_string(),
            tx,
            topics: HashSet::new(),
        });
        info!(user_id, session_id = id, "hub session registered");
        (id, rx)
    }

    pub fn unregister(&self, session_id: u64) {
        self.sessions.write().retain(|s| s.id != session_id);
        debug!(session_id, "hub session removed");
    }

    pub fn subscribe_topic(&self, session_id: u64, topic: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.topics.insert(topic.to_string());
        }
    }

    pub fn unsubscribe_topic(&self, session_id: u64, topic: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.topics.remove(topic);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Route one pub/sub message to the right sessions. Slow or dead
    /// sessions are dropped on the spot.
    fn route(&self, channel: &str, payload: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel, error = %e, "unparseable event payload");
                return;
            }
        };
        let target_user = parsed.get("user_id").and_then(|v| v.as_str()).map(String::from);

        let mut outbound: Vec<(String, String)> = Vec::new();
        match channel {
            "market.update" => {
                outbound.push((TOPIC_MARKET.to_string(), envelope("market_update", &parsed)));
            }
            "market.pump_signal" => {
                outbound.push((String::new(), envelope("pump_signal", &parsed)));
            }
            "bot.update" => {
                outbound.push((String::new(), envelope("bot_update", &parsed)));
                // Bot updates carry balances; surface them as their own
                // event for the dashboard's balance widgets.
                if let Some(balances) = parsed.pointer("/bot/virtual_balances") {
                    let body = serde_json::json!({
                        "user_id": target_user,
                        "bot_id": parsed.pointer("/bot/id"),
                        "balances": balances,
                    });
                    outbound.push((String::new(), envelope("balance_update", &body)));
                }
            }
            ch if ch.starts_with("trade.") || ch.starts_with("position.") => {
                outbound.push((String::new(), envelope("order_update", &parsed)));
            }
            other => {
                debug!(channel = other, "event on unmapped channel ignored");
                return;
            }
        }

        let mut dropped = Vec::new();
        {
            let sessions = self.sessions.read();
            for session in sessions.iter() {
                for (topic, message) in &outbound {
                    let wanted = if topic.is_empty() {
                        // User-scoped event.
                        target_user.as_deref() == Some(session.user_id.as_str())
                    } else {
                        session.topics.contains(topic)
                    };
                    if !wanted {
                        continue;
                    }
                    if session.tx.try_send(message.clone()).is_err() {
                        dropped.push(session.id);
                        break;
                    }
                }
            }
        }

        for id in dropped {
            warn!(session_id = id, "slow client dropped");
            self.unregister(id);
        }
    }

    /// Consume the store's pub/sub feed until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let patterns: Vec<String> = SUBSCRIBED_CHANNELS.iter().map(|s| s.to_string()).collect();
        let mut rx = match self.store.subscribe(&patterns).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "hub subscription failed — realtime feed disabled");
                return;
            }
        };
        info!("realtime hub started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("realtime hub shutting down");
                    return;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.route(&msg.channel, &msg.payload),
                        None => {
                            warn!("hub pub/sub stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// The `{type, payload}` wire envelope for UI sessions.
fn envelope(event_type: &str, payload: &serde_json::Value) -> String {
    serde_json::json!({"type": event_type, "payload": payload}).to_string()
}

impl std::fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("sessions", &self.sessions.read().len())
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

    fn hub() -> Arc<RealtimeHub> {
        RealtimeHub::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn user_events_reach_only_their_user() {
        let hub = hub();
        let (_id1, mut rx1) = hub.register("u1");
        let (_id2, mut rx2) = hub.register("u2");

        hub.route("bot.update", r#"{"user_id": "u1", "bot": {"id": "b1"}}"#);

        let msg = rx1.try_recv().expect("u1 should receive");
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "bot_update");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn market_updates_require_topic_subscription() {
        let hub = hub();
        let (id1, mut rx1) = hub.register("u1");
        let (_id2, mut rx2) = hub.register("u2");

        hub.subscribe_topic(id1, TOPIC_MARKET);
        hub.route("market.update", r#"{"pair": "btcidr", "price": 1.0}"#);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        hub.unsubscribe_topic(id1, TOPIC_MARKET);
        hub.route("market.update", r#"{"pair": "btcidr", "price": 2.0}"#);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn bot_update_also_emits_balance_update() {
        let hub = hub();
        let (_id, mut rx) = hub.register("u1");

        hub.route(
            "bot.update",
            r#"{"user_id": "u1", "bot": {"id": "b1", "virtual_balances": {"idr": 5.0}}}"#,
        );

        let first: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "bot_update");
        assert_eq!(second["type"], "balance_update");
        assert_eq!(second["payload"]["balances"]["idr"], 5.0);
    }

    #[tokio::test]
    async fn trade_and_position_channels_map_to_order_update() {
        let hub = hub();
        let (_id, mut rx) = hub.register("u1");

        hub.route("trade.update", r#"{"user_id": "u1", "trade": {}}"#);
        hub.route("position.update", r#"{"user_id": "u1", "position": {}}"#);

        for _ in 0..2 {
            let msg: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(msg["type"], "order_update");
        }
    }

    #[tokio::test]
    async fn slow_sessions_are_dropped() {
        let hub = hub();
        let (id, _rx) = hub.register("u1");
        // _rx kept alive but never drained; flood past the buffer.
        for i in 0..(SESSION_BUFFER + 10) {
            hub.route(
                "bot.update",
                &format!(r#"{{"user_id": "u1", "bot": {{"n": {i}}}}}"#),
            );
        }
        assert_eq!(hub.session_count(), 0);
        let _ = id;
    }

    #[tokio::test]
    async fn disconnect_unregisters() {
        let hub = hub();
        let (id, rx) = hub.register("u1");
        assert_eq!(hub.session_count(), 1);
        drop(rx);
        hub.unregister(id);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn end_to_end_through_store_pubsub() {
        let store = Arc::new(MemoryKv::new());
        let hub = RealtimeHub::new(store.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(hub.clone().run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (_id, mut rx) = hub.register("u1");
        store
            .publish("trade.update", r#"{"user_id": "u1", "trade": {"id": "t"}}"#)
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out")
            .expect("message");
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "order_update");
        cancel.cancel();
    }
}
