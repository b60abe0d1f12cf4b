// =============================================================================
// Public WebSocket — summary-24h and per-pair order-book channels
// =============================================================================
//
// One connection serves every subscriber in the process. The connection task
// owns the socket; subscribe/unsubscribe intents travel over a command
// channel so they work whether or not the socket is currently up. On
// reconnect every channel present in the handler registry is resubscribed.
//
// Backoff: 1s doubling to a 60s cap, reset after a successful connect.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Non-blocking callback invoked with the `data` payload of each push on a
/// subscribed channel.
pub type ChannelHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Handle returned by [`PublicWs::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    pub channel: String,
    pub id: u64,
}

enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// The public market-data channel names.
pub fn summary_channel() -> String {
    "market:summary-24h".to_string()
}

pub fn order_book_channel(pair: &str) -> String {
    format!("market:order-book-{pair}")
}

pub struct PublicWs {
    url: String,
    token: String,
    handlers: Arc<RwLock<HashMap<String, Vec<(u64, ChannelHandler)>>>>,
    next_id: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    cmd_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<WsCommand>>>,
    cancel: CancellationToken,
}

impl PublicWs {
    pub fn new(url: impl Into<String>, token: impl Into<String>, cancel: CancellationToken) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url: url.into(),
            token: token.into(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            cmd_tx,
            cmd_rx: parking_lot::Mutex::new(Some(cmd_rx)),
            cancel,
        })
    }

    /// Spawn the connection task. Call once.
    pub fn start(self: &Arc<Self>) {
        let ws = self.clone();
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .expect("PublicWs::start called twice");
        tokio::spawn(async move {
            ws.run(&mut cmd_rx).await;
        });
    }

    // -------------------------------------------------------------------------
    // Subscription registry
    // -------------------------------------------------------------------------

    /// Register a handler for `channel`. The first handler for a channel
    /// triggers a WS subscribe.
    pub fn subscribe(&self, channel: &str, handler: ChannelHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let is_first = {
            let mut handlers = self.handlers.write();
            let entry = handlers.entry(channel.to_string()).or_default();
            entry.push((id, handler));
            entry.len() == 1
        };

        if is_first {
            let _ = self.cmd_tx.send(WsCommand::Subscribe(channel.to_string()));
        }
        debug!(channel, id, is_first, "ws handler registered");
        SubscriptionId {
            channel: channel.to_string(),
            id,
        }
    }

    /// Remove a handler. The last handler for a channel triggers a WS
    /// unsubscribe.
    pub fn unsubscribe(&self, sub: &SubscriptionId) {
        let is_last = {
            let mut handlers = self.handlers.write();
            if let Some(entry) = handlers.get_mut(&sub.channel) {
                entry.retain(|(id, _)| *id != sub.id);
                if entry.is_empty() {
                    handlers.remove(&sub.channel);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if is_last {
            let _ = self
                .cmd_tx
                .send(WsCommand::Unsubscribe(sub.channel.clone()));
        }
        debug!(channel = %sub.channel, id = sub.id, is_last, "ws handler removed");
    }

    /// Number of handlers registered for a channel.
    pub fn handler_count(&self, channel: &str) -> usize {
        self.handlers.read().get(channel).map_or(0, Vec::len)
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    async fn run(&self, cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>) {
        let mut backoff_secs = 1u64;

        loop {
            if self.cancel.is_cancelled() {
                info!("public ws shutting down");
                return;
            }

            match self.run_connection(cmd_rx).await {
                Ok(()) => {
                    // Clean shutdown requested.
                    return;
                }
                Err(e) => {
                    error!(error = %e, backoff_secs, "public ws disconnected — reconnecting");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(60);
        }
    }

    /// One connection lifetime: connect, authenticate, resubscribe, then
    /// pump commands and messages until the socket dies.
    async fn run_connection(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    ) -> anyhow::Result<()> {
        info!(url = %self.url, "connecting to public ws");
        let (stream, _response) = connect_async(&self.url).await?;
        let (mut write, mut read) = stream.split();

        // Authenticate the connection.
        let auth = serde_json::json!({"params": {"token": self.token}, "id": 1});
        write.send(Message::Text(auth.to_string())).await?;

        // Reissue all active subscriptions.
        let channels: Vec<String> = self.handlers.read().keys().cloned().collect();
        let mut frame_id = 2u64;
        for channel in &channels {
            write
                .send(Message::Text(subscribe_frame(channel, frame_id)))
                .await?;
            frame_id += 1;
        }
        info!(resubscribed = channels.len(), "public ws connected");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Subscribe(channel)) => {
                            write.send(Message::Text(subscribe_frame(&channel, frame_id))).await?;
                            frame_id += 1;
                        }
                        Some(WsCommand::Unsubscribe(channel)) => {
                            write.send(Message::Text(unsubscribe_frame(&channel, frame_id))).await?;
                            frame_id += 1;
                        }
                        None => return Ok(()),
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            anyhow::bail!("server closed the connection");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("stream ended"),
                    }
                }
            }
        }
    }

    /// Parse a push frame and invoke every handler subscribed to its
    /// channel. Handlers must not block: they run on the reader task.
    fn dispatch(&self, text: &str) {
        let Some((channel, data)) = parse_push(text) else {
            return;
        };

        let handlers = self.handlers.read();
        if let Some(entries) = handlers.get(&channel) {
            for (_, handler) in entries {
                handler(&data);
            }
        } else {
            debug!(%channel, "push for channel with no handlers");
        }
    }
}

/// Extract `(channel, data)` from a push frame. Frames that are not pushes
/// (auth acks, subscribe acks, errors) yield `None`.
pub fn parse_push(text: &str) -> Option<(String, serde_json::Value)> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable ws frame");
            return None;
        }
    };

    let result = root.get("result")?;
    let channel = result.get("channel")?.as_str()?.to_string();
    let data = result
        .get("data")
        .map(|d| d.get("data").cloned().unwrap_or_else(|| d.clone()))?;
    Some((channel, data))
}

fn subscribe_frame(channel: &str, id: u64) -> String {
    serde_json::json!({"method": 1, "params": {"channel": channel}, "id": id}).to_string()
}

fn unsubscribe_frame(channel: &str, id: u64) -> String {
    serde_json::json!({"method": 2, "params": {"channel": channel}, "id": id}).to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_push_unwraps_nested_data() {
        let text = r#"{
            "result": {
                "channel": "market:summary-24h",
                "data": {"data": [["btc_idr", 0, "650000000"]]}
            }
        }"#;
        let (channel, data) = parse_push(text).expect("should parse");
        assert_eq!(channel, "market:summary-24h");
        assert!(data.is_array());
    }

    #[test]
    fn parse_push_ignores_acks() {
        assert!(parse_push(r#"{"id": 1, "result": {}}"#).is_none());
        assert!(parse_push(r#"{"error": {"code": 109}}"#).is_none());
        assert!(parse_push("not json").is_none());
    }

    #[test]
    fn subscribe_refcounting_sends_one_subscribe() {
        let ws = PublicWs::new("wss://example.test", "tok", CancellationToken::new());
        let noop: ChannelHandler = Arc::new(|_| {});

        let a = ws.subscribe("market:order-book-btcidr", noop.clone());
        let b = ws.subscribe("market:order-book-btcidr", noop.clone());
        assert_eq!(ws.handler_count("market:order-book-btcidr"), 2);

        ws.unsubscribe(&a);
        assert_eq!(ws.handler_count("market:order-book-btcidr"), 1);
        ws.unsubscribe(&b);
        assert_eq!(ws.handler_count("market:order-book-btcidr"), 0);

        // Double unsubscribe is harmless.
        ws.unsubscribe(&b);
        assert_eq!(ws.handler_count("market:order-book-btcidr"), 0);
    }

    #[test]
    fn dispatch_invokes_all_handlers() {
        let ws = PublicWs::new("wss://example.test", "tok", CancellationToken::new());
        let hits = Arc::new(std::sync::atomic::AtomicU64::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            ws.subscribe(
                "market:summary-24h",
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        ws.dispatch(
            r#"{"result": {"channel": "market:summary-24h", "data": {"data": []}}}"#,
        );
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn channel_names() {
        assert_eq!(summary_channel(), "market:summary-24h");
        assert_eq!(order_book_channel("btcidr"), "market:order-book-btcidr");
    }
}
