// =============================================================================
// Private WebSocket — per-user order channel
// =============================================================================
//
// One connection per active user. The connection authenticates with a
// short-lived token fetched over signed REST, subscribes the `order`
// channel, and forwards every order event to the supplied callback (the
// order monitor uses these as low-latency hints; its poller remains the
// reliability fallback).
//
// A credential failure fetching the token is fatal for the stream: the key
// is unusable and retrying would only repeat the rejection.
// =============================================================================

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::exchange::client::{Credentials, IndodaxClient};
use crate::exchange::public_ws::parse_push;
use crate::exchange::types::{normalize_pair, ExchangeOrder};

/// Callback invoked with each normalized order event. Must not block.
pub type OrderEventHandler = Arc<dyn Fn(ExchangeOrder) + Send + Sync>;

/// Run the private order stream for one user until cancelled or the
/// credentials turn out to be invalid. Reconnects with 1→60s backoff.
pub async fn run_private_order_stream(
    ws_url: String,
    client: Arc<IndodaxClient>,
    creds: Credentials,
    user_id: String,
    on_order: OrderEventHandler,
    cancel: CancellationToken,
) {
    let mut backoff_secs = 1u64;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let token = match client.generate_private_ws_token(&creds).await {
            Ok(token) => token,
            Err(EngineError::Credential(msg)) => {
                error!(%user_id, %msg, "private ws token rejected — stopping stream");
                return;
            }
            Err(e) => {
                warn!(%user_id, error = %e, backoff_secs, "private ws token fetch failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(60);
                continue;
            }
        };

        match run_connection(&ws_url, &token, &user_id, &on_order, &cancel).await {
            Ok(()) => return,
            Err(e) => {
                warn!(%user_id, error = %e, backoff_secs, "private ws disconnected");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(60);
    }
}

async fn run_connection(
    ws_url: &str,
    token: &str,
    user_id: &str,
    on_order: &OrderEventHandler,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    info!(user_id, "connecting private ws");
    let (stream, _response) = connect_async(ws_url).await?;
    let (mut write, mut read) = stream.split();

    let auth = serde_json::json!({"params": {"token": token}, "id": 1});
    write.send(Message::Text(auth.to_string())).await?;

    let subscribe = serde_json::json!({"method": 1, "params": {"channel": "order"}, "id": 2});
    write.send(Message::Text(subscribe.to_string())).await?;
    info!(user_id, "private ws connected, order channel subscribed");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(order) = parse_order_event(&text) {
                            on_order(order);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => anyhow::bail!("server closed the connection"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => anyhow::bail!("stream ended"),
                }
            }
        }
    }
}

/// Parse an `order` channel push into a normalized order.
fn parse_order_event(text: &str) -> Option<ExchangeOrder> {
    let (channel, data) = parse_push(text)?;
    if channel != "order" {
        return None;
    }

    let pair = data
        .get("pair")
        .or_else(|| data.get("symbol"))
        .and_then(|v| v.as_str())
        .map(normalize_pair)?;

    match ExchangeOrder::from_wire(&pair, &data) {
        Ok(order) => Some(order),
        Err(e) => {
            debug!(error = %e, "unparseable private order event");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    #[test]
    fn order_event_parsed_and_normalized() {
        let text = r#"{
            "result": {
                "channel": "order",
                "data": {
                    "order_id": 991,
                    "pair": "btc_idr",
                    "type": "buy",
                    "price": "650000000",
                    "order_idr": "1000000",
                    "remain_idr": "0",
                    "status": "filled"
                }
            }
        }"#;
        let order = parse_order_event(text).expect("should parse");
        assert_eq!(order.pair, "btcidr");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, "filled");
        assert!((order.filled() - 1_000_000.0 / 650_000_000.0).abs() < 1e-12);
    }

    #[test]
    fn non_order_pushes_ignored() {
        let text = r#"{"result": {"channel": "market:summary-24h", "data": {"data": []}}}"#;
        assert!(parse_order_event(text).is_none());
    }
}
