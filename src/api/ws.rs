// =============================================================================
// User WebSocket — authenticated realtime session
// =============================================================================
//
// Clients upgrade on `/api/v1/ws` and then speak `{type, payload}` frames:
//
//   inbound:  auth { token }, subscribe { channel }, unsubscribe { channel },
//             ping
//   outbound: auth_success, market_update, order_update, bot_update,
//             balance_update, pump_signal, pong, error
//
// The first frame must be a successful `auth` (10s grace); afterwards the
// session is registered with the hub, which feeds the outbound side.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::resolve_token;
use crate::app_state::AppState;
use crate::hub::TOPIC_MARKET;

/// How long a fresh connection may take to authenticate.
const AUTH_GRACE: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // ── Authentication handshake ────────────────────────────────────────
    let user_id = match timeout(AUTH_GRACE, authenticate(&mut receiver, &state)).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            let _ = sender
                .send(Message::Text(error_frame("authentication failed")))
                .await;
            return;
        }
        Err(_) => {
            debug!("ws connection dropped: auth timeout");
            return;
        }
    };

    let _ = sender
        .send(Message::Text(frame(
            "auth_success",
            serde_json::json!({"user_id": user_id}),
        )))
        .await;

    let (session_id, mut outbound) = state.hub.register(&user_id);
    info!(%user_id, session_id, "ws session authenticated");

    // ── Pump frames both ways until either side ends ────────────────────
    loop {
        tokio::select! {
            pushed = outbound.recv() => {
                match pushed {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped us (slow client).
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, session_id, &text, &mut sender).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "ws receive error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(session_id);
    info!(%user_id, session_id, "ws session closed");
}

/// Read frames until a valid `auth` arrives; anything else is refused.
async fn authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &Arc<AppState>,
) -> Option<String> {
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
            return None;
        };
        if parsed["type"] != "auth" {
            warn!("ws frame before authentication");
            return None;
        }
        let token = parsed["payload"]["token"].as_str().unwrap_or_default();
        return resolve_token(state.store.as_ref(), token).await;
    }
    None
}

async fn handle_client_frame<S>(
    state: &Arc<AppState>,
    session_id: u64,
    text: &str,
    sender: &mut S,
) where
    S: SinkExt<Message> + Unpin,
{
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else {
        let _ = sender.send(Message::Text(error_frame("malformed frame"))).await;
        return;
    };

    match parsed["type"].as_str() {
        Some("ping") => {
            let _ = sender
                .send(Message::Text(frame("pong", serde_json::Value::Null)))
                .await;
        }
        Some("subscribe") => {
            let channel = parsed["payload"]["channel"].as_str().unwrap_or(TOPIC_MARKET);
            state.hub.subscribe_topic(session_id, channel);
            debug!(session_id, channel, "topic subscribed");
        }
        Some("unsubscribe") => {
            let channel = parsed["payload"]["channel"].as_str().unwrap_or(TOPIC_MARKET);
            state.hub.unsubscribe_topic(session_id, channel);
            debug!(session_id, channel, "topic unsubscribed");
        }
        Some("auth") => {
            // Already authenticated; ignore.
        }
        other => {
            debug!(frame_type = ?other, "unknown ws frame type");
            let _ = sender
                .send(Message::Text(error_frame("unknown frame type")))
                .await;
        }
    }
}

fn frame(event_type: &str, payload: serde_json::Value) -> String {
    serde_json::json!({"type": event_type, "payload": payload}).to_string()
}

fn error_frame(message: &str) -> String {
    frame("error", serde_json::json!({"message": message}))
}
