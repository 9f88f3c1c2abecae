//! WebSocket bridge between a client and the event broadcaster.
//!
//! Outbound events come from the subscriber's bounded buffer; inbound text
//! frames carry `{type, data}` control messages. When the broadcaster cuts a
//! lagging subscriber loose, its close signal ends the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use oscar_engine::{ClientMessage, ServerEvent, SubscriptionFilter};

use crate::{server::api::acting_user, HostState};

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Execution id to follow; `*` follows every execution. Without it the
    /// socket is idle until a `subscribe_execution` message arrives.
    execution_id: Option<String>,
}

/// Subscribe to execution events
async fn handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = acting_user(&headers);
    let filter = match query.execution_id.as_deref() {
        Some("*") => SubscriptionFilter::All,
        Some(id) => SubscriptionFilter::Execution(id.to_string()),
        None => SubscriptionFilter::Idle,
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, user, filter))
}

async fn handle_socket(
    state: HostState,
    socket: WebSocket,
    user: String,
    filter: SubscriptionFilter,
) {
    let mut handle = state.broadcaster.subscribe(&user, filter);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = handle.closed.cancelled() => break,

            event = handle.rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                state.broadcaster.handle_client_message(&handle.id, message);
                            }
                            Err(err) => {
                                let error = ServerEvent::Error {
                                    message: format!("unrecognized message: {err}"),
                                };
                                if let Ok(text) = serde_json::to_string(&error) {
                                    let _ = sender.send(Message::Text(text)).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&handle.id);
    let _ = sender.close().await;
}

pub fn create_router() -> Router<HostState> {
    Router::new().route("/", get(handler))
}
