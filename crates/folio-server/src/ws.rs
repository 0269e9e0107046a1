//! Websocket endpoint
//!
//! One connection drives one [`SessionDriver`]. Outbound chunks are written by
//! a dedicated task so a slow socket never blocks the reader; dropping the
//! connection stops delivery but leaves any in-flight turn running.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use folio_session::{ChunkKind, ClientMessage, SessionDriver, StreamChunk, TurnRunner};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue depth per connection
const OUTBOUND_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub runner: TurnRunner,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    /// Resume this conversation's in-flight turn on connect
    pub conversation_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

pub async fn health() -> &'static str {
    "ok"
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<StreamChunk>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let json = match serde_json::to_string(&chunk) {
                Ok(json) => json,
                Err(error) => {
                    warn!(conversation_id = %chunk.conversation_id, %error, "Failed to encode chunk");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut driver = SessionDriver::new(state.runner, tx.clone());

    if let Some(conversation_id) = query.conversation_id.as_deref() {
        match driver.resume(conversation_id).await {
            Ok(resumed) => debug!(conversation_id, resumed, "Connected with resume"),
            Err(error) => warn!(conversation_id, %error, "Resume on connect failed"),
        }
    }

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(error) => {
                debug!("websocket receive error: {error}");
                break;
            }
        };

        match message {
            Message::Text(text) => match decode(&text) {
                Ok(client_message) => {
                    if let Err(error) = driver.handle(client_message).await {
                        warn!(%error, "Failed to handle client message");
                    }
                }
                Err(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(driver);
    drop(tx);
    if let Err(error) = writer.await {
        debug!("websocket writer ended abnormally: {error}");
    }
}

/// Parse an inbound frame, or build the error chunk to send back
fn decode(text: &str) -> Result<ClientMessage, StreamChunk> {
    serde_json::from_str(text).map_err(|error| {
        let conversation_id = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|value| value.get("conversationId")?.as_str().map(str::to_string))
            .unwrap_or_default();
        StreamChunk::new(
            conversation_id,
            ChunkKind::error(format!("invalid message: {error}")),
        )
    })
}
