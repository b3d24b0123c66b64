//! WebSocket bridge between a client session and the hub.
//!
//! Inbound frames carry subscribe/unsubscribe/command/intervention
//! requests; outbound frames are the subscriber's ordered event stream
//! plus request acknowledgements, JSON-encoded.

use super::ApiState;
use crate::bus::Event;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Caller-chosen client label, used only for logging.
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    SubscribeAgent {
        agent_id: String,
    },
    UnsubscribeAgent {
        agent_id: String,
    },
    Command {
        agent_id: String,
        command: String,
    },
    Intervention {
        agent_id: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Connected { subscriber_id: Uuid },
    Event { event: Event },
    CommandAccepted { request_id: String },
    Ok,
    Error { message: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<ApiState>,
) -> Response {
    let client_id = query.client_id.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: ApiState, client_id: String) {
    let subscriber_id = state.hub.on_connect(&client_id);
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(32);

    // Outbound: interleave the subscriber's ordered event stream with
    // request acknowledgements. Ends when the hub closes the stream or
    // the socket rejects a write.
    let forwarder = {
        let hub = Arc::clone(&state.hub);
        tokio::spawn(async move {
            let hello = ServerFrame::Connected { subscriber_id };
            if send_frame(&mut sink, &hello).await.is_err() {
                return;
            }
            loop {
                let frame = tokio::select! {
                    event = hub.next_frame(subscriber_id) => match event {
                        Some(event) => ServerFrame::Event { event },
                        None => break,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(reply) => reply,
                        None => break,
                    },
                };
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
        })
    };

    // Inbound: requests from the client until the socket closes.
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%subscriber_id, "Malformed client frame: {e}");
                let _ = reply_tx
                    .send(ServerFrame::Error {
                        message: format!("malformed frame: {e}"),
                    })
                    .await;
                continue;
            }
        };
        let reply = handle_client_frame(&state, subscriber_id, frame).await;
        if reply_tx.send(reply).await.is_err() {
            break;
        }
    }

    forwarder.abort();
    state.hub.on_disconnect(subscriber_id);
}

async fn send_frame(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> std::result::Result<(), axum::Error> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Could not encode server frame: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(payload.into())).await
}

async fn handle_client_frame(
    state: &ApiState,
    subscriber_id: Uuid,
    frame: ClientFrame,
) -> ServerFrame {
    let outcome = match frame {
        ClientFrame::SubscribeAgent { agent_id } => state
            .hub
            .join_agent(subscriber_id, &agent_id)
            .map(|_| ServerFrame::Ok),
        ClientFrame::UnsubscribeAgent { agent_id } => state
            .hub
            .leave_agent(subscriber_id, &agent_id)
            .map(|_| ServerFrame::Ok),
        ClientFrame::Command { agent_id, command } => state
            .hub
            .send_command_to_agent(subscriber_id, &agent_id, &command)
            .await
            .map(|request_id| ServerFrame::CommandAccepted { request_id }),
        ClientFrame::Intervention { agent_id, payload } => state
            .hub
            .send_intervention_response(subscriber_id, &agent_id, payload)
            .await
            .map(|_| ServerFrame::Ok),
    };

    match outcome {
        Ok(frame) => frame,
        Err(e) => ServerFrame::Error {
            message: e.to_string(),
        },
    }
}
