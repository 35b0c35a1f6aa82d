//! Per-session chat WebSocket.
//!
//! Wire protocol, in order: a SystemUpdate greeting carrying the current
//! session status, a replay of the last 50 stored events, then live fan-out
//! from the fabric. Inbound frames are user prompts; a valid one is stored,
//! queued as a ProcessMessage job and acked, an invalid one gets an Error
//! event back without closing the socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use ottobot_session::{
    EventMetadata, JobKind, MessageEvent, SessionStatus,
};

use crate::api::{ApiError, AppState};

const REPLAY_EVENTS: usize = 50;
const MAX_INBOUND_CHARS: usize = 10_000;

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    content: String,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<i64>,
}

pub async fn chat_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    // Validate before upgrading; a dead session gets an HTTP error, not a
    // socket that immediately closes.
    let session = match state.registry.get(&id).await {
        Ok(Some(session)) => session,
        Ok(None) => return ApiError::NotFound(id).into_response(),
        Err(error) => return ApiError::from(error).into_response(),
    };
    if session.status.is_terminal() {
        return ApiError::NotFound(id).into_response();
    }

    let status = session.status;
    ws.on_upgrade(move |socket| async move {
        if let Err(error) = run_chat(state, id.clone(), status, socket).await {
            tracing::debug!(session_id = %id, %error, "chat socket ended");
        }
    })
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_event(sink: &mut WsSink, event: &MessageEvent) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "undeliverable chat event");
            return Ok(());
        }
    };
    sink.send(Message::Text(payload.into())).await
}

async fn run_chat(
    state: AppState,
    session_id: String,
    status: SessionStatus,
    socket: WebSocket,
) -> Result<(), axum::Error> {
    let mut subscription = match state.fabric.subscribe(&session_id).await {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::error!(session_id, %error, "chat subscription failed");
            return Ok(());
        }
    };

    let result = drive_chat(&state, &session_id, status, socket, &mut subscription).await;
    state.fabric.unsubscribe(&subscription).await;
    result
}

async fn drive_chat(
    state: &AppState,
    session_id: &str,
    status: SessionStatus,
    socket: WebSocket,
    subscription: &mut ottobot_session::FabricSubscription,
) -> Result<(), axum::Error> {
    let (mut sink, mut stream) = socket.split();

    let greeting = MessageEvent::system_update("Connected to session").with_metadata(
        EventMetadata {
            session_status: Some(status),
            ..Default::default()
        },
    );
    send_event(&mut sink, &greeting).await?;

    match state
        .registry
        .read_messages(session_id, Some(REPLAY_EVENTS))
        .await
    {
        Ok(history) => {
            for event in &history {
                send_event(&mut sink, event).await?;
            }
        }
        Err(error) => {
            tracing::warn!(session_id, %error, "history replay failed");
        }
    }

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(state, session_id, text.as_str(), &mut sink).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {} // ping/pong and binary frames are ignored
                    Some(Err(error)) => return Err(error),
                }
            }
            outbound = subscription.recv() => {
                match outbound {
                    Some(event) => send_event(&mut sink, &event).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn handle_inbound(
    state: &AppState,
    session_id: &str,
    raw: &str,
    sink: &mut WsSink,
) -> Result<(), axum::Error> {
    let frame: InboundFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(error) => {
            return reject(sink, format!("Invalid message: {error}")).await;
        }
    };
    if frame.kind != "user_prompt" {
        return reject(sink, format!("Unsupported message type '{}'", frame.kind)).await;
    }
    let chars = frame.content.chars().count();
    if chars == 0 || chars > MAX_INBOUND_CHARS {
        return reject(
            sink,
            format!("content must be 1..{MAX_INBOUND_CHARS} characters"),
        )
        .await;
    }

    // Terminal sessions keep their sockets open for reading history, but
    // stop accepting prompts.
    let session = match state.registry.get(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return reject(sink, "Session no longer exists".to_string()).await;
        }
        Err(error) => {
            tracing::error!(session_id, %error, "session lookup failed");
            return reject(sink, "Temporary failure, try again".to_string()).await;
        }
    };
    if session.status.is_terminal() || session.status == SessionStatus::Terminating {
        return reject(sink, "Session is shutting down".to_string()).await;
    }

    let event = MessageEvent::user_prompt(&frame.content);
    if let Err(error) = state.registry.append_message(session_id, &event).await {
        tracing::error!(session_id, %error, "failed to store prompt");
        return reject(sink, "Temporary failure, try again".to_string()).await;
    }

    if session.status == SessionStatus::Ready {
        if let Err(error) = state
            .registry
            .set_status(session_id, SessionStatus::Running, None)
            .await
        {
            tracing::warn!(session_id, %error, "status transition failed");
        }
    }

    if let Err(error) = state
        .queue
        .enqueue(
            JobKind::ProcessMessage,
            session_id,
            serde_json::json!({
                "content": frame.content,
                "timestamp": event.timestamp,
            }),
        )
        .await
    {
        tracing::error!(session_id, %error, "failed to queue prompt");
        return reject(sink, "Temporary failure, try again".to_string()).await;
    }

    let ack = MessageEvent::system_update("Message received and queued for processing");
    send_event(sink, &ack).await
}

async fn reject(sink: &mut WsSink, message: String) -> Result<(), axum::Error> {
    tracing::debug!(message, "rejecting chat frame");
    send_event(sink, &MessageEvent::error(message)).await
}
