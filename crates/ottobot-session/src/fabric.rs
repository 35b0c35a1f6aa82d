//! Per-session chat fan-out across the fleet.
//!
//! A `publish` on any process reaches every local subscriber on every
//! process exactly once. Local subscribers are handed the event directly;
//! remote processes get it through the store's pub/sub channel. Every
//! envelope carries a `(publisher, seq)` stamp so the relay can drop the
//! publisher's own broadcast instead of delivering it twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ottobot_store::Store;

use crate::error::{SessionError, SessionResult};
use crate::models::MessageEvent;

fn channel_name(session_id: &str) -> String {
    format!("session:{session_id}:messages")
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    publisher: String,
    seq: u64,
    event: MessageEvent,
}

struct SessionChannel {
    subscribers: HashMap<u64, mpsc::UnboundedSender<MessageEvent>>,
    relay: JoinHandle<()>,
}

struct Inner {
    process_id: String,
    seq: AtomicU64,
    next_subscriber: AtomicU64,
    store: Arc<dyn Store>,
    sessions: Mutex<HashMap<String, SessionChannel>>,
}

impl Inner {
    async fn dispatch(&self, session_id: &str, event: &MessageEvent) {
        let mut sessions = self.sessions.lock().await;
        let Some(channel) = sessions.get_mut(session_id) else {
            return;
        };
        // A send failure means the subscriber went away without
        // unsubscribing; drop it and keep delivering to the rest.
        channel
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle on one local subscription. Events arrive on [`recv`]; pass the
/// handle back to [`MessageFabric::unsubscribe`] when done.
///
/// [`recv`]: FabricSubscription::recv
pub struct FabricSubscription {
    session_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<MessageEvent>,
}

impl FabricSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<MessageEvent> {
        self.rx.recv().await
    }
}

#[derive(Clone)]
pub struct MessageFabric {
    inner: Arc<Inner>,
}

impl MessageFabric {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let process_id = Uuid::new_v4().as_simple().to_string();
        Self {
            inner: Arc::new(Inner {
                process_id,
                seq: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(1),
                store,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Deliver to local subscribers and broadcast to the rest of the fleet.
    /// Local delivery happens first and is unconditional: a broken store
    /// transport degrades to process-local chat rather than silence.
    pub async fn publish(&self, session_id: &str, event: MessageEvent) -> SessionResult<()> {
        self.inner.dispatch(session_id, &event).await;

        let envelope = Envelope {
            publisher: self.inner.process_id.clone(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| SessionError::corrupt(channel_name(session_id), e))?;
        self.inner
            .store
            .publish(&channel_name(session_id), &payload)
            .await
            .map_err(|e| SessionError::Publish {
                session_id: session_id.to_string(),
                detail: e.to_string(),
            })?;
        Ok(())
    }

    /// Register a local subscriber. The first subscriber for a session
    /// attaches the process to the session's store channel; later ones share
    /// the relay.
    pub async fn subscribe(&self, session_id: &str) -> SessionResult<FabricSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut sessions = self.inner.sessions.lock().await;
        if let Some(channel) = sessions.get_mut(session_id) {
            channel.subscribers.insert(id, tx);
        } else {
            let subscription = self
                .inner
                .store
                .subscribe(&channel_name(session_id))
                .await?;
            let relay = tokio::spawn(relay_loop(
                self.inner.clone(),
                session_id.to_string(),
                subscription,
            ));
            let mut subscribers = HashMap::new();
            subscribers.insert(id, tx);
            sessions.insert(
                session_id.to_string(),
                SessionChannel { subscribers, relay },
            );
        }
        drop(sessions);

        Ok(FabricSubscription {
            session_id: session_id.to_string(),
            id,
            rx,
        })
    }

    /// Detach a subscriber. The last one out stops the relay and drops the
    /// store channel.
    pub async fn unsubscribe(&self, subscription: &FabricSubscription) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(channel) = sessions.get_mut(&subscription.session_id) else {
            return;
        };
        channel.subscribers.remove(&subscription.id);
        if channel.subscribers.is_empty() {
            if let Some(channel) = sessions.remove(&subscription.session_id) {
                channel.relay.abort();
            }
        }
    }

    /// Number of local subscribers for a session.
    pub async fn local_subscribers(&self, session_id: &str) -> usize {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}

async fn relay_loop(
    inner: Arc<Inner>,
    session_id: String,
    mut subscription: ottobot_store::Subscription,
) {
    while let Some(payload) = subscription.recv().await {
        let envelope: Envelope = match serde_json::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%session_id, %error, "dropping undecodable fabric payload");
                continue;
            }
        };
        // Our own publish already delivered locally.
        if envelope.publisher == inner.process_id {
            continue;
        }
        inner.dispatch(&session_id, &envelope.event).await;
    }
}
