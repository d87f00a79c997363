//! Session hub — fan-out of runner events to WebSocket subscribers.
//!
//! One session = one authenticated connection; a session may subscribe to
//! many conversations. Events for a conversation come from a single pump
//! per turn, so every subscriber observes the same order. Sessions never
//! back-reference conversation state: the runner publishes into the hub,
//! the hub pushes into per-session queues.

pub mod queue;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use parley_domain::protocol::{close, ServerMessage};

use crate::auth::Identity;
use crate::runtime::TurnEvent;
use queue::OutboundQueue;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionHandle {
    pub id: u64,
    pub identity: Identity,
    pub queue: OutboundQueue,
    /// Close code the writer should use when the queue ends, when not a
    /// normal closure.
    kick_code: Mutex<Option<u16>>,
}

impl SessionHandle {
    /// Close code for the writer; defaults to a normal closure.
    pub fn close_code(&self) -> u16 {
        self.kick_code.lock().unwrap_or(close::NORMAL)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Hub {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<u64, Arc<SessionHandle>>>,
    /// conversation_id → subscribed session ids.
    subscriptions: RwLock<HashMap<String, HashSet<u64>>>,
    queue_capacity: usize,
    max_per_identity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize, max_per_identity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            queue_capacity,
            max_per_identity: max_per_identity.max(1),
        }
    }

    /// Register a new session. When the identity exceeds its connection
    /// cap, its oldest session is kicked with close code 4001.
    pub fn register(&self, identity: Identity) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SessionHandle {
            id,
            identity: identity.clone(),
            queue: OutboundQueue::new(self.queue_capacity),
            kick_code: Mutex::new(None),
        });

        let to_kick = {
            let mut sessions = self.sessions.write();
            sessions.insert(id, handle.clone());

            let mut owned: Vec<_> = sessions
                .values()
                .filter(|s| s.identity.sub == identity.sub)
                .map(|s| s.id)
                .collect();
            owned.sort_unstable();
            if owned.len() > self.max_per_identity {
                owned.first().copied()
            } else {
                None
            }
        };

        if let Some(oldest) = to_kick {
            tracing::info!(sub = %identity.sub, kicked = oldest, "identity connection cap exceeded");
            self.kick(oldest, close::IDENTITY_KICKED);
        }

        tracing::debug!(session_id = id, sub = %identity.sub, "session registered");
        handle
    }

    /// Force-close a session with the given code.
    pub fn kick(&self, session_id: u64, code: u16) {
        let handle = self.sessions.write().remove(&session_id);
        if let Some(handle) = handle {
            *handle.kick_code.lock() = Some(code);
            handle.queue.close();
        }
        self.drop_subscriptions(session_id);
    }

    /// Remove a session after its socket closed.
    pub fn unregister(&self, session_id: u64) {
        if let Some(handle) = self.sessions.write().remove(&session_id) {
            handle.queue.close();
        }
        self.drop_subscriptions(session_id);
        tracing::debug!(session_id, "session unregistered");
    }

    fn drop_subscriptions(&self, session_id: u64) {
        let mut subs = self.subscriptions.write();
        subs.retain(|_, members| {
            members.remove(&session_id);
            !members.is_empty()
        });
    }

    /// Subscribe a session to a conversation's live events.
    pub fn subscribe(&self, session_id: u64, conversation_id: &str) {
        self.subscriptions
            .write()
            .entry(conversation_id.to_owned())
            .or_default()
            .insert(session_id);
    }

    /// Deliver an event to every subscriber of a conversation.
    pub fn publish(&self, conversation_id: &str, msg: &ServerMessage) {
        let member_ids: Vec<u64> = {
            let subs = self.subscriptions.read();
            match subs.get(conversation_id) {
                Some(members) => members.iter().copied().collect(),
                None => return,
            }
        };
        let sessions = self.sessions.read();
        for id in member_ids {
            if let Some(handle) = sessions.get(&id) {
                handle.queue.push(msg.clone());
            }
        }
    }

    /// Deliver an event to one session only.
    pub fn send_to(&self, session_id: u64, msg: ServerMessage) {
        if let Some(handle) = self.sessions.read().get(&session_id) {
            handle.queue.push(msg);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscriptions
            .read()
            .get(conversation_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn event pump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forward a turn's events into the hub. One pump per turn is the single
/// source for that conversation's subscribers, which is what guarantees
/// every session sees the same order.
pub fn pump_turn_events(hub: Arc<Hub>, conversation_id: String, mut rx: mpsc::Receiver<TurnEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = event.into_server_message(&conversation_id);
            hub.publish(&conversation_id, &msg);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::config::Role;
    use parley_domain::protocol::MessageChunkPayload;

    fn identity(sub: &str) -> Identity {
        Identity {
            sub: sub.into(),
            role: Role::User,
        }
    }

    fn chunk(text: &str) -> ServerMessage {
        ServerMessage::MessageChunk {
            conversation_id: "c1".into(),
            payload: MessageChunkPayload { chunk: text.into() },
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let hub = Hub::new(16, 5);
        let s1 = hub.register(identity("alice"));
        let s2 = hub.register(identity("bob"));
        hub.subscribe(s1.id, "c1");
        hub.subscribe(s2.id, "c1");

        hub.publish("c1", &chunk("one"));
        hub.publish("c1", &chunk("two"));

        for handle in [&s1, &s2] {
            for expected in ["one", "two"] {
                match handle.queue.pop().await.unwrap() {
                    ServerMessage::MessageChunk { payload, .. } => {
                        assert_eq!(payload.chunk, expected)
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn unsubscribed_sessions_see_nothing() {
        let hub = Hub::new(16, 5);
        let s1 = hub.register(identity("alice"));
        hub.subscribe(s1.id, "c1");
        hub.publish("c2", &chunk("elsewhere"));
        assert!(s1.queue.is_empty());
    }

    #[tokio::test]
    async fn connection_cap_kicks_oldest() {
        let hub = Hub::new(16, 2);
        let oldest = hub.register(identity("alice"));
        let _second = hub.register(identity("alice"));
        let _third = hub.register(identity("alice"));

        // Oldest was kicked with 4001 and its queue closed.
        assert_eq!(hub.session_count(), 2);
        assert!(oldest.queue.pop().await.is_none());
        assert_eq!(oldest.close_code(), close::IDENTITY_KICKED);
    }

    #[tokio::test]
    async fn cap_is_per_identity() {
        let hub = Hub::new(16, 1);
        let _a = hub.register(identity("alice"));
        let _b = hub.register(identity("bob"));
        // Different identities don't kick each other.
        assert_eq!(hub.session_count(), 2);
    }

    #[tokio::test]
    async fn unregister_cleans_subscriptions() {
        let hub = Hub::new(16, 5);
        let s1 = hub.register(identity("alice"));
        hub.subscribe(s1.id, "c1");
        assert_eq!(hub.subscriber_count("c1"), 1);

        hub.unregister(s1.id);
        assert_eq!(hub.subscriber_count("c1"), 0);
        assert_eq!(hub.session_count(), 0);
    }
}
