//! Per-session bounded outbound queue.
//!
//! Overflow drops droppable events first (`message_chunk`,
//! `workflow_thought`), oldest first. `message_complete`, `tool_*`,
//! `error`, and `conversation_started` are never dropped: when the queue
//! is full of critical events it grows past capacity rather than lose one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;

use parley_domain::protocol::ServerMessage;

use crate::metrics::SESSION_EVENTS_DROPPED_TOTAL;

pub struct OutboundQueue {
    inner: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an event, applying the drop policy on overflow. Returns
    /// false if the event itself was dropped.
    pub fn push(&self, msg: ServerMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let pushed = {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|m| m.is_droppable()) {
                    queue.remove(pos);
                    counter!(SESSION_EVENTS_DROPPED_TOTAL).increment(1);
                    queue.push_back(msg);
                    true
                } else if msg.is_droppable() {
                    // Queue is all critical events; shed the incoming chunk.
                    counter!(SESSION_EVENTS_DROPPED_TOTAL).increment(1);
                    false
                } else {
                    // Critical event, nothing sheddable: exceed capacity.
                    queue.push_back(msg);
                    true
                }
            } else {
                queue.push_back(msg);
                true
            }
        };
        if pushed {
            self.notify.notify_one();
        }
        pushed
    }

    /// Dequeue the next event, waiting until one arrives or the queue is
    /// closed (returns `None`).
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.inner.lock().pop_front() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue: `pop` drains what is buffered, then returns
    /// `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::error::ErrorCode;
    use parley_domain::protocol::{MessageChunkPayload, MessageCompletePayload};

    fn chunk(text: &str) -> ServerMessage {
        ServerMessage::MessageChunk {
            conversation_id: "c".into(),
            payload: MessageChunkPayload { chunk: text.into() },
        }
    }

    fn complete(id: &str) -> ServerMessage {
        ServerMessage::MessageComplete {
            conversation_id: "c".into(),
            payload: MessageCompletePayload {
                message_id: id.into(),
                content: "done".into(),
                agent_id: "a".into(),
            },
        }
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push(chunk("1"));
        queue.push(chunk("2"));
        let first = queue.pop().await.unwrap();
        match first {
            ServerMessage::MessageChunk { payload, .. } => assert_eq!(payload.chunk, "1"),
            _ => panic!("wrong message"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_chunk_first() {
        let queue = OutboundQueue::new(2);
        queue.push(chunk("old"));
        queue.push(chunk("mid"));
        assert!(queue.push(complete("m1")));

        assert_eq!(queue.len(), 2);
        match queue.pop().await.unwrap() {
            ServerMessage::MessageChunk { payload, .. } => assert_eq!(payload.chunk, "mid"),
            other => panic!("expected mid chunk, got {other:?}"),
        }
        assert!(matches!(
            queue.pop().await.unwrap(),
            ServerMessage::MessageComplete { .. }
        ));
    }

    #[tokio::test]
    async fn critical_events_never_dropped() {
        let queue = OutboundQueue::new(2);
        queue.push(complete("m1"));
        queue.push(complete("m2"));
        // Queue is full of criticals: a third critical still lands.
        assert!(queue.push(complete("m3")));
        assert_eq!(queue.len(), 3);
        // An incoming chunk is shed instead.
        assert!(!queue.push(chunk("x")));
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn error_events_are_critical() {
        let queue = OutboundQueue::new(1);
        queue.push(chunk("a"));
        assert!(queue.push(ServerMessage::error(None, ErrorCode::Busy, "busy")));
        // The chunk was shed, the error kept.
        assert!(matches!(
            queue.pop().await.unwrap(),
            ServerMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push(chunk("tail"));
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        // Pushes after close are refused.
        assert!(!queue.push(chunk("late")));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let q2 = queue.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(chunk("wake"));
        assert!(waiter.await.unwrap().is_some());
    }
}
