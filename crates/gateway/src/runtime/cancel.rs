//! Per-conversation cancellation tokens.
//!
//! Each running turn registers a [`CancelToken`] under its conversation id.
//! `cancel_stream` (WebSocket or REST) signals it; the runner notices at
//! its next suspension point and winds the turn down.

use std::collections::HashMap;

use parking_lot::Mutex;

use parley_domain::cancel::CancelToken;

pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a fresh token for a conversation's active turn.
    pub fn register(&self, conversation_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(conversation_id.to_owned(), token.clone());
        token
    }

    /// Cancel the active turn, if any. Returns whether a token was found.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        if let Some(token) = self.tokens.lock().get(conversation_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Remove the token when a turn reaches a terminal state.
    pub fn remove(&self, conversation_id: &str) {
        self.tokens.lock().remove(conversation_id);
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.tokens.lock().contains_key(conversation_id)
    }
}
