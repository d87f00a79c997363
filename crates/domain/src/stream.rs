//! LLM streaming events (provider-agnostic).

use serde::Serialize;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while an LLM call streams. The stream is finite and
/// non-restartable: it ends after `Completed` or `StreamError`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LlmEvent {
    /// A text token chunk.
    #[serde(rename = "token_chunk")]
    TokenChunk { text: String },

    /// Out-of-band reasoning content. Advisory; not part of any ordering
    /// contract.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// The model wants a tool invoked. Arguments are fully assembled.
    #[serde(rename = "tool_call_intent")]
    ToolCallIntent {
        call_id: String,
        tool_id: String,
        arguments: serde_json::Value,
    },

    /// The stream finished normally.
    #[serde(rename = "completed")]
    Completed {
        finish_reason: Option<String>,
        token_count: u32,
        duration_ms: u64,
    },

    /// The stream failed. `retryable` errors may be retried by the caller
    /// with backoff; the stream itself is closed either way.
    #[serde(rename = "error")]
    StreamError {
        kind: StreamErrorKind,
        retryable: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Per-chunk idle timeout elapsed.
    Timeout,
    /// The caller cancelled the stream.
    Cancelled,
    /// Transport or HTTP-level failure.
    Http,
    /// The upstream sent something we could not parse.
    Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = LlmEvent::TokenChunk {
            text: "hi".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "token_chunk");
        assert_eq!(v["text"], "hi");
    }

    #[test]
    fn stream_error_kind_snake_case() {
        let event = LlmEvent::StreamError {
            kind: StreamErrorKind::Timeout,
            retryable: true,
            message: "idle".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["kind"], "timeout");
        assert_eq!(v["retryable"], true);
    }
}
