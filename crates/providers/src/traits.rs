use parley_domain::cancel::CancelToken;
use parley_domain::error::Result;
use parley_domain::message::{ChatMessage, ToolSchema};
use parley_domain::stream::{BoxStream, LlmEvent};

/// One streaming chat-completion call, provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Model identifier. Empty lets the adapter use its default.
    pub model_id: String,
    /// The active agent's system prompt.
    pub system_prompt: String,
    /// Conversation history, oldest first (without the system prompt).
    pub messages: Vec<ChatMessage>,
    /// Tools the model may request.
    pub tools: Vec<ToolSchema>,
}

/// Trait every LLM adapter implements.
///
/// The returned stream is finite and non-restartable. Errors are in-band
/// (`LlmEvent::StreamError`) so callers see exactly one terminal event:
/// `Completed` or `StreamError`. Implementations must honor `cancel`
/// cooperatively: after cancellation they emit
/// `StreamError{kind=Cancelled}` and close their upstream connection.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Open the stream. Errors returned here are connection-level (the
    /// stream never started); once a stream exists all failures are
    /// in-band events.
    async fn stream(
        &self,
        req: StreamRequest,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, LlmEvent>>;

    /// A unique identifier for this client instance.
    fn client_id(&self) -> &str;
}
