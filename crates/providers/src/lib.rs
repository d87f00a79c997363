//! LLM streaming clients.
//!
//! One trait ([`LlmClient`]), one production adapter (any OpenAI-compatible
//! chat-completions endpoint), and a per-model pool with bounded in-flight
//! admission.

pub mod openai_compat;
pub mod pool;
pub mod sse;
pub mod traits;

pub use openai_compat::OpenAiCompatClient;
pub use pool::{ClientPool, LeasedClient, PoolError};
pub use traits::{LlmClient, StreamRequest};
