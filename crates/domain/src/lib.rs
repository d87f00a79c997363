//! Core domain types shared by every Parley crate: identifiers, domain and
//! agent configuration, the config registry snapshot, LLM stream events,
//! persisted records, and the WebSocket wire protocol.

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod records;
pub mod registry;
pub mod stream;

pub use cancel::CancelToken;
pub use error::{Error, ErrorCode, Result};
