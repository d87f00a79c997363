use serde::{Deserialize, Serialize};

/// Shared error type used across all Parley crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// A user-visible error carrying a stable machine-readable code.
    #[error("{code}: {message}")]
    Api { code: ErrorCode, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn api(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// The stable code for this error, defaulting to `bad_request` for
    /// errors that never reach a client directly.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Api { code, .. } => *code,
            Error::Auth(_) => ErrorCode::Unauthorized,
            Error::Config(_) => ErrorCode::NotConfigured,
            _ => ErrorCode::BadRequest,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable, user-visible error identifiers. These appear verbatim in `error`
/// events on the session and in REST error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    NotConfigured,
    StreamError,
    Cancelled,
    ToolRequestFailed,
    ToolExecuteFailed,
    Overloaded,
    Busy,
    HandoffLoop,
    Conflict,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NotConfigured => "not_configured",
            ErrorCode::StreamError => "stream_error",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::ToolRequestFailed => "tool_request_failed",
            ErrorCode::ToolExecuteFailed => "tool_execute_failed",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::Busy => "busy",
            ErrorCode::HandoffLoop => "handoff_loop",
            ErrorCode::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ToolRequestFailed).unwrap();
        assert_eq!(json, "\"tool_request_failed\"");
    }

    #[test]
    fn error_code_display_matches_serde() {
        for code in [
            ErrorCode::BadRequest,
            ErrorCode::Busy,
            ErrorCode::HandoffLoop,
            ErrorCode::Overloaded,
        ] {
            let via_serde: String = serde_json::from_value::<String>(
                serde_json::to_value(code).unwrap(),
            )
            .unwrap();
            assert_eq!(via_serde, code.to_string());
        }
    }

    #[test]
    fn api_error_carries_code() {
        let err = Error::api(ErrorCode::Busy, "a turn is already in flight");
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(err.to_string(), "busy: a turn is already in flight");
    }
}
