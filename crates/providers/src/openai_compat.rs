//! OpenAI-compatible adapter.
//!
//! Works with any endpoint following the OpenAI chat-completions contract
//! (OpenAI, Ollama, vLLM, LM Studio, Together, ...). Incremental tool-call
//! argument deltas are assembled here so the rest of the system only ever
//! sees fully-formed [`LlmEvent::ToolCallIntent`]s.

use std::time::{Duration, Instant};

use serde_json::Value;

use parley_domain::cancel::CancelToken;
use parley_domain::error::{Error, Result};
use parley_domain::message::{ChatContent, ChatMessage, ChatPart, ChatRole, ToolSchema};
use parley_domain::stream::{BoxStream, LlmEvent, StreamErrorKind};

use crate::sse::{sse_event_stream, SseParser};
use crate::traits::{LlmClient, StreamRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatClient {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    idle_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        default_model: impl Into<String>,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            idle_timeout,
            client,
        })
    }

    fn build_body(&self, req: &StreamRequest) -> Value {
        let model = if req.model_id.is_empty() {
            self.default_model.clone()
        } else {
            req.model_id.clone()
        };

        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if !req.system_prompt.is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": req.system_prompt,
            }));
        }
        messages.extend(req.messages.iter().map(msg_to_wire));

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn stream(
        &self,
        req: StreamRequest,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, LlmEvent>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        tracing::debug!(client = %self.id, url = %url, model = %req.model_id, "chat stream request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "HTTP {} - {err_text}",
                status.as_u16()
            )));
        }

        Ok(sse_event_stream(
            resp,
            WireParser::new(),
            self.idle_timeout,
            cancel,
        ))
    }

    fn client_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_wire(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn msg_to_wire(msg: &ChatMessage) -> Value {
    match msg.role {
        ChatRole::Tool => tool_result_to_wire(msg),
        ChatRole::Assistant => assistant_to_wire(msg),
        _ => serde_json::json!({
            "role": role_to_wire(msg.role),
            "content": msg.content.joined_text(),
        }),
    }
}

fn assistant_to_wire(msg: &ChatMessage) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        ChatContent::Text(t) => texts.push(t.clone()),
        ChatContent::Parts(parts) => {
            for part in parts {
                match part {
                    ChatPart::Text { text } => texts.push(text.clone()),
                    ChatPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    ChatPart::ToolResult { .. } => {}
                }
            }
        }
    }

    obj["content"] = if texts.is_empty() {
        Value::Null
    } else {
        Value::String(texts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_wire(msg: &ChatMessage) -> Value {
    if let ChatContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ChatPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.joined_text(),
    })
}

fn tool_to_wire(tool: &ToolSchema) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PartialCall {
    call_id: String,
    tool_id: String,
    args_buf: String,
}

/// Stateful parser for the OpenAI delta wire format. Tool-call argument
/// fragments are keyed by the `index` field and flushed as complete
/// intents before the terminal `Completed`.
struct WireParser {
    started: Instant,
    calls: Vec<PartialCall>,
    finish_reason: Option<String>,
    token_count: u32,
    ended: bool,
}

impl WireParser {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            calls: Vec::new(),
            finish_reason: None,
            token_count: 0,
            ended: false,
        }
    }

    fn call_at(&mut self, index: usize) -> &mut PartialCall {
        while self.calls.len() <= index {
            self.calls.push(PartialCall::default());
        }
        &mut self.calls[index]
    }

    fn flush_terminal(&mut self) -> Vec<LlmEvent> {
        if self.ended {
            return Vec::new();
        }
        self.ended = true;

        let mut events = Vec::new();
        for call in self.calls.drain(..) {
            if call.tool_id.is_empty() {
                continue;
            }
            let arguments = if call.args_buf.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&call.args_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            tool = %call.tool_id,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            events.push(LlmEvent::ToolCallIntent {
                call_id: call.call_id,
                tool_id: call.tool_id,
                arguments,
            });
        }
        events.push(LlmEvent::Completed {
            finish_reason: self.finish_reason.take(),
            token_count: self.token_count,
            duration_ms: self.started.elapsed().as_millis() as u64,
        });
        events
    }
}

impl SseParser for WireParser {
    fn on_data(&mut self, data: &str) -> Vec<LlmEvent> {
        if data.trim() == "[DONE]" {
            return self.flush_terminal();
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![LlmEvent::StreamError {
                    kind: StreamErrorKind::Protocol,
                    retryable: false,
                    message: format!("bad SSE payload: {e}"),
                }];
            }
        };

        // Usage-only chunk (stream_options.include_usage).
        if let Some(completion) = v
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
        {
            self.token_count = completion as u32;
        }

        let Some(choice) = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
        else {
            return Vec::new();
        };

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(fr.to_string());
        }

        let delta = choice.get("delta").unwrap_or(&Value::Null);
        let mut events = Vec::new();

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let call = self.call_at(index);
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    call.call_id = id.to_string();
                }
                if let Some(name) = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                {
                    call.tool_id = name.to_string();
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    call.args_buf.push_str(args);
                }
            }
        }

        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(LlmEvent::Thinking {
                    text: text.to_string(),
                });
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(LlmEvent::TokenChunk {
                    text: text.to_string(),
                });
            }
        }

        events
    }

    fn on_end(&mut self) -> Vec<LlmEvent> {
        self.flush_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(delta: Value) -> String {
        serde_json::json!({"choices": [{"delta": delta}]}).to_string()
    }

    #[test]
    fn text_deltas_become_chunks() {
        let mut p = WireParser::new();
        let events = p.on_data(&chunk(serde_json::json!({"content": "Hel"})));
        assert!(matches!(&events[0], LlmEvent::TokenChunk { text } if text == "Hel"));
    }

    #[test]
    fn reasoning_becomes_thinking() {
        let mut p = WireParser::new();
        let events = p.on_data(&chunk(serde_json::json!({"reasoning_content": "hmm"})));
        assert!(matches!(&events[0], LlmEvent::Thinking { text } if text == "hmm"));
    }

    #[test]
    fn tool_call_deltas_assemble_into_one_intent() {
        let mut p = WireParser::new();
        assert!(p
            .on_data(&chunk(serde_json::json!({
                "tool_calls": [{"index": 0, "id": "call_1",
                                "function": {"name": "file_write", "arguments": "{\"pa"}}]
            })))
            .is_empty());
        assert!(p
            .on_data(&chunk(serde_json::json!({
                "tool_calls": [{"index": 0,
                                "function": {"arguments": "th\":\"out.txt\"}"}}]
            })))
            .is_empty());

        let events = p.on_data("[DONE]");
        assert_eq!(events.len(), 2);
        match &events[0] {
            LlmEvent::ToolCallIntent {
                call_id,
                tool_id,
                arguments,
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(tool_id, "file_write");
                assert_eq!(arguments["path"], "out.txt");
            }
            other => panic!("expected intent, got {other:?}"),
        }
        assert!(matches!(&events[1], LlmEvent::Completed { .. }));
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        let mut p = WireParser::new();
        p.on_data(&chunk(serde_json::json!({
            "tool_calls": [{"index": 0, "id": "c", "function": {"name": "t", "arguments": "{oops"}}]
        })));
        let events = p.on_data("[DONE]");
        match &events[0] {
            LlmEvent::ToolCallIntent { arguments, .. } => {
                assert!(arguments.as_object().unwrap().is_empty());
            }
            other => panic!("expected intent, got {other:?}"),
        }
    }

    #[test]
    fn finish_reason_and_usage_reach_completed() {
        let mut p = WireParser::new();
        p.on_data(&serde_json::json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        })
        .to_string());
        p.on_data(&serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 10, "completion_tokens": 42, "total_tokens": 52}
        })
        .to_string());
        let events = p.on_data("[DONE]");
        match &events[0] {
            LlmEvent::Completed {
                finish_reason,
                token_count,
                ..
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(*token_count, 42);
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn terminal_is_emitted_once() {
        let mut p = WireParser::new();
        assert_eq!(p.on_data("[DONE]").len(), 1);
        assert!(p.on_data("[DONE]").is_empty());
        assert!(p.on_end().is_empty());
    }

    #[test]
    fn body_builds_system_and_tools() {
        let client = OpenAiCompatClient::new(
            "llm",
            "http://localhost:8080/v1/",
            None,
            "test-model",
            Duration::from_secs(30),
        )
        .unwrap();
        let req = StreamRequest {
            model_id: String::new(),
            system_prompt: "You are terse.".into(),
            messages: vec![ChatMessage::user("hello")],
            tools: vec![ToolSchema {
                name: "file_write".into(),
                description: "write a file".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
        };
        let body = client.build_body(&req);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["tools"][0]["function"]["name"], "file_write");
        assert_eq!(body["stream"], true);
    }
}
