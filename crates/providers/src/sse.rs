//! Shared SSE streaming infrastructure for adapters.
//!
//! The adapter hands us a `reqwest::Response` plus a parser; we buffer
//! chunks, split on `\n\n`, extract `data:` payloads, and feed them to the
//! parser. The resulting stream upholds the [`crate::LlmClient`] contract:
//! exactly one terminal event (`Completed` or `StreamError`), cancellation
//! checked between chunks, and a per-chunk idle timeout.

use std::time::Duration;

use parley_domain::cancel::CancelToken;
use parley_domain::stream::{BoxStream, LlmEvent, StreamErrorKind};

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter. The buffer is
/// drained in place so a trailing partial event survives to the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Provider-specific payload parser with state (tool-call assembly, usage).
pub(crate) trait SseParser: Send + 'static {
    /// Parse one `data:` payload into zero or more events.
    fn on_data(&mut self, data: &str) -> Vec<LlmEvent>;

    /// Called once when the body closes (or `[DONE]` was seen). Must end
    /// with a terminal event if none was produced yet.
    fn on_end(&mut self) -> Vec<LlmEvent>;
}

fn is_terminal(event: &LlmEvent) -> bool {
    matches!(
        event,
        LlmEvent::Completed { .. } | LlmEvent::StreamError { .. }
    )
}

/// Build the event stream from an SSE response.
///
/// Stops at the first terminal event. A chunk that takes longer than
/// `idle_timeout` to arrive produces `StreamError{kind=Timeout,
/// retryable=true}`; cancellation produces `StreamError{kind=Cancelled}`
/// and drops the response (closing the upstream connection).
pub(crate) fn sse_event_stream<P: SseParser>(
    response: reqwest::Response,
    mut parser: P,
    idle_timeout: Duration,
    cancel: CancelToken,
) -> BoxStream<'static, LlmEvent> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        'read: loop {
            if cancel.is_cancelled() {
                yield LlmEvent::StreamError {
                    kind: StreamErrorKind::Cancelled,
                    retryable: false,
                    message: "stream cancelled".into(),
                };
                return;
            }

            // Race the next chunk against cancellation. The yield happens
            // outside the select arms.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = tokio::time::timeout(idle_timeout, response.chunk()) => Some(chunk),
            };
            let Some(next) = next else {
                yield LlmEvent::StreamError {
                    kind: StreamErrorKind::Cancelled,
                    retryable: false,
                    message: "stream cancelled".into(),
                };
                return;
            };

            match next {
                Err(_elapsed) => {
                    yield LlmEvent::StreamError {
                        kind: StreamErrorKind::Timeout,
                        retryable: true,
                        message: format!(
                            "no chunk within {}ms",
                            idle_timeout.as_millis()
                        ),
                    };
                    return;
                }
                Ok(Ok(Some(bytes))) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in parser.on_data(&data) {
                            let terminal = is_terminal(&event);
                            yield event;
                            if terminal {
                                return;
                            }
                        }
                    }
                    continue 'read;
                }
                Ok(Ok(None)) => {
                    // Body closed: flush any trailing partial event.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parser.on_data(&data) {
                                let terminal = is_terminal(&event);
                                yield event;
                                if terminal {
                                    return;
                                }
                            }
                        }
                    }
                    for event in parser.on_end() {
                        let terminal = is_terminal(&event);
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    break 'read;
                }
                Ok(Err(e)) => {
                    yield LlmEvent::StreamError {
                        kind: StreamErrorKind::Http,
                        retryable: true,
                        message: e.to_string(),
                    };
                    return;
                }
            }
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_buffered() {
        let mut buf = String::from("data: whole\n\ndata: parti");
        assert_eq!(drain_data_lines(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: parti");

        buf.push_str("al\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["partial"]);
    }

    #[test]
    fn drain_ignores_non_data_lines() {
        let mut buf = String::from("event: ping\nid: 9\nretry: 300\ndata: payload\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["payload"]);
    }

    #[test]
    fn drain_skips_empty_data() {
        let mut buf = String::from("data: \n\n");
        assert!(drain_data_lines(&mut buf).is_empty());
    }

    #[test]
    fn drain_multiple_events_in_one_chunk() {
        let mut buf = String::from("data: one\n\ndata: two\n\ndata: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["one", "two", "[DONE]"]);
    }
}
