//! Incremental decoding of streaming chat completions.
//!
//! The service spawns one task per request, decodes the SSE body line by
//! line, and forwards decoded events over an unbounded channel tagged with a
//! stream id. A corrupt frame never aborts the stream; it is skipped and
//! decoding continues with the next line.

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::{ChatMessage, ChatRequest, ChatResponse, ChatToolCallDelta, ChatToolDefinition};
use crate::utils::url::construct_api_url;

/// Visible updates are propagated at most once per this many decoder
/// emissions; stream end always forces a flush.
pub const STREAM_UPDATE_INTERVAL: usize = 6;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug)]
pub enum StreamMessage {
    Chunk(String),
    ToolCalls(Vec<ChatToolCallDelta>),
    Error(String),
    End { finish_reason: Option<String> },
}

/// Counts decoder emissions and admits every Nth for propagation. The final
/// flush bypasses the counter so no trailing content is lost.
#[derive(Debug)]
pub struct UpdateThrottle {
    interval: usize,
    since_last: usize,
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(STREAM_UPDATE_INTERVAL)
    }
}

impl UpdateThrottle {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            since_last: 0,
        }
    }

    /// Record one emission; true when an update should propagate.
    pub fn admit(&mut self) -> bool {
        self.since_last += 1;
        if self.since_last >= self.interval {
            self.since_last = 0;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.since_last = 0;
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

fn process_sse_line(
    line: &str,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
    finish_reason: &mut Option<String>,
) -> bool {
    let Some(payload) = extract_data_payload(line) else {
        return false;
    };

    if payload.is_empty() {
        return false;
    }

    if payload == DONE_SENTINEL {
        let _ = tx.send((
            StreamMessage::End {
                finish_reason: finish_reason.take(),
            },
            stream_id,
        ));
        return true;
    }

    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "Skipping malformed stream frame");
            return false;
        }
    };

    // Keep-alive noise from some providers.
    if value.get("type").and_then(|t| t.as_str()) == Some("comment") {
        return false;
    }

    if value.get("error").is_some() {
        let _ = tx.send((
            StreamMessage::Error(format_api_error(payload)),
            stream_id,
        ));
        let _ = tx.send((StreamMessage::End { finish_reason: None }, stream_id));
        return true;
    }

    let response: ChatResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "Skipping frame with unexpected shape");
            return false;
        }
    };

    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                let _ = tx.send((StreamMessage::Chunk(content), stream_id));
            }
        }
        if let Some(fragments) = choice.delta.tool_calls {
            if !fragments.is_empty() {
                let _ = tx.send((StreamMessage::ToolCalls(fragments), stream_id));
            }
        }
        if let Some(reason) = choice.finish_reason {
            *finish_reason = Some(reason);
        }
    }

    false
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API error: <empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("API error: {summary}");
            }
        }
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            return format!("API error:\n{pretty_json}");
        }
    }

    format!("API error: {trimmed}")
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub api_messages: Vec<ChatMessage>,
    pub tools: Vec<ChatToolDefinition>,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_stream(&self, params: StreamParams) {
        let tx_clone = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                api_key,
                model,
                api_messages,
                tools,
                cancel_token,
                stream_id,
            } = params;

            let request = ChatRequest::new(model, api_messages, true).with_tools(tools);

            tokio::select! {
                _ = async {
                    let chat_url = construct_api_url(&base_url, "chat/completions");
                    let http_request = client
                        .post(chat_url)
                        .header("Content-Type", "application/json")
                        .bearer_auth(&api_key);

                    match http_request.json(&request).send().await {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let error_text = response
                                    .text()
                                    .await
                                    .unwrap_or_else(|_| "<no body>".to_string());
                                let _ = tx_clone.send((
                                    StreamMessage::Error(format_api_error(&error_text)),
                                    stream_id,
                                ));
                                let _ = tx_clone
                                    .send((StreamMessage::End { finish_reason: None }, stream_id));
                                return;
                            }

                            let mut stream = response.bytes_stream();
                            let mut buffer: Vec<u8> = Vec::new();
                            let mut finish_reason: Option<String> = None;

                            while let Some(chunk) = stream.next().await {
                                if cancel_token.is_cancelled() {
                                    return;
                                }

                                if let Ok(chunk_bytes) = chunk {
                                    buffer.extend_from_slice(&chunk_bytes);

                                    while let Some(newline_pos) = memchr(b'\n', &buffer) {
                                        let line_str =
                                            match std::str::from_utf8(&buffer[..newline_pos]) {
                                                Ok(s) => s.trim().to_string(),
                                                Err(err) => {
                                                    debug!(%err, "Invalid UTF-8 in stream");
                                                    buffer.drain(..=newline_pos);
                                                    continue;
                                                }
                                            };

                                        let should_end = process_sse_line(
                                            &line_str,
                                            &tx_clone,
                                            stream_id,
                                            &mut finish_reason,
                                        );
                                        buffer.drain(..=newline_pos);
                                        if should_end {
                                            return;
                                        }
                                    }
                                }
                            }

                            let _ = tx_clone.send((
                                StreamMessage::End {
                                    finish_reason: finish_reason.take(),
                                },
                                stream_id,
                            ));
                        }
                        Err(e) => {
                            let _ = tx_clone.send((
                                StreamMessage::Error(format_api_error(&e.to_string())),
                                stream_id,
                            ));
                            let _ = tx_clone
                                .send((StreamMessage::End { finish_reason: None }, stream_id));
                        }
                    }
                } => {}
                _ = cancel_token.cancelled() => {}
            }
        });
    }

    #[cfg(test)]
    pub fn send_for_test(&self, message: StreamMessage, stream_id: u64) {
        let _ = self.tx.send((message, stream_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<(StreamMessage, u64)>) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while let Ok((message, _)) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn content_and_tool_deltas_are_decoded() {
        let (service, mut rx) = ChatStreamService::new();
        let mut finish = None;

        let lines = [
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add_numbers","arguments":"{\"a\""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for line in lines {
            assert!(!process_sse_line(line, &service.tx, 1, &mut finish));
        }
        assert!(process_sse_line("data: [DONE]", &service.tx, 1, &mut finish));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 4);
        assert!(matches!(&messages[0], StreamMessage::Chunk(c) if c == "Hel"));
        assert!(matches!(&messages[1], StreamMessage::Chunk(c) if c == "lo"));
        match &messages[2] {
            StreamMessage::ToolCalls(fragments) => {
                assert_eq!(fragments[0].id.as_deref(), Some("call_1"));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
        match &messages[3] {
            StreamMessage::End { finish_reason } => {
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("expected end, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_skipped_without_ending_the_stream() {
        let (service, mut rx) = ChatStreamService::new();
        let mut finish = None;

        assert!(!process_sse_line("data: {not json", &service.tx, 1, &mut finish));
        assert!(!process_sse_line("data:", &service.tx, 1, &mut finish));
        assert!(!process_sse_line(
            r#"data: {"type":"comment","text":"keep-alive"}"#,
            &service.tx,
            1,
            &mut finish
        ));
        assert!(!process_sse_line(
            r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
            &service.tx,
            1,
            &mut finish
        ));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], StreamMessage::Chunk(c) if c == "ok"));
    }

    #[test]
    fn fragmentation_does_not_change_decoded_content() {
        // The same payload decoded as one frame per line or split across
        // process calls accumulates to identical content.
        let full = [
            r#"data: {"choices":[{"delta":{"content":"2+"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"2="}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"4"}}]}"#,
        ];
        let (service, mut rx) = ChatStreamService::new();
        let mut finish = None;
        for line in full {
            process_sse_line(line, &service.tx, 1, &mut finish);
        }
        let accumulated: String = drain(&mut rx)
            .into_iter()
            .filter_map(|message| match message {
                StreamMessage::Chunk(content) => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(accumulated, "2+2=4");
    }

    #[test]
    fn error_frames_end_the_stream() {
        let (service, mut rx) = ChatStreamService::new();
        let mut finish = None;
        let ended = process_sse_line(
            r#"data: {"error":{"message":"model overloaded"}}"#,
            &service.tx,
            7,
            &mut finish,
        );
        assert!(ended);
        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[0],
            StreamMessage::Error(text) if text == "API error: model overloaded"
        ));
        assert!(matches!(&messages[1], StreamMessage::End { .. }));
    }

    #[test]
    fn throttle_admits_every_sixth_emission() {
        let mut throttle = UpdateThrottle::default();
        let admitted: Vec<bool> = (0..13).map(|_| throttle.admit()).collect();
        let count = admitted.iter().filter(|&&a| a).count();
        assert_eq!(count, 2);
        assert!(admitted[5]);
        assert!(admitted[11]);
    }

    #[test]
    fn format_api_error_summarizes_json_bodies() {
        let raw = r#"{"error":{"message":"  model   overloaded "}}"#;
        assert_eq!(format_api_error(raw), "API error: model overloaded");
        assert_eq!(format_api_error("plain failure"), "API error: plain failure");
    }
}
