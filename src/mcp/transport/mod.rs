//! Shared MCP transport plumbing.
//!
//! Two wire transports exist: streamable HTTP (request/response over POST,
//! reply possibly wrapped in a short event stream) and legacy SSE (a
//! persistent event stream carrying replies out of band). This module holds
//! the pieces both need: transport selection, SSE event parsing, and the
//! session header set.

use serde_json::Value;

pub mod sse;
pub mod streamable_http;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_SSE_ACCEPT: &str = "text/event-stream";

/// Header name variants under which the session id is sent, for
/// compatibility with servers that only inspect one of them.
pub const SESSION_ID_HEADERS: [&str; 3] = ["X-Session-ID", "Session-ID", "MCP-Session-ID"];

/// Transport selection as configured. `Auto` resolves to a concrete kind by
/// probing the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum McpTransportChoice {
    #[default]
    Auto,
    StreamableHttp,
    SseLegacy,
}

/// A concrete, detected transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    SseLegacy,
}

impl McpTransportChoice {
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.unwrap_or("auto").to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(McpTransportChoice::Auto),
            "streamable-http" | "streamable_http" | "http" => {
                Ok(McpTransportChoice::StreamableHttp)
            }
            "sse" | "sse-legacy" | "sse_legacy" => Ok(McpTransportChoice::SseLegacy),
            other => Err(format!("Unsupported MCP transport: {other}")),
        }
    }

    pub fn fixed(self) -> Option<McpTransportKind> {
        match self {
            McpTransportChoice::Auto => None,
            McpTransportChoice::StreamableHttp => Some(McpTransportKind::StreamableHttp),
            McpTransportChoice::SseLegacy => Some(McpTransportKind::SseLegacy),
        }
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn response_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// One parsed SSE event. Events without an explicit `event:` field carry the
/// default name `message`.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Incremental SSE parser: bytes in, complete events out. An event ends at a
/// blank line; multiple `data:` lines within one event are joined with
/// newlines per the SSE format.
#[derive(Default)]
pub struct SseEventBuffer {
    bytes: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseEventBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.bytes.extend_from_slice(chunk);
        self.drain(false)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.bytes[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.bytes[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line = String::from_utf8_lossy(&self.bytes[search_index..line_end]).into_owned();
            search_index = newline_index + 1;

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            self.absorb_field(&line);
        }

        if search_index > 0 {
            self.bytes.drain(..search_index);
        }

        if flush {
            if !self.bytes.is_empty() {
                let line = String::from_utf8_lossy(&self.bytes).into_owned();
                self.bytes.clear();
                if !line.is_empty() {
                    self.absorb_field(&line);
                }
            }
            if let Some(event) = self.take_event() {
                events.push(event);
            }
        }

        events
    }

    fn absorb_field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim().to_string());
        }
        // id: and retry: fields are irrelevant here.
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event = self.event_name.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}
