//! Turn orchestration.
//!
//! A session owns the transcript and drives one turn at a time through a
//! small state machine: `Idle → Streaming → (ToolExecuting → Streaming)* →
//! Idle`. When a streaming request fails before producing anything, the turn
//! retries once through the non-streaming endpoint and stays non-streaming
//! for the rest of that turn; if the fallback also fails the turn ends in an
//! error.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatCompletionResponse, ChatMessage, ChatRequest, ChatToolCall};
use crate::core::chat_stream::{
    format_api_error, ChatStreamService, StreamMessage, StreamParams, UpdateThrottle,
};
use crate::core::message::{Message, Role, ToolExecutionRecord};
use crate::core::tool_calls::ToolCallAccumulator;
use crate::tools::ToolRegistry;
use crate::utils::url::construct_api_url;

/// Default upper bound on tool rounds within one turn, guarding against a
/// model that keeps requesting tools forever.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    ToolExecuting,
    Fallback,
}

#[derive(Debug)]
pub enum SessionError {
    MissingApiKey,
    Busy,
    Turn(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::MissingApiKey => write!(f, "No API key configured."),
            SessionError::Busy => write!(f, "A turn is already in progress."),
            SessionError::Turn(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// What observers of a session see while a turn runs. Content deltas are
/// throttled; everything buffered is flushed before the turn settles.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ContentDelta { content: String },
    ToolCallsReady { calls: Vec<ChatToolCall> },
    ToolExecuted { record: ToolExecutionRecord },
    Completed { content: String },
    Error { message: String },
}

pub struct SessionParams {
    pub http: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Tool rounds allowed within one turn before the turn fails.
    pub max_tool_rounds: usize,
}

struct RoundOutcome {
    content: String,
    calls: Vec<ChatToolCall>,
}

enum RoundError {
    /// The request produced nothing; a non-streaming retry is safe.
    Retryable(String),
    /// Content already reached the transcript, or the failure is not one a
    /// retry could fix.
    Fatal(String),
}

pub struct ChatSession {
    params: SessionParams,
    registry: ToolRegistry,
    messages: Vec<Message>,
    state: SessionState,
    stream: ChatStreamService,
    stream_rx: mpsc::UnboundedReceiver<(StreamMessage, u64)>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_stream_id: u64,
    cancel: CancellationToken,
    use_streaming: bool,
    #[cfg(test)]
    passive: bool,
}

impl ChatSession {
    pub fn new(
        params: SessionParams,
        registry: ToolRegistry,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        if params.api_key.trim().is_empty() {
            return Err(SessionError::MissingApiKey);
        }
        let (stream, stream_rx) = ChatStreamService::new();
        let (events, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                params,
                registry,
                messages: Vec::new(),
                state: SessionState::Idle,
                stream,
                stream_rx,
                events,
                next_stream_id: 1,
                cancel: CancellationToken::new(),
                use_streaming: true,
                #[cfg(test)]
                passive: false,
            },
            events_rx,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Token cancelling the current turn. Refreshed at the start of each
    /// turn, so grab it after `send_message` has been entered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one full turn: user message in, assistant answer out, with as many
    /// tool rounds in between as the model requests.
    pub async fn send_message(&mut self, content: &str) -> Result<String, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.use_streaming = true;
        self.messages.push(Message::user(content));

        let result = self.run_turn().await;
        self.state = SessionState::Idle;
        match result {
            Ok(content) => {
                let _ = self.events.send(SessionEvent::Completed {
                    content: content.clone(),
                });
                Ok(content)
            }
            Err(message) => {
                let _ = self.events.send(SessionEvent::Error {
                    message: message.clone(),
                });
                Err(SessionError::Turn(message))
            }
        }
    }

    async fn run_turn(&mut self) -> Result<String, String> {
        let max_tool_rounds = self.params.max_tool_rounds.max(1);
        for _ in 0..max_tool_rounds {
            let round = if self.use_streaming {
                match self.stream_round().await {
                    Ok(round) => round,
                    Err(RoundError::Fatal(message)) => return Err(message),
                    Err(RoundError::Retryable(message)) => {
                        warn!(%message, "Streaming request failed, retrying without streaming");
                        self.use_streaming = false;
                        match self.completion_round().await {
                            Ok(round) => round,
                            Err(fallback) => {
                                let message =
                                    format!("{message} (fallback also failed: {fallback})");
                                // Both paths failed; the error becomes the
                                // assistant's answer for this turn.
                                self.messages.push(Message::assistant(&message));
                                return Err(message);
                            }
                        }
                    }
                }
            } else {
                self.completion_round().await?
            };

            if round.calls.is_empty() {
                if !round.content.is_empty() {
                    self.messages.push(Message::assistant(&round.content));
                }
                return Ok(round.content);
            }

            self.messages.push(Message::assistant_tool_calls(
                round.content,
                round.calls.clone(),
            ));
            let _ = self.events.send(SessionEvent::ToolCallsReady {
                calls: round.calls.clone(),
            });

            self.state = SessionState::ToolExecuting;
            let outcomes = self.registry.execute(&round.calls, None).await;
            for outcome in outcomes {
                let record = ToolExecutionRecord {
                    tool_name: outcome.call.function.name.clone(),
                    tool_call_id: outcome.call.id.clone(),
                    arguments: outcome.arguments,
                    result: serde_json::from_str(&outcome.content)
                        .unwrap_or_else(|_| serde_json::Value::String(outcome.content.clone())),
                    error: outcome.error,
                };
                let _ = self.events.send(SessionEvent::ToolExecuted {
                    record: record.clone(),
                });
                self.messages.push(Message::tool_execution(record));
                self.messages
                    .push(Message::tool_result(outcome.call.id, outcome.content));
            }
        }
        Err(format!(
            "Gave up after {max_tool_rounds} consecutive tool rounds."
        ))
    }

    /// Everything the next request transmits: the system prompt followed by
    /// the transcript minus display-only messages.
    fn api_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        if let Some(prompt) = &self.params.system_prompt {
            out.push(ChatMessage::text(Role::System.as_str(), prompt));
        }
        out.extend(self.messages.iter().filter_map(Message::to_api_message));
        out
    }

    async fn stream_round(&mut self) -> Result<RoundOutcome, RoundError> {
        self.state = SessionState::Streaming;
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let cancel = self.cancel.clone();

        #[cfg(test)]
        let spawn = !self.passive;
        #[cfg(not(test))]
        let spawn = true;
        if spawn {
            self.stream.spawn_stream(StreamParams {
                client: self.params.http.clone(),
                base_url: self.params.base_url.clone(),
                api_key: self.params.api_key.clone(),
                model: self.params.model.clone(),
                api_messages: self.api_messages(),
                tools: self.registry.definitions().to_vec(),
                cancel_token: cancel.clone(),
                stream_id,
            });
        }

        let mut content = String::new();
        let mut pending_delta = String::new();
        let mut throttle = UpdateThrottle::default();
        let mut accumulator = ToolCallAccumulator::default();
        let mut stream_error: Option<String> = None;

        loop {
            let received = tokio::select! {
                received = self.stream_rx.recv() => received,
                _ = cancel.cancelled() => {
                    return Err(RoundError::Fatal("Cancelled.".to_string()));
                }
            };
            let Some((message, id)) = received else {
                return Err(RoundError::Fatal("Stream channel closed.".to_string()));
            };
            if id != stream_id {
                // Leftovers from a cancelled or superseded stream.
                debug!(id, stream_id, "Dropping stale stream event");
                continue;
            }
            match message {
                StreamMessage::Chunk(chunk) => {
                    content.push_str(&chunk);
                    pending_delta.push_str(&chunk);
                    if throttle.admit() && !pending_delta.is_empty() {
                        let _ = self.events.send(SessionEvent::ContentDelta {
                            content: std::mem::take(&mut pending_delta),
                        });
                    }
                }
                StreamMessage::ToolCalls(fragments) => accumulator.absorb(fragments),
                StreamMessage::Error(message) => stream_error = Some(message),
                StreamMessage::End { .. } => break,
            }
        }

        // Forced flush; the throttle never withholds trailing content.
        if !pending_delta.is_empty() {
            let _ = self.events.send(SessionEvent::ContentDelta {
                content: std::mem::take(&mut pending_delta),
            });
        }

        if let Some(message) = stream_error {
            if content.is_empty() && !accumulator.has_calls() {
                return Err(RoundError::Retryable(message));
            }
            if !content.is_empty() {
                self.messages.push(Message::assistant(&content));
            }
            return Err(RoundError::Fatal(message));
        }

        Ok(RoundOutcome {
            content,
            calls: accumulator.finish(),
        })
    }

    async fn completion_round(&mut self) -> Result<RoundOutcome, String> {
        self.state = SessionState::Fallback;
        let request = ChatRequest::new(
            self.params.model.clone(),
            self.api_messages(),
            false,
        )
        .with_tools(self.registry.definitions().to_vec());

        let url = construct_api_url(&self.params.base_url, "chat/completions");
        let response = self
            .params
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.params.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(format_api_error(&body));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| format!("Invalid completion response: {err}"))?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| "Completion response had no choices.".to_string())?;

        let content = choice.message.content.unwrap_or_default();
        if !content.is_empty() {
            let _ = self.events.send(SessionEvent::ContentDelta {
                content: content.clone(),
            });
        }
        Ok(RoundOutcome {
            content,
            calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatToolDefinition;
    use crate::tools::ToolHandler;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    struct Adder;

    #[async_trait]
    impl ToolHandler for Adder {
        async fn call(&self, arguments: Value) -> Result<String, String> {
            let a = arguments["a"].as_f64().ok_or("missing a")?;
            let b = arguments["b"].as_f64().ok_or("missing b")?;
            Ok(serde_json::json!({"result": a + b}).to_string())
        }
    }

    fn adder_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ChatToolDefinition::function(
                "add_numbers",
                Some("Add two numbers".to_string()),
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "a": {"type": "number", "default": 10.0},
                        "b": {"type": "number", "default": 5.0}
                    }
                }),
            ),
            Arc::new(Adder),
        );
        registry
    }

    fn test_session(registry: ToolRegistry) -> (ChatSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (mut session, events) = ChatSession::new(
            SessionParams {
                http: reqwest::Client::new(),
                // Unroutable, so an accidental real request fails fast.
                base_url: "http://127.0.0.1:9/v1".to_string(),
                api_key: "test-key".to_string(),
                model: "test-model".to_string(),
                system_prompt: Some("You are terse.".to_string()),
                max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            },
            registry,
        )
        .expect("session");
        session.passive = true;
        (session, events)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn tool_call_fragment(id: &str, name: &str, arguments: &str) -> StreamMessage {
        StreamMessage::ToolCalls(vec![serde_json::from_value(serde_json::json!({
            "index": 0,
            "id": id,
            "function": {"name": name, "arguments": arguments}
        }))
        .expect("fragment")])
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let result = ChatSession::new(
            SessionParams {
                http: reqwest::Client::new(),
                base_url: "http://127.0.0.1:9/v1".to_string(),
                api_key: "  ".to_string(),
                model: "test-model".to_string(),
                system_prompt: None,
                max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            },
            ToolRegistry::new(),
        );
        assert!(matches!(result, Err(SessionError::MissingApiKey)));
    }

    #[tokio::test]
    async fn busy_sessions_reject_new_turns() {
        let (mut session, _events) = test_session(ToolRegistry::new());
        session.state = SessionState::Streaming;
        let err = session.send_message("hello").await.expect_err("busy");
        assert!(matches!(err, SessionError::Busy));
    }

    #[tokio::test]
    async fn plain_turn_streams_and_persists_the_answer() {
        let (mut session, mut events) = test_session(ToolRegistry::new());
        for chunk in ["2+2 ", "equals ", "4"] {
            session
                .stream
                .send_for_test(StreamMessage::Chunk(chunk.to_string()), 1);
        }
        session
            .stream
            .send_for_test(StreamMessage::End { finish_reason: Some("stop".to_string()) }, 1);

        let answer = session.send_message("What is 2+2?").await.expect("turn");
        assert_eq!(answer, "2+2 equals 4");
        assert_eq!(session.state(), SessionState::Idle);

        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(session.messages()[1].content, "2+2 equals 4");

        let events = drain(&mut events);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Completed { content }) if content == "2+2 equals 4"
        ));
    }

    #[tokio::test]
    async fn deltas_are_throttled_with_a_final_flush() {
        let (mut session, mut events) = test_session(ToolRegistry::new());
        for i in 0..7 {
            session
                .stream
                .send_for_test(StreamMessage::Chunk(format!("{i}")), 1);
        }
        session
            .stream
            .send_for_test(StreamMessage::End { finish_reason: None }, 1);

        session.send_message("count").await.expect("turn");

        let deltas: Vec<String> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::ContentDelta { content } => Some(content),
                _ => None,
            })
            .collect();
        // One throttled update for the first six chunks, one forced flush.
        assert_eq!(deltas, vec!["012345".to_string(), "6".to_string()]);
    }

    #[tokio::test]
    async fn tool_rounds_execute_and_feed_results_back() {
        let (mut session, mut events) = test_session(adder_registry());

        // Round one requests a tool call, split across fragments.
        session
            .stream
            .send_for_test(tool_call_fragment("call_1", "add_numbers", "{\"a\""), 1);
        session
            .stream
            .send_for_test(tool_call_fragment("", "", ":2,\"b\":3}"), 1);
        session.stream.send_for_test(
            StreamMessage::End { finish_reason: Some("tool_calls".to_string()) },
            1,
        );
        // Round two answers with the tool result in context.
        session
            .stream
            .send_for_test(StreamMessage::Chunk("The sum is 5.".to_string()), 2);
        session
            .stream
            .send_for_test(StreamMessage::End { finish_reason: Some("stop".to_string()) }, 2);

        let answer = session.send_message("Add 2 and 3").await.expect("turn");
        assert_eq!(answer, "The sum is 5.");

        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::User,
                Role::Assistant,
                Role::ToolExecution,
                Role::Tool,
                Role::Assistant,
            ]
        );

        let execution = session.messages()[2]
            .tool_execution
            .as_ref()
            .expect("record");
        assert_eq!(execution.tool_name, "add_numbers");
        assert_eq!(execution.arguments, serde_json::json!({"a": 2, "b": 3}));
        assert_eq!(execution.result, serde_json::json!({"result": 5.0}));
        assert!(execution.error.is_none());

        let tool_message = &session.messages()[3];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::ToolCallsReady { calls } if calls[0].id == "call_1")));
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::ToolExecuted { record } if record.tool_call_id == "call_1")));
    }

    #[tokio::test]
    async fn display_messages_never_reach_the_wire() {
        let (mut session, _events) = test_session(adder_registry());
        session.messages.push(Message::user("Add 2 and 3"));
        session
            .messages
            .push(Message::tool_execution(ToolExecutionRecord {
                tool_name: "add_numbers".to_string(),
                tool_call_id: "call_1".to_string(),
                arguments: serde_json::json!({"a": 2, "b": 3}),
                result: serde_json::json!({"result": 5}),
                error: None,
            }));

        let api = session.api_messages();
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
    }

    #[tokio::test]
    async fn failed_stream_and_failed_fallback_end_the_turn() {
        let (mut session, mut events) = test_session(ToolRegistry::new());
        session
            .stream
            .send_for_test(StreamMessage::Error("API error: boom".to_string()), 1);
        session
            .stream
            .send_for_test(StreamMessage::End { finish_reason: None }, 1);

        // The fallback request goes to an unroutable address and fails too.
        let err = session.send_message("hello").await.expect_err("turn fails");
        let message = err.to_string();
        assert!(message.contains("API error: boom"));
        assert!(message.contains("fallback also failed"));
        assert_eq!(session.state(), SessionState::Idle);
        // The error is what the transcript records as the assistant's answer.
        let last = session.messages().last().expect("message");
        assert_eq!(last.role, Role::Assistant);
        assert!(last.content.contains("fallback also failed"));
        assert!(matches!(
            drain(&mut events).last(),
            Some(SessionEvent::Error { .. })
        ));
    }

    #[tokio::test]
    async fn errors_after_content_are_fatal_without_retry() {
        let (mut session, _events) = test_session(ToolRegistry::new());
        session
            .stream
            .send_for_test(StreamMessage::Chunk("partial".to_string()), 1);
        session
            .stream
            .send_for_test(StreamMessage::Error("API error: cut off".to_string()), 1);
        session
            .stream
            .send_for_test(StreamMessage::End { finish_reason: None }, 1);

        let err = session.send_message("hello").await.expect_err("turn fails");
        assert_eq!(err.to_string(), "API error: cut off");
        // The partial content survives in the transcript.
        let last = session.messages().last().expect("message");
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "partial");
    }

    #[tokio::test]
    async fn tool_round_cap_is_configurable() {
        let (mut session, _events) = test_session(adder_registry());
        session.params.max_tool_rounds = 1;

        session
            .stream
            .send_for_test(tool_call_fragment("call_1", "add_numbers", "{\"a\":2,\"b\":3}"), 1);
        session.stream.send_for_test(
            StreamMessage::End { finish_reason: Some("tool_calls".to_string()) },
            1,
        );

        let err = session.send_message("Add 2 and 3").await.expect_err("capped");
        assert!(err.to_string().contains("after 1 consecutive tool rounds"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn cancellation_ends_the_turn() {
        let (mut session, _events) = test_session(ToolRegistry::new());
        let token = session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = session.send_message("hello").await.expect_err("cancelled");
        assert!(err.to_string().contains("Cancelled"));
    }
}
