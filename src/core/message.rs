use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::{ChatMessage, ChatToolCall};

/// Transcript roles. `ToolExecution` is display-only and is filtered out of
/// every outgoing request; the other roles map one-to-one onto API roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    ToolExecution,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::ToolExecution => "tool_execution",
        }
    }

    /// Whether messages with this role are transmitted to the API.
    pub fn is_api_role(self) -> bool {
        !matches!(self, Role::ToolExecution)
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "tool_execution" => Ok(Role::ToolExecution),
            _ => Err(format!("invalid transcript role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Display-only pairing of a tool call with its resolved arguments and the
/// result it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_name: String,
    pub tool_call_id: String,
    /// Arguments after JSON parsing, with schema defaults substituted for
    /// omitted optional parameters.
    pub arguments: Value,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_execution: Option<ToolExecutionRecord>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
            tool_execution: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message carrying the tool calls a turn requested.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ChatToolCall>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.tool_calls = Some(calls);
        message
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn tool_execution(record: ToolExecutionRecord) -> Self {
        let mut message = Self::new(Role::ToolExecution, String::new());
        message.tool_execution = Some(record);
        message
    }

    /// Map to the wire shape, or `None` for display-only roles.
    pub fn to_api_message(&self) -> Option<ChatMessage> {
        if !self.role.is_api_role() {
            return None;
        }
        Some(ChatMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: self.tool_calls.clone(),
        })
    }
}
