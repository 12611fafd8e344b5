//! Reassembly of fragmented tool calls.
//!
//! Providers stream tool calls in pieces: the call id and function name
//! arrive once, the argument string as fragments spread over many frames,
//! all tagged with the call's index. The accumulator merges fragments into
//! complete calls and is only drained once the stream has signalled
//! completion, so partial calls never reach the executor.

use serde_json::Value;
use uuid::Uuid;

use crate::api::{ChatToolCall, ChatToolCallDelta, ChatToolCallFunction};

/// Reserved key preserving unparseable argument text, so execution can still
/// report a structured failure instead of raising.
pub const RAW_ARGUMENTS_KEY: &str = "_raw";

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: Vec<PartialCall>,
}

impl ToolCallAccumulator {
    pub fn absorb(&mut self, fragments: Vec<ChatToolCallDelta>) {
        for fragment in fragments {
            let index = fragment
                .index
                .map(|i| i as usize)
                .unwrap_or_else(|| self.slots.len().saturating_sub(1));
            if self.slots.len() <= index {
                self.slots.resize_with(index + 1, PartialCall::default);
            }
            let slot = &mut self.slots[index];

            // The id is stable once first observed.
            if slot.id.is_none() {
                if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                    slot.id = Some(id);
                }
            }

            if let Some(function) = fragment.function {
                if slot.name.is_none() {
                    if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                        slot.name = Some(name);
                    }
                }
                if let Some(arguments) = function.arguments {
                    slot.arguments.push_str(&arguments);
                }
            }
        }
    }

    pub fn has_calls(&self) -> bool {
        self.slots.iter().any(|slot| slot.name.is_some())
    }

    /// Drain into complete calls, in index order. Slots that never received a
    /// function name are dropped; a missing id gets a generated one so result
    /// correlation still works.
    pub fn finish(self) -> Vec<ChatToolCall> {
        self.slots
            .into_iter()
            .filter_map(|slot| {
                let name = slot.name?;
                Some(ChatToolCall {
                    id: slot
                        .id
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    kind: "function".to_string(),
                    function: ChatToolCallFunction {
                        name,
                        arguments: slot.arguments,
                    },
                })
            })
            .collect()
    }
}

/// Parse a complete argument string, preserving unparseable text under
/// [`RAW_ARGUMENTS_KEY`].
pub fn parse_tool_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::json!({ RAW_ARGUMENTS_KEY: raw }))
}

/// Substitute per-property schema defaults for omitted optional parameters.
pub fn apply_schema_defaults(arguments: &mut Value, parameters: &Value) {
    let Some(arguments) = arguments.as_object_mut() else {
        return;
    };
    let Some(properties) = parameters.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (key, property) in properties {
        if arguments.contains_key(key) {
            continue;
        }
        if let Some(default) = property.get("default") {
            arguments.insert(key.clone(), default.clone());
        }
    }
}
