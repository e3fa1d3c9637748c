//! Conversion of raw agent messages into the persisted/streamed envelope.
//!
//! Every envelope serializes to `{type, role, ...kind fields, raw}` where
//! `raw` is a JSON-safe copy of the original message.

use std::fmt::Debug;

use agent_console_agent_sdk::{MessageContent, SdkMessage};
use serde::Serialize;
use serde_json::{json, Map, Value};

mod json_safe;

pub const SYSTEM_SUBTYPE_INFO: &str = "info";
pub const RESULT_SUBTYPE_SUCCESS: &str = "success";
pub const MESSAGE_TYPE_RESULT: &str = "ResultMessage";
pub const MESSAGE_TYPE_ASSISTANT: &str = "AssistantMessage";
pub const MESSAGE_TYPE_PROMPT: &str = "prompt";

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Result,
    StreamEvent,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Result => "result",
            Self::StreamEvent => "stream_event",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    User {
        content: Value,
        raw: Value,
    },
    Assistant {
        model: Option<String>,
        content: Value,
        raw: Value,
    },
    System {
        subtype: String,
        data: Value,
        raw: Value,
    },
    Result {
        subtype: String,
        duration_ms: Option<u64>,
        duration_api_ms: Option<u64>,
        num_turns: Option<u32>,
        result: Option<String>,
        is_error: bool,
        session_id: Option<String>,
        total_cost_usd: Option<f64>,
        usage: Value,
        raw: Value,
    },
    StreamEvent {
        event: Value,
        data: Value,
        raw: Value,
    },
    Unknown {
        kind: String,
        raw: Value,
    },
}

impl Envelope {
    pub fn from_message(message: &SdkMessage) -> Self {
        let raw = to_json_safe(message);
        match message {
            SdkMessage::User(user) => Self::User {
                content: normalize_content(&user.content),
                raw,
            },
            SdkMessage::Assistant(assistant) => Self::Assistant {
                model: assistant.model.clone(),
                content: Value::Array(assistant.content.iter().map(to_json_safe).collect()),
                raw,
            },
            SdkMessage::System(system) => Self::System {
                subtype: system
                    .subtype
                    .clone()
                    .unwrap_or_else(|| SYSTEM_SUBTYPE_INFO.to_string()),
                data: to_json_safe(&system.data),
                raw,
            },
            SdkMessage::Result(result) => Self::Result {
                subtype: result
                    .subtype
                    .clone()
                    .unwrap_or_else(|| RESULT_SUBTYPE_SUCCESS.to_string()),
                duration_ms: result.duration_ms,
                duration_api_ms: result.duration_api_ms,
                num_turns: result.num_turns,
                result: result.result.clone(),
                is_error: result.is_error.unwrap_or(false),
                session_id: result.session_id.clone(),
                total_cost_usd: result.total_cost_usd,
                usage: to_json_safe(&result.usage),
                raw,
            },
            SdkMessage::StreamEvent(event) => Self::StreamEvent {
                event: to_json_safe(&event.event),
                data: to_json_safe(&event.data),
                raw,
            },
            SdkMessage::Unknown { kind, .. } => Self::Unknown {
                kind: kind.clone(),
                raw,
            },
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::System { .. } => Role::System,
            Self::Result { .. } => Role::Result,
            Self::StreamEvent { .. } => Role::StreamEvent,
            Self::Unknown { .. } => Role::Unknown,
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            Self::User { .. } => "UserMessage",
            Self::Assistant { .. } => MESSAGE_TYPE_ASSISTANT,
            Self::System { .. } => "SystemMessage",
            Self::Result { .. } => MESSAGE_TYPE_RESULT,
            Self::StreamEvent { .. } => "StreamEvent",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// External conversation handle carried by this message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Result { session_id, .. } => session_id.as_deref(),
            Self::System { subtype, data, .. } if subtype == "init" => {
                data.get("session_id").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    /// True when an assistant message's content invokes the named tool.
    pub fn invokes_tool(&self, tool_name: &str) -> bool {
        let Self::Assistant { content, .. } = self else {
            return false;
        };
        content.as_array().is_some_and(|items| {
            items
                .iter()
                .any(|item| item.get("name").and_then(Value::as_str) == Some(tool_name))
        })
    }

    pub fn to_value(&self) -> Value {
        let mut body = match self {
            Self::User { content, .. } => json!({ "content": content }),
            Self::Assistant { model, content, .. } => json!({ "model": model, "content": content }),
            Self::System { subtype, data, .. } => json!({ "subtype": subtype, "data": data }),
            Self::Result {
                subtype,
                duration_ms,
                duration_api_ms,
                num_turns,
                result,
                is_error,
                session_id,
                total_cost_usd,
                usage,
                ..
            } => json!({
                "subtype": subtype,
                "duration_ms": duration_ms,
                "duration_api_ms": duration_api_ms,
                "num_turns": num_turns,
                "result": result,
                "is_error": is_error,
                "session_id": session_id,
                "total_cost_usd": total_cost_usd,
                "usage": usage,
            }),
            Self::StreamEvent { event, data, .. } => json!({ "event": event, "data": data }),
            Self::Unknown { .. } => json!({}),
        };
        if let Some(fields) = body.as_object_mut() {
            fields.insert("type".to_string(), json!(self.message_type()));
            fields.insert("role".to_string(), json!(self.role().as_str()));
            fields.insert("raw".to_string(), self.raw().clone());
        }
        body
    }

    fn raw(&self) -> &Value {
        match self {
            Self::User { raw, .. }
            | Self::Assistant { raw, .. }
            | Self::System { raw, .. }
            | Self::Result { raw, .. }
            | Self::StreamEvent { raw, .. }
            | Self::Unknown { raw, .. } => raw,
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

pub fn serialize(message: &SdkMessage) -> Envelope {
    Envelope::from_message(message)
}

/// Plain-text rendering of an envelope: joined text blocks for user and
/// assistant messages, the result text for results, nothing otherwise.
pub fn extract_text(envelope: &Envelope) -> Option<String> {
    match envelope {
        Envelope::User { content, .. } | Envelope::Assistant { content, .. } => match content {
            Value::String(text) => Some(text.clone()),
            Value::Array(items) => {
                let texts = items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
            _ => None,
        },
        Envelope::Result {
            result: Some(result),
            ..
        } if !result.is_empty() => Some(result.clone()),
        _ => None,
    }
}

fn normalize_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(blocks.iter().map(to_json_safe).collect()),
    }
}

/// JSON-safe deep copy of any serializable value. Never fails: map keys that
/// are not strings are stringified in place, values whose `Serialize` impl
/// errors fall back to their debug rendering, and nesting deeper than
/// `MAX_DEPTH` is cut off.
pub fn to_json_safe<T: Serialize + Debug + ?Sized>(value: &T) -> Value {
    match json_safe::to_value(value) {
        Ok(value) => bound_depth(value, 0),
        Err(err) => {
            tracing::debug!(error = %err, "value is not JSON representable; stringifying");
            Value::String(format!("{value:?}"))
        }
    }
}

fn bound_depth(value: Value, depth: usize) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => {
            Value::String(format!("<truncated at depth {MAX_DEPTH}>"))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| bound_depth(item, depth + 1))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, item)| (key, bound_depth(item, depth + 1)))
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}
