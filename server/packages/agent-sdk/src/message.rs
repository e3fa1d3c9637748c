use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

/// One content block of a user or assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },
    /// A block type this client does not model; kept verbatim.
    Other(Value),
}

impl ContentBlock {
    pub fn from_value(value: Value) -> Self {
        let block_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "text" => match value.get("text").and_then(Value::as_str) {
                Some(text) => Self::Text {
                    text: text.to_string(),
                },
                None => Self::Other(value),
            },
            "thinking" => Self::Thinking {
                thinking: str_field(&value, "thinking").unwrap_or_default(),
                signature: str_field(&value, "signature").unwrap_or_default(),
            },
            "tool_use" => match (str_field(&value, "id"), str_field(&value, "name")) {
                (Some(id), Some(name)) => Self::ToolUse {
                    id,
                    name,
                    input: value.get("input").cloned().unwrap_or(Value::Null),
                },
                _ => Self::Other(value),
            },
            "tool_result" => match str_field(&value, "tool_use_id") {
                Some(tool_use_id) => Self::ToolResult {
                    tool_use_id,
                    content: value.get("content").cloned().filter(|c| !c.is_null()),
                    is_error: value.get("is_error").and_then(Value::as_bool),
                },
                None => Self::Other(value),
            },
            _ => Self::Other(value),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Text { text } => json!({ "type": "text", "text": text }),
            Self::Thinking {
                thinking,
                signature,
            } => json!({ "type": "thinking", "thinking": thinking, "signature": signature }),
            Self::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            Self::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            Self::Other(value) => value.clone(),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(text)) => Self::Text(text.clone()),
            Some(Value::Array(items)) => Self::Blocks(
                items
                    .iter()
                    .cloned()
                    .map(ContentBlock::from_value)
                    .collect(),
            ),
            _ => Self::Blocks(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMessage {
    pub content: MessageContent,
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub model: Option<String>,
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMessage {
    pub subtype: Option<String>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMessage {
    pub subtype: Option<String>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub is_error: Option<bool>,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Value>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub uuid: Option<String>,
    pub session_id: Option<String>,
    pub event: Option<Value>,
    pub data: Option<Value>,
    pub parent_tool_use_id: Option<String>,
}

/// A raw message produced by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
    Result(ResultMessage),
    StreamEvent(StreamEvent),
    /// Any message kind this client does not model.
    Unknown { kind: String, raw: Value },
}

impl SdkMessage {
    /// Name of the message kind as recorded in persisted payloads.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::User(_) => "UserMessage",
            Self::Assistant(_) => "AssistantMessage",
            Self::System(_) => "SystemMessage",
            Self::Result(_) => "ResultMessage",
            Self::StreamEvent(_) => "StreamEvent",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Parses one line of the agent's `stream-json` output.
    pub fn from_json(value: Value) -> Self {
        let message_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match message_type {
            "user" => Self::User(UserMessage {
                content: MessageContent::from_value(value.pointer("/message/content")),
                parent_tool_use_id: str_field(&value, "parent_tool_use_id"),
            }),
            "assistant" => {
                let content = match MessageContent::from_value(value.pointer("/message/content"))
                {
                    MessageContent::Blocks(blocks) => blocks,
                    MessageContent::Text(text) => vec![ContentBlock::Text { text }],
                };
                Self::Assistant(AssistantMessage {
                    content,
                    model: value
                        .pointer("/message/model")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    parent_tool_use_id: str_field(&value, "parent_tool_use_id"),
                })
            }
            "system" => Self::System(SystemMessage {
                subtype: str_field(&value, "subtype"),
                data: value.as_object().cloned().unwrap_or_default(),
            }),
            "result" => Self::Result(ResultMessage {
                subtype: str_field(&value, "subtype"),
                duration_ms: value.get("duration_ms").and_then(Value::as_u64),
                duration_api_ms: value.get("duration_api_ms").and_then(Value::as_u64),
                is_error: value.get("is_error").and_then(Value::as_bool),
                num_turns: value
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .and_then(|turns| u32::try_from(turns).ok()),
                session_id: str_field(&value, "session_id"),
                total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
                usage: value.get("usage").cloned().filter(|usage| !usage.is_null()),
                result: str_field(&value, "result"),
            }),
            "stream_event" => Self::StreamEvent(StreamEvent {
                uuid: str_field(&value, "uuid"),
                session_id: str_field(&value, "session_id"),
                event: value.get("event").cloned(),
                data: value.get("data").cloned(),
                parent_tool_use_id: str_field(&value, "parent_tool_use_id"),
            }),
            "" => Self::Unknown {
                kind: "Unknown".to_string(),
                raw: value,
            },
            other => Self::Unknown {
                kind: other.to_string(),
                raw: value,
            },
        }
    }
}

impl Serialize for SdkMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::User(message) => message.serialize(serializer),
            Self::Assistant(message) => message.serialize(serializer),
            Self::System(message) => message.serialize(serializer),
            Self::Result(message) => message.serialize(serializer),
            Self::StreamEvent(message) => message.serialize(serializer),
            Self::Unknown { raw, .. } => raw.serialize(serializer),
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_line_with_tool_use() {
        let message = SdkMessage::from_json(json!({
            "type": "assistant",
            "message": {
                "model": "claude-sonnet-4-5",
                "content": [
                    { "type": "text", "text": "Let me ask." },
                    { "type": "tool_use", "id": "t1", "name": "AskUserQuestion", "input": {} }
                ]
            },
            "parent_tool_use_id": null
        }));
        let SdkMessage::Assistant(assistant) = message else {
            panic!("expected assistant message");
        };
        assert_eq!(assistant.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(assistant.content.len(), 2);
        assert!(matches!(
            &assistant.content[1],
            ContentBlock::ToolUse { name, .. } if name == "AskUserQuestion"
        ));
    }

    #[test]
    fn parses_result_line() {
        let message = SdkMessage::from_json(json!({
            "type": "result",
            "subtype": "success",
            "duration_ms": 1200,
            "num_turns": 2,
            "session_id": "abc",
            "total_cost_usd": 0.01,
            "result": "done",
            "is_error": false
        }));
        assert!(message.is_result());
        assert_eq!(message.kind_name(), "ResultMessage");
        let SdkMessage::Result(result) = message else {
            panic!("expected result message");
        };
        assert_eq!(result.session_id.as_deref(), Some("abc"));
        assert_eq!(result.num_turns, Some(2));
    }

    #[test]
    fn unknown_kinds_keep_raw_payload() {
        let raw = json!({ "type": "rate_limit", "retry_after": 3 });
        let message = SdkMessage::from_json(raw.clone());
        assert_eq!(message.kind_name(), "rate_limit");
        assert_eq!(serde_json::to_value(&message).expect("serialize"), raw);
    }

    #[test]
    fn unrecognized_blocks_are_preserved() {
        let block = json!({ "type": "image", "source": { "data": "..." } });
        assert_eq!(ContentBlock::from_value(block.clone()).to_value(), block);
    }
}
