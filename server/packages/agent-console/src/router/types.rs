use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::service::{SessionSpec, TurnEvent};
use crate::store::{MessageRecord, SessionLogRecord, SessionRecord, UserRecord};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UserCreate {
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UserRead {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRecord> for UserRead {
    fn from(value: UserRecord) -> Self {
        Self {
            id: value.id,
            username: value.username,
            display_name: value.display_name,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionCreate {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// One of `default`, `acceptEdits`, `plan`, `bypassPermissions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

impl From<SessionCreate> for SessionSpec {
    fn from(value: SessionCreate) -> Self {
        Self {
            user_id: value.user_id,
            title: value.title,
            model: value.model,
            permission_mode: value.permission_mode,
            system_prompt: value.system_prompt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionRead {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub status: String,
    pub model: String,
    pub permission_mode: String,
    pub system_prompt: Option<String>,
    /// Agent-side conversation handle used to resume the conversation.
    pub claude_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionRead {
    fn from(value: SessionRecord) -> Self {
        Self {
            id: value.id,
            user_id: value.user_id,
            title: value.title,
            status: value.status,
            model: value.model,
            permission_mode: value.permission_mode,
            system_prompt: value.system_prompt,
            claude_session_id: value.claude_session_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageRead {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub message_type: String,
    #[schema(value_type = Object)]
    pub payload: Value,
    pub raw_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRecord> for MessageRead {
    fn from(value: MessageRecord) -> Self {
        Self {
            id: value.id,
            session_id: value.session_id,
            role: value.role,
            message_type: value.message_type,
            payload: value.payload,
            raw_text: value.raw_text,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionLogRead {
    pub id: Uuid,
    pub session_id: Uuid,
    pub event_type: String,
    #[schema(value_type = Object)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl From<SessionLogRecord> for SessionLogRead {
    fn from(value: SessionLogRecord) -> Self {
        Self {
            id: value.id,
            session_id: value.session_id,
            event_type: value.event_type,
            details: value.details,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PromptRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct StreamErrorPayload {
    pub message: String,
    /// Id of the `SDK_ERROR` session log holding the full details.
    pub log_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One server-sent event of a streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum StreamEnvelope {
    Message(MessageRead),
    Error(StreamErrorPayload),
}

impl From<TurnEvent> for StreamEnvelope {
    fn from(value: TurnEvent) -> Self {
        match value {
            TurnEvent::Message(record) => Self::Message(record.into()),
            TurnEvent::Error { message, log } => Self::Error(StreamErrorPayload {
                message,
                log_id: log.id,
                created_at: log.created_at,
            }),
        }
    }
}
