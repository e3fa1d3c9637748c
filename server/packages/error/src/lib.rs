use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    UserNotFound,
    SessionNotFound,
    Storage,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-console:error:invalid_request",
            Self::Conflict => "urn:agent-console:error:conflict",
            Self::UserNotFound => "urn:agent-console:error:user_not_found",
            Self::SessionNotFound => "urn:agent-console:error:session_not_found",
            Self::Storage => "urn:agent-console:error:storage",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::UserNotFound => "User Not Found",
            Self::SessionNotFound => "Session Not Found",
            Self::Storage => "Storage Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::UserNotFound => 404,
            Self::SessionNotFound => 404,
            Self::Storage => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Machine-readable summary of a [`ConsoleError`], used as problem-details extensions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorSummary {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl ConsoleError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::UserNotFound { .. } => ErrorType::UserNotFound,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::Storage { .. } => ErrorType::Storage,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn to_summary(&self) -> ErrorSummary {
        let (user_id, session_id, details) = match self {
            Self::InvalidRequest { .. } => (None, None, None),
            Self::Conflict { message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::UserNotFound { user_id } => (Some(user_id.clone()), None, None),
            Self::SessionNotFound { session_id } => (None, Some(session_id.clone()), None),
            Self::Storage { .. } => (None, None, None),
        };

        ErrorSummary {
            type_: self.error_type(),
            message: self.to_string(),
            user_id,
            session_id,
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let summary = self.to_summary();

        let mut extensions = Map::new();
        if let Some(user_id) = summary.user_id {
            extensions.insert("userId".to_string(), Value::String(user_id));
        }
        if let Some(session_id) = summary.session_id {
            extensions.insert("sessionId".to_string(), Value::String(session_id));
        }
        if let Some(details) = summary.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<ConsoleError> for ProblemDetails {
    fn from(value: ConsoleError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ConsoleError> for ProblemDetails {
    fn from(value: &ConsoleError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_renders_problem_details() {
        let err = ConsoleError::SessionNotFound {
            session_id: "abc".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:agent-console:error:session_not_found");
        assert_eq!(
            problem.extensions.get("sessionId"),
            Some(&Value::String("abc".to_string()))
        );
    }

    #[test]
    fn conflict_carries_message_details() {
        let err = ConsoleError::Conflict {
            message: "Username already exists".to_string(),
        };
        let problem: ProblemDetails = (&err).into();
        assert_eq!(problem.status, 409);
        let details = problem.extensions.get("details").expect("details");
        assert_eq!(details["message"], "Username already exists");
    }
}
