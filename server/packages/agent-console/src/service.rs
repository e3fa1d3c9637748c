//! Orchestration of users, sessions and streaming agent turns.

use std::error::Error as _;
use std::pin::Pin;
use std::sync::Arc;

use agent_console_agent_sdk::{PermissionMode, SdkError, SdkMessage};
use agent_console_error::ConsoleError;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::{parse_default_users, Settings};
use crate::normalizer::{self, Envelope, Role, MESSAGE_TYPE_PROMPT};
use crate::registry::RuntimeRegistry;
use crate::runtime::{RuntimeConfig, SessionRuntime};
use crate::store::{
    MessageRecord, NewMessage, NewSession, SessionLogRecord, SessionRecord, Store, StoreError,
    UserRecord, SESSION_STATUS_ERROR,
};

pub const EVENT_SESSION_CREATED: &str = "SESSION_CREATED";
pub const EVENT_SESSION_INTERRUPTED: &str = "SESSION_INTERRUPTED";
pub const EVENT_PROMPT_SUBMITTED: &str = "PROMPT_SUBMITTED";
pub const EVENT_TURN_RESULT: &str = "TURN_RESULT";
pub const EVENT_SDK_ERROR: &str = "SDK_ERROR";
pub const EVENT_WAITING_USER_ANSWER: &str = "WAITING_USER_ANSWER";

/// Tool the agent invokes when it needs an answer from the user.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";
pub const DEFAULT_SESSION_TITLE: &str = "New Session";
pub const INTERRUPT_SOURCE_UI: &str = "ui";

const USERNAME_LENGTH: (usize, usize) = (2, 80);
const DISPLAY_NAME_LENGTH: (usize, usize) = (2, 120);
const MAX_TITLE_LENGTH: usize = 160;

/// One item of a streaming turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A persisted message row: the user's prompt first, then agent messages.
    Message(MessageRecord),
    /// The turn failed; `log` is the recorded `SDK_ERROR` event.
    Error {
        message: String,
        log: SessionLogRecord,
    },
}

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    pub user_id: Uuid,
    pub title: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug)]
enum TurnFailure {
    Agent(SdkError),
    Storage(StoreError),
}

impl TurnFailure {
    fn details(&self) -> Value {
        let mut details = Map::new();
        let cause = match self {
            Self::Agent(err) => {
                details.insert("message".to_string(), json!(err.to_string()));
                details.insert("exception_type".to_string(), json!(err.kind()));
                if let Some(exit_code) = err.exit_code() {
                    details.insert("exit_code".to_string(), json!(exit_code));
                }
                if let Some(stderr) = err.stderr() {
                    details.insert("stderr".to_string(), json!(stderr));
                }
                err.source().map(|source| (err.cause_kind(), source.to_string()))
            }
            Self::Storage(err) => {
                details.insert("message".to_string(), json!(err.to_string()));
                details.insert("exception_type".to_string(), json!("StorageError"));
                err.source().map(|source| (None, source.to_string()))
            }
        };
        if let Some((kind, message)) = cause {
            details.insert("cause_type".to_string(), json!(kind.unwrap_or("Error")));
            details.insert("cause_message".to_string(), json!(message));
        }
        Value::Object(details)
    }

    fn message(&self) -> String {
        match self {
            Self::Agent(err) => err.to_string(),
            Self::Storage(err) => err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentService {
    inner: Arc<AgentServiceInner>,
}

#[derive(Debug)]
struct AgentServiceInner {
    store: Store,
    registry: RuntimeRegistry,
    settings: Settings,
}

impl AgentService {
    pub fn new(store: Store, registry: RuntimeRegistry, settings: Settings) -> Self {
        Self {
            inner: Arc::new(AgentServiceInner {
                store,
                registry,
                settings,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Seeds the configured default users when the user table is empty.
    /// Returns how many users were created.
    pub async fn ensure_default_users(&self) -> Result<usize, ConsoleError> {
        if !self.inner.store.list_users().await?.is_empty() {
            return Ok(0);
        }
        let mut created = 0;
        for (username, display_name) in parse_default_users(&self.inner.settings.default_users) {
            self.inner.store.create_user(&username, &display_name).await?;
            created += 1;
        }
        tracing::info!(created, "service: seeded default users");
        Ok(created)
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, ConsoleError> {
        Ok(self.inner.store.list_users().await?)
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserRecord, ConsoleError> {
        let username = username.trim();
        let display_name = display_name.trim();
        validate_length("username", username, USERNAME_LENGTH)?;
        validate_length("display_name", display_name, DISPLAY_NAME_LENGTH)?;

        if self.inner.store.get_user_by_username(username).await?.is_some() {
            return Err(username_taken());
        }
        match self.inner.store.create_user(username, display_name).await {
            Ok(user) => Ok(user),
            Err(err) if err.is_unique_violation() => Err(username_taken()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create_session(&self, request: SessionSpec) -> Result<SessionRecord, ConsoleError> {
        self.require_user(request.user_id).await?;

        let title = request
            .title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string());
        if title.chars().count() > MAX_TITLE_LENGTH {
            return Err(ConsoleError::invalid_request(format!(
                "title must be at most {MAX_TITLE_LENGTH} characters"
            )));
        }
        let model = request
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.inner.settings.model.clone());
        let permission_mode = match request.permission_mode.filter(|mode| !mode.trim().is_empty()) {
            Some(mode) => mode
                .parse::<PermissionMode>()
                .map_err(ConsoleError::invalid_request)?,
            None => self.inner.settings.permission_mode,
        };
        let system_prompt = request
            .system_prompt
            .or_else(|| self.inner.settings.system_prompt.clone());

        let session = self
            .inner
            .store
            .create_session(NewSession {
                user_id: request.user_id,
                title,
                model,
                permission_mode: permission_mode.as_str().to_string(),
                system_prompt,
            })
            .await?;
        self.inner
            .store
            .create_log(
                session.id,
                EVENT_SESSION_CREATED,
                json!({
                    "title": session.title,
                    "model": session.model,
                    "permission_mode": session.permission_mode,
                }),
            )
            .await?;
        tracing::info!(session_id = %session.id, user_id = %session.user_id, "service: session created");
        Ok(session)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, ConsoleError> {
        self.require_user(user_id).await?;
        Ok(self.inner.store.list_sessions_for_user(user_id).await?)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionRecord, ConsoleError> {
        self.inner
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ConsoleError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn list_messages(&self, session_id: Uuid) -> Result<Vec<MessageRecord>, ConsoleError> {
        self.get_session(session_id).await?;
        Ok(self.inner.store.list_messages(session_id).await?)
    }

    pub async fn list_logs(&self, session_id: Uuid) -> Result<Vec<SessionLogRecord>, ConsoleError> {
        self.get_session(session_id).await?;
        Ok(self.inner.store.list_logs(session_id).await?)
    }

    pub async fn interrupt_session(&self, session_id: Uuid) -> Result<(), ConsoleError> {
        let session = self.get_session(session_id).await?;
        self.inner.registry.interrupt(&session.id.to_string()).await;
        self.inner
            .store
            .create_log(
                session.id,
                EVENT_SESSION_INTERRUPTED,
                json!({ "source": INTERRUPT_SOURCE_UI }),
            )
            .await?;
        tracing::info!(session_id = %session.id, "service: session interrupted");
        Ok(())
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), ConsoleError> {
        let session = self.get_session(session_id).await?;
        self.inner.registry.drop_runtime(&session.id.to_string()).await;
        self.inner.store.delete_session(session.id).await?;
        tracing::info!(session_id = %session.id, "service: session deleted");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.inner.registry.close_all().await;
    }

    /// Records `prompt` on the session and returns the turn's event stream.
    ///
    /// Lookup and prompt persistence happen before the stream is returned,
    /// so a missing session is reported as an error instead of a stream
    /// item. The stream yields the persisted prompt, then each persisted
    /// agent message, and ends after the result, after the agent asks the
    /// user a question, or with a single [`TurnEvent::Error`].
    pub async fn stream_prompt(&self, session_id: Uuid, prompt: &str) -> Result<TurnStream, ConsoleError> {
        if prompt.trim().is_empty() {
            return Err(ConsoleError::invalid_request("Prompt must not be empty"));
        }

        let prompt = prompt.to_string();
        let session = self.get_session(session_id).await?;
        let store = &self.inner.store;
        store.touch_session(session.id).await?;
        let user_message = store
            .create_message(NewMessage {
                session_id: session.id,
                role: Role::User.as_str().to_string(),
                message_type: MESSAGE_TYPE_PROMPT.to_string(),
                payload: json!({ "prompt": prompt }),
                raw_text: Some(prompt.clone()),
            })
            .await?;
        store
            .create_log(
                session.id,
                EVENT_PROMPT_SUBMITTED,
                json!({ "length": prompt.chars().count() }),
            )
            .await?;
        tracing::info!(session_id = %session.id, length = prompt.len(), "service: prompt submitted");

        let service = self.clone();
        Ok(Box::pin(async_stream::stream! {
            yield TurnEvent::Message(user_message);

            let runtime = service
                .inner
                .registry
                .get_or_create(&session.id.to_string(), service.runtime_config(&session))
                .await;
            let mut known_handle = session.claude_session_id.clone();
            let mut messages = runtime.query_stream(prompt);

            let failure = loop {
                let raw = match messages.next().await {
                    None => break None,
                    Some(Ok(raw)) => raw,
                    Some(Err(err)) => break Some(TurnFailure::Agent(err)),
                };
                let (record, asks_user) = match service
                    .record_message(session.id, &runtime, &mut known_handle, &raw)
                    .await
                {
                    Ok(recorded) => recorded,
                    Err(err) => break Some(TurnFailure::Storage(err)),
                };
                let message_id = record.id;
                yield TurnEvent::Message(record);

                if asks_user {
                    let logged = service
                        .inner
                        .store
                        .create_log(
                            session.id,
                            EVENT_WAITING_USER_ANSWER,
                            json!({ "message_id": message_id.to_string() }),
                        )
                        .await;
                    runtime.interrupt().await;
                    tracing::info!(
                        session_id = %session.id,
                        message_id = %message_id,
                        "service: agent is waiting for a user answer"
                    );
                    break logged.err().map(TurnFailure::Storage);
                }
            };
            drop(messages);

            if let Some(failure) = failure {
                match service.record_failure(session.id, &failure).await {
                    Ok(event) => yield event,
                    Err(err) => tracing::error!(
                        session_id = %session.id,
                        error = %err,
                        turn_error = %failure.message(),
                        "service: failed to record turn failure"
                    ),
                }
            }
        }))
    }

    fn runtime_config(&self, session: &SessionRecord) -> RuntimeConfig {
        let settings = &self.inner.settings;
        RuntimeConfig {
            model: session.model.clone(),
            permission_mode: session.permission_mode.clone(),
            max_turns: settings.max_turns,
            system_prompt: session.system_prompt.clone(),
            allowed_tools: settings.allowed_tools.clone(),
            debug_stderr: settings.debug_stderr,
            resume: session.claude_session_id.clone(),
        }
    }

    /// Persists one agent message and everything it implies for the session.
    /// Returns the stored row and whether the agent asked the user a question.
    async fn record_message(
        &self,
        session_id: Uuid,
        runtime: &SessionRuntime,
        known_handle: &mut Option<String>,
        raw: &SdkMessage,
    ) -> Result<(MessageRecord, bool), StoreError> {
        let store = &self.inner.store;
        let envelope = normalizer::serialize(raw);
        let record = store
            .create_message(NewMessage {
                session_id,
                role: envelope.role().as_str().to_string(),
                message_type: envelope.message_type().to_string(),
                payload: envelope.to_value(),
                raw_text: normalizer::extract_text(&envelope),
            })
            .await?;

        if let Some(handle) = envelope.session_id() {
            if known_handle.as_deref() != Some(handle) {
                store.update_claude_session_id(session_id, handle).await?;
                runtime.set_resume(Some(handle.to_string())).await;
                *known_handle = Some(handle.to_string());
            }
        }

        if let Envelope::Result {
            session_id: handle,
            is_error,
            duration_ms,
            total_cost_usd,
            num_turns,
            ..
        } = &envelope
        {
            store
                .create_log(
                    session_id,
                    EVENT_TURN_RESULT,
                    json!({
                        "session_id": handle,
                        "is_error": is_error,
                        "duration_ms": duration_ms,
                        "cost_usd": total_cost_usd,
                        "num_turns": num_turns,
                    }),
                )
                .await?;
            tracing::info!(
                session_id = %session_id,
                is_error,
                duration_ms = ?duration_ms,
                num_turns = ?num_turns,
                "service: turn finished"
            );
        }

        Ok((record, envelope.invokes_tool(ASK_USER_QUESTION_TOOL)))
    }

    async fn record_failure(&self, session_id: Uuid, failure: &TurnFailure) -> Result<TurnEvent, StoreError> {
        let store = &self.inner.store;
        let details = failure.details();
        tracing::error!(session_id = %session_id, details = %details, "service: agent turn failed");
        store
            .update_session_status(session_id, SESSION_STATUS_ERROR)
            .await?;
        let log = store
            .create_log(session_id, EVENT_SDK_ERROR, details)
            .await?;
        Ok(TurnEvent::Error {
            message: failure.message(),
            log,
        })
    }

    async fn require_user(&self, user_id: Uuid) -> Result<UserRecord, ConsoleError> {
        self.inner
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| ConsoleError::UserNotFound {
                user_id: user_id.to_string(),
            })
    }
}

fn username_taken() -> ConsoleError {
    ConsoleError::Conflict {
        message: "Username already exists".to_string(),
    }
}

fn validate_length(field: &str, value: &str, (min, max): (usize, usize)) -> Result<(), ConsoleError> {
    let length = value.chars().count();
    if length < min || length > max {
        return Err(ConsoleError::invalid_request(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(())
}
