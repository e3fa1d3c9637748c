//! One long-lived agent conversation.
//!
//! A [`SessionRuntime`] turns a prompt into a stream of raw agent messages.
//! Turns are serialized per runtime, transient startup failures are retried
//! with a linear backoff, and every connection is disconnected when its turn
//! ends, fails or is abandoned by the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_console_agent_sdk::{
    AgentClient, AgentConnector, AgentOptions, MessageReader, MessageStream, SdkError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config_files::AgentConfigFiles;

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub debug_stderr: bool,
    pub resume: Option<String>,
}

impl RuntimeConfig {
    pub fn to_options(&self) -> AgentOptions {
        AgentOptions {
            model: self.model.clone(),
            permission_mode: self.permission_mode.clone(),
            max_turns: self.max_turns,
            allowed_tools: self
                .allowed_tools
                .clone()
                .filter(|tools| !tools.is_empty()),
            system_prompt: self
                .system_prompt
                .clone()
                .filter(|prompt| !prompt.is_empty()),
            resume: self.resume.clone().filter(|handle| !handle.is_empty()),
            debug_stderr: self.debug_stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after `attempt` failed, before the next one starts.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Collaborators shared by every runtime of a process.
#[derive(Clone)]
pub struct RuntimeContext {
    pub connector: Arc<dyn AgentConnector>,
    pub config_files: AgentConfigFiles,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config_files", &self.config_files)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

type ActiveSlot = Arc<Mutex<Option<Arc<dyn AgentClient>>>>;
/// Held for the whole turn, including the final disconnect.
type TurnPermit = Arc<OwnedMutexGuard<()>>;

pub struct SessionRuntime {
    identity: String,
    context: RuntimeContext,
    config: Mutex<RuntimeConfig>,
    query_lock: Arc<Mutex<()>>,
    active_client: ActiveSlot,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("identity", &self.identity)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    pub fn new(identity: impl Into<String>, config: RuntimeConfig, context: RuntimeContext) -> Self {
        Self {
            identity: identity.into(),
            context,
            config: Mutex::new(config),
            query_lock: Arc::new(Mutex::new(())),
            active_client: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn resume_handle(&self) -> Option<String> {
        self.config.lock().await.resume.clone()
    }

    /// Replaces the resume handle used by the next connection. `None` keeps
    /// the current handle.
    pub async fn set_resume(&self, handle: Option<String>) {
        let Some(handle) = handle.filter(|handle| !handle.is_empty()) else {
            return;
        };
        self.config.lock().await.resume = Some(handle);
    }

    /// Submits `prompt` and streams the agent's raw messages up to and
    /// including the first result message.
    ///
    /// Only one stream runs per runtime; later calls wait for the earlier
    /// stream to finish or be dropped.
    pub fn query_stream(self: &Arc<Self>, prompt: impl Into<String>) -> MessageStream {
        let runtime = self.clone();
        let prompt = prompt.into();
        Box::pin(async_stream::stream! {
            let turn: TurnPermit = Arc::new(runtime.query_lock.clone().lock_owned().await);
            if runtime.closed.load(Ordering::SeqCst) {
                yield Err(SdkError::ConnectionClosed);
                return;
            }
            runtime.context.config_files.ensure().await;

            let retry = runtime.context.retry;
            let mut attempt = 0;
            loop {
                attempt += 1;
                let options = runtime.config.lock().await.to_options();
                let client = match runtime.context.connector.connect(options).await {
                    Ok(client) => client,
                    Err(err) => {
                        if runtime.should_retry(&err, attempt, 0) {
                            tokio::time::sleep(retry.backoff_after(attempt)).await;
                            continue;
                        }
                        yield Err(err);
                        return;
                    }
                };
                let guard = ActiveClientGuard::install(
                    &runtime.active_client,
                    client.clone(),
                    turn.clone(),
                )
                .await;

                let mut emitted = 0usize;
                let mut saw_result = false;
                let mut failure = None;
                let reader = match client.query(&prompt).await {
                    Ok(response) => MessageReader::open(client.clone(), response).await,
                    Err(err) => Err(err),
                };
                match reader {
                    Ok(mut reader) => loop {
                        match reader.next_message().await {
                            Ok(Some(message)) => {
                                emitted += 1;
                                let terminal = message.is_result();
                                yield Ok(message);
                                if terminal {
                                    saw_result = true;
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    },
                    Err(err) => failure = Some(err),
                }
                guard.release().await;

                match failure {
                    None => {
                        if !saw_result {
                            tracing::warn!(
                                identity = %runtime.identity,
                                emitted,
                                "runtime: stream ended without a result message"
                            );
                        }
                        return;
                    }
                    Some(err) if runtime.should_retry(&err, attempt, emitted) => {
                        tokio::time::sleep(retry.backoff_after(attempt)).await;
                    }
                    Some(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        })
    }

    fn should_retry(&self, err: &SdkError, attempt: u32, emitted: usize) -> bool {
        let max_attempts = self.context.retry.max_attempts;
        let retryable = emitted == 0 && err.is_transient_startup() && attempt < max_attempts;
        if retryable {
            tracing::warn!(
                identity = %self.identity,
                attempt,
                max_attempts,
                error_kind = err.kind(),
                error = %err,
                "runtime: transient agent startup failure; retrying"
            );
        }
        retryable
    }

    /// Best-effort interrupt of the connection currently streaming, if any.
    pub async fn interrupt(&self) {
        let client = self.active_client.lock().await.clone();
        let Some(client) = client else {
            tracing::debug!(identity = %self.identity, "runtime: interrupt with no active connection");
            return;
        };
        if let Err(err) = client.interrupt().await {
            tracing::warn!(
                identity = %self.identity,
                error = %err,
                "runtime: interrupt failed"
            );
        }
    }

    /// Interrupts the active turn and refuses further turns.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.interrupt().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Marks a client as the runtime's active connection and disconnects it on
/// release. A guard dropped without release (the consumer abandoned the
/// stream) finishes the cleanup on a spawned task. Either way the turn
/// permit is only let go once the disconnect has completed, so the next
/// turn never overlaps a closing connection.
struct ActiveClientGuard {
    slot: ActiveSlot,
    client: Option<Arc<dyn AgentClient>>,
    turn: Option<TurnPermit>,
}

impl ActiveClientGuard {
    async fn install(slot: &ActiveSlot, client: Arc<dyn AgentClient>, turn: TurnPermit) -> Self {
        *slot.lock().await = Some(client.clone());
        Self {
            slot: slot.clone(),
            client: Some(client),
            turn: Some(turn),
        }
    }

    async fn release(mut self) {
        if let Some(client) = self.client.take() {
            teardown(self.slot.clone(), client, self.turn.take()).await;
        }
    }
}

impl Drop for ActiveClientGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let slot = self.slot.clone();
        let turn = self.turn.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown(slot, client, turn));
            }
            Err(_) => {
                tracing::warn!("runtime: stream dropped outside a tokio runtime; connection not closed");
            }
        }
    }
}

async fn teardown(slot: ActiveSlot, client: Arc<dyn AgentClient>, turn: Option<TurnPermit>) {
    {
        let mut active = slot.lock().await;
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &client))
        {
            *active = None;
        }
    }
    if let Err(err) = client.disconnect().await {
        tracing::warn!(error = %err, "runtime: disconnect failed");
    }
    drop(turn);
}
