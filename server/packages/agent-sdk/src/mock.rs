//! Scripted in-process agent.
//!
//! Each connection consumes the next queued [`MockTurn`]; once the queue is
//! empty connections fall back to echoing the prompt back, which is what the
//! server uses when started with the mock agent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::client::{AgentClient, AgentConnector, MessageStream, QueryResponse};
use crate::error::SdkError;
use crate::message::{
    AssistantMessage, ContentBlock, ResultMessage, SdkMessage, SystemMessage,
};
use crate::options::AgentOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockShape {
    #[default]
    Stream,
    Submitted,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    InitializeTimeout,
    ExitCode(i32),
    Message(String),
}

impl MockFailure {
    pub fn to_error(&self) -> SdkError {
        match self {
            Self::InitializeTimeout => SdkError::ControlTimeout {
                subtype: "initialize".to_string(),
            },
            Self::ExitCode(code) => SdkError::ProcessExited {
                exit_code: Some(*code),
                stderr: Some(format!("mock agent exited with {code}")),
            },
            Self::Message(message) => SdkError::agent(message.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MockStep {
    Message(SdkMessage),
    Fail(MockFailure),
}

#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    connect_failure: Option<MockFailure>,
    steps: Vec<MockStep>,
    shape: MockShape,
    step_delay: Option<Duration>,
}

impl MockTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection attempt that fails before anything is produced.
    pub fn connect_failure(failure: MockFailure) -> Self {
        Self {
            connect_failure: Some(failure),
            ..Self::default()
        }
    }

    /// Assistant text followed by a successful result.
    pub fn reply(session_id: &str, text: &str) -> Self {
        Self::new()
            .message(assistant_text(text))
            .message(result_message(session_id, text))
    }

    pub fn message(mut self, message: SdkMessage) -> Self {
        self.steps.push(MockStep::Message(message));
        self
    }

    pub fn fail(mut self, failure: MockFailure) -> Self {
        self.steps.push(MockStep::Fail(failure));
        self
    }

    pub fn with_shape(mut self, shape: MockShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }
}

pub fn assistant_text(text: &str) -> SdkMessage {
    SdkMessage::Assistant(AssistantMessage {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        model: Some("mock".to_string()),
        parent_tool_use_id: None,
    })
}

pub fn assistant_tool_use(name: &str, input: Value) -> SdkMessage {
    SdkMessage::Assistant(AssistantMessage {
        content: vec![ContentBlock::ToolUse {
            id: format!("toolu_{name}"),
            name: name.to_string(),
            input,
        }],
        model: Some("mock".to_string()),
        parent_tool_use_id: None,
    })
}

pub fn system_init(session_id: &str) -> SdkMessage {
    let mut data = Map::new();
    data.insert("type".to_string(), json!("system"));
    data.insert("subtype".to_string(), json!("init"));
    data.insert("session_id".to_string(), json!(session_id));
    SdkMessage::System(SystemMessage {
        subtype: Some("init".to_string()),
        data,
    })
}

pub fn result_message(session_id: &str, text: &str) -> SdkMessage {
    SdkMessage::Result(ResultMessage {
        subtype: Some("success".to_string()),
        duration_ms: Some(10),
        duration_api_ms: Some(8),
        is_error: Some(false),
        num_turns: Some(1),
        session_id: Some(session_id.to_string()),
        total_cost_usd: Some(0.0),
        usage: None,
        result: Some(text.to_string()),
    })
}

/// Counters shared by every client a [`MockConnector`] hands out.
#[derive(Debug, Default)]
pub struct MockStats {
    connects: AtomicUsize,
    interrupts: AtomicUsize,
    disconnects: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    options: StdMutex<Vec<AgentOptions>>,
    prompts: StdMutex<Vec<String>>,
}

impl MockStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> Vec<AgentOptions> {
        self.options
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    turns: Arc<StdMutex<VecDeque<MockTurn>>>,
    stats: Arc<MockStats>,
    disconnect_delay: Option<Duration>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every disconnect take `delay` before the connection counts as
    /// closed, like a CLI process that needs time to exit.
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = Some(delay);
        self
    }

    pub fn push_turn(&self, turn: MockTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    fn next_turn(&self) -> Option<MockTurn> {
        self.turns.lock().ok().and_then(|mut turns| turns.pop_front())
    }
}

#[async_trait]
impl AgentConnector for MockConnector {
    async fn connect(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>, SdkError> {
        let attempt = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut recorded) = self.stats.options.lock() {
            recorded.push(options.clone());
        }

        let turn = self.next_turn();
        if let Some(failure) = turn.as_ref().and_then(|turn| turn.connect_failure.as_ref()) {
            tracing::debug!(attempt, failure = ?failure, "mock agent: connect failure");
            return Err(failure.to_error());
        }

        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_active.fetch_max(active, Ordering::SeqCst);

        let session_id = options
            .resume
            .clone()
            .unwrap_or_else(|| format!("mock-session-{attempt}"));
        Ok(Arc::new(MockClient {
            turn,
            session_id,
            stats: self.stats.clone(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            interrupted: Arc::new(AtomicBool::new(false)),
            disconnected: AtomicBool::new(false),
            disconnect_delay: self.disconnect_delay,
        }))
    }
}

struct MockClient {
    turn: Option<MockTurn>,
    session_id: String,
    stats: Arc<MockStats>,
    pending: Arc<Mutex<VecDeque<MockStep>>>,
    interrupted: Arc<AtomicBool>,
    disconnected: AtomicBool,
    disconnect_delay: Option<Duration>,
}

impl MockClient {
    fn step_delay(&self) -> Option<Duration> {
        self.turn.as_ref().and_then(|turn| turn.step_delay)
    }

    fn stream(&self) -> MessageStream {
        let pending = self.pending.clone();
        let interrupted = self.interrupted.clone();
        let delay = self.step_delay();
        Box::pin(async_stream::stream! {
            loop {
                match next_step(&pending, &interrupted, delay).await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }
}

async fn next_step(
    pending: &Mutex<VecDeque<MockStep>>,
    interrupted: &AtomicBool,
    delay: Option<Duration>,
) -> Result<Option<SdkMessage>, SdkError> {
    if let Some(delay) = delay {
        sleep(delay).await;
    }
    if interrupted.load(Ordering::SeqCst) {
        return Ok(None);
    }
    match pending.lock().await.pop_front() {
        Some(MockStep::Message(message)) => Ok(Some(message)),
        Some(MockStep::Fail(failure)) => Err(failure.to_error()),
        None => Ok(None),
    }
}

#[async_trait]
impl AgentClient for MockClient {
    async fn query(&self, prompt: &str) -> Result<QueryResponse, SdkError> {
        if let Ok(mut prompts) = self.stats.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let (steps, shape) = match &self.turn {
            Some(turn) => (turn.steps.clone(), turn.shape),
            None => {
                let reply = format!("Echo: {prompt}");
                (
                    vec![
                        MockStep::Message(system_init(&self.session_id)),
                        MockStep::Message(assistant_text(&reply)),
                        MockStep::Message(result_message(&self.session_id, &reply)),
                    ],
                    MockShape::Stream,
                )
            }
        };
        *self.pending.lock().await = steps.into();

        Ok(match shape {
            MockShape::Stream => QueryResponse::Stream(self.stream()),
            MockShape::Submitted => QueryResponse::Submitted,
            MockShape::Pull => QueryResponse::Pull,
        })
    }

    async fn receive_response(&self) -> Result<MessageStream, SdkError> {
        Ok(self.stream())
    }

    async fn receive_message(&self) -> Result<Option<SdkMessage>, SdkError> {
        next_step(&self.pending, &self.interrupted, self.step_delay()).await
    }

    async fn interrupt(&self) -> Result<(), SdkError> {
        self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            if let Some(delay) = self.disconnect_delay {
                sleep(delay).await;
            }
            self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
