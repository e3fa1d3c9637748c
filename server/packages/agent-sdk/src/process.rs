use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::client::{AgentClient, AgentConnector, MessageStream, QueryResponse};
use crate::error::SdkError;
use crate::message::SdkMessage;
use crate::options::AgentOptions;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_TAIL_LINES: usize = 64;
const EXIT_WAIT: Duration = Duration::from_secs(5);

type PendingControl = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

/// Launches the agent CLI in `stream-json` mode, one process per connection.
#[derive(Debug, Clone)]
pub struct ClaudeCliConnector {
    program: PathBuf,
    control_timeout: Duration,
}

impl ClaudeCliConnector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }
}

#[async_trait]
impl AgentConnector for ClaudeCliConnector {
    async fn connect(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>, SdkError> {
        let client = ClaudeCliClient::spawn(&self.program, &options, self.control_timeout)?;
        if let Err(err) = client.control_request("initialize", json!({ "hooks": null })).await {
            client.shutdown().await;
            return Err(err);
        }
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Default)]
struct ExitState {
    exited: bool,
    exit_code: Option<i32>,
}

struct ClaudeCliClient {
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Child>>,
    pending: PendingControl,
    messages: Arc<Mutex<mpsc::UnboundedReceiver<Result<SdkMessage, SdkError>>>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    exit: Arc<StdMutex<ExitState>>,
    request_counter: AtomicU64,
    control_timeout: Duration,
    shutting_down: AtomicBool,
    spawned_at: Instant,
}

impl ClaudeCliClient {
    fn spawn(
        program: &Path,
        options: &AgentOptions,
        control_timeout: Duration,
    ) -> Result<Self, SdkError> {
        let args = options.to_cli_args();
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            program = ?program,
            model = %options.model,
            resume = ?options.resume,
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(program = ?program, error = %err, "failed to spawn agent process");
            SdkError::Spawn {
                command: format_command_for_display(program, &args),
                source: err,
            }
        })?;

        let stdin = child.stdin.take().ok_or(SdkError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SdkError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SdkError::MissingPipe("stderr"))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Self {
            stdin: Mutex::new(Some(stdin)),
            child: Arc::new(Mutex::new(child)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            messages: Arc::new(Mutex::new(receiver)),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            exit: Arc::new(StdMutex::new(ExitState::default())),
            request_counter: AtomicU64::new(0),
            control_timeout,
            shutting_down: AtomicBool::new(false),
            spawned_at: Instant::now(),
        };

        client.spawn_stderr_loop(stderr);
        client.spawn_stdout_loop(stdout, sender);
        Ok(client)
    }

    async fn control_request(&self, subtype: &str, extra: Value) -> Result<Value, SdkError> {
        let request_id = format!(
            "req_{}",
            self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        let mut request = json!({ "subtype": subtype });
        if let (Some(target), Value::Object(fields)) = (request.as_object_mut(), extra) {
            target.extend(fields);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let payload = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        if let Err(err) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(self.exit_error().unwrap_or(err));
        }

        match tokio::time::timeout(self.control_timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                tracing::debug!(
                    subtype,
                    request_id = %request_id,
                    elapsed_ms = self.spawned_at.elapsed().as_millis() as u64,
                    "control request answered"
                );
                Ok(response)
            }
            Ok(Ok(Err(message))) => Err(SdkError::ControlRejected {
                subtype: subtype.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(self.exit_error().unwrap_or(SdkError::ConnectionClosed)),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                tracing::warn!(
                    subtype,
                    timeout_ms = self.control_timeout.as_millis() as u64,
                    "control request timed out"
                );
                Err(SdkError::ControlTimeout {
                    subtype: subtype.to_string(),
                })
            }
        }
    }

    async fn write_line(&self, payload: &Value) -> Result<(), SdkError> {
        let mut bytes = serde_json::to_vec(payload)?;
        bytes.push(b'\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(SdkError::ConnectionClosed)?;
        stdin.write_all(&bytes).await.map_err(SdkError::Write)?;
        stdin.flush().await.map_err(SdkError::Write)?;
        Ok(())
    }

    /// Error describing an unsuccessful process exit, once the process is gone.
    fn exit_error(&self) -> Option<SdkError> {
        let state = self.exit.lock().ok()?;
        if !state.exited || state.exit_code == Some(0) {
            return None;
        }
        Some(SdkError::ProcessExited {
            exit_code: state.exit_code,
            stderr: stderr_snapshot(&self.stderr_tail),
        })
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            "shutting down agent process"
        );

        // Closing stdin asks the CLI to finish on its own.
        self.stdin.lock().await.take();
        self.pending.lock().await.clear();

        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if tokio::time::timeout(EXIT_WAIT, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }

    fn spawn_stdout_loop(
        &self,
        stdout: ChildStdout,
        sender: mpsc::UnboundedSender<Result<SdkMessage, SdkError>>,
    ) {
        let pending = self.pending.clone();
        let child = self.child.clone();
        let exit = self.exit.clone();
        let stderr_tail = self.stderr_tail.clone();
        let spawned_at = self.spawned_at;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut line_count: u64 = 0;

            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;

                let payload = match serde_json::from_str::<Value>(trimmed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            line_number = line_count,
                            "agent stdout: invalid JSON"
                        );
                        continue;
                    }
                };

                match payload.get("type").and_then(Value::as_str) {
                    Some("control_response") => {
                        resolve_control_response(&pending, &payload).await;
                    }
                    Some("control_request") => {
                        tracing::debug!(
                            request = ?payload.get("request"),
                            "agent stdout: ignoring inbound control request"
                        );
                    }
                    _ => {
                        let message = SdkMessage::from_json(payload);
                        if sender.send(Ok(message)).is_err() {
                            tracing::debug!("agent stdout: message receiver dropped");
                        }
                    }
                }
            }

            let exit_code = {
                let mut guard = child.lock().await;
                match tokio::time::timeout(EXIT_WAIT, guard.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    _ => None,
                }
            };
            if let Ok(mut state) = exit.lock() {
                state.exited = true;
                state.exit_code = exit_code;
            }
            tracing::info!(
                total_lines = line_count,
                exit_code = ?exit_code,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "agent stdout: stream ended"
            );

            if exit_code != Some(0) {
                let _ = sender.send(Err(SdkError::ProcessExited {
                    exit_code,
                    stderr: stderr_snapshot(&stderr_tail),
                }));
            }
            pending.lock().await.clear();
        });
    }

    fn spawn_stderr_loop(&self, stderr: ChildStderr) {
        let tail = self.stderr_tail.clone();
        let spawned_at = self.spawned_at;

        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            while let Some(Ok(line)) = lines.next().await {
                tracing::debug!(
                    age_ms = spawned_at.elapsed().as_millis() as u64,
                    "agent stderr: {}",
                    line
                );
                if let Ok(mut guard) = tail.lock() {
                    guard.push_back(line);
                    while guard.len() > STDERR_TAIL_LINES {
                        guard.pop_front();
                    }
                }
            }
        });
    }
}

#[async_trait]
impl AgentClient for ClaudeCliClient {
    async fn query(&self, prompt: &str) -> Result<QueryResponse, SdkError> {
        let payload = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
            "parent_tool_use_id": null,
            "session_id": "default",
        });
        self.write_line(&payload)
            .await
            .map_err(|err| self.exit_error().unwrap_or(err))?;
        Ok(QueryResponse::Submitted)
    }

    async fn receive_response(&self) -> Result<MessageStream, SdkError> {
        let messages = self.messages.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut receiver = messages.lock().await;
            while let Some(item) = receiver.recv().await {
                let done = matches!(&item, Ok(message) if message.is_result());
                yield item;
                if done {
                    break;
                }
            }
        }))
    }

    async fn interrupt(&self) -> Result<(), SdkError> {
        self.control_request("interrupt", Value::Null).await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        self.shutdown().await;
        Ok(())
    }
}

async fn resolve_control_response(pending: &PendingControl, payload: &Value) {
    let Some(response) = payload.get("response") else {
        return;
    };
    let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
        return;
    };
    let Some(tx) = pending.lock().await.remove(request_id) else {
        tracing::warn!(request_id, "agent stdout: control response has no pending request");
        return;
    };
    let outcome = match response.get("subtype").and_then(Value::as_str) {
        Some("error") => Err(response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string()),
        _ => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

fn stderr_snapshot(tail: &StdMutex<VecDeque<String>>) -> Option<String> {
    let guard = tail.lock().ok()?;
    if guard.is_empty() {
        return None;
    }
    Some(guard.iter().cloned().collect::<Vec<_>>().join("\n"))
}

fn format_command_for_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let connector = ClaudeCliConnector::new("/nonexistent/agent-console-claude");
        let err = match connector.connect(AgentOptions::default()).await {
            Err(err) => err,
            Ok(_) => panic!("connect should fail"),
        };
        assert!(matches!(err, SdkError::Spawn { .. }));
        assert_eq!(err.cause_kind(), Some("io::Error"));
        assert!(!err.is_transient_startup());
    }

    #[tokio::test]
    async fn control_responses_resolve_pending_requests() {
        let pending: PendingControl = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req_1".to_string(), tx);
        resolve_control_response(
            &pending,
            &json!({
                "type": "control_response",
                "response": { "subtype": "success", "request_id": "req_1", "response": { "ok": true } }
            }),
        )
        .await;
        assert_eq!(rx.await.expect("resolved"), Ok(json!({ "ok": true })));
        assert!(pending.lock().await.is_empty());
    }

    #[test]
    fn display_command_is_shell_quoted() {
        let display = format_command_for_display(
            Path::new("claude"),
            &["--system-prompt".to_string(), "it's".to_string()],
        );
        assert_eq!(display, "'claude' '--system-prompt' 'it'\\''s'");
    }
}
