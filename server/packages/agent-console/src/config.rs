use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agent_console_agent_sdk::mock::MockConnector;
use agent_console_agent_sdk::{AgentConnector, ClaudeCliConnector, PermissionMode};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_MAX_TURNS: u32 = 16;
pub const DEFAULT_CLI_PATH: &str = "claude";
pub const DEFAULT_USERS: &str = "demo:Demo User,analyst:Analyst User";
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_INIT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentBackend {
    #[default]
    Claude,
    Mock,
}

impl FromStr for AgentBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown agent backend: {other}")),
        }
    }
}

/// Process-wide settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub model: String,
    pub max_turns: u32,
    pub permission_mode: PermissionMode,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub debug_stderr: bool,
    pub cli_path: String,
    pub agent_backend: AgentBackend,
    pub retry_base_delay: Duration,
    pub init_timeout: Duration,
    pub default_users: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let permission_mode = match var("CLAUDE_PERMISSION_MODE") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(
                    error = %err,
                    fallback = %PermissionMode::default(),
                    "config: invalid CLAUDE_PERMISSION_MODE"
                );
                PermissionMode::default()
            }),
            None => PermissionMode::default(),
        };

        let agent_backend = match var("AGENT_CONSOLE_AGENT") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "config: invalid AGENT_CONSOLE_AGENT; using claude");
                AgentBackend::default()
            }),
            None => AgentBackend::default(),
        };

        Self {
            database_url: var("AGENT_CONSOLE_DATABASE_URL").unwrap_or_else(default_database_url),
            model: var("CLAUDE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_turns: parse_or("CLAUDE_MAX_TURNS", var("CLAUDE_MAX_TURNS"), DEFAULT_MAX_TURNS),
            permission_mode,
            system_prompt: var("CLAUDE_SYSTEM_PROMPT"),
            allowed_tools: var("CLAUDE_ALLOWED_TOOLS").and_then(|raw| parse_tool_list(&raw)),
            debug_stderr: var("CLAUDE_DEBUG_STDERR").is_some_and(|raw| parse_flag(&raw)),
            cli_path: var("CLAUDE_CLI_PATH").unwrap_or_else(|| DEFAULT_CLI_PATH.to_string()),
            agent_backend,
            retry_base_delay: Duration::from_millis(parse_or(
                "AGENT_CONSOLE_RETRY_BASE_DELAY_MS",
                var("AGENT_CONSOLE_RETRY_BASE_DELAY_MS"),
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            init_timeout: Duration::from_millis(parse_or(
                "AGENT_CONSOLE_INIT_TIMEOUT_MS",
                var("AGENT_CONSOLE_INIT_TIMEOUT_MS"),
                DEFAULT_INIT_TIMEOUT_MS,
            )),
            default_users: var("AGENT_CONSOLE_DEFAULT_USERS")
                .unwrap_or_else(|| DEFAULT_USERS.to_string()),
        }
    }

    pub fn build_connector(&self) -> Arc<dyn AgentConnector> {
        match self.agent_backend {
            AgentBackend::Claude => Arc::new(
                ClaudeCliConnector::new(self.cli_path.clone())
                    .with_control_timeout(self.init_timeout),
            ),
            AgentBackend::Mock => Arc::new(MockConnector::new()),
        }
    }
}

pub fn default_database_url() -> String {
    let path = dirs::data_dir()
        .map(|dir| dir.join("agent-console"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-console"))
        .join("console.db");
    format!("sqlite://{}", path.display())
}

/// Comma separated tool names; blank entries are dropped and an empty list
/// means "no allowlist".
pub fn parse_tool_list(raw: &str) -> Option<Vec<String>> {
    let tools = raw
        .split(',')
        .map(str::trim)
        .filter(|tool| !tool.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if tools.is_empty() {
        None
    } else {
        Some(tools)
    }
}

/// `username:Display Name` pairs. Malformed entries are skipped.
pub fn parse_default_users(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|item| item.split_once(':'))
        .map(|(username, display_name)| (username.trim(), display_name.trim()))
        .filter(|(username, display_name)| !username.is_empty() && !display_name.is_empty())
        .map(|(username, display_name)| (username.to_string(), display_name.to_string()))
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(key, value = %raw, fallback = %default, "config: invalid value");
        default
    })
}
