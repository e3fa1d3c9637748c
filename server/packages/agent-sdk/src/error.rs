use thiserror::Error;

const TOKEN_INITIALIZE: &str = "initialize";
const TOKEN_TIMEOUT: &str = "timeout";
const TOKEN_CONTROL_REQUEST_TIMEOUT: &str = "control request timeout";
const TOKEN_EXIT_CODE_1: &str = "command failed with exit code 1";

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("failed to spawn agent process `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture agent process {0}")]
    MissingPipe(&'static str),
    #[error("failed to write to agent stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to serialize agent request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Control request timeout: {subtype}")]
    ControlTimeout { subtype: String },
    #[error("control request `{subtype}` rejected: {message}")]
    ControlRejected { subtype: String, message: String },
    #[error("Command failed with exit code {}", exit_code_label(.exit_code))]
    ProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("agent client does not support {0}")]
    Unsupported(&'static str),
    #[error("{message}")]
    Agent { message: String },
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl SdkError {
    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }

    /// Short name of the failure class, recorded with SDK error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SpawnError",
            Self::MissingPipe(_) => "PipeError",
            Self::Write(_) => "WriteError",
            Self::Serialize(_) => "SerializeError",
            Self::ControlTimeout { .. } => "ControlTimeout",
            Self::ControlRejected { .. } => "ControlRejected",
            Self::ProcessExited { .. } => "ProcessError",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::Unsupported(_) => "Unsupported",
            Self::Agent { .. } => "AgentError",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExited { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ProcessExited { stderr, .. } => stderr.as_deref().filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    /// Kind of the wrapped lower-level error, if this error wraps one.
    pub fn cause_kind(&self) -> Option<&'static str> {
        match self {
            Self::Spawn { .. } | Self::Write(_) => Some("io::Error"),
            Self::Serialize(_) => Some("serde_json::Error"),
            _ => None,
        }
    }

    /// Startup failures that are worth another connection attempt: initialize
    /// timeouts, control channel timeouts and a bare exit code 1.
    pub fn is_transient_startup(&self) -> bool {
        if let Self::ProcessExited { exit_code, .. } = self {
            return *exit_code == Some(1);
        }
        let message = self.to_string().to_lowercase();
        let initialize_timeout =
            message.contains(TOKEN_INITIALIZE) && message.contains(TOKEN_TIMEOUT);
        initialize_timeout
            || message.contains(TOKEN_CONTROL_REQUEST_TIMEOUT)
            || message.contains(TOKEN_EXIT_CODE_1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_signatures() {
        assert!(SdkError::ControlTimeout {
            subtype: "initialize".to_string()
        }
        .is_transient_startup());
        assert!(SdkError::ControlTimeout {
            subtype: "interrupt".to_string()
        }
        .is_transient_startup());
        assert!(SdkError::ProcessExited {
            exit_code: Some(1),
            stderr: None
        }
        .is_transient_startup());
        assert!(SdkError::agent("Initialize handshake Timeout after 60s").is_transient_startup());
    }

    #[test]
    fn non_transient_failures() {
        assert!(!SdkError::ProcessExited {
            exit_code: Some(10),
            stderr: None
        }
        .is_transient_startup());
        assert!(!SdkError::ConnectionClosed.is_transient_startup());
        assert!(!SdkError::agent("invalid api key").is_transient_startup());
    }

    #[test]
    fn process_exit_exposes_details() {
        let err = SdkError::ProcessExited {
            exit_code: Some(2),
            stderr: Some("boom".to_string()),
        };
        assert_eq!(err.to_string(), "Command failed with exit code 2");
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(err.stderr(), Some("boom"));
        assert_eq!(err.kind(), "ProcessError");
    }
}
