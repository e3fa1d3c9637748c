use std::fmt;
use std::str::FromStr;

/// How the agent asks for permission before using tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    #[default]
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn all() -> &'static [PermissionMode] {
        &[
            Self::Default,
            Self::AcceptEdits,
            Self::Plan,
            Self::BypassPermissions,
        ]
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|mode| mode.as_str() == value.trim())
            .ok_or_else(|| format!("unknown permission mode: {value}"))
    }
}

/// Options used to open one agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentOptions {
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
    pub allowed_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    /// External conversation handle to resume.
    pub resume: Option<String>,
    /// Passes `--debug-to-stderr` through to the agent process.
    pub debug_stderr: bool,
}

impl AgentOptions {
    /// Command line flags understood by the agent CLI.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--permission-mode".to_string(),
            self.permission_mode.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(tools) = self.allowed_tools.as_ref().filter(|tools| !tools.is_empty()) {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        if let Some(prompt) = self.system_prompt.as_ref().filter(|p| !p.is_empty()) {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(resume) = self.resume.as_ref().filter(|r| !r.is_empty()) {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if self.debug_stderr {
            args.push("--debug-to-stderr".to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_mode_parses_wire_names() {
        assert_eq!(
            "acceptEdits".parse::<PermissionMode>(),
            Ok(PermissionMode::AcceptEdits)
        );
        assert!("yolo".parse::<PermissionMode>().is_err());
        assert_eq!(PermissionMode::default().as_str(), "bypassPermissions");
    }

    #[test]
    fn optional_flags_are_omitted_when_unset() {
        let options = AgentOptions {
            model: "claude-sonnet-4-5".to_string(),
            permission_mode: "plan".to_string(),
            max_turns: 16,
            allowed_tools: Some(Vec::new()),
            ..Default::default()
        };
        let args = options.to_cli_args();
        assert!(!args.contains(&"--allowedTools".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--debug-to-stderr".to_string()));
        assert!(args.windows(2).any(|pair| pair == ["--max-turns", "16"]));
    }

    #[test]
    fn resume_and_tools_are_passed_through() {
        let options = AgentOptions {
            model: "m".to_string(),
            permission_mode: "default".to_string(),
            max_turns: 1,
            allowed_tools: Some(vec!["Read".to_string(), "Bash".to_string()]),
            system_prompt: Some("be brief".to_string()),
            resume: Some("sess-1".to_string()),
            debug_stderr: true,
        };
        let args = options.to_cli_args();
        assert!(args.windows(2).any(|pair| pair == ["--allowedTools", "Read,Bash"]));
        assert!(args.windows(2).any(|pair| pair == ["--resume", "sess-1"]));
        assert!(args.windows(2).any(|pair| pair == ["--system-prompt", "be brief"]));
        assert_eq!(args.last().map(String::as_str), Some("--debug-to-stderr"));
    }
}
