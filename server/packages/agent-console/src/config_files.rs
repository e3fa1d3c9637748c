use std::io;
use std::path::{Path, PathBuf};

const EMPTY_JSON: &str = "{}\n";

/// Files the agent CLI expects to find under the user's home directory.
#[derive(Debug, Clone)]
pub struct AgentConfigFiles {
    home: Option<PathBuf>,
}

impl AgentConfigFiles {
    pub fn from_home_dir() -> Self {
        Self {
            home: dirs::home_dir(),
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|home| home.join(".claude.json"))
    }

    pub fn remote_settings_path(&self) -> Option<PathBuf> {
        self.home
            .as_ref()
            .map(|home| home.join(".claude").join("remote-settings.json"))
    }

    /// Creates missing config files with `{}`. Failures are logged only.
    pub async fn ensure(&self) {
        let Some(home) = self.home.as_deref() else {
            tracing::warn!("runtime: no home directory; skipping agent config bootstrap");
            return;
        };
        if let Err(err) = ensure_files(home).await {
            tracing::warn!(
                home = %home.display(),
                error = %err,
                "runtime: unable to ensure agent config files"
            );
        }
    }
}

async fn ensure_files(home: &Path) -> io::Result<()> {
    write_if_missing(&home.join(".claude.json")).await?;
    let settings_dir = home.join(".claude");
    tokio::fs::create_dir_all(&settings_dir).await?;
    write_if_missing(&settings_dir.join("remote-settings.json")).await
}

async fn write_if_missing(path: &Path) -> io::Result<()> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    tokio::fs::write(path, EMPTY_JSON).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_missing_files() {
        let home = tempfile::tempdir().expect("tempdir");
        let files = AgentConfigFiles::with_home(home.path());
        files.ensure().await;

        let config = files.config_path().expect("config path");
        let remote = files.remote_settings_path().expect("remote path");
        assert_eq!(std::fs::read_to_string(config).expect("config"), "{}\n");
        assert_eq!(std::fs::read_to_string(remote).expect("remote"), "{}\n");
    }

    #[tokio::test]
    async fn keeps_existing_files() {
        let home = tempfile::tempdir().expect("tempdir");
        std::fs::write(home.path().join(".claude.json"), "{\"theme\":\"dark\"}").expect("seed");
        let files = AgentConfigFiles::with_home(home.path());
        files.ensure().await;
        files.ensure().await;

        let config = std::fs::read_to_string(home.path().join(".claude.json")).expect("config");
        assert_eq!(config, "{\"theme\":\"dark\"}");
    }

    #[tokio::test]
    async fn unwritable_home_is_tolerated() {
        let home = tempfile::tempdir().expect("tempdir");
        let blocker = home.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("seed");
        AgentConfigFiles::with_home(blocker.join("nested")).ensure().await;
    }
}
