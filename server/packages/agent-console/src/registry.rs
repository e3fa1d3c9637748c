use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::runtime::{RuntimeConfig, RuntimeContext, SessionRuntime};

/// Process-wide map from conversation id to its [`SessionRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    inner: Arc<RuntimeRegistryInner>,
}

#[derive(Debug)]
struct RuntimeRegistryInner {
    context: RuntimeContext,
    runtimes: Mutex<HashMap<String, Arc<SessionRuntime>>>,
}

impl RuntimeRegistry {
    pub fn new(context: RuntimeContext) -> Self {
        Self {
            inner: Arc::new(RuntimeRegistryInner {
                context,
                runtimes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the runtime registered for `identity`, creating it from
    /// `config` when missing. An existing runtime only picks up the resume
    /// handle from `config`.
    pub async fn get_or_create(&self, identity: &str, config: RuntimeConfig) -> Arc<SessionRuntime> {
        let mut runtimes = self.inner.runtimes.lock().await;
        if let Some(existing) = runtimes.get(identity).cloned() {
            drop(runtimes);
            existing.set_resume(config.resume).await;
            return existing;
        }

        tracing::debug!(identity, model = %config.model, "registry: creating session runtime");
        let runtime = Arc::new(SessionRuntime::new(
            identity,
            config,
            self.inner.context.clone(),
        ));
        runtimes.insert(identity.to_string(), runtime.clone());
        runtime
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<SessionRuntime>> {
        self.inner.runtimes.lock().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.runtimes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn interrupt(&self, identity: &str) {
        let runtime = self.get(identity).await;
        if let Some(runtime) = runtime {
            runtime.interrupt().await;
        }
    }

    /// Unregisters and closes the runtime for `identity`.
    pub async fn drop_runtime(&self, identity: &str) -> Option<Arc<SessionRuntime>> {
        let removed = self.inner.runtimes.lock().await.remove(identity);
        if let Some(runtime) = &removed {
            runtime.close().await;
        }
        removed
    }

    pub async fn close_all(&self) {
        let runtimes = {
            let mut guard = self.inner.runtimes.lock().await;
            guard
                .drain()
                .map(|(_, runtime)| runtime)
                .collect::<Vec<_>>()
        };

        tracing::info!(count = runtimes.len(), "registry: closing all session runtimes");
        for runtime in runtimes {
            runtime.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_console_agent_sdk::mock::{assistant_text, MockConnector, MockTurn};
    use futures::StreamExt;

    use super::*;
    use crate::config_files::AgentConfigFiles;
    use crate::runtime::RetryPolicy;

    fn config(resume: Option<&str>) -> RuntimeConfig {
        RuntimeConfig {
            model: "m".to_string(),
            permission_mode: "default".to_string(),
            max_turns: 4,
            system_prompt: None,
            allowed_tools: None,
            debug_stderr: false,
            resume: resume.map(str::to_string),
        }
    }

    fn registry(connector: &MockConnector, home: &tempfile::TempDir) -> RuntimeRegistry {
        RuntimeRegistry::new(RuntimeContext {
            connector: Arc::new(connector.clone()),
            config_files: AgentConfigFiles::with_home(home.path()),
            retry: RetryPolicy::default(),
        })
    }

    #[tokio::test]
    async fn same_identity_returns_same_runtime() {
        let home = tempfile::tempdir().expect("tempdir");
        let registry = registry(&MockConnector::new(), &home);

        let first = registry.get_or_create("s1", config(None)).await;
        let second = registry.get_or_create("s1", config(Some("ext-1"))).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.resume_handle().await.as_deref(), Some("ext-1"));

        let other = registry.get_or_create("s2", config(None)).await;
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_registers_once() {
        let home = tempfile::tempdir().expect("tempdir");
        let registry = registry(&MockConnector::new(), &home);

        let tasks = (0..16).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("shared", config(None)).await })
        });
        let runtimes = futures::future::join_all(tasks).await;
        let first = runtimes[0].as_ref().expect("join").clone();
        for runtime in &runtimes {
            assert!(Arc::ptr_eq(&first, runtime.as_ref().expect("join")));
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_identity_interrupt_and_drop_are_noops() {
        let home = tempfile::tempdir().expect("tempdir");
        let connector = MockConnector::new();
        let registry = registry(&connector, &home);
        registry.interrupt("missing").await;
        assert!(registry.drop_runtime("missing").await.is_none());
        assert_eq!(connector.stats().interrupts(), 0);
    }

    #[tokio::test]
    async fn drop_runtime_closes_and_unregisters() {
        let home = tempfile::tempdir().expect("tempdir");
        let registry = registry(&MockConnector::new(), &home);
        let runtime = registry.get_or_create("s1", config(None)).await;

        let removed = registry.drop_runtime("s1").await.expect("removed");
        assert!(Arc::ptr_eq(&runtime, &removed));
        assert!(removed.is_closed());
        assert!(registry.is_empty().await);

        let fresh = registry.get_or_create("s1", config(None)).await;
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn close_all_interrupts_active_turns() {
        let home = tempfile::tempdir().expect("tempdir");
        let connector = MockConnector::new();
        connector.push_turn(
            MockTurn::new()
                .message(assistant_text("one"))
                .message(assistant_text("two")),
        );
        let registry = registry(&connector, &home);
        let runtime = registry.get_or_create("s1", config(None)).await;
        registry.get_or_create("s2", config(None)).await;

        let mut stream = runtime.query_stream("p");
        stream.next().await.expect("first").expect("ok");
        registry.close_all().await;

        assert!(registry.is_empty().await);
        assert!(runtime.is_closed());
        assert!(stream.next().await.is_none());
        assert_eq!(connector.stats().interrupts(), 1);
    }
}
