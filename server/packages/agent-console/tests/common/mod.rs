#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agent_console::config::Settings;
use agent_console::config_files::AgentConfigFiles;
use agent_console::registry::RuntimeRegistry;
use agent_console::router::build_router;
use agent_console::runtime::{RetryPolicy, RuntimeContext};
use agent_console::service::AgentService;
use agent_console::store::Store;
use agent_console_agent_sdk::mock::MockConnector;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub service: AgentService,
    pub connector: MockConnector,
    _home: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let home = tempfile::tempdir().expect("create temp home");
        let connector = MockConnector::new();
        let registry = RuntimeRegistry::new(RuntimeContext {
            connector: Arc::new(connector.clone()),
            config_files: AgentConfigFiles::with_home(home.path()),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        });
        let store = Store::in_memory().await.expect("in-memory store");
        let service = AgentService::new(store, registry, Settings::default());
        service
            .ensure_default_users()
            .await
            .expect("seed default users");
        let app = build_router(service.clone());
        Self {
            app,
            service,
            connector,
            _home: home,
        }
    }

    /// Id of the seeded `demo` user.
    pub async fn demo_user_id(&self) -> String {
        let (status, users) = send_json(&self.app, Method::GET, "/api/users", None).await;
        assert_eq!(status, StatusCode::OK);
        users
            .as_array()
            .and_then(|users| users.iter().find(|user| user["username"] == "demo"))
            .and_then(|user| user["id"].as_str())
            .expect("demo user")
            .to_string()
    }

    pub async fn create_session(&self) -> String {
        let user_id = self.demo_user_id().await;
        let (status, session) = send_json(
            &self.app,
            Method::POST,
            "/api/sessions",
            Some(serde_json::json!({ "user_id": user_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{session}");
        session["id"].as_str().expect("session id").to_string()
    }
}

pub async fn send(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, bytes.to_vec())
}

pub async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, path, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

/// Posts a prompt to the streaming endpoint and returns the decoded
/// `data:` frames.
pub async fn stream_prompt(app: &Router, session_id: &str, prompt: &str) -> (StatusCode, Vec<Value>) {
    let path = format!("/api/sessions/{session_id}/messages/stream");
    let (status, bytes) = send(
        app,
        Method::POST,
        &path,
        Some(serde_json::json!({ "prompt": prompt })),
    )
    .await;
    let text = String::from_utf8_lossy(&bytes).to_string();
    let frames = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("frame json"))
        .collect();
    (status, frames)
}
