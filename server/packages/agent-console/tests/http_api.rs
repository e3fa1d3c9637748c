mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{send, send_json, TestApp};

#[tokio::test]
async fn health_reports_ok() {
    let test_app = TestApp::new().await;
    let (status, body) = send_json(&test_app.app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn default_users_are_listed() {
    let test_app = TestApp::new().await;
    let (status, users) = send_json(&test_app.app, Method::GET, "/api/users", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = users
        .as_array()
        .expect("user list")
        .iter()
        .filter_map(|user| user["username"].as_str())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"demo"));
    assert!(names.contains(&"analyst"));
}

#[tokio::test]
async fn create_user_validates_and_rejects_duplicates() {
    let test_app = TestApp::new().await;

    let (status, user) = send_json(
        &test_app.app,
        Method::POST,
        "/api/users",
        Some(json!({ "username": "  grace ", "display_name": "Grace H" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(user["username"], "grace");

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/api/users",
        Some(json!({ "username": "grace", "display_name": "Someone Else" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["status"], 409);
    assert_eq!(problem["type"], "urn:agent-console:error:conflict");

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/api/users",
        Some(json!({ "username": "g", "display_name": "Too Short" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn session_lifecycle() {
    let test_app = TestApp::new().await;
    let user_id = test_app.demo_user_id().await;

    let (status, session) = send_json(
        &test_app.app,
        Method::POST,
        "/api/sessions",
        Some(json!({ "user_id": user_id, "title": "Refactor" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["title"], "Refactor");
    assert_eq!(session["status"], "active");
    assert_eq!(session["permission_mode"], "bypassPermissions");
    assert!(session["claude_session_id"].is_null());
    let session_id = session["id"].as_str().expect("id").to_string();

    let (status, fetched) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], session["id"]);

    let (status, sessions) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/users/{user_id}/sessions"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));

    let (status, logs) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}/logs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs[0]["event_type"], "SESSION_CREATED");

    let (status, _) = send(
        &test_app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/interrupt"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &test_app.app,
        Method::DELETE,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, problem) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["sessionId"], session_id.as_str());
}

#[tokio::test]
async fn session_requests_are_validated() {
    let test_app = TestApp::new().await;

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/api/sessions",
        Some(json!({ "user_id": uuid::Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let user_id = test_app.demo_user_id().await;
    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/api/sessions",
        Some(json!({ "user_id": user_id, "permission_mode": "yolo" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/api/sessions",
        Some(json!({ "user_id": user_id, "title": "x".repeat(161) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(&test_app.app, Method::GET, "/api/sessions/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let test_app = TestApp::new().await;
    let (status, doc) = send_json(&test_app.app, Method::GET, "/api/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let paths = doc["paths"].as_object().expect("paths");
    assert!(paths.contains_key("/api/sessions/{session_id}/messages/stream"));
    assert!(paths.contains_key("/api/users"));
}
