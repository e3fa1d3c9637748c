mod common;

use agent_console_agent_sdk::mock::{
    assistant_text, assistant_tool_use, result_message, system_init, MockFailure, MockTurn,
};
use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::{send_json, stream_prompt, TestApp};

async fn logs_of(test_app: &TestApp, session_id: &str, event_type: &str) -> Vec<Value> {
    let (status, logs) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}/logs"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    logs.as_array()
        .expect("logs")
        .iter()
        .filter(|log| log["event_type"] == event_type)
        .cloned()
        .collect()
}

#[tokio::test]
async fn hello_turn_streams_prompt_reply_and_result() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app.connector.push_turn(MockTurn::reply("ext-1", "Hi there"));

    let (status, frames) = stream_prompt(&test_app.app, &session_id, "hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|frame| frame["event"] == "message"));

    assert_eq!(frames[0]["payload"]["role"], "user");
    assert_eq!(frames[0]["payload"]["message_type"], "prompt");
    assert_eq!(frames[0]["payload"]["payload"], json!({ "prompt": "hello" }));
    assert_eq!(frames[1]["payload"]["role"], "assistant");
    assert_eq!(frames[1]["payload"]["raw_text"], "Hi there");
    assert_eq!(frames[2]["payload"]["message_type"], "ResultMessage");

    let (_, session) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(session["claude_session_id"], "ext-1");
    assert_eq!(logs_of(&test_app, &session_id, "TURN_RESULT").await.len(), 1);
    assert_eq!(logs_of(&test_app, &session_id, "PROMPT_SUBMITTED").await.len(), 1);

    let (_, messages) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}/messages"),
        None,
    )
    .await;
    let roles: Vec<&str> = messages
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|message| message["role"].as_str())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "result"]);
}

#[tokio::test]
async fn system_init_frames_carry_the_system_role() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app.connector.push_turn(
        MockTurn::new()
            .message(system_init("ext-9"))
            .message(assistant_text("working"))
            .message(result_message("ext-9", "done")),
    );

    let (_, frames) = stream_prompt(&test_app.app, &session_id, "go").await;
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[1]["payload"]["role"], "system");
    assert_eq!(frames[1]["payload"]["message_type"], "SystemMessage");
    assert_eq!(frames[2]["payload"]["message_type"], "AssistantMessage");
}

#[tokio::test]
async fn ask_user_question_ends_the_stream_early() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app.connector.push_turn(
        MockTurn::new()
            .message(assistant_tool_use(
                "AskUserQuestion",
                json!({ "questions": [{ "question": "Which branch?" }] }),
            ))
            .message(assistant_text("unreachable"))
            .message(result_message("ext-2", "unreachable")),
    );

    let (status, frames) = stream_prompt(&test_app.app, &session_id, "deploy").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames.len(), 2);
    let asked_id = frames[1]["payload"]["id"].clone();

    let waiting = logs_of(&test_app, &session_id, "WAITING_USER_ANSWER").await;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0]["details"]["message_id"], asked_id);
    assert_eq!(test_app.connector.stats().interrupts(), 1);
    assert!(logs_of(&test_app, &session_id, "TURN_RESULT").await.is_empty());
}

#[tokio::test]
async fn agent_failure_becomes_an_error_frame() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app
        .connector
        .push_turn(MockTurn::connect_failure(MockFailure::ExitCode(2)));

    let (status, frames) = stream_prompt(&test_app.app, &session_id, "hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["event"], "message");
    assert_eq!(frames[1]["event"], "error");
    assert_eq!(frames[1]["payload"]["message"], "Command failed with exit code 2");

    let errors = logs_of(&test_app, &session_id, "SDK_ERROR").await;
    assert_eq!(errors.len(), 1);
    assert_eq!(frames[1]["payload"]["log_id"], errors[0]["id"]);
    assert_eq!(errors[0]["details"]["exit_code"], 2);

    let (_, session) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(session["status"], "error");
}

#[tokio::test]
async fn transient_startup_failure_is_retried() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app
        .connector
        .push_turn(MockTurn::connect_failure(MockFailure::InitializeTimeout));
    test_app.connector.push_turn(MockTurn::reply("ext-3", "second try"));

    let (_, frames) = stream_prompt(&test_app.app, &session_id, "hello").await;
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|frame| frame["event"] == "message"));
    assert_eq!(test_app.connector.stats().connects(), 2);
    assert!(logs_of(&test_app, &session_id, "SDK_ERROR").await.is_empty());
}

#[tokio::test]
async fn invalid_prompts_fail_before_streaming() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;

    let (status, frames) = stream_prompt(&test_app.app, &session_id, "   ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(frames.is_empty());

    let missing = uuid::Uuid::new_v4().to_string();
    let (status, _) = stream_prompt(&test_app.app, &missing, "hello").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(test_app.connector.stats().connects(), 0);
}

#[tokio::test]
async fn resume_handle_carries_into_the_next_turn() {
    let test_app = TestApp::new().await;
    let session_id = test_app.create_session().await;
    test_app.connector.push_turn(MockTurn::reply("ext-5", "first"));

    stream_prompt(&test_app.app, &session_id, "one").await;
    let (_, frames) = stream_prompt(&test_app.app, &session_id, "two").await;
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[2]["payload"]["raw_text"], "Echo: two");

    let options = test_app.connector.stats().options();
    assert_eq!(options.len(), 2);
    assert_eq!(options[1].resume.as_deref(), Some("ext-5"));
}
