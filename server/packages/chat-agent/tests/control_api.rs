mod common;

use axum::http::{Method, StatusCode};
use chat_agent::router::AuthConfig;
use serde_json::json;

use common::{read_sse, send_json, TestApp};

#[tokio::test]
async fn health_is_open_and_counts_sessions() {
    let test_app = TestApp::with_auth(AuthConfig::with_token("secret".to_string()));
    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["sessions"], 0);
}

#[tokio::test]
async fn server_token_guards_control_actions() {
    let test_app = TestApp::with_auth(AuthConfig::with_token("secret".to_string()));
    let body = json!({ "action": "chat-status", "chatId": "chat-1" });

    let (status, payload) =
        send_json(&test_app.app, Method::POST, "/v1/chat", Some(body.clone()), &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["status"], 401);

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(body),
        &[("authorization", "Bearer secret")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["status"], "off");
}

#[tokio::test]
async fn start_reuse_status_and_stop() {
    let test_app = TestApp::new();
    let (status, payload) = test_app
        .action(json!({ "action": "chat-start", "chatId": "chat-1" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["reused"], false);
    assert_eq!(payload["startupMode"], "cold");

    let (_, payload) = test_app
        .action(json!({ "action": "chat-start", "chatId": "chat-1" }))
        .await;
    assert_eq!(payload["reused"], true);
    assert_eq!(payload["startupMode"], "reused");

    let (_, payload) = test_app
        .action(json!({ "action": "chat-status", "chatId": "chat-1" }))
        .await;
    assert_eq!(payload["status"], "running");
    assert_eq!(payload["provider"], "claude-agent");

    let (status, payload) = test_app
        .action(json!({ "action": "chat-stop", "chatId": "chat-1" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload["snapshotId"].is_string(), "{payload}");

    let (_, payload) = test_app
        .action(json!({ "action": "chat-status", "chatId": "chat-1" }))
        .await;
    assert_eq!(payload["status"], "off");

    let (_, payload) = test_app
        .action(json!({ "action": "chat-start", "chatId": "chat-1" }))
        .await;
    assert_eq!(payload["startupMode"], "snapshot");
}

#[tokio::test]
async fn model_set_normalizes_provider() {
    let test_app = TestApp::new();
    test_app.start_chat("chat-1").await;
    let (status, payload) = test_app
        .action(json!({ "action": "model-set", "chatId": "chat-1", "model": "gpt-5-mini" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["provider"], "openai-responses");

    let (_, payload) = test_app
        .action(json!({ "action": "chat-status", "chatId": "chat-1" }))
        .await;
    assert_eq!(payload["provider"], "openai-responses");
    assert_eq!(payload["model"], "gpt-5-mini");
}

#[tokio::test]
async fn unknown_action_and_missing_session_are_problems() {
    let test_app = TestApp::new();
    let (status, payload) = test_app.action(json!({ "action": "chat-explode" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["type"], "urn:chat-agent:error:invalid_request");

    let (status, payload) = test_app
        .action(json!({ "action": "chat-snapshot", "chatId": "ghost" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["status"], 404);
}

#[tokio::test]
async fn fs_actions_stay_inside_the_sandbox() {
    let test_app = TestApp::new();
    test_app.start_chat("chat-1").await;

    let (status, _) = test_app
        .action(json!({
            "action": "fs-write",
            "chatId": "chat-1",
            "path": "notes/todo.md",
            "content": "- ship it\n",
        }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, payload) = test_app
        .action(json!({ "action": "fs-read", "chatId": "chat-1", "path": "notes/todo.md" }))
        .await;
    assert_eq!(payload["isBinary"], false);
    assert_eq!(payload["content"], "- ship it\n");

    let (_, payload) = test_app
        .action(json!({ "action": "fs-list", "chatId": "chat-1" }))
        .await;
    let names: Vec<&str> = payload["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .collect();
    assert!(names.contains(&"notes"), "{names:?}");

    let (status, _) = test_app
        .action(json!({ "action": "fs-read", "chatId": "chat-1", "path": "../../etc/passwd" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fs_apply_patch_and_shell_use_the_tool_bridge() {
    let test_app = TestApp::new();
    test_app.start_chat("chat-1").await;

    let (status, payload) = test_app
        .action(json!({
            "action": "fs-apply-patch",
            "chatId": "chat-1",
            "operation": { "type": "create_file", "path": "hello.txt", "diff": "+hello\n" },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["success"], true);

    let (status, payload) = test_app
        .action(json!({ "action": "sandbox-shell", "chatId": "chat-1", "command": "cat hello.txt" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{payload}");
    assert_eq!(payload["exit_code"], 0);
    assert_eq!(payload["stdout"].as_str().map(str::trim), Some("hello"));
}

#[tokio::test]
async fn send_stream_without_credentials_fails_before_streaming() {
    let test_app = TestApp::new();
    test_app.start_chat("chat-1").await;
    let (status, payload) = test_app
        .action(json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "history": [{ "role": "user", "content": "hi" }],
        }))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["type"], "urn:chat-agent:error:missing_credential");
}

#[tokio::test]
async fn slash_prompt_must_start_with_slash() {
    let test_app = TestApp::new();
    test_app.start_chat("chat-1").await;
    let (status, frames) = read_sse(
        &test_app.app,
        json!({ "action": "chat-slash", "chatId": "chat-1", "prompt": "compact" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(frames.is_empty());
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let test_app = TestApp::new();
    let (status, payload) =
        send_json(&test_app.app, Method::GET, "/v1/openapi.json", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload["paths"]["/v1/chat"].is_object());
    assert!(payload["paths"]["/v1/agent-tools/{tool}"].is_object());
}
