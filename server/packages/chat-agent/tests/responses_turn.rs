mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use chat_agent::store::ChatRole;
use serde_json::{json, Value};

use common::{read_sse, turn_events, ScriptedTransport, TestApp};

fn write_call_round() -> Vec<Value> {
    let call = json!({
        "type": "function_call",
        "call_id": "call_1",
        "name": "Write",
        "arguments": "{\"path\":\"notes.txt\",\"content\":\"from the agent\\n\"}",
    });
    vec![
        json!({ "type": "response.created", "response": { "id": "resp_1" } }),
        json!({ "type": "response.output_item.done", "item": call.clone() }),
        json!({ "type": "response.completed", "response": { "id": "resp_1", "output": [call] } }),
    ]
}

fn answer_round(text: &str) -> Vec<Value> {
    vec![
        json!({ "type": "response.created", "response": { "id": "resp_2" } }),
        json!({ "type": "response.reasoning_summary_text.delta", "delta": "thinking" }),
        json!({ "type": "response.output_text.delta", "delta": &text[..3] }),
        json!({ "type": "response.output_text.done", "text": text }),
        json!({ "type": "response.completed", "response": { "id": "resp_2", "output": [] } }),
    ]
}

async fn openai_chat(test_app: &TestApp) {
    test_app.start_chat("chat-1").await;
    let (status, _) = test_app
        .action(json!({ "action": "model-set", "chatId": "chat-1", "provider": "openai", "model": "gpt-5-mini" }))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn tool_round_then_answer_is_streamed_and_persisted() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        write_call_round(),
        answer_round("Saved the note."),
    ]));
    let test_app = TestApp::with_transport(transport.clone());
    openai_chat(&test_app).await;

    let (status, frames) = read_sse(
        &test_app.app,
        json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "clientMessageId": "m-1",
            "history": [{ "role": "user", "content": "save a note" }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames.first().map(|(event, _)| event.as_str()), Some("start"));
    assert_eq!(frames.last().map(|(event, _)| event.as_str()), Some("end"));

    let events = turn_events(&frames);
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|event| event["type"].as_str())
        .collect();
    assert!(kinds.contains(&"tool_input_start"), "{kinds:?}");
    assert!(kinds.contains(&"tool_done"), "{kinds:?}");
    assert!(kinds.contains(&"reasoning_start"), "{kinds:?}");
    let last = events.last().expect("final event");
    assert_eq!(last["type"], "final");
    assert_eq!(last["text"], "Saved the note.");
    assert_eq!(last["response_id"], "resp_2");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["model"], "gpt-5-mini");
    assert!(requests[0].get("previous_response_id").is_none());
    assert_eq!(requests[1]["previous_response_id"], "resp_1");
    assert_eq!(requests[1]["input"][0]["type"], "function_call_output");
    assert_eq!(requests[1]["input"][0]["call_id"], "call_1");

    let record = test_app
        .state
        .registry()
        .store()
        .load("chat-1")
        .await
        .expect("load record")
        .expect("record exists");
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.messages[0].role, ChatRole::User);
    assert_eq!(record.messages[0].client_message_id.as_deref(), Some("m-1"));
    assert_eq!(record.messages[1].role, ChatRole::Assistant);
    assert!(!record.messages[1].parts.is_empty());
}

#[tokio::test]
async fn turn_ceiling_reports_an_error_then_finishes() {
    let rounds = (0..chat_agent::config::DEFAULT_MAX_TURNS)
        .map(|_| write_call_round())
        .collect();
    let transport = Arc::new(ScriptedTransport::new(rounds));
    let test_app = TestApp::with_transport(transport.clone());
    openai_chat(&test_app).await;

    let (_, frames) = read_sse(
        &test_app.app,
        json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "history": [{ "role": "user", "content": "loop forever" }],
        }),
    )
    .await;
    let events = turn_events(&frames);
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|event| event["type"].as_str())
        .collect();
    assert_eq!(kinds.iter().filter(|kind| **kind == "error").count(), 1);
    assert_eq!(kinds.last(), Some(&"final"));
    assert_eq!(frames.last().map(|(event, _)| event.as_str()), Some("end"));
    assert_eq!(transport.requests().len(), chat_agent::config::DEFAULT_MAX_TURNS);
}

#[tokio::test]
async fn provider_failure_ends_the_stream_with_an_error_frame() {
    let transport = Arc::new(ScriptedTransport::new(vec![vec![json!({
        "type": "error",
        "error": { "message": "rate limited" },
    })]]));
    let test_app = TestApp::with_transport(transport);
    openai_chat(&test_app).await;

    let (_, frames) = read_sse(
        &test_app.app,
        json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "history": [{ "role": "user", "content": "hi" }],
        }),
    )
    .await;
    let (event, data) = frames.last().expect("terminal frame");
    assert_eq!(event, "error");
    assert!(data.contains("rate limited"), "{data}");
}

#[tokio::test]
async fn turns_on_one_chat_run_one_at_a_time() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        answer_round("First answer."),
        answer_round("Second answer."),
    ]));
    let test_app = TestApp::with_transport(transport.clone());
    openai_chat(&test_app).await;

    let body = |text: &str| {
        json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "history": [{ "role": "user", "content": text }],
        })
    };
    let (first, second) = tokio::join!(
        read_sse(&test_app.app, body("one")),
        read_sse(&test_app.app, body("two")),
    );
    for (status, frames) in [first, second] {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(frames.last().map(|(event, _)| event.as_str()), Some("end"));
    }
    assert_eq!(transport.requests().len(), 2);

    // Each user message is stored after the previous turn's reply.
    let record = test_app
        .state
        .registry()
        .store()
        .load("chat-1")
        .await
        .expect("load record")
        .expect("record exists");
    let roles: Vec<ChatRole> = record.messages.iter().map(|message| message.role).collect();
    assert_eq!(
        roles,
        vec![ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]
    );
    assert_eq!(record.messages[1].content, "First answer.");
    assert_eq!(record.messages[3].content, "Second answer.");
    assert_ne!(record.messages[0].content, record.messages[2].content);
}

#[tokio::test]
async fn unsuccessful_tool_results_stream_as_tool_errors() {
    let call = json!({
        "type": "function_call",
        "call_id": "call_shell",
        "name": "shell",
        "arguments": "{\"command\":\"exit 3\"}",
    });
    let transport = Arc::new(ScriptedTransport::new(vec![
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_1" } }),
            json!({ "type": "response.output_item.done", "item": call.clone() }),
            json!({ "type": "response.completed", "response": { "id": "resp_1", "output": [call] } }),
        ],
        answer_round("The command failed."),
    ]));
    let test_app = TestApp::with_transport(transport.clone());
    openai_chat(&test_app).await;

    let (_, frames) = read_sse(
        &test_app.app,
        json!({
            "action": "chat-send-stream",
            "chatId": "chat-1",
            "history": [{ "role": "user", "content": "run it" }],
        }),
    )
    .await;
    let events = turn_events(&frames);
    let tool_events: Vec<&Value> = events
        .iter()
        .filter(|event| matches!(event["type"].as_str(), Some("tool_done" | "tool_error")))
        .collect();
    assert_eq!(tool_events.len(), 1, "{events:?}");
    assert_eq!(tool_events[0]["type"], "tool_error");
    assert_eq!(tool_events[0]["error"]["exit_code"], 3);

    // The model still receives the full result.
    let requests = transport.requests();
    let output = requests[1]["input"][0]["output"].as_str().expect("tool output text");
    let output: Value = serde_json::from_str(output).expect("tool output json");
    assert_eq!(output["success"], false);
}
