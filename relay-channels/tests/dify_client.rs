//! DifyClient against a mocked Dify app API.

use relay_channels::client::{
    ChatBackend, ChatRequest, DifyClient, Rating, ResponseMode, UploadFileRef, WorkflowRequest,
};
use relay_channels::message::Fragment;
use relay_common::RelayError;
use serde_json::json;
use wiremock::matchers::{
    body_json, body_partial_json, body_string_contains, header, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "app-test";

fn client_for(server: &MockServer) -> DifyClient {
    DifyClient::new(format!("{}/v1", server.uri()), KEY)
}

fn sse_body(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {e}\n\n"))
        .collect()
}

#[tokio::test]
async fn blocking_chat_sends_payload_and_decodes_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .and(header("authorization", "Bearer app-test"))
        .and(body_json(json!({
            "inputs": {},
            "query": "hello",
            "user": "onebot-1",
            "response_mode": "blocking",
            "conversation_id": "c1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event": "message",
            "message_id": "m1",
            "conversation_id": "c1",
            "answer": "hi there",
            "metadata": {"usage": {"total_tokens": 12}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = ChatRequest::new("hello", "onebot-1", ResponseMode::Blocking).with_conversation("c1");
    let completion = client_for(&server).chat_blocking(&request).await.unwrap();

    assert_eq!(completion.answer, "hi there");
    assert_eq!(completion.conversation_id, "c1");
    assert_eq!(completion.usage().unwrap()["total_tokens"], 12);
}

#[tokio::test]
async fn non_success_status_is_remote_request_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"code":"invalid_param"}"#))
        .mount(&server)
        .await;

    let request = ChatRequest::new("q", "u", ResponseMode::Blocking);
    let err = client_for(&server).chat_blocking(&request).await.unwrap_err();

    match err {
        RelayError::RemoteRequest { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("invalid_param"));
        }
        other => panic!("Expected RemoteRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_chat_reduces_events_and_stops_at_end() {
    let server = MockServer::start().await;
    let mut body = sse_body(&[
        json!({"event": "agent_message", "answer": "Let me ", "conversation_id": "c42"}),
        json!({"event": "agent_message", "answer": "check"}),
        json!({"event": "agent_thought", "thought": "search", "tool": "web"}),
    ]);
    body.push_str("event: ping\n\n");
    body.push_str("data: {broken json\n\n");
    body.push_str(&sse_body(&[
        json!({"event": "message_file", "type": "image", "url": "/files/tools/a.png"}),
        json!({"event": "agent_message", "answer": "Found it"}),
        json!({"event": "message_end", "metadata": {"usage": {}}}),
        json!({"event": "agent_message", "answer": "ignored"}),
    ]));

    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .and(body_partial_json(json!({"response_mode": "streaming"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let request = ChatRequest::new("find", "u", ResponseMode::Streaming);
    let reply = client_for(&server).chat_streaming(&request).await.unwrap();

    assert_eq!(reply.conversation_id, "c42");
    assert_eq!(
        reply.fragments,
        vec![
            Fragment::text("Let me check"),
            Fragment::ImageUrl("/files/tools/a.png".into()),
            Fragment::text("Found it"),
        ]
    );
}

#[tokio::test]
async fn streaming_error_event_fails() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        json!({"event": "agent_message", "answer": "x", "conversation_id": "c1"}),
        json!({"event": "error", "status": 500, "code": "internal", "message": "model overloaded"}),
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let request = ChatRequest::new("q", "u", ResponseMode::Streaming);
    let err = client_for(&server).chat_streaming(&request).await.unwrap_err();
    assert!(matches!(err, RelayError::RemoteStream(ref m) if m.contains("model overloaded")));
}

#[tokio::test]
async fn streaming_without_trailing_newline_still_reads_last_event() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: {}",
        json!({"event": "message", "answer": "tail", "conversation_id": "c1"}),
        json!({"event": "message_end"})
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let request = ChatRequest::new("q", "u", ResponseMode::Streaming);
    let reply = client_for(&server).chat_streaming(&request).await.unwrap();
    assert_eq!(reply.fragments, vec![Fragment::text("tail")]);
}

#[tokio::test]
async fn workflow_run_returns_text_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/workflows/run"))
        .and(body_json(json!({
            "inputs": {"query": "summarize"},
            "response_mode": "blocking",
            "user": "u"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workflow_run_id": "r1",
            "task_id": "t1",
            "data": {"id": "r1", "status": "succeeded", "outputs": {"text": "summary"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .run_workflow(&WorkflowRequest::new("summarize", "u"))
        .await
        .unwrap();
    assert_eq!(response.data.outputs.text, "summary");
    assert_eq!(response.workflow_run_id.as_deref(), Some("r1"));
}

#[tokio::test]
async fn workflow_without_text_output_is_json_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/workflows/run"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"outputs": {"result": 1}}})),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .run_workflow(&WorkflowRequest::new("q", "u"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Json(_)));
}

#[tokio::test]
async fn upload_sends_multipart_with_user() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/files/upload"))
        .and(header("authorization", "Bearer app-test"))
        .and(body_string_contains("name=\"user\""))
        .and(body_string_contains("onebot-1"))
        .and(body_string_contains("filename=\"cat.png\""))
        .and(body_string_contains("image/png"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "file-1",
            "name": "cat.png",
            "size": 4,
            "mime_type": "image/png"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("cat.png");
    std::fs::write(&file, b"\x89PNG").unwrap();

    let uploaded = client_for(&server).upload_file(&file, "onebot-1").await.unwrap();
    assert_eq!(uploaded.id, "file-1");
    assert_eq!(uploaded.size, Some(4));
}

#[tokio::test]
async fn upload_of_missing_file_is_io_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let err = client_for(&server)
        .upload_file(&dir.path().join("gone.png"), "u")
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Io(_)));
}

#[tokio::test]
async fn remaining_endpoints_hit_expected_routes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages/m1/feedbacks"))
        .and(body_json(json!({"rating": "like", "user": "u"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "success"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/parameters"))
        .and(query_param("user", "u"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"opening_statement": "hi"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/messages"))
        .and(query_param("conversation_id", "c1"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "has_more": false})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/conversations"))
        .and(query_param("pinned", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "c1"}]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/conversations/c1/name"))
        .and(body_json(json!({"name": "Trip", "user": "u"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1", "name": "Trip"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/completion-messages"))
        .and(body_partial_json(json!({
            "inputs": {"query": "x"},
            "response_mode": "blocking",
            "files": [{"type": "image", "transfer_method": "local_file", "upload_file_id": "f1"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m2", "answer": "done"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let feedback = client.message_feedback("m1", Some(Rating::Like), "u").await.unwrap();
    assert_eq!(feedback["result"], "success");

    let params = client.application_parameters("u").await.unwrap();
    assert_eq!(params["opening_statement"], "hi");

    let messages = client
        .conversation_messages("u", Some("c1"), None, Some(5))
        .await
        .unwrap();
    assert_eq!(messages["has_more"], false);

    let conversations = client.conversations("u", None, None, Some(true)).await.unwrap();
    assert_eq!(conversations["data"][0]["id"], "c1");

    let renamed = client.rename_conversation("c1", "Trip", "u").await.unwrap();
    assert_eq!(renamed["name"], "Trip");

    let completion = client
        .completion_message(
            json!({"query": "x"}),
            "u",
            Some(vec![UploadFileRef::local_image("f1")]),
        )
        .await
        .unwrap();
    assert_eq!(completion.answer, "done");
}
