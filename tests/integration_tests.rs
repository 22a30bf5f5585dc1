//! Integration tests for the MCP tool host
//!
//! These tests drive the real transports end to end: stdio over in-memory
//! pipes, and the HTTP routers through `tower::ServiceExt::oneshot`.

use std::time::Duration;

use serde_json::{json, Value};

use mcp_toolhost::builtin;
use mcp_toolhost::config::ServerConfig;
use mcp_toolhost::McpServer;

/// Helper to create a JSON-RPC request
fn make_request(id: i64, method: &str, params: Option<Value>) -> Value {
    let mut request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(p) = params {
        request["params"] = p;
    }
    request
}

fn make_notification(method: &str) -> Value {
    json!({"jsonrpc": "2.0", "method": method})
}

fn initialize_request(id: i64, capabilities: Value) -> Value {
    make_request(
        id,
        "initialize",
        Some(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": capabilities,
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        })),
    )
}

/// Helper to parse JSON-RPC response
fn parse_response(json_str: &str) -> Value {
    serde_json::from_str(json_str).expect("Failed to parse JSON response")
}

fn test_server() -> McpServer {
    builtin::server(ServerConfig::default()).expect("builtin server")
}

mod stdio_tests {
    use super::*;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
    use tokio::task::JoinHandle;

    use mcp_toolhost::transport::stdio;

    struct Client {
        writer: DuplexStream,
        lines: Lines<BufReader<DuplexStream>>,
        task: JoinHandle<mcp_toolhost::Result<()>>,
    }

    impl Client {
        fn start(server: McpServer) -> Self {
            let (writer, server_reader) = tokio::io::duplex(64 * 1024);
            let (server_writer, reader) = tokio::io::duplex(64 * 1024);
            let task = tokio::spawn(stdio::serve(server, server_reader, server_writer));
            Self {
                writer,
                lines: BufReader::new(reader).lines(),
                task,
            }
        }

        async fn send(&mut self, message: Value) {
            self.send_raw(&message.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for output")
                .unwrap()
                .expect("output closed");
            parse_response(&line)
        }

        async fn initialize(&mut self, capabilities: Value) -> Value {
            self.send(initialize_request(1, capabilities)).await;
            let response = self.recv().await;
            self.send(make_notification("notifications/initialized")).await;
            response
        }
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let mut client = Client::start(test_server());
        let response = client.initialize(json!({})).await;

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(response["result"]["serverInfo"]["name"], "mcp-toolhost");
        assert!(response["result"]["capabilities"]["tools"].is_object());
        assert!(response["result"]["capabilities"]["prompts"].is_object());

        client.send(make_request(2, "tools/list", None)).await;
        let response = client.recv().await;
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"ask_reflect"));
        assert!(names.contains(&"run_text_stats"));
    }

    #[tokio::test]
    async fn test_unsupported_version_gets_latest() {
        let mut client = Client::start(test_server());
        client
            .send(make_request(
                1,
                "initialize",
                Some(json!({
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "clientInfo": {"name": "old", "version": "0.1"}
                })),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["protocolVersion"], "2025-06-18");
    }

    #[tokio::test]
    async fn test_call_tools() {
        let mut client = Client::start(test_server());
        client.initialize(json!({})).await;

        client
            .send(make_request(
                2,
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"text": "hello"}})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["content"][0]["text"], "hello");

        client
            .send(make_request(
                3,
                "tools/call",
                Some(json!({"name": "missing", "arguments": {}})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["isError"], true);
        assert!(response["error"].is_null());

        client
            .send(make_request(
                4,
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"txt": "typo"}})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Tool validation failed for 'echo'"));
    }

    #[tokio::test]
    async fn test_malformed_line_gets_null_id_error() {
        let mut client = Client::start(test_server());
        client.send_raw("{not json").await;
        let response = client.recv().await;
        assert!(response["id"].is_null());
        assert_eq!(response["error"]["code"], -32700);

        client.send(json!({"jsonrpc": "2.0", "id": 5})).await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_request_before_initialize() {
        let mut client = Client::start(test_server());
        client.send(make_request(1, "tools/list", None)).await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], -32600);

        client.send(make_request(2, "ping", None)).await;
        let response = client.recv().await;
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn test_workflow_reports_progress() {
        let mut client = Client::start(test_server());
        client.initialize(json!({})).await;

        client
            .send(make_request(
                2,
                "tools/call",
                Some(json!({
                    "name": "run_text_stats",
                    "arguments": {"text": "one two three"},
                    "_meta": {"progressToken": "stats-1"}
                })),
            ))
            .await;

        for step in 1..=3 {
            let note = client.recv().await;
            assert_eq!(note["method"], "notifications/progress");
            assert_eq!(note["params"]["progressToken"], "stats-1");
            assert_eq!(note["params"]["progress"], step as f64);
            assert_eq!(note["params"]["total"], 3.0);
        }
        let response = client.recv().await;
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"]["structuredContent"]["result"]["words"], 3);
    }

    #[tokio::test]
    async fn test_elicitation_round_trip() {
        let mut client = Client::start(test_server());
        client.initialize(json!({"elicitation": {}})).await;

        client
            .send(make_request(
                2,
                "tools/call",
                Some(json!({"name": "confirm_action", "arguments": {"action": "deploy"}})),
            ))
            .await;

        let request = client.recv().await;
        assert_eq!(request["method"], "elicitation/create");
        assert_eq!(request["params"]["message"], "Please confirm: deploy");
        assert_eq!(request["params"]["requestedSchema"]["type"], "object");

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": request["id"].clone(),
                "result": {"action": "accept", "content": {"confirm": true}}
            }))
            .await;
        let response = client.recv().await;
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"]["content"][0]["text"], "Confirmed: deploy");
    }

    #[tokio::test]
    async fn test_elicitation_requires_capability() {
        let mut client = Client::start(test_server());
        client.initialize(json!({})).await;

        client
            .send(make_request(
                2,
                "tools/call",
                Some(json!({"name": "confirm_action", "arguments": {"action": "deploy"}})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("elicitation"));
    }

    #[tokio::test]
    async fn test_prompts_and_resources() {
        let mut client = Client::start(test_server());
        client.initialize(json!({})).await;

        client
            .send(make_request(
                2,
                "prompts/get",
                Some(json!({"name": "summarize", "arguments": {"text": "long story"}})),
            ))
            .await;
        let response = client.recv().await;
        let text = response["result"]["messages"][0]["content"]["text"]
            .as_str()
            .unwrap();
        assert!(text.ends_with("long story"));

        client
            .send(make_request(
                3,
                "prompts/get",
                Some(json!({"name": "summarize", "arguments": {}})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], -32602);

        client
            .send(make_request(
                4,
                "resources/read",
                Some(json!({"uri": "toolhost://about"})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["result"]["contents"][0]["uri"], "toolhost://about");

        client
            .send(make_request(
                5,
                "resources/read",
                Some(json!({"uri": "toolhost://nope"})),
            ))
            .await;
        let response = client.recv().await;
        assert_eq!(response["error"]["code"], -32002);
    }

    #[tokio::test]
    async fn test_eof_disconnects_session() {
        let server = test_server();
        let mut client = Client::start(server.clone());
        client.initialize(json!({})).await;
        assert_eq!(server.session_count(), 1);

        let Client { writer, task, .. } = client;
        drop(writer);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("serve did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_piped_input_is_answered_before_eof_closes() {
        let server = test_server();
        let input = [
            initialize_request(1, json!({})),
            make_notification("notifications/initialized"),
            make_request(2, "tools/list", None),
            make_request(3, "tools/call", Some(json!({"name": "echo", "arguments": {"text": "hi"}}))),
        ]
        .iter()
        .map(|m| format!("{}\n", m))
        .collect::<String>();

        let (mut writer, server_reader) = tokio::io::duplex(64 * 1024);
        let (server_writer, mut reader) = tokio::io::duplex(64 * 1024);
        writer.write_all(input.as_bytes()).await.unwrap();
        drop(writer);

        tokio::time::timeout(
            Duration::from_secs(5),
            stdio::serve(server.clone(), server_reader, server_writer),
        )
        .await
        .expect("serve did not stop")
        .unwrap();

        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        let mut ids: Vec<i64> = output
            .lines()
            .map(parse_response)
            .filter_map(|r| r["id"].as_i64())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(output.contains("\"hi\""));
        assert_eq!(server.session_count(), 0);
    }
}

mod http_tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    use mcp_toolhost::transport::http::{HttpOptions, SESSION_ID_HEADER};

    const ACCEPT_BOTH: &str = "application/json, text/event-stream";

    fn router(options: HttpOptions) -> Router {
        test_server().http_router(options)
    }

    fn post(body: Value, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header("accept", ACCEPT_BOTH);
        if let Some(id) = session {
            builder = builder.header(SESSION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// JSON payloads of every `data:` line in an SSE body
    fn sse_data(text: &str) -> Vec<Value> {
        text.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| parse_response(data.trim()))
            .collect()
    }

    async fn open_session(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post(initialize_request(1, json!({})), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("session header")
            .to_str()
            .unwrap()
            .to_string();
        body_text(response).await;

        let response = app
            .clone()
            .oneshot(post(make_notification("notifications/initialized"), Some(&id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        id
    }

    #[tokio::test]
    async fn test_json_response_mode() {
        let app = router(HttpOptions {
            json_response: true,
            ..HttpOptions::default()
        });
        let session = open_session(&app).await;

        let response = app
            .clone()
            .oneshot(post(
                make_request(
                    2,
                    "tools/call",
                    Some(json!({"name": "echo", "arguments": {"text": "over http"}})),
                ),
                Some(&session),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = parse_response(&body_text(response).await);
        assert_eq!(body["id"], 2);
        assert_eq!(body["result"]["content"][0]["text"], "over http");
    }

    #[tokio::test]
    async fn test_batch_in_json_mode() {
        let app = router(HttpOptions {
            json_response: true,
            ..HttpOptions::default()
        });
        let session = open_session(&app).await;

        let batch = json!([
            make_request(2, "ping", None),
            make_request(3, "tools/list", None),
        ]);
        let response = app.clone().oneshot(post(batch, Some(&session))).await.unwrap();
        let body = parse_response(&body_text(response).await);
        let responses = body.as_array().unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn test_sse_response_mode() {
        let app = router(HttpOptions::default());
        let response = app
            .clone()
            .oneshot(post(initialize_request(1, json!({})), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let text = body_text(response).await;
        assert!(text.contains("event: message"));
        let messages = sse_data(&text);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn test_header_errors() {
        let app = router(HttpOptions::default());

        let request = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", "application/json")
            .body(Body::from(initialize_request(1, json!({})).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

        let response = app
            .clone()
            .oneshot(post(make_request(2, "tools/list", None), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = parse_response(&body_text(response).await);
        assert!(body["id"].is_null());
        assert_eq!(body["jsonrpc"], "2.0");

        let response = app
            .clone()
            .oneshot(post(make_request(2, "tools/list", None), Some("no-such-session")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut request = post(make_request(2, "tools/list", None), None);
        request
            .headers_mut()
            .insert("mcp-protocol-version", "1999-01-01".parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", ACCEPT_BOTH)
            .body(Body::from("{broken"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = parse_response(&body_text(response).await);
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_reinitialize_rejected() {
        let app = router(HttpOptions::default());
        let session = open_session(&app).await;
        let response = app
            .clone()
            .oneshot(post(initialize_request(9, json!({})), Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_standalone_stream_conflict_and_delete() {
        let app = router(HttpOptions::default());
        let session = open_session(&app).await;

        let get = || {
            Request::builder()
                .method("GET")
                .uri("/mcp")
                .header("accept", "text/event-stream")
                .header(SESSION_ID_HEADER, session.as_str())
                .body(Body::empty())
                .unwrap()
        };
        let first = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .header(SESSION_ID_HEADER, session.as_str())
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post(make_request(2, "ping", None), Some(&session)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stateless_mode() {
        let server = test_server();
        let app = server.http_router(HttpOptions {
            stateless: true,
            json_response: true,
        });

        let response = app
            .clone()
            .oneshot(post(make_request(1, "tools/list", None), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_ID_HEADER).is_none());
        let body = parse_response(&body_text(response).await);
        assert!(body["result"]["tools"].is_array());
        assert_eq!(server.session_count(), 0);

        let get = Request::builder()
            .method("GET")
            .uri("/mcp")
            .header("accept", "text/event-stream")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(get).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

mod sse_tests {
    use super::*;

    use axum::body::{Body, BodyDataStream};
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use tower::ServiceExt;

    /// Read until one complete SSE event is buffered; returns (event, data)
    async fn next_event(stream: &mut BodyDataStream, buffer: &mut String) -> (String, String) {
        loop {
            if let Some(end) = buffer.find("\n\n") {
                let raw: String = buffer.drain(..end + 2).collect();
                let mut event = String::new();
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = v.trim().to_string();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data = v.trim().to_string();
                    }
                }
                return (event, data);
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    fn post_message(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_then_messages() {
        let server = test_server();
        let app = server.sse_router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut stream = response.into_body().into_data_stream();
        let mut buffer = String::new();

        let (event, endpoint) = next_event(&mut stream, &mut buffer).await;
        assert_eq!(event, "endpoint");
        assert!(endpoint.starts_with("/message?sessionId="));
        assert_eq!(server.session_count(), 1);

        let response = app
            .clone()
            .oneshot(post_message(&endpoint, initialize_request(1, json!({}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let (event, data) = next_event(&mut stream, &mut buffer).await;
        assert_eq!(event, "message");
        let message = parse_response(&data);
        assert_eq!(message["id"], 1);
        assert_eq!(message["result"]["serverInfo"]["name"], "mcp-toolhost");

        drop(stream);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_post_errors() {
        let app = test_server().sse_router();

        let response = app
            .clone()
            .oneshot(post_message("/message?sessionId=unknown", make_request(1, "ping", None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post_message("/message", make_request(1, "ping", None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

mod config_tests {
    use super::*;

    use std::io::Write;

    use mcp_toolhost::error::{ConfigError, ToolhostError};

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "Notes Server"
description = "Keeps notes"
request_timeout_ms = 5000

[repository]
url = "https://github.com/example/notes"
source = "github"

[transport]
port = 5000
json_response = true
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "Notes Server");
        assert_eq!(config.transport.port, 5000);
        assert!(config.transport.json_response);
        assert!(config.check().is_ok());

        let server = builtin::server(config).unwrap();
        assert_eq!(server.id(), "notes-server");
        let info = serde_json::to_value(server.server_info()).unwrap();
        assert_eq!(info["repository"]["source"], "github");
        assert_eq!(info["description"], "Keeps notes");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = ServerConfig::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(
            err,
            ToolhostError::Config(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = [1, 2").unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ToolhostError::Toml(_)));
    }
}

mod mcp_types_tests {
    use mcp_toolhost::mcp::types::*;

    #[test]
    fn test_tool_result_error() {
        let result = CallToolResult::error("Something went wrong");
        assert!(result.is_error);

        if let Content::Text { text } = &result.content[0] {
            assert!(text.contains("Error:"));
            assert!(text.contains("Something went wrong"));
        } else {
            panic!("Expected text content");
        }
    }

    #[test]
    fn test_request_id_variants() {
        let id_num = RequestId::Number(42);
        let id_str = RequestId::String("req-123".to_string());

        assert_eq!(serde_json::to_string(&id_num).unwrap(), "42");
        assert_eq!(serde_json::to_string(&id_str).unwrap(), "\"req-123\"");
    }

    #[test]
    fn test_jsonrpc_response_error() {
        let response = JsonRpcResponse::error(
            Some(RequestId::Number(1)),
            JsonRpcError::method_not_found("unknown_method"),
        );

        assert!(response.result.is_none());
        assert_eq!(response.error.as_ref().unwrap().code, -32601);
    }
}
