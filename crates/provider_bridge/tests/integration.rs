use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use agent_provider::{
    cancel_signal, ChatBackend, ChatRequest, FinishReason, Message, ProviderErrorKind,
    ToolDefinition,
};
use pretty_assertions::assert_eq;
use provider_bridge::{Bridge, RetryPolicy};
use provider_registry::{
    AuthError, AuthMode, AuthResolver, EnvOverrides, ProviderConfig, RefreshedToken, TokenSource,
    WireVariant,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
enum ScriptedResponse {
    Respond {
        status: u16,
        content_type: &'static str,
        chunks: Vec<ResponseChunk>,
    },
    Reset,
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    path: String,
    headers: BTreeMap<String, String>,
    body: String,
}

impl RecordedRequest {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("request body should be JSON")
    }
}

struct ScriptedServer {
    _runtime: tokio::runtime::Runtime,
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    request_count: Arc<AtomicUsize>,
}

impl ScriptedServer {
    fn start(scripts: Vec<ScriptedResponse>) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("server runtime");
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("local TCP listener should bind");
        let addr = listener.local_addr().expect("listener address");
        let scripts = Arc::new(scripts);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let request_count = Arc::new(AtomicUsize::new(0));

        runtime.spawn({
            let scripts = Arc::clone(&scripts);
            let requests = Arc::clone(&requests);
            let request_count = Arc::clone(&request_count);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let scripts = Arc::clone(&scripts);
                    let requests = Arc::clone(&requests);
                    let request_count = Arc::clone(&request_count);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, requests, request_count).await;
                    });
                }
            }
        });

        Self {
            _runtime: runtime,
            base_url: format!("http://{addr}/v1"),
            requests,
            request_count,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn json_response(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "application/json",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn sse_response(frames: &[Value]) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status: 200,
        content_type: "text/event-stream",
        chunks: frames
            .iter()
            .map(|frame| ResponseChunk {
                delay_ms: 0,
                bytes: format!("data: {frame}\n\n").into_bytes(),
            })
            .collect(),
    }
}

fn chat_text(text: &str) -> ScriptedResponse {
    json_response(
        200,
        &json!({"choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]})
            .to_string(),
    )
}

fn provider(wire: WireVariant, base_url: &str) -> ProviderConfig {
    ProviderConfig::new("scripted", base_url, wire)
        .with_models(vec!["test-model".to_string()])
        .with_env_vars(vec!["SCRIPTED_API_KEY".to_string()])
}

fn env_auth() -> Arc<AuthResolver> {
    let dir = std::env::temp_dir();
    Arc::new(AuthResolver::new(
        dir,
        EnvOverrides::from_pairs([("SCRIPTED_API_KEY", "tok")]),
    ))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_base_delay(Duration::from_millis(10))
}

fn request() -> ChatRequest {
    ChatRequest {
        instructions: "You are a coding agent.".to_string(),
        messages: vec![Message::user("add function X")],
        tools: vec![ToolDefinition {
            name: "write_file".to_string(),
            description: "Write a file".to_string(),
            input_schema: json!({"type": "object"}),
        }],
    }
}

#[test]
fn chat_completions_round_trip_sends_normalized_request() {
    let server = ScriptedServer::start(vec![chat_text("Done, function X added")]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge");

    let result = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect("completion");

    assert_eq!(result.text, "Done, function X added");
    assert_eq!(result.finish_reason, FinishReason::Stop);

    let recorded = server.requests();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].path, "/v1/chat/completions");
    assert_eq!(recorded[0].headers["authorization"], "Bearer tok");
    let body = recorded[0].json();
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["messages"][1]["content"], "add function X");
    assert_eq!(body["tools"][0]["function"]["name"], "write_file");
}

#[test]
fn responses_stream_forwards_deltas_and_recovers_tool_arguments() {
    let server = ScriptedServer::start(vec![sse_response(&[
        json!({"type": "response.output_text.delta", "delta": "Writing "}),
        json!({"type": "response.output_text.delta", "delta": "file"}),
        json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "write_file", "arguments": ""}}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"path\":\"x.rs\"}"}),
        json!({"type": "response.output_item.done", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "write_file", "arguments": ""}}),
        json!({"type": "response.completed", "response": {"status": "completed"}}),
    ])]);
    let bridge = Bridge::new(
        provider(WireVariant::Responses, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge");

    let mut deltas = Vec::new();
    let result = bridge
        .complete(&request(), &cancel_signal(), &mut |delta| {
            deltas.push(delta.to_string())
        })
        .expect("completion");

    assert_eq!(deltas, vec!["Writing ".to_string(), "file".to_string()]);
    assert_eq!(result.text, "Writing file");
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].arguments, json!({"path": "x.rs"}));

    let recorded = server.requests();
    assert_eq!(recorded[0].path, "/v1/responses");
    assert_eq!(recorded[0].headers["accept"], "text/event-stream");
    assert_eq!(recorded[0].json()["stream"], true);
}

#[test]
fn transient_status_is_retried_then_succeeds() {
    let server = ScriptedServer::start(vec![
        json_response(503, r#"{"error":{"message":"overloaded"}}"#),
        chat_text("ok"),
    ]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let result = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect("completion after retry");

    assert_eq!(result.text, "ok");
    assert_eq!(server.request_count(), 2);
}

#[test]
fn client_errors_are_not_retried() {
    let server = ScriptedServer::start(vec![
        json_response(400, r#"{"error":{"message":"invalid request"}}"#),
        chat_text("unreachable"),
    ]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let error = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect_err("400 must fail");

    assert_eq!(error.kind, ProviderErrorKind::Protocol);
    assert!(error.message.contains("invalid request"), "{}", error.message);
    assert_eq!(server.request_count(), 1);
}

#[test]
fn rate_limits_exhaust_the_attempt_budget() {
    let limited = json_response(429, r#"{"error":{"message":"slow down"}}"#);
    let server = ScriptedServer::start(vec![limited.clone(), limited.clone(), limited]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let error = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect_err("rate limited");

    assert_eq!(error.kind, ProviderErrorKind::RateLimited);
    assert_eq!(server.request_count(), 3);
}

#[test]
fn connection_resets_surface_as_transport_error() {
    let server = ScriptedServer::start(vec![
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
        ScriptedResponse::Reset,
    ]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let error = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect_err("resets");

    assert_eq!(error.kind, ProviderErrorKind::Transport);
    assert!(server.request_count() >= 3);
}

#[test]
fn malformed_body_is_protocol_error_and_not_retried() {
    let server = ScriptedServer::start(vec![json_response(200, "{\"unexpected\":true}")]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let error = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect_err("protocol error");

    assert_eq!(error.kind, ProviderErrorKind::Protocol);
    assert_eq!(error.provider_id, "scripted");
    assert_eq!(server.request_count(), 1);
}

struct CountingTokenSource {
    calls: AtomicUsize,
}

impl TokenSource for CountingTokenSource {
    fn refresh(
        &self,
        _provider: &ProviderConfig,
        _refresh_token: &str,
    ) -> Result<RefreshedToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RefreshedToken {
            access_token: "refreshed".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

#[test]
fn rejected_credential_is_refreshed_once_and_retried() {
    let server = ScriptedServer::start(vec![
        json_response(401, r#"{"error":{"message":"token expired"}}"#),
        chat_text("after refresh"),
    ]);
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("oauth")).expect("oauth dir");
    fs::write(
        dir.path().join("oauth/scripted.json"),
        r#"{"access_token":"old","refresh_token":"r0"}"#,
    )
    .expect("token file");

    let source = Arc::new(CountingTokenSource {
        calls: AtomicUsize::new(0),
    });
    let auth = Arc::new(
        AuthResolver::new(dir.path(), EnvOverrides::from_pairs(Vec::<(String, String)>::new()))
            .with_token_source(source.clone()),
    );
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url).with_auth(AuthMode::Oauth),
        "test-model",
        auth,
    )
    .expect("bridge")
    .with_retry_policy(fast_retry());

    let result = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect("completion after refresh");

    assert_eq!(result.text, "after refresh");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    let recorded = server.requests();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].headers["authorization"], "Bearer old");
    assert_eq!(recorded[1].headers["authorization"], "Bearer refreshed");
}

#[test]
fn oauth_responses_round_trip_uses_token_file_and_codex_headers() {
    let server = ScriptedServer::start(vec![sse_response(&[
        json!({"type": "response.output_text.delta", "delta": "Patching"}),
        json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_7", "call_id": "call_7", "name": "write_file", "arguments": ""}}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_7", "delta": "{\"path\":"}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_7", "delta": "\"lib.rs\",\"content\":\"\"}"}),
        json!({"type": "response.output_item.done", "item": {"type": "function_call", "id": "fc_7", "call_id": "call_7", "name": "write_file", "arguments": ""}}),
        json!({"type": "response.completed", "response": {"status": "completed", "output": [{"type": "function_call", "id": "fc_7", "call_id": "call_7", "name": "write_file", "arguments": ""}]}}),
    ])]);
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("oauth")).expect("oauth dir");
    fs::write(
        dir.path().join("oauth/scripted.json"),
        r#"{"tokens":{"access_token":"oauth-tok","account_id":"acct-42"}}"#,
    )
    .expect("token file");
    let auth = Arc::new(AuthResolver::new(
        dir.path(),
        EnvOverrides::from_pairs(Vec::<(String, String)>::new()),
    ));

    let bridge = Bridge::new(
        provider(
            WireVariant::OauthResponses,
            &format!("{}/codex", server.base_url),
        )
        .with_auth(AuthMode::Oauth),
        "test-model",
        auth,
    )
    .expect("bridge");

    let result = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect("completion");

    assert_eq!(result.text, "Patching");
    assert_eq!(result.finish_reason, FinishReason::ToolCalls);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].id, "call_7");
    assert_eq!(
        result.tool_calls[0].arguments,
        json!({"path": "lib.rs", "content": ""})
    );

    let recorded = server.requests();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].path, "/v1/codex/responses");
    assert_eq!(recorded[0].headers["authorization"], "Bearer oauth-tok");
    assert_eq!(recorded[0].headers["chatgpt-account-id"], "acct-42");
    assert_eq!(recorded[0].headers["openai-beta"], "responses=experimental");
    assert_eq!(recorded[0].headers["originator"], "zagent");
    let body = recorded[0].json();
    assert_eq!(body["store"], false);
    assert_eq!(body["stream"], true);
    assert_eq!(body["model"], "test-model");
}

#[test]
fn rejected_environment_credential_fails_without_retry() {
    let server = ScriptedServer::start(vec![
        json_response(401, r#"{"error":{"message":"bad key"}}"#),
        chat_text("unreachable"),
    ]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge");

    let error = bridge
        .complete(&request(), &cancel_signal(), &mut |_| {})
        .expect_err("auth failure");

    assert_eq!(error.kind, ProviderErrorKind::Auth);
    assert_eq!(server.request_count(), 1);
}

#[test]
fn cancellation_interrupts_an_open_stream() {
    let server = ScriptedServer::start(vec![ScriptedResponse::Respond {
        status: 200,
        content_type: "text/event-stream",
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: format!(
                    "data: {}\n\n",
                    json!({"type": "response.output_text.delta", "delta": "stream"})
                )
                .into_bytes(),
            },
            ResponseChunk {
                delay_ms: 5_000,
                bytes: format!(
                    "data: {}\n\n",
                    json!({"type": "response.completed", "response": {"status": "completed"}})
                )
                .into_bytes(),
            },
        ],
    }]);
    let bridge = Bridge::new(
        provider(WireVariant::Responses, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge");

    let cancel = cancel_signal();
    let trigger = {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            cancel.store(true, Ordering::Release);
        })
    };

    let started = Instant::now();
    let error = bridge
        .complete(&request(), &cancel, &mut |_| {})
        .expect_err("cancelled");
    trigger.join().expect("trigger thread");

    assert_eq!(error.kind, ProviderErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn pre_cancelled_request_never_reaches_the_server() {
    let server = ScriptedServer::start(vec![chat_text("unreachable")]);
    let bridge = Bridge::new(
        provider(WireVariant::ChatCompletions, &server.base_url),
        "test-model",
        env_auth(),
    )
    .expect("bridge");

    let cancel = Arc::new(AtomicBool::new(true));
    let error = bridge
        .complete(&request(), &cancel, &mut |_| {})
        .expect_err("cancelled");

    assert!(error.is_cancelled());
    assert_eq!(server.request_count(), 0);
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    request_count: Arc<AtomicUsize>,
) {
    let Ok(Some(recorded)) = read_request(&mut socket).await else {
        return;
    };
    requests.lock().expect("requests lock").push(recorded);

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| json_response(500, r#"{"error":{"message":"unexpected request"}}"#));

    match response {
        ScriptedResponse::Reset => {}
        ScriptedResponse::Respond {
            status,
            content_type,
            chunks,
        } => {
            let headers = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
                status_reason(status),
            );
            if socket.write_all(headers.as_bytes()).await.is_err() {
                return;
            }

            for chunk in chunks {
                if chunk.delay_ms > 0 {
                    sleep(Duration::from_millis(chunk.delay_ms)).await;
                }
                let prefix = format!("{:X}\r\n", chunk.bytes.len());
                if socket.write_all(prefix.as_bytes()).await.is_err()
                    || socket.write_all(&chunk.bytes).await.is_err()
                    || socket.write_all(b"\r\n").await.is_err()
                {
                    return;
                }
            }

            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<RecordedRequest>> {
    let mut raw = Vec::new();
    let mut buffer = [0_u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        raw.extend_from_slice(&buffer[..n]);
        if let Some(position) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect::<BTreeMap<_, _>>();

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() - header_end < content_length {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buffer[..n]);
    }

    Ok(Some(RecordedRequest {
        path,
        headers,
        body: String::from_utf8_lossy(&raw[header_end..]).into_owned(),
    }))
}
