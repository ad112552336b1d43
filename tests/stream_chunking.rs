//! End-to-end gateway tests against an in-process scripted transport:
//! translate, dispatch, parse, and accumulate without a live server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use polygate::auth::{AuthMethod, TokenRefresher};
use polygate::dispatch::transport::{
    Transport, TransportError, TransportRequest, TransportResponse,
};
use polygate::models::{ContentPart, MessageContent, Role, ToolSpec};
use polygate::upstream::ToolCallAccumulator;
use polygate::{Backend, ChatRequest, Credential, CredentialPool, Dispatcher, StreamEvent, UnifiedMessage};

fn credential(id: &str) -> Credential {
    Credential {
        id: id.to_string(),
        name: format!("account-{id}"),
        access_token: format!("access-{id}"),
        refresh_token: String::new(),
        client_id: None,
        client_secret: None,
        auth_method: AuthMethod::Social,
        region: "us-east-1".into(),
        profile_arn: None,
        expires_at: None,
        enabled: true,
        use_count: 0,
        error_count: 0,
        last_error: None,
        last_error_at: None,
        quota: None,
    }
}

struct ScriptedTransport {
    responses: Mutex<VecDeque<(u16, Vec<Bytes>)>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<(u16, Vec<Bytes>)>) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            responses: Mutex::new(responses.into()),
        })
    }

    fn streaming(chunks: Vec<Bytes>) -> Arc<Self> {
        Self::new(vec![(200, chunks)])
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _request: TransportRequest,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let (status, chunks) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("transport called more times than scripted");
        let body: Vec<Result<Bytes, TransportError>> = chunks.into_iter().map(Ok).collect();
        Ok(TransportResponse {
            status,
            error_kind: None,
            body: Box::pin(futures::stream::iter(body)),
        })
    }
}

fn dispatcher(transport: Arc<ScriptedTransport>, creds: Vec<Credential>) -> (Dispatcher, Arc<CredentialPool>) {
    let pool = Arc::new(CredentialPool::load(creds));
    let refresher = Arc::new(TokenRefresher::new(reqwest::Client::new()));
    let d = Dispatcher::new(pool.clone(), refresher, transport)
        .with_call_timeout(Duration::from_secs(10));
    (d, pool)
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

fn tool_request() -> ChatRequest {
    ChatRequest {
        model: "claude-sonnet-4".into(),
        messages: vec![UnifiedMessage::user("list the current directory")],
        system: Some("You are a coding assistant.".into()),
        tools: Some(vec![ToolSpec {
            name: "ls".into(),
            description: Some("List directory contents".into()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}}
            }),
        }]),
        stream: true,
    }
}

const CONVERSATION_STREAM: &[u8] = br#"vent{"content":"I'll check. "}{"content":"One moment."}{"name":"ls","toolUseId":"toolu_11"}{"input":"{\"pa"}{"input":"th\":\".\"}"}{"stop":true}{"content":"Done."}"#;

#[tokio::test]
async fn test_conversation_end_to_end_with_tool_accumulation() {
    let transport =
        ScriptedTransport::streaming(vec![Bytes::from_static(CONVERSATION_STREAM)]);
    let (d, pool) = dispatcher(transport, vec![credential("a")]);

    let rx = d
        .dispatch(&tool_request(), Backend::Conversation, CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    let mut accum = ToolCallAccumulator::new();
    let mut text = String::new();
    let mut calls = Vec::new();
    for ev in &events {
        if let StreamEvent::TextDelta(t) = ev {
            text.push_str(t);
        }
        if let Some(call) = accum.on_event(ev) {
            calls.push(call);
        }
    }
    calls.extend(accum.finish());

    assert_eq!(text, "I'll check. One moment.Done.");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "ls");
    assert_eq!(calls[0].input, serde_json::json!({"path": "."}));

    // The accepted call counts toward the credential's usage.
    assert_eq!(pool.get("a").unwrap().use_count, 1);
}

#[tokio::test]
async fn test_chunk_split_does_not_change_events() {
    let whole = ScriptedTransport::streaming(vec![Bytes::from_static(CONVERSATION_STREAM)]);
    let (d_whole, _) = dispatcher(whole, vec![credential("a")]);
    let rx = d_whole
        .dispatch(&tool_request(), Backend::Conversation, CancellationToken::new())
        .await
        .unwrap();
    let expected = collect(rx).await;

    // Re-deliver the identical byte stream in tiny chunks.
    for chunk_size in [1usize, 3, 7, 16] {
        let chunks: Vec<Bytes> = CONVERSATION_STREAM
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let split = ScriptedTransport::streaming(chunks);
        let (d_split, _) = dispatcher(split, vec![credential("a")]);
        let rx = d_split
            .dispatch(&tool_request(), Backend::Conversation, CancellationToken::new())
            .await
            .unwrap();
        let got = collect(rx).await;
        assert_eq!(got, expected, "chunk size {chunk_size} changed the events");
    }
}

#[tokio::test]
async fn test_least_used_rotation_across_dispatches() {
    let transport = ScriptedTransport::new(vec![
        (200, vec![Bytes::from_static(br#"{"content":"one"}"#)]),
        (200, vec![Bytes::from_static(br#"{"content":"two"}"#)]),
    ]);
    let (d, pool) = dispatcher(transport, vec![credential("a"), credential("b")]);

    let rx = d
        .dispatch(&tool_request(), Backend::Conversation, CancellationToken::new())
        .await
        .unwrap();
    collect(rx).await;
    let rx = d
        .dispatch(&tool_request(), Backend::Conversation, CancellationToken::new())
        .await
        .unwrap();
    collect(rx).await;

    // First dispatch used "a" (tie broken by id), the second the then
    // least-used "b".
    assert_eq!(pool.get("a").unwrap().use_count, 1);
    assert_eq!(pool.get("b").unwrap().use_count, 1);
}

#[tokio::test]
async fn test_binary_backend_end_to_end() {
    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x1A, (payload.len() + 2) as u8, 0x0A, payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }

    let mut first = frame(b"The answer ");
    first.extend([0x00, 0x07]);
    let second = frame(b"is 42.");

    let transport = ScriptedTransport::streaming(vec![
        Bytes::from(first),
        Bytes::from(second),
        // Session metadata frame the scanner must discard.
        Bytes::from(frame(b"550e8400-e29b-41d4-a716-446655440000")),
    ]);
    let (d, _) = dispatcher(transport, vec![credential("a")]);

    let req = ChatRequest {
        model: "claude-sonnet-4".into(),
        messages: vec![UnifiedMessage::user("what is the answer?")],
        system: None,
        tools: None,
        stream: true,
    };
    let rx = d
        .dispatch(&req, Backend::Binary, CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("The answer ".into()),
            StreamEvent::TextDelta("is 42.".into()),
        ]
    );
}

#[tokio::test]
async fn test_tool_result_round_trip_into_next_request() {
    // A follow-up request carrying the tool result translates cleanly and
    // still streams: the full loop a caller drives between turns.
    let transport = ScriptedTransport::streaming(vec![Bytes::from_static(
        br#"{"content":"src contains two files."}"#,
    )]);
    let (d, _) = dispatcher(transport, vec![credential("a")]);

    let req = ChatRequest {
        model: "claude-sonnet-4".into(),
        messages: vec![
            UnifiedMessage::user("list src"),
            UnifiedMessage {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![ContentPart::ToolUse {
                    id: "toolu_11".into(),
                    name: "ls".into(),
                    input: serde_json::json!({"path": "src"}),
                }]),
            },
            UnifiedMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: "toolu_11".into(),
                    content: serde_json::Value::String("lib.rs\nmain.rs".into()),
                    is_error: None,
                }]),
            },
        ],
        system: None,
        tools: None,
        stream: true,
    };
    let rx = d
        .dispatch(&req, Backend::Conversation, CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(
        events,
        vec![StreamEvent::TextDelta("src contains two files.".into())]
    );
}
