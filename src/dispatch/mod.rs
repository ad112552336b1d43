//! Failover controller: credential selection, retries, and event relay.
//!
//! A dispatch walks the pool in least-used order, giving each credential a
//! bounded number of HTTP attempts (with one refresh-and-retry on an auth
//! rejection), and fails over to the next credential when an attempt ends in
//! a retryable error. Once a response stream is accepted, events flow to the
//! caller through an mpsc channel; failures after that point terminate the
//! stream with a sanitized error event instead of a silent retry, so partial
//! output from an abandoned attempt is never replayed.

pub mod retry;
pub mod transport;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenRefresher;
use crate::config;
use crate::error::GatewayError;
use crate::mappers::conversation::{build_conversation_payload, tool_result_text};
use crate::mappers::models::resolve_model_id;
use crate::mappers::wire::{encode_request, BinaryRequest, EnvironmentInfo, ToolOutputEcho};
use crate::models::{ChatRequest, ContentPart, Credential, Role};
use crate::pool::CredentialPool;
use crate::upstream::{
    frame_scan, JsonTextParser, ReasoningSplitter, StreamEvent, TextDedup, ToolCallAccumulator,
};
use retry::{backoff_delay, classify_response, to_gateway_error, Classified};
use transport::{Transport, TransportBody, TransportError, TransportRequest, TransportResponse};

pub use transport::{build_http_client, HttpClientConfig, HttpTransport};

/// Which upstream protocol a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Conversation,
    Binary,
}

/// Tool name attached to commands recovered from the binary stream, which
/// carries the command text without a tool declaration.
const BINARY_COMMAND_TOOL: &str = "execute_command";

const ERROR_BODY_CAP: usize = 4096;
const CHANNEL_CAPACITY: usize = 64;

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    refresher: Arc<TokenRefresher>,
    transport: Arc<dyn Transport>,
    max_http_attempts: u32,
    max_credential_attempts: u32,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        refresher: Arc<TokenRefresher>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Dispatcher {
            pool,
            refresher,
            transport,
            max_http_attempts: config::MAX_HTTP_ATTEMPTS,
            max_credential_attempts: config::MAX_CREDENTIAL_ATTEMPTS,
            call_timeout: Duration::from_secs(config::CALL_TIMEOUT_SECS),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_attempt_budget(mut self, http: u32, credentials: u32) -> Self {
        self.max_http_attempts = http;
        self.max_credential_attempts = credentials;
        self
    }

    /// Sends the request, returning the unified event stream.
    ///
    /// Credentials already tried are excluded from re-selection; a
    /// non-retryable error aborts the whole dispatch immediately.
    pub async fn dispatch(
        &self,
        req: &ChatRequest,
        backend: Backend,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
        // Captured once so retried attempts encode identical bytes.
        let env = EnvironmentInfo::capture(Utc::now());

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_err = GatewayError::NoCredentialAvailable;

        for _ in 0..self.max_credential_attempts {
            let Some(mut cred) = self.pool.select(&tried) else {
                break;
            };
            tried.insert(cred.id.clone());

            match self
                .try_credential(&mut cred, req, backend, &env, &cancel)
                .await
            {
                Ok(resp) => {
                    self.pool.record_success(&cred.id);
                    info!(credential = %cred.id, backend = ?backend, "dispatch accepted");
                    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                    let cancel = cancel.clone();
                    match backend {
                        Backend::Conversation => {
                            tokio::spawn(conversation_relay(resp, tx, cancel));
                        }
                        Backend::Binary => {
                            tokio::spawn(binary_relay(resp, tx, cancel));
                        }
                    }
                    return Ok(rx);
                }
                Err((err, detail)) => {
                    warn!(credential = %cred.id, error = %err, "credential attempt failed");
                    // A caller-initiated cancel says nothing about the
                    // credential's health.
                    if err != GatewayError::Cancelled {
                        self.pool.record_failure(&cred.id, &detail);
                    }
                    if !err.is_failover_candidate() {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Runs the bounded per-credential attempt loop. Returns the raw detail
    /// alongside the sanitized error so the pool can match quota vocabulary.
    async fn try_credential(
        &self,
        cred: &mut Credential,
        req: &ChatRequest,
        backend: Backend,
        env: &EnvironmentInfo,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, (GatewayError, String)> {
        // Proactive refresh for tokens already inside the expiry window;
        // best effort, a 401 still gets the reactive path below.
        if cred.needs_refresh(Utc::now()) && !cred.refresh_token.is_empty() {
            if let Ok(update) = self.refresher.refresh(cred).await {
                self.pool.record_refreshed(&cred.id, &update);
                apply_update(cred, &update);
            }
        }

        let mut refreshed = false;
        let mut attempt = 0u32;
        let mut last = (GatewayError::Network, String::from("no attempt completed"));

        while attempt < self.max_http_attempts {
            let request = self.build_request(req, cred, backend, env);
            let result = self
                .transport
                .send(request, self.call_timeout, cancel.child_token())
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(TransportError::Timeout) => {
                    return Err((GatewayError::Timeout, "transport deadline exceeded".into()))
                }
                Err(TransportError::Aborted) => {
                    return Err((GatewayError::Cancelled, "dispatch cancelled".into()))
                }
                Err(TransportError::Network(detail)) => {
                    warn!(credential = %cred.id, detail = %detail, "network failure");
                    last = (GatewayError::Network, detail);
                    attempt += 1;
                    if attempt < self.max_http_attempts {
                        tokio::time::sleep(backoff_delay(attempt - 1)).await;
                    }
                    continue;
                }
            };

            if (200..300).contains(&resp.status) {
                return Ok(resp);
            }

            let status = resp.status;
            let error_kind = resp.error_kind.clone();
            let body = resp.collect_text(ERROR_BODY_CAP).await;
            // Full upstream detail stays in the log.
            warn!(
                credential = %cred.id,
                status,
                error_kind = ?error_kind,
                body = %body,
                "upstream rejected request"
            );

            match classify_response(status, error_kind.as_deref(), &body) {
                Classified::AuthExpired if !refreshed && !cred.refresh_token.is_empty() => {
                    refreshed = true;
                    match self.refresher.refresh(cred).await {
                        Ok(update) => {
                            self.pool.record_refreshed(&cred.id, &update);
                            apply_update(cred, &update);
                            // Refresh-and-retry is not charged to the budget.
                            continue;
                        }
                        Err(err) => {
                            warn!(credential = %cred.id, error = %err, "refresh failed");
                            return Err((GatewayError::AuthFailure { status }, body));
                        }
                    }
                }
                Classified::AuthExpired => {
                    return Err((GatewayError::AuthFailure { status }, body));
                }
                Classified::QuotaExhausted => {
                    return Err((GatewayError::QuotaExhausted, body));
                }
                Classified::Fatal => {
                    return Err((GatewayError::BadRequest { status }, body));
                }
                class => {
                    last = (to_gateway_error(class, status), body);
                    attempt += 1;
                    if attempt < self.max_http_attempts {
                        tokio::time::sleep(backoff_delay(attempt - 1)).await;
                    }
                }
            }
        }
        Err(last)
    }

    fn build_request(
        &self,
        req: &ChatRequest,
        cred: &Credential,
        backend: Backend,
        env: &EnvironmentInfo,
    ) -> TransportRequest {
        match backend {
            Backend::Conversation => TransportRequest {
                url: format!(
                    "{}/generateAssistantResponse",
                    config::conversation_api_host(&cred.region)
                ),
                bearer_token: cred.access_token.clone(),
                headers: Vec::new(),
                body: TransportBody::Json(build_conversation_payload(
                    req,
                    cred.auth_method,
                    cred.profile_arn.as_deref(),
                )),
            },
            Backend::Binary => {
                let (query, echo) = binary_query(req);
                let model_id = resolve_model_id(&req.model);
                let bytes = encode_request(&BinaryRequest {
                    query: &query,
                    model_id: &model_id,
                    env,
                    tool_echo: echo.as_ref(),
                });
                TransportRequest {
                    url: format!(
                        "{}/sendMessageStreaming",
                        config::binary_api_host(&cred.region)
                    ),
                    bearer_token: cred.access_token.clone(),
                    headers: Vec::new(),
                    body: TransportBody::Binary(bytes),
                }
            }
        }
    }
}

fn apply_update(cred: &mut Credential, update: &crate::auth::TokenUpdate) {
    cred.access_token = update.access_token.clone();
    if let Some(rt) = &update.refresh_token {
        cred.refresh_token = rt.clone();
    }
    cred.expires_at = Some(update.expires_at);
}

/// Derives the binary backend's flat query from the conversation: the last
/// user turn's text, with the most recent tool exchange folded in as an
/// executed-command echo.
fn binary_query(req: &ChatRequest) -> (String, Option<ToolOutputEcho>) {
    let last_user = req.messages.iter().rev().find(|m| m.role == Role::User);

    let query = last_user
        .map(|m| m.content.text())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Continue".to_string());

    let echo = last_user.and_then(|msg| {
        msg.content.parts().into_iter().find_map(|part| match part {
            ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let command = req
                    .messages
                    .iter()
                    .rev()
                    .filter(|m| m.role == Role::Assistant)
                    .flat_map(|m| m.content.parts())
                    .find_map(|p| match p {
                        ContentPart::ToolUse { id, name, input } if id == tool_use_id => {
                            Some(format!("{name} {input}"))
                        }
                        _ => None,
                    })
                    .unwrap_or_else(|| tool_use_id.clone());
                Some(ToolOutputEcho {
                    command,
                    output: tool_result_text(&content),
                })
            }
            _ => None,
        })
    });

    (query, echo)
}

/// Orders parsed events through the reasoning splitter, duplicate guard, and
/// accumulator bookkeeping shared by both relays.
struct EventPipeline {
    splitter: ReasoningSplitter,
    dedup: TextDedup,
    accum: ToolCallAccumulator,
}

impl EventPipeline {
    fn new() -> Self {
        EventPipeline {
            splitter: ReasoningSplitter::new(),
            dedup: TextDedup::new(),
            accum: ToolCallAccumulator::new(),
        }
    }

    fn push(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        // The duplicate guard compares raw parser output. Splitting first
        // would re-chunk the text and let identical upstream frames through
        // whenever they end in a partial tag.
        match self.dedup.filter(event) {
            Some(StreamEvent::TextDelta(text)) => self.splitter.feed(&text),
            Some(other) => {
                self.accum.on_event(&other);
                vec![other]
            }
            None => Vec::new(),
        }
    }

    /// End-of-stream: emits held-back text and closes a dangling tool call.
    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        out.extend(self.splitter.flush());
        if let Some(call) = self.accum.finish() {
            out.push(StreamEvent::ToolCallEnd { id: call.id });
        }
        out
    }
}

async fn send_all(
    tx: &mpsc::Sender<StreamEvent>,
    events: Vec<StreamEvent>,
    cancel: &CancellationToken,
) -> bool {
    for ev in events {
        if tx.send(ev).await.is_err() {
            // Receiver dropped: release the transport.
            cancel.cancel();
            return false;
        }
    }
    true
}

async fn conversation_relay(
    resp: TransportResponse,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    use futures::StreamExt;

    let mut body = resp.body;
    let mut parser = JsonTextParser::new();
    let mut pipeline = EventPipeline::new();
    let mut sent_any = false;

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                for raw in parser.feed(&bytes) {
                    let events = pipeline.push(raw);
                    sent_any |= !events.is_empty();
                    if !send_all(&tx, events, &cancel).await {
                        return;
                    }
                }
            }
            Err(TransportError::Aborted) => return,
            Err(err) => {
                let mapped = match err {
                    TransportError::Timeout => GatewayError::Timeout,
                    _ => GatewayError::Network,
                };
                let _ = tx
                    .send(StreamEvent::Error {
                        message: mapped.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    let tail = pipeline.finish();
    sent_any |= !tail.is_empty();
    if !send_all(&tx, tail, &cancel).await {
        return;
    }
    if !sent_any {
        let _ = tx
            .send(StreamEvent::Error {
                message: GatewayError::EmptyResponse.to_string(),
            })
            .await;
    }
}

async fn binary_relay(
    resp: TransportResponse,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    use futures::StreamExt;

    let mut body = resp.body;
    let mut dedup = TextDedup::new();
    let mut sent_any = false;

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                let outcome = frame_scan::scan_chunk(&bytes);
                let mut events = Vec::new();
                if let Some(text) = outcome.text {
                    events.extend(dedup.filter(StreamEvent::TextDelta(text)));
                }
                if let Some(cmd) = outcome.command {
                    let args = serde_json::json!({ "command": cmd.text }).to_string();
                    events.push(StreamEvent::ToolCallStart {
                        id: cmd.call_id.clone(),
                        name: BINARY_COMMAND_TOOL.to_string(),
                    });
                    events.push(StreamEvent::ToolCallArgDelta {
                        id: cmd.call_id.clone(),
                        chunk: args,
                    });
                    events.push(StreamEvent::ToolCallEnd { id: cmd.call_id });
                    dedup = TextDedup::new();
                }
                sent_any |= !events.is_empty();
                if !send_all(&tx, events, &cancel).await {
                    return;
                }
            }
            Err(TransportError::Aborted) => return,
            Err(err) => {
                let mapped = match err {
                    TransportError::Timeout => GatewayError::Timeout,
                    _ => GatewayError::Network,
                };
                let _ = tx
                    .send(StreamEvent::Error {
                        message: mapped.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    if !sent_any {
        let _ = tx
            .send(StreamEvent::Error {
                message: GatewayError::EmptyResponse.to_string(),
            })
            .await;
    }
}
