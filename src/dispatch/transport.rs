//! Transport seam between the dispatcher and the network.
//!
//! [`Transport`] hides reqwest behind a chunked-body interface so the retry
//! and parsing logic can be exercised without a server. The deadline covers
//! the whole call including streaming; the cancellation token releases an
//! in-flight request immediately.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config;

/// Header carrying the upstream's machine-readable error class.
const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport deadline exceeded")]
    Timeout,
    #[error("transport aborted")]
    Aborted,
    #[error("network failure: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub enum TransportBody {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub bearer_token: String,
    pub headers: Vec<(String, String)>,
    pub body: TransportBody,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub struct TransportResponse {
    pub status: u16,
    /// Value of the upstream error-type header, trimmed of metadata suffixes.
    pub error_kind: Option<String>,
    pub body: ByteStream,
}

impl TransportResponse {
    /// Drains the body into text, capped so an error body cannot balloon.
    pub async fn collect_text(mut self, cap: usize) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            match chunk {
                Ok(bytes) => {
                    out.extend_from_slice(&bytes);
                    if out.len() >= cap {
                        out.truncate(cap);
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and returns the status plus a chunked body. The
    /// deadline spans connection, headers, and every body chunk.
    async fn send(
        &self,
        request: TransportRequest,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Client construction knobs, applied once at startup.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub proxy_url: Option<String>,
    pub pool_max_idle_per_host: usize,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            proxy_url: None,
            pool_max_idle_per_host: 8,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub fn build_http_client(cfg: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .pool_max_idle_per_host(cfg.pool_max_idle_per_host);
    if let Some(proxy) = &cfg.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder.build()
}

/// The reqwest-backed transport used in production.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        HttpTransport { client }
    }

    pub fn with_config(cfg: &HttpClientConfig) -> Result<Self, reqwest::Error> {
        Ok(HttpTransport {
            client: build_http_client(cfg)?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let deadline_at = tokio::time::Instant::now() + deadline;

        let mut builder = self
            .client
            .post(&request.url)
            .bearer_auth(&request.bearer_token)
            .header("x-machine-fingerprint", config::machine_fingerprint());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            TransportBody::Json(value) => builder.json(&value),
            TransportBody::Binary(bytes) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
            _ = tokio::time::sleep_until(deadline_at) => return Err(TransportError::Timeout),
            result = builder.send() => result.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?,
        };

        let status = response.status().as_u16();
        let error_kind = response
            .headers()
            .get(ERROR_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_string());
        if let Some(kind) = &error_kind {
            debug!(status, kind = %kind, "upstream error type header present");
        }

        let body = deadline_stream(response.bytes_stream(), deadline_at, cancel);
        Ok(TransportResponse {
            status,
            error_kind,
            body,
        })
    }
}

/// Wraps a reqwest byte stream so every chunk races the shared deadline and
/// the cancellation token.
fn deadline_stream(
    inner: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    deadline_at: tokio::time::Instant,
    cancel: CancellationToken,
) -> ByteStream {
    struct State<S> {
        inner: Pin<Box<S>>,
        deadline_at: tokio::time::Instant,
        cancel: CancellationToken,
        done: bool,
    }

    let state = State {
        inner: Box::pin(inner),
        deadline_at,
        cancel,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        tokio::select! {
            _ = st.cancel.cancelled() => {
                st.done = true;
                Some((Err(TransportError::Aborted), st))
            }
            _ = tokio::time::sleep_until(st.deadline_at) => {
                st.done = true;
                Some((Err(TransportError::Timeout), st))
            }
            next = st.inner.next() => match next {
                Some(Ok(bytes)) => Some((Ok(bytes), st)),
                Some(Err(e)) => {
                    st.done = true;
                    Some((Err(TransportError::Network(e.to_string())), st))
                }
                None => None,
            }
        }
    }))
}
