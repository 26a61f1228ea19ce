use super::client_pool::PooledClient;
use crate::config::DEFAULT_MAX_RESPONSE_BYTES;
use futures::future::BoxFuture;
use futures::StreamExt;
use thiserror::Error;

/// A response as seen by the executor: status line plus a bounded body.
///
/// The body is only read for 2xx responses; for anything else it is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
    /// `charset` parameter of the `Content-Type` header, lowercased.
    pub charset: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures below the HTTP layer.
///
/// Messages never include the request URL, so query-string tokens cannot
/// leak through them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Io(String),
    #[error("request interrupted")]
    Interrupted,
    #[error("response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
}

impl TransportError {
    /// Returns true if the attempt may be repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::Io(_)
            | TransportError::Interrupted => true,
            TransportError::ResponseTooLarge(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(error_chain(&e))
        } else {
            TransportError::Io(error_chain(&e))
        }
    }
}

/// Joins an error with its sources ("a: b: c").
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Issues one HTTP attempt.
///
/// The seam between the executor's retry loop and the network; tests script
/// it to inject failures without sockets.
pub trait Transport: Send + Sync {
    fn execute<'a>(
        &'a self,
        client: &'a PooledClient,
        request: reqwest::Request,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

/// Sends requests through the pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    max_response_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(max_response_bytes: usize) -> Self {
        Self { max_response_bytes }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESPONSE_BYTES)
    }
}

impl Transport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        client: &'a PooledClient,
        request: reqwest::Request,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let response = client.http().execute(request).await?;

            let status = response.status();
            let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
            let charset = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(charset_of);

            if !status.is_success() {
                return Ok(HttpResponse {
                    status: status.as_u16(),
                    reason,
                    body: Vec::new(),
                    charset,
                });
            }

            let body = read_limited_bytes(response, self.max_response_bytes).await?;
            Ok(HttpResponse {
                status: status.as_u16(),
                reason,
                body,
                charset,
            })
        })
    }
}

/// Extracts the `charset` parameter from a Content-Type value.
fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').to_ascii_lowercase();
        (!value.is_empty()).then_some(value)
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(TransportError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(TransportError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
