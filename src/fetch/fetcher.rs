use super::client_pool::{ClientBuildError, ClientKey, ClientPool, PooledClient};
use super::rate_limit::{RateLimitError, RateLimiter};
use super::request::{Auth, FetchRequest};
use super::transport::{HttpResponse, ReqwestTransport, Transport, TransportError};
use crate::config::{Config, EnvSource, ProcessEnv};
use crate::feed::{DecodeError, DecodeOptions, FeedDecoder, FeedDocument, FeedRsDecoder};
use crate::security::{validate_url, SecurityError, TlsPolicy, TlsPolicyError};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(1000);

/// Terminal failure of one logical fetch.
///
/// Every failure path of the pipeline ends in exactly one of these; none of
/// the messages carry credential material.
#[derive(Debug, Error)]
pub enum FetchError {
    /// URL failed parsing, scheme or private-network checks
    #[error("Failed to fetch RSS feed: {0}")]
    Security(#[from] SecurityError),
    /// Per-host ceiling exceeded
    #[error("Failed to fetch RSS feed: {0}")]
    RateLimited(#[from] RateLimitError),
    /// Client could not be built (includes TLS bypass in production)
    #[error("Failed to fetch RSS feed: {0}")]
    Client(#[from] ClientBuildError),
    /// The HTTP request could not be assembled (e.g. invalid header value)
    #[error("Failed to fetch RSS feed: invalid request: {0}")]
    InvalidRequest(String),
    /// Server answered with a non-2xx status; never retried
    #[error("HTTP request failed with status {code}: {message}")]
    HttpStatus { code: u16, message: String },
    /// 2xx response without a body
    #[error("Failed to fetch RSS feed: response body was empty")]
    EmptyBody,
    /// Body exceeded the configured size limit
    #[error("Failed to fetch RSS feed: response too large (exceeds {limit} bytes)")]
    ResponseTooLarge { limit: usize },
    /// Every attempt failed at the transport level
    #[error("Failed to fetch RSS feed after {attempts} attempts: {last_cause}")]
    Exhausted {
        attempts: u32,
        last_cause: TransportError,
    },
    /// Interrupted before an attempt or while waiting to retry
    #[error("Failed to fetch RSS feed: request interrupted")]
    Interrupted,
    /// Body could not be decoded as a feed
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Flat category of a [`FetchError`], stable for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidUrl,
    DisallowedScheme,
    PrivateNetworkBlocked,
    RateLimitExceeded,
    SecurityViolation,
    ClientBuild,
    InvalidRequest,
    HttpStatus,
    EmptyBody,
    ResponseTooLarge,
    Exhausted,
    Interrupted,
    DecodeFailure,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Security(SecurityError::InvalidUrl(_)) => ErrorKind::InvalidUrl,
            FetchError::Security(SecurityError::DisallowedScheme(_)) => ErrorKind::DisallowedScheme,
            FetchError::Security(SecurityError::PrivateNetworkBlocked(_)) => {
                ErrorKind::PrivateNetworkBlocked
            }
            FetchError::RateLimited(_) => ErrorKind::RateLimitExceeded,
            FetchError::Client(ClientBuildError::Policy(TlsPolicyError::SecurityViolation)) => {
                ErrorKind::SecurityViolation
            }
            FetchError::Client(ClientBuildError::Build(_)) => ErrorKind::ClientBuild,
            FetchError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            FetchError::HttpStatus { .. } => ErrorKind::HttpStatus,
            FetchError::EmptyBody => ErrorKind::EmptyBody,
            FetchError::ResponseTooLarge { .. } => ErrorKind::ResponseTooLarge,
            FetchError::Exhausted { .. } => ErrorKind::Exhausted,
            FetchError::Interrupted => ErrorKind::Interrupted,
            FetchError::Decode(_) => ErrorKind::DecodeFailure,
        }
    }
}

/// Attempt budget and exponential backoff schedule.
///
/// The wait after failed attempt `n` (0-based) is `base_delay * 2^n`:
/// 1s, 2s, 4s with the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
        }
    }
}

/// Runs the safe-fetch pipeline: URL guard, rate limit, pooled client,
/// bounded retries, then hands the body to the decoder.
///
/// Cheap to share behind an `Arc`; all mutable state (rate windows, client
/// cache) is internally synchronized.
pub struct FeedFetcher {
    limiter: RateLimiter,
    pool: ClientPool,
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn FeedDecoder>,
    retry: RetryPolicy,
}

impl FeedFetcher {
    /// Builds a fetcher from file configuration and an environment source.
    pub fn new(config: &Config, env: Arc<dyn EnvSource>) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&env))
            .with_per_minute(config.rate_limit_per_minute)
            .with_per_hour(config.rate_limit_per_hour);
        let pool = ClientPool::new(config.client_pool_capacity, TlsPolicy::new(env));

        Self {
            limiter,
            pool,
            transport: Arc::new(ReqwestTransport::new(config.max_response_bytes)),
            decoder: Arc::new(FeedRsDecoder),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn FeedDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn client_pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Fetches and decodes one feed.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Security`] - bad URL, scheme, or internal target
    /// - [`FetchError::RateLimited`] - per-host ceiling exceeded
    /// - [`FetchError::Client`] - TLS bypass vetoed, or client build failure
    /// - [`FetchError::HttpStatus`] - non-2xx response (not retried)
    /// - [`FetchError::EmptyBody`] - 2xx response without content
    /// - [`FetchError::ResponseTooLarge`] - body over the size limit
    /// - [`FetchError::Exhausted`] - every attempt failed at the transport level
    /// - [`FetchError::Decode`] - body is not a feed
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FeedDocument, FetchError> {
        self.run(request, None).await
    }

    /// Like [`fetch`](Self::fetch), but gives up once `interrupt` turns true.
    ///
    /// An interrupt aborts the in-flight attempt as a transport failure; an
    /// interrupt before an attempt or during a backoff wait ends the fetch
    /// with [`FetchError::Interrupted`].
    pub async fn fetch_with_interrupt(
        &self,
        request: &FetchRequest,
        interrupt: watch::Receiver<bool>,
    ) -> Result<FeedDocument, FetchError> {
        self.run(request, Some(interrupt)).await
    }

    async fn run(
        &self,
        request: &FetchRequest,
        interrupt: Option<watch::Receiver<bool>>,
    ) -> Result<FeedDocument, FetchError> {
        tracing::info!(request = %request, "Fetching RSS feed");

        let result = self.run_pipeline(request, interrupt).await;
        match &result {
            Ok(document) => {
                tracing::info!(url = %request.url, items = document.items.len(), "Fetched RSS feed");
            }
            Err(e) => {
                tracing::error!(url = %request.url, kind = ?e.kind(), error = %e, "RSS feed fetch failed");
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        request: &FetchRequest,
        mut interrupt: Option<watch::Receiver<bool>>,
    ) -> Result<FeedDocument, FetchError> {
        // Guard first: blocked targets never consume rate budget or sockets
        let url = validate_url(&request.url).await?;
        let host = url.host_str().unwrap_or_default().to_string();

        // Counted once per logical fetch, not per retry
        self.limiter.check_and_record(&host)?;

        let key = ClientKey::new(
            request.timeout_seconds,
            request.tls_bypass,
            request.user_agent.as_str(),
        );
        let client = self.pool.get_client(&key)?;

        let http_request = build_http_request(&client, url, request)?;

        let response = self
            .send_with_retry(&client, http_request, &mut interrupt)
            .await?;

        if !response.is_success() {
            return Err(FetchError::HttpStatus {
                code: response.status,
                message: response.reason,
            });
        }

        if response.body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        let options = DecodeOptions {
            max_items: request.max_items,
            filters: Some(&request.filters),
        };
        Ok(self
            .decoder
            .decode(&response.body, response.charset.as_deref(), options)?)
    }

    /// Issues the request up to `max_attempts` times, backing off between
    /// transport failures. Any HTTP response, whatever its status, ends the loop.
    async fn send_with_retry(
        &self,
        client: &PooledClient,
        request: reqwest::Request,
        interrupt: &mut Option<watch::Receiver<bool>>,
    ) -> Result<HttpResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if interrupt.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(FetchError::Interrupted);
            }

            let attempt_request = request.try_clone().ok_or_else(|| {
                FetchError::InvalidRequest("request body cannot be replayed".to_string())
            })?;

            let error = match self.attempt(client, attempt_request, interrupt.as_mut()).await {
                Ok(response) => return Ok(response),
                Err(TransportError::ResponseTooLarge(limit)) => {
                    return Err(FetchError::ResponseTooLarge { limit })
                }
                Err(e) => e,
            };

            if attempt + 1 >= max_attempts {
                tracing::error!(attempts = max_attempts, error = %error, "All retry attempts failed");
                return Err(FetchError::Exhausted {
                    attempts: max_attempts,
                    last_cause: error,
                });
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request attempt failed, retrying"
            );
            backoff(delay, interrupt.as_mut()).await?;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        client: &PooledClient,
        request: reqwest::Request,
        interrupt: Option<&mut watch::Receiver<bool>>,
    ) -> Result<HttpResponse, TransportError> {
        let send = self.transport.execute(client, request);
        match interrupt {
            None => send.await,
            Some(rx) => tokio::select! {
                result = send => result,
                _ = wait_for_interrupt(rx) => Err(TransportError::Interrupted),
            },
        }
    }
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new(&Config::default(), Arc::new(ProcessEnv))
    }
}

/// Assembles the GET request with User-Agent and, when present, Authorization.
fn build_http_request(
    client: &PooledClient,
    url: Url,
    request: &FetchRequest,
) -> Result<reqwest::Request, FetchError> {
    let mut builder = client
        .http()
        .get(url)
        .header(reqwest::header::USER_AGENT, request.user_agent.as_str());

    builder = match &request.auth {
        Auth::None => builder,
        Auth::Basic(credential) => {
            let (user, password) = Auth::basic_parts(credential);
            builder.basic_auth(user, Some(password))
        }
        Auth::Bearer(token) => builder.bearer_auth(token.expose_secret()),
    };

    builder
        .build()
        .map_err(|e| FetchError::InvalidRequest(e.without_url().to_string()))
}

/// Sleeps for `delay`, returning early with [`FetchError::Interrupted`] if
/// the interrupt fires first (or already has).
async fn backoff(
    delay: Duration,
    interrupt: Option<&mut watch::Receiver<bool>>,
) -> Result<(), FetchError> {
    let Some(rx) = interrupt else {
        tokio::time::sleep(delay).await;
        return Ok(());
    };

    if *rx.borrow() {
        return Err(FetchError::Interrupted);
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = wait_for_interrupt(rx) => Err(FetchError::Interrupted),
    }
}

/// Resolves once the flag is true; never resolves if the sender is gone.
async fn wait_for_interrupt(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|interrupted| *interrupted).await.is_err() {
        std::future::pending::<()>().await;
    }
}
