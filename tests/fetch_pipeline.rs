//! End-to-end tests of the fetch pipeline through the public API.
//!
//! Network attempts go through a scripted [`Transport`], so retries and
//! backoff run against tokio's paused clock and no sockets are opened. Feed
//! URLs use TEST-NET-3 literals (203.0.113.0/24): public, so the guard lets
//! them through, and never resolved.

use feedguard::config::{Config, EnvSource, ENV_ENVIRONMENT, ENV_RATE_LIMIT_PER_MINUTE};
use feedguard::feed::FeedOutput;
use feedguard::fetch::{
    Auth, ErrorKind, FeedFetcher, FetchError, FetchRequest, HttpResponse, PooledClient,
    RetryPolicy, Transport, TransportError,
};
use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const FEED_URL: &str = "https://203.0.113.10/feed.xml";

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
    <title>Pipeline Feed</title>
    <link>https://203.0.113.10/</link>
    <description>Test feed</description>
    <item><guid>a</guid><title>A</title></item>
    <item><guid>b</guid><title>B</title></item>
    <item><guid>c</guid><title>C</title></item>
</channel></rss>"#;

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Debug)]
struct Call {
    at: Instant,
    authorization: Option<String>,
    user_agent: Option<String>,
    accepts_invalid_certs: bool,
}

/// Replays a fixed list of outcomes, then keeps failing with a connect error.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls.windows(2).map(|w| w[1].at - w[0].at).collect()
    }
}

impl Transport for ScriptedTransport {
    fn execute<'a>(
        &'a self,
        client: &'a PooledClient,
        request: reqwest::Request,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let header = |name: reqwest::header::HeaderName| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            self.calls.lock().unwrap().push(Call {
                at: Instant::now(),
                authorization: header(reqwest::header::AUTHORIZATION),
                user_agent: header(reqwest::header::USER_AGENT),
                accepts_invalid_certs: client.accepts_invalid_certs(),
            });
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("connection refused".into())))
        })
    }
}

fn ok(body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: 200,
        reason: "OK".into(),
        body: body.as_bytes().to_vec(),
        charset: Some("utf-8".into()),
    })
}

fn status(code: u16, reason: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: code,
        reason: reason.into(),
        body: Vec::new(),
        charset: None,
    })
}

fn env(pairs: &[(&str, &str)]) -> Arc<dyn EnvSource> {
    Arc::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<String, String>>(),
    )
}

fn fetcher(transport: Arc<ScriptedTransport>, env: Arc<dyn EnvSource>) -> FeedFetcher {
    FeedFetcher::new(&Config::default(), env).with_transport(transport)
}

// ============================================================================
// Success and terminal responses
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_success_decodes_feed() {
    let transport = ScriptedTransport::new(vec![ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let request = FetchRequest::new(FEED_URL).with_max_items(Some(2));
    let document = fetcher.fetch(&request).await.unwrap();

    assert_eq!(document.title.as_deref(), Some("Pipeline Feed"));
    let guids: Vec<_> = document.items.iter().map(|i| i.guid.as_str()).collect();
    assert_eq!(guids, vec!["a", "b"]);
    assert_eq!(transport.call_count(), 1);

    let calls = transport.calls.lock().unwrap();
    assert_eq!(
        calls[0].user_agent.as_deref(),
        Some(feedguard::config::DEFAULT_USER_AGENT)
    );
    assert_eq!(calls[0].authorization, None);
}

#[tokio::test(start_paused = true)]
async fn test_http_error_status_is_not_retried() {
    let transport = ScriptedTransport::new(vec![status(404, "Not Found")]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { code: 404, .. }));
    assert_eq!(err.to_string(), "HTTP request failed with status 404: Not Found");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_body_is_failure() {
    let transport = ScriptedTransport::new(vec![ok("")]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::EmptyBody);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_response_is_not_retried() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::ResponseTooLarge(1024))]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    assert!(matches!(err, FetchError::ResponseTooLarge { limit: 1024 }));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_feed_is_decode_failure() {
    let transport = ScriptedTransport::new(vec![ok("<html><body>not a feed")]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DecodeFailure);
    assert_eq!(transport.call_count(), 1);
}

// ============================================================================
// Retry and backoff
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retries_with_exponential_backoff() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout),
        Err(TransportError::Connect("connection reset".into())),
        ok(RSS),
    ]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let document = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap();

    assert_eq!(document.items.len(), 3);
    assert_eq!(transport.call_count(), 3);
    assert_eq!(
        transport.gaps(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_after_max_attempts() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
        Err(TransportError::Io("broken pipe".into())),
    ]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    match &err {
        FetchError::Exhausted {
            attempts,
            last_cause,
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(*last_cause, TransportError::Io("broken pipe".into()));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(
        err.to_string(),
        "Failed to fetch RSS feed after 3 attempts: transport error: broken pipe"
    );
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_policy() {
    let transport = ScriptedTransport::new(Vec::new());
    let fetcher = fetcher(transport.clone(), env(&[])).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(250),
    });

    let err = fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap_err();

    assert!(matches!(err, FetchError::Exhausted { attempts: 2, .. }));
    assert_eq!(transport.gaps(), vec![Duration::from_millis(250)]);
}

#[tokio::test(start_paused = true)]
async fn test_retries_do_not_consume_rate_budget() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap();

    assert_eq!(transport.call_count(), 2);
    assert_eq!(fetcher.rate_limiter().counts("203.0.113.10"), Some((1, 1)));
}

// ============================================================================
// Guards
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_private_targets_never_reach_transport() {
    let transport = ScriptedTransport::new(vec![ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    for url in [
        "http://localhost/feed",
        "http://127.0.0.1:8080/rss",
        "http://169.254.169.254/latest/meta-data/",
        "http://10.0.0.5/feed",
        "http://[::1]/feed",
    ] {
        let err = fetcher.fetch(&FetchRequest::new(url)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrivateNetworkBlocked, "{url}");
    }

    assert_eq!(transport.call_count(), 0);
    assert_eq!(fetcher.rate_limiter().counts("127.0.0.1"), None);
    assert_eq!(fetcher.client_pool().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bad_urls_rejected() {
    let transport = ScriptedTransport::new(Vec::new());
    let fetcher = fetcher(transport.clone(), env(&[]));

    let err = fetcher
        .fetch(&FetchRequest::new("ftp://203.0.113.10/feed"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DisallowedScheme);

    let err = fetcher
        .fetch(&FetchRequest::new("not a url"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUrl);

    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_before_network() {
    let transport = ScriptedTransport::new(vec![ok(RSS), ok(RSS), ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[(ENV_RATE_LIMIT_PER_MINUTE, "2")]));
    let request = FetchRequest::new(FEED_URL);

    fetcher.fetch(&request).await.unwrap();
    fetcher.fetch(&request).await.unwrap();
    let err = fetcher.fetch(&request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    assert_eq!(
        err.to_string(),
        "Failed to fetch RSS feed: Rate limit exceeded: too many requests to 203.0.113.10 per minute"
    );
    assert_eq!(transport.call_count(), 2);

    // Other hosts have their own windows
    fetcher
        .fetch(&FetchRequest::new("https://203.0.113.11/feed.xml"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_tls_bypass_refused_in_production() {
    let transport = ScriptedTransport::new(vec![ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[(ENV_ENVIRONMENT, "Production")]));

    let request = FetchRequest::new(FEED_URL).with_tls_bypass(true);
    let err = fetcher.fetch(&request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SecurityViolation);
    assert_eq!(
        err.to_string(),
        "Failed to fetch RSS feed: SSL certificate validation cannot be disabled in production environments"
    );
    assert_eq!(transport.call_count(), 0);
    assert_eq!(fetcher.client_pool().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tls_bypass_allowed_outside_production() {
    let transport = ScriptedTransport::new(vec![ok(RSS), ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[(ENV_ENVIRONMENT, "development")]));

    fetcher
        .fetch(&FetchRequest::new(FEED_URL).with_tls_bypass(true))
        .await
        .unwrap();
    fetcher.fetch(&FetchRequest::new(FEED_URL)).await.unwrap();

    let calls = transport.calls.lock().unwrap();
    assert!(calls[0].accepts_invalid_certs);
    assert!(!calls[1].accepts_invalid_certs);
    assert_eq!(fetcher.client_pool().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clients_reused_for_identical_settings() {
    let transport = ScriptedTransport::new(vec![ok(RSS), ok(RSS), ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let request = FetchRequest::new(FEED_URL).with_user_agent("Reader/2.0");
    fetcher.fetch(&request).await.unwrap();
    fetcher.fetch(&request).await.unwrap();
    fetcher
        .fetch(&FetchRequest::new(FEED_URL).with_timeout_seconds(5))
        .await
        .unwrap();

    assert_eq!(fetcher.client_pool().len(), 2);
    let calls = transport.calls.lock().unwrap();
    assert_eq!(calls[0].user_agent.as_deref(), Some("Reader/2.0"));
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bearer_token_sent_but_never_logged() {
    let transport = ScriptedTransport::new(Vec::new());
    let fetcher = fetcher(transport.clone(), env(&[]));

    let request = FetchRequest::new(FEED_URL)
        .with_auth(Auth::from_parts(Some("Bearer"), Some("s3cr3t-token".into())));
    let err = fetcher.fetch(&request).await.unwrap_err();

    let calls = transport.calls.lock().unwrap();
    assert_eq!(calls[0].authorization.as_deref(), Some("Bearer s3cr3t-token"));

    assert!(!err.to_string().contains("s3cr3t-token"));
    assert!(!format!("{err:?}").contains("s3cr3t-token"));
    assert!(!request.to_string().contains("s3cr3t-token"));
    assert!(!format!("{request:?}").contains("s3cr3t-token"));
}

#[tokio::test(start_paused = true)]
async fn test_basic_credentials_encoded() {
    let transport = ScriptedTransport::new(vec![ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));

    let request = FetchRequest::new(FEED_URL)
        .with_auth(Auth::from_parts(Some("basic"), Some("user:secret".into())));
    fetcher.fetch(&request).await.unwrap();

    let calls = transport.calls.lock().unwrap();
    assert_eq!(
        calls[0].authorization.as_deref(),
        Some("Basic dXNlcjpzZWNyZXQ=")
    );
}

// ============================================================================
// Interruption
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_interrupt_before_start() {
    let transport = ScriptedTransport::new(Vec::new());
    let fetcher = fetcher(transport.clone(), env(&[]));
    let (_tx, rx) = watch::channel(true);

    let err = fetcher
        .fetch_with_interrupt(&FetchRequest::new(FEED_URL), rx)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Interrupted);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_during_backoff() {
    let transport = ScriptedTransport::new(Vec::new());
    let fetcher = fetcher(transport.clone(), env(&[]));
    let (tx, rx) = watch::channel(false);
    let request = FetchRequest::new(FEED_URL);
    let started = Instant::now();

    let (result, _) = tokio::join!(fetcher.fetch_with_interrupt(&request, rx), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
    });

    assert!(matches!(result, Err(FetchError::Interrupted)));
    assert_eq!(transport.call_count(), 1);
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_uninterrupted_fetch_completes() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok(RSS)]);
    let fetcher = fetcher(transport.clone(), env(&[]));
    let (_tx, rx) = watch::channel(false);

    let document = fetcher
        .fetch_with_interrupt(&FetchRequest::new(FEED_URL), rx)
        .await
        .unwrap();

    assert_eq!(document.items.len(), 3);
    assert_eq!(transport.gaps(), vec![Duration::from_millis(1000)]);
}

// ============================================================================
// Envelope
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_output_envelope_from_pipeline() {
    let transport = ScriptedTransport::new(vec![ok(RSS), status(500, "Internal Server Error")]);
    let fetcher = fetcher(transport.clone(), env(&[]));
    let request = FetchRequest::new(FEED_URL);

    let output = FeedOutput::from(fetcher.fetch(&request).await);
    assert!(output.success);
    assert_eq!(output.feed_title.as_deref(), Some("Pipeline Feed"));
    assert_eq!(output.total_items, 3);

    let output = FeedOutput::from(fetcher.fetch(&request).await);
    assert!(!output.success);
    assert_eq!(output.error_kind, Some(ErrorKind::HttpStatus));
    assert_eq!(
        output.error.as_deref(),
        Some("HTTP request failed with status 500: Internal Server Error")
    );
}
