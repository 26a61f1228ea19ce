use crate::config::DEFAULT_CLIENT_POOL_CAPACITY;
use crate::security::{validate_url_literal, TlsPolicy, TlsPolicyError};
use lru::LruCache;
use reqwest::redirect::Policy;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const MAX_REDIRECTS: usize = 3;

/// Transport configuration a pooled client is built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub timeout_seconds: u64,
    pub tls_bypass: bool,
    pub user_agent: String,
}

impl ClientKey {
    pub fn new(timeout_seconds: u64, tls_bypass: bool, user_agent: impl Into<String>) -> Self {
        Self {
            timeout_seconds,
            tls_bypass,
            user_agent: user_agent.into(),
        }
    }
}

/// A configured HTTP client shared by every fetch with the same [`ClientKey`].
///
/// Handed out as `Arc<PooledClient>`: eviction from the pool only drops the
/// pool's reference, so in-flight requests keep their transport alive.
#[derive(Debug)]
pub struct PooledClient {
    key: ClientKey,
    client: reqwest::Client,
}

impl PooledClient {
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// True when this client was built with the TLS bypass and so skips
    /// certificate and hostname verification.
    pub fn accepts_invalid_certs(&self) -> bool {
        self.key.tls_bypass
    }
}

/// Builds one client for `key`, consulting the TLS policy first.
///
/// When the bypass is permitted, the client accepts any server certificate
/// (with rustls this also skips hostname verification). The bypass is logged
/// once per build, never per request.
pub fn build_client(policy: &TlsPolicy, key: &ClientKey) -> Result<PooledClient, ClientBuildError> {
    policy.check(key.tls_bypass)?;

    let timeout = Duration::from_secs(key.timeout_seconds.max(1));
    let mut builder = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .user_agent(key.user_agent.as_str())
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60));

    if key.tls_bypass {
        tracing::warn!(
            timeout_seconds = key.timeout_seconds,
            "SSL certificate verification is disabled. This should only be used in development environments."
        );
        builder = builder.danger_accept_invalid_certs(true);
    }

    let client = builder.build().map_err(|e| ClientBuildError::Build(e.to_string()))?;
    tracing::debug!(
        timeout_seconds = key.timeout_seconds,
        tls_bypass = key.tls_bypass,
        "Created new HTTP client"
    );

    Ok(PooledClient {
        key: key.clone(),
        client,
    })
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClientBuildError {
    #[error(transparent)]
    Policy(#[from] TlsPolicyError),
    #[error("Failed to build HTTP client: {0}")]
    Build(String),
}

/// Follows at most three redirects, refuses loops, and refuses hops that land
/// on a non-HTTP scheme or a literal internal address.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        // previous() includes the original URL
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        if let Err(e) = validate_url_literal(url) {
            tracing::warn!(to = %url.host_str().unwrap_or(""), error = %e, "Refusing redirect");
            return attempt.error(e);
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Bounded LRU memo of built clients.
///
/// The cache lock covers map bookkeeping and client construction (no network
/// I/O), so two racing fetches for a new key build it once.
pub struct ClientPool {
    cache: Mutex<LruCache<ClientKey, Arc<PooledClient>>>,
    policy: TlsPolicy,
}

impl ClientPool {
    pub fn new(capacity: usize, policy: TlsPolicy) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            policy,
        }
    }

    /// Returns the shared client for `key`, building it on a miss.
    ///
    /// The TLS policy is re-checked on hits as well, so a bypass client cached
    /// before the production marker appeared is not handed out afterwards.
    pub fn get_client(&self, key: &ClientKey) -> Result<Arc<PooledClient>, ClientBuildError> {
        self.policy.check(key.tls_bypass)?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.get(key) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(build_client(&self.policy, key)?);
        if let Some((evicted, _)) = cache.push(key.clone(), Arc::clone(&client)) {
            if &evicted != key {
                tracing::debug!(
                    timeout_seconds = evicted.timeout_seconds,
                    tls_bypass = evicted.tls_bypass,
                    "Evicted least recently used HTTP client"
                );
            }
        }
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_POOL_CAPACITY, TlsPolicy::default())
    }
}
