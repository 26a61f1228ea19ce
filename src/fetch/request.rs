use crate::config::{DEFAULT_MAX_ITEMS, DEFAULT_TIMEOUT_SECONDS, DEFAULT_USER_AGENT};
use crate::feed::ItemFilters;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Rendered in place of any credential in diagnostic output.
pub const MASK: &str = "***MASKED***";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("feedUrl is required")]
    FeedUrlRequired,
    #[error("authType must be 'basic' or 'bearer' (got '{0}')")]
    InvalidAuthType(String),
    #[error("authToken is required when authType is specified")]
    AuthTokenRequired,
    #[error("timeoutSeconds must be greater than zero")]
    InvalidTimeout,
}

/// How a request authenticates against the feed server.
pub enum Auth {
    None,
    /// `user:password` material; split on the first colon when sent.
    Basic(SecretString),
    Bearer(SecretString),
}

impl Auth {
    /// Builds the descriptor from a loose kind/credential pair.
    ///
    /// Unknown or empty kinds, and empty credentials, produce [`Auth::None`].
    pub fn from_parts(kind: Option<&str>, credential: Option<String>) -> Self {
        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            return Auth::None;
        };
        match kind.map(str::trim) {
            Some(k) if k.eq_ignore_ascii_case("basic") => {
                Auth::Basic(SecretString::from(credential))
            }
            Some(k) if k.eq_ignore_ascii_case("bearer") => {
                Auth::Bearer(SecretString::from(credential))
            }
            _ => Auth::None,
        }
    }

    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Auth::None => None,
            Auth::Basic(_) => Some("basic"),
            Auth::Bearer(_) => Some("bearer"),
        }
    }

    /// Splits basic-auth material into (user, password) on the first colon.
    pub(crate) fn basic_parts(credential: &SecretString) -> (String, String) {
        let raw = credential.expose_secret();
        match raw.split_once(':') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => (raw.to_string(), String::new()),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic(_) => write!(f, "Basic({MASK})"),
            Auth::Bearer(_) => write!(f, "Bearer({MASK})"),
        }
    }
}

/// One logical fetch, immutable once built.
///
/// `Debug` and `Display` mask the credential, so a request can be logged
/// as-is.
pub struct FetchRequest {
    pub url: String,
    pub max_items: Option<usize>,
    pub auth: Auth,
    pub tls_bypass: bool,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub filters: ItemFilters,
}

impl FetchRequest {
    /// A request with default settings for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_items: Some(DEFAULT_MAX_ITEMS),
            auth: Auth::None,
            tls_bypass: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            filters: ItemFilters::default(),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_tls_bypass(mut self, tls_bypass: bool) -> Self {
        self.tls_bypass = tls_bypass;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_filters(mut self, filters: ItemFilters) -> Self {
        self.filters = filters;
        self
    }
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url)
            .field("max_items", &self.max_items)
            .field("auth_type", &self.auth.kind())
            .field("auth_token", &self.auth.kind().map(|_| MASK))
            .field("tls_bypass", &self.tls_bypass)
            .field("user_agent", &self.user_agent)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("filters", &self.filters)
            .finish()
    }
}

impl std::fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FetchRequest{{url='{}', maxItems={:?}, authType={}, authToken={}, tlsBypass={}, userAgent='{}', timeoutSeconds={}}}",
            self.url,
            self.max_items,
            self.auth.kind().unwrap_or("none"),
            if self.auth.kind().is_some() { MASK } else { "null" },
            self.tls_bypass,
            self.user_agent,
            self.timeout_seconds,
        )
    }
}

/// Loose request envelope as it arrives from JSON or the command line.
#[derive(Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchInput {
    pub feed_url: Option<String>,
    pub max_items: Option<usize>,
    pub auth_type: Option<String>,
    pub auth_token: Option<String>,
    pub ignore_tls: Option<bool>,
    /// RFC 3339 timestamp.
    pub newer_than: Option<String>,
    pub guid_blacklist: Option<Vec<String>>,
    pub user_agent: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl std::fmt::Debug for FetchInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchInput")
            .field("feed_url", &self.feed_url)
            .field("max_items", &self.max_items)
            .field("auth_type", &self.auth_type)
            .field("auth_token", &self.auth_token.as_ref().map(|_| MASK))
            .field("ignore_tls", &self.ignore_tls)
            .field("newer_than", &self.newer_than)
            .field("guid_blacklist", &self.guid_blacklist)
            .field("user_agent", &self.user_agent)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl FetchInput {
    /// Validates the envelope and produces an immutable [`FetchRequest`].
    pub fn into_request(self) -> Result<FetchRequest, InputError> {
        let url = self
            .feed_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or(InputError::FeedUrlRequired)?;

        let auth_type = self
            .auth_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if let Some(kind) = &auth_type {
            if !kind.eq_ignore_ascii_case("basic") && !kind.eq_ignore_ascii_case("bearer") {
                return Err(InputError::InvalidAuthType(kind.clone()));
            }
            if self
                .auth_token
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
            {
                return Err(InputError::AuthTokenRequired);
            }
        }

        let timeout_seconds = self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        if timeout_seconds == 0 {
            return Err(InputError::InvalidTimeout);
        }

        let filters = ItemFilters {
            newer_than: self.newer_than.as_deref().and_then(parse_newer_than),
            guid_blacklist: self.guid_blacklist.unwrap_or_default(),
        };

        Ok(FetchRequest {
            url,
            max_items: Some(self.max_items.unwrap_or(DEFAULT_MAX_ITEMS)),
            auth: Auth::from_parts(auth_type.as_deref(), self.auth_token),
            tls_bypass: self.ignore_tls.unwrap_or(false),
            user_agent: self
                .user_agent
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_seconds,
            filters,
        })
    }
}

/// Parses an RFC 3339 timestamp; garbage is logged and ignored.
fn parse_newer_than(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(trimmed) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(value = %trimmed, error = %e, "Failed to parse newerThan timestamp, ignoring");
            None
        }
    }
}
