use super::address::{is_blocked_host, is_blocked_literal};
use thiserror::Error;
use url::Url;

/// Errors raised while vetting a feed URL.
///
/// These cover both parsing failures and the policy rejections that keep the
/// fetcher from being used as an SSRF proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The URL string could not be parsed, or has no host.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// The URL uses a scheme other than http or https.
    #[error("Only HTTP and HTTPS protocols are allowed (got {0})")]
    DisallowedScheme(String),
    /// The host is, or resolves to, a loopback/private/link-local address.
    #[error("Access to private/internal networks is not allowed: {0}")]
    PrivateNetworkBlocked(String),
}

/// Validates a URL string before any network I/O happens.
///
/// Rejects, in order:
/// - strings that do not parse as a URL ([`SecurityError::InvalidUrl`])
/// - schemes other than `http`/`https` ([`SecurityError::DisallowedScheme`])
/// - hosts the address classifier flags as internal
///   ([`SecurityError::PrivateNetworkBlocked`])
///
/// Returns the parsed [`Url`] on success so callers do not parse twice.
///
/// # Examples
///
/// ```no_run
/// # async fn demo() {
/// use feedguard::security::validate_url;
///
/// let url = validate_url("https://example.com/feed.xml").await.unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed").await.is_err());
/// assert!(validate_url("file:///etc/passwd").await.is_err());
/// # }
/// ```
pub async fn validate_url(url_str: &str) -> Result<Url, SecurityError> {
    let url = check_syntax(url_str)?;
    let host = host_of(&url)?;

    if is_blocked_host(&host).await {
        tracing::warn!(host = %host, "Blocked request to private/internal network");
        return Err(SecurityError::PrivateNetworkBlocked(host));
    }

    Ok(url)
}

/// Synchronous variant that applies the scheme check and the literal address
/// checks only. Used where DNS is unavailable, e.g. inside redirect hooks.
pub fn validate_url_literal(url: &Url) -> Result<(), SecurityError> {
    check_scheme(url)?;
    let host = host_of(url)?;
    if is_blocked_literal(&host) {
        return Err(SecurityError::PrivateNetworkBlocked(host));
    }
    Ok(())
}

fn check_syntax(url_str: &str) -> Result<Url, SecurityError> {
    let url = Url::parse(url_str.trim()).map_err(|e| SecurityError::InvalidUrl(e.to_string()))?;
    check_scheme(&url)?;
    Ok(url)
}

fn check_scheme(url: &Url) -> Result<(), SecurityError> {
    // Url::parse lowercases the scheme
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(SecurityError::DisallowedScheme(scheme.to_owned())),
    }
}

fn host_of(url: &Url) -> Result<String, SecurityError> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| SecurityError::InvalidUrl("URL has no host".to_string()))
}
