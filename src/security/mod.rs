//! Network-security guards applied before a feed fetch touches the network.
//!
//! - [`address`] - classifies hosts as internal (loopback, private, link-local, ...)
//! - [`url_guard`] - scheme and SSRF validation of a feed URL
//! - [`tls`] - veto on certificate-validation bypass in production

mod address;
mod tls;
mod url_guard;

pub use address::{is_blocked_host, is_blocked_ip, is_blocked_literal};
pub use tls::{TlsPolicy, TlsPolicyError};
pub use url_guard::{validate_url, validate_url_literal, SecurityError};
