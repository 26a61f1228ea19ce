//! Safe retrieval of RSS/Atom feeds from untrusted URLs.
//!
//! Every fetch passes an SSRF guard, a per-host rate limiter and a TLS policy
//! before any socket is opened, then runs with bounded retries and a capped
//! response size. See [`fetch::FeedFetcher`] for the entry point.

pub mod config;
pub mod feed;
pub mod fetch;
pub mod security;
