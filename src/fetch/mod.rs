//! The fetch pipeline: request model, per-host rate limiting, pooled HTTP
//! clients, the transport seam and the retrying fetcher that ties them together.
//!
//! A fetch runs these stages in order, stopping at the first failure:
//!
//! 1. URL guard ([`crate::security::validate_url`])
//! 2. [`RateLimiter::check_and_record`], once per logical fetch
//! 3. [`ClientPool::get_client`], which re-applies the TLS policy
//! 4. up to [`RetryPolicy::max_attempts`] transport attempts with exponential backoff
//! 5. the [`crate::feed::FeedDecoder`]

mod client_pool;
mod fetcher;
mod rate_limit;
mod request;
mod transport;

pub use client_pool::{build_client, ClientBuildError, ClientKey, ClientPool, PooledClient};
pub use fetcher::{ErrorKind, FeedFetcher, FetchError, RetryPolicy};
pub use rate_limit::{RateLimitError, RateLimiter, RateWindowKind};
pub use request::{Auth, FetchInput, FetchRequest, InputError, MASK};
pub use transport::{HttpResponse, ReqwestTransport, Transport, TransportError};
