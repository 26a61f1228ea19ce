use crate::config::{is_production, EnvSource, ProcessEnv, ENV_ENVIRONMENT};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsPolicyError {
    /// Certificate validation bypass requested in a production deployment.
    #[error("SSL certificate validation cannot be disabled in production environments")]
    SecurityViolation,
}

/// Decides whether certificate validation may be switched off.
///
/// The production marker is looked up on every call so that flipping the
/// deployment environment takes effect on the next client build.
#[derive(Clone)]
pub struct TlsPolicy {
    env: Arc<dyn EnvSource>,
}

impl TlsPolicy {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self { env }
    }

    /// Fails with [`TlsPolicyError::SecurityViolation`] when `tls_bypass` is
    /// requested while the production marker is set.
    pub fn check(&self, tls_bypass: bool) -> Result<(), TlsPolicyError> {
        if tls_bypass && is_production(self.env.as_ref()) {
            tracing::error!(
                marker = ENV_ENVIRONMENT,
                "SECURITY VIOLATION: TLS bypass is not allowed in production environments"
            );
            return Err(TlsPolicyError::SecurityViolation);
        }
        Ok(())
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self::new(Arc::new(ProcessEnv))
    }
}

impl std::fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("production", &is_production(self.env.as_ref()))
            .finish()
    }
}
