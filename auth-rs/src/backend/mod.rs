//! Backend capability contract
//!
//! Every adapter talks to the identity provider through [`BackendCapability`].
//! Exactly one implementation is built at startup by [`build_backend`] and
//! shared behind an `Arc` for the process lifetime.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::config::{BackendKind, GatewayConfig};
use crate::error::Result;

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Retry delay used when the gateway or backend has no better hint
pub const NO_DELAY: &str = "0";

/// Structured authentication failure
///
/// Carries the backend's retry-delay hint so the mail proxy can throttle the
/// client. The hint is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub message: String,
    pub retry_delay: String,
}

impl AuthFailure {
    pub fn new(message: impl Into<String>, retry_delay: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_delay: retry_delay.into(),
        }
    }

    /// Failure decided without consulting any throttling policy
    pub fn immediate(message: impl Into<String>) -> Self {
        Self::new(message, NO_DELAY)
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (retry in {}s)", self.message, self.retry_delay)
    }
}

/// Outcome of a backend query that may be refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<T> {
    Granted(T),
    Denied(AuthFailure),
}

/// Backend capability trait
///
/// Implementations must be safe for concurrent use; calls are independent
/// queries with no ordering between them. `Err` is reserved for transport
/// faults and unexpected responses.
#[async_trait::async_trait]
pub trait BackendCapability: Send + Sync {
    /// Human readable backend name for logs
    fn name(&self) -> &str;

    /// Lower-cased set of served mail domains
    fn mail_domains(&self) -> &HashSet<String>;

    /// Pure membership test against the served domains
    fn has_domain(&self, domain: &str) -> bool {
        self.mail_domains().contains(&domain.to_lowercase())
    }

    /// Quota in bytes, `None` for unlimited; denied for unknown identities
    async fn get_quota(&self, email: &str) -> Result<Verdict<Option<u64>>>;

    /// Whether a deliverable mailbox exists for the address
    async fn has_mailbox(&self, email: &str) -> Result<bool>;

    /// Targets of an alias, mailboxes and further redirects alike
    async fn email_redirect(&self, alias: &str) -> Result<Verdict<Vec<String>>>;

    /// Check mailbox login credentials. May throttle `client_ip` on failure.
    async fn verify_postbox_access(
        &self,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Verdict<()>>;

    /// Check submission credentials. May throttle `client_ip` on failure.
    async fn verify_send_access(
        &self,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Verdict<()>>;

    /// Startup liveness check
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Release connections at shutdown
    async fn close(&self) {}
}

/// Build the configured backend
pub fn build_backend(config: &GatewayConfig) -> Result<Arc<dyn BackendCapability>> {
    let backend: Arc<dyn BackendCapability> = match config.backend.kind {
        BackendKind::Http => Arc::new(HttpBackend::new(&config.backend, config.domain_set())?),
        BackendKind::Memory => Arc::new(MemoryBackend::from_config(config)),
    };
    Ok(backend)
}

/// Build the configured backend and make sure it answers
pub async fn connect_backend(config: &GatewayConfig) -> Result<Arc<dyn BackendCapability>> {
    let backend = build_backend(config)?;
    backend.probe().await?;
    Ok(backend)
}
