//! Mail transport table lookups
//!
//! Each lookup is a GET with the key in the path. A hit answers 200 with a
//! plain-text value, a miss answers 404 so the transport agent falls through
//! to its next table.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::address::MailAddress;
use crate::backend::{BackendCapability, Verdict};
use crate::error::Result;
use crate::server::AppState;
use crate::srs::SenderRewriter;

/// Access directive returned for local senders
pub const SENDER_ACCESS_DIRECTIVE: &str = "REJECT";

/// Result of a table lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupReply {
    Found(String),
    NotFound,
}

impl IntoResponse for LookupReply {
    fn into_response(self) -> Response {
        match self {
            LookupReply::Found(value) => (StatusCode::OK, value).into_response(),
            LookupReply::NotFound => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

/// Transport lookup adapter
pub struct TransportLookupAdapter {
    backend: Arc<dyn BackendCapability>,
    srs: SenderRewriter,
    alias_empty_is_not_found: bool,
}

impl TransportLookupAdapter {
    pub fn new(
        backend: Arc<dyn BackendCapability>,
        srs: SenderRewriter,
        alias_empty_is_not_found: bool,
    ) -> Self {
        Self {
            backend,
            srs,
            alias_empty_is_not_found,
        }
    }

    /// Is `domain` one we deliver for
    pub fn domain(&self, domain: &str) -> LookupReply {
        if domain.starts_with('[') && domain.ends_with(']') {
            debug!("Address literal {} is not a mail domain", domain);
            return LookupReply::NotFound;
        }
        if self.backend.has_domain(domain) {
            LookupReply::Found(domain.to_string())
        } else {
            LookupReply::NotFound
        }
    }

    /// Does `email` have a mailbox
    pub async fn mailbox(&self, email: &str) -> Result<LookupReply> {
        let Some(address) = MailAddress::parse(email) else {
            return Ok(LookupReply::NotFound);
        };
        if self.backend.has_mailbox(address.as_str()).await? {
            Ok(LookupReply::Found(address.to_string()))
        } else {
            Ok(LookupReply::NotFound)
        }
    }

    /// Expand an alias to its comma-separated targets
    pub async fn alias(&self, alias: &str) -> Result<LookupReply> {
        let Some(address) = MailAddress::parse(alias) else {
            return Ok(LookupReply::NotFound);
        };

        let targets = match self.backend.email_redirect(address.as_str()).await? {
            Verdict::Granted(targets) => targets,
            Verdict::Denied(failure) => {
                debug!("No alias {}: {}", address, failure.message);
                return Ok(LookupReply::NotFound);
            }
        };

        if targets.is_empty() && self.alias_empty_is_not_found {
            debug!("Alias {} has no live targets", address);
            return Ok(LookupReply::NotFound);
        }

        Ok(LookupReply::Found(targets.join(",")))
    }

    /// Relay transport, never granted
    pub fn transport(&self, key: &str) -> LookupReply {
        debug!("Refusing relay transport for {}", key);
        LookupReply::NotFound
    }

    /// Map a rewritten bounce address back to the original sender
    pub fn recipient(&self, recipient: &str) -> LookupReply {
        if !SenderRewriter::is_srs_address(recipient) {
            return LookupReply::NotFound;
        }
        match self.srs.reverse(recipient) {
            Ok(original) => LookupReply::Found(original),
            Err(e) => {
                debug!("Cannot reverse {}: {}", recipient, e);
                LookupReply::NotFound
            }
        }
    }

    /// Rewrite a local sender's return path
    pub fn sender(&self, sender: &str) -> LookupReply {
        match MailAddress::parse(sender) {
            Some(address) if self.backend.has_domain(address.domain()) => {}
            _ => return LookupReply::NotFound,
        }
        // Encode the sender as written; bounces must reach it unchanged
        match sender.trim().split_once('@') {
            Some((local_part, domain)) => {
                LookupReply::Found(self.srs.forward(local_part, domain))
            }
            None => LookupReply::NotFound,
        }
    }

    /// Addresses a logged-in sender may use: only its own
    pub fn sender_login(&self, sender: &str) -> LookupReply {
        LookupReply::Found(sender.to_string())
    }

    /// Access directive for a local sender
    pub fn sender_access(&self, sender: &str) -> LookupReply {
        match MailAddress::parse(sender) {
            Some(address) if self.backend.has_domain(address.domain()) => {
                LookupReply::Found(SENDER_ACCESS_DIRECTIVE.to_string())
            }
            _ => LookupReply::NotFound,
        }
    }
}

/// GET /internal/transport/domain/*domain
pub async fn domain_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> LookupReply {
    state.transport.domain(&domain)
}

/// GET /internal/transport/mailbox/*email
pub async fn mailbox_handler(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Result<LookupReply> {
    state.transport.mailbox(&email).await
}

/// GET /internal/transport/alias/*alias
pub async fn alias_handler(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<LookupReply> {
    state.transport.alias(&alias).await
}

/// GET /internal/transport/transport/*email
pub async fn transport_handler(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> LookupReply {
    state.transport.transport(&email)
}

/// GET /internal/transport/recipient/*recipient
pub async fn recipient_handler(
    State(state): State<Arc<AppState>>,
    Path(recipient): Path<String>,
) -> LookupReply {
    state.transport.recipient(&recipient)
}

/// GET /internal/transport/sender/*sender
pub async fn sender_handler(
    State(state): State<Arc<AppState>>,
    Path(sender): Path<String>,
) -> LookupReply {
    state.transport.sender(&sender)
}

/// GET /internal/transport/login/*sender
pub async fn sender_login_handler(
    State(state): State<Arc<AppState>>,
    Path(sender): Path<String>,
) -> LookupReply {
    state.transport.sender_login(&sender)
}

/// GET /internal/transport/access/*sender
pub async fn sender_access_handler(
    State(state): State<Arc<AppState>>,
    Path(sender): Path<String>,
) -> LookupReply {
    state.transport.sender_access(&sender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn adapter_with(backend: Arc<MemoryBackend>, empty_is_not_found: bool) -> TransportLookupAdapter {
        let srs = SenderRewriter::new("transport-test", "relay.example.com", 21).unwrap();
        TransportLookupAdapter::new(backend, srs, empty_is_not_found)
    }

    fn backend() -> Arc<MemoryBackend> {
        Arc::new(
            MemoryBackend::new(["example.com"])
                .with_user("alice@example.com", "correct horse", None)
                .with_redirect("team@example.com", ["a@x.com", "b@x.com"])
                .with_redirect("empty@example.com", []),
        )
    }

    #[test]
    fn test_domain() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(
            adapter.domain("example.com"),
            LookupReply::Found("example.com".to_string())
        );
        assert_eq!(adapter.domain("other.org"), LookupReply::NotFound);
        assert_eq!(adapter.domain("[192.0.2.1]"), LookupReply::NotFound);
    }

    #[tokio::test]
    async fn test_mailbox() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(
            adapter.mailbox("Alice@example.com").await.unwrap(),
            LookupReply::Found("alice@example.com".to_string())
        );
        assert_eq!(adapter.mailbox("bob@example.com").await.unwrap(), LookupReply::NotFound);
    }

    #[tokio::test]
    async fn test_alias_expansion() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(
            adapter.alias("team@example.com").await.unwrap(),
            LookupReply::Found("a@x.com,b@x.com".to_string())
        );
        assert_eq!(adapter.alias("empty@example.com").await.unwrap(), LookupReply::NotFound);
        assert_eq!(adapter.alias("nobody@example.com").await.unwrap(), LookupReply::NotFound);
    }

    #[tokio::test]
    async fn test_alias_empty_as_success() {
        let adapter = adapter_with(backend(), false);
        assert_eq!(
            adapter.alias("empty@example.com").await.unwrap(),
            LookupReply::Found(String::new())
        );
    }

    #[tokio::test]
    async fn test_lookups_are_repeatable() {
        let adapter = adapter_with(backend(), true);
        let first = adapter.alias("team@example.com").await.unwrap();
        let second = adapter.alias("team@example.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            adapter.mailbox("alice@example.com").await.unwrap(),
            adapter.mailbox("alice@example.com").await.unwrap()
        );
    }

    #[test]
    fn test_transport_never_relays() {
        let adapter = adapter_with(backend(), true);
        for key in ["*", "alice@example.com", "user@[192.0.2.1]", "[10.0.0.1]", "example.com"] {
            assert_eq!(adapter.transport(key), LookupReply::NotFound);
        }
    }

    #[test]
    fn test_sender_rewrite_round_trip() {
        let adapter = adapter_with(backend(), true);
        let LookupReply::Found(rewritten) = adapter.sender("alice@example.com") else {
            panic!("local sender should be rewritten");
        };
        assert!(rewritten.ends_with("@relay.example.com"));
        assert_eq!(
            adapter.recipient(&rewritten),
            LookupReply::Found("alice@example.com".to_string())
        );
    }

    #[test]
    fn test_sender_rewrite_keeps_original_case() {
        let adapter = adapter_with(backend(), true);
        let LookupReply::Found(rewritten) = adapter.sender("Alice.Smith@Example.com") else {
            panic!("local sender should be rewritten");
        };
        assert_eq!(
            adapter.recipient(&rewritten),
            LookupReply::Found("Alice.Smith@Example.com".to_string())
        );
    }

    #[test]
    fn test_sender_rewrite_requires_local_domain() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(adapter.sender("mallory@evil.org"), LookupReply::NotFound);
        assert_eq!(adapter.sender("no-at-sign"), LookupReply::NotFound);
    }

    #[test]
    fn test_recipient_only_reverses_rewritten() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(adapter.recipient("alice@example.com"), LookupReply::NotFound);
        assert_eq!(
            adapter.recipient("SRS0=xxxx=AA=example.com=alice@relay.example.com"),
            LookupReply::NotFound
        );
    }

    #[test]
    fn test_sender_login_and_access() {
        let adapter = adapter_with(backend(), true);
        assert_eq!(
            adapter.sender_login("alice@example.com"),
            LookupReply::Found("alice@example.com".to_string())
        );
        assert_eq!(
            adapter.sender_access("alice@example.com"),
            LookupReply::Found("REJECT".to_string())
        );
        assert_eq!(adapter.sender_access("alice"), LookupReply::NotFound);
        assert_eq!(adapter.sender_access("bob@other.org"), LookupReply::NotFound);
    }

    #[tokio::test]
    async fn test_malformed_addresses_skip_backend() {
        let backend = backend();
        let adapter = adapter_with(backend.clone(), true);
        assert_eq!(adapter.mailbox("alice").await.unwrap(), LookupReply::NotFound);
        assert_eq!(adapter.alias("@example.com").await.unwrap(), LookupReply::NotFound);
        adapter.sender_access("alice");
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_not_found_status() {
        let response = LookupReply::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
