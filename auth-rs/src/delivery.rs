//! Local delivery agent lookups
//!
//! The delivery agent only sees connections the mail proxy already
//! authenticated, so the password database always permits and the user
//! database just supplies the quota.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::address::MailAddress;
use crate::backend::{BackendCapability, Verdict};
use crate::error::Result;
use crate::server::AppState;

/// Name of the only filter script
pub const DEFAULT_SCRIPT_NAME: &str = "default";

/// Body of the only filter script
pub const DEFAULT_SCRIPT: &str = include_str!("../templates/default.sieve");

/// Password database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassdbReply {
    pub password: Option<String>,
    pub nopassword: &'static str,
    pub allow_nets: String,
    pub user: String,
}

/// User database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserdbReply {
    pub quota_rule: Option<String>,
}

/// Format a byte quota as a delivery-agent quota rule
pub fn quota_rule(quota: Option<u64>) -> Option<String> {
    quota.map(|bytes| format!("*:bytes={}", bytes))
}

/// Delivery lookup adapter
pub struct DeliveryLookupAdapter {
    backend: Arc<dyn BackendCapability>,
    allow_nets: String,
}

impl DeliveryLookupAdapter {
    pub fn new(backend: Arc<dyn BackendCapability>, allow_nets: String) -> Self {
        Self {
            backend,
            allow_nets,
        }
    }

    pub fn passdb(&self, user: &str) -> PassdbReply {
        PassdbReply {
            password: None,
            nopassword: "Y",
            allow_nets: self.allow_nets.clone(),
            user: user.to_lowercase(),
        }
    }

    /// Quota rule for `user`, `None` when the identity is unknown
    pub async fn userdb(&self, user: &str) -> Result<Option<UserdbReply>> {
        let Some(address) = MailAddress::parse(user) else {
            debug!("User {} is not an address", user);
            return Ok(None);
        };
        match self.backend.get_quota(address.as_str()).await? {
            Verdict::Granted(quota) => Ok(Some(UserdbReply {
                quota_rule: quota_rule(quota),
            })),
            Verdict::Denied(failure) => {
                debug!("No user {}: {}", user, failure.message);
                Ok(None)
            }
        }
    }

    /// Usage report from the delivery agent; nothing is stored
    pub fn record_usage(&self, namespace: &str, user: &str, body: &[u8]) {
        if namespace == "storage" {
            info!(
                "Storage usage for {}: {}",
                user,
                String::from_utf8_lossy(body).trim()
            );
        }
    }
}

/// GET /internal/delivery/passdb/*user
pub async fn passdb_handler(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Json<PassdbReply> {
    Json(state.delivery.passdb(&user))
}

/// GET /internal/delivery/userdb/*user
pub async fn userdb_handler(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Response> {
    Ok(match state.delivery.userdb(&user).await? {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

/// POST /internal/delivery/quota/:namespace/*user
pub async fn quota_handler(
    State(state): State<Arc<AppState>>,
    Path((namespace, user)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    state.delivery.record_usage(&namespace, &user, &body);
    StatusCode::OK
}

/// GET /internal/delivery/sieve/name/:script/*user
pub async fn sieve_name_handler(Path((script, user)): Path<(String, String)>) -> Json<&'static str> {
    debug!("Sieve script {} requested for {}", script, user);
    Json(DEFAULT_SCRIPT_NAME)
}

/// GET /internal/delivery/sieve/data/:script/*user
pub async fn sieve_data_handler(Path((script, user)): Path<(String, String)>) -> &'static str {
    debug!("Sieve data {} requested for {}", script, user);
    DEFAULT_SCRIPT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn adapter() -> DeliveryLookupAdapter {
        let backend = MemoryBackend::new(["example.com"])
            .with_user("alice@example.com", "correct horse", Some(1_073_741_824))
            .with_user("bob@example.com", "battery staple", None);
        DeliveryLookupAdapter::new(Arc::new(backend), "10.0.0.0/8".to_string())
    }

    #[test]
    fn test_quota_rule() {
        assert_eq!(quota_rule(Some(1024)).as_deref(), Some("*:bytes=1024"));
        assert_eq!(quota_rule(None), None);
    }

    #[test]
    fn test_passdb_always_permits() {
        let reply = adapter().passdb("Anyone@Example.com");
        assert_eq!(reply.nopassword, "Y");
        assert_eq!(reply.password, None);
        assert_eq!(reply.user, "anyone@example.com");
        assert_eq!(reply.allow_nets, "10.0.0.0/8");
    }

    #[tokio::test]
    async fn test_userdb() {
        let adapter = adapter();
        assert_eq!(
            adapter.userdb("alice@example.com").await.unwrap(),
            Some(UserdbReply {
                quota_rule: Some("*:bytes=1073741824".to_string())
            })
        );
        assert_eq!(
            adapter.userdb("bob@example.com").await.unwrap(),
            Some(UserdbReply { quota_rule: None })
        );
        assert_eq!(adapter.userdb("ghost@example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_userdb_normalizes_before_backend() {
        let backend = Arc::new(
            MemoryBackend::new(["example.com"]).with_user(
                "alice@example.com",
                "correct horse",
                Some(512),
            ),
        );
        let adapter = DeliveryLookupAdapter::new(backend.clone(), String::new());

        assert_eq!(adapter.userdb("alice").await.unwrap(), None);
        assert_eq!(backend.calls(), 0);

        assert_eq!(
            adapter.userdb("Alice@Example.COM").await.unwrap(),
            Some(UserdbReply {
                quota_rule: Some("*:bytes=512".to_string())
            })
        );
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn test_default_script() {
        assert!(DEFAULT_SCRIPT.contains("fileinto"));
    }
}
