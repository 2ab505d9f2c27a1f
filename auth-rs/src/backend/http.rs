//! Identity provider backend over HTTP(S)
//!
//! One pooled `reqwest` client, authenticated with the configured client
//! credentials, held from startup until [`BackendCapability::close`].

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{AuthFailure, BackendCapability, Verdict, NO_DELAY};
use crate::address::MailAddress;
use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};

/// Header the identity provider uses for its retry-delay hint
pub const RETRY_WAIT_HEADER: &str = "X-Retry-Wait";

/// HTTP backend implementation
pub struct HttpBackend {
    base_url: Url,
    client_id: String,
    client_secret: Option<String>,
    domains: HashSet<String>,
    client: RwLock<Option<Client>>,
}

/// Credential check request body
#[derive(Debug, Serialize)]
struct AccessRequest<'a> {
    password: &'a str,
    client_ip: &'a str,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, domains: HashSet<String>) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| {
            GatewayError::Config(format!("Invalid backend URL '{}': {}", config.url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Config(format!(
                "Backend URL '{}' cannot carry a path",
                config.url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            domains,
            client: RwLock::new(Some(client)),
        })
    }

    fn client(&self) -> Result<Client> {
        self.client
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| GatewayError::BackendUnavailable("backend is closed".to_string()))
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, segments: &[&str]) -> Result<Response> {
        let url = self.endpoint(segments);
        debug!("HttpBackend: GET {}", url);
        let response = self
            .client()?
            .get(url)
            .basic_auth(&self.client_id, self.client_secret.as_ref())
            .send()
            .await?;
        Ok(response)
    }

    async fn verify_access(
        &self,
        scope: &str,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Verdict<()>> {
        let Some(address) = MailAddress::parse(email) else {
            return Ok(Verdict::Denied(AuthFailure::immediate("Missing '@' in address")));
        };
        if !self.has_domain(address.domain()) {
            return Ok(Verdict::Denied(AuthFailure::immediate("Invalid domain")));
        }

        let url = self.endpoint(&["mail", scope, address.as_str()]);
        debug!("HttpBackend: POST {}", url);
        let response = self
            .client()?
            .post(url)
            .basic_auth(&self.client_id, self.client_secret.as_ref())
            .json(&AccessRequest { password, client_ip })
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            let delay = response
                .headers()
                .get(RETRY_WAIT_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(NO_DELAY)
                .to_string();
            warn!("Backend refused {} access for {} from {}", scope, address, client_ip);
            return Ok(Verdict::Denied(AuthFailure::new("Invalid credentials", delay)));
        }

        response.error_for_status()?;
        Ok(Verdict::Granted(()))
    }
}

#[async_trait::async_trait]
impl BackendCapability for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn mail_domains(&self) -> &HashSet<String> {
        &self.domains
    }

    async fn get_quota(&self, email: &str) -> Result<Verdict<Option<u64>>> {
        let response = self.get(&["mail", "quota", email]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Verdict::Denied(AuthFailure::immediate("User invalid")));
        }

        let value: serde_json::Value = response.error_for_status()?.json().await?;
        let quota = value.as_u64().ok_or_else(|| {
            GatewayError::BackendResponse(format!("quota is not an integer: {}", value))
        })?;

        Ok(Verdict::Granted(Some(quota).filter(|q| *q > 0)))
    }

    async fn has_mailbox(&self, email: &str) -> Result<bool> {
        let response = self.get(&["mail", "postbox-exists", email]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }

    async fn email_redirect(&self, alias: &str) -> Result<Verdict<Vec<String>>> {
        let response = self.get(&["mail", "redirects", alias]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Verdict::Denied(AuthFailure::immediate("User invalid")));
        }

        let targets: Vec<String> = response.error_for_status()?.json().await?;
        Ok(Verdict::Granted(targets))
    }

    async fn verify_postbox_access(
        &self,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Verdict<()>> {
        self.verify_access("postbox", email, password, client_ip).await
    }

    async fn verify_send_access(
        &self,
        email: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<Verdict<()>> {
        self.verify_access("send", email, password, client_ip).await
    }

    async fn probe(&self) -> Result<()> {
        info!("Probing identity provider at {}", self.base_url);
        self.get(&[".well-known", "openid-configuration"])
            .await?
            .error_for_status()?;
        info!("Identity provider is reachable");
        Ok(())
    }

    async fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if client.is_some() {
            info!("Closed identity provider session");
        }
    }
}
