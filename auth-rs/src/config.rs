//! Configuration for auth-rs
//!
//! Loaded once at startup from an optional TOML file layered under
//! `AUTH_RS_*` environment variables, then frozen for the process lifetime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Environment variable prefix, e.g. `AUTH_RS_BACKEND__URL`
pub const ENV_PREFIX: &str = "AUTH_RS";

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Identity provider configuration
    #[serde(default)]
    pub backend: BackendConfig,
    /// Locally served mail domains and delivery-agent networks
    #[serde(default)]
    pub mail: MailConfig,
    /// Downstream mail servers handed to the mail proxy
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Sender rewriting scheme
    #[serde(default)]
    pub srs: SrsConfig,
    /// Transport lookup behaviour
    #[serde(default)]
    pub lookup: LookupConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Which [`crate::backend::BackendCapability`] implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Remote identity provider over HTTP(S)
    #[default]
    Http,
    /// Accounts seeded from this configuration
    Memory,
}

/// Identity provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend selector
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL of the identity provider
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Client id used for basic authentication
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Client secret used for basic authentication
    pub client_secret: Option<String>,
    /// Per-request timeout against the identity provider
    #[serde(default = "default_backend_timeout")]
    pub timeout_seconds: u64,
    /// Accounts for the memory backend
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    /// Alias table for the memory backend, alias -> ordered targets
    #[serde(default)]
    pub redirects: BTreeMap<String, Vec<String>>,
}

/// One account known to the memory backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountSeed {
    pub email: String,
    pub password: String,
    /// Quota in bytes, unlimited when absent
    pub quota: Option<u64>,
    /// Whether the account has a deliverable mailbox
    #[serde(default = "default_true")]
    pub mailbox: bool,
    /// Whether the account may read mail over IMAP/POP3
    #[serde(default = "default_true")]
    pub can_read: bool,
    /// Whether the account may submit mail
    #[serde(default = "default_true")]
    pub can_send: bool,
}

/// Mail domain configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MailConfig {
    /// Domains this installation delivers for
    #[serde(default)]
    pub domains: Vec<String>,
    /// Comma-separated networks the delivery agent trusts without a password
    #[serde(default)]
    pub allow_nets: String,
}

/// Downstream servers, each `host` or `host:port`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_imap_address")]
    pub imap_address: String,
    #[serde(default = "default_imap_address")]
    pub pop3_address: String,
    #[serde(default = "default_smtp_address")]
    pub smtp_address: String,
    #[serde(default = "default_smtp_address")]
    pub authsmtp_address: String,
}

/// Sender rewriting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SrsConfig {
    /// HMAC key for rewritten addresses
    #[serde(default)]
    pub secret_key: String,
    /// Domain used for rewritten return paths
    #[serde(default = "default_srs_domain")]
    pub domain: String,
    /// Rewritten addresses older than this are refused
    #[serde(default = "default_srs_max_age")]
    pub max_age_days: u32,
}

/// Transport lookup switches
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LookupConfig {
    /// Answer 404 for an alias whose expansion is empty
    #[serde(default = "default_true")]
    pub alias_empty_is_not_found: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_client_id() -> String {
    "mail".to_string()
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_imap_address() -> String {
    "imap".to_string()
}

fn default_smtp_address() -> String {
    "smtp".to_string()
}

fn default_srs_domain() -> String {
    "localhost".to_string()
}

fn default_srs_max_age() -> u32 {
    21
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: default_backend_url(),
            client_id: default_client_id(),
            client_secret: None,
            timeout_seconds: default_backend_timeout(),
            accounts: Vec::new(),
            redirects: BTreeMap::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            imap_address: default_imap_address(),
            pop3_address: default_imap_address(),
            smtp_address: default_smtp_address(),
            authsmtp_address: default_smtp_address(),
        }
    }
}

impl Default for SrsConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            domain: default_srs_domain(),
            max_age_days: default_srs_max_age(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alias_empty_is_not_found: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("mail.domains")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration backed by the memory store
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1:8080".to_string(),
                timeout_seconds: 30,
            },
            backend: BackendConfig {
                kind: BackendKind::Memory,
                accounts: vec![AccountSeed {
                    email: "postmaster@localhost".to_string(),
                    password: "postmaster".to_string(),
                    quota: None,
                    mailbox: true,
                    can_read: true,
                    can_send: true,
                }],
                ..BackendConfig::default()
            },
            mail: MailConfig {
                domains: vec!["localhost".to_string()],
                allow_nets: "127.0.0.0/8".to_string(),
            },
            upstream: UpstreamConfig {
                imap_address: "127.0.0.1".to_string(),
                pop3_address: "127.0.0.1".to_string(),
                smtp_address: "127.0.0.1".to_string(),
                authsmtp_address: "127.0.0.1".to_string(),
            },
            srs: SrsConfig {
                secret_key: "development-only-srs-key".to_string(),
                ..SrsConfig::default()
            },
            lookup: LookupConfig::default(),
        }
    }

    /// Lower-cased set of served domains
    pub fn domain_set(&self) -> HashSet<String> {
        self.mail
            .domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen_addr.parse().map_err(|e| {
            GatewayError::Config(format!(
                "Invalid listen address '{}': {}",
                self.server.listen_addr, e
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.domain_set().is_empty() {
            return Err(GatewayError::Config("No mail domains configured".to_string()));
        }

        if self.backend.kind == BackendKind::Http {
            url::Url::parse(&self.backend.url).map_err(|e| {
                GatewayError::Config(format!(
                    "Invalid backend URL '{}': {}",
                    self.backend.url, e
                ))
            })?;
        }

        if self.srs.secret_key.is_empty() {
            return Err(GatewayError::Config("SRS secret key is empty".to_string()));
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::development()
    }
}
