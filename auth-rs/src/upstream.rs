//! Downstream server selection
//!
//! Maps a (protocol, authenticated) pair to the configured mail server the
//! proxy should hand the connection to. Host names are resolved through
//! tokio's resolver so a slow DNS answer never holds up other lookups.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

/// Protocols the mail proxy authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailProtocol {
    Imap,
    Pop3,
    Smtp,
}

impl MailProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "imap" => Some(MailProtocol::Imap),
            "pop3" => Some(MailProtocol::Pop3),
            "smtp" => Some(MailProtocol::Smtp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MailProtocol::Imap => "imap",
            MailProtocol::Pop3 => "pop3",
            MailProtocol::Smtp => "smtp",
        }
    }
}

impl fmt::Display for MailProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved downstream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Literal IP address
    pub host: String,
    pub port: u16,
}

/// Routing table for downstream servers
#[derive(Debug, Clone)]
pub struct UpstreamTable {
    imap: String,
    pop3: String,
    smtp: String,
    authsmtp: String,
}

impl UpstreamTable {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            imap: config.imap_address.clone(),
            pop3: config.pop3_address.clone(),
            smtp: config.smtp_address.clone(),
            authsmtp: config.authsmtp_address.clone(),
        }
    }

    /// Configured address and default port for a connection
    pub fn target(&self, protocol: MailProtocol, authenticated: bool) -> (&str, u16) {
        match (protocol, authenticated) {
            (MailProtocol::Imap, _) => (self.imap.as_str(), 143),
            (MailProtocol::Pop3, _) => (self.pop3.as_str(), 110),
            (MailProtocol::Smtp, false) => (self.smtp.as_str(), 25),
            (MailProtocol::Smtp, true) => (self.authsmtp.as_str(), 10025),
        }
    }

    /// Resolve the server for a connection to a literal address and port
    pub async fn resolve(&self, protocol: MailProtocol, authenticated: bool) -> Result<Upstream> {
        let (address, default_port) = self.target(protocol, authenticated);
        let (host, port) = split_address(address, default_port);
        let host = resolve_host(&host, port).await?;
        debug!("Upstream for {} (auth={}): {}:{}", protocol, authenticated, host, port);
        Ok(Upstream { host, port })
    }
}

/// Split `host[:port]`, accepting bare and bracketed IPv6 literals
fn split_address(address: &str, default_port: u16) -> (String, u16) {
    let address = address.trim();

    if let Ok(socket) = address.parse::<SocketAddr>() {
        return (socket.ip().to_string(), socket.port());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return (ip.to_string(), default_port);
    }
    if let Some(inner) = address.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
        return (inner.to_string(), default_port);
    }
    if let Some((host, port)) = address.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }

    (address.to_string(), default_port)
}

async fn resolve_host(host: &str, port: u16) -> Result<String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    let resolve_error = |reason: String| GatewayError::Resolve {
        host: host.to_string(),
        reason,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| resolve_error(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip().to_string())
        .ok_or_else(|| resolve_error("no addresses".to_string()))
}
