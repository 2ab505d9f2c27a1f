//! Mail proxy authentication
//!
//! The mail proxy asks once per client connection, passing everything in
//! `Auth-*` request headers, and expects the decision back in response
//! headers with an empty body:
//!
//! ```text
//! Auth-Method: plain            Auth-Status: OK
//! Auth-Protocol: imap     ->    Auth-Server: 10.0.0.5
//! Auth-User: alice%40ex.org     Auth-Port: 143
//! Auth-Pass: ...
//! Auth-Login-Attempt: 1
//! Client-IP: 192.0.2.1
//! ```
//!
//! Refusals carry `Auth-Error-Code` and `Auth-Wait` so the proxy can relay
//! a protocol-correct error and delay the client's next attempt.

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use percent_encoding::percent_decode;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::MailAddress;
use crate::backend::{AuthFailure, BackendCapability, Verdict, NO_DELAY};
use crate::error::{GatewayError, Result};
use crate::server::AppState;
use crate::upstream::{MailProtocol, UpstreamTable};

/// Attempts beyond this are refused without asking the backend
pub const MAX_LOGIN_ATTEMPTS: u32 = 10;

/// Passwords shorter than this are refused without asking the backend
pub const MIN_PASSWORD_LENGTH: usize = 8;

const STATUS_OK: &str = "OK";
const STATUS_INVALID: &str = "Authentication credentials invalid";
const STATUS_TOO_MANY: &str = "Invalid login or password";

/// Authentication method announced by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Plain,
    Apop,
    CramMd5,
    External,
}

impl AuthMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(AuthMethod::None),
            "plain" => Some(AuthMethod::Plain),
            "apop" => Some(AuthMethod::Apop),
            "cram-md5" => Some(AuthMethod::CramMd5),
            "external" => Some(AuthMethod::External),
            _ => None,
        }
    }
}

/// One connection's authentication request
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub method: AuthMethod,
    pub protocol: MailProtocol,
    /// Raw `Auth-User` header bytes, still percent-encoded
    pub user: Option<Vec<u8>>,
    /// Raw `Auth-Pass` header bytes, still percent-encoded
    pub password: Option<Vec<u8>>,
    pub attempt: u32,
    pub client_ip: String,
    pub client_host: String,
}

impl AuthRequest {
    /// Parse the proxy's request headers
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let method = required_text(headers, "auth-method")?;
        let method = AuthMethod::parse(&method)
            .ok_or_else(|| GatewayError::BadRequest(format!("Unknown Auth-Method '{}'", method)))?;

        let protocol = required_text(headers, "auth-protocol")?;
        let protocol = MailProtocol::parse(&protocol).ok_or_else(|| {
            GatewayError::BadRequest(format!("Unknown Auth-Protocol '{}'", protocol))
        })?;

        let attempt = match headers.get("auth-login-attempt") {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
                .ok_or_else(|| {
                    GatewayError::BadRequest("Auth-Login-Attempt is not a number".to_string())
                })?,
            None => 1,
        };

        let client_ip = required_text(headers, "client-ip")?;
        let client_ip = percent_decode(client_ip.as_bytes())
            .decode_utf8_lossy()
            .into_owned();

        Ok(Self {
            method,
            protocol,
            user: headers.get("auth-user").map(|v| v.as_bytes().to_vec()),
            password: headers.get("auth-pass").map(|v| v.as_bytes().to_vec()),
            attempt,
            client_ip,
            client_host: required_text(headers, "client-host")?,
        })
    }
}

fn required_text(headers: &HeaderMap, name: &str) -> Result<String> {
    let value = headers
        .get(name)
        .ok_or_else(|| GatewayError::BadRequest(format!("Missing header {}", name)))?;
    String::from_utf8(value.as_bytes().to_vec())
        .map_err(|_| GatewayError::BadRequest(format!("Header {} is not valid UTF-8", name)))
}

/// Decode a credential header
///
/// The proxy percent-encodes only a few characters and otherwise passes the
/// client's bytes through a Latin-1 header. Percent-decoding gives back those
/// bytes, which are then read as the UTF-8 the client actually typed.
pub fn decode_credential(raw: &[u8]) -> Result<String> {
    let bytes: Vec<u8> = percent_decode(raw).collect();
    String::from_utf8(bytes)
        .map_err(|_| GatewayError::BadRequest("Credential is not valid UTF-8".to_string()))
}

/// Decision for one authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Hand the connection to this server
    Success { server: String, port: u16 },
    /// Refuse with the protocol's error token and a retry delay
    Failure {
        protocol: MailProtocol,
        retry_delay: String,
    },
    /// Attempt limit reached, no retry offered
    TooManyAttempts,
}

impl AuthOutcome {
    fn failure(protocol: MailProtocol, failure: &AuthFailure) -> Self {
        AuthOutcome::Failure {
            protocol,
            retry_delay: failure.retry_delay.clone(),
        }
    }
}

/// Wire error token each protocol expects in `Auth-Error-Code`
pub fn error_code(protocol: MailProtocol) -> &'static str {
    match protocol {
        MailProtocol::Imap => "AUTHENTICATIONFAILED",
        MailProtocol::Pop3 => "-ERR Authentication failed",
        MailProtocol::Smtp => "535 5.7.8",
    }
}

/// Inbound authentication adapter
pub struct InboundAuthAdapter {
    backend: Arc<dyn BackendCapability>,
    upstream: UpstreamTable,
}

impl InboundAuthAdapter {
    pub fn new(backend: Arc<dyn BackendCapability>, upstream: UpstreamTable) -> Self {
        Self { backend, upstream }
    }

    /// Decide one authentication request
    pub async fn authenticate(&self, request: &AuthRequest) -> Result<AuthOutcome> {
        if request.attempt > MAX_LOGIN_ATTEMPTS {
            warn!(
                "Refusing {} login attempt {} from {}",
                request.protocol, request.attempt, request.client_ip
            );
            return Ok(AuthOutcome::TooManyAttempts);
        }

        match (request.method, request.protocol) {
            (AuthMethod::None, MailProtocol::Smtp) => {
                debug!("Unauthenticated SMTP from {}", request.client_ip);
                self.route(request.protocol, false).await
            }
            (AuthMethod::Plain, _) => self.authenticate_plain(request).await,
            (method, protocol) => Err(GatewayError::BadRequest(format!(
                "Unsupported Auth-Method {:?} for {}",
                method, protocol
            ))),
        }
    }

    async fn authenticate_plain(&self, request: &AuthRequest) -> Result<AuthOutcome> {
        let (Some(user), Some(password)) = (&request.user, &request.password) else {
            return Err(GatewayError::BadRequest(
                "Missing Auth-User or Auth-Pass".to_string(),
            ));
        };
        let user = decode_credential(user)?;
        let password = decode_credential(password)?;
        let protocol = request.protocol;

        if password.chars().count() < MIN_PASSWORD_LENGTH {
            debug!("Password too short for {}", user);
            return Ok(AuthOutcome::failure(protocol, &AuthFailure::immediate("Password too short")));
        }

        let Some(address) = MailAddress::parse(&user) else {
            debug!("Login name '{}' is not an address", user);
            return Ok(AuthOutcome::failure(
                protocol,
                &AuthFailure::immediate("Missing '@' in address"),
            ));
        };

        let verdict = match protocol {
            MailProtocol::Imap | MailProtocol::Pop3 => {
                self.backend
                    .verify_postbox_access(address.as_str(), &password, &request.client_ip)
                    .await?
            }
            MailProtocol::Smtp => {
                self.backend
                    .verify_send_access(address.as_str(), &password, &request.client_ip)
                    .await?
            }
        };

        match verdict {
            Verdict::Granted(()) => {
                info!(
                    "Authenticated {} for {} from {} ({})",
                    address, protocol, request.client_ip, request.client_host
                );
                self.route(protocol, true).await
            }
            Verdict::Denied(failure) => {
                warn!(
                    "Authentication failed for {} ({}) from {}: {}",
                    address, protocol, request.client_ip, failure
                );
                Ok(AuthOutcome::failure(protocol, &failure))
            }
        }
    }

    async fn route(&self, protocol: MailProtocol, authenticated: bool) -> Result<AuthOutcome> {
        let upstream = self.upstream.resolve(protocol, authenticated).await?;
        Ok(AuthOutcome::Success {
            server: upstream.host,
            port: upstream.port,
        })
    }
}

fn header_value(value: &str, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(fallback))
}

impl IntoResponse for AuthOutcome {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: HeaderValue| {
            headers.insert(HeaderName::from_static(name), value);
        };

        match self {
            AuthOutcome::Success { server, port } => {
                set("auth-status", HeaderValue::from_static(STATUS_OK));
                set("auth-server", header_value(&server, ""));
                set("auth-port", HeaderValue::from(port));
            }
            AuthOutcome::Failure {
                protocol,
                retry_delay,
            } => {
                set("auth-status", HeaderValue::from_static(STATUS_INVALID));
                set("auth-error-code", HeaderValue::from_static(error_code(protocol)));
                set("auth-wait", header_value(&retry_delay, NO_DELAY));
            }
            AuthOutcome::TooManyAttempts => {
                set("auth-status", HeaderValue::from_static(STATUS_TOO_MANY));
            }
        }

        headers.into_response()
    }
}

/// GET /internal/auth
pub async fn auth_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<AuthOutcome> {
    let request = AuthRequest::from_headers(&headers)?;
    state.inbound.authenticate(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::UpstreamConfig;

    fn adapter(backend: Arc<MemoryBackend>) -> InboundAuthAdapter {
        let upstream = UpstreamTable::new(&UpstreamConfig {
            imap_address: "10.0.0.143".to_string(),
            pop3_address: "10.0.0.110".to_string(),
            smtp_address: "10.0.0.25".to_string(),
            authsmtp_address: "10.0.0.26".to_string(),
        });
        InboundAuthAdapter::new(backend, upstream)
    }

    fn backend() -> Arc<MemoryBackend> {
        Arc::new(
            MemoryBackend::new(["example.com"])
                .with_user("alice@example.com", "correct horse", None)
                .with_failure_delay("30"),
        )
    }

    fn request(method: AuthMethod, protocol: MailProtocol, user: &str, pass: &str) -> AuthRequest {
        AuthRequest {
            method,
            protocol,
            user: Some(user.as_bytes().to_vec()),
            password: Some(pass.as_bytes().to_vec()),
            attempt: 1,
            client_ip: "192.0.2.1".to_string(),
            client_host: "client.example.net".to_string(),
        }
    }

    #[test]
    fn test_decode_credential() {
        assert_eq!(decode_credential(b"alice%40example.com").unwrap(), "alice@example.com");
        assert_eq!(decode_credential(b"p%25ss%20word").unwrap(), "p%ss word");
        // Raw UTF-8 bytes as carried in a Latin-1 header
        assert_eq!(decode_credential("jürgen".as_bytes()).unwrap(), "jürgen");
        assert_eq!(decode_credential(b"j%C3%BCrgen").unwrap(), "jürgen");
        assert!(decode_credential(&[0x6a, 0xfc]).is_err());
    }

    #[test]
    fn test_parse_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("auth-method", HeaderValue::from_static("plain"));
        headers.insert("auth-protocol", HeaderValue::from_static("pop3"));
        headers.insert("auth-user", HeaderValue::from_static("alice@example.com"));
        headers.insert("auth-pass", HeaderValue::from_static("secret%20pw"));
        headers.insert("client-ip", HeaderValue::from_static("2001%3Adb8%3A%3A1"));
        headers.insert("client-host", HeaderValue::from_static("[UNAVAILABLE]"));

        let request = AuthRequest::from_headers(&headers).unwrap();
        assert_eq!(request.method, AuthMethod::Plain);
        assert_eq!(request.protocol, MailProtocol::Pop3);
        assert_eq!(request.attempt, 1);
        assert_eq!(request.client_ip, "2001:db8::1");
        assert_eq!(request.password.as_deref(), Some(&b"secret%20pw"[..]));

        headers.insert("auth-login-attempt", HeaderValue::from_static("many"));
        assert!(AuthRequest::from_headers(&headers).is_err());

        headers.remove("auth-login-attempt");
        headers.insert("auth-method", HeaderValue::from_static("gssapi"));
        assert!(AuthRequest::from_headers(&headers).is_err());
    }

    #[tokio::test]
    async fn test_plain_imap_success() {
        let backend = backend();
        let adapter = adapter(backend.clone());
        let outcome = adapter
            .authenticate(&request(
                AuthMethod::Plain,
                MailProtocol::Imap,
                "Alice%40Example.com",
                "correct horse",
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AuthOutcome::Success {
                server: "10.0.0.143".to_string(),
                port: 143
            }
        );
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_smtp_uses_submission_server() {
        let adapter = adapter(backend());
        let outcome = adapter
            .authenticate(&request(
                AuthMethod::Plain,
                MailProtocol::Smtp,
                "alice@example.com",
                "correct horse",
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Success {
                server: "10.0.0.26".to_string(),
                port: 10025
            }
        );
    }

    #[tokio::test]
    async fn test_backend_delay_forwarded() {
        let adapter = adapter(backend());
        let outcome = adapter
            .authenticate(&request(
                AuthMethod::Plain,
                MailProtocol::Imap,
                "alice@example.com",
                "wrong horse",
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Failure {
                protocol: MailProtocol::Imap,
                retry_delay: "30".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_attempt_limit_skips_backend() {
        let backend = backend();
        let adapter = adapter(backend.clone());
        for attempt in [11, 12, 100] {
            let mut req = request(
                AuthMethod::Plain,
                MailProtocol::Imap,
                "alice@example.com",
                "correct horse",
            );
            req.attempt = attempt;
            assert_eq!(adapter.authenticate(&req).await.unwrap(), AuthOutcome::TooManyAttempts);
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_short_password_and_bad_login_skip_backend() {
        let backend = backend();
        let adapter = adapter(backend.clone());

        for (user, pass) in [("alice@example.com", "1234567"), ("alice", "long enough pw")] {
            let outcome = adapter
                .authenticate(&request(AuthMethod::Plain, MailProtocol::Pop3, user, pass))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                AuthOutcome::Failure {
                    protocol: MailProtocol::Pop3,
                    retry_delay: "0".to_string()
                }
            );
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_smtp() {
        let backend = backend();
        let adapter = adapter(backend.clone());
        let mut req = request(AuthMethod::None, MailProtocol::Smtp, "", "");
        req.user = None;
        req.password = None;

        assert_eq!(
            adapter.authenticate(&req).await.unwrap(),
            AuthOutcome::Success {
                server: "10.0.0.25".to_string(),
                port: 25
            }
        );
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let adapter = adapter(backend());

        let none_imap = request(AuthMethod::None, MailProtocol::Imap, "", "");
        assert!(matches!(
            adapter.authenticate(&none_imap).await,
            Err(GatewayError::BadRequest(_))
        ));

        let apop = request(AuthMethod::Apop, MailProtocol::Pop3, "alice@example.com", "x");
        assert!(matches!(
            adapter.authenticate(&apop).await,
            Err(GatewayError::BadRequest(_))
        ));

        let mut missing = request(AuthMethod::Plain, MailProtocol::Imap, "alice@example.com", "");
        missing.password = None;
        assert!(matches!(
            adapter.authenticate(&missing).await,
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn test_failure_headers() {
        let response = AuthOutcome::Failure {
            protocol: MailProtocol::Smtp,
            retry_delay: "5".to_string(),
        }
        .into_response();
        let headers = response.headers();
        assert_eq!(headers["auth-status"], STATUS_INVALID);
        assert_eq!(headers["auth-error-code"], "535 5.7.8");
        assert_eq!(headers["auth-wait"], "5");
    }
}
