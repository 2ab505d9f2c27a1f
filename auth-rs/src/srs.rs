//! Sender Rewriting Scheme
//!
//! Forwarded mail gets a return path under our own domain so the next hop's
//! SPF check passes, and bounces to that path are mapped back to the
//! original sender:
//!
//! ```text
//! alice@example.org  ->  SRS0=HHHH=TT=example.org=alice@forwarder.example
//! ```
//!
//! `HHHH` is a truncated HMAC-SHA256 over timestamp, domain and local part;
//! `TT` is the day number modulo 1024 in two base32 characters.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::SrsConfig;
use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const HASH_LENGTH: usize = 4;
const TIMESTAMP_SLOTS: u32 = 1024;
const SECONDS_PER_DAY: i64 = 86_400;

/// Why a rewritten address was refused
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SrsError {
    #[error("not a rewritten address")]
    NotSrs,
    #[error("malformed rewritten address")]
    Malformed,
    #[error("hash mismatch")]
    BadHash,
    #[error("timestamp expired")]
    Expired,
}

/// Forward/reverse address rewriter
#[derive(Clone)]
pub struct SenderRewriter {
    mac: HmacSha256,
    domain: String,
    max_age_days: u32,
}

impl SenderRewriter {
    pub fn new(secret: &str, domain: &str, max_age_days: u32) -> Result<Self> {
        if secret.is_empty() {
            return Err(GatewayError::Config("SRS secret key is empty".to_string()));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Config(format!("Invalid SRS secret key: {}", e)))?;

        Ok(Self {
            mac,
            domain: domain.to_lowercase(),
            max_age_days,
        })
    }

    pub fn from_config(config: &SrsConfig) -> Result<Self> {
        Self::new(&config.secret_key, &config.domain, config.max_age_days)
    }

    /// Whether the local part uses a rewritten-address prefix
    pub fn is_srs_address(address: &str) -> bool {
        let bytes = address.as_bytes();
        bytes.len() > 5
            && bytes[..3].eq_ignore_ascii_case(b"SRS")
            && matches!(bytes[3], b'0' | b'1')
            && matches!(bytes[4], b'=' | b'+' | b'-')
    }

    /// Rewrite `local_part@domain` into a return path under the rewriting
    /// domain. Both halves are embedded as given so reversal yields the
    /// sender verbatim; the hash is case-insensitive.
    pub fn forward(&self, local_part: &str, domain: &str) -> String {
        self.forward_on(local_part, domain, today())
    }

    fn forward_on(&self, local_part: &str, domain: &str, day: u32) -> String {
        let timestamp = encode_timestamp(day);
        let hash = self.hash(&timestamp, domain, local_part);
        format!(
            "SRS0={}={}={}={}@{}",
            hash, timestamp, domain, local_part, self.domain
        )
    }

    /// Recover the original sender from a rewritten address
    pub fn reverse(&self, address: &str) -> std::result::Result<String, SrsError> {
        self.reverse_on(address, today())
    }

    fn reverse_on(&self, address: &str, day: u32) -> std::result::Result<String, SrsError> {
        if !Self::is_srs_address(address) {
            return Err(SrsError::NotSrs);
        }
        if !address.as_bytes()[..4].eq_ignore_ascii_case(b"SRS0") {
            // SRS1 chains are only produced by other forwarders
            return Err(SrsError::Malformed);
        }

        let (local, _) = address.rsplit_once('@').ok_or(SrsError::Malformed)?;
        let mut parts = local[5..].splitn(4, '=');
        let (Some(hash), Some(timestamp), Some(domain), Some(user)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SrsError::Malformed);
        };
        if domain.is_empty() || user.is_empty() {
            return Err(SrsError::Malformed);
        }

        let stamped = decode_timestamp(timestamp).ok_or(SrsError::Malformed)?;
        let expected = self.hash(timestamp, domain, user);
        if !expected.eq_ignore_ascii_case(hash) {
            return Err(SrsError::BadHash);
        }

        let age = (day + TIMESTAMP_SLOTS - stamped) % TIMESTAMP_SLOTS;
        if age > self.max_age_days {
            return Err(SrsError::Expired);
        }

        Ok(format!("{}@{}", user, domain))
    }

    fn hash(&self, timestamp: &str, domain: &str, local: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_uppercase().as_bytes());
        mac.update(domain.to_lowercase().as_bytes());
        mac.update(local.to_lowercase().as_bytes());
        let digest = BASE64.encode(mac.finalize().into_bytes());
        digest[..HASH_LENGTH].to_string()
    }
}

fn today() -> u32 {
    let days = chrono::Utc::now().timestamp().div_euclid(SECONDS_PER_DAY);
    days.rem_euclid(TIMESTAMP_SLOTS as i64) as u32
}

fn encode_timestamp(day: u32) -> String {
    let day = day % TIMESTAMP_SLOTS;
    let high = BASE32[(day >> 5) as usize] as char;
    let low = BASE32[(day & 31) as usize] as char;
    format!("{}{}", high, low)
}

fn decode_timestamp(value: &str) -> Option<u32> {
    let bytes = value.as_bytes();
    if bytes.len() != 2 {
        return None;
    }
    let digit = |b: u8| {
        BASE32
            .iter()
            .position(|c| *c == b.to_ascii_uppercase())
            .map(|p| p as u32)
    };
    Some((digit(bytes[0])? << 5) | digit(bytes[1])?)
}
