//! auth-rs: Mail Authentication Gateway
//!
//! A protocol shim between three mail daemons and a single identity
//! provider. Each daemon speaks its own lookup protocol over HTTP; all of
//! them are answered from one [`backend::BackendCapability`].
//!
//! # Features
//!
//! - Mail proxy authentication (`Auth-*` headers) with downstream routing
//! - MTA table lookups: domains, mailboxes, aliases, relay, sender rewriting
//! - Delivery agent passdb/userdb, quota rules and a default filter script
//! - Pluggable backend: remote identity provider or in-memory accounts
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [backend]
//! kind = "http"
//! url = "https://id.example.com"
//! client_id = "mail"
//! client_secret = "change-me"
//!
//! [mail]
//! domains = ["example.com"]
//! allow_nets = "172.16.0.0/12"
//!
//! [upstream]
//! imap_address = "imap"
//! authsmtp_address = "smtp:10025"
//!
//! [srs]
//! secret_key = "change-me-too"
//! domain = "example.com"
//! ```
//!
//! Every key can also be set from the environment, e.g.
//! `AUTH_RS_BACKEND__URL` or `AUTH_RS_MAIL__DOMAINS=example.com,example.org`.

pub mod address;
pub mod backend;
pub mod config;
pub mod delivery;
pub mod error;
pub mod inbound;
pub mod server;
pub mod srs;
pub mod transport;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use server::GatewayServer;
