//! In-memory backend
//!
//! Serves accounts and aliases seeded from configuration. Used for local
//! development and as the backend double in tests, where
//! [`MemoryBackend::calls`] shows whether a request ever reached it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{AuthFailure, BackendCapability, Verdict};
use crate::address::MailAddress;
use crate::config::{AccountSeed, GatewayConfig};
use crate::error::{GatewayError, Result};

/// Memory backend implementation
pub struct MemoryBackend {
    domains: HashSet<String>,
    accounts: HashMap<String, AccountSeed>,
    redirects: HashMap<String, Vec<String>>,
    failure_delay: String,
    calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().to_lowercase())
                .collect(),
            accounts: HashMap::new(),
            redirects: HashMap::new(),
            failure_delay: super::NO_DELAY.to_string(),
            calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Build from the `[backend]` seeds of the gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut backend = Self::new(config.domain_set());
        for account in &config.backend.accounts {
            backend = backend.with_account(account.clone());
        }
        for (alias, targets) in &config.backend.redirects {
            backend = backend.with_redirect(alias, targets.iter().map(String::as_str));
        }
        backend
    }

    pub fn with_account(mut self, mut account: AccountSeed) -> Self {
        account.email = account.email.to_lowercase();
        self.accounts.insert(account.email.clone(), account);
        self
    }

    /// Convenience for a full-permission account
    pub fn with_user(self, email: &str, password: &str, quota: Option<u64>) -> Self {
        self.with_account(AccountSeed {
            email: email.to_string(),
            password: password.to_string(),
            quota,
            mailbox: true,
            can_read: true,
            can_send: true,
        })
    }

    pub fn with_redirect<'a>(
        mut self,
        alias: &str,
        targets: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        self.redirects.insert(
            alias.to_lowercase(),
            targets.into_iter().map(str::to_string).collect(),
        );
        self
    }

    /// Retry delay attached to rejected credentials
    pub fn with_failure_delay(mut self, delay: &str) -> Self {
        self.failure_delay = delay.to_string();
        self
    }

    /// Simulate an unreachable identity provider
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of backend operations served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self, operation: &str, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("MemoryBackend: {} {}", operation, key);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::BackendUnavailable(
                "memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_credentials(
        &self,
        email: &str,
        password: &str,
        permitted: impl Fn(&AccountSeed) -> bool,
    ) -> Verdict<()> {
        let Some(address) = MailAddress::parse(email) else {
            return Verdict::Denied(AuthFailure::immediate("Missing '@' in address"));
        };
        if !self.has_domain(address.domain()) {
            return Verdict::Denied(AuthFailure::immediate("Invalid domain"));
        }

        match self.accounts.get(address.as_str()) {
            Some(account) if account.password == password && permitted(account) => {
                Verdict::Granted(())
            }
            _ => Verdict::Denied(AuthFailure::new(
                "Invalid credentials",
                self.failure_delay.clone(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl BackendCapability for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn mail_domains(&self) -> &HashSet<String> {
        &self.domains
    }

    async fn get_quota(&self, email: &str) -> Result<Verdict<Option<u64>>> {
        self.enter("get_quota", email)?;
        Ok(match self.accounts.get(&email.to_lowercase()) {
            Some(account) => Verdict::Granted(account.quota.filter(|q| *q > 0)),
            None => Verdict::Denied(AuthFailure::immediate("User invalid")),
        })
    }

    async fn has_mailbox(&self, email: &str) -> Result<bool> {
        self.enter("has_mailbox", email)?;
        Ok(self
            .accounts
            .get(&email.to_lowercase())
            .is_some_and(|account| account.mailbox))
    }

    async fn email_redirect(&self, alias: &str) -> Result<Verdict<Vec<String>>> {
        self.enter("email_redirect", alias)?;
        Ok(match self.redirects.get(&alias.to_lowercase()) {
            Some(targets) => Verdict::Granted(targets.clone()),
            None => Verdict::Denied(AuthFailure::immediate("User invalid")),
        })
    }

    async fn verify_postbox_access(
        &self,
        email: &str,
        password: &str,
        _client_ip: &str,
    ) -> Result<Verdict<()>> {
        self.enter("verify_postbox_access", email)?;
        Ok(self.check_credentials(email, password, |account| account.can_read))
    }

    async fn verify_send_access(
        &self,
        email: &str,
        password: &str,
        _client_ip: &str,
    ) -> Result<Verdict<()>> {
        self.enter("verify_send_access", email)?;
        Ok(self.check_credentials(email, password, |account| account.can_send))
    }
}
