//! Mail addresses as seen by the backend

use std::fmt;

/// A lower-cased `local@domain` address
///
/// Construction is the only place an address is checked, so anything that
/// reaches the backend as a `MailAddress` has exactly one `@` with both
/// halves non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailAddress {
    address: String,
    at: usize,
}

impl MailAddress {
    /// Parse and normalize an address, `None` when it is not `local@domain`
    pub fn parse(raw: &str) -> Option<Self> {
        let address = raw.trim().to_lowercase();
        let at = address.find('@')?;

        if at == 0 || at + 1 == address.len() || address[at + 1..].contains('@') {
            return None;
        }

        Some(Self { address, at })
    }

    pub fn domain(&self) -> &str {
        &self.address[self.at + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
