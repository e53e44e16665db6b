//! Session client.
//!
//! Logs in once per process. The session is never refreshed: if the API
//! later rejects it, the run fails.

use std::fmt;

use sha2::{Digest, Sha512};
use tracing::info;

use crate::api::ManagementApi;
use crate::error::{Error, Result};

/// Account credentials for the management API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    account: String,
    password: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Hex SHA-512 of the password. This is what goes over the wire; the
    /// plaintext never leaves the process.
    pub fn password_digest(&self) -> String {
        format!("{:x}", Sha512::digest(self.password.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated API session.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    /// Wrap a session identifier returned by the API.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::auth("login response carried an empty session id"));
        }
        Ok(Self { token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("OAuth {}", self.token)
    }

    /// Short prefix of the token, safe for logs.
    pub fn fingerprint(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.token.len());
        &self.token[..end]
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({}...)", self.fingerprint())
    }
}

/// Log in with `credentials`. Failures are never retried.
pub fn login(api: &dyn ManagementApi, credentials: &Credentials) -> Result<Session> {
    let session = api.login(credentials)?;
    info!(
        account = credentials.account(),
        session = session.fingerprint(),
        "login succeeded"
    );
    Ok(session)
}
