//! Access key material used by the signer.

use crate::error::{Error, Result};
use std::fmt;

/// Access key id, secret key and optional session token.
///
/// `Debug` output never contains the secret or the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Create credentials, rejecting empty key material.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let access_key = access_key.into();
        let secret_key = secret_key.into();

        if access_key.trim().is_empty() {
            return Err(Error::InvalidCredentials("access key is empty".to_string()));
        }
        if secret_key.is_empty() {
            return Err(Error::InvalidCredentials("secret key is empty".to_string()));
        }

        Ok(Self {
            access_key,
            secret_key,
            session_token: None,
        })
    }

    /// Attach a temporary session token. Empty tokens are ignored.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.session_token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub(crate) fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
