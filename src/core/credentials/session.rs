// src/core/credentials/session.rs

//! The decrypted session payload and the access token extracted from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The JSON document stored (encrypted) in the session cookie.
///
/// Every field is optional on the wire; validity is decided by
/// [`Session::valid_access_token`], not by deserialization.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token expiry, epoch milliseconds.
    #[serde(default)]
    pub access_exp: Option<i64>,
    /// Refresh token expiry, epoch milliseconds.
    #[serde(default)]
    pub refresh_exp: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Session {
    /// Returns the access token if it is present and `access_exp` is strictly
    /// after `now_ms`.
    pub fn valid_access_token(&self, now_ms: i64) -> Option<AccessToken> {
        let token = self.access_token.as_deref().filter(|t| !t.is_empty())?;
        let exp = self.access_exp?;
        if exp <= now_ms {
            return None;
        }
        Some(AccessToken {
            value: token.to_string(),
            expires_at_ms: exp,
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("access_exp", &self.access_exp)
            .field("refresh_exp", &self.refresh_exp)
            .field("role", &self.role)
            .finish()
    }
}

/// A currently valid bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at_ms: i64,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at_ms: i64) -> Self {
        Self {
            value: value.into(),
            expires_at_ms,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }

    /// The value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}
