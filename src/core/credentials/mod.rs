// src/core/credentials/mod.rs

//! Resolves a currently valid access token from the encrypted session store.
//!
//! Absence of a token is an expected state (logged-out users), so every
//! failure on this path is logged and reported as `None` rather than an error.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod cipher;
pub mod session;
pub mod store;

pub use cipher::{AesGcmDecryptor, Decryptor};
pub use session::{AccessToken, Session};
pub use store::{CookieJarStore, MemorySessionStore, SessionStore};

/// Reads, decrypts and validates the session on every call. Nothing is cached:
/// the store is the single source of truth and may be rewritten out-of-band.
pub struct CredentialProvider {
    store: Arc<dyn SessionStore>,
    decryptor: Arc<dyn Decryptor>,
    key: String,
}

impl CredentialProvider {
    pub fn new(
        store: Arc<dyn SessionStore>,
        decryptor: Arc<dyn Decryptor>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            decryptor,
            key: key.into(),
        }
    }

    /// Returns the current access token, or `None` if there is no valid one.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.access_token_at(Utc::now().timestamp_millis())
    }

    /// Same as [`access_token`](Self::access_token) against an explicit clock.
    pub fn access_token_at(&self, now_ms: i64) -> Option<AccessToken> {
        let session = self.load_session()?;
        let token = session.valid_access_token(now_ms);
        if token.is_none() {
            debug!(
                "Session under '{}' has no access token or it expired (exp={:?}).",
                self.key, session.access_exp
            );
        }
        token
    }

    /// Returns the decrypted session regardless of expiry.
    pub fn session(&self) -> Option<Session> {
        self.load_session()
    }

    fn load_session(&self) -> Option<Session> {
        let blob = match self.store.read(&self.key) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("No session stored under '{}'.", self.key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read session '{}': {}", self.key, e);
                return None;
            }
        };

        let plaintext = match self.decryptor.decrypt(&blob) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to decrypt session '{}': {}", self.key, e);
                return None;
            }
        };

        match serde_json::from_str::<Session>(&plaintext) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to parse session '{}': {}", self.key, e);
                None
            }
        }
    }
}
