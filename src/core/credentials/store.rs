// src/core/credentials/store.rs

//! Read-only access to the persisted session blob.

use crate::core::RealtimeError;
use dashmap::DashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A key-value store holding the encrypted session under a fixed key.
/// The realtime core only ever reads from it.
pub trait SessionStore: Send + Sync {
    /// Returns the raw value stored under `key`, or `None` if nothing is stored.
    fn read(&self, key: &str) -> Result<Option<String>, RealtimeError>;
}

/// Reads cookies from a file on disk. The file is re-read on every lookup so
/// that a refresh flow running elsewhere is picked up immediately.
///
/// Accepted layouts: a `Cookie` header line (`a=1; b=2`) or one pair per line.
/// Values are percent-decoded.
#[derive(Debug, Clone)]
pub struct CookieJarStore {
    path: PathBuf,
}

impl CookieJarStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for CookieJarStore {
    fn read(&self, key: &str) -> Result<Option<String>, RealtimeError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        lookup_cookie(&contents, key)
    }
}

/// Finds `key` in cookie text. Later duplicates do not override the first match.
pub(crate) fn lookup_cookie(contents: &str, key: &str) -> Result<Option<String>, RealtimeError> {
    for pair in contents.split([';', '\n']) {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if name.trim() != key {
            continue;
        }
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return Ok(None);
        }
        let decoded = urlencoding::decode(value)
            .map_err(|e| RealtimeError::Internal(format!("cookie '{key}' is not valid UTF-8: {e}")))?;
        return Ok(Some(decoded.into_owned()));
    }
    Ok(None)
}

/// An in-process store, used by embedders that manage the session themselves
/// (and by tests).
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

impl SessionStore for MemorySessionStore {
    fn read(&self, key: &str) -> Result<Option<String>, RealtimeError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }
}
