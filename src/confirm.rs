//! Short-lived confirmation tokens for two-phase operations.
//!
//! A [`PendingBook`] holds at most one pending request per subject (a user id,
//! or the system scope). Opening a new request replaces the previous one.
//! Expiry is evaluated on read; [`PendingBook::purge_expired`] only reclaims
//! memory.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::duration::to_chrono;

/// Opaque token the caller must echo back to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    /// Generates a fresh token bound to a subject.
    ///
    /// The token is the first 16 bytes of sha256(subject | timestamp | nonce),
    /// hex encoded.
    fn generate(subject: &str, now: DateTime<Utc>) -> Self {
        let data = format!("{}|{}|{}", subject, now.to_rfc3339(), Uuid::new_v4());

        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        let hash = hasher.finalize();

        Self(hex::encode(&hash[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConfirmationToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConfirmationToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request waiting for its confirm.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    pub token: ConfirmationToken,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> Pending<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// ConfirmError is a user error in the confirmation workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmError {
    #[error("no pending request to confirm")]
    NotFound,

    #[error("confirmation expired, request again")]
    Expired,

    #[error("confirmation token does not match")]
    TokenMismatch,
}

/// Pending two-phase requests keyed by subject.
pub struct PendingBook<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Pending<T>>>,
}

impl<T: Clone + Send> PendingBook<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Opens a request for `subject`, replacing any earlier one.
    pub async fn open(&self, subject: &str, payload: T, now: DateTime<Utc>) -> Pending<T> {
        let pending = Pending {
            token: ConfirmationToken::generate(subject, now),
            payload,
            created_at: now,
            expires_at: now + to_chrono(self.ttl),
        };

        let mut entries = self.entries.lock().await;
        entries.insert(subject.to_string(), pending.clone());
        pending
    }

    /// Consumes the request for `subject` if `token` matches and it has not
    /// expired. Expired or mismatched requests are discarded either way.
    pub async fn consume(
        &self,
        subject: &str,
        token: &ConfirmationToken,
        now: DateTime<Utc>,
    ) -> Result<Pending<T>, ConfirmError> {
        let mut entries = self.entries.lock().await;
        let pending = entries.remove(subject).ok_or(ConfirmError::NotFound)?;

        if pending.is_expired(now) {
            return Err(ConfirmError::Expired);
        }
        if &pending.token != token {
            return Err(ConfirmError::TokenMismatch);
        }

        Ok(pending)
    }

    /// Discards the request for `subject`. Returns true if one was pending.
    pub async fn cancel(&self, subject: &str) -> bool {
        self.entries.lock().await.remove(subject).is_some()
    }

    /// Returns the live request for `subject`, if any.
    pub async fn peek(&self, subject: &str, now: DateTime<Utc>) -> Option<Pending<T>> {
        let entries = self.entries.lock().await;
        entries
            .get(subject)
            .filter(|p| !p.is_expired(now))
            .cloned()
    }

    /// Finds the subject a token was issued for.
    pub async fn find_subject(&self, token: &ConfirmationToken) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|(_, p)| &p.token == token)
            .map(|(subject, _)| subject.clone())
    }

    /// Drops every expired request. Returns how many were dropped.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, p| !p.is_expired(now));
        before - entries.len()
    }
}
