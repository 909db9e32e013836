//! Lookup of previously issued signals.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::Signal;

/// Where fire requests look up the signal they reference.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn get(&self, signal_id: &str) -> Option<Signal>;
}

/// In-memory signal book fed by whoever issues signals.
#[derive(Default)]
pub struct SignalBook {
    signals: RwLock<HashMap<String, Signal>>,
}

impl SignalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a signal.
    pub async fn publish(&self, signal: Signal) {
        self.signals.write().await.insert(signal.id.clone(), signal);
    }

    pub async fn remove(&self, signal_id: &str) -> bool {
        self.signals.write().await.remove(signal_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.signals.read().await.len()
    }

    /// Drops signals whose validity window has passed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut signals = self.signals.write().await;
        let before = signals.len();
        signals.retain(|_, s| !s.is_expired(now));
        before - signals.len()
    }
}

#[async_trait]
impl SignalSource for SignalBook {
    async fn get(&self, signal_id: &str) -> Option<Signal> {
        self.signals.read().await.get(signal_id).cloned()
    }
}
