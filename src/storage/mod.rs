//! Storage interfaces and implementations for persisting risk and emergency state.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

use crate::domain::{CooldownRecord, HistoryEntry, RiskProfile, SystemEmergency, UserEmergency};
use async_trait::async_trait;

/// StateStore defines the interface for durable controller state.
///
/// Every write replaces exactly one record, so a crash leaves each record
/// either at its previous or at its new value.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Option<RiskProfile>, StorageError>;

    async fn save_profile(&self, profile: &RiskProfile) -> Result<(), StorageError>;

    async fn load_cooldown(&self, user_id: &str) -> Result<Option<CooldownRecord>, StorageError>;

    async fn save_cooldown(&self, record: &CooldownRecord) -> Result<(), StorageError>;

    /// Removes a user's cooldown. Returns true if one existed.
    async fn delete_cooldown(&self, user_id: &str) -> Result<bool, StorageError>;

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, StorageError>;

    async fn load_user_emergency(
        &self,
        user_id: &str,
    ) -> Result<Option<UserEmergency>, StorageError>;

    async fn save_user_emergency(&self, state: &UserEmergency) -> Result<(), StorageError>;

    async fn list_user_emergencies(&self) -> Result<Vec<UserEmergency>, StorageError>;

    async fn load_system_emergency(&self) -> Result<Option<SystemEmergency>, StorageError>;

    async fn save_system_emergency(&self, state: &SystemEmergency) -> Result<(), StorageError>;

    /// Appends to the system stop history. Entries are never rewritten.
    async fn append_system_history(&self, entry: &HistoryEntry) -> Result<(), StorageError>;

    /// Returns the system stop history, oldest first.
    async fn system_history(&self) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Close closes the storage connection.
    async fn close(&self) -> Result<(), StorageError>;
}

/// StorageError represents errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests;
