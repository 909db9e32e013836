//! In-memory implementation of StateStore.

use crate::domain::{CooldownRecord, HistoryEntry, RiskProfile, SystemEmergency, UserEmergency};
use crate::storage::{StateStore, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// MemoryStore keeps all state in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    profiles: RwLock<HashMap<String, RiskProfile>>,
    cooldowns: RwLock<HashMap<String, CooldownRecord>>,
    user_emergencies: RwLock<HashMap<String, UserEmergency>>,
    system: RwLock<Option<SystemEmergency>>,
    history: RwLock<Vec<HistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_user<T: Clone>(map: &HashMap<String, T>) -> Vec<T> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.into_iter().filter_map(|k| map.get(k).cloned()).collect()
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<RiskProfile>, StorageError> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn save_profile(&self, profile: &RiskProfile) -> Result<(), StorageError> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn load_cooldown(&self, user_id: &str) -> Result<Option<CooldownRecord>, StorageError> {
        Ok(self.cooldowns.read().await.get(user_id).cloned())
    }

    async fn save_cooldown(&self, record: &CooldownRecord) -> Result<(), StorageError> {
        let mut cooldowns = self.cooldowns.write().await;
        cooldowns.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_cooldown(&self, user_id: &str) -> Result<bool, StorageError> {
        Ok(self.cooldowns.write().await.remove(user_id).is_some())
    }

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, StorageError> {
        Ok(sorted_by_user(&*self.cooldowns.read().await))
    }

    async fn load_user_emergency(
        &self,
        user_id: &str,
    ) -> Result<Option<UserEmergency>, StorageError> {
        Ok(self.user_emergencies.read().await.get(user_id).cloned())
    }

    async fn save_user_emergency(&self, state: &UserEmergency) -> Result<(), StorageError> {
        let mut states = self.user_emergencies.write().await;
        states.insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn list_user_emergencies(&self) -> Result<Vec<UserEmergency>, StorageError> {
        Ok(sorted_by_user(&*self.user_emergencies.read().await))
    }

    async fn load_system_emergency(&self) -> Result<Option<SystemEmergency>, StorageError> {
        Ok(self.system.read().await.clone())
    }

    async fn save_system_emergency(&self, state: &SystemEmergency) -> Result<(), StorageError> {
        *self.system.write().await = Some(state.clone());
        Ok(())
    }

    async fn append_system_history(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.history.write().await.push(entry.clone());
        Ok(())
    }

    async fn system_history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self.history.read().await.clone())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
