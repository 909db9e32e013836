//! Cooldown state machine.
//!
//! Inactive -> Active -> Inactive, re-entrant. A record is treated as absent
//! once its expiry has passed; [`CooldownMachine::sweep`] deletes such records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::RiskError;
use crate::clock::Clock;
use crate::config::TierConfig;
use crate::domain::{Actor, CooldownRecord, Privilege};
use crate::storage::{StateStore, StorageError};

pub struct CooldownMachine {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl CooldownMachine {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns the user's cooldown if it is still running.
    pub async fn active(&self, user_id: &str) -> Result<Option<CooldownRecord>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .store
            .load_cooldown(user_id)
            .await?
            .filter(|record| record.is_active(now)))
    }

    /// Starts a cooldown with the tier's duration and caps.
    pub(crate) async fn activate(
        &self,
        user_id: &str,
        tier: &TierConfig,
        losses: Vec<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<CooldownRecord, StorageError> {
        let record = CooldownRecord {
            user_id: user_id.to_string(),
            activated_at: now,
            expires_at: now + tier.cooldown_duration(),
            reason: format!("{} consecutive high-risk losses", losses.len()),
            loss_count: losses.len() as u32,
            loss_amounts: losses,
            max_trades_per_day: tier.cooldown.max_trades_per_day,
            risk_percent: tier.cooldown.risk_percent,
        };

        self.store.save_cooldown(&record).await?;

        warn!(
            user = %user_id,
            expires_at = %record.expires_at,
            losses = ?record.loss_amounts,
            "Cooldown activated"
        );

        Ok(record)
    }

    /// Removes a user's cooldown ahead of expiry.
    pub async fn clear(&self, user_id: &str, actor: &Actor) -> Result<bool, RiskError> {
        if !actor.has(Privilege::Operator) {
            return Err(RiskError::InsufficientPrivilege {
                required: Privilege::Operator,
            });
        }

        let removed = self.store.delete_cooldown(user_id).await?;
        if removed {
            info!(user = %user_id, actor = %actor.id, "Cooldown overridden");
        }
        Ok(removed)
    }

    /// Users whose stored cooldown has expired.
    pub(crate) async fn expired_users(&self) -> Result<Vec<String>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_cooldowns()
            .await?
            .into_iter()
            .filter(|record| !record.is_active(now))
            .map(|record| record.user_id)
            .collect())
    }

    /// Deletes the user's record if it is still expired. Callers hold the
    /// user's session so a fresh activation cannot be lost.
    pub(crate) async fn remove_expired(&self, user_id: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        match self.store.load_cooldown(user_id).await? {
            Some(record) if !record.is_active(now) => {
                let removed = self.store.delete_cooldown(user_id).await?;
                if removed {
                    info!(user = %user_id, "Cooldown expired");
                }
                Ok(removed)
            }
            _ => Ok(false),
        }
    }
}
