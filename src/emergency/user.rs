//! Per-user emergency stops with confirm-before-execute.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{EmergencyError, close_positions};
use crate::backend::ExecutionBackend;
use crate::clock::Clock;
use crate::config::EmergencyConfig;
use crate::config::duration::to_chrono;
use crate::confirm::{ConfirmationToken, PendingBook};
use crate::domain::{Actor, Privilege, Surface, UserEmergency, UserLevel};
use crate::storage::{StateStore, StorageError};

/// A requested stop waiting for its confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    pub level: UserLevel,
    pub reason: String,
}

/// What a confirm would do, returned with the token.
#[derive(Debug, Clone, PartialEq)]
pub struct StopPrompt {
    pub token: ConfirmationToken,
    pub level: UserLevel,
    pub reason: String,
    /// Open positions the stop would close, if it closes any and the
    /// backend could list them.
    pub positions_to_close: Option<usize>,
    pub blocks_manual: bool,
    pub auto_recover_after: Option<chrono::Duration>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a user stop status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStopStatus {
    pub user_id: String,
    pub blocking: bool,
    pub state: Option<UserEmergency>,
    pub pending_level: Option<UserLevel>,
}

pub struct UserStops {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: EmergencyConfig,
    backend: Arc<dyn ExecutionBackend>,
    pending: PendingBook<StopRequest>,
    writer: Mutex<()>,
}

impl UserStops {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: EmergencyConfig,
        backend: Arc<dyn ExecutionBackend>,
        confirmation_ttl: std::time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            backend,
            pending: PendingBook::new(confirmation_ttl),
            writer: Mutex::new(()),
        }
    }

    pub(super) fn pending(&self) -> &PendingBook<StopRequest> {
        &self.pending
    }

    async fn active(&self, user_id: &str) -> Result<Option<UserEmergency>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .store
            .load_user_emergency(user_id)
            .await?
            .filter(|s| s.is_blocking(now)))
    }

    /// Opens a stop request and previews its impact. Nothing about trading
    /// changes until the request is confirmed.
    pub async fn request_stop(
        &self,
        user_id: &str,
        level: UserLevel,
        reason: &str,
    ) -> Result<StopPrompt, EmergencyError> {
        if let Some(active) = self.active(user_id).await? {
            if level <= active.level {
                return Err(EmergencyError::NotStricter {
                    active: active.level.to_string(),
                    requested: level.to_string(),
                });
            }
        }

        let positions_to_close = if level.closes_positions() {
            match self.backend.open_positions(Some(user_id)).await {
                Ok(positions) => Some(positions.len()),
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Could not list positions for stop preview");
                    None
                }
            }
        } else {
            Some(0)
        };

        let now = self.clock.now();
        let pending = self
            .pending
            .open(
                user_id,
                StopRequest {
                    level,
                    reason: reason.to_string(),
                },
                now,
            )
            .await;

        info!(user = %user_id, level = %level, "User emergency stop requested");

        Ok(StopPrompt {
            token: pending.token,
            level,
            reason: reason.to_string(),
            positions_to_close,
            blocks_manual: level.blocks_manual(),
            auto_recover_after: self.config.user_recovery(level).map(to_chrono),
            expires_at: pending.expires_at,
        })
    }

    /// Applies a confirmed stop request.
    ///
    /// The stop is installed before positions are closed, so no new trade
    /// can slip in while closing.
    pub async fn confirm_stop(
        &self,
        user_id: &str,
        token: &ConfirmationToken,
    ) -> Result<UserEmergency, EmergencyError> {
        let now = self.clock.now();
        let request = self.pending.consume(user_id, token, now).await?.payload;

        let _writer = self.writer.lock().await;
        if let Some(active) = self.active(user_id).await? {
            if request.level <= active.level {
                return Err(EmergencyError::NotStricter {
                    active: active.level.to_string(),
                    requested: request.level.to_string(),
                });
            }
        }

        let mut state = UserEmergency {
            user_id: user_id.to_string(),
            active: true,
            level: request.level,
            reason: request.reason,
            activated_at: now,
            auto_recover_at: self
                .config
                .user_recovery(request.level)
                .map(|d| now + to_chrono(d)),
            closures: Vec::new(),
            closure_error: None,
            recovered_at: None,
        };
        self.store.save_user_emergency(&state).await?;

        warn!(
            user = %user_id,
            level = %state.level,
            reason = %state.reason,
            "User emergency stop activated"
        );

        if state.level.closes_positions() {
            let (closures, closure_error) =
                close_positions(self.backend.as_ref(), Some(user_id)).await;
            state.closures = closures;
            state.closure_error = closure_error;
            self.store.save_user_emergency(&state).await?;
        }

        Ok(state)
    }

    /// Discards a pending request. Returns true if one existed.
    pub async fn cancel_stop(&self, user_id: &str) -> bool {
        let cancelled = self.pending.cancel(user_id).await;
        if cancelled {
            info!(user = %user_id, "User emergency stop request cancelled");
        }
        cancelled
    }

    /// Lifts the user's stop.
    ///
    /// Succeeds once auto-recovery is due, or earlier when forced. Forcing an
    /// account lock requires admin; lower levels may be forced by the user
    /// or by an operator.
    pub async fn recover(
        &self,
        user_id: &str,
        actor: &Actor,
        force: bool,
    ) -> Result<UserEmergency, EmergencyError> {
        if actor.privilege == Privilege::User && actor.id != user_id {
            return Err(EmergencyError::InsufficientPrivilege {
                required: Privilege::Operator,
            });
        }

        let _writer = self.writer.lock().await;
        let now = self.clock.now();

        let mut state = self
            .store
            .load_user_emergency(user_id)
            .await?
            .filter(|s| s.active)
            .ok_or(EmergencyError::NotActive)?;

        if !state.auto_recovery_due(now) {
            if force {
                let required = if state.level == UserLevel::AccountLock {
                    Privilege::Admin
                } else {
                    Privilege::User
                };
                if !actor.has(required) {
                    return Err(EmergencyError::InsufficientPrivilege { required });
                }
            } else {
                return Err(match state.auto_recover_at {
                    Some(at) => EmergencyError::RecoveryNotDue {
                        remaining: at - now,
                    },
                    None => EmergencyError::ManualRecoveryRequired,
                });
            }
        }

        state.active = false;
        state.recovered_at = Some(now);
        self.store.save_user_emergency(&state).await?;

        info!(
            user = %user_id,
            level = %state.level,
            actor = %actor.id,
            forced = force,
            "User emergency stop recovered"
        );

        Ok(state)
    }

    /// Reports the user's stop without changing anything.
    pub async fn status(&self, user_id: &str) -> Result<UserStopStatus, StorageError> {
        let now = self.clock.now();
        let state = self.store.load_user_emergency(user_id).await?;
        let pending_level = self
            .pending
            .peek(user_id, now)
            .await
            .map(|p| p.payload.level);

        Ok(UserStopStatus {
            user_id: user_id.to_string(),
            blocking: state.as_ref().is_some_and(|s| s.is_blocking(now)),
            state,
            pending_level,
        })
    }

    /// Returns the user's stop if it blocks the given surface right now.
    /// Every level blocks signal fires; only an account lock blocks manual
    /// trading.
    pub async fn blocking(
        &self,
        user_id: &str,
        surface: Surface,
    ) -> Result<Option<UserEmergency>, StorageError> {
        Ok(self.active(user_id).await?.filter(|s| match surface {
            Surface::Signal => true,
            Surface::Manual => s.level.blocks_manual(),
        }))
    }

    /// Formally recovers every stop whose auto-recovery time has passed.
    pub async fn auto_recover_lapsed(&self) -> Result<Vec<UserEmergency>, EmergencyError> {
        let now = self.clock.now();
        let mut recovered = Vec::new();

        for state in self.store.list_user_emergencies().await? {
            if !(state.active && state.auto_recovery_due(now)) {
                continue;
            }
            match self.recover(&state.user_id, &Actor::system(), false).await {
                Ok(state) => recovered.push(state),
                Err(EmergencyError::NotActive) | Err(EmergencyError::RecoveryNotDue { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }
}
