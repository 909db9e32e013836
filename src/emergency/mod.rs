//! Emergency stop controller.
//!
//! Two independent scopes: one system-wide stop and one stop per user, each
//! with escalating levels. The system scope takes precedence whenever a
//! trading surface asks whether it may act.

mod error;
mod system;
mod user;

pub use error::EmergencyError;
pub use system::{SystemSnapshot, SystemStatus, SystemStop};
pub use user::{StopPrompt, StopRequest, UserStopStatus, UserStops};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::backend::ExecutionBackend;
use crate::clock::Clock;
use crate::config::EmergencyConfig;
use crate::confirm::{ConfirmationToken, PendingBook};
use crate::domain::{
    Actor, ClosureOutcome, CloseStatus, PositionClosure, Privilege, RejectCode, Rejection,
    Surface, SystemEmergency, SystemLevel, TriggerKind, UserEmergency, UserLevel,
};
use crate::storage::{StateStore, StorageError};

/// Pending-book subject of the system scope.
const SYSTEM_SUBJECT: &str = "__system__";

/// Scope of an emergency operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    System,
    User(String),
}

/// A requested system stop waiting for its confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStopRequest {
    pub level: SystemLevel,
    pub reason: String,
    pub requested_by: Actor,
}

/// Preview returned with a system stop token.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStopPrompt {
    pub token: ConfirmationToken,
    pub level: SystemLevel,
    pub reason: String,
    pub positions_to_close: Option<usize>,
    pub expires_at: DateTime<Utc>,
}

/// What a maintenance sweep recovered or discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmergencySweep {
    pub system_recovered: Option<SystemEmergency>,
    pub users_recovered: Vec<UserEmergency>,
    pub confirmations_lapsed: usize,
}

/// Instructs positions to close and records every attempt.
///
/// Closing is idempotent at the backend, so re-running this after an
/// escalation only reports already closed positions.
pub(crate) async fn close_positions(
    backend: &dyn ExecutionBackend,
    user_id: Option<&str>,
) -> (Vec<PositionClosure>, Option<String>) {
    let positions = match backend.open_positions(user_id).await {
        Ok(positions) => positions,
        Err(e) => {
            error!(user = ?user_id, error = %e, "Failed to list open positions for closing");
            return (Vec::new(), Some(e.to_string()));
        }
    };

    let outcomes = join_all(positions.iter().map(|p| backend.close_position(p))).await;

    let closures: Vec<PositionClosure> = positions
        .into_iter()
        .zip(outcomes)
        .map(|(position, outcome)| {
            let outcome = match outcome {
                Ok(CloseStatus::Closed) => ClosureOutcome::Closed,
                Ok(CloseStatus::AlreadyClosed) => ClosureOutcome::AlreadyClosed,
                Err(e) => {
                    error!(
                        position = %position.id,
                        user = %position.user_id,
                        error = %e,
                        "Failed to close position"
                    );
                    ClosureOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            PositionClosure {
                position_id: position.id,
                user_id: position.user_id,
                symbol: position.symbol,
                outcome,
            }
        })
        .collect();

    let failed = closures.iter().filter(|c| c.failed()).count();
    if failed > 0 {
        warn!(total = closures.len(), failed, "Some positions could not be closed");
    } else {
        info!(total = closures.len(), "Positions closed");
    }

    (closures, None)
}

/// Both emergency scopes behind one interface.
pub struct EmergencyController {
    system: SystemStop,
    users: UserStops,
    system_pending: PendingBook<SystemStopRequest>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn ExecutionBackend>,
}

impl EmergencyController {
    pub async fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: EmergencyConfig,
        backend: Arc<dyn ExecutionBackend>,
        confirmation_ttl: std::time::Duration,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            system: SystemStop::load(store.clone(), clock.clone(), config.clone(), backend.clone())
                .await?,
            users: UserStops::new(store, clock.clone(), config, backend.clone(), confirmation_ttl),
            system_pending: PendingBook::new(confirmation_ttl),
            clock,
            backend,
        })
    }

    pub fn system(&self) -> &SystemStop {
        &self.system
    }

    pub fn users(&self) -> &UserStops {
        &self.users
    }

    /// Returns a rejection if either scope blocks `surface` for the user.
    /// The system scope is consulted first.
    pub async fn check(
        &self,
        user_id: &str,
        surface: Surface,
    ) -> Result<Option<Rejection>, StorageError> {
        if let Some(stop) = self.system.blocking() {
            return Ok(Some(Rejection::new(
                RejectCode::SystemEmergencyStop,
                format!("{}: {}", stop.level, stop.reason),
            )));
        }

        if let Some(stop) = self.users.blocking(user_id, surface).await? {
            return Ok(Some(Rejection::new(
                RejectCode::UserEmergencyStop,
                format!("{}: {}", stop.level, stop.reason),
            )));
        }

        Ok(None)
    }

    /// Opens a system stop request. Requires operator privilege.
    pub async fn request_system_stop(
        &self,
        actor: &Actor,
        level: SystemLevel,
        reason: &str,
    ) -> Result<SystemStopPrompt, EmergencyError> {
        if !actor.has(Privilege::Operator) {
            return Err(EmergencyError::InsufficientPrivilege {
                required: Privilege::Operator,
            });
        }
        if let Some(active) = self.system.blocking() {
            if level <= active.level {
                return Err(EmergencyError::NotStricter {
                    active: active.level.to_string(),
                    requested: level.to_string(),
                });
            }
        }

        let positions_to_close = if level.closes_positions() {
            self.backend.open_positions(None).await.ok().map(|p| p.len())
        } else {
            Some(0)
        };

        let pending = self
            .system_pending
            .open(
                SYSTEM_SUBJECT,
                SystemStopRequest {
                    level,
                    reason: reason.to_string(),
                    requested_by: actor.clone(),
                },
                self.clock.now(),
            )
            .await;

        info!(level = %level, actor = %actor.id, "System emergency stop requested");

        Ok(SystemStopPrompt {
            token: pending.token,
            level,
            reason: reason.to_string(),
            positions_to_close,
            expires_at: pending.expires_at,
        })
    }

    /// Applies a confirmed system stop request as a manual trigger.
    pub async fn confirm_system_stop(
        &self,
        actor: &Actor,
        token: &ConfirmationToken,
    ) -> Result<SystemEmergency, EmergencyError> {
        // checked before consuming so an unprivileged confirm cannot discard
        // the pending request
        if !actor.has(Privilege::Operator) {
            return Err(EmergencyError::InsufficientPrivilege {
                required: Privilege::Operator,
            });
        }

        let request = self
            .system_pending
            .consume(SYSTEM_SUBJECT, token, self.clock.now())
            .await?
            .payload;

        self.system
            .trigger(TriggerKind::Manual, request.level, actor, &request.reason)
            .await
    }

    pub async fn request_user_stop(
        &self,
        user_id: &str,
        level: UserLevel,
        reason: &str,
    ) -> Result<StopPrompt, EmergencyError> {
        self.users.request_stop(user_id, level, reason).await
    }

    pub async fn confirm_user_stop(
        &self,
        user_id: &str,
        token: &ConfirmationToken,
    ) -> Result<UserEmergency, EmergencyError> {
        self.users.confirm_stop(user_id, token).await
    }

    /// Discards whichever pending request the token belongs to.
    pub async fn cancel(&self, token: &ConfirmationToken) -> Result<Scope, EmergencyError> {
        if self.system_pending.find_subject(token).await.is_some() {
            self.system_pending.cancel(SYSTEM_SUBJECT).await;
            info!("System emergency stop request cancelled");
            return Ok(Scope::System);
        }

        if let Some(user_id) = self.users.pending().find_subject(token).await {
            self.users.cancel_stop(&user_id).await;
            return Ok(Scope::User(user_id));
        }

        Err(crate::confirm::ConfirmError::NotFound.into())
    }

    /// Auto-recovers lapsed stops in both scopes and drops lapsed requests.
    pub async fn sweep(&self) -> Result<EmergencySweep, EmergencyError> {
        let now = self.clock.now();
        Ok(EmergencySweep {
            system_recovered: self.system.auto_recover_lapsed().await?,
            users_recovered: self.users.auto_recover_lapsed().await?,
            confirmations_lapsed: self.system_pending.purge_expired(now).await
                + self.users.pending().purge_expired(now).await,
        })
    }
}

#[cfg(test)]
mod tests;
