//! System-wide emergency stop.
//!
//! The current stop lives in a `watch` cell with a version counter: a single
//! writer (serialized by `writer`) and any number of lock-free readers. The
//! gateway reads it before admission and again right before dispatch.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use super::{EmergencyError, close_positions};
use crate::backend::ExecutionBackend;
use crate::clock::Clock;
use crate::config::EmergencyConfig;
use crate::config::duration::to_chrono;
use crate::domain::{
    Actor, HistoryAction, HistoryEntry, Privilege, SystemEmergency, SystemLevel, TriggerKind,
};
use crate::storage::{StateStore, StorageError};

/// Versioned view of the system stop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    /// Bumped on every write.
    pub version: u64,
    pub state: Option<SystemEmergency>,
}

/// Result of a system status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    /// True while new trades are refused.
    pub blocking: bool,
    pub state: Option<SystemEmergency>,
    /// Minutes until automatic recovery, if scheduled and not yet due.
    pub recovers_in_minutes: Option<i64>,
}

pub struct SystemStop {
    cell: watch::Sender<SystemSnapshot>,
    writer: Mutex<()>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: EmergencyConfig,
    backend: Arc<dyn ExecutionBackend>,
}

impl SystemStop {
    /// Restores the last persisted stop.
    pub async fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: EmergencyConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, StorageError> {
        let state = store.load_system_emergency().await?;
        if let Some(ref s) = state {
            if s.active {
                warn!(level = %s.level, reason = %s.reason, "System emergency stop restored");
            }
        }

        let (cell, _) = watch::channel(SystemSnapshot { version: 0, state });

        Ok(Self {
            cell,
            writer: Mutex::new(()),
            store,
            clock,
            config,
            backend,
        })
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        self.cell.borrow().clone()
    }

    /// Receiver notified on every change of the stop.
    pub fn subscribe(&self) -> watch::Receiver<SystemSnapshot> {
        self.cell.subscribe()
    }

    /// Returns the stop if it blocks trading right now.
    pub fn blocking(&self) -> Option<SystemEmergency> {
        let now = self.clock.now();
        self.cell
            .borrow()
            .state
            .as_ref()
            .filter(|s| s.is_blocking(now))
            .cloned()
    }

    /// Reports the stop without changing anything.
    pub fn status(&self) -> SystemStatus {
        let now = self.clock.now();
        let state = self.cell.borrow().state.clone();
        let blocking = state.as_ref().is_some_and(|s| s.is_blocking(now));
        let recovers_in_minutes = state
            .as_ref()
            .filter(|_| blocking)
            .and_then(|s| s.auto_recover_at)
            .map(|at| (at - now).num_minutes());

        SystemStatus {
            blocking,
            state,
            recovers_in_minutes,
        }
    }

    pub async fn history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        self.store.system_history().await
    }

    fn publish(&self, state: SystemEmergency) {
        self.cell.send_modify(|snapshot| {
            snapshot.version += 1;
            snapshot.state = Some(state);
        });
    }

    /// Installs a stop, or escalates the active one to a stricter level.
    ///
    /// The stop blocks trading before any position is touched. Hard and
    /// panic levels then close every open position and record each attempt.
    pub async fn trigger(
        &self,
        kind: TriggerKind,
        level: SystemLevel,
        actor: &Actor,
        reason: &str,
    ) -> Result<SystemEmergency, EmergencyError> {
        let required = match kind {
            TriggerKind::AdminOverride => Privilege::Admin,
            TriggerKind::Manual | TriggerKind::AutomatedPanic => Privilege::Operator,
        };
        if !actor.has(required) {
            return Err(EmergencyError::InsufficientPrivilege { required });
        }

        let _writer = self.writer.lock().await;
        let now = self.clock.now();
        let current = self.cell.borrow().state.clone();

        let escalating = match current.as_ref().filter(|s| s.is_blocking(now)) {
            Some(active) if level <= active.level => {
                return Err(EmergencyError::NotStricter {
                    active: active.level.to_string(),
                    requested: level.to_string(),
                });
            }
            Some(_) => true,
            None => false,
        };

        let mut state = SystemEmergency {
            event_id: current.as_ref().map_or(0, |s| s.event_id) + 1,
            active: true,
            level,
            kind,
            actor: actor.clone(),
            reason: reason.to_string(),
            triggered_at: now,
            auto_recover_at: self
                .config
                .system_recovery(level)
                .map(|d| now + to_chrono(d)),
            closures: Vec::new(),
            closure_error: None,
            recovered_at: None,
        };

        self.store.save_system_emergency(&state).await?;
        self.publish(state.clone());

        error!(
            level = %level,
            kind = %kind,
            actor = %actor.id,
            reason = %reason,
            escalated = escalating,
            "SYSTEM EMERGENCY STOP TRIGGERED"
        );

        if level.closes_positions() {
            let (closures, closure_error) = close_positions(self.backend.as_ref(), None).await;
            state.closures = closures;
            state.closure_error = closure_error;
            self.store.save_system_emergency(&state).await?;
            self.publish(state.clone());
        }

        let action = if escalating {
            HistoryAction::Escalated
        } else {
            HistoryAction::Activated
        };
        self.store
            .append_system_history(&HistoryEntry {
                action,
                event: state.clone(),
                recorded_at: now,
            })
            .await?;

        Ok(state)
    }

    /// Lifts the stop.
    ///
    /// Succeeds once auto-recovery is due, or earlier when forced by an actor
    /// with enough privilege: admin for manual or panic stops, operator
    /// otherwise.
    pub async fn recover(
        &self,
        actor: &Actor,
        force: bool,
    ) -> Result<SystemEmergency, EmergencyError> {
        let _writer = self.writer.lock().await;
        let now = self.clock.now();

        let mut state = self
            .cell
            .borrow()
            .state
            .clone()
            .filter(|s| s.active)
            .ok_or(EmergencyError::NotActive)?;

        if !state.auto_recovery_due(now) {
            if force {
                let required = if state.kind == TriggerKind::Manual || state.level == SystemLevel::Panic {
                    Privilege::Admin
                } else {
                    Privilege::Operator
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
        self.store.save_system_emergency(&state).await?;
        self.publish(state.clone());
        self.store
            .append_system_history(&HistoryEntry {
                action: HistoryAction::Recovered,
                event: state.clone(),
                recorded_at: now,
            })
            .await?;

        info!(
            level = %state.level,
            actor = %actor.id,
            forced = force,
            "System emergency stop recovered"
        );

        Ok(state)
    }

    /// Formally recovers a stop whose auto-recovery time has passed.
    pub async fn auto_recover_lapsed(&self) -> Result<Option<SystemEmergency>, EmergencyError> {
        let now = self.clock.now();
        let due = self
            .cell
            .borrow()
            .state
            .as_ref()
            .is_some_and(|s| s.active && s.auto_recovery_due(now));
        if !due {
            return Ok(None);
        }

        match self.recover(&Actor::system(), false).await {
            Ok(state) => Ok(Some(state)),
            // raced with a manual recovery or an escalation
            Err(EmergencyError::NotActive) | Err(EmergencyError::RecoveryNotDue { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
