//! Emergency stop records for system and user scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Actor;

/// Severity of a system-wide stop, ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemLevel {
    /// Block new trades only.
    Soft,
    /// Block new trades and close open positions.
    Hard,
    /// Hard, and recovery must be manual.
    Panic,
}

impl SystemLevel {
    pub fn closes_positions(self) -> bool {
        self >= SystemLevel::Hard
    }
}

impl fmt::Display for SystemLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemLevel::Soft => write!(f, "soft"),
            SystemLevel::Hard => write!(f, "hard"),
            SystemLevel::Panic => write!(f, "panic"),
        }
    }
}

impl std::str::FromStr for SystemLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(SystemLevel::Soft),
            "hard" => Ok(SystemLevel::Hard),
            "panic" => Ok(SystemLevel::Panic),
            _ => Err(format!("Unknown system stop level: {}", s)),
        }
    }
}

/// What initiated a system stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    AutomatedPanic,
    AdminOverride,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Manual => write!(f, "manual"),
            TriggerKind::AutomatedPanic => write!(f, "automated_panic"),
            TriggerKind::AdminOverride => write!(f, "admin_override"),
        }
    }
}

/// Severity of a user-scoped stop, ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserLevel {
    /// Block new fire requests.
    PauseNew,
    /// Also close the user's open positions.
    CloseAll,
    /// Also block manual trading; recovery requires an admin.
    AccountLock,
}

impl UserLevel {
    pub fn closes_positions(self) -> bool {
        self >= UserLevel::CloseAll
    }

    pub fn blocks_manual(self) -> bool {
        self == UserLevel::AccountLock
    }
}

impl fmt::Display for UserLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserLevel::PauseNew => write!(f, "pause_new"),
            UserLevel::CloseAll => write!(f, "close_all"),
            UserLevel::AccountLock => write!(f, "account_lock"),
        }
    }
}

impl std::str::FromStr for UserLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause_new" | "pause-new" => Ok(UserLevel::PauseNew),
            "close_all" | "close-all" => Ok(UserLevel::CloseAll),
            "account_lock" | "account-lock" => Ok(UserLevel::AccountLock),
            _ => Err(format!("Unknown user stop level: {}", s)),
        }
    }
}

/// Result of instructing one position to close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClosureOutcome {
    Closed,
    AlreadyClosed,
    Failed { error: String },
}

/// One entry in the record of positions a stop tried to close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionClosure {
    pub position_id: String,
    pub user_id: String,
    pub symbol: String,
    pub outcome: ClosureOutcome,
}

impl PositionClosure {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, ClosureOutcome::Failed { .. })
    }
}

/// The system-wide stop record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEmergency {
    /// Monotonic event number; each installed stop gets a new one.
    pub event_id: u64,
    pub active: bool,
    pub level: SystemLevel,
    pub kind: TriggerKind,
    pub actor: Actor,
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
    pub auto_recover_at: Option<DateTime<Utc>>,
    pub closures: Vec<PositionClosure>,
    /// Set when the list of open positions could not be fetched at all.
    pub closure_error: Option<String>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl SystemEmergency {
    /// True while the stop still blocks trading at `now`.
    pub fn is_blocking(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.auto_recovery_due(now)
    }

    pub fn auto_recovery_due(&self, now: DateTime<Utc>) -> bool {
        self.auto_recover_at.is_some_and(|at| now >= at)
    }

    pub fn failed_closures(&self) -> impl Iterator<Item = &PositionClosure> {
        self.closures.iter().filter(|c| c.failed())
    }
}

/// A user-scoped stop record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEmergency {
    pub user_id: String,
    pub active: bool,
    pub level: UserLevel,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    pub auto_recover_at: Option<DateTime<Utc>>,
    pub closures: Vec<PositionClosure>,
    pub closure_error: Option<String>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl UserEmergency {
    pub fn is_blocking(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.auto_recovery_due(now)
    }

    pub fn auto_recovery_due(&self, now: DateTime<Utc>) -> bool {
        self.auto_recover_at.is_some_and(|at| now >= at)
    }
}

/// Why an entry was appended to the system stop history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Activated,
    Escalated,
    Recovered,
}

/// Append-only log entry of the system stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub event: SystemEmergency,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_levels_are_ordered_by_strictness() {
        assert!(SystemLevel::Soft < SystemLevel::Hard);
        assert!(SystemLevel::Hard < SystemLevel::Panic);
        assert!(UserLevel::PauseNew < UserLevel::CloseAll);
        assert!(UserLevel::CloseAll < UserLevel::AccountLock);
        assert!(!SystemLevel::Soft.closes_positions());
        assert!(SystemLevel::Panic.closes_positions());
        assert!(UserLevel::AccountLock.blocks_manual());
        assert!(!UserLevel::CloseAll.blocks_manual());
    }

    #[test]
    fn test_lapsed_auto_recovery_stops_blocking() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let state = SystemEmergency {
            event_id: 1,
            active: true,
            level: SystemLevel::Soft,
            kind: TriggerKind::Manual,
            actor: Actor::operator("ops"),
            reason: "test".into(),
            triggered_at: now,
            auto_recover_at: Some(now + chrono::Duration::hours(1)),
            closures: vec![],
            closure_error: None,
            recovered_at: None,
        };
        assert!(state.is_blocking(now));
        assert!(!state.is_blocking(now + chrono::Duration::hours(1)));
    }
}
