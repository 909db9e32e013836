//! Emergency stop error types.

use crate::confirm::ConfirmError;
use crate::domain::Privilege;
use crate::storage::StorageError;

/// Emergency stop error type.
#[derive(Debug, thiserror::Error)]
pub enum EmergencyError {
    #[error("no active emergency stop")]
    NotActive,
    #[error("a {active} stop is already active; only a stricter level is accepted")]
    NotStricter { active: String, requested: String },
    #[error("auto-recovery not yet due ({}m remaining)", .remaining.num_minutes())]
    RecoveryNotDue { remaining: chrono::Duration },
    #[error("stop has no auto-recovery; a forced recovery is required")]
    ManualRecoveryRequired,
    #[error("insufficient privilege: {required} required")]
    InsufficientPrivilege { required: Privilege },
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
