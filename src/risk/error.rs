//! Risk engine error types.

use crate::config::ConfigError;
use crate::confirm::ConfirmError;
use crate::domain::{Privilege, Rejection};
use crate::storage::StorageError;

/// Risk engine error type.
#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    #[error("insufficient privilege: {required} required")]
    InsufficientPrivilege { required: Privilege },
    #[error("invalid tier table: {0}")]
    InvalidTable(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RiskError {
    /// Returns the rejection if this error is a policy or validation refusal.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            RiskError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}
