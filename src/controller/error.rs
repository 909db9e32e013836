//! Controller error types.

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::domain::Rejection;
use crate::emergency::EmergencyError;
use crate::gateway::GatewayError;
use crate::risk::RiskError;
use crate::storage::StorageError;

/// Controller error type.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller is already running")]
    AlreadyRunning,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// A policy or validation refusal, passed through unchanged.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("risk engine error: {0}")]
    Risk(RiskError),
    #[error("emergency error: {0}")]
    Emergency(#[from] EmergencyError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("notification error: {0}")]
    Notification(String),
}

impl From<RiskError> for ControllerError {
    fn from(e: RiskError) -> Self {
        match e {
            RiskError::Rejected(r) => ControllerError::Rejected(r),
            other => ControllerError::Risk(other),
        }
    }
}

impl From<GatewayError> for ControllerError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Rejected(r) => ControllerError::Rejected(r),
            GatewayError::Risk(e) => ControllerError::Risk(e),
            GatewayError::Storage(e) => ControllerError::Storage(e),
        }
    }
}

impl ControllerError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ControllerError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}
