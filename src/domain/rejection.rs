//! Policy and validation rejections with machine-readable codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable reason a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    SignalNotFound,
    SignalExpired,
    InvalidSignal,
    UnknownTier,
    InsufficientBalance,
    DailyTradeLimit,
    DrawdownCap,
    HighRiskBlockedInCooldown,
    ModeChangeInCooldown,
    ModeUnsupported,
    SystemEmergencyStop,
    UserEmergencyStop,
    BackendUnavailable,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::SignalNotFound => "signal_not_found",
            RejectCode::SignalExpired => "signal_expired",
            RejectCode::InvalidSignal => "invalid_signal",
            RejectCode::UnknownTier => "unknown_tier",
            RejectCode::InsufficientBalance => "insufficient_balance",
            RejectCode::DailyTradeLimit => "daily_trade_limit",
            RejectCode::DrawdownCap => "drawdown_cap",
            RejectCode::HighRiskBlockedInCooldown => "high_risk_blocked_in_cooldown",
            RejectCode::ModeChangeInCooldown => "mode_change_in_cooldown",
            RejectCode::ModeUnsupported => "mode_unsupported",
            RejectCode::SystemEmergencyStop => "system_emergency_stop",
            RejectCode::UserEmergencyStop => "user_emergency_stop",
            RejectCode::BackendUnavailable => "backend_unavailable",
        }
    }

    /// Short human-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            RejectCode::SignalNotFound => "not found",
            RejectCode::SignalExpired => "expired",
            RejectCode::InvalidSignal => "invalid signal",
            RejectCode::UnknownTier => "unknown tier",
            RejectCode::InsufficientBalance => "insufficient balance",
            RejectCode::DailyTradeLimit => "daily trade limit",
            RejectCode::DrawdownCap => "drawdown cap",
            RejectCode::HighRiskBlockedInCooldown => "high-risk blocked in cooldown",
            RejectCode::ModeChangeInCooldown => "cannot change mode during cooldown",
            RejectCode::ModeUnsupported => "mode not supported by tier",
            RejectCode::SystemEmergencyStop => "system emergency stop active",
            RejectCode::UserEmergencyStop => "emergency stop active",
            RejectCode::BackendUnavailable => "backend unavailable",
        }
    }

    /// Validation failures are the caller's fault and never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RejectCode::SignalNotFound
                | RejectCode::SignalExpired
                | RejectCode::InvalidSignal
                | RejectCode::UnknownTier
        )
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused request: code plus detail suitable for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}: {detail}", .code.reason())]
pub struct Rejection {
    pub code: RejectCode,
    pub detail: String,
}

impl Rejection {
    pub fn new(code: RejectCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn reason(&self) -> &'static str {
        self.code.reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display_leads_with_reason() {
        let r = Rejection::new(RejectCode::DrawdownCap, "6.5% > 6%");
        assert_eq!(r.to_string(), "drawdown cap: 6.5% > 6%");
        assert_eq!(r.code.as_str(), "drawdown_cap");
    }

    #[test]
    fn test_validation_codes() {
        assert!(RejectCode::SignalExpired.is_validation());
        assert!(!RejectCode::DrawdownCap.is_validation());
        assert!(!RejectCode::BackendUnavailable.is_validation());
    }
}
