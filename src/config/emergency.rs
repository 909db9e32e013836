//! Emergency stop and confirmation configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;
use crate::domain::{SystemLevel, UserLevel};

const DEFAULT_SOFT_RECOVERY: Duration = Duration::from_secs(3600);
const DEFAULT_HARD_RECOVERY: Duration = Duration::from_secs(4 * 3600);
const DEFAULT_PAUSE_NEW_RECOVERY: Duration = Duration::from_secs(3600);
const DEFAULT_CLOSE_ALL_RECOVERY: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(60);

/// Automatic recovery windows per stop level.
///
/// Panic and account-lock stops never recover on their own.
#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default = "default_soft", with = "duration::option")]
    pub soft_auto_recovery: Option<Duration>,
    #[serde(default = "default_hard", with = "duration::option")]
    pub hard_auto_recovery: Option<Duration>,
    #[serde(default = "default_pause_new", with = "duration::option")]
    pub pause_new_auto_recovery: Option<Duration>,
    #[serde(default = "default_close_all", with = "duration::option")]
    pub close_all_auto_recovery: Option<Duration>,
}

fn default_soft() -> Option<Duration> {
    Some(DEFAULT_SOFT_RECOVERY)
}

fn default_hard() -> Option<Duration> {
    Some(DEFAULT_HARD_RECOVERY)
}

fn default_pause_new() -> Option<Duration> {
    Some(DEFAULT_PAUSE_NEW_RECOVERY)
}

fn default_close_all() -> Option<Duration> {
    Some(DEFAULT_CLOSE_ALL_RECOVERY)
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            soft_auto_recovery: default_soft(),
            hard_auto_recovery: default_hard(),
            pause_new_auto_recovery: default_pause_new(),
            close_all_auto_recovery: default_close_all(),
        }
    }
}

impl EmergencyConfig {
    pub fn system_recovery(&self, level: SystemLevel) -> Option<Duration> {
        match level {
            SystemLevel::Soft => self.soft_auto_recovery,
            SystemLevel::Hard => self.hard_auto_recovery,
            SystemLevel::Panic => None,
        }
    }

    pub fn user_recovery(&self, level: UserLevel) -> Option<Duration> {
        match level {
            UserLevel::PauseNew => self.pause_new_auto_recovery,
            UserLevel::CloseAll => self.close_all_auto_recovery,
            UserLevel::AccountLock => None,
        }
    }
}

/// Two-phase confirmation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    /// How long a confirm token stays valid.
    #[serde(default, with = "duration")]
    pub ttl: Duration,
}

impl ConfirmationConfig {
    pub fn ttl_or_default(&self) -> Duration {
        if self.ttl.is_zero() {
            DEFAULT_CONFIRMATION_TTL
        } else {
            self.ttl
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CONFIRMATION_TTL,
        }
    }
}
