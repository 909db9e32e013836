//! Configuration loading and validation for the trade execution controller.
//!
//! Uses serde_yaml to load YAML configuration files with support for
//! environment variable overrides for sensitive credentials.

mod app;
pub(crate) mod duration;
mod emergency;
mod error;
mod execution;
mod notification;
mod storage;
mod tier;

pub use app::AppConfig;
pub use emergency::{ConfirmationConfig, EmergencyConfig};
pub use error::ConfigError;
pub use execution::{BackendConfig, ExecutionConfig};
pub use notification::{NotificationConfig, TelegramConfig};
pub use storage::StorageConfig;
pub use tier::{CooldownPolicy, TierConfig};

use serde::Deserialize;
use std::time::Duration;
use std::{collections::HashMap, env, fs};

/// Default wait for an execution result before flagging a timeout.
const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval of the maintenance sweep.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Root configuration structure for the controller.
///
/// Required sections: app, tiers.
/// Optional sections: execution, confirmation, emergency, notification, storage.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Application-level settings like name and environment.
    pub app: AppConfig,
    /// Tier policy table: tier name to risk limits.
    pub tiers: HashMap<String, TierConfig>,
    /// Version tag of the tier table.
    #[serde(default = "default_tier_version")]
    pub tier_version: u64,
    /// Result timeout and execution backend (optional).
    pub execution: Option<ExecutionConfig>,
    /// Two-phase confirmation window (optional).
    pub confirmation: Option<ConfirmationConfig>,
    /// Emergency stop auto-recovery windows (optional).
    pub emergency: Option<EmergencyConfig>,
    /// Alert channels like Telegram (optional).
    pub notification: Option<NotificationConfig>,
    /// Risk state persistence (optional).
    pub storage: Option<StorageConfig>,
    /// Interval of the expiry and auto-recovery sweep (default: 30s).
    #[serde(default, with = "duration")]
    pub sweep_interval: Duration,
}

fn default_tier_version() -> u64 {
    1
}

impl Config {
    /// Load configuration from a YAML file at the given path.
    ///
    /// First loads environment variables from `.env` file (if exists),
    /// then loads YAML config and credentials from environment variables:
    /// - `EXECUTION_API_KEY`, `EXECUTION_API_SECRET`
    /// - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`, `TELEGRAM_ALERT_CHAT_ID`
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        config.load_credentials_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load credentials from environment variables.
    fn load_credentials_from_env(&mut self) {
        if let Some(backend) = self
            .execution
            .as_mut()
            .and_then(|execution| execution.backend.as_mut())
        {
            backend.api_key = env::var("EXECUTION_API_KEY").unwrap_or_default();
            backend.api_secret = env::var("EXECUTION_API_SECRET").unwrap_or_default();
        }

        if let Some(ref mut notification) = self.notification {
            if let Some(ref mut telegram) = notification.telegram {
                if telegram.enabled {
                    telegram.bot_token = env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
                    telegram.chat_id = env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
                    telegram.alert_chat_id = env::var("TELEGRAM_ALERT_CHAT_ID").unwrap_or_default();
                }
            }
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.is_empty() {
            return Err(ConfigError::Validation("app.name is required".into()));
        }

        if self.tiers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one tier is required".into(),
            ));
        }

        for (name, tier) in &self.tiers {
            tier.validate(name)?;
        }

        if let Some(backend) = self
            .execution
            .as_ref()
            .and_then(|execution| execution.backend.as_ref())
        {
            if backend.base_url.is_empty() || backend.fills_url.is_empty() {
                return Err(ConfigError::Validation(
                    "execution.backend: base_url and fills_url are required".into(),
                ));
            }

            // Only require credentials in production/staging
            if self.app.is_production()
                && (backend.api_key.is_empty() || backend.api_secret.is_empty())
            {
                return Err(ConfigError::Validation(
                    "execution.backend: API credentials not found (set EXECUTION_API_KEY and EXECUTION_API_SECRET env vars)".into(),
                ));
            }
        }

        Ok(())
    }

    /// Wait for an execution result before the monitor gives up.
    pub fn result_timeout(&self) -> Duration {
        self.execution
            .as_ref()
            .map(|e| e.result_timeout)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_RESULT_TIMEOUT)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        self.confirmation
            .as_ref()
            .map(ConfirmationConfig::ttl_or_default)
            .unwrap_or_else(|| ConfirmationConfig::default().ttl)
    }

    pub fn emergency_or_default(&self) -> EmergencyConfig {
        self.emergency.clone().unwrap_or_default()
    }

    pub fn sweep_interval_or_default(&self) -> Duration {
        if self.sweep_interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            self.sweep_interval
        }
    }
}
