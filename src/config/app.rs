//! Application-level configuration.

use serde::Deserialize;

/// Application-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Application name used in logs and notifications.
    pub name: String,
    /// Environment: "development", "staging", or "production".
    pub env: String,
    /// Logging verbosity: "debug", "info", "warn", "error".
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Staging is treated like production.
    pub fn is_production(&self) -> bool {
        self.env != "development"
    }
}
