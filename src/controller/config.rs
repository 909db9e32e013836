//! Controller configuration.

use crate::config::Config;

/// Controller configuration options.
pub struct ControllerConfig {
    /// Application configuration.
    pub app_config: Config,
    /// Application version.
    pub version: String,
    /// Build timestamp.
    pub build_time: String,
}

impl ControllerConfig {
    pub fn new(app_config: Config) -> Self {
        Self {
            app_config,
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
        }
    }
}
