//! Execution configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

/// Order execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum time to wait for an execution result after admission.
    #[serde(default, with = "duration")]
    pub result_timeout: Duration,
    /// Remote execution backend connection.
    pub backend: Option<BackendConfig>,
}

/// Execution backend connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// REST base URL for order submission and account queries.
    pub base_url: String,
    /// WebSocket URL of the fill stream.
    pub fills_url: String,
    /// API key (loaded from EXECUTION_API_KEY env var).
    #[serde(skip)]
    pub api_key: String,
    /// API secret (loaded from EXECUTION_API_SECRET env var).
    #[serde(skip)]
    pub api_secret: String,
    /// Timeout of a single REST call.
    #[serde(default, with = "duration")]
    pub request_timeout: Duration,
    /// Interval between fill stream pings.
    #[serde(default, with = "duration")]
    pub ping_interval: Duration,
    /// Delay before reconnecting the fill stream.
    #[serde(default, with = "duration")]
    pub reconnect_delay: Duration,
}
