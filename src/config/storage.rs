//! Storage configuration.

use serde::Deserialize;

/// Risk state persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file; in-memory state is used if absent.
    pub path: Option<String>,
    /// Maximum number of pooled connections.
    pub max_connections: Option<u32>,
}
