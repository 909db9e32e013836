//! Versioned tier policy table.

use std::collections::HashMap;

use crate::config::{Config, ConfigError, TierConfig};
use crate::domain::{RejectCode, Rejection};

/// Immutable mapping of tier name to risk limits.
///
/// Replaced as a whole on reload; never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    version: u64,
    tiers: HashMap<String, TierConfig>,
}

impl TierTable {
    /// Builds a table, validating every tier.
    pub fn new(version: u64, tiers: HashMap<String, TierConfig>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one tier is required".into(),
            ));
        }
        for (name, tier) in &tiers {
            tier.validate(name)?;
        }
        Ok(Self { version, tiers })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Self::new(cfg.tier_version, cfg.tiers.clone())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Looks up a tier, rejecting unknown names.
    pub fn get(&self, tier: &str) -> Result<&TierConfig, Rejection> {
        self.tiers
            .get(tier)
            .ok_or_else(|| Rejection::new(RejectCode::UnknownTier, tier.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tiers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
