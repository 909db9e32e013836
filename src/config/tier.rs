//! Tier policy configuration: per-subscription risk limits.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::ConfigError;
use crate::domain::RiskMode;

/// Static risk limits of one subscription tier.
///
/// Percent values are percent of account balance (e.g., `1.5` for 1.5%).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierConfig {
    /// Risk per trade in default mode.
    pub default_risk_percent: Decimal,
    /// Risk per trade in boosted mode; the tier has no boosted mode if absent.
    pub boosted_risk_percent: Option<Decimal>,
    /// Risk per trade in high-risk mode; the tier has no high-risk mode if absent.
    pub high_risk_percent: Option<Decimal>,
    /// Maximum trades per UTC day outside a cooldown.
    pub max_trades_per_day: u32,
    /// Maximum loss per UTC day as percent of balance.
    pub daily_drawdown_cap_percent: Decimal,
    /// Restrictions applied after repeated high-risk losses.
    pub cooldown: CooldownPolicy,
}

/// Cooldown restrictions of a tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CooldownPolicy {
    /// How long a cooldown lasts.
    pub duration_hours: u32,
    /// Trade cap per UTC day while in cooldown.
    pub max_trades_per_day: u32,
    /// Forced risk per trade while in cooldown.
    pub risk_percent: Decimal,
}

impl TierConfig {
    /// Risk percent for a mode, or `None` if the tier does not offer it.
    pub fn risk_for(&self, mode: RiskMode) -> Option<Decimal> {
        match mode {
            RiskMode::Default => Some(self.default_risk_percent),
            RiskMode::Boosted => self.boosted_risk_percent,
            RiskMode::HighRisk => self.high_risk_percent,
        }
    }

    pub fn supports(&self, mode: RiskMode) -> bool {
        self.risk_for(mode).is_some()
    }

    /// Risk percent at or above which a loss counts toward a cooldown.
    ///
    /// The boosted percent when configured, else the high-risk percent.
    /// A tier with neither never accumulates high-risk losses.
    pub fn high_risk_threshold(&self) -> Option<Decimal> {
        self.boosted_risk_percent.or(self.high_risk_percent)
    }

    pub fn cooldown_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.cooldown.duration_hours))
    }

    pub(crate) fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let fail = |message: &str| ConfigError::Tier {
            tier: name.to_string(),
            message: message.to_string(),
        };

        if self.default_risk_percent <= Decimal::ZERO {
            return Err(fail("default_risk_percent must be positive"));
        }
        if let Some(boosted) = self.boosted_risk_percent {
            if boosted <= self.default_risk_percent {
                return Err(fail("boosted_risk_percent must exceed default_risk_percent"));
            }
        }
        if let Some(high) = self.high_risk_percent {
            let floor = self
                .boosted_risk_percent
                .unwrap_or(self.default_risk_percent);
            if high <= floor {
                return Err(fail("high_risk_percent must exceed the boosted and default percents"));
            }
        }
        if self.max_trades_per_day == 0 {
            return Err(fail("max_trades_per_day must be positive"));
        }
        if self.daily_drawdown_cap_percent <= Decimal::ZERO
            || self.daily_drawdown_cap_percent > Decimal::ONE_HUNDRED
        {
            return Err(fail("daily_drawdown_cap_percent must be in (0, 100]"));
        }
        if self.cooldown.duration_hours == 0 {
            return Err(fail("cooldown.duration_hours must be positive"));
        }
        if self.cooldown.max_trades_per_day > self.max_trades_per_day {
            return Err(fail("cooldown.max_trades_per_day must not exceed max_trades_per_day"));
        }
        if self.cooldown.risk_percent <= Decimal::ZERO
            || self.cooldown.risk_percent > self.default_risk_percent
        {
            return Err(fail("cooldown.risk_percent must be in (0, default_risk_percent]"));
        }

        Ok(())
    }
}
