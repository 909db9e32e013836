//! Per-user risk state: risk mode, daily counters and cooldown records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of consecutive high-risk losses that starts a cooldown.
pub const COOLDOWN_LOSS_STREAK: u32 = 2;

/// User-selected risk-per-trade setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    #[default]
    Default,
    Boosted,
    HighRisk,
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskMode::Default => write!(f, "default"),
            RiskMode::Boosted => write!(f, "boosted"),
            RiskMode::HighRisk => write!(f, "high_risk"),
        }
    }
}

impl std::str::FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(RiskMode::Default),
            "boosted" => Ok(RiskMode::Boosted),
            "high_risk" | "high-risk" => Ok(RiskMode::HighRisk),
            _ => Err(format!("Unknown risk mode: {}", s)),
        }
    }
}

/// Mutable risk state of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub user_id: String,
    pub tier: String,
    pub mode: RiskMode,
    /// Trades executed since `reset_date`.
    pub trades_today: u32,
    /// Absolute loss accumulated since `reset_date`.
    pub loss_today: Decimal,
    /// UTC date the daily counters belong to.
    pub reset_date: NaiveDate,
    /// Consecutive losses taken at or above the tier's boosted threshold.
    pub high_risk_losses: u32,
    /// Amounts of the most recent high-risk losses, oldest first, at most two.
    pub recent_high_risk_losses: Vec<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl RiskProfile {
    pub fn new(user_id: impl Into<String>, tier: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: tier.into(),
            mode: RiskMode::Default,
            trades_today: 0,
            loss_today: Decimal::ZERO,
            reset_date: now.date_naive(),
            high_risk_losses: 0,
            recent_high_risk_losses: Vec::new(),
            updated_at: now,
        }
    }

    /// Resets the daily counters when `now` falls on a later UTC day.
    /// Returns true if a reset happened.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.reset_date {
            return false;
        }
        self.trades_today = 0;
        self.loss_today = Decimal::ZERO;
        self.reset_date = today;
        self.updated_at = now;
        true
    }

    /// Records a loss taken at high risk, retaining the last two amounts.
    pub fn push_high_risk_loss(&mut self, amount: Decimal) {
        self.high_risk_losses += 1;
        self.recent_high_risk_losses.push(amount);
        if self.recent_high_risk_losses.len() > COOLDOWN_LOSS_STREAK as usize {
            self.recent_high_risk_losses.remove(0);
        }
    }

    pub fn clear_loss_streak(&mut self) {
        self.high_risk_losses = 0;
        self.recent_high_risk_losses.clear();
    }
}

/// Outcome of one settled trade as reported to the risk engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeResult {
    pub won: bool,
    /// Realized profit (positive) or loss (negative).
    pub pnl: Decimal,
    /// Risk percent the trade was sized with.
    pub risk_percent: Decimal,
}

/// Temporary restriction following repeated high-risk losses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub user_id: String,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    pub loss_count: u32,
    pub loss_amounts: Vec<Decimal>,
    /// Trade cap while the cooldown lasts.
    pub max_trades_per_day: u32,
    /// Forced risk percent while the cooldown lasts.
    pub risk_percent: Decimal,
}

impl CooldownRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}
