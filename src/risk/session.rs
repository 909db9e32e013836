//! Per-user risk session.

use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use super::{EffectiveRisk, RiskEngine, RiskError, RiskSource};
use crate::domain::{
    COOLDOWN_LOSS_STREAK, CooldownRecord, RejectCode, Rejection, RiskMode, RiskProfile,
    TradeResult,
};

/// Trades admitted but not yet settled, with the loss they could still cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservations {
    pub trades: u32,
    pub loss: Decimal,
}

/// What recording a trade result changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub profile: RiskProfile,
    /// Set when this result started a cooldown.
    pub cooldown: Option<CooldownRecord>,
}

/// Exclusive access to one user's risk state.
///
/// Holding a session serializes every check and mutation for the user.
/// Sessions for different users never contend.
pub struct RiskSession<'a> {
    engine: &'a RiskEngine,
    user_id: String,
    reserved: OwnedMutexGuard<Reservations>,
}

impl<'a> RiskSession<'a> {
    pub(super) fn new(
        engine: &'a RiskEngine,
        user_id: &str,
        reserved: OwnedMutexGuard<Reservations>,
    ) -> Self {
        Self {
            engine,
            user_id: user_id.to_string(),
            reserved,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn reservations(&self) -> Reservations {
        *self.reserved
    }

    /// Loads the profile, creating it on first use and rolling daily
    /// counters over on a new UTC day.
    pub async fn profile(&mut self, tier: &str) -> Result<RiskProfile, RiskError> {
        let now = self.engine.clock.now();

        let (mut profile, mut dirty) = match self.engine.store.load_profile(&self.user_id).await? {
            Some(profile) => (profile, false),
            None => (RiskProfile::new(&self.user_id, tier, now), true),
        };

        if profile.roll_day(now) {
            debug!(user = %self.user_id, date = %profile.reset_date, "Daily counters reset");
            dirty = true;
        }
        if profile.tier != tier {
            info!(user = %self.user_id, from = %profile.tier, to = %tier, "Tier changed");
            profile.tier = tier.to_string();
            profile.updated_at = now;
            dirty = true;
        }

        if dirty {
            self.engine.store.save_profile(&profile).await?;
        }
        Ok(profile)
    }

    /// Risk percent for the next trade.
    ///
    /// During a cooldown this is always the tier's cooldown percent.
    /// Otherwise the percent of `requested` or, if absent, of the profile's
    /// mode. A stored mode the tier no longer offers falls back to default.
    pub async fn get_effective_risk(
        &mut self,
        tier: &str,
        requested: Option<RiskMode>,
    ) -> Result<EffectiveRisk, RiskError> {
        let cfg = self.engine.tier(tier).await?;
        let profile = self.profile(tier).await?;

        if self.engine.cooldowns.active(&self.user_id).await?.is_some() {
            return Ok(EffectiveRisk {
                percent: cfg.cooldown.risk_percent,
                source: RiskSource::Cooldown,
            });
        }

        let mode = match requested {
            Some(mode) if !cfg.supports(mode) => {
                return Err(Rejection::new(RejectCode::ModeUnsupported, mode.to_string()).into());
            }
            Some(mode) => mode,
            None if cfg.supports(profile.mode) => profile.mode,
            None => RiskMode::Default,
        };

        Ok(EffectiveRisk {
            percent: cfg.risk_for(mode).unwrap_or(cfg.default_risk_percent),
            source: RiskSource::Mode(mode),
        })
    }

    /// Checks a candidate trade against the tier limits. Pure: nothing is
    /// reserved or stored besides a daily rollover.
    ///
    /// Checks run in order: trade count, drawdown, high risk in cooldown.
    /// In-flight reservations count as if already traded.
    pub async fn admit_trade(
        &mut self,
        tier: &str,
        requested: Option<RiskMode>,
        candidate_loss: Decimal,
        balance: Decimal,
    ) -> Result<(), RiskError> {
        let cfg = self.engine.tier(tier).await?;
        let profile = self.profile(tier).await?;
        let in_cooldown = self.engine.cooldowns.active(&self.user_id).await?.is_some();

        let max_trades = if in_cooldown {
            cfg.cooldown.max_trades_per_day
        } else {
            cfg.max_trades_per_day
        };
        let used = profile.trades_today + self.reserved.trades;
        if used >= max_trades {
            return Err(Rejection::new(
                RejectCode::DailyTradeLimit,
                format!("{}/{} trades today", used, max_trades),
            )
            .into());
        }

        if balance <= Decimal::ZERO {
            return Err(Rejection::new(
                RejectCode::InsufficientBalance,
                format!("balance {}", balance),
            )
            .into());
        }

        // an exposure too large to represent is past any cap
        let drawdown = profile
            .loss_today
            .checked_add(self.reserved.loss)
            .and_then(|v| v.checked_add(candidate_loss))
            .and_then(|v| v.checked_div(balance))
            .and_then(|v| v.checked_mul(Decimal::ONE_HUNDRED));
        match drawdown {
            Some(drawdown) if drawdown <= cfg.daily_drawdown_cap_percent => {}
            Some(drawdown) => {
                return Err(Rejection::new(
                    RejectCode::DrawdownCap,
                    format!(
                        "{}% > {}%",
                        drawdown.round_dp(2).normalize(),
                        cfg.daily_drawdown_cap_percent.normalize()
                    ),
                )
                .into());
            }
            None => {
                return Err(Rejection::new(
                    RejectCode::DrawdownCap,
                    format!(
                        "exposure out of range > {}%",
                        cfg.daily_drawdown_cap_percent.normalize()
                    ),
                )
                .into());
            }
        }

        let mode = requested.unwrap_or(profile.mode);
        if in_cooldown && mode != RiskMode::Default {
            return Err(Rejection::new(RejectCode::HighRiskBlockedInCooldown, mode.to_string()).into());
        }

        Ok(())
    }

    /// Holds one trade slot and its potential loss until settlement.
    pub fn reserve(&mut self, loss: Decimal) {
        self.reserved.trades += 1;
        self.reserved.loss += loss;
    }

    /// Gives a reservation back without counting a trade.
    pub fn release(&mut self, loss: Decimal) {
        self.reserved.trades = self.reserved.trades.saturating_sub(1);
        self.reserved.loss = (self.reserved.loss - loss).max(Decimal::ZERO);
    }

    /// Converts a reservation whose result never arrived into a counted
    /// trade with no recorded loss.
    pub async fn commit_unsettled(
        &mut self,
        tier: &str,
        loss: Decimal,
    ) -> Result<RiskProfile, RiskError> {
        self.release(loss);

        let mut profile = self.profile(tier).await?;
        profile.trades_today += 1;
        profile.updated_at = self.engine.clock.now();
        self.engine.store.save_profile(&profile).await?;

        Ok(profile)
    }

    /// Records a settled trade. Callers settling a reserved trade release
    /// the reservation first.
    ///
    /// Losses taken at or above the tier's high-risk threshold extend the
    /// streak; a win clears it. Reaching the streak length starts a cooldown
    /// unless one is already running, and forces the mode back to default.
    pub async fn record_result(
        &mut self,
        tier: &str,
        result: &TradeResult,
    ) -> Result<RecordOutcome, RiskError> {
        let cfg = self.engine.tier(tier).await?;
        let now = self.engine.clock.now();
        let mut profile = self.profile(tier).await?;

        profile.trades_today += 1;
        if result.won {
            profile.clear_loss_streak();
        } else {
            let loss = result.pnl.abs();
            profile.loss_today += loss;
            if cfg
                .high_risk_threshold()
                .is_some_and(|threshold| result.risk_percent >= threshold)
            {
                profile.push_high_risk_loss(loss);
            }
        }

        let mut cooldown = None;
        if profile.high_risk_losses >= COOLDOWN_LOSS_STREAK {
            if self.engine.cooldowns.active(&self.user_id).await?.is_none() {
                let losses = profile.recent_high_risk_losses.clone();
                cooldown = Some(
                    self.engine
                        .cooldowns
                        .activate(&self.user_id, &cfg, losses, now)
                        .await?,
                );
                profile.mode = RiskMode::Default;
            }
            profile.clear_loss_streak();
        }

        profile.updated_at = now;
        self.engine.store.save_profile(&profile).await?;

        debug!(
            user = %self.user_id,
            won = result.won,
            pnl = %result.pnl,
            trades_today = profile.trades_today,
            streak = profile.high_risk_losses,
            "Trade result recorded"
        );

        Ok(RecordOutcome { profile, cooldown })
    }
}
