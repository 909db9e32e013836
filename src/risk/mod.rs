//! Risk policy engine.
//!
//! Evaluates per-user risk profiles against the tier policy table and owns
//! the cooldown state machine. All evaluation and mutation for a user runs
//! inside a [`RiskSession`], which holds that user's lock from the first
//! check through trade-slot reservation.

mod cooldown;
mod error;
mod session;
mod table;

pub use cooldown::CooldownMachine;
pub use error::RiskError;
pub use session::{RecordOutcome, Reservations, RiskSession};
pub use table::TierTable;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::TierConfig;
use crate::confirm::{ConfirmError, ConfirmationToken, PendingBook};
use crate::domain::{
    Account, Actor, CooldownRecord, Privilege, RejectCode, Rejection, RiskMode, RiskProfile,
};
use crate::storage::StateStore;

/// Where an effective risk percent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSource {
    Cooldown,
    Mode(RiskMode),
}

impl fmt::Display for RiskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskSource::Cooldown => write!(f, "cooldown"),
            RiskSource::Mode(mode) => write!(f, "{}", mode),
        }
    }
}

/// Risk percent a trade would be sized with right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveRisk {
    pub percent: Decimal,
    pub source: RiskSource,
}

/// Snapshot of a user's risk state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskStatus {
    pub user_id: String,
    pub tier: String,
    pub mode: RiskMode,
    pub effective: EffectiveRisk,
    pub trades_today: u32,
    /// Trade cap currently in force, lowered during a cooldown.
    pub max_trades_today: u32,
    /// Admitted trades still waiting for a result.
    pub reserved_trades: u32,
    pub loss_today: Decimal,
    pub drawdown_cap_percent: Decimal,
    pub cooldown: Option<CooldownRecord>,
    pub table_version: u64,
}

/// First phase of a risk mode change.
#[derive(Debug, Clone, PartialEq)]
pub struct ModePreview {
    pub token: ConfirmationToken,
    pub current: RiskMode,
    pub requested: RiskMode,
    pub current_percent: Decimal,
    pub requested_percent: Decimal,
    pub expires_at: DateTime<Utc>,
}

/// What a maintenance sweep cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSweep {
    pub cooldowns_expired: usize,
    pub previews_lapsed: usize,
}

/// Per-user risk state evaluated against the tier policy table.
pub struct RiskEngine {
    table: RwLock<Arc<TierTable>>,
    store: Arc<dyn StateStore>,
    cooldowns: CooldownMachine,
    clock: Arc<dyn Clock>,
    // Lock arena keyed by user id; the lock guards in-flight reservations.
    sessions: Mutex<HashMap<String, Arc<Mutex<Reservations>>>>,
    mode_changes: PendingBook<RiskMode>,
}

impl RiskEngine {
    pub fn new(
        table: TierTable,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        confirmation_ttl: Duration,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            cooldowns: CooldownMachine::new(store.clone(), clock.clone()),
            store,
            clock,
            sessions: Mutex::new(HashMap::new()),
            mode_changes: PendingBook::new(confirmation_ttl),
        }
    }

    /// Returns the tier table currently in force.
    pub async fn table(&self) -> Arc<TierTable> {
        self.table.read().await.clone()
    }

    pub(crate) async fn tier(&self, name: &str) -> Result<TierConfig, Rejection> {
        self.table.read().await.get(name).cloned()
    }

    pub fn cooldowns(&self) -> &CooldownMachine {
        &self.cooldowns
    }

    /// Locks the user's risk state until the session is dropped.
    pub async fn session(&self, user_id: &str) -> RiskSession<'_> {
        let lock = {
            let mut sessions = self.sessions.lock().await;
            sessions.entry(user_id.to_string()).or_default().clone()
        };
        RiskSession::new(self, user_id, lock.lock_owned().await)
    }

    /// Risk percent the user's next trade would use.
    pub async fn get_effective_risk(&self, account: &Account) -> Result<EffectiveRisk, RiskError> {
        let mut session = self.session(&account.user_id).await;
        session.get_effective_risk(&account.tier, None).await
    }

    /// Checks whether a trade risking `candidate_loss` may be admitted.
    pub async fn admit_trade(
        &self,
        account: &Account,
        candidate_loss: Decimal,
        balance: Decimal,
    ) -> Result<(), RiskError> {
        let mut session = self.session(&account.user_id).await;
        session
            .admit_trade(&account.tier, None, candidate_loss, balance)
            .await
    }

    /// Returns the user's risk status, creating the profile on first query.
    pub async fn status(&self, account: &Account) -> Result<RiskStatus, RiskError> {
        let table = self.table().await;
        let tier = table.get(&account.tier)?;

        let mut session = self.session(&account.user_id).await;
        let profile = session.profile(&account.tier).await?;
        let effective = session.get_effective_risk(&account.tier, None).await?;
        let cooldown = self.cooldowns.active(&account.user_id).await?;

        let max_trades_today = if cooldown.is_some() {
            tier.cooldown.max_trades_per_day
        } else {
            tier.max_trades_per_day
        };

        Ok(RiskStatus {
            user_id: profile.user_id,
            tier: profile.tier,
            mode: profile.mode,
            effective,
            trades_today: profile.trades_today,
            max_trades_today,
            reserved_trades: session.reservations().trades,
            loss_today: profile.loss_today,
            drawdown_cap_percent: tier.daily_drawdown_cap_percent,
            cooldown,
            table_version: table.version(),
        })
    }

    /// Opens a mode change. Refused during a cooldown or if the tier does
    /// not offer the mode.
    pub async fn preview_mode(
        &self,
        account: &Account,
        mode: RiskMode,
    ) -> Result<ModePreview, RiskError> {
        let tier = self.tier(&account.tier).await?;
        let mut session = self.session(&account.user_id).await;
        let profile = session.profile(&account.tier).await?;
        self.check_mode_change(&account.user_id, &tier, mode).await?;

        let now = self.clock.now();
        let pending = self.mode_changes.open(&account.user_id, mode, now).await;

        debug!(user = %account.user_id, from = %profile.mode, to = %mode, "Mode change previewed");

        Ok(ModePreview {
            token: pending.token,
            current: profile.mode,
            requested: mode,
            current_percent: tier
                .risk_for(profile.mode)
                .unwrap_or(tier.default_risk_percent),
            requested_percent: tier.risk_for(mode).unwrap_or(tier.default_risk_percent),
            expires_at: pending.expires_at,
        })
    }

    /// Applies a previewed mode change. The mode must match the preview.
    pub async fn confirm_mode(
        &self,
        account: &Account,
        mode: RiskMode,
        token: &ConfirmationToken,
    ) -> Result<RiskProfile, RiskError> {
        let tier = self.tier(&account.tier).await?;
        let mut session = self.session(&account.user_id).await;

        let now = self.clock.now();
        let pending = self.mode_changes.consume(&account.user_id, token, now).await?;
        if pending.payload != mode {
            return Err(ConfirmError::TokenMismatch.into());
        }

        // a cooldown may have started since the preview
        self.check_mode_change(&account.user_id, &tier, mode).await?;

        let mut profile = session.profile(&account.tier).await?;
        let previous = profile.mode;
        profile.mode = mode;
        profile.updated_at = now;
        self.store.save_profile(&profile).await?;

        info!(user = %account.user_id, from = %previous, to = %mode, "Risk mode changed");
        Ok(profile)
    }

    async fn check_mode_change(
        &self,
        user_id: &str,
        tier: &TierConfig,
        mode: RiskMode,
    ) -> Result<(), RiskError> {
        if let Some(cooldown) = self.cooldowns.active(user_id).await? {
            let remaining = cooldown.remaining(self.clock.now());
            return Err(Rejection::new(
                RejectCode::ModeChangeInCooldown,
                format!("{}m remaining", remaining.num_minutes()),
            )
            .into());
        }
        if !tier.supports(mode) {
            return Err(Rejection::new(RejectCode::ModeUnsupported, mode.to_string()).into());
        }
        Ok(())
    }

    /// Ends a user's cooldown early. Requires operator privilege.
    pub async fn override_cooldown(&self, actor: &Actor, user_id: &str) -> Result<bool, RiskError> {
        let _session = self.session(user_id).await;
        self.cooldowns.clear(user_id, actor).await
    }

    /// Swaps the whole tier table. Requires admin privilege.
    pub async fn reload_table(&self, actor: &Actor, table: TierTable) -> Result<u64, RiskError> {
        if !actor.has(Privilege::Admin) {
            return Err(RiskError::InsufficientPrivilege {
                required: Privilege::Admin,
            });
        }

        let version = table.version();
        let mut current = self.table.write().await;
        let previous = current.version();
        *current = Arc::new(table);

        info!(actor = %actor.id, from = previous, to = version, "Tier table reloaded");
        Ok(version)
    }

    /// Removes expired cooldowns and lapsed mode previews.
    pub async fn sweep(&self) -> Result<RiskSweep, RiskError> {
        let mut report = RiskSweep::default();

        for user_id in self.cooldowns.expired_users().await? {
            let _session = self.session(&user_id).await;
            if self.cooldowns.remove_expired(&user_id).await? {
                report.cooldowns_expired += 1;
            }
        }

        report.previews_lapsed = self.mode_changes.purge_expired(self.clock.now()).await;

        // drop arena entries nobody holds and nothing is reserved in
        self.sessions.lock().await.retain(|_, lock| {
            Arc::strong_count(lock) > 1
                || lock
                    .try_lock()
                    .map_or(true, |reserved| reserved.trades > 0)
        });

        Ok(report)
    }
}
