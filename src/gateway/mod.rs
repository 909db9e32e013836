//! Fire execution gateway.
//!
//! Turns a user's fire request into an order: validates the signal, checks
//! the emergency stops, sizes the position from the effective risk, admits
//! and reserves under the user's risk session, submits to the backend and
//! hands the result to a background monitor.

mod monitor;
mod signals;

pub use monitor::MonitorRegistry;
pub use signals::{SignalBook, SignalSource};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::monitor::Monitor;
use crate::backend::ExecutionBackend;
use crate::clock::Clock;
use crate::controller::Stats;
use crate::domain::{
    Account, OrderTicket, RejectCode, Rejection, RiskMode, Signal, Surface,
};
use crate::emergency::EmergencyController;
use crate::notification::{Event, FireData, Notifier};
use crate::risk::{EffectiveRisk, RiskEngine, RiskError};
use crate::storage::StorageError;

/// Decimal places position sizes are rounded to.
const SIZE_DP: u32 = 8;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request was refused; nothing was reserved or submitted.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("risk engine error: {0}")]
    Risk(RiskError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RiskError> for GatewayError {
    fn from(e: RiskError) -> Self {
        match e {
            RiskError::Rejected(r) => GatewayError::Rejected(r),
            other => GatewayError::Risk(other),
        }
    }
}

impl GatewayError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            GatewayError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// Acknowledgement of an admitted fire. The outcome arrives later as a
/// notification.
#[derive(Debug, Clone, PartialEq)]
pub struct FireAck {
    pub request_id: String,
    pub execution_id: String,
    pub signal_id: String,
    pub size: Decimal,
    pub risk: EffectiveRisk,
    pub risk_amount: Decimal,
    /// When the monitor gives up waiting for a result.
    pub result_deadline: DateTime<Utc>,
}

pub struct FireGateway {
    risk: Arc<RiskEngine>,
    emergency: Arc<EmergencyController>,
    backend: Arc<dyn ExecutionBackend>,
    signals: Arc<dyn SignalSource>,
    notifier: Arc<dyn Notifier>,
    monitors: Arc<MonitorRegistry>,
    stats: Arc<Mutex<Stats>>,
    clock: Arc<dyn Clock>,
    result_timeout: Duration,
}

impl FireGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        risk: Arc<RiskEngine>,
        emergency: Arc<EmergencyController>,
        backend: Arc<dyn ExecutionBackend>,
        signals: Arc<dyn SignalSource>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<Mutex<Stats>>,
        clock: Arc<dyn Clock>,
        result_timeout: Duration,
    ) -> Self {
        Self {
            risk,
            emergency,
            backend,
            signals,
            notifier,
            monitors: Arc::new(MonitorRegistry::new()),
            stats,
            clock,
            result_timeout,
        }
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    /// Fires a previously issued signal for the account.
    ///
    /// `requested` overrides the profile's risk mode for this one trade.
    pub async fn fire(
        &self,
        account: &Account,
        signal_id: &str,
        requested: Option<RiskMode>,
    ) -> Result<FireAck, GatewayError> {
        match self.try_fire(account, signal_id, requested).await {
            Ok(ack) => {
                self.stats.lock().await.fires_admitted += 1;
                Ok(ack)
            }
            Err(GatewayError::Rejected(rejection)) => {
                self.stats.lock().await.fires_rejected += 1;
                info!(
                    user = %account.user_id,
                    signal = %signal_id,
                    code = %rejection.code,
                    reason = %rejection,
                    "Fire rejected"
                );
                Err(GatewayError::Rejected(rejection))
            }
            Err(e) => {
                warn!(user = %account.user_id, signal = %signal_id, error = %e, "Fire failed");
                Err(e)
            }
        }
    }

    fn check_signal(&self, signal: Option<Signal>, signal_id: &str) -> Result<Signal, Rejection> {
        let signal =
            signal.ok_or_else(|| Rejection::new(RejectCode::SignalNotFound, signal_id))?;

        if signal.is_expired(self.clock.now()) {
            return Err(Rejection::new(
                RejectCode::SignalExpired,
                format!("{} valid until {}", signal_id, signal.valid_until.to_rfc3339()),
            ));
        }
        if !signal.has_valid_stop() || signal.stop_distance().is_zero() {
            return Err(Rejection::new(
                RejectCode::InvalidSignal,
                format!("{}: stop loss on the wrong side of entry", signal_id),
            ));
        }

        Ok(signal)
    }

    async fn try_fire(
        &self,
        account: &Account,
        signal_id: &str,
        requested: Option<RiskMode>,
    ) -> Result<FireAck, GatewayError> {
        let signal = self.check_signal(self.signals.get(signal_id).await, signal_id)?;
        let user_id = account.user_id.as_str();

        // held from the first check through submission
        let mut session = self.risk.session(user_id).await;

        if let Some(rejection) = self.emergency.check(user_id, Surface::Signal).await? {
            return Err(rejection.into());
        }

        if !self.backend.is_available().await {
            return Err(Rejection::new(
                RejectCode::BackendUnavailable,
                format!("{} is not accepting orders", self.backend.name()),
            )
            .into());
        }

        let balance = self.backend.account_balance(user_id).await.map_err(|e| {
            Rejection::new(RejectCode::BackendUnavailable, format!("balance: {}", e))
        })?;

        let risk = session
            .get_effective_risk(&account.tier, requested)
            .await?;
        let (risk_amount, size) = position_size(balance, risk.percent, &signal)?;

        session
            .admit_trade(&account.tier, requested, risk_amount, balance)
            .await?;
        session.reserve(risk_amount);

        let now = self.clock.now();
        let ticket = OrderTicket {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            size,
            risk_percent: risk.percent,
            risk_amount,
            created_at: now,
        };

        // registered before the last check so a stop landing after it still
        // reaches this monitor
        let cancel = self.monitors.register(&ticket.request_id, user_id);

        // either scope may have stopped while this request was being checked
        let stopped = match self.emergency.check(user_id, Surface::Signal).await {
            Ok(stopped) => stopped,
            Err(e) => {
                self.monitors.unregister(&ticket.request_id);
                session.release(risk_amount);
                return Err(e.into());
            }
        };
        if let Some(rejection) = stopped {
            self.monitors.unregister(&ticket.request_id);
            session.release(risk_amount);
            return Err(rejection.into());
        }

        let submission = match self.backend.submit(&ticket).await {
            Ok(submission) => submission,
            Err(e) => {
                self.monitors.unregister(&ticket.request_id);
                session.release(risk_amount);
                return Err(Rejection::new(RejectCode::BackendUnavailable, e.to_string()).into());
            }
        };
        drop(session);

        let monitor = Monitor {
            risk: self.risk.clone(),
            notifier: self.notifier.clone(),
            registry: self.monitors.clone(),
            stats: self.stats.clone(),
            ticket: ticket.clone(),
            tier: account.tier.clone(),
            execution_id: submission.execution_id.clone(),
            timeout: self.result_timeout,
        };
        tokio::spawn(monitor.run(submission.result, cancel));

        info!(
            user = %user_id,
            signal = %signal.id,
            execution = %submission.execution_id,
            size = %size,
            risk_percent = %risk.percent,
            source = %risk.source,
            "Fire admitted"
        );

        self.notifier.send_async(Event::fire_admitted(FireData {
            user_id: user_id.to_string(),
            signal_id: signal.id.clone(),
            execution_id: submission.execution_id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            size,
            risk_percent: risk.percent,
            risk_source: risk.source.to_string(),
        }));

        let result_deadline = now
            + chrono::Duration::from_std(self.result_timeout).unwrap_or(chrono::Duration::zero());
        debug!(request = %ticket.request_id, deadline = %result_deadline, "Monitor started");

        Ok(FireAck {
            request_id: ticket.request_id,
            execution_id: submission.execution_id,
            signal_id: signal.id,
            size,
            risk,
            risk_amount,
            result_deadline,
        })
    }
}

/// Risk amount and position size for a trade. Sizes too large to
/// represent are refused as an invalid signal.
fn position_size(
    balance: Decimal,
    risk_percent: Decimal,
    signal: &Signal,
) -> Result<(Decimal, Decimal), Rejection> {
    let overflow = || {
        Rejection::new(
            RejectCode::InvalidSignal,
            format!("{}: stop distance too small to size", signal.id),
        )
    };

    let risk_amount = balance
        .checked_mul(risk_percent)
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .ok_or_else(overflow)?;
    let size = risk_amount
        .checked_div(signal.stop_distance())
        .ok_or_else(overflow)?
        .round_dp(SIZE_DP);

    Ok((risk_amount, size))
}

#[cfg(test)]
mod tests;
