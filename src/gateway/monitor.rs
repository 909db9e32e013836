//! Background result monitors.
//!
//! One task per admitted fire waits for exactly one outcome: the backend's
//! result, the timeout, or cancellation. Whichever comes first settles the
//! trade-slot reservation and emits a single notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::Stats;
use crate::domain::{ExecutionResult, OrderTicket, TradeResult};
use crate::notification::{
    CooldownData, ErrorData, Event, Notifier, SettlementData, UnsettledData,
};
use crate::risk::{RiskEngine, RiskError};

struct MonitorHandle {
    user_id: String,
    cancel: CancellationToken,
}

/// Tracks running monitors so they can be cancelled per user or all at once.
pub struct MonitorRegistry {
    root: CancellationToken,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, HashMap<String, MonitorHandle>> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a monitor and returns its cancellation token.
    pub fn register(&self, request_id: &str, user_id: &str) -> CancellationToken {
        let cancel = self.root.child_token();
        self.monitors().insert(
            request_id.to_string(),
            MonitorHandle {
                user_id: user_id.to_string(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn unregister(&self, request_id: &str) {
        self.monitors().remove(request_id);
    }

    /// Cancels every monitor of one user. Returns how many were cancelled.
    pub fn cancel_user(&self, user_id: &str) -> usize {
        let monitors = self.monitors();
        let mut cancelled = 0;
        for handle in monitors.values().filter(|h| h.user_id == user_id) {
            handle.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancels every running monitor. New monitors can still be registered.
    pub fn cancel_all(&self) -> usize {
        let monitors = self.monitors();
        for handle in monitors.values() {
            handle.cancel.cancel();
        }
        monitors.len()
    }

    /// Cancels every monitor, current and future.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn active_count(&self) -> usize {
        self.monitors().len()
    }

    pub fn active_for(&self, user_id: &str) -> usize {
        self.monitors()
            .values()
            .filter(|h| h.user_id == user_id)
            .count()
    }

    /// Waits until no monitor is running, or `limit` has passed.
    /// Returns true if the registry drained.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

enum Outcome {
    Result(ExecutionResult),
    TimedOut,
    Lost,
    Cancelled,
}

/// Everything a monitor needs to settle one admitted fire.
pub(super) struct Monitor {
    pub risk: Arc<RiskEngine>,
    pub notifier: Arc<dyn Notifier>,
    pub registry: Arc<MonitorRegistry>,
    pub stats: Arc<AsyncMutex<Stats>>,
    pub ticket: OrderTicket,
    pub tier: String,
    pub execution_id: String,
    pub timeout: Duration,
}

impl Monitor {
    pub(super) async fn run(
        self,
        result: oneshot::Receiver<ExecutionResult>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            received = tokio::time::timeout(self.timeout, result) => match received {
                Ok(Ok(result)) => Outcome::Result(result),
                Ok(Err(_)) => Outcome::Lost,
                Err(_) => Outcome::TimedOut,
            },
        };
        let elapsed = started.elapsed();

        let settled = match outcome {
            Outcome::Result(result) => self.settle(result, elapsed).await,
            Outcome::TimedOut => {
                let reason = format!("no result within {:?}", self.timeout);
                self.unsettled(elapsed, reason, false).await
            }
            Outcome::Lost => {
                self.unsettled(elapsed, "result stream lost".to_string(), false)
                    .await
            }
            Outcome::Cancelled => {
                self.unsettled(elapsed, "monitor cancelled".to_string(), true)
                    .await
            }
        };

        if let Err(e) = settled {
            error!(
                user = %self.ticket.user_id,
                request = %self.ticket.request_id,
                error = %e,
                "Failed to settle reservation"
            );
            self.notifier.send_async(Event::error(ErrorData {
                component: "monitor".to_string(),
                message: format!(
                    "could not settle {} for {}",
                    self.execution_id, self.ticket.user_id
                ),
                error: Some(e.to_string()),
            }));
        }

        self.registry.unregister(&self.ticket.request_id);
    }

    async fn settle(&self, result: ExecutionResult, elapsed: Duration) -> Result<(), RiskError> {
        let user_id = &self.ticket.user_id;
        let mut cooldown = None;

        {
            let mut session = self.risk.session(user_id).await;
            session.release(self.ticket.risk_amount);

            if result.success {
                let outcome = session
                    .record_result(
                        &self.tier,
                        &TradeResult {
                            won: result.won(),
                            pnl: result.pnl,
                            risk_percent: self.ticket.risk_percent,
                        },
                    )
                    .await?;
                cooldown = outcome.cooldown;
            }
        }

        {
            let mut stats = self.stats.lock().await;
            if result.success {
                stats.settled += 1;
                stats.realized_pnl += result.pnl;
                if result.pnl < Decimal::ZERO {
                    stats.losses += 1;
                }
            } else {
                stats.failed += 1;
            }
            if cooldown.is_some() {
                stats.cooldowns_activated += 1;
            }
        }

        if result.success {
            info!(
                user = %user_id,
                signal = %self.ticket.signal_id,
                execution = %self.execution_id,
                pnl = %result.pnl,
                "Execution settled"
            );
        } else {
            warn!(
                user = %user_id,
                signal = %self.ticket.signal_id,
                execution = %self.execution_id,
                message = %result.message,
                "Execution failed"
            );
        }

        self.notifier.send_async(Event::settlement(SettlementData {
            user_id: user_id.clone(),
            signal_id: self.ticket.signal_id.clone(),
            execution_id: self.execution_id.clone(),
            success: result.success,
            pnl: result.pnl,
            balance: result.balance,
            message: result.message,
            elapsed,
        }));

        if let Some(record) = cooldown {
            self.notifier
                .send_async(Event::cooldown_activated(CooldownData {
                    user_id: record.user_id,
                    reason: record.reason,
                    losses: record.loss_amounts,
                    expires_at: record.expires_at,
                }));
        }

        Ok(())
    }

    /// Settles a fire that ended without a result: the slot counts as a
    /// trade, no loss is recorded and nothing is retried.
    async fn unsettled(
        &self,
        waited: Duration,
        reason: String,
        cancelled: bool,
    ) -> Result<(), RiskError> {
        let user_id = &self.ticket.user_id;

        self.risk
            .session(user_id)
            .await
            .commit_unsettled(&self.tier, self.ticket.risk_amount)
            .await?;

        {
            let mut stats = self.stats.lock().await;
            if cancelled {
                stats.monitors_cancelled += 1;
            } else {
                stats.timeouts += 1;
            }
        }

        let data = UnsettledData {
            user_id: user_id.clone(),
            signal_id: self.ticket.signal_id.clone(),
            execution_id: self.execution_id.clone(),
            waited,
            reason,
        };

        if cancelled {
            warn!(
                user = %user_id,
                execution = %self.execution_id,
                "Result monitor cancelled; manual investigation required"
            );
            self.notifier.send_async(Event::monitor_cancelled(data));
        } else {
            error!(
                user = %user_id,
                execution = %self.execution_id,
                reason = %data.reason,
                "Execution timeout; manual investigation required"
            );
            self.notifier.send_async(Event::execution_timeout(data));
        }

        debug!(user = %user_id, request = %self.ticket.request_id, "Monitor finished");
        Ok(())
    }
}
