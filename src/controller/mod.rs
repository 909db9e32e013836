//! Risk-gated trade execution controller.
//!
//! Coordinates all components: risk engine, emergency stops, fire gateway,
//! storage, execution backend and notifications. Every inbound operation of
//! the command layer lands here.

mod config;
mod error;
mod stats;

pub use config::ControllerConfig;
pub use error::ControllerError;
pub use stats::Stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, RestBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::confirm::ConfirmationToken;
use crate::domain::{
    Account, Actor, RiskMode, RiskProfile, Surface, SystemEmergency, SystemLevel, TriggerKind,
    UserEmergency, UserLevel,
};
use crate::emergency::{
    EmergencyController, Scope, StopPrompt, SystemStatus, SystemStopPrompt, UserStopStatus,
};
use crate::gateway::{FireAck, FireGateway, SignalBook};
use crate::notification::{
    EmergencyData, ErrorData, Event, MultiNotifier, NoopNotifier, Notifier, OverviewData,
    RecoveryData, ShutdownData, StartupData, TelegramConfig, TelegramNotifier,
};
use crate::risk::{ModePreview, RiskEngine, RiskStatus, TierTable};
use crate::storage::{MemoryStore, SqliteStore, SqliteStoreConfig, StateStore};

const DEFAULT_OVERVIEW_INTERVAL: Duration = Duration::from_secs(3600);
const MONITOR_DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Collaborators the controller is built around.
pub struct Components {
    pub store: Arc<dyn StateStore>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// What one maintenance sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub cooldowns_expired: usize,
    pub confirmations_lapsed: usize,
    pub emergencies_recovered: usize,
    pub signals_expired: usize,
}

/// Main controller that coordinates all components.
pub struct Controller {
    cfg: Config,
    store: Arc<dyn StateStore>,
    backend: Arc<dyn ExecutionBackend>,
    rest: Option<Arc<RestBackend>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,

    risk: Arc<RiskEngine>,
    emergency: Arc<EmergencyController>,
    gateway: FireGateway,
    signals: Arc<SignalBook>,

    // Runtime state
    version: String,
    build_time: String,
    started_at: Mutex<Option<Instant>>,
    running: Mutex<bool>,
    stats: Arc<Mutex<Stats>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a controller around the given collaborators.
    pub async fn new(cfg: ControllerConfig, components: Components) -> Result<Self, ControllerError> {
        let app = cfg.app_config;
        let Components {
            store,
            backend,
            notifier,
            clock,
        } = components;

        let table = TierTable::from_config(&app)?;
        let risk = Arc::new(RiskEngine::new(
            table,
            store.clone(),
            clock.clone(),
            app.confirmation_ttl(),
        ));
        let emergency = Arc::new(
            EmergencyController::load(
                store.clone(),
                clock.clone(),
                app.emergency_or_default(),
                backend.clone(),
                app.confirmation_ttl(),
            )
            .await?,
        );

        let signals = Arc::new(SignalBook::new());
        let stats = Arc::new(Mutex::new(Stats::default()));
        let gateway = FireGateway::new(
            risk.clone(),
            emergency.clone(),
            backend.clone(),
            signals.clone(),
            notifier.clone(),
            stats.clone(),
            clock.clone(),
            app.result_timeout(),
        );

        Ok(Self {
            cfg: app,
            store,
            backend,
            rest: None,
            notifier,
            clock,
            risk,
            emergency,
            gateway,
            signals,
            version: cfg.version,
            build_time: cfg.build_time,
            started_at: Mutex::new(None),
            running: Mutex::new(false),
            stats,
            shutdown: CancellationToken::new(),
        })
    }

    /// Loads the config file and wires the production components.
    pub async fn from_config_path(path: &str) -> Result<Self, ControllerError> {
        let cfg = Config::load(path)?;
        Self::from_config(ControllerConfig::new(cfg)).await
    }

    /// Wires SQLite (or in-memory) storage, the REST backend and Telegram.
    pub async fn from_config(cfg: ControllerConfig) -> Result<Self, ControllerError> {
        let app = &cfg.app_config;

        let store: Arc<dyn StateStore> = match app.storage.as_ref().and_then(|s| s.path.clone()) {
            Some(path) => {
                let defaults = SqliteStoreConfig::default();
                let max_connections = app
                    .storage
                    .as_ref()
                    .and_then(|s| s.max_connections)
                    .unwrap_or(defaults.max_connections);
                info!(path = %path, "Using SQLite state store");
                Arc::new(
                    SqliteStore::new(SqliteStoreConfig {
                        path,
                        max_connections,
                    })
                    .await?,
                )
            }
            None => {
                warn!("No storage path configured; state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        let backend_cfg = app
            .execution
            .as_ref()
            .and_then(|e| e.backend.as_ref())
            .ok_or_else(|| ConfigError::Validation("execution.backend is required".into()))?;
        let rest = Arc::new(RestBackend::from_config(backend_cfg)?);

        let notifier = build_notifier(app);

        let mut controller = Self::new(
            cfg,
            Components {
                store,
                backend: rest.clone(),
                notifier,
                clock: Arc::new(SystemClock),
            },
        )
        .await?;
        controller.rest = Some(rest);

        Ok(controller)
    }

    /// Starts background work and runs the sweep loop until stopped.
    pub async fn start(&self) -> Result<(), ControllerError> {
        {
            let mut running = self.running.lock().await;
            if *running {
                return Err(ControllerError::AlreadyRunning);
            }
            *running = true;
        }

        {
            let mut started_at = self.started_at.lock().await;
            *started_at = Some(Instant::now());
        }

        if let Some(ref rest) = self.rest {
            rest.start().await;
        }

        let tiers: Vec<String> = self
            .risk
            .table()
            .await
            .names()
            .into_iter()
            .map(String::from)
            .collect();

        info!(
            version = %self.version,
            build_time = %self.build_time,
            env = %self.cfg.app.env,
            backend = %self.backend.name(),
            tiers = ?tiers,
            "Starting fire gate controller"
        );

        self.send_notification(Event::startup(StartupData {
            version: self.version.clone(),
            env: self.cfg.app.env.clone(),
            backend: self.backend.name().to_string(),
            tiers,
        }))
        .await;

        self.run_main_loop().await
    }

    /// Gracefully stops the controller.
    ///
    /// Running monitors are cancelled; their trades stay counted and are
    /// flagged for investigation.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        info!("Stopping controller...");
        self.shutdown.cancel();

        let monitors = self.gateway.monitors();
        let in_flight = monitors.active_count();
        monitors.shutdown();
        if !monitors.wait_idle(MONITOR_DRAIN_LIMIT).await {
            warn!(remaining = monitors.active_count(), "Monitors still running at shutdown");
        } else if in_flight > 0 {
            info!(cancelled = in_flight, "Result monitors cancelled");
        }

        if let Some(ref rest) = self.rest {
            rest.shutdown().await;
        }

        let uptime = self.uptime().await;

        self.send_notification(Event::shutdown(ShutdownData {
            reason: "graceful shutdown".to_string(),
            uptime,
            graceful: true,
        }))
        .await;

        if let Err(e) = self.notifier.close().await {
            debug!(error = %e, "Failed to close notifier");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close state store");
        }

        info!(uptime = ?uptime, "Controller stopped");

        Ok(())
    }

    /// Returns a copy of the current statistics.
    pub async fn stats(&self) -> Stats {
        self.stats.lock().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    pub async fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .await
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Signal book fire requests are resolved against.
    pub fn signals(&self) -> &SignalBook {
        &self.signals
    }

    pub fn active_monitors(&self) -> usize {
        self.gateway.monitors().active_count()
    }

    // === Risk ===

    pub async fn get_risk_status(&self, account: &Account) -> Result<RiskStatus, ControllerError> {
        Ok(self.risk.status(account).await?)
    }

    /// First phase of a risk mode change.
    pub async fn preview_risk_mode(
        &self,
        account: &Account,
        mode: RiskMode,
    ) -> Result<ModePreview, ControllerError> {
        Ok(self.risk.preview_mode(account, mode).await?)
    }

    /// Second phase of a risk mode change.
    pub async fn confirm_risk_mode(
        &self,
        account: &Account,
        mode: RiskMode,
        token: &ConfirmationToken,
    ) -> Result<RiskProfile, ControllerError> {
        Ok(self.risk.confirm_mode(account, mode, token).await?)
    }

    /// Ends a user's cooldown early. Requires operator privilege.
    pub async fn override_cooldown(
        &self,
        actor: &Actor,
        user_id: &str,
    ) -> Result<bool, ControllerError> {
        Ok(self.risk.override_cooldown(actor, user_id).await?)
    }

    /// Replaces the tier table. Requires admin privilege.
    pub async fn reload_tiers(&self, actor: &Actor, table: TierTable) -> Result<u64, ControllerError> {
        Ok(self.risk.reload_table(actor, table).await?)
    }

    // === Fire ===

    pub async fn fire(
        &self,
        account: &Account,
        signal_id: &str,
        requested: Option<RiskMode>,
    ) -> Result<FireAck, ControllerError> {
        Ok(self.gateway.fire(account, signal_id, requested).await?)
    }

    /// Lets a manual trading surface ask whether the user may trade.
    /// A refusal comes back as [`ControllerError::Rejected`].
    pub async fn trading_allowed(
        &self,
        user_id: &str,
        surface: Surface,
    ) -> Result<(), ControllerError> {
        match self.emergency.check(user_id, surface).await? {
            Some(rejection) => Err(rejection.into()),
            None => Ok(()),
        }
    }

    // === Emergency stops ===

    pub async fn request_user_stop(
        &self,
        user_id: &str,
        level: UserLevel,
        reason: &str,
    ) -> Result<StopPrompt, ControllerError> {
        Ok(self.emergency.request_user_stop(user_id, level, reason).await?)
    }

    pub async fn request_system_stop(
        &self,
        actor: &Actor,
        level: SystemLevel,
        reason: &str,
    ) -> Result<SystemStopPrompt, ControllerError> {
        Ok(self.emergency.request_system_stop(actor, level, reason).await?)
    }

    /// Applies a confirmed user stop. An account lock also cancels the
    /// user's running result monitors.
    pub async fn confirm_user_stop(
        &self,
        user_id: &str,
        token: &ConfirmationToken,
    ) -> Result<UserEmergency, ControllerError> {
        let state = self.emergency.confirm_user_stop(user_id, token).await?;

        if state.level == UserLevel::AccountLock {
            let cancelled = self.gateway.monitors().cancel_user(user_id);
            if cancelled > 0 {
                warn!(user = %user_id, cancelled, "Result monitors cancelled by account lock");
            }
        }

        self.stats.lock().await.emergencies_activated += 1;
        self.notifier.send_async(Event::emergency_activated(EmergencyData {
            scope: user_id.to_string(),
            level: state.level.to_string(),
            reason: state.reason.clone(),
            actor: user_id.to_string(),
            positions_closed: state.closures.iter().filter(|c| !c.failed()).count(),
            positions_failed: state.closures.iter().filter(|c| c.failed()).count(),
            closure_error: state.closure_error.clone(),
            auto_recover_at: state.auto_recover_at,
        }));

        Ok(state)
    }

    pub async fn confirm_system_stop(
        &self,
        actor: &Actor,
        token: &ConfirmationToken,
    ) -> Result<SystemEmergency, ControllerError> {
        let state = self.emergency.confirm_system_stop(actor, token).await?;
        self.system_stop_installed(&state).await;
        Ok(state)
    }

    /// Installs a system stop without a confirmation step, for automated
    /// callers.
    pub async fn trigger_system_stop(
        &self,
        kind: TriggerKind,
        level: SystemLevel,
        actor: &Actor,
        reason: &str,
    ) -> Result<SystemEmergency, ControllerError> {
        let state = self
            .emergency
            .system()
            .trigger(kind, level, actor, reason)
            .await?;
        self.system_stop_installed(&state).await;
        Ok(state)
    }

    async fn system_stop_installed(&self, state: &SystemEmergency) {
        self.stats.lock().await.emergencies_activated += 1;
        self.notifier.send_async(Event::emergency_activated(EmergencyData {
            scope: "system".to_string(),
            level: state.level.to_string(),
            reason: state.reason.clone(),
            actor: state.actor.id.clone(),
            positions_closed: state.closures.iter().filter(|c| !c.failed()).count(),
            positions_failed: state.failed_closures().count(),
            closure_error: state.closure_error.clone(),
            auto_recover_at: state.auto_recover_at,
        }));
    }

    /// Discards a pending stop request of either scope.
    pub async fn cancel_stop(&self, token: &ConfirmationToken) -> Result<Scope, ControllerError> {
        Ok(self.emergency.cancel(token).await?)
    }

    pub fn system_emergency_status(&self) -> SystemStatus {
        self.emergency.system().status()
    }

    pub async fn user_emergency_status(
        &self,
        user_id: &str,
    ) -> Result<UserStopStatus, ControllerError> {
        Ok(self.emergency.users().status(user_id).await?)
    }

    /// Lifts the system stop. A forced recovery also cancels every running
    /// result monitor.
    pub async fn recover_system(
        &self,
        actor: &Actor,
        force: bool,
    ) -> Result<SystemEmergency, ControllerError> {
        let state = self.emergency.system().recover(actor, force).await?;

        if force {
            let cancelled = self.gateway.monitors().cancel_all();
            if cancelled > 0 {
                warn!(cancelled, "Result monitors cancelled by forced recovery");
            }
        }

        self.stats.lock().await.recoveries += 1;
        self.notifier.send_async(Event::emergency_recovered(RecoveryData {
            scope: "system".to_string(),
            level: state.level.to_string(),
            actor: actor.id.clone(),
            forced: force,
        }));

        Ok(state)
    }

    pub async fn recover_user(
        &self,
        user_id: &str,
        actor: &Actor,
        force: bool,
    ) -> Result<UserEmergency, ControllerError> {
        let state = self.emergency.users().recover(user_id, actor, force).await?;

        self.stats.lock().await.recoveries += 1;
        self.notifier.send_async(Event::emergency_recovered(RecoveryData {
            scope: user_id.to_string(),
            level: state.level.to_string(),
            actor: actor.id.clone(),
            forced: force,
        }));

        Ok(state)
    }

    // === Maintenance ===

    /// Expires cooldowns, lapsed confirmations and signals, and formally
    /// recovers stops whose auto-recovery time has passed.
    pub async fn sweep(&self) -> Result<SweepReport, ControllerError> {
        let risk = self.risk.sweep().await?;
        let emergency = self.emergency.sweep().await?;
        let signals_expired = self.signals.purge_expired(self.clock.now()).await;

        if let Some(ref state) = emergency.system_recovered {
            self.notifier.send_async(Event::emergency_recovered(RecoveryData {
                scope: "system".to_string(),
                level: state.level.to_string(),
                actor: Actor::system().id,
                forced: false,
            }));
        }
        for state in &emergency.users_recovered {
            self.notifier.send_async(Event::emergency_recovered(RecoveryData {
                scope: state.user_id.clone(),
                level: state.level.to_string(),
                actor: Actor::system().id,
                forced: false,
            }));
        }

        let report = SweepReport {
            cooldowns_expired: risk.cooldowns_expired,
            confirmations_lapsed: risk.previews_lapsed + emergency.confirmations_lapsed,
            emergencies_recovered: emergency.users_recovered.len()
                + usize::from(emergency.system_recovered.is_some()),
            signals_expired,
        };
        self.stats.lock().await.recoveries += report.emergencies_recovered as u64;

        if report != SweepReport::default() {
            debug!(
                cooldowns = report.cooldowns_expired,
                confirmations = report.confirmations_lapsed,
                emergencies = report.emergencies_recovered,
                signals = report.signals_expired,
                "Sweep finished"
            );
        }

        Ok(report)
    }

    /// Sweep and overview loop.
    async fn run_main_loop(&self) -> Result<(), ControllerError> {
        let sweep_interval = self.cfg.sweep_interval_or_default();
        let mut sweep_timer = tokio::time::interval(sweep_interval);

        // Overview interval from config or default 1 hour
        let overview_interval = self
            .cfg
            .notification
            .as_ref()
            .and_then(|n| n.telegram.as_ref())
            .map(|t| t.overview_interval)
            .filter(|d| d.as_secs() > 0)
            .unwrap_or(DEFAULT_OVERVIEW_INTERVAL);
        let mut overview_timer = tokio::time::interval(overview_interval);
        // skip the immediate first tick
        overview_timer.tick().await;

        info!(
            sweep_interval = ?sweep_interval,
            overview_interval = ?overview_interval,
            result_timeout = ?self.cfg.result_timeout(),
            "Starting sweep loop"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                        self.send_notification(Event::error(ErrorData {
                            component: "sweep".to_string(),
                            message: "maintenance sweep failed".to_string(),
                            error: Some(e.to_string()),
                        }))
                        .await;
                    }
                }
                _ = overview_timer.tick() => {
                    self.send_overview().await;
                }
            }
        }

        Ok(())
    }

    /// Sends a notification event and waits for delivery.
    async fn send_notification(&self, event: Event) {
        if let Err(e) = self.notifier.send(&event).await {
            debug!(
                event_type = %event.event_type,
                error = %e,
                "Failed to send notification"
            );
        }
    }

    /// Sends a periodic overview notification with current stats.
    async fn send_overview(&self) {
        let stats = self.stats().await;
        let uptime = self.uptime().await;

        self.send_notification(Event::overview(OverviewData {
            uptime,
            fires_admitted: stats.fires_admitted,
            fires_rejected: stats.fires_rejected,
            settled: stats.settled,
            failed: stats.failed,
            timeouts: stats.timeouts,
            cooldowns_activated: stats.cooldowns_activated,
            emergencies_activated: stats.emergencies_activated,
            active_monitors: self.active_monitors(),
            realized_pnl: stats.realized_pnl,
        }))
        .await;
    }
}

/// Builds the notifier chain from config; falls back to a no-op.
fn build_notifier(cfg: &Config) -> Arc<dyn Notifier> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

    if let Some(telegram) = cfg.notification.as_ref().and_then(|n| n.telegram.as_ref()) {
        if telegram.enabled && !telegram.bot_token.is_empty() && !telegram.chat_id.is_empty() {
            let mut telegram_config =
                TelegramConfig::new(telegram.bot_token.clone(), telegram.chat_id.clone());
            if !telegram.alert_chat_id.is_empty() {
                telegram_config = telegram_config.with_alert_chat_id(telegram.alert_chat_id.clone());
            }
            telegram_config.notify_executions = telegram.notify_executions;
            telegram_config.notify_cooldowns = telegram.notify_cooldowns;
            telegram_config.notify_emergencies = telegram.notify_emergencies;
            telegram_config.notify_overview = telegram.notify_overview;

            match TelegramNotifier::new(telegram_config) {
                Ok(notifier) => {
                    notifiers.push(Arc::new(notifier));
                    info!("Telegram notifier created");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create Telegram notifier");
                }
            }
        }
    }

    if notifiers.is_empty() {
        Arc::new(NoopNotifier::new())
    } else {
        Arc::new(MultiNotifier::new(notifiers))
    }
}
