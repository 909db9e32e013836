use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::Direction;

/// Notification event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A fire request passed every gate and was handed to the backend.
    FireAdmitted,
    /// The backend reported a filled and settled trade.
    ExecutionSettled,
    /// The backend reported the order failed.
    ExecutionFailed,
    /// No result arrived in time.
    ExecutionTimeout,
    /// A result monitor was cancelled before its result arrived.
    MonitorCancelled,
    CooldownActivated,
    EmergencyActivated,
    EmergencyRecovered,
    /// An internal failure worth surfacing.
    Error,
    Startup,
    Shutdown,
    /// Periodic stats overview.
    Overview,
}

impl EventType {
    /// Alerts need a human and go to the alert chat when one is set.
    pub fn is_alert(self) -> bool {
        matches!(
            self,
            EventType::ExecutionTimeout
                | EventType::MonitorCancelled
                | EventType::EmergencyActivated
                | EventType::Error
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::FireAdmitted => write!(f, "fire_admitted"),
            EventType::ExecutionSettled => write!(f, "execution_settled"),
            EventType::ExecutionFailed => write!(f, "execution_failed"),
            EventType::ExecutionTimeout => write!(f, "execution_timeout"),
            EventType::MonitorCancelled => write!(f, "monitor_cancelled"),
            EventType::CooldownActivated => write!(f, "cooldown_activated"),
            EventType::EmergencyActivated => write!(f, "emergency_activated"),
            EventType::EmergencyRecovered => write!(f, "emergency_recovered"),
            EventType::Error => write!(f, "error"),
            EventType::Startup => write!(f, "startup"),
            EventType::Shutdown => write!(f, "shutdown"),
            EventType::Overview => write!(f, "overview"),
        }
    }
}

/// An admitted fire request.
#[derive(Debug, Clone)]
pub struct FireData {
    pub user_id: String,
    pub signal_id: String,
    pub execution_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub risk_percent: Decimal,
    /// Where the risk percent came from ("default", "boosted", "cooldown", ...).
    pub risk_source: String,
}

/// A result reported by the backend.
#[derive(Debug, Clone)]
pub struct SettlementData {
    pub user_id: String,
    pub signal_id: String,
    pub execution_id: String,
    pub success: bool,
    pub pnl: Decimal,
    pub balance: Option<Decimal>,
    pub message: String,
    pub elapsed: Duration,
}

/// A monitor that ended without a backend result.
#[derive(Debug, Clone)]
pub struct UnsettledData {
    pub user_id: String,
    pub signal_id: String,
    pub execution_id: String,
    pub waited: Duration,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CooldownData {
    pub user_id: String,
    pub reason: String,
    pub losses: Vec<Decimal>,
    pub expires_at: DateTime<Utc>,
}

/// Emergency stop activation or escalation.
#[derive(Debug, Clone)]
pub struct EmergencyData {
    /// "system" or the user id.
    pub scope: String,
    pub level: String,
    pub reason: String,
    pub actor: String,
    pub positions_closed: usize,
    pub positions_failed: usize,
    pub closure_error: Option<String>,
    pub auto_recover_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RecoveryData {
    pub scope: String,
    pub level: String,
    pub actor: String,
    pub forced: bool,
}

/// Error details.
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub component: String,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartupData {
    pub version: String,
    pub env: String,
    pub backend: String,
    pub tiers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ShutdownData {
    pub reason: String,
    pub uptime: Duration,
    pub graceful: bool,
}

/// Periodic overview data.
#[derive(Debug, Clone)]
pub struct OverviewData {
    pub uptime: Duration,
    pub fires_admitted: u64,
    pub fires_rejected: u64,
    pub settled: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cooldowns_activated: u64,
    pub emergencies_activated: u64,
    pub active_monitors: usize,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub enum EventData {
    Fire(FireData),
    Settlement(SettlementData),
    Unsettled(UnsettledData),
    Cooldown(CooldownData),
    Emergency(EmergencyData),
    Recovery(RecoveryData),
    Error(ErrorData),
    Startup(StartupData),
    Shutdown(ShutdownData),
    Overview(OverviewData),
}

/// A notification event.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    pub fn new(event_type: EventType, data: EventData) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn fire_admitted(data: FireData) -> Self {
        Self::new(EventType::FireAdmitted, EventData::Fire(data))
    }

    /// Settled or failed, depending on the reported success flag.
    pub fn settlement(data: SettlementData) -> Self {
        let event_type = if data.success {
            EventType::ExecutionSettled
        } else {
            EventType::ExecutionFailed
        };
        Self::new(event_type, EventData::Settlement(data))
    }

    pub fn execution_timeout(data: UnsettledData) -> Self {
        Self::new(EventType::ExecutionTimeout, EventData::Unsettled(data))
    }

    pub fn monitor_cancelled(data: UnsettledData) -> Self {
        Self::new(EventType::MonitorCancelled, EventData::Unsettled(data))
    }

    pub fn cooldown_activated(data: CooldownData) -> Self {
        Self::new(EventType::CooldownActivated, EventData::Cooldown(data))
    }

    pub fn emergency_activated(data: EmergencyData) -> Self {
        Self::new(EventType::EmergencyActivated, EventData::Emergency(data))
    }

    pub fn emergency_recovered(data: RecoveryData) -> Self {
        Self::new(EventType::EmergencyRecovered, EventData::Recovery(data))
    }

    pub fn error(data: ErrorData) -> Self {
        Self::new(EventType::Error, EventData::Error(data))
    }

    pub fn startup(data: StartupData) -> Self {
        Self::new(EventType::Startup, EventData::Startup(data))
    }

    pub fn shutdown(data: ShutdownData) -> Self {
        Self::new(EventType::Shutdown, EventData::Shutdown(data))
    }

    pub fn overview(data: OverviewData) -> Self {
        Self::new(EventType::Overview, EventData::Overview(data))
    }
}

/// Delivers events to people watching the controller.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Sends and waits for delivery.
    async fn send(&self, event: &Event) -> Result<(), NotificationError>;

    /// Queues the event without blocking.
    fn send_async(&self, event: Event);

    /// Returns true if this notifier delivers the given event type.
    fn is_enabled(&self, event_type: EventType) -> bool;

    async fn close(&self) -> Result<(), NotificationError>;
}

/// Notification error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("NotificationError: {message}")]
pub struct NotificationError {
    pub message: String,
}

impl NotificationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fans events out to several notifiers.
pub struct MultiNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait::async_trait]
impl Notifier for MultiNotifier {
    async fn send(&self, event: &Event) -> Result<(), NotificationError> {
        let mut errors = Vec::new();
        for notifier in &self.notifiers {
            if notifier.is_enabled(event.event_type) {
                if let Err(e) = notifier.send(event).await {
                    errors.push(e.message);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::new(errors.join("; ")))
        }
    }

    fn send_async(&self, event: Event) {
        for notifier in &self.notifiers {
            if notifier.is_enabled(event.event_type) {
                notifier.send_async(event.clone());
            }
        }
    }

    fn is_enabled(&self, event_type: EventType) -> bool {
        self.notifiers.iter().any(|n| n.is_enabled(event_type))
    }

    async fn close(&self) -> Result<(), NotificationError> {
        let mut errors = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.close().await {
                errors.push(e.message);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::new(errors.join("; ")))
        }
    }
}

/// Notifier that drops everything.
pub struct NoopNotifier;

impl NoopNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _event: &Event) -> Result<(), NotificationError> {
        Ok(())
    }

    fn send_async(&self, _event: Event) {}

    fn is_enabled(&self, _event_type: EventType) -> bool {
        false
    }

    async fn close(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}

// === Formatting ===

pub fn format_fire(data: &FireData) -> String {
    format!(
        "🎯 *Fire admitted*\n\n\
         User: {}\n\
         Signal: {}\n\
         {} {} #{}\n\
         Size: {}\n\
         Risk: *{}%* ({})\n\
         Execution: `{}`\n\n\
         ⏰ {}",
        data.user_id,
        data.signal_id,
        data.direction,
        data.symbol,
        format_symbol_tag(&data.symbol),
        data.size.normalize(),
        data.risk_percent.normalize(),
        data.risk_source,
        data.execution_id,
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_settlement(data: &SettlementData) -> String {
    let balance = data
        .balance
        .map(|b| format!("\nBalance: ${:.2}", b))
        .unwrap_or_default();

    if data.success {
        let headline = if data.pnl >= Decimal::ZERO {
            "✅ *Trade settled: win*"
        } else {
            "📉 *Trade settled: loss*"
        };
        format!(
            "{}\n\n\
             User: {}\n\
             Signal: {}\n\
             PnL: *${:.2}*{}\n\
             Settled in: {}\n\n\
             ⏰ {}",
            headline,
            data.user_id,
            data.signal_id,
            data.pnl,
            balance,
            format_duration(data.elapsed),
            Utc::now().format("%H:%M:%S UTC")
        )
    } else {
        format!(
            "❌ *Execution failed*\n\n\
             User: {}\n\
             Signal: {}\n\
             Execution: `{}`\n\
             Error: {}\n\n\
             ⏰ {}",
            data.user_id,
            data.signal_id,
            data.execution_id,
            if data.message.is_empty() {
                "unknown error"
            } else {
                &data.message
            },
            Utc::now().format("%H:%M:%S UTC")
        )
    }
}

pub fn format_unsettled(event_type: EventType, data: &UnsettledData) -> String {
    let headline = match event_type {
        EventType::ExecutionTimeout => {
            "⏳ *Execution timeout: manual investigation required*"
        }
        _ => "⚠️ *Result monitor cancelled: manual investigation required*",
    };

    format!(
        "{}\n\n\
         User: {}\n\
         Signal: {}\n\
         Execution: `{}`\n\
         Waited: {}\n\
         Reason: {}\n\n\
         ⏰ {}",
        headline,
        data.user_id,
        data.signal_id,
        data.execution_id,
        format_duration(data.waited),
        data.reason,
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_cooldown(data: &CooldownData) -> String {
    let losses = data
        .losses
        .iter()
        .map(|l| format!("${:.2}", l))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "🧊 *Cooldown activated*\n\n\
         User: {}\n\
         Reason: {}\n\
         Losses: {}\n\
         Until: {}\n\n\
         ⏰ {}",
        data.user_id,
        data.reason,
        losses,
        data.expires_at.format("%Y-%m-%d %H:%M UTC"),
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_emergency(data: &EmergencyData) -> String {
    let recovery = data
        .auto_recover_at
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "manual only".to_string());
    let closures = match &data.closure_error {
        Some(e) => format!("could not list positions: {}", e),
        None => format!(
            "{} closed, {} failed",
            data.positions_closed, data.positions_failed
        ),
    };

    format!(
        "🚨 *Emergency stop: {}*\n\n\
         Scope: {}\n\
         Reason: {}\n\
         By: {}\n\
         Positions: {}\n\
         Auto-recovery: {}\n\n\
         ⏰ {}",
        data.level.to_uppercase(),
        data.scope,
        data.reason,
        data.actor,
        closures,
        recovery,
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_recovery(data: &RecoveryData) -> String {
    let how = if data.forced { "forced" } else { "scheduled" };

    format!(
        "🟢 *Emergency stop recovered*\n\n\
         Scope: {}\n\
         Level: {}\n\
         By: {} ({})\n\n\
         ⏰ {}",
        data.scope,
        data.level,
        data.actor,
        how,
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_error(data: &ErrorData) -> String {
    let error_str = data
        .error
        .as_ref()
        .map(|e| format!("\nError: {}", e))
        .unwrap_or_default();

    format!(
        "⚠️ *Error*\n\n\
         Component: {}\n\
         Message: {}{}\n\n\
         ⏰ {}",
        data.component,
        data.message,
        error_str,
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_startup(data: &StartupData) -> String {
    format!(
        "🤖 *Fire gate started*\n\n\
         Version: {}\n\
         Env: {}\n\
         Backend: {}\n\
         Tiers: {}\n\n\
         ⏰ {}",
        data.version,
        data.env,
        data.backend,
        data.tiers.join(", "),
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_shutdown(data: &ShutdownData) -> String {
    let status = if data.graceful {
        "✅ Graceful"
    } else {
        "⚠️ Forced"
    };

    format!(
        "🛑 *Fire gate stopped*\n\n\
         Reason: {}\n\
         Status: {}\n\
         Uptime: {}\n\n\
         ⏰ {}",
        data.reason,
        status,
        format_duration(data.uptime),
        Utc::now().format("%H:%M:%S UTC")
    )
}

pub fn format_overview(data: &OverviewData) -> String {
    format!(
        "📊 *Overview*\n\n\
         ⏱ Uptime: {}\n\n\
         🎯 Fires admitted: {}\n\
         🚫 Rejected: {}\n\
         ✅ Settled: {}\n\
         ❌ Failed: {}\n\
         ⏳ Timeouts: {}\n\
         🔭 Monitors running: {}\n\n\
         🧊 Cooldowns: {}\n\
         🚨 Emergency stops: {}\n\n\
         💰 Realized PnL: *${:.2}*\n\n\
         ⏰ {}",
        format_duration(data.uptime),
        add_thousand_separators(data.fires_admitted),
        add_thousand_separators(data.fires_rejected),
        data.settled,
        data.failed,
        data.timeouts,
        data.active_monitors,
        data.cooldowns_activated,
        data.emergencies_activated,
        data.realized_pnl,
        Utc::now().format("%H:%M:%S UTC")
    )
}

/// Renders an event as a Telegram Markdown message.
pub fn format_event(event: &Event) -> String {
    match &event.data {
        EventData::Fire(data) => format_fire(data),
        EventData::Settlement(data) => format_settlement(data),
        EventData::Unsettled(data) => format_unsettled(event.event_type, data),
        EventData::Cooldown(data) => format_cooldown(data),
        EventData::Emergency(data) => format_emergency(data),
        EventData::Recovery(data) => format_recovery(data),
        EventData::Error(data) => format_error(data),
        EventData::Startup(data) => format_startup(data),
        EventData::Shutdown(data) => format_shutdown(data),
        EventData::Overview(data) => format_overview(data),
    }
}

// === Helpers ===

/// Symbol as a hashtag ("BTC/USDT" -> "BTC\_USDT").
/// Underscore escaped for Telegram Markdown compatibility
fn format_symbol_tag(symbol: &str) -> String {
    symbol.replace('/', "\\_")
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

fn add_thousand_separators(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
