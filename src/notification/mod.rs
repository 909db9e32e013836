//! Notifications about fires, results, cooldowns and emergency stops.

mod notifier;
mod telegram;

#[cfg(test)]
pub(crate) mod recording;

pub use notifier::{
    CooldownData, EmergencyData, ErrorData, Event, EventData, EventType, FireData, MultiNotifier,
    NoopNotifier, NotificationError, Notifier, OverviewData, RecoveryData, SettlementData,
    ShutdownData, StartupData, UnsettledData, format_event,
};
pub use telegram::{TelegramConfig, TelegramNotifier};
