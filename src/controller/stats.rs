//! Runtime statistics for the controller.

use rust_decimal::Decimal;

/// Runtime statistics for the controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub fires_admitted: u64,
    pub fires_rejected: u64,
    pub settled: u64,
    pub failed: u64,
    /// Settled trades that closed at a loss.
    pub losses: u64,
    pub timeouts: u64,
    pub monitors_cancelled: u64,
    pub cooldowns_activated: u64,
    pub emergencies_activated: u64,
    pub recoveries: u64,
    pub realized_pnl: Decimal,
}
