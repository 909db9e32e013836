//! Core business entities exchanged with the execution backend.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction represents the side of a position (long or short).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Long profits when the price rises.
    Long,
    /// Short profits when the price falls.
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// OrderTicket is an admitted fire request with its concrete parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTicket {
    /// RequestID is assigned by the gateway and echoed back by the backend.
    pub request_id: String,
    /// UserID owns the account the order is placed on.
    pub user_id: String,
    /// SignalID references the signal being executed.
    pub signal_id: String,
    /// Symbol is the instrument (e.g., "EURUSD", "BTC/USDT").
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    /// Size is the position size in instrument units.
    pub size: Decimal,
    /// RiskPercent is the share of balance put at risk.
    pub risk_percent: Decimal,
    /// RiskAmount is the loss if the stop is hit.
    pub risk_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// ExecutionResult is the backend's final report for one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// RequestID matches the OrderTicket it settles.
    pub request_id: String,
    pub success: bool,
    /// ExecutionID is the backend-assigned identifier.
    pub execution_id: String,
    /// Pnl is the realized profit or loss, zero if the order did not fill.
    pub pnl: Decimal,
    pub balance: Option<Decimal>,
    pub equity: Option<Decimal>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn won(&self) -> bool {
        self.pnl >= Decimal::ZERO
    }
}

/// Position is an open position held at the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
}

/// CloseStatus reports what a close instruction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    /// The position was already closed; closing is idempotent.
    AlreadyClosed,
}
