//! Trade signal domain model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Signal is a previously issued trade idea that users may fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique identifier for this signal.
    pub id: String,
    /// Instrument the signal is for.
    pub symbol: String,
    pub direction: Direction,
    /// Suggested entry price.
    pub entry_price: Decimal,
    /// Price at which the trade is abandoned at a loss.
    pub stop_loss: Decimal,
    /// Optional profit target.
    pub take_profit: Option<Decimal>,
    /// When this signal was issued.
    pub issued_at: DateTime<Utc>,
    /// When this signal stops being executable.
    pub valid_until: DateTime<Utc>,
}

impl Signal {
    /// Returns true if the signal's validity window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    /// Price distance between entry and stop.
    pub fn stop_distance(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Returns true if the stop sits on the losing side of the entry.
    pub fn has_valid_stop(&self) -> bool {
        match self.direction {
            Direction::Long => self.stop_loss < self.entry_price,
            Direction::Short => self.stop_loss > self.entry_price,
        }
    }
}
