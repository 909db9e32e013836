//! Domain models shared by the risk engine, emergency controller and gateway.

mod account;
mod emergency;
mod order;
mod rejection;
mod risk;
mod signal;

pub use account::{Account, Actor, Privilege, Surface};
pub use emergency::{
    ClosureOutcome, HistoryAction, HistoryEntry, PositionClosure, SystemEmergency, SystemLevel,
    TriggerKind, UserEmergency, UserLevel,
};
pub use order::{CloseStatus, Direction, ExecutionResult, OrderTicket, Position};
pub use rejection::{RejectCode, Rejection};
pub use risk::{COOLDOWN_LOSS_STREAK, CooldownRecord, RiskMode, RiskProfile, TradeResult};
pub use signal::Signal;
