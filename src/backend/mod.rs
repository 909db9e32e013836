//! Execution backend abstractions and implementations.

mod rest;

#[cfg(test)]
pub(crate) mod mock;

pub use rest::RestBackend;

use crate::domain::{CloseStatus, ExecutionResult, OrderTicket, Position};
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::oneshot;

/// Execution backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend cannot take requests right now.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the request.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// API error from the backend.
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// HTTP transport error.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Malformed response payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// An accepted order: its backend id and the channel its single result
/// arrives on. The sender is dropped without a value if the backend loses
/// track of the order.
#[derive(Debug)]
pub struct Submission {
    pub execution_id: String,
    pub result: oneshot::Receiver<ExecutionResult>,
}

/// ExecutionBackend defines the interface of the downstream component that
/// places orders with a broker and reports fills.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Name returns the identifier of this backend.
    fn name(&self) -> &str;

    /// IsAvailable returns true if the backend is reachable and accepting orders.
    async fn is_available(&self) -> bool;

    /// AccountBalance returns the user's current account balance.
    async fn account_balance(&self, user_id: &str) -> Result<Decimal>;

    /// Submit places an order. Returns once the backend has accepted it;
    /// the outcome is delivered later through the submission's channel.
    /// Returns Unavailable if the order could not be handed over at all.
    async fn submit(&self, ticket: &OrderTicket) -> Result<Submission>;

    /// OpenPositions lists open positions, for one user or for all users.
    async fn open_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>>;

    /// ClosePosition instructs a position to close.
    /// Closing an already closed position is a no-op that reports AlreadyClosed.
    async fn close_position(&self, position: &Position) -> Result<CloseStatus>;
}
