//! REST execution backend: signed HTTP for orders and positions, WebSocket
//! for fills.

mod client;
mod fills;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use self::client::{Client, ClientConfig};
use self::fills::FillStream;
use super::{BackendError, ExecutionBackend, Result, Submission};
use crate::config::BackendConfig;
use crate::domain::{CloseStatus, Direction, OrderTicket, Position};

/// Execution backend reached over REST, with results streamed back over a
/// WebSocket.
pub struct RestBackend {
    client: Client,
    fills: Arc<FillStream>,
    fills_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest<'a> {
    client_order_id: &'a str,
    user_id: &'a str,
    symbol: &'a str,
    side: &'static str,
    size: String,
    entry_price: String,
    stop_loss: String,
    take_profit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionResponse {
    id: String,
    user_id: String,
    symbol: String,
    side: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct CloseResponse {
    status: String,
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal> {
    value
        .parse()
        .map_err(|e| BackendError::Rejected(format!("invalid {}: {}", field, e)))
}

impl RestBackend {
    /// Creates a new backend from config. The fill stream is not started.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            client: Client::new(ClientConfig::from_backend(config))?,
            fills: Arc::new(FillStream::new(config)),
            fills_task: Mutex::new(None),
        })
    }

    /// Starts reading the fill stream in the background.
    pub async fn start(&self) {
        let mut task = self.fills_task.lock().await;
        if task.is_some() {
            return;
        }

        let fills = Arc::clone(&self.fills);
        *task = Some(tokio::spawn(async move {
            if let Err(e) = fills.run().await {
                error!(error = %e, "fill stream stopped");
            }
        }));
        info!("fill stream started");
    }

    /// Closes the fill stream. Waiting results are abandoned.
    pub async fn shutdown(&self) {
        self.fills.close().await;
        if let Some(task) = self.fills_task.lock().await.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ExecutionBackend for RestBackend {
    fn name(&self) -> &str {
        "rest"
    }

    async fn is_available(&self) -> bool {
        self.fills.is_connected()
    }

    async fn account_balance(&self, user_id: &str) -> Result<Decimal> {
        let endpoint = format!("/v1/accounts/{}/balance", urlencoding::encode(user_id));
        let resp: BalanceResponse = self.client.get(&endpoint, Vec::new()).await?;
        parse_decimal("balance", &resp.balance)
    }

    async fn submit(&self, ticket: &OrderTicket) -> Result<Submission> {
        if !self.fills.is_connected() {
            return Err(BackendError::Unavailable("fill stream disconnected".into()));
        }

        // register before posting so a fast fill is not missed
        let result = self.fills.register(&ticket.request_id).await;

        let request = OrderRequest {
            client_order_id: &ticket.request_id,
            user_id: &ticket.user_id,
            symbol: &ticket.symbol,
            side: match ticket.direction {
                Direction::Long => "BUY",
                Direction::Short => "SELL",
            },
            size: ticket.size.to_string(),
            entry_price: ticket.entry_price.to_string(),
            stop_loss: ticket.stop_loss.to_string(),
            take_profit: ticket.take_profit.map(|tp| tp.to_string()),
        };

        match self.client.post::<_, OrderResponse>("/v1/orders", &request).await {
            Ok(resp) => Ok(Submission {
                execution_id: resp.execution_id,
                result,
            }),
            Err(e) => {
                self.fills.forget(&ticket.request_id).await;
                warn!(request = %ticket.request_id, error = %e, "order submission failed");
                Err(match e {
                    BackendError::Request(e) => BackendError::Unavailable(e.to_string()),
                    other => other,
                })
            }
        }
    }

    async fn open_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>> {
        let params = user_id
            .map(|u| vec![("userId".to_string(), u.to_string())])
            .unwrap_or_default();
        let resp: Vec<PositionResponse> = self.client.get("/v1/positions", params).await?;

        resp.into_iter()
            .map(|p| {
                Ok(Position {
                    direction: match p.side.as_str() {
                        "BUY" | "LONG" => Direction::Long,
                        _ => Direction::Short,
                    },
                    size: parse_decimal("size", &p.size)?,
                    id: p.id,
                    user_id: p.user_id,
                    symbol: p.symbol,
                })
            })
            .collect()
    }

    async fn close_position(&self, position: &Position) -> Result<CloseStatus> {
        let endpoint = format!("/v1/positions/{}", urlencoding::encode(&position.id));
        match self.client.delete::<CloseResponse>(&endpoint).await {
            Ok(resp) if resp.status == "already_closed" => Ok(CloseStatus::AlreadyClosed),
            Ok(_) => Ok(CloseStatus::Closed),
            Err(BackendError::Api { code: 404, .. }) => Ok(CloseStatus::AlreadyClosed),
            Err(e) => Err(e),
        }
    }
}
