//! WebSocket stream of execution results.
//!
//! Each submitted order registers a oneshot sender under its request id
//! before the order is posted. Incoming fill messages are routed to the
//! matching sender. When the stream is lost for good every waiting sender is
//! dropped, which the receivers observe as a lost result.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use super::client::sign;
use crate::config::BackendConfig;
use crate::domain::ExecutionResult;

/// Default interval to send ping messages.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Default delay before reconnecting.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Endpoint name the subscription signature is computed over.
const FILLS_ENDPOINT: &str = "/ws/fills";

struct FillStreamConfig {
    url: String,
    api_key: String,
    api_secret: String,
    ping_interval: Duration,
    reconnect_delay: Duration,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;
type WsError = tokio_tungstenite::tungstenite::Error;

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<ExecutionResult>>>>;

/// Private fill stream of the execution backend.
pub struct FillStream {
    config: FillStreamConfig,
    sink: Arc<Mutex<Option<WsSink>>>,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl FillStream {
    pub fn new(config: &BackendConfig) -> Self {
        let or_default = |d: Duration, default: Duration| if d.is_zero() { default } else { d };

        Self {
            config: FillStreamConfig {
                url: config.fills_url.clone(),
                api_key: config.api_key.clone(),
                api_secret: config.api_secret.clone(),
                ping_interval: or_default(config.ping_interval, DEFAULT_PING_INTERVAL),
                reconnect_delay: or_default(config.reconnect_delay, DEFAULT_RECONNECT_DELAY),
            },
            sink: Arc::new(Mutex::new(None)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers interest in the result of `request_id`.
    ///
    /// Registrations whose receiver is gone (timed out or cancelled
    /// monitors) are dropped on the way.
    pub async fn register(&self, request_id: &str) -> oneshot::Receiver<ExecutionResult> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        waiters.retain(|_, tx| !tx.is_closed());
        waiters.insert(request_id.to_string(), tx);
        rx
    }

    /// Number of registrations still waiting for a fill.
    #[cfg(test)]
    pub async fn waiting(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Drops a registration whose order never reached the backend.
    pub async fn forget(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }

    /// Connects, subscribes and reads until closed or reconnection fails.
    pub async fn run(&self) -> Result<(), WsError> {
        let stream = self.connect().await?;
        self.send_subscribe_message().await?;

        let ping_handle = self.spawn_ping_loop();
        self.read_loop(stream).await;
        ping_handle.abort();

        Ok(())
    }

    async fn connect(&self) -> Result<WsSource, WsError> {
        info!(url = %self.config.url, "connecting to fill stream");

        let (ws_stream, _response) = connect_async(&self.config.url).await.map_err(|e| {
            error!(error = %e, url = %self.config.url, "failed to connect to fill stream");
            e
        })?;

        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        info!("fill stream connected");

        Ok(stream)
    }

    /// Closes the stream and abandons every waiting result.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);

        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                error!(error = %e, "failed to close fill stream");
            }
        }
        drop(guard);

        self.abandon_waiters().await;
        info!("fill stream closed");
    }

    async fn abandon_waiters(&self) {
        let mut waiters = self.waiters.lock().await;
        if !waiters.is_empty() {
            warn!(count = waiters.len(), "abandoning pending execution results");
        }
        waiters.clear();
    }

    async fn reconnect(&self) -> Result<WsSource, WsError> {
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                let _ = sink.close().await;
            }
        }

        if self.is_closed() {
            return Err(WsError::AlreadyClosed);
        }

        info!(delay = ?self.config.reconnect_delay, "reconnecting fill stream");
        tokio::time::sleep(self.config.reconnect_delay).await;

        if self.is_closed() {
            return Err(WsError::AlreadyClosed);
        }

        let stream = self.connect().await?;
        self.send_subscribe_message().await?;

        Ok(stream)
    }

    async fn try_reconnect(&self) -> Option<WsSource> {
        match self.reconnect().await {
            Ok(new_stream) => Some(new_stream),
            Err(e) => {
                error!(error = %e, "fill stream reconnect failed");
                None
            }
        }
    }

    /// Sends the signed subscription for the private fills channel.
    async fn send_subscribe_message(&self) -> Result<(), WsError> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = sign(
            &self.config.api_secret,
            &Method::GET,
            FILLS_ENDPOINT,
            timestamp,
            "",
        )
        .map_err(|e| WsError::Io(std::io::Error::other(e.to_string())))?;

        let sub_msg = json!({
            "event": "subscribe",
            "channel": ["fills"],
            "params": {
                "key": self.config.api_key,
                "signTimestamp": timestamp,
                "signature": signature,
                "signatureMethod": "hmacSHA256",
            }
        });

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(WsError::AlreadyClosed)?;
        sink.send(WsMessage::Text(sub_msg.to_string().into()))
            .await
            .map_err(|e| {
                error!(error = %e, "failed to subscribe to fills");
                e
            })?;

        info!("subscribed to fills");
        Ok(())
    }

    /// Routes fill messages to their waiters, reconnecting on recoverable errors.
    async fn read_loop(&self, mut stream: WsSource) {
        loop {
            if self.is_closed() {
                break;
            }

            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    for result in parse_message(&text) {
                        self.dispatch(result).await;
                    }
                }
                Some(Ok(WsMessage::Close(_))) => {
                    info!("fill stream closed by server");
                    match self.try_reconnect().await {
                        Some(new_stream) => stream = new_stream,
                        None => break,
                    }
                }
                Some(Ok(_)) => {
                    // Ignore other message types (Ping, Pong, Binary)
                }
                Some(Err(e)) => {
                    if should_reconnect(&e) {
                        error!(error = %e, "fill stream error, attempting reconnect");
                        match self.try_reconnect().await {
                            Some(new_stream) => stream = new_stream,
                            None => break,
                        }
                    } else {
                        error!(error = %e, "fill stream error (non-recoverable)");
                        break;
                    }
                }
                None => {
                    info!("fill stream ended");
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.close().await;
        }
        drop(guard);

        self.abandon_waiters().await;
    }

    async fn dispatch(&self, result: ExecutionResult) {
        let waiter = self.waiters.lock().await.remove(&result.request_id);
        match waiter {
            Some(tx) => {
                let request_id = result.request_id.clone();
                if tx.send(result).is_err() {
                    debug!(request = %request_id, "result receiver already gone");
                }
            }
            None => {
                debug!(request = %result.request_id, "fill for unknown request");
            }
        }
    }

    fn spawn_ping_loop(&self) -> tokio::task::JoinHandle<()> {
        let ping_interval = self.config.ping_interval;
        let sink = Arc::clone(&self.sink);
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);

            loop {
                interval.tick().await;

                if closed.load(Ordering::SeqCst) {
                    break;
                }

                let mut guard = sink.lock().await;
                let Some(sink_ref) = guard.as_mut() else {
                    continue;
                };

                let msg = WsMessage::Text(json!({"event": "ping"}).to_string().into());
                if let Err(e) = sink_ref.send(msg).await {
                    warn!(error = %e, "ping failed");
                } else {
                    debug!("ping sent");
                }
            }
        })
    }
}

/// Returns true if the error warrants a reconnection attempt.
fn should_reconnect(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Tls(_)
            | WsError::Http(_)
    )
}

/// Fill stream message.
/// Format: {"channel":"fills","data":[{"requestId":"..","executionId":"..","success":true,"pnl":"12.5",...}]}
#[derive(Debug, Deserialize)]
struct FillMessage {
    channel: Option<String>,
    event: Option<String>,
    data: Option<Vec<FillData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillData {
    request_id: String,
    execution_id: String,
    success: bool,
    pnl: Option<String>,
    balance: Option<String>,
    equity: Option<String>,
    message: Option<String>,
    ts: Option<i64>,
}

/// Parses a WebSocket message into execution results.
/// Returns nothing for control messages (pong, subscribe confirmation, etc.)
fn parse_message(data: &str) -> Vec<ExecutionResult> {
    let Ok(msg) = serde_json::from_str::<FillMessage>(data) else {
        debug!("unparseable fill stream message");
        return Vec::new();
    };

    if let Some(event) = &msg.event {
        debug!(event = %event, "control message");
        return Vec::new();
    }
    if msg.channel.as_deref() != Some("fills") {
        return Vec::new();
    }

    msg.data
        .unwrap_or_default()
        .into_iter()
        .map(|fill| ExecutionResult {
            request_id: fill.request_id,
            execution_id: fill.execution_id,
            success: fill.success,
            pnl: parse_decimal(fill.pnl.as_deref()).unwrap_or(Decimal::ZERO),
            balance: parse_decimal(fill.balance.as_deref()),
            equity: parse_decimal(fill.equity.as_deref()),
            message: fill.message.unwrap_or_default(),
            timestamp: fill
                .ts
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or_else(Utc::now),
        })
        .collect()
}

fn parse_decimal(value: Option<&str>) -> Option<Decimal> {
    value.and_then(|v| Decimal::from_str(v).ok())
}
