use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

use crate::notification::{Event, EventType, NotificationError, Notifier, format_event};

const TELEGRAM_API_URL: &str = "https://api.telegram.org/bot";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_LENGTH: usize = 4096;
const ASYNC_QUEUE_SIZE: usize = 100;

/// Telegram notifier settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token from BotFather.
    pub bot_token: String,
    /// Chat receiving regular notifications.
    pub chat_id: String,
    /// Chat receiving alerts (timeouts, cancelled monitors, emergency stops).
    pub alert_chat_id: Option<String>,
    pub notify_executions: bool,
    pub notify_cooldowns: bool,
    pub notify_emergencies: bool,
    pub notify_overview: bool,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            alert_chat_id: None,
            notify_executions: true,
            notify_cooldowns: true,
            notify_emergencies: true,
            notify_overview: true,
        }
    }

    pub fn with_alert_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.alert_chat_id = Some(chat_id.into());
        self
    }

    /// Returns true if events of this type should be delivered.
    ///
    /// Timeouts and cancelled monitors always go out: each one needs a human
    /// to reconcile the order with the broker.
    pub fn is_enabled(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Startup
            | EventType::Shutdown
            | EventType::ExecutionTimeout
            | EventType::MonitorCancelled
            | EventType::Error => true,
            EventType::FireAdmitted | EventType::ExecutionSettled | EventType::ExecutionFailed => {
                self.notify_executions
            }
            EventType::CooldownActivated => self.notify_cooldowns,
            EventType::EmergencyActivated | EventType::EmergencyRecovered => {
                self.notify_emergencies
            }
            EventType::Overview => self.notify_overview,
        }
    }

    /// Chat an event of this type is delivered to.
    pub fn chat_for(&self, event_type: EventType) -> &str {
        if event_type.is_alert() {
            self.alert_chat_id.as_deref().unwrap_or(&self.chat_id)
        } else {
            &self.chat_id
        }
    }
}

/// Sends notifications through the Telegram Bot API.
pub struct TelegramNotifier {
    config: TelegramConfig,
    http_client: reqwest::Client,
    api_url: String,
    sender: mpsc::Sender<Event>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, NotificationError> {
        if config.bot_token.is_empty() {
            return Err(NotificationError::new("bot_token is required"));
        }
        if config.chat_id.is_empty() {
            return Err(NotificationError::new("chat_id is required"));
        }

        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| NotificationError::new(format!("Failed to create HTTP client: {}", e)))?;

        let api_url = format!("{}{}", TELEGRAM_API_URL, config.bot_token);

        let (sender, receiver) = mpsc::channel(ASYNC_QUEUE_SIZE);

        Self::spawn_worker(receiver, config.clone(), http_client.clone(), api_url.clone());

        Ok(Self {
            config,
            http_client,
            api_url,
            sender,
        })
    }

    fn spawn_worker(
        mut receiver: mpsc::Receiver<Event>,
        config: TelegramConfig,
        http_client: reqwest::Client,
        api_url: String,
    ) {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let chat_id = config.chat_for(event.event_type);
                let text = format_event(&event);
                if let Err(e) = send_message(&http_client, &api_url, chat_id, &text).await {
                    error!(error = %e, event = %event.event_type, "Failed to send Telegram message");
                }
            }
        });
    }
}

/// Cuts a message to Telegram's limit without splitting a character.
fn truncate(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LENGTH {
        return text;
    }
    let mut end = MAX_MESSAGE_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

async fn send_message(
    http_client: &reqwest::Client,
    api_url: &str,
    chat_id: &str,
    text: &str,
) -> Result<(), NotificationError> {
    let url = format!("{}/sendMessage", api_url);

    let payload = serde_json::json!({
        "chat_id": chat_id,
        "text": truncate(text),
        "parse_mode": "Markdown"
    });

    let response = http_client
        .post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| NotificationError::new(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(NotificationError::new(format!(
            "Telegram API error: {} - {}",
            status, body
        )));
    }

    Ok(())
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, event: &Event) -> Result<(), NotificationError> {
        if !self.is_enabled(event.event_type) {
            return Ok(());
        }

        let chat_id = self.config.chat_for(event.event_type);
        let text = format_event(event);
        send_message(&self.http_client, &self.api_url, chat_id, &text).await
    }

    fn send_async(&self, event: Event) {
        if !self.is_enabled(event.event_type) {
            return;
        }

        if let Err(e) = self.sender.try_send(event) {
            error!(error = %e, "Failed to queue Telegram message");
        }
    }

    fn is_enabled(&self, event_type: EventType) -> bool {
        self.config.is_enabled(event_type)
    }

    async fn close(&self) -> Result<(), NotificationError> {
        // give the worker time to flush queued messages
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alerts_route_to_alert_chat() {
        let config = TelegramConfig::new("token", "main").with_alert_chat_id("alerts");
        assert_eq!(config.chat_for(EventType::ExecutionTimeout), "alerts");
        assert_eq!(config.chat_for(EventType::EmergencyActivated), "alerts");
        assert_eq!(config.chat_for(EventType::ExecutionSettled), "main");
        assert_eq!(config.chat_for(EventType::Overview), "main");
    }

    #[test]
    fn test_alerts_fall_back_to_main_chat() {
        let config = TelegramConfig::new("token", "main");
        assert_eq!(config.chat_for(EventType::ExecutionTimeout), "main");
    }

    #[test]
    fn test_timeouts_cannot_be_muted() {
        let mut config = TelegramConfig::new("token", "main");
        config.notify_executions = false;
        config.notify_emergencies = false;

        assert!(config.is_enabled(EventType::ExecutionTimeout));
        assert!(config.is_enabled(EventType::MonitorCancelled));
        assert!(!config.is_enabled(EventType::ExecutionSettled));
        assert!(!config.is_enabled(EventType::EmergencyActivated));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "я".repeat(MAX_MESSAGE_LENGTH);
        let cut = truncate(&text);
        assert!(cut.len() <= MAX_MESSAGE_LENGTH);
        assert!(cut.chars().all(|c| c == 'я'));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn test_new_requires_credentials() {
        assert!(TelegramNotifier::new(TelegramConfig::new("", "chat")).is_err());
        assert!(TelegramNotifier::new(TelegramConfig::new("token", "")).is_err());
    }
}
