use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use sensor_common::event::{EventSource, StoredEvent};

use crate::config::TelegramConfig;
use crate::metrics::NOTIFICATIONS;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("malformed response body: {0}")]
    Malformed(reqwest::Error),
    #[error("rejected with status {status}: {description}")]
    Rejected {
        status: StatusCode,
        description: String,
    },
}

/// Best effort push of alerts to an external channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the alert was delivered. Never retries.
    async fn send_alert(&self, event: &StoredEvent, source: EventSource) -> bool;
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

struct Destination {
    endpoint: String,
    chat_id: String,
}

/// A `Notifier` posting to the Telegram Bot API.
///
/// Without both a bot token and a chat id it is disabled and reports every alert as not
/// delivered, without making any request.
pub struct TelegramNotifier {
    client: reqwest::Client,
    destination: Option<Destination>,
    send_location: bool,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent("Sensor Ingest Notifier")
            .timeout(config.timeout.0)
            .build()
            .map_err(NotifyError::Client)?;

        let token = config
            .telegram_bot_token
            .as_deref()
            .filter(|token| !token.is_empty());
        let chat_id = config
            .telegram_chat_id
            .as_deref()
            .filter(|chat_id| !chat_id.is_empty());

        let destination = match (token, chat_id) {
            (Some(token), Some(chat_id)) => Some(Destination {
                endpoint: format!(
                    "{}/bot{}",
                    config.telegram_api_url.trim_end_matches('/'),
                    token
                ),
                chat_id: chat_id.to_owned(),
            }),
            _ => None,
        };

        Ok(Self {
            client,
            destination,
            send_location: config.telegram_send_location.is_on(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.destination.is_some()
    }

    async fn call(
        &self,
        destination: &Destination,
        method: &str,
        body: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/{}", destination.endpoint, method))
            .json(&body)
            .send()
            .await
            .map_err(NotifyError::Transport)?;

        let status = response.status();
        match response.json::<ApiResponse>().await {
            Ok(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Ok(ApiResponse { description, .. }) => Err(NotifyError::Rejected {
                status,
                description: description.unwrap_or_else(|| status.to_string()),
            }),
            Err(_) if !status.is_success() => Err(NotifyError::Status(status)),
            Err(error) => Err(NotifyError::Malformed(error)),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_alert(&self, event: &StoredEvent, source: EventSource) -> bool {
        let Some(destination) = &self.destination else {
            return false;
        };
        if !event.severity.is_alertable() {
            debug!(event_id = %event.id, "not notifying for low severity event");
            return false;
        }

        let message = json!({
            "chat_id": destination.chat_id,
            "text": format_alert(event, source),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let delivered = match self.call(destination, "sendMessage", message).await {
            Ok(()) => {
                info!(event_id = %event.id, severity = %event.severity, "alert delivered");
                true
            }
            Err(error) => {
                warn!(event_id = %event.id, error = %error, "failed to deliver alert");
                false
            }
        };

        if delivered && self.send_location {
            let pin = json!({
                "chat_id": destination.chat_id,
                "latitude": event.location.lat(),
                "longitude": event.location.lng(),
            });
            if let Err(error) = self.call(destination, "sendLocation", pin).await {
                warn!(event_id = %event.id, error = %error, "failed to send alert location");
            }
        }

        let label = if delivered { "true" } else { "false" };
        metrics::counter!(NOTIFICATIONS, "delivered" => label).increment(1);

        delivered
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render an alert as Telegram HTML.
pub fn format_alert(event: &StoredEvent, source: EventSource) -> String {
    let mut lines = vec![
        format!("<b>{}</b>", escape_html(&event.title)),
        String::new(),
        format!("<b>Severity:</b> {}", event.severity),
        format!("<b>Location:</b> {}", event.location),
        format!("<b>Source:</b> {}", source),
    ];
    if let Some(description) = &event.description {
        lines.push(format!("<b>Details:</b> {}", escape_html(description)));
    }
    lines.push(format!(
        "<b>Time:</b> {}",
        event.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    lines.join("\n")
}
