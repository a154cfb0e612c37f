//! Critical alert delivery.
//!
//! The indexer only raises alerts; formatting and transport live behind
//! `AlertSink`. `LogAlertSink` writes to the tracing log, `TelegramAlertSink`
//! posts to a chat via the Bot API.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A critical condition worth waking someone up for.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    fn render(&self) -> String {
        format!(
            "🚨 <b>{}</b>\n{}\n<i>{}</i>",
            self.title,
            self.message,
            self.raised_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn critical(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn critical(&self, alert: &Alert) -> Result<()> {
        error!(title = %alert.title, message = %alert.message, "CRITICAL ALERT");
        Ok(())
    }
}

/// Telegram credentials.
#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

/// Telegram Bot API sink.
#[derive(Debug, Clone)]
pub struct TelegramAlertSink {
    client: reqwest::Client,
    api_base: String,
    chat_id: String,
}

impl TelegramAlertSink {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if !config.is_configured() {
            anyhow::bail!("Telegram bot token and chat id are required");
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            api_base: format!("https://api.telegram.org/bot{}", config.bot_token),
            chat_id: config.chat_id.clone(),
        })
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    warn!(
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        status = %resp.status(),
                        "Telegram send failed"
                    );
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        error = %e,
                        "Telegram request error"
                    );
                }
            }

            if attempt + 1 < MAX_RETRIES {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }

        anyhow::bail!("Telegram send failed after {} attempts", MAX_RETRIES)
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    async fn critical(&self, alert: &Alert) -> Result<()> {
        self.send_message(&alert.render()).await?;
        info!(title = %alert.title, "Alert delivered to Telegram");
        Ok(())
    }
}
