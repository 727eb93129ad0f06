//! Best-effort pass/fail alerts to a pub/sub topic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::error::BackupError;

/// Delivers a short text message somewhere a human will see it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), BackupError>;
}

/// Publishes to `<base_url>/<channel>` with a fixed `Title` header.
pub struct TopicNotifier {
    client: Client,
    base_url: String,
    channel: Option<String>,
    title: String,
}

impl TopicNotifier {
    pub fn new(cfg: &NotifyConfig) -> Result<Self, BackupError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build notification client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            channel: cfg.channel.clone().filter(|c| !c.trim().is_empty()),
            title: cfg.title.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TopicNotifier {
    async fn send(&self, message: &str) -> Result<(), BackupError> {
        let Some(channel) = &self.channel else {
            warn!("no notification channel configured, skipping notification");
            return Ok(());
        };

        let url = format!("{}/{}", self.base_url, channel);
        let fail = |detail: String| BackupError::Notification {
            channel: channel.clone(),
            detail,
        };
        let response = self
            .client
            .post(&url)
            .header("Title", &self.title)
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }
        info!(%channel, "notification sent");
        Ok(())
    }
}

/// Send `message`, logging any failure. Never fails.
pub async fn dispatch(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.send(message).await {
        warn!(error = %e, "notification not delivered");
    }
}
