use crate::config::Notification;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-container result of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// `repository:tag` of the container image.
    pub image: String,
    pub success: bool,
    pub error: Option<String>,
}

impl UpdateOutcome {
    pub fn success(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(image: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, destination: &str, message: &str) -> Result<()>;
}

/// Posts `{"text": message}` to a webhook URL.
pub struct WebhookTransport {
    client: Client,
}

impl WebhookTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn send(&self, destination: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(destination)
            .json(&json!({ "text": message }))
            .send()
            .await
            .context("Failed to send notification request")?;

        if !response.status().is_success() {
            bail!("Notification endpoint returned error status {}", response.status());
        }
        Ok(())
    }
}

/// Scheme of a notification URL, safe to log. `slack://token@channel` gives `slack`.
pub fn extract_service_type(url: &str) -> &str {
    if url.is_empty() {
        return "none";
    }
    url.split_once(':').map(|(scheme, _)| scheme).unwrap_or("unknown")
}

/// Turns the outcomes of a cycle into a single summary message.
pub struct Reporter {
    transport: Arc<dyn NotificationTransport>,
    destination: Option<SecretString>,
    cluster: String,
}

impl Reporter {
    pub fn new(transport: Arc<dyn NotificationTransport>, notification: &Notification) -> Self {
        match &notification.url {
            Some(url) => info!(
                "Using notifications: {}",
                extract_service_type(url.expose_secret())
            ),
            None => info!("Notifications disabled"),
        }
        Self {
            transport,
            destination: notification.url.clone(),
            cluster: notification.cluster.clone(),
        }
    }

    pub fn build_message(&self, outcomes: &[UpdateOutcome], scanned: usize) -> String {
        let mut message = format!("☸️ kube-watchtower updates on {}\n\n", self.cluster);

        let (succeeded, failed): (Vec<&UpdateOutcome>, Vec<&UpdateOutcome>) =
            outcomes.iter().partition(|o| o.success);

        if !succeeded.is_empty() {
            message.push_str("✅ Updated successfully:\n");
            for outcome in &succeeded {
                let _ = writeln!(message, "- {}", outcome.image);
            }
            message.push('\n');
        }

        if !failed.is_empty() {
            message.push_str("❌ Failed to update:\n");
            for outcome in &failed {
                let _ = writeln!(message, "- {}", outcome.image);
            }
            message.push('\n');
        }

        let _ = write!(message, "Updated: {}/{}", succeeded.len(), scanned);
        message
    }

    /// Sends the cycle summary. Returns whether a message was delivered; cycles without outcomes
    /// send nothing and delivery errors are only logged.
    pub async fn report(
        &self,
        outcomes: &[UpdateOutcome],
        scanned: usize,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(destination) = &self.destination else {
            return false;
        };
        if outcomes.is_empty() {
            debug!("No updates attempted, skipping notification");
            return false;
        }

        for outcome in outcomes.iter().filter(|o| !o.success) {
            debug!(
                "Reporting failed update of {}: {}",
                outcome.image,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }

        let message = self.build_message(outcomes, scanned);
        match cancel
            .run_until_cancelled(self.transport.send(destination.expose_secret(), &message))
            .await
        {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!("Failed to send notification: {:#}", e);
                false
            }
            None => false,
        }
    }
}
