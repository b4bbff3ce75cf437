use crate::domain::events::{BackupSurface, WebhookEvent};
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub on_complete: bool,
    pub on_failure: bool,
    pub on_vault_issue: bool,
    pub on_integrity: bool,
}

/// Optional collaborator endpoint notified about backup outcomes.
///
/// Delivery failures (timeouts, non-2xx) are logged and swallowed: the
/// webhook is an observer, never part of the backup transaction.
#[derive(Clone, Debug)]
pub struct WebhookService {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookService {
    #[must_use]
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build().unwrap_or_default();
        Self { client, config }
    }

    fn enabled_for(&self, event: WebhookEvent) -> bool {
        if self.config.url.is_none() {
            return false;
        }
        match event {
            WebhookEvent::BackupComplete => self.config.on_complete,
            WebhookEvent::BackupFailed => self.config.on_failure,
            WebhookEvent::VaultIssue => self.config.on_vault_issue,
            WebhookEvent::IntegrityMismatch | WebhookEvent::IntegrityError => self.config.on_integrity,
            WebhookEvent::Test => true,
        }
    }

    /// Posts one event; never fails the caller.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn deliver(
        &self,
        event: WebhookEvent,
        surface: Option<BackupSurface>,
        files_processed: u64,
        error_message: Option<String>,
    ) {
        if !self.enabled_for(event) {
            return;
        }
        let Some(url) = self.config.url.clone() else { return };

        let payload = json!({
            "event": event.as_str(),
            "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            "backup_type": surface.map(|s| s.to_string()),
            "files_processed": files_processed,
            "error_message": error_message,
            "hostname": hostname::get().map_or_else(|_| "unknown".to_string(), |h| h.to_string_lossy().into_owned()),
            "app_version": env!("CARGO_PKG_VERSION"),
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(event = event.as_str(), "Webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(event = event.as_str(), status = %response.status(), "Webhook delivery rejected");
            }
            Err(e) => {
                tracing::warn!(event = event.as_str(), error = %e, "Webhook delivery failed");
            }
        }
    }

    /// Delivery that does not block the transfer pipeline.
    pub fn fire(
        &self,
        event: WebhookEvent,
        surface: Option<BackupSurface>,
        files_processed: u64,
        error_message: Option<String>,
    ) {
        if !self.enabled_for(event) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            service.deliver(event, surface, files_processed, error_message).await;
        });
    }
}
