//! Fan-out of download events to the library manager's notification
//! providers.
//!
//! The provider list is fetched per event; the library manager owns the
//! configuration, this service never stores its own. A failing provider is
//! logged and skipped; it never interrupts the others.

use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::clients::sonarr::{SonarrClient, SonarrNotification};
use crate::domain::NotificationEvent;

pub struct Notifier {
    sonarr: Arc<SonarrClient>,
    client: Client,
}

impl Notifier {
    #[must_use]
    pub fn new(sonarr: Arc<SonarrClient>) -> Self {
        Self {
            sonarr,
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent(concat!("Animarr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn start_listener(self: Arc<Self>, events: &broadcast::Sender<NotificationEvent>) {
        let mut rx = events.subscribe();
        let notifier = self;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => notifier.handle_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        error!(count, "Notification listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_event(&self, event: &NotificationEvent) {
        let (title, body) = match event {
            NotificationEvent::DownloadSuccess {
                series_title,
                season_number,
                episode_number,
            } => (
                "Download completed".to_string(),
                NotificationEvent::episode_label(series_title, *season_number, *episode_number),
            ),
            NotificationEvent::DownloadError {
                series_title,
                season_number,
                episode_number,
                error,
            } => (
                "Download failed".to_string(),
                format!(
                    "{}: {error}",
                    NotificationEvent::episode_label(series_title, *season_number, *episode_number)
                ),
            ),
            _ => return,
        };

        self.dispatch(&title, &body).await;
    }

    /// Sends `title`/`body` to every provider with `onDownload` enabled.
    pub async fn dispatch(&self, title: &str, body: &str) {
        let configs = match self.sonarr.get_notifications().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "Could not fetch notification providers");
                return;
            }
        };

        for config in configs.iter().filter(|c| c.on_download) {
            if let Err(e) = self.dispatch_one(config, title, body).await {
                warn!(
                    provider = %config.name,
                    implementation = %config.implementation,
                    error = %e,
                    "Notification provider failed"
                );
            }
        }
    }

    async fn dispatch_one(
        &self,
        config: &SonarrNotification,
        title: &str,
        body: &str,
    ) -> Result<()> {
        match config.implementation.as_str() {
            "Discord" => self.send_discord(config, title, body).await,
            "Webhook" => self.send_webhook(config, title, body).await,
            "Apprise" => self.send_apprise(config, title, body).await,
            other => {
                warn!(implementation = other, "Unknown notification implementation");
                Ok(())
            }
        }
    }

    async fn send_discord(
        &self,
        config: &SonarrNotification,
        title: &str,
        body: &str,
    ) -> Result<()> {
        let url = config
            .field_str("webHookUrl")
            .context("Discord notification has no webHookUrl")?;

        self.client
            .post(&url)
            .json(&json!({ "content": format!("**{title}**\n{body}") }))
            .send()
            .await?
            .error_for_status()?;

        debug!(provider = %config.name, "Discord notification sent");
        Ok(())
    }

    async fn send_webhook(
        &self,
        config: &SonarrNotification,
        title: &str,
        body: &str,
    ) -> Result<()> {
        let url = config
            .field_str("url")
            .context("Webhook notification has no url")?;
        let method = config
            .field_str("method")
            .map(|m| webhook_method(&m))
            .unwrap_or(Method::POST);

        self.client
            .request(method, &url)
            .json(&json!({
                "title": title,
                "message": body,
                "eventType": "Download",
            }))
            .send()
            .await?
            .error_for_status()?;

        debug!(provider = %config.name, "Webhook notification sent");
        Ok(())
    }

    async fn send_apprise(
        &self,
        config: &SonarrNotification,
        title: &str,
        body: &str,
    ) -> Result<()> {
        let server = config
            .field_str("serverUrl")
            .context("Apprise notification has no serverUrl")?;
        let key = config.field_str("configurationKey").unwrap_or_default();
        let urls = config.field_str_array("statelessUrls");

        let endpoint = format!("{}/notify/{key}", server.trim_end_matches('/'));

        let mut payload = json!({ "title": title, "body": body });
        if !urls.is_empty() {
            payload["urls"] = json!(urls.join(","));
        }

        self.client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        debug!(provider = %config.name, "Apprise notification sent");
        Ok(())
    }
}

/// The library manager stores the webhook method as a numeric field id;
/// `2` means PUT, everything else falls back to POST.
fn webhook_method(raw: &str) -> Method {
    match raw {
        "2" => Method::PUT,
        other => match other.to_ascii_uppercase().as_str() {
            "PUT" => Method::PUT,
            _ => Method::POST,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_method_mapping() {
        assert_eq!(webhook_method("1"), Method::POST);
        assert_eq!(webhook_method("2"), Method::PUT);
        assert_eq!(webhook_method("put"), Method::PUT);
        assert_eq!(webhook_method("POST"), Method::POST);
        assert_eq!(webhook_method("garbage"), Method::POST);
    }
}
