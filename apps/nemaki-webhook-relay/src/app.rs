//! Relay wiring: settings, registrations and the stdin event loop

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use nemaki_webhook::{
    HttpWebhookDispatcher, InMemoryConfigSource, InMemoryDeliveryLogRepository, ObjectChange,
    WebhookService, WebhookSettings,
};

use crate::cli::Args;

/// Webhooks attached to one repository object
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub repository_id: String,
    pub object_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Array of configs, or the raw `nemaki:webhookConfigs` string
    #[serde(default)]
    pub webhook_configs: Value,
}

pub fn parse_registrations(json: &str) -> Result<Vec<Registration>> {
    serde_json::from_str(json).context("Registrations must be a JSON array")
}

/// Register every entry, returning the number of active configs
pub fn apply_registrations(source: &InMemoryConfigSource, registrations: &[Registration]) -> usize {
    let mut active = 0;
    for registration in registrations {
        if let Some(parent_id) = registration.parent_id.as_deref() {
            source.set_parent(&registration.repository_id, &registration.object_id, parent_id);
        }

        let configs_json = match &registration.webhook_configs {
            Value::Null => continue,
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        let kept = source.register_json(&registration.repository_id, &registration.object_id, &configs_json);
        debug!(
            object_id = %registration.object_id,
            active = kept,
            "Registered webhook configs"
        );
        active += kept;
    }
    active
}

/// One stdin line; blank lines yield `None`
pub fn parse_change_line(line: &str) -> Result<Option<ObjectChange>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let change = serde_json::from_str(trimmed).context("Malformed change event")?;
    Ok(Some(change))
}

pub struct App {
    args: Args,
    service: WebhookService,
}

impl App {
    pub async fn build(args: Args) -> Result<Self> {
        let settings = match &args.settings {
            Some(path) => WebhookSettings::load_from_file(&path.to_string_lossy())
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => WebhookSettings::load().context("Failed to load settings from environment")?,
        };

        let configs = Arc::new(InMemoryConfigSource::new());
        if let Some(path) = &args.registrations {
            let registrations = load_registrations(path).await?;
            let active = apply_registrations(&configs, &registrations);
            info!(
                objects = registrations.len(),
                active_configs = active,
                "Loaded webhook registrations"
            );
        }

        let dispatcher = HttpWebhookDispatcher::new((&settings.dispatcher).into())
            .context("Failed to build HTTP dispatcher")?;

        let service = WebhookService::new(
            configs,
            Arc::new(dispatcher),
            Arc::new(InMemoryDeliveryLogRepository::default()),
            &settings,
        );

        Ok(Self { args, service })
    }

    pub async fn run(self) -> Result<()> {
        if let Some(url) = &self.args.probe {
            let log = self
                .service
                .test_webhook(&self.args.repository, url, self.args.probe_secret.as_deref())
                .await;
            println!("{}", serde_json::to_string_pretty(&log)?);
            if !log.success {
                anyhow::bail!("Probe of {} failed", url);
            }
            return Ok(());
        }

        self.service.start();
        info!("Reading change events from stdin");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.service.shutdown().await;
        Ok(())
    }

    async fn handle_line(&self, line: &str) {
        let change = match parse_change_line(line) {
            Ok(Some(change)) => change,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Skipping input line");
                return;
            }
        };

        match self.service.notify(change).await {
            Ok(spawned) => debug!(deliveries = spawned, "Change processed"),
            Err(e) => warn!(error = %e, "Change could not be processed"),
        }
    }
}

async fn load_registrations(path: &Path) -> Result<Vec<Registration>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_registrations(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nemaki_webhook::{ConfigSource, WebhookEventType};

    const REGISTRATIONS: &str = r#"[
        {
            "repositoryId": "bedroom",
            "objectId": "folder-1",
            "parentId": "root",
            "webhookConfigs": [
                {"id": "w1", "enabled": true, "url": "https://example.com/a", "events": ["CHILD_BATCH"]},
                {"id": "w2", "enabled": false, "url": "https://example.com/b", "events": ["CREATED"]}
            ]
        },
        {
            "repositoryId": "bedroom",
            "objectId": "doc-1",
            "webhookConfigs": "[{\"id\":\"w3\",\"enabled\":true,\"url\":\"https://example.com/c\",\"events\":[\"UPDATED\"]}]"
        },
        {"repositoryId": "bedroom", "objectId": "doc-2", "parentId": "folder-1"}
    ]"#;

    #[tokio::test]
    async fn test_apply_registrations() {
        let registrations = parse_registrations(REGISTRATIONS).unwrap();
        let source = InMemoryConfigSource::new();

        assert_eq!(apply_registrations(&source, &registrations), 2);

        let folder = source.configs_for("bedroom", "folder-1").await.unwrap();
        assert_eq!(folder.len(), 1);
        assert_eq!(folder[0].id, "w1");
        assert_eq!(source.configs_for("bedroom", "doc-1").await.unwrap()[0].id, "w3");
        assert_eq!(
            source.parent_of("bedroom", "doc-2").await.unwrap().as_deref(),
            Some("folder-1")
        );
        assert_eq!(
            source.parent_of("bedroom", "folder-1").await.unwrap().as_deref(),
            Some("root")
        );
    }

    #[test]
    fn test_registrations_must_be_array() {
        assert!(parse_registrations(r#"{"objectId": "x"}"#).is_err());
    }

    #[test]
    fn test_parse_change_line() {
        assert!(parse_change_line("   ").unwrap().is_none());
        assert!(parse_change_line("{not json").is_err());

        assert!(parse_change_line(r#"{"repositoryId":"bedroom","objectId":"doc-1","eventType":"MOVED"}"#).is_err());

        let change = parse_change_line(
            r#"{"repositoryId":"bedroom","objectId":"doc-1","eventType":"DELETED","parentId":"folder-1"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(change.event_type, WebhookEventType::Deleted);
        assert_eq!(change.parent_id.as_deref(), Some("folder-1"));

        // Event types are matched without regard to case
        let change = parse_change_line(
            r#"{"repositoryId":"bedroom","objectId":"doc-1","eventType":"deleted","parentId":"folder-1"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(change.event_type, WebhookEventType::Deleted);
    }
}
