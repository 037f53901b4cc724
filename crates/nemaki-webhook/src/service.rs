//! Notification service
//!
//! Entry point for repository changes. Direct events go straight to the
//! delivery service; child events are queued on the parent folder and later
//! delivered as one `CHILD_BATCH` payload per interested webhook.

use crate::{
    filter_sensitive_properties, find_matching_configs, matches_any, parse_active_configs,
    BatchDeliveryHandler, ChildEvent, ChildEventBatch, ChildEventBatchProcessor,
    DeliveryLogRepository, DeliveryMeta, DeliveryService, DeliveryStats, DeliveryStatus,
    ObjectChange, Result, WebhookConfig, WebhookDeliveryLog, WebhookDispatcher, WebhookError,
    WebhookEventType, WebhookPayload, WebhookSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Upper bound on the ancestor walk for inherited configs
pub const MAX_INHERITANCE_DEPTH: u32 = 50;

/// Event type used by [`WebhookService::test_webhook`]
pub const TEST_EVENT_TYPE: &str = "TEST";

/// Where webhook configs and the folder hierarchy come from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Valid, enabled configs attached directly to an object
    async fn configs_for(&self, repository_id: &str, object_id: &str) -> Result<Vec<WebhookConfig>>;

    /// Parent folder id, `None` at the root or for unknown objects
    async fn parent_of(&self, repository_id: &str, object_id: &str) -> Result<Option<String>>;
}

type ObjectKey = (String, String);

fn object_key(repository_id: &str, object_id: &str) -> ObjectKey {
    (repository_id.to_string(), object_id.to_string())
}

/// In-memory config source
#[derive(Default)]
pub struct InMemoryConfigSource {
    configs: DashMap<ObjectKey, Vec<WebhookConfig>>,
    parents: DashMap<ObjectKey, String>,
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach configs to an object, dropping invalid and disabled ones.
    /// Returns how many were kept.
    pub fn register(&self, repository_id: &str, object_id: &str, configs: Vec<WebhookConfig>) -> usize {
        let active: Vec<WebhookConfig> = configs
            .into_iter()
            .filter(|config| match config.validate() {
                Ok(()) => config.enabled,
                Err(e) => {
                    warn!(object_id = %object_id, error = %e, "Ignoring invalid webhook config");
                    false
                }
            })
            .collect();

        let kept = active.len();
        self.configs.insert(object_key(repository_id, object_id), active);
        kept
    }

    /// Attach configs from a `nemaki:webhookConfigs` JSON array
    pub fn register_json(&self, repository_id: &str, object_id: &str, json: &str) -> usize {
        self.register(repository_id, object_id, parse_active_configs(json))
    }

    pub fn unregister(&self, repository_id: &str, object_id: &str) {
        self.configs.remove(&object_key(repository_id, object_id));
    }

    pub fn set_parent(&self, repository_id: &str, object_id: &str, parent_id: &str) {
        self.parents
            .insert(object_key(repository_id, object_id), parent_id.to_string());
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn configs_for(&self, repository_id: &str, object_id: &str) -> Result<Vec<WebhookConfig>> {
        Ok(self
            .configs
            .get(&object_key(repository_id, object_id))
            .map(|configs| configs.clone())
            .unwrap_or_default())
    }

    async fn parent_of(&self, repository_id: &str, object_id: &str) -> Result<Option<String>> {
        Ok(self
            .parents
            .get(&object_key(repository_id, object_id))
            .map(|parent| parent.clone()))
    }
}

struct ServiceInner {
    configs: Arc<dyn ConfigSource>,
    dispatcher: Arc<dyn WebhookDispatcher>,
    logs: Arc<dyn DeliveryLogRepository>,
    delivery: DeliveryService,
    tasks: TaskTracker,
    permits: Arc<Semaphore>,
}

impl ServiceInner {
    fn try_permit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    fn spawn_payload_delivery(self: &Arc<Self>, permit: OwnedSemaphorePermit, config: WebhookConfig, payload: WebhookPayload) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let _permit = permit;
            if let Err(e) = inner
                .delivery
                .deliver(inner.dispatcher.as_ref(), inner.logs.as_ref(), &config, &payload)
                .await
            {
                error!(
                    webhook_id = %config.id,
                    delivery_id = %payload.delivery_id,
                    error = %e,
                    "Webhook delivery aborted"
                );
            }
        });
    }

    fn spawn_serialized_delivery(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        config: WebhookConfig,
        meta: DeliveryMeta,
        timestamp_ms: i64,
        body: String,
    ) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let _permit = permit;
            inner
                .delivery
                .deliver_serialized(
                    inner.dispatcher.as_ref(),
                    inner.logs.as_ref(),
                    &config,
                    &meta,
                    timestamp_ms,
                    &body,
                )
                .await;
        });
    }
}

/// Delivers flushed child batches to the parent folder's webhooks
pub struct ChildBatchDeliverer {
    inner: Arc<ServiceInner>,
}

#[async_trait]
impl BatchDeliveryHandler for ChildBatchDeliverer {
    async fn deliver_batch(&self, batch: &ChildEventBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        info!(
            folder_id = %batch.parent_folder_id,
            batch_id = %batch.batch_id,
            event_count = batch.event_count(),
            "Delivering child event batch"
        );

        let parent_configs = self
            .inner
            .configs
            .configs_for(&batch.repository_id, &batch.parent_folder_id)
            .await?;

        let mut event_types = vec![WebhookEventType::ChildBatch];
        for event in &batch.events {
            if !event_types.contains(&event.event_type) {
                event_types.push(event.event_type);
            }
        }

        let matched: Vec<&WebhookConfig> = parent_configs
            .iter()
            .filter(|config| matches_any(config, &event_types))
            .collect();

        if matched.is_empty() {
            debug!(folder_id = %batch.parent_folder_id, "No webhook configs for child batch");
            return Ok(());
        }

        // All or nothing, so a retried batch is never delivered twice to the
        // same webhook.
        let permits: Vec<OwnedSemaphorePermit> = matched
            .iter()
            .map_while(|_| self.inner.try_permit())
            .collect();
        if permits.len() < matched.len() {
            return Err(WebhookError::BatchDelivery(format!(
                "delivery capacity exhausted for {} webhooks",
                matched.len()
            )));
        }

        for (config, permit) in matched.into_iter().zip(permits) {
            let addressed = batch.for_webhook(&config.id, &config.url);
            let delivery_id = DeliveryService::generate_delivery_id();
            let timestamp = Utc::now();
            let body = serde_json::to_string(&build_child_batch_payload(&addressed, &delivery_id, timestamp))?;

            let meta = DeliveryMeta {
                delivery_id,
                event_type: WebhookEventType::ChildBatch.as_str().to_string(),
                object_id: batch.parent_folder_id.clone(),
                repository_id: batch.repository_id.clone(),
                change_token: None,
            };
            self.inner
                .spawn_serialized_delivery(permit, config.clone(), meta, timestamp.timestamp_millis(), body);
        }

        Ok(())
    }
}

fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// JSON body of a `CHILD_BATCH` delivery
pub fn build_child_batch_payload(batch: &ChildEventBatch, delivery_id: &str, timestamp: DateTime<Utc>) -> Value {
    let changes: Vec<Value> = batch
        .events
        .iter()
        .map(|event| {
            let mut change = Map::new();
            change.insert("type".to_string(), json!(event.event_type.as_str()));
            change.insert("objectId".to_string(), json!(event.object_id));
            change.insert("name".to_string(), json!(event.object_name));
            change.insert("objectType".to_string(), json!(event.object_type));
            change.insert("timestamp".to_string(), json!(rfc3339(event.timestamp)));
            if let Some(user_id) = &event.user_id {
                change.insert("userId".to_string(), json!(user_id));
            }
            if let Some(token) = &event.change_token {
                change.insert("changeToken".to_string(), json!(token));
            }
            Value::Object(change)
        })
        .collect();

    json!({
        "event": {
            "type": WebhookEventType::ChildBatch.as_str(),
            "timestamp": rfc3339(timestamp),
            "deliveryId": delivery_id,
            "batchId": batch.batch_id,
        },
        "repository": { "id": batch.repository_id },
        "parentFolder": {
            "id": batch.parent_folder_id,
            "path": batch.parent_folder_path,
        },
        "changes": changes,
        "batchInfo": {
            "windowStart": rfc3339(batch.window_start),
            "windowEnd": rfc3339(batch.window_end),
            "eventCount": batch.event_count(),
        },
    })
}

/// Webhook notification service
#[derive(Clone)]
pub struct WebhookService {
    inner: Arc<ServiceInner>,
    batch_processor: Arc<ChildEventBatchProcessor>,
    shutting_down: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl WebhookService {
    pub fn new(
        configs: Arc<dyn ConfigSource>,
        dispatcher: Arc<dyn WebhookDispatcher>,
        logs: Arc<dyn DeliveryLogRepository>,
        settings: &WebhookSettings,
    ) -> Self {
        Self::with_delivery_service(configs, dispatcher, logs, settings, DeliveryService::new())
    }

    pub fn with_delivery_service(
        configs: Arc<dyn ConfigSource>,
        dispatcher: Arc<dyn WebhookDispatcher>,
        logs: Arc<dyn DeliveryLogRepository>,
        settings: &WebhookSettings,
        delivery: DeliveryService,
    ) -> Self {
        let backoff = delivery.backoff().clone();
        let inner = Arc::new(ServiceInner {
            configs,
            dispatcher,
            logs,
            delivery,
            tasks: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(settings.delivery.max_pending_deliveries.max(1))),
        });

        let handler = Arc::new(ChildBatchDeliverer {
            inner: Arc::clone(&inner),
        });
        let batch_processor = ChildEventBatchProcessor::with_backoff(handler, settings.batch.clone(), backoff);

        Self {
            inner,
            batch_processor,
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_timeout: settings.delivery.shutdown_timeout(),
        }
    }

    /// Start the batch ticker
    pub fn start(&self) {
        self.batch_processor.start();
    }

    pub fn batch_processor(&self) -> &Arc<ChildEventBatchProcessor> {
        &self.batch_processor
    }

    pub fn delivery_service(&self) -> &DeliveryService {
        &self.inner.delivery
    }

    /// Deliveries running or waiting for a retry
    pub fn in_flight_deliveries(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Handle one repository change.
    ///
    /// Spawns a delivery for every matching config of the object and its
    /// `include_children` ancestors, then queues the child event on the
    /// parent folder. Returns the number of deliveries spawned.
    pub async fn notify(&self, change: ObjectChange) -> Result<usize> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(WebhookError::ShuttingDown);
        }

        let event_type = change.event_type.as_str();
        let mut configs = self
            .inner
            .configs
            .configs_for(&change.repository_id, &change.object_id)
            .await?;
        configs.extend(self.inherited_configs(&change).await?);

        let matched = find_matching_configs(&configs, event_type);
        if matched.is_empty() {
            debug!(object_id = %change.object_id, event_type = %event_type, "No matching webhook configs");
        } else {
            info!(
                object_id = %change.object_id,
                event_type = %event_type,
                matched = matched.len(),
                "Dispatching webhooks"
            );
        }

        let mut spawned = 0;
        for config in matched {
            let Some(permit) = self.inner.try_permit() else {
                warn!(
                    webhook_id = %config.id,
                    object_id = %change.object_id,
                    "Delivery capacity exhausted, dropping webhook delivery"
                );
                continue;
            };

            let payload = self.payload_for(&change);
            self.inner.spawn_payload_delivery(permit, config.clone(), payload);
            spawned += 1;
        }

        self.trigger_child_event(&change).await?;

        Ok(spawned)
    }

    fn payload_for(&self, change: &ObjectChange) -> WebhookPayload {
        let mut payload = self.inner.delivery.build_payload(
            change.event_type.as_str(),
            &change.object_id,
            &change.repository_id,
            Some(&change.properties),
            change.change_token.as_deref(),
        );
        payload.parent_id = change.parent_id.clone();
        payload.user_id = change.user_id.clone();
        payload.object_path = change.object_path.clone();
        payload
    }

    /// `include_children` configs of ancestors within their `max_depth`.
    ///
    /// Distance 1 is the direct parent.
    pub async fn inherited_configs(&self, change: &ObjectChange) -> Result<Vec<WebhookConfig>> {
        let mut inherited = Vec::new();
        if change.repository_id.is_empty() {
            return Ok(inherited);
        }

        let mut visited = HashSet::new();
        visited.insert(change.object_id.clone());
        let mut current = change.parent_id.clone().filter(|p| !p.is_empty());
        let mut distance = 1u32;

        while let Some(folder_id) = current {
            if distance > MAX_INHERITANCE_DEPTH || !visited.insert(folder_id.clone()) {
                break;
            }

            let configs = self
                .inner
                .configs
                .configs_for(&change.repository_id, &folder_id)
                .await?;
            inherited.extend(configs.into_iter().filter(|config| {
                config.include_children && config.max_depth.map(|max| distance <= max).unwrap_or(true)
            }));

            current = self
                .inner
                .configs
                .parent_of(&change.repository_id, &folder_id)
                .await?;
            distance += 1;
        }

        Ok(inherited)
    }

    /// Queue the `CHILD_*` counterpart of `change` on its parent folder when a
    /// config there listens for it or for `CHILD_BATCH`.
    pub async fn trigger_child_event(&self, change: &ObjectChange) -> Result<bool> {
        let Some(parent_id) = change.parent_id.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(false);
        };
        let Some(child_type) = change.event_type.to_child() else {
            return Ok(false);
        };

        let parent_configs = self
            .inner
            .configs
            .configs_for(&change.repository_id, parent_id)
            .await?;
        let interested = parent_configs
            .iter()
            .any(|config| matches_any(config, &[child_type, WebhookEventType::ChildBatch]));
        if !interested {
            debug!(folder_id = %parent_id, "No child webhook configs on parent folder");
            return Ok(false);
        }

        let mut event = ChildEvent::new(parent_id, &change.object_id, child_type)
            .with_properties(filter_sensitive_properties(&change.properties));
        event.parent_folder_path = change.parent_path.clone();
        event.object_name = change.object_name.clone();
        event.object_type = change.object_type.clone();
        event.change_token = change.change_token.clone();
        event.user_id = change.user_id.clone();

        let queued = self.batch_processor.queue_event(&change.repository_id, event);
        if !queued {
            warn!(
                folder_id = %parent_id,
                object_id = %change.object_id,
                event_type = %child_type,
                "Child event was not queued"
            );
        }
        Ok(queued)
    }

    /// Record a new attempt for an earlier delivery.
    ///
    /// The request body is not stored, so this only creates the RETRY_PENDING
    /// log entry that an operator-driven resend picks up.
    pub async fn retry_delivery(&self, delivery_id: &str) -> Result<WebhookDeliveryLog> {
        let latest = self
            .inner
            .logs
            .latest_by_delivery_id(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(format!("delivery {}", delivery_id)))?;

        let mut retry = latest.next_attempt();
        retry.status = DeliveryStatus::RetryPending;
        self.inner.logs.save(&retry).await?;

        info!(
            delivery_id = %delivery_id,
            attempt = retry.attempt_number,
            "Retry queued"
        );
        Ok(retry)
    }

    pub async fn delivery_logs(&self, repository_id: &str, object_id: &str, limit: usize) -> Result<Vec<WebhookDeliveryLog>> {
        self.inner.logs.list_by_object(repository_id, object_id, limit).await
    }

    pub async fn delivery_logs_by_webhook(&self, webhook_id: &str, limit: usize) -> Result<Vec<WebhookDeliveryLog>> {
        self.inner.logs.list_by_webhook(webhook_id, limit).await
    }

    pub async fn delivery_stats(&self, webhook_id: &str) -> Result<DeliveryStats> {
        self.inner.logs.stats(webhook_id).await
    }

    /// Send one `TEST` payload to `url` and report the outcome without
    /// retrying or persisting it.
    pub async fn test_webhook(&self, repository_id: &str, url: &str, secret: Option<&str>) -> WebhookDeliveryLog {
        let delivery = &self.inner.delivery;
        let payload = delivery.build_payload(
            TEST_EVENT_TYPE,
            "test-object-id",
            repository_id,
            None,
            Some("test-change-token"),
        );

        let mut config = WebhookConfig::new(&format!("test-{}", payload.delivery_id), url)
            .with_events([TEST_EVENT_TYPE])
            .with_retry_count(0);
        config.secret = secret.map(str::to_string);

        let meta = DeliveryMeta::from(&payload);
        let body = match delivery.serialize_payload(&payload) {
            Ok(body) => body,
            Err(e) => {
                let mut log = WebhookDeliveryLog::for_attempt(&config, &meta, 1, 0);
                log.mark_failure(None, None, &e.to_string(), None);
                return log;
            }
        };

        let mut log = WebhookDeliveryLog::for_attempt(&config, &meta, 1, body.len());
        let headers = delivery.delivery_headers(&config, TEST_EVENT_TYPE, &payload.delivery_id, payload.timestamp, &body);

        log.mark_processing();
        match self.inner.dispatcher.dispatch(url, &body, &headers, &config).await {
            Ok(outcome) if outcome.is_success() => {
                log.mark_success(outcome.status_code, outcome.response_body.as_deref(), outcome.elapsed_ms);
            }
            Ok(outcome) => {
                log.mark_failure(
                    Some(outcome.status_code),
                    outcome.response_body.as_deref(),
                    &format!("HTTP {}", outcome.status_code),
                    Some(outcome.elapsed_ms),
                );
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Test webhook failed");
                log.mark_failure(None, None, &e.to_string(), None);
            }
        }
        log
    }

    /// Wait until every spawned delivery has finished
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Reject new changes, flush pending child events and wait for running
    /// deliveries up to the configured timeout.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down webhook service");

        self.batch_processor.shutdown().await;

        self.inner.tasks.close();
        if tokio::time::timeout(self.shutdown_timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.inner.tasks.len(),
                "Webhook deliveries still running after shutdown timeout"
            );
        }

        info!("Webhook service shutdown complete");
    }
}
