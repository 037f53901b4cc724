//! Webhook delivery log
//!
//! One [`WebhookDeliveryLog`] row per attempt. Attempts of the same logical
//! delivery share a delivery id and are told apart by their attempt number.

use crate::{Result, WebhookConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Response bodies are truncated to this many characters
pub const MAX_RESPONSE_BODY_CHARS: usize = 4096;

/// Truncate a response body to [`MAX_RESPONSE_BODY_CHARS`] characters
pub fn truncate_response_body(body: &str) -> String {
    match body.char_indices().nth(MAX_RESPONSE_BODY_CHARS) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

/// Attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Created, not yet sent
    Pending,
    /// Request in flight
    Processing,
    Success,
    Failed,
    /// Queued by a manual retry
    RetryPending,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// What is being delivered, independent of the attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMeta {
    pub delivery_id: String,
    pub event_type: String,
    pub object_id: String,
    pub repository_id: String,
    pub change_token: Option<String>,
}

/// One delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryLog {
    /// Shared by every attempt of one logical delivery
    pub delivery_id: String,
    /// `"{delivery_id}-{attempt_number}"`
    pub attempt_id: String,
    pub webhook_id: String,
    pub object_id: String,
    pub repository_id: String,
    pub webhook_url: String,
    pub event_type: String,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub success: bool,
    /// 1-based
    pub attempt_number: u32,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub payload_size_bytes: usize,
    pub timestamp: DateTime<Utc>,
    pub change_token: Option<String>,
    pub status: DeliveryStatus,
}

pub fn attempt_id(delivery_id: &str, attempt_number: u32) -> String {
    format!("{}-{}", delivery_id, attempt_number)
}

impl WebhookDeliveryLog {
    /// New PENDING entry for `attempt_number` of a delivery to `config`
    pub fn for_attempt(
        config: &WebhookConfig,
        meta: &DeliveryMeta,
        attempt_number: u32,
        payload_size_bytes: usize,
    ) -> Self {
        let attempt_number = attempt_number.max(1);
        Self {
            delivery_id: meta.delivery_id.clone(),
            attempt_id: attempt_id(&meta.delivery_id, attempt_number),
            webhook_id: config.id.clone(),
            object_id: meta.object_id.clone(),
            repository_id: meta.repository_id.clone(),
            webhook_url: config.url.clone(),
            event_type: meta.event_type.clone(),
            status_code: None,
            response_body: None,
            success: false,
            attempt_number,
            error_message: None,
            response_time_ms: None,
            payload_size_bytes,
            timestamp: Utc::now(),
            change_token: meta.change_token.clone(),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn meta(&self) -> DeliveryMeta {
        DeliveryMeta {
            delivery_id: self.delivery_id.clone(),
            event_type: self.event_type.clone(),
            object_id: self.object_id.clone(),
            repository_id: self.repository_id.clone(),
            change_token: self.change_token.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_processing(&mut self) {
        if !self.is_completed() {
            self.status = DeliveryStatus::Processing;
        }
    }

    /// Complete as SUCCESS. No-op once completed.
    pub fn mark_success(&mut self, status_code: u16, response_body: Option<&str>, response_time_ms: u64) {
        if self.is_completed() {
            return;
        }
        self.status = DeliveryStatus::Success;
        self.success = true;
        self.status_code = Some(status_code);
        self.response_body = response_body.map(truncate_response_body);
        self.response_time_ms = Some(response_time_ms);
    }

    /// Complete as FAILED. No-op once completed.
    pub fn mark_failure(
        &mut self,
        status_code: Option<u16>,
        response_body: Option<&str>,
        error_message: &str,
        response_time_ms: Option<u64>,
    ) {
        if self.is_completed() {
            return;
        }
        self.status = DeliveryStatus::Failed;
        self.success = false;
        self.status_code = status_code;
        self.response_body = response_body.map(truncate_response_body);
        self.error_message = Some(error_message.to_string());
        self.response_time_ms = response_time_ms;
    }

    /// Fresh PENDING entry for the following attempt of the same delivery
    pub fn next_attempt(&self) -> Self {
        let attempt_number = self.attempt_number + 1;
        Self {
            attempt_id: attempt_id(&self.delivery_id, attempt_number),
            status_code: None,
            response_body: None,
            success: false,
            attempt_number,
            error_message: None,
            response_time_ms: None,
            timestamp: Utc::now(),
            status: DeliveryStatus::Pending,
            ..self.clone()
        }
    }
}

/// Delivery statistics for one webhook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    /// Attempts recorded
    pub total: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean over attempts that recorded a response time
    pub average_response_time_ms: Option<f64>,
    pub last_delivery: Option<DateTime<Utc>>,
}

impl DeliveryStats {
    pub fn from_logs<'a, I>(logs: I) -> Self
    where
        I: IntoIterator<Item = &'a WebhookDeliveryLog>,
    {
        let mut stats = Self::default();
        let mut response_total = 0u64;
        let mut response_samples = 0u64;

        for log in logs {
            stats.total += 1;
            match log.status {
                DeliveryStatus::Success => stats.success_count += 1,
                DeliveryStatus::Failed => stats.failure_count += 1,
                _ => {}
            }
            if let Some(ms) = log.response_time_ms {
                response_total += ms;
                response_samples += 1;
            }
            if stats.last_delivery.map(|t| log.timestamp > t).unwrap_or(true) {
                stats.last_delivery = Some(log.timestamp);
            }
        }

        if response_samples > 0 {
            stats.average_response_time_ms = Some(response_total as f64 / response_samples as f64);
        }
        stats
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.success_count + self.failure_count;
        if completed == 0 {
            0.0
        } else {
            self.success_count as f64 / completed as f64
        }
    }
}

/// Delivery log persistence
#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    /// Insert or replace the entry with the same attempt id
    async fn save(&self, log: &WebhookDeliveryLog) -> Result<()>;

    async fn get_by_attempt_id(&self, attempt_id: &str) -> Result<Option<WebhookDeliveryLog>>;

    /// All attempts of one delivery, by attempt number
    async fn list_by_delivery_id(&self, delivery_id: &str) -> Result<Vec<WebhookDeliveryLog>>;

    /// Highest-numbered attempt of one delivery
    async fn latest_by_delivery_id(&self, delivery_id: &str) -> Result<Option<WebhookDeliveryLog>> {
        Ok(self
            .list_by_delivery_id(delivery_id)
            .await?
            .into_iter()
            .max_by_key(|log| log.attempt_number))
    }

    /// Newest first
    async fn list_by_object(
        &self,
        repository_id: &str,
        object_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>>;

    /// Newest first
    async fn list_by_webhook(&self, webhook_id: &str, limit: usize) -> Result<Vec<WebhookDeliveryLog>>;

    async fn stats(&self, webhook_id: &str) -> Result<DeliveryStats> {
        let logs = self.list_by_webhook(webhook_id, usize::MAX).await?;
        Ok(DeliveryStats::from_logs(&logs))
    }

    /// Delete entries older than the cutoff
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// In-memory log repository with per-webhook and global size limits
pub struct InMemoryDeliveryLogRepository {
    logs: DashMap<String, WebhookDeliveryLog>,
    by_webhook: DashMap<String, VecDeque<String>>,
    by_delivery: DashMap<String, Vec<String>>,
    by_object: DashMap<(String, String), Vec<String>>,
    /// Insertion order; may hold ids already pruned per webhook
    order: Mutex<VecDeque<String>>,
    max_per_webhook: usize,
    max_total: usize,
}

impl InMemoryDeliveryLogRepository {
    pub fn new(max_per_webhook: usize, max_total: usize) -> Self {
        Self {
            logs: DashMap::new(),
            by_webhook: DashMap::new(),
            by_delivery: DashMap::new(),
            by_object: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_per_webhook: max_per_webhook.max(1),
            max_total: max_total.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    fn remove_entry(&self, attempt_id: &str) -> bool {
        let Some((_, log)) = self.logs.remove(attempt_id) else {
            return false;
        };

        if let Some(mut ids) = self.by_webhook.get_mut(&log.webhook_id) {
            ids.retain(|i| i != attempt_id);
        }
        self.by_webhook.remove_if(&log.webhook_id, |_, ids| ids.is_empty());

        if let Some(mut ids) = self.by_delivery.get_mut(&log.delivery_id) {
            ids.retain(|i| i != attempt_id);
        }
        self.by_delivery.remove_if(&log.delivery_id, |_, ids| ids.is_empty());

        let object_key = (log.repository_id.clone(), log.object_id.clone());
        if let Some(mut ids) = self.by_object.get_mut(&object_key) {
            ids.retain(|i| i != attempt_id);
        }
        self.by_object.remove_if(&object_key, |_, ids| ids.is_empty());

        true
    }

    fn prune_webhook(&self, webhook_id: &str) {
        let evicted: Vec<String> = match self.by_webhook.get_mut(webhook_id) {
            Some(mut ids) => {
                let excess = ids.len().saturating_sub(self.max_per_webhook);
                ids.drain(..excess).collect()
            }
            None => return,
        };

        for id in evicted {
            self.remove_entry(&id);
        }
    }

    fn prune_global(&self) {
        while self.logs.len() > self.max_total {
            let oldest = self.order.lock().pop_front();
            match oldest {
                Some(id) => {
                    self.remove_entry(&id);
                }
                None => break,
            }
        }

        let mut order = self.order.lock();
        if order.len() > self.max_total.saturating_mul(2) {
            order.retain(|id| self.logs.contains_key(id));
        }
    }

    fn collect(&self, ids: &[String]) -> Vec<WebhookDeliveryLog> {
        ids.iter()
            .filter_map(|id| self.logs.get(id).map(|log| log.clone()))
            .collect()
    }
}

impl Default for InMemoryDeliveryLogRepository {
    fn default() -> Self {
        Self::new(1000, 100_000)
    }
}

#[async_trait]
impl DeliveryLogRepository for InMemoryDeliveryLogRepository {
    async fn save(&self, log: &WebhookDeliveryLog) -> Result<()> {
        let attempt_id = log.attempt_id.clone();
        let is_new = self.logs.insert(attempt_id.clone(), log.clone()).is_none();

        if is_new {
            self.by_webhook
                .entry(log.webhook_id.clone())
                .or_default()
                .push_back(attempt_id.clone());
            self.by_delivery
                .entry(log.delivery_id.clone())
                .or_default()
                .push(attempt_id.clone());
            self.by_object
                .entry((log.repository_id.clone(), log.object_id.clone()))
                .or_default()
                .push(attempt_id.clone());
            self.order.lock().push_back(attempt_id);

            self.prune_webhook(&log.webhook_id);
            self.prune_global();
        }

        debug!(
            attempt_id = %log.attempt_id,
            status = ?log.status,
            "Saved delivery log"
        );
        Ok(())
    }

    async fn get_by_attempt_id(&self, attempt_id: &str) -> Result<Option<WebhookDeliveryLog>> {
        Ok(self.logs.get(attempt_id).map(|log| log.clone()))
    }

    async fn list_by_delivery_id(&self, delivery_id: &str) -> Result<Vec<WebhookDeliveryLog>> {
        let ids = self
            .by_delivery
            .get(delivery_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut logs = self.collect(&ids);
        logs.sort_by_key(|log| log.attempt_number);
        Ok(logs)
    }

    async fn list_by_object(
        &self,
        repository_id: &str,
        object_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>> {
        let key = (repository_id.to_string(), object_id.to_string());
        let ids = self
            .by_object
            .get(&key)
            .map(|ids| ids.iter().rev().take(limit).cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        Ok(self.collect(&ids))
    }

    async fn list_by_webhook(&self, webhook_id: &str, limit: usize) -> Result<Vec<WebhookDeliveryLog>> {
        let ids = self
            .by_webhook
            .get(webhook_id)
            .map(|ids| ids.iter().rev().take(limit).cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        Ok(self.collect(&ids))
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let to_remove: Vec<_> = self
            .logs
            .iter()
            .filter(|log| log.timestamp < older_than)
            .map(|log| log.attempt_id.clone())
            .collect();

        let removed = to_remove.iter().filter(|id| self.remove_entry(id)).count() as u64;
        self.order.lock().retain(|id| self.logs.contains_key(id));

        info!(removed = removed, "Cleaned up old delivery logs");

        Ok(removed)
    }
}
