//! Webhook delivery
//!
//! Payload construction, authentication headers, HMAC signing, retry
//! eligibility and backoff, and the multi-attempt delivery loop.

use crate::{
    signature, DeliveryLogRepository, DeliveryMeta, Properties, Result, WebhookConfig,
    WebhookDeliveryLog, WebhookDispatcher, WebhookPayload, AuthType,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Properties never sent to webhook endpoints
pub const SENSITIVE_PROPERTIES: [&str; 3] = [
    "nemaki:webhookConfigs",
    "nemaki:webhookSecret",
    "nemaki:authCredential",
];

pub const HEADER_EVENT: &str = "X-NemakiWare-Event";
pub const HEADER_DELIVERY: &str = "X-NemakiWare-Delivery";
pub const HEADER_TIMESTAMP: &str = "X-NemakiWare-Timestamp";

/// Copy of `properties` without sensitive keys
pub fn filter_sensitive_properties(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(key, _)| !SENSITIVE_PROPERTIES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Exponential backoff with additive jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Cap applied before jitter
    pub max: Duration,
    /// Upper bound of the random extra, as a fraction of the capped delay
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(attempt - 1)` capped at `max`, plus up to `jitter_factor`
    /// of that. Attempts below 1 count as 1.
    pub fn calculate_delay(&self, attempt: i64) -> Duration {
        let exponent = (attempt.max(1) - 1).min(32) as u32;
        let base_ms = self.base.as_millis() as f64;
        let capped_ms = (base_ms * 2f64.powi(exponent as i32)).min(self.max.as_millis() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };

        Duration::from_millis((capped_ms * (1.0 + jitter)) as u64)
    }
}

impl From<&WebhookPayload> for DeliveryMeta {
    fn from(payload: &WebhookPayload) -> Self {
        Self {
            delivery_id: payload.delivery_id.clone(),
            event_type: payload.event_type.clone(),
            object_id: payload.object_id.clone(),
            repository_id: payload.repository_id.clone(),
            change_token: payload.change_token.clone(),
        }
    }
}

/// Final state of one logical delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivery_id: String,
    pub webhook_id: String,
    pub success: bool,
    /// Attempts made by this call
    pub attempts: u32,
    pub last_status_code: Option<u16>,
}

/// Stateless delivery protocol
#[derive(Debug, Clone, Default)]
pub struct DeliveryService {
    backoff: BackoffPolicy,
}

impl DeliveryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn generate_delivery_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Payload with a fresh delivery id and the current time
    pub fn build_payload(
        &self,
        event_type: &str,
        object_id: &str,
        repository_id: &str,
        properties: Option<&Properties>,
        change_token: Option<&str>,
    ) -> WebhookPayload {
        WebhookPayload {
            event_type: event_type.to_string(),
            object_id: object_id.to_string(),
            repository_id: repository_id.to_string(),
            delivery_id: Self::generate_delivery_id(),
            timestamp: Utc::now().timestamp_millis(),
            change_token: change_token.map(str::to_string),
            object_path: None,
            parent_id: None,
            user_id: None,
            properties: properties.map(filter_sensitive_properties).unwrap_or_default(),
        }
    }

    /// Static config headers plus at most one authentication header
    pub fn generate_auth_headers(&self, config: &WebhookConfig) -> HashMap<String, String> {
        let mut headers = config.headers.clone();

        let auth_type = config.auth_type.unwrap_or(AuthType::None);
        if !auth_type.requires_credential() {
            return headers;
        }

        let credential = match config.auth_credential.as_deref().filter(|c| !c.is_empty()) {
            Some(credential) => credential,
            None => {
                warn!(
                    webhook_id = %config.id,
                    auth_type = %auth_type,
                    "Webhook auth type requires a credential but none is configured"
                );
                return headers;
            }
        };

        match auth_type {
            AuthType::Basic => {
                headers.insert(
                    "Authorization".to_string(),
                    format!("Basic {}", STANDARD.encode(credential)),
                );
            }
            AuthType::Bearer => {
                headers.insert("Authorization".to_string(), format!("Bearer {}", credential));
            }
            AuthType::ApiKey => {
                headers.insert("X-API-Key".to_string(), credential.to_string());
            }
            AuthType::None => {}
        }

        headers
    }

    pub fn compute_hmac_signature(&self, payload: &str, secret: Option<&str>) -> Option<String> {
        signature::compute_hmac_signature(payload, secret)
    }

    pub fn calculate_backoff_delay(&self, attempt: i64) -> Duration {
        self.backoff.calculate_delay(attempt)
    }

    /// Whether attempt number `attempt` (1-based) that ended with `status_code`
    /// should be followed by another attempt.
    pub fn should_retry(&self, config: &WebhookConfig, attempt: u32, status_code: u16) -> bool {
        if attempt > config.effective_retry_count() {
            return false;
        }

        match status_code {
            200..=299 => false,
            429 => true,
            400..=499 => false,
            500..=599 => true,
            _ => false,
        }
    }

    /// JSON body in wire field order, sensitive properties removed
    pub fn serialize_payload(&self, payload: &WebhookPayload) -> Result<String> {
        if payload
            .properties
            .keys()
            .any(|key| SENSITIVE_PROPERTIES.contains(&key.as_str()))
        {
            let mut filtered = payload.clone();
            filtered.properties = filter_sensitive_properties(&payload.properties);
            return Ok(serde_json::to_string(&filtered)?);
        }
        Ok(serde_json::to_string(payload)?)
    }

    /// Everything sent with one request body
    pub fn delivery_headers(
        &self,
        config: &WebhookConfig,
        event_type: &str,
        delivery_id: &str,
        timestamp_ms: i64,
        body: &str,
    ) -> HashMap<String, String> {
        let mut headers = self.generate_auth_headers(config);
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(HEADER_EVENT.to_string(), event_type.to_string());
        headers.insert(HEADER_DELIVERY.to_string(), delivery_id.to_string());
        headers.insert(HEADER_TIMESTAMP.to_string(), timestamp_ms.to_string());

        if let Some(sig) = signature::signature_header_value(body, config.secret.as_deref()) {
            headers.insert(signature::SIGNATURE_HEADER.to_string(), sig);
        }

        headers
    }

    /// Serialize `payload` and deliver it to `config` with retries
    pub async fn deliver(
        &self,
        dispatcher: &dyn WebhookDispatcher,
        logs: &dyn DeliveryLogRepository,
        config: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> Result<DeliveryReport> {
        let body = self.serialize_payload(payload)?;
        let meta = DeliveryMeta::from(payload);
        Ok(self
            .deliver_serialized(dispatcher, logs, config, &meta, payload.timestamp, &body)
            .await)
    }

    /// Deliver a pre-serialized body.
    ///
    /// Each attempt is logged. Transport errors are treated like a 503 for the
    /// retry decision; an unsafe or invalid target is never retried.
    pub async fn deliver_serialized(
        &self,
        dispatcher: &dyn WebhookDispatcher,
        logs: &dyn DeliveryLogRepository,
        config: &WebhookConfig,
        meta: &DeliveryMeta,
        timestamp_ms: i64,
        body: &str,
    ) -> DeliveryReport {
        let headers = self.delivery_headers(config, &meta.event_type, &meta.delivery_id, timestamp_ms, body);
        let mut log = WebhookDeliveryLog::for_attempt(config, meta, 1, body.len());
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            log.mark_processing();
            save_log(logs, &log).await;

            let retry_status = match dispatcher.dispatch(&config.url, body, &headers, config).await {
                Ok(outcome) if outcome.is_success() => {
                    log.mark_success(outcome.status_code, outcome.response_body.as_deref(), outcome.elapsed_ms);
                    save_log(logs, &log).await;
                    info!(
                        webhook_id = %config.id,
                        delivery_id = %meta.delivery_id,
                        attempt = log.attempt_number,
                        status = outcome.status_code,
                        "Webhook delivered"
                    );
                    return DeliveryReport {
                        delivery_id: meta.delivery_id.clone(),
                        webhook_id: config.id.clone(),
                        success: true,
                        attempts,
                        last_status_code: Some(outcome.status_code),
                    };
                }
                Ok(outcome) => {
                    log.mark_failure(
                        Some(outcome.status_code),
                        outcome.response_body.as_deref(),
                        &format!("HTTP {}", outcome.status_code),
                        Some(outcome.elapsed_ms),
                    );
                    Some(outcome.status_code)
                }
                Err(e) if e.is_transient() => {
                    log.mark_failure(None, None, &e.to_string(), None);
                    Some(503)
                }
                Err(e) => {
                    log.mark_failure(None, None, &e.to_string(), None);
                    None
                }
            };
            save_log(logs, &log).await;

            let retry = retry_status
                .map(|status| self.should_retry(config, log.attempt_number, status))
                .unwrap_or(false);

            if !retry {
                warn!(
                    webhook_id = %config.id,
                    delivery_id = %meta.delivery_id,
                    attempt = log.attempt_number,
                    error = log.error_message.as_deref().unwrap_or_default(),
                    "Webhook delivery failed"
                );
                return DeliveryReport {
                    delivery_id: meta.delivery_id.clone(),
                    webhook_id: config.id.clone(),
                    success: false,
                    attempts,
                    last_status_code: log.status_code,
                };
            }

            let delay = self.calculate_backoff_delay(log.attempt_number as i64);
            debug!(
                webhook_id = %config.id,
                delivery_id = %meta.delivery_id,
                attempt = log.attempt_number,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retry"
            );
            tokio::time::sleep(delay).await;

            log = log.next_attempt();
        }
    }
}

async fn save_log(logs: &dyn DeliveryLogRepository, log: &WebhookDeliveryLog) {
    if let Err(e) = logs.save(log).await {
        warn!(attempt_id = %log.attempt_id, error = %e, "Failed to persist delivery log");
    }
}
