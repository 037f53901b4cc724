//! Webhook subscription configuration
//!
//! A [`WebhookConfig`] is one subscription attached to a repository object,
//! usually parsed from the `nemaki:webhookConfigs` JSON property.

use crate::{Result, WebhookError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Authentication scheme used when calling the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum AuthType {
    None,
    Basic,
    Bearer,
    ApiKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Bearer => "bearer",
            Self::ApiKey => "apikey",
        }
    }

    pub fn requires_credential(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AuthType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "basic" => Ok(Self::Basic),
            "bearer" => Ok(Self::Bearer),
            "apikey" | "api_key" => Ok(Self::ApiKey),
            other => Err(format!("unsupported auth type: {}", other)),
        }
    }
}

impl From<AuthType> for &'static str {
    fn from(value: AuthType) -> Self {
        value.as_str()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One webhook subscription
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    /// Subscribed event types, compared case-insensitively
    #[serde(default, deserialize_with = "null_as_default")]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_credential: Option<String>,
    /// HMAC signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Static headers sent with every delivery
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub include_children: bool,
    /// `None` means unlimited depth for inherited subscriptions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
}

impl WebhookConfig {
    /// Create an enabled config with no event filter yet
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            enabled: true,
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auth(mut self, auth_type: AuthType, credential: Option<&str>) -> Self {
        self.auth_type = Some(auth_type);
        self.auth_credential = credential.map(str::to_string);
        self
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_children(mut self, max_depth: Option<u32>) -> Self {
        self.include_children = true;
        self.max_depth = max_depth;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn requires_auth_credential(&self) -> bool {
        self.auth_type
            .map(|t| t.requires_credential())
            .unwrap_or(false)
    }

    fn has_credential(&self) -> bool {
        self.auth_credential
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Same rules as [`is_valid`](Self::is_valid), reporting the first violation
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(WebhookError::InvalidConfig("id is required".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(WebhookError::InvalidConfig(format!(
                "{}: url is required",
                self.id
            )));
        }
        if self.events.is_empty() {
            return Err(WebhookError::InvalidConfig(format!(
                "{}: at least one event is required",
                self.id
            )));
        }
        if self.requires_auth_credential() && !self.has_credential() {
            return Err(WebhookError::InvalidConfig(format!(
                "{}: auth type {} requires a credential",
                self.id,
                self.auth_type.unwrap_or(AuthType::None)
            )));
        }
        Ok(())
    }

    /// Enabled and subscribed to `event_type` (case-insensitive)
    pub fn matches_event(&self, event_type: &str) -> bool {
        self.enabled
            && self
                .events
                .iter()
                .any(|e| e.trim().eq_ignore_ascii_case(event_type.trim()))
    }

    /// Retries allowed after the first attempt; absent or negative means none
    pub fn effective_retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0).max(0) as u32
    }
}

/// Parse the JSON array stored in `nemaki:webhookConfigs`.
///
/// Malformed input yields an empty list. Entries that fail to deserialize are
/// skipped individually; validation is left to the caller.
pub fn parse_configs(json: &str) -> Vec<WebhookConfig> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let entries: Vec<serde_json::Value> = match serde_json::from_str(trimmed) {
        Ok(serde_json::Value::Array(entries)) => entries,
        Ok(_) => {
            warn!("Webhook config JSON is not an array, ignoring");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse webhook config JSON");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(index = index, error = %e, "Skipping malformed webhook config entry");
                None
            }
        })
        .collect()
}

/// Parse and keep only enabled, valid configs
pub fn parse_active_configs(json: &str) -> Vec<WebhookConfig> {
    parse_configs(json)
        .into_iter()
        .filter(|config| {
            if let Err(e) = config.validate() {
                debug!(error = %e, "Dropping invalid webhook config");
                return false;
            }
            config.enabled
        })
        .collect()
}

/// Serialize configs back into the `nemaki:webhookConfigs` JSON form
pub fn serialize_configs(configs: &[WebhookConfig]) -> Result<String> {
    Ok(serde_json::to_string(configs)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WebhookConfig {
        WebhookConfig::new("webhook-1", "https://example.com/webhook")
            .with_events(["CREATED", "UPDATED"])
    }

    #[test]
    fn test_builder() {
        let config = sample()
            .with_auth(AuthType::Bearer, Some("test-token"))
            .with_secret("hmac-secret")
            .with_children(Some(5))
            .with_retry_count(3);

        assert_eq!(config.id, "webhook-1");
        assert!(config.enabled);
        assert_eq!(config.events.len(), 2);
        assert_eq!(config.auth_type, Some(AuthType::Bearer));
        assert_eq!(config.auth_credential.as_deref(), Some("test-token"));
        assert!(config.include_children);
        assert_eq!(config.max_depth, Some(5));
        assert_eq!(config.effective_retry_count(), 3);
    }

    #[test]
    fn test_default_config_is_disabled_and_invalid() {
        let config = WebhookConfig::default();
        assert!(!config.enabled);
        assert!(config.events.is_empty());
        assert!(!config.is_valid());
    }

    #[test]
    fn test_matches_event() {
        let config = sample();
        assert!(config.matches_event("CREATED"));
        assert!(config.matches_event("created"));
        assert!(config.matches_event("Updated"));
        assert!(!config.matches_event("DELETED"));

        let disabled = sample().with_enabled(false);
        assert!(!disabled.matches_event("CREATED"));

        let no_events = WebhookConfig::new("w", "https://example.com");
        assert!(!no_events.matches_event("CREATED"));
    }

    #[test]
    fn test_validity() {
        assert!(sample().is_valid());
        assert!(!WebhookConfig::new("", "https://example.com").with_events(["CREATED"]).is_valid());
        assert!(!WebhookConfig::new("w", "").with_events(["CREATED"]).is_valid());
        assert!(!WebhookConfig::new("w", "https://example.com").is_valid());

        assert!(!sample().with_auth(AuthType::Basic, None).is_valid());
        assert!(!sample().with_auth(AuthType::ApiKey, Some("  ")).is_valid());
        assert!(sample().with_auth(AuthType::Bearer, Some("token")).is_valid());
        assert!(sample().with_auth(AuthType::None, None).is_valid());
    }

    #[test]
    fn test_requires_auth_credential() {
        assert!(!sample().requires_auth_credential());
        assert!(!sample().with_auth(AuthType::None, None).requires_auth_credential());
        assert!(sample().with_auth(AuthType::Basic, None).requires_auth_credential());
        assert!(sample().with_auth(AuthType::Bearer, None).requires_auth_credential());
        assert!(sample().with_auth(AuthType::ApiKey, None).requires_auth_credential());
    }

    #[test]
    fn test_negative_or_missing_retry_count_means_no_retries() {
        assert_eq!(sample().effective_retry_count(), 0);
        assert_eq!(sample().with_retry_count(-5).effective_retry_count(), 0);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"[{
            "id": "webhook-1",
            "enabled": true,
            "url": "https://example.com/webhook",
            "events": ["CREATED", "UPDATED", "DELETED"],
            "authType": "Bearer",
            "authCredential": "my-token",
            "secret": "hmac-secret",
            "headers": {"X-Custom-Header": "value1"},
            "includeChildren": true,
            "maxDepth": 5,
            "retryCount": 3
        }]"#;

        let configs = parse_configs(json);
        assert_eq!(configs.len(), 1);

        let config = &configs[0];
        assert_eq!(config.auth_type, Some(AuthType::Bearer));
        assert_eq!(config.secret.as_deref(), Some("hmac-secret"));
        assert_eq!(config.headers.get("X-Custom-Header").map(String::as_str), Some("value1"));
        assert_eq!(config.max_depth, Some(5));
        assert_eq!(config.retry_count, Some(3));
        assert!(config.is_valid());
    }

    #[test]
    fn test_parse_null_and_missing_optionals() {
        let json = r#"[{
            "id": "webhook-1",
            "enabled": true,
            "url": "https://example.com/webhook",
            "events": ["CREATED"],
            "authType": null,
            "headers": null,
            "maxDepth": null
        }]"#;

        let configs = parse_configs(json);
        assert_eq!(configs.len(), 1);
        assert!(configs[0].auth_type.is_none());
        assert!(configs[0].headers.is_empty());
        assert!(!configs[0].include_children);
        assert!(configs[0].retry_count.is_none());
    }

    #[test]
    fn test_parse_garbage_yields_empty() {
        assert!(parse_configs("").is_empty());
        assert!(parse_configs("   ").is_empty());
        assert!(parse_configs("[]").is_empty());
        assert!(parse_configs("{not json").is_empty());
        assert!(parse_configs(r#"{"id": "webhook-1"}"#).is_empty());
    }

    #[test]
    fn test_parse_skips_only_malformed_entries() {
        let json = r#"[
            {"id": "ok", "enabled": true, "url": "https://a", "events": ["CREATED"]},
            {"id": "bad", "enabled": true, "url": "https://b", "events": ["CREATED"], "authType": "kerberos"},
            {"enabled": true, "url": "https://c", "events": ["CREATED"]}
        ]"#;

        let configs = parse_configs(json);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, "ok");
        assert!(!configs[1].is_valid());

        let active = parse_active_configs(json);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "ok");
    }

    #[test]
    fn test_round_trip() {
        let original = vec![sample()
            .with_auth(AuthType::ApiKey, Some("key"))
            .with_children(Some(2))];

        let json = serialize_configs(&original).unwrap();
        assert!(json.contains("\"authType\":\"apikey\""));
        assert!(!json.contains("secret"));

        let reparsed = parse_configs(&json);
        assert_eq!(reparsed, original);
        assert_eq!(serialize_configs(&[]).unwrap(), "[]");
    }
}
