//! Webhook event types
//!
//! Defines the recognized event types, the per-object child event, the
//! aggregated child batch and the per-delivery payload.

use crate::{Result, WebhookError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Property bag carried by events and payloads. Ordered so serialized
/// output is stable.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Webhook event types
///
/// Serialized in upper case; deserialized case-insensitively, like [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum WebhookEventType {
    // Object events
    Created,
    Updated,
    Deleted,
    Security,

    // Folder child events
    ChildCreated,
    ChildUpdated,
    ChildDeleted,
    ChildBatch,
}

impl WebhookEventType {
    /// Every recognized event type.
    pub const ALL: [WebhookEventType; 8] = [
        Self::Created,
        Self::Updated,
        Self::Deleted,
        Self::Security,
        Self::ChildCreated,
        Self::ChildUpdated,
        Self::ChildDeleted,
        Self::ChildBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
            Self::Security => "SECURITY",
            Self::ChildCreated => "CHILD_CREATED",
            Self::ChildUpdated => "CHILD_UPDATED",
            Self::ChildDeleted => "CHILD_DELETED",
            Self::ChildBatch => "CHILD_BATCH",
        }
    }

    /// Whether this is one of the `CHILD_*` types emitted for a monitored folder
    pub fn is_child(&self) -> bool {
        matches!(
            self,
            Self::ChildCreated | Self::ChildUpdated | Self::ChildDeleted | Self::ChildBatch
        )
    }

    /// Child counterpart of a base object event, if it has one
    pub fn to_child(&self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::ChildCreated),
            Self::Updated => Some(Self::ChildUpdated),
            Self::Deleted => Some(Self::ChildDeleted),
            _ => None,
        }
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventType {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| WebhookError::UnknownEventType(s.to_string()))
    }
}

impl TryFrom<String> for WebhookEventType {
    type Error = WebhookError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A change to one object, as reported by the repository layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectChange {
    pub repository_id: String,
    pub object_id: String,
    pub event_type: WebhookEventType,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object_path: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub change_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ObjectChange {
    pub fn new(repository_id: &str, object_id: &str, event_type: WebhookEventType) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            object_id: object_id.to_string(),
            event_type,
            object_name: None,
            object_type: None,
            object_path: None,
            parent_id: None,
            parent_path: None,
            properties: Properties::new(),
            change_token: None,
            user_id: None,
        }
    }

    pub fn with_object(mut self, name: &str, object_type: &str) -> Self {
        self.object_name = Some(name.to_string());
        self.object_type = Some(object_type.to_string());
        self
    }

    pub fn with_object_path(mut self, path: &str) -> Self {
        self.object_path = Some(path.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: &str, parent_path: Option<&str>) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self.parent_path = parent_path.map(str::to_string);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_change_token(mut self, token: &str) -> Self {
        self.change_token = Some(token.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
}

/// One object-level change inside a monitored folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildEvent {
    pub parent_folder_id: String,
    pub parent_folder_path: Option<String>,
    pub object_id: String,
    pub object_name: Option<String>,
    pub object_type: Option<String>,
    pub event_type: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Properties,
    pub change_token: Option<String>,
    pub user_id: Option<String>,
}

impl ChildEvent {
    pub fn new(parent_folder_id: &str, object_id: &str, event_type: WebhookEventType) -> Self {
        Self {
            parent_folder_id: parent_folder_id.to_string(),
            parent_folder_path: None,
            object_id: object_id.to_string(),
            object_name: None,
            object_type: None,
            event_type,
            timestamp: Utc::now(),
            properties: Properties::new(),
            change_token: None,
            user_id: None,
        }
    }

    pub fn with_folder_path(mut self, path: &str) -> Self {
        self.parent_folder_path = Some(path.to_string());
        self
    }

    pub fn with_object(mut self, name: &str, object_type: &str) -> Self {
        self.object_name = Some(name.to_string());
        self.object_type = Some(object_type.to_string());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_change_token(mut self, token: &str) -> Self {
        self.change_token = Some(token.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
}

/// Child events of one folder aggregated over a batch window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildEventBatch {
    pub batch_id: String,
    pub repository_id: String,
    pub parent_folder_id: String,
    pub parent_folder_path: Option<String>,
    pub event_type: WebhookEventType,
    pub events: Vec<ChildEvent>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub webhook_config_id: Option<String>,
    pub webhook_url: Option<String>,
}

impl ChildEventBatch {
    pub fn new(
        repository_id: &str,
        parent_folder_id: &str,
        events: Vec<ChildEvent>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        let parent_folder_path = events
            .iter()
            .find_map(|e| e.parent_folder_path.clone());

        Self {
            batch_id: format!("batch_{}", Uuid::new_v4().simple()),
            repository_id: repository_id.to_string(),
            parent_folder_id: parent_folder_id.to_string(),
            parent_folder_path,
            event_type: WebhookEventType::ChildBatch,
            events,
            window_start,
            window_end,
            webhook_config_id: None,
            webhook_url: None,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Copy of this batch addressed to one webhook
    pub fn for_webhook(&self, config_id: &str, url: &str) -> Self {
        let mut batch = self.clone();
        batch.webhook_config_id = Some(config_id.to_string());
        batch.webhook_url = Some(url.to_string());
        batch
    }
}

/// Per-delivery payload for a single object event.
///
/// Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event_type: String,
    pub object_id: String,
    pub repository_id: String,
    /// Stable across every retry of the same logical delivery
    pub delivery_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl WebhookPayload {
    pub fn with_parent_id(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_object_path(mut self, path: &str) -> Self {
        self.object_path = Some(path.to_string());
        self
    }
}
