//! Webhook fan-out for NemakiWare repositories
//!
//! This crate turns repository change events into reliable webhook deliveries:
//! - Matching change events against registered webhook configurations
//! - Batching child-folder events into time-windowed `CHILD_BATCH` deliveries
//! - Payload construction, authentication headers and HMAC signing
//! - Retry eligibility, exponential backoff and per-attempt delivery logs
//!
//! # Features
//!
//! - **Event Matching**: Case-insensitive event filters over the eight recognized event types
//! - **Child Batching**: Per-folder queues with rate limiting and a backlog circuit breaker
//! - **Signed Delivery**: `X-NemakiWare-Signature: sha256=<hex>` over the exact request body
//! - **Delivery Tracking**: One log row per attempt, linked by a stable delivery id
//! - **Outbound Guard**: The HTTP dispatcher refuses loopback, private and metadata targets
//!
//! # Example
//!
//! ```rust,ignore
//! use nemaki_webhook::{
//!     HttpWebhookDispatcher, InMemoryConfigSource, InMemoryDeliveryLogRepository,
//!     ObjectChange, WebhookConfig, WebhookEventType, WebhookService, WebhookSettings,
//! };
//! use std::sync::Arc;
//!
//! let settings = WebhookSettings::load()?;
//! let configs = Arc::new(InMemoryConfigSource::new());
//! configs.register(
//!     "bedroom",
//!     "folder-1",
//!     vec![WebhookConfig::new("w1", "https://example.com/hook").with_events(["CHILD_CREATED"])],
//! );
//!
//! let service = WebhookService::new(
//!     configs,
//!     Arc::new(HttpWebhookDispatcher::new((&settings.dispatcher).into())?),
//!     Arc::new(InMemoryDeliveryLogRepository::default()),
//!     &settings,
//! );
//! service.start();
//!
//! service
//!     .notify(
//!         ObjectChange::new("bedroom", "doc-1", WebhookEventType::Created)
//!             .with_parent("folder-1", Some("/Sites")),
//!     )
//!     .await?;
//! ```

// Module order matters due to dependencies
pub mod events;
pub mod webhook_config;
pub mod matcher;
pub mod signature;
pub mod settings;
pub mod delivery_log;
pub mod dispatcher;
pub mod delivery;
pub mod batch;
pub mod service;

pub use events::*;
pub use webhook_config::*;
pub use matcher::*;
pub use signature::*;
pub use settings::*;
pub use delivery_log::*;
pub use dispatcher::*;
pub use delivery::*;
pub use batch::*;
pub use service::*;

use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Refusing to deliver to unsafe target: {0}")]
    UnsafeUrl(String),

    #[error("Invalid webhook configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Batch delivery failed: {0}")]
    BatchDelivery(String),

    #[error("Processor is shutting down")]
    ShuttingDown,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl WebhookError {
    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::DeliveryFailed(_) | Self::BatchDelivery(_)
        )
    }
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        WebhookError::Http(err.to_string())
    }
}

impl From<::config::ConfigError> for WebhookError {
    fn from(err: ::config::ConfigError) -> Self {
        WebhookError::Settings(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
