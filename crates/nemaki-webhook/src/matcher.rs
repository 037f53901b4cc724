//! Event matching
//!
//! Selects the webhook configs interested in an event type and classifies
//! event types as object or child events.

use crate::{WebhookConfig, WebhookEventType};
use tracing::warn;

/// Enabled configs subscribed to `event_type`, in input order.
///
/// Unrecognized event types match nothing.
pub fn find_matching_configs<'a>(
    configs: &'a [WebhookConfig],
    event_type: &str,
) -> Vec<&'a WebhookConfig> {
    if !is_valid_event_type(event_type) {
        warn!(event_type = %event_type, "Ignoring unrecognized webhook event type");
        return Vec::new();
    }

    configs
        .iter()
        .filter(|config| config.matches_event(event_type))
        .collect()
}

/// True if `config` matches any of the given event types
pub fn matches_any(config: &WebhookConfig, event_types: &[WebhookEventType]) -> bool {
    event_types.iter().any(|t| config.matches_event(t.as_str()))
}

pub fn is_valid_event_type(event_type: &str) -> bool {
    event_type.parse::<WebhookEventType>().is_ok()
}

pub fn is_child_event_type(event_type: &str) -> bool {
    event_type
        .parse::<WebhookEventType>()
        .map(|t| t.is_child())
        .unwrap_or(false)
}

/// `CREATED` -> `CHILD_CREATED` and so on; `None` for anything else
pub fn to_child_event_type(event_type: &str) -> Option<&'static str> {
    event_type
        .parse::<WebhookEventType>()
        .ok()?
        .to_child()
        .map(|t| t.as_str())
}
