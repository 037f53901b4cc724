//! Outbound transport
//!
//! [`WebhookDispatcher`] is the boundary that performs one HTTP POST.
//! [`HttpWebhookDispatcher`] is the reqwest implementation with an outbound
//! target guard.

use crate::{delivery_log::truncate_response_body, DispatcherSettings, Result, WebhookConfig, WebhookError};
use async_trait::async_trait;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, Client, Url};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub status_code: u16,
    /// Truncated to 4096 characters
    pub response_body: Option<String>,
    pub elapsed_ms: u64,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Performs a single POST of an already serialized payload.
///
/// Any HTTP response is `Ok`, whatever its status. `Err` means the request
/// never produced a response.
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        url: &str,
        payload: &str,
        headers: &HashMap<String, String>,
        config: &WebhookConfig,
    ) -> Result<DispatchOutcome>;
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct HttpDispatcherConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Skip the outbound target guard
    pub allow_private_targets: bool,
    pub user_agent: String,
}

impl Default for HttpDispatcherConfig {
    fn default() -> Self {
        (&DispatcherSettings::default()).into()
    }
}

impl From<&DispatcherSettings> for HttpDispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            allow_private_targets: settings.allow_private_targets,
            user_agent: settings.user_agent.clone(),
        }
    }
}

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.google.com",
];

/// Whether an address may be the target of an outbound webhook
pub fn is_address_safe(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_address_safe(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Static check of a webhook URL: http(s) scheme, and a host that is neither
/// a blocked name nor an unsafe literal address.
pub fn is_url_safe(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };

    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    if BLOCKED_HOSTS.contains(&host.as_str()) || host.ends_with(".localhost") {
        return false;
    }

    match host.parse::<IpAddr>() {
        Ok(addr) => is_address_safe(addr),
        Err(_) => true,
    }
}

/// Keep `addrs` only if every one of them is safe.
///
/// A host with any unsafe address is rejected as a whole, so a name that
/// mixes public and private records cannot be used to reach the private one.
pub fn filter_safe_addrs(host: &str, addrs: Vec<SocketAddr>) -> Result<Vec<SocketAddr>> {
    if addrs.is_empty() {
        return Err(WebhookError::UnsafeUrl(format!("{} has no addresses", host)));
    }
    if let Some(unsafe_addr) = addrs.iter().find(|addr| !is_address_safe(addr.ip())) {
        warn!(host = %host, resolved = %unsafe_addr.ip(), "Webhook host resolves to an unsafe address");
        return Err(WebhookError::UnsafeUrl(host.to_string()));
    }
    Ok(addrs)
}

/// Resolve `host` and return its addresses if they are all safe
pub async fn resolve_safe(host: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| WebhookError::Http(format!("failed to resolve {}: {}", host, e)))?
        .collect();
    filter_safe_addrs(host, addrs)
}

/// Resolver for the HTTP client.
///
/// Connections only go to addresses this resolver vetted, so a DNS answer
/// that changes between the target check and the connect is still checked.
struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs = resolve_safe(name.as_str())
                .await
                .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Whether a transport error wraps a rejection from [`GuardedResolver`]
fn is_guard_rejection(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if matches!(cause.downcast_ref::<WebhookError>(), Some(WebhookError::UnsafeUrl(_))) {
            return true;
        }
        source = cause.source();
    }
    false
}

/// reqwest-backed dispatcher
pub struct HttpWebhookDispatcher {
    client: Client,
    config: HttpDispatcherConfig,
}

impl HttpWebhookDispatcher {
    pub fn new(config: HttpDispatcherConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.clone());
        if !config.allow_private_targets {
            builder = builder.dns_resolver(Arc::new(GuardedResolver));
        }
        let client = builder.build()?;

        Ok(Self { client, config })
    }

    /// Reject unsafe targets, including host names resolving to unsafe addresses.
    /// The client's resolver repeats the address check at connect time.
    async fn check_target(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url).map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", url, e)))?;
        if self.config.allow_private_targets {
            return Ok(parsed);
        }

        if !is_url_safe(url) {
            return Err(WebhookError::UnsafeUrl(url.to_string()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| WebhookError::InvalidUrl(url.to_string()))?
            .to_string();
        if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_err() {
            resolve_safe(&host)
                .await
                .map_err(|e| match e {
                    WebhookError::UnsafeUrl(_) => WebhookError::UnsafeUrl(url.to_string()),
                    other => other,
                })?;
        }

        Ok(parsed)
    }
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(
        &self,
        url: &str,
        payload: &str,
        headers: &HashMap<String, String>,
        config: &WebhookConfig,
    ) -> Result<DispatchOutcome> {
        let target = self.check_target(url).await?;

        let mut request = self.client.post(target);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let response = request.body(payload.to_string()).send().await.map_err(|e| {
            if is_guard_rejection(&e) {
                WebhookError::UnsafeUrl(url.to_string())
            } else {
                WebhookError::from(e)
            }
        })?;
        let status_code = response.status().as_u16();
        let response_body = response
            .text()
            .await
            .ok()
            .filter(|body| !body.is_empty())
            .map(|body| truncate_response_body(&body));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(
            webhook_id = %config.id,
            status = status_code,
            elapsed_ms = elapsed_ms,
            "Webhook endpoint responded"
        );

        Ok(DispatchOutcome {
            status_code,
            response_body,
            elapsed_ms,
        })
    }
}
