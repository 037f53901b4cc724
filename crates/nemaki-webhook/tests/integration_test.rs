//! Integration tests for the nemaki-webhook crate.

use async_trait::async_trait;
use nemaki_webhook::{
    verify_signature, AuthType, DeliveryLogRepository, DeliveryStatus, DispatchOutcome,
    HttpDispatcherConfig, HttpWebhookDispatcher, InMemoryConfigSource,
    InMemoryDeliveryLogRepository, ObjectChange, Result, WebhookConfig, WebhookDispatcher,
    WebhookEventType, WebhookService, WebhookSettings, HEADER_DELIVERY, HEADER_EVENT,
    SIGNATURE_HEADER,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone)]
struct Request {
    url: String,
    body: String,
    headers: HashMap<String, String>,
}

impl Request {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Records every request and answers with scripted status codes (200 once
/// the script runs out), optionally after a delay.
#[derive(Default)]
struct RecordingDispatcher {
    requests: Mutex<Vec<Request>>,
    statuses: Mutex<VecDeque<u16>>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    fn with_statuses(statuses: &[u16]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WebhookDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        url: &str,
        payload: &str,
        headers: &HashMap<String, String>,
        _config: &WebhookConfig,
    ) -> Result<DispatchOutcome> {
        self.requests.lock().push(Request {
            url: url.to_string(),
            body: payload.to_string(),
            headers: headers.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let status_code = self.statuses.lock().pop_front().unwrap_or(200);
        Ok(DispatchOutcome {
            status_code,
            response_body: None,
            elapsed_ms: 1,
        })
    }
}

struct Harness {
    configs: Arc<InMemoryConfigSource>,
    dispatcher: Arc<RecordingDispatcher>,
    logs: Arc<InMemoryDeliveryLogRepository>,
    service: WebhookService,
}

fn harness_with(dispatcher: RecordingDispatcher, settings: WebhookSettings) -> Harness {
    let configs = Arc::new(InMemoryConfigSource::new());
    let dispatcher = Arc::new(dispatcher);
    let logs = Arc::new(InMemoryDeliveryLogRepository::default());
    let service = WebhookService::new(configs.clone(), dispatcher.clone(), logs.clone(), &settings);
    Harness {
        configs,
        dispatcher,
        logs,
        service,
    }
}

fn harness() -> Harness {
    harness_with(RecordingDispatcher::default(), WebhookSettings::default())
}

fn created_in(object_id: &str, folder_id: &str) -> ObjectChange {
    ObjectChange::new("bedroom", object_id, WebhookEventType::Created)
        .with_object(&format!("{}.txt", object_id), "cmis:document")
        .with_parent(folder_id, Some("/Sites/Docs"))
        .with_user("admin")
}

// ==================== Direct Delivery Tests ====================

#[tokio::test(start_paused = true)]
async fn test_notify_delivers_own_and_inherited_configs() {
    let h = harness();
    h.configs.register(
        "bedroom",
        "doc-1",
        vec![WebhookConfig::new("own", "https://own.example.com/hook").with_events(["created"])],
    );
    h.configs.register(
        "bedroom",
        "folder-1",
        vec![
            WebhookConfig::new("inherited", "https://folder.example.com/hook")
                .with_events(["CREATED"])
                .with_children(None)
                .with_secret("folder-secret"),
            WebhookConfig::new("folder-only", "https://folder.example.com/other").with_events(["CREATED"]),
        ],
    );

    let spawned = h.service.notify(created_in("doc-1", "folder-1")).await.unwrap();
    assert_eq!(spawned, 2);
    h.service.drain().await;

    let mut requests = h.dispatcher.requests();
    requests.sort_by(|a, b| a.url.cmp(&b.url));
    assert_eq!(requests.len(), 2);

    let inherited = &requests[0];
    assert_eq!(inherited.url, "https://folder.example.com/hook");
    assert_eq!(inherited.headers[HEADER_EVENT], "CREATED");
    assert!(verify_signature(
        &inherited.body,
        "folder-secret",
        &inherited.headers[SIGNATURE_HEADER]
    ));

    let body = inherited.json();
    assert_eq!(body["eventType"], "CREATED");
    assert_eq!(body["objectId"], "doc-1");
    assert_eq!(body["parentId"], "folder-1");
    assert_eq!(body["userId"], "admin");
    assert_eq!(body["deliveryId"], inherited.headers[HEADER_DELIVERY].as_str());

    assert!(!requests[1].headers.contains_key(SIGNATURE_HEADER));

    let logs = h.service.delivery_logs("bedroom", "doc-1", 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.success && log.status == DeliveryStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_notify_without_matches_delivers_nothing() {
    let h = harness();
    h.configs.register(
        "bedroom",
        "doc-1",
        vec![WebhookConfig::new("w1", "https://example.com/hook").with_events(["DELETED"])],
    );

    let spawned = h
        .service
        .notify(ObjectChange::new("bedroom", "doc-1", WebhookEventType::Updated))
        .await
        .unwrap();

    assert_eq!(spawned, 0);
    h.service.drain().await;
    assert!(h.dispatcher.requests().is_empty());
    assert!(h.logs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_delivery_is_retried_with_same_delivery_id() {
    let h = harness_with(RecordingDispatcher::with_statuses(&[503, 500]), WebhookSettings::default());
    h.configs.register(
        "bedroom",
        "doc-1",
        vec![WebhookConfig::new("w1", "https://example.com/hook")
            .with_events(["CREATED"])
            .with_auth(AuthType::Bearer, Some("token-1"))
            .with_retry_count(3)],
    );

    h.service
        .notify(ObjectChange::new("bedroom", "doc-1", WebhookEventType::Created))
        .await
        .unwrap();
    h.service.drain().await;

    let requests = h.dispatcher.requests();
    assert_eq!(requests.len(), 3);
    let delivery_id = &requests[0].headers[HEADER_DELIVERY];
    assert!(requests.iter().all(|r| &r.headers[HEADER_DELIVERY] == delivery_id));
    assert!(requests.iter().all(|r| r.headers["Authorization"] == "Bearer token-1"));
    assert!(requests.windows(2).all(|w| w[0].body == w[1].body));

    let attempts = h.logs.list_by_delivery_id(delivery_id).await.unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(attempts[2].status, DeliveryStatus::Success);

    let stats = h.service.delivery_stats("w1").await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_capacity_is_bounded() {
    let mut settings = WebhookSettings::default();
    settings.delivery.max_pending_deliveries = 1;
    let h = harness_with(RecordingDispatcher::slow(Duration::from_secs(10)), settings);
    h.configs.register(
        "bedroom",
        "doc-1",
        vec![
            WebhookConfig::new("w1", "https://a.example.com").with_events(["UPDATED"]),
            WebhookConfig::new("w2", "https://b.example.com").with_events(["UPDATED"]),
        ],
    );

    let spawned = h
        .service
        .notify(ObjectChange::new("bedroom", "doc-1", WebhookEventType::Updated))
        .await
        .unwrap();
    assert_eq!(spawned, 1);

    h.service.drain().await;
    assert_eq!(h.dispatcher.requests().len(), 1);
}

// ==================== Child Batch Tests ====================

#[tokio::test(start_paused = true)]
async fn test_child_events_are_delivered_as_one_batch() {
    let h = harness();
    h.configs.register(
        "bedroom",
        "F",
        vec![WebhookConfig::new("w1", "https://example.com/batch")
            .with_events(["CHILD_BATCH"])
            .with_secret("batch-secret")],
    );

    for object_id in ["doc-1", "doc-2", "doc-3"] {
        let spawned = h.service.notify(created_in(object_id, "F")).await.unwrap();
        assert_eq!(spawned, 0);
    }
    assert_eq!(h.service.batch_processor().pending_event_count("bedroom", "F"), 3);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(h.service.batch_processor().process_pending_batches().await, 1);
    h.service.drain().await;

    let requests = h.dispatcher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.headers[HEADER_EVENT], "CHILD_BATCH");
    assert!(verify_signature(&request.body, "batch-secret", &request.headers[SIGNATURE_HEADER]));

    let body = request.json();
    assert_eq!(body["event"]["type"], "CHILD_BATCH");
    assert_eq!(body["event"]["deliveryId"], request.headers[HEADER_DELIVERY].as_str());
    assert_eq!(body["repository"]["id"], "bedroom");
    assert_eq!(body["parentFolder"]["id"], "F");
    assert_eq!(body["parentFolder"]["path"], "/Sites/Docs");
    assert_eq!(body["batchInfo"]["eventCount"], 3);

    let object_ids: Vec<&str> = body["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["objectId"].as_str().unwrap())
        .collect();
    assert_eq!(object_ids, vec!["doc-1", "doc-2", "doc-3"]);
    assert_eq!(body["changes"][0]["type"], "CHILD_CREATED");
    assert_eq!(body["changes"][0]["name"], "doc-1.txt");

    let logs = h.service.delivery_logs("bedroom", "F", 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].event_type, "CHILD_BATCH");
}

#[tokio::test(start_paused = true)]
async fn test_child_events_ignored_without_folder_subscribers() {
    let h = harness();
    h.configs.register(
        "bedroom",
        "F",
        vec![WebhookConfig::new("w1", "https://example.com/hook").with_events(["SECURITY"])],
    );

    h.service.notify(created_in("doc-1", "F")).await.unwrap();

    assert_eq!(h.service.batch_processor().pending_event_count("bedroom", "F"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_child_events() {
    let h = harness();
    h.configs.register(
        "bedroom",
        "F",
        vec![WebhookConfig::new("w1", "https://example.com/hook").with_events(["CHILD_CREATED"])],
    );

    h.service.notify(created_in("doc-1", "F")).await.unwrap();
    h.service.shutdown().await;

    let requests = h.dispatcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].json()["batchInfo"]["eventCount"], 1);
    assert!(h.service.notify(created_in("doc-2", "F")).await.is_err());
}

// ==================== HTTP Dispatcher Tests ====================

fn local_dispatcher() -> HttpWebhookDispatcher {
    HttpWebhookDispatcher::new(HttpDispatcherConfig {
        allow_private_targets: true,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_http_delivery_sends_signed_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header(HEADER_EVENT, "UPDATED"))
        .and(header("Content-Type", "application/json"))
        .and(header("X-API-Key", "key-1"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_string("received"))
        .expect(1)
        .mount(&server)
        .await;

    let configs = Arc::new(InMemoryConfigSource::new());
    configs.register(
        "bedroom",
        "doc-1",
        vec![WebhookConfig::new("w1", &format!("{}/hook", server.uri()))
            .with_events(["UPDATED"])
            .with_auth(AuthType::ApiKey, Some("key-1"))
            .with_secret("s3cret")],
    );
    let logs = Arc::new(InMemoryDeliveryLogRepository::default());
    let service = WebhookService::new(
        configs,
        Arc::new(local_dispatcher()),
        logs.clone(),
        &WebhookSettings::default(),
    );

    service
        .notify(ObjectChange::new("bedroom", "doc-1", WebhookEventType::Updated))
        .await
        .unwrap();
    service.drain().await;

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body = String::from_utf8(received[0].body.clone()).unwrap();
    let signature = received[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(&body, "s3cret", signature));

    let log = logs.list_by_webhook("w1", 1).await.unwrap().remove(0);
    assert!(log.success);
    assert_eq!(log.status_code, Some(200));
    assert_eq!(log.response_body.as_deref(), Some("received"));
    assert_eq!(log.payload_size_bytes, body.len());
}

#[tokio::test]
async fn test_http_dispatcher_does_not_follow_redirects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/"))
        .mount(&server)
        .await;

    let config = WebhookConfig::new("w1", &server.uri()).with_events(["CREATED"]);
    let outcome = local_dispatcher()
        .dispatch(&server.uri(), "{}", &HashMap::new(), &config)
        .await
        .unwrap();

    assert_eq!(outcome.status_code, 302);
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn test_webhook_probe_reports_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .and(header(HEADER_EVENT, "TEST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let logs = Arc::new(InMemoryDeliveryLogRepository::default());
    let service = WebhookService::new(
        Arc::new(InMemoryConfigSource::new()),
        Arc::new(local_dispatcher()),
        logs.clone(),
        &WebhookSettings::default(),
    );

    let ok = service
        .test_webhook("bedroom", &format!("{}/ok", server.uri()), Some("probe-secret"))
        .await;
    assert!(ok.success);
    assert_eq!(ok.status_code, Some(200));
    assert_eq!(ok.response_body.as_deref(), Some("pong"));
    assert_eq!(ok.event_type, "TEST");
    assert!(ok.webhook_id.starts_with("test-"));

    let broken = service
        .test_webhook("bedroom", &format!("{}/broken", server.uri()), None)
        .await;
    assert!(!broken.success);
    assert_eq!(broken.status_code, Some(500));

    let received = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["objectId"], "test-object-id");
    assert_eq!(body["changeToken"], "test-change-token");

    assert!(logs.is_empty());
}
