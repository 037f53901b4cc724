//! Child event batching
//!
//! Child events are queued per (repository, folder). A ticker flushes every
//! folder whose batch window has elapsed, splitting the queue into ordered
//! batches of at most `max_batch_size` events. Two guards protect the system:
//!
//! - a per-folder rate limiter caps batch deliveries per rolling minute
//! - a per-folder circuit breaker rejects new events once the backlog reaches
//!   the threshold, and recovers after a cooldown
//!
//! Delivery runs outside the folder lock. A failed batch and every batch after
//! it go back to the front of the queue in their original order, and the
//! folder waits out an exponential backoff before the next attempt.

use crate::{
    BackoffPolicy, BatchSettings, ChildEvent, ChildEventBatch, Result, WebhookError,
    WebhookEventType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rolling window of the rate limiter
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Ticker period
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long `shutdown` waits for a running tick
pub const SHUTDOWN_TICK_WAIT: Duration = Duration::from_secs(10);

/// Receives flushed batches.
///
/// `Err` means "retry later": the batch's events stay queued.
#[async_trait]
pub trait BatchDeliveryHandler: Send + Sync {
    async fn deliver_batch(&self, batch: &ChildEventBatch) -> Result<()>;
}

/// Queue identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderKey {
    pub repository_id: String,
    pub folder_id: String,
}

impl FolderKey {
    pub fn new(repository_id: &str, folder_id: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            folder_id: folder_id.to_string(),
        }
    }
}

/// Per-folder breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Accepting events
    Closed,
    /// Rejecting events
    Open,
    /// Cooldown elapsed; accepting events, re-opens at the threshold
    HalfOpen,
}

struct FolderQueue {
    events: VecDeque<ChildEvent>,
    window_start: Instant,
    window_started_at: DateTime<Utc>,
    /// Events handed to the handler and not yet acknowledged
    in_flight: usize,
    flushing: bool,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
    last_activity: Instant,
}

impl FolderQueue {
    fn new(now: Instant) -> Self {
        Self {
            events: VecDeque::new(),
            window_start: now,
            window_started_at: Utc::now(),
            in_flight: 0,
            flushing: false,
            consecutive_failures: 0,
            retry_after: None,
            last_activity: now,
        }
    }

    fn backlog(&self) -> usize {
        self.events.len() + self.in_flight
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_start = now;
        self.window_started_at = Utc::now();
    }
}

#[derive(Default)]
struct RateLimitState {
    deliveries: VecDeque<Instant>,
}

impl RateLimitState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.deliveries.front() {
            if now.duration_since(*oldest) >= RATE_LIMIT_WINDOW {
                self.deliveries.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining(&mut self, now: Instant, limit: usize) -> usize {
        self.prune(now);
        limit.saturating_sub(self.deliveries.len())
    }

    fn record(&mut self, now: Instant) {
        self.deliveries.push_back(now);
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
        }
    }
}

/// Lock order: map shard, then `queue`, then `rate` or `breaker`
struct FolderSlot {
    key: FolderKey,
    queue: Mutex<FolderQueue>,
    rate: Mutex<RateLimitState>,
    breaker: Mutex<BreakerState>,
}

impl FolderSlot {
    fn new(key: FolderKey, now: Instant) -> Self {
        Self {
            key,
            queue: Mutex::new(FolderQueue::new(now)),
            rate: Mutex::new(RateLimitState::default()),
            breaker: Mutex::new(BreakerState::closed()),
        }
    }

    /// Current breaker state, moving Open to HalfOpen once the cooldown passed
    fn breaker_state(&self, now: Instant, cooldown: Duration) -> CircuitState {
        let mut breaker = self.breaker.lock();
        if breaker.state == CircuitState::Open {
            let expired = breaker
                .opened_at
                .map(|opened| now.duration_since(opened) > cooldown)
                .unwrap_or(true);
            if expired {
                breaker.state = CircuitState::HalfOpen;
                info!(
                    repository_id = %self.key.repository_id,
                    folder_id = %self.key.folder_id,
                    "Circuit breaker half-open"
                );
            }
        }
        breaker.state
    }

    fn trip(&self, now: Instant, backlog: usize) {
        let mut breaker = self.breaker.lock();
        if breaker.state != CircuitState::Open {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(now);
            warn!(
                repository_id = %self.key.repository_id,
                folder_id = %self.key.folder_id,
                backlog = backlog,
                "Circuit breaker tripped"
            );
        }
    }

    fn close_if_recovered(&self, backlog: usize, threshold: usize) {
        let mut breaker = self.breaker.lock();
        if breaker.state == CircuitState::HalfOpen && backlog < threshold {
            breaker.state = CircuitState::Closed;
            breaker.opened_at = None;
            info!(
                repository_id = %self.key.repository_id,
                folder_id = %self.key.folder_id,
                "Circuit breaker closed"
            );
        }
    }

    fn is_idle(&self, now: Instant, idle_limit: Duration) -> bool {
        let queue = self.queue.lock();
        let quiet = queue.events.is_empty()
            && queue.in_flight == 0
            && !queue.flushing
            && now.duration_since(queue.last_activity) >= idle_limit;
        quiet && self.breaker.lock().state != CircuitState::Open
    }
}

/// Per-folder child event batcher
pub struct ChildEventBatchProcessor {
    handler: Arc<dyn BatchDeliveryHandler>,
    settings: RwLock<BatchSettings>,
    backoff: BackoffPolicy,
    folders: DashMap<FolderKey, Arc<FolderSlot>>,
    shutdown: AtomicBool,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ChildEventBatchProcessor {
    pub fn new(handler: Arc<dyn BatchDeliveryHandler>, settings: BatchSettings) -> Arc<Self> {
        Self::with_backoff(handler, settings, BackoffPolicy::default())
    }

    /// Processor whose failed folders wait according to `backoff`
    pub fn with_backoff(
        handler: Arc<dyn BatchDeliveryHandler>,
        settings: BatchSettings,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        info!(
            window_seconds = settings.batch_window_seconds,
            max_batch_size = settings.max_batch_size,
            rate_limit_per_minute = settings.rate_limit_per_minute,
            "Child event batch processor initialized"
        );

        Arc::new(Self {
            handler,
            settings: RwLock::new(settings),
            backoff,
            folders: DashMap::new(),
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Spawn the ticker. Calling it again, or after shutdown, does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() || self.is_shutting_down() {
            return;
        }

        let processor: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(processor) = processor.upgrade() else {
                            break;
                        };
                        processor.process_pending_batches().await;
                    }
                }
            }

            debug!("Batch ticker stopped");
        }));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> BatchSettings {
        self.settings.read().clone()
    }

    /// Queue a child event for its parent folder.
    ///
    /// Returns false when shutting down, when the folder id is empty, when
    /// the event is not `CHILD_CREATED`, `CHILD_UPDATED` or `CHILD_DELETED`,
    /// or when the folder's breaker is open.
    pub fn queue_event(&self, repository_id: &str, event: ChildEvent) -> bool {
        if self.is_shutting_down() {
            warn!(object_id = %event.object_id, "Cannot queue event: processor is shutting down");
            return false;
        }
        if event.parent_folder_id.trim().is_empty() {
            warn!(object_id = %event.object_id, "Cannot queue event: parent folder id is empty");
            return false;
        }
        if !matches!(
            event.event_type,
            WebhookEventType::ChildCreated | WebhookEventType::ChildUpdated | WebhookEventType::ChildDeleted
        ) {
            warn!(
                object_id = %event.object_id,
                event_type = %event.event_type,
                "Cannot queue event: not a child event"
            );
            return false;
        }

        let (threshold, cooldown) = {
            let settings = self.settings.read();
            (settings.circuit_breaker_threshold, settings.circuit_breaker_cooldown())
        };
        let now = Instant::now();
        let key = FolderKey::new(repository_id, &event.parent_folder_id);

        // The entry guard stays alive until the event is queued so idle
        // eviction cannot drop the slot in between.
        let entry = self
            .folders
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FolderSlot::new(key, now)));
        let slot = entry.value();

        if slot.breaker_state(now, cooldown) == CircuitState::Open {
            warn!(
                folder_id = %slot.key.folder_id,
                object_id = %event.object_id,
                "Circuit breaker is open, event rejected"
            );
            return false;
        }

        // The first event after a drain opens a fresh window, even while the
        // drained batches are still in flight.
        let mut queue = slot.queue.lock();
        if queue.events.is_empty() {
            queue.reset_window(now);
        }

        debug!(
            folder_id = %slot.key.folder_id,
            object_id = %event.object_id,
            event_type = %event.event_type,
            "Child event queued"
        );
        queue.events.push_back(event);
        queue.last_activity = now;

        let backlog = queue.backlog();
        if backlog >= threshold {
            slot.trip(now, backlog);
        }

        true
    }

    /// One tick: flush every folder whose window elapsed.
    ///
    /// Once shutdown has begun, window and backoff checks are skipped.
    /// Returns the number of batches delivered.
    pub async fn process_pending_batches(&self) -> usize {
        let forced = self.is_shutting_down();
        let settings = self.settings();

        let slots: Vec<Arc<FolderSlot>> = self
            .folders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for slot in slots {
            delivered += self.flush_folder(&slot, &settings, forced).await;
        }

        if !forced {
            self.evict_idle(&settings);
        }

        delivered
    }

    async fn flush_folder(&self, slot: &FolderSlot, settings: &BatchSettings, forced: bool) -> usize {
        let now = Instant::now();

        let (batches, drained_window) = {
            let mut queue = slot.queue.lock();
            if queue.events.is_empty() || queue.flushing {
                return 0;
            }
            if !forced {
                if now.duration_since(queue.window_start) < settings.batch_window() {
                    return 0;
                }
                if queue.retry_after.map(|t| now < t).unwrap_or(false) {
                    return 0;
                }
            }

            let allowance = slot.rate.lock().remaining(now, settings.rate_limit_per_minute);
            if allowance == 0 {
                debug!(folder_id = %slot.key.folder_id, "Rate limit reached");
                return 0;
            }

            let max_batch_size = settings.max_batch_size.max(1);
            let window_end = Utc::now();
            let mut batches = Vec::new();
            let mut handed_over = 0;

            while !queue.events.is_empty()
                && batches.len() < allowance
                && handed_over < settings.absolute_max_per_second
            {
                let take = max_batch_size.min(queue.events.len());
                let events: Vec<ChildEvent> = queue.events.drain(..take).collect();
                handed_over += events.len();
                batches.push(ChildEventBatch::new(
                    &slot.key.repository_id,
                    &slot.key.folder_id,
                    events,
                    queue.window_started_at,
                    window_end,
                ));
            }

            if batches.is_empty() {
                return 0;
            }
            let drained_window = (queue.window_start, queue.window_started_at);
            queue.in_flight = handed_over;
            queue.flushing = true;
            (batches, drained_window)
        };

        let mut delivered = 0;
        let mut pending = batches.into_iter();
        let mut failure: Option<(ChildEventBatch, WebhookError)> = None;

        for batch in pending.by_ref() {
            let result = AssertUnwindSafe(self.handler.deliver_batch(&batch))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(WebhookError::BatchDelivery("delivery handler panicked".to_string())));

            match result {
                Ok(()) => {
                    slot.rate.lock().record(Instant::now());
                    {
                        let mut queue = slot.queue.lock();
                        queue.in_flight = queue.in_flight.saturating_sub(batch.event_count());
                    }
                    delivered += 1;
                    debug!(
                        folder_id = %slot.key.folder_id,
                        batch_id = %batch.batch_id,
                        event_count = batch.event_count(),
                        "Delivered child event batch"
                    );
                }
                Err(e) => {
                    failure = Some((batch, e));
                    break;
                }
            }
        }

        let now = Instant::now();
        let backlog = {
            let mut queue = slot.queue.lock();
            queue.flushing = false;
            queue.in_flight = 0;

            match failure {
                Some((failed, e)) => {
                    // Requeued events keep the window they were drained from
                    queue.window_start = drained_window.0;
                    queue.window_started_at = drained_window.1;
                    let requeued: Vec<ChildEvent> = failed
                        .events
                        .into_iter()
                        .chain(pending.flat_map(|batch| batch.events))
                        .collect();
                    let requeued_count = requeued.len();
                    for event in requeued.into_iter().rev() {
                        queue.events.push_front(event);
                    }

                    queue.consecutive_failures += 1;
                    let delay = self.backoff.calculate_delay(queue.consecutive_failures as i64);
                    queue.retry_after = Some(now + delay);

                    error!(
                        folder_id = %slot.key.folder_id,
                        error = %e,
                        requeued = requeued_count,
                        consecutive_failures = queue.consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to deliver child event batch"
                    );
                }
                None => {
                    queue.consecutive_failures = 0;
                    queue.retry_after = None;
                }
            }

            if queue.events.is_empty() {
                queue.reset_window(now);
            }
            queue.last_activity = now;
            queue.backlog()
        };

        if delivered > 0 {
            slot.close_if_recovered(backlog, settings.circuit_breaker_threshold);
        }

        delivered
    }

    fn evict_idle(&self, settings: &BatchSettings) {
        let idle_limit = settings
            .batch_window()
            .saturating_mul(settings.idle_eviction_windows)
            .max(RATE_LIMIT_WINDOW);
        let now = Instant::now();

        self.folders.retain(|key, slot| {
            let idle = slot.is_idle(now, idle_limit);
            if idle {
                debug!(folder_id = %key.folder_id, "Evicting idle folder queue");
            }
            !idle
        });
    }

    pub fn is_circuit_breaker_open(&self, repository_id: &str, folder_id: &str) -> bool {
        self.circuit_state(repository_id, folder_id) == CircuitState::Open
    }

    pub fn circuit_state(&self, repository_id: &str, folder_id: &str) -> CircuitState {
        let cooldown = self.settings.read().circuit_breaker_cooldown();
        self.folders
            .get(&FolderKey::new(repository_id, folder_id))
            .map(|slot| slot.breaker_state(Instant::now(), cooldown))
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether the folder may deliver another batch in the current minute
    pub fn can_deliver_batch(&self, repository_id: &str, folder_id: &str) -> bool {
        let limit = self.settings.read().rate_limit_per_minute;
        self.folders
            .get(&FolderKey::new(repository_id, folder_id))
            .map(|slot| slot.rate.lock().remaining(Instant::now(), limit) > 0)
            .unwrap_or(limit > 0)
    }

    /// Events not yet acknowledged for one folder, queued or in flight
    pub fn pending_event_count(&self, repository_id: &str, folder_id: &str) -> usize {
        self.folders
            .get(&FolderKey::new(repository_id, folder_id))
            .map(|slot| slot.queue.lock().backlog())
            .unwrap_or(0)
    }

    pub fn total_pending_events(&self) -> usize {
        self.folders
            .iter()
            .map(|slot| slot.queue.lock().backlog())
            .sum()
    }

    /// Folders currently tracked
    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    pub fn set_batch_window_seconds(&self, seconds: u64) {
        self.settings.write().batch_window_seconds = seconds;
    }

    pub fn set_max_batch_size(&self, size: usize) {
        self.settings.write().max_batch_size = size;
    }

    pub fn set_rate_limit_per_minute(&self, limit: usize) {
        self.settings.write().rate_limit_per_minute = limit;
    }

    pub fn set_circuit_breaker_threshold(&self, threshold: usize) {
        self.settings.write().circuit_breaker_threshold = threshold;
    }

    pub fn set_absolute_max_per_second(&self, max: usize) {
        self.settings.write().absolute_max_per_second = max;
    }

    /// Stop ticking and run one final flush that ignores batch windows.
    ///
    /// Waits up to ten seconds for a running tick before aborting it.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down child event batch processor");

        self.cancel.cancel();
        let ticker = self.ticker.lock().take();
        if let Some(mut handle) = ticker {
            if tokio::time::timeout(SHUTDOWN_TICK_WAIT, &mut handle).await.is_err() {
                warn!("Batch tick still running after shutdown wait, aborting it");
                handle.abort();
                self.release_aborted_flushes();
            }
        }

        let delivered = self.process_pending_batches().await;
        let remaining = self.total_pending_events();
        if remaining > 0 {
            warn!(
                delivered_batches = delivered,
                remaining_events = remaining,
                "Child events left undelivered at shutdown"
            );
        }

        info!("Child event batch processor shutdown complete");
    }

    /// Clear flush markers left behind by an aborted tick
    fn release_aborted_flushes(&self) {
        for entry in self.folders.iter() {
            let mut queue = entry.value().queue.lock();
            if queue.flushing {
                warn!(
                    folder_id = %entry.key().folder_id,
                    lost_events = queue.in_flight,
                    "Dropping batches of an aborted tick"
                );
                queue.flushing = false;
                queue.in_flight = 0;
            }
        }
    }
}
