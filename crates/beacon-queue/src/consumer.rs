//! Background consumers that drain the queue in batches.
//!
//! Each worker claims up to `batch_size` watched events, hands them to an
//! [`EventProcessor`], deletes the ones that succeeded and records the
//! failures. It keeps claiming until a pass finds nothing, then sleeps until
//! the notifier announces a watched name or the idle timeout elapses.

use crate::queue::EventQueue;
use crate::retry::RetryPolicy;
use crate::store::{self, now_millis};
use crate::QueueError;
use async_trait::async_trait;
use beacon_types::QueueEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A single event the processor could not handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    pub id: Uuid,
    pub error: String,
}

impl FailedEvent {
    pub fn new(id: Uuid, error: impl ToString) -> Self {
        Self {
            id,
            error: error.to_string(),
        }
    }
}

/// Handles a batch of claimed events.
///
/// Delivery is at least once. An event whose success could not be recorded
/// (the delete failed, or the claim lease ran out first) is processed again,
/// so implementations must tolerate seeing the same event twice.
///
/// Every event not listed in the returned vector counts as a success.
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    async fn process(&self, events: &[QueueEvent]) -> Vec<FailedEvent>;
}

/// Tunables for one consumer kind.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name used in worker ids and log fields.
    pub name: String,
    /// Event names this consumer claims.
    pub watch_events: Vec<String>,
    pub batch_size: usize,
    /// Number of concurrent workers.
    pub consumers: usize,
    /// How long a claim stays exclusive before other workers may take it.
    pub lease: Duration,
    /// Maximum sleep between drains when no wake-up arrives.
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new<S: AsRef<str>>(name: impl Into<String>, watch_events: &[S]) -> Self {
        Self {
            name: name.into(),
            watch_events: watch_events.iter().map(|s| s.as_ref().to_string()).collect(),
            batch_size: 1,
            consumers: 1,
            lease: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A consumer kind: configuration, queue and processor.
pub struct EventConsumer {
    config: ConsumerConfig,
    queue: EventQueue,
    processor: Arc<dyn EventProcessor>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig, queue: EventQueue, processor: Arc<dyn EventProcessor>) -> Self {
        Self {
            config,
            queue,
            processor,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Starts `consumers` workers that run until `shutdown` is cancelled.
    ///
    /// Each worker drains the queue once on startup so events left over from
    /// a previous run are picked up without waiting for a wake-up.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);
        let instance = Uuid::new_v4().simple().to_string();
        let instance = &instance[..8];

        (0..this.config.consumers)
            .map(|idx| {
                let worker = format!("{}-{}-{}", this.config.name, instance, idx);
                let consumer = Arc::clone(&this);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { consumer.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    /// Drains every currently claimable event with a single worker and
    /// returns how many events were processed.
    pub async fn consume_until_empty(&self) -> Result<usize, QueueError> {
        let worker = format!("{}-drain-{}", self.config.name, Uuid::new_v4().simple());
        self.drain(&worker, &CancellationToken::new()).await
    }

    async fn run_worker(self: Arc<Self>, worker: String, shutdown: CancellationToken) {
        // Subscribe before the first drain so inserts racing it still wake us.
        let mut wake = self.queue.notifier().subscribe(&self.config.watch_events);
        tracing::info!(
            consumer = %self.config.name,
            worker = %worker,
            events = ?self.config.watch_events,
            "started event consumer"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.drain(&worker, &shutdown).await {
                Ok(0) => {}
                Ok(processed) => {
                    tracing::debug!(consumer = %self.config.name, worker = %worker, processed, "drained queue");
                }
                Err(e) => {
                    tracing::error!(consumer = %self.config.name, worker = %worker, error = %e, "failed to drain queue");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.wait() => {}
                _ = tokio::time::sleep(self.config.idle_timeout) => {}
            }
        }

        tracing::info!(consumer = %self.config.name, worker = %worker, "event consumer stopped");
    }

    /// Claims and processes batches until a pass comes back empty.
    ///
    /// A pass that only returns events already handled in this drain also
    /// ends it, so a zero retry delay cannot spin on a failing event.
    async fn drain(&self, worker: &str, shutdown: &CancellationToken) -> Result<usize, QueueError> {
        let mut seen = HashSet::new();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let ids = self.consume_batch(worker, shutdown).await?;
            if ids.is_empty() {
                break;
            }
            let before = seen.len();
            seen.extend(ids);
            if seen.len() == before {
                break;
            }
        }
        Ok(seen.len())
    }

    /// Claims up to one batch, processes it and settles every event.
    /// Returns the ids that were processed.
    async fn consume_batch(
        &self,
        worker: &str,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Uuid>, QueueError> {
        let names = self.config.watch_events.clone();
        let batch_size = self.config.batch_size;
        let lease = self.config.lease;
        let owner = worker.to_string();

        let events = self
            .queue
            .with_conn(move |conn| {
                let mut claimed = Vec::with_capacity(batch_size);
                while claimed.len() < batch_size {
                    match store::dequeue_one(conn, &names, &owner, lease) {
                        Ok(Some(event)) => claimed.push(event),
                        Ok(None) => break,
                        // Keep what we already hold; the rest waits for the next pass.
                        Err(e) if !claimed.is_empty() => {
                            tracing::warn!(worker = %owner, error = %e, "stopped claiming mid-batch");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(claimed)
            })
            .await?;

        if events.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();

        // A panicking processor fails its batch; the worker keeps going.
        let processor = Arc::clone(&self.processor);
        let batch = events.clone();
        let mut task = tokio::spawn(async move { processor.process(&batch).await });

        let failed = tokio::select! {
            joined = &mut task => match joined {
                Ok(failed) => failed,
                Err(e) => {
                    tracing::error!(
                        consumer = %self.config.name,
                        worker = %worker,
                        events = events.len(),
                        error = %e,
                        "event processor panicked"
                    );
                    let error = format!("event processor panicked: {e}");
                    events.iter().map(|event| FailedEvent::new(event.id, &error)).collect()
                }
            },
            _ = shutdown.cancelled() => {
                task.abort();
                self.release(worker, ids).await;
                return Ok(Vec::new());
            }
        };

        let failures: HashMap<Uuid, String> =
            failed.into_iter().map(|f| (f.id, f.error)).collect();
        let retry = self.config.retry;
        let owner = worker.to_string();
        let consumer = self.config.name.clone();

        self.queue
            .with_conn(move |conn| {
                for event in &events {
                    match failures.get(&event.id) {
                        Some(error) => {
                            let attempts = event.attempts + 1;
                            let delay = retry.delay(attempts);
                            let retry_at = now_millis()
                                .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
                            match store::mark_failed(conn, event.id, &owner, error, retry_at) {
                                Ok(()) => tracing::warn!(
                                    consumer = %consumer,
                                    event_id = %event.id,
                                    event = %event.name,
                                    attempts,
                                    retry_in_ms = delay.as_millis() as u64,
                                    error = %error,
                                    "event failed"
                                ),
                                Err(e) => tracing::error!(
                                    consumer = %consumer,
                                    event_id = %event.id,
                                    error = %e,
                                    "failed to record event failure"
                                ),
                            }
                        }
                        None => {
                            if let Err(e) = store::mark_done(conn, event.id, &owner) {
                                // The row stays and is handled again after the lease.
                                tracing::error!(
                                    consumer = %consumer,
                                    event_id = %event.id,
                                    error = %e,
                                    "failed to delete processed event"
                                );
                            }
                        }
                    }
                }
                Ok(())
            })
            .await?;

        Ok(ids)
    }

    async fn release(&self, worker: &str, ids: Vec<Uuid>) {
        let owner = worker.to_string();
        let result = self
            .queue
            .with_conn(move |conn| {
                for id in ids {
                    store::release_claim(conn, id, &owner)?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => tracing::info!(worker = %worker, "released claims on shutdown"),
            Err(e) => tracing::warn!(worker = %worker, error = %e, "failed to release claims on shutdown"),
        }
    }
}
