//! Device consumer: the worker half of the pipeline.
//!
//! Each iteration takes one message off `device-registrations.v1`, claims
//! the record with the `queued -> processing` transition and hands the
//! payload to the ingestion port. Failures go back on the queue after a
//! backoff until the attempt cap, then the record is marked failed.
//!
//! Nothing here crashes the loop: a message that cannot be processed is
//! logged and discarded, and storage errors are logged before the next poll.

pub mod backoff;

use crate::app::ports::IngestionPort;
use crate::config::ConsumerConfig;
use crate::constants::DEVICE_REGISTRATIONS_QUEUE;
use crate::domain::{DeviceStatus, QueueMessage, RegistrationPayload, TransitionNote};
use crate::error::{DeliveryError, PipelineError, Result};
use crate::metrics::ConsumerMetrics;
use crate::queue::MessageQueue;
use crate::registry::DeviceRegistry;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use backoff::RetryPolicy;

/// How long a `pending` record may have a message in flight before the
/// message is treated as orphaned. Covers the gap between the gateway's
/// enqueue and its `queued` transition.
const PENDING_GRACE: Duration = Duration::from_secs(30);

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a message was dropped without running the side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Undecodable,
    UnknownDevice,
    /// Duplicate delivery for an `acknowledged` or `failed` record.
    AlreadyTerminal,
    /// Another consumer holds the record in `processing`.
    AlreadyClaimed,
    /// A `pending` record whose gateway never finished queueing it.
    StalePending,
    /// The record moved underneath us to a status the edge table rejects.
    InvalidTransition,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Undecodable => "undecodable",
            DiscardReason::UnknownDevice => "unknown_device",
            DiscardReason::AlreadyTerminal => "already_terminal",
            DiscardReason::AlreadyClaimed => "already_claimed",
            DiscardReason::StalePending => "stale_pending",
            DiscardReason::InvalidTransition => "invalid_transition",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single `poll_once`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Acknowledged,
    /// Delivery failed; the message comes back after `delay`.
    Retrying { delay: Duration },
    Failed,
    /// Record still `pending`; the message was put back for a later look.
    Deferred,
    Discarded(DiscardReason),
}

/// Delayed re-enqueues owned by one consumer. Flushing makes every
/// scheduled retry enqueue immediately.
#[derive(Clone)]
struct RetryScheduler {
    flush: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
}

impl RetryScheduler {
    fn new() -> Self {
        let (flush, _) = watch::channel(false);
        Self {
            flush: Arc::new(flush),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Everything a delayed re-enqueue needs once it is detached from the
/// consumer.
struct Requeue {
    queue: Arc<dyn MessageQueue>,
    registry: DeviceRegistry,
    policy: RetryPolicy,
    device_id: String,
    payload: serde_json::Value,
}

impl Requeue {
    /// Wait `delay` (or until flushed), then enqueue. A failed enqueue is
    /// retried on the backoff schedule until it lands. Once flushed, a
    /// failed enqueue ends the record as `failed`.
    async fn run(self, delay: Duration, mut flush: watch::Receiver<bool>) {
        let mut wait = delay;
        let mut round: u32 = 0;
        loop {
            let mut flushed = *flush.borrow_and_update();
            if !flushed {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = flush.changed() => flushed = true,
                }
            }
            match self.queue.enqueue(DEVICE_REGISTRATIONS_QUEUE, self.payload.clone()).await {
                Ok(message) => {
                    debug!(device_id = %self.device_id, message_id = %message.id, "Re-enqueued registration");
                    return;
                }
                Err(e) if flushed => {
                    self.abandon(&e).await;
                    return;
                }
                Err(e) => {
                    round += 1;
                    wait = self.policy.delay_for(round);
                    warn!(
                        device_id = %self.device_id,
                        error = %e,
                        delay_ms = wait.as_millis() as u64,
                        "Re-enqueue failed, trying again"
                    );
                }
            }
        }
    }

    /// Close out a record whose retry can no longer reach the queue.
    async fn abandon(&self, cause: &PipelineError) {
        let reason = format!("could not re-enqueue registration: {cause}");
        let closed = match self
            .registry
            .transition_status(&self.device_id, DeviceStatus::Processing)
            .await
        {
            Ok(_) => {
                self.registry
                    .transition_status_with(
                        &self.device_id,
                        DeviceStatus::Failed,
                        TransitionNote::error(&reason),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        match closed {
            Ok(record) => {
                ConsumerMetrics::record_failed(record.attempts());
                error!(
                    device_id = %self.device_id,
                    attempts = record.attempts(),
                    error = %reason,
                    "Registration failed permanently"
                );
            }
            Err(e) => error!(
                device_id = %self.device_id,
                error = %reason,
                transition_error = %e,
                "Dropped retry; record left as is"
            ),
        }
    }
}

#[derive(Clone)]
pub struct DeviceConsumer {
    registry: DeviceRegistry,
    queue: Arc<dyn MessageQueue>,
    ingestion: Arc<dyn IngestionPort>,
    policy: RetryPolicy,
    poll_interval: Duration,
    request_timeout: Duration,
    retries: RetryScheduler,
}

impl DeviceConsumer {
    pub fn new(
        registry: DeviceRegistry,
        queue: Arc<dyn MessageQueue>,
        ingestion: Arc<dyn IngestionPort>,
    ) -> Self {
        let defaults = ConsumerConfig::default();
        Self {
            registry,
            queue,
            ingestion,
            policy: RetryPolicy::from_config(&defaults),
            poll_interval: defaults.poll_interval(),
            request_timeout: defaults.request_timeout(),
            retries: RetryScheduler::new(),
        }
    }

    pub fn with_config(self, config: &ConsumerConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            poll_interval: config.poll_interval(),
            request_timeout: config.request_timeout(),
            ..self
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retries scheduled but not yet back on the queue.
    pub fn pending_retries(&self) -> usize {
        self.retries.in_flight.load(Ordering::SeqCst)
    }

    fn schedule_requeue(&self, device_id: String, payload: serde_json::Value, delay: Duration) {
        let requeue = Requeue {
            queue: Arc::clone(&self.queue),
            registry: self.registry.clone(),
            policy: self.policy,
            device_id,
            payload,
        };
        let flush = self.retries.flush.subscribe();
        let in_flight = Arc::clone(&self.retries.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            requeue.run(delay, flush).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Loop until `shutdown` becomes `true` or its sender goes away. An
    /// in-progress message is always finished before the loop checks for
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = DEVICE_REGISTRATIONS_QUEUE,
            max_attempts = self.policy.max_attempts,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(PollOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(outcome) => debug!(?outcome, "Message handled"),
                Err(e) => {
                    error!(error = %e, "Consumer iteration failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.flush_retries(SHUTDOWN_FLUSH_TIMEOUT).await;
        info!("Consumer stopped");
    }

    /// Push every scheduled retry onto the queue now and wait (bounded) for
    /// the enqueues to land. Retries scheduled after this returns keep their
    /// normal backoff.
    pub async fn flush_retries(&self, timeout: Duration) {
        self.retries.flush.send_replace(true);
        let deadline = Instant::now() + timeout;
        while self.pending_retries() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    pending = self.pending_retries(),
                    "Retries still pending at shutdown; their records stay queued"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.retries.flush.send_replace(false);
    }

    /// Take at most one message and drive it as far as it can go now.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        match self.queue.dequeue(DEVICE_REGISTRATIONS_QUEUE).await? {
            None => Ok(PollOutcome::Idle),
            Some(message) => self.process_message(message).await,
        }
    }

    pub async fn process_message(&self, message: QueueMessage) -> Result<PollOutcome> {
        let payload: RegistrationPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok(self.discard(
                    DiscardReason::Undecodable,
                    &message.id.to_string(),
                    &e.to_string(),
                ))
            }
        };
        let device_id = payload.device_id.clone();

        let record = match self.registry.get_registration(&device_id).await {
            Ok(record) => record,
            Err(PipelineError::NotFound(_)) => {
                return Ok(self.discard(DiscardReason::UnknownDevice, &device_id, "no such record"))
            }
            Err(e) => return Err(e),
        };

        match record.status() {
            DeviceStatus::Queued => {}
            DeviceStatus::Acknowledged | DeviceStatus::Failed => {
                return Ok(self.discard(
                    DiscardReason::AlreadyTerminal,
                    &device_id,
                    record.status().as_str(),
                ))
            }
            DeviceStatus::Processing => {
                return Ok(self.discard(DiscardReason::AlreadyClaimed, &device_id, "processing"))
            }
            DeviceStatus::Pending => {
                let age = (Utc::now() - record.updated_at()).to_std().unwrap_or_default();
                if age > PENDING_GRACE {
                    return Ok(self.discard(DiscardReason::StalePending, &device_id, "pending"));
                }
                debug!(device_id = %device_id, "Record not queued yet, deferring message");
                self.schedule_requeue(device_id, message.payload, self.poll_interval);
                return Ok(PollOutcome::Deferred);
            }
        }

        // The queued -> processing edge is the per-device mutual exclusion gate
        let claimed = match self
            .registry
            .transition_status(&device_id, DeviceStatus::Processing)
            .await
        {
            Ok(record) => record,
            Err(e @ (PipelineError::InvalidTransition { .. } | PipelineError::NotFound(_))) => {
                return Ok(self.discard(DiscardReason::AlreadyClaimed, &device_id, &e.to_string()))
            }
            Err(e) => return Err(e),
        };
        let attempts = claimed.attempts();
        debug!(device_id = %device_id, attempts, "Processing registration");

        let started = Instant::now();
        let delivery = match tokio::time::timeout(
            self.request_timeout,
            self.ingestion.deliver(&payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.request_timeout.as_millis() as u64)),
        };
        ConsumerMetrics::record_delivery_duration(started.elapsed().as_secs_f64());

        match delivery {
            Ok(receipt) => {
                if let Some(discarded) = self
                    .leave_processing(
                        &device_id,
                        DeviceStatus::Acknowledged,
                        TransitionNote::acknowledged(receipt.body),
                    )
                    .await?
                {
                    return Ok(discarded);
                }
                ConsumerMetrics::record_acknowledged(attempts);
                info!(
                    device_id = %device_id,
                    attempts,
                    http_status = receipt.status,
                    "Registration acknowledged"
                );
                Ok(PollOutcome::Acknowledged)
            }
            Err(delivery_error) => {
                let reason = delivery_error.to_string();
                if self.policy.should_retry(attempts) {
                    if let Some(discarded) = self
                        .leave_processing(&device_id, DeviceStatus::Queued, TransitionNote::error(&reason))
                        .await?
                    {
                        return Ok(discarded);
                    }
                    let delay = self.policy.delay_for(attempts);
                    ConsumerMetrics::record_retry();
                    warn!(
                        device_id = %device_id,
                        attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Delivery failed, retry scheduled"
                    );
                    self.schedule_requeue(device_id, message.payload, delay);
                    Ok(PollOutcome::Retrying { delay })
                } else {
                    if let Some(discarded) = self
                        .leave_processing(&device_id, DeviceStatus::Failed, TransitionNote::error(&reason))
                        .await?
                    {
                        return Ok(discarded);
                    }
                    ConsumerMetrics::record_failed(attempts);
                    error!(
                        device_id = %device_id,
                        attempts,
                        error = %reason,
                        "Registration failed permanently"
                    );
                    Ok(PollOutcome::Failed)
                }
            }
        }
    }

    /// Move out of `processing`. Yields a discard outcome when the record
    /// was mutated underneath us and the edge no longer applies.
    async fn leave_processing(
        &self,
        device_id: &str,
        next: DeviceStatus,
        note: TransitionNote,
    ) -> Result<Option<PollOutcome>> {
        match self.registry.transition_status_with(device_id, next, note).await {
            Ok(_) => Ok(None),
            Err(e @ (PipelineError::InvalidTransition { .. } | PipelineError::NotFound(_))) => Ok(
                Some(self.discard(DiscardReason::InvalidTransition, device_id, &e.to_string())),
            ),
            Err(e) => Err(e),
        }
    }

    fn discard(&self, reason: DiscardReason, subject: &str, detail: &str) -> PollOutcome {
        ConsumerMetrics::record_discarded(reason.as_str());
        match reason {
            DiscardReason::AlreadyTerminal | DiscardReason::AlreadyClaimed => {
                info!(subject, %reason, detail, "Discarding duplicate delivery")
            }
            _ => warn!(subject, %reason, detail, "Discarding message"),
        }
        PollOutcome::Discarded(reason)
    }
}
