//! Retry scheduler: the outbound half of the mesh.
//!
//! A timer drives `tick()`; each tick re-attempts every queued message whose
//! backoff has elapsed, up to a bounded number of concurrent in-flight
//! attempts so the radio never saturates. Attempts carry a timeout; a
//! transport that hangs costs one attempt, never the whole scheduler.

use crate::orchestrator::NetworkOrchestrator;
use emberlink_core::{
    Classification, Clock, CoreError, CoreResult, DeliveryState, Message, MessageId,
};
use emberlink_store::MessageStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Escalating retry delays.
///
/// Monotonically non-decreasing; the exact values are tuning, not
/// correctness. The final step repeats until the retry budget runs out.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    steps_ms: Vec<u64>,
}

impl BackoffSchedule {
    /// Build a schedule from explicit step delays in milliseconds.
    pub fn new(steps_ms: Vec<u64>) -> Self {
        Self {
            steps_ms: if steps_ms.is_empty() {
                vec![0]
            } else {
                steps_ms
            },
        }
    }

    /// Delay to wait after `attempt_count` attempts have been made.
    ///
    /// Zero before the first attempt, then the escalating steps, clamped
    /// at the last step.
    pub fn delay_ms(&self, attempt_count: u32) -> u64 {
        if attempt_count == 0 {
            return 0;
        }
        let index = (attempt_count as usize - 1).min(self.steps_ms.len() - 1);
        self.steps_ms[index]
    }
}

impl Default for BackoffSchedule {
    /// 5s, 10s, 30s, 60s, 5m, 15m, capped at 1h.
    fn default() -> Self {
        Self::new(vec![
            5_000, 10_000, 30_000, 60_000, 300_000, 900_000, 3_600_000,
        ])
    }
}

/// What one tick did, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Rows moved to `expired` by the prune pass
    pub expired: usize,
    /// Delivery attempts started
    pub attempted: usize,
    /// Messages that reached `delivered` this tick
    pub delivered: usize,
    /// Unicast hand-offs now awaiting an ack
    pub awaiting_ack: usize,
    /// Failed attempts put back in the queue
    pub requeued: usize,
    /// Messages that exhausted their retry budget
    pub failed: usize,
}

enum AttemptOutcome {
    Delivered,
    AwaitingAck,
    Requeued,
    Failed,
}

/// Timer-driven store-and-forward retry loop.
pub struct DeliveryScheduler {
    store: Arc<Mutex<MessageStore>>,
    orchestrator: Arc<NetworkOrchestrator>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSchedule,
    max_retries: u32,
    attempt_timeout_ms: u64,
    concurrency: Arc<Semaphore>,
}

impl DeliveryScheduler {
    /// Wire up the scheduler.
    pub fn new(
        store: Arc<Mutex<MessageStore>>,
        orchestrator: Arc<NetworkOrchestrator>,
        clock: Arc<dyn Clock>,
        backoff: BackoffSchedule,
        max_retries: u32,
        attempt_timeout_ms: u64,
        max_concurrent_attempts: usize,
    ) -> Self {
        Self {
            store,
            orchestrator,
            clock,
            backoff,
            max_retries: max_retries.max(1),
            attempt_timeout_ms,
            concurrency: Arc::new(Semaphore::new(max_concurrent_attempts.max(1))),
        }
    }

    /// Accept a message into the retry queue.
    pub fn enqueue(&self, message: &Message) -> CoreResult<Message> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(message)
    }

    /// Run one scheduling pass.
    ///
    /// Expires lapsed messages, then attempts every due queued message.
    /// Attempts run concurrently up to the configured bound; the tick
    /// returns once all of them settle.
    pub async fn tick(&self) -> CoreResult<TickSummary> {
        let now_ms = self.clock.now_ms();
        let mut summary = TickSummary::default();

        let due: Vec<Message> = {
            let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            summary.expired = store.prune_expired(now_ms)?;
            store
                .list_pending()?
                .into_iter()
                .filter(|m| !m.is_expired(now_ms) && self.is_due(m, now_ms))
                .collect()
        };

        if due.is_empty() {
            return Ok(summary);
        }

        let mut attempts = JoinSet::new();
        for message in due {
            let Ok(permit) = self.concurrency.clone().acquire_owned().await else {
                break;
            };
            summary.attempted += 1;

            let store = self.store.clone();
            let orchestrator = self.orchestrator.clone();
            let max_retries = self.max_retries;
            let attempt_timeout_ms = self.attempt_timeout_ms;
            let clock = self.clock.clone();

            attempts.spawn(async move {
                let _permit = permit;
                attempt_one(
                    store,
                    orchestrator,
                    clock,
                    message,
                    max_retries,
                    attempt_timeout_ms,
                )
                .await
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(AttemptOutcome::Delivered)) => summary.delivered += 1,
                Ok(Ok(AttemptOutcome::AwaitingAck)) => summary.awaiting_ack += 1,
                Ok(Ok(AttemptOutcome::Requeued)) => summary.requeued += 1,
                Ok(Ok(AttemptOutcome::Failed)) => summary.failed += 1,
                Ok(Err(err)) => {
                    warn!(error = %err, "Delivery attempt errored");
                    summary.requeued += 1;
                }
                Err(err) => {
                    warn!(error = %err, "Delivery attempt task panicked");
                }
            }
        }

        if summary.attempted > 0 {
            debug!(
                attempted = summary.attempted,
                delivered = summary.delivered,
                failed = summary.failed,
                "Scheduler tick complete"
            );
        }

        Ok(summary)
    }

    fn is_due(&self, message: &Message, now_ms: u64) -> bool {
        match message.last_attempt_at_ms {
            None => true,
            Some(last) => last + self.backoff.delay_ms(message.attempt_count) <= now_ms,
        }
    }
}

async fn attempt_one(
    store: Arc<Mutex<MessageStore>>,
    orchestrator: Arc<NetworkOrchestrator>,
    clock: Arc<dyn Clock>,
    message: Message,
    max_retries: u32,
    attempt_timeout_ms: u64,
) -> CoreResult<AttemptOutcome> {
    let now_ms = clock.now_ms();
    let attempt_no = {
        let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
        store.record_attempt(&message.id, now_ms)?
    };

    let send = tokio::time::timeout(
        Duration::from_millis(attempt_timeout_ms),
        orchestrator.send_message(&message),
    )
    .await;

    let result = match send {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(format!(
            "send attempt for {}",
            message.id
        ))),
    };

    match result {
        Ok(()) => {
            // Broadcasts have no acks; hand-off is the delivery signal.
            // Confirmations are fire-and-forget for the same reason.
            let handed_off_is_final = message.is_broadcast()
                || message.classification == Classification::DeliveryConfirmation;
            if handed_off_is_final {
                set_state(&store, &message.id, DeliveryState::Delivered)?;
                info!(message_id = %message.id, attempt = attempt_no, "Message delivered");
                Ok(AttemptOutcome::Delivered)
            } else if attempt_no >= max_retries {
                set_state(&store, &message.id, DeliveryState::Failed)?;
                warn!(
                    message_id = %message.id,
                    attempts = attempt_no,
                    "Retry budget exhausted without acknowledgement"
                );
                Ok(AttemptOutcome::Failed)
            } else {
                set_state(&store, &message.id, DeliveryState::Queued)?;
                Ok(AttemptOutcome::AwaitingAck)
            }
        }
        Err(CoreError::PayloadTooLarge { size, max }) => {
            // Caller error, retrying cannot help
            set_state(&store, &message.id, DeliveryState::Failed)?;
            warn!(
                message_id = %message.id,
                size,
                max,
                "Payload exceeds every eligible transport budget"
            );
            Ok(AttemptOutcome::Failed)
        }
        Err(err) => {
            if attempt_no >= max_retries {
                set_state(&store, &message.id, DeliveryState::Failed)?;
                warn!(
                    message_id = %message.id,
                    attempts = attempt_no,
                    error = %err,
                    "Delivery exhausted"
                );
                Ok(AttemptOutcome::Failed)
            } else {
                set_state(&store, &message.id, DeliveryState::Queued)?;
                debug!(
                    message_id = %message.id,
                    attempt = attempt_no,
                    error = %err,
                    "Attempt failed, backing off"
                );
                Ok(AttemptOutcome::Requeued)
            }
        }
    }
}

fn set_state(
    store: &Arc<Mutex<MessageStore>>,
    id: &MessageId,
    state: DeliveryState,
) -> CoreResult<()> {
    let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
    match store.update_state(id, state) {
        Ok(()) => Ok(()),
        // A confirmation can land mid-attempt; terminal wins, not an error
        Err(CoreError::InvalidState { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
