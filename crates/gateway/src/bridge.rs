//! Gateway bridge: mesh ⇄ remote store.
//!
//! While the device has internet it is promoted to a gateway: it drains
//! the store's sync queue up to the remote blob store and polls the
//! per-recipient index, injecting pulled items into the relay as if a
//! synthetic cloud peer had transmitted them. Losing internet demotes the
//! bridge to idle and stops all remote I/O; uploads are idempotent, so a
//! cycle cut short is safe to repeat in full later.

use emberlink_core::{Clock, CoreResult, DeliveryState, Message, BROADCAST};
use emberlink_mesh::{BackoffSchedule, RelayEngine, RelayOutcome, CLOUD_PEER_ID};
use emberlink_store::{MessageStore, SyncOperation};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::remote::RemoteStore;

/// Bridge role, driven by internet availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
    /// No internet; all remote I/O stopped
    Idle,
    /// Internet available; this device relays for the mesh
    Gateway,
}

/// What one bridge cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Messages uploaded to the remote store
    pub uploaded: usize,
    /// Remote items retired (acked/deleted)
    pub acked: usize,
    /// Items pulled and injected into the relay
    pub pulled: usize,
    /// Sync-queue operations that failed and will back off
    pub sync_failures: usize,
    /// Index polls or fetches that failed
    pub pull_failures: usize,
}

struct RetryState {
    attempts: u32,
    not_before_ms: u64,
}

/// Store-and-forward bridge between the local mesh and the remote store.
pub struct GatewayBridge {
    local_id: String,
    store: Arc<Mutex<MessageStore>>,
    relay: Arc<RelayEngine>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSchedule,
    role_tx: watch::Sender<BridgeRole>,
    retries: Mutex<HashMap<i64, RetryState>>,
    stop_tx: watch::Sender<bool>,
}

impl GatewayBridge {
    /// Wire up a bridge without starting its poll loop.
    pub fn new(
        local_id: impl Into<String>,
        store: Arc<Mutex<MessageStore>>,
        relay: Arc<RelayEngine>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        backoff: BackoffSchedule,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(BridgeRole::Idle);
        let (stop_tx, _) = watch::channel(false);

        Arc::new(Self {
            local_id: local_id.into(),
            store,
            relay,
            remote,
            clock,
            backoff,
            role_tx,
            retries: Mutex::new(HashMap::new()),
            stop_tx,
        })
    }

    /// Wire up a bridge and start polling every `poll_interval_ms` while in
    /// the gateway role.
    pub fn spawn(
        local_id: impl Into<String>,
        store: Arc<Mutex<MessageStore>>,
        relay: Arc<RelayEngine>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        poll_interval_ms: u64,
    ) -> Arc<Self> {
        let bridge = Self::new(
            local_id,
            store,
            relay,
            remote,
            clock,
            BackoffSchedule::default(),
        );
        tokio::spawn(run_loop(
            bridge.clone(),
            poll_interval_ms,
            bridge.stop_tx.subscribe(),
            bridge.role_tx.subscribe(),
        ));
        bridge
    }

    /// Report internet availability; transitions the role accordingly.
    pub fn set_online(&self, online: bool) {
        let role = if online {
            BridgeRole::Gateway
        } else {
            BridgeRole::Idle
        };
        if *self.role_tx.borrow() != role {
            match role {
                BridgeRole::Gateway => {
                    info!(node_id = %self.local_id, "Promoted to gateway role");
                }
                BridgeRole::Idle => {
                    info!(node_id = %self.local_id, "Gateway role dropped, remote I/O stopped");
                }
            }
            let _ = self.role_tx.send(role);
        }
    }

    /// Current role.
    pub fn role(&self) -> BridgeRole {
        *self.role_tx.borrow()
    }

    /// Stop the poll loop.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run one bridge cycle: pull the inbox, then drain the sync queue.
    ///
    /// Does nothing while idle. Each item fails independently; a failing
    /// item backs off with the shared retry schedule and never blocks the
    /// rest of the queue.
    pub async fn run_cycle(&self) -> CoreResult<CycleSummary> {
        let mut summary = CycleSummary::default();
        if self.role() != BridgeRole::Gateway {
            return Ok(summary);
        }

        self.pull_pass(&mut summary).await;
        self.sync_pass(&mut summary).await?;

        debug!(
            uploaded = summary.uploaded,
            acked = summary.acked,
            pulled = summary.pulled,
            "Bridge cycle complete"
        );
        Ok(summary)
    }

    async fn pull_pass(&self, summary: &mut CycleSummary) {
        for recipient in [self.local_id.as_str(), BROADCAST] {
            if self.role() != BridgeRole::Gateway {
                return;
            }

            let ids = match self.remote.list_inbox(recipient).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(recipient, error = %err, "Inbox poll failed");
                    summary.pull_failures += 1;
                    continue;
                }
            };

            for id_hex in ids {
                if self.role() != BridgeRole::Gateway {
                    return;
                }
                if let Err(err) = self.pull_one(&id_hex, summary).await {
                    warn!(id = %id_hex, error = %err, "Pull failed, item left for next cycle");
                    summary.pull_failures += 1;
                }
            }
        }
    }

    async fn pull_one(&self, id_hex: &str, summary: &mut CycleSummary) -> CoreResult<()> {
        let Some(message) = self.remote.fetch_message(id_hex).await? else {
            // Someone else retired it between index and fetch
            return Ok(());
        };

        let outcome = self.relay.inject_remote(message).await;
        match outcome {
            RelayOutcome::Duplicate => {
                // Already held locally; retire the remote copy now, the
                // store owes no ack for a duplicate
                self.remote.ack_message(id_hex).await?;
                summary.acked += 1;
            }
            outcome => {
                summary.pulled += 1;
                debug!(
                    id = %id_hex,
                    origin = CLOUD_PEER_ID,
                    outcome = ?outcome,
                    "Remote item injected"
                );
            }
        }
        Ok(())
    }

    async fn sync_pass(&self, summary: &mut CycleSummary) -> CoreResult<()> {
        let items = {
            let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            store.pending_sync_items()?
        };
        let now_ms = self.clock.now_ms();

        for item in items {
            if self.role() != BridgeRole::Gateway {
                return Ok(());
            }
            if !self.is_due(item.seq, now_ms) {
                continue;
            }

            let result = match item.operation {
                SyncOperation::Upload => self.upload_one(&item.message_id, now_ms).await,
                SyncOperation::Ack => self
                    .remote
                    .ack_message(&item.message_id.to_hex())
                    .await
                    .map(|_| SyncEffect::Acked),
            };

            match result {
                Ok(effect) => {
                    {
                        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
                        store.mark_synced(item.seq)?;
                    }
                    self.clear_retry(item.seq);
                    match effect {
                        SyncEffect::Uploaded => summary.uploaded += 1,
                        SyncEffect::Acked => summary.acked += 1,
                        SyncEffect::Nothing => {}
                    }
                }
                Err(err) => {
                    warn!(
                        message_id = %item.message_id,
                        operation = ?item.operation,
                        error = %err,
                        "Sync operation failed, backing off"
                    );
                    summary.sync_failures += 1;
                    self.bump_retry(item.seq, now_ms);
                }
            }
        }
        Ok(())
    }

    async fn upload_one(
        &self,
        message_id: &emberlink_core::MessageId,
        now_ms: u64,
    ) -> CoreResult<SyncEffect> {
        let message: Option<Message> = {
            let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            store.get(message_id)?
        };

        match message {
            // Own pending traffic, plus foreign receipts carried for an
            // offline recipient (`Received` rows with an upload obligation)
            Some(message)
                if matches!(
                    message.state,
                    DeliveryState::Queued | DeliveryState::Sending | DeliveryState::Received
                ) && !message.is_expired(now_ms) =>
            {
                self.remote.put_message(&message).await?;
                Ok(SyncEffect::Uploaded)
            }
            // Delivered, terminal, expired, or gone: nothing left to bridge
            _ => Ok(SyncEffect::Nothing),
        }
    }

    fn is_due(&self, seq: i64, now_ms: u64) -> bool {
        let retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries
            .get(&seq)
            .map(|r| r.not_before_ms <= now_ms)
            .unwrap_or(true)
    }

    fn bump_retry(&self, seq: i64, now_ms: u64) {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = retries.entry(seq).or_insert(RetryState {
            attempts: 0,
            not_before_ms: 0,
        });
        entry.attempts += 1;
        entry.not_before_ms = now_ms + self.backoff.delay_ms(entry.attempts);
    }

    fn clear_retry(&self, seq: i64) {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries.remove(&seq);
    }
}

enum SyncEffect {
    Uploaded,
    Acked,
    Nothing,
}

async fn run_loop(
    bridge: Arc<GatewayBridge>,
    poll_interval_ms: u64,
    mut stop_rx: watch::Receiver<bool>,
    mut role_rx: watch::Receiver<BridgeRole>,
) {
    // Jitter the cadence so a field of gateways does not poll in lockstep
    let jitter_ms = rand::thread_rng().gen_range(0..=poll_interval_ms / 10 + 1);
    let mut interval =
        tokio::time::interval(Duration::from_millis((poll_interval_ms + jitter_ms).max(50)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            changed = role_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Promotion triggers an immediate cycle instead of waiting
                // for the next poll tick
                if *role_rx.borrow() == BridgeRole::Gateway {
                    if let Err(err) = bridge.run_cycle().await {
                        warn!(error = %err, "Bridge cycle failed");
                    }
                }
            }
            _ = interval.tick() => {
                if *role_rx.borrow() == BridgeRole::Gateway {
                    if let Err(err) = bridge.run_cycle().await {
                        warn!(error = %err, "Bridge cycle failed");
                    }
                }
            }
        }
    }
}
