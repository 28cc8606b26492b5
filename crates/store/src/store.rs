//! Durable message store.
//!
//! Every message the core has ever handled (sent, received, pending) lives
//! here with its delivery state. All mutations hit SQLite in WAL mode before
//! returning, so a crash or restart loses no delivery obligation. The retry
//! queue is the set of `queued`/`sending` rows; terminal rows are retained
//! as a bounded history for inspection.

use emberlink_core::{
    Classification, CoreError, CoreResult, DeliveryState, GeoPosition, Message, MessageId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info, warn};

/// Remote-store operation owed for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    /// Message must be uploaded to the remote store
    Upload,
    /// Message was pulled from the remote store and must be acked/deleted there
    Ack,
}

impl SyncOperation {
    fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Upload => "upload",
            SyncOperation::Ack => "ack",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(SyncOperation::Upload),
            "ack" => Some(SyncOperation::Ack),
            _ => None,
        }
    }
}

/// A pending remote-store obligation.
///
/// Created by [`MessageStore`] when a relevant mutation lands; consumed and
/// retired by the gateway bridge.
#[derive(Debug, Clone)]
pub struct SyncQueueItem {
    /// Monotonic queue sequence number
    pub seq: i64,
    /// Message the operation applies to
    pub message_id: MessageId,
    /// What the bridge owes the remote store
    pub operation: SyncOperation,
    /// Whether the operation has completed
    pub synced: bool,
}

/// SQLite-backed message store.
pub struct MessageStore {
    db: Connection,
    history_cap: usize,
}

impl MessageStore {
    /// Terminal records retained by the history sweep.
    pub const DEFAULT_HISTORY_CAP: usize = 500;

    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = Connection::open(path)?;

        // WAL keeps writes durable without blocking the relay path on fsync
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                classification TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at_ms INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL,
                hop_limit INTEGER NOT NULL,
                state TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at_ms INTEGER,
                last_seen_at_ms INTEGER,
                lat REAL,
                lon REAL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(state)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at_ms)",
            [],
        )?;

        info!("Message store opened");

        Ok(Self {
            db,
            history_cap: Self::DEFAULT_HISTORY_CAP,
        })
    }

    /// Override the terminal-history retention cap.
    pub fn with_history_cap(mut self, history_cap: usize) -> Self {
        self.history_cap = history_cap.max(1);
        self
    }

    /// Persist a new outbound message.
    ///
    /// Idempotent on id: re-submitting a known id returns the existing record
    /// untouched, never a duplicate insert.
    pub fn put(&mut self, message: &Message) -> CoreResult<Message> {
        if let Some(existing) = self.get(&message.id)? {
            debug!(message_id = %message.id, "put is a no-op, id already stored");
            return Ok(existing);
        }

        self.insert(message)?;
        if message.state == DeliveryState::Queued {
            self.enqueue_sync(&message.id, SyncOperation::Upload)?;
        }

        debug!(
            message_id = %message.id,
            recipient = %message.recipient,
            state = message.state.as_str(),
            "Message persisted"
        );

        Ok(message.clone())
    }

    /// Fetch a message by id.
    pub fn get(&self, id: &MessageId) -> CoreResult<Option<Message>> {
        let message = self
            .db
            .query_row(
                "SELECT id, classification, sender, recipient, payload, created_at_ms,
                        ttl_ms, hop_limit, state, attempt_count, last_attempt_at_ms, lat, lon
                 FROM messages WHERE id = ?1",
                [id.to_hex()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Find a message whose id starts with `prefix`.
    ///
    /// Long-range frames carry 8-character truncated ids; delivery
    /// confirmations arriving over that layer are resolved by prefix.
    pub fn find_by_prefix(&self, prefix: &str) -> CoreResult<Option<Message>> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }
        let message = self
            .db
            .query_row(
                "SELECT id, classification, sender, recipient, payload, created_at_ms,
                        ttl_ms, hop_limit, state, attempt_count, last_attempt_at_ms, lat, lon
                 FROM messages WHERE id LIKE ?1 || '%' LIMIT 1",
                [prefix.to_lowercase()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Move a message to `new_state`, enforcing the lifecycle state machine.
    pub fn update_state(&mut self, id: &MessageId, new_state: DeliveryState) -> CoreResult<()> {
        let current = self
            .get(id)?
            .ok_or_else(|| CoreError::InvalidState {
                from: "missing".to_string(),
                to: new_state.as_str().to_string(),
            })?
            .state;

        if !current.can_transition_to(new_state) {
            return Err(CoreError::InvalidState {
                from: current.as_str().to_string(),
                to: new_state.as_str().to_string(),
            });
        }

        self.db.execute(
            "UPDATE messages SET state = ?1 WHERE id = ?2",
            params![new_state.as_str(), id.to_hex()],
        )?;

        debug!(
            message_id = %id,
            from = current.as_str(),
            to = new_state.as_str(),
            "Delivery state updated"
        );

        Ok(())
    }

    /// Record the start of a delivery attempt.
    ///
    /// Bumps `attempt_count`, stamps `last_attempt_at_ms`, and moves the row
    /// to `sending`. Only the scheduler calls this.
    pub fn record_attempt(&mut self, id: &MessageId, now_ms: u64) -> CoreResult<u32> {
        self.db.execute(
            "UPDATE messages
             SET attempt_count = attempt_count + 1, last_attempt_at_ms = ?1, state = 'sending'
             WHERE id = ?2 AND state IN ('queued', 'sending')",
            params![now_ms as i64, id.to_hex()],
        )?;

        let count: i64 = self.db.query_row(
            "SELECT attempt_count FROM messages WHERE id = ?1",
            [id.to_hex()],
            |row| row.get(0),
        )?;

        Ok(count as u32)
    }

    /// Persist a foreign message accepted from a transport.
    ///
    /// Returns `true` if this is the first sighting. A duplicate inbound id
    /// only bumps `last_seen_at_ms`; it never creates a second logical
    /// message. When `owe_remote_ack` is set, a sync-queue `ack` obligation
    /// is recorded so the bridge retires the item remotely.
    pub fn record_received(
        &mut self,
        message: &Message,
        now_ms: u64,
        owe_remote_ack: bool,
    ) -> CoreResult<bool> {
        if self.get(&message.id)?.is_some() {
            self.db.execute(
                "UPDATE messages SET last_seen_at_ms = ?1 WHERE id = ?2",
                params![now_ms as i64, message.id.to_hex()],
            )?;
            return Ok(false);
        }

        let mut record = message.clone();
        record.state = DeliveryState::Received;
        self.insert(&record)?;
        self.db.execute(
            "UPDATE messages SET last_seen_at_ms = ?1 WHERE id = ?2",
            params![now_ms as i64, message.id.to_hex()],
        )?;

        if owe_remote_ack {
            self.enqueue_sync(&message.id, SyncOperation::Ack)?;
        }

        Ok(true)
    }

    /// All messages still owed a delivery attempt (`queued` or `sending`).
    pub fn list_pending(&self) -> CoreResult<Vec<Message>> {
        let mut stmt = self.db.prepare(
            "SELECT id, classification, sender, recipient, payload, created_at_ms,
                    ttl_ms, hop_limit, state, attempt_count, last_attempt_at_ms, lat, lon
             FROM messages WHERE state IN ('queued', 'sending')
             ORDER BY created_at_ms ASC",
        )?;

        let messages = stmt
            .query_map([], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Number of messages awaiting delivery.
    pub fn pending_count(&self) -> CoreResult<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM messages WHERE state IN ('queued', 'sending')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Expire lapsed messages and sweep old terminal history.
    ///
    /// Active rows whose TTL has elapsed move to `expired` (and leave the
    /// retry queue). Terminal rows beyond the newest `history_cap` are
    /// deleted to bound storage. Returns the number of rows expired.
    pub fn prune_expired(&mut self, now_ms: u64) -> CoreResult<usize> {
        let expired = self.db.execute(
            "UPDATE messages SET state = 'expired'
             WHERE state IN ('queued', 'sending') AND created_at_ms + ttl_ms <= ?1",
            params![now_ms as i64],
        )?;

        if expired > 0 {
            warn!(count = expired, "Messages expired before delivery");
        }

        self.db.execute(
            "DELETE FROM messages
             WHERE state IN ('delivered', 'expired', 'failed', 'received')
               AND id NOT IN (
                   SELECT id FROM messages
                   WHERE state IN ('delivered', 'expired', 'failed', 'received')
                   ORDER BY created_at_ms DESC
                   LIMIT ?1
               )",
            params![self.history_cap as i64],
        )?;

        Ok(expired)
    }

    /// Pending remote-store obligations, oldest first.
    pub fn pending_sync_items(&self) -> CoreResult<Vec<SyncQueueItem>> {
        let mut stmt = self.db.prepare(
            "SELECT seq, message_id, operation, synced FROM sync_queue
             WHERE synced = 0 ORDER BY seq ASC",
        )?;

        let items = stmt
            .query_map([], |row| {
                let id_hex: String = row.get(1)?;
                let op: String = row.get(2)?;
                Ok((row.get::<_, i64>(0)?, id_hex, op, row.get::<_, i64>(3)? != 0))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(items.len());
        for (seq, id_hex, op, synced) in items {
            let message_id = id_hex
                .parse::<MessageId>()
                .map_err(|e| CoreError::DecodeFailure(e.to_string()))?;
            let operation = SyncOperation::parse(&op)
                .ok_or_else(|| CoreError::DecodeFailure(format!("bad sync operation: {op}")))?;
            out.push(SyncQueueItem {
                seq,
                message_id,
                operation,
                synced,
            });
        }

        Ok(out)
    }

    /// Record that a message must reach the remote store.
    ///
    /// Used for foreign unicast receipts this node carries on behalf of an
    /// offline recipient; locally submitted messages get their obligation
    /// in [`MessageStore::put`].
    pub fn enqueue_upload(&mut self, id: &MessageId) -> CoreResult<()> {
        self.enqueue_sync(id, SyncOperation::Upload)
    }

    /// Retire a completed sync obligation.
    pub fn mark_synced(&mut self, seq: i64) -> CoreResult<()> {
        self.db.execute(
            "UPDATE sync_queue SET synced = 1 WHERE seq = ?1",
            params![seq],
        )?;
        Ok(())
    }

    fn insert(&mut self, message: &Message) -> CoreResult<()> {
        self.db.execute(
            "INSERT INTO messages
             (id, classification, sender, recipient, payload, created_at_ms, ttl_ms,
              hop_limit, state, attempt_count, last_attempt_at_ms, lat, lon)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                message.id.to_hex(),
                message.classification.wire_code().to_string(),
                message.sender,
                message.recipient,
                message.payload,
                message.created_at_ms as i64,
                message.ttl_ms as i64,
                message.hop_limit as i64,
                message.state.as_str(),
                message.attempt_count as i64,
                message.last_attempt_at_ms.map(|t| t as i64),
                message.position.map(|p| p.lat),
                message.position.map(|p| p.lon),
            ],
        )?;
        Ok(())
    }

    fn enqueue_sync(&mut self, id: &MessageId, operation: SyncOperation) -> CoreResult<()> {
        self.db.execute(
            "INSERT INTO sync_queue (message_id, operation, synced)
             SELECT ?1, ?2, 0
             WHERE NOT EXISTS (
                 SELECT 1 FROM sync_queue
                 WHERE message_id = ?1 AND operation = ?2 AND synced = 0
             )",
            params![id.to_hex(), operation.as_str()],
        )?;
        Ok(())
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id_hex: String = row.get(0)?;
    let class_code: String = row.get(1)?;
    let state_text: String = row.get(8)?;

    let id = id_hex.parse::<MessageId>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "id".to_string(), rusqlite::types::Type::Text)
    })?;
    let classification = class_code
        .chars()
        .next()
        .and_then(Classification::from_wire_code)
        .ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(
                1,
                "classification".to_string(),
                rusqlite::types::Type::Text,
            )
        })?;
    let state = DeliveryState::parse(&state_text).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(8, "state".to_string(), rusqlite::types::Type::Text)
    })?;

    let lat: Option<f64> = row.get(11)?;
    let lon: Option<f64> = row.get(12)?;
    let position = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(GeoPosition { lat, lon }),
        _ => None,
    };

    Ok(Message {
        id,
        classification,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        payload: row.get(4)?,
        created_at_ms: row.get::<_, i64>(5)? as u64,
        ttl_ms: row.get::<_, i64>(6)? as u64,
        hop_limit: row.get::<_, i64>(7)? as u8,
        state,
        attempt_count: row.get::<_, i64>(9)? as u32,
        last_attempt_at_ms: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberlink_core::BROADCAST;

    fn test_message(now_ms: u64) -> Message {
        Message::new(
            Classification::Text,
            "alice",
            "bob",
            b"hello".to_vec(),
            60_000,
            3,
            now_ms,
        )
    }

    fn open_store() -> MessageStore {
        MessageStore::open(":memory:").unwrap()
    }

    #[test]
    fn test_put_and_get_roundtrip() {
        let mut store = open_store();
        let msg = test_message(1_000);

        store.put(&msg).unwrap();
        let loaded = store.get(&msg.id).unwrap().unwrap();

        assert_eq!(loaded.id, msg.id);
        assert_eq!(loaded.payload, b"hello");
        assert_eq!(loaded.state, DeliveryState::Queued);
        assert_eq!(loaded.hop_limit, 3);
    }

    #[test]
    fn test_put_is_idempotent_on_id() {
        let mut store = open_store();
        let msg = test_message(1_000);

        store.put(&msg).unwrap();
        store.update_state(&msg.id, DeliveryState::Sending).unwrap();

        // Re-submitting the same id returns the stored record, not a reset copy
        let second = store.put(&msg).unwrap();
        assert_eq!(second.state, DeliveryState::Sending);
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_update_state_rejects_terminal_exit() {
        let mut store = open_store();
        let msg = test_message(1_000);
        store.put(&msg).unwrap();

        store.update_state(&msg.id, DeliveryState::Delivered).unwrap();
        let result = store.update_state(&msg.id, DeliveryState::Queued);
        assert!(matches!(result, Err(CoreError::InvalidState { .. })));
    }

    #[test]
    fn test_record_attempt_counts() {
        let mut store = open_store();
        let msg = test_message(1_000);
        store.put(&msg).unwrap();

        assert_eq!(store.record_attempt(&msg.id, 2_000).unwrap(), 1);
        assert_eq!(store.record_attempt(&msg.id, 3_000).unwrap(), 2);

        let loaded = store.get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.state, DeliveryState::Sending);
        assert_eq!(loaded.last_attempt_at_ms, Some(3_000));
    }

    #[test]
    fn test_record_received_dedups() {
        let mut store = open_store();
        let mut msg = test_message(1_000);
        msg.state = DeliveryState::Received;

        assert!(store.record_received(&msg, 2_000, false).unwrap());
        assert!(!store.record_received(&msg, 3_000, false).unwrap());

        // Still exactly one logical record, and not in the retry queue
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_prune_expired_moves_lapsed_rows() {
        let mut store = open_store();
        let msg = test_message(1_000); // expires at 61_000
        store.put(&msg).unwrap();

        assert_eq!(store.prune_expired(60_999).unwrap(), 0);
        assert_eq!(store.prune_expired(61_000).unwrap(), 1);

        let loaded = store.get(&msg.id).unwrap().unwrap();
        assert_eq!(loaded.state, DeliveryState::Expired);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_history_sweep_bounds_terminal_records() {
        let mut store = open_store().with_history_cap(2);

        for i in 0..5u64 {
            let msg = test_message(1_000 + i);
            store.put(&msg).unwrap();
            store.update_state(&msg.id, DeliveryState::Delivered).unwrap();
        }
        store.prune_expired(10_000).unwrap();

        let remaining: i64 = store
            .db
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_history_sweep_never_touches_pending() {
        let mut store = open_store().with_history_cap(1);

        for i in 0..4u64 {
            store.put(&test_message(1_000 + i)).unwrap();
        }
        store.prune_expired(2_000).unwrap();

        assert_eq!(store.pending_count().unwrap(), 4);
    }

    #[test]
    fn test_sync_queue_lifecycle() {
        let mut store = open_store();
        let msg = test_message(1_000);
        store.put(&msg).unwrap();

        let items = store.pending_sync_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, SyncOperation::Upload);
        assert_eq!(items[0].message_id, msg.id);

        store.mark_synced(items[0].seq).unwrap();
        assert!(store.pending_sync_items().unwrap().is_empty());
    }

    #[test]
    fn test_sync_queue_no_duplicate_obligations() {
        let mut store = open_store();
        let msg = test_message(1_000);

        store.put(&msg).unwrap();
        store.put(&msg).unwrap();

        assert_eq!(store.pending_sync_items().unwrap().len(), 1);
    }

    #[test]
    fn test_received_from_cloud_owes_ack() {
        let mut store = open_store();
        let mut msg = Message::new(
            Classification::Announcement,
            "carol",
            BROADCAST,
            b"camp meeting at noon".to_vec(),
            3_600_000,
            5,
            1_000,
        );
        msg.state = DeliveryState::Received;

        store.record_received(&msg, 2_000, true).unwrap();

        let items = store.pending_sync_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, SyncOperation::Ack);
    }

    #[test]
    fn test_position_roundtrip() {
        let mut store = open_store();
        let mut msg = test_message(1_000);
        msg.classification = Classification::Location;
        msg.position = Some(GeoPosition {
            lat: 40.7866,
            lon: -119.2066,
        });

        store.put(&msg).unwrap();
        let loaded = store.get(&msg.id).unwrap().unwrap();
        let pos = loaded.position.unwrap();
        assert!((pos.lat - 40.7866).abs() < 1e-9);
        assert!((pos.lon + 119.2066).abs() < 1e-9);
    }
}
