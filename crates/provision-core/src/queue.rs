//! At-least-once queue of operation batches, persisted in redb.
//!
//! # Table design
//!
//! A `MESSAGES` table uses a 24-byte composite key:
//! ```text
//! [ visible_at_ms: u64 big-endian (8 bytes) | message_id: 16 bytes ]
//! ```
//!
//! Byte order equals visibility order, so a range scan up to
//! `visible_upper_bound(now)` yields exactly the messages that may be handed
//! out. Hiding a message after delivery re-keys it with a later timestamp.
//! `MESSAGE_INDEX` maps `message_id -> visible_at_ms` so a delivery token can
//! find its current key.
//!
//! Each delivery gets a fresh receipt. Heartbeats and acknowledgements must
//! present the receipt of the latest delivery; a stale receipt means the
//! visibility window lapsed and someone else may now own the message.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::db_file::DbFile;
use crate::error::{storage, ProvisionError, Result};
use crate::types::{BatchId, OperationId};

// ---------------------------------------------------------------------------
// Batch / Delivery
// ---------------------------------------------------------------------------

/// An ordered set of operations delivered together.
///
/// The order is the linearization chosen at scheduling time; the dispatcher
/// runs operations strictly in this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub operations: Vec<OperationId>,
    pub description: String,
}

impl Batch {
    pub fn new(operations: Vec<OperationId>, description: impl Into<String>) -> Self {
        Self {
            id: BatchId::new(),
            operations,
            description: description.into(),
        }
    }
}

/// Identifies one delivery of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryToken {
    pub message_id: Uuid,
    pub receipt: Uuid,
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message_id, self.receipt)
    }
}

impl FromStr for DeliveryToken {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let (message_id, receipt) = s
            .split_once(':')
            .ok_or_else(|| ProvisionError::InvalidPayload(format!("malformed token '{s}'")))?;
        let parse = |v: &str| {
            Uuid::parse_str(v)
                .map_err(|e| ProvisionError::InvalidPayload(format!("malformed token '{s}': {e}")))
        };
        Ok(Self {
            message_id: parse(message_id)?,
            receipt: parse(receipt)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: DeliveryToken,
    pub batch: Batch,
    pub next_visible_at: DateTime<Utc>,
    /// How many times this message has been handed out, this delivery included.
    pub dequeue_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub visible: usize,
    pub invisible: usize,
}

// ---------------------------------------------------------------------------
// ProvisioningQueue
// ---------------------------------------------------------------------------

pub trait ProvisioningQueue: Send + Sync {
    /// Store a batch, visible after `delay`. Returns the message id.
    fn enqueue(&self, batch: &Batch, delay: Option<Duration>) -> Result<Uuid>;

    /// Hand out at most one visible batch and hide it for the visibility window.
    fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Keep a delivery hidden for `by` from now. Returns the new visible-at.
    fn extend_visibility(&self, token: &DeliveryToken, by: Duration) -> Result<DateTime<Utc>>;

    /// Acknowledge a delivery.
    fn delete(&self, token: &DeliveryToken) -> Result<()>;

    /// Delete the delivery and enqueue the same batch again after `delay`.
    fn requeue(&self, token: &DeliveryToken, batch: &Batch, delay: Duration) -> Result<Uuid>;

    fn stats(&self) -> Result<QueueStats>;
}

// ---------------------------------------------------------------------------
// Table definitions / keys
// ---------------------------------------------------------------------------

const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");
const MESSAGE_INDEX: TableDefinition<&[u8], u64> = TableDefinition::new("message_index");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: Uuid,
    batch: Batch,
    #[serde(default)]
    receipt: Option<Uuid>,
    visible_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    dequeue_count: u32,
}

fn millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

fn message_key(visible_ms: u64, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&visible_ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound for a range scan returning every message visible at `now`.
///
/// The id suffix is `0xff` × 16, greater than any valid UUID, so all messages
/// with `visible_ms <= now_ms` are included.
fn visible_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&millis(now).to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(storage)
}

fn put_message(
    messages: &mut Table<'_, &'static [u8], &'static [u8]>,
    index: &mut Table<'_, &'static [u8], u64>,
    msg: &StoredMessage,
) -> Result<()> {
    let ms = millis(msg.visible_at);
    let key = message_key(ms, msg.id);
    let bytes = serde_json::to_vec(msg)?;
    messages
        .insert(key.as_slice(), bytes.as_slice())
        .map_err(storage)?;
    index.insert(msg.id.as_bytes().as_slice(), ms).map_err(storage)?;
    Ok(())
}

/// Remove the message named by `token` after checking its receipt.
fn take_message(
    messages: &mut Table<'_, &'static [u8], &'static [u8]>,
    index: &mut Table<'_, &'static [u8], u64>,
    token: &DeliveryToken,
) -> Result<StoredMessage> {
    let ms = index
        .get(token.message_id.as_bytes().as_slice())
        .map_err(storage)?
        .map(|g| g.value())
        .ok_or(ProvisionError::MessageNotFound(token.message_id))?;
    let key = message_key(ms, token.message_id);
    let msg: StoredMessage = match messages.get(key.as_slice()).map_err(storage)? {
        Some(guard) => serde_json::from_slice(guard.value())?,
        None => return Err(ProvisionError::MessageNotFound(token.message_id)),
    };
    if msg.receipt != Some(token.receipt) {
        return Err(ProvisionError::LeaseLost(token.message_id));
    }
    messages.remove(key.as_slice()).map_err(storage)?;
    index
        .remove(token.message_id.as_bytes().as_slice())
        .map_err(storage)?;
    Ok(msg)
}

// ---------------------------------------------------------------------------
// RedbQueue
// ---------------------------------------------------------------------------

pub struct RedbQueue {
    file: DbFile,
    visibility_timeout: Duration,
}

impl RedbQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path, visibility_timeout: Duration) -> Result<Self> {
        let file = DbFile::open(path, |wt| {
            wt.open_table(MESSAGES).map_err(storage)?;
            wt.open_table(MESSAGE_INDEX).map_err(storage)?;
            Ok(())
        })?;
        Ok(Self {
            file,
            visibility_timeout,
        })
    }

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        self.file.write(f)
    }

    fn insert_new(wt: &WriteTransaction, batch: &Batch, delay: Duration) -> Result<Uuid> {
        let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
        let mut index = wt.open_table(MESSAGE_INDEX).map_err(storage)?;
        let now = Utc::now();
        let msg = StoredMessage {
            id: Uuid::new_v4(),
            batch: batch.clone(),
            receipt: None,
            visible_at: now + to_chrono(delay)?,
            enqueued_at: now,
            dequeue_count: 0,
        };
        put_message(&mut messages, &mut index, &msg)?;
        Ok(msg.id)
    }
}

impl ProvisioningQueue for RedbQueue {
    fn enqueue(&self, batch: &Batch, delay: Option<Duration>) -> Result<Uuid> {
        let id = self.write(|wt| Self::insert_new(wt, batch, delay.unwrap_or_default()))?;
        debug!(message_id = %id, batch_id = %batch.id, ops = batch.operations.len(), "enqueued batch");
        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<Delivery>> {
        let window = to_chrono(self.visibility_timeout)?;
        self.write(|wt| {
            let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
            let mut index = wt.open_table(MESSAGE_INDEX).map_err(storage)?;
            let now = Utc::now();
            let upper = visible_upper_bound(now);

            let first = match messages
                .range(..=upper.as_slice())
                .map_err(storage)?
                .next()
            {
                Some(entry) => {
                    let (k, v) = entry.map_err(storage)?;
                    let msg: StoredMessage = serde_json::from_slice(v.value())?;
                    Some((k.value().to_vec(), msg))
                }
                None => None,
            };
            let Some((old_key, mut msg)) = first else {
                return Ok(None);
            };

            messages.remove(old_key.as_slice()).map_err(storage)?;
            msg.receipt = Some(Uuid::new_v4());
            msg.visible_at = now + window;
            msg.dequeue_count += 1;
            put_message(&mut messages, &mut index, &msg)?;

            Ok(Some(Delivery {
                token: DeliveryToken {
                    message_id: msg.id,
                    receipt: msg.receipt.unwrap_or_default(),
                },
                batch: msg.batch,
                next_visible_at: msg.visible_at,
                dequeue_count: msg.dequeue_count,
            }))
        })
    }

    fn extend_visibility(&self, token: &DeliveryToken, by: Duration) -> Result<DateTime<Utc>> {
        let by = to_chrono(by)?;
        self.write(|wt| {
            let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
            let mut index = wt.open_table(MESSAGE_INDEX).map_err(storage)?;
            let mut msg = take_message(&mut messages, &mut index, token)?;
            msg.visible_at = Utc::now() + by;
            put_message(&mut messages, &mut index, &msg)?;
            Ok(msg.visible_at)
        })
    }

    fn delete(&self, token: &DeliveryToken) -> Result<()> {
        self.write(|wt| {
            let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
            let mut index = wt.open_table(MESSAGE_INDEX).map_err(storage)?;
            take_message(&mut messages, &mut index, token)?;
            Ok(())
        })?;
        debug!(message_id = %token.message_id, "deleted message");
        Ok(())
    }

    fn requeue(&self, token: &DeliveryToken, batch: &Batch, delay: Duration) -> Result<Uuid> {
        let id = self.write(|wt| {
            {
                let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
                let mut index = wt.open_table(MESSAGE_INDEX).map_err(storage)?;
                take_message(&mut messages, &mut index, token)?;
            }
            Self::insert_new(wt, batch, delay)
        })?;
        debug!(
            old_message_id = %token.message_id,
            message_id = %id,
            delay_ms = delay.as_millis() as u64,
            "requeued batch"
        );
        Ok(id)
    }

    fn stats(&self) -> Result<QueueStats> {
        self.file.read(|rt| {
            let messages = rt.open_table(MESSAGES).map_err(storage)?;
            let now_ms = millis(Utc::now());
            let mut stats = QueueStats::default();
            for entry in messages.iter().map_err(storage)? {
                let (k, _) = entry.map_err(storage)?;
                let mut ms = [0u8; 8];
                ms.copy_from_slice(&k.value()[..8]);
                if u64::from_be_bytes(ms) <= now_ms {
                    stats.visible += 1;
                } else {
                    stats.invisible += 1;
                }
            }
            Ok(stats)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp(window: Duration) -> (TempDir, RedbQueue) {
        let dir = TempDir::new().unwrap();
        let queue = RedbQueue::open(&dir.path().join("queue.redb"), window).unwrap();
        (dir, queue)
    }

    fn batch(label: &str) -> Batch {
        Batch::new(vec![OperationId::new(), OperationId::new()], label)
    }

    #[test]
    fn dequeue_hides_message_for_window() {
        let (_dir, queue) = open_tmp(Duration::from_secs(30));
        let b = batch("first");
        queue.enqueue(&b, None).unwrap();

        let delivery = queue.dequeue().unwrap().expect("visible message");
        assert_eq!(delivery.batch, b);
        assert_eq!(delivery.dequeue_count, 1);
        assert!(queue.dequeue().unwrap().is_none());
        assert_eq!(queue.stats().unwrap(), QueueStats { visible: 0, invisible: 1 });
    }

    #[test]
    fn empty_queue_returns_none() {
        let (_dir, queue) = open_tmp(Duration::from_secs(30));
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn delayed_message_is_not_visible_yet() {
        let (_dir, queue) = open_tmp(Duration::from_secs(30));
        queue
            .enqueue(&batch("later"), Some(Duration::from_secs(60)))
            .unwrap();
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn messages_come_out_in_visibility_order() {
        let (_dir, queue) = open_tmp(Duration::from_secs(30));
        let late = batch("late");
        let early = batch("early");
        queue
            .enqueue(&late, Some(Duration::from_millis(20)))
            .unwrap();
        queue.enqueue(&early, None).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(queue.dequeue().unwrap().unwrap().batch.description, "early");
        assert_eq!(queue.dequeue().unwrap().unwrap().batch.description, "late");
    }

    #[test]
    fn expired_window_redelivers_and_old_token_loses_lease() {
        let (_dir, queue) = open_tmp(Duration::from_millis(30));
        queue.enqueue(&batch("flaky"), None).unwrap();

        let first = queue.dequeue().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let second = queue.dequeue().unwrap().expect("redelivered");
        assert_eq!(first.token.message_id, second.token.message_id);
        assert_ne!(first.token.receipt, second.token.receipt);
        assert_eq!(second.dequeue_count, 2);

        let err = queue.delete(&first.token).unwrap_err();
        assert!(matches!(err, ProvisionError::LeaseLost(_)));
        queue.delete(&second.token).unwrap();
        assert_eq!(queue.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn extend_visibility_keeps_message_hidden() {
        let (_dir, queue) = open_tmp(Duration::from_millis(30));
        queue.enqueue(&batch("long"), None).unwrap();
        let delivery = queue.dequeue().unwrap().unwrap();

        queue
            .extend_visibility(&delivery.token, Duration::from_secs(30))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(queue.dequeue().unwrap().is_none());
        queue.delete(&delivery.token).unwrap();
    }

    #[test]
    fn requeue_preserves_content_with_fresh_id() {
        let (_dir, queue) = open_tmp(Duration::from_secs(30));
        let b = batch("retry me");
        queue.enqueue(&b, None).unwrap();
        let delivery = queue.dequeue().unwrap().unwrap();

        let new_id = queue
            .requeue(&delivery.token, &delivery.batch, Duration::ZERO)
            .unwrap();
        assert_ne!(new_id, delivery.token.message_id);

        let again = queue.dequeue().unwrap().unwrap();
        assert_eq!(again.batch, b);
        assert_eq!(again.dequeue_count, 1);
        assert!(matches!(
            queue.delete(&delivery.token).unwrap_err(),
            ProvisionError::MessageNotFound(_)
        ));
    }

    #[test]
    fn token_round_trips_through_display() {
        let token = DeliveryToken {
            message_id: Uuid::new_v4(),
            receipt: Uuid::new_v4(),
        };
        let parsed: DeliveryToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
        assert!("garbage".parse::<DeliveryToken>().is_err());
    }
}
