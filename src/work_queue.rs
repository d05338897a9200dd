/// Persistent scheduled queues
///
/// At-least-once delivery on top of the `queues` column family. Each
/// message lives under its queue's partition with a key ordered by
/// visible-at time; receiving a message atomically re-keys it into the
/// future by the visibility timeout, so a consumer that dies without
/// completing simply lets the message reappear. `send_in` gives the
/// scheduled delivery the broadcast path needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{IndexerError, Result};
use crate::store::{IndexStore, CF_QUEUES};
use crate::types::now_millis;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    delivery_count: u32,
    payload: Vec<u8>,
}

fn message_key(visible_at: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&visible_at.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn visible_at_of(key: &[u8]) -> Result<u64> {
    if key.len() != 16 {
        return Err(IndexerError::QueueFatal(format!(
            "malformed queue key of {} bytes",
            key.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    Ok(u64::from_be_bytes(buf))
}

pub struct PersistentQueue {
    store: Arc<IndexStore>,
    name: String,
    visibility: Duration,
    seq: AtomicU64,
    claim_lock: Mutex<()>,
}

impl PersistentQueue {
    pub fn new(store: Arc<IndexStore>, name: impl Into<String>, visibility: Duration) -> Self {
        Self {
            store,
            name: name.into(),
            visibility,
            // Seed past any sequence a previous process handed out.
            seq: AtomicU64::new(now_millis()),
            claim_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn partition(&self) -> &[u8] {
        self.name.as_bytes()
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_in(Duration::ZERO, payload)
    }

    /// Enqueue a message that becomes visible after `delay`.
    pub fn send_in(&self, delay: Duration, payload: &[u8]) -> Result<()> {
        self.put_message(delay, 0, payload)
    }

    fn put_message(&self, delay: Duration, delivery_count: u32, payload: &[u8]) -> Result<()> {
        let visible_at = now_millis() + delay.as_millis() as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            delivery_count,
            payload: payload.to_vec(),
        };
        self.store.upsert(
            CF_QUEUES,
            self.partition(),
            &message_key(visible_at, seq),
            &bincode::serialize(&envelope)?,
        )
    }

    /// Receive the next visible message, polling every 100 ms up to
    /// `timeout`. Storage hiccups surface as `QueueTransient` so the
    /// caller's next poll retries them.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_claim().await {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => {}
                Err(e) => return Err(IndexerError::QueueTransient(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100).min(self.visibility)).await;
        }
    }

    async fn try_claim(&self) -> Result<Option<QueueMessage>> {
        let _guard = self.claim_lock.lock().await;

        let Some((key, value)) = self.store.first_in_partition(CF_QUEUES, self.partition())? else {
            return Ok(None);
        };
        if visible_at_of(&key)? > now_millis() {
            // Keys are ordered by visibility, so nothing else is ready either.
            return Ok(None);
        }

        let envelope: Envelope = bincode::deserialize(&value)?;
        let delivery_count = envelope.delivery_count + 1;
        let reappear_at = now_millis() + self.visibility.as_millis() as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let new_key = message_key(reappear_at, seq);

        let mut batch = self.store.batch();
        batch.delete(CF_QUEUES, self.partition(), &key);
        batch.put(
            CF_QUEUES,
            self.partition(),
            &new_key,
            bincode::serialize(&Envelope {
                delivery_count,
                payload: envelope.payload.clone(),
            })?,
        );
        batch.commit().await?;

        Ok(Some(QueueMessage {
            store: Arc::clone(&self.store),
            queue: self.name.clone(),
            key: new_key,
            payload: envelope.payload,
            delivery_count,
        }))
    }

    /// Stored messages as (visible-at millis, payload), without claiming
    /// them. Diagnostics only.
    pub fn peek(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        self.store
            .scan_partition(CF_QUEUES, self.partition())?
            .into_iter()
            .map(|(key, value)| {
                let envelope: Envelope = bincode::deserialize(&value)?;
                Ok((visible_at_of(&key)?, envelope.payload))
            })
            .collect()
    }

    /// Number of messages currently stored (visible or in flight).
    pub fn len(&self) -> Result<usize> {
        Ok(self.store.scan_partition(CF_QUEUES, self.partition())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self
            .store
            .first_in_partition(CF_QUEUES, self.partition())?
            .is_none())
    }
}

/// A claimed message. Complete it or reschedule it; doing neither lets the
/// broker re-deliver after the visibility timeout.
pub struct QueueMessage {
    store: Arc<IndexStore>,
    queue: String,
    key: Vec<u8>,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
}

impl QueueMessage {
    pub fn complete(self) -> Result<()> {
        self.store
            .delete(CF_QUEUES, self.queue.as_bytes(), &self.key)
    }

    /// Replace this delivery with a fresh message visible after `delay`.
    /// The payload carries any attempt counter the caller maintains.
    pub fn reschedule_in(self, delay: Duration, payload: &[u8]) -> Result<()> {
        static RESCHEDULE_SEQ: AtomicU64 = AtomicU64::new(0);
        let visible_at = now_millis() + delay.as_millis() as u64;
        let seq = now_millis() + RESCHEDULE_SEQ.fetch_add(1, Ordering::Relaxed);
        let new_key = message_key(visible_at, seq);
        self.store.upsert(
            CF_QUEUES,
            self.queue.as_bytes(),
            &new_key,
            &bincode::serialize(&Envelope {
                delivery_count: 0,
                payload: payload.to_vec(),
            })?,
        )?;
        self.store
            .delete(CF_QUEUES, self.queue.as_bytes(), &self.key)
    }
}
