/// Event bus - real-time indexing events
///
/// Tokio broadcast channels for pub/sub; consumers subscribe and lagging
/// receivers drop the oldest events. The durable counterparts of these
/// events are the NeedIndexNewTransaction / NeedIndexNewBlock queue
/// topics, published by the live listener alongside the in-process bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndexingEvent {
    NewBlock {
        hash: String,
        height: Option<u32>,
        time: u32,
        tx_count: usize,
    },
    NewTransaction {
        txid: String,
        confirmed_height: Option<u32>,
    },
}

pub struct EventBroadcaster {
    block_tx: broadcast::Sender<IndexingEvent>,
    transaction_tx: broadcast::Sender<IndexingEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (block_tx, _) = broadcast::channel(1000);
        let (transaction_tx, _) = broadcast::channel(1000);
        Self {
            block_tx,
            transaction_tx,
        }
    }

    pub fn broadcast_block(&self, hash: String, height: Option<u32>, time: u32, tx_count: usize) {
        let event = IndexingEvent::NewBlock {
            hash,
            height,
            time,
            tx_count,
        };
        let _ = self.block_tx.send(event);
    }

    pub fn broadcast_transaction(&self, txid: String, confirmed_height: Option<u32>) {
        let event = IndexingEvent::NewTransaction {
            txid,
            confirmed_height,
        };
        let _ = self.transaction_tx.send(event);
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<IndexingEvent> {
        self.block_tx.subscribe()
    }

    pub fn subscribe_transactions(&self) -> broadcast::Receiver<IndexingEvent> {
        self.transaction_tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
