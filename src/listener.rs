/// Live listener
///
/// Keeps the indexes current from the p2p stream: synchronizes headers,
/// indexes inbound blocks and loose transactions, answers getdata for
/// transactions we are broadcasting, and drives the outbound broadcast
/// queue with its retry ladder. Header-chain mutation and chain/checkpoint
/// writes run on the serial scheduler; per-message indexing runs on the
/// runtime pool. Every spawned task handle is owned here so disposal can
/// join them.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::RejectReason;
use bitcoin::{Block, Transaction, Txid};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block_repo::StoreBlockRepository;
use crate::checkpoint::CheckpointStore;
use crate::error::{IndexerError, Result};
use crate::events::{EventBroadcaster, IndexingEvent};
use crate::header_chain::HeaderChain;
use crate::index_balances::stage_block_balances;
use crate::index_blocks::stage_block;
use crate::index_transactions::{confirmed_height_in_chain, stage_transaction};
use crate::index_wallets::{snapshot, stage_block_wallets};
use crate::metrics;
use crate::peer::{synchronize_headers, Peer, PeerSet, PeerState};
use crate::rejects::{is_rejected, put_reject};
use crate::scheduler::SerialScheduler;
use crate::store::IndexStore;
use crate::telemetry::truncate_hex;
use crate::types::{now_millis, BroadcastEntry, IndexTarget};
use crate::work_queue::{PersistentQueue, QueueMessage};

/// Broadcasting / known-inv tables are heuristics: bulk-cleared at
/// capacity, re-converging through the reject table and inv echoes.
const TABLE_CAPACITY: usize = 1000;

/// Backoff while waiting for enough peers, clamped at the last step.
const PEER_WAIT_BACKOFF_MS: [u64; 9] = [50, 100, 200, 300, 1000, 2000, 3000, 6000, 12000];
const MIN_BROADCAST_PEERS: usize = 2;

/// Reschedule offsets per attempt; a message past the ladder dies.
const RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

pub struct LiveListener {
    chain: Arc<HeaderChain>,
    store: Arc<IndexStore>,
    checkpoints: Arc<CheckpointStore>,
    block_cache: Arc<StoreBlockRepository>,
    peers: Arc<dyn PeerSet>,
    events: Arc<EventBroadcaster>,
    serial: SerialScheduler,
    broadcasting: DashMap<Txid, Transaction>,
    known_invs: DashMap<[u8; 32], ()>,
    broadcast_queue: Arc<PersistentQueue>,
    new_tx_topic: Arc<PersistentQueue>,
    new_block_topic: Arc<PersistentQueue>,
    last_error: StdMutex<Option<IndexerError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

fn inv_hash(inv: &Inventory) -> Option<[u8; 32]> {
    match inv {
        Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
            Some(txid.to_byte_array())
        }
        Inventory::Block(hash)
        | Inventory::CompactBlock(hash)
        | Inventory::WitnessBlock(hash) => Some(hash.to_byte_array()),
        _ => None,
    }
}

impl LiveListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<HeaderChain>,
        store: Arc<IndexStore>,
        checkpoints: Arc<CheckpointStore>,
        block_cache: Arc<StoreBlockRepository>,
        peers: Arc<dyn PeerSet>,
        events: Arc<EventBroadcaster>,
        broadcast_queue: Arc<PersistentQueue>,
        new_tx_topic: Arc<PersistentQueue>,
        new_block_topic: Arc<PersistentQueue>,
    ) -> Self {
        Self {
            chain,
            store,
            checkpoints,
            block_cache,
            peers,
            events,
            serial: SerialScheduler::new(),
            broadcasting: DashMap::new(),
            known_invs: DashMap::new(),
            broadcast_queue,
            new_tx_topic,
            new_block_topic,
            last_error: StdMutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transactions currently tracked for mempool-arrival detection.
    pub fn broadcasting_len(&self) -> usize {
        self.broadcasting.len()
    }

    fn set_last_error(&self, e: IndexerError) {
        // Last writer wins; disposal reports whatever is here.
        *self.last_error.lock().unwrap() = Some(e);
    }

    /// Queue a locally submitted transaction for broadcast.
    pub fn submit_transaction(&self, tx: &Transaction) -> Result<()> {
        let entry = BroadcastEntry {
            raw_tx: encode::serialize(tx),
            tried: 0,
        };
        self.broadcast_queue.send(&bincode::serialize(&entry)?)
    }

    /// inv handling: our own transactions echoing back mean mempool
    /// arrival; everything unseen gets recorded and requested.
    /// Returns the inventory to ask for with getdata.
    pub fn handle_inv(&self, invs: &[Inventory]) -> Vec<Inventory> {
        let mut request = Vec::new();
        for inv in invs {
            if let Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) = inv {
                if self.broadcasting.remove(txid).is_some() {
                    info!(txid = %truncate_hex(&txid.to_string(), 16), "transaction accepted into mempool");
                    continue;
                }
            }
            let Some(hash) = inv_hash(inv) else { continue };
            if self.known_invs.contains_key(&hash) {
                continue;
            }
            if self.known_invs.len() >= TABLE_CAPACITY {
                self.known_invs.clear();
            }
            self.known_invs.insert(hash, ());
            request.push(*inv);
        }
        request
    }

    /// Index a loose transaction and publish the new-transaction event.
    pub async fn handle_tx(&self, tx: Transaction) -> Result<()> {
        let txid = tx.compute_txid();
        let mut batch = self.store.batch();
        stage_transaction(&self.store, &mut batch, &tx, None)?;
        batch.commit().await?;
        metrics::TRANSACTIONS_INDEXED
            .with_label_values(&["live"])
            .inc();

        self.events.broadcast_transaction(txid.to_string(), None);
        let event = IndexingEvent::NewTransaction {
            txid: txid.to_string(),
            confirmed_height: None,
        };
        self.new_tx_topic.send(&serde_json::to_vec(&event)?)?;
        Ok(())
    }

    /// Block handling: re-sync headers with the peer and index the block,
    /// both on the serial scheduler so chain state never interleaves. A
    /// block whose header is still unknown after the sync is dropped; the
    /// next inv+headers round re-delivers it.
    pub async fn handle_block(&self, block: Block, peer: Option<&Arc<Peer>>) -> Result<()> {
        if let Some(peer) = peer {
            let peer = Arc::clone(peer);
            let chain = Arc::clone(&self.chain);
            self.serial
                .run(async move { synchronize_headers(&peer, &chain).await })
                .await?;
        }

        let hash = block.block_hash();
        let Some(entry) = self.chain.get_by_hash(&hash) else {
            debug!(block = %truncate_hex(&hash.to_string(), 16), "header not in chain after sync, dropping block");
            return Ok(());
        };
        if !self.chain.is_canonical(&hash) {
            debug!(block = %truncate_hex(&hash.to_string(), 16), "block off the canonical chain, dropping");
            return Ok(());
        }

        self.block_cache.put_block(&block).await?;
        self.index_block_rows(&block, entry.height).await?;

        self.events.broadcast_block(
            hash.to_string(),
            Some(entry.height),
            block.header.time,
            block.txdata.len(),
        );
        let event = IndexingEvent::NewBlock {
            hash: hash.to_string(),
            height: Some(entry.height),
            time: block.header.time,
            tx_count: block.txdata.len(),
        };
        self.new_block_topic.send(&serde_json::to_vec(&event)?)?;
        Ok(())
    }

    /// Write one block through all four index families and advance their
    /// checkpoints (live mode owns its progression).
    async fn index_block_rows(&self, block: &Block, height: u32) -> Result<()> {
        let hash = block.block_hash();
        let store = Arc::clone(&self.store);
        let block = block.clone();

        self.serial
            .run(async move {
                let mut batch = store.batch();
                stage_block(&mut batch, &block, height)?;
                for tx in &block.txdata {
                    stage_transaction(&store, &mut batch, tx, Some((&hash, height)))?;
                }
                stage_block_balances(&store, &mut batch, &block, height)?;
                let rules = snapshot(&store)?;
                stage_block_wallets(&store, &mut batch, &block, height, &rules)?;
                batch.commit().await?;
                metrics::BLOCKS_INDEXED.with_label_values(&["live"]).inc();
                metrics::TRANSACTIONS_INDEXED
                    .with_label_values(&["live"])
                    .inc_by(block.txdata.len() as u64);
                Ok::<_, IndexerError>(())
            })
            .await?;

        if let Some(locator) = self.chain.locator_of(&hash) {
            for target in IndexTarget::ALL {
                self.checkpoints
                    .save_progress(target.checkpoint_name(), &locator, &self.chain, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// getdata: serve transactions we are broadcasting and drop them from
    /// the broadcasting set.
    pub fn handle_getdata(&self, invs: &[Inventory]) -> Vec<NetworkMessage> {
        let mut replies = Vec::new();
        for inv in invs {
            if let Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) = inv {
                if let Some((_, tx)) = self.broadcasting.remove(txid) {
                    debug!(txid = %truncate_hex(&txid.to_string(), 16), "serving broadcast transaction to peer");
                    replies.push(NetworkMessage::Tx(tx));
                }
            }
        }
        replies
    }

    /// reject: log, persist unless DUPLICATE, and stop tracking the tx.
    pub fn handle_reject(&self, txid: Txid, code: RejectReason, reason: &str) -> Result<()> {
        warn!(txid = %truncate_hex(&txid.to_string(), 16), code = code as u8, reason, "peer rejected transaction");
        if !matches!(code, RejectReason::Duplicate) {
            put_reject(&self.store, &txid, code as u8, reason)?;
        }
        self.broadcasting.remove(&txid);
        Ok(())
    }

    async fn wait_for_peers(&self, min: usize) -> Result<()> {
        let mut step = 0usize;
        while self.peers.connected_count() < min {
            if self.cancel.is_cancelled() {
                return Err(IndexerError::PeerDisconnected(
                    "listener disposed while waiting for peers".into(),
                ));
            }
            let wait = PEER_WAIT_BACKOFF_MS[step.min(PEER_WAIT_BACKOFF_MS.len() - 1)];
            tokio::time::sleep(Duration::from_millis(wait)).await;
            step += 1;
        }
        Ok(())
    }

    /// One message of the broadcast queue: skip rejected or confirmed
    /// transactions, otherwise announce to at least two peers and walk the
    /// retry ladder.
    pub async fn handle_broadcast_message(&self, msg: QueueMessage) -> Result<()> {
        let entry: BroadcastEntry = bincode::deserialize(&msg.payload)
            .map_err(|e| IndexerError::QueueFatal(format!("undecodable broadcast: {}", e)))?;
        let tx: Transaction = encode::deserialize(&entry.raw_tx)?;
        let txid = tx.compute_txid();

        if is_rejected(&self.store, &txid)? {
            debug!(txid = %truncate_hex(&txid.to_string(), 16), "broadcast short-circuited by reject record");
            metrics::BROADCASTS_REJECT_SUPPRESSED.inc();
            return msg.complete();
        }
        if confirmed_height_in_chain(&self.store, &self.chain, &txid)?.is_some() {
            debug!(txid = %truncate_hex(&txid.to_string(), 16), "already confirmed, dropping broadcast");
            return msg.complete();
        }
        if entry.tried >= RETRY_SCHEDULE.len() as u8 {
            info!(txid = %truncate_hex(&txid.to_string(), 16), tried = entry.tried, "broadcast attempts exhausted");
            return msg.complete();
        }

        if self.broadcasting.len() >= TABLE_CAPACITY {
            self.broadcasting.clear();
        }
        self.broadcasting.insert(txid, tx);

        self.wait_for_peers(MIN_BROADCAST_PEERS).await?;
        self.peers
            .broadcast(NetworkMessage::Inv(vec![Inventory::Transaction(txid)]))
            .await?;
        metrics::TRANSACTIONS_BROADCAST.inc();
        info!(txid = %truncate_hex(&txid.to_string(), 16), attempt = entry.tried + 1, "transaction announced");

        let next = BroadcastEntry {
            raw_tx: entry.raw_tx,
            tried: entry.tried + 1,
        };
        msg.reschedule_in(
            RETRY_SCHEDULE[entry.tried as usize],
            &bincode::serialize(&next)?,
        )
    }

    /// Stream one peer until disconnect or disposal. Handshake, header
    /// sync, then dispatch; the broadcast consumer runs alongside.
    pub async fn run(self: &Arc<Self>, peer: Arc<Peer>) -> Result<()> {
        peer.handshake(self.chain.height() as i32).await?;

        {
            let peer = Arc::clone(&peer);
            let chain = Arc::clone(&self.chain);
            self.serial
                .run(async move { synchronize_headers(&peer, &chain).await })
                .await?;
        }
        peer.set_state(PeerState::HeadersSynced);
        info!(peer = %peer.addr(), height = self.chain.height(), "headers synced");

        // Broadcast consumer, owned like every other task we spawn.
        {
            let listener = Arc::clone(self);
            let consumer = tokio::spawn(async move {
                loop {
                    if listener.cancel.is_cancelled() {
                        break;
                    }
                    match listener
                        .broadcast_queue
                        .receive(Duration::from_secs(1))
                        .await
                    {
                        Ok(Some(msg)) => {
                            if let Err(e) = listener.handle_broadcast_message(msg).await {
                                warn!("broadcast handling failed: {}", e);
                                listener.set_last_error(e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_transient() => {}
                        Err(e) => {
                            listener.set_last_error(e);
                            break;
                        }
                    }
                }
            });
            self.tasks.lock().await.push(consumer);
        }

        peer.set_state(PeerState::Streaming);
        let mut inbound = peer.subscribe();

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = inbound.recv() => msg,
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "listener lagged behind peer stream");
                    continue;
                }
                Err(_) => {
                    let e = IndexerError::PeerDisconnected(peer.addr().to_string());
                    self.set_last_error(e);
                    break;
                }
            };

            // Handlers never block the receive loop: everything is handed
            // off to the pool (which itself funnels chain work through the
            // serial scheduler).
            match msg {
                NetworkMessage::Inv(invs) => {
                    let listener = Arc::clone(self);
                    let peer = Arc::clone(&peer);
                    self.spawn_owned(async move {
                        let request = listener.handle_inv(&invs);
                        if !request.is_empty() {
                            if let Err(e) = peer.send(NetworkMessage::GetData(request)).await {
                                listener.set_last_error(e);
                            }
                        }
                    })
                    .await;
                }
                NetworkMessage::Tx(tx) => {
                    let listener = Arc::clone(self);
                    self.spawn_owned(async move {
                        if let Err(e) = listener.handle_tx(tx).await {
                            warn!("transaction indexing failed: {}", e);
                            listener.set_last_error(e);
                        }
                    })
                    .await;
                }
                NetworkMessage::Block(block) => {
                    let listener = Arc::clone(self);
                    let peer = Arc::clone(&peer);
                    self.spawn_owned(async move {
                        if let Err(e) = listener.handle_block(block, Some(&peer)).await {
                            warn!("block indexing failed: {}", e);
                            listener.set_last_error(e);
                        }
                    })
                    .await;
                }
                NetworkMessage::GetData(invs) => {
                    let listener = Arc::clone(self);
                    let peer = Arc::clone(&peer);
                    self.spawn_owned(async move {
                        for reply in listener.handle_getdata(&invs) {
                            if let Err(e) = peer.send(reply).await {
                                listener.set_last_error(e);
                                break;
                            }
                        }
                    })
                    .await;
                }
                NetworkMessage::Reject(reject) => {
                    let txid = Txid::from_raw_hash(reject.hash);
                    if let Err(e) = self.handle_reject(txid, reject.ccode, &reject.reason) {
                        self.set_last_error(e);
                    }
                }
                NetworkMessage::Ping(nonce) => {
                    let _ = peer.send(NetworkMessage::Pong(nonce)).await;
                }
                _ => {}
            }
        }

        peer.set_state(PeerState::Disconnected);
        Ok(())
    }

    async fn spawn_owned<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Dispose: stop the loops, join every owned task, and resolve with
    /// the recorded error if any. The serial scheduler drains and exits
    /// when the listener is dropped.
    pub async fn dispose(self: Arc<Self>) -> Result<()> {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        match self.last_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
