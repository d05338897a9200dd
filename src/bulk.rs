/// Bulk indexer
///
/// Backfills the four indexes from genesis to the tip. One instance wins
/// the lock-blob lease and walks the chain at `block_granularity` strides,
/// estimating each window's transaction volume as
/// `sampled_tx_count * block_granularity` (a known approximation: every
/// sampled block stands in for the blocks of its stride). Windows close at
/// `transactions_per_work` estimated transactions and become one queue
/// message per index family that has not already passed them. Everyone
/// else loses the lease race and goes straight to dequeueing.
///
/// Messages carry no ordering; correctness rests on idempotent row writes
/// and the advance-only checkpoint rule. Checkpoints move once, at
/// termination, to the tip locator the enqueuer published in the lock
/// blob.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blob_store::{BlobLease, FileBlobStore};
use crate::block_fetcher::BlockFetcher;
use crate::block_repo::BlockRepository;
use crate::checkpoint::CheckpointStore;
use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;
use crate::index_tasks::{IndexOptions, IndexTask};
use crate::locator::BlockLocator;
use crate::metrics;
use crate::store::IndexStore;
use crate::types::{BlockRange, IndexTarget, ENQUEUING_MARKER, LOCK_BLOB};
use crate::work_queue::{PersistentQueue, QueueMessage};

#[derive(Debug, Clone, Copy)]
pub struct BulkIndexerConfig {
    pub block_granularity: u32,
    pub transactions_per_work: u32,
    pub workers: usize,
}

impl Default for BulkIndexerConfig {
    fn default() -> Self {
        Self {
            block_granularity: 100,
            transactions_per_work: 2_000_000,
            workers: 4,
        }
    }
}

#[derive(Clone)]
pub struct BulkIndexer {
    chain: Arc<HeaderChain>,
    repository: Arc<dyn BlockRepository>,
    store: Arc<IndexStore>,
    blobs: Arc<FileBlobStore>,
    checkpoints: Arc<CheckpointStore>,
    queue: Arc<PersistentQueue>,
    config: BulkIndexerConfig,
}

impl BulkIndexer {
    pub fn new(
        chain: Arc<HeaderChain>,
        repository: Arc<dyn BlockRepository>,
        store: Arc<IndexStore>,
        blobs: Arc<FileBlobStore>,
        checkpoints: Arc<CheckpointStore>,
        queue: Arc<PersistentQueue>,
        config: BulkIndexerConfig,
    ) -> Self {
        assert!(config.block_granularity > 0);
        Self {
            chain,
            repository,
            store,
            blobs,
            checkpoints,
            queue,
            config,
        }
    }

    /// Enqueue (if this instance wins the lease) and drain the work queue.
    /// Returns the number of messages processed to completion.
    pub async fn run(&self) -> Result<usize> {
        match self.blobs.lease(LOCK_BLOB) {
            Ok(lease) => {
                self.enqueue(&lease).await?;
            }
            Err(IndexerError::LeaseHeldElsewhere(_)) => {
                info!("another instance holds the enqueue lease, proceeding to dequeue");
            }
            Err(e) => return Err(e),
        }
        self.dequeue().await
    }

    /// Walk the chain at granularity strides and fan ranges out to the
    /// work queue, one message per (range x index family). Publishes the
    /// tip locator in the lock blob when done.
    pub(crate) async fn enqueue(&self, lease: &BlobLease) -> Result<()> {
        self.blobs
            .write_leased(lease, LOCK_BLOB, ENQUEUING_MARKER.as_bytes())
            .await?;

        let tip = self.chain.tip();
        let mut fork_heights: HashMap<IndexTarget, u32> = HashMap::new();
        for target in IndexTarget::ALL {
            let height = self
                .checkpoints
                .fork_height(target.checkpoint_name(), &self.chain)
                .await?;
            fork_heights.insert(target, height);
        }

        let mut sent = 0usize;
        if tip.height > 0 {
            let granularity = self.config.block_granularity;
            let per_work = self.config.transactions_per_work as u64;
            let mut window_start = 0u32;
            let mut estimated: u64 = 0;
            let mut height = 0u32;

            while height <= tip.height {
                let entry = self
                    .chain
                    .get_by_height(height)
                    .ok_or(IndexerError::ChainReorgDeeperThanRange { height })?;
                let sample = self
                    .repository
                    .get_blocks(std::slice::from_ref(&entry.hash))
                    .await?;
                let tx_count = sample
                    .first()
                    .map(|b| b.txdata.len() as u64)
                    .unwrap_or(0);
                estimated += tx_count * granularity as u64;

                if estimated >= per_work {
                    let window_end = (height + granularity - 1).min(tip.height);
                    sent += self.emit_window(window_start, window_end, &fork_heights)?;
                    window_start = window_end + 1;
                    estimated = 0;
                }
                height += granularity;
            }

            if window_start <= tip.height {
                sent += self.emit_window(window_start, tip.height, &fork_heights)?;
            }
        }

        let tip_locator = self.chain.tip_locator();
        self.blobs
            .write_leased(lease, LOCK_BLOB, tip_locator.to_hex().as_bytes())
            .await?;
        info!(
            messages = sent,
            tip = tip.height,
            "enqueue complete, tip locator published"
        );
        Ok(())
    }

    /// Queue `[from..=to]` for every index family whose checkpoint has not
    /// already advanced past the window.
    fn emit_window(
        &self,
        from: u32,
        to: u32,
        fork_heights: &HashMap<IndexTarget, u32>,
    ) -> Result<usize> {
        let mut sent = 0;
        for target in IndexTarget::ALL {
            if fork_heights[&target] > to {
                debug!(%target, from, to, "window already indexed, skipping");
                continue;
            }
            let range = BlockRange::new(target, from, to - from + 1);
            self.queue.send(&bincode::serialize(&range)?)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Indefinite receive loop with a 1-second poll and bounded worker
    /// fan-out. An empty poll with the enqueue marker gone means the work
    /// is drained: advance every checkpoint to the published tip locator
    /// and return.
    pub(crate) async fn dequeue(&self) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut outstanding: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut processed = 0usize;

        loop {
            match self.queue.receive(Duration::from_secs(1)).await {
                Err(e) if e.is_transient() => {
                    warn!("transient queue error, retrying: {}", e);
                    continue;
                }
                Err(e) => {
                    Self::drain(&mut outstanding).await?;
                    return Err(e);
                }
                Ok(Some(msg)) => {
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    let worker = self.clone();
                    outstanding.push(tokio::spawn(async move {
                        let result = worker.process_message(msg).await;
                        drop(permit);
                        result
                    }));
                    processed += 1;
                }
                Ok(None) => {
                    Self::drain(&mut outstanding).await?;

                    match self.blobs.read(LOCK_BLOB).await? {
                        Some(body) if body == ENQUEUING_MARKER.as_bytes() => continue,
                        Some(body) => {
                            let text = String::from_utf8(body)
                                .map_err(|e| IndexerError::other(format!("lock blob: {}", e)))?;
                            let tip_locator = BlockLocator::from_hex(&text)?;
                            for target in IndexTarget::ALL {
                                self.checkpoints
                                    .save_progress(
                                        target.checkpoint_name(),
                                        &tip_locator,
                                        &self.chain,
                                        None,
                                    )
                                    .await?;
                            }
                            info!(processed, "bulk indexing drained, checkpoints advanced");
                            return Ok(processed);
                        }
                        // Nobody has started enqueueing yet; keep polling.
                        None => continue,
                    }
                }
            }
        }
    }

    async fn drain(outstanding: &mut Vec<JoinHandle<Result<()>>>) -> Result<()> {
        let mut first_error = None;
        for joined in futures::future::join_all(outstanding.drain(..)).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => first_error = first_error.or(Some(e)),
                Err(e) => {
                    first_error =
                        first_error.or(Some(IndexerError::other(format!("worker panic: {}", e))))
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Execute one range message. Reorgs deeper than the range abandon the
    /// message (completed so the broker stops redelivering it); any other
    /// failure leaves the message in flight for redelivery and propagates.
    async fn process_message(&self, msg: QueueMessage) -> Result<()> {
        let range: BlockRange = bincode::deserialize(&msg.payload)
            .map_err(|e| IndexerError::QueueFatal(format!("undecodable range: {}", e)))?;
        let task = IndexTask::for_target(range.target, &self.store)?;
        let mut fetcher = BlockFetcher::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.repository),
            range.from,
            range.last_height(),
        );

        match task
            .index(
                &self.store,
                &self.chain,
                &self.checkpoints,
                &mut fetcher,
                IndexOptions {
                    save_progress: false,
                },
            )
            .await
        {
            Ok(blocks) => {
                debug!(range = %range, blocks, "range indexed");
                metrics::RANGES_PROCESSED.inc();
                msg.complete()?;
                Ok(())
            }
            Err(IndexerError::ChainReorgDeeperThanRange { height }) => {
                error!(
                    range = %range,
                    height, "chain reorganized past range start, abandoning range"
                );
                metrics::RANGES_ABANDONED.inc();
                msg.complete()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
