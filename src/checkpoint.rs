/// Checkpoint store
///
/// One blob per index family under `checkpoints/<name>`, body = hex block
/// locator. A checkpoint marks the "everything below is indexed" frontier
/// and only ever moves up (fork-point height against the live chain),
/// unless the writer holds a lease, which permits a rewind. Created at the
/// genesis locator on first use, never deleted.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::blob_store::{BlobLease, FileBlobStore};
use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;
use crate::locator::BlockLocator;
use crate::types::LOCK_BLOB;

pub struct CheckpointStore {
    blobs: Arc<FileBlobStore>,
    save_lock: Mutex<()>,
}

fn blob_name(name: &str) -> String {
    format!("checkpoints/{}", name)
}

impl CheckpointStore {
    pub fn new(blobs: Arc<FileBlobStore>) -> Self {
        Self {
            blobs,
            save_lock: Mutex::new(()),
        }
    }

    /// Read a checkpoint, creating it at the genesis locator on first use.
    pub async fn get(&self, name: &str, chain: &HeaderChain) -> Result<BlockLocator> {
        let blob = blob_name(name);
        if let Some(bytes) = self.blobs.read(&blob).await? {
            let body = String::from_utf8(bytes)
                .map_err(|e| IndexerError::other(format!("checkpoint {}: {}", name, e)))?;
            return BlockLocator::from_hex(&body);
        }
        let genesis = BlockLocator::single(chain.genesis().hash);
        self.blobs.write(&blob, genesis.to_hex().as_bytes()).await?;
        Ok(genesis)
    }

    /// Exclusive lease on one checkpoint.
    pub fn lease(&self, name: &str) -> Result<BlobLease> {
        self.blobs.lease(&blob_name(name))
    }

    /// Persist `locator` for `name` if it advances the fork point against
    /// the current chain. A lower fork point is a rewind and is refused
    /// unless the caller presents a lease (its own, or the bulk lock's).
    /// Returns whether a write happened.
    pub async fn save_progress(
        &self,
        name: &str,
        locator: &BlockLocator,
        chain: &HeaderChain,
        lease: Option<&BlobLease>,
    ) -> Result<bool> {
        let _guard = self.save_lock.lock().await;

        let blob = blob_name(name);
        if let Some(lease) = lease {
            if lease.name() != blob && lease.name() != LOCK_BLOB {
                return Err(IndexerError::other(format!(
                    "lease '{}' does not cover checkpoint '{}'",
                    lease.name(),
                    name
                )));
            }
        }

        let prior = self.get(name, chain).await?;
        let old_fork = chain.fork_height(&prior);
        let new_fork = chain.fork_height(locator);

        if new_fork <= old_fork && lease.is_none() {
            debug!(
                checkpoint = name,
                old_fork, new_fork, "skipping non-advancing checkpoint write"
            );
            return Ok(false);
        }

        self.blobs.write(&blob, locator.to_hex().as_bytes()).await?;
        Ok(true)
    }

    /// Fork-point height of a stored checkpoint against the chain.
    pub async fn fork_height(&self, name: &str, chain: &HeaderChain) -> Result<u32> {
        let locator = self.get(name, chain).await?;
        Ok(chain.fork_height(&locator))
    }
}
