/// Block repositories
///
/// Raw blocks by hash, order-preserving. The node-backed variant issues
/// getdata batches to a connected peer and stitches replies by hash; the
/// store-backed variant reads pre-serialized blocks from `blocks/<hash>`
/// blobs with an LRU hot cache, and doubles as the write-through cache
/// the live listener fills.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::{Block, BlockHash};
use lru::LruCache;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::blob_store::FileBlobStore;
use crate::error::{IndexerError, Result};
use crate::peer::Peer;

const GETDATA_BATCH: usize = 100;
const BLOCK_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait BlockRepository: Send + Sync {
    /// Fetch blocks by hash, returned in the order requested.
    async fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Block>>;
}

fn blob_name(hash: &BlockHash) -> String {
    format!("blocks/{}", hash)
}

/// Blob-backed repository with an in-memory hot cache.
pub struct StoreBlockRepository {
    blobs: Arc<FileBlobStore>,
    cache: Mutex<LruCache<BlockHash, Block>>,
}

impl StoreBlockRepository {
    pub fn new(blobs: Arc<FileBlobStore>, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self {
            blobs,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        if let Some(block) = self.cache.lock().await.get(hash).cloned() {
            return Ok(Some(block));
        }
        let Some(bytes) = self.blobs.read(&blob_name(hash)).await? else {
            return Ok(None);
        };
        let block: Block = encode::deserialize(&bytes)?;
        self.cache.lock().await.put(*hash, block.clone());
        Ok(Some(block))
    }

    pub async fn put_block(&self, block: &Block) -> Result<()> {
        let hash = block.block_hash();
        self.blobs
            .write(&blob_name(&hash), &encode::serialize(block))
            .await?;
        self.cache.lock().await.put(hash, block.clone());
        Ok(())
    }
}

#[async_trait]
impl BlockRepository for StoreBlockRepository {
    async fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Block>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.get_block(hash).await? {
                Some(block) => out.push(block),
                None => {
                    return Err(IndexerError::StorageUnavailable(format!(
                        "block {} not in object store",
                        hash
                    )))
                }
            }
        }
        Ok(out)
    }
}

/// Peer-backed repository. Optionally writes fetched blocks through to a
/// store repository so later runs skip the network.
pub struct NodeBlockRepository {
    peer: Arc<Peer>,
    cache: Option<Arc<StoreBlockRepository>>,
}

impl NodeBlockRepository {
    pub fn new(peer: Arc<Peer>, cache: Option<Arc<StoreBlockRepository>>) -> Self {
        Self { peer, cache }
    }

    async fn fetch_batch(&self, hashes: &[BlockHash]) -> Result<HashMap<BlockHash, Block>> {
        let mut inbound = self.peer.subscribe();
        let invs: Vec<Inventory> = hashes.iter().map(|h| Inventory::Block(*h)).collect();
        self.peer.send(NetworkMessage::GetData(invs)).await?;

        let mut wanted: HashMap<BlockHash, ()> =
            hashes.iter().map(|h| (*h, ())).collect();
        let mut found = HashMap::with_capacity(hashes.len());
        let deadline = tokio::time::Instant::now() + BLOCK_FETCH_TIMEOUT;

        while !wanted.is_empty() {
            let msg = tokio::time::timeout_at(deadline, inbound.recv())
                .await
                .map_err(|_| {
                    IndexerError::PeerDisconnected(format!(
                        "{}: block fetch timeout ({} outstanding)",
                        self.peer.addr(),
                        wanted.len()
                    ))
                })?;
            match msg {
                Ok(NetworkMessage::Block(block)) => {
                    let hash = block.block_hash();
                    if wanted.remove(&hash).is_some() {
                        found.insert(hash, block);
                    }
                }
                Ok(NetworkMessage::NotFound(invs)) => {
                    for inv in invs {
                        if let Inventory::Block(h) | Inventory::WitnessBlock(h) = inv {
                            if wanted.contains_key(&h) {
                                return Err(IndexerError::PeerDisconnected(format!(
                                    "{}: peer does not have block {}",
                                    self.peer.addr(),
                                    h
                                )));
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "block fetch subscriber lagged");
                }
                Err(_) => {
                    return Err(IndexerError::PeerDisconnected(
                        self.peer.addr().to_string(),
                    ))
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl BlockRepository for NodeBlockRepository {
    async fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Block>> {
        let mut by_hash: HashMap<BlockHash, Block> = HashMap::with_capacity(hashes.len());
        let mut misses = Vec::new();

        if let Some(cache) = &self.cache {
            for hash in hashes {
                match cache.get_block(hash).await? {
                    Some(block) => {
                        by_hash.insert(*hash, block);
                    }
                    None => misses.push(*hash),
                }
            }
        } else {
            misses.extend_from_slice(hashes);
        }

        for chunk in misses.chunks(GETDATA_BATCH) {
            let fetched = self.fetch_batch(chunk).await?;
            if let Some(cache) = &self.cache {
                for block in fetched.values() {
                    cache.put_block(block).await?;
                }
            }
            by_hash.extend(fetched);
        }

        hashes
            .iter()
            .map(|h| {
                by_hash.remove(h).ok_or_else(|| {
                    IndexerError::PeerDisconnected(format!("block {} missing from replies", h))
                })
            })
            .collect()
    }
}
