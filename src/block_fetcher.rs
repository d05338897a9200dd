/// Block fetcher - bounded, single-use, in-order block stream
///
/// Yields the blocks of `[from_height, to_height]` in strictly ascending
/// height order, reading the repository in small batches. If a required
/// height is no longer covered by the chain the range cannot be completed
/// and the fetch fails with `ChainReorgDeeperThanRange`.

use std::collections::VecDeque;
use std::sync::Arc;

use bitcoin::{Block, BlockHash};

use crate::block_repo::BlockRepository;
use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;

const FETCH_BATCH: usize = 16;

pub struct BlockFetcher {
    chain: Arc<HeaderChain>,
    repository: Arc<dyn BlockRepository>,
    to_height: u32,
    next_height: u32,
    buffer: VecDeque<(u32, Block)>,
}

impl BlockFetcher {
    pub fn new(
        chain: Arc<HeaderChain>,
        repository: Arc<dyn BlockRepository>,
        from_height: u32,
        to_height: u32,
    ) -> Self {
        Self {
            chain,
            repository,
            to_height,
            next_height: from_height,
            buffer: VecDeque::new(),
        }
    }

    /// Next block of the range, or None when the range is exhausted.
    pub async fn next_block(&mut self) -> Result<Option<(u32, Block)>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn refill(&mut self) -> Result<()> {
        if self.next_height > self.to_height {
            return Ok(());
        }
        let batch_end = self
            .to_height
            .min(self.next_height + FETCH_BATCH as u32 - 1);

        let mut heights = Vec::with_capacity((batch_end - self.next_height + 1) as usize);
        let mut hashes: Vec<BlockHash> = Vec::with_capacity(heights.capacity());
        for height in self.next_height..=batch_end {
            let entry = self
                .chain
                .get_by_height(height)
                .ok_or(IndexerError::ChainReorgDeeperThanRange { height })?;
            heights.push(height);
            hashes.push(entry.hash);
        }

        let blocks = self.repository.get_blocks(&hashes).await?;
        for ((height, expected), block) in heights.iter().zip(hashes.iter()).zip(blocks) {
            let actual = block.block_hash();
            if actual != *expected {
                return Err(IndexerError::other(format!(
                    "repository returned block {} where {} was requested (height {})",
                    actual, expected, height
                )));
            }
            self.buffer.push_back((*height, block));
        }
        self.next_height = batch_end + 1;
        Ok(())
    }
}
