/// Index tasks
///
/// The four index families behind one `index` operation, dispatched by
/// variant. A task consumes the blocks a fetcher yields and writes rows
/// through an atomic batch per block. In live mode (`save_progress`) each
/// indexed block also advances the task's checkpoint; in bulk mode the
/// bulk indexer owns checkpoint advancement and the flag stays off.
///
/// A task crashing mid-range leaves partial rows but no checkpoint
/// movement; redelivered work overwrites those rows since row identity
/// derives from block and transaction hashes.

use std::sync::Arc;

use crate::block_fetcher::BlockFetcher;
use crate::checkpoint::CheckpointStore;
use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;
use crate::index_balances::stage_block_balances;
use crate::index_blocks::stage_block;
use crate::index_transactions::stage_transaction;
use crate::index_wallets::{snapshot, stage_block_wallets, WalletRuleSnapshot};
use crate::metrics;
use crate::store::IndexStore;
use crate::types::IndexTarget;

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub save_progress: bool,
}

pub enum IndexTask {
    Blocks,
    Transactions,
    Balances,
    Wallets { rules: WalletRuleSnapshot },
}

impl IndexTask {
    /// Build the task for a target. The wallet task snapshots the rule set
    /// once so the whole range is attributed consistently.
    pub fn for_target(target: IndexTarget, store: &IndexStore) -> Result<IndexTask> {
        Ok(match target {
            IndexTarget::Blocks => IndexTask::Blocks,
            IndexTarget::Transactions => IndexTask::Transactions,
            IndexTarget::Balances => IndexTask::Balances,
            IndexTarget::Wallets => IndexTask::Wallets {
                rules: snapshot(store)?,
            },
        })
    }

    pub fn target(&self) -> IndexTarget {
        match self {
            IndexTask::Blocks => IndexTarget::Blocks,
            IndexTask::Transactions => IndexTarget::Transactions,
            IndexTask::Balances => IndexTarget::Balances,
            IndexTask::Wallets { .. } => IndexTarget::Wallets,
        }
    }

    /// Drain the fetcher, writing one atomic batch per block. Returns the
    /// number of blocks indexed.
    pub async fn index(
        &self,
        store: &Arc<IndexStore>,
        chain: &Arc<HeaderChain>,
        checkpoints: &CheckpointStore,
        fetcher: &mut BlockFetcher,
        opts: IndexOptions,
    ) -> Result<u64> {
        let path = if opts.save_progress { "live" } else { "bulk" };
        let mut indexed = 0u64;

        loop {
            let next = match fetcher.next_block().await {
                Ok(next) => next,
                // Reorg past the range start has its own policy upstream.
                Err(e @ IndexerError::ChainReorgDeeperThanRange { .. }) => return Err(e),
                Err(e) => {
                    return Err(IndexerError::IndexTaskFailed {
                        task: self.target().to_string(),
                        reason: e.to_string(),
                    })
                }
            };
            let Some((height, block)) = next else { break };

            let mut batch = store.batch();
            let staged = match self {
                IndexTask::Blocks => stage_block(&mut batch, &block, height),
                IndexTask::Transactions => {
                    let hash = block.block_hash();
                    block.txdata.iter().try_for_each(|tx| {
                        stage_transaction(store, &mut batch, tx, Some((&hash, height)))
                    })
                }
                IndexTask::Balances => stage_block_balances(store, &mut batch, &block, height),
                IndexTask::Wallets { rules } => {
                    stage_block_wallets(store, &mut batch, &block, height, rules)
                }
            };
            let commit = match staged {
                Ok(()) => batch.commit().await,
                Err(e) => Err(e),
            };
            if let Err(e) = commit {
                return Err(IndexerError::IndexTaskFailed {
                    task: self.target().to_string(),
                    reason: e.to_string(),
                });
            }

            if matches!(self, IndexTask::Blocks) {
                metrics::BLOCKS_INDEXED.with_label_values(&[path]).inc();
            }
            if matches!(self, IndexTask::Transactions) {
                metrics::TRANSACTIONS_INDEXED
                    .with_label_values(&[path])
                    .inc_by(block.txdata.len() as u64);
            }

            if opts.save_progress {
                if let Some(locator) = chain.locator_of(&block.block_hash()) {
                    checkpoints
                        .save_progress(self.target().checkpoint_name(), &locator, chain, None)
                        .await?;
                }
            }
            indexed += 1;
        }

        Ok(indexed)
    }
}
