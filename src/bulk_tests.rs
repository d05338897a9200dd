//! Bulk indexer end-to-end scenarios: enqueue windowing, checkpoint
//! suppression, drain-and-advance termination, idempotence, and the
//! single-enqueuer lease race.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::block_repo::BlockRepository;
    use crate::bulk::{BulkIndexer, BulkIndexerConfig};
    use crate::header_chain::HeaderChain;
    use crate::index_blocks::get_hash_at_height;
    use crate::index_transactions::get_tx_row;
    use crate::store::{CF_BALANCES, CF_BLOCKS, CF_TRANSACTIONS, CF_WALLETS};
    use crate::testutil::{build_chain, test_env, MemoryBlockRepository, TestEnv};
    use crate::types::{BlockRange, IndexTarget, LOCK_BLOB, QUEUE_INITIAL_INDEXING};
    use crate::work_queue::PersistentQueue;

    use bitcoin::Block;

    fn work_queue(env: &TestEnv) -> Arc<PersistentQueue> {
        Arc::new(PersistentQueue::new(
            Arc::clone(&env.store),
            QUEUE_INITIAL_INDEXING,
            Duration::from_secs(120),
        ))
    }

    fn indexer_on_queue(
        env: &TestEnv,
        chain: &Arc<HeaderChain>,
        blocks: &[Block],
        queue: &Arc<PersistentQueue>,
        granularity: u32,
        transactions_per_work: u32,
    ) -> BulkIndexer {
        let repository: Arc<dyn BlockRepository> = MemoryBlockRepository::new(blocks);
        BulkIndexer::new(
            Arc::clone(chain),
            repository,
            Arc::clone(&env.store),
            Arc::clone(&env.blobs),
            Arc::clone(&env.checkpoints),
            Arc::clone(queue),
            BulkIndexerConfig {
                block_granularity: granularity,
                transactions_per_work,
                workers: 2,
            },
        )
    }

    fn build_indexer(
        env: &TestEnv,
        chain: &Arc<HeaderChain>,
        blocks: &[Block],
        granularity: u32,
        transactions_per_work: u32,
    ) -> (BulkIndexer, Arc<PersistentQueue>) {
        let queue = work_queue(env);
        let indexer =
            indexer_on_queue(env, chain, blocks, &queue, granularity, transactions_per_work);
        (indexer, queue)
    }

    fn queued_ranges(queue: &PersistentQueue) -> HashMap<IndexTarget, Vec<BlockRange>> {
        let mut by_target: HashMap<IndexTarget, Vec<BlockRange>> = HashMap::new();
        for (_, payload) in queue.peek().unwrap() {
            let range: BlockRange = bincode::deserialize(&payload).unwrap();
            by_target.entry(range.target).or_default().push(range);
        }
        for ranges in by_target.values_mut() {
            ranges.sort_by_key(|r| r.from);
        }
        by_target
    }

    #[tokio::test]
    async fn empty_chain_processes_nothing_and_leaves_genesis_checkpoints() {
        let env = test_env();
        let (chain, blocks) = build_chain(0, 1);
        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 100, 2_000_000);

        let processed = indexer.run().await.unwrap();
        assert_eq!(processed, 0);
        assert!(queue.is_empty().unwrap());

        for target in IndexTarget::ALL {
            let locator = env
                .checkpoints
                .get(target.checkpoint_name(), &chain)
                .await
                .unwrap();
            assert_eq!(locator.hashes, vec![blocks[0].block_hash()]);
        }
    }

    #[tokio::test]
    async fn small_chain_yields_one_range_per_task() {
        let env = test_env();
        let (chain, blocks) = build_chain(249, 1);
        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 100, u32::MAX);

        let processed = indexer.run().await.unwrap();
        assert_eq!(processed, 4);
        assert!(queue.is_empty().unwrap());

        for target in IndexTarget::ALL {
            assert_eq!(
                env.checkpoints
                    .fork_height(target.checkpoint_name(), &chain)
                    .await
                    .unwrap(),
                249
            );
        }

        // spot-check the written rows
        for height in [0u32, 100, 249] {
            assert_eq!(
                get_hash_at_height(&env.store, height).unwrap().unwrap(),
                blocks[height as usize].block_hash()
            );
        }
        let txid = blocks[42].txdata[0].compute_txid();
        let row = get_tx_row(&env.store, &txid).unwrap().unwrap();
        assert_eq!(row.block.map(|(_, h)| h), Some(42));
    }

    #[tokio::test]
    async fn estimator_closes_one_window_per_sample() {
        let env = test_env();
        let (chain, blocks) = build_chain(499, 100);
        // each sample estimates 100 tx * 100 granularity = 10_000, which
        // meets transactions_per_work every time
        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 100, 10_000);

        let lease = env.blobs.lease(LOCK_BLOB).unwrap();
        indexer.enqueue(&lease).await.unwrap();
        drop(lease);

        let by_target = queued_ranges(&queue);
        assert_eq!(by_target.len(), 4);
        for target in IndexTarget::ALL {
            let ranges = &by_target[&target];
            let froms: Vec<u32> = ranges.iter().map(|r| r.from).collect();
            assert_eq!(froms, vec![0, 100, 200, 300, 400]);
            assert!(ranges.iter().all(|r| r.count == 100));
        }
        assert_eq!(queue.len().unwrap(), 20);
    }

    #[tokio::test]
    async fn advanced_checkpoint_suppresses_covered_windows() {
        let env = test_env();
        let (chain, blocks) = build_chain(499, 100);

        // balances already indexed through height 300
        let at_300 = chain.locator_of(&blocks[300].block_hash()).unwrap();
        env.checkpoints
            .save_progress(IndexTarget::Balances.checkpoint_name(), &at_300, &chain, None)
            .await
            .unwrap();

        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 100, 10_000);
        let lease = env.blobs.lease(LOCK_BLOB).unwrap();
        indexer.enqueue(&lease).await.unwrap();
        drop(lease);

        let by_target = queued_ranges(&queue);
        let balances: Vec<u32> = by_target[&IndexTarget::Balances]
            .iter()
            .map(|r| r.from)
            .collect();
        assert_eq!(balances, vec![300, 400]);
        for target in [IndexTarget::Blocks, IndexTarget::Transactions, IndexTarget::Wallets] {
            assert_eq!(by_target[&target].len(), 5);
        }
        assert_eq!(queue.len().unwrap(), 17);
    }

    #[tokio::test]
    async fn enqueued_ranges_cover_the_whole_chain() {
        let env = test_env();
        let (chain, blocks) = build_chain(120, 2);
        // 2 tx * 10 granularity = 20 per sample, window closes every third
        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 10, 60);

        let lease = env.blobs.lease(LOCK_BLOB).unwrap();
        indexer.enqueue(&lease).await.unwrap();
        drop(lease);

        for (_, ranges) in queued_ranges(&queue) {
            let mut next_expected = 0u32;
            for range in ranges {
                assert_eq!(range.from, next_expected);
                next_expected = range.last_height() + 1;
            }
            assert_eq!(next_expected, chain.height() + 1);
        }
    }

    #[tokio::test]
    async fn running_twice_produces_identical_indexes() {
        let env = test_env();
        let (chain, blocks) = build_chain(120, 2);

        let (first, _) = build_indexer(&env, &chain, &blocks, 10, 60);
        first.run().await.unwrap();

        let snapshot = |cf: &str| env.store.scan_all(cf).unwrap();
        let before = (
            snapshot(CF_BLOCKS),
            snapshot(CF_TRANSACTIONS),
            snapshot(CF_BALANCES),
            snapshot(CF_WALLETS),
        );

        let (second, _) = build_indexer(&env, &chain, &blocks, 10, 60);
        second.run().await.unwrap();

        let after = (
            snapshot(CF_BLOCKS),
            snapshot(CF_TRANSACTIONS),
            snapshot(CF_BALANCES),
            snapshot(CF_WALLETS),
        );
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn concurrent_runs_have_exactly_one_enqueuer() {
        let env = test_env();
        let (chain, blocks) = build_chain(249, 1);

        // both instances consume the same queue, as two processes would
        let queue = work_queue(&env);
        let a = indexer_on_queue(&env, &chain, &blocks, &queue, 100, u32::MAX);
        let b = indexer_on_queue(&env, &chain, &blocks, &queue, 100, u32::MAX);

        let (ra, rb) = tokio::join!(a.run(), b.run());
        let total = ra.unwrap() + rb.unwrap();
        // one enqueue pass, four messages, each processed exactly once
        assert_eq!(total, 4);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn reorged_range_is_abandoned_not_redelivered() {
        let env = test_env();
        let (chain, blocks) = build_chain(8, 1);
        let (indexer, queue) = build_indexer(&env, &chain, &blocks, 100, u32::MAX);

        // a stale range reaching past the current chain
        let range = BlockRange::new(IndexTarget::Blocks, 5, 10);
        queue.send(&bincode::serialize(&range).unwrap()).unwrap();
        env.blobs
            .write(LOCK_BLOB, chain.tip_locator().to_hex().as_bytes())
            .await
            .unwrap();

        let processed = indexer.dequeue().await.unwrap();
        assert_eq!(processed, 1);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn failing_range_stays_queued_and_propagates() {
        let env = test_env();
        let (chain, blocks) = build_chain(10, 1);
        // repository only knows the first half of the chain
        let (indexer, queue) = build_indexer(&env, &chain, &blocks[..6], 100, u32::MAX);

        let range = BlockRange::new(IndexTarget::Blocks, 0, 10);
        queue.send(&bincode::serialize(&range).unwrap()).unwrap();
        env.blobs
            .write(LOCK_BLOB, chain.tip_locator().to_hex().as_bytes())
            .await
            .unwrap();

        assert!(indexer.dequeue().await.is_err());
        // the message is still in the queue, invisible until its timeout
        assert_eq!(queue.len().unwrap(), 1);
    }
}
