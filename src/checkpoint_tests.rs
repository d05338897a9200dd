//! Checkpoint persistence and the advance-only rule.

#[cfg(test)]
mod tests {
    use crate::testutil::{build_chain, test_env};
    use crate::types::LOCK_BLOB;

    #[tokio::test]
    async fn first_use_creates_genesis_checkpoint() {
        let env = test_env();
        let (chain, blocks) = build_chain(3, 1);

        let locator = env.checkpoints.get("blocks", &chain).await.unwrap();
        assert_eq!(locator.hashes, vec![blocks[0].block_hash()]);
        assert_eq!(env.checkpoints.fork_height("blocks", &chain).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_progress_advances_and_persists() {
        let env = test_env();
        let (chain, blocks) = build_chain(50, 1);

        let at_30 = chain.locator_of(&blocks[30].block_hash()).unwrap();
        assert!(env
            .checkpoints
            .save_progress("transactions", &at_30, &chain, None)
            .await
            .unwrap());
        assert_eq!(
            env.checkpoints
                .fork_height("transactions", &chain)
                .await
                .unwrap(),
            30
        );
    }

    #[tokio::test]
    async fn rewind_requires_a_lease() {
        let env = test_env();
        let (chain, blocks) = build_chain(50, 1);

        let at_40 = chain.locator_of(&blocks[40].block_hash()).unwrap();
        let at_10 = chain.locator_of(&blocks[10].block_hash()).unwrap();

        env.checkpoints
            .save_progress("balances", &at_40, &chain, None)
            .await
            .unwrap();

        // without a lease the rewind is skipped
        assert!(!env
            .checkpoints
            .save_progress("balances", &at_10, &chain, None)
            .await
            .unwrap());
        assert_eq!(
            env.checkpoints.fork_height("balances", &chain).await.unwrap(),
            40
        );

        // the bulk lock lease permits it
        let lease = env.blobs.lease(LOCK_BLOB).unwrap();
        assert!(env
            .checkpoints
            .save_progress("balances", &at_10, &chain, Some(&lease))
            .await
            .unwrap());
        assert_eq!(
            env.checkpoints.fork_height("balances", &chain).await.unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn fork_heights_are_monotonic_over_completion_sequences() {
        let env = test_env();
        let (chain, blocks) = build_chain(60, 1);

        // completions arrive out of order, as bulk ranges do
        let completion_heights = [10u32, 40, 25, 40, 55, 5, 60, 30];
        let mut observed = Vec::new();
        for height in completion_heights {
            let locator = chain
                .locator_of(&blocks[height as usize].block_hash())
                .unwrap();
            env.checkpoints
                .save_progress("wallets", &locator, &chain, None)
                .await
                .unwrap();
            observed.push(env.checkpoints.fork_height("wallets", &chain).await.unwrap());
        }

        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*observed.last().unwrap(), 60);
    }

    #[tokio::test]
    async fn checkpoints_survive_reopen() {
        let env = test_env();
        let (chain, blocks) = build_chain(20, 1);

        let at_tip = chain.locator_of(&blocks[20].block_hash()).unwrap();
        env.checkpoints
            .save_progress("blocks", &at_tip, &chain, None)
            .await
            .unwrap();

        // a second store over the same blob directory sees the frontier
        let reopened = crate::checkpoint::CheckpointStore::new(env.blobs.clone());
        assert_eq!(reopened.fork_height("blocks", &chain).await.unwrap(), 20);
    }
}
