//! Header chain behavior: extension, lookups, locators, fork detection,
//! and reorg re-anchoring consistency.

#[cfg(test)]
mod tests {
    use bitcoin::block::{Header, Version};
    use bitcoin::hashes::Hash;
    use bitcoin::pow::CompactTarget;
    use bitcoin::{BlockHash, TxMerkleNode};

    use crate::header_chain::HeaderChain;
    use crate::locator::BlockLocator;
    use crate::testutil::{build_chain, TEST_NETWORK};

    fn header_on(prev: BlockHash, height: u32, nonce_salt: u32) -> Header {
        Header {
            version: Version::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000 + height,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: height.wrapping_add(nonce_salt),
        }
    }

    #[test]
    fn fresh_chain_is_genesis_only() {
        let chain = HeaderChain::new(TEST_NETWORK);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.genesis().hash, chain.tip().hash);
        assert_eq!(chain.get_by_height(0).unwrap().hash, chain.genesis().hash);
        assert!(chain.get_by_height(1).is_none());
    }

    #[test]
    fn extend_links_heights_and_hashes() {
        let (chain, blocks) = build_chain(20, 1);
        assert_eq!(chain.height(), 20);
        for (height, block) in blocks.iter().enumerate() {
            let hash = block.block_hash();
            let entry = chain.get_by_height(height as u32).unwrap();
            assert_eq!(entry.hash, hash);
            assert_eq!(chain.get_by_hash(&hash).unwrap().height, height as u32);
        }
        // parent of every non-genesis entry is present with height - 1
        for height in 1..=20u32 {
            let entry = chain.get_by_height(height).unwrap();
            let parent = chain.get_by_hash(&entry.header.prev_blockhash).unwrap();
            assert_eq!(parent.height, height - 1);
        }
    }

    #[test]
    fn enumerate_after_yields_successors_in_order() {
        let (chain, blocks) = build_chain(10, 1);
        let from = blocks[4].block_hash();
        let successors = chain.enumerate_after(&from);
        assert_eq!(successors.len(), 6);
        for (i, entry) in successors.iter().enumerate() {
            assert_eq!(entry.height, 5 + i as u32);
        }
        assert!(chain
            .enumerate_after(&BlockHash::all_zeros())
            .is_empty());
    }

    #[test]
    fn locator_ends_at_genesis_and_finds_fork() {
        let (chain, blocks) = build_chain(100, 1);
        let locator = chain.tip_locator();
        assert_eq!(locator.hashes.first(), Some(&blocks[100].block_hash()));
        assert_eq!(locator.hashes.last(), Some(&blocks[0].block_hash()));

        let fork = chain.find_fork(&locator);
        assert_eq!(fork.height, 100);

        // a locator of an earlier block resolves to that block
        let mid = chain.locator_of(&blocks[60].block_hash()).unwrap();
        assert_eq!(chain.fork_height(&mid), 60);
    }

    #[test]
    fn locator_of_unknown_block_is_none() {
        let (chain, _) = build_chain(5, 1);
        assert!(chain.locator_of(&BlockHash::all_zeros()).is_none());
    }

    #[test]
    fn find_fork_with_foreign_locator_falls_back_to_genesis() {
        let (chain, _) = build_chain(5, 1);
        let foreign = BlockLocator::new(vec![
            BlockHash::from_byte_array([7u8; 32]),
            BlockHash::from_byte_array([8u8; 32]),
        ]);
        assert_eq!(chain.find_fork(&foreign).height, 0);
    }

    #[test]
    fn reorg_re_anchors_at_fork_point() {
        let (chain, blocks) = build_chain(10, 1);
        let old_tip = chain.tip().hash;

        // competing branch from height 6, one block longer
        let mut branch = Vec::new();
        let mut prev = blocks[6].block_hash();
        for height in 7..=12u32 {
            let header = header_on(prev, height, 9999);
            prev = header.block_hash();
            branch.push(header);
        }

        let outcome = chain.extend(&branch);
        assert!(outcome.reorged);
        assert_eq!(outcome.accepted, 6);
        assert_eq!(chain.height(), 12);

        // height table rewritten consistently
        for height in 0..=6u32 {
            assert_eq!(
                chain.get_by_height(height).unwrap().hash,
                blocks[height as usize].block_hash()
            );
        }
        for (i, header) in branch.iter().enumerate() {
            assert_eq!(
                chain.get_by_height(7 + i as u32).unwrap().hash,
                header.block_hash()
            );
        }

        // the abandoned suffix is still known but no longer canonical
        assert!(chain.get_by_hash(&old_tip).is_some());
        assert!(!chain.is_canonical(&old_tip));
        assert!(chain.enumerate_after(&old_tip).is_empty());
    }

    #[test]
    fn duplicate_and_orphan_headers_are_ignored() {
        let (chain, blocks) = build_chain(5, 1);
        let before = chain.height();

        // replaying known headers accepts nothing
        let replay: Vec<_> = blocks[1..].iter().map(|b| b.header).collect();
        let outcome = chain.extend(&replay);
        assert_eq!(outcome.accepted, 0);
        assert!(!outcome.reorged);

        // a header with an unknown parent stops the batch
        let orphan = header_on(BlockHash::from_byte_array([3u8; 32]), 99, 1);
        let outcome = chain.extend(&[orphan]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(chain.height(), before);
    }
}
