//! Shared helpers for the crate's tests: synthetic regtest-style chains,
//! an in-memory block repository, and temp-dir backed stores.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::script::Builder;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};
use tempfile::TempDir;

use crate::blob_store::FileBlobStore;
use crate::block_repo::BlockRepository;
use crate::checkpoint::CheckpointStore;
use crate::error::{IndexerError, Result};
use crate::header_chain::HeaderChain;
use crate::store::IndexStore;

pub const TEST_NETWORK: Network = Network::Regtest;

pub fn script_for(tag: i64) -> ScriptBuf {
    Builder::new().push_int(tag).into_script()
}

pub fn coinbase_tx(height: u32, payout: &ScriptBuf) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(height as i64).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_0000_0000),
            script_pubkey: payout.clone(),
        }],
    }
}

/// A synthetic non-coinbase transaction spending an unknown outpoint.
pub fn filler_tx(height: u32, index: u32, payout: &ScriptBuf) -> Transaction {
    let mut raw = [0u8; 32];
    raw[..4].copy_from_slice(&height.to_le_bytes());
    raw[4..8].copy_from_slice(&index.to_le_bytes());
    raw[8] = 0xfe;
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array(raw),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: payout.clone(),
        }],
    }
}

fn header_on(prev: BlockHash, height: u32) -> Header {
    Header {
        version: Version::ONE,
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_700_000_000 + height,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height,
    }
}

/// Build a chain of `blocks_after_genesis` blocks on top of genesis, each
/// carrying `txs_per_block` transactions (coinbase included). Returns the
/// populated header chain and every block, genesis first.
pub fn build_chain(
    blocks_after_genesis: u32,
    txs_per_block: u32,
) -> (Arc<HeaderChain>, Vec<Block>) {
    assert!(txs_per_block >= 1);
    let chain = Arc::new(HeaderChain::new(TEST_NETWORK));
    let mut blocks = vec![genesis_block(TEST_NETWORK)];

    let mut prev = blocks[0].block_hash();
    let mut headers = Vec::new();
    for height in 1..=blocks_after_genesis {
        let payout = script_for(height as i64);
        let mut txdata = vec![coinbase_tx(height, &payout)];
        for i in 1..txs_per_block {
            txdata.push(filler_tx(height, i, &payout));
        }
        let header = header_on(prev, height);
        let block = Block { header, txdata };
        prev = block.block_hash();
        headers.push(header);
        blocks.push(block);
    }

    let outcome = chain.extend(&headers);
    assert_eq!(outcome.accepted as u32, blocks_after_genesis);
    (chain, blocks)
}

/// Repository over a fixed block set.
pub struct MemoryBlockRepository {
    blocks: HashMap<BlockHash, Block>,
}

impl MemoryBlockRepository {
    pub fn new(blocks: &[Block]) -> Arc<Self> {
        Arc::new(Self {
            blocks: blocks
                .iter()
                .map(|b| (b.block_hash(), b.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl BlockRepository for MemoryBlockRepository {
    async fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Block>> {
        hashes
            .iter()
            .map(|h| {
                self.blocks
                    .get(h)
                    .cloned()
                    .ok_or_else(|| IndexerError::PeerDisconnected(format!("no block {}", h)))
            })
            .collect()
    }
}

pub struct TestEnv {
    pub store: Arc<IndexStore>,
    pub blobs: Arc<FileBlobStore>,
    pub checkpoints: Arc<CheckpointStore>,
    _db_dir: TempDir,
    _blob_dir: TempDir,
}

pub fn test_env() -> TestEnv {
    let db_dir = TempDir::new().unwrap();
    let blob_dir = TempDir::new().unwrap();
    let store = Arc::new(IndexStore::open(db_dir.path()).unwrap());
    let blobs = Arc::new(FileBlobStore::new(blob_dir.path()).unwrap());
    let checkpoints = Arc::new(CheckpointStore::new(Arc::clone(&blobs)));
    TestEnv {
        store,
        blobs,
        checkpoints,
        _db_dir: db_dir,
        _blob_dir: blob_dir,
    }
}
