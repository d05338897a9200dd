/// Block index
///
/// Two partitions in the `blocks` column family: `block` keyed by hash
/// (header, height, tx count) and `height` keyed by big-endian height
/// (hash), so both directions of lookup stay one read.

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{IndexStore, RowBatch, CF_BLOCKS};

pub const P_BLOCK: &[u8] = b"block";
pub const P_HEIGHT: &[u8] = b"height";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRow {
    pub height: u32,
    /// Consensus-serialized 80-byte header.
    pub header: Vec<u8>,
    pub tx_count: u32,
    pub block_size: u32,
    pub time: u32,
}

pub fn stage_block(batch: &mut RowBatch, block: &Block, height: u32) -> Result<()> {
    let hash = block.block_hash();
    let row = BlockRow {
        height,
        header: encode::serialize(&block.header),
        tx_count: block.txdata.len() as u32,
        block_size: encode::serialize(block).len() as u32,
        time: block.header.time,
    };
    batch.put(
        CF_BLOCKS,
        P_BLOCK,
        hash.as_byte_array(),
        bincode::serialize(&row)?,
    );
    batch.put(
        CF_BLOCKS,
        P_HEIGHT,
        &height.to_be_bytes(),
        hash.as_byte_array().to_vec(),
    );
    Ok(())
}

pub fn get_block_row(store: &IndexStore, hash: &BlockHash) -> Result<Option<BlockRow>> {
    match store.get(CF_BLOCKS, P_BLOCK, hash.as_byte_array())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn get_hash_at_height(store: &IndexStore, height: u32) -> Result<Option<BlockHash>> {
    match store.get(CF_BLOCKS, P_HEIGHT, &height.to_be_bytes())? {
        Some(bytes) if bytes.len() == 32 => {
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&bytes);
            Ok(Some(BlockHash::from_byte_array(raw)))
        }
        _ => Ok(None),
    }
}
