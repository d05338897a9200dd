/// Transaction index
///
/// One row per transaction in the `transactions` column family, keyed by
/// txid. Loose (mempool) transactions carry no block reference; when the
/// containing block is indexed the row is overwritten with the confirmed
/// form, keeping the first-seen timestamp.

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::header_chain::HeaderChain;
use crate::store::{IndexStore, RowBatch, CF_TRANSACTIONS};
use crate::types::now_millis;

pub const P_TX: &[u8] = b"tx";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRow {
    /// Consensus-serialized transaction.
    pub raw: Vec<u8>,
    /// Containing block hash and height; None while unconfirmed.
    pub block: Option<([u8; 32], u32)>,
    pub first_seen: u64,
}

impl TxRow {
    pub fn block_hash(&self) -> Option<BlockHash> {
        self.block.map(|(raw, _)| BlockHash::from_byte_array(raw))
    }

    pub fn transaction(&self) -> Result<Transaction> {
        Ok(encode::deserialize(&self.raw)?)
    }
}

/// Write (or upgrade) a transaction row. An already-confirmed row is never
/// downgraded by a late loose copy of the same transaction.
pub fn stage_transaction(
    store: &IndexStore,
    batch: &mut RowBatch,
    tx: &Transaction,
    block: Option<(&BlockHash, u32)>,
) -> Result<()> {
    let txid = tx.compute_txid();
    let existing = get_tx_row(store, &txid)?;

    if block.is_none() {
        if let Some(row) = &existing {
            if row.block.is_some() {
                return Ok(());
            }
        }
    }

    let row = TxRow {
        raw: encode::serialize(tx),
        block: block.map(|(hash, height)| (*hash.as_byte_array(), height)),
        first_seen: existing.map(|r| r.first_seen).unwrap_or_else(now_millis),
    };
    batch.put(
        CF_TRANSACTIONS,
        P_TX,
        txid.as_byte_array(),
        bincode::serialize(&row)?,
    );
    Ok(())
}

pub fn get_tx_row(store: &IndexStore, txid: &Txid) -> Result<Option<TxRow>> {
    match store.get(CF_TRANSACTIONS, P_TX, txid.as_byte_array())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Height at which `txid` is confirmed, if its block still belongs to the
/// current chain.
pub fn confirmed_height_in_chain(
    store: &IndexStore,
    chain: &HeaderChain,
    txid: &Txid,
) -> Result<Option<u32>> {
    let Some(row) = get_tx_row(store, txid)? else {
        return Ok(None);
    };
    let Some((hash_raw, height)) = row.block else {
        return Ok(None);
    };
    let hash = BlockHash::from_byte_array(hash_raw);
    if chain.is_canonical(&hash) {
        Ok(Some(height))
    } else {
        Ok(None)
    }
}
