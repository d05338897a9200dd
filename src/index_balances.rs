/// Balance index
///
/// Denormalized balance movements per script, one row per (script,
/// transaction): partition = script-pubkey bytes, row key =
/// (u32::MAX - height) then txid, so scans read newest first. Spent
/// amounts resolve each input's funding output through the transaction
/// index; inputs whose funding transaction is unknown are skipped.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::{Block, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;
use crate::index_transactions::get_tx_row;
use crate::store::{IndexStore, RowBatch, CF_BALANCES};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceChangeRow {
    pub txid: [u8; 32],
    pub height: u32,
    pub received_sat: u64,
    pub spent_sat: u64,
    pub time: u32,
}

/// Newest-first row key within a script partition.
pub fn balance_row_key(height: u32, txid: &Txid) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&(u32::MAX - height).to_be_bytes());
    key.extend_from_slice(txid.as_byte_array());
    key
}

/// Per-script movement of one transaction.
pub struct ScriptChange {
    pub script: Vec<u8>,
    pub txid: Txid,
    pub received_sat: u64,
    pub spent_sat: u64,
}

/// Compute every script's movement in `block`. Funding outputs are looked
/// up first among the block's own transactions, then in the transaction
/// index.
pub fn script_changes(store: &IndexStore, block: &Block) -> Result<Vec<ScriptChange>> {
    let in_block: HashMap<Txid, &Transaction> = block
        .txdata
        .iter()
        .map(|tx| (tx.compute_txid(), tx))
        .collect();

    let mut changes = Vec::new();
    for tx in &block.txdata {
        let txid = tx.compute_txid();
        // script -> (received, spent)
        let mut per_script: HashMap<Vec<u8>, (u64, u64)> = HashMap::new();

        for output in &tx.output {
            let entry = per_script
                .entry(output.script_pubkey.to_bytes())
                .or_default();
            entry.0 += output.value.to_sat();
        }

        if !tx.is_coinbase() {
            for input in &tx.input {
                let prev = input.previous_output;
                let funding = match in_block.get(&prev.txid) {
                    Some(tx) => Some((*tx).clone()),
                    None => match get_tx_row(store, &prev.txid)? {
                        Some(row) => Some(row.transaction()?),
                        None => None,
                    },
                };
                let Some(funding) = funding else {
                    trace!(txid = %txid, prev = %prev.txid, "funding tx unknown, skipping spend attribution");
                    continue;
                };
                let Some(spent_out) = funding.output.get(prev.vout as usize) else {
                    continue;
                };
                let entry = per_script
                    .entry(spent_out.script_pubkey.to_bytes())
                    .or_default();
                entry.1 += spent_out.value.to_sat();
            }
        }

        for (script, (received_sat, spent_sat)) in per_script {
            changes.push(ScriptChange {
                script,
                txid,
                received_sat,
                spent_sat,
            });
        }
    }
    Ok(changes)
}

pub fn stage_block_balances(
    store: &IndexStore,
    batch: &mut RowBatch,
    block: &Block,
    height: u32,
) -> Result<()> {
    for change in script_changes(store, block)? {
        let row = BalanceChangeRow {
            txid: *change.txid.as_byte_array(),
            height,
            received_sat: change.received_sat,
            spent_sat: change.spent_sat,
            time: block.header.time,
        };
        batch.put(
            CF_BALANCES,
            &change.script,
            &balance_row_key(height, &change.txid),
            bincode::serialize(&row)?,
        );
    }
    Ok(())
}

/// All movements of one script, newest first.
pub fn get_balance_history(
    store: &IndexStore,
    script: &[u8],
) -> Result<Vec<BalanceChangeRow>> {
    store
        .scan_partition(CF_BALANCES, script)?
        .into_iter()
        .map(|(_, value)| Ok(bincode::deserialize(&value)?))
        .collect()
}
