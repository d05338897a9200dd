// Persistent reject records: txid -> (code, reason). Any non-duplicate
// rejection is terminal for that transaction and short-circuits future
// broadcast attempts.

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{IndexStore, CF_REJECTS};

pub const P_REJECT: &[u8] = b"reject";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRow {
    pub code: u8,
    pub reason: String,
}

pub fn put_reject(store: &IndexStore, txid: &Txid, code: u8, reason: &str) -> Result<()> {
    let row = RejectRow {
        code,
        reason: reason.to_string(),
    };
    store.upsert(
        CF_REJECTS,
        P_REJECT,
        txid.as_byte_array(),
        &bincode::serialize(&row)?,
    )
}

pub fn get_reject(store: &IndexStore, txid: &Txid) -> Result<Option<RejectRow>> {
    match store.get(CF_REJECTS, P_REJECT, txid.as_byte_array())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn is_rejected(store: &IndexStore, txid: &Txid) -> Result<bool> {
    Ok(get_reject(store, txid)?.is_some())
}
