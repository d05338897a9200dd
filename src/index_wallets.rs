/// Wallet index
///
/// A wallet is a labeled group of scripts. Rules map script-pubkey bytes
/// to wallet labels and live in the `wallet_rules` column family; the
/// wallet index itself reuses the balance row shape with the label as
/// partition. Indexing works from an immutable snapshot of the rules so a
/// range is attributed consistently even while rules are being added.

use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::{Address, Block, Network};
use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::index_balances::{balance_row_key, script_changes, BalanceChangeRow};
use crate::store::{IndexStore, RowBatch, CF_WALLETS, CF_WALLET_RULES};

pub const P_RULE: &[u8] = b"rule";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRule {
    pub label: String,
    pub script: Vec<u8>,
}

/// Immutable script -> labels mapping used while indexing.
#[derive(Debug, Clone, Default)]
pub struct WalletRuleSnapshot {
    by_script: HashMap<Vec<u8>, Vec<String>>,
}

impl WalletRuleSnapshot {
    pub fn labels_for(&self, script: &[u8]) -> Option<&[String]> {
        self.by_script.get(script).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.by_script.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_script.len()
    }
}

fn rule_row_key(rule: &WalletRule) -> Vec<u8> {
    let mut key = Vec::with_capacity(rule.script.len() + 1 + rule.label.len());
    key.extend_from_slice(&rule.script);
    key.push(0);
    key.extend_from_slice(rule.label.as_bytes());
    key
}

pub fn add_rule(store: &IndexStore, label: &str, script: Vec<u8>) -> Result<()> {
    let rule = WalletRule {
        label: label.to_string(),
        script,
    };
    store.upsert(
        CF_WALLET_RULES,
        P_RULE,
        &rule_row_key(&rule),
        &bincode::serialize(&rule)?,
    )
}

/// Convenience: derive the script from a standard address string.
pub fn add_rule_for_address(
    store: &IndexStore,
    label: &str,
    address: &str,
    network: Network,
) -> Result<()> {
    let addr = Address::from_str(address)
        .and_then(|a| a.require_network(network))
        .map_err(|e| IndexerError::other(format!("address '{}': {}", address, e)))?;
    add_rule(store, label, addr.script_pubkey().to_bytes())
}

pub fn list_rules(store: &IndexStore) -> Result<Vec<WalletRule>> {
    store
        .scan_partition(CF_WALLET_RULES, P_RULE)?
        .into_iter()
        .map(|(_, value)| Ok(bincode::deserialize(&value)?))
        .collect()
}

pub fn snapshot(store: &IndexStore) -> Result<WalletRuleSnapshot> {
    let mut by_script: HashMap<Vec<u8>, Vec<String>> = HashMap::new();
    for rule in list_rules(store)? {
        by_script.entry(rule.script).or_default().push(rule.label);
    }
    Ok(WalletRuleSnapshot { by_script })
}

pub fn stage_block_wallets(
    store: &IndexStore,
    batch: &mut RowBatch,
    block: &Block,
    height: u32,
    rules: &WalletRuleSnapshot,
) -> Result<()> {
    if rules.is_empty() {
        return Ok(());
    }
    for change in script_changes(store, block)? {
        let Some(labels) = rules.labels_for(&change.script) else {
            continue;
        };
        let row = BalanceChangeRow {
            txid: *change.txid.as_byte_array(),
            height,
            received_sat: change.received_sat,
            spent_sat: change.spent_sat,
            time: block.header.time,
        };
        let value = bincode::serialize(&row)?;
        for label in labels {
            batch.put(
                CF_WALLETS,
                label.as_bytes(),
                &balance_row_key(height, &change.txid),
                value.clone(),
            );
        }
    }
    Ok(())
}

/// All movements of one wallet, newest first.
pub fn get_wallet_history(store: &IndexStore, label: &str) -> Result<Vec<BalanceChangeRow>> {
    store
        .scan_partition(CF_WALLETS, label.as_bytes())?
        .into_iter()
        .map(|(_, value)| Ok(bincode::deserialize(&value)?))
        .collect()
}
