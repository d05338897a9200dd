use serde::{Deserialize, Serialize};

/// Queue names shared between the bulk indexer and the live listener.
pub const QUEUE_INITIAL_INDEXING: &str = "InitialIndexing";
pub const QUEUE_BROADCASTED_TRANSACTIONS: &str = "BroadcastedTransactions";
pub const QUEUE_NEW_TRANSACTION: &str = "NeedIndexNewTransaction";
pub const QUEUE_NEW_BLOCK: &str = "NeedIndexNewBlock";

/// Blob holding the bulk-indexer coordination state.
/// Body is either `ENQUEUING_MARKER` or the hex tip locator.
pub const LOCK_BLOB: &str = "initialindexer/lock";
pub const ENQUEUING_MARKER: &str = "Enqueuing";

/// The four index families and their checkpoint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexTarget {
    Blocks,
    Transactions,
    Balances,
    Wallets,
}

impl IndexTarget {
    pub const ALL: [IndexTarget; 4] = [
        IndexTarget::Blocks,
        IndexTarget::Transactions,
        IndexTarget::Balances,
        IndexTarget::Wallets,
    ];

    pub fn checkpoint_name(&self) -> &'static str {
        match self {
            IndexTarget::Blocks => "blocks",
            IndexTarget::Transactions => "transactions",
            IndexTarget::Balances => "balances",
            IndexTarget::Wallets => "wallets",
        }
    }
}

impl std::fmt::Display for IndexTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.checkpoint_name())
    }
}

/// One contiguous slice of the chain targeted at one index family.
///
/// `from + count - 1` must be reachable in the chain at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub target: IndexTarget,
    pub from: u32,
    pub count: u32,
    pub processed: bool,
}

impl BlockRange {
    pub fn new(target: IndexTarget, from: u32, count: u32) -> Self {
        debug_assert!(count > 0);
        Self {
            target,
            from,
            count,
            processed: false,
        }
    }

    /// Highest height covered by this range.
    pub fn last_height(&self) -> u32 {
        self.from + self.count - 1
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}..{}]", self.target, self.from, self.last_height())
    }
}

/// Payload of the `BroadcastedTransactions` queue. The attempt counter
/// travels with the message so rescheduling survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub raw_tx: Vec<u8>,
    pub tried: u8,
}

/// Unix milliseconds, used for queue scheduling and row timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_last_height() {
        let r = BlockRange::new(IndexTarget::Blocks, 100, 100);
        assert_eq!(r.last_height(), 199);
        let one = BlockRange::new(IndexTarget::Wallets, 0, 1);
        assert_eq!(one.last_height(), 0);
    }

    #[test]
    fn block_range_roundtrips_through_bincode() {
        let r = BlockRange::new(IndexTarget::Balances, 42, 7);
        let bytes = bincode::serialize(&r).unwrap();
        let back: BlockRange = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, r);
    }
}
