/// Wide-column index store
///
/// Facade over RocksDB giving every index family a (partition, row) keyed
/// table inside one column family. Row identity derives from content
/// hashes, so upserts are idempotent and redelivered work overwrites its
/// own partial rows. All multi-row writes go through an atomic WriteBatch
/// spanning column families.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};

use crate::error::{IndexerError, Result};

pub const CF_BLOCKS: &str = "blocks";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_BALANCES: &str = "balances";
pub const CF_WALLETS: &str = "wallets";
pub const CF_WALLET_RULES: &str = "wallet_rules";
pub const CF_REJECTS: &str = "rejects";
pub const CF_QUEUES: &str = "queues";

pub const COLUMN_FAMILIES: [&str; 7] = [
    CF_BLOCKS,
    CF_TRANSACTIONS,
    CF_BALANCES,
    CF_WALLETS,
    CF_WALLET_RULES,
    CF_REJECTS,
    CF_QUEUES,
];

/// Composite key: u16 BE partition length, partition bytes, row bytes.
/// The length prefix keeps partitions from bleeding into each other's
/// scan ranges whatever bytes they contain.
fn row_key(partition: &[u8], row: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + partition.len() + row.len());
    key.extend_from_slice(&(partition.len() as u16).to_be_bytes());
    key.extend_from_slice(partition);
    key.extend_from_slice(row);
    key
}

fn partition_prefix(partition: &[u8]) -> Vec<u8> {
    row_key(partition, &[])
}

pub struct IndexStore {
    db: Arc<DB>,
}

impl IndexStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| IndexerError::StorageUnavailable(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn db(&self) -> Arc<DB> {
        Arc::clone(&self.db)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IndexerError::StorageUnavailable(format!("missing column family {}", name)))
    }

    pub fn upsert(&self, cf: &str, partition: &[u8], row: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(handle, row_key(partition, row), value)?;
        Ok(())
    }

    pub fn get(&self, cf: &str, partition: &[u8], row: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf(cf)?;
        Ok(self.db.get_cf(handle, row_key(partition, row))?)
    }

    pub fn delete(&self, cf: &str, partition: &[u8], row: &[u8]) -> Result<()> {
        let handle = self.cf(cf)?;
        self.db.delete_cf(handle, row_key(partition, row))?;
        Ok(())
    }

    /// All rows of one partition in row-key order, keys stripped of the
    /// partition prefix.
    pub fn scan_partition(&self, cf: &str, partition: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let prefix = partition_prefix(partition);
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);

        let mut rows = Vec::new();
        for item in self.db.iterator_cf(handle, mode) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push((key[prefix.len()..].to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// Every row of a column family, composite keys included. Used for
    /// whole-index comparisons and diagnostics.
    pub fn scan_all(&self, cf: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(handle, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// First row of a partition in key order, if any.
    pub fn first_in_partition(&self, cf: &str, partition: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let prefix = partition_prefix(partition);
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);

        if let Some(item) = self.db.iterator_cf(handle, mode).next() {
            let (key, value) = item?;
            if key.starts_with(&prefix) {
                return Ok(Some((key[prefix.len()..].to_vec(), value.to_vec())));
            }
        }
        Ok(None)
    }

    pub fn batch(&self) -> RowBatch {
        RowBatch::new(Arc::clone(&self.db))
    }
}

/// Represents a single buffered operation
#[derive(Clone)]
enum Operation {
    Put {
        cf_name: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: String,
        key: Vec<u8>,
    },
}

/// Buffers (partition, row) writes across column families and commits them
/// in one atomic RocksDB WriteBatch. Either all writes land or none do.
pub struct RowBatch {
    db: Arc<DB>,
    operations: Vec<Operation>,
}

impl RowBatch {
    fn new(db: Arc<DB>) -> Self {
        Self {
            db,
            operations: Vec::new(),
        }
    }

    pub fn put(&mut self, cf_name: &str, partition: &[u8], row: &[u8], value: Vec<u8>) {
        self.operations.push(Operation::Put {
            cf_name: cf_name.to_string(),
            key: row_key(partition, row),
            value,
        });
    }

    pub fn delete(&mut self, cf_name: &str, partition: &[u8], row: &[u8]) {
        self.operations.push(Operation::Delete {
            cf_name: cf_name.to_string(),
            key: row_key(partition, row),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Commit everything in a single atomic write across all column
    /// families, off the async runtime.
    pub async fn commit(self) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let operations = self.operations;
        let db = self.db;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut batch = WriteBatch::default();

            let mut by_cf: HashMap<&str, Vec<&Operation>> = HashMap::new();
            for op in &operations {
                let cf_name = match op {
                    Operation::Put { cf_name, .. } => cf_name.as_str(),
                    Operation::Delete { cf_name, .. } => cf_name.as_str(),
                };
                by_cf.entry(cf_name).or_default().push(op);
            }

            for (cf_name, ops) in by_cf {
                let cf = db.cf_handle(cf_name).ok_or_else(|| {
                    IndexerError::StorageUnavailable(format!("missing column family {}", cf_name))
                })?;
                for op in ops {
                    match op {
                        Operation::Put { key, value, .. } => batch.put_cf(cf, key, value),
                        Operation::Delete { key, .. } => batch.delete_cf(cf, key),
                    }
                }
            }

            db.write(batch)?;
            Ok(())
        })
        .await
        .map_err(|e| IndexerError::other(format!("batch commit join error: {}", e)))?
    }
}
