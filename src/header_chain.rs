/// In-memory block header chain
///
/// Arena of header records plus a hash map and a canonical height table.
/// Parent links are by content hash, so no cycles can arise; reorgs
/// replace the canonical suffix by rewriting the height table while the
/// arena keeps orphaned records around for fork lookups.
///
/// Thread-safe: reads take the shared lock, mutations the exclusive one.
/// The live listener additionally serializes mutations on its scheduler.

use std::collections::HashMap;
use std::sync::RwLock;

use bitcoin::block::Header;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{BlockHash, Network};

use crate::locator::BlockLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: BlockHash,
    pub height: u32,
    pub header: Header,
}

struct Record {
    hash: BlockHash,
    height: u32,
    header: Header,
}

struct ChainInner {
    records: Vec<Record>,
    by_hash: HashMap<BlockHash, usize>,
    /// height -> arena index of the canonical record at that height.
    /// Invariant: `records[canonical[h]].height == h` for every h.
    canonical: Vec<usize>,
}

impl ChainInner {
    fn entry(&self, idx: usize) -> ChainEntry {
        let r = &self.records[idx];
        ChainEntry {
            hash: r.hash,
            height: r.height,
            header: r.header,
        }
    }

    fn is_canonical(&self, idx: usize) -> bool {
        let height = self.records[idx].height as usize;
        self.canonical.get(height) == Some(&idx)
    }

    fn tip_idx(&self) -> usize {
        *self.canonical.last().expect("canonical never empty")
    }
}

pub struct HeaderChain {
    inner: RwLock<ChainInner>,
}

/// Outcome of feeding a batch of headers into the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendOutcome {
    pub accepted: usize,
    pub reorged: bool,
}

impl HeaderChain {
    pub fn new(network: Network) -> Self {
        let genesis = genesis_block(network).header;
        let hash = genesis.block_hash();
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, 0);
        Self {
            inner: RwLock::new(ChainInner {
                records: vec![Record {
                    hash,
                    height: 0,
                    header: genesis,
                }],
                by_hash,
                canonical: vec![0],
            }),
        }
    }

    pub fn genesis(&self) -> ChainEntry {
        let inner = self.inner.read().unwrap();
        inner.entry(inner.canonical[0])
    }

    pub fn tip(&self) -> ChainEntry {
        let inner = self.inner.read().unwrap();
        inner.entry(inner.tip_idx())
    }

    /// Height of the canonical tip.
    pub fn height(&self) -> u32 {
        let inner = self.inner.read().unwrap();
        (inner.canonical.len() - 1) as u32
    }

    /// Look up any known record, canonical or orphaned.
    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<ChainEntry> {
        let inner = self.inner.read().unwrap();
        inner.by_hash.get(hash).map(|&idx| inner.entry(idx))
    }

    pub fn get_by_height(&self, height: u32) -> Option<ChainEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .canonical
            .get(height as usize)
            .map(|&idx| inner.entry(idx))
    }

    /// True when `hash` sits on the canonical chain.
    pub fn is_canonical(&self, hash: &BlockHash) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .by_hash
            .get(hash)
            .map(|&idx| inner.is_canonical(idx))
            .unwrap_or(false)
    }

    /// Canonical successors of `hash`, in height order. Empty when the
    /// hash is unknown or off the canonical chain.
    pub fn enumerate_after(&self, hash: &BlockHash) -> Vec<ChainEntry> {
        let inner = self.inner.read().unwrap();
        let Some(&idx) = inner.by_hash.get(hash) else {
            return Vec::new();
        };
        if !inner.is_canonical(idx) {
            return Vec::new();
        }
        let from = inner.records[idx].height as usize + 1;
        inner.canonical[from..]
            .iter()
            .map(|&i| inner.entry(i))
            .collect()
    }

    /// Highest canonical block referenced by `locator`, falling back to
    /// genesis (every well-formed locator ends there).
    pub fn find_fork(&self, locator: &BlockLocator) -> ChainEntry {
        let inner = self.inner.read().unwrap();
        for hash in &locator.hashes {
            if let Some(&idx) = inner.by_hash.get(hash) {
                if inner.is_canonical(idx) {
                    return inner.entry(idx);
                }
            }
        }
        inner.entry(inner.canonical[0])
    }

    /// Height of the fork point between `locator` and the canonical chain.
    pub fn fork_height(&self, locator: &BlockLocator) -> u32 {
        self.find_fork(locator).height
    }

    /// Exponentially-thinning locator for a known block.
    pub fn locator_of(&self, hash: &BlockHash) -> Option<BlockLocator> {
        let inner = self.inner.read().unwrap();
        let &idx = inner.by_hash.get(hash)?;
        let top_height = inner.records[idx].height;
        let samples = BlockLocator::sample_heights(top_height);

        let hashes = if inner.is_canonical(idx) {
            samples
                .iter()
                .map(|&h| inner.records[inner.canonical[h as usize]].hash)
                .collect()
        } else {
            // Orphaned branch: follow parent links.
            let mut hashes = Vec::with_capacity(samples.len());
            let mut cur = idx;
            for &target in &samples {
                while inner.records[cur].height > target {
                    let prev = inner.records[cur].header.prev_blockhash;
                    match inner.by_hash.get(&prev) {
                        Some(&p) => cur = p,
                        None => return None,
                    }
                }
                hashes.push(inner.records[cur].hash);
            }
            hashes
        };
        Some(BlockLocator::new(hashes))
    }

    /// Locator of the canonical tip.
    pub fn tip_locator(&self) -> BlockLocator {
        let tip = self.tip();
        self.locator_of(&tip.hash).expect("tip is always known")
    }

    /// Connect a batch of headers. Headers extending the tip append to the
    /// canonical chain; a connectable header off the tip re-anchors the
    /// chain at its parent (reorg), atomically rewriting the height table.
    /// Headers with unknown parents stop the batch.
    pub fn extend(&self, headers: &[Header]) -> ExtendOutcome {
        let mut inner = self.inner.write().unwrap();
        let mut accepted = 0;
        let mut reorged = false;

        for header in headers {
            let hash = header.block_hash();
            if inner.by_hash.contains_key(&hash) {
                continue;
            }
            let Some(&parent_idx) = inner.by_hash.get(&header.prev_blockhash) else {
                break;
            };
            let parent_height = inner.records[parent_idx].height;
            let height = parent_height + 1;

            if inner.canonical.len() as u32 != height {
                // Not a tip extension: adopt the branch, drop our suffix.
                if !inner.is_canonical(parent_idx) {
                    break;
                }
                inner.canonical.truncate(height as usize);
                reorged = true;
            } else if !inner.is_canonical(parent_idx) {
                break;
            }

            let idx = inner.records.len();
            inner.records.push(Record {
                hash,
                height,
                header: *header,
            });
            inner.by_hash.insert(hash, idx);
            inner.canonical.push(idx);
            accepted += 1;
        }

        ExtendOutcome { accepted, reorged }
    }
}
