/// Block locators
///
/// A locator is an exponentially-thinning list of ancestor hashes ending at
/// genesis. Comparing a locator against the live chain yields the highest
/// common ancestor in O(log n), which is how checkpoints survive reorgs.

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub hashes: Vec<BlockHash>,
}

impl BlockLocator {
    pub fn new(hashes: Vec<BlockHash>) -> Self {
        Self { hashes }
    }

    /// Locator referencing only one block (used for genesis checkpoints).
    pub fn single(hash: BlockHash) -> Self {
        Self { hashes: vec![hash] }
    }

    /// First (highest) hash in the locator, if any.
    pub fn top(&self) -> Option<BlockHash> {
        self.hashes.first().copied()
    }

    /// Length-prefixed binary form: u32 LE count, then 32 raw bytes per hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.hashes.len() * 32);
        out.extend_from_slice(&(self.hashes.len() as u32).to_le_bytes());
        for h in &self.hashes {
            out.extend_from_slice(h.as_byte_array());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(IndexerError::other("locator truncated: missing count"));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + count * 32 {
            return Err(IndexerError::other(format!(
                "locator truncated: expected {} hashes in {} bytes",
                count,
                bytes.len()
            )));
        }
        let mut hashes = Vec::with_capacity(count);
        for i in 0..count {
            let start = 4 + i * 32;
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&bytes[start..start + 32]);
            hashes.push(BlockHash::from_byte_array(raw));
        }
        Ok(Self { hashes })
    }

    /// Hex form, used when a locator is stored in a blob body.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| IndexerError::other(format!("locator hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// The heights a locator samples relative to its top height: step 1 for
    /// the first 10 entries, doubling afterwards, genesis always last.
    pub fn sample_heights(top: u32) -> Vec<u32> {
        let mut heights = Vec::new();
        let mut height = top as i64;
        let mut step: i64 = 1;
        while height > 0 {
            heights.push(height as u32);
            if heights.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        heights.push(0);
        heights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    #[test]
    fn binary_roundtrip() {
        let loc = BlockLocator::new(vec![hash_of(3), hash_of(2), hash_of(0)]);
        let back = BlockLocator::from_bytes(&loc.to_bytes()).unwrap();
        assert_eq!(back, loc);
    }

    #[test]
    fn hex_roundtrip() {
        let loc = BlockLocator::single(hash_of(9));
        let back = BlockLocator::from_hex(&loc.to_hex()).unwrap();
        assert_eq!(back, loc);
    }

    #[test]
    fn rejects_truncated_input() {
        let loc = BlockLocator::new(vec![hash_of(1), hash_of(0)]);
        let mut bytes = loc.to_bytes();
        bytes.pop();
        assert!(BlockLocator::from_bytes(&bytes).is_err());
    }

    #[test]
    fn sample_heights_thin_exponentially() {
        let heights = BlockLocator::sample_heights(100);
        // dense near the tip
        assert_eq!(&heights[..10], &[100, 99, 98, 97, 96, 95, 94, 93, 92, 91]);
        // thinning after the tenth entry, genesis last
        assert_eq!(*heights.last().unwrap(), 0);
        let mut sorted = heights.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sorted, heights);
    }

    #[test]
    fn sample_heights_of_genesis_only() {
        assert_eq!(BlockLocator::sample_heights(0), vec![0]);
    }
}
