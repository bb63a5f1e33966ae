//! Concrete-value caches used as the ground truth for reuse predictions.
//!
//! Every tracked memory or storage access compares the bytes the EVM just
//! produced against the last observed bytes for the same location, then
//! updates the cache. A reduced-graph `reused` verdict without a matching
//! cache hit is an invariant violation upstream.

use alloy_primitives::{Address, B256};
use std::collections::HashMap;

/// Byte-level mirror of observed memory values.
///
/// Cells start unwritten: a first access never counts as cached, even when
/// the observed bytes equal the zero fill.
#[derive(Default)]
pub struct CachedMemory {
    bytes: Vec<u8>,
    seen: Vec<bool>,
}

impl CachedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn resize(&mut self, size: usize) {
        if size > self.bytes.len() {
            self.bytes.resize(size, 0);
            self.seen.resize(size, false);
        }
    }

    fn observe(&mut self, offset: usize, observed: &[u8]) -> bool {
        if observed.is_empty() {
            return true;
        }
        debug_assert!(offset + observed.len() <= self.bytes.len(), "resize precedes access");
        let end = offset + observed.len();
        let cached =
            self.seen[offset..end].iter().all(|&s| s) && self.bytes[offset..end] == *observed;
        self.bytes[offset..end].copy_from_slice(observed);
        self.seen[offset..end].fill(true);
        cached
    }

    /// A read observed `observed` at `offset`; `true` iff the cache
    /// already held exactly those bytes.
    pub fn get(&mut self, offset: usize, observed: &[u8]) -> bool {
        self.observe(offset, observed)
    }

    /// A write stored `observed` at `offset`; `true` iff it rewrote the
    /// bytes already present.
    pub fn set(&mut self, offset: usize, observed: &[u8]) -> bool {
        self.observe(offset, observed)
    }

    pub fn set_byte(&mut self, offset: usize, byte: u8) -> bool {
        self.observe(offset, &[byte])
    }
}

/// Last concrete value observed for each storage cell.
#[derive(Default)]
pub struct CachedStorage {
    cache: HashMap<Address, HashMap<B256, B256>>,
}

impl CachedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A load observed `observed`; `true` iff the cache held the same
    /// value. The cache always adopts the observation.
    pub fn get(&mut self, addr: Address, key: B256, observed: B256) -> bool {
        match self.cache.entry(addr).or_default().insert(key, observed) {
            Some(prev) => prev == observed,
            None => false,
        }
    }

    /// A store wrote `value`; `true` iff it rewrote the cached value.
    pub fn set(&mut self, addr: Address, key: B256, value: B256) -> bool {
        match self.cache.entry(addr).or_default().insert(key, value) {
            Some(prev) => prev == value,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_memory_read_is_never_cached() {
        let mut mem = CachedMemory::new();
        mem.resize(32);
        // Zero observation equals the zero fill, but the cell is unseen.
        assert!(!mem.get(0, &[0u8; 32]));
        assert!(mem.get(0, &[0u8; 32]));
    }

    #[test]
    fn memory_set_then_get_hits() {
        let mut mem = CachedMemory::new();
        mem.resize(64);
        let word = [7u8; 32];
        assert!(!mem.set(0, &word));
        assert!(mem.get(0, &word));
        assert!(mem.set(0, &word));
        // A differing write misses and re-primes the cache.
        let other = [9u8; 32];
        assert!(!mem.set(0, &other));
        assert!(mem.get(0, &other));
    }

    #[test]
    fn partially_seen_ranges_miss() {
        let mut mem = CachedMemory::new();
        mem.resize(64);
        mem.set(0, &[1u8; 16]);
        assert!(!mem.get(0, &{
            let mut w = [0u8; 32];
            w[..16].copy_from_slice(&[1u8; 16]);
            w
        }));
    }

    #[test]
    fn single_byte_writes() {
        let mut mem = CachedMemory::new();
        mem.resize(32);
        assert!(!mem.set_byte(5, 0xff));
        assert!(mem.set_byte(5, 0xff));
        assert!(!mem.set_byte(5, 0x00));
    }

    #[test]
    fn storage_get_set_follow_last_observation() {
        let mut db = CachedStorage::new();
        let addr = Address::with_last_byte(1);
        let key = B256::ZERO;
        let v42 = B256::with_last_byte(42);

        assert!(!db.get(addr, key, v42), "first observation misses");
        assert!(db.get(addr, key, v42));
        assert!(db.set(addr, key, v42), "storing the observed value hits");
        assert!(!db.set(addr, key, B256::with_last_byte(43)));
        assert!(db.set(addr, key, B256::with_last_byte(43)));
    }
}
