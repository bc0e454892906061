//! Swap entry to slot mapping
//!
//! The generic swap layer owns the mapping from a logical swap entry to the
//! slot that holds its page. The backend only needs lookup, insert, removal
//! and a compare-and-swap remap for migration, so that is the whole trait.

use dashmap::DashMap;

use crate::zone::SlotLocation;

/// Logical swap entry to physical slot mapping
pub trait AddressMap: Send + Sync {
    fn lookup(&self, key: u64) -> Option<SlotLocation>;

    /// Map `key` to `loc`, returning the location it replaced
    fn insert(&self, key: u64, loc: SlotLocation) -> Option<SlotLocation>;

    /// Move `key` from `from` to `to` only if it still maps to `from`.
    ///
    /// Returns `false` when the entry was freed or rewritten meanwhile; the
    /// caller then owns `to` and must invalidate it.
    fn remap(&self, key: u64, from: SlotLocation, to: SlotLocation) -> bool;

    fn remove(&self, key: u64) -> Option<SlotLocation>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concurrent in-memory mapping
#[derive(Debug, Default)]
pub struct MemAddressMap {
    entries: DashMap<u64, SlotLocation>,
}

impl MemAddressMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressMap for MemAddressMap {
    fn lookup(&self, key: u64) -> Option<SlotLocation> {
        self.entries.get(&key).map(|e| *e.value())
    }

    fn insert(&self, key: u64, loc: SlotLocation) -> Option<SlotLocation> {
        self.entries.insert(key, loc)
    }

    fn remap(&self, key: u64, from: SlotLocation, to: SlotLocation) -> bool {
        match self.entries.get_mut(&key) {
            Some(mut entry) if *entry == from => {
                *entry = to;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, key: u64) -> Option<SlotLocation> {
        self.entries.remove(&key).map(|(_, loc)| loc)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
