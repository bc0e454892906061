//! Per-zone state
//!
//! Slot lifecycle inside a zone:
//!
//! ```text
//! Unwritten ──reserve──▶ Pending ──commit──▶ Valid ──invalidate──▶ Invalid
//!                           │                                        ▲
//!                           └──────────── write failed ──────────────┘
//! ```
//!
//! `occupied` counts every slot that is no longer `Unwritten`, `invalid`
//! counts `Invalid` slots and `cached` counts `Valid` slots whose page also
//! sits in the swap cache. Invalidation clears the cached bit, so cached and
//! invalid never overlap.

use core::fmt;

/// Who a zone is open for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Application swap-out stream
    App,
    /// GC migration destination
    Gc,
}

/// Zone condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCond {
    /// Nothing written since the last reset
    Empty,
    /// Accepting appends
    Open(OpenKind),
    /// Partially written, not open
    Closed,
    /// Every slot written
    Full,
    /// Quarantined after a permanent failure
    Suspended,
}

impl ZoneCond {
    pub fn is_open(&self) -> bool {
        matches!(self, ZoneCond::Open(_))
    }
}

impl fmt::Display for ZoneCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneCond::Empty => "empty",
            ZoneCond::Open(OpenKind::App) => "open",
            ZoneCond::Open(OpenKind::Gc) => "open-gc",
            ZoneCond::Closed => "closed",
            ZoneCond::Full => "full",
            ZoneCond::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unwritten,
    /// Reserved by a writer, data not yet on the device
    Pending,
    /// Holds the page of swap entry `key`
    Valid { key: u64, cached: bool },
    Invalid,
}

/// Physical location of a swapped page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotLocation {
    pub zone: u32,
    pub slot: u32,
}

impl SlotLocation {
    pub const fn new(zone: u32, slot: u32) -> Self {
        Self { zone, slot }
    }
}

impl fmt::Display for SlotLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.slot)
    }
}

/// Mutable zone state, guarded by the zone's state lock
#[derive(Debug)]
pub struct ZoneState {
    pub cond: ZoneCond,
    /// Claimed as a GC victim or being reset
    pub under_gc: bool,
    pub occupied: u32,
    pub invalid: u32,
    pub cached: u32,
    /// Outstanding allocation references
    pub writers: u32,
    pub slots: Vec<SlotState>,
    /// Swap device the zone belongs to
    pub owner: u32,
    pub resets: u64,
}

impl ZoneState {
    fn new(capacity: u32, owner: u32) -> Self {
        Self {
            cond: ZoneCond::Empty,
            under_gc: false,
            occupied: 0,
            invalid: 0,
            cached: 0,
            writers: 0,
            slots: vec![SlotState::Unwritten; capacity as usize],
            owner,
            resets: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slots still holding (or about to hold) live data
    #[inline]
    pub fn valid(&self) -> u32 {
        self.occupied - self.invalid
    }

    /// Unreserved slots left
    #[inline]
    pub fn room(&self) -> u32 {
        self.capacity() - self.occupied
    }

    /// Everything written has been invalidated; reclaim needs no migration
    #[inline]
    pub fn is_reset_only(&self) -> bool {
        self.occupied > 0 && self.invalid == self.occupied
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.occupied == 0 && self.cond != ZoneCond::Suspended
    }

    /// Condition a zone settles in once it is no longer open
    pub fn settled_cond(&self) -> ZoneCond {
        if self.cond == ZoneCond::Suspended {
            ZoneCond::Suspended
        } else if self.occupied == 0 {
            ZoneCond::Empty
        } else if self.room() == 0 {
            ZoneCond::Full
        } else {
            ZoneCond::Closed
        }
    }

    /// Drop all slot state after a device reset
    pub fn clear(&mut self) {
        self.occupied = 0;
        self.invalid = 0;
        self.cached = 0;
        self.under_gc = false;
        self.slots.fill(SlotState::Unwritten);
        self.cond = ZoneCond::Empty;
        self.resets += 1;
    }
}

/// A zone of the swap device
pub struct SwapZone {
    index: u32,
    /// Counters and slot table; held for bookkeeping only, never across I/O
    pub(crate) state: spin::Mutex<ZoneState>,
    /// Serializes reserve-write-commit sequences and resets, which must hit
    /// the device in write-pointer order
    pub(crate) append: parking_lot::Mutex<()>,
}

impl SwapZone {
    pub fn new(index: u32, capacity: u32, owner: u32) -> Self {
        Self {
            index,
            state: spin::Mutex::new(ZoneState::new(capacity, owner)),
            append: parking_lot::Mutex::new(()),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn info(&self, reclaim_requested: bool) -> ZoneInfo {
        let st = self.state.lock();
        ZoneInfo {
            index: self.index,
            cond: st.cond,
            capacity: st.capacity(),
            occupied: st.occupied,
            invalid: st.invalid,
            cached: st.cached,
            writers: st.writers,
            under_gc: st.under_gc,
            owner: st.owner,
            resets: st.resets,
            reclaim_requested,
        }
    }
}

/// Read-only zone snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub index: u32,
    pub cond: ZoneCond,
    pub capacity: u32,
    pub occupied: u32,
    pub invalid: u32,
    pub cached: u32,
    pub writers: u32,
    pub under_gc: bool,
    pub owner: u32,
    pub resets: u64,
    pub reclaim_requested: bool,
}

impl ZoneInfo {
    pub fn valid(&self) -> u32 {
        self.occupied - self.invalid
    }

    pub fn is_free(&self) -> bool {
        self.occupied == 0 && self.cond != ZoneCond::Suspended
    }
}
