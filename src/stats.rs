//! Swap event counters and the observability snapshot

use core::sync::atomic::{AtomicU64, Ordering};

use crate::gc::{GcState, GcStatsSnapshot};

// ============================================================================
// Counters
// ============================================================================

/// Swap event counters
#[derive(Debug, Default)]
pub struct SwapCounters {
    /// Pages written by swap-out
    pub swap_outs: AtomicU64,
    /// Pages read by swap-in
    pub swap_ins: AtomicU64,
    /// Swap entries released
    pub swap_frees: AtomicU64,
    /// Swap-cache copies dropped
    pub cache_drops: AtomicU64,
    /// Device zone resets
    pub resets: AtomicU64,
    /// Policy picks that were ineligible
    pub policy_misses: AtomicU64,
    /// Allocations that hit zone exhaustion
    pub emergencies: AtomicU64,
    /// Pages written on behalf of applications
    pub host_writes: AtomicU64,
    /// Pages written by GC
    pub gc_writes: AtomicU64,
}

impl SwapCounters {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SwapCountersSnapshot {
        SwapCountersSnapshot {
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            swap_frees: self.swap_frees.load(Ordering::Relaxed),
            cache_drops: self.cache_drops.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            policy_misses: self.policy_misses.load(Ordering::Relaxed),
            emergencies: self.emergencies.load(Ordering::Relaxed),
            host_writes: self.host_writes.load(Ordering::Relaxed),
            gc_writes: self.gc_writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapCountersSnapshot {
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub swap_frees: u64,
    pub cache_drops: u64,
    pub resets: u64,
    pub policy_misses: u64,
    pub emergencies: u64,
    pub host_writes: u64,
    pub gc_writes: u64,
}

impl SwapCountersSnapshot {
    /// Device writes per host write; 1.0 until anything has been written
    pub fn write_amplification(&self) -> f64 {
        if self.host_writes == 0 {
            return 1.0;
        }
        (self.host_writes + self.gc_writes) as f64 / self.host_writes as f64
    }
}

// ============================================================================
// Device Snapshot
// ============================================================================

/// Read-only summary of one swap device
#[derive(Debug, Clone, PartialEq)]
pub struct SwapInfo {
    pub id: u32,
    pub num_zones: u32,
    pub zone_capacity: u32,
    pub total_slots: u64,
    pub free_zones: u32,
    /// Unwritten slots across all usable zones
    pub free_slots: u64,
    pub occupied_slots: u64,
    pub invalid_slots: u64,
    pub cached_slots: u64,
    pub suspended_zones: u32,
    /// Application open-zone limit
    pub stream_slots: u32,
    pub open_zones: u32,
    pub low_wmark: u32,
    pub high_wmark: u32,
    pub gc_running: bool,
    pub gc_state: GcState,
    pub policy: &'static str,
    pub counters: SwapCountersSnapshot,
    pub gc: GcStatsSnapshot,
}

impl SwapInfo {
    pub fn write_amplification(&self) -> f64 {
        self.counters.write_amplification()
    }

    /// Slots holding live data
    pub fn valid_slots(&self) -> u64 {
        self.occupied_slots - self.invalid_slots
    }
}
