//! Zone pool
//!
//! Owns every zone of one swap device together with the pool-wide counters
//! the watermark controller and the policies read: free zones, pages in use,
//! last allocated zone and the set of zones nominated for reclaim.
//!
//! Counter updates happen under the zone's state lock only. Device I/O
//! (resets here, reads and writes in the callers) runs under the zone's
//! append lock, never under the state lock.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{RetryPolicy, ZonedDevice};
use crate::error::{ZnsError, ZnsResult};
use crate::stats::SwapCounters;
use crate::zone::{OpenKind, SlotLocation, SlotState, SwapZone, ZoneCond, ZoneInfo, ZoneState};

/// A live slot found while scanning a victim zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidSlot {
    pub slot: u32,
    pub key: u64,
    pub cached: bool,
}

pub struct ZonePool {
    id: u32,
    zones: Vec<SwapZone>,
    zone_capacity: u32,
    device: Arc<dyn ZonedDevice>,
    retry: RetryPolicy,
    /// Free zones held back from applications for GC destinations
    gc_reserve: u32,
    free_zones: AtomicU32,
    inuse_pages: AtomicU64,
    last_alloced_zone: AtomicU32,
    /// One bit per zone nominated for reclaim
    reclaim_requested: Vec<AtomicU64>,
    pub(crate) counters: SwapCounters,
}

impl ZonePool {
    pub fn new(
        id: u32,
        device: Arc<dyn ZonedDevice>,
        retry: RetryPolicy,
        gc_reserve: u32,
    ) -> Self {
        let geometry = device.geometry();
        let zones = (0..geometry.num_zones)
            .map(|i| SwapZone::new(i, geometry.zone_capacity, id))
            .collect();
        let words = (geometry.num_zones as usize + 63) / 64;

        Self {
            id,
            zones,
            zone_capacity: geometry.zone_capacity,
            device,
            retry,
            gc_reserve,
            free_zones: AtomicU32::new(geometry.num_zones),
            inuse_pages: AtomicU64::new(0),
            last_alloced_zone: AtomicU32::new(0),
            reclaim_requested: (0..words).map(|_| AtomicU64::new(0)).collect(),
            counters: SwapCounters::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn num_zones(&self) -> u32 {
        self.zones.len() as u32
    }

    #[inline]
    pub fn zone_capacity(&self) -> u32 {
        self.zone_capacity
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn ZonedDevice> {
        &self.device
    }

    #[inline]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    #[inline]
    pub fn gc_reserve(&self) -> u32 {
        self.gc_reserve
    }

    pub(crate) fn zone(&self, zone: u32) -> ZnsResult<&SwapZone> {
        self.zones
            .get(zone as usize)
            .ok_or(ZnsError::InvalidZone(zone))
    }

    pub(crate) fn zones(&self) -> &[SwapZone] {
        &self.zones
    }

    // ========================================================================
    // Slot accounting
    // ========================================================================

    /// Account `n` newly written slots in `zone`.
    ///
    /// The slots come back as `Pending`. Exceeding the zone capacity means
    /// the caller's bookkeeping is broken: the zone is quarantined and
    /// `CapacityExceeded` is returned.
    pub fn mark_allocated(&self, zone: u32, n: u32) -> ZnsResult<Range<u32>> {
        let z = self.zone(zone)?;
        let mut st = z.state.lock();

        if st.cond == ZoneCond::Suspended {
            return Err(ZnsError::ZoneSuspended(zone));
        }
        if n > st.room() {
            let err = ZnsError::CapacityExceeded {
                zone,
                occupied: st.occupied,
                requested: n,
                capacity: st.capacity(),
            };
            drop(st);
            crate::kerror!("zns: {}", err);
            self.suspend(zone);
            return Err(err);
        }

        Ok(self.reserve_locked(&mut st, n))
    }

    /// Reserve up to `want` slots of `zone` for an append.
    ///
    /// Returns `None` when the zone has no room or cannot take writes. Used
    /// on the allocation and migration paths, where running out of room is
    /// a normal race rather than an accounting bug.
    pub(crate) fn try_reserve(&self, zone: u32, want: u32) -> ZnsResult<Option<Range<u32>>> {
        let z = self.zone(zone)?;
        let mut st = z.state.lock();

        if st.cond == ZoneCond::Suspended {
            return Err(ZnsError::ZoneSuspended(zone));
        }
        if st.under_gc || st.room() == 0 || want == 0 {
            return Ok(None);
        }

        let n = want.min(st.room());
        Ok(Some(self.reserve_locked(&mut st, n)))
    }

    fn reserve_locked(&self, st: &mut ZoneState, n: u32) -> Range<u32> {
        let start = st.occupied;
        if start == 0 && n > 0 {
            self.free_zones.fetch_sub(1, Ordering::AcqRel);
        }
        st.occupied += n;
        for s in &mut st.slots[start as usize..(start + n) as usize] {
            *s = SlotState::Pending;
        }
        if !st.cond.is_open() {
            st.cond = st.settled_cond();
        }
        self.inuse_pages.fetch_add(n as u64, Ordering::Relaxed);
        start..start + n
    }

    /// Record that a reserved slot now holds the page of `key`
    pub fn commit_slot(&self, loc: SlotLocation, key: u64, cached: bool) -> ZnsResult<()> {
        let z = self.zone(loc.zone)?;
        let mut st = z.state.lock();

        match st.slots.get(loc.slot as usize) {
            Some(SlotState::Pending) => {
                st.slots[loc.slot as usize] = SlotState::Valid { key, cached };
                if cached {
                    st.cached += 1;
                }
                Ok(())
            }
            _ => Err(ZnsError::AddressOverflow {
                field: "slot",
                value: loc.slot as u64,
            }),
        }
    }

    /// Invalidate `slots` of `zone`.
    ///
    /// Slots already invalid are skipped. Once every occupied slot is
    /// invalid the zone is flagged for reclaim, since it can be reset
    /// without migration. Returns how many slots changed state.
    pub fn mark_invalidated(&self, zone: u32, slots: Range<u32>) -> ZnsResult<u32> {
        let z = self.zone(zone)?;
        let mut st = z.state.lock();

        if slots.end > st.occupied {
            return Err(ZnsError::AddressOverflow {
                field: "slot",
                value: slots.end as u64,
            });
        }

        let mut changed = 0;
        for i in slots {
            let slot = st.slots[i as usize];
            match slot {
                SlotState::Valid { cached: true, .. } => st.cached -= 1,
                SlotState::Valid { .. } | SlotState::Pending => {}
                SlotState::Invalid | SlotState::Unwritten => continue,
            }
            st.slots[i as usize] = SlotState::Invalid;
            st.invalid += 1;
            changed += 1;
        }

        self.inuse_pages.fetch_sub(changed as u64, Ordering::Relaxed);
        if changed > 0 && st.is_reset_only() {
            drop(st);
            self.request_reclaim(zone);
        }
        Ok(changed)
    }

    /// Invalidate one slot; `Ok(true)` if the zone became reset-only
    pub fn invalidate_slot(&self, loc: SlotLocation) -> ZnsResult<bool> {
        let end = loc.slot.checked_add(1).ok_or(ZnsError::AddressOverflow {
            field: "slot",
            value: loc.slot as u64,
        })?;
        self.mark_invalidated(loc.zone, loc.slot..end)?;
        let z = self.zone(loc.zone)?;
        let reset_only = z.state.lock().is_reset_only();
        Ok(reset_only)
    }

    /// Set or clear the swap-cache bit of a valid slot
    pub fn set_cached(&self, loc: SlotLocation, cached: bool) -> ZnsResult<bool> {
        let z = self.zone(loc.zone)?;
        let mut st = z.state.lock();

        let prev = match st.slots.get_mut(loc.slot as usize) {
            Some(SlotState::Valid { cached: c, .. }) => core::mem::replace(c, cached),
            _ => return Ok(false),
        };
        match (prev, cached) {
            (false, true) => st.cached += 1,
            (true, false) => st.cached -= 1,
            _ => {}
        }
        Ok(true)
    }

    /// Snapshot up to `limit` valid slots of `zone`, starting at slot `from`.
    ///
    /// Returns the slots and the position to resume from.
    pub(crate) fn collect_valid(
        &self,
        zone: u32,
        from: u32,
        limit: usize,
    ) -> ZnsResult<(Vec<ValidSlot>, u32)> {
        let z = self.zone(zone)?;
        let st = z.state.lock();

        let mut out = Vec::with_capacity(limit.min(st.valid() as usize));
        let mut pos = from;
        while pos < st.occupied && out.len() < limit {
            if let SlotState::Valid { key, cached } = st.slots[pos as usize] {
                out.push(ValidSlot {
                    slot: pos,
                    key,
                    cached,
                });
            }
            pos += 1;
        }
        Ok((out, pos))
    }

    pub fn slot_state(&self, loc: SlotLocation) -> ZnsResult<SlotState> {
        let z = self.zone(loc.zone)?;
        let st = z.state.lock();
        st.slots
            .get(loc.slot as usize)
            .copied()
            .ok_or(ZnsError::AddressOverflow {
                field: "slot",
                value: loc.slot as u64,
            })
    }

    // ========================================================================
    // Reset and quarantine
    // ========================================================================

    /// Reset `zone` on the device and return it to the free set.
    ///
    /// Resetting a zone that is already empty is a no-op. A zone that still
    /// holds valid slots, has writers, is open or is being reclaimed is
    /// refused.
    pub fn reset(&self, zone: u32) -> ZnsResult<()> {
        self.reset_zone(zone, false)
    }

    /// Reset entry used by GC on the victim it has claimed
    pub(crate) fn reset_zone(&self, zone: u32, claimed: bool) -> ZnsResult<()> {
        let z = self.zone(zone)?;
        let _append = z.append.lock();

        {
            let mut st = z.state.lock();
            if st.cond == ZoneCond::Suspended {
                return Err(ZnsError::ZoneSuspended(zone));
            }
            if st.occupied == 0 {
                return Ok(());
            }
            if st.writers > 0 || st.cond.is_open() || (st.under_gc && !claimed) {
                return Err(ZnsError::ZoneBusy(zone));
            }
            if st.valid() > 0 {
                return Err(ZnsError::ZoneHasLiveData(zone));
            }
            // Held until clear(): the zone must not be opened or reserved
            // while the device reset is in flight
            st.under_gc = true;
        }

        if let Err(source) = self
            .retry
            .run("reset", zone, || self.device.reset_zone(zone))
        {
            crate::kerror!("zns: reset of zone {} failed: {}", zone, source);
            self.suspend(zone);
            return Err(ZnsError::Device { zone, source });
        }

        z.state.lock().clear();
        self.clear_reclaim_request(zone);
        self.free_zones.fetch_add(1, Ordering::AcqRel);
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!("zns: zone {} reset, {} free", zone, self.free_zone_count());
        Ok(())
    }

    /// Quarantine `zone`; it is never allocated from or reclaimed again
    pub fn suspend(&self, zone: u32) {
        let Ok(z) = self.zone(zone) else {
            return;
        };
        let mut st = z.state.lock();
        if st.cond == ZoneCond::Suspended {
            return;
        }
        if st.occupied == 0 {
            self.free_zones.fetch_sub(1, Ordering::AcqRel);
        }
        st.cond = ZoneCond::Suspended;
        st.under_gc = false;
        drop(st);

        self.clear_reclaim_request(zone);
        crate::kerror!("zns: zone {} suspended", zone);
    }

    // ========================================================================
    // Pool-wide state
    // ========================================================================

    /// Zones with zero occupancy
    #[inline]
    pub fn free_zone_count(&self) -> u32 {
        self.free_zones.load(Ordering::Acquire)
    }

    #[inline]
    pub fn inuse_pages(&self) -> u64 {
        self.inuse_pages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_alloced_zone(&self) -> u32 {
        self.last_alloced_zone.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_alloced_zone(&self, zone: u32) {
        self.last_alloced_zone.store(zone, Ordering::Relaxed);
    }

    pub fn zone_info(&self, zone: u32) -> ZnsResult<ZoneInfo> {
        let z = self.zone(zone)?;
        Ok(z.info(self.is_reclaim_requested(zone)))
    }

    pub fn zone_infos(&self) -> Vec<ZoneInfo> {
        self.zones
            .iter()
            .map(|z| z.info(self.is_reclaim_requested(z.index())))
            .collect()
    }

    /// Nominate `zone` for reclaim ahead of ratio-based selection
    pub fn request_reclaim(&self, zone: u32) {
        if let Some(word) = self.reclaim_requested.get(zone as usize / 64) {
            word.fetch_or(1 << (zone % 64), Ordering::AcqRel);
        }
    }

    pub fn is_reclaim_requested(&self, zone: u32) -> bool {
        self.reclaim_requested
            .get(zone as usize / 64)
            .map_or(false, |w| w.load(Ordering::Acquire) & (1 << (zone % 64)) != 0)
    }

    fn clear_reclaim_request(&self, zone: u32) {
        if let Some(word) = self.reclaim_requested.get(zone as usize / 64) {
            word.fetch_and(!(1 << (zone % 64)), Ordering::AcqRel);
        }
    }

    /// Reclaimable zone with the fewest live pages, lowest index on ties.
    ///
    /// Only zones holding invalid slots count: reclaiming a fully valid zone
    /// frees nothing.
    pub fn cheapest_reclaim(&self) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for z in &self.zones {
            let st = z.state.lock();
            if st.cond.is_open()
                || st.cond == ZoneCond::Suspended
                || st.under_gc
                || st.writers > 0
                || st.invalid == 0
            {
                continue;
            }
            if best.map_or(true, |(_, valid)| st.valid() < valid) {
                best = Some((z.index(), st.valid()));
            }
        }
        best.map(|(zone, _)| zone)
    }

    /// Zones nominated for reclaim, lowest index first
    pub(crate) fn requested_zones(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (w, word) in self.reclaim_requested.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                out.push(w as u32 * 64 + bit);
                bits &= bits - 1;
            }
        }
        out
    }
}

/// Read-only view of the pool handed to allocation policies.
///
/// Carries a snapshot of the application stream slots taken under the
/// open-zone lock. Policies may look but never touch counters.
pub struct PoolView<'a> {
    pool: &'a ZonePool,
    streams: Vec<Option<u32>>,
    gc_has_room: bool,
}

impl<'a> PoolView<'a> {
    pub(crate) fn new(pool: &'a ZonePool, streams: Vec<Option<u32>>, gc_has_room: bool) -> Self {
        Self {
            pool,
            streams,
            gc_has_room,
        }
    }

    #[inline]
    pub fn num_zones(&self) -> u32 {
        self.pool.num_zones()
    }

    #[inline]
    pub fn zone_capacity(&self) -> u32 {
        self.pool.zone_capacity()
    }

    /// Number of application stream slots
    #[inline]
    pub fn stream_slots(&self) -> u32 {
        self.streams.len() as u32
    }

    /// Zone currently open in stream `slot`
    pub fn stream_zone(&self, slot: u8) -> Option<u32> {
        self.streams.get(slot as usize).copied().flatten()
    }

    /// Stream slot `zone` is open in
    pub fn stream_of(&self, zone: u32) -> Option<u8> {
        self.streams
            .iter()
            .position(|z| *z == Some(zone))
            .map(|s| s as u8)
    }

    pub fn open_zones(&self) -> impl Iterator<Item = u32> + '_ {
        self.streams.iter().filter_map(|z| *z)
    }

    #[inline]
    pub fn last_alloced_zone(&self) -> u32 {
        self.pool.last_alloced_zone()
    }

    #[inline]
    pub fn free_zones(&self) -> u32 {
        self.pool.free_zone_count()
    }

    pub fn zone_info(&self, zone: u32) -> Option<ZoneInfo> {
        self.pool.zone_info(zone).ok()
    }

    /// Free zones that must stay untouched by applications
    pub fn effective_reserve(&self) -> u32 {
        if self.gc_has_room {
            0
        } else {
            self.pool.gc_reserve()
        }
    }

    /// Whether an application write may go to `zone` now
    pub fn is_allocatable(&self, zone: u32) -> bool {
        let Ok(z) = self.pool.zone(zone) else {
            return false;
        };
        let st = z.state.lock();

        if st.under_gc || st.room() == 0 {
            return false;
        }
        match st.cond {
            ZoneCond::Suspended | ZoneCond::Full | ZoneCond::Open(OpenKind::Gc) => false,
            ZoneCond::Open(OpenKind::App) | ZoneCond::Closed => true,
            ZoneCond::Empty => self.free_zones() > self.effective_reserve(),
        }
    }

    /// Lowest-indexed empty zone an application may open
    pub fn first_empty_zone(&self) -> Option<u32> {
        self.next_allocatable(0, |info| info.cond == ZoneCond::Empty)
    }

    /// First allocatable zone at or after `start` (wrapping) matching `pred`
    pub fn next_allocatable<F>(&self, start: u32, pred: F) -> Option<u32>
    where
        F: Fn(&ZoneInfo) -> bool,
    {
        let n = self.num_zones();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&z| {
                self.zone_info(z).map_or(false, |info| pred(&info)) && self.is_allocatable(z)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemZonedDevice, ZoneGeometry, ZoneOp};
    use crate::error::DeviceError;
    use crate::open_zone::OpenZoneManager;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::thread;
    use std::time::Duration;

    fn pool(zones: u32, cap: u32) -> (Arc<MemZonedDevice>, ZonePool) {
        let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(zones, cap, 4)));
        let pool = ZonePool::new(0, dev.clone(), RetryPolicy::new(2, Duration::ZERO), 1);
        (dev, pool)
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    #[test]
    fn test_mark_allocated_updates_counters() {
        let (_, pool) = pool(4, 8);
        assert_eq!(pool.free_zone_count(), 4);

        let range = pool.mark_allocated(1, 3).unwrap();
        assert_eq!(range, 0..3);
        assert_eq!(pool.free_zone_count(), 3);
        assert_eq!(pool.inuse_pages(), 3);

        let range = pool.mark_allocated(1, 2).unwrap();
        assert_eq!(range, 3..5);
        assert_eq!(pool.free_zone_count(), 3);

        let info = pool.zone_info(1).unwrap();
        assert_eq!(info.occupied, 5);
        assert_eq!(info.cond, ZoneCond::Closed);
    }

    #[test]
    fn test_capacity_exceeded_quarantines_zone() {
        let (_, pool) = pool(4, 8);
        pool.mark_allocated(0, 6).unwrap();

        let err = pool.mark_allocated(0, 3).unwrap_err();
        assert_eq!(
            err,
            ZnsError::CapacityExceeded {
                zone: 0,
                occupied: 6,
                requested: 3,
                capacity: 8
            }
        );
        assert_eq!(pool.zone_info(0).unwrap().cond, ZoneCond::Suspended);
        assert_eq!(pool.mark_allocated(0, 1), Err(ZnsError::ZoneSuspended(0)));
    }

    #[test]
    fn test_oversized_allocation_is_rejected() {
        let (_, pool) = pool(4, 8);
        pool.mark_allocated(0, 1).unwrap();

        let err = pool.mark_allocated(0, u32::MAX).unwrap_err();
        assert_eq!(
            err,
            ZnsError::CapacityExceeded {
                zone: 0,
                occupied: 1,
                requested: u32::MAX,
                capacity: 8
            }
        );
    }

    #[test]
    fn test_invalidate_last_slot_index() {
        let (_, pool) = pool(2, 4);
        pool.mark_allocated(0, 2).unwrap();

        let err = pool.invalidate_slot(SlotLocation::new(0, u32::MAX)).unwrap_err();
        assert!(matches!(err, ZnsError::AddressOverflow { field: "slot", .. }));
        assert_eq!(pool.zone_info(0).unwrap().invalid, 0);
    }

    #[test]
    fn test_try_reserve_truncates_to_room() {
        let (_, pool) = pool(2, 4);
        assert_eq!(pool.try_reserve(0, 3).unwrap(), Some(0..3));
        assert_eq!(pool.try_reserve(0, 3).unwrap(), Some(3..4));
        assert_eq!(pool.try_reserve(0, 1).unwrap(), None);
        assert_eq!(pool.zone_info(0).unwrap().cond, ZoneCond::Full);
    }

    #[test]
    fn test_invalidation_flags_reset_only_zone() {
        let (_, pool) = pool(4, 8);
        let range = pool.mark_allocated(2, 3).unwrap();
        for s in range.clone() {
            pool.commit_slot(SlotLocation::new(2, s), 100 + s as u64, false)
                .unwrap();
        }

        assert!(!pool.invalidate_slot(SlotLocation::new(2, 0)).unwrap());
        assert!(!pool.is_reclaim_requested(2));

        assert_eq!(pool.mark_invalidated(2, 1..3).unwrap(), 2);
        assert!(pool.is_reclaim_requested(2));
        assert_eq!(pool.requested_zones(), vec![2]);

        // Already invalid
        assert_eq!(pool.mark_invalidated(2, 0..3).unwrap(), 0);
        assert_eq!(pool.inuse_pages(), 0);
    }

    #[test]
    fn test_cached_never_overlaps_invalid() {
        let (_, pool) = pool(2, 4);
        pool.mark_allocated(0, 2).unwrap();
        pool.commit_slot(SlotLocation::new(0, 0), 1, true).unwrap();
        pool.commit_slot(SlotLocation::new(0, 1), 2, false).unwrap();
        assert!(pool.set_cached(SlotLocation::new(0, 1), true).unwrap());
        assert_eq!(pool.zone_info(0).unwrap().cached, 2);

        pool.invalidate_slot(SlotLocation::new(0, 0)).unwrap();
        let info = pool.zone_info(0).unwrap();
        assert_eq!(info.cached, 1);
        assert_eq!(info.invalid, 1);

        // Invalid slots cannot become cached
        assert!(!pool.set_cached(SlotLocation::new(0, 0), true).unwrap());
        assert_eq!(pool.zone_info(0).unwrap().cached, 1);
    }

    #[test]
    fn test_collect_valid_resumes() {
        let (_, pool) = pool(2, 8);
        pool.mark_allocated(0, 6).unwrap();
        for s in 0..6 {
            pool.commit_slot(SlotLocation::new(0, s), s as u64, false).unwrap();
        }
        pool.mark_invalidated(0, 1..3).unwrap();

        let (first, pos) = pool.collect_valid(0, 0, 2).unwrap();
        assert_eq!(first.iter().map(|v| v.slot).collect::<Vec<_>>(), vec![0, 3]);

        let (rest, pos) = pool.collect_valid(0, pos, 8).unwrap();
        assert_eq!(rest.iter().map(|v| v.slot).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(pos, 6);
    }

    // ========================================================================
    // Reset
    // ========================================================================

    #[test]
    fn test_reset_is_idempotent() {
        let (dev, pool) = pool(3, 4);
        let before = pool.zone_info(1).unwrap();

        pool.reset(1).unwrap();
        pool.reset(1).unwrap();

        assert_eq!(pool.zone_info(1).unwrap(), before);
        assert_eq!(pool.free_zone_count(), 3);
        assert_eq!(dev.counters.resets.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reset_refuses_live_data() {
        let (_, pool) = pool(3, 4);
        pool.mark_allocated(0, 2).unwrap();
        pool.commit_slot(SlotLocation::new(0, 0), 7, false).unwrap();
        pool.commit_slot(SlotLocation::new(0, 1), 8, false).unwrap();
        pool.invalidate_slot(SlotLocation::new(0, 0)).unwrap();

        assert_eq!(pool.reset(0), Err(ZnsError::ZoneHasLiveData(0)));

        pool.invalidate_slot(SlotLocation::new(0, 1)).unwrap();
        pool.reset(0).unwrap();

        let info = pool.zone_info(0).unwrap();
        assert_eq!((info.occupied, info.invalid, info.cached), (0, 0, 0));
        assert_eq!(info.cond, ZoneCond::Empty);
        assert_eq!(info.resets, 1);
        assert!(!info.reclaim_requested);
        assert_eq!(pool.free_zone_count(), 3);
    }

    #[test]
    fn test_reset_refuses_writers() {
        let (_, pool) = pool(2, 4);
        pool.mark_allocated(0, 1).unwrap();
        pool.mark_invalidated(0, 0..1).unwrap();
        pool.zone(0).unwrap().state.lock().writers = 1;

        assert_eq!(pool.reset(0), Err(ZnsError::ZoneBusy(0)));
    }

    #[test]
    fn test_reset_failure_suspends_zone() {
        let (dev, pool) = pool(3, 4);
        pool.mark_allocated(2, 1).unwrap();
        pool.mark_invalidated(2, 0..1).unwrap();
        dev.inject_persistent_fault(ZoneOp::Reset, Some(2));

        assert!(matches!(pool.reset(2), Err(ZnsError::Device { zone: 2, .. })));
        assert_eq!(pool.zone_info(2).unwrap().cond, ZoneCond::Suspended);
        assert_eq!(pool.free_zone_count(), 2);
    }

    /// Device whose resets wait until the test lets them through
    struct GatedReset {
        inner: MemZonedDevice,
        started: Sender<u32>,
        proceed: Receiver<()>,
    }

    impl ZonedDevice for GatedReset {
        fn geometry(&self) -> ZoneGeometry {
            self.inner.geometry()
        }

        fn read(&self, zone: u32, slots: Range<u32>, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read(zone, slots, buf)
        }

        fn write(&self, zone: u32, start: u32, buf: &[u8]) -> Result<(), DeviceError> {
            self.inner.write(zone, start, buf)
        }

        fn reset_zone(&self, zone: u32) -> Result<(), DeviceError> {
            let _ = self.started.send(zone);
            let _ = self.proceed.recv();
            self.inner.reset_zone(zone)
        }
    }

    #[test]
    fn test_zone_cannot_open_during_reset() {
        let (started_tx, started_rx) = bounded(1);
        let (proceed_tx, proceed_rx) = bounded(1);
        let dev = Arc::new(GatedReset {
            inner: MemZonedDevice::new(ZoneGeometry::new(4, 4, 4)),
            started: started_tx,
            proceed: proceed_rx,
        });
        let pool = Arc::new(ZonePool::new(0, dev, RetryPolicy::new(0, Duration::ZERO), 0));
        let open = OpenZoneManager::new(3);

        let range = pool.mark_allocated(0, 2).unwrap();
        pool.mark_invalidated(0, range).unwrap();
        assert_eq!(pool.zone_info(0).unwrap().cond, ZoneCond::Closed);

        let resetter = {
            let pool = pool.clone();
            thread::spawn(move || pool.reset(0))
        };
        assert_eq!(started_rx.recv().unwrap(), 0);

        // Closed with room, but the reset owns it
        assert_eq!(open.acquire_open_zone(&pool, 0, 0).unwrap(), None);
        assert_eq!(pool.try_reserve(0, 1).unwrap(), None);
        assert!(!open.view(&pool).is_allocatable(0));

        proceed_tx.send(()).unwrap();
        resetter.join().unwrap().unwrap();

        let info = pool.zone_info(0).unwrap();
        assert_eq!(info.cond, ZoneCond::Empty);
        assert_eq!(info.writers, 0);
        assert!(!info.under_gc);

        let t = open.acquire_open_zone(&pool, 0, 0).unwrap().unwrap();
        assert_eq!(pool.zone_info(0).unwrap().cond, ZoneCond::Open(OpenKind::App));
        open.release(&pool, t).unwrap();
    }

    #[test]
    fn test_cheapest_reclaim() {
        let (_, pool) = pool(4, 8);
        assert_eq!(pool.cheapest_reclaim(), None);

        pool.mark_allocated(0, 8).unwrap();
        pool.mark_invalidated(0, 0..6).unwrap();
        pool.mark_allocated(1, 2).unwrap();
        pool.mark_invalidated(1, 0..1).unwrap();
        // Fully valid zones are never a target
        pool.mark_allocated(2, 1).unwrap();

        assert_eq!(pool.cheapest_reclaim(), Some(1));
        pool.suspend(1);
        assert_eq!(pool.cheapest_reclaim(), Some(0));
    }

    #[test]
    fn test_suspend_empty_zone_leaves_free_set() {
        let (_, pool) = pool(3, 4);
        pool.suspend(0);
        pool.suspend(0);
        assert_eq!(pool.free_zone_count(), 2);
        assert!(!pool.zone_info(0).unwrap().is_free());
    }

    // ========================================================================
    // Policy view
    // ========================================================================

    #[test]
    fn test_view_honours_gc_reserve() {
        let (_, pool) = pool(2, 4);
        pool.mark_allocated(0, 4).unwrap();

        // One free zone left and it is held back for GC
        let view = PoolView::new(&pool, vec![None, None], false);
        assert!(!view.is_allocatable(0));
        assert!(!view.is_allocatable(1));
        assert_eq!(view.first_empty_zone(), None);

        // Reserve is waived while GC already has a destination with room
        let view = PoolView::new(&pool, vec![None, None], true);
        assert!(view.is_allocatable(1));
        assert_eq!(view.first_empty_zone(), Some(1));
        assert!(!view.is_allocatable(7));
    }

    #[test]
    fn test_view_stream_lookup() {
        let (_, pool) = pool(4, 4);
        let view = PoolView::new(&pool, vec![Some(2), None, Some(0)], false);
        assert_eq!(view.stream_slots(), 3);
        assert_eq!(view.stream_zone(0), Some(2));
        assert_eq!(view.stream_zone(1), None);
        assert_eq!(view.stream_zone(9), None);
        assert_eq!(view.stream_of(0), Some(2));
        assert_eq!(view.open_zones().collect::<Vec<_>>(), vec![2, 0]);
    }
}
