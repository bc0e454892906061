//! ZNS swap device
//!
//! Ties the zone pool, open-zone manager, allocation policy, watermark
//! controller and GC worker of one zoned device into the swap-out, swap-in
//! and free paths.
//!
//! ```text
//! swap_out:  policy ─▶ acquire_open_zone ─▶ append ─▶ commit ─▶ map ─▶ release
//!               │ no zone
//!               ▼
//!          emergency ─▶ wake GC ─▶ wait (bounded) ─▶ retry | OutOfSwapZones
//! ```

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::addr::SwapPolVal;
use crate::config::ZnsSwapConfig;
use crate::device::ZonedDevice;
use crate::error::{DeviceError, ZnsError, ZnsResult};
use crate::gc::{self, GarbageCollector};
use crate::logger;
use crate::map::{AddressMap, MemAddressMap};
use crate::open_zone::{OpenTicket, OpenZoneManager};
use crate::policy::{AllocPolicy, PolicyDispatch, SwapPolicyHints};
use crate::pool::ZonePool;
use crate::stats::{SwapCounters, SwapInfo};
use crate::watermark::{GcWake, WatermarkController};
use crate::zone::{SlotLocation, ZoneCond, ZoneInfo};
use crate::PAGE_SIZE;

/// Where a swapped-out page went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    /// Packed policy address of the allocation
    pub entry: u64,
    pub location: SlotLocation,
}

impl SwapSlot {
    pub fn policy_value(&self) -> Option<SwapPolVal> {
        SwapPolVal::unpack(self.entry).ok().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    /// GC hit a permanent error on `zone` and stopped
    Failed { zone: u32 },
}

pub struct ZnsSwapDevice {
    id: u32,
    config: ZnsSwapConfig,
    pool: Arc<ZonePool>,
    open: Arc<OpenZoneManager>,
    map: Arc<dyn AddressMap>,
    watermark: Arc<WatermarkController>,
    gc: Arc<GarbageCollector>,
    policy: PolicyDispatch,
    worker: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl ZnsSwapDevice {
    /// Bring up swap on `device` with an in-memory entry map and start its
    /// GC thread
    pub fn activate(
        id: u32,
        device: Arc<dyn ZonedDevice>,
        config: ZnsSwapConfig,
    ) -> ZnsResult<Self> {
        Self::activate_with_map(id, device, Arc::new(MemAddressMap::new()), config)
    }

    /// Same as `activate`, with the entry map owned by the caller
    pub fn activate_with_map(
        id: u32,
        device: Arc<dyn ZonedDevice>,
        map: Arc<dyn AddressMap>,
        config: ZnsSwapConfig,
    ) -> ZnsResult<Self> {
        let geometry = device.geometry();
        config.validate_for(&geometry)?;
        logger::init(config.log_level().unwrap_or_else(logger::max_level));

        let max_open = config.effective_max_open(&geometry);
        let pool = Arc::new(ZonePool::new(
            id,
            device,
            config.retry_policy(),
            config.gc_reserve_zones,
        ));
        let open = Arc::new(OpenZoneManager::new(max_open));
        let watermark = Arc::new(WatermarkController::new(config.low_wmark, config.high_wmark));
        let gc = Arc::new(GarbageCollector::new(
            pool.clone(),
            open.clone(),
            map.clone(),
            watermark.clone(),
            config.gc_batch_pages,
        ));

        let worker = {
            let gc = gc.clone();
            let idle_poll = Duration::from_millis(config.gc_idle_poll_ms);
            thread::Builder::new()
                .name(format!("kznsd/{}", id))
                .spawn(move || gc::worker_loop(gc, idle_poll))
                .map_err(|e| {
                    crate::kerror!("zns: cannot start GC thread for device {}: {}", id, e);
                    ZnsError::Device {
                        zone: 0,
                        source: DeviceError::Offline,
                    }
                })?
        };

        crate::kinfo!(
            "zns: swap device {} active: {} zones x {} slots, {} open, policy {}",
            id,
            geometry.num_zones,
            geometry.zone_capacity,
            max_open,
            config.policy.as_str()
        );

        Ok(Self {
            id,
            policy: PolicyDispatch::new(config.policy),
            config,
            pool,
            open,
            map,
            watermark,
            gc,
            worker: Mutex::new(Some(worker)),
            active: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &ZnsSwapConfig {
        &self.config
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> ZnsResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ZnsError::Inactive)
        }
    }

    // ========================================================================
    // Swap-out
    // ========================================================================

    /// Write one page for `key` and map `key` to it.
    ///
    /// A previous mapping of `key` is invalidated. When no zone can take the
    /// write the call wakes GC and waits up to `emergency_wait_ms` for a
    /// zone to be freed before failing with `OutOfSwapZones`.
    pub fn swap_out(
        &self,
        key: u64,
        hints: &SwapPolicyHints,
        page: &[u8],
    ) -> ZnsResult<SwapSlot> {
        self.ensure_active()?;
        if page.len() != PAGE_SIZE {
            return Err(ZnsError::AddressOverflow {
                field: "page",
                value: page.len() as u64,
            });
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.emergency_wait_ms);
        let mut stalled = false;

        loop {
            self.ensure_active()?;

            let view = self.open.view(&self.pool);
            let selection = match self.policy.select(key, hints, &view) {
                Ok(selection) => selection,
                Err(ZnsError::OutOfSwapZones) => {
                    drop(view);
                    if !stalled {
                        stalled = true;
                        SwapCounters::inc(&self.pool.counters.emergencies);
                    }
                    self.wait_for_zone(deadline)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            drop(view);

            if selection.missed {
                SwapCounters::inc(&self.pool.counters.policy_misses);
            }

            let Some(ticket) =
                self.open
                    .acquire_open_zone(&self.pool, selection.zone, selection.slot)?
            else {
                // Lost a race for the zone or every stream is pinned
                if Instant::now() >= deadline {
                    return Err(ZnsError::OutOfSwapZones);
                }
                thread::yield_now();
                continue;
            };

            let entry = match SwapPolVal::new(
                hints.vma_id as u64,
                ticket.slot as u64,
                ticket.zone as u64,
            ) {
                Ok(val) => val.with_sequential(hints.sequential).pack(),
                Err(e) => {
                    self.release(ticket);
                    return Err(e);
                }
            };

            let appended = self.append_page(&ticket, key, page);
            let slot = match appended {
                Ok(Some(location)) => {
                    if let Some(old) = self.map.insert(key, location) {
                        self.drop_slot(old);
                    }
                    Some(SwapSlot { entry, location })
                }
                Ok(None) => None,
                Err(e) => {
                    self.release(ticket);
                    return Err(e);
                }
            };
            self.release(ticket);

            if let Some(slot) = slot {
                self.pool.set_last_alloced_zone(slot.location.zone);
                SwapCounters::inc(&self.pool.counters.swap_outs);
                SwapCounters::inc(&self.pool.counters.host_writes);
                self.watermark.observe(self.pool.free_zone_count());
                return Ok(slot);
            }
            thread::yield_now();
        }
    }

    /// Append `page` to the ticket's zone; `None` if the zone filled up or
    /// was suspended since it was picked
    fn append_page(
        &self,
        ticket: &OpenTicket,
        key: u64,
        page: &[u8],
    ) -> ZnsResult<Option<SlotLocation>> {
        let zone = ticket.zone;
        let z = self.pool.zone(zone)?;
        let _append = z.append.lock();

        let range = match self.pool.try_reserve(zone, 1) {
            Ok(Some(range)) => range,
            Ok(None) | Err(ZnsError::ZoneSuspended(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let location = SlotLocation::new(zone, range.start);

        let device = self.pool.device();
        if let Err(source) = self
            .pool
            .retry()
            .run("swap-out write", zone, || device.write(zone, location.slot, page))
        {
            // Write pointer is unknown now
            if let Err(e) = self.pool.mark_invalidated(zone, range) {
                crate::kerror!("zns: invalidate of zone {} failed: {}", zone, e);
            }
            self.pool.suspend(zone);
            crate::kerror!("zns: swap-out to zone {} failed: {}", zone, source);
            return Err(ZnsError::Device { zone, source });
        }

        self.pool.commit_slot(location, key, false)?;
        Ok(Some(location))
    }

    fn release(&self, ticket: OpenTicket) {
        let zone = ticket.zone;
        if let Err(e) = self.open.release(&self.pool, ticket) {
            crate::kerror!("zns: release of zone {} failed: {}", zone, e);
        }
    }

    fn wait_for_zone(&self, deadline: Instant) -> ZnsResult<()> {
        self.watermark.enter_emergency(self.pool.cheapest_reclaim());

        let now = Instant::now();
        let freed = now < deadline
            && self
                .watermark
                .wait_for_free_zone(deadline - now, || self.has_allocatable_zone());
        if freed {
            return Ok(());
        }

        crate::kwarn!(
            "zns: device {} out of swap zones after {} ms",
            self.id,
            self.config.emergency_wait_ms
        );
        Err(ZnsError::OutOfSwapZones)
    }

    fn has_allocatable_zone(&self) -> bool {
        !self.is_active()
            || self
                .open
                .view(&self.pool)
                .next_allocatable(0, |_| true)
                .is_some()
    }

    // ========================================================================
    // Swap-in, free and cache state
    // ========================================================================

    /// Read the page of `key` into `buf`.
    ///
    /// With `keep_cached` the page stays in the swap cache and its slot is
    /// marked cached. Returns the slot that was read.
    pub fn swap_in(&self, key: u64, buf: &mut [u8], keep_cached: bool) -> ZnsResult<SlotLocation> {
        self.ensure_active()?;
        if buf.len() != PAGE_SIZE {
            return Err(ZnsError::AddressOverflow {
                field: "page",
                value: buf.len() as u64,
            });
        }

        let device = self.pool.device();
        let location = loop {
            let loc = self.map.lookup(key).ok_or(ZnsError::NotMapped(key))?;
            let read = self.pool.retry().run("swap-in read", loc.zone, || {
                device.read(loc.zone, loc.slot..loc.slot + 1, &mut *buf)
            });

            // GC may have moved the page and reset the zone under the read
            if self.map.lookup(key) != Some(loc) {
                continue;
            }
            read.map_err(|source| ZnsError::Device {
                zone: loc.zone,
                source,
            })?;
            break loc;
        };

        if keep_cached {
            self.set_entry_cached(key, true)?;
        }
        SwapCounters::inc(&self.pool.counters.swap_ins);
        Ok(location)
    }

    /// Release the swap entry of `key`
    pub fn swap_free(&self, key: u64) -> ZnsResult<()> {
        self.ensure_active()?;
        let loc = self.map.remove(key).ok_or(ZnsError::NotMapped(key))?;
        self.drop_slot(loc);
        SwapCounters::inc(&self.pool.counters.swap_frees);
        Ok(())
    }

    /// The swap cache dropped its copy of `key`
    pub fn cache_dropped(&self, key: u64) -> ZnsResult<()> {
        self.ensure_active()?;
        self.set_entry_cached(key, false)?;
        SwapCounters::inc(&self.pool.counters.cache_drops);
        Ok(())
    }

    pub fn lookup(&self, key: u64) -> Option<SlotLocation> {
        self.map.lookup(key)
    }

    fn set_entry_cached(&self, key: u64, cached: bool) -> ZnsResult<()> {
        loop {
            let loc = self.map.lookup(key).ok_or(ZnsError::NotMapped(key))?;
            self.pool.set_cached(loc, cached)?;
            if self.map.lookup(key) == Some(loc) {
                return Ok(());
            }
        }
    }

    /// Invalidate a slot nothing maps to any more
    fn drop_slot(&self, loc: SlotLocation) {
        let reset_only = match self.pool.invalidate_slot(loc) {
            Ok(reset_only) => reset_only,
            Err(e) => {
                crate::kerror!("zns: invalidate {} failed: {}", loc, e);
                return;
            }
        };
        if !reset_only || !self.config.eager_reset || self.open.is_open(loc.zone) {
            return;
        }

        match self.pool.reset(loc.zone) {
            Ok(()) => self.watermark.notify_zone_freed(),
            // Claimed by GC or reopened meanwhile; GC gets it later
            Err(ZnsError::ZoneBusy(_)) => {}
            Err(e) => crate::kwarn!("zns: eager reset of zone {} failed: {}", loc.zone, e),
        }
    }

    // ========================================================================
    // Reclaim control
    // ========================================================================

    /// Nominate `zone` for reclaim and wake GC
    pub fn request_reclaim(&self, zone: u32) -> ZnsResult<()> {
        self.ensure_active()?;
        if zone >= self.pool.num_zones() {
            return Err(ZnsError::InvalidZone(zone));
        }
        self.pool.request_reclaim(zone);
        self.watermark.wake(GcWake::Reclaim);
        Ok(())
    }

    /// Run one GC cycle on the calling thread; returns the zones reclaimed
    pub fn trigger_gc(&self) -> ZnsResult<u32> {
        self.ensure_active()?;
        if let Some(zone) = self.gc.failed_zone() {
            return Err(ZnsError::ZoneSuspended(zone));
        }
        Ok(self.gc.run_cycle(true))
    }

    pub fn set_policy(&self, kind: AllocPolicy) {
        self.policy.set_policy(kind);
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy.kind()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn zone_info(&self, zone: u32) -> ZnsResult<ZoneInfo> {
        self.pool.zone_info(zone)
    }

    pub fn zone_infos(&self) -> Vec<ZoneInfo> {
        self.pool.zone_infos()
    }

    pub fn swap_info(&self) -> SwapInfo {
        let zones = self.pool.zone_infos();
        let mut info = SwapInfo {
            id: self.id,
            num_zones: self.pool.num_zones(),
            zone_capacity: self.pool.zone_capacity(),
            total_slots: self.pool.num_zones() as u64 * self.pool.zone_capacity() as u64,
            free_zones: self.pool.free_zone_count(),
            free_slots: 0,
            occupied_slots: 0,
            invalid_slots: 0,
            cached_slots: 0,
            suspended_zones: 0,
            stream_slots: self.open.app_limit(),
            open_zones: self.open.open_app_zones(),
            low_wmark: self.watermark.low(),
            high_wmark: self.watermark.high(),
            gc_running: self.watermark.gc_running(),
            gc_state: self.gc.state(),
            policy: self.policy.name(),
            counters: self.pool.counters.snapshot(),
            gc: self.gc.stats.snapshot(),
        };

        for z in &zones {
            if z.cond == ZoneCond::Suspended {
                info.suspended_zones += 1;
            } else {
                info.free_slots += (z.capacity - z.occupied) as u64;
            }
            info.occupied_slots += z.occupied as u64;
            info.invalid_slots += z.invalid as u64;
            info.cached_slots += z.cached as u64;
        }
        info
    }

    pub fn health(&self) -> DeviceHealth {
        match self.gc.failed_zone() {
            Some(zone) => DeviceHealth::Failed { zone },
            None => DeviceHealth::Healthy,
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop GC, close open zones and refuse further requests.
    ///
    /// Calling it again is a no-op.
    pub fn deactivate(&self) -> ZnsResult<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.gc.request_stop();
        self.watermark.wake(GcWake::Shutdown);
        // Unblock allocations parked on exhaustion
        self.watermark.notify_zone_freed();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                crate::kerror!("zns: GC thread of device {} panicked", self.id);
            }
        }
        self.open.close_all(&self.pool);

        let counters = self.pool.counters.snapshot();
        crate::kinfo!(
            "zns: swap device {} deactivated: {} out, {} in, {} resets, WA {:.2}",
            self.id,
            counters.swap_outs,
            counters.swap_ins,
            counters.resets,
            counters.write_amplification()
        );
        Ok(())
    }
}

impl Drop for ZnsSwapDevice {
    fn drop(&mut self) {
        let _ = self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemZonedDevice, ZoneGeometry, ZoneOp};

    fn config() -> ZnsSwapConfig {
        ZnsSwapConfig {
            low_wmark: 1,
            high_wmark: 2,
            gc_reserve_zones: 0,
            gc_io_retries: 1,
            gc_io_backoff_ms: 0,
            emergency_wait_ms: 20,
            gc_idle_poll_ms: 10,
            ..ZnsSwapConfig::default()
        }
    }

    fn device(zones: u32, cap: u32) -> (Arc<MemZonedDevice>, ZnsSwapDevice) {
        let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(zones, cap, 3)));
        let swap = ZnsSwapDevice::activate(0, dev.clone(), config()).unwrap();
        (dev, swap)
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn test_swap_out_then_in() {
        let (_, swap) = device(4, 8);
        let hints = SwapPolicyHints {
            vma_id: 9,
            ..Default::default()
        };

        let slot = swap.swap_out(1, &hints, &page(0xAB)).unwrap();
        assert_eq!(swap.lookup(1), Some(slot.location));

        let val = slot.policy_value().unwrap();
        assert_eq!(val.zone() as u32, slot.location.zone);
        assert_eq!(val.vma(), 9);

        let mut buf = page(0);
        assert_eq!(swap.swap_in(1, &mut buf, false).unwrap(), slot.location);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_rewrite_invalidates_old_slot() {
        let (_, swap) = device(4, 8);
        let hints = SwapPolicyHints::default();

        let first = swap.swap_out(5, &hints, &page(1)).unwrap();
        let second = swap.swap_out(5, &hints, &page(2)).unwrap();
        assert_ne!(first.location, second.location);

        let info = swap.zone_info(first.location.zone).unwrap();
        assert_eq!(info.invalid, 1);
        assert_eq!(swap.swap_info().valid_slots(), 1);
    }

    #[test]
    fn test_cache_bit_follows_swap_in_and_drop() {
        let (_, swap) = device(4, 8);
        let slot = swap
            .swap_out(3, &SwapPolicyHints::default(), &page(3))
            .unwrap();

        let mut buf = page(0);
        swap.swap_in(3, &mut buf, true).unwrap();
        assert_eq!(swap.zone_info(slot.location.zone).unwrap().cached, 1);

        swap.cache_dropped(3).unwrap();
        assert_eq!(swap.zone_info(slot.location.zone).unwrap().cached, 0);
        assert_eq!(swap.swap_info().counters.cache_drops, 1);
    }

    #[test]
    fn test_free_unknown_entry() {
        let (_, swap) = device(4, 8);
        assert_eq!(swap.swap_free(42), Err(ZnsError::NotMapped(42)));
        let mut buf = page(0);
        assert_eq!(swap.swap_in(42, &mut buf, false), Err(ZnsError::NotMapped(42)));
    }

    #[test]
    fn test_write_failure_suspends_zone() {
        let (dev, swap) = device(4, 8);
        // First attempt and its one retry
        dev.inject_fault(ZoneOp::Write, None, 2);

        let err = swap
            .swap_out(1, &SwapPolicyHints::default(), &page(1))
            .unwrap_err();
        let ZnsError::Device { zone: bad, .. } = err else {
            panic!("unexpected error {:?}", err);
        };
        let info = swap.zone_info(bad).unwrap();
        assert_eq!(info.cond, ZoneCond::Suspended);
        // The reserved slot was given back as invalid
        assert_eq!((info.occupied, info.invalid), (1, 1));
        assert_eq!(swap.lookup(1), None);

        // Later allocations avoid the suspended zone
        let slot = swap
            .swap_out(2, &SwapPolicyHints::default(), &page(2))
            .unwrap();
        assert_ne!(slot.location.zone, bad);
        assert_eq!(swap.swap_info().suspended_zones, 1);
    }

    #[test]
    fn test_eager_reset_on_free() {
        let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(4, 2, 3)));
        let swap = ZnsSwapDevice::activate(
            0,
            dev,
            ZnsSwapConfig {
                eager_reset: true,
                gc_idle_poll_ms: 60_000,
                ..config()
            },
        )
        .unwrap();
        let hints = SwapPolicyHints::default();

        // Fill zone 0 so it closes as full, then move on to zone 1
        swap.swap_out(1, &hints, &page(1)).unwrap();
        swap.swap_out(2, &hints, &page(2)).unwrap();
        swap.swap_out(3, &hints, &page(3)).unwrap();
        assert_eq!(swap.zone_info(0).unwrap().cond, ZoneCond::Full);

        swap.swap_free(1).unwrap();
        swap.swap_free(2).unwrap();
        let info = swap.zone_info(0).unwrap();
        assert!(info.is_free());
        assert_eq!(info.resets, 1);
    }

    #[test]
    fn test_deactivate_refuses_requests() {
        let (_, swap) = device(4, 8);
        swap.swap_out(1, &SwapPolicyHints::default(), &page(1))
            .unwrap();

        swap.deactivate().unwrap();
        swap.deactivate().unwrap();
        assert!(!swap.is_active());
        assert_eq!(swap.open.open_app_zones(), 0);
        assert_eq!(
            swap.swap_out(2, &SwapPolicyHints::default(), &page(2)),
            Err(ZnsError::Inactive)
        );
        assert_eq!(swap.trigger_gc(), Err(ZnsError::Inactive));
    }

    #[test]
    fn test_activate_rejects_bad_geometry() {
        let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(1, 8, 3)));
        assert!(matches!(
            ZnsSwapDevice::activate(0, dev, config()),
            Err(ZnsError::Config(_))
        ));
    }
}
