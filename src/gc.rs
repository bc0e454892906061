//! Zone garbage collector
//!
//! Reclaims zones by moving their still-valid pages into a GC destination
//! zone and resetting them.
//!
//! ```text
//!          select_victim
//!               │
//!     reset-only? ──yes──────────────────────────┐
//!               │ no                             │
//!               ▼                                ▼
//!  ┌──▶ IDLE ─▶ READING ─▶ WRITING ─┐        reset(victim)
//!  │     (batch ≤ gc_batch_pages)   │            │
//!  └────────── more valid slots ◀───┘            ▼
//!                     │ drained               IDLE
//!                     └───────────────▶ reset(victim)
//! ```
//!
//! A batch is read into the reclaim buffer, appended to the destination in
//! one write, committed, and only then remapped. The source slot of a moved
//! page is invalidated after its mapping points at the destination, so the
//! victim reset can never strand a reader on a stale address.
//!
//! I/O errors are retried with the device retry policy. When the budget is
//! spent the zone is suspended and the collector halts until the device is
//! deactivated.

use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{DeviceError, ZnsError, ZnsResult};
use crate::map::AddressMap;
use crate::open_zone::OpenZoneManager;
use crate::pool::{ValidSlot, ZonePool};
use crate::watermark::{GcWake, WatermarkController};
use crate::zone::{SlotLocation, SlotState, ZoneCond};
use crate::PAGE_SIZE;

const NO_ZONE: u32 = u32::MAX;

// ============================================================================
// Reclaim State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcState {
    #[default]
    Idle,
    Reading,
    Writing,
}

impl GcState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => GcState::Reading,
            2 => GcState::Writing,
            _ => GcState::Idle,
        }
    }
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcState::Idle => "idle",
            GcState::Reading => "reading",
            GcState::Writing => "writing",
        })
    }
}

/// One page of the current batch
#[derive(Debug, Clone, Copy)]
struct MoveEntry {
    src: u32,
    key: u64,
}

/// Migration session for one victim zone.
///
/// Owned by the GC worker; nothing else sees the buffer.
pub struct ReclaimCtx {
    from_zone: u32,
    state: GcState,
    buffer: Vec<u8>,
    /// Bounded to the buffer size in pages
    moves: Vec<MoveEntry>,
    capacity: usize,
    finished_read: u32,
    finished_write: u32,
    /// Pages in the current batch
    num_pages: u32,
    /// Scan position in the victim
    last_pos: u32,
    /// Pages moved out of the victim so far
    moved: u32,
}

impl ReclaimCtx {
    pub fn new(from_zone: u32, batch_pages: u32) -> Self {
        let capacity = batch_pages.max(1) as usize;
        Self {
            from_zone,
            state: GcState::Idle,
            buffer: vec![0u8; capacity * PAGE_SIZE],
            moves: Vec::with_capacity(capacity),
            capacity,
            finished_read: 0,
            finished_write: 0,
            num_pages: 0,
            last_pos: 0,
            moved: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> GcState {
        self.state
    }

    fn begin_batch(&mut self, slots: &[ValidSlot]) {
        debug_assert!(slots.len() <= self.capacity);
        self.moves.clear();
        self.moves.extend(
            slots
                .iter()
                .take(self.capacity)
                .map(|s| MoveEntry {
                    src: s.slot,
                    key: s.key,
                }),
        );
        self.num_pages = self.moves.len() as u32;
        self.finished_read = 0;
        self.finished_write = 0;
        self.state = GcState::Reading;
    }

    /// Runs of consecutive source slots, as (buffer index, slot range)
    fn read_runs(&self) -> Vec<(usize, Range<u32>)> {
        let mut runs: Vec<(usize, Range<u32>)> = Vec::new();
        for (i, m) in self.moves.iter().enumerate() {
            match runs.last_mut() {
                Some((_, r)) if r.end == m.src => r.end += 1,
                _ => runs.push((i, m.src..m.src + 1)),
            }
        }
        runs
    }

    fn batch_bytes(&self) -> usize {
        self.num_pages as usize * PAGE_SIZE
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct GcStats {
    /// GC cycles started
    pub cycles: AtomicU64,
    /// Zones reset without migration
    pub reset_only: AtomicU64,
    /// Zones drained by migration and reset
    pub migrated: AtomicU64,
    pub batches: AtomicU64,
    pub pages_moved: AtomicU64,
    /// Pages freed or rewritten while in flight
    pub stale: AtomicU64,
    /// Victims put back for lack of a destination
    pub deferred: AtomicU64,
    pub failures: AtomicU64,
}

impl GcStats {
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            reset_only: self.reset_only.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            pages_moved: self.pages_moved.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    pub cycles: u64,
    pub reset_only: u64,
    pub migrated: u64,
    pub batches: u64,
    pub pages_moved: u64,
    pub stale: u64,
    pub deferred: u64,
    pub failures: u64,
}

// ============================================================================
// Garbage Collector
// ============================================================================

/// Chosen victim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub zone: u32,
    pub reset_only: bool,
}

/// Result of one reclaim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Zone drained and reset
    Reset { zone: u32, moved: u32 },
    /// Nothing reclaimable
    NoVictim,
    /// Victim released untouched or partially drained
    Deferred { zone: u32 },
}

pub struct GarbageCollector {
    pool: Arc<ZonePool>,
    open: Arc<OpenZoneManager>,
    map: Arc<dyn AddressMap>,
    watermark: Arc<WatermarkController>,
    batch_pages: u32,
    state: AtomicU8,
    /// Zone that halted GC, `NO_ZONE` while healthy
    failed_zone: AtomicU32,
    shutdown: AtomicBool,
    /// Held for a whole cycle; the worker and `trigger_gc` never overlap
    cycle: Mutex<()>,
    pub stats: GcStats,
}

impl GarbageCollector {
    pub fn new(
        pool: Arc<ZonePool>,
        open: Arc<OpenZoneManager>,
        map: Arc<dyn AddressMap>,
        watermark: Arc<WatermarkController>,
        batch_pages: u32,
    ) -> Self {
        Self {
            pool,
            open,
            map,
            watermark,
            batch_pages: batch_pages.max(1),
            state: AtomicU8::new(GcState::Idle as u8),
            failed_zone: AtomicU32::new(NO_ZONE),
            shutdown: AtomicBool::new(false),
            cycle: Mutex::new(()),
            stats: GcStats::default(),
        }
    }

    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, ctx: &mut ReclaimCtx, state: GcState) {
        ctx.state = state;
        self.state.store(state as u8, Ordering::Release);
    }

    /// Zone whose permanent failure halted GC
    pub fn failed_zone(&self) -> Option<u32> {
        match self.failed_zone.load(Ordering::Acquire) {
            NO_ZONE => None,
            zone => Some(zone),
        }
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.failed_zone().is_some()
    }

    /// Ask a running migration to stop after its current batch
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Victim selection
    // ------------------------------------------------------------------------

    /// Pick and claim a victim zone.
    ///
    /// Open, suspended, empty and writer-pinned zones are never picked. The
    /// lowest-indexed reset-only zone wins outright; then the zone an
    /// emergency allocation named; then the lowest nominated zone; then the
    /// zone with the highest invalid/occupied ratio, ties to the lowest index.
    pub fn select_victim(&self) -> Option<Victim> {
        self.pick_victim(false)
    }

    fn pick_victim(&self, reset_only_wanted: bool) -> Option<Victim> {
        let pool = &self.pool;

        self.open.with_open_set_locked(|| {
            let requested = pool.requested_zones();
            let emergency = self.watermark.emergency_zone();

            let mut reset_only = None;
            let mut emergency_pick = None;
            let mut requested_pick = None;
            let mut best: Option<(u32, u32, u32)> = None;

            for z in pool.zones() {
                let st = z.state.lock();
                if st.cond.is_open()
                    || st.cond == ZoneCond::Suspended
                    || st.under_gc
                    || st.occupied == 0
                    || st.writers > 0
                {
                    continue;
                }

                let idx = z.index();
                if st.is_reset_only() {
                    reset_only = Some(idx);
                    break;
                }
                if Some(idx) == emergency {
                    emergency_pick = Some(idx);
                }
                if requested_pick.is_none() && requested.contains(&idx) {
                    requested_pick = Some(idx);
                }
                if st.invalid > 0 {
                    // invalid/occupied > best_invalid/best_occupied
                    let better = best.map_or(true, |(_, bi, bo)| {
                        st.invalid as u64 * bo as u64 > bi as u64 * st.occupied as u64
                    });
                    if better {
                        best = Some((idx, st.invalid, st.occupied));
                    }
                }
            }

            let victim = match reset_only {
                Some(zone) => Victim {
                    zone,
                    reset_only: true,
                },
                None if reset_only_wanted => return None,
                None => Victim {
                    zone: emergency_pick
                        .or(requested_pick)
                        .or(best.map(|(zone, _, _)| zone))?,
                    reset_only: false,
                },
            };

            pool.zone(victim.zone).ok()?.state.lock().under_gc = true;
            Some(victim)
        })
    }

    fn release_claim(&self, zone: u32) {
        if let Ok(z) = self.pool.zone(zone) {
            z.state.lock().under_gc = false;
        }
    }

    // ------------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------------

    /// Reclaim one zone
    pub fn reclaim_one(&self) -> ZnsResult<ReclaimOutcome> {
        if let Some(zone) = self.failed_zone() {
            return Err(ZnsError::ZoneSuspended(zone));
        }
        let Some(victim) = self.select_victim() else {
            return Ok(ReclaimOutcome::NoVictim);
        };

        if victim.reset_only {
            return self.reset_victim(victim.zone);
        }
        self.migrate(victim.zone)
    }

    /// Reset every zone that needs no migration; returns how many
    pub fn reclaim_reset_only(&self) -> u32 {
        let _cycle = self.cycle.lock();
        let mut reclaimed = 0;
        while !self.stopping() && !self.is_halted() {
            let Some(victim) = self.pick_victim(true) else {
                break;
            };
            match self.reset_victim(victim.zone) {
                Ok(_) => {
                    reclaimed += 1;
                    self.watermark.notify_zone_freed();
                }
                Err(e) => {
                    crate::kerror!("zns: GC reset of zone {} failed: {}", victim.zone, e);
                    break;
                }
            }
        }
        reclaimed
    }

    fn reset_victim(&self, zone: u32) -> ZnsResult<ReclaimOutcome> {
        if let Err(e) = self.pool.reset_zone(zone, true) {
            self.release_claim(zone);
            return Err(e);
        }
        self.stats.reset_only.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!("zns: GC reset zone {} (no live data)", zone);
        Ok(ReclaimOutcome::Reset { zone, moved: 0 })
    }

    fn migrate(&self, zone: u32) -> ZnsResult<ReclaimOutcome> {
        let mut ctx = ReclaimCtx::new(zone, self.batch_pages);
        crate::kdebug!("zns: GC migrating zone {}", zone);

        let result = self.drain(&mut ctx);
        self.set_state(&mut ctx, GcState::Idle);

        match result {
            Ok(true) => {
                if let Err(e) = self.pool.reset_zone(zone, true) {
                    self.release_claim(zone);
                    return Err(e);
                }
                self.stats.migrated.fetch_add(1, Ordering::Relaxed);
                crate::kinfo!("zns: GC reclaimed zone {}, moved {} pages", zone, ctx.moved);
                Ok(ReclaimOutcome::Reset {
                    zone,
                    moved: ctx.moved,
                })
            }
            Ok(false) => {
                self.release_claim(zone);
                self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                crate::kdebug!(
                    "zns: GC deferred zone {} after {} pages",
                    zone,
                    ctx.moved
                );
                Ok(ReclaimOutcome::Deferred { zone })
            }
            Err(e) => Err(e),
        }
    }

    /// Move batches until the victim is drained (`Ok(true)`) or no
    /// destination is left or a stop was requested (`Ok(false)`)
    fn drain(&self, ctx: &mut ReclaimCtx) -> ZnsResult<bool> {
        loop {
            if self.stopping() {
                return Ok(false);
            }

            let (dest, room) = match self.open.acquire_gc_zone(&self.pool) {
                Some(d) => d,
                None => {
                    // Might already be drained by concurrent frees
                    let (left, _) = self.pool.collect_valid(ctx.from_zone, ctx.last_pos, 1)?;
                    return Ok(left.is_empty());
                }
            };

            let limit = (self.batch_pages.min(room)) as usize;
            let (slots, next) = self.pool.collect_valid(ctx.from_zone, ctx.last_pos, limit)?;
            if slots.is_empty() {
                return Ok(true);
            }

            ctx.begin_batch(&slots);
            self.set_state(ctx, GcState::Reading);
            self.read_batch(ctx)?;

            self.set_state(ctx, GcState::Writing);
            let range = self.write_batch(ctx, dest)?;
            crate::ktrace!(
                "zns: GC batch {} -> {}: {} read, {} written",
                ctx.from_zone,
                dest,
                ctx.finished_read,
                ctx.finished_write
            );
            self.commit_batch(ctx, dest, range);

            ctx.last_pos = next;
            self.stats.batches.fetch_add(1, Ordering::Relaxed);
            self.set_state(ctx, GcState::Idle);
        }
    }

    fn read_batch(&self, ctx: &mut ReclaimCtx) -> ZnsResult<()> {
        let zone = ctx.from_zone;
        let device = self.pool.device();

        for (idx, slots) in ctx.read_runs() {
            let off = idx * PAGE_SIZE;
            let len = (slots.end - slots.start) as usize * PAGE_SIZE;
            let buf = &mut ctx.buffer[off..off + len];

            if let Err(source) = self
                .pool
                .retry()
                .run("GC read", zone, || device.read(zone, slots.clone(), &mut *buf))
            {
                return Err(self.halt(zone, source));
            }
            ctx.finished_read += slots.end - slots.start;
        }
        Ok(())
    }

    /// Append the batch to `dest`; returns the destination slots
    fn write_batch(&self, ctx: &mut ReclaimCtx, dest: u32) -> ZnsResult<Range<u32>> {
        let dz = self.pool.zone(dest)?;
        let _append = dz.append.lock();

        let range = match self.pool.try_reserve(dest, ctx.num_pages)? {
            Some(r) if r.end - r.start == ctx.num_pages => r,
            Some(r) => {
                self.pool.mark_invalidated(dest, r)?;
                return Err(self.halt(dest, DeviceError::OutOfRange));
            }
            None => return Err(self.halt(dest, DeviceError::OutOfRange)),
        };

        let device = self.pool.device();
        let buf = &ctx.buffer[..ctx.batch_bytes()];
        if let Err(source) = self
            .pool
            .retry()
            .run("GC write", dest, || device.write(dest, range.start, buf))
        {
            self.pool.mark_invalidated(dest, range)?;
            return Err(self.halt(dest, source));
        }

        ctx.finished_write = ctx.num_pages;
        self.pool
            .counters
            .gc_writes
            .fetch_add(ctx.num_pages as u64, Ordering::Relaxed);
        Ok(range)
    }

    /// Commit the written pages and point their entries at the destination
    fn commit_batch(&self, ctx: &mut ReclaimCtx, dest: u32, range: Range<u32>) {
        for (m, dst_slot) in ctx.moves.iter().zip(range) {
            let src = SlotLocation::new(ctx.from_zone, m.src);
            let dst = SlotLocation::new(dest, dst_slot);

            // Re-read the source: the entry may have been freed or its
            // cache state changed while the batch was in flight
            let cached = match self.pool.slot_state(src) {
                Ok(SlotState::Valid { key, cached }) if key == m.key => Some(cached),
                _ => None,
            };

            let moved = match cached {
                Some(cached) => {
                    self.pool.commit_slot(dst, m.key, cached).is_ok()
                        && self.map.remap(m.key, src, dst)
                }
                None => false,
            };

            if moved {
                if let Err(e) = self.pool.invalidate_slot(src) {
                    crate::kerror!("zns: GC invalidate {} failed: {}", src, e);
                }
                ctx.moved += 1;
                self.stats.pages_moved.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "debug_gc")]
                crate::ktrace!("zns: GC moved {:#x} {} -> {}", m.key, src, dst);
            } else {
                if let Err(e) = self.pool.invalidate_slot(dst) {
                    crate::kerror!("zns: GC invalidate {} failed: {}", dst, e);
                }
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Quarantine `zone` and stop collecting
    fn halt(&self, zone: u32, source: DeviceError) -> ZnsError {
        self.pool.suspend(zone);
        self.failed_zone.store(zone, Ordering::Release);
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        crate::kfatal!(
            "zns: GC halted, zone {} failed permanently: {}",
            zone,
            source
        );
        ZnsError::ZoneSuspended(zone)
    }

    // ------------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------------

    /// Reclaim until the watermark controller is satisfied.
    ///
    /// `forced` reclaims at least one zone regardless of the free count.
    pub fn run_cycle(&self, forced: bool) -> u32 {
        let _cycle = self.cycle.lock();
        let wm = &self.watermark;
        wm.set_gc_running(true);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let mut reclaimed = 0;
        let mut forced = forced;
        while !self.stopping() {
            let free = self.pool.free_zone_count();
            if !forced && !wm.should_continue(free) {
                break;
            }
            forced = false;

            match self.reclaim_one() {
                Ok(ReclaimOutcome::Reset { .. }) => {
                    reclaimed += 1;
                    wm.notify_zone_freed();
                }
                Ok(ReclaimOutcome::NoVictim) | Ok(ReclaimOutcome::Deferred { .. }) => break,
                Err(e) => {
                    crate::kerror!("zns: GC cycle aborted: {}", e);
                    break;
                }
            }
        }

        wm.set_gc_running(false);
        crate::kdebug!(
            "zns: GC cycle done, {} zones reclaimed, {} free",
            reclaimed,
            self.pool.free_zone_count()
        );
        reclaimed
    }
}

/// Body of the per-device GC thread
pub fn worker_loop(gc: Arc<GarbageCollector>, idle_poll: Duration) {
    crate::kdebug!("zns: kznsd started for swap device {}", gc.pool.id());

    loop {
        let wake = gc.watermark.wait_wake(idle_poll);
        if gc.stopping() || wake == Some(GcWake::Shutdown) {
            break;
        }
        if gc.is_halted() {
            continue;
        }

        let free = gc.pool.free_zone_count();
        let pressure = free <= gc.watermark.low() || gc.watermark.in_emergency();

        match wake {
            Some(GcWake::Reclaim) => {
                gc.run_cycle(true);
            }
            _ if pressure => {
                gc.run_cycle(false);
            }
            // Idle poll: pick up zones that need no migration
            None if !gc.pool.requested_zones().is_empty() => {
                if gc.reclaim_reset_only() > 0 {
                    crate::kdebug!("zns: idle reclaim, {} free", gc.pool.free_zone_count());
                }
            }
            _ => {}
        }
    }

    crate::kdebug!("zns: kznsd exiting");
}
