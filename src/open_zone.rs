//! Open-zone manager
//!
//! A ZNS device only keeps a limited number of zones open for write. One of
//! them is held for the GC destination; the remaining `max_open_zones - 1`
//! form the application stream slots a policy address names.
//!
//! Lock order: the open-set lock is taken before any zone state lock. Code
//! holding a zone lock never calls back into the manager.

use crate::error::{ZnsError, ZnsResult};
use crate::pool::{PoolView, ZonePool};
use crate::zone::{OpenKind, ZoneCond};

/// Writer reference to an open application zone.
///
/// Holding a ticket pins the zone: it is not closed, reset or picked as a
/// GC victim until the ticket is handed back through `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct OpenTicket {
    pub zone: u32,
    /// Stream slot the zone is open in
    pub slot: u8,
}

#[derive(Debug, Clone, Copy)]
struct OpenSlot {
    zone: u32,
    last_used: u64,
}

pub(crate) struct OpenSet {
    streams: Vec<Option<OpenSlot>>,
    gc_zone: Option<u32>,
    tick: u64,
}

pub struct OpenZoneManager {
    inner: spin::Mutex<OpenSet>,
}

impl OpenZoneManager {
    /// `max_open_zones` counts the GC slot
    pub fn new(max_open_zones: u32) -> Self {
        let app_limit = max_open_zones.saturating_sub(1).max(1) as usize;
        Self {
            inner: spin::Mutex::new(OpenSet {
                streams: vec![None; app_limit],
                gc_zone: None,
                tick: 0,
            }),
        }
    }

    /// Application open-zone limit
    pub fn app_limit(&self) -> u32 {
        self.inner.lock().streams.len() as u32
    }

    /// Get a writer reference on `zone`, opening it if needed.
    ///
    /// The zone is reused if it is already open. Otherwise it goes into the
    /// stream slot `slot_hint` when that is free, else any free slot, else
    /// the slot whose zone was used least recently and has no writers is
    /// taken over and its zone closed. Returns `None` when the zone cannot
    /// take writes or every slot is pinned by writers.
    pub fn acquire_open_zone(
        &self,
        pool: &ZonePool,
        zone: u32,
        slot_hint: u8,
    ) -> ZnsResult<Option<OpenTicket>> {
        let z = pool.zone(zone)?;
        let mut set = self.inner.lock();
        set.tick += 1;
        let now = set.tick;

        if let Some(slot) = set.stream_of(zone) {
            let mut st = z.state.lock();
            if st.cond != ZoneCond::Open(OpenKind::App) || st.room() == 0 {
                return Ok(None);
            }
            st.writers += 1;
            drop(st);

            if let Some(open) = set.streams[slot].as_mut() {
                open.last_used = now;
            }
            return Ok(Some(OpenTicket {
                zone,
                slot: slot as u8,
            }));
        }

        // Eligibility of a zone that is not open yet
        let reserve = self.reserve_locked(&set, pool);
        {
            let st = z.state.lock();
            let eligible = match st.cond {
                ZoneCond::Closed => true,
                ZoneCond::Empty => pool.free_zone_count() > reserve,
                _ => false,
            };
            if !eligible || st.under_gc || st.room() == 0 {
                return Ok(None);
            }
        }

        let Some(slot) = set.pick_slot(pool, slot_hint) else {
            return Ok(None);
        };

        if let Some(old) = set.streams[slot].take() {
            if let Ok(oz) = pool.zone(old.zone) {
                let mut st = oz.state.lock();
                if st.cond.is_open() {
                    st.cond = st.settled_cond();
                }
            }
            crate::kdebug!("zns: closed zone {} (stream {})", old.zone, slot);
        }

        let mut st = z.state.lock();
        st.cond = ZoneCond::Open(OpenKind::App);
        st.writers += 1;
        drop(st);

        set.streams[slot] = Some(OpenSlot {
            zone,
            last_used: now,
        });
        crate::kdebug!("zns: opened zone {} in stream {}", zone, slot);

        Ok(Some(OpenTicket {
            zone,
            slot: slot as u8,
        }))
    }

    /// Drop a writer reference.
    ///
    /// A zone left with no writers is closed as full once it has no room, and
    /// dropped from its stream if it was suspended meanwhile.
    pub fn release(&self, pool: &ZonePool, ticket: OpenTicket) -> ZnsResult<()> {
        let z = pool.zone(ticket.zone)?;
        let mut set = self.inner.lock();
        let mut st = z.state.lock();

        if st.writers == 0 {
            return Err(ZnsError::ZoneBusy(ticket.zone));
        }
        st.writers -= 1;

        if st.writers == 0 {
            let done = match st.cond {
                ZoneCond::Open(OpenKind::App) if st.room() == 0 => {
                    st.cond = ZoneCond::Full;
                    true
                }
                ZoneCond::Suspended => true,
                _ => false,
            };
            drop(st);

            if done {
                if let Some(slot) = set.stream_of(ticket.zone) {
                    set.streams[slot] = None;
                }
            }
        }
        Ok(())
    }

    /// Current GC destination with its remaining room, opening a fresh empty
    /// zone when there is none. The GC reserve exists for this call.
    pub fn acquire_gc_zone(&self, pool: &ZonePool) -> Option<(u32, u32)> {
        let mut set = self.inner.lock();

        if let Some(zone) = set.gc_zone {
            if let Ok(z) = pool.zone(zone) {
                let mut st = z.state.lock();
                if st.cond == ZoneCond::Open(OpenKind::Gc) && st.room() > 0 {
                    return Some((zone, st.room()));
                }
                if st.cond.is_open() {
                    st.cond = st.settled_cond();
                }
            }
            set.gc_zone = None;
        }

        for z in pool.zones() {
            let mut st = z.state.lock();
            if st.cond == ZoneCond::Empty && !st.under_gc && st.room() > 0 {
                st.cond = ZoneCond::Open(OpenKind::Gc);
                let room = st.room();
                drop(st);

                set.gc_zone = Some(z.index());
                crate::kdebug!("zns: opened GC destination zone {}", z.index());
                return Some((z.index(), room));
            }
        }
        None
    }

    /// Whether the GC destination still has room
    pub fn gc_has_room(&self, pool: &ZonePool) -> bool {
        let set = self.inner.lock();
        set.gc_room(pool) > 0
    }

    /// Close every open zone; used at deactivation
    pub fn close_all(&self, pool: &ZonePool) {
        let mut guard = self.inner.lock();
        let set = &mut *guard;
        let zones: Vec<u32> = set
            .streams
            .iter_mut()
            .filter_map(|s| s.take().map(|o| o.zone))
            .chain(set.gc_zone.take())
            .collect();

        for zone in zones {
            if let Ok(z) = pool.zone(zone) {
                let mut st = z.state.lock();
                if st.cond.is_open() {
                    st.cond = st.settled_cond();
                }
            }
        }
    }

    /// Number of zones open for application writes
    pub fn open_app_zones(&self) -> u32 {
        self.inner.lock().streams.iter().flatten().count() as u32
    }

    pub fn is_open(&self, zone: u32) -> bool {
        let set = self.inner.lock();
        set.stream_of(zone).is_some() || set.gc_zone == Some(zone)
    }

    /// Snapshot for allocation policies
    pub fn view<'a>(&self, pool: &'a ZonePool) -> PoolView<'a> {
        let set = self.inner.lock();
        let streams = set.streams.iter().map(|s| s.map(|o| o.zone)).collect();
        let gc_has_room = set.gc_room(pool) > 0;
        drop(set);
        PoolView::new(pool, streams, gc_has_room)
    }

    /// Run `f` with the open set frozen, so no zone changes between open and
    /// closed while it runs
    pub(crate) fn with_open_set_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _set = self.inner.lock();
        f()
    }

    fn reserve_locked(&self, set: &OpenSet, pool: &ZonePool) -> u32 {
        if set.gc_room(pool) > 0 {
            0
        } else {
            pool.gc_reserve()
        }
    }
}

impl OpenSet {
    fn stream_of(&self, zone: u32) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.map_or(false, |o| o.zone == zone))
    }

    fn gc_room(&self, pool: &ZonePool) -> u32 {
        self.gc_zone
            .and_then(|zone| pool.zone(zone).ok())
            .map_or(0, |z| {
                let st = z.state.lock();
                if st.cond == ZoneCond::Open(OpenKind::Gc) {
                    st.room()
                } else {
                    0
                }
            })
    }

    /// Stream slot to open a zone in
    fn pick_slot(&self, pool: &ZonePool, hint: u8) -> Option<usize> {
        let hint = hint as usize;
        if self.streams.get(hint).map_or(false, |s| s.is_none()) {
            return Some(hint);
        }
        if let Some(free) = self.streams.iter().position(|s| s.is_none()) {
            return Some(free);
        }

        self.streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|o| (i, o)))
            .filter(|(_, o)| {
                pool.zone(o.zone)
                    .map_or(true, |z| z.state.lock().writers == 0)
            })
            .min_by_key(|(_, o)| o.last_used)
            .map(|(i, _)| i)
    }
}
