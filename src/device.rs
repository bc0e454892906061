//! Zoned block device interface
//!
//! The swap backend never touches hardware directly. Everything it needs from
//! the device is the three zone commands below, addressed in page-sized
//! slots. Writes must land exactly at a zone's write pointer; a zone only
//! becomes writable from slot 0 again after `reset_zone`.
//!
//! `MemZonedDevice` is a RAM-backed implementation that enforces the same
//! rules and can inject faults. It backs the tests and is usable as a
//! zram-like swap target.

use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use spin::Mutex;

use crate::error::DeviceError;
use crate::PAGE_SIZE;

/// Zone layout reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneGeometry {
    /// Total number of zones
    pub num_zones: u32,
    /// Writable page slots per zone
    pub zone_capacity: u32,
    /// Maximum number of zones open for write at once
    pub max_open_zones: u32,
}

impl ZoneGeometry {
    pub const fn new(num_zones: u32, zone_capacity: u32, max_open_zones: u32) -> Self {
        Self {
            num_zones,
            zone_capacity,
            max_open_zones,
        }
    }

    /// Total page slots on the device
    pub fn total_slots(&self) -> u64 {
        self.num_zones as u64 * self.zone_capacity as u64
    }
}

/// Operations a zoned device provides to the swap backend
pub trait ZonedDevice: Send + Sync {
    /// Device zone layout
    fn geometry(&self) -> ZoneGeometry;

    /// Read `slots` of `zone` into `buf` (`slots.len() * PAGE_SIZE` bytes)
    fn read(&self, zone: u32, slots: Range<u32>, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Append `buf` to `zone` starting at slot `start`, which must equal the
    /// zone's write pointer
    fn write(&self, zone: u32, start: u32, buf: &[u8]) -> Result<(), DeviceError>;

    /// Erase `zone` and rewind its write pointer
    fn reset_zone(&self, zone: u32) -> Result<(), DeviceError>;
}

/// Zone command kinds, used for fault injection and accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOp {
    Read,
    Write,
    Reset,
}

/// An injected failure
#[derive(Debug, Clone, Copy)]
struct Fault {
    op: ZoneOp,
    zone: Option<u32>,
    remaining: u32,
}

struct MemZone {
    data: Vec<u8>,
    wp: u32,
}

/// I/O accounting for a device
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub resets: AtomicU64,
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub faults: AtomicU64,
}

/// RAM-backed zoned device
pub struct MemZonedDevice {
    geometry: ZoneGeometry,
    zones: Vec<Mutex<MemZone>>,
    faults: Mutex<Vec<Fault>>,
    pub counters: DeviceCounters,
}

impl MemZonedDevice {
    /// Create a device; zone storage is allocated lazily on first write
    pub fn new(geometry: ZoneGeometry) -> Self {
        let zones = (0..geometry.num_zones)
            .map(|_| {
                Mutex::new(MemZone {
                    data: Vec::new(),
                    wp: 0,
                })
            })
            .collect();

        Self {
            geometry,
            zones,
            faults: Mutex::new(Vec::new()),
            counters: DeviceCounters::default(),
        }
    }

    /// Fail the next `count` commands of kind `op` (on `zone`, or any zone)
    pub fn inject_fault(&self, op: ZoneOp, zone: Option<u32>, count: u32) {
        self.faults.lock().push(Fault {
            op,
            zone,
            remaining: count,
        });
    }

    /// Fail every command of kind `op` on `zone` until cleared
    pub fn inject_persistent_fault(&self, op: ZoneOp, zone: Option<u32>) {
        self.inject_fault(op, zone, u32::MAX);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Current write pointer of `zone`
    pub fn write_pointer(&self, zone: u32) -> Option<u32> {
        self.zones.get(zone as usize).map(|z| z.lock().wp)
    }

    fn take_fault(&self, op: ZoneOp, zone: u32) -> bool {
        let mut faults = self.faults.lock();
        let hit = faults
            .iter_mut()
            .find(|f| f.op == op && f.zone.map_or(true, |z| z == zone) && f.remaining > 0);

        match hit {
            Some(fault) => {
                if fault.remaining != u32::MAX {
                    fault.remaining -= 1;
                }
                faults.retain(|f| f.remaining > 0);
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn zone(&self, zone: u32) -> Result<&Mutex<MemZone>, DeviceError> {
        self.zones.get(zone as usize).ok_or(DeviceError::OutOfRange)
    }
}

impl ZonedDevice for MemZonedDevice {
    fn geometry(&self) -> ZoneGeometry {
        self.geometry
    }

    fn read(&self, zone: u32, slots: Range<u32>, buf: &mut [u8]) -> Result<(), DeviceError> {
        let z = self.zone(zone)?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        if self.take_fault(ZoneOp::Read, zone) {
            return Err(DeviceError::Io);
        }

        let len = (slots.end.saturating_sub(slots.start)) as usize * PAGE_SIZE;
        if slots.start > slots.end || buf.len() < len {
            return Err(DeviceError::OutOfRange);
        }

        let z = z.lock();
        if slots.end > z.wp {
            return Err(DeviceError::OutOfRange);
        }

        let off = slots.start as usize * PAGE_SIZE;
        buf[..len].copy_from_slice(&z.data[off..off + len]);
        self.counters
            .pages_read
            .fetch_add((slots.end - slots.start) as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, zone: u32, start: u32, buf: &[u8]) -> Result<(), DeviceError> {
        let z = self.zone(zone)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        if self.take_fault(ZoneOp::Write, zone) {
            return Err(DeviceError::Io);
        }

        if buf.len() % PAGE_SIZE != 0 {
            return Err(DeviceError::OutOfRange);
        }
        let pages = (buf.len() / PAGE_SIZE) as u32;

        let mut z = z.lock();
        if start != z.wp {
            return Err(DeviceError::WritePointer {
                expected: z.wp,
                got: start,
            });
        }
        if start + pages > self.geometry.zone_capacity {
            return Err(DeviceError::OutOfRange);
        }

        z.data.extend_from_slice(buf);
        z.wp += pages;
        self.counters
            .pages_written
            .fetch_add(pages as u64, Ordering::Relaxed);
        Ok(())
    }

    fn reset_zone(&self, zone: u32) -> Result<(), DeviceError> {
        let z = self.zone(zone)?;
        self.counters.resets.fetch_add(1, Ordering::Relaxed);

        if self.take_fault(ZoneOp::Reset, zone) {
            return Err(DeviceError::Io);
        }

        let mut z = z.lock();
        z.data = Vec::new();
        z.wp = 0;
        Ok(())
    }
}

/// Bounded retry policy for device commands
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// Only `DeviceError::Io` is retried; pointer and range errors are
    /// returned at once since repeating the command cannot fix them.
    pub fn run<T, F>(&self, what: &str, zone: u32, mut op: F) -> Result<T, DeviceError>
    where
        F: FnMut() -> Result<T, DeviceError>,
    {
        let mut delay = self.backoff;
        let mut attempt = 0;

        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(DeviceError::Io) if attempt < self.retries => {
                    attempt += 1;
                    crate::kwarn!(
                        "zns: {} on zone {} failed, retry {}/{}",
                        what,
                        zone,
                        attempt,
                        self.retries
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn test_sequential_write_enforced() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(2, 4, 2));

        dev.write(0, 0, &page(1)).unwrap();
        assert_eq!(dev.write_pointer(0), Some(1));

        assert_eq!(
            dev.write(0, 2, &page(2)),
            Err(DeviceError::WritePointer {
                expected: 1,
                got: 2
            })
        );

        dev.write(0, 1, &[page(2), page(3)].concat()).unwrap();
        assert_eq!(dev.write_pointer(0), Some(3));
    }

    #[test]
    fn test_write_past_capacity_rejected() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 2, 2));
        dev.write(0, 0, &[page(1), page(2)].concat()).unwrap();
        assert_eq!(dev.write(0, 2, &page(3)), Err(DeviceError::OutOfRange));
    }

    #[test]
    fn test_read_beyond_write_pointer_rejected() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 4, 2));
        dev.write(0, 0, &page(7)).unwrap();

        let mut buf = vec![0u8; 2 * PAGE_SIZE];
        assert_eq!(dev.read(0, 0..2, &mut buf), Err(DeviceError::OutOfRange));

        dev.read(0, 0..1, &mut buf).unwrap();
        assert!(buf[..PAGE_SIZE].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_reset_rewinds_write_pointer() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 4, 2));
        dev.write(0, 0, &page(1)).unwrap();
        dev.reset_zone(0).unwrap();
        assert_eq!(dev.write_pointer(0), Some(0));

        let mut buf = vec![0u8; PAGE_SIZE];
        assert_eq!(dev.read(0, 0..1, &mut buf), Err(DeviceError::OutOfRange));
        dev.write(0, 0, &page(2)).unwrap();
    }

    #[test]
    fn test_injected_fault_is_consumed() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(2, 4, 2));
        dev.inject_fault(ZoneOp::Write, Some(1), 1);

        // Other zones are unaffected
        dev.write(0, 0, &page(1)).unwrap();

        assert_eq!(dev.write(1, 0, &page(1)), Err(DeviceError::Io));
        dev.write(1, 0, &page(1)).unwrap();
        assert_eq!(dev.counters.faults.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_retry_policy_recovers_from_transient_fault() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 4, 2));
        dev.inject_fault(ZoneOp::Write, None, 2);

        let retry = RetryPolicy::new(3, Duration::ZERO);
        retry.run("write", 0, || dev.write(0, 0, &page(5))).unwrap();
        assert_eq!(dev.counters.writes.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_retry_policy_gives_up() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 4, 2));
        dev.inject_persistent_fault(ZoneOp::Reset, Some(0));

        let retry = RetryPolicy::new(2, Duration::ZERO);
        assert_eq!(retry.run("reset", 0, || dev.reset_zone(0)), Err(DeviceError::Io));
        assert_eq!(dev.counters.resets.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_retry_policy_does_not_retry_pointer_errors() {
        let dev = MemZonedDevice::new(ZoneGeometry::new(1, 4, 2));
        let retry = RetryPolicy::new(5, Duration::ZERO);

        let res = retry.run("write", 0, || dev.write(0, 3, &page(1)));
        assert!(matches!(res, Err(DeviceError::WritePointer { .. })));
        assert_eq!(dev.counters.writes.load(Ordering::Relaxed), 1);
    }
}
