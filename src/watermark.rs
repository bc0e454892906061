//! Free-zone watermarks and GC scheduling
//!
//! ```text
//!  free zones
//!      ▲
//!  high├───────────── GC goes back to sleep
//!      │
//!   low├───────────── GC woken (proactive)
//!      │
//!    0 └───────────── allocation blocks, GC woken (emergency)
//! ```
//!
//! The GC worker parks on a bounded wake channel. Allocations stalled on an
//! exhausted pool park on a condition variable that every zone reset
//! signals.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

/// Pending wake-ups beyond this are dropped; the worker re-reads the pool
/// state on every wake anyway
const WAKE_QUEUE_DEPTH: usize = 4;

const NO_ZONE: u32 = u32::MAX;

/// Why the GC worker was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcWake {
    /// Free zones at or below the low watermark
    Proactive,
    /// An allocation is blocked on an empty free pool
    Emergency,
    /// A zone was nominated for reclaim or GC was triggered by hand
    Reclaim,
    Shutdown,
}

pub struct WatermarkController {
    low: u32,
    high: u32,
    emergency: AtomicBool,
    /// Zone an emergency allocation asked for, if any
    emergency_zone: AtomicU32,
    wake_tx: Sender<GcWake>,
    wake_rx: Receiver<GcWake>,
    /// Bumped on every zone reset
    freed: Mutex<u64>,
    freed_cv: Condvar,
    gc_running: AtomicBool,
    pub wakeups: AtomicU64,
}

impl WatermarkController {
    pub fn new(low: u32, high: u32) -> Self {
        let (wake_tx, wake_rx) = bounded(WAKE_QUEUE_DEPTH);
        Self {
            low,
            high,
            emergency: AtomicBool::new(false),
            emergency_zone: AtomicU32::new(NO_ZONE),
            wake_tx,
            wake_rx,
            freed: Mutex::new(0),
            freed_cv: Condvar::new(),
            gc_running: AtomicBool::new(false),
            wakeups: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn low(&self) -> u32 {
        self.low
    }

    #[inline]
    pub fn high(&self) -> u32 {
        self.high
    }

    /// Check the free-zone count after an allocation; wakes GC at or below
    /// the low watermark. Never blocks.
    pub fn observe(&self, free: u32) -> bool {
        if free > self.low {
            return false;
        }
        self.wake(GcWake::Proactive);
        true
    }

    /// Wake GC without blocking
    pub fn wake(&self, reason: GcWake) {
        match self.wake_tx.try_send(reason) {
            Ok(()) => {
                self.wakeups.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                crate::kwarn!("zns: GC wake channel closed");
            }
        }
    }

    /// Flag zone exhaustion and wake GC with priority
    pub fn enter_emergency(&self, target: Option<u32>) {
        if !self.emergency.swap(true, Ordering::AcqRel) {
            crate::kwarn!("zns: out of free zones, emergency reclaim");
        }
        self.emergency_zone
            .store(target.unwrap_or(NO_ZONE), Ordering::Release);
        self.wake(GcWake::Emergency);
    }

    #[inline]
    pub fn in_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    pub fn emergency_zone(&self) -> Option<u32> {
        match self.emergency_zone.load(Ordering::Acquire) {
            NO_ZONE => None,
            zone => Some(zone),
        }
    }

    fn clear_emergency(&self) {
        if self.emergency.swap(false, Ordering::AcqRel) {
            self.emergency_zone.store(NO_ZONE, Ordering::Release);
            crate::kinfo!("zns: emergency cleared");
        }
    }

    /// Block until `has_free` holds or `timeout` elapses.
    ///
    /// `has_free` is re-checked under the wait lock after every zone reset,
    /// so a reset racing with the call is never missed.
    pub fn wait_for_free_zone<F>(&self, timeout: Duration, has_free: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut freed = self.freed.lock();

        loop {
            if has_free() {
                return true;
            }
            if self.freed_cv.wait_until(&mut freed, deadline).timed_out() {
                return has_free();
            }
        }
    }

    /// Called after every zone reset
    pub fn notify_zone_freed(&self) {
        *self.freed.lock() += 1;
        self.freed_cv.notify_all();
    }

    /// Whether GC should keep reclaiming at `free` free zones
    pub fn should_continue(&self, free: u32) -> bool {
        if free >= self.high {
            self.clear_emergency();
            return false;
        }
        if free > self.low {
            // Above low but below high: keep going only under pressure
            return self.in_emergency() || self.gc_running.load(Ordering::Acquire);
        }
        true
    }

    /// Park the worker until a wake-up or `timeout`
    pub fn wait_wake(&self, timeout: Duration) -> Option<GcWake> {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(reason) => Some(reason),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(GcWake::Shutdown),
        }
    }

    pub(crate) fn set_gc_running(&self, running: bool) {
        self.gc_running.store(running, Ordering::Release);
    }

    #[inline]
    pub fn gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_observe_wakes_at_low_watermark() {
        let wm = WatermarkController::new(2, 4);
        assert!(!wm.observe(3));
        assert_eq!(wm.wait_wake(Duration::ZERO), None);

        assert!(wm.observe(2));
        assert_eq!(wm.wait_wake(Duration::ZERO), Some(GcWake::Proactive));
    }

    #[test]
    fn test_wake_never_blocks_when_queue_full() {
        let wm = WatermarkController::new(2, 4);
        for _ in 0..WAKE_QUEUE_DEPTH * 4 {
            wm.observe(0);
        }
        assert_eq!(wm.wakeups.load(Ordering::Relaxed), WAKE_QUEUE_DEPTH as u64);
    }

    #[test]
    fn test_emergency_target() {
        let wm = WatermarkController::new(1, 3);
        wm.enter_emergency(Some(7));
        assert!(wm.in_emergency());
        assert_eq!(wm.emergency_zone(), Some(7));
        assert_eq!(wm.wait_wake(Duration::ZERO), Some(GcWake::Emergency));

        // Still under pressure between the watermarks
        assert!(wm.should_continue(2));
        assert!(!wm.should_continue(3));
        assert!(!wm.in_emergency());
        assert_eq!(wm.emergency_zone(), None);
    }

    #[test]
    fn test_should_continue() {
        let wm = WatermarkController::new(2, 4);
        assert!(wm.should_continue(0));
        assert!(wm.should_continue(2));
        assert!(!wm.should_continue(3));
        assert!(!wm.should_continue(4));

        wm.set_gc_running(true);
        assert!(wm.should_continue(3));
        assert!(!wm.should_continue(4));
    }

    #[test]
    fn test_wait_times_out() {
        let wm = WatermarkController::new(2, 4);
        let start = Instant::now();
        assert!(!wm.wait_for_free_zone(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_woken_by_reset() {
        let wm = Arc::new(WatermarkController::new(2, 4));
        let free = Arc::new(AtomicU32::new(0));

        let waiter = {
            let wm = wm.clone();
            let free = free.clone();
            thread::spawn(move || {
                wm.wait_for_free_zone(Duration::from_secs(5), || free.load(Ordering::Acquire) > 0)
            })
        };

        thread::sleep(Duration::from_millis(10));
        free.store(1, Ordering::Release);
        wm.notify_zone_freed();

        assert!(waiter.join().unwrap());
    }
}
