//! Shared fixture for the scenario tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use zns_swap::policy::SwapPolicyHints;
use zns_swap::{MemZonedDevice, SwapSlot, ZnsSwapConfig, ZnsSwapDevice, ZoneGeometry, PAGE_SIZE};

pub struct Fixture {
    pub dev: Arc<MemZonedDevice>,
    pub swap: ZnsSwapDevice,
}

/// Small, fast-reacting defaults for a device of `zones` x `capacity`
pub fn config() -> ZnsSwapConfig {
    ZnsSwapConfig {
        low_wmark: 1,
        high_wmark: 2,
        gc_reserve_zones: 0,
        gc_io_retries: 1,
        gc_io_backoff_ms: 0,
        gc_idle_poll_ms: 60_000,
        emergency_wait_ms: 2_000,
        ..ZnsSwapConfig::default()
    }
}

pub fn fixture(zones: u32, capacity: u32, max_open: u32, config: ZnsSwapConfig) -> Fixture {
    let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(zones, capacity, max_open)));
    let swap = ZnsSwapDevice::activate(0, dev.clone(), config).expect("activate");
    Fixture { dev, swap }
}

/// A page whose every byte is derived from `key`
pub fn page(key: u64) -> Vec<u8> {
    vec![key as u8 ^ 0x5A; PAGE_SIZE]
}

pub fn hints() -> SwapPolicyHints {
    SwapPolicyHints::default()
}

impl Fixture {
    pub fn put(&self, key: u64) -> SwapSlot {
        self.swap
            .swap_out(key, &hints(), &page(key))
            .unwrap_or_else(|e| panic!("swap_out({}) failed: {}", key, e))
    }

    /// Swap in `key` and check its content
    pub fn check(&self, key: u64) {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.swap.swap_in(key, &mut buf, false).expect("swap_in");
        assert!(buf == page(key), "page of key {} corrupted", key);
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Per-zone counters must stay within the zone's capacity
pub fn assert_zone_accounting(swap: &ZnsSwapDevice) {
    let mut valid = 0u64;
    for z in swap.zone_infos() {
        assert!(z.invalid <= z.occupied, "zone {}: {:?}", z.index, z);
        assert!(z.occupied <= z.capacity, "zone {}: {:?}", z.index, z);
        assert!(z.occupied - z.invalid <= z.capacity, "zone {}: {:?}", z.index, z);
        assert!(z.cached <= z.valid(), "zone {}: {:?}", z.index, z);
        valid += z.valid() as u64;
    }
    assert_eq!(valid, swap.swap_info().valid_slots());
}
