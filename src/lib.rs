//! ZNS Swap Backend for NexaOS
//!
//! Swap space management for Zoned Namespace devices. A ZNS device is split
//! into zones that can only be appended to and must be reset as a whole
//! before reuse, so swap slots cannot be freed in place: a zone is reclaimed
//! by moving its still-valid pages elsewhere and resetting it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  swap_out / swap_in / swap_free                 │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────▼─────────────────────────────────┐
//! │  ZnsSwapDevice (swap.rs)                                        │
//! │   ┌──────────────┐  ┌─────────────────┐  ┌──────────────────┐   │
//! │   │PolicyDispatch│─▶│OpenZoneManager  │─▶│ZonePool          │   │
//! │   │ (policy.rs)  │  │ (open_zone.rs)  │  │ (pool.rs/zone.rs)│   │
//! │   └──────────────┘  └─────────────────┘  └────────┬─────────┘   │
//! │                                                   │ free zones  │
//! │   ┌──────────────────────┐      wake      ┌───────▼─────────┐   │
//! │   │ kznsd: GC worker     │◀───────────────│ Watermark       │   │
//! │   │ (gc.rs)              │                │ (watermark.rs)  │   │
//! │   └──────────┬───────────┘                └─────────────────┘   │
//! └──────────────┼──────────────────────────────────────────────────┘
//!                │ read / write / reset_zone
//! ┌──────────────▼──────────────────────────────────────────────────┐
//! │  ZonedDevice (device.rs)                                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let dev = Arc::new(MemZonedDevice::new(ZoneGeometry::new(64, 256, 8)));
//! let swap = ZnsSwapDevice::activate(0, dev, ZnsSwapConfig::default())?;
//!
//! let slot = swap.swap_out(key, &hints, &page)?;
//! swap.swap_in(key, &mut page, false)?;
//! swap.swap_free(key)?;
//!
//! swap.deactivate()?;
//! ```

pub mod addr;
pub mod config;
pub mod device;
pub mod error;
pub mod gc;
pub mod logger;
pub mod map;
pub mod open_zone;
pub mod policy;
pub mod pool;
pub mod stats;
pub mod swap;
pub mod watermark;
pub mod zone;

pub use addr::{decode, encode, SwapPolVal};
pub use config::ZnsSwapConfig;
pub use device::{MemZonedDevice, ZoneGeometry, ZonedDevice};
pub use error::{DeviceError, ZnsError, ZnsResult};
pub use map::{AddressMap, MemAddressMap};
pub use policy::{register_policy, unregister_policy, AllocPolicy, SwapPolicyHints};
pub use stats::SwapInfo;
pub use swap::{DeviceHealth, SwapSlot, ZnsSwapDevice};
pub use zone::{SlotLocation, ZoneCond, ZoneInfo};

/// Page size constant
pub const PAGE_SIZE: usize = 4096;

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
