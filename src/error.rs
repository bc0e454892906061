//! Error types for the ZNS swap backend
//!
//! `DeviceError` is what a zoned device reports for a single I/O; `ZnsError`
//! is what the swap backend reports to its callers. Only device errors are
//! retried locally, everything else propagates.

/// Result type used throughout the crate
pub type ZnsResult<T> = Result<T, ZnsError>;

/// Zoned device I/O errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Media or transport failure
    #[error("I/O error")]
    Io,

    /// Write did not start at the zone's write pointer
    #[error("write pointer mismatch (expected slot {expected}, got {got})")]
    WritePointer { expected: u32, got: u32 },

    /// Slot range outside the zone or beyond the write pointer
    #[error("slot range out of bounds")]
    OutOfRange,

    /// Zone or device no longer accepts commands
    #[error("device offline")]
    Offline,
}

/// ZNS swap errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZnsError {
    /// Address field does not fit its bit width, or the value is not enabled
    #[error("swap address field `{field}` out of range: {value:#x}")]
    AddressOverflow { field: &'static str, value: u64 },

    /// Zone accounting would exceed the zone capacity
    #[error("zone {zone} capacity exceeded: {occupied} + {requested} > {capacity}")]
    CapacityExceeded {
        zone: u32,
        occupied: u32,
        requested: u32,
        capacity: u32,
    },

    /// Device I/O failed after local retries
    #[error("device error on zone {zone}: {source}")]
    Device { zone: u32, source: DeviceError },

    /// No zone could take the allocation, even after emergency reclaim
    #[error("out of swap zones")]
    OutOfSwapZones,

    /// Zone is quarantined after a permanent failure
    #[error("zone {0} is suspended")]
    ZoneSuspended(u32),

    /// Zone index outside the device
    #[error("invalid zone index {0}")]
    InvalidZone(u32),

    /// Zone still has writers or is being reclaimed
    #[error("zone {0} is busy")]
    ZoneBusy(u32),

    /// Zone still holds valid slots and cannot be reset
    #[error("zone {0} still holds live data")]
    ZoneHasLiveData(u32),

    /// Swap entry has no backing slot
    #[error("swap entry {0:#x} is not mapped")]
    NotMapped(u64),

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Swap device has been deactivated
    #[error("swap device is not active")]
    Inactive,
}

impl ZnsError {
    /// Convert to POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            ZnsError::AddressOverflow { .. } => -22, // EINVAL
            ZnsError::CapacityExceeded { .. } => -117, // EUCLEAN
            ZnsError::Device { .. } => -5,          // EIO
            ZnsError::OutOfSwapZones => -28,        // ENOSPC
            ZnsError::ZoneSuspended(_) => -5,       // EIO
            ZnsError::InvalidZone(_) => -22,        // EINVAL
            ZnsError::ZoneBusy(_) => -16,           // EBUSY
            ZnsError::ZoneHasLiveData(_) => -16,    // EBUSY
            ZnsError::NotMapped(_) => -2,           // ENOENT
            ZnsError::Config(_) => -22,             // EINVAL
            ZnsError::Inactive => -19,              // ENODEV
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZnsError::Device {
                source: DeviceError::Io,
                ..
            }
        )
    }
}

impl From<toml::de::Error> for ZnsError {
    fn from(e: toml::de::Error) -> Self {
        ZnsError::Config(e.to_string())
    }
}
