//! Swap policy address encoding
//!
//! Allocation policies describe their placement decision as one packed
//! 64-bit value so it can be stored next to a page and handed across the
//! module boundary.
//!
//! ```text
//!  63        54  53   52  51              20  19    16  15          0
//! ┌────────────┬────┬────┬──────────────────┬─────────┬─────────────┐
//! │  reserved  │ EN │SEQ │   vma id (32)    │ slot(4) │  zone (16)  │
//! └────────────┴────┴────┴──────────────────┴─────────┴─────────────┘
//! ```
//!
//! - zone: zone index on the swap device
//! - slot: open-zone stream slot the page should be appended through
//! - vma: identifier of the owning mapping
//! - SEQ: the page belongs to a sequential stream
//! - EN: set on every value produced by [`SwapPolVal::pack`]; a zero or
//!   uninitialised word never decodes

use crate::error::{ZnsError, ZnsResult};

/// Width of the zone field
pub const SWAP_POL_ZONE_BITS: u32 = 16;
/// Width of the stream slot field
pub const SWAP_POL_SLOT_BITS: u32 = 4;
/// Width of the vma field
pub const SWAP_POL_VMA_BITS: u32 = 32;

pub const SWAP_POL_SLOT_SHIFT: u32 = SWAP_POL_ZONE_BITS;
pub const SWAP_POL_VMA_SHIFT: u32 = SWAP_POL_SLOT_SHIFT + SWAP_POL_SLOT_BITS;
pub const SWAP_POL_SEQ_SHIFT: u32 = SWAP_POL_VMA_SHIFT + SWAP_POL_VMA_BITS;
pub const SWAP_POL_EN_SHIFT: u32 = SWAP_POL_SEQ_SHIFT + 1;

pub const SWAP_POL_SEQ_FLAG: u64 = 1 << SWAP_POL_SEQ_SHIFT;
pub const SWAP_POL_EN_FLAG: u64 = 1 << SWAP_POL_EN_SHIFT;

const SWAP_POL_ZONE_MASK: u64 = (1 << SWAP_POL_ZONE_BITS) - 1;
const SWAP_POL_SLOT_MASK: u64 = (1 << SWAP_POL_SLOT_BITS) - 1;
const SWAP_POL_VMA_MASK: u64 = (1 << SWAP_POL_VMA_BITS) - 1;
const SWAP_POL_RESERVED_MASK: u64 = !((1 << (SWAP_POL_EN_SHIFT + 1)) - 1);

/// Largest number of stream slots the slot field can name
pub const MAX_STREAM_SLOTS: usize = 1 << SWAP_POL_SLOT_BITS;

/// Decoded swap policy address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapPolVal {
    vma: u32,
    slot: u8,
    zone: u16,
    sequential: bool,
}

impl SwapPolVal {
    /// Build an address, rejecting fields wider than their bit range
    pub fn new(vma: u64, slot: u64, zone: u64) -> ZnsResult<Self> {
        if vma > SWAP_POL_VMA_MASK {
            return Err(ZnsError::AddressOverflow { field: "vma", value: vma });
        }
        if slot > SWAP_POL_SLOT_MASK {
            return Err(ZnsError::AddressOverflow { field: "slot", value: slot });
        }
        if zone > SWAP_POL_ZONE_MASK {
            return Err(ZnsError::AddressOverflow { field: "zone", value: zone });
        }

        Ok(Self {
            vma: vma as u32,
            slot: slot as u8,
            zone: zone as u16,
            sequential: false,
        })
    }

    /// Mark the address as part of a sequential stream
    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    #[inline]
    pub fn vma(&self) -> u32 {
        self.vma
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    #[inline]
    pub fn zone(&self) -> u16 {
        self.zone
    }

    #[inline]
    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    /// Pack into the on-page representation (EN always set)
    pub fn pack(&self) -> u64 {
        let mut raw = SWAP_POL_EN_FLAG
            | ((self.vma as u64) << SWAP_POL_VMA_SHIFT)
            | ((self.slot as u64) << SWAP_POL_SLOT_SHIFT)
            | self.zone as u64;
        if self.sequential {
            raw |= SWAP_POL_SEQ_FLAG;
        }
        raw
    }

    /// Unpack a stored value.
    ///
    /// Returns `Ok(None)` when the enabled bit is clear (zeroed storage) and
    /// `AddressOverflow` when bits above the enabled flag are set.
    pub fn unpack(raw: u64) -> ZnsResult<Option<Self>> {
        if raw & SWAP_POL_RESERVED_MASK != 0 {
            return Err(ZnsError::AddressOverflow {
                field: "reserved",
                value: raw,
            });
        }
        if raw & SWAP_POL_EN_FLAG == 0 {
            return Ok(None);
        }

        Ok(Some(Self {
            vma: ((raw >> SWAP_POL_VMA_SHIFT) & SWAP_POL_VMA_MASK) as u32,
            slot: ((raw >> SWAP_POL_SLOT_SHIFT) & SWAP_POL_SLOT_MASK) as u8,
            zone: (raw & SWAP_POL_ZONE_MASK) as u16,
            sequential: raw & SWAP_POL_SEQ_FLAG != 0,
        }))
    }
}

/// Encode `(vma, slot, zone)` into a packed address
#[inline]
pub fn encode(vma: u64, slot: u64, zone: u64) -> ZnsResult<u64> {
    SwapPolVal::new(vma, slot, zone).map(|v| v.pack())
}

/// Decode a packed address into `(vma, slot, zone)`.
///
/// A value without the enabled bit was never produced by [`encode`] and is
/// rejected rather than decoded into garbage fields.
pub fn decode(raw: u64) -> ZnsResult<(u32, u8, u16)> {
    match SwapPolVal::unpack(raw)? {
        Some(v) => Ok((v.vma(), v.slot(), v.zone())),
        None => Err(ZnsError::AddressOverflow {
            field: "enabled",
            value: raw,
        }),
    }
}

/// Check if a stored word carries an allocated address
#[inline]
pub fn is_enabled(raw: u64) -> bool {
    raw & SWAP_POL_EN_FLAG != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_layout() {
        assert_eq!(SWAP_POL_SLOT_SHIFT, 16);
        assert_eq!(SWAP_POL_VMA_SHIFT, 20);
        assert_eq!(SWAP_POL_SEQ_SHIFT, 52);
        assert_eq!(SWAP_POL_EN_SHIFT, 53);
        assert_eq!(MAX_STREAM_SLOTS, 16);
    }

    #[test]
    fn test_roundtrip_at_field_boundaries() {
        let cases = [
            (0u64, 0u64, 0u64),
            (1, 1, 1),
            (u32::MAX as u64, 15, u16::MAX as u64),
            (0xDEAD_BEEF, 7, 0x1234),
            (u32::MAX as u64, 0, 0),
            (0, 15, 0),
            (0, 0, u16::MAX as u64),
        ];

        for (vma, slot, zone) in cases {
            let raw = encode(vma, slot, zone).unwrap();
            let (v, s, z) = decode(raw).unwrap();
            assert_eq!((v as u64, s as u64, z as u64), (vma, slot, zone));
        }
    }

    #[test]
    fn test_known_encoding() {
        let raw = encode(0x2, 0x3, 0x4).unwrap();
        assert_eq!(raw, SWAP_POL_EN_FLAG | (0x2 << 20) | (0x3 << 16) | 0x4);
    }

    #[test]
    fn test_overflow_rejected() {
        assert_eq!(
            encode(1 << 32, 0, 0),
            Err(ZnsError::AddressOverflow {
                field: "vma",
                value: 1 << 32
            })
        );
        assert!(matches!(
            encode(0, 16, 0),
            Err(ZnsError::AddressOverflow { field: "slot", .. })
        ));
        assert!(matches!(
            encode(0, 0, 1 << 16),
            Err(ZnsError::AddressOverflow { field: "zone", .. })
        ));
    }

    #[test]
    fn test_enabled_bit_required() {
        assert!(!is_enabled(0));
        assert_eq!(SwapPolVal::unpack(0).unwrap(), None);
        assert!(matches!(
            decode(0x1234),
            Err(ZnsError::AddressOverflow { field: "enabled", .. })
        ));

        let raw = encode(0, 0, 0).unwrap();
        assert!(is_enabled(raw));
        assert_ne!(raw, 0);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let raw = encode(5, 1, 9).unwrap() | (1 << 60);
        assert!(matches!(
            SwapPolVal::unpack(raw),
            Err(ZnsError::AddressOverflow { field: "reserved", .. })
        ));
    }

    #[test]
    fn test_sequential_flag_preserved() {
        let val = SwapPolVal::new(9, 2, 100).unwrap().with_sequential(true);
        let raw = val.pack();
        assert_ne!(raw & SWAP_POL_SEQ_FLAG, 0);

        let back = SwapPolVal::unpack(raw).unwrap().unwrap();
        assert!(back.is_sequential());
        assert_eq!(back, val);

        // The flag does not leak into the decoded fields
        assert_eq!(decode(raw).unwrap(), (9, 2, 100));
    }
}
