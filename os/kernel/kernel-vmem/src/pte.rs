//! # Page-Table Entry
//!
//! A PTE on this target is a single packed 32-bit word in the hardware
//! EntryLo layout — the TLB consumes the stored value verbatim, so the type
//! is an opaque word with accessor helpers rather than a record of fields.
//!
//! ## Layout
//!
//! ```text
//! | 31‒12 | 11 | 10 |  9  |  8  | 7‒0 |
//! |  PFN  | NC |  D |  V  |  G  |  —  |
//! ```
//!
//! - **PFN**: physical frame number (frame base >> 12).
//! - **D** ("dirty"): the hardware writability bit. A store through an entry
//!   with `D` clear raises a read-only fault; there is no separate
//!   written-to tracking.
//! - **V**: translation present and usable.
//!
//! The all-zero word means "no translation"; a valid entry is never zero
//! because `V` is set.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A packed page-table entry (hardware EntryLo word).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    #[bits(8)]
    __: u8,

    /// Global (bit 8): the TLB matches this entry regardless of ASID.
    pub global: bool,

    /// Valid (bit 9): the translation may be used by the MMU.
    pub valid: bool,

    /// Dirty (bit 10): hardware writability. Stores through a clean entry
    /// raise a read-only fault.
    pub dirty: bool,

    /// No-cache (bit 11): accesses through this page bypass the cache.
    pub no_cache: bool,

    /// Physical frame number (bits 12..31).
    #[bits(20)]
    pfn: u32,
}

impl PageTableEntry {
    /// The "no translation" value.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Whether this is the "no translation" value.
    #[inline]
    #[must_use]
    pub const fn is_absent(self) -> bool {
        self.into_bits() == 0
    }

    /// The mapped physical frame.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_base(PhysicalAddress::new(self.pfn() << 12))
    }

    /// Set the mapped frame (page-aligned base).
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage) -> Self {
        self.with_pfn(frame.base().as_u32() >> 12)
    }

    /// A valid entry mapping `frame`, writable when `writable`.
    #[inline]
    #[must_use]
    pub const fn present_with(frame: PhysicalPage, writable: bool) -> Self {
        Self::new()
            .with_valid(true)
            .with_dirty(writable)
            .with_frame(frame)
    }
}
