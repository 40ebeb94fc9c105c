use crate::{PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// Physical memory frame base.
///
/// A `PhysicalPage` is the **page-aligned base** of a [`PAGE_SIZE`]-byte
/// physical frame. Frames are identified by this base address throughout the
/// memory subsystem, including in the external frame reference-count table.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`](crate::PAGE_SHIFT) bits of the base are always
///   zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// The frame containing `addr` (low bits truncated).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(PhysicalAddress::new(addr.as_u32() & !(PAGE_SIZE - 1)))
    }

    /// Wrap an already page-aligned frame base.
    ///
    /// ### Debug assertions
    /// - Asserts that `base` is page aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(base: PhysicalAddress) -> Self {
        debug_assert!(base.page_offset() == 0);
        Self(base)
    }

    /// The frame base as a [`PhysicalAddress`].
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// Combine this base with an in-frame offset to form a full address.
    ///
    /// ### Debug assertions
    /// - Asserts `offset < PAGE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        debug_assert!(offset < PAGE_SIZE);
        PhysicalAddress::new(self.0.as_u32() | offset)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:08X})", self.0.as_u32())
    }
}
