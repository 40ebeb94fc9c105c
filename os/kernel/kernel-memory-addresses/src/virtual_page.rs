use crate::{PAGE_SIZE, VirtualAddress};
use core::fmt;

/// Virtual page base.
///
/// A `VirtualPage` is the **page-aligned base** of a [`PAGE_SIZE`]-byte
/// virtual page.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`](crate::PAGE_SHIFT) bits of the base are always
///   zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// The page containing `addr` (low bits truncated).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(VirtualAddress::new(addr.as_u32() & !(PAGE_SIZE - 1)))
    }

    /// Wrap an already page-aligned base address.
    ///
    /// ### Debug assertions
    /// - Asserts that `base` is page aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(base: VirtualAddress) -> Self {
        debug_assert!(base.is_page_aligned());
        Self(base)
    }

    /// The page base as a [`VirtualAddress`].
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// Combine this base with an in-page offset to form a full address.
    ///
    /// ### Debug assertions
    /// - Asserts `offset < PAGE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> VirtualAddress {
        debug_assert!(offset < PAGE_SIZE);
        VirtualAddress::new(self.0.as_u32() | offset)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.0.as_u32())
    }
}
