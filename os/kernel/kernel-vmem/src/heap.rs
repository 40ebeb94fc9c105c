//! # Process Heap
//!
//! One growable range per address space, sitting between the loader-defined
//! data regions and the file-mapping windows. The heap has no existence
//! until the first break call anchors it at the end of the last defined data
//! region; from then on `[base, break)` is demand-zero memory with fixed
//! read/write permissions.
//!
//! Break arithmetic is serialized by a per-heap lock: threads of one process
//! share the address space, and the adjustment must read and write the break
//! atomically. No I/O happens under the lock.

use crate::{VmError, info};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinMutex;

/// The mutable part of the heap record, guarded by the break lock.
///
/// Both addresses are zero until the first break call anchors the heap.
#[derive(Debug, Copy, Clone)]
struct Break {
    base: VirtualAddress,
    brk: VirtualAddress,
}

impl Break {
    const fn is_unanchored(&self) -> bool {
        self.base.as_u32() == 0 && self.brk.as_u32() == 0
    }
}

/// The per-address-space heap record.
pub struct Heap {
    state: SpinMutex<Break>,
}

impl Heap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(Break {
                base: VirtualAddress::zero(),
                brk: VirtualAddress::zero(),
            }),
        }
    }

    /// Adjust the break by `amount` bytes (`sbrk` semantics).
    ///
    /// The first call ignores `amount`: it anchors base and break at
    /// `anchor` — the end of the last defined data region — and returns the
    /// base. Every later call returns the *previous* break and moves the
    /// break by `amount`, so `set_break(0)` reads the break without
    /// mutation.
    ///
    /// # Errors
    /// - [`VmError::Invalid`] on the first call when nothing anchors the
    ///   heap, or when the new break would fall below the base.
    /// - [`VmError::OutOfMemory`] when the new break would reach the stack
    ///   reserve.
    pub fn set_break(
        &self,
        anchor: Option<VirtualAddress>,
        amount: i32,
    ) -> Result<VirtualAddress, VmError> {
        // The guard releases on every path out of this function.
        let mut state = self.state.lock();

        if state.is_unanchored() {
            let base = anchor.ok_or(VmError::Invalid)?;
            state.base = base;
            state.brk = base;
            return Ok(base);
        }

        let new_break = i64::from(state.brk.as_u32()) + i64::from(amount);
        if new_break < i64::from(state.base.as_u32()) {
            return Err(VmError::Invalid);
        }
        if new_break >= i64::from(info::USERSTACK - info::STACK_LIMIT) {
            return Err(VmError::OutOfMemory);
        }

        let previous = state.brk;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            state.brk = VirtualAddress::new(new_break as u32);
        }
        Ok(previous)
    }

    /// Whether `va` lies inside `[base, break)`. Always false while the heap
    /// is unanchored.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        let state = self.state.lock();
        state.base <= va && va < state.brk
    }

    /// Current `(base, break)`, or `None` while unanchored.
    #[must_use]
    pub fn extents(&self) -> Option<(VirtualAddress, VirtualAddress)> {
        let state = self.state.lock();
        if state.is_unanchored() {
            return None;
        }
        Some((state.base, state.brk))
    }

    /// A new record with the same extents and a fresh lock (fork).
    #[must_use]
    pub(crate) fn duplicate(&self) -> Self {
        let state = self.state.lock();
        Self {
            state: SpinMutex::new(*state),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANCHOR: u32 = 0x0041_2000;

    fn anchored() -> Heap {
        let heap = Heap::new();
        heap.set_break(Some(VirtualAddress::new(ANCHOR)), 0)
            .expect("anchor");
        heap
    }

    #[test]
    fn first_break_anchors_and_returns_base() {
        let heap = Heap::new();
        let base = heap
            .set_break(Some(VirtualAddress::new(ANCHOR)), 12345)
            .expect("anchor");
        assert_eq!(base.as_u32(), ANCHOR);
        // The first call's amount is ignored.
        assert_eq!(heap.extents().unwrap(), (base, base));
    }

    #[test]
    fn first_break_without_regions_is_invalid() {
        let heap = Heap::new();
        assert_eq!(heap.set_break(None, 0), Err(VmError::Invalid));
    }

    #[test]
    fn grow_and_shrink_round_trip() {
        let heap = anchored();

        let prev = heap.set_break(None, 0x3000).expect("grow");
        assert_eq!(prev.as_u32(), ANCHOR);

        let prev = heap.set_break(None, -0x3000).expect("shrink");
        assert_eq!(prev.as_u32(), ANCHOR + 0x3000);
        assert_eq!(heap.extents().unwrap().1.as_u32(), ANCHOR);
    }

    #[test]
    fn zero_adjustment_reads_the_break() {
        let heap = anchored();
        heap.set_break(None, 0x2000).expect("grow");

        let brk = heap.set_break(None, 0).expect("read");
        assert_eq!(brk.as_u32(), ANCHOR + 0x2000);
        assert_eq!(heap.extents().unwrap().1, brk);
    }

    #[test]
    fn break_below_base_is_invalid() {
        let heap = anchored();
        assert_eq!(heap.set_break(None, -0x1000), Err(VmError::Invalid));
        // State unchanged.
        assert_eq!(heap.extents().unwrap().1.as_u32(), ANCHOR);
    }

    #[test]
    fn break_into_stack_reserve_is_out_of_memory() {
        let heap = anchored();
        let room = info::USERSTACK - info::STACK_LIMIT - ANCHOR;
        #[allow(clippy::cast_possible_wrap)]
        let too_much = room as i32;
        assert_eq!(heap.set_break(None, too_much), Err(VmError::OutOfMemory));

        // One byte less fits.
        heap.set_break(None, too_much - 1).expect("grow to the brim");
    }

    #[test]
    fn contains_is_half_open_and_needs_an_anchor() {
        let heap = Heap::new();
        assert!(!heap.contains(VirtualAddress::new(ANCHOR)));

        let heap = anchored();
        heap.set_break(None, 0x1000).expect("grow");
        assert!(heap.contains(VirtualAddress::new(ANCHOR)));
        assert!(heap.contains(VirtualAddress::new(ANCHOR + 0xFFF)));
        assert!(!heap.contains(VirtualAddress::new(ANCHOR + 0x1000)));
    }

    #[test]
    fn duplicate_carries_extents() {
        let heap = anchored();
        heap.set_break(None, 0x2000).expect("grow");

        let copy = heap.duplicate();
        assert_eq!(copy.extents(), heap.extents());

        // Independent afterwards.
        copy.set_break(None, 0x1000).expect("grow copy");
        assert_ne!(copy.extents(), heap.extents());
    }
}
