//! # Three-Level Page Table
//!
//! This module models the sparse translation store of one address space:
//!
//! - [`L1Index`] / [`L2Index`] / [`L3Index`]: typed indices for the FLI, SLI,
//!   and TLI fields of a virtual address.
//! - [`LevelOne`] / [`LevelTwo`] / [`LevelThree`]: the page-aligned table
//!   arrays (256, 64, and 64 slots).
//! - [`PageTable`]: the root handle with the lookup/insert/strip-write/
//!   copy/free protocol.
//!
//! ## Semantics
//!
//! - The first level is allocated with the table; lower levels materialize
//!   on the first insert into their range (lazy allocation).
//! - Non-leaf slots hold the physical base of the child table, zero when
//!   absent. Leaf slots hold packed [`PageTableEntry`] words, zero when no
//!   translation exists.
//! - Table nodes live in frames obtained from the [`FrameAlloc`] and are
//!   reached through the [`PhysMapper`] direct map, like every other table
//!   frame in the kernel.
//!
//! ## Invariants & Notes
//!
//! - A second-level table exists only when at least one insert has reached
//!   its range; a third-level table may be left empty by a failed insert.
//!   Empty intermediate tables are legal and are reused.
//! - A non-zero leaf holds a frame whose external reference count is ≥ 1;
//!   a *writable* leaf (`dirty` set) references a frame with count exactly 1.
//! - After modifying entries for an active address space, the caller must
//!   perform the required TLB maintenance.

use crate::pte::PageTableEntry;
use crate::{FrameAlloc, PhysMapper, VmError};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// Number of slots in the first-level spine.
pub const LEVEL1_LIMIT: usize = 256;

/// Number of slots in each second- and third-level table.
pub const LEVEL2_AND_3_LIMIT: usize = 64;

/// Index into the first level (FLI, virtual-address bits `[31:24]`).
///
/// Strongly typed to avoid mixing with the other levels. Range is `0..256`
/// (checked in debug builds).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// Index into a second-level table (SLI, virtual-address bits `[23:18]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

/// Index into a third-level table (TLI, virtual-address bits `[17:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L3Index(u16);

impl L1Index {
    /// Extract the first-level index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 24) & 0xFF) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 256`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < LEVEL1_LIMIT as u16);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every first-level index in ascending order.
    pub(crate) fn all() -> impl Iterator<Item = Self> {
        (0..LEVEL1_LIMIT as u16).map(Self::new)
    }
}

impl L2Index {
    /// Extract the second-level index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 18) & 0x3F) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 64`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < LEVEL2_AND_3_LIMIT as u16);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every second-level index in ascending order.
    pub(crate) fn all() -> impl Iterator<Item = Self> {
        (0..LEVEL2_AND_3_LIMIT as u16).map(Self::new)
    }
}

impl L3Index {
    /// Extract the third-level index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3F) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 64`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < LEVEL2_AND_3_LIMIT as u16);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every third-level index in ascending order.
    pub(crate) fn all() -> impl Iterator<Item = Self> {
        (0..LEVEL2_AND_3_LIMIT as u16).map(Self::new)
    }
}

/// Decompose a virtual address into its three table indices.
#[inline]
#[must_use]
pub(crate) const fn split_indices(va: VirtualAddress) -> (L1Index, L2Index, L3Index) {
    (L1Index::from(va), L2Index::from(va), L3Index::from(va))
}

/// A slot in a non-leaf table: the frame base of the child table, or zero
/// when the child has not been materialized.
///
/// Physical frame zero belongs to the exception vectors on this target, so
/// zero is unambiguous as the "absent" value.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TableSlot(u32);

impl TableSlot {
    /// The "no child" value.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A slot pointing at the child table in `frame`.
    #[inline]
    #[must_use]
    pub const fn to_table(frame: PhysicalPage) -> Self {
        Self(frame.base().as_u32())
    }

    /// The child table frame, if materialized.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if self.0 == 0 {
            return None;
        }
        Some(PhysicalPage::from_base(PhysicalAddress::new(self.0)))
    }
}

/// The first-level spine: 256 child slots, page-aligned.
#[repr(C, align(4096))]
pub struct LevelOne {
    slots: [TableSlot; LEVEL1_LIMIT],
}

/// A second-level table: 64 child slots, page-aligned.
#[repr(C, align(4096))]
pub struct LevelTwo {
    slots: [TableSlot; LEVEL2_AND_3_LIMIT],
}

/// A third-level table: 64 leaf entries, page-aligned.
#[repr(C, align(4096))]
pub struct LevelThree {
    entries: [PageTableEntry; LEVEL2_AND_3_LIMIT],
}

impl LevelOne {
    /// Read the slot at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> TableSlot {
        self.slots[i.as_usize()]
    }

    /// Write the slot at `i`.
    #[inline]
    pub const fn set(&mut self, i: L1Index, slot: TableSlot) {
        self.slots[i.as_usize()] = slot;
    }
}

impl LevelTwo {
    /// Read the slot at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> TableSlot {
        self.slots[i.as_usize()]
    }

    /// Write the slot at `i`.
    #[inline]
    pub const fn set(&mut self, i: L2Index, slot: TableSlot) {
        self.slots[i.as_usize()] = slot;
    }
}

impl LevelThree {
    /// Read the entry at `i`. Plain load; no TLB synchronization implied.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: L3Index) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing
    /// entries of an active address space.
    #[inline]
    pub const fn set(&mut self, i: L3Index, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }
}

/// Map a table frame into the current address space and return a typed
/// mutable reference to it.
///
/// # Safety
/// - `frame` must hold a live table of type `T` owned by the calling page
///   table.
#[inline]
unsafe fn table_mut<'a, T, M: PhysMapper>(mapper: &M, frame: PhysicalPage) -> &'a mut T {
    unsafe { mapper.phys_to_mut::<T>(frame.base()) }
}

/// Allocate and zero one table frame.
fn alloc_table<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
) -> Result<PhysicalPage, VmError> {
    let frame = alloc.alloc_frame().ok_or(VmError::OutOfMemory)?;
    crate::zero_frame(mapper, frame);
    Ok(frame)
}

/// Handle to the three-level page table of one address space.
///
/// The table owns its node frames exclusively; mapped *data* frames are
/// shared property tracked by the external reference-count table. Dropping
/// the handle does not release anything — call [`PageTable::free`].
pub struct PageTable {
    root: PhysicalPage,
}

impl PageTable {
    /// Allocate the first-level spine with all slots empty.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the spine frame cannot be allocated.
    pub fn new<M: PhysMapper, A: FrameAlloc>(mapper: &M, alloc: &mut A) -> Result<Self, VmError> {
        let root = alloc_table(mapper, alloc)?;
        Ok(Self { root })
    }

    /// The spine frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    fn level_one<'a, M: PhysMapper>(&self, mapper: &M) -> &'a mut LevelOne {
        // Safety: `root` is the live spine frame owned by this table.
        unsafe { table_mut(mapper, self.root) }
    }

    /// The third-level table and index covering `va`, if the chain exists.
    fn leaf_for<'a, M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<(&'a mut LevelThree, L3Index)> {
        let (i1, i2, i3) = split_indices(va);
        let l2_frame = self.level_one(mapper).get(i1).next_table()?;
        // Safety: slots only ever hold frames of the matching level.
        let l2: &mut LevelTwo = unsafe { table_mut(mapper, l2_frame) };
        let l3_frame = l2.get(i2).next_table()?;
        let l3: &mut LevelThree = unsafe { table_mut(mapper, l3_frame) };
        Some((l3, i3))
    }

    /// The translation stored for `va`, or the zero entry when any level of
    /// the chain is absent. Never allocates.
    #[must_use]
    pub fn lookup<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> PageTableEntry {
        self.leaf_for(mapper, va)
            .map_or(PageTableEntry::zero(), |(l3, i3)| l3.get(i3))
    }

    /// Store `entry` for `va`, materializing absent intermediate tables.
    ///
    /// A failing call may leave freshly materialized, still-empty tables in
    /// the chain; they are legal and will be reused by the next insert into
    /// their range.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when a table frame cannot be allocated.
    pub fn insert<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        va: VirtualAddress,
        entry: PageTableEntry,
    ) -> Result<(), VmError> {
        let (i1, i2, i3) = split_indices(va);

        let l1 = self.level_one(mapper);
        let l2_frame = match l1.get(i1).next_table() {
            Some(frame) => frame,
            None => {
                let frame = alloc_table(mapper, alloc)?;
                l1.set(i1, TableSlot::to_table(frame));
                frame
            }
        };

        // Safety: slots only ever hold frames of the matching level.
        let l2: &mut LevelTwo = unsafe { table_mut(mapper, l2_frame) };
        let l3_frame = match l2.get(i2).next_table() {
            Some(frame) => frame,
            None => {
                let frame = alloc_table(mapper, alloc)?;
                l2.set(i2, TableSlot::to_table(frame));
                frame
            }
        };

        let l3: &mut LevelThree = unsafe { table_mut(mapper, l3_frame) };
        l3.set(i3, entry);
        Ok(())
    }

    /// Clear the writable bit on the entry for `va`. No-op when the chain or
    /// the entry is absent.
    pub fn strip_write<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) {
        if let Some((l3, i3)) = self.leaf_for(mapper, va) {
            let entry = l3.get(i3);
            if !entry.is_absent() {
                l3.set(i3, entry.with_dirty(false));
            }
        }
    }

    /// Fork-time copy: rebuild the tree shape in `dst`, sharing every mapped
    /// frame read-only.
    ///
    /// For each non-zero leaf the writable bit is cleared *in the source* —
    /// so the next store from either side takes the read-only fault path —
    /// then the now-clean entry is copied verbatim and the referenced frame
    /// gains one reference.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when a table frame for `dst` cannot be
    /// allocated. `dst` stays consistent: frames shared before the failure
    /// keep their extra reference and are released when `dst` is freed.
    pub fn copy_into<M: PhysMapper, A: FrameAlloc>(
        &self,
        mapper: &M,
        alloc: &mut A,
        dst: &Self,
    ) -> Result<(), VmError> {
        let src_l1 = self.level_one(mapper);
        let dst_l1 = dst.level_one(mapper);

        for i1 in L1Index::all() {
            let Some(src_l2_frame) = src_l1.get(i1).next_table() else {
                continue;
            };
            let dst_l2_frame = alloc_table(mapper, alloc)?;
            dst_l1.set(i1, TableSlot::to_table(dst_l2_frame));

            // Safety: slots only ever hold frames of the matching level.
            let src_l2: &mut LevelTwo = unsafe { table_mut(mapper, src_l2_frame) };
            let dst_l2: &mut LevelTwo = unsafe { table_mut(mapper, dst_l2_frame) };

            for i2 in L2Index::all() {
                let Some(src_l3_frame) = src_l2.get(i2).next_table() else {
                    continue;
                };
                let dst_l3_frame = alloc_table(mapper, alloc)?;
                dst_l2.set(i2, TableSlot::to_table(dst_l3_frame));

                let src_l3: &mut LevelThree = unsafe { table_mut(mapper, src_l3_frame) };
                let dst_l3: &mut LevelThree = unsafe { table_mut(mapper, dst_l3_frame) };

                for i3 in L3Index::all() {
                    let entry = src_l3.get(i3);
                    if entry.is_absent() {
                        continue;
                    }
                    let shared = entry.with_dirty(false);
                    src_l3.set(i3, shared);
                    dst_l3.set(i3, shared);
                    alloc.retain_frame(shared.frame());
                }
            }
        }

        Ok(())
    }

    /// Release every mapped frame through the allocator, then the table
    /// frames themselves, consuming the handle.
    pub fn free<M: PhysMapper, A: FrameAlloc>(self, mapper: &M, alloc: &mut A) {
        let l1 = self.level_one(mapper);

        for i1 in L1Index::all() {
            let Some(l2_frame) = l1.get(i1).next_table() else {
                continue;
            };
            // Safety: slots only ever hold frames of the matching level.
            let l2: &mut LevelTwo = unsafe { table_mut(mapper, l2_frame) };

            for i2 in L2Index::all() {
                let Some(l3_frame) = l2.get(i2).next_table() else {
                    continue;
                };
                let l3: &mut LevelThree = unsafe { table_mut(mapper, l3_frame) };

                for i3 in L3Index::all() {
                    let entry = l3.get(i3);
                    if !entry.is_absent() {
                        alloc.free_frame(entry.frame());
                    }
                }
                alloc.free_frame(l3_frame);
            }
            alloc.free_frame(l2_frame);
        }
        alloc.free_frame(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::PageTableEntry;
    use crate::testing::{TestFrameAlloc, TestRam};

    fn fixture(frames: usize) -> (TestRam, TestFrameAlloc) {
        (TestRam::with_frames(frames), TestFrameAlloc::with_capacity(frames))
    }

    #[test]
    fn insert_then_lookup() {
        let (ram, mut alloc) = fixture(16);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");

        let va = VirtualAddress::new(0x0040_2000);
        let frame = alloc.alloc_frame().unwrap();
        let entry = PageTableEntry::present_with(frame, true);
        table.insert(&ram, &mut alloc, va, entry).expect("insert");

        assert_eq!(table.lookup(&ram, va), entry);
        // Neighboring pages stay unmapped.
        assert!(table.lookup(&ram, VirtualAddress::new(0x0040_3000)).is_absent());
    }

    #[test]
    fn lookup_never_allocates() {
        let (ram, mut alloc) = fixture(8);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");
        let before = alloc.live_frames();

        assert!(table.lookup(&ram, VirtualAddress::new(0x7000_0000)).is_absent());
        assert_eq!(alloc.live_frames(), before);
    }

    #[test]
    fn intermediate_tables_materialize_lazily() {
        let (ram, mut alloc) = fixture(16);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");
        assert_eq!(alloc.live_frames(), 1); // just the spine

        let frame = alloc.alloc_frame().unwrap();
        table
            .insert(&ram, &mut alloc, VirtualAddress::new(0x0001_0000), PageTableEntry::present_with(frame, true))
            .expect("insert");
        // Spine + L2 + L3 + the data frame.
        assert_eq!(alloc.live_frames(), 4);

        // A second insert in the same 256 KiB range reuses both tables.
        let frame2 = alloc.alloc_frame().unwrap();
        table
            .insert(&ram, &mut alloc, VirtualAddress::new(0x0001_1000), PageTableEntry::present_with(frame2, true))
            .expect("insert");
        assert_eq!(alloc.live_frames(), 5);
    }

    #[test]
    fn strip_write_clears_only_the_writable_bit() {
        let (ram, mut alloc) = fixture(16);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");

        let va = VirtualAddress::new(0x0040_0000);
        let frame = alloc.alloc_frame().unwrap();
        table
            .insert(&ram, &mut alloc, va, PageTableEntry::present_with(frame, true))
            .expect("insert");

        table.strip_write(&ram, va);
        let entry = table.lookup(&ram, va);
        assert!(entry.valid());
        assert!(!entry.dirty());
        assert_eq!(entry.frame(), frame);

        // Stripping an unmapped address is a no-op.
        table.strip_write(&ram, VirtualAddress::new(0x0050_0000));
        assert!(table.lookup(&ram, VirtualAddress::new(0x0050_0000)).is_absent());
    }

    #[test]
    fn copy_shares_frames_and_strips_write() {
        let (ram, mut alloc) = fixture(32);
        let src = PageTable::new(&ram, &mut alloc).expect("spine");
        let va = VirtualAddress::new(0x0040_1000);
        let frame = alloc.alloc_frame().unwrap();
        src.insert(&ram, &mut alloc, va, PageTableEntry::present_with(frame, true))
            .expect("insert");

        let dst = PageTable::new(&ram, &mut alloc).expect("spine");
        src.copy_into(&ram, &mut alloc, &dst).expect("copy");

        let src_entry = src.lookup(&ram, va);
        let dst_entry = dst.lookup(&ram, va);
        assert_eq!(src_entry, dst_entry);
        assert_eq!(src_entry.frame(), frame);
        assert!(!src_entry.dirty());
        assert!(!dst_entry.dirty());
        assert_eq!(alloc.frame_refs(frame), 2);
    }

    #[test]
    fn copy_oom_rolls_back_cleanly() {
        // Room for src spine + L2 + L3 + data + dst spine, nothing more: the
        // copy fails while rebuilding the tree shape.
        let (ram, mut alloc) = fixture(5);
        let src = PageTable::new(&ram, &mut alloc).expect("spine");
        let frame = alloc.alloc_frame().unwrap();
        src.insert(&ram, &mut alloc, VirtualAddress::new(0x1000), PageTableEntry::present_with(frame, true))
            .expect("insert");

        let dst = PageTable::new(&ram, &mut alloc).expect("spine");
        assert_eq!(src.copy_into(&ram, &mut alloc, &dst), Err(VmError::OutOfMemory));

        // Freeing both tables releases every frame, shared or not.
        dst.free(&ram, &mut alloc);
        src.free(&ram, &mut alloc);
        assert_eq!(alloc.live_frames(), 0);
    }

    #[test]
    fn insert_oom_leaves_reusable_chain() {
        // Spine, two data frames, and the second level fit; the third-level
        // allocation fails.
        let ram = TestRam::with_frames(8);
        let mut alloc = TestFrameAlloc::with_capacity(4);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");
        let frame = alloc.alloc_frame().unwrap();
        let hog = alloc.alloc_frame().unwrap();
        let va = VirtualAddress::new(0x0002_0000);
        let entry = PageTableEntry::present_with(frame, true);

        assert_eq!(table.insert(&ram, &mut alloc, va, entry), Err(VmError::OutOfMemory));
        assert!(table.lookup(&ram, va).is_absent());

        // Once a frame frees up, the empty second level is reused.
        alloc.free_frame(hog);
        table.insert(&ram, &mut alloc, va, entry).expect("insert");
        assert_eq!(table.lookup(&ram, va), entry);
    }

    #[test]
    fn free_releases_every_frame() {
        let (ram, mut alloc) = fixture(32);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");

        // Two leaves in distinct first-level ranges.
        for va in [0x0040_0000_u32, 0x7100_0000] {
            let frame = alloc.alloc_frame().unwrap();
            table
                .insert(&ram, &mut alloc, VirtualAddress::new(va), PageTableEntry::present_with(frame, true))
                .expect("insert");
        }
        assert!(alloc.live_frames() > 1);

        table.free(&ram, &mut alloc);
        assert_eq!(alloc.live_frames(), 0);
    }

    #[test]
    fn distinct_pages_map_distinct_entries() {
        let (ram, mut alloc) = fixture(32);
        let table = PageTable::new(&ram, &mut alloc).expect("spine");

        // Same L3 slot index in different L2 ranges must not collide.
        let a = VirtualAddress::new(0x0001_2000);
        let b = VirtualAddress::new(0x0005_2000);
        let fa = alloc.alloc_frame().unwrap();
        let fb = alloc.alloc_frame().unwrap();
        table.insert(&ram, &mut alloc, a, PageTableEntry::present_with(fa, true)).unwrap();
        table.insert(&ram, &mut alloc, b, PageTableEntry::present_with(fb, true)).unwrap();

        assert_eq!(table.lookup(&ram, a).frame(), fa);
        assert_eq!(table.lookup(&ram, b).frame(), fb);
    }
}
