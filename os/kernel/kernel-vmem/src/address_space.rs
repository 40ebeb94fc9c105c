//! # Address Space
//!
//! The per-process envelope owning the page table, the region list, the
//! heap record, and the file-mapping list.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new`] / [`AddressSpace::destroy`] for the lifecycle.
//! - [`AddressSpace::fork`] to duplicate for a child: bookkeeping is deep
//!   copied, mapped frames are shared read-only behind reference counts.
//! - [`AddressSpace::activate`] / [`AddressSpace::deactivate`] flush the
//!   whole TLB around context switches.
//! - [`AddressSpace::define_region`], the [`AddressSpace::prepare_load`] /
//!   [`AddressSpace::complete_load`] write-latch window, and
//!   [`AddressSpace::define_stack`] for the program loader.
//! - [`AddressSpace::set_break`] (sbrk) and [`AddressSpace::mmap_file`] for
//!   the memory syscalls.
//!
//! ## Design
//!
//! - The struct holds the [`PhysMapper`] handle; frame and table allocation
//!   arrives as a `&mut impl FrameAlloc` per call, so the caller decides
//!   which allocator backs each operation.
//! - Ownership is a pure tree: regions and mappings are owned containers,
//!   the page table owns its node frames, and shared *data* frames are
//!   reference-counted by the external allocator — never by pointer.
//! - Teardown order is fixed: regions, mappings, page table (which releases
//!   frames), heap record, envelope.

use crate::heap::Heap;
use crate::mmap::{MmapList, MmapRegion};
use crate::page_table::PageTable;
use crate::region::{Permissions, RegionList};
use crate::tlb::{self, TlbHardware};
use crate::{FrameAlloc, PhysMapper, VmError, info};
use kernel_memory_addresses::VirtualAddress;
use log::{trace, warn};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    mapper: &'m M,
    page_table: PageTable,
    regions: RegionList,
    heap: Heap,
    mmap: MmapList,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Create an empty address space: a fresh page-table spine, no regions,
    /// an unanchored heap, no file mappings.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] when the spine frame cannot be allocated.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, VmError> {
        let page_table = PageTable::new(mapper, alloc)
            .inspect_err(|err| warn!("address space creation failed: {err}"))?;
        Ok(Self {
            mapper,
            page_table,
            regions: RegionList::new(),
            heap: Heap::new(),
            mmap: MmapList::new(),
        })
    }

    /// Duplicate this address space for a child process.
    ///
    /// Regions, heap extents, and file mappings are deep copies (the heap
    /// lock is fresh). Mapped frames are shared read-only with their
    /// reference counts bumped, so the first store from either side takes
    /// the read-only fault path and privatizes the page.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; the partially built copy is torn down
    /// before returning.
    pub fn fork<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmError> {
        let mut child = Self::new(self.mapper, alloc)?;
        child.regions = self.regions.clone();
        child.heap = self.heap.duplicate();
        child.mmap = self.mmap.clone();

        if let Err(err) = self.page_table.copy_into(self.mapper, alloc, &child.page_table) {
            warn!("fork failed: {err}");
            child.destroy(alloc);
            return Err(err);
        }

        trace!("forked address space");
        Ok(child)
    }

    /// Tear the address space down: region and mapping bookkeeping first,
    /// then the page table (which releases every mapped frame), then the
    /// heap record.
    ///
    /// The address space must not be the one currently installed in the
    /// MMU; [`deactivate`](Self::deactivate) it first.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let Self {
            mapper,
            page_table,
            regions,
            heap,
            mmap,
        } = self;
        drop(regions);
        drop(mmap);
        page_table.free(mapper, alloc);
        drop(heap);
    }

    /// Install this address space as the current one.
    ///
    /// The whole TLB is flushed under raised interrupt priority, so no
    /// translation of the previously active space survives.
    pub fn activate<T: TlbHardware>(&self, tlb: &mut T) {
        tlb::flush_all(tlb);
    }

    /// Make this address space invisible to the MMU, e.g. ahead of
    /// [`destroy`](Self::destroy). Equivalent to a full TLB flush.
    pub fn deactivate<T: TlbHardware>(&self, tlb: &mut T) {
        self.activate(tlb);
    }

    /// Define the segment `[vaddr, vaddr + size)` with `perms`; see
    /// [`RegionList::define`].
    ///
    /// # Errors
    /// See [`RegionList::define`].
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: u32,
        perms: Permissions,
    ) -> Result<(), VmError> {
        self.regions.define(vaddr, size, perms)
    }

    /// Make the initially read-only regions writable while the program
    /// loader populates them.
    pub fn prepare_load(&mut self) {
        for region in self.regions.iter_mut() {
            if region.is_readonly() {
                region.set_write(true);
            }
        }
    }

    /// Re-latch the read-only regions once loading is done.
    ///
    /// Write permission is withdrawn and the entry covering each latched
    /// region's base page loses its writable bit. Pages the loader touched
    /// beyond the base are re-protected lazily: their still-writable
    /// entries get rewritten the next time the region's read-only fault
    /// path runs. Ends with a full TLB flush so no writable translation
    /// lingers.
    pub fn complete_load<T: TlbHardware>(&mut self, tlb: &mut T) {
        for region in self.regions.iter_mut() {
            if region.is_readonly() {
                region.set_write(false);
                self.page_table.strip_write(self.mapper, region.base());
            }
        }
        self.activate(tlb);
    }

    /// Materialize the stack reserve at the top of user space and return
    /// the initial stack pointer.
    ///
    /// # Errors
    /// Propagated from the region definition.
    pub fn define_stack(&mut self) -> Result<VirtualAddress, VmError> {
        let base = VirtualAddress::new(info::USERSTACK - info::STACK_LIMIT);
        self.regions
            .define(base, info::STACK_LIMIT, Permissions::read_write())?;
        Ok(VirtualAddress::new(info::USERSTACK))
    }

    /// Adjust the heap break by `amount` bytes (`sbrk` semantics); see
    /// [`Heap::set_break`].
    ///
    /// # Errors
    /// See [`Heap::set_break`].
    pub fn set_break(&self, amount: i32) -> Result<VirtualAddress, VmError> {
        self.heap.set_break(self.regions.heap_anchor(), amount)
    }

    /// Map `length` bytes of `fd` starting at `offset` into a fresh window.
    ///
    /// The window is carved from the top of user space downward: starting
    /// just below the lowest existing mapping (or the stack reserve), the
    /// candidate slides down by the page-rounded length until it overlaps
    /// neither regions, heap, nor other mappings. Frames and file contents
    /// are not loaded here — every page is demand-paged at first touch.
    ///
    /// # Errors
    /// - [`VmError::Invalid`] for a zero or unroundable length.
    /// - [`VmError::BadAddress`] when no window fits above address zero.
    pub fn mmap_file(
        &mut self,
        length: u32,
        prot: Permissions,
        fd: i32,
        offset: i64,
    ) -> Result<VirtualAddress, VmError> {
        if length == 0 {
            return Err(VmError::Invalid);
        }
        let length = length
            .checked_next_multiple_of(info::PAGE_SIZE)
            .ok_or(VmError::Invalid)?;

        let mut end = self
            .mmap
            .lowest_base()
            .unwrap_or(VirtualAddress::new(info::USERSTACK - info::STACK_LIMIT));

        let base = loop {
            let Some(base) = end.as_u32().checked_sub(length) else {
                // Slid off the bottom of the address space.
                return Err(VmError::BadAddress);
            };
            let base = VirtualAddress::new(base);
            if self.window_is_free(base, end) {
                break base;
            }
            // Slide the window down by the requested length and retry.
            end = base;
        };

        self.mmap
            .push(MmapRegion::new(base, length, fd, offset, prot));
        trace!("mapped {length} file bytes at {base}");
        Ok(base)
    }

    fn window_is_free(&self, base: VirtualAddress, end: VirtualAddress) -> bool {
        if self.regions.overlaps(base, end) || self.mmap.overlaps(base, end) {
            return false;
        }
        match self.heap.extents() {
            Some((heap_base, heap_break)) => !(base < heap_break && end > heap_base),
            None => true,
        }
    }

    /// The shared direct-map handle.
    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// The translation store.
    #[inline]
    #[must_use]
    pub const fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// The defined code/data regions.
    #[inline]
    #[must_use]
    pub const fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// The heap record.
    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The file mappings.
    #[inline]
    #[must_use]
    pub const fn mappings(&self) -> &MmapList {
        &self.mmap
    }
}
