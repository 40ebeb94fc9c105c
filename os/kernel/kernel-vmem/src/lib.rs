//! # Virtual Memory Support
//!
//! The per-process virtual-memory subsystem for a 32-bit MIPS-style CPU with
//! a software-refilled TLB.
//!
//! ## What you get
//! - An [`AddressSpace`] owning the regions, heap, file mappings, and page
//!   table of one process, with fork/activate/destroy lifecycle.
//! - A sparse three-level [`PageTable`] storing packed [`PageTableEntry`]
//!   words the hardware TLB consumes verbatim.
//! - The [`vm_fault`] dispatcher: TLB refill, demand allocation, and
//!   copy-on-write after fork.
//! - A guarded [`tlb`] driver (flush-all, random-slot load) over the
//!   hardware seam.
//! - Tiny allocator/mapper/file interfaces ([`FrameAlloc`], [`PhysMapper`],
//!   [`FileBacking`]) connecting the core to the rest of the kernel.
//!
//! ## Virtual Address → Physical Frame Walk
//!
//! Each 32-bit user virtual address is divided into four fields:
//!
//! ```text
//! | 31‒24 | 23‒18 | 17‒12 | 11‒0   |
//! |  FLI  |  SLI  |  TLI  | Offset |
//! ```
//!
//! The three index fields select entries in three levels of tables:
//!
//! | Level | Entries | Role |
//! |:------|:--------|:-----|
//! | 1 | 256 | Spine, allocated with the address space; each slot points to a second-level table. |
//! | 2 | 64 | On demand; each slot points to a third-level table. |
//! | 3 | 64 | Leaves: packed PTEs (`frame \| DIRTY \| VALID`). |
//!
//! Second- and third-level tables materialize lazily on the first insert
//! into their range, so the memory footprint tracks the used address-space
//! volume rather than the 4 GiB range. The final offset field selects the
//! byte inside the 4 KiB page.
//!
//! There is no hardware walker: on a TLB miss the CPU traps, [`vm_fault`]
//! resolves the address against the owning address space, and the resulting
//! entry is loaded into a random TLB slot.
//!
//! ## Concurrency
//!
//! Single CPU, preemptive kernel threads. TLB access is bracketed by raised
//! interrupt priority, the heap break is guarded by its own lock, and frame
//! reference counts are owned by the external allocator. Cross-CPU shootdown
//! is not supported ([`tlb::tlb_shootdown`] panics).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod error;
mod fault;
mod heap;
mod mmap;
mod page_table;
mod pte;
mod region;
pub mod tlb;

#[cfg(test)]
mod testing;

pub use crate::address_space::AddressSpace;
pub use crate::error::VmError;
pub use crate::fault::{FaultKind, vm_fault};
pub use crate::heap::Heap;
pub use crate::mmap::{MmapList, MmapRegion};
pub use crate::page_table::{LEVEL1_LIMIT, LEVEL2_AND_3_LIMIT, PageTable};
pub use crate::pte::PageTableEntry;
pub use crate::region::{Permissions, Region, RegionList};
pub use crate::tlb::TlbHardware;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// Re-export layout constants as info module.
pub use kernel_info::memory as info;

/// [`info::PAGE_SIZE`] as a buffer length.
pub(crate) const PAGE_BYTES: usize = info::PAGE_SIZE as usize;

/// Page-granular physical frame allocator with an external per-frame
/// reference-count table.
///
/// The implementation decides where frames come from; returned frames are
/// page aligned and start with a reference count of 1. The allocator is the
/// single writer of reference counts: the VM core only asks for increments
/// (fork-time sharing) and decrements (through the standard free path).
pub trait FrameAlloc {
    /// Allocate one frame. Returns `None` on out-of-memory.
    fn alloc_frame(&mut self) -> Option<PhysicalPage>;

    /// Drop one reference to `frame`, freeing it once the count reaches
    /// zero.
    fn free_frame(&mut self, frame: PhysicalPage);

    /// Add one reference to `frame`.
    fn retain_frame(&mut self, frame: PhysicalPage);

    /// Current reference count of `frame`.
    fn frame_refs(&self, frame: PhysicalPage) -> u32;
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space.
///
/// On the real machine this is the direct-mapped kernel segment: physical
/// address `p` is visible at kernel-virtual `KSEG0 + p`, so the conversion
/// is pure arithmetic. Hosted tests map a vector of frames instead.
///
/// # Safety
/// - `pa` must refer to mapped, writable physical memory for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Kernel-buffer file reads for demand-paging file mappings.
pub trait FileBacking {
    /// Read up to `buf.len()` bytes from `fd` starting at byte `offset`.
    ///
    /// Returns the number of bytes read (0 at or past end of file), or
    /// `None` on an I/O failure.
    fn read_at(&mut self, fd: i32, offset: i64, buf: &mut [u8]) -> Option<usize>;
}

/// Fill one frame with zeroes through the direct map.
pub(crate) fn zero_frame<M: PhysMapper>(mapper: &M, frame: PhysicalPage) {
    // Safety: the caller owns `frame`; the mapper yields a writable view of
    // exactly one page.
    let bytes = unsafe { mapper.phys_to_mut::<[u8; PAGE_BYTES]>(frame.base()) };
    bytes.fill(0);
}

/// Copy one frame's contents into another through the direct map.
pub(crate) fn copy_frame<M: PhysMapper>(mapper: &M, src: PhysicalPage, dst: PhysicalPage) {
    debug_assert!(src != dst);
    // Safety: distinct frames, so the two views cannot alias.
    let src = unsafe { mapper.phys_to_mut::<[u8; PAGE_BYTES]>(src.base()) };
    let dst = unsafe { mapper.phys_to_mut::<[u8; PAGE_BYTES]>(dst.base()) };
    dst.copy_from_slice(src);
}

/// Boot-time initialization hook for the VM subsystem.
///
/// All state is per-address-space and the TLB starts flushed, so there is
/// nothing global to set up.
pub const fn vm_bootstrap() {}
