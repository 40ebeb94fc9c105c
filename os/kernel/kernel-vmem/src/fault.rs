//! # Fault Handler
//!
//! Entry point for the three MMU fault causes on this software-managed-TLB
//! target. The CPU traps with a fault kind and the faulting virtual address;
//! everything else — which range the address belongs to, whether a
//! translation already exists, who owns the frame — is resolved here.
//!
//! The three kinds map onto two resolution regimes:
//!
//! - **Translation presence** (READ/WRITE miss): the page table already has
//!   an entry → refill the TLB; otherwise the page is unmapped-but-valid
//!   inside a region, the heap, or a file mapping → allocate, populate,
//!   insert, refill.
//! - **Ownership** (READONLY): the entry exists but is not writable. Either
//!   the region really is read-only (a true violation), or the frame is
//!   shared after a fork and the store privatizes it via copy-on-write.
//!
//! After successful handling the faulting page always has a valid entry
//! whose writable bit matches the owning range's writability.

use crate::address_space::AddressSpace;
use crate::pte::PageTableEntry;
use crate::tlb::{self, TLBHI_VPAGE, TlbHardware};
use crate::{
    FileBacking, FrameAlloc, PAGE_BYTES, PhysMapper, VmError, copy_frame, info, zero_frame,
};
use kernel_memory_addresses::VirtualAddress;
use log::trace;

/// The three MMU fault causes delivered to the VM subsystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// Store through a translation without the writable bit.
    ReadOnly,
    /// Load with no matching translation.
    Read,
    /// Store with no matching translation.
    Write,
}

/// Where a fault address landed, carrying what the refill path needs.
#[derive(Debug, Copy, Clone)]
enum FaultSite {
    /// Inside a defined code/data region.
    Region { writable: bool, readonly: bool },
    /// Inside the heap `[base, break)`.
    Heap,
    /// Inside a file mapping: the window base plus file coordinates.
    Mapped {
        base: VirtualAddress,
        fd: i32,
        offset: i64,
    },
}

impl FaultSite {
    /// Whether a freshly installed entry for this site is writable.
    const fn writable(self) -> bool {
        match self {
            Self::Region { writable, .. } => writable,
            // Heap pages are read/write; mapped frames are per-process
            // private in this design.
            Self::Heap | Self::Mapped { .. } => true,
        }
    }
}

/// Handle an MMU fault at `fault_address` in the current address space.
///
/// `aspace` is `None` when no process — or no address space — is installed,
/// which happens for kernel faults early in boot; those are rejected
/// outright rather than looping, as is any fault address inside the kernel
/// segment.
///
/// # Errors
/// - [`VmError::BadAddress`]: no address space, kernel-segment address,
///   address outside every mapped range, store to a genuinely read-only
///   region, or a file read that returned nothing for a mapped page.
/// - [`VmError::Invalid`]: read-only fault with no existing translation.
/// - [`VmError::OutOfMemory`]: frame or table allocation failed.
pub fn vm_fault<M, A, T, F>(
    aspace: Option<&AddressSpace<'_, M>>,
    alloc: &mut A,
    files: &mut F,
    tlb: &mut T,
    kind: FaultKind,
    fault_address: VirtualAddress,
) -> Result<(), VmError>
where
    M: PhysMapper,
    A: FrameAlloc,
    T: TlbHardware,
    F: FileBacking,
{
    let Some(aspace) = aspace else {
        return Err(VmError::BadAddress);
    };
    if fault_address.as_u32() >= info::KSEG0 {
        return Err(VmError::BadAddress);
    }

    let site = classify(aspace, fault_address).ok_or(VmError::BadAddress)?;

    match kind {
        FaultKind::ReadOnly => {
            if let FaultSite::Region { readonly: true, .. } = site {
                // A true permission violation, not a shared frame.
                return Err(VmError::BadAddress);
            }
            // Shared after fork: privatize, then fall through so the fresh
            // entry lands in the TLB without another fault.
            copy_on_write(aspace, alloc, tlb, fault_address)?;
        }
        FaultKind::Write if !site.writable() => {
            return Err(VmError::BadAddress);
        }
        FaultKind::Read | FaultKind::Write => {}
    }

    refill(aspace, alloc, files, tlb, site, fault_address)
}

/// Classify a user address against regions, heap, and file mappings.
fn classify<M: PhysMapper>(aspace: &AddressSpace<'_, M>, va: VirtualAddress) -> Option<FaultSite> {
    if let Some(region) = aspace.regions().lookup(va) {
        return Some(FaultSite::Region {
            writable: region.permissions().write,
            readonly: region.is_readonly(),
        });
    }
    if aspace.heap().contains(va) {
        return Some(FaultSite::Heap);
    }
    aspace.mappings().lookup(va).map(|mapping| FaultSite::Mapped {
        base: mapping.base(),
        fd: mapping.fd(),
        offset: mapping.offset(),
    })
}

/// EntryHi for a fault address: its virtual page number bits.
const fn entry_hi(va: VirtualAddress) -> u32 {
    va.as_u32() & TLBHI_VPAGE
}

/// The TLB-miss path: load an existing translation, or demand-allocate the
/// page and install one.
fn refill<M, A, T, F>(
    aspace: &AddressSpace<'_, M>,
    alloc: &mut A,
    files: &mut F,
    tlb: &mut T,
    site: FaultSite,
    fault_address: VirtualAddress,
) -> Result<(), VmError>
where
    M: PhysMapper,
    A: FrameAlloc,
    T: TlbHardware,
    F: FileBacking,
{
    let mapper = aspace.mapper();
    let existing = aspace.page_table().lookup(mapper, fault_address);
    if !existing.is_absent() {
        tlb::load_random(tlb, entry_hi(fault_address), existing.into_bits());
        return Ok(());
    }

    // Unmapped but valid: back the page with a zeroed frame, populated from
    // the file for mapped windows.
    let frame = alloc.alloc_frame().ok_or(VmError::OutOfMemory)?;
    zero_frame(mapper, frame);

    if let FaultSite::Mapped { base, fd, offset } = site {
        let page_delta = i64::from(fault_address.page().base().as_u32() - base.as_u32());
        // Safety: freshly allocated frame, exclusively ours.
        let buf = unsafe { mapper.phys_to_mut::<[u8; PAGE_BYTES]>(frame.base()) };
        // A short read leaves the zeroed tail in place; an empty or failed
        // read for a page the mapping says exists is a hard error.
        match files.read_at(fd, offset + page_delta, buf) {
            Some(read) if read > 0 => {}
            _ => {
                alloc.free_frame(frame);
                return Err(VmError::BadAddress);
            }
        }
    }

    let entry = PageTableEntry::present_with(frame, site.writable());
    if let Err(err) = aspace
        .page_table()
        .insert(mapper, alloc, fault_address, entry)
    {
        alloc.free_frame(frame);
        return Err(err);
    }

    trace!("demand-mapped {fault_address} -> {:?}", entry.frame());
    tlb::load_random(tlb, entry_hi(fault_address), entry.into_bits());
    Ok(())
}

/// Privatize the shared frame behind `fault_address`.
///
/// With a reference count of 1 this address space is the sole owner and the
/// entry is promoted to writable in place. Otherwise the page contents move
/// to a fresh frame, the old frame loses one reference, and the new entry is
/// writable from the start. Either way the TLB is flushed so the stale
/// read-only translation cannot be honored on retry.
fn copy_on_write<M, A, T>(
    aspace: &AddressSpace<'_, M>,
    alloc: &mut A,
    tlb: &mut T,
    fault_address: VirtualAddress,
) -> Result<(), VmError>
where
    M: PhysMapper,
    A: FrameAlloc,
    T: TlbHardware,
{
    let mapper = aspace.mapper();
    let table = aspace.page_table();

    let entry = table.lookup(mapper, fault_address);
    if entry.is_absent() {
        return Err(VmError::Invalid);
    }

    let shared = entry.frame();
    if alloc.frame_refs(shared) == 1 {
        // Sole owner: promote the existing mapping in place.
        table.insert(
            mapper,
            alloc,
            fault_address,
            PageTableEntry::present_with(shared, true),
        )?;
    } else {
        let private = alloc.alloc_frame().ok_or(VmError::OutOfMemory)?;
        copy_frame(mapper, shared, private);
        // Release this address space's claim on the shared frame.
        alloc.free_frame(shared);
        table.insert(
            mapper,
            alloc,
            fault_address,
            PageTableEntry::present_with(private, true),
        )?;
    }

    trace!("copy-on-write resolved at {fault_address}");
    aspace.activate(tlb);
    Ok(())
}
