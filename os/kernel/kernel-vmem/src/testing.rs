//! Shared hosted-test fixtures.
//!
//! We simulate physical memory as a vector of 4 KiB-aligned frames starting
//! at [`RAM_BASE`]; physical addresses are byte offsets into that window.
//! The allocator tracks per-frame reference counts the way the real frame
//! table does, the TLB records every slot and asserts that all hardware
//! access happens under raised interrupt priority, and files are plain byte
//! vectors keyed by descriptor.

use crate::tlb::{InterruptLevel, NUM_TLB, TLBLO_INVALID, TlbHardware, tlbhi_invalid};
use crate::{FileBacking, FrameAlloc, PAGE_BYTES, PhysMapper, info};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// Base physical address of the simulated RAM window. Non-zero so that the
/// "absent" encodings of table slots and PTEs never collide with a real
/// frame.
pub const RAM_BASE: u32 = 0x0010_0000;

/// A 4 KiB-aligned raw frame. Backing store for the simulated RAM.
#[repr(align(4096))]
struct Aligned4K([u8; PAGE_BYTES]);

/// A tiny in-memory "physical RAM" with a direct-map style mapper over it.
pub struct TestRam {
    frames: Vec<Aligned4K>,
}

impl TestRam {
    pub fn with_frames(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Aligned4K([0; PAGE_BYTES]));
        }
        Self { frames }
    }

    fn frame_ptr(&self, index: usize) -> *mut u8 {
        core::ptr::from_ref(&self.frames[index]).cast_mut().cast()
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Table and data access always starts at a frame base.
        debug_assert_eq!(pa.page_offset(), 0);
        let index = ((pa.as_u32() - RAM_BASE) >> 12) as usize;
        // Safety: the caller promises `T` matches the bytes in the frame.
        unsafe { &mut *self.frame_ptr(index).cast::<T>() }
    }
}

/// Reference-counting frame allocator over the simulated RAM window.
///
/// Fresh frames come back with a count of 1; freeing decrements and reuses
/// the slot at zero. The capacity bounds allocation so tests can provoke
/// out-of-memory deterministically.
pub struct TestFrameAlloc {
    refs: Vec<u32>,
}

impl TestFrameAlloc {
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            refs: vec![0; frames],
        }
    }

    /// Shrink the allocator to `frames` slots (for OOM injection).
    pub fn limit_capacity(&mut self, frames: usize) {
        self.refs.truncate(frames);
    }

    /// Number of frames with a non-zero reference count.
    pub fn live_frames(&self) -> usize {
        self.refs.iter().filter(|&&count| count > 0).count()
    }

    fn index(frame: PhysicalPage) -> usize {
        ((frame.base().as_u32() - RAM_BASE) >> 12) as usize
    }
}

impl FrameAlloc for TestFrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalPage> {
        let index = self.refs.iter().position(|&count| count == 0)?;
        self.refs[index] = 1;
        let base = RAM_BASE + (index as u32) * info::PAGE_SIZE;
        Some(PhysicalPage::from_base(PhysicalAddress::new(base)))
    }

    fn free_frame(&mut self, frame: PhysicalPage) {
        let index = Self::index(frame);
        assert!(self.refs[index] > 0, "freeing a frame with no references");
        self.refs[index] -= 1;
    }

    fn retain_frame(&mut self, frame: PhysicalPage) {
        let index = Self::index(frame);
        assert!(self.refs[index] > 0, "retaining a dead frame");
        self.refs[index] += 1;
    }

    fn frame_refs(&self, frame: PhysicalPage) -> u32 {
        self.refs[Self::index(frame)]
    }
}

/// A recording TLB that panics on any hardware access at base interrupt
/// priority.
pub struct TestTlb {
    entries: [(u32, u32); NUM_TLB],
    next_random: usize,
    level: u32,
}

impl TestTlb {
    pub fn new() -> Self {
        Self {
            entries: [(0, 0); NUM_TLB],
            next_random: 0,
            level: 0,
        }
    }

    /// The recorded slots as `(entry_hi, entry_lo)` pairs.
    pub fn entries(&self) -> &[(u32, u32); NUM_TLB] {
        &self.entries
    }

    /// The `entry_lo` stored for `entry_hi`, if any slot holds it.
    pub fn entry_for(&self, entry_hi: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|(hi, _)| *hi == entry_hi)
            .map(|&(_, lo)| lo)
    }

    /// Whether every slot carries its per-slot invalid encoding.
    pub fn all_invalid(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(slot, &(hi, lo))| hi == tlbhi_invalid(slot) && lo == TLBLO_INVALID)
    }

    /// The current interrupt priority depth (0 = base level).
    pub fn level(&self) -> u32 {
        self.level
    }
}

impl TlbHardware for TestTlb {
    fn tlb_write(&mut self, entry_hi: u32, entry_lo: u32, slot: usize) {
        assert!(self.level > 0, "TLB write at base interrupt priority");
        self.entries[slot] = (entry_hi, entry_lo);
    }

    fn tlb_random(&mut self, entry_hi: u32, entry_lo: u32) {
        assert!(self.level > 0, "TLB write at base interrupt priority");
        let slot = self.next_random % NUM_TLB;
        self.next_random += 1;
        self.entries[slot] = (entry_hi, entry_lo);
    }

    fn splhigh(&mut self) -> InterruptLevel {
        let previous = self.level;
        self.level += 1;
        InterruptLevel(previous)
    }

    fn splx(&mut self, level: InterruptLevel) {
        self.level = level.0;
    }
}

/// Byte-vector file backing keyed by descriptor.
#[derive(Default)]
pub struct TestFiles {
    files: BTreeMap<i32, Vec<u8>>,
}

impl TestFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: i32, data: Vec<u8>) {
        self.files.insert(fd, data);
    }
}

impl FileBacking for TestFiles {
    fn read_at(&mut self, fd: i32, offset: i64, buf: &mut [u8]) -> Option<usize> {
        let data = self.files.get(&fd)?;
        let offset = usize::try_from(offset).ok()?;
        if offset >= data.len() {
            return Some(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Some(count)
    }
}
