//! Memory layout constants for the 32-bit MIPS-style target.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0xFFFF_FFFF ┌─────────────────────────────┐
//!             │ kernel segments             │
//! 0x8000_0000 ├─────────────────────────────┤ KSEG0 / USERSTACK
//!             │ user stack reserve          │ STACK_LIMIT bytes
//!             ├─────────────────────────────┤
//!             │ mmap windows (grow down)    │
//!             │             ...             │
//!             │ heap (grows up)             │
//!             │ data / code regions         │
//! 0x0000_0000 └─────────────────────────────┘
//! ```
//!
//! `KSEG0` doubles as the base of the direct map: a physical address `p` is
//! reachable from kernel mode at kernel-virtual address `KSEG0 + p`.

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// log2([`PAGE_SIZE`]); the number of low address bits used for the in-page
/// offset.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the page-frame bits of an address (or of a packed
/// page-table entry).
pub const PAGE_FRAME: u32 = 0xFFFF_F000;

/// Base of the direct-mapped kernel segment. User-accessible virtual
/// addresses lie strictly below this boundary.
pub const KSEG0: u32 = 0x8000_0000;

/// Initial user stack pointer: the first address above user space. The stack
/// grows downward from here.
pub const USERSTACK: u32 = KSEG0;

/// Bytes reserved for the user stack at the top of user space
/// (`[USERSTACK - STACK_LIMIT, USERSTACK)`).
pub const STACK_LIMIT: u32 = 16 * PAGE_SIZE;
