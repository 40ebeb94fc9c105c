//! # Kernel Configuration
//!
//! This crate is the authoritative source for system-wide layout constants
//! shared by the kernel's memory subsystems. Centralizing them here keeps the
//! paging, fault-handling, and loader crates in agreement and prevents
//! configuration drift.
//!
//! ## Memory Layout ([`memory`])
//!
//! Establishes the virtual memory architecture of the 32-bit MIPS-style
//! target:
//! * **Address Space Split**: user space below `KSEG0`, the direct-mapped
//!   kernel segment above it.
//! * **Page Granularity**: 4 KiB pages throughout; no huge pages.
//! * **Stack Reserve**: a fixed window at the top of user space for the
//!   initial user stack.

#![no_std]

pub mod memory;
