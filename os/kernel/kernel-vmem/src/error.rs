/// Error kinds surfaced by the VM entry points.
///
/// The syscall layer translates these into user-visible codes; inside the
/// subsystem they are the whole error vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The address is not backed by any region, heap range, or file mapping,
    /// lies in the kernel segment, or no address space is installed.
    #[error("address outside any mapped user range")]
    BadAddress,

    /// Overlapping or inconsistent arguments: region overlap, a break below
    /// the heap base, copy-on-write with no existing translation.
    #[error("invalid argument or inconsistent mapping state")]
    Invalid,

    /// Attempted redefinition of an already-mapped range.
    #[error("the requested range is already mapped")]
    AddressInUse,

    /// A frame or table allocation could not be satisfied.
    #[error("out of physical memory")]
    OutOfMemory,
}
