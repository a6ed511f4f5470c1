//! Dirty-page tracking for persistently mapped memory.
//!
//! The application is handed a shadow copy of every tracked mapping. The
//! shadow pages are protected so that the first access to each page traps;
//! the trap marks the page and lifts the protection. Flushing packages the
//! marked pages into a compact changed-data package and re-arms the guard.

mod capture;
mod changed_package;
mod fault_handler;
mod mapped_memory;
mod memory_range;
mod options;
mod page_status_array;
mod virtual_memory;

pub use capture::{FaultStats, MapOutcome, PageGuardCapture};
pub use changed_package::{
    decode_package, encode_package, package_whole_range, ChangedBlock, DecodedPackage,
    PackageError, PackageFlags, PageGuardChangedBlockInfo,
};
pub use fault_handler::{FaultCallback, FaultHandlerId, FaultTrap, HandlerWatchdog, PosixFaultTrap};
pub use mapped_memory::PageGuardMappedMemory;
pub use memory_range::{MemoryRange, MemoryRangeKey};
pub use options::{options, PageGuardOptions};
pub use page_status_array::{PageFlags, PageRange, PageStatusArray};
pub use virtual_memory::{PosixVirtualMemory, Protection, VirtualMemory};

#[cfg(test)]
pub use fault_handler::mock::MockFaultTrap;
#[cfg(test)]
pub use virtual_memory::mock::MockVirtualMemory;

/// What the faulting instruction tried to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
}
