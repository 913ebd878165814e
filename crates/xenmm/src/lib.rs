#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Xen Memory Manager (xenmm)
//!
//! The Xen Memory Manager is the page table core of a paravirtualized Xen guest kernel.
//! The hypervisor, not the guest, decides which frames may be written as page table
//! pages, so every structural change to a live table is batched and submitted for
//! validation instead of being stored directly. It provides:
//!
//! - Translation between virtual, pseudo-physical, machine and frame-number addresses.
//! - A 3-level (PAE) or 4-level (x86_64) page table walker and mutator.
//! - A deferred queue of hypervisor-validated page table updates.
//! - Per-frame bookkeeping of page table pages and sharing counts.
//! - Construction, completion, activation and teardown of address spaces.
//! - Software emulation of a Xen domain for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod diagnostics;
mod entry;
mod error;
mod frame;
mod hypervisor;
mod numbers;
mod offline;
mod page_directory;
mod permission;
mod queue;
mod registry;
mod session;
mod table;

pub use address::{AddressTranslator, MachineAddress, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, OfflinePages, RootTable, TableState};
pub use diagnostics::{TableStatistics, WalkStep};
pub use entry::PageTableEntry;
pub use error::{Error, Result};
pub use frame::{Frame, FrameFlags};
pub use hypervisor::{FrameAllocator, Hypervisor, HypervisorError, MmuUpdate, StartInfo};
pub use numbers::{FrameNumber, MachineFrameNumber, PageNumber};
pub use permission::Permission;
pub use queue::{ActiveBase, InvalidateHook, QUEUE_CAPACITY, UpdateQueue};
pub use registry::FrameRegistry;
pub use session::{PageTableSession, SessionCell, SessionConfig};
pub use table::{Leaf, Slot, TableView};

pub use arch::{
    Geometry, INVALID_M2P_ENTRY, MAX_LEVELS, MAX_OFFLINE_PAGES, PAGE_SHIFT, PAGE_SIZE, PteFlags,
    RawEntry,
};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::software;
