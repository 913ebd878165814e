//! Software emulation of a Xen PV domain for testing and development.
//!
//! This module lets the page table core run on any host. It is a "scale model" of a
//! real domain:
//! - A word-addressed machine memory indexed by machine frame number
//! - A guest-owned physical-to-machine table that is deliberately not the identity, so
//!   code that confuses the two address spaces reads the wrong frame
//! - A block of foreign frames at the bottom of machine memory that belong to no guest
//! - A hypervisor that applies batched updates and enforces the read-only rules of pinned
//!   page tables the way Xen does
//! - A domain builder that lays out the boot page table with a direct map of guest memory

mod builder;
mod hypervisor;

pub use builder::{Domain, DomainBuilder, EmulatedFrameAllocator};
pub use hypervisor::{Hypercall, SoftHypervisor};

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{MachineFrameNumber, arch};

/// Number of machine frames that are owned by some other domain.
///
/// They occupy machine frames `0..FOREIGN_FRAMES` and have no pseudo-physical frame.
pub const FOREIGN_FRAMES: usize = 8;

/// Emulated machine memory plus the two frame translation tables.
///
/// Memory is stored as 64-bit words so table pages can be read and written entry by
/// entry. Words are atomics only so the machine can be shared between the translator,
/// the hypervisor and the allocator; the emulation is single-threaded.
pub struct EmulatedMachine {
    memory: Box<[AtomicU64]>,
    phys_to_machine: Box<[usize]>,
    machine_to_phys: Box<[usize]>,
}

impl EmulatedMachine {
    /// Creates a machine with `frames` guest frames and [`FOREIGN_FRAMES`] foreign ones.
    ///
    /// Guest frame `pfn` lives in machine frame `FOREIGN_FRAMES + frames - 1 - pfn`.
    pub fn new(frames: usize) -> Self {
        let machine_frames = FOREIGN_FRAMES + frames;
        let phys_to_machine: Box<[usize]> = (0..frames)
            .map(|pfn| FOREIGN_FRAMES + frames - 1 - pfn)
            .collect();
        let mut machine_to_phys = alloc::vec![arch::INVALID_M2P_ENTRY; machine_frames];
        for (pfn, &mfn) in phys_to_machine.iter().enumerate() {
            machine_to_phys[mfn] = pfn;
        }

        Self {
            memory: (0..machine_frames * arch::ENTRIES_PER_PAGE)
                .map(|_| AtomicU64::new(0))
                .collect(),
            phys_to_machine,
            machine_to_phys: machine_to_phys.into_boxed_slice(),
        }
    }

    /// Returns the number of guest frames.
    pub fn frames(&self) -> usize {
        self.phys_to_machine.len()
    }

    /// Returns the physical-to-machine table.
    pub fn phys_to_machine(&self) -> &[usize] {
        &self.phys_to_machine
    }

    /// Returns the machine-to-physical table.
    pub fn machine_to_phys(&self) -> &[usize] {
        &self.machine_to_phys
    }

    fn word(&self, mfn: MachineFrameNumber, index: usize) -> &AtomicU64 {
        assert!(index < arch::ENTRIES_PER_PAGE, "word index {index} out of bounds");
        &self.memory[mfn.as_usize() * arch::ENTRIES_PER_PAGE + index]
    }

    /// Reads word `index` of a machine frame.
    pub fn read(&self, mfn: MachineFrameNumber, index: usize) -> u64 {
        self.word(mfn, index).load(Ordering::Relaxed)
    }

    /// Writes word `index` of a machine frame.
    pub fn write(&self, mfn: MachineFrameNumber, index: usize, value: u64) {
        self.word(mfn, index).store(value, Ordering::Relaxed)
    }

    /// Fills a machine frame with zeros.
    pub fn zero(&self, mfn: MachineFrameNumber) {
        for index in 0..arch::ENTRIES_PER_PAGE {
            self.write(mfn, index, 0);
        }
    }
}
