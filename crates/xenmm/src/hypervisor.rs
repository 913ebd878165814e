//! Boundary to the hypervisor and the page allocator.
//!
//! The core never issues hypercalls or manages free memory itself; it is handed
//! implementations of these traits when the session is created.

use thiserror::Error;

use crate::{FrameNumber, MachineAddress, MachineFrameNumber, RawEntry, VirtualAddress};

/// One request of a batched `mmu_update` hypercall: store `val` into the page table slot
/// at machine address `ptr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MmuUpdate {
    pub ptr: MachineAddress,
    pub val: RawEntry,
}

/// A hypercall failed; holds the negative errno the hypervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hypercall failed with error {0}")]
pub struct HypervisorError(pub i64);

/// Page table services provided by the hypervisor.
pub trait Hypervisor {
    /// Validates and applies a batch of entry updates, in order.
    fn mmu_update(&mut self, updates: &[MmuUpdate]) -> Result<(), HypervisorError>;

    /// Validates the tree rooted at `table` and pins it as a root of `level` levels.
    fn pin_table(&mut self, table: MachineFrameNumber, level: usize) -> Result<(), HypervisorError>;

    /// Releases a pin taken with [`Hypervisor::pin_table`].
    fn unpin_table(&mut self, table: MachineFrameNumber) -> Result<(), HypervisorError>;

    /// Loads the kernel root and, on 64-bit guests, the user-mode root.
    fn new_base(
        &mut self,
        kernel: MachineFrameNumber,
        user: Option<MachineFrameNumber>,
    ) -> Result<(), HypervisorError>;

    /// Invalidates the local TLB entry for one address.
    fn invalidate_page_local(&mut self, vaddr: VirtualAddress) -> Result<(), HypervisorError>;
}

/// Source of page-sized frames.
pub trait FrameAllocator {
    /// Returns a zero-filled frame, or `None` when memory is exhausted.
    fn allocate_zeroed(&mut self) -> Option<FrameNumber>;

    /// Returns a frame; it must be mapped writable again before it is handed out.
    fn free(&mut self, frame: FrameNumber);
}

/// What the domain builder tells the guest about its initial page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartInfo {
    /// Root of the boot page table, which becomes the master table.
    pub master_root: FrameNumber,
    /// Number of frames the builder used for the boot page table.
    pub boot_table_frames: usize,
    /// First frame not used by the kernel image or the boot tables.
    pub first_free_frame: FrameNumber,
    /// Frames mapped into the direct map by the builder.
    pub mapped_frames: usize,
    /// Total frames owned by the domain.
    pub total_frames: usize,
}
