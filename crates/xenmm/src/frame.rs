use bitflags::bitflags;

use crate::VirtualAddress;

/// Holds bookkeeping for one pseudo-physical frame.
///
/// The meaning of `count` depends on what the frame is used for. On an intermediate table
/// page it is the number of valid entries, so an empty table can be reclaimed. On an
/// ordinary page it is the number of mappings, i.e. the degree of sharing. Roots are not
/// counted: they live exactly as long as their address space.
#[derive(Debug, Default)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    count: usize,
    vaddr: Option<VirtualAddress>,
}

impl Frame {
    /// Returns the use count of this frame.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the virtual address this frame was last mapped at.
    pub fn vaddr(&self) -> Option<VirtualAddress> {
        self.vaddr
    }

    /// Returns true if the frame takes part in a page table tree.
    pub fn is_table(&self) -> bool {
        self.flags
            .intersects(FrameFlags::ROOT_TABLE | FrameFlags::TABLE_PAGE)
    }

    pub(crate) fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    pub(crate) fn increment(&mut self) {
        self.count += 1;
    }

    /// Decrements the count and returns the new value.
    ///
    /// # Panics
    /// Panics on underflow.
    pub(crate) fn decrement(&mut self) -> usize {
        assert!(self.count > 0, "frame count underflow");
        self.count -= 1;
        self.count
    }

    pub(crate) fn set_vaddr(&mut self, vaddr: Option<VirtualAddress>) {
        self.vaddr = vaddr;
    }
}

bitflags! {
    /// Page table related state of a frame.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// The hypervisor has validated and pinned this frame as a root.
        const PINNED = 1 << 0;
        /// The frame is the root (or shadow root) of a tree.
        const ROOT_TABLE = 1 << 1;
        /// The frame is an intermediate or leaf table page.
        const TABLE_PAGE = 1 << 2;
    }
}
