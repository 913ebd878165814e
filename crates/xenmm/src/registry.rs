//! Per-frame bookkeeping.
//!
//! The registry is an arena of [`Frame`] records indexed by pseudo-physical frame number.
//! Counters are only ever changed through methods that assert their invariants, so a
//! double free or an unbalanced decrement stops the kernel at the point of the bug.

use alloc::boxed::Box;

use crate::{Frame, FrameAllocator, FrameFlags, FrameNumber, VirtualAddress};

/// Bookkeeping for every frame owned by the domain.
pub struct FrameRegistry {
    frames: Box<[Frame]>,
}

impl FrameRegistry {
    /// Creates a registry for `frame_count` frames, all unused.
    pub fn new(frame_count: usize) -> Self {
        Self {
            frames: (0..frame_count).map(|_| Frame::default()).collect(),
        }
    }

    /// Returns the number of frames tracked.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns the record of a frame.
    ///
    /// # Panics
    /// Panics if the frame is not owned by the domain.
    pub fn frame(&self, pfn: FrameNumber) -> &Frame {
        &self.frames[pfn.as_usize()]
    }

    fn frame_mut(&mut self, pfn: FrameNumber) -> &mut Frame {
        &mut self.frames[pfn.as_usize()]
    }

    /// Takes a zeroed frame from the allocator.
    ///
    /// # Panics
    /// Panics if the allocator hands out a frame that is still in use.
    pub fn allocate<A: FrameAllocator + ?Sized>(&mut self, allocator: &mut A) -> Option<FrameNumber> {
        let pfn = allocator.allocate_zeroed()?;
        assert!(self.is_unused(pfn), "allocator returned {pfn:?} while in use");
        Some(pfn)
    }

    /// Returns a frame to the allocator.
    ///
    /// # Panics
    /// Panics if the frame is still counted or flagged as part of a page table.
    pub fn free<A: FrameAllocator + ?Sized>(&mut self, allocator: &mut A, pfn: FrameNumber) {
        let frame = self.frame_mut(pfn);
        assert!(
            frame.count() == 0 && frame.flags.is_empty(),
            "freeing {pfn:?} while in use ({:?}, count {})",
            frame.flags,
            frame.count()
        );
        frame.set_vaddr(None);
        allocator.free(pfn);
    }

    /// Records the virtual address a frame is mapped at.
    pub fn map(&mut self, pfn: FrameNumber, vaddr: VirtualAddress) {
        self.frame_mut(pfn).set_vaddr(Some(vaddr));
    }

    /// Forgets the virtual address of a frame.
    pub fn unmap(&mut self, pfn: FrameNumber) {
        self.frame_mut(pfn).set_vaddr(None);
    }

    /// Counts one more mapping of an ordinary page.
    ///
    /// Must be called before the page is linked into any tree that will later release it.
    pub fn page_get(&mut self, pfn: FrameNumber) {
        let frame = self.frame_mut(pfn);
        assert!(!frame.is_table(), "{pfn:?} is a page table page");
        frame.increment();
    }

    /// Drops one mapping of an ordinary page and returns the remaining count.
    pub fn page_put(&mut self, pfn: FrameNumber) -> usize {
        let frame = self.frame_mut(pfn);
        assert!(!frame.is_table(), "{pfn:?} is a page table page");
        frame.decrement()
    }

    /// Drops one mapping of a user page and frees it once nothing maps it.
    ///
    /// Returns true if the frame went back to the allocator.
    pub fn release_user_page<A: FrameAllocator + ?Sized>(
        &mut self,
        allocator: &mut A,
        pfn: FrameNumber,
    ) -> bool {
        if self.page_put(pfn) > 0 {
            return false;
        }
        self.unmap(pfn);
        self.free(allocator, pfn);
        true
    }

    /// Counts a new valid entry in a table page. Roots are not counted.
    pub fn entry_added(&mut self, table: FrameNumber) {
        let frame = self.frame_mut(table);
        if frame.flags.contains(FrameFlags::TABLE_PAGE) {
            frame.increment();
        } else {
            assert!(
                frame.flags.contains(FrameFlags::ROOT_TABLE),
                "{table:?} is not a page table page"
            );
        }
    }

    /// Counts a cleared entry in a table page and returns the remaining count.
    pub fn entry_removed(&mut self, table: FrameNumber) -> usize {
        let frame = self.frame_mut(table);
        if frame.flags.contains(FrameFlags::TABLE_PAGE) {
            frame.decrement()
        } else {
            assert!(
                frame.flags.contains(FrameFlags::ROOT_TABLE),
                "{table:?} is not a page table page"
            );
            0
        }
    }

    /// Tests whether all of `flags` are set on a frame.
    pub fn test(&self, pfn: FrameNumber, flags: FrameFlags) -> bool {
        self.frame(pfn).flags.contains(flags)
    }

    /// Sets `flags` on a frame.
    pub fn set(&mut self, pfn: FrameNumber, flags: FrameFlags) {
        self.frame_mut(pfn).flags.insert(flags);
    }

    /// Clears `flags` on a frame.
    pub fn clear(&mut self, pfn: FrameNumber, flags: FrameFlags) {
        self.frame_mut(pfn).flags.remove(flags);
    }

    /// Returns true if nothing references the frame.
    pub fn is_unused(&self, pfn: FrameNumber) -> bool {
        let frame = self.frame(pfn);
        !frame.is_table() && frame.count() == 0
    }

    /// Returns true if an ordinary page is mapped more than once.
    pub fn is_shared(&self, pfn: FrameNumber) -> bool {
        let frame = self.frame(pfn);
        assert!(!frame.is_table(), "{pfn:?} is a page table page");
        frame.count() > 1
    }

    /// Turns an unused frame into a table page or root holding `entries` valid entries.
    pub(crate) fn mark_table(&mut self, pfn: FrameNumber, flags: FrameFlags, entries: usize) {
        assert!(self.is_unused(pfn), "{pfn:?} is already in use");
        let frame = self.frame_mut(pfn);
        frame.flags.insert(flags);
        if flags.contains(FrameFlags::TABLE_PAGE) {
            frame.set_count(entries);
        }
    }

    /// Releases a frame from page table duty regardless of how many entries it still holds.
    ///
    /// Used when a whole table is discarded at once, either because it was never activated
    /// or because its entries refer only to tables owned elsewhere.
    pub(crate) fn retire_table(&mut self, pfn: FrameNumber) {
        let frame = self.frame_mut(pfn);
        assert!(
            !frame.flags.contains(FrameFlags::PINNED),
            "{pfn:?} is still pinned"
        );
        frame.flags = FrameFlags::empty();
        frame.set_count(0);
    }
}
