//! Construction of trees that are not live yet.
//!
//! Until an address space is completed nothing but the constructing code can reach its
//! table pages, so they are written directly instead of through the update queue. Every
//! table page allocated here is recorded in the space's [`OfflinePages`](crate::OfflinePages)
//! so completion can revoke write access to exactly those pages.
//!
//! These are the only page table routines that fail recoverably: running out of frames or
//! tracking slots aborts the construction, and the caller can abandon the space.

use crate::{
    AddressSpace, Error, FrameAllocator, FrameFlags, FrameNumber, Hypervisor, MachineFrameNumber,
    PAGE_SIZE, PageTableEntry, PageTableSession, Permission, Result, RootTable, Slot, TableState,
    VirtualAddress,
};

impl<H: Hypervisor, A: FrameAllocator> PageTableSession<H, A> {
    /// Allocates a table page for an offline tree, already holding `entries` valid entries.
    pub(crate) fn offline_alloc(&mut self, space: &mut AddressSpace, entries: usize) -> Result<FrameNumber> {
        space.offline.reserve()?;
        let pfn = self
            .registry
            .allocate(&mut self.allocator)
            .ok_or(Error::OutOfFrames)?;
        self.registry.mark_table(pfn, FrameFlags::TABLE_PAGE, entries);
        space.offline.push(pfn)?;
        Ok(pfn)
    }

    /// Returns the table a slot links to, creating and linking an empty one if it is free.
    fn offline_child(&mut self, space: &mut AddressSpace, slot: Slot) -> Result<FrameNumber> {
        let raw = self.read(slot);
        if !raw.is_free() {
            return Ok(self.translator.mfn_to_pfn(raw.frame()));
        }
        let child = self.offline_alloc(space, 0)?;
        let link = PageTableEntry::node(
            self.translator.pfn_to_mfn(child),
            self.geometry.link_flags(slot.level),
        );
        self.write_direct(slot, link);
        self.registry.entry_added(slot.table);
        if slot.level == self.geometry.levels
            && self.geometry.dual_root
            && slot.index < self.geometry.user_root_entries
            && let Some(user) = space.root.user
        {
            self.write_direct(Slot::new(user, slot.index, slot.level), link);
        }
        Ok(child)
    }

    fn assert_offline(&self, space: &AddressSpace) {
        assert_eq!(
            space.state,
            TableState::Offline,
            "{:?} is no longer offline",
            space.root
        );
    }

    /// Maps `vaddr` in an offline tree, creating missing tables on the way.
    ///
    /// An existing mapping is overwritten. The caller accounts for the use of `frame`.
    pub fn offline_insert(
        &mut self,
        space: &mut AddressSpace,
        vaddr: VirtualAddress,
        frame: MachineFrameNumber,
        permission: Permission,
    ) -> Result<()> {
        self.assert_offline(space);
        let addr = vaddr.as_usize();
        assert!(vaddr.is_aligned(PAGE_SIZE), "{vaddr:?} is not page aligned");
        assert!(
            self.geometry.is_user(addr),
            "{vaddr:?} is not a user address"
        );

        let mut table = space.root.kernel;
        for level in (2..=self.geometry.levels).rev() {
            let slot = Slot::new(table, self.geometry.index(addr, level), level);
            table = self.offline_child(space, slot)?;
        }

        let slot = Slot::new(table, self.geometry.index(addr, 1), 1);
        if self.read(slot).is_free() {
            self.registry.entry_added(table);
        }
        self.write_direct(slot, PageTableEntry::leaf(frame, permission, true));
        Ok(())
    }

    /// Creates every missing table above the leaves for `[from, to)`.
    pub fn offline_alloc_tree(&mut self, space: &mut AddressSpace, from: usize, to: usize) -> Result<()> {
        self.assert_offline(space);
        self.assert_user_range(from, to);
        if from == to {
            return Ok(());
        }
        let root = space.root.kernel;
        self.alloc_level(space, root, self.geometry.levels, 0, from, to, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn alloc_level(
        &mut self,
        space: &mut AddressSpace,
        table: FrameNumber,
        level: usize,
        base: usize,
        from: usize,
        to: usize,
        first: bool,
    ) -> Result<()> {
        let geometry = self.geometry;
        let start = if first { geometry.index(from, level) } else { 0 };
        for index in start..geometry.entries(level) {
            let addr = base + (index << geometry.shift(level));
            if addr >= to {
                break;
            }
            let child = self.offline_child(space, Slot::new(table, index, level))?;
            if level > 2 {
                self.alloc_level(space, child, level - 1, addr, from, to, first && index == start)?;
            }
        }
        Ok(())
    }

    /// Shares every mapped page of `[from, to)` in `source` with the offline tree `target`,
    /// at the same address plus `offset` and with `permission`.
    ///
    /// Each shared page gains one use. On failure the page being copied is released again
    /// and the pages copied so far stay mapped in `target`.
    ///
    /// # Panics
    /// Panics if a mapped frame is foreign, a table page, or not counted as in use.
    pub fn userspace_copy(
        &mut self,
        source: RootTable,
        from: usize,
        to: usize,
        target: &mut AddressSpace,
        offset: usize,
        permission: Permission,
    ) -> Result<()> {
        self.assert_user_range(from, to);
        assert!(
            offset % PAGE_SIZE == 0 && to + offset <= self.geometry.userspace_end,
            "offset {offset:#x} moves {from:#x}..{to:#x} out of user space"
        );
        for leaf in self.view().leaves(source.kernel, from, to) {
            let frame = leaf.entry.frame();
            assert!(
                !self.translator.is_foreign(leaf.entry.address()),
                "cannot share foreign {frame:?} at {:?}",
                leaf.vaddr
            );
            let pfn = self.translator.mfn_to_pfn(frame);
            let record = self.registry.frame(pfn);
            assert!(
                !record.is_table() && record.count() > 0,
                "{pfn:?} at {:?} is not a mapped user page",
                leaf.vaddr
            );

            self.registry.page_get(pfn);
            if let Err(err) = self.offline_insert(target, leaf.vaddr + offset, frame, permission) {
                self.registry.page_put(pfn);
                return Err(err);
            }
        }
        Ok(())
    }
}
