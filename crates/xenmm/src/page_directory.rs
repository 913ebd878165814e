//! Mutation of live page tables.
//!
//! A live table is pinned, so its pages are read-only to the guest and every store goes
//! through the update queue. New table pages are the exception: while they are not yet
//! linked they are private and filled directly, then made read-only and linked in the same
//! batch, child before parent.

use alloc::vec::Vec;
use core::ops::Range;

use crate::{
    FrameAllocator, FrameFlags, FrameNumber, Hypervisor, MachineFrameNumber, PAGE_SIZE,
    PageTableEntry, PageTableSession, Permission, PhysicalAddress, PteFlags, RootTable, Slot,
    VirtualAddress,
};

/// State of a [`PageTableSession::free_subtree`] walk.
struct Teardown {
    root: RootTable,
    start: usize,
    end: usize,
    /// Ordinary pages whose mapping was removed.
    pages: Vec<FrameNumber>,
    /// Table pages unlinked from the tree.
    tables: Vec<FrameNumber>,
}

impl<H: Hypervisor, A: FrameAllocator> PageTableSession<H, A> {
    /// Returns the leaf protections for `permission` at `vaddr`.
    ///
    /// Kernel mappings keep the kernel protections and only honor the write bit.
    pub(crate) fn leaf_flags(&self, vaddr: usize, permission: Permission) -> PteFlags {
        if self.geometry.is_user(vaddr) {
            permission.leaf_flags(true)
        } else {
            let mut flags = self.geometry.kernel_leaf_flags;
            flags.set(PteFlags::WRITABLE, permission.contains(Permission::WRITE));
            flags
        }
    }

    /// Builds the leaf mapping `frame` at `vaddr`.
    pub(crate) fn leaf_entry(
        &self,
        vaddr: usize,
        frame: MachineFrameNumber,
        permission: Permission,
    ) -> PageTableEntry {
        PageTableEntry::Leaf {
            frame,
            permission,
            flags: self.leaf_flags(vaddr, permission),
        }
    }

    pub(crate) fn assert_user_range(&self, start: usize, end: usize) {
        assert!(
            start <= end && end <= self.geometry.userspace_end,
            "{start:#x}..{end:#x} is not a user space range"
        );
        assert!(
            start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0,
            "{start:#x}..{end:#x} is not page aligned"
        );
    }

    /// Returns true if a root entry must be kept identical in the shadow user root.
    fn is_mirrored(&self, slot: Slot) -> bool {
        self.geometry.dual_root
            && slot.level == self.geometry.levels
            && slot.index < self.geometry.user_root_entries
    }

    /// Queues the shadow-root copy of a root entry.
    pub(crate) fn mirror(&mut self, root: RootTable, slot: Slot, value: PageTableEntry) {
        if !self.is_mirrored(slot) {
            return;
        }
        if let Some(user) = root.user {
            self.enqueue(Slot::new(user, slot.index, slot.level), value);
        }
    }

    fn set_direct_map_writable(&mut self, pfn: FrameNumber, writable: bool) {
        let vaddr = self.translator.pfn_to_virt(pfn);
        let Some(slot) = self.view().get(self.master.kernel, vaddr) else {
            log::trace!("{pfn:?} is not in the direct map");
            return;
        };
        let raw = self.read(slot);
        let value = if writable {
            raw.union(PteFlags::WRITABLE)
        } else {
            raw.difference(PteFlags::WRITABLE)
        };
        if value != raw {
            self.enqueue(slot, value);
        }
    }

    /// Queues removal of write access to a frame's direct mapping.
    pub(crate) fn revoke_write(&mut self, pfn: FrameNumber) {
        self.set_direct_map_writable(pfn, false);
    }

    /// Queues restoration of write access to a frame's direct mapping.
    ///
    /// The frame must already be unlinked from every table, or be unlinked earlier in the
    /// same batch.
    pub(crate) fn restore_write(&mut self, pfn: FrameNumber) {
        self.set_direct_map_writable(pfn, true);
    }

    fn invalidate(&mut self, vaddr: VirtualAddress) {
        self.queue.invalidate(&mut self.hypervisor, vaddr);
    }

    fn mapped_slot(&self, root: RootTable, vaddr: VirtualAddress) -> Slot {
        let Some(slot) = self.view().get(root.kernel, vaddr) else {
            panic!("{vaddr:?} is not mapped");
        };
        slot
    }

    /// Maps `vaddr` to `frame`, creating any missing tables on the way.
    ///
    /// # Panics
    /// Panics if `vaddr` is already mapped, or if no frame is left for a table page.
    pub fn insert(
        &mut self,
        root: RootTable,
        vaddr: VirtualAddress,
        frame: MachineFrameNumber,
        permission: Permission,
    ) {
        self.insert_entry(root, vaddr, frame, permission);
        self.flush();
    }

    /// Maps each `(pfn, vaddr)` pair, committing as few batches as possible.
    pub fn insert_batch(
        &mut self,
        root: RootTable,
        pages: &[(FrameNumber, VirtualAddress)],
        permission: Permission,
    ) {
        for &(pfn, vaddr) in pages {
            let frame = self.translator.pfn_to_mfn(pfn);
            // Later walks must see the new tables.
            if self.insert_entry(root, vaddr, frame, permission) {
                self.flush();
            }
        }
        self.flush();
    }

    /// Queues the updates for one insert. Returns true if table pages were created.
    pub(crate) fn insert_entry(
        &mut self,
        root: RootTable,
        vaddr: VirtualAddress,
        frame: MachineFrameNumber,
        permission: Permission,
    ) -> bool {
        assert!(vaddr.is_aligned(PAGE_SIZE), "{vaddr:?} is not page aligned");
        let addr = vaddr.as_usize();
        let leaf = self.leaf_entry(addr, frame, permission);

        let mut table = root.kernel;
        for level in (2..=self.geometry.levels).rev() {
            let slot = Slot::new(table, self.geometry.index(addr, level), level);
            let raw = self.read(slot);
            if raw.is_free() {
                self.link_new_path(root, slot, addr, leaf);
                return true;
            }
            table = self.translator.mfn_to_pfn(raw.frame());
        }

        let slot = Slot::new(table, self.geometry.index(addr, 1), 1);
        let raw = self.read(slot);
        assert!(raw.is_free(), "{vaddr:?} is already mapped ({raw:?})");
        self.enqueue(slot, leaf);
        self.registry.entry_added(table);
        false
    }

    /// Builds the tables below the free `slot` bottom-up and links them in.
    fn link_new_path(&mut self, root: RootTable, slot: Slot, addr: usize, leaf: PageTableEntry) {
        // A queued direct mapping of the frame we are about to allocate would escape the
        // revoke below.
        if !self.queue.is_empty() {
            self.flush();
        }
        let geometry = self.geometry;
        let mut value = leaf;
        for level in 1..slot.level {
            let Some(table) = self.registry.allocate(&mut self.allocator) else {
                log::error!("no frame for a level {level} table mapping {addr:#x}");
                panic!("out of frames for page table pages");
            };
            self.registry.mark_table(table, FrameFlags::TABLE_PAGE, 1);
            self.write_direct(Slot::new(table, geometry.index(addr, level), level), value);
            self.revoke_write(table);
            value = PageTableEntry::node(
                self.translator.pfn_to_mfn(table),
                geometry.link_flags(level + 1),
            );
        }
        self.enqueue(slot, value);
        self.registry.entry_added(slot.table);
        self.mirror(root, slot, value);
    }

    /// Points an existing mapping at another frame.
    ///
    /// # Panics
    /// Panics if `vaddr` is not mapped.
    pub fn replace(
        &mut self,
        root: RootTable,
        vaddr: VirtualAddress,
        frame: MachineFrameNumber,
        permission: Permission,
    ) {
        let slot = self.mapped_slot(root, vaddr);
        let leaf = self.leaf_entry(vaddr.as_usize(), frame, permission);
        self.enqueue(slot, leaf);
        self.flush();
        self.invalidate(vaddr);
    }

    /// Unmaps `vaddr` and returns the frame it mapped. Tables are left in place.
    ///
    /// # Panics
    /// Panics if `vaddr` is not mapped.
    pub fn remove(&mut self, root: RootTable, vaddr: VirtualAddress) -> MachineFrameNumber {
        let slot = self.mapped_slot(root, vaddr);
        let frame = self.read(slot).frame();
        self.enqueue(slot, PageTableEntry::Free);
        self.registry.entry_removed(slot.table);
        self.flush();
        self.invalidate(vaddr);
        frame
    }

    /// Changes the permission of one mapping, keeping its frame.
    ///
    /// # Panics
    /// Panics if `vaddr` is not mapped.
    pub fn update_permission(
        &mut self,
        root: RootTable,
        vaddr: VirtualAddress,
        permission: Permission,
    ) {
        let slot = self.mapped_slot(root, vaddr);
        let flags = self.leaf_flags(vaddr.as_usize(), permission);
        let value = self.read(slot).with_flags(flags);
        self.enqueue(slot, value);
        self.flush();
        self.invalidate(vaddr);
    }

    /// Sets the permission of every mapping in `[start, end)` and returns how many changed.
    pub fn protect_range(
        &mut self,
        root: RootTable,
        start: usize,
        end: usize,
        permission: Permission,
    ) -> usize {
        self.assert_user_range(start, end);
        let flags = permission.leaf_flags(true);
        let mut changed = Vec::new();
        for leaf in self.view().leaves(root.kernel, start, end) {
            let value = leaf.entry.with_flags(flags);
            if value != leaf.entry {
                self.enqueue(leaf.slot, value);
                changed.push(leaf.vaddr);
            }
        }
        self.flush();
        for &vaddr in &changed {
            self.invalidate(vaddr);
        }
        changed.len()
    }

    /// Unmaps everything in `[start, end)` and frees the tables that become empty.
    ///
    /// Each mapped page loses one use and returns to the allocator once unused. Table pages
    /// are unlinked from their parent before their direct mapping becomes writable again,
    /// and are freed only after the batch has been committed.
    pub fn free_subtree(&mut self, root: RootTable, start: usize, end: usize) {
        self.assert_user_range(start, end);
        let mut teardown = Teardown {
            root,
            start,
            end,
            pages: Vec::new(),
            tables: Vec::new(),
        };
        if start < end {
            self.free_level(&mut teardown, root.kernel, self.geometry.levels, 0, true);
        }
        self.flush();

        log::debug!(
            "freed {start:#x}..{end:#x}: {} pages, {} tables",
            teardown.pages.len(),
            teardown.tables.len()
        );
        for table in teardown.tables {
            self.registry.retire_table(table);
            self.registry.free(&mut self.allocator, table);
        }
        for pfn in teardown.pages {
            self.registry.release_user_page(&mut self.allocator, pfn);
        }
    }

    fn free_level(
        &mut self,
        teardown: &mut Teardown,
        table: FrameNumber,
        level: usize,
        base: usize,
        first: bool,
    ) {
        let geometry = self.geometry;
        let start = if first {
            geometry.index(teardown.start, level)
        } else {
            0
        };
        for index in start..geometry.entries(level) {
            let addr = base + (index << geometry.shift(level));
            if addr >= teardown.end {
                break;
            }
            let slot = Slot::new(table, index, level);
            let raw = self.read(slot);
            if raw.is_free() {
                continue;
            }

            if level == 1 {
                self.enqueue(slot, PageTableEntry::Free);
                self.registry.entry_removed(table);
                if self.translator.is_foreign(raw.address()) {
                    log::debug!("unmapped foreign frame {:?} at {addr:#x}", raw.frame());
                } else {
                    teardown.pages.push(self.translator.mfn_to_pfn(raw.frame()));
                }
                continue;
            }

            let child = self.translator.mfn_to_pfn(raw.frame());
            self.free_level(teardown, child, level - 1, addr, first && index == start);
            if self.registry.frame(child).count() == 0 {
                self.enqueue(slot, PageTableEntry::Free);
                self.mirror(teardown.root, slot, PageTableEntry::Free);
                self.registry.entry_removed(table);
                self.restore_write(child);
                teardown.tables.push(child);
            }
        }
    }

    /// Copies the shared-level kernel entry covering `fault` from the master table into the
    /// current one. Returns true if an entry was copied.
    pub fn propagate_kernel_entry(&mut self, fault: VirtualAddress) -> bool {
        let geometry = self.geometry;
        let addr = fault.as_usize();
        if geometry.is_user(addr) {
            return false;
        }
        let view = self.view();
        let Some(source) = view.slot_at(self.master.kernel, addr, geometry.shared_level) else {
            return false;
        };
        let Some(target) = view.slot_at(self.current.kernel, addr, geometry.shared_level) else {
            return false;
        };

        let value = self.read(source);
        let old = self.read(target);
        if value.is_free() || value == old {
            return false;
        }
        log::debug!("propagating kernel entry for {fault:?}: {value:?}");
        self.enqueue(target, value);
        if old.is_free() {
            self.registry.entry_added(target.table);
        }
        self.flush();
        true
    }

    /// Returns the machine frame mapped at `vaddr`.
    pub fn machine_frame(&self, root: RootTable, vaddr: VirtualAddress) -> Option<MachineFrameNumber> {
        let slot = self.view().get(root.kernel, vaddr)?;
        Some(self.read(slot).frame())
    }

    /// Translates `vaddr` through the tree, or returns `None` if it is unmapped or maps a
    /// foreign frame.
    pub fn to_physical(&self, root: RootTable, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let slot = self.view().get(root.kernel, vaddr)?;
        let machine = self.read(slot).address();
        if self.translator.is_foreign(machine) {
            return None;
        }
        Some(self.translator.machine_to_phys(machine) + vaddr.page_offset())
    }

    /// Adds the direct mappings of `frames` the domain builder left out of the master table.
    ///
    /// Table pages are mapped read-only. Returns the number of pages mapped.
    pub fn populate_kernel_map(&mut self, frames: Range<FrameNumber>) -> usize {
        let master = self.master;
        let mut mapped = 0;
        for pfn in frames {
            let vaddr = self.translator.pfn_to_virt(pfn);
            if self.view().get(master.kernel, vaddr).is_some() {
                continue;
            }
            let permission = if self.registry.frame(pfn).is_table() {
                Permission::READ
            } else {
                Permission::ALL
            };
            let frame = self.translator.pfn_to_mfn(pfn);
            if self.insert_entry(master, vaddr, frame, permission) {
                self.flush();
            }
            mapped += 1;
        }
        self.flush();
        log::debug!("populated {mapped} direct map pages");
        mapped
    }

    /// Maps a user page and counts the mapping.
    pub fn map_user_page(
        &mut self,
        root: RootTable,
        vaddr: VirtualAddress,
        pfn: FrameNumber,
        permission: Permission,
    ) {
        assert!(
            self.geometry.is_user(vaddr.as_usize()),
            "{vaddr:?} is not a user address"
        );
        self.registry.page_get(pfn);
        self.insert(root, vaddr, self.translator.pfn_to_mfn(pfn), permission);
        self.registry.map(pfn, vaddr);
    }
}
