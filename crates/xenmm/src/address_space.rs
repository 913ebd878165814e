//! Address space lifecycle.
//!
//! A new address space starts offline: its table pages belong to the constructing code and
//! are written directly. Completing it revokes write access to every one of those pages and
//! pins the root, after which it can be switched to and only changes through the update
//! queue. Freeing it tears down the user half and hands the roots back writable.

use alloc::vec::Vec;

use crate::{
    ActiveBase, Error, FrameAllocator, FrameFlags, FrameNumber, Hypervisor, MAX_OFFLINE_PAGES,
    PageTableEntry, PageTableSession, Result, Slot,
};

/// A root table and, on geometries that need one, its shadow user root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootTable {
    pub kernel: FrameNumber,
    pub user: Option<FrameNumber>,
}

impl RootTable {
    /// Iterates over the root and the shadow root.
    pub fn frames(self) -> impl Iterator<Item = FrameNumber> {
        core::iter::once(self.kernel).chain(self.user)
    }
}

/// Where an address space is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Under construction; table pages are writable and private.
    Offline,
    /// Validated and pinned by the hypervisor.
    Pinned,
    /// Pinned and loaded on the CPU.
    Active,
    /// Torn down; only the root frames remain.
    Freed,
}

/// Table pages allocated for an offline tree, in allocation order.
#[derive(Debug, Default)]
pub struct OfflinePages {
    pages: Vec<FrameNumber>,
}

impl OfflinePages {
    /// Most table pages an offline tree may hold before it is completed.
    pub const LIMIT: usize = MAX_OFFLINE_PAGES;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if no further page can be tracked.
    pub fn reserve(&self) -> Result<()> {
        if self.pages.len() >= Self::LIMIT {
            return Err(Error::OfflineTrackingFull { limit: Self::LIMIT });
        }
        Ok(())
    }

    /// Records a page.
    pub fn push(&mut self, pfn: FrameNumber) -> Result<()> {
        self.reserve()?;
        self.pages.push(pfn);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, pfn: FrameNumber) -> bool {
        self.pages.contains(&pfn)
    }

    pub fn iter(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.pages.iter().copied()
    }

    fn clear(&mut self) {
        self.pages.clear();
    }
}

/// One page table tree.
#[derive(Debug)]
pub struct AddressSpace {
    pub(crate) root: RootTable,
    pub(crate) state: TableState,
    pub(crate) offline: OfflinePages,
}

impl AddressSpace {
    pub fn root(&self) -> RootTable {
        self.root
    }

    /// Table pages allocated since construction began.
    pub fn offline_pages(&self) -> &OfflinePages {
        &self.offline
    }
}

impl<H: Hypervisor, A: FrameAllocator> PageTableSession<H, A> {
    /// Returns the lifecycle state of `space`.
    pub fn state_of(&self, space: &AddressSpace) -> TableState {
        if space.state == TableState::Pinned && space.root == self.current {
            TableState::Active
        } else {
            space.state
        }
    }

    fn allocate_root(&mut self) -> Result<FrameNumber> {
        let pfn = self
            .registry
            .allocate(&mut self.allocator)
            .ok_or(Error::OutOfFrames)?;
        self.registry.mark_table(pfn, FrameFlags::ROOT_TABLE, 0);
        Ok(pfn)
    }

    fn release_root(&mut self, pfn: FrameNumber) {
        self.registry.retire_table(pfn);
        self.registry.free(&mut self.allocator, pfn);
    }

    /// Allocates an offline address space sharing the kernel half of the master table.
    pub fn address_space_new(&mut self) -> Result<AddressSpace> {
        let kernel = self.allocate_root()?;
        let user = if self.geometry.dual_root {
            match self.allocate_root() {
                Ok(user) => Some(user),
                Err(err) => {
                    self.release_root(kernel);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut space = AddressSpace {
            root: RootTable { kernel, user },
            state: TableState::Offline,
            offline: OfflinePages::new(),
        };
        if let Err(err) = self.clone_kernel_half(&mut space, self.master) {
            self.abandon(space);
            return Err(err);
        }
        log::debug!("new address space {:?}", space.root);
        Ok(space)
    }

    /// Fills the root of an offline space from `old`: user entries zeroed, kernel entries
    /// copied. The shadow root starts out empty.
    ///
    /// Geometries with a private kernel table get their own copy of it, linked with the
    /// same protections.
    pub fn clone_kernel_half(&mut self, space: &mut AddressSpace, old: RootTable) -> Result<()> {
        assert_eq!(space.state, TableState::Offline, "only offline trees can be cloned into");
        let geometry = self.geometry;
        let level = geometry.levels;
        for index in 0..geometry.entries(level) {
            let slot = Slot::new(space.root.kernel, index, level);
            if index < geometry.user_root_entries {
                self.write_direct(slot, PageTableEntry::Free);
                continue;
            }

            let mut value = self.read(Slot::new(old.kernel, index, level));
            if geometry.private_kernel_table && !value.is_free() {
                let source = self.translator.mfn_to_pfn(value.frame());
                let entries = (0..geometry.entries(level - 1))
                    .filter(|&index| !self.translator.read_entry(source, index).is_free())
                    .count();
                let copy = self.offline_alloc(space, entries)?;
                self.translator.copy_frame(source, copy);
                let mfn = self.translator.pfn_to_mfn(copy);
                value = PageTableEntry::node(mfn, value.flags()).encode();
            }
            self.write_direct(slot, value);
        }
        if let Some(user) = space.root.user {
            for index in 0..geometry.entries(level) {
                self.write_direct(Slot::new(user, index, level), PageTableEntry::Free);
            }
        }
        Ok(())
    }

    fn pin(&mut self, pfn: FrameNumber) {
        let mfn = self.translator.pfn_to_mfn(pfn);
        if let Err(err) = self.hypervisor.pin_table(mfn, self.geometry.levels) {
            log::error!("pinning {mfn:?} failed: {err}");
            panic!("pin_table failed: {err}");
        }
        self.registry.set(pfn, FrameFlags::PINNED);
    }

    fn unpin(&mut self, pfn: FrameNumber) {
        let mfn = self.translator.pfn_to_mfn(pfn);
        if let Err(err) = self.hypervisor.unpin_table(mfn) {
            log::error!("unpinning {mfn:?} failed: {err}");
            panic!("unpin_table failed: {err}");
        }
        self.registry.clear(pfn, FrameFlags::PINNED);
    }

    /// Makes an offline tree live: every page it allocated and its roots lose write access
    /// in one batch, then the roots are pinned.
    pub fn complete_existing(&mut self, space: &mut AddressSpace) {
        assert_eq!(space.state, TableState::Offline, "{:?} is already complete", space.root);
        let pages: Vec<FrameNumber> = space.offline.iter().chain(space.root.frames()).collect();
        for &pfn in &pages {
            self.revoke_write(pfn);
        }
        self.flush();
        for pfn in space.root.frames() {
            self.pin(pfn);
        }
        log::debug!("completed {:?} with {} table pages", space.root, space.offline.len());
        space.offline.clear();
        space.state = TableState::Pinned;
    }

    /// Completes an offline tree and switches to it.
    pub fn complete_new(&mut self, space: &mut AddressSpace) {
        self.complete_existing(space);
        self.switch_to(space);
    }

    /// Loads a pinned tree on the CPU.
    pub fn switch_to(&mut self, space: &AddressSpace) {
        assert_ne!(
            space.state,
            TableState::Offline,
            "cannot switch to an offline tree"
        );
        assert_ne!(space.state, TableState::Freed, "cannot switch to a freed tree");
        self.load(space.root);
    }

    /// Switches back to the master table.
    pub fn switch_to_master(&mut self) {
        self.load(self.master);
    }

    fn load(&mut self, root: RootTable) {
        self.flush();
        let base = ActiveBase {
            kernel: self.translator.pfn_to_mfn(root.kernel),
            user: root.user.map(|user| self.translator.pfn_to_mfn(user)),
        };
        self.queue.set_base(Some(base));
        self.queue.reload(&mut self.hypervisor);
        self.current = root;
        log::debug!("switched to {root:?}");
    }

    /// Tears down a pinned tree that is not active: the user half is freed, a private
    /// kernel table is released, the roots are unpinned and made writable again.
    pub fn free_tree(&mut self, space: &mut AddressSpace) {
        match self.state_of(space) {
            TableState::Pinned => {}
            TableState::Active => panic!("cannot free the active address space"),
            state => panic!("cannot free a {state:?} address space"),
        }
        let geometry = self.geometry;
        let root = space.root;
        self.free_subtree(root, 0, geometry.userspace_end);

        let mut private = Vec::new();
        if geometry.private_kernel_table {
            let level = geometry.levels;
            for index in geometry.user_root_entries..geometry.entries(level) {
                let slot = Slot::new(root.kernel, index, level);
                let raw = self.read(slot);
                if raw.is_free() {
                    continue;
                }
                let table = self.translator.mfn_to_pfn(raw.frame());
                self.enqueue(slot, PageTableEntry::Free);
                self.restore_write(table);
                private.push(table);
            }
            self.flush();
        }
        for table in private {
            self.registry.retire_table(table);
            self.registry.free(&mut self.allocator, table);
        }

        for pfn in root.frames() {
            self.unpin(pfn);
        }
        for pfn in root.frames() {
            self.restore_write(pfn);
        }
        self.flush();
        space.state = TableState::Freed;
        log::debug!("freed {root:?}");
    }

    /// Frees a tree and returns its roots to the allocator.
    pub fn destroy(&mut self, mut space: AddressSpace) {
        self.free_tree(&mut space);
        for pfn in space.root.frames() {
            self.release_root(pfn);
        }
    }

    /// Discards an offline tree that will never be completed.
    ///
    /// Nothing was pinned or made read-only, so the hypervisor is not involved: user pages
    /// lose the use the tree held, table pages and roots go straight back to the allocator.
    pub fn abandon(&mut self, space: AddressSpace) {
        assert_eq!(
            space.state,
            TableState::Offline,
            "only offline trees can be abandoned"
        );
        let root = space.root;
        for leaf in self
            .view()
            .leaves(root.kernel, 0, self.geometry.userspace_end)
        {
            if !self.translator.is_foreign(leaf.entry.address()) {
                let pfn = self.translator.mfn_to_pfn(leaf.entry.frame());
                self.registry.release_user_page(&mut self.allocator, pfn);
            }
        }
        for table in space.offline.iter() {
            self.registry.retire_table(table);
            self.registry.free(&mut self.allocator, table);
        }
        for pfn in root.frames() {
            self.release_root(pfn);
        }
        log::debug!("abandoned offline tree {root:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::{DomainBuilder, EmulatedFrameAllocator, Hypercall, SoftHypervisor};
    use crate::{Geometry, Permission, VirtualAddress};

    type Session = PageTableSession<SoftHypervisor, EmulatedFrameAllocator>;

    const GEOMETRIES: [&Geometry; 2] = [&Geometry::X86_64, &Geometry::X86_PAE];

    fn session(geometry: &'static Geometry) -> Session {
        DomainBuilder::new(geometry, 256).build().session()
    }

    #[test]
    fn new_spaces_share_the_kernel_half() {
        let mut session = session(&Geometry::X86_64);
        let space = session.address_space_new().unwrap();
        let root = space.root();
        let master = session.master().kernel;
        let view = session.view();

        assert_eq!(session.state_of(&space), TableState::Offline);
        assert!(session.registry().test(root.kernel, FrameFlags::ROOT_TABLE));
        assert!(session.registry().test(root.user.unwrap(), FrameFlags::ROOT_TABLE));
        for index in 0..512 {
            let copied = view.read(Slot::new(root.kernel, index, 4));
            if index < 256 {
                assert!(copied.is_free());
            } else {
                assert_eq!(copied, view.read(Slot::new(master, index, 4)));
            }
        }
        assert!(space.offline_pages().is_empty());
    }

    #[test]
    fn pae_spaces_get_a_private_kernel_table() {
        let mut session = session(&Geometry::X86_PAE);
        let space = session.address_space_new().unwrap();
        let root = space.root();
        assert_eq!(root.user, None);

        let view = session.view();
        let master_link = view.read(Slot::new(session.master().kernel, 3, 3));
        let link = view.read(Slot::new(root.kernel, 3, 3));
        assert_ne!(link.frame(), master_link.frame());
        assert_eq!(link.flags(), master_link.flags());

        let private = view.child(link);
        let shared = view.child(master_link);
        assert_eq!(space.offline_pages().iter().collect::<Vec<_>>(), [private]);
        for index in 0..512 {
            assert_eq!(
                view.read(Slot::new(private, index, 2)),
                view.read(Slot::new(shared, index, 2))
            );
        }
        assert_eq!(
            session.registry().frame(private).count(),
            session.registry().frame(shared).count()
        );
    }

    #[test]
    fn completion_pins_and_switches() {
        for geometry in GEOMETRIES {
            let mut session = session(geometry);
            let mut space = session.address_space_new().unwrap();
            session.complete_new(&mut space);

            let root = space.root();
            let translator = session.translator();
            let expected = ActiveBase {
                kernel: translator.pfn_to_mfn(root.kernel),
                user: root.user.map(|user| translator.pfn_to_mfn(user)),
            };
            assert_eq!(session.state_of(&space), TableState::Active);
            assert_eq!(session.current(), root);
            assert_eq!(session.hypervisor().base(), Some(expected));
            assert_eq!(session.queue().base(), Some(expected));
            for pfn in root.frames() {
                assert!(session.registry().test(pfn, FrameFlags::PINNED));
                assert!(session.hypervisor().is_pinned(translator.pfn_to_mfn(pfn)));
            }

            session.switch_to_master();
            assert_eq!(session.state_of(&space), TableState::Pinned);
            assert_eq!(session.current(), session.master());
            session.switch_to(&space);
            assert_eq!(session.state_of(&space), TableState::Active);
        }
    }

    #[test]
    fn kernel_mappings_are_visible_after_switch() {
        for geometry in GEOMETRIES {
            let mut session = session(geometry);
            let mut space = session.address_space_new().unwrap();
            session.complete_new(&mut space);
            let pfn = FrameNumber::new(100);
            let vaddr = session.translator().pfn_to_virt(pfn);
            assert_eq!(session.to_physical(space.root(), vaddr), Some(pfn.start()));
            assert_eq!(session.walk(vaddr).len(), geometry.levels);
        }
    }

    #[test]
    fn destroy_returns_every_frame() {
        for geometry in GEOMETRIES {
            let mut session = session(geometry);
            let available = session.allocator().available();
            let mut space = session.address_space_new().unwrap();
            session.complete_new(&mut space);
            let root = space.root();
            for vaddr in [0x1000, 0x40_0000, 0x8000_0000] {
                let pfn = session.allocate_frame().unwrap();
                session.map_user_page(root, VirtualAddress::new(vaddr), pfn, Permission::ALL);
            }

            session.switch_to_master();
            session.destroy(space);

            assert_eq!(session.allocator().available(), available);
            for pfn in root.frames() {
                let mfn = session.translator().pfn_to_mfn(pfn);
                assert!(!session.hypervisor().is_pinned(mfn));
                assert_eq!(session.hypervisor().table_level(mfn), None);
                assert!(session.registry().is_unused(pfn));
            }
        }
    }

    #[test]
    fn freed_spaces_keep_their_roots() {
        let mut session = session(&Geometry::X86_PAE);
        let mut space = session.address_space_new().unwrap();
        session.complete_existing(&mut space);
        session.free_tree(&mut space);

        assert_eq!(session.state_of(&space), TableState::Freed);
        let root = space.root().kernel;
        assert!(session.registry().test(root, FrameFlags::ROOT_TABLE));
        assert!(!session.registry().test(root, FrameFlags::PINNED));
        assert!(!session.allocator().is_free(root));
    }

    #[test]
    #[should_panic(expected = "cannot free the active address space")]
    fn active_space_cannot_be_freed() {
        let mut session = session(&Geometry::X86_64);
        let mut space = session.address_space_new().unwrap();
        session.complete_new(&mut space);
        session.free_tree(&mut space);
    }

    #[test]
    #[should_panic(expected = "cannot switch to an offline tree")]
    fn offline_space_cannot_be_loaded() {
        let mut session = session(&Geometry::X86_64);
        let space = session.address_space_new().unwrap();
        session.switch_to(&space);
    }

    #[test]
    #[should_panic(expected = "mmu_update failed")]
    fn rejected_completion_batch_is_fatal() {
        let mut session = session(&Geometry::X86_64);
        let mut space = session.address_space_new().unwrap();
        session.hypervisor_mut().fail_next_call(Hypercall::MmuUpdate, -22);
        session.complete_existing(&mut space);
    }

    #[test]
    #[should_panic(expected = "pin_table failed")]
    fn failed_pin_is_fatal() {
        let mut session = session(&Geometry::X86_PAE);
        let mut space = session.address_space_new().unwrap();
        session.hypervisor_mut().fail_next_call(Hypercall::PinTable, -22);
        session.complete_existing(&mut space);
    }

    #[test]
    #[should_panic(expected = "new_base failed")]
    fn failed_switch_is_fatal() {
        let mut session = session(&Geometry::X86_64);
        let mut space = session.address_space_new().unwrap();
        session.complete_existing(&mut space);
        session.hypervisor_mut().fail_next_call(Hypercall::NewBase, -22);
        session.switch_to(&space);
    }

    #[test]
    #[should_panic(expected = "unpin_table failed")]
    fn failed_unpin_is_fatal() {
        let mut session = session(&Geometry::X86_64);
        let mut space = session.address_space_new().unwrap();
        session.complete_new(&mut space);
        session.switch_to_master();
        session.hypervisor_mut().fail_next_call(Hypercall::UnpinTable, -16);
        session.free_tree(&mut space);
    }

    #[test]
    fn abandon_releases_pages_and_tables() {
        for geometry in GEOMETRIES {
            let mut session = session(geometry);
            let available = session.allocator().available();
            let shared = session.allocate_frame().unwrap();
            session.registry_mut().page_get(shared);

            let mut space = session.address_space_new().unwrap();
            let private = session.allocate_frame().unwrap();
            for (pfn, vaddr) in [(shared, 0x1000), (private, 0x40_0000)] {
                session.registry_mut().page_get(pfn);
                let mfn = session.translator().pfn_to_mfn(pfn);
                session
                    .offline_insert(&mut space, VirtualAddress::new(vaddr), mfn, Permission::ALL)
                    .unwrap();
            }

            session.abandon(space);

            assert!(session.allocator().is_free(private));
            assert_eq!(session.registry().frame(shared).count(), 1);
            assert_eq!(session.allocator().available(), available - 1);
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        for geometry in GEOMETRIES {
            let mut session = session(geometry);
            let mut drained = Vec::new();
            while let Some(pfn) = session.allocate_frame() {
                drained.push(pfn);
            }
            assert_eq!(session.address_space_new().unwrap_err(), Error::OutOfFrames);

            // One frame is enough for a root but not for what comes after it.
            let spare = drained.pop().unwrap();
            session.free_frame(spare);
            assert_eq!(session.address_space_new().unwrap_err(), Error::OutOfFrames);
            assert_eq!(session.allocator().available(), 1);
            assert!(session.registry().is_unused(spare));
        }
    }

    #[test]
    fn offline_tracking_is_bounded() {
        let mut pages = OfflinePages::new();
        for pfn in 0..OfflinePages::LIMIT {
            pages.push(FrameNumber::new(pfn)).unwrap();
        }
        assert_eq!(pages.len(), OfflinePages::LIMIT);
        let full = Error::OfflineTrackingFull {
            limit: OfflinePages::LIMIT,
        };
        assert_eq!(pages.reserve(), Err(full));
        assert_eq!(pages.push(FrameNumber::new(0)), Err(full));
        assert!(pages.contains(FrameNumber::new(17)));
    }
}
