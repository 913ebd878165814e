//! The page table session.
//!
//! Everything the page table core mutates lives in one [`PageTableSession`]: the frame
//! registry, the update queue, the hypervisor and allocator handles, and the roots of the
//! master and current tables. Every operation takes the session by `&mut`, which is how
//! the single-processor, no-reentrancy rule shows up in the types.

use crate::{
    AddressTranslator, FrameAllocator, FrameFlags, FrameNumber, FrameRegistry, Geometry,
    Hypervisor, InvalidateHook, MachineAddress, RawEntry, RootTable, Slot, StartInfo,
    TableView, UpdateQueue,
};

/// Choices made once when the kernel boots.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub geometry: &'static Geometry,
    pub invalidate: InvalidateHook,
}

impl SessionConfig {
    /// Creates a configuration that never invalidates TLB entries explicitly.
    pub const fn new(geometry: &'static Geometry) -> Self {
        Self {
            geometry,
            invalidate: InvalidateHook::NONE,
        }
    }

    /// Selects the TLB invalidation strategy.
    pub const fn with_invalidate(mut self, invalidate: InvalidateHook) -> Self {
        self.invalidate = invalidate;
        self
    }
}

/// Owner of all page table state of the domain.
pub struct PageTableSession<H: Hypervisor, A: FrameAllocator> {
    pub(crate) translator: AddressTranslator,
    pub(crate) geometry: &'static Geometry,
    pub(crate) registry: FrameRegistry,
    pub(crate) queue: UpdateQueue,
    pub(crate) hypervisor: H,
    pub(crate) allocator: A,
    pub(crate) master: RootTable,
    pub(crate) current: RootTable,
}

impl<H: Hypervisor, A: FrameAllocator> PageTableSession<H, A> {
    /// Takes over the boot page table described by `start_info` as the master table.
    ///
    /// The boot table is already pinned and loaded by the domain builder, so nothing is
    /// reloaded until the first switch.
    pub fn new(
        config: SessionConfig,
        translator: AddressTranslator,
        hypervisor: H,
        allocator: A,
        start_info: StartInfo,
    ) -> Self {
        let master = RootTable {
            kernel: start_info.master_root,
            user: None,
        };
        let mut session = Self {
            registry: FrameRegistry::new(translator.frame_count()),
            translator,
            geometry: config.geometry,
            queue: UpdateQueue::new(config.invalidate),
            hypervisor,
            allocator,
            master,
            current: master,
        };
        session.adopt_boot_tables();
        log::debug!(
            "{} page tables: master root {:?}, {} boot tables, {}/{} frames mapped, invalidate {:?}",
            session.geometry.name,
            start_info.master_root,
            start_info.boot_table_frames,
            start_info.mapped_frames,
            start_info.total_frames,
            config.invalidate,
        );
        session
    }

    /// Records the boot tree in the registry: the root as a pinned root, everything below
    /// it as table pages counting their valid entries.
    fn adopt_boot_tables(&mut self) {
        let root = self.master.kernel;
        self.registry
            .mark_table(root, FrameFlags::ROOT_TABLE | FrameFlags::PINNED, 0);
        self.adopt_level(root, self.geometry.levels);
    }

    fn adopt_level(&mut self, table: FrameNumber, level: usize) {
        for index in 0..self.geometry.entries(level) {
            let raw = self.translator.read_entry(table, index);
            if raw.is_free() {
                continue;
            }
            let child = self.translator.mfn_to_pfn(raw.frame());
            let entries = (0..self.geometry.entries(level - 1))
                .filter(|&index| !self.translator.read_entry(child, index).is_free())
                .count();
            self.registry
                .mark_table(child, FrameFlags::TABLE_PAGE, entries);
            if level - 1 > 1 {
                self.adopt_level(child, level - 1);
            }
        }
    }

    pub fn geometry(&self) -> &'static Geometry {
        self.geometry
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub fn registry(&self) -> &FrameRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FrameRegistry {
        &mut self.registry
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn hypervisor_mut(&mut self) -> &mut H {
        &mut self.hypervisor
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    /// Returns the boot table whose kernel half every address space shares.
    pub fn master(&self) -> RootTable {
        self.master
    }

    /// Returns the tree the CPU is running on.
    pub fn current(&self) -> RootTable {
        self.current
    }

    /// Returns a read-only view of the trees.
    pub fn view(&self) -> TableView<'_> {
        TableView::new(&self.translator, self.geometry)
    }

    /// Takes a zeroed frame from the allocator, or `None` when memory is exhausted.
    pub fn allocate_frame(&mut self) -> Option<FrameNumber> {
        self.registry.allocate(&mut self.allocator)
    }

    /// Returns an unused frame to the allocator.
    pub fn free_frame(&mut self, pfn: FrameNumber) {
        self.registry.free(&mut self.allocator, pfn);
    }

    /// Drops one use of a user page, returning it to the allocator when it was the last.
    pub fn release_user_page(&mut self, pfn: FrameNumber) -> bool {
        self.registry.release_user_page(&mut self.allocator, pfn)
    }

    pub(crate) fn read(&self, slot: Slot) -> RawEntry {
        self.translator.read_entry(slot.table, slot.index)
    }

    pub(crate) fn slot_address(&self, slot: Slot) -> MachineAddress {
        self.translator.slot_address(slot.table, slot.index)
    }

    /// Queues a store into a live table. Typed entries are packed here.
    pub(crate) fn enqueue(&mut self, slot: Slot, value: impl Into<RawEntry>) {
        let address = self.slot_address(slot);
        self.queue.enqueue(&mut self.hypervisor, address, value.into());
    }

    /// Commits all queued stores and reloads the active roots.
    pub fn flush(&mut self) {
        self.queue.flush(&mut self.hypervisor);
    }

    /// Stores directly into a table page that is still private to an offline tree.
    pub(crate) fn write_direct(&self, slot: Slot, value: impl Into<RawEntry>) {
        self.translator.write_entry(slot.table, slot.index, value.into());
    }
}

/// Holder for the kernel's single session.
///
/// Page table code must never be re-entered, for example from an interrupt handler that
/// runs while an insert has updates queued. `with` detects that instead of deadlocking.
pub struct SessionCell<H: Hypervisor, A: FrameAllocator> {
    inner: spin::Mutex<Option<PageTableSession<H, A>>>,
}

impl<H: Hypervisor, A: FrameAllocator> SessionCell<H, A> {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(None),
        }
    }

    /// Installs the session.
    ///
    /// # Panics
    /// Panics if a session is already installed.
    pub fn install(&self, session: PageTableSession<H, A>) {
        let Some(mut slot) = self.inner.try_lock() else {
            panic!("page table session re-entered");
        };
        assert!(slot.is_none(), "page table session already installed");
        *slot = Some(session);
    }

    /// Removes and returns the session.
    pub fn take(&self) -> Option<PageTableSession<H, A>> {
        let Some(mut slot) = self.inner.try_lock() else {
            panic!("page table session re-entered");
        };
        slot.take()
    }

    /// Runs `f` with exclusive access to the session.
    ///
    /// # Panics
    /// Panics if no session is installed or if called from within `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut PageTableSession<H, A>) -> R) -> R {
        let Some(mut slot) = self.inner.try_lock() else {
            panic!("page table session re-entered");
        };
        let Some(session) = slot.as_mut() else {
            panic!("page table session not installed");
        };
        f(session)
    }
}

impl<H: Hypervisor, A: FrameAllocator> Default for SessionCell<H, A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::{DomainBuilder, EmulatedFrameAllocator, SoftHypervisor};

    #[test]
    fn boot_tables_are_adopted() {
        for geometry in [&Geometry::X86_64, &Geometry::X86_PAE] {
            let session = DomainBuilder::new(geometry, 600).build().session();
            let registry = session.registry();
            let root = session.master().kernel;
            assert!(registry.test(root, FrameFlags::ROOT_TABLE | FrameFlags::PINNED));

            // The level-2 table holds two leaf tables; each leaf table counts its pages.
            let level2 = FrameNumber::new(geometry.levels - 2);
            assert!(registry.test(level2, FrameFlags::TABLE_PAGE));
            assert_eq!(registry.frame(level2).count(), 2);
            let first_leaf_table = FrameNumber::new(geometry.levels - 1);
            assert_eq!(registry.frame(first_leaf_table).count(), 512);
            assert_eq!(registry.frame(first_leaf_table + 1).count(), 600 - 512);
        }
    }

    #[test]
    fn current_starts_as_master() {
        let session = DomainBuilder::new(&Geometry::X86_64, 64).build().session();
        assert_eq!(session.current(), session.master());
        assert_eq!(session.master().user, None);
        assert_eq!(session.queue().base(), None);
    }

    #[test]
    fn user_pages_return_to_the_allocator() {
        let mut session = DomainBuilder::new(&Geometry::X86_64, 64).build().session();
        let before = session.allocator().available();
        let pfn = session.allocate_frame().unwrap();
        session.registry_mut().page_get(pfn);
        session.registry_mut().page_get(pfn);
        assert!(!session.release_user_page(pfn));
        assert!(session.release_user_page(pfn));
        assert_eq!(session.allocator().available(), before);
    }

    static CELL: SessionCell<SoftHypervisor, EmulatedFrameAllocator> = SessionCell::new();

    #[test]
    fn cell_rejects_reentry() {
        CELL.install(DomainBuilder::new(&Geometry::X86_PAE, 64).build().session());
        let levels = CELL.with(|session| session.geometry().levels);
        assert_eq!(levels, 3);

        let nested = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            CELL.with(|_| CELL.with(|_| ()))
        }));
        assert!(nested.is_err());
        assert!(CELL.take().is_some());
    }

    #[test]
    #[should_panic(expected = "not installed")]
    fn cell_requires_a_session() {
        let cell: SessionCell<SoftHypervisor, EmulatedFrameAllocator> = SessionCell::new();
        cell.with(|_| ());
    }
}
