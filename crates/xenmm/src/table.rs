//! Read side of the page table walker.
//!
//! A [`TableView`] borrows the translator and knows the tree geometry; it never changes a
//! table. Every walk goes through the same per-level shift and index tables, so the 3- and
//! 4-level trees share one implementation.

use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::{
    AddressTranslator, FrameNumber, Geometry, MachineAddress, PAGE_SIZE, PageTableEntry,
    Permission, RawEntry, VirtualAddress, arch,
};

/// One entry of one table page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Frame holding the table.
    pub table: FrameNumber,
    pub index: usize,
    /// Level of the table, 1 for leaf tables.
    pub level: usize,
}

impl Slot {
    pub const fn new(table: FrameNumber, index: usize, level: usize) -> Self {
        Self {
            table,
            index,
            level,
        }
    }
}

/// A valid leaf found by a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub vaddr: VirtualAddress,
    pub slot: Slot,
    pub entry: RawEntry,
}

/// Read-only access to page table trees.
pub struct TableView<'a> {
    translator: &'a AddressTranslator,
    geometry: &'static Geometry,
}

impl<'a> TableView<'a> {
    pub fn new(translator: &'a AddressTranslator, geometry: &'static Geometry) -> Self {
        Self {
            translator,
            geometry,
        }
    }

    pub fn geometry(&self) -> &'static Geometry {
        self.geometry
    }

    /// Reads the raw value of a slot.
    pub fn read(&self, slot: Slot) -> RawEntry {
        self.translator.read_entry(slot.table, slot.index)
    }

    /// Reads and decodes a slot.
    pub fn decode(&self, slot: Slot) -> PageTableEntry {
        PageTableEntry::decode(self.read(slot), slot.level)
    }

    /// Returns the machine address the hypervisor knows a slot by.
    pub fn machine_address(&self, slot: Slot) -> MachineAddress {
        self.translator.slot_address(slot.table, slot.index)
    }

    /// Returns the table a link entry points to.
    pub fn child(&self, link: RawEntry) -> FrameNumber {
        self.translator.mfn_to_pfn(link.frame())
    }

    /// Returns the slot for `vaddr` in the table at `level`, or `None` if a table above it
    /// is missing.
    pub fn slot_at(&self, root: FrameNumber, vaddr: usize, level: usize) -> Option<Slot> {
        let mut table = root;
        for upper in ((level + 1)..=self.geometry.levels).rev() {
            let raw = self.read(Slot::new(table, self.geometry.index(vaddr, upper), upper));
            if raw.is_free() {
                return None;
            }
            table = self.child(raw);
        }
        Some(Slot::new(table, self.geometry.index(vaddr, level), level))
    }

    /// Returns the leaf slot for `vaddr`, or `None` as soon as an upper level is free.
    pub fn entry_slot(&self, root: FrameNumber, vaddr: VirtualAddress) -> Option<Slot> {
        self.slot_at(root, vaddr.as_usize(), 1)
    }

    /// Returns the leaf slot for `vaddr` if it holds a valid mapping.
    pub fn get(&self, root: FrameNumber, vaddr: VirtualAddress) -> Option<Slot> {
        self.entry_slot(root, vaddr)
            .filter(|&slot| !self.read(slot).is_free())
    }

    /// Decodes the permission of a valid leaf.
    ///
    /// # Panics
    /// Panics if the slot is free or not a leaf.
    pub fn permission(&self, slot: Slot) -> Permission {
        match self.decode(slot) {
            PageTableEntry::Leaf { permission, .. } => permission,
            other => panic!("{slot:?} is not a mapped leaf ({other:?})"),
        }
    }

    /// Visits every valid leaf in `[from, hi)` in address order until `visit` breaks.
    ///
    /// Each level keeps its own cursor and the base address of the entry it is on. A lower
    /// level starts at the index of `from` only while every level above it is still on the
    /// entry containing `from`; otherwise it starts at zero. A level stops as soon as its
    /// base reaches `hi`. Bases are compared in canonical form, so kernel ranges work too.
    pub fn scan(
        &self,
        root: FrameNumber,
        from: usize,
        hi: usize,
        mut visit: impl FnMut(Leaf) -> ControlFlow<()>,
    ) {
        if from >= hi {
            return;
        }
        let _ = self.scan_level(root, self.geometry.levels, 0, from, hi, true, &mut visit);
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_level(
        &self,
        table: FrameNumber,
        level: usize,
        base: usize,
        from: usize,
        hi: usize,
        first: bool,
        visit: &mut dyn FnMut(Leaf) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let start = if first {
            self.geometry.index(from, level)
        } else {
            0
        };
        for index in start..self.geometry.entries(level) {
            let addr = arch::canonicalize_virtual(base + (index << self.geometry.shift(level)));
            if addr >= hi {
                break;
            }
            let slot = Slot::new(table, index, level);
            let raw = self.read(slot);
            if raw.is_free() {
                continue;
            }
            if level == 1 {
                visit(Leaf {
                    vaddr: VirtualAddress::new(addr),
                    slot,
                    entry: raw,
                })?;
            } else {
                self.scan_level(
                    self.child(raw),
                    level - 1,
                    addr,
                    from,
                    hi,
                    first && index == start,
                    visit,
                )?;
            }
        }
        ControlFlow::Continue(())
    }

    /// Collects every valid leaf in `[from, hi)`.
    pub fn leaves(&self, root: FrameNumber, from: usize, hi: usize) -> Vec<Leaf> {
        let mut leaves = Vec::new();
        self.scan(root, from, hi, |leaf| {
            leaves.push(leaf);
            ControlFlow::Continue(())
        });
        leaves
    }

    /// Returns the address of the first valid leaf in `[addr + PAGE_SIZE, hi)`, or `hi`.
    pub fn next_present(&self, root: FrameNumber, addr: usize, hi: usize) -> usize {
        if hi <= addr || hi - addr < PAGE_SIZE {
            return hi;
        }
        let mut next = hi;
        self.scan(root, addr + PAGE_SIZE, hi, |leaf| {
            next = leaf.vaddr.as_usize();
            ControlFlow::Break(())
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::{DomainBuilder, EmulatedFrameAllocator, SoftHypervisor};
    use crate::{PageTableSession, RootTable};

    type Session = PageTableSession<SoftHypervisor, EmulatedFrameAllocator>;

    fn active(geometry: &'static Geometry, pages: &[usize]) -> (Session, RootTable) {
        let mut session = DomainBuilder::new(geometry, 256).build().session();
        let mut space = session.address_space_new().unwrap();
        session.complete_new(&mut space);
        let root = space.root();
        for &vaddr in pages {
            let pfn = session.allocate_frame().unwrap();
            session.map_user_page(root, VirtualAddress::new(vaddr), pfn, Permission::ALL);
        }
        (session, root)
    }

    fn sample(geometry: &Geometry) -> [usize; 5] {
        [
            0x1000,
            0x3000,
            0x20_0000,
            0x4000_0000,
            geometry.userspace_end - PAGE_SIZE,
        ]
    }

    #[test]
    fn next_present_enumerates_in_order() {
        for geometry in [&Geometry::X86_64, &Geometry::X86_PAE] {
            let pages = sample(geometry);
            let (session, root) = active(geometry, &pages);
            let view = session.view();
            let end = geometry.userspace_end;

            let mut found = Vec::new();
            let mut addr = 0;
            loop {
                let next = view.next_present(root.kernel, addr, end);
                assert!(next > addr);
                if next == end {
                    break;
                }
                found.push(next);
                addr = next;
            }
            assert_eq!(found, pages);
        }
    }

    #[test]
    fn next_present_short_ranges() {
        let (session, root) = active(&Geometry::X86_64, &[0x1000]);
        let view = session.view();
        assert_eq!(view.next_present(root.kernel, 0x1000, 0x1800), 0x1800);
        assert_eq!(view.next_present(root.kernel, 0x1000, 0x1000), 0x1000);
        assert_eq!(view.next_present(root.kernel, 0x1000, 0x800), 0x800);
        assert_eq!(view.next_present(root.kernel, 0, 0x1000), 0x1000);
        assert_eq!(view.next_present(root.kernel, 0, 0x2000), 0x1000);
    }

    #[test]
    fn scan_resets_lower_cursors() {
        for geometry in [&Geometry::X86_64, &Geometry::X86_PAE] {
            let pages = sample(geometry);
            let (session, root) = active(geometry, &pages);
            let view = session.view();

            // Starting at leaf index 3 must not skip index 0 of later tables.
            let leaves: Vec<usize> = view
                .leaves(root.kernel, 0x3000, geometry.userspace_end)
                .iter()
                .map(|leaf| leaf.vaddr.as_usize())
                .collect();
            assert_eq!(leaves, pages[1..]);

            let leaves = view.leaves(root.kernel, 0x2000, 0x4000_0000);
            assert_eq!(leaves.len(), 2);
            assert_eq!(leaves[1].vaddr, VirtualAddress::new(0x20_0000));
            assert_eq!(leaves[1].slot.level, 1);
            assert!(view.leaves(root.kernel, 0x5000, 0x5000).is_empty());
        }
    }

    #[test]
    fn scan_stops_when_asked() {
        let (session, root) = active(&Geometry::X86_64, &[0x1000, 0x3000, 0x20_0000]);
        let mut visited = 0;
        session.view().scan(root.kernel, 0, 0x40_0000, |_| {
            visited += 1;
            ControlFlow::Break(())
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn kernel_leaves_are_canonical() {
        let session = DomainBuilder::new(&Geometry::X86_64, 64).build().session();
        let offset = Geometry::X86_64.direct_map_offset;
        let leaves = session
            .view()
            .leaves(session.master().kernel, offset, offset + 4 * PAGE_SIZE);
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[0].vaddr, VirtualAddress::new(offset));
    }

    #[test]
    fn lookups_short_circuit() {
        let (session, root) = active(&Geometry::X86_64, &[0x1000]);
        let view = session.view();
        assert!(view.entry_slot(root.kernel, VirtualAddress::new(0x80_0000_0000)).is_none());

        let slot = view.entry_slot(root.kernel, VirtualAddress::new(0x2000)).unwrap();
        assert_eq!(slot.index, 2);
        assert!(view.read(slot).is_free());
        assert!(view.get(root.kernel, VirtualAddress::new(0x2000)).is_none());

        let mapped = view.get(root.kernel, VirtualAddress::new(0x1000)).unwrap();
        assert_eq!(mapped.table, slot.table);
        assert!(matches!(view.decode(mapped), PageTableEntry::Leaf { .. }));
    }

    #[test]
    fn none_permission_is_still_mapped() {
        let (mut session, root) = active(&Geometry::X86_PAE, &[]);
        let pfn = session.allocate_frame().unwrap();
        session.map_user_page(root, VirtualAddress::new(0x7000), pfn, Permission::NONE);

        let view = session.view();
        let slot = view.get(root.kernel, VirtualAddress::new(0x7000)).unwrap();
        assert_eq!(view.permission(slot), Permission::NONE);
        assert!(!view.read(slot).is_present());
        assert_eq!(view.next_present(root.kernel, 0, 0x10000), 0x7000);
    }

    #[test]
    #[should_panic(expected = "is not a mapped leaf")]
    fn permission_of_a_link_panics() {
        let (session, root) = active(&Geometry::X86_64, &[0x1000]);
        let view = session.view();
        let slot = view.slot_at(root.kernel, 0x1000, 2).unwrap();
        view.permission(slot);
    }
}
