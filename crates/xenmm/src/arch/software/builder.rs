//! Emulated domain construction.

use alloc::{collections::BTreeSet, sync::Arc};

use crate::{
    AddressTranslator, FrameAllocator, FrameNumber, Geometry, Hypervisor, InvalidateHook,
    MachineFrameNumber, PageTableSession, PteFlags, RawEntry, SessionConfig, StartInfo, arch,
};

use super::{EmulatedMachine, SoftHypervisor};

/// Hands out the frames the domain builder left free, lowest first.
pub struct EmulatedFrameAllocator {
    machine: Arc<EmulatedMachine>,
    free: BTreeSet<FrameNumber>,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator owning the frames in `free`.
    pub fn new(machine: Arc<EmulatedMachine>, free: impl IntoIterator<Item = FrameNumber>) -> Self {
        Self {
            machine,
            free: free.into_iter().collect(),
        }
    }

    /// Returns the number of free frames.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Returns true if the frame is free.
    pub fn is_free(&self, pfn: FrameNumber) -> bool {
        self.free.contains(&pfn)
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn allocate_zeroed(&mut self) -> Option<FrameNumber> {
        let pfn = self.free.pop_first()?;
        self.machine
            .zero(MachineFrameNumber::new(self.machine.phys_to_machine()[pfn.as_usize()]));
        Some(pfn)
    }

    fn free(&mut self, frame: FrameNumber) {
        assert!(self.free.insert(frame), "{frame:?} freed twice");
    }
}

/// Everything a freshly built domain hands to its kernel.
pub struct Domain {
    pub geometry: &'static Geometry,
    pub machine: Arc<EmulatedMachine>,
    pub translator: AddressTranslator,
    pub hypervisor: SoftHypervisor,
    pub allocator: EmulatedFrameAllocator,
    pub start_info: StartInfo,
}

impl Domain {
    /// Starts a page table session over this domain.
    pub fn session(self) -> PageTableSession<SoftHypervisor, EmulatedFrameAllocator> {
        self.session_with(InvalidateHook::NONE)
    }

    /// Starts a page table session with a specific TLB invalidation strategy.
    pub fn session_with(
        self,
        invalidate: InvalidateHook,
    ) -> PageTableSession<SoftHypervisor, EmulatedFrameAllocator> {
        PageTableSession::new(
            SessionConfig::new(self.geometry).with_invalidate(invalidate),
            self.translator,
            self.hypervisor,
            self.allocator,
            self.start_info,
        )
    }
}

/// Lays out an emulated domain the way Xen's domain builder does.
///
/// The boot page table maps the first `mapped` guest frames at the geometry's direct map
/// offset with kernel protections. Its own table pages come first in pseudo-physical memory
/// and are mapped read-only, and the root is pinned before the kernel starts.
pub struct DomainBuilder {
    geometry: &'static Geometry,
    frames: usize,
    mapped: usize,
}

impl DomainBuilder {
    /// Creates a builder for a domain of `frames` guest frames, all of them mapped.
    pub fn new(geometry: &'static Geometry, frames: usize) -> Self {
        Self {
            geometry,
            frames,
            mapped: frames,
        }
    }

    /// Limits the direct map to the first `mapped` frames.
    pub fn mapped(mut self, mapped: usize) -> Self {
        self.mapped = mapped;
        self
    }

    pub fn build(self) -> Domain {
        let geometry = self.geometry;
        let entries = arch::ENTRIES_PER_PAGE;
        assert!(self.mapped <= self.frames, "cannot map more frames than exist");
        assert!(self.mapped > 0, "the direct map must at least cover the boot tables");
        assert!(
            self.mapped <= entries * entries,
            "boot direct map is limited to one second-level table"
        );

        // Root, one table per level down to level 2, then the leaf tables.
        let leaf_tables = self.mapped.div_ceil(entries);
        let boot_tables = geometry.levels - 1 + leaf_tables;
        assert!(
            boot_tables < self.mapped,
            "boot tables must be covered by the direct map"
        );

        let machine = Arc::new(EmulatedMachine::new(self.frames));
        let mfn = |pfn: usize| MachineFrameNumber::new(machine.phys_to_machine()[pfn]);
        let offset = geometry.direct_map_offset;

        // pfn of the table at `level` on the single path above the leaf tables.
        let path = |level: usize| geometry.levels - level;
        for level in (2..=geometry.levels).rev() {
            let table = path(level);
            if level > 2 {
                let child = path(level - 1);
                let link = RawEntry::new(mfn(child).start(), geometry.link_flags(level));
                machine.write(mfn(table), geometry.index(offset, level), link.bits());
            } else {
                for n in 0..leaf_tables {
                    let child = geometry.levels - 1 + n;
                    let vaddr = offset + n * geometry.span(2);
                    let link = RawEntry::new(mfn(child).start(), geometry.link_flags(2));
                    machine.write(mfn(table), geometry.index(vaddr, 2), link.bits());
                }
            }
        }

        for pfn in 0..self.mapped {
            let vaddr = offset + (pfn << arch::PAGE_SHIFT);
            let table = geometry.levels - 1 + pfn / entries;
            let mut flags = geometry.kernel_leaf_flags;
            if pfn < boot_tables {
                flags.remove(PteFlags::WRITABLE);
            }
            let leaf = RawEntry::new(mfn(pfn).start(), flags);
            machine.write(mfn(table), geometry.index(vaddr, 1), leaf.bits());
        }

        let master = mfn(0);
        let mut hypervisor = SoftHypervisor::new(machine.clone(), geometry, master);
        if let Err(err) = hypervisor.pin_table(master, geometry.levels) {
            panic!("boot page table failed validation: {err}");
        }

        log::debug!(
            "built {} domain: {} frames, {} mapped, {boot_tables} boot tables",
            geometry.name,
            self.frames,
            self.mapped
        );

        Domain {
            geometry,
            translator: AddressTranslator::emulated(offset, machine.clone()),
            hypervisor,
            allocator: EmulatedFrameAllocator::new(
                machine.clone(),
                (boot_tables..self.frames).map(FrameNumber::new),
            ),
            start_info: StartInfo {
                master_root: FrameNumber::new(0),
                boot_table_frames: boot_tables,
                first_free_frame: FrameNumber::new(boot_tables),
                mapped_frames: self.mapped,
                total_frames: self.frames,
            },
            machine,
        }
    }
}
