//! A hypervisor that enforces the page table rules of Xen PV guests.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec::Vec,
};

use crate::{
    ActiveBase, Geometry, Hypervisor, HypervisorError, MachineFrameNumber, MmuUpdate, PteFlags,
    RawEntry, VirtualAddress, arch,
};

use super::EmulatedMachine;

/// Invalid argument.
const EINVAL: i64 = -22;

/// Operation not permitted.
const EPERM: i64 = -1;

/// The hypercalls a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    MmuUpdate,
    PinTable,
    UnpinTable,
    NewBase,
    InvalidatePage,
}

/// A validated page table page: its level and how many links or pins hold it.
#[derive(Debug, Clone, Copy)]
struct TableType {
    level: usize,
    references: usize,
}

/// Emulated hypervisor.
///
/// Like Xen, it tracks which machine frames currently serve as page tables. A frame gains
/// that type when it is pinned or linked from a validated table and loses it when the last
/// such reference goes away. While it has the type:
/// - the guest's direct map must not map it writable
/// - no leaf may be added that maps it writable
/// - only entries that are valid for its level may be stored into it
///
/// Updates to frames without the type are applied unchecked.
pub struct SoftHypervisor {
    machine: Arc<EmulatedMachine>,
    geometry: &'static Geometry,
    master: MachineFrameNumber,
    tables: BTreeMap<MachineFrameNumber, TableType>,
    pinned: BTreeSet<MachineFrameNumber>,
    base: Option<ActiveBase>,
    loads: usize,
    batches: usize,
    updates: usize,
    invalidated: Vec<VirtualAddress>,
    /// Error to return from the next hypercall, or the next one of the given kind.
    fail_next: Option<(Option<Hypercall>, i64)>,
}

impl SoftHypervisor {
    /// Creates a hypervisor for a domain whose boot table is rooted at `master`.
    ///
    /// The boot table is not pinned yet; the domain builder does that.
    pub fn new(
        machine: Arc<EmulatedMachine>,
        geometry: &'static Geometry,
        master: MachineFrameNumber,
    ) -> Self {
        Self {
            machine,
            geometry,
            master,
            tables: BTreeMap::new(),
            pinned: BTreeSet::new(),
            base: None,
            loads: 0,
            batches: 0,
            updates: 0,
            invalidated: Vec::new(),
            fail_next: None,
        }
    }

    /// Makes the next hypercall fail with `errno`.
    pub fn fail_next(&mut self, errno: i64) {
        self.fail_next = Some((None, errno));
    }

    /// Makes the next `call` fail with `errno`; other hypercalls go through until then.
    pub fn fail_next_call(&mut self, call: Hypercall, errno: i64) {
        self.fail_next = Some((Some(call), errno));
    }

    /// Returns the roots most recently loaded.
    pub fn base(&self) -> Option<ActiveBase> {
        self.base
    }

    /// Number of successful `new_base` calls.
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Number of successful `mmu_update` calls.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Number of individual updates applied.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Addresses passed to `invalidate_page_local`, in order.
    pub fn invalidated(&self) -> &[VirtualAddress] {
        &self.invalidated
    }

    /// Returns true if the frame is pinned.
    pub fn is_pinned(&self, mfn: MachineFrameNumber) -> bool {
        self.pinned.contains(&mfn)
    }

    /// Returns the level a frame is validated as, or `None` if it is not a page table.
    pub fn table_level(&self, mfn: MachineFrameNumber) -> Option<usize> {
        self.tables.get(&mfn).map(|table| table.level)
    }

    fn check_injected_failure(&mut self, call: Hypercall) -> Result<(), HypervisorError> {
        match self.fail_next {
            Some((target, errno)) if target.is_none_or(|target| target == call) => {
                self.fail_next = None;
                Err(HypervisorError(errno))
            }
            _ => Ok(()),
        }
    }

    /// Finds the leaf of the master direct map that maps `mfn`.
    fn direct_map_leaf(&self, mfn: MachineFrameNumber) -> Option<RawEntry> {
        let pfn = *self.machine.machine_to_phys().get(mfn.as_usize())?;
        if pfn == arch::INVALID_M2P_ENTRY {
            return None;
        }
        let vaddr = self.geometry.direct_map_offset + (pfn << arch::PAGE_SHIFT);
        let mut table = self.master;
        for level in (1..=self.geometry.levels).rev() {
            let raw = RawEntry::from_bits(
                self.machine.read(table, self.geometry.index(vaddr, level)),
            );
            if raw.is_free() {
                return None;
            }
            if level == 1 {
                return Some(raw);
            }
            table = raw.frame();
        }
        None
    }

    fn is_writable(&self, mfn: MachineFrameNumber) -> bool {
        self.direct_map_leaf(mfn)
            .is_some_and(|leaf| leaf.is_present() && leaf.flags().contains(PteFlags::WRITABLE))
    }

    /// Gives `mfn` the page table type for `level`, validating its contents the first time.
    fn acquire(&mut self, mfn: MachineFrameNumber, level: usize) -> Result<(), HypervisorError> {
        if let Some(table) = self.tables.get_mut(&mfn) {
            if table.level != level {
                log::warn!("{mfn:?} is a level {} table, not level {level}", table.level);
                return Err(HypervisorError(EINVAL));
            }
            table.references += 1;
            return Ok(());
        }
        if self.is_writable(mfn) {
            log::warn!("{mfn:?} is still mapped writable");
            return Err(HypervisorError(EINVAL));
        }
        for index in 0..self.geometry.entries(level) {
            let raw = RawEntry::from_bits(self.machine.read(mfn, index));
            self.validate(level, raw)?;
        }
        self.tables.insert(
            mfn,
            TableType {
                level,
                references: 1,
            },
        );
        Ok(())
    }

    /// Drops one reference to the page table type of `mfn`.
    fn release(&mut self, mfn: MachineFrameNumber) -> Result<(), HypervisorError> {
        let Some(table) = self.tables.get_mut(&mfn) else {
            log::warn!("{mfn:?} is not a page table");
            return Err(HypervisorError(EINVAL));
        };
        table.references -= 1;
        if table.references > 0 {
            return Ok(());
        }
        let level = table.level;
        self.tables.remove(&mfn);
        if level > 1 {
            for index in 0..self.geometry.entries(level) {
                let raw = RawEntry::from_bits(self.machine.read(mfn, index));
                if !raw.is_free() {
                    self.release(raw.frame())?;
                }
            }
        }
        Ok(())
    }

    /// Checks an entry about to live in a table at `level` and takes the references it needs.
    fn validate(&mut self, level: usize, raw: RawEntry) -> Result<(), HypervisorError> {
        if raw.is_free() {
            return Ok(());
        }
        if level > 1 {
            if !raw.is_present() {
                return Err(HypervisorError(EINVAL));
            }
            return self.acquire(raw.frame(), level - 1);
        }
        let writable = raw.is_present() && raw.flags().contains(PteFlags::WRITABLE);
        if writable && self.tables.contains_key(&raw.frame()) {
            log::warn!("refusing writable mapping of page table {:?}", raw.frame());
            return Err(HypervisorError(EPERM));
        }
        Ok(())
    }

    fn apply(&mut self, update: &MmuUpdate) -> Result<(), HypervisorError> {
        let mfn = update.ptr.frame_number();
        let offset = update.ptr.page_offset();
        if offset % size_of::<u64>() != 0 {
            return Err(HypervisorError(EINVAL));
        }
        let index = offset / size_of::<u64>();

        let Some(level) = self.table_level(mfn) else {
            log::warn!("update of {:?} which is not a page table", update.ptr);
            return Err(HypervisorError(EINVAL));
        };
        if index >= self.geometry.entries(level) {
            return Err(HypervisorError(EINVAL));
        }

        let old = RawEntry::from_bits(self.machine.read(mfn, index));
        self.validate(level, update.val)?;
        self.machine.write(mfn, index, update.val.bits());
        if level > 1 && !old.is_free() {
            self.release(old.frame())?;
        }
        Ok(())
    }
}

impl Hypervisor for SoftHypervisor {
    fn mmu_update(&mut self, updates: &[MmuUpdate]) -> Result<(), HypervisorError> {
        self.check_injected_failure(Hypercall::MmuUpdate)?;
        for update in updates {
            self.apply(update)?;
            self.updates += 1;
        }
        self.batches += 1;
        Ok(())
    }

    fn pin_table(&mut self, table: MachineFrameNumber, level: usize) -> Result<(), HypervisorError> {
        self.check_injected_failure(Hypercall::PinTable)?;
        if level != self.geometry.levels || self.pinned.contains(&table) {
            return Err(HypervisorError(EINVAL));
        }
        self.acquire(table, level)?;
        self.pinned.insert(table);
        Ok(())
    }

    fn unpin_table(&mut self, table: MachineFrameNumber) -> Result<(), HypervisorError> {
        self.check_injected_failure(Hypercall::UnpinTable)?;
        if !self.pinned.remove(&table) {
            return Err(HypervisorError(EINVAL));
        }
        self.release(table)
    }

    fn new_base(
        &mut self,
        kernel: MachineFrameNumber,
        user: Option<MachineFrameNumber>,
    ) -> Result<(), HypervisorError> {
        self.check_injected_failure(Hypercall::NewBase)?;
        if !self.pinned.contains(&kernel) || user.is_some_and(|user| !self.pinned.contains(&user)) {
            return Err(HypervisorError(EINVAL));
        }
        self.base = Some(ActiveBase { kernel, user });
        self.loads += 1;
        Ok(())
    }

    fn invalidate_page_local(&mut self, vaddr: VirtualAddress) -> Result<(), HypervisorError> {
        self.check_injected_failure(Hypercall::InvalidatePage)?;
        self.invalidated.push(vaddr);
        Ok(())
    }
}
