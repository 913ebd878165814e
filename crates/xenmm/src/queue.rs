//! Deferred page table updates.
//!
//! Once a table page is pinned the guest may not store into it; every change becomes an
//! [`MmuUpdate`] that the hypervisor validates. Updates are collected here and submitted
//! in one hypercall, after which the active roots are reloaded so no stale paging
//! structure survives the batch.

use alloc::vec::Vec;
use core::fmt;

use crate::{
    Hypervisor, HypervisorError, MAX_OFFLINE_PAGES, MachineAddress, MachineFrameNumber,
    MmuUpdate, RawEntry, VirtualAddress,
};

/// Number of updates buffered before the queue flushes on its own.
///
/// Completing an offline tree revokes write access to every tracked page plus both roots
/// in a single batch.
pub const QUEUE_CAPACITY: usize = MAX_OFFLINE_PAGES + 2;

/// The roots currently loaded on the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveBase {
    pub kernel: MachineFrameNumber,
    pub user: Option<MachineFrameNumber>,
}

/// Post-update TLB maintenance, chosen once when the queue is created.
///
/// Some Intel Core i7 parts keep stale translations for addresses whose leaf was rewritten
/// through the hypervisor; [`InvalidateHook::LOCAL`] flushes them explicitly.
#[derive(Clone, Copy)]
pub struct InvalidateHook {
    name: &'static str,
    apply: fn(&mut dyn Hypervisor, VirtualAddress) -> Result<(), HypervisorError>,
}

impl InvalidateHook {
    /// Leave the TLB alone.
    pub const NONE: InvalidateHook = InvalidateHook::new("none", |_, _| Ok(()));

    /// Invalidate the changed address on the local CPU.
    pub const LOCAL: InvalidateHook =
        InvalidateHook::new("invlpg-local", |hypervisor, vaddr| {
            hypervisor.invalidate_page_local(vaddr)
        });

    /// Creates a hook from a function.
    pub const fn new(
        name: &'static str,
        apply: fn(&mut dyn Hypervisor, VirtualAddress) -> Result<(), HypervisorError>,
    ) -> Self {
        Self { name, apply }
    }
}

impl fmt::Debug for InvalidateHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidateHook({})", self.name)
    }
}

/// Bounded buffer of pending page table updates.
pub struct UpdateQueue {
    updates: Vec<MmuUpdate>,
    capacity: usize,
    base: Option<ActiveBase>,
    invalidate: InvalidateHook,
    flushes: usize,
    committed: usize,
}

impl UpdateQueue {
    /// Creates an empty queue of [`QUEUE_CAPACITY`] updates.
    pub fn new(invalidate: InvalidateHook) -> Self {
        Self::with_capacity(QUEUE_CAPACITY, invalidate)
    }

    /// Creates an empty queue that flushes every `capacity` updates.
    pub fn with_capacity(capacity: usize, invalidate: InvalidateHook) -> Self {
        assert!(capacity > 0, "update queue needs room for one update");
        Self {
            updates: Vec::with_capacity(capacity),
            capacity,
            base: None,
            invalidate,
            flushes: 0,
            committed: 0,
        }
    }

    /// Returns the updates waiting to be committed.
    pub fn pending(&self) -> &[MmuUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Number of batches submitted so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Number of updates committed so far.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Returns the roots reloaded after every batch.
    pub fn base(&self) -> Option<ActiveBase> {
        self.base
    }

    /// Sets the roots reloaded after every batch.
    pub fn set_base(&mut self, base: Option<ActiveBase>) {
        self.base = base;
    }

    /// Appends an update, flushing first if the buffer is full.
    pub fn enqueue<H: Hypervisor>(&mut self, hypervisor: &mut H, slot: MachineAddress, value: RawEntry) {
        if self.updates.len() >= self.capacity {
            self.flush(hypervisor);
        }
        log::trace!("queue {slot:?} <- {value:?}");
        self.updates.push(MmuUpdate {
            ptr: slot,
            val: value,
        });
    }

    /// Commits every pending update in one hypercall, then reloads the active roots.
    ///
    /// # Panics
    /// Panics if the hypervisor rejects the batch; the tree is inconsistent at that point.
    pub fn flush<H: Hypervisor>(&mut self, hypervisor: &mut H) {
        if self.updates.is_empty() {
            return;
        }
        log::debug!("committing {} page table updates", self.updates.len());
        if let Err(err) = hypervisor.mmu_update(&self.updates) {
            log::error!("mmu_update of {} entries failed: {err}", self.updates.len());
            panic!("mmu_update failed: {err}");
        }
        self.committed += self.updates.len();
        self.flushes += 1;
        self.updates.clear();
        self.reload(hypervisor);
    }

    /// Reloads the active roots, if any have been loaded yet.
    pub fn reload<H: Hypervisor>(&self, hypervisor: &mut H) {
        let Some(base) = self.base else {
            return;
        };
        if let Err(err) = hypervisor.new_base(base.kernel, base.user) {
            log::error!("loading {base:?} failed: {err}");
            panic!("new_base failed: {err}");
        }
    }

    /// Runs the TLB hook for an address whose leaf has been committed.
    pub fn invalidate<H: Hypervisor>(&self, hypervisor: &mut H, vaddr: VirtualAddress) {
        if let Err(err) = (self.invalidate.apply)(hypervisor, vaddr) {
            log::error!("invalidating {vaddr:?} failed: {err}");
            panic!("TLB invalidation failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[derive(Default)]
    struct Recorder {
        batches: Vec<Vec<MmuUpdate>>,
        loads: Vec<ActiveBase>,
        invalidated: Vec<VirtualAddress>,
        reject: bool,
    }

    impl Hypervisor for Recorder {
        fn mmu_update(&mut self, updates: &[MmuUpdate]) -> Result<(), HypervisorError> {
            if self.reject {
                return Err(HypervisorError(-22));
            }
            self.batches.push(updates.to_vec());
            Ok(())
        }

        fn pin_table(&mut self, _: MachineFrameNumber, _: usize) -> Result<(), HypervisorError> {
            Ok(())
        }

        fn unpin_table(&mut self, _: MachineFrameNumber) -> Result<(), HypervisorError> {
            Ok(())
        }

        fn new_base(
            &mut self,
            kernel: MachineFrameNumber,
            user: Option<MachineFrameNumber>,
        ) -> Result<(), HypervisorError> {
            self.loads.push(ActiveBase { kernel, user });
            Ok(())
        }

        fn invalidate_page_local(&mut self, vaddr: VirtualAddress) -> Result<(), HypervisorError> {
            self.invalidated.push(vaddr);
            Ok(())
        }
    }

    fn slot(n: usize) -> MachineAddress {
        MachineAddress::new(0x10_0000 + n * 8)
    }

    fn base() -> ActiveBase {
        ActiveBase {
            kernel: MachineFrameNumber::new(0x40),
            user: Some(MachineFrameNumber::new(0x41)),
        }
    }

    #[test]
    fn batching_defers_until_flush() {
        let mut hypervisor = Recorder::default();
        let mut queue = UpdateQueue::new(InvalidateHook::NONE);
        queue.set_base(Some(base()));

        for n in 0..5 {
            queue.enqueue(&mut hypervisor, slot(n), RawEntry::from_bits(n as u64));
        }
        assert!(hypervisor.batches.is_empty());
        assert_eq!(queue.pending().len(), 5);

        queue.flush(&mut hypervisor);
        assert_eq!(hypervisor.batches.len(), 1);
        let values: Vec<u64> = hypervisor.batches[0].iter().map(|u| u.val.bits()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(hypervisor.loads, vec![base()]);
        assert!(queue.is_empty());
        assert_eq!(queue.committed(), 5);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let mut hypervisor = Recorder::default();
        let mut queue = UpdateQueue::new(InvalidateHook::NONE);
        queue.set_base(Some(base()));
        queue.flush(&mut hypervisor);
        assert!(hypervisor.batches.is_empty());
        assert!(hypervisor.loads.is_empty());
        assert_eq!(queue.flushes(), 0);
    }

    #[test]
    fn full_queue_flushes_before_appending() {
        let mut hypervisor = Recorder::default();
        let mut queue = UpdateQueue::with_capacity(2, InvalidateHook::NONE);
        for n in 0..5 {
            queue.enqueue(&mut hypervisor, slot(n), RawEntry::from_bits(n as u64));
        }
        assert_eq!(hypervisor.batches.len(), 2);
        assert_eq!(hypervisor.batches[1][0].ptr, slot(2));
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.pending()[0].ptr, slot(4));
    }

    #[test]
    fn no_base_means_no_reload() {
        let mut hypervisor = Recorder::default();
        let mut queue = UpdateQueue::new(InvalidateHook::NONE);
        queue.enqueue(&mut hypervisor, slot(0), RawEntry::FREE);
        queue.flush(&mut hypervisor);
        assert_eq!(hypervisor.batches.len(), 1);
        assert!(hypervisor.loads.is_empty());
    }

    #[test]
    #[should_panic(expected = "mmu_update failed")]
    fn rejected_batch_is_fatal() {
        let mut hypervisor = Recorder {
            reject: true,
            ..Default::default()
        };
        let mut queue = UpdateQueue::new(InvalidateHook::NONE);
        queue.enqueue(&mut hypervisor, slot(0), RawEntry::FREE);
        queue.flush(&mut hypervisor);
    }

    #[test]
    fn invalidate_hook_strategies() {
        let mut hypervisor = Recorder::default();
        let vaddr = VirtualAddress::new(0x40_0000);

        UpdateQueue::new(InvalidateHook::NONE).invalidate(&mut hypervisor, vaddr);
        assert!(hypervisor.invalidated.is_empty());

        UpdateQueue::new(InvalidateHook::LOCAL).invalidate(&mut hypervisor, vaddr);
        assert_eq!(hypervisor.invalidated, vec![vaddr]);
    }
}
