//! Debug dumps of page table trees.
//!
//! Nothing here changes a table; output goes to the kernel log at info level.

use alloc::vec::Vec;

use crate::{
    FrameAllocator, FrameNumber, Hypervisor, MAX_LEVELS, PageTableSession, RawEntry, RootTable,
    Slot, VirtualAddress,
};

/// One level of a [`PageTableSession::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStep {
    pub level: usize,
    pub index: usize,
    pub table: FrameNumber,
    pub entry: RawEntry,
}

/// Table pages and valid leaves of the user half of a tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStatistics {
    /// Table pages per level; index 0 holds leaf tables.
    pub tables: [usize; MAX_LEVELS],
    pub leaves: usize,
}

impl TableStatistics {
    /// Number of table pages, the root included.
    pub fn table_pages(&self) -> usize {
        self.tables.iter().sum()
    }

    /// Table pages plus mapped leaves.
    pub fn total(&self) -> usize {
        self.table_pages() + self.leaves
    }
}

impl<H: Hypervisor, A: FrameAllocator> PageTableSession<H, A> {
    /// Follows `vaddr` through the current tree, logging every entry on the way.
    ///
    /// Stops at the leaf or at the first free entry.
    pub fn walk(&self, vaddr: VirtualAddress) -> Vec<WalkStep> {
        let geometry = self.geometry;
        let addr = vaddr.as_usize();
        let mut steps = Vec::with_capacity(geometry.levels);
        let mut table = self.current.kernel;
        log::info!("walking {vaddr:?} from {table:?}");
        for level in (1..=geometry.levels).rev() {
            let index = geometry.index(addr, level);
            let entry = self.read(Slot::new(table, index, level));
            log::info!("  L{level}[{index:3}] of {table:?}: {entry:?}");
            steps.push(WalkStep {
                level,
                index,
                table,
                entry,
            });
            if entry.is_free() || level == 1 {
                break;
            }
            table = self.view().child(entry);
        }
        steps
    }

    /// Counts the table pages and leaves of the user half of `root`.
    pub fn statistics(&self, root: RootTable) -> TableStatistics {
        let geometry = self.geometry;
        let level = geometry.levels;
        let mut stats = TableStatistics::default();
        stats.tables[level - 1] = 1;
        for index in 0..geometry.user_root_entries {
            self.count_level(&mut stats, Slot::new(root.kernel, index, level));
        }
        log::info!(
            "{root:?}: {} pages, {} tables {:?}, {} leaves",
            stats.total(),
            stats.table_pages(),
            &stats.tables[..level],
            stats.leaves
        );
        stats
    }

    fn count_level(&self, stats: &mut TableStatistics, slot: Slot) {
        let raw = self.read(slot);
        if raw.is_free() {
            return;
        }
        if slot.level == 1 {
            stats.leaves += 1;
            return;
        }
        let child = self.view().child(raw);
        let level = slot.level - 1;
        stats.tables[level - 1] += 1;
        for index in 0..self.geometry.entries(level) {
            self.count_level(stats, Slot::new(child, index, level));
        }
    }

    /// Logs every present entry of the user half of `root`, tables before their contents.
    ///
    /// Returns the entries in the order they were printed.
    pub fn print_userspace(&self, root: RootTable) -> Vec<WalkStep> {
        let mut steps = Vec::new();
        log::info!("user half of {root:?}:");
        self.print_level(&mut steps, root.kernel, self.geometry.levels);
        steps
    }

    fn print_level(&self, steps: &mut Vec<WalkStep>, table: FrameNumber, level: usize) {
        let geometry = self.geometry;
        let entries = if level == geometry.levels {
            geometry.user_root_entries
        } else {
            geometry.entries(level)
        };
        let indent = 2 * (geometry.levels - level + 1);
        for index in 0..entries {
            let entry = self.read(Slot::new(table, index, level));
            if entry.is_free() {
                continue;
            }
            steps.push(WalkStep {
                level,
                index,
                table,
                entry,
            });
            if level == 1 {
                log::info!("{:indent$}L1[{index:3}]: {entry:?}", "");
                continue;
            }
            log::info!(
                "{:indent$}L{level}[{index:3}]: {entry:?} table at {:?}",
                "",
                self.translator.mfn_to_virt(entry.frame())
            );
            self.print_level(steps, self.view().child(entry), level - 1);
        }
    }
}
