//! x86 page table formats as seen by a Xen PV guest.
//!
//! Both supported modes use 64-bit entries. Long mode has four levels of 512 entries; PAE
//! has a 4-entry root above two levels of 512 entries. Xen additionally requires a 64-bit
//! guest to supply a separate user-mode root, and forbids a PAE guest from sharing the
//! kernel's second-level table between roots.

mod entry;
mod flags;

pub use entry::RawEntry;
pub use flags::PteFlags;

use super::{Geometry, PAGE_SHIFT};

/// Protections of an entry linking a table into its parent.
const TABLE_LINK: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::ACCESSED)
    .union(PteFlags::DIRTY)
    .union(PteFlags::USER);

/// Protections of a kernel leaf. PV kernels run outside ring 0, so USER is required.
const KERNEL_LEAF: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::ACCESSED)
    .union(PteFlags::USER);

impl Geometry {
    /// 64-bit guest with four-level paging.
    pub const X86_64: Geometry = Geometry {
        name: "x86_64",
        levels: 4,
        shifts: [PAGE_SHIFT, 21, 30, 39],
        entries: [512, 512, 512, 512],
        link_flags: [PteFlags::empty(), TABLE_LINK, TABLE_LINK, TABLE_LINK],
        user_root_entries: 256,
        userspace_end: 1 << 47,
        dual_root: true,
        private_kernel_table: false,
        shared_level: 4,
        kernel_leaf_flags: KERNEL_LEAF,
        direct_map_offset: 0xFFFF_8000_0000_0000,
    };

    /// 32-bit guest with PAE paging.
    pub const X86_PAE: Geometry = Geometry {
        name: "x86_pae",
        levels: 3,
        shifts: [PAGE_SHIFT, 21, 30, 0],
        entries: [512, 512, 4, 0],
        link_flags: [PteFlags::empty(), TABLE_LINK, PteFlags::PRESENT, PteFlags::empty()],
        user_root_entries: 3,
        userspace_end: 0xC000_0000,
        dual_root: false,
        private_kernel_table: true,
        shared_level: 2,
        kernel_leaf_flags: KERNEL_LEAF,
        direct_map_offset: 0xC000_0000,
    };
}
