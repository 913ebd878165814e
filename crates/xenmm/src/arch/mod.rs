//! Architecture-specific definitions for memory management.
//!
//! Xen PV guests run either as 64-bit guests with four levels of page tables or as 32-bit
//! PAE guests with three. Both share the 64-bit entry format, so the walker is written once
//! and parameterized by a [`Geometry`] describing the tree shape.

mod x86_64;

pub use self::x86_64::{PteFlags, RawEntry};

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

/// Maximum number of bits in a physical or machine address.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Page size exponent.
pub const PAGE_SHIFT: usize = 12;

/// Number of 64-bit entries that fit in one table page.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE / size_of::<u64>();

/// Deepest supported tree.
pub const MAX_LEVELS: usize = 4;

/// Maximum number of table pages an offline tree may allocate before it is completed.
pub const MAX_OFFLINE_PAGES: usize = 4096;

/// Machine-to-physical entry of a frame that does not belong to this domain.
pub const INVALID_M2P_ENTRY: usize = !0;

/// Validates a physical or machine address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Validates a virtual address.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

/// Sign-extends bit 47 so an address computed from table indices becomes canonical.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Shape of a page table tree.
///
/// Levels are numbered from 1 (the leaf tables) up to [`Geometry::levels`] (the root).
/// Each level has its own index width and its own protection bits for entries that link
/// to the level below.
#[derive(Debug)]
pub struct Geometry {
    /// Human-readable name used in diagnostics.
    pub name: &'static str,
    /// Number of levels, 3 or 4.
    pub levels: usize,
    shifts: [usize; MAX_LEVELS],
    entries: [usize; MAX_LEVELS],
    link_flags: [PteFlags; MAX_LEVELS],
    /// Number of root entries covering user space; the rest map the kernel.
    pub user_root_entries: usize,
    /// First address above user space.
    pub userspace_end: usize,
    /// Every root is paired with a shadow root that user mode runs on.
    pub dual_root: bool,
    /// The kernel's first-level-below-root table is copied into every address space
    /// instead of being shared.
    pub private_kernel_table: bool,
    /// Highest level whose kernel entries are shared between all address spaces; missing
    /// entries at this level are propagated lazily from the master table.
    pub shared_level: usize,
    /// Flags of kernel leaf entries.
    pub kernel_leaf_flags: PteFlags,
    /// Where the domain builder maps pseudo-physical memory.
    pub direct_map_offset: usize,
}

impl Geometry {
    /// Returns the level of the root table.
    #[inline]
    pub const fn root_level(&self) -> usize {
        self.levels
    }

    /// Returns the address bit at which the index for `level` starts.
    #[inline]
    pub const fn shift(&self, level: usize) -> usize {
        assert!(level >= 1 && level <= self.levels, "level out of range");
        self.shifts[level - 1]
    }

    /// Returns the number of entries in a table at `level`.
    #[inline]
    pub const fn entries(&self, level: usize) -> usize {
        assert!(level >= 1 && level <= self.levels, "level out of range");
        self.entries[level - 1]
    }

    /// Returns the number of bytes of address space covered by one entry at `level`.
    #[inline]
    pub const fn span(&self, level: usize) -> usize {
        1 << self.shift(level)
    }

    /// Returns the index of `addr` in a table at `level`.
    #[inline]
    pub const fn index(&self, addr: usize, level: usize) -> usize {
        (addr >> self.shift(level)) & (self.entries(level) - 1)
    }

    /// Returns the flags of an entry at `level` that links to a table one level down.
    #[inline]
    pub const fn link_flags(&self, level: usize) -> PteFlags {
        assert!(level > 1 && level <= self.levels, "leaf entries do not link tables");
        self.link_flags[level - 1]
    }

    /// Returns true if `addr` lies in the user half of the address space.
    #[inline]
    pub const fn is_user(&self, addr: usize) -> bool {
        addr < self.userspace_end
    }
}
