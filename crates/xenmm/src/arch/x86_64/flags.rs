//! Page table entry flags.

use core::fmt;

use bitflags::bitflags;

use super::entry::RawEntry;

bitflags! {
    /// Low flag bits of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Valid but inaccessible page. Shares the large-page bit, which the MMU ignores
        /// while `PRESENT` is clear.
        const PERM_NONE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// Writes the hardware names of the flags set in `entry`.
#[cfg(target_arch = "x86_64")]
pub(super) fn describe(entry: RawEntry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use x86_64::structures::paging::PageTableFlags;

    if !entry.is_present() && entry.flags().contains(PteFlags::PERM_NONE) {
        return write!(f, "PERM_NONE");
    }
    let flags = PageTableFlags::from_bits_truncate(entry.flags().bits());
    write!(f, "{flags:?}")
}

/// Writes the names of the flags set in `entry`.
#[cfg(not(target_arch = "x86_64"))]
pub(super) fn describe(entry: RawEntry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", entry.flags())
}
