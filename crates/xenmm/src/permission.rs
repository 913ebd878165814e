//! Access permissions of user mappings.

use bitflags::bitflags;

use crate::PteFlags;

bitflags! {
    /// Access rights requested for a mapping.
    ///
    /// The hardware can express only three of these combinations, so a leaf always
    /// decodes to [`Permission::empty`], `READ | EXEC` or `READ | WRITE | EXEC`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Permission {
    /// No access; the mapping stays valid so the frame is still accounted for.
    pub const NONE: Permission = Permission::empty();

    /// Read, write and execute.
    pub const ALL: Permission = Permission::all();

    /// Decodes the permission of a valid leaf.
    ///
    /// Bit 7 is the `PERM_NONE` marker only on a non-present leaf; on a present one it
    /// selects the PAT entry.
    pub fn from_leaf(flags: PteFlags) -> Self {
        if !flags.contains(PteFlags::PRESENT) {
            Self::NONE
        } else if flags.contains(PteFlags::WRITABLE) {
            Self::READ | Self::WRITE | Self::EXEC
        } else {
            Self::READ | Self::EXEC
        }
    }

    /// Computes the flags of a leaf granting this permission.
    ///
    /// `NONE` leaves carry only the `PERM_NONE` marker so they fault on every access while
    /// remaining distinguishable from a free entry.
    pub fn leaf_flags(self, user: bool) -> PteFlags {
        let mut flags = PteFlags::empty();
        flags.set(PteFlags::USER, user);
        if self.is_empty() {
            return flags | PteFlags::PERM_NONE;
        }
        flags |= PteFlags::PRESENT;
        flags.set(PteFlags::WRITABLE, self.contains(Self::WRITE));
        flags
    }
}
