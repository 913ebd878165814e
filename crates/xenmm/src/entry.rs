//! Decoded page table entries.
//!
//! The walker reads [`RawEntry`] values out of table pages and decodes them with the level
//! they were found at, so an entry is never ambiguous between "points to a table" and
//! "maps a page". Entries are packed again only when they are handed to the hypervisor.

use crate::{MachineFrameNumber, Permission, PteFlags, RawEntry};

/// A page table entry, decoded according to the level it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableEntry {
    /// Nothing is mapped.
    Free,
    /// Links a table one level down.
    Node {
        child: MachineFrameNumber,
        flags: PteFlags,
    },
    /// Maps one page.
    Leaf {
        frame: MachineFrameNumber,
        permission: Permission,
        flags: PteFlags,
    },
}

impl PageTableEntry {
    /// Decodes an entry read from a table at `level`.
    pub fn decode(raw: RawEntry, level: usize) -> Self {
        if raw.is_free() {
            Self::Free
        } else if level > 1 {
            Self::Node {
                child: raw.frame(),
                flags: raw.flags(),
            }
        } else {
            Self::Leaf {
                frame: raw.frame(),
                permission: Permission::from_leaf(raw.flags()),
                flags: raw.flags(),
            }
        }
    }

    /// Builds a link to the table in `child`.
    pub fn node(child: MachineFrameNumber, flags: PteFlags) -> Self {
        Self::Node { child, flags }
    }

    /// Builds a user or kernel leaf mapping `frame` with `permission`.
    pub fn leaf(frame: MachineFrameNumber, permission: Permission, user: bool) -> Self {
        Self::Leaf {
            frame,
            permission,
            flags: permission.leaf_flags(user),
        }
    }

    /// Packs the entry into the format the hypervisor validates.
    pub fn encode(self) -> RawEntry {
        match self {
            Self::Free => RawEntry::FREE,
            Self::Node { child, flags } => RawEntry::new(child.start(), flags),
            Self::Leaf { frame, flags, .. } => RawEntry::new(frame.start(), flags),
        }
    }

    /// Returns the permission of a leaf, or `None` for anything else.
    pub fn permission(self) -> Option<Permission> {
        match self {
            Self::Leaf { permission, .. } => Some(permission),
            _ => None,
        }
    }

    /// Returns the machine frame the entry refers to.
    pub fn frame(self) -> Option<MachineFrameNumber> {
        match self {
            Self::Free => None,
            Self::Node { child, .. } => Some(child),
            Self::Leaf { frame, .. } => Some(frame),
        }
    }
}

impl From<PageTableEntry> for RawEntry {
    fn from(entry: PageTableEntry) -> Self {
        entry.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bits_decode_by_level() {
        let raw = RawEntry::from_bits(0x0004_2067);
        assert_eq!(
            PageTableEntry::decode(raw, 2),
            PageTableEntry::Node {
                child: MachineFrameNumber::new(0x42),
                flags: PteFlags::from_bits_retain(0x67),
            }
        );
        assert_eq!(
            PageTableEntry::decode(raw, 1).permission(),
            Some(Permission::ALL)
        );
    }

    #[test]
    fn leaf_encoding_round_trips() {
        let leaf = PageTableEntry::leaf(MachineFrameNumber::new(0x99), Permission::READ, true);
        let raw = leaf.encode();
        assert_eq!(raw.bits(), 0x9_9005);
        assert_eq!(
            PageTableEntry::decode(raw, 1).permission(),
            Some(Permission::READ | Permission::EXEC)
        );
    }

    #[test]
    fn permission_none_leaf_is_distinct_from_free() {
        let leaf = PageTableEntry::leaf(MachineFrameNumber::new(3), Permission::NONE, true);
        let raw = leaf.encode();
        assert!(!raw.is_free());
        assert_eq!(PageTableEntry::decode(raw, 1).permission(), Some(Permission::NONE));
        assert_eq!(PageTableEntry::decode(RawEntry::FREE, 1), PageTableEntry::Free);
    }
}
