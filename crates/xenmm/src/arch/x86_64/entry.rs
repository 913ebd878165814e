//! Packed page table entry.

use core::fmt;

use crate::{MachineAddress, MachineFrameNumber};

use super::flags::PteFlags;

/// A single page table entry exactly as the MMU and the hypervisor see it.
///
/// Bits 12-51 hold a machine address and bits 0-8 hold [`PteFlags`]. Zero means free.
/// Any other value has `PRESENT` or, for inaccessible user pages, `PERM_NONE` set.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct RawEntry(u64);

impl RawEntry {
    /// Machine address mask for page table entries.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Low flag bits; everything above them is kept when flags are rewritten.
    const FLAGS_MASK: u64 = 0xFFF;

    /// The free entry.
    pub const FREE: Self = Self(0);

    /// Creates a new entry.
    ///
    /// The machine address must be page-aligned.
    pub fn new(address: MachineAddress, flags: PteFlags) -> Self {
        debug_assert!(
            address.page_offset() == 0,
            "machine address must be page-aligned"
        );
        Self((address.as_usize() as u64 & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Reinterprets a raw value.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns the machine address stored in this entry.
    pub fn address(self) -> MachineAddress {
        MachineAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    /// Returns the machine frame stored in this entry.
    pub fn frame(self) -> MachineFrameNumber {
        self.address().frame_number()
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Returns this entry with its low flags replaced, keeping the address and high bits.
    pub fn with_flags(self, flags: PteFlags) -> Self {
        Self((self.0 & !Self::FLAGS_MASK) | flags.bits())
    }

    /// Returns this entry with `flags` added.
    pub fn union(self, flags: PteFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    /// Returns this entry with `flags` removed.
    pub fn difference(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    /// Returns whether this entry is free.
    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawEntry({:#018x} ", self.0)?;
        super::flags::describe(*self, f)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packs_address_and_flags() {
        let entry = RawEntry::new(
            MachineAddress::new(0x1234_5000),
            PteFlags::PRESENT | PteFlags::WRITABLE,
        );
        assert_eq!(entry.bits(), 0x1234_5003);
        assert_eq!(entry.address(), MachineAddress::new(0x1234_5000));
        assert_eq!(entry.frame(), MachineFrameNumber::new(0x12345));
        assert!(entry.is_present());
        assert!(!entry.is_free());
    }

    #[test]
    fn with_flags_keeps_high_bits() {
        let entry = RawEntry::from_bits(0x8000_0000_0012_3067);
        let rewritten = entry.with_flags(PteFlags::PRESENT | PteFlags::USER);
        assert_eq!(rewritten.bits(), 0x8000_0000_0012_3005);
        assert_eq!(rewritten.address(), entry.address());
    }

    #[test]
    fn perm_none_is_not_free() {
        let entry = RawEntry::new(
            MachineAddress::new(0x7000),
            PteFlags::PERM_NONE | PteFlags::USER,
        );
        assert!(!entry.is_present());
        assert!(!entry.is_free());
        assert_eq!(entry.bits(), 0x7084);
    }

    #[test]
    fn difference_revokes_write() {
        let entry = RawEntry::from_bits(0x5027);
        assert_eq!(entry.difference(PteFlags::WRITABLE).bits(), 0x5025);
        assert_eq!(entry.difference(PteFlags::WRITABLE).union(PteFlags::WRITABLE), entry);
    }
}
