//! Address types for the virtual, pseudo-physical and machine address spaces.
//!
//! A Xen PV guest sees three kinds of address. Virtual addresses are what the active page
//! table translates. Pseudo-physical ("physical") addresses are the guest's own contiguous
//! view of its memory and index the frame registry. Machine addresses are what the
//! hypervisor and the MMU actually use; page table entries always hold machine addresses.
//! The [`AddressTranslator`] converts between all three.

use core::fmt;
use core::ops::{Add, Sub};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

use crate::{FrameNumber, MachineFrameNumber, RawEntry, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::software::EmulatedMachine;

/// Address translator for converting between the guest's address spaces.
///
/// The kernel maps every pseudo-physical frame at a fixed offset (the direct map), the
/// guest owns the physical-to-machine table and the hypervisor owns the machine-to-physical
/// table. This enum supports two backings:
/// - Hardware: tables handed over by the domain builder, memory accessed through the direct map
/// - Emulated: a simulated machine for testing
pub enum AddressTranslator {
    /// Hardware translation using the direct map and the Xen-provided tables.
    Hardware {
        direct_map_offset: usize,
        phys_to_machine: &'static [usize],
        machine_to_phys: &'static [usize],
    },
    /// Emulated translation backed by a simulated machine.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated {
        direct_map_offset: usize,
        machine: Arc<EmulatedMachine>,
    },
}

impl AddressTranslator {
    /// Creates a new hardware translator.
    ///
    /// # Safety
    ///
    /// Every frame listed in `phys_to_machine` must be mapped read/write or read-only at
    /// `direct_map_offset + pfn * PAGE_SIZE` for as long as the translator is used, and
    /// `machine_to_phys` must be the hypervisor's read-only M2P table.
    pub const unsafe fn hardware(
        direct_map_offset: usize,
        phys_to_machine: &'static [usize],
        machine_to_phys: &'static [usize],
    ) -> Self {
        Self::Hardware {
            direct_map_offset,
            phys_to_machine,
            machine_to_phys,
        }
    }

    /// Creates a new emulated translator over the given machine.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(direct_map_offset: usize, machine: Arc<EmulatedMachine>) -> Self {
        Self::Emulated {
            direct_map_offset,
            machine,
        }
    }

    /// Returns the virtual address at which pseudo-physical address zero is mapped.
    pub fn direct_map_offset(&self) -> usize {
        match self {
            Self::Hardware {
                direct_map_offset, ..
            } => *direct_map_offset,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated {
                direct_map_offset, ..
            } => *direct_map_offset,
        }
    }

    fn phys_to_machine_table(&self) -> &[usize] {
        match self {
            Self::Hardware {
                phys_to_machine, ..
            } => phys_to_machine,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated { machine, .. } => machine.phys_to_machine(),
        }
    }

    fn machine_to_phys_table(&self) -> &[usize] {
        match self {
            Self::Hardware {
                machine_to_phys, ..
            } => machine_to_phys,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated { machine, .. } => machine.machine_to_phys(),
        }
    }

    /// Returns the number of pseudo-physical frames owned by the guest.
    pub fn frame_count(&self) -> usize {
        self.phys_to_machine_table().len()
    }

    /// Translates a direct-mapped virtual address to a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address lies below the direct map.
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress {
        let offset = self.direct_map_offset();
        assert!(
            virt.as_usize() >= offset,
            "{virt:?} is not in the direct map"
        );
        PhysicalAddress::new(virt.as_usize() - offset)
    }

    /// Translates a physical address to its direct-mapped virtual address.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.direct_map_offset() + phys.as_usize())
    }

    /// Returns the machine frame backing a pseudo-physical frame.
    pub fn pfn_to_mfn(&self, pfn: FrameNumber) -> MachineFrameNumber {
        MachineFrameNumber::new(self.phys_to_machine_table()[pfn.as_usize()])
    }

    /// Returns the pseudo-physical frame for a machine frame owned by this guest.
    ///
    /// # Panics
    ///
    /// Panics if the machine frame is foreign.
    pub fn mfn_to_pfn(&self, mfn: MachineFrameNumber) -> FrameNumber {
        let pfn = self.machine_to_phys_table()[mfn.as_usize()];
        assert!(pfn != arch::INVALID_M2P_ENTRY, "{mfn:?} is a foreign frame");
        FrameNumber::new(pfn)
    }

    /// Translates a physical address to a machine address, preserving the page offset.
    pub fn phys_to_machine(&self, phys: PhysicalAddress) -> MachineAddress {
        self.pfn_to_mfn(phys.frame_number()).start() + phys.page_offset()
    }

    /// Translates a machine address to a physical address, preserving the page offset.
    pub fn machine_to_phys(&self, machine: MachineAddress) -> PhysicalAddress {
        self.mfn_to_pfn(machine.frame_number()).start() + machine.page_offset()
    }

    /// Translates a direct-mapped virtual address to a machine address.
    pub fn virt_to_machine(&self, virt: VirtualAddress) -> MachineAddress {
        self.phys_to_machine(self.virt_to_phys(virt))
    }

    /// Translates a machine address to its direct-mapped virtual address.
    pub fn machine_to_virt(&self, machine: MachineAddress) -> VirtualAddress {
        self.phys_to_virt(self.machine_to_phys(machine))
    }

    /// Returns the direct-mapped virtual address of a frame.
    pub fn pfn_to_virt(&self, pfn: FrameNumber) -> VirtualAddress {
        self.phys_to_virt(pfn.start())
    }

    /// Returns the frame containing a direct-mapped virtual address.
    pub fn virt_to_pfn(&self, virt: VirtualAddress) -> FrameNumber {
        self.virt_to_phys(virt).frame_number()
    }

    /// Returns the direct-mapped virtual address of a machine frame.
    pub fn mfn_to_virt(&self, mfn: MachineFrameNumber) -> VirtualAddress {
        self.pfn_to_virt(self.mfn_to_pfn(mfn))
    }

    /// Returns true if the machine address belongs to another domain.
    ///
    /// Frames granted or mapped from other domains have no pseudo-physical frame in this
    /// guest; the hypervisor marks them with [`arch::INVALID_M2P_ENTRY`].
    pub fn is_foreign(&self, machine: MachineAddress) -> bool {
        self.machine_to_phys_table()
            .get(machine.frame_number().as_usize())
            .is_none_or(|&pfn| pfn == arch::INVALID_M2P_ENTRY)
    }

    /// Returns the machine address of entry `index` in the table stored in `table`.
    pub fn slot_address(&self, table: FrameNumber, index: usize) -> MachineAddress {
        debug_assert!(index < arch::ENTRIES_PER_PAGE);
        self.pfn_to_mfn(table).start() + index * size_of::<u64>()
    }

    /// Reads entry `index` of the table stored in frame `table`.
    pub fn read_entry(&self, table: FrameNumber, index: usize) -> RawEntry {
        assert!(index < arch::ENTRIES_PER_PAGE, "table index {index} out of bounds");
        match self {
            Self::Hardware { .. } => {
                let ptr = self.pfn_to_virt(table).as_ptr::<u64>();
                // SAFETY: The hardware constructor guarantees every guest frame is mapped at
                // its direct-map address, and `index` is within the page.
                RawEntry::from_bits(unsafe { ptr.add(index).read_volatile() })
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated { machine, .. } => {
                RawEntry::from_bits(machine.read(self.pfn_to_mfn(table), index))
            }
        }
    }

    /// Stores an entry directly into a table page.
    ///
    /// Only legal while the page is private to an offline tree: a pinned or read-only table
    /// page must be changed through the update queue instead.
    pub(crate) fn write_entry(&self, table: FrameNumber, index: usize, entry: RawEntry) {
        assert!(index < arch::ENTRIES_PER_PAGE, "table index {index} out of bounds");
        match self {
            Self::Hardware { .. } => {
                let ptr = self.pfn_to_virt(table).as_mut_ptr::<u64>();
                // SAFETY: Offline table pages are still mapped writable in the direct map and
                // are owned exclusively by the caller.
                unsafe { ptr.add(index).write_volatile(entry.bits()) }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated { machine, .. } => {
                machine.write(self.pfn_to_mfn(table), index, entry.bits())
            }
        }
    }

    /// Copies a whole table page into another, still-writable, frame.
    pub(crate) fn copy_frame(&self, from: FrameNumber, to: FrameNumber) {
        for index in 0..arch::ENTRIES_PER_PAGE {
            self.write_entry(to, index, self.read_entry(from, index));
        }
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to the physical, machine
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the offset of the address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A pseudo-physical memory address.\n\n\
     The guest's own, contiguous view of the memory the hypervisor gave it. Frame numbers\n\
     derived from it are stable for the lifetime of the domain and index the frame registry."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    MachineAddress,
    "A machine memory address.\n\n\
     The host-real address seen by the hypervisor and the MMU. Page table entries and\n\
     hypervisor update requests always carry machine addresses."
);

impl MachineAddress {
    /// Creates a new machine address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "machine address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the machine frame containing this address.
    #[inline]
    pub fn frame_number(self) -> MachineFrameNumber {
        MachineFrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. It provides methods for address manipulation and alignment checks."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub fn page_number(self) -> crate::PageNumber {
        crate::PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(addr.as_usize(), 0x1000);
        }

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(0x3124);
            assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(0x3000));
            assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(0x4000));
            assert_eq!(addr.page_offset(), 0x124);
            assert!(!addr.is_aligned(arch::PAGE_SIZE));
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(0x5678);
            assert_eq!(addr.frame_number(), FrameNumber::new(5));
        }

        #[test]
        fn debug_format() {
            let addr = PhysicalAddress::new(0x2000);
            assert_eq!(format!("{addr:?}"), "PhysicalAddress(0x2000)");
            assert_eq!(format!("{addr}"), "0x2000");
        }
    }

    mod machine_address {
        use super::*;

        #[test]
        #[should_panic(expected = "machine address exceeds maximum width")]
        fn new_exceeds_max() {
            MachineAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn frame_number() {
            let addr = MachineAddress::new(0x9_1008);
            assert_eq!(addr.frame_number(), MachineFrameNumber::new(0x91));
            assert_eq!(addr.page_offset(), 8);
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn new_valid_upper_half() {
            let addr = VirtualAddress::new(0xFFFF_8000_0000_0000);
            assert_eq!(addr.as_usize(), 0xFFFF_8000_0000_0000);
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn new_non_canonical() {
            VirtualAddress::new(0x0000_8000_0000_0000);
        }

        #[test]
        fn sub_address_operator() {
            let a = VirtualAddress::new(0x5000);
            let b = VirtualAddress::new(0x2000);
            assert_eq!(a - b, 0x3000);
            assert_eq!(a - 0x1000, VirtualAddress::new(0x4000));
        }
    }

    mod translation {
        use super::*;
        use crate::Geometry;
        use crate::arch::software::{DomainBuilder, FOREIGN_FRAMES};

        fn translator() -> AddressTranslator {
            DomainBuilder::new(&Geometry::X86_64, 64).build().translator
        }

        #[test]
        fn physical_machine_round_trip() {
            let translator = translator();
            for pfn in 0..translator.frame_count() {
                let phys = FrameNumber::new(pfn).start() + 0x18;
                let machine = translator.phys_to_machine(phys);
                assert_eq!(translator.machine_to_phys(machine), phys);
                assert_eq!(translator.phys_to_machine(translator.machine_to_phys(machine)), machine);
            }
        }

        #[test]
        fn machine_frames_are_remapped() {
            let translator = translator();
            let mfn = translator.pfn_to_mfn(FrameNumber::new(0));
            assert_ne!(mfn.as_usize(), 0);
            assert_eq!(translator.mfn_to_pfn(mfn), FrameNumber::new(0));
        }

        #[test]
        fn direct_map_round_trip() {
            let translator = translator();
            let phys = PhysicalAddress::new(0x3010);
            let virt = translator.phys_to_virt(phys);
            assert_eq!(virt.as_usize(), translator.direct_map_offset() + 0x3010);
            assert_eq!(translator.virt_to_phys(virt), phys);
            assert_eq!(translator.virt_to_pfn(virt), FrameNumber::new(3));
            assert_eq!(translator.machine_to_virt(translator.virt_to_machine(virt)), virt);
        }

        #[test]
        fn foreign_frames() {
            let translator = translator();
            let foreign = MachineFrameNumber::new(FOREIGN_FRAMES - 1).start();
            assert!(translator.is_foreign(foreign));
            assert!(translator.is_foreign(MachineFrameNumber::new(1 << 30).start()));
            let own = translator.pfn_to_mfn(FrameNumber::new(7)).start();
            assert!(!translator.is_foreign(own));
        }

        #[test]
        #[should_panic(expected = "is a foreign frame")]
        fn foreign_frame_has_no_pfn() {
            translator().mfn_to_pfn(MachineFrameNumber::new(0));
        }

        #[test]
        #[should_panic(expected = "is not in the direct map")]
        fn user_address_is_not_direct_mapped() {
            translator().virt_to_phys(VirtualAddress::new(0x40_0000));
        }
    }
}
