//! Frame and page number types.
//!
//! Pseudo-physical frame numbers ("pfn") index the frame registry, machine frame numbers
//! ("mfn") are what the hypervisor and page table entries speak, and page numbers count
//! virtual pages.

use crate::{
    address::{MachineAddress, PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    iter::Step,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
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

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Step for $name {
            fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
                if start <= end {
                    let diff = end.0 - start.0;
                    (diff, Some(diff))
                } else {
                    (0, None)
                }
            }

            fn forward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_add(count).map(Self)
            }

            fn backward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_sub(count).map(Self)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A pseudo-physical frame number.\n\n\
     Frame numbers are zero-indexed, correspond to PAGE_SIZE-aligned pseudo-physical\n\
     addresses and stay stable for the lifetime of the domain."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}

impl_page_number_common!(
    MachineFrameNumber,
    "A machine frame number.\n\n\
     Identifies a host frame. Only frames whose machine-to-physical entry is valid belong\n\
     to this guest; the rest are foreign."
);

impl MachineFrameNumber {
    /// Returns the machine address at the start of this frame.
    #[inline]
    pub const fn start(self) -> MachineAddress {
        MachineAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl From<MachineAddress> for MachineFrameNumber {
    #[inline]
    fn from(addr: MachineAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Represents a virtual memory page. Page numbers are zero-indexed and correspond to\n\
     PAGE_SIZE-aligned virtual addresses."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_usize(), 3 * arch::PAGE_SIZE);
        assert_eq!(
            MachineFrameNumber::new(3).start().as_usize(),
            3 * arch::PAGE_SIZE
        );
    }

    #[test]
    fn frame_from_unaligned_address() {
        let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 10);
        assert_eq!(FrameNumber::from(addr), FrameNumber::new(3));
        let addr = MachineAddress::new(arch::PAGE_SIZE * 9 + 0xFFF);
        assert_eq!(MachineFrameNumber::from(addr), MachineFrameNumber::new(9));
    }

    #[test]
    fn page_round_trip() {
        let page = PageNumber::new(0x400);
        assert_eq!(PageNumber::from(page.start()), page);
    }

    #[test]
    fn frame_ranges_step() {
        let frames: alloc::vec::Vec<_> = (FrameNumber::new(4)..FrameNumber::new(7)).collect();
        assert_eq!(
            frames,
            [FrameNumber::new(4), FrameNumber::new(5), FrameNumber::new(6)]
        );
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", MachineFrameNumber::new(0x1f)), "MachineFrameNumber(0x1f)");
        assert_eq!(format!("{}", FrameNumber::new(0x1f)), "0x1f");
    }
}
