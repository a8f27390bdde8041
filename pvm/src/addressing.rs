//! Guest and host address types.

/// Size of a page.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift of a page number.
pub const PAGE_SHIFT: usize = 12;
/// Mask of the in-page offset.
pub const PAGE_MASK: u32 = 0xfff;

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gva(u32);

impl Gva {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Cast into u32.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index of the page directory entry covering this address.
    #[inline]
    pub const fn pgd_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index of the page table entry covering this address.
    #[inline]
    pub const fn pte_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3ff) as usize
    }

    /// Offset within the page.
    #[inline]
    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }

    /// Frame number this address would have under an identity mapping.
    #[inline]
    pub const fn pfn(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }
}

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gpa(u32);

impl Gpa {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// First address of the guest frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: u32) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Cast into u32.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Guest frame number.
    #[inline]
    pub const fn pfn(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }
}

/// Host frame number.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Hfn(pub u64);

// Guest supplied values wrap the way the hardware does instead of panicking.
macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u32> for $t {
            type Output = Self;

            fn add(self, other: u32) -> Self::Output {
                Self(self.0.wrapping_add(other))
            }
        }
        impl core::ops::AddAssign<u32> for $t {
            fn add_assign(&mut self, other: u32) {
                self.0 = self.0.wrapping_add(other)
            }
        }
        impl core::ops::Sub<u32> for $t {
            type Output = Self;

            fn sub(self, other: u32) -> Self::Output {
                Self(self.0.wrapping_sub(other))
            }
        }
        impl core::ops::SubAssign<u32> for $t {
            fn sub_assign(&mut self, other: u32) {
                self.0 = self.0.wrapping_sub(other)
            }
        }
        impl core::ops::BitAnd<u32> for $t {
            type Output = Self;

            fn bitand(self, other: u32) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gva);
impl_arith!(Gpa);

impl core::ops::Add<u64> for Hfn {
    type Output = Self;

    fn add(self, other: u64) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl core::fmt::Debug for Hfn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Hfn(0x{:x})", self.0)
    }
}
