//! Two-level 32-bit page table formats.
//!
//! The guest builds ordinary non-PAE page tables: a page directory of 1024
//! [`Pde`]s, each pointing at a page table of 1024 [`Pte`]s, each mapping one
//! 4 KiB page. The host never lets the hardware walk these. It validates each
//! guest entry and derives a [`ShadowPte`] whose frame is a pinned host frame.
//!
//! ```text
//! 31                 22 21                 12 11                0
//! +--------------------+---------------------+-------------------+
//! |  Directory index   |     Table index     |    Page offset    |
//! +--------------------+---------------------+-------------------+
//! ```
use crate::{addressing::Hfn, fatal, VmError};
use bytemuck::{Pod, Zeroable};

/// Number of entries in a page directory.
pub const PTRS_PER_PGD: usize = 1024;
/// Number of entries in a page table.
pub const PTRS_PER_PTE: usize = 1024;

bitflags::bitflags! {
    /// Flags shared by page directory and page table entries.
    pub struct PteFlags: u32 {
        /// Present; must be 1 to map a page or reference a page table.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the region controlled by this entry.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the region controlled by this entry.
        const US = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the region controlled by this entry.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry.
        const D = 1 << 6;
        /// Page size in a directory entry. The guest may not use 4-MByte pages.
        const PSE = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global.
        const G = 1 << 8;
    }
}

impl PteFlags {
    /// Flags a guest page directory entry may carry.
    pub const DIRECTORY: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::P.bits() | PteFlags::RW.bits() | PteFlags::US.bits() | PteFlags::A.bits() | PteFlags::D.bits(),
    );
}

bitflags::bitflags! {
    /// List of error codes on page fault.
    pub struct PFErrorCode: u32 {
        /// When set, the page fault was caused by a page-protection violation. When not set, it was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// When set, the page fault was caused by a write access. When not set, it was caused by a read access.
        const WRITE_ACCESS = 1 << 1;
        /// When set, the page fault was caused while CPL = 3. This does not necessarily mean that the page fault was a privilege violation.
        const USER = 1 << 2;
    }
}

/// Guest page directory entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Pde(pub u32);

impl Pde {
    /// Make an entry referencing page table frame `pfn`.
    #[inline]
    pub const fn new(pfn: u32, flags: PteFlags) -> Self {
        Self((pfn << 12) | flags.bits())
    }

    /// Guest frame of the page table.
    #[inline]
    pub const fn pfn(&self) -> u32 {
        self.0 >> 12
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry references a page table.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    /// Validate a present guest directory entry.
    pub fn check(self, pfn_limit: u32) -> Result<Self, VmError> {
        if self.0 & 0xfff & !PteFlags::DIRECTORY.bits() != 0 || self.pfn() >= pfn_limit {
            Err(fatal!("bad page directory entry {:#x}", self.0))
        } else {
            Ok(self)
        }
    }
}

/// Guest page table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    /// Make an entry mapping guest frame `pfn`.
    #[inline]
    pub const fn new(pfn: u32, flags: PteFlags) -> Self {
        Self((pfn << 12) | flags.bits())
    }

    /// Mapped guest frame.
    #[inline]
    pub const fn pfn(&self) -> u32 {
        self.0 >> 12
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    /// Set the accessed bit.
    #[inline]
    pub const fn mkyoung(self) -> Self {
        Self(self.0 | PteFlags::A.bits())
    }

    /// Set the dirty bit.
    #[inline]
    pub const fn mkdirty(self) -> Self {
        Self(self.0 | PteFlags::D.bits())
    }

    /// Validate a guest leaf before it is shadowed.
    pub fn check(self, pfn_limit: u32) -> Result<Self, VmError> {
        if self.flags().contains(PteFlags::PSE) || self.pfn() >= pfn_limit {
            Err(fatal!("bad page table entry {:#x}", self.0))
        } else {
            Ok(self)
        }
    }
}

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pde({:#x}, {:?})", self.pfn(), self.flags())
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.pfn(), self.flags())
    }
}

/// Host-owned leaf entry consumed by the hardware.
///
/// Host frames are not limited to 20 bits, so the entry is kept wide.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct ShadowPte(u64);

impl ShadowPte {
    /// Entry mapping nothing.
    pub const EMPTY: ShadowPte = ShadowPte(0);

    /// Make an entry mapping host frame `hfn`.
    #[inline]
    pub const fn new(hfn: Hfn, flags: PteFlags) -> Self {
        Self((hfn.0 << 12) | flags.bits() as u64)
    }

    /// Mapped host frame, if present.
    #[inline]
    pub const fn hfn(&self) -> Option<Hfn> {
        if self.is_present() {
            Some(Hfn(self.0 >> 12))
        } else {
            None
        }
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 as u32)
    }

    /// Whether the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() as u64 != 0
    }

    /// Clear the write permission.
    #[inline]
    pub const fn wrprotect(self) -> Self {
        Self(self.0 & !(PteFlags::RW.bits() as u64))
    }
}

impl core::fmt::Debug for ShadowPte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.hfn() {
            Some(hfn) => write!(f, "ShadowPte({:?}, {:?})", hfn, self.flags()),
            None => write!(f, "ShadowPte(-)"),
        }
    }
}
