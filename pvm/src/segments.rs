//! Segment shadow.
//!
//! The guest owns a private copy of its GDT (including the three TLS slots)
//! and IDT, updated entry by entry through hypercalls. Every entry is
//! sanitized on the way in: descriptors that would run at host privilege are
//! demoted to [`GUEST_PL`], and the slots the switcher itself depends on can
//! never be written. [`DescriptorTables`] is the host-facing merge of both,
//! which the switcher loads when the corresponding [`Changed`] bit is set.
//!
//! [`Changed`]: crate::switcher::Changed
use crate::{addressing::Gpa, fatal, hypercalls::HYPERCALL_VECTOR, memory::GuestMemory, VmError};
use bytemuck::{Pod, Zeroable};
use num_enum::TryFromPrimitive;

/// Number of GDT entries.
pub const GDT_ENTRIES: usize = 32;
/// First TLS slot.
pub const GDT_ENTRY_TLS_MIN: usize = 6;
/// Number of TLS slots.
pub const GDT_ENTRY_TLS_ENTRIES: usize = 3;
/// Code segment of the switcher.
pub const GDT_ENTRY_SWITCHER_CS: usize = 10;
/// Data segment of the switcher.
pub const GDT_ENTRY_SWITCHER_DS: usize = 11;
/// Guest kernel code segment.
pub const GDT_ENTRY_KERNEL_CS: usize = 12;
/// Guest kernel data segment.
pub const GDT_ENTRY_KERNEL_DS: usize = 13;
/// Guest user code segment.
pub const GDT_ENTRY_USER_CS: usize = 14;
/// Guest user data segment.
pub const GDT_ENTRY_USER_DS: usize = 15;
/// Task state segment of the host.
pub const GDT_ENTRY_TSS: usize = 16;
/// Task state segment used on double fault.
pub const GDT_ENTRY_DOUBLEFAULT_TSS: usize = 31;

/// Selector of the guest kernel code segment, without RPL.
pub const KERNEL_CS: u32 = (GDT_ENTRY_KERNEL_CS as u32) << 3;
/// Selector of the guest kernel data segment, without RPL.
pub const KERNEL_DS: u32 = (GDT_ENTRY_KERNEL_DS as u32) << 3;
/// Privilege level the guest kernel runs at.
pub const GUEST_PL: u32 = PrivilegeLevel::Ring1 as u32;

/// Number of IDT gates.
pub const IDT_ENTRIES: usize = 256;
/// First vector used by external interrupts.
pub const FIRST_EXTERNAL_VECTOR: usize = 32;
/// Legacy system call vector.
pub const SYSCALL_VECTOR: u32 = 0x80;

/// Protection rings.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PrivilegeLevel {
    /// Host kernel.
    Ring0 = 0,
    /// Guest kernel.
    Ring1 = 1,
    /// Unused.
    Ring2 = 2,
    /// Guest user.
    Ring3 = 3,
}

bitflags::bitflags! {
    /// Access bits of a 32-bit segment descriptor.
    pub struct SegmentAccess: u64 {
        /// Granularity
        const G = 1 << 55;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const D_B = 1 << 54;
        /// 64-bit code segment (IA-32e mode only)
        const L = 1 << 53;
        /// Available for use by system software
        const AVL = 1 << 52;

        /// Segment present
        const P = 1 << 47;
        /// Descriptor type  (0 = system; 1 = code or data).
        const S = 1 << 44;
        /// Data or Code
        const CODE = 1 << 43;
        /// Expand_down/Conforming.
        const EC = 1 << 42;
        /// Writable/Readable.
        const WR = 1 << 41;
        /// Accessed.
        const A = 1 << 40;
    }
}

impl SegmentAccess {
    const BASE_31_24_SHIFT: u64 = 56;
    const SEG_LIMIT_SHIFT: u64 = 48;
    const DPL_SHIFT: u64 = 45;
    const TYPE_SHIFT: u64 = 40;
    const BASE_23_0_SHIFT: u64 = 16;
    const DPL_MASK: u64 = 3 << Self::DPL_SHIFT;
}

/// 32-bit segment descriptor, as the guest hands it over in two words.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// Create a null segment.
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Create a new segment.
    #[inline]
    pub const fn new(base: u32, limit: u32, access: SegmentAccess, dpl: PrivilegeLevel) -> Self {
        let (base, limit) = (base as u64, limit as u64);
        Self(
            (limit & 0xffff)
                | (base & 0xff_ffff) << SegmentAccess::BASE_23_0_SHIFT
                | access.bits()
                | (dpl as u64) << SegmentAccess::DPL_SHIFT
                | ((limit >> 16) & 0xf) << SegmentAccess::SEG_LIMIT_SHIFT
                | ((base >> 24) & 0xff) << SegmentAccess::BASE_31_24_SHIFT,
        )
    }

    /// Create from the low and high words.
    #[inline]
    pub const fn from_parts(lo: u32, hi: u32) -> Self {
        Self((hi as u64) << 32 | lo as u64)
    }

    /// Low word.
    #[inline]
    pub const fn lo(&self) -> u32 {
        self.0 as u32
    }

    /// High word.
    #[inline]
    pub const fn hi(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Access bits.
    #[inline]
    pub const fn access(&self) -> SegmentAccess {
        SegmentAccess::from_bits_truncate(self.0)
    }

    /// Descriptor privilege level.
    #[inline]
    pub const fn dpl(&self) -> u32 {
        ((self.0 & SegmentAccess::DPL_MASK) >> SegmentAccess::DPL_SHIFT) as u32
    }

    /// Whether the segment is present.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & SegmentAccess::P.bits() != 0
    }

    /// Demote host-privileged segments to the guest level and set the
    /// accessed bit so the hardware never has to write the descriptor back.
    fn sanitize(self) -> Self {
        if !self.is_present() {
            return self;
        }
        let mut v = self.0 | SegmentAccess::A.bits();
        if self.dpl() == PrivilegeLevel::Ring0 as u32 {
            v |= (GUEST_PL as u64) << SegmentAccess::DPL_SHIFT;
        }
        Self(v)
    }
}

impl core::fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SegmentDescriptor({:#x}:{:#x}, dpl={})", self.hi(), self.lo(), self.dpl())
    }
}

/// Slots owned by the host.
#[inline]
pub fn is_reserved_gdt_entry(num: usize) -> bool {
    matches!(
        num,
        GDT_ENTRY_TSS | GDT_ENTRY_SWITCHER_CS | GDT_ENTRY_SWITCHER_DS | GDT_ENTRY_DOUBLEFAULT_TSS
    )
}

const FLAT_CODE: SegmentAccess = SegmentAccess::from_bits_truncate(
    SegmentAccess::P.bits()
        | SegmentAccess::S.bits()
        | SegmentAccess::CODE.bits()
        | SegmentAccess::WR.bits()
        | SegmentAccess::A.bits()
        | SegmentAccess::G.bits()
        | SegmentAccess::D_B.bits(),
);
const FLAT_DATA: SegmentAccess = SegmentAccess::from_bits_truncate(
    SegmentAccess::P.bits()
        | SegmentAccess::S.bits()
        | SegmentAccess::WR.bits()
        | SegmentAccess::A.bits()
        | SegmentAccess::G.bits()
        | SegmentAccess::D_B.bits(),
);
// Available 32-bit TSS.
const TSS32: SegmentAccess =
    SegmentAccess::from_bits_truncate(SegmentAccess::P.bits() | 0x9 << SegmentAccess::TYPE_SHIFT);

/// Guest-visible GDT of a vcpu.
#[derive(Clone)]
pub struct Gdt([SegmentDescriptor; GDT_ENTRIES]);

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

impl Gdt {
    /// GDT a guest boots with: flat kernel and user segments.
    pub fn new() -> Self {
        let mut entries = [SegmentDescriptor::null(); GDT_ENTRIES];
        entries[GDT_ENTRY_KERNEL_CS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_CODE, PrivilegeLevel::Ring1);
        entries[GDT_ENTRY_KERNEL_DS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_DATA, PrivilegeLevel::Ring1);
        entries[GDT_ENTRY_USER_CS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_CODE, PrivilegeLevel::Ring3);
        entries[GDT_ENTRY_USER_DS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_DATA, PrivilegeLevel::Ring3);
        Self(entries)
    }

    /// Install one guest descriptor.
    pub fn load_entry(&mut self, num: u32, lo: u32, hi: u32) -> Result<(), VmError> {
        let num = num as usize;
        if num >= GDT_ENTRIES {
            return Err(fatal!("too many gdt entries {}", num));
        }
        if is_reserved_gdt_entry(num) {
            return Err(fatal!("attempt to load reserved gdt entry {}", num));
        }
        self.0[num] = SegmentDescriptor::from_parts(lo, hi).sanitize();
        Ok(())
    }

    /// Copy the guest's TLS descriptors from guest memory.
    pub fn load_tls(&mut self, mem: &GuestMemory, table: Gpa) -> Result<(), VmError> {
        let tls: [SegmentDescriptor; GDT_ENTRY_TLS_ENTRIES] = mem.read_obj(table)?;
        for (slot, desc) in self.0[GDT_ENTRY_TLS_MIN..GDT_ENTRY_TLS_MIN + GDT_ENTRY_TLS_ENTRIES]
            .iter_mut()
            .zip(tls)
        {
            *slot = desc.sanitize();
        }
        Ok(())
    }

    /// All entries.
    pub fn entries(&self) -> &[SegmentDescriptor; GDT_ENTRIES] {
        &self.0
    }
}

/// Type of an IDT gate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum GateType {
    /// Clears the interrupt flag on entry.
    Interrupt = 0xE,
    /// Leaves the interrupt flag alone.
    Trap = 0xF,
}

/// 32-bit IDT gate.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Gate(u64);

impl Gate {
    /// Gate delivering nothing.
    pub const EMPTY: Gate = Gate(0);

    /// Create from the low and high words.
    #[inline]
    pub const fn from_parts(lo: u32, hi: u32) -> Self {
        Self((hi as u64) << 32 | lo as u64)
    }

    /// Handler address.
    #[inline]
    pub const fn address(&self) -> u32 {
        (self.0 as u32 & 0xffff) | ((self.0 >> 32) as u32 & 0xffff_0000)
    }

    /// Whether the gate is present.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & SegmentAccess::P.bits() != 0
    }

    /// Gate type, if it is an interrupt or trap gate.
    #[inline]
    pub fn gate_type(&self) -> Option<GateType> {
        GateType::try_from(((self.0 >> SegmentAccess::TYPE_SHIFT) & 0xf) as u8).ok()
    }

    /// Descriptor privilege level.
    #[inline]
    pub const fn dpl(&self) -> u32 {
        ((self.0 & SegmentAccess::DPL_MASK) >> SegmentAccess::DPL_SHIFT) as u32
    }

    /// Sanitize a guest-supplied gate: the handler always runs in the guest
    /// kernel code segment, and only the present, DPL, type and offset bits of
    /// the high word survive.
    fn sanitize(lo: u32, hi: u32) -> Result<Self, VmError> {
        let gate = Self::from_parts(lo, hi);
        if !gate.is_present() {
            return Ok(Self::EMPTY);
        }
        if gate.gate_type().is_none() {
            return Err(fatal!("bad IDT type {}", (hi >> 8) & 0xf));
        }
        Ok(Self::from_parts(
            (KERNEL_CS | GUEST_PL) << 16 | (lo & 0xffff),
            hi & 0xffff_ef00,
        ))
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "Gate({:#x}, {:?}, dpl={})", self.address(), self.gate_type(), self.dpl())
        } else {
            write!(f, "Gate(-)")
        }
    }
}

/// Guest-visible IDT of a vcpu.
#[derive(Clone)]
pub struct Idt([Gate; IDT_ENTRIES]);

impl Default for Idt {
    fn default() -> Self {
        Self([Gate::EMPTY; IDT_ENTRIES])
    }
}

impl Idt {
    /// Install one guest gate. Returns whether the table changed.
    ///
    /// NMI, double fault, the reserved vector 15 and the hypercall vector are
    /// always handled by the host; loads of those are dropped.
    pub fn load_entry(&mut self, num: u32, lo: u32, hi: u32) -> Result<bool, VmError> {
        if num as usize >= IDT_ENTRIES {
            return Err(fatal!("too many gates {}", num));
        }
        if matches!(num, 2 | 8 | 15) || num == HYPERCALL_VECTOR {
            return Ok(false);
        }
        self.0[num as usize] = Gate::sanitize(lo, hi)?;
        Ok(true)
    }

    /// Gate of `vector`.
    #[inline]
    pub fn gate(&self, vector: usize) -> Gate {
        self.0.get(vector).copied().unwrap_or(Gate::EMPTY)
    }
}

/// Whether trap gate `num` may be taken by the hardware without leaving the
/// guest.
fn direct_trap(num: usize, syscall_vector: u32) -> bool {
    if num >= FIRST_EXTERNAL_VECTOR && num as u32 != SYSCALL_VECTOR && num as u32 != syscall_vector
    {
        return false;
    }
    !matches!(num, 7 | 13 | 14) && num as u32 != HYPERCALL_VECTOR
}

/// Descriptor tables as loaded by the switcher.
#[derive(Clone)]
pub struct DescriptorTables {
    /// GDT: guest entries merged with the host's reserved slots.
    pub gdt: [SegmentDescriptor; GDT_ENTRIES],
    /// For each vector, the guest gate the hardware delivers directly, or
    /// `None` when the vector exits to the host.
    pub idt: [Option<Gate>; IDT_ENTRIES],
}

impl Default for DescriptorTables {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTables {
    /// Host slots populated, every vector exiting to the host.
    pub fn new() -> Self {
        let mut gdt = [SegmentDescriptor::null(); GDT_ENTRIES];
        gdt[GDT_ENTRY_SWITCHER_CS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_CODE, PrivilegeLevel::Ring0);
        gdt[GDT_ENTRY_SWITCHER_DS] =
            SegmentDescriptor::new(0, 0xfffff, FLAT_DATA, PrivilegeLevel::Ring0);
        gdt[GDT_ENTRY_TSS] = SegmentDescriptor::new(0, 0x67, TSS32, PrivilegeLevel::Ring0);
        gdt[GDT_ENTRY_DOUBLEFAULT_TSS] =
            SegmentDescriptor::new(0, 0x67, TSS32, PrivilegeLevel::Ring0);
        Self {
            gdt,
            idt: [None; IDT_ENTRIES],
        }
    }

    /// Merge every guest slot except the host's.
    pub fn copy_gdt(&mut self, gdt: &Gdt) {
        for (num, desc) in gdt.entries().iter().enumerate() {
            if !is_reserved_gdt_entry(num) {
                self.gdt[num] = *desc;
            }
        }
    }

    /// Merge the TLS slots only.
    pub fn copy_tls(&mut self, gdt: &Gdt) {
        let tls = GDT_ENTRY_TLS_MIN..GDT_ENTRY_TLS_MIN + GDT_ENTRY_TLS_ENTRIES;
        self.gdt[tls.clone()].copy_from_slice(&gdt.entries()[tls]);
    }

    /// Recompute which vectors go straight to the guest.
    pub fn copy_traps(&mut self, idt: &Idt, syscall_vector: u32) {
        for (num, slot) in self.idt.iter_mut().enumerate() {
            let gate = idt.gate(num);
            *slot = (gate.is_present()
                && gate.gate_type() == Some(GateType::Trap)
                && direct_trap(num, syscall_vector))
            .then_some(gate);
        }
    }
}
