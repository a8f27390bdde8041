//! Context transfer between host and guest.
//!
//! The switcher is the only code that actually runs the guest. It is called
//! with host interrupts disabled, loads the shadow page directory of the
//! vcpu's cache slot, reloads the descriptor tables the [`Changed`] mask names,
//! restores the guest [`Registers`] and runs guest code until the CPU traps
//! back. It records the trap number and error code in the register block and
//! returns the faulting address latched by the page fault (CR2). It never
//! resolves anything itself.
//!
//! The switcher's own code and per-vcpu pages are mapped at
//! [`SWITCHER_ADDR`] in every shadow directory, so the transition can not
//! fault. [`SwitcherPages`] owns those frames for the whole process.
pub mod scripted;

use crate::{
    addressing::{Gva, Hfn},
    hypercalls::HYPERCALL_VECTOR,
    memory::GuestMemory,
    page_table::{PFErrorCode, PteFlags, ShadowPte, PTRS_PER_PTE},
    segments::DescriptorTables,
    shadow::ShadowRoot,
    VmError,
};
use bytemuck::{Pod, Zeroable};
use std::{cell::Cell, marker::PhantomData, sync::Arc};

/// Virtual address where the switcher is mapped.
pub const SWITCHER_ADDR: u32 = 0xFFC0_0000;
/// Page directory index covering the switcher.
pub const SWITCHER_PGD_INDEX: usize = (SWITCHER_ADDR >> 22) as usize;
/// Address space the guest must leave to the switcher.
pub const SWITCHER_RESERVE: u32 = 0u32.wrapping_sub(SWITCHER_ADDR);

bitflags::bitflags! {
    /// Descriptor state modified since the last transfer.
    pub struct Changed: u32 {
        /// The IDT changed.
        const IDT = 1 << 0;
        /// The GDT changed.
        const GDT = 1 << 1;
        /// Only the TLS slots of the GDT changed.
        const GDT_TLS = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags register of the guest.
    pub struct Eflags: u32 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Always one.
        const RESERVED = 1 << 1;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
    }
}

/// Register block exchanged with the switcher.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub gs: u32,
    pub fs: u32,
    pub ds: u32,
    pub es: u32,
    /// Vector of the trap that ended the last transfer.
    pub trapnum: u32,
    /// Error code of that trap, if it has one.
    pub errcode: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Frames of the switcher, mapped into every shadow directory.
///
/// Entry 0 is the switcher's code, mapped read-only; the rest hold per-vcpu
/// state and are writable. None of them is reachable from guest user mode.
pub struct SwitcherPages {
    base: Hfn,
    ptes: Box<[ShadowPte; PTRS_PER_PTE]>,
}

impl SwitcherPages {
    /// Set up the switcher pages at process start.
    pub fn load(base: Hfn, pages: usize) -> Result<Arc<Self>, VmError> {
        if pages == 0 || pages > PTRS_PER_PTE {
            return Err(VmError::InvalidConfig(format!("{} switcher pages", pages)));
        }
        let mut ptes = Box::new([ShadowPte::EMPTY; PTRS_PER_PTE]);
        for (i, pte) in ptes.iter_mut().take(pages).enumerate() {
            let flags = if i == 0 {
                PteFlags::P
            } else {
                PteFlags::P | PteFlags::RW
            };
            *pte = ShadowPte::new(base + i as u64, flags);
        }
        log::info!("switcher: {} pages at {:?}", pages, base);
        Ok(Arc::new(Self { base, ptes }))
    }

    /// Tear the switcher pages down at process exit. Fails, handing the
    /// pages back, while any guest still maps them.
    pub fn unload(this: Arc<Self>) -> Result<(), Arc<Self>> {
        let this = Arc::try_unwrap(this).map_err(|this| {
            log::warn!("switcher: still mapped by {} guests", Arc::strong_count(&this) - 1);
            this
        })?;
        log::info!("switcher: unloaded pages at {:?}", this.base);
        Ok(())
    }

    /// First frame.
    pub fn base(&self) -> Hfn {
        self.base
    }

    /// Shadow entry at `index` of the switcher's page table.
    #[inline]
    pub fn pte(&self, index: usize) -> ShadowPte {
        self.ptes[index]
    }
}

thread_local! {
    static INTERRUPTS_DISABLED: Cell<bool> = Cell::new(false);
}

/// Whether host interrupts are enabled on this thread.
pub fn interrupts_enabled() -> bool {
    !INTERRUPTS_DISABLED.with(Cell::get)
}

/// Keeps host interrupts disabled while alive.
pub struct InterruptGuard {
    was_disabled: bool,
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Disable host interrupts until the guard is dropped.
    pub fn new() -> Self {
        Self {
            was_disabled: INTERRUPTS_DISABLED.with(|d| d.replace(true)),
            _not_send: PhantomData,
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        INTERRUPTS_DISABLED.with(|d| d.set(self.was_disabled));
    }
}

/// Everything one transfer needs.
pub struct SwitchFrame<'a> {
    /// Vcpu being run.
    pub vcpu_id: usize,
    /// Shadow directory to install. The guest-wide cache is not held while
    /// the guest runs.
    pub root: ShadowRoot,
    /// Guest registers, loaded on entry and saved on exit.
    pub regs: &'a mut Registers,
    /// Descriptor tables of the vcpu.
    pub tables: &'a DescriptorTables,
    /// Tables to reload before entering.
    pub changed: Changed,
    /// Guest memory, for switchers that execute guest code in software.
    pub memory: &'a GuestMemory,
    /// Faulting address of the last page fault.
    pub cr2: Gva,
}

impl SwitchFrame<'_> {
    /// End the transfer with trap `trapnum`.
    pub fn trap(&mut self, trapnum: u32, errcode: u32) {
        self.regs.trapnum = trapnum;
        self.regs.errcode = errcode;
    }

    /// End the transfer with hypercall `op`.
    pub fn hypercall(&mut self, op: u32, args: [u32; 4]) {
        self.regs.eax = op;
        self.regs.ebx = args[0];
        self.regs.ecx = args[1];
        self.regs.edx = args[2];
        self.regs.esi = args[3];
        self.trap(HYPERCALL_VECTOR, 0);
    }

    /// Access `va` through the shadow tables. On failure the transfer ends
    /// with the resulting page fault.
    pub fn access(&mut self, va: Gva, access: PFErrorCode) -> Option<Hfn> {
        match self.root.translate(va, access) {
            Ok(hfn) => Some(hfn),
            Err(code) => {
                self.cr2 = va;
                self.trap(14, code.bits());
                None
            }
        }
    }
}

/// The architecture specific privilege transition.
pub trait Switcher: Send {
    /// Run the guest until it traps. Returns the faulting address of a page
    /// fault, and `Gva::default()` otherwise.
    fn switch_to_guest(&mut self, frame: SwitchFrame<'_>) -> Gva;
}
