//! Virtual CPU and its run loop.
//!
//! A [`VCpu`] is owned by the launcher thread that runs it; nothing in it is
//! shared except [`VCpuShared`], the part other threads poke to inject
//! interrupts, wake a halted vcpu or cancel a run.
//!
//! [`VCpu::run`] loops until there is something to hand back to the
//! launcher:
//!
//! 1. finish the hypercall the guest trapped with, draining the async ring
//!    first,
//! 2. hand an outstanding notification to its registered notifier, or return
//!    it to the launcher,
//! 3. honour a pending kick,
//! 4. deliver the lowest pending, unblocked virtual interrupt,
//! 5. sleep while halted and nothing is deliverable,
//! 6. run the guest through the switcher and dispatch the trap it comes
//!    back with.
//!
//! Any error on the way kills the guest; the loop then reports the death.
use crate::{
    addressing::{Gpa, Gva, PAGE_SIZE},
    fatal,
    hypercalls::{HcallArgs, SharedPage, HYPERCALL_VECTOR},
    interrupts::ClockEvent,
    page_table::PFErrorCode,
    segments::{
        DescriptorTables, Gdt, Idt, FIRST_EXTERNAL_VECTOR, GUEST_PL, IDT_ENTRIES, KERNEL_CS,
        KERNEL_DS, SYSCALL_VECTOR,
    },
    shadow::PgdirId,
    switcher::{Changed, Eflags, InterruptGuard, Registers, SwitchFrame, Switcher},
    vm::Guest,
    VmError,
};
use crossbeam_utils::sync::{Parker, Unparker};
use log::{debug, trace};
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

/// Device not available.
const DEVICE_NOT_AVAILABLE: u32 = 7;
/// Invalid opcode.
const INVALID_OPCODE: u32 = 6;
/// General protection fault.
const GENERAL_PROTECTION: u32 = 13;
/// Page fault.
const PAGE_FAULT: u32 = 14;

/// What a [`VCpu::run`] hands back to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest notified this value and nobody registered for it.
    Notify(u32),
    /// The guest died for this reason.
    Dead(String),
    /// The guest asked to be restarted.
    Restart,
    /// The run was cancelled with [`Guest::kick`].
    Interrupted,
}

/// State of a vcpu other threads may touch.
pub struct VCpuShared {
    id: usize,
    irqs: AtomicU32,
    halted: AtomicBool,
    kicked: AtomicBool,
    unparker: Unparker,
}

impl VCpuShared {
    pub(crate) fn new(id: usize, unparker: Unparker) -> Self {
        Self {
            id,
            irqs: AtomicU32::new(0),
            halted: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            unparker,
        }
    }

    /// Index of the vcpu.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Mark virtual interrupt `irq` pending and wake the vcpu.
    pub(crate) fn raise(&self, irq: u32) {
        self.irqs.fetch_or(1 << irq, Ordering::SeqCst);
        self.unparker.unpark();
    }

    /// Pending virtual interrupts.
    pub fn pending_irqs(&self) -> u32 {
        self.irqs.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_irq(&self, irq: u32) {
        self.irqs.fetch_and(!(1 << irq), Ordering::SeqCst);
    }

    /// Whether the vcpu is halted.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    /// Ask the run loop to return to the launcher.
    pub(crate) fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }

    pub(crate) fn wake(&self) {
        self.unparker.unpark();
    }
}

/// A virtual CPU.
pub struct VCpu {
    pub(crate) id: usize,
    pub(crate) guest: Arc<Guest>,
    pub(crate) shared: Arc<VCpuShared>,
    parker: Parker,
    pub(crate) regs: Registers,
    pub(crate) gdt: Gdt,
    pub(crate) idt: Idt,
    tables: DescriptorTables,
    pub(crate) changed: Changed,
    /// Cache slot in use, and the directory it must be bound to.
    pub(crate) slot: usize,
    pub(crate) pgdir: PgdirId,
    /// Hypercall the guest trapped with, not yet executed.
    pub(crate) hcall: Option<HcallArgs>,
    /// Next async ring entry to look at.
    pub(crate) next_hcall: usize,
    pub(crate) pending_notify: Option<u32>,
    pub(crate) data: Option<SharedPage>,
    pub(crate) noirq: Range<u32>,
    pub(crate) syscall_vector: u32,
    /// Interrupt stack used when trapping from guest user mode.
    pub(crate) ss1: u32,
    pub(crate) esp1: u32,
    pub(crate) stack_pages: u32,
    /// Guest's task-switched flag.
    pub(crate) ts: bool,
    pub(crate) clock: ClockEvent,
    switcher: Box<dyn Switcher>,
}

impl VCpu {
    pub(crate) fn new(
        id: usize,
        guest: Arc<Guest>,
        shared: Arc<VCpuShared>,
        parker: Parker,
        slot: usize,
        switcher: Box<dyn Switcher>,
    ) -> Self {
        let regs = Registers {
            ds: KERNEL_DS | GUEST_PL,
            es: KERNEL_DS | GUEST_PL,
            ss: KERNEL_DS | GUEST_PL,
            cs: KERNEL_CS | GUEST_PL,
            eflags: (Eflags::IF | Eflags::RESERVED).bits(),
            eip: guest.config().start_eip.as_u32(),
            ..Registers::default()
        };
        Self {
            id,
            guest,
            shared,
            parker,
            regs,
            gdt: Gdt::new(),
            idt: Idt::default(),
            tables: DescriptorTables::new(),
            changed: Changed::all(),
            slot,
            pgdir: PgdirId::Linear,
            hcall: None,
            next_hcall: 0,
            pending_notify: None,
            data: None,
            noirq: 0..0,
            syscall_vector: SYSCALL_VECTOR,
            ss1: 0,
            esp1: 0,
            stack_pages: 0,
            ts: false,
            clock: ClockEvent::default(),
            switcher,
        }
    }

    /// Index of this vcpu.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Guest registers.
    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    /// Guest registers, for the launcher to set up before the first run.
    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Cache slot the vcpu runs on.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Handle other threads use to reach this vcpu.
    pub fn handle(&self) -> Arc<VCpuShared> {
        self.shared.clone()
    }

    /// The guest this vcpu belongs to.
    pub fn guest(&self) -> &Arc<Guest> {
        &self.guest
    }

    /// Run the guest until there is something for the launcher.
    pub fn run(&mut self) -> Result<RunOutcome, VmError> {
        while !self.guest.is_dead() {
            if self.hcall.is_some() {
                if let Err(e) = self.do_hypercalls() {
                    self.guest.kill(e);
                    continue;
                }
            }

            if let Some(value) = self.pending_notify.take() {
                if !self.guest.events.signal(value) {
                    return Ok(RunOutcome::Notify(value));
                }
            }

            if self.shared.kicked.swap(false, Ordering::SeqCst) {
                return Ok(if self.guest.is_dead() {
                    self.guest.take_report()?
                } else {
                    RunOutcome::Interrupted
                });
            }

            if let Err(e) = self.deliver_pending_interrupt() {
                self.guest.kill(e);
                continue;
            }

            if self.shared.is_halted() {
                match self.interrupt_pending() {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        trace!("vcpu#{}: halted", self.id);
                        self.parker.park();
                    }
                    Err(e) => self.guest.kill(e),
                }
                continue;
            }

            if let Err(e) = self.run_guest_once().and_then(|cr2| self.handle_trap(cr2)) {
                self.guest.kill(e);
            }
        }
        self.clock.disarm();
        self.guest.take_report()
    }

    fn deliver_pending_interrupt(&mut self) -> Result<(), VmError> {
        match self.interrupt_pending()? {
            Some((irq, more)) => self.try_deliver_interrupt(irq, more),
            None => Ok(()),
        }
    }

    /// One context transfer.
    fn run_guest_once(&mut self) -> Result<Gva, VmError> {
        self.ensure_bound()?;
        if self.changed.contains(Changed::IDT) {
            self.tables.copy_traps(&self.idt, self.syscall_vector);
        }
        if self.changed.contains(Changed::GDT) {
            self.tables.copy_gdt(&self.gdt);
        } else if self.changed.contains(Changed::GDT_TLS) {
            self.tables.copy_tls(&self.gdt);
        }
        let changed = core::mem::replace(&mut self.changed, Changed::empty());

        let root = {
            let cache = self.guest.cache.lock();
            debug_assert!(cache.switcher_mapped());
            cache
                .root(self.slot)
                .ok_or_else(|| fatal!("vcpu#{} runs on unallocated slot {}", self.id, self.slot))?
        };
        let _irq = InterruptGuard::new();
        let cr2 = self.switcher.switch_to_guest(SwitchFrame {
            vcpu_id: self.id,
            root,
            regs: &mut self.regs,
            tables: &self.tables,
            changed,
            memory: self.guest.memory(),
            cr2: Gva::default(),
        });
        Ok(cr2)
    }

    fn handle_trap(&mut self, cr2: Gva) -> Result<(), VmError> {
        let trapnum = self.regs.trapnum;
        match trapnum {
            GENERAL_PROTECTION if self.regs.errcode == 0 => {
                if self.emulate_insn()? {
                    return Ok(());
                }
                if self.is_hypercall()? {
                    return self.rewrite_hypercall();
                }
            }
            INVALID_OPCODE => {
                if self.is_hypercall()? {
                    return self.rewrite_hypercall();
                }
            }
            PAGE_FAULT => {
                let access = PFErrorCode::from_bits_truncate(self.regs.errcode);
                if self.demand_page(cr2, access)? {
                    return Ok(());
                }
                if let Some(data) = self.data {
                    data.set_cr2(self.guest.memory(), cr2.as_u32())?;
                }
            }
            DEVICE_NOT_AVAILABLE if !self.ts => return Ok(()),
            HYPERCALL_VECTOR => {
                self.hcall = Some(HcallArgs::from_regs(&self.regs));
                return Ok(());
            }
            n if n as usize >= FIRST_EXTERNAL_VECTOR
                && (n as usize) < IDT_ENTRIES
                && n != SYSCALL_VECTOR
                && n != self.syscall_vector =>
            {
                // The host took an interrupt while the guest ran.
                std::thread::yield_now();
                return Ok(());
            }
            _ => {}
        }
        if self.deliver_trap(trapnum)? {
            Ok(())
        } else {
            Err(fatal!(
                "unhandled trap {} at {:#x} ({:#x})",
                trapnum,
                self.regs.eip,
                if trapnum == PAGE_FAULT {
                    cr2.as_u32()
                } else {
                    self.regs.errcode
                }
            ))
        }
    }

    /// Rebind if another vcpu evicted our directory, or moved the guest off
    /// the linear identity.
    fn ensure_bound(&mut self) -> Result<(), VmError> {
        let mut cache = self.guest.cache.lock();
        self.pgdir = cache.resolve(self.pgdir);
        if cache.slot_id(self.slot) == Some(self.pgdir) {
            return Ok(());
        }
        debug!("vcpu#{}: slot {} was taken, rebinding {:?}", self.id, self.slot, self.pgdir);
        let binding = cache.bind(self.guest.memory(), self.pgdir)?;
        drop(cache);
        self.slot = binding.slot;
        self.pin_stack_pages()
    }

    /// Resolve a page fault from the shadow tables.
    pub(crate) fn demand_page(&mut self, va: Gva, access: PFErrorCode) -> Result<bool, VmError> {
        loop {
            self.ensure_bound()?;
            let mut cache = self.guest.cache.lock();
            // Another vcpu may have taken the slot since.
            if cache.slot_id(self.slot) == Some(self.pgdir) {
                return cache.demand_fault(self.guest.memory(), self.slot, va, access);
            }
        }
    }

    /// Translate `va` through the guest's page tables. No mapping is fatal.
    pub(crate) fn guest_pa(&self, va: Gva) -> Result<Gpa, VmError> {
        self.try_guest_pa(va)?
            .ok_or_else(|| fatal!("bad address {}", va))
    }

    pub(crate) fn try_guest_pa(&self, va: Gva) -> Result<Option<Gpa>, VmError> {
        self.guest
            .cache
            .lock()
            .translate_guest(self.guest.memory(), self.pgdir, va)
    }

    /// Switch to guest page directory `gpgdir`.
    pub(crate) fn new_pagetable(&mut self, gpgdir: Gpa) -> Result<(), VmError> {
        let mut cache = self.guest.cache.lock();
        if cache.is_linear() {
            cache.exit_linear(self.guest.memory(), gpgdir);
        }
        self.pgdir = PgdirId::Guest(gpgdir);
        let binding = cache.bind(self.guest.memory(), self.pgdir)?;
        drop(cache);
        self.slot = binding.slot;
        if binding.blank {
            self.pin_stack_pages()?;
        }
        Ok(())
    }

    /// Flush the user mappings of the current slot.
    pub(crate) fn flush_user_mappings(&mut self) {
        self.guest
            .cache
            .lock()
            .invalidate_user_mappings(self.guest.memory(), self.slot);
    }

    /// Flush every slot.
    pub(crate) fn flush_all_pagetables(&mut self) -> Result<(), VmError> {
        self.guest
            .cache
            .lock()
            .invalidate_all(self.guest.memory());
        self.pin_stack_pages()
    }

    /// Record the interrupt stack used for traps from guest user mode.
    pub(crate) fn set_stack(&mut self, segment: u32, esp: u32, pages: u32) -> Result<(), VmError> {
        if segment & 3 != GUEST_PL {
            return Err(fatal!("bad stack segment {}", segment));
        }
        if pages > 2 {
            return Err(fatal!("bad stack pages {}", pages));
        }
        self.ss1 = segment;
        self.esp1 = esp;
        self.stack_pages = pages;
        self.pin_stack_pages()
    }

    /// Make sure the interrupt stack is mapped writable in the current slot.
    pub(crate) fn pin_stack_pages(&mut self) -> Result<(), VmError> {
        for i in 0..self.stack_pages {
            let va = Gva::new(self.esp1) - 1 - i * PAGE_SIZE as u32;
            if !self.demand_page(va, PFErrorCode::WRITE_ACCESS)? {
                return Err(fatal!("bad stack page {}", va));
            }
        }
        Ok(())
    }
}
