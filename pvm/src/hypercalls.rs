//! Hypercalls.
//!
//! The guest asks the host for privileged work either synchronously, by
//! trapping through [`HYPERCALL_VECTOR`] with the request in its registers, or
//! asynchronously, by queueing requests in a ring inside the shared data page.
//! The ring is drained whenever the guest traps in with a synchronous call, so
//! batched requests take effect before the call that follows them.
//!
//! Register ABI: `eax` holds the operation, `ebx`, `ecx`, `edx` and `esi` hold
//! the arguments.
use crate::{
    addressing::{Gpa, Gva},
    fatal,
    memory::GuestMemory,
    page_table::Pte,
    segments::IDT_ENTRIES,
    switcher::{Changed, Registers, SWITCHER_ADDR, SWITCHER_RESERVE},
    vcpu::VCpu,
    VmError,
};
use bytemuck::{Pod, Zeroable};
use core::mem::offset_of;
use log::{info, trace};
use num_enum::TryFromPrimitive;

/// Trap vector of the synchronous hypercall.
pub const HYPERCALL_VECTOR: u32 = 0x1f;
/// Entries of the asynchronous ring.
pub const HCALL_RING_SIZE: usize = 64;
/// Status byte of a free ring entry.
pub const HCALL_DONE: u8 = 0xff;
/// Longest shutdown message, terminator included.
pub const SHUTDOWN_MSG_MAX: usize = 128;

/// One hypercall, as it sits in the registers or in the ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HcallArgs {
    pub op: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
    pub arg4: u32,
}

impl HcallArgs {
    /// Arguments of a hypercall trap.
    pub fn from_regs(regs: &Registers) -> Self {
        Self {
            op: regs.eax,
            arg1: regs.ebx,
            arg2: regs.ecx,
            arg3: regs.edx,
            arg4: regs.esi,
        }
    }
}

/// Operation numbers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum HypercallNo {
    FlushAsync = 0,
    Init = 1,
    Shutdown = 2,
    NewPageTable = 4,
    FlushTlb = 5,
    LoadIdtEntry = 6,
    SetStack = 7,
    TaskSwitched = 8,
    SetClockEvent = 9,
    Halt = 10,
    SetPmd = 13,
    SetPte = 14,
    SetPgd = 15,
    LoadTls = 16,
    Notify = 17,
    LoadGdtEntry = 18,
    SendInterrupts = 19,
}

/// What a [`Hypercall::Shutdown`] asks for.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ShutdownMode {
    PowerOff = 1,
    Restart = 2,
}

/// A decoded hypercall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hypercall {
    /// Return to the host so it drains the ring.
    FlushAsync,
    /// Hand the host the shared data page. Must come first.
    Init {
        /// Guest physical address of the page.
        data: Gpa,
    },
    /// Stop the guest.
    Shutdown {
        /// Guest physical address of a NUL terminated message.
        reason: Gpa,
        mode: ShutdownMode,
    },
    /// Switch to another page directory.
    NewPageTable { pgdir: Gpa },
    /// Drop shadow mappings, of every directory when `all` is set.
    FlushTlb { all: bool },
    /// Install IDT gate `num`.
    LoadIdtEntry { num: u32, lo: u32, hi: u32 },
    /// Declare the stack used for traps from guest user mode.
    SetStack { segment: u32, esp: u32, pages: u32 },
    /// The guest's lazy FPU flag.
    TaskSwitched(bool),
    /// Arm the clock `delta` nanoseconds from now, or disarm it on zero.
    SetClockEvent { delta: u32 },
    /// Sleep until an interrupt arrives.
    Halt,
    /// Middle level entry `index` of `pgdir` changed.
    SetPmd { pgdir: Gpa, index: u32 },
    /// Leaf mapping `va` of `pgdir` changed to `pte`.
    SetPte { pgdir: Gpa, va: Gva, pte: Pte },
    /// Directory entry `index` of `pgdir` changed.
    SetPgd { pgdir: Gpa, index: u32 },
    /// Reload the TLS descriptors from `table`.
    LoadTls { table: Gpa },
    /// Pass `value` to the device side.
    Notify { value: u32 },
    /// Install GDT entry `num`.
    LoadGdtEntry { num: u32, lo: u32, hi: u32 },
    /// Return to the host so it looks at pending interrupts.
    SendInterrupts,
}

impl Hypercall {
    /// Decode `args`. Unknown operations and malformed arguments are fatal.
    pub fn resolve(args: &HcallArgs) -> Result<Self, VmError> {
        let HcallArgs {
            op,
            arg1,
            arg2,
            arg3,
            ..
        } = *args;
        let no = HypercallNo::try_from(op).map_err(|_| fatal!("bad hypercall {}", op))?;
        Ok(match no {
            HypercallNo::FlushAsync => Self::FlushAsync,
            HypercallNo::Init => Self::Init {
                data: Gpa::new(arg1),
            },
            HypercallNo::Shutdown => Self::Shutdown {
                reason: Gpa::new(arg1),
                mode: ShutdownMode::try_from(arg2)
                    .map_err(|_| fatal!("bad shutdown mode {}", arg2))?,
            },
            HypercallNo::NewPageTable => Self::NewPageTable {
                pgdir: Gpa::new(arg1),
            },
            HypercallNo::FlushTlb => Self::FlushTlb { all: arg1 != 0 },
            HypercallNo::LoadIdtEntry => Self::LoadIdtEntry {
                num: arg1,
                lo: arg2,
                hi: arg3,
            },
            HypercallNo::SetStack => Self::SetStack {
                segment: arg1,
                esp: arg2,
                pages: arg3,
            },
            HypercallNo::TaskSwitched => Self::TaskSwitched(arg1 != 0),
            HypercallNo::SetClockEvent => Self::SetClockEvent { delta: arg1 },
            HypercallNo::Halt => Self::Halt,
            HypercallNo::SetPmd => Self::SetPmd {
                pgdir: Gpa::new(arg1),
                index: arg2,
            },
            HypercallNo::SetPte => Self::SetPte {
                pgdir: Gpa::new(arg1),
                va: Gva::new(arg2),
                pte: Pte(arg3),
            },
            HypercallNo::SetPgd => Self::SetPgd {
                pgdir: Gpa::new(arg1),
                index: arg2,
            },
            HypercallNo::LoadTls => Self::LoadTls {
                table: Gpa::new(arg1),
            },
            HypercallNo::Notify => Self::Notify { value: arg1 },
            HypercallNo::LoadGdtEntry => Self::LoadGdtEntry {
                num: arg1,
                lo: arg2,
                hi: arg3,
            },
            HypercallNo::SendInterrupts => Self::SendInterrupts,
        })
    }
}

/// Layout of the page shared between guest and host.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SharedData {
    /// `Eflags::IF` when the guest accepts interrupts.
    pub irq_enabled: u32,
    /// Set by the host when an interrupt is waiting for the guest to enable
    /// interrupts.
    pub irq_pending: u32,
    /// Interrupt lines the guest does not want.
    pub blocked_interrupts: u32,
    /// Faulting address of the last page fault delivered to the guest.
    pub cr2: u32,
    pub time_sec: u64,
    pub time_nsec: u32,
    pub tsc_khz: u32,
    /// Code range in which interrupts are withheld.
    pub noirq_start: u32,
    pub noirq_end: u32,
    /// Start of the kernel's global mappings.
    pub kernel_address: u32,
    /// Address space reserved at the top for the host.
    pub reserve_mem: u32,
    pub syscall_vec: u32,
    pub _reserved: u32,
    /// [`HCALL_DONE`] marks a free ring entry.
    pub hcall_status: [u8; HCALL_RING_SIZE],
    pub hcalls: [HcallArgs; HCALL_RING_SIZE],
}

macro_rules! shared_field {
    ($field:ident, $set:ident: $ty:ty) => {
        pub fn $field(&self, mem: &GuestMemory) -> Result<$ty, VmError> {
            mem.read_obj(self.0 + offset_of!(SharedData, $field) as u32)
        }

        pub fn $set(&self, mem: &GuestMemory, v: $ty) -> Result<(), VmError> {
            mem.write_obj(self.0 + offset_of!(SharedData, $field) as u32, &v)
        }
    };
}

/// The shared data page, at a guest physical address validated at `Init`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedPage(Gpa);

impl SharedPage {
    /// Check that a whole [`SharedData`] fits at `gpa`.
    pub fn new(mem: &GuestMemory, gpa: Gpa) -> Result<Self, VmError> {
        if !mem.contains(gpa, core::mem::size_of::<SharedData>()) {
            return Err(fatal!("bad shared data page {}", gpa));
        }
        Ok(Self(gpa))
    }

    /// Guest physical address of the page.
    pub fn gpa(&self) -> Gpa {
        self.0
    }

    shared_field!(irq_enabled, set_irq_enabled: u32);
    shared_field!(irq_pending, set_irq_pending: u32);
    shared_field!(blocked_interrupts, set_blocked_interrupts: u32);
    shared_field!(cr2, set_cr2: u32);
    shared_field!(tsc_khz, set_tsc_khz: u32);
    shared_field!(noirq_start, set_noirq_start: u32);
    shared_field!(noirq_end, set_noirq_end: u32);
    shared_field!(kernel_address, set_kernel_address: u32);
    shared_field!(reserve_mem, set_reserve_mem: u32);
    shared_field!(syscall_vec, set_syscall_vec: u32);

    /// Publish the wall clock.
    pub fn set_time(&self, mem: &GuestMemory, sec: u64, nsec: u32) -> Result<(), VmError> {
        mem.write_obj(self.0 + offset_of!(SharedData, time_sec) as u32, &sec)?;
        mem.write_obj(self.0 + offset_of!(SharedData, time_nsec) as u32, &nsec)
    }

    /// Status byte of ring entry `n`.
    pub fn hcall_status(&self, mem: &GuestMemory, n: usize) -> Result<u8, VmError> {
        mem.read_obj(self.0 + (offset_of!(SharedData, hcall_status) + n) as u32)
    }

    pub fn set_hcall_status(&self, mem: &GuestMemory, n: usize, v: u8) -> Result<(), VmError> {
        mem.write_obj(self.0 + (offset_of!(SharedData, hcall_status) + n) as u32, &v)
    }

    /// Ring entry `n`.
    pub fn hcall(&self, mem: &GuestMemory, n: usize) -> Result<HcallArgs, VmError> {
        let off = offset_of!(SharedData, hcalls) + n * core::mem::size_of::<HcallArgs>();
        mem.read_obj(self.0 + off as u32)
    }

    pub fn set_hcall(&self, mem: &GuestMemory, n: usize, args: &HcallArgs) -> Result<(), VmError> {
        let off = offset_of!(SharedData, hcalls) + n * core::mem::size_of::<HcallArgs>();
        mem.write_obj(self.0 + off as u32, args)
    }
}

impl VCpu {
    /// Run the ring and then the hypercall the guest trapped with.
    ///
    /// The trapped call stays pending while a notification from the ring is
    /// outstanding.
    pub(crate) fn do_hypercalls(&mut self) -> Result<(), VmError> {
        let Some(args) = self.hcall else {
            return Ok(());
        };
        let Some(data) = self.data else {
            self.hcall = None;
            return self.initialize(&args);
        };
        self.do_async_hcalls(data)?;
        if self.pending_notify.is_none() && !self.guest.is_dead() {
            self.hcall = None;
            self.do_hcall(Hypercall::resolve(&args)?)?;
        }
        Ok(())
    }

    fn initialize(&mut self, args: &HcallArgs) -> Result<(), VmError> {
        if args.op != HypercallNo::Init as u32 {
            return Err(fatal!("hypercall {} before INIT", args.op));
        }
        let guest = self.guest.clone();
        let mem = guest.memory();
        let data = SharedPage::new(mem, Gpa::new(args.arg1))?;

        let noirq = data.noirq_start(mem)?..data.noirq_end(mem)?;
        if noirq.start > noirq.end {
            return Err(fatal!("bad noirq region {:#x}-{:#x}", noirq.start, noirq.end));
        }
        let kernel_address = data.kernel_address(mem)?;
        if kernel_address >= SWITCHER_ADDR {
            return Err(fatal!("bad kernel address {:#x}", kernel_address));
        }
        let syscall_vec = data.syscall_vec(mem)?;
        if syscall_vec as usize >= IDT_ENTRIES {
            return Err(fatal!("bad syscall vector {}", syscall_vec));
        }
        data.set_reserve_mem(mem, SWITCHER_RESERVE)?;
        data.set_tsc_khz(mem, guest.config().tsc_khz)?;

        guest
            .cache
            .lock()
            .set_kernel_address(Gva::new(kernel_address));
        self.noirq = noirq;
        self.syscall_vector = syscall_vec;
        self.changed |= Changed::IDT;
        self.data = Some(data);
        self.write_timestamp()?;
        info!(
            "vcpu#{}: shared page at {}, kernel at {:#x}",
            self.id,
            data.gpa(),
            kernel_address
        );
        Ok(())
    }

    fn do_async_hcalls(&mut self, data: SharedPage) -> Result<(), VmError> {
        let guest = self.guest.clone();
        let mem = guest.memory();
        for _ in 0..HCALL_RING_SIZE {
            let n = self.next_hcall;
            if data.hcall_status(mem, n)? == HCALL_DONE {
                break;
            }
            self.next_hcall = (n + 1) % HCALL_RING_SIZE;
            let args = data.hcall(mem, n)?;
            self.do_hcall(Hypercall::resolve(&args)?)?;
            data.set_hcall_status(mem, n, HCALL_DONE)?;
            if self.pending_notify.is_some() || guest.is_dead() {
                break;
            }
        }
        Ok(())
    }

    fn do_hcall(&mut self, hc: Hypercall) -> Result<(), VmError> {
        trace!("vcpu#{}: {:?}", self.id, hc);
        let guest = self.guest.clone();
        let mem = guest.memory();
        match hc {
            Hypercall::FlushAsync | Hypercall::SendInterrupts => {}
            Hypercall::Init { .. } => return Err(fatal!("already have shared data page")),
            Hypercall::Shutdown { reason, mode } => {
                let msg = mem.read_cstr(reason, SHUTDOWN_MSG_MAX)?;
                match mode {
                    ShutdownMode::PowerOff => guest.kill(format!("CRASH: {}", msg)),
                    ShutdownMode::Restart => guest.request_restart(),
                }
            }
            Hypercall::NewPageTable { pgdir } => self.new_pagetable(pgdir)?,
            Hypercall::FlushTlb { all: true } => self.flush_all_pagetables()?,
            Hypercall::FlushTlb { all: false } => self.flush_user_mappings(),
            Hypercall::LoadIdtEntry { num, lo, hi } => {
                if self.idt.load_entry(num, lo, hi)? {
                    self.changed |= Changed::IDT;
                }
            }
            Hypercall::SetStack {
                segment,
                esp,
                pages,
            } => self.set_stack(segment, esp, pages)?,
            Hypercall::TaskSwitched(ts) => self.ts = ts,
            Hypercall::SetClockEvent { delta } => self.clock.set(&self.shared, delta)?,
            Hypercall::Halt => self.shared.set_halted(true),
            Hypercall::SetPmd { pgdir, index } => guest.cache.lock().set_pmd(mem, pgdir, index)?,
            Hypercall::SetPte { pgdir, va, pte } => {
                guest.cache.lock().set_pte(mem, pgdir, va, pte)?
            }
            Hypercall::SetPgd { pgdir, index } => guest.cache.lock().set_pgd(mem, pgdir, index)?,
            Hypercall::LoadTls { table } => {
                self.gdt.load_tls(mem, table)?;
                self.changed |= Changed::GDT_TLS;
            }
            Hypercall::Notify { value } => self.pending_notify = Some(value),
            Hypercall::LoadGdtEntry { num, lo, hi } => {
                self.gdt.load_entry(num, lo, hi)?;
                self.changed |= Changed::GDT;
            }
        }
        Ok(())
    }
}
