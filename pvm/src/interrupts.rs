//! Virtual interrupts and trap delivery.
//!
//! The guest never sees a real interrupt. Lines raised by the launcher or the
//! clock are collected in a per-vcpu bitmap, filtered through the guest's
//! `blocked_interrupts` word, and delivered one at a time by building the
//! frame a real CPU would push on the guest's stack and jumping to the gate.
use crate::{
    addressing::Gva,
    fatal,
    segments::{Gate, GateType, FIRST_EXTERNAL_VECTOR, GUEST_PL, IDT_ENTRIES, KERNEL_CS},
    switcher::Eflags,
    vcpu::{VCpu, VCpuShared},
    VmError,
};
use crossbeam_channel::{at, never, select, Receiver, Sender};
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Number of virtual interrupt lines.
pub const NR_IRQS: u32 = 32;
/// Line raised by the clock.
pub const TIMER_IRQ: u32 = 0;

/// Whether the CPU pushes an error code for `trap`.
fn has_err(trap: u32) -> bool {
    matches!(trap, 8 | 10..=14 | 17)
}

impl VCpu {
    /// Lowest pending line the guest has not blocked, and whether others
    /// remain after it.
    pub(crate) fn interrupt_pending(&self) -> Result<Option<(u32, bool)>, VmError> {
        // Nothing is deliverable before the guest told us where to look.
        let Some(data) = self.data else {
            return Ok(None);
        };
        let blocked = data.blocked_interrupts(self.guest.memory())?;
        let pending = self.shared.pending_irqs() & !blocked;
        if pending == 0 {
            return Ok(None);
        }
        let irq = pending.trailing_zeros();
        Ok(Some((irq, pending & !(1 << irq) != 0)))
    }

    /// Deliver `irq` if the guest can take it now. Otherwise leave it pending
    /// and flag the guest so it returns once it enables interrupts.
    pub(crate) fn try_deliver_interrupt(&mut self, irq: u32, more: bool) -> Result<(), VmError> {
        let Some(data) = self.data else {
            return Ok(());
        };
        let guest = self.guest.clone();
        let mem = guest.memory();
        if self.noirq.contains(&self.regs.eip) {
            return data.set_irq_pending(mem, Eflags::IF.bits());
        }
        if self.shared.is_halted() {
            // A halted guest sleeps with interrupts on.
            data.set_irq_enabled(mem, Eflags::IF.bits())?;
            self.shared.set_halted(false);
        } else if data.irq_enabled(mem)? & Eflags::IF.bits() == 0 {
            return data.set_irq_pending(mem, Eflags::IF.bits());
        }

        let gate = self.idt.gate(FIRST_EXTERNAL_VECTOR + irq as usize);
        if gate.is_present() {
            self.shared.clear_irq(irq);
            self.set_guest_interrupt(gate, false)?;
        }
        self.write_timestamp()?;
        data.set_irq_pending(mem, if more { Eflags::IF.bits() } else { 0 })
    }

    /// Reflect trap `num` into the guest. `Ok(false)` if the guest has no
    /// handler for it.
    pub(crate) fn deliver_trap(&mut self, num: u32) -> Result<bool, VmError> {
        if num as usize >= IDT_ENTRIES {
            return Ok(false);
        }
        let gate = self.idt.gate(num as usize);
        if !gate.is_present() {
            return Ok(false);
        }
        self.set_guest_interrupt(gate, has_err(num))?;
        Ok(true)
    }

    /// Build an interrupt frame on the guest stack and enter `gate`.
    ///
    /// A trap from guest user mode switches to the stack declared with
    /// `SetStack` and saves the old stack first.
    fn set_guest_interrupt(&mut self, gate: Gate, has_err: bool) -> Result<(), VmError> {
        let (ss, mut sp) = if self.regs.ss & 3 != GUEST_PL {
            if self.esp1 == 0 {
                return Err(fatal!("trap from user mode without a kernel stack"));
            }
            let mut sp = Gva::new(self.esp1);
            self.push_guest_stack(&mut sp, self.regs.ss)?;
            self.push_guest_stack(&mut sp, self.regs.esp)?;
            (self.ss1, sp)
        } else {
            (self.regs.ss, Gva::new(self.regs.esp))
        };

        let data = self.data.ok_or_else(|| fatal!("interrupt before INIT"))?;
        let mut eflags = self.regs.eflags;
        if data.irq_enabled(self.guest.memory())? & Eflags::IF.bits() == 0 {
            eflags &= !Eflags::IF.bits();
        }
        self.push_guest_stack(&mut sp, eflags)?;
        self.push_guest_stack(&mut sp, self.regs.cs)?;
        self.push_guest_stack(&mut sp, self.regs.eip)?;
        if has_err {
            self.push_guest_stack(&mut sp, self.regs.errcode)?;
        }

        self.regs.ss = ss;
        self.regs.esp = sp.as_u32();
        self.regs.cs = KERNEL_CS | GUEST_PL;
        self.regs.eip = gate.address();
        if gate.gate_type() == Some(GateType::Interrupt) {
            data.set_irq_enabled(self.guest.memory(), 0)?;
        }
        Ok(())
    }

    fn push_guest_stack(&self, sp: &mut Gva, v: u32) -> Result<(), VmError> {
        *sp -= 4;
        let gpa = self.guest_pa(*sp)?;
        self.guest.memory().write_obj(gpa, &v)
    }

    /// Publish the wall clock in the shared page.
    pub(crate) fn write_timestamp(&self) -> Result<(), VmError> {
        let Some(data) = self.data else {
            return Ok(());
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        data.set_time(self.guest.memory(), now.as_secs(), now.subsec_nanos())
    }
}

/// One-shot clock of a vcpu.
///
/// A thread per vcpu, started on first use, waits for the deadline and raises
/// [`TIMER_IRQ`]. Each `SetClockEvent` replaces the deadline.
#[derive(Default)]
pub(crate) struct ClockEvent {
    worker: Option<(Sender<Option<Instant>>, JoinHandle<()>)>,
}

impl ClockEvent {
    /// Fire `delta` nanoseconds from now. Zero disarms.
    pub(crate) fn set(&mut self, vcpu: &Arc<VCpuShared>, delta: u32) -> Result<(), VmError> {
        if delta == 0 {
            self.disarm();
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_nanos(delta as u64);
        if self.worker.is_none() {
            let (tx, rx) = crossbeam_channel::unbounded();
            let vcpu = vcpu.clone();
            let handle = std::thread::Builder::new()
                .name(format!("clock#{}", vcpu.id()))
                .spawn(move || clock_thread(vcpu, rx))
                .map_err(|_| VmError::OutOfMemory("clock thread"))?;
            self.worker = Some((tx, handle));
        }
        if let Some((tx, _)) = &self.worker {
            let _ = tx.send(Some(deadline));
        }
        Ok(())
    }

    /// Cancel a pending expiry.
    pub(crate) fn disarm(&mut self) {
        if let Some((tx, _)) = &self.worker {
            let _ = tx.send(None);
        }
    }
}

impl Drop for ClockEvent {
    fn drop(&mut self) {
        if let Some((tx, handle)) = self.worker.take() {
            drop(tx);
            let _ = handle.join();
        }
    }
}

fn clock_thread(vcpu: Arc<VCpuShared>, rx: Receiver<Option<Instant>>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let timeout = deadline.map_or_else(never, at);
        select! {
            recv(rx) -> cmd => match cmd {
                Ok(next) => deadline = next,
                Err(_) => break,
            },
            recv(timeout) -> _ => {
                deadline = None;
                vcpu.raise(TIMER_IRQ);
            }
        }
    }
}
