//! End-to-end runs of a guest driven by the scripted switcher.
use crossbeam_channel::{unbounded, Receiver, Sender};
use pvm::{
    addressing::{Gpa, Gva, Hfn},
    hypercalls::{HcallArgs, HypercallNo, SharedPage, HCALL_DONE, HCALL_RING_SIZE},
    page_table::{PFErrorCode, Pde, Pte, PteFlags},
    segments::{SegmentDescriptor, GDT_ENTRY_TLS_MIN, GDT_ENTRY_TSS, GUEST_PL, KERNEL_CS},
    shadow::PgdirId,
    switcher::{scripted::Scripted, Changed, Registers, SwitcherPages},
    GuestBuilder, GuestConfig, GuestHandle, RunOutcome, VmError,
};
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::{Duration, Instant},
};

const MEM_BASE: Hfn = Hfn(0x10000);
const PFN_LIMIT: u32 = 256;
const SHARED: u32 = 0x1000;
const PGDIR: u32 = 0x2000;
const KERNEL_PT: u32 = 0x3000;
const USER_PT: u32 = 0x4000;
const PGDIR2: u32 = 0x5000;
const TLS_TABLE: u32 = 0x6000;
const MESSAGE: u32 = 0x7000;
const KERNEL: u32 = 0xC000_0000;
const USER_VA: u32 = 0x0040_0000;
const USER_FRAME: u32 = 0x80;
const STACK_TOP: u32 = KERNEL + 0x9000;
const PF_HANDLER: u32 = KERNEL + 0x5000;
const IRQ0_HANDLER: u32 = KERNEL + 0x6000;
const SYSCALL_HANDLER: u32 = KERNEL + 0x4800;
const FPU_HANDLER: u32 = KERNEL + 0x4c00;
const ENTRY: u32 = KERNEL + 0x1000;

fn rw() -> PteFlags {
    PteFlags::P | PteFlags::RW
}

fn urw() -> PteFlags {
    PteFlags::P | PteFlags::RW | PteFlags::US
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Guest image: a shared page with an empty ring, a directory mapping the
/// whole window at `KERNEL` and one user page, a second directory with only
/// the kernel mapping, and a shutdown message.
fn build(scripts: Vec<Scripted>) -> (GuestHandle, Arc<SwitcherPages>) {
    init_logger();
    let pages = SwitcherPages::load(Hfn(0x100), 4).unwrap();
    let config = GuestConfig::new(MEM_BASE, PFN_LIMIT, Gva::new(ENTRY))
        .eviction_seed(7)
        .tsc_khz(2_000_000);
    let mut handle = scripts
        .into_iter()
        .fold(GuestBuilder::new(config, pages.clone()), |b, s| b.vcpu(s))
        .finalize()
        .unwrap();
    for vcpu in handle.vcpus.iter_mut() {
        vcpu.regs_mut().esp = STACK_TOP;
    }

    let mem = handle.guest.memory();
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    data.set_kernel_address(mem, KERNEL).unwrap();
    data.set_syscall_vec(mem, 0x80).unwrap();
    for n in 0..HCALL_RING_SIZE {
        data.set_hcall_status(mem, n, HCALL_DONE).unwrap();
    }

    let kernel_pde = Pde::new(KERNEL_PT >> 12, rw());
    let kernel_pgd_index = 4 * (KERNEL >> 22);
    mem.write_obj(Gpa::new(PGDIR + kernel_pgd_index), &kernel_pde).unwrap();
    mem.write_obj(Gpa::new(PGDIR2 + kernel_pgd_index), &kernel_pde).unwrap();
    for pfn in 0..PFN_LIMIT {
        let pte = Pte::new(pfn, rw() | PteFlags::A | PteFlags::D);
        mem.write_obj(Gpa::new(KERNEL_PT + 4 * pfn), &pte).unwrap();
    }
    mem.write_obj(Gpa::new(PGDIR + 4 * (USER_VA >> 22)), &Pde::new(USER_PT >> 12, urw()))
        .unwrap();
    mem.write_obj(user_pte(), &Pte::new(USER_FRAME, urw())).unwrap();
    mem.write(Gpa::new(MESSAGE), b"done\0").unwrap();
    (handle, pages)
}

fn user_pte() -> Gpa {
    Gpa::new(USER_PT + 4 * ((USER_VA >> 12) & 0x3ff))
}

fn boot() -> Scripted {
    Scripted::new()
        .hypercall(HypercallNo::Init as u32, [SHARED, 0, 0, 0])
        .hypercall(HypercallNo::NewPageTable as u32, [PGDIR, 0, 0, 0])
}

fn shutdown(script: Scripted) -> Scripted {
    script.hypercall(HypercallNo::Shutdown as u32, [MESSAGE, 1, 0, 0])
}

fn crashed() -> RunOutcome {
    RunOutcome::Dead("CRASH: done".into())
}

/// Step touching `va`, as the guest kernel would.
fn touch(script: Scripted, va: u32, access: PFErrorCode) -> Scripted {
    script.step(move |f| {
        if f.access(Gva::new(va), access).is_some() {
            f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
        }
    })
}

/// Step reporting what `va` resolves to through the shadow tables.
fn lookup_step(script: Scripted, va: u32, tx: &Sender<Option<Hfn>>) -> Scripted {
    let tx = tx.clone();
    script.step(move |f| {
        tx.send(f.root.lookup(Gva::new(va)).and_then(|spte| spte.hfn()))
            .unwrap();
        f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
    })
}

/// Step reporting the registers the guest resumes with.
fn snapshot(script: Scripted, tx: &Sender<Registers>) -> Scripted {
    let tx = tx.clone();
    script.step(move |f| {
        tx.send(*f.regs).unwrap();
        f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
    })
}

/// Step reporting the dirty mask of this transfer, then issuing `op`.
fn dirty_step(
    script: Scripted,
    tx: &Sender<Changed>,
    op: HypercallNo,
    args: [u32; 4],
) -> Scripted {
    let tx = tx.clone();
    script.step(move |f| {
        tx.send(f.changed).unwrap();
        f.hypercall(op as u32, args);
    })
}

/// Step announcing itself to the other vcpu and waiting, still inside the
/// guest, for the other vcpu's announcement.
fn meet(
    script: Scripted,
    tx: Sender<usize>,
    rx: Receiver<usize>,
    met: &Sender<Option<usize>>,
) -> Scripted {
    let met = met.clone();
    script.step(move |f| {
        tx.send(f.vcpu_id).unwrap();
        met.send(rx.recv_timeout(Duration::from_secs(5)).ok()).unwrap();
        f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
    })
}

/// Present gate of `kind` (0xe interrupt, 0xf trap) into the guest kernel.
fn load_gate(script: Scripted, vector: u32, handler: u32, kind: u32) -> Scripted {
    let lo = (KERNEL_CS | GUEST_PL) << 16 | (handler & 0xffff);
    let hi = handler & 0xffff_0000 | 0x8000 | GUEST_PL << 13 | kind << 8;
    script.hypercall(HypercallNo::LoadIdtEntry as u32, [vector, lo, hi, 0])
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn new_page_table_takes_a_fresh_slot() {
    let (tx, rx) = unbounded();
    let (slot_tx, slot_rx) = unbounded();
    let script = touch(boot(), USER_VA, PFErrorCode::WRITE_ACCESS);
    let script = lookup_step(script, USER_VA, &tx).step(move |f| {
        slot_tx.send(f.root.slot()).unwrap();
        f.hypercall(HypercallNo::NewPageTable as u32, [PGDIR2, 0, 0, 0]);
    });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    assert!(!guest.is_linear());
    let first = slot_rx.recv().unwrap();
    let second = vcpus[0].slot();
    assert_ne!(first, second);
    assert_eq!(guest.slot_id(first), Some(PgdirId::Guest(Gpa::new(PGDIR))));
    assert_eq!(guest.slot_id(second), Some(PgdirId::Guest(Gpa::new(PGDIR2))));

    // The shadow leaf is the pinned host frame behind the guest's leaf, and
    // the earlier directory keeps it.
    let expected = MEM_BASE + USER_FRAME as u64;
    assert_eq!(rx.recv().unwrap(), Some(expected));
    let spte = guest.shadow_lookup(first, Gva::new(USER_VA)).unwrap();
    assert_eq!(spte.hfn(), Some(expected));
    assert!(guest.memory().pin_count(expected) >= 1);
    assert!(guest.switcher_mapped());

    let gpte: Pte = guest.memory().read_obj(user_pte()).unwrap();
    assert!(gpte.flags().contains(PteFlags::A | PteFlags::D));
}

#[test]
fn huge_page_leaf_kills_guest() {
    let script = touch(boot(), USER_VA, PFErrorCode::empty());
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    guest
        .memory()
        .write_obj(user_pte(), &Pte::new(USER_FRAME, urw() | PteFlags::PSE))
        .unwrap();

    match vcpus[0].run().unwrap() {
        RunOutcome::Dead(reason) => assert!(reason.contains("bad page table entry"), "{}", reason),
        other => panic!("unexpected {:?}", other),
    }
    assert!(guest.shadow_lookup(vcpus[0].slot(), Gva::new(USER_VA)).is_none());
    assert!(matches!(vcpus[0].run(), Err(VmError::GuestDead)));
}

#[test]
fn frame_beyond_window_kills_guest() {
    let script = touch(boot(), USER_VA, PFErrorCode::empty());
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    guest
        .memory()
        .write_obj(user_pte(), &Pte::new(PFN_LIMIT, urw()))
        .unwrap();

    assert!(matches!(vcpus[0].run().unwrap(), RunOutcome::Dead(r) if r.contains("bad page table entry")));
    assert!(guest.shadow_lookup(vcpus[0].slot(), Gva::new(USER_VA)).is_none());
}

#[test]
fn halted_vcpu_sleeps_until_interrupt() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 32, IRQ0_HANDLER, 0xe)
        .hypercall(HypercallNo::Halt as u32, [0; 4]);
    let script = shutdown(snapshot(script, &tx));
    let transfers = script.transfers();
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    let mut vcpu = vcpus.remove(0);
    let runner = thread::spawn(move || vcpu.run());

    let shared = guest.vcpu(0).unwrap().clone();
    wait_until("halt", || shared.is_halted());
    let before = transfers.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transfers.load(Ordering::SeqCst), before);
    assert!(shared.is_halted());

    guest.send_interrupt(0, 0).unwrap();
    assert_eq!(runner.join().unwrap().unwrap(), crashed());
    assert!(!shared.is_halted());
    assert_eq!(shared.pending_irqs(), 0);

    let regs = rx.recv().unwrap();
    assert_eq!(regs.eip, IRQ0_HANDLER);
    assert_eq!(regs.cs, KERNEL_CS | GUEST_PL);
    assert_eq!(regs.esp, STACK_TOP - 12);

    // eflags, cs and eip were pushed at the top of the stack.
    let mem = guest.memory();
    let frame: [u32; 3] = mem.read_obj(Gpa::new(STACK_TOP - KERNEL - 12)).unwrap();
    assert_eq!(frame[0], ENTRY);
    assert_eq!(frame[1], KERNEL_CS | GUEST_PL);
    assert_ne!(frame[2] & 0x200, 0);

    // Interrupt gates leave the guest with interrupts off.
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    assert_eq!(data.irq_enabled(mem).unwrap(), 0);
}

#[test]
fn clock_event_wakes_halted_vcpu() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 32, IRQ0_HANDLER, 0xe)
        .hypercall(HypercallNo::SetClockEvent as u32, [2_000_000, 0, 0, 0])
        .hypercall(HypercallNo::Halt as u32, [0; 4]);
    let (GuestHandle { mut vcpus, .. }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    assert_eq!(rx.recv().unwrap().eip, IRQ0_HANDLER);
}

#[test]
fn blocked_and_withheld_interrupts_wait() {
    let (tx, rx) = unbounded::<Registers>();
    let script = load_gate(boot(), 33, IRQ0_HANDLER, 0xf).step(|f| {
        // Guest blocks line 1 and enables interrupts.
        let data = SharedPage::new(f.memory, Gpa::new(SHARED)).unwrap();
        data.set_blocked_interrupts(f.memory, 1 << 1).unwrap();
        data.set_irq_enabled(f.memory, 0x200).unwrap();
        f.hypercall(HypercallNo::Notify as u32, [0x10, 0, 0, 0]);
    });
    let script = snapshot(script, &tx).step(|f| {
        let data = SharedPage::new(f.memory, Gpa::new(SHARED)).unwrap();
        data.set_blocked_interrupts(f.memory, 0).unwrap();
        f.hypercall(HypercallNo::SendInterrupts as u32, [0; 4]);
    });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(0x10));
    guest.send_interrupt(0, 1).unwrap();
    guest.send_interrupt(0, 3).unwrap();
    assert_eq!(vcpus[0].run().unwrap(), crashed());

    // Line 1 was blocked on the first transfer and delivered after.
    assert_eq!(rx.recv().unwrap().eip, ENTRY);
    assert_eq!(rx.recv().unwrap().eip, IRQ0_HANDLER);
    // Line 3 has no gate and stays pending.
    assert_eq!(guest.vcpu(0).unwrap().pending_irqs(), 1 << 3);
}

#[test]
fn unresolved_page_fault_goes_to_guest() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 14, PF_HANDLER, 0xe);
    let script = touch(script, 0x0080_0000, PFErrorCode::WRITE_ACCESS);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let regs = rx.recv().unwrap();
    assert_eq!(regs.eip, PF_HANDLER);
    assert_eq!(regs.esp, STACK_TOP - 16);

    let mem = guest.memory();
    let errcode: u32 = mem.read_obj(Gpa::new(STACK_TOP - KERNEL - 16)).unwrap();
    assert_eq!(errcode, PFErrorCode::WRITE_ACCESS.bits());
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    assert_eq!(data.cr2(mem).unwrap(), 0x0080_0000);
}

#[test]
fn unhandled_trap_is_fatal() {
    let script = boot().step(|f| f.trap(0, 0));
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    match vcpus[0].run().unwrap() {
        RunOutcome::Dead(reason) => assert!(reason.starts_with("unhandled trap 0"), "{}", reason),
        other => panic!("unexpected {:?}", other),
    }
    assert!(guest.is_dead());
}

#[test]
fn port_io_is_emulated() {
    let (tx, rx) = unbounded();
    let script = boot().step(|f| {
        f.memory.write(Gpa::new(0x6800), &[0xe4, 0x60]).unwrap();
        f.regs.eip = KERNEL + 0x6800;
        f.regs.eax = 0x1234_5600;
        f.trap(13, 0);
    });
    let (GuestHandle { mut vcpus, .. }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let regs = rx.recv().unwrap();
    assert_eq!(regs.eip, KERNEL + 0x6802);
    assert_eq!(regs.eax, 0x1234_56ff);
}

#[test]
fn vmcall_is_patched_into_hypercall_trap() {
    let script = boot().step(|f| {
        f.memory.write(Gpa::new(0x6900), &[0x0f, 0x01, 0xc1]).unwrap();
        f.regs.eip = KERNEL + 0x6900;
        f.trap(6, 0);
    });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let mut insn = [0; 3];
    guest.memory().read(Gpa::new(0x6900), &mut insn).unwrap();
    assert_eq!(insn, [0xcd, 0x1f, 0x90]);
}

#[test]
fn hypercall_before_init_is_fatal() {
    let script = Scripted::new().hypercall(HypercallNo::Halt as u32, [0; 4]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    assert_eq!(
        vcpus[0].run().unwrap(),
        RunOutcome::Dead("hypercall 10 before INIT".into())
    );
    assert!(guest.is_linear());
}

#[test]
fn init_publishes_host_parameters() {
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(boot())]);
    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let mem = guest.memory();
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    assert_eq!(data.reserve_mem(mem).unwrap(), 4 << 20);
    assert_eq!(data.tsc_khz(mem).unwrap(), 2_000_000);
    let time_sec: u64 = mem.read_obj(Gpa::new(SHARED + 16)).unwrap();
    assert!(time_sec > 0);
}

#[test]
fn bad_init_arguments_are_fatal() {
    let script = Scripted::new().hypercall(HypercallNo::Init as u32, [SHARED, 0, 0, 0]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    let mem = guest.memory();
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    data.set_noirq_start(mem, KERNEL + 0x200).unwrap();
    data.set_noirq_end(mem, KERNEL + 0x100).unwrap();
    assert!(matches!(vcpus[0].run().unwrap(), RunOutcome::Dead(r) if r.starts_with("bad noirq region")));
}

#[test]
fn restart_request_is_reported() {
    let script = boot().hypercall(HypercallNo::Shutdown as u32, [MESSAGE, 2, 0, 0]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Restart);
    assert_eq!(guest.death_reason(), None);
    assert!(matches!(vcpus[0].run(), Err(VmError::GuestDead)));
}

#[test]
fn notifications_reach_registered_events() {
    let script = boot()
        .hypercall(HypercallNo::Notify as u32, [0x4242, 0, 0, 0])
        .hypercall(HypercallNo::Notify as u32, [0x5000, 0, 0, 0]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    let (tx, rx): (Sender<u32>, Receiver<u32>) = crossbeam_channel::bounded(1);
    guest.attach_event(0x5000, Arc::new(tx)).unwrap();
    assert!(matches!(
        guest.attach_event(0, Arc::new(crossbeam_channel::bounded::<u32>(1).0)),
        Err(VmError::InvalidEvent(0))
    ));

    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(0x4242));
    assert!(rx.try_recv().is_err());
    assert_eq!(vcpus[0].run().unwrap(), crashed());
    assert_eq!(rx.try_recv(), Ok(1));
}

#[test]
fn async_ring_runs_in_order_and_stops_at_notify() {
    let script = boot().step(|f| {
        let data = SharedPage::new(f.memory, Gpa::new(SHARED)).unwrap();
        let notify = |value| HcallArgs {
            op: HypercallNo::Notify as u32,
            arg1: value,
            ..HcallArgs::default()
        };
        for (n, args) in [notify(0x99), notify(0x98)].iter().enumerate() {
            data.set_hcall(f.memory, n, args).unwrap();
            data.set_hcall_status(f.memory, n, 0).unwrap();
        }
        f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
    });
    let transfers = script.transfers();
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    let mem = guest.memory();
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();

    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(0x99));
    assert_eq!(data.hcall_status(mem, 0).unwrap(), HCALL_DONE);
    assert_eq!(data.hcall_status(mem, 1).unwrap(), 0);
    let seen = transfers.load(Ordering::SeqCst);

    // The trapped call waits until the ring is through.
    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(0x98));
    assert_eq!(data.hcall_status(mem, 1).unwrap(), HCALL_DONE);
    assert_eq!(transfers.load(Ordering::SeqCst), seen);
    assert_eq!(vcpus[0].run().unwrap(), crashed());
}

#[test]
fn reserved_gdt_loads_kill_once() {
    let script = boot().step(|f| {
        let data = SharedPage::new(f.memory, Gpa::new(SHARED)).unwrap();
        let load = HcallArgs {
            op: HypercallNo::LoadGdtEntry as u32,
            arg1: GDT_ENTRY_TSS as u32,
            arg2: 0xffff,
            arg3: 0x00cf_9a00,
            arg4: 0,
        };
        for n in 0..2 {
            data.set_hcall(f.memory, n, &load).unwrap();
            data.set_hcall_status(f.memory, n, 0).unwrap();
        }
        f.hypercall(HypercallNo::LoadGdtEntry as u32, [GDT_ENTRY_TSS as u32, 0xffff, 0x00cf_9a00, 0]);
    });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    assert_eq!(
        vcpus[0].run().unwrap(),
        RunOutcome::Dead("attempt to load reserved gdt entry 16".into())
    );
    let mem = guest.memory();
    let data = SharedPage::new(mem, Gpa::new(SHARED)).unwrap();
    assert_eq!(data.hcall_status(mem, 1).unwrap(), 0);
    assert!(matches!(vcpus[0].run(), Err(VmError::GuestDead)));
}

#[test]
fn set_pte_updates_resident_shadow() {
    let (tx, rx) = unbounded();
    let script = touch(boot(), USER_VA, PFErrorCode::WRITE_ACCESS);
    let updated = Pte::new(0x81, urw() | PteFlags::A);
    let script = script.hypercall(
        HypercallNo::SetPte as u32,
        [PGDIR, USER_VA, updated.0, 0],
    );
    let script = lookup_step(script, USER_VA, &tx).step(|f| {
        let writable = f.access(Gva::new(USER_VA), PFErrorCode::WRITE_ACCESS);
        assert!(writable.is_none());
    });
    let script = lookup_step(script, USER_VA, &tx).hypercall(
        HypercallNo::SetPte as u32,
        [PGDIR, USER_VA, 0, 0],
    );
    let script = lookup_step(script, USER_VA, &tx);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    guest.memory().write_obj(user_pte(), &updated).unwrap();

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + 0x81));
    // The write fault dirtied the new page in place.
    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + 0x81));
    assert_eq!(rx.recv().unwrap(), None);
    assert_eq!(guest.memory().pin_count(MEM_BASE + 0x81), 0);
}

#[test]
fn set_pgd_and_set_pmd_release_user_tables() {
    let (tx, rx) = unbounded();
    let user_index = USER_VA >> 22;
    let script = touch(boot(), USER_VA, PFErrorCode::USER);
    let script = lookup_step(script, USER_VA, &tx)
        .hypercall(HypercallNo::SetPgd as u32, [PGDIR, user_index, 0, 0]);
    let script = touch(lookup_step(script, USER_VA, &tx), USER_VA, PFErrorCode::USER);
    let script = lookup_step(script, USER_VA, &tx)
        .hypercall(HypercallNo::SetPmd as u32, [PGDIR, user_index, 0, 0]);
    let script = lookup_step(script, USER_VA, &tx);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let user = Some(MEM_BASE + USER_FRAME as u64);
    let seen: Vec<_> = rx.try_iter().collect();
    assert_eq!(seen, [user, None, user, None]);
    assert_eq!(guest.memory().pin_count(MEM_BASE + USER_FRAME as u64), 0);
    assert!(guest.shadow_lookup(vcpus[0].slot(), Gva::new(USER_VA)).is_none());
}

#[test]
fn user_flush_keeps_kernel_mappings() {
    let (tx, rx) = unbounded();
    let kernel_va = KERNEL + 0x6000;
    let script = touch(boot(), USER_VA, PFErrorCode::empty());
    let script = touch(script, kernel_va, PFErrorCode::empty());
    let mut script = script;
    for _ in 0..2 {
        script = script.hypercall(HypercallNo::FlushTlb as u32, [0; 4]);
        script = lookup_step(lookup_step(script, USER_VA, &tx), kernel_va, &tx);
    }
    let script = script.hypercall(HypercallNo::FlushTlb as u32, [1, 0, 0, 0]);
    let script = lookup_step(script, kernel_va, &tx);
    let (GuestHandle { mut vcpus, .. }, _) = build(vec![shutdown(script)]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let flushed: Vec<_> = rx.try_iter().collect();
    let kernel = Some(MEM_BASE + 6);
    assert_eq!(flushed, [None, kernel, None, kernel, None]);
}

#[test]
fn set_stack_pins_interrupt_stack() {
    let (tx, rx) = unbounded();
    let script = boot().hypercall(
        HypercallNo::SetStack as u32,
        [0x68 | GUEST_PL, STACK_TOP, 2, 0],
    );
    let script = lookup_step(lookup_step(script, STACK_TOP - 1, &tx), STACK_TOP - 0x1001, &tx)
        .hypercall(HypercallNo::SetStack as u32, [0x68, STACK_TOP, 1, 0]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);

    assert_eq!(
        vcpus[0].run().unwrap(),
        RunOutcome::Dead("bad stack segment 104".into())
    );
    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + 8));
    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + 7));
    assert!(guest.memory().pin_count(MEM_BASE + 8) >= 1);
}

#[test]
fn user_mode_traps_use_interrupt_stack() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 14, PF_HANDLER, 0xf)
        .hypercall(HypercallNo::SetStack as u32, [0x68 | GUEST_PL, STACK_TOP, 1, 0])
        .step(|f| {
            let data = SharedPage::new(f.memory, Gpa::new(SHARED)).unwrap();
            data.set_irq_enabled(f.memory, 0x200).unwrap();
            f.regs.cs = 0x73;
            f.regs.ss = 0x7b;
            f.regs.esp = USER_VA + 0x800;
            f.regs.eip = USER_VA + 0x10;
            f.access(Gva::new(0x0080_0000), PFErrorCode::USER);
        });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let regs = rx.recv().unwrap();
    assert_eq!(regs.eip, PF_HANDLER);
    assert_eq!(regs.ss, 0x68 | GUEST_PL);
    assert_eq!(regs.esp, STACK_TOP - 24);
    let frame: [u32; 6] = guest
        .memory()
        .read_obj(Gpa::new(STACK_TOP - KERNEL - 24))
        .unwrap();
    assert_eq!(
        frame,
        [
            PFErrorCode::USER.bits(),
            USER_VA + 0x10,
            0x73,
            0x202,
            USER_VA + 0x800,
            0x7b
        ]
    );
}

#[test]
fn syscall_through_interrupt_gate_enters_guest() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 0x80, SYSCALL_HANDLER, 0xe)
        .hypercall(HypercallNo::SetStack as u32, [0x68 | GUEST_PL, STACK_TOP, 1, 0])
        // A host interrupt on an external vector is absorbed.
        .step(|f| f.trap(0x30, 0))
        .step(|f| {
            f.regs.cs = 0x73;
            f.regs.ss = 0x7b;
            f.regs.esp = USER_VA + 0x800;
            f.regs.eip = USER_VA + 0x12;
            f.trap(0x80, 0);
        });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let regs = rx.recv().unwrap();
    assert_eq!(regs.eip, SYSCALL_HANDLER);
    assert_eq!(regs.cs, KERNEL_CS | GUEST_PL);
    assert_eq!(regs.ss, 0x68 | GUEST_PL);
    assert_eq!(regs.esp, STACK_TOP - 20);
    let frame: [u32; 5] = guest
        .memory()
        .read_obj(Gpa::new(STACK_TOP - KERNEL - 20))
        .unwrap();
    assert_eq!(frame[0], USER_VA + 0x12);
    assert_eq!(frame[1], 0x73);
    assert_eq!(frame[3..], [USER_VA + 0x800, 0x7b]);
}

#[test]
fn device_not_available_follows_task_switched() {
    let (tx, rx) = unbounded();
    let script = load_gate(boot(), 7, FPU_HANDLER, 0xf)
        .hypercall(HypercallNo::TaskSwitched as u32, [0; 4])
        .step(|f| f.trap(7, 0));
    let script = snapshot(script, &tx)
        .hypercall(HypercallNo::TaskSwitched as u32, [1, 0, 0, 0])
        .step(|f| f.trap(7, 0));
    let (GuestHandle { mut vcpus, .. }, _) = build(vec![shutdown(snapshot(script, &tx))]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    // Without the flag set the host absorbs the trap.
    let absorbed = rx.recv().unwrap();
    assert_eq!(absorbed.eip, ENTRY);
    assert_eq!(absorbed.esp, STACK_TOP);
    let delivered = rx.recv().unwrap();
    assert_eq!(delivered.eip, FPU_HANDLER);
    assert_eq!(delivered.esp, STACK_TOP - 12);
}

#[test]
fn transfers_carry_the_dirty_mask() {
    let (tx, rx) = unbounded();
    let script = dirty_step(Scripted::new(), &tx, HypercallNo::Init, [SHARED, 0, 0, 0]);
    let script = dirty_step(script, &tx, HypercallNo::NewPageTable, [PGDIR, 0, 0, 0]);
    let script = dirty_step(script, &tx, HypercallNo::LoadTls, [TLS_TABLE, 0, 0, 0]);
    let script = dirty_step(script, &tx, HypercallNo::LoadGdtEntry, [15, 0xffff, 0x00cf_f200, 0]);
    let script = dirty_step(script, &tx, HypercallNo::FlushAsync, [0; 4]);
    let script = dirty_step(script, &tx, HypercallNo::Shutdown, [MESSAGE, 1, 0, 0]);
    let (GuestHandle { mut vcpus, .. }, _) = build(vec![script]);

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let masks: Vec<Changed> = rx.try_iter().collect();
    assert_eq!(
        masks,
        [
            Changed::all(),
            Changed::IDT,
            Changed::empty(),
            Changed::GDT_TLS,
            Changed::GDT,
            Changed::empty(),
        ]
    );
}

#[test]
fn load_tls_reaches_the_shadow_gdt() {
    let (tx, rx) = unbounded();
    let script = boot()
        .hypercall(HypercallNo::LoadTls as u32, [TLS_TABLE, 0, 0, 0])
        .step(move |f| {
            let tls = GDT_ENTRY_TLS_MIN..GDT_ENTRY_TLS_MIN + 3;
            let entries = <[SegmentDescriptor; 3]>::try_from(&f.tables.gdt[tls]).unwrap();
            tx.send(entries).unwrap();
            f.hypercall(HypercallNo::FlushAsync as u32, [0; 4]);
        });
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![shutdown(script)]);
    let table: [u32; 6] = [0xffff, 0x00cf_f200, 0xffff, 0x00cf_9200, 0, 0];
    guest.memory().write_obj(Gpa::new(TLS_TABLE), &table).unwrap();

    assert_eq!(vcpus[0].run().unwrap(), crashed());
    let [user, kernel, unused] = rx.recv().unwrap();
    // Loaded descriptors are marked accessed, and ring 0 becomes the guest's.
    assert_eq!((user.lo(), user.hi()), (0xffff, 0x00cf_f300));
    assert_eq!(user.dpl(), 3);
    assert_eq!((kernel.lo(), kernel.hi()), (0xffff, 0x00cf_b300));
    assert_eq!(kernel.dpl(), GUEST_PL);
    assert_eq!(unused, SegmentDescriptor::null());
}

#[test]
fn kick_interrupts_and_kill_ends_halted_vcpu() {
    let script = boot().hypercall(HypercallNo::Halt as u32, [0; 4]);
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![script]);
    let mut vcpu = vcpus.remove(0);
    let shared = guest.vcpu(0).unwrap().clone();

    let runner = thread::spawn(move || {
        let first = vcpu.run();
        (vcpu, first)
    });
    wait_until("halt", || shared.is_halted());
    guest.kick(0).unwrap();
    let (mut vcpu, first) = runner.join().unwrap();
    assert_eq!(first.unwrap(), RunOutcome::Interrupted);

    let runner = thread::spawn(move || vcpu.run());
    wait_until("halt", || shared.is_halted());
    guest.kill("launcher gave up");
    assert_eq!(
        runner.join().unwrap().unwrap(),
        RunOutcome::Dead("launcher gave up".into())
    );
}

#[test]
fn vcpu_rebinds_after_eviction_by_another() {
    let (tx, rx) = unbounded();
    let first = boot().hypercall(HypercallNo::Notify as u32, [1, 0, 0, 0]);
    let first = touch(first, USER_VA, PFErrorCode::empty());
    let first = shutdown(lookup_step(first, USER_VA, &tx));

    let mut second = Scripted::new().hypercall(HypercallNo::Init as u32, [SHARED, 0, 0, 0]);
    for dir in [0xa000, 0xb000, 0xc000, 0xd000, 0xe000, 0xf000] {
        second = second.hypercall(HypercallNo::NewPageTable as u32, [dir, 0, 0, 0]);
    }
    let second = second.hypercall(HypercallNo::Notify as u32, [2, 0, 0, 0]);

    let (GuestHandle { guest, mut vcpus }, _) = build(vec![first, second]);
    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(1));
    assert_eq!(vcpus[1].run().unwrap(), RunOutcome::Notify(2));
    assert_eq!(vcpus[0].run().unwrap(), crashed());

    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + USER_FRAME as u64));
    assert_eq!(
        guest.slot_id(vcpus[0].slot()),
        Some(PgdirId::Guest(Gpa::new(PGDIR)))
    );
    assert!(guest.switcher_mapped());
}

#[test]
fn vcpus_run_the_guest_in_parallel() {
    let (met_tx, met_rx) = unbounded();
    let (first_tx, first_rx) = unbounded();
    let (second_tx, second_rx) = unbounded();
    let first = meet(boot(), first_tx, second_rx, &met_tx)
        .hypercall(HypercallNo::Notify as u32, [1, 0, 0, 0]);
    let second = Scripted::new().hypercall(HypercallNo::Init as u32, [SHARED, 0, 0, 0]);
    let second = meet(second, second_tx, first_rx, &met_tx)
        .hypercall(HypercallNo::Notify as u32, [2, 0, 0, 0]);
    let (GuestHandle { guest, vcpus }, _) = build(vec![first, second]);

    let runners: Vec<_> = vcpus
        .into_iter()
        .map(|mut vcpu| thread::spawn(move || (vcpu.run(), vcpu.slot())))
        .collect();
    let results: Vec<_> = runners
        .into_iter()
        .map(|runner| runner.join().unwrap())
        .collect();
    assert_eq!(results[0].0.as_ref().unwrap(), &RunOutcome::Notify(1));
    assert_eq!(results[1].0.as_ref().unwrap(), &RunOutcome::Notify(2));

    // Each vcpu saw the other arrive while it was itself in the guest.
    let mut met: Vec<_> = met_rx.try_iter().collect();
    met.sort();
    assert_eq!(met, [Some(0), Some(1)]);
    assert_eq!(results[0].1, results[1].1);
    assert_eq!(guest.slot_id(results[0].1), Some(PgdirId::Guest(Gpa::new(PGDIR))));
}

#[test]
fn late_vcpu_leaves_the_linear_identity() {
    let (tx, rx) = unbounded();
    let first = boot().hypercall(HypercallNo::Notify as u32, [1, 0, 0, 0]);
    let second = Scripted::new().hypercall(HypercallNo::Init as u32, [SHARED, 0, 0, 0]);
    let second = touch(second, USER_VA, PFErrorCode::USER);
    let second = shutdown(lookup_step(second, USER_VA, &tx));
    let (GuestHandle { guest, mut vcpus }, _) = build(vec![first, second]);

    assert_eq!(vcpus[0].run().unwrap(), RunOutcome::Notify(1));
    assert!(!guest.is_linear());
    assert_eq!(vcpus[1].run().unwrap(), crashed());
    assert_eq!(rx.recv().unwrap(), Some(MEM_BASE + USER_FRAME as u64));
    assert_eq!(vcpus[1].slot(), vcpus[0].slot());
    assert_eq!(
        guest.slot_id(vcpus[1].slot()),
        Some(PgdirId::Guest(Gpa::new(PGDIR)))
    );
}

#[test]
fn teardown_releases_everything() {
    let script = touch(boot(), USER_VA, PFErrorCode::WRITE_ACCESS);
    let script = touch(script, KERNEL + 0x6000, PFErrorCode::empty());
    let (GuestHandle { guest, mut vcpus }, pages) = build(vec![shutdown(script)]);
    assert_eq!(vcpus[0].run().unwrap(), crashed());
    assert!(guest.shadow_pages() > 0);
    assert!(guest.memory().pinned_frames() > 0);

    guest.teardown();
    assert_eq!(guest.shadow_pages(), 0);
    assert_eq!(guest.memory().pinned_frames(), 0);

    let pages = SwitcherPages::unload(pages).unwrap_err();
    drop(vcpus);
    drop(guest);
    assert!(SwitcherPages::unload(pages).is_ok());
}
