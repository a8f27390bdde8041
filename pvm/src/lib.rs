//! Guest-execution supervisor for a paravirtualized 32-bit guest kernel.
//!
//! The guest kernel runs at privilege level 1 inside a host process. It never
//! touches the real page tables, descriptor tables or interrupt controller;
//! instead it asks the host through hypercalls, and the host keeps trusted
//! shadow copies of everything the hardware consumes.
//!
//! The crate is organised around the components a single guest needs:
//!
//! - [`shadow`]: a four-slot cache of shadow page directories. Guest page
//!   tables are mirrored lazily, one leaf at a time, on page faults. The
//!   cache lock is taken to bind, fault and flush, never across a transfer,
//!   so vcpus run the guest in parallel.
//! - [`segments`]: sanitized copies of the guest's GDT, TLS slots and IDT.
//! - [`switcher`]: the contract of the privilege transition that actually
//!   runs guest code. Platform code implements [`switcher::Switcher`];
//!   [`switcher::scripted::Scripted`] is a software stand-in.
//! - [`interrupts`]: virtual interrupt lines, trap delivery onto the guest
//!   stack and the one-shot clock.
//! - [`hypercalls`]: decoding and dispatching of guest requests, both the
//!   synchronous trap and the asynchronous ring in the shared page.
//! - [`vcpu`]: the per-vcpu run loop tying the above together.
//! - [`vm`]: the guest object and the launcher-facing interface.
//!
//! ## Lifecycle
//!
//! ```text
//! SwitcherPages::load ─► GuestBuilder::new(config, pages)
//!                          .vcpu(switcher) ...
//!                          .finalize() ─► GuestHandle { guest, vcpus }
//!
//! per vcpu thread:  loop { match vcpu.run()? { Notify(v) => ..., Dead(r) => break, ... } }
//! launcher:         guest.send_interrupt(cpu, irq) / guest.attach_event(addr, n) / guest.kick(cpu)
//! ```
//!
//! Any guest contract violation kills the guest. The first reason is kept and
//! reported once by [`vcpu::VCpu::run`].

pub mod addressing;
pub mod emulate;
pub mod events;
pub mod hypercalls;
pub mod interrupts;
pub mod memory;
pub mod page_table;
pub mod segments;
pub mod shadow;
pub mod switcher;
pub mod vcpu;
pub mod vm;

pub use addressing::{Gpa, Gva, Hfn};
pub use vcpu::{RunOutcome, VCpu};
pub use vm::{Guest, GuestBuilder, GuestConfig, GuestHandle};

/// Possible errors of the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The guest broke its side of the contract. Always fatal to the guest.
    #[error("{0}")]
    GuestFault(String),
    /// Shadow page or cache slot allocation failed.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),
    /// The guest has already died and its death has been reported.
    #[error("guest is dead")]
    GuestDead,
    /// Vcpu does not exist.
    #[error("vcpu#{0} does not exist")]
    NoSuchVCpu(usize),
    /// Interrupt line is beyond the virtual interrupt controller.
    #[error("interrupt line {0} out of range")]
    InvalidIrq(u32),
    /// Notification address can not be registered.
    #[error("invalid event address {0:#x}")]
    InvalidEvent(u32),
    /// Launcher supplied an unusable configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Failed to decode the instruction at the guest instruction pointer.
    #[error("failed to decode instruction")]
    FailedToDecodeInstruction,
}

/// Builds a [`VmError::GuestFault`] from a format string.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::VmError::GuestFault(format!($($arg)*))
    };
}
