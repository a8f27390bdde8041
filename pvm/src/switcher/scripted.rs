//! A software switcher that replays a script.
//!
//! Each transfer pops one step from the script and runs it against the
//! [`SwitchFrame`]. A step plays the guest: it reads and writes registers and
//! guest memory, touches addresses through the shadow MMU and ends the
//! transfer with a trap. An exhausted script ends every further transfer with
//! a double fault, which the guest can never handle.
use super::{interrupts_enabled, SwitchFrame, Switcher};
use crate::addressing::Gva;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Double fault vector.
const DOUBLE_FAULT: u32 = 8;

type Step = Box<dyn FnMut(&mut SwitchFrame<'_>) + Send>;

/// Switcher running a fixed sequence of steps.
#[derive(Default)]
pub struct Scripted {
    steps: VecDeque<Step>,
    transfers: Arc<AtomicUsize>,
}

impl Scripted {
    /// Create an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(mut self, f: impl FnMut(&mut SwitchFrame<'_>) + Send + 'static) -> Self {
        self.steps.push_back(Box::new(f));
        self
    }

    /// Append a step issuing hypercall `op`.
    pub fn hypercall(self, op: u32, args: [u32; 4]) -> Self {
        self.step(move |f| f.hypercall(op, args))
    }

    /// Counter of transfers performed so far.
    pub fn transfers(&self) -> Arc<AtomicUsize> {
        self.transfers.clone()
    }
}

impl Switcher for Scripted {
    fn switch_to_guest(&mut self, mut frame: SwitchFrame<'_>) -> Gva {
        assert!(!interrupts_enabled(), "entered the guest with interrupts on");
        self.transfers.fetch_add(1, Ordering::SeqCst);
        frame.cr2 = Gva::default();
        match self.steps.pop_front() {
            Some(mut step) => step(&mut frame),
            None => frame.trap(DOUBLE_FAULT, 0),
        }
        frame.cr2
    }
}
