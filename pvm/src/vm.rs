//! The guest and its launcher-facing interface.
//!
//! A [`Guest`] owns everything its vcpus share: the memory window, the
//! shadow page-table cache, the notification registry and the record of its
//! death. [`GuestBuilder`] creates it together with its vcpus; each vcpu is
//! then driven from its own thread with [`VCpu::run`].
use crate::{
    addressing::{Gva, Hfn},
    events::{EventNotifier, EventRegistry},
    interrupts::NR_IRQS,
    memory::GuestMemory,
    page_table::ShadowPte,
    shadow::{PgdirCache, PgdirId},
    switcher::{Switcher, SwitcherPages},
    vcpu::{RunOutcome, VCpu, VCpuShared},
    VmError,
};
use crossbeam_utils::sync::Parker;
use log::{info, warn};
use spin_lock::SpinLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Launcher-supplied parameters of a guest.
#[derive(Clone, Debug)]
pub struct GuestConfig {
    /// Host frame of guest-physical 0.
    pub mem_base: Hfn,
    /// Number of guest frames.
    pub pfn_limit: u32,
    /// Entry point.
    pub start_eip: Gva,
    /// Most shadow pages, directories and tables together, the guest may
    /// hold.
    pub shadow_page_limit: usize,
    /// Seed of the eviction choice. `None` seeds from entropy.
    pub eviction_seed: Option<u64>,
    /// TSC frequency published to the guest.
    pub tsc_khz: u32,
}

impl GuestConfig {
    /// Default shadow page budget.
    pub const DEFAULT_SHADOW_PAGE_LIMIT: usize = 1024;

    /// Configuration with default limits.
    pub fn new(mem_base: Hfn, pfn_limit: u32, start_eip: Gva) -> Self {
        Self {
            mem_base,
            pfn_limit,
            start_eip,
            shadow_page_limit: Self::DEFAULT_SHADOW_PAGE_LIMIT,
            eviction_seed: None,
            tsc_khz: 0,
        }
    }

    /// Set the shadow page budget.
    pub fn shadow_page_limit(mut self, limit: usize) -> Self {
        self.shadow_page_limit = limit;
        self
    }

    /// Make evictions reproducible.
    pub fn eviction_seed(mut self, seed: u64) -> Self {
        self.eviction_seed = Some(seed);
        self
    }

    /// Set the TSC frequency.
    pub fn tsc_khz(mut self, khz: u32) -> Self {
        self.tsc_khz = khz;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Death {
    Killed(String),
    Restart,
}

/// A guest.
pub struct Guest {
    memory: GuestMemory,
    pub(crate) cache: SpinLock<PgdirCache>,
    pub(crate) events: EventRegistry,
    vcpus: Vec<Arc<VCpuShared>>,
    death: SpinLock<Option<Death>>,
    dead: AtomicBool,
    reported: AtomicBool,
    config: GuestConfig,
}

impl Guest {
    /// Memory window of the guest.
    #[inline]
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Configuration the guest was built with.
    #[inline]
    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    /// Whether the guest has died.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Reason of death, if the guest was killed.
    pub fn death_reason(&self) -> Option<String> {
        match &*self.death.lock() {
            Some(Death::Killed(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    fn die(&self, death: Death) {
        let mut slot = self.death.lock();
        if slot.is_some() {
            return;
        }
        match &death {
            Death::Killed(reason) => warn!("guest killed: {}", reason),
            Death::Restart => info!("guest requested restart"),
        }
        *slot = Some(death);
        self.dead.store(true, Ordering::SeqCst);
        drop(slot);
        for vcpu in self.vcpus.iter() {
            vcpu.wake();
        }
    }

    /// Kill the guest. Only the first reason is kept.
    pub fn kill(&self, reason: impl ToString) {
        self.die(Death::Killed(reason.to_string()));
    }

    /// Stop the guest so the launcher restarts it.
    pub fn request_restart(&self) {
        self.die(Death::Restart);
    }

    /// Report the death, once per guest.
    pub(crate) fn take_report(&self) -> Result<RunOutcome, VmError> {
        let outcome = match &*self.death.lock() {
            Some(Death::Killed(reason)) => RunOutcome::Dead(reason.clone()),
            Some(Death::Restart) => RunOutcome::Restart,
            None => return Err(VmError::GuestDead),
        };
        if self.reported.swap(true, Ordering::SeqCst) {
            Err(VmError::GuestDead)
        } else {
            Ok(outcome)
        }
    }

    /// Shared state of vcpu `cpu`.
    pub fn vcpu(&self, cpu: usize) -> Result<&Arc<VCpuShared>, VmError> {
        self.vcpus.get(cpu).ok_or(VmError::NoSuchVCpu(cpu))
    }

    /// Raise virtual interrupt `irq` on vcpu `cpu`.
    pub fn send_interrupt(&self, cpu: usize, irq: u32) -> Result<(), VmError> {
        if irq >= NR_IRQS {
            return Err(VmError::InvalidIrq(irq));
        }
        self.vcpu(cpu)?.raise(irq);
        Ok(())
    }

    /// Make vcpu `cpu` return from [`VCpu::run`] as soon as possible.
    pub fn kick(&self, cpu: usize) -> Result<(), VmError> {
        self.vcpu(cpu)?.kick();
        Ok(())
    }

    /// Signal `notifier` whenever the guest notifies `addr`.
    pub fn attach_event(
        &self,
        addr: u32,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<(), VmError> {
        self.events.attach(addr, notifier)
    }

    /// Number of shadow pages held.
    pub fn shadow_pages(&self) -> usize {
        self.cache.lock().shadow_pages()
    }

    /// Shadow leaf mapping `va` in cache slot `slot`.
    pub fn shadow_lookup(&self, slot: usize, va: Gva) -> Option<ShadowPte> {
        let root = self.cache.lock().root(slot);
        root.and_then(|root| root.lookup(va))
    }

    /// Directory bound to cache slot `slot`.
    pub fn slot_id(&self, slot: usize) -> Option<PgdirId> {
        self.cache.lock().slot_id(slot)
    }

    /// Whether every shadow directory maps the switcher.
    pub fn switcher_mapped(&self) -> bool {
        self.cache.lock().switcher_mapped()
    }

    /// Whether the guest still runs without page tables of its own.
    pub fn is_linear(&self) -> bool {
        self.cache.lock().is_linear()
    }

    /// Release every shadow page and every pinned frame.
    pub fn teardown(&self) {
        self.cache.lock().release_all(&self.memory);
        if self.memory.pinned_frames() != 0 {
            warn!("{} frames still pinned after teardown", self.memory.pinned_frames());
        }
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A guest with its vcpus.
pub struct GuestHandle {
    pub guest: Arc<Guest>,
    pub vcpus: Vec<VCpu>,
}

/// Builds a [`Guest`].
pub struct GuestBuilder {
    config: GuestConfig,
    pages: Arc<SwitcherPages>,
    switchers: Vec<Box<dyn Switcher>>,
}

impl GuestBuilder {
    /// Start building a guest mapping `pages` as its switcher.
    pub fn new(config: GuestConfig, pages: Arc<SwitcherPages>) -> Self {
        Self {
            config,
            pages,
            switchers: Vec::new(),
        }
    }

    /// Add a vcpu run by `switcher`.
    pub fn vcpu(mut self, switcher: impl Switcher + 'static) -> Self {
        self.switchers.push(Box::new(switcher));
        self
    }

    /// Create the guest. Every vcpu starts in linear mode at the entry
    /// point.
    pub fn finalize(self) -> Result<GuestHandle, VmError> {
        let Self {
            config,
            pages,
            switchers,
        } = self;
        if switchers.is_empty() {
            return Err(VmError::InvalidConfig("guest without vcpus".into()));
        }
        let memory = GuestMemory::new(config.mem_base, config.pfn_limit)?;
        let mut cache = PgdirCache::new(pages, config.shadow_page_limit, config.eviction_seed);
        let binding = cache.bind(&memory, PgdirId::Linear)?;

        let parkers: Vec<Parker> = switchers.iter().map(|_| Parker::new()).collect();
        let shared: Vec<Arc<VCpuShared>> = parkers
            .iter()
            .enumerate()
            .map(|(id, parker)| Arc::new(VCpuShared::new(id, parker.unparker().clone())))
            .collect();
        info!(
            "guest: {} frames at {:?}, {} vcpus",
            config.pfn_limit,
            config.mem_base,
            switchers.len()
        );
        let guest = Arc::new(Guest {
            memory,
            cache: SpinLock::new(cache),
            events: EventRegistry::new(),
            vcpus: shared.clone(),
            death: SpinLock::new(None),
            dead: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            config,
        });
        let vcpus = switchers
            .into_iter()
            .zip(parkers)
            .zip(shared)
            .enumerate()
            .map(|(id, ((switcher, parker), shared))| {
                VCpu::new(id, guest.clone(), shared, parker, binding.slot, switcher)
            })
            .collect();
        Ok(GuestHandle { guest, vcpus })
    }
}
