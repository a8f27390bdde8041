//! Shadow page-table cache.
//!
//! The hardware never walks guest page tables. Instead each guest page
//! directory the guest switches to is bound to one of [`PGDIR_CACHE_SLOTS`]
//! host-owned shadow directories, and shadow leaves are filled in lazily by
//! [`PgdirCache::demand_fault`] as the guest touches its memory.
//!
//! Slots are small integers into a fixed arena. Binding an unseen directory
//! when every slot is taken evicts a slot chosen at random; the victim's user
//! mappings are flushed before it takes on its new identity. Every slot
//! always maps the switcher at [`SWITCHER_PGD_INDEX`], whatever happens to
//! the rest of it.
//!
//! Until the guest installs its first page directory the cache runs in
//! *linear* mode: guest virtual addresses are guest physical addresses, with
//! full permissions. The first directory installed replaces the identity for
//! every vcpu still on it.
//!
//! The cache lock guards slot identities and the page budget. Each shadow
//! directory has a lock of its own, taken after the cache lock, so a vcpu can
//! run the guest on its slot through a [`ShadowRoot`] while other vcpus bind,
//! fault and flush.
use crate::{
    addressing::{Gpa, Gva, Hfn},
    fatal,
    memory::GuestMemory,
    page_table::{PFErrorCode, Pde, Pte, PteFlags, ShadowPte, PTRS_PER_PGD, PTRS_PER_PTE},
    switcher::{SwitcherPages, SWITCHER_PGD_INDEX},
    VmError,
};
use log::{debug, trace};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use spin_lock::SpinLock;
use std::sync::Arc;

/// Number of shadow page directories a guest may have at once.
pub const PGDIR_CACHE_SLOTS: usize = 4;

/// Identity of the guest page directory a slot mirrors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgdirId {
    /// Identity mapping used before the guest has page tables.
    Linear,
    /// Guest page directory at this guest physical address.
    Guest(Gpa),
}

/// Result of [`PgdirCache::bind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Slot now bound to the directory.
    pub slot: usize,
    /// Whether the slot came back without user mappings, either freshly
    /// allocated or just evicted.
    pub blank: bool,
}

/// Upper bound on the shadow pages a guest may hold.
#[derive(Debug)]
struct PageBudget {
    limit: usize,
    used: usize,
}

impl PageBudget {
    fn alloc(&mut self, what: &'static str) -> Result<(), VmError> {
        if self.used >= self.limit {
            return Err(VmError::OutOfMemory(what));
        }
        self.used += 1;
        Ok(())
    }

    fn free(&mut self) {
        self.used -= 1;
    }
}

enum ShadowPde {
    Empty,
    Table {
        flags: PteFlags,
        ptes: Box<[ShadowPte; PTRS_PER_PTE]>,
    },
    Switcher(Arc<SwitcherPages>),
}

/// Shadow page directory.
struct ShadowPgd {
    entries: Vec<ShadowPde>,
}

impl ShadowPgd {
    fn new(switcher: &Arc<SwitcherPages>) -> Self {
        let mut entries = Vec::with_capacity(PTRS_PER_PGD);
        entries.resize_with(PTRS_PER_PGD, || ShadowPde::Empty);
        entries[SWITCHER_PGD_INDEX] = ShadowPde::Switcher(switcher.clone());
        Self { entries }
    }

    fn leaf(&self, va: Gva) -> Option<(PteFlags, ShadowPte)> {
        match &self.entries[va.pgd_index()] {
            ShadowPde::Empty => None,
            ShadowPde::Table { flags, ptes } => Some((*flags, ptes[va.pte_index()])),
            ShadowPde::Switcher(pages) => Some((PteFlags::P | PteFlags::RW, pages.pte(va.pte_index()))),
        }
    }
}

/// Release one shadow directory entry, unpinning every frame it maps.
fn release_pde(pde: &mut ShadowPde, mem: &GuestMemory, budget: &mut PageBudget) {
    if let ShadowPde::Table { ptes, .. } = pde {
        for spte in ptes.iter() {
            if let Some(hfn) = spte.hfn() {
                mem.unpin(hfn);
            }
        }
        budget.free();
        *pde = ShadowPde::Empty;
    }
}

fn release_pte(spte: &mut ShadowPte, mem: &GuestMemory) {
    if let Some(hfn) = spte.hfn() {
        mem.unpin(hfn);
    }
    *spte = ShadowPte::EMPTY;
}

/// Turn a validated guest leaf into a shadow leaf, pinning its frame.
///
/// Global mappings are dropped, and a clean page is mapped read-only so the
/// first write comes back to the host to set the guest's dirty bit.
fn make_spte(mem: &GuestMemory, gpte: Pte) -> Result<ShadowPte, VmError> {
    let hfn = mem.pin(gpte.pfn())?;
    let spte = ShadowPte::new(hfn, gpte.flags() - PteFlags::G);
    Ok(if gpte.flags().contains(PteFlags::D) {
        spte
    } else {
        spte.wrprotect()
    })
}

struct Slot {
    id: Option<PgdirId>,
    pgd: Option<Arc<SpinLock<ShadowPgd>>>,
}

/// Handle on one slot's shadow directory, as the MMU sees it.
///
/// Holding a root does not hold the cache. Each lookup takes the directory's
/// own lock for the duration of one walk, so the slot may be flushed or even
/// rebound under a running vcpu; the vcpu then faults back and rebinds.
#[derive(Clone)]
pub struct ShadowRoot {
    slot: usize,
    pgd: Arc<SpinLock<ShadowPgd>>,
}

impl ShadowRoot {
    /// Slot index of this directory.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Shadow leaf mapping `va`, if any.
    pub fn lookup(&self, va: Gva) -> Option<ShadowPte> {
        self.pgd
            .lock()
            .leaf(va)
            .map(|(_, spte)| spte)
            .filter(ShadowPte::is_present)
    }

    /// Translate `va` the way the MMU would. On failure, returns the error
    /// code of the resulting page fault.
    pub fn translate(&self, va: Gva, access: PFErrorCode) -> Result<Hfn, PFErrorCode> {
        let leaf = self.pgd.lock().leaf(va);
        let (pde_flags, spte) = match leaf {
            Some((flags, spte)) if spte.is_present() => (flags, spte),
            _ => return Err(access - PFErrorCode::PRESENT),
        };
        let flags = pde_flags & spte.flags();
        if access.contains(PFErrorCode::WRITE_ACCESS) && !flags.contains(PteFlags::RW)
            || access.contains(PFErrorCode::USER) && !flags.contains(PteFlags::US)
        {
            return Err(access | PFErrorCode::PRESENT);
        }
        spte.hfn().ok_or(access - PFErrorCode::PRESENT)
    }
}

/// The guest-wide cache of shadow page directories.
pub struct PgdirCache {
    slots: [Slot; PGDIR_CACHE_SLOTS],
    linear: bool,
    /// Directory that ended linear mode.
    first_pgdir: Option<Gpa>,
    kernel_address: Gva,
    budget: PageBudget,
    rng: SmallRng,
    switcher: Arc<SwitcherPages>,
}

impl PgdirCache {
    /// Create an empty cache in linear mode.
    pub fn new(switcher: Arc<SwitcherPages>, page_limit: usize, seed: Option<u64>) -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot { id: None, pgd: None }),
            linear: true,
            first_pgdir: None,
            kernel_address: Gva::default(),
            budget: PageBudget {
                limit: page_limit,
                used: 0,
            },
            rng: seed.map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64),
            switcher,
        }
    }

    /// Whether the cache still identity-maps the guest.
    #[inline]
    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// Directory a vcpu identified by `id` must run on. A vcpu still on the
    /// linear identity after linear mode ended moves to the directory that
    /// ended it.
    pub fn resolve(&self, id: PgdirId) -> PgdirId {
        match (id, self.first_pgdir) {
            (PgdirId::Linear, Some(gpgdir)) if !self.linear => PgdirId::Guest(gpgdir),
            _ => id,
        }
    }

    /// First address of the guest kernel's global mappings.
    #[inline]
    pub fn kernel_address(&self) -> Gva {
        self.kernel_address
    }

    /// Set the user/kernel boundary declared by the guest.
    pub fn set_kernel_address(&mut self, va: Gva) {
        self.kernel_address = va;
    }

    /// Identity bound to `slot`.
    pub fn slot_id(&self, slot: usize) -> Option<PgdirId> {
        self.slots.get(slot).and_then(|s| s.id)
    }

    /// Number of shadow pages (directories and tables) held.
    pub fn shadow_pages(&self) -> usize {
        self.budget.used
    }

    /// Handle on the shadow directory of `slot`.
    pub fn root(&self, slot: usize) -> Option<ShadowRoot> {
        self.slots.get(slot).and_then(|s| s.pgd.as_ref()).map(|pgd| ShadowRoot {
            slot,
            pgd: pgd.clone(),
        })
    }

    /// Whether every allocated slot maps the switcher at its fixed index.
    pub fn switcher_mapped(&self) -> bool {
        self.slots.iter().filter_map(|s| s.pgd.as_ref()).all(|pgd| {
            matches!(&pgd.lock().entries[SWITCHER_PGD_INDEX],
                ShadowPde::Switcher(pages) if Arc::ptr_eq(pages, &self.switcher))
        })
    }

    fn find(&self, id: PgdirId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == Some(id))
    }

    fn pick_victim(&mut self) -> usize {
        match self.slots.iter().position(|s| s.id.is_none()) {
            Some(free) => free,
            None => self.rng.gen_range(0..PGDIR_CACHE_SLOTS),
        }
    }

    /// Bind `id` to a slot, evicting one if needed.
    pub fn bind(&mut self, mem: &GuestMemory, id: PgdirId) -> Result<Binding, VmError> {
        if let Some(slot) = self.find(id) {
            return Ok(Binding { slot, blank: false });
        }
        let slot = self.pick_victim();
        if self.slots[slot].pgd.is_none() {
            self.budget.alloc("page directory")?;
            self.slots[slot].pgd = Some(Arc::new(SpinLock::new(ShadowPgd::new(&self.switcher))));
        }
        self.invalidate_user_mappings(mem, slot);
        match self.slots[slot].id.replace(id) {
            Some(old) => debug!("pgdir slot {}: evicted {:?} for {:?}", slot, old, id),
            None => debug!("pgdir slot {}: bound {:?}", slot, id),
        }
        if let Some(pgd) = &self.slots[slot].pgd {
            pgd.lock().entries[SWITCHER_PGD_INDEX] = ShadowPde::Switcher(self.switcher.clone());
        }
        Ok(Binding { slot, blank: true })
    }

    /// Leave linear mode for good, for directory `gpgdir`. All slots lose
    /// their mappings and their identity; their backing pages stay allocated
    /// for reuse.
    pub fn exit_linear(&mut self, mem: &GuestMemory, gpgdir: Gpa) {
        debug!("leaving linear mode for {}", gpgdir);
        self.invalidate_all(mem);
        for slot in self.slots.iter_mut() {
            slot.id = None;
        }
        self.linear = false;
        self.first_pgdir = Some(gpgdir);
    }

    fn release_range(&mut self, mem: &GuestMemory, slot: usize, end: usize) {
        let Self { slots, budget, .. } = self;
        if let Some(pgd) = &slots[slot].pgd {
            let mut pgd = pgd.lock();
            for pde in pgd.entries[..end.min(SWITCHER_PGD_INDEX)].iter_mut() {
                release_pde(pde, mem, budget);
            }
        }
    }

    /// Release every shadow entry of `slot` below the kernel boundary.
    pub fn invalidate_user_mappings(&mut self, mem: &GuestMemory, slot: usize) {
        let end = self.kernel_address.pgd_index();
        self.release_range(mem, slot, end);
    }

    /// Release every shadow entry of every slot, except the switcher's.
    pub fn invalidate_all(&mut self, mem: &GuestMemory) {
        for slot in 0..PGDIR_CACHE_SLOTS {
            self.release_range(mem, slot, SWITCHER_PGD_INDEX);
        }
    }

    /// Release everything, including the directories themselves.
    pub fn release_all(&mut self, mem: &GuestMemory) {
        self.invalidate_all(mem);
        for slot in self.slots.iter_mut() {
            if slot.pgd.take().is_some() {
                self.budget.free();
            }
            slot.id = None;
        }
    }

    /// Translate `va` through the guest's own page tables, as seen from
    /// directory `id`. `Ok(None)` means the guest has no mapping there.
    pub fn translate_guest(
        &self,
        mem: &GuestMemory,
        id: PgdirId,
        va: Gva,
    ) -> Result<Option<Gpa>, VmError> {
        let gpgdir = match self.resolve(id) {
            _ if self.linear => return Ok(Some(Gpa::new(va.as_u32()))),
            PgdirId::Guest(gpgdir) => gpgdir,
            PgdirId::Linear => return Ok(None),
        };
        let gpgd: Pde = mem.read_obj(gpgdir + 4 * va.pgd_index() as u32)?;
        if !gpgd.is_present() {
            return Ok(None);
        }
        let gpte: Pte = mem.read_obj(Gpa::from_pfn(gpgd.pfn()) + 4 * va.pte_index() as u32)?;
        if !gpte.is_present() {
            return Ok(None);
        }
        Ok(Some(Gpa::from_pfn(gpte.pfn()) + va.page_offset()))
    }

    /// Try to resolve a page fault at `va` by shadowing the guest's mapping.
    ///
    /// `Ok(false)` means the guest itself does not allow the access and the
    /// fault belongs to the guest.
    pub fn demand_fault(
        &mut self,
        mem: &GuestMemory,
        slot: usize,
        va: Gva,
        access: PFErrorCode,
    ) -> Result<bool, VmError> {
        if va.pgd_index() == SWITCHER_PGD_INDEX {
            return Err(fatal!("attempt to access switcher pages at {}", va));
        }
        let pfn_limit = mem.pfn_limit();
        let (gpgd, gpte_addr, gpte) = if self.linear {
            let gpte = Pte::new(va.pfn(), PteFlags::P | PteFlags::RW | PteFlags::US);
            (Pde::new(0, PteFlags::DIRECTORY), None, gpte)
        } else {
            let gpgdir = match self.slot_id(slot) {
                Some(PgdirId::Guest(gpgdir)) => gpgdir,
                id => return Err(fatal!("page fault in unbound slot {} ({:?})", slot, id)),
            };
            let gpgd: Pde = mem.read_obj(gpgdir + 4 * va.pgd_index() as u32)?;
            if !gpgd.is_present() {
                return Ok(false);
            }
            let gpgd = gpgd.check(pfn_limit)?;
            let gpte_addr = Gpa::from_pfn(gpgd.pfn()) + 4 * va.pte_index() as u32;
            (gpgd, Some(gpte_addr), mem.read_obj::<Pte>(gpte_addr)?)
        };
        if !gpte.is_present() {
            return Ok(false);
        }
        let gpte = gpte.check(pfn_limit)?;
        let write = access.contains(PFErrorCode::WRITE_ACCESS);
        if write && !gpte.flags().contains(PteFlags::RW)
            || access.contains(PFErrorCode::USER) && !gpte.flags().contains(PteFlags::US)
        {
            return Ok(false);
        }
        let gpte = if write {
            gpte.mkyoung().mkdirty()
        } else {
            gpte.mkyoung()
        };

        let Self { slots, budget, .. } = self;
        let mut pgd = slots[slot]
            .pgd
            .as_ref()
            .ok_or_else(|| fatal!("page fault in unallocated slot {}", slot))?
            .lock();
        let pde = &mut pgd.entries[va.pgd_index()];
        if let ShadowPde::Empty = pde {
            budget.alloc("page table")?;
            *pde = ShadowPde::Table {
                flags: gpgd.flags() & PteFlags::DIRECTORY,
                ptes: Box::new([ShadowPte::EMPTY; PTRS_PER_PTE]),
            };
        }
        let spte = match pde {
            ShadowPde::Table { ptes, .. } => &mut ptes[va.pte_index()],
            _ => return Err(fatal!("attempt to access switcher pages at {}", va)),
        };
        let new = make_spte(mem, gpte)?;
        release_pte(spte, mem);
        *spte = new;
        trace!("slot {}: {} -> {:?}", slot, va, new);

        if let Some(addr) = gpte_addr {
            mem.write_obj(addr, &gpte)?;
        }
        Ok(true)
    }

    fn set_pte_in(
        &mut self,
        mem: &GuestMemory,
        slot: usize,
        va: Gva,
        gpte: Pte,
    ) -> Result<(), VmError> {
        let install = gpte.is_present() && gpte.flags().intersects(PteFlags::A | PteFlags::D);
        if let Some(pgd) = &self.slots[slot].pgd {
            let mut pgd = pgd.lock();
            if let ShadowPde::Table { ptes, .. } = &mut pgd.entries[va.pgd_index()] {
                let spte = &mut ptes[va.pte_index()];
                let new = if install {
                    make_spte(mem, gpte)?
                } else {
                    ShadowPte::EMPTY
                };
                release_pte(spte, mem);
                *spte = new;
            }
        }
        Ok(())
    }

    /// Guest updated the leaf mapping `va` in directory `gpgdir`.
    ///
    /// Kernel mappings are shared by every directory, so an update above the
    /// kernel boundary reaches all slots. A slot only picks up entries the
    /// guest has already used; the rest are faulted in lazily.
    pub fn set_pte(
        &mut self,
        mem: &GuestMemory,
        gpgdir: Gpa,
        va: Gva,
        gpte: Pte,
    ) -> Result<(), VmError> {
        if gpte.is_present() && gpte.flags().intersects(PteFlags::A | PteFlags::D) {
            gpte.check(mem.pfn_limit())?;
        }
        if va >= self.kernel_address {
            for slot in 0..PGDIR_CACHE_SLOTS {
                if matches!(self.slots[slot].id, Some(PgdirId::Guest(_))) {
                    self.set_pte_in(mem, slot, va, gpte)?;
                }
            }
        } else if let Some(slot) = self.find(PgdirId::Guest(gpgdir)) {
            self.set_pte_in(mem, slot, va, gpte)?;
        }
        Ok(())
    }

    /// Guest updated directory entry `index` of `gpgdir`.
    pub fn set_pgd(&mut self, mem: &GuestMemory, gpgdir: Gpa, index: u32) -> Result<(), VmError> {
        let index = index as usize;
        if index >= PTRS_PER_PGD {
            return Err(fatal!("bad page directory index {}", index));
        }
        if index == SWITCHER_PGD_INDEX {
            return Ok(());
        }
        if let Some(slot) = self.find(PgdirId::Guest(gpgdir)) {
            let Self { slots, budget, .. } = self;
            if let Some(pgd) = &slots[slot].pgd {
                release_pde(&mut pgd.lock().entries[index], mem, budget);
            }
        }
        Ok(())
    }

    /// Guest updated a middle-level entry. With two-level paging this is the
    /// directory entry at `index`.
    pub fn set_pmd(&mut self, mem: &GuestMemory, gpgdir: Gpa, index: u32) -> Result<(), VmError> {
        self.set_pgd(mem, gpgdir, index)
    }
}
