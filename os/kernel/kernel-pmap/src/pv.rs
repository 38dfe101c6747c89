//! # Reverse Mappings
//!
//! Every managed physical page has a list of *PV entries*, one per valid
//! mapping of the page: `(address space, virtual address, leaf table)`.
//! Each entry is also on a list owned by its address space, which lets
//! [`remove_all`](crate::PmapSystem::remove_all) tear down an address space
//! without walking its tables.
//!
//! ```text
//!  PageMd ──head──► PvEntry ──next──► PvEntry ──next──► ∅
//!                      ▲                  ▲
//!  Pmap ──pv_head──────┘   (pm_next)      └──── other pmap's list
//! ```
//!
//! The lists also drive cache inhibition. Without a virtually-addressed
//! cache a page becomes inhibited in every mapping as soon as one mapping
//! asks for it. With the HP VAC, mappings in the same address space (or
//! shared with the kernel) whose addresses differ in the cache index bits
//! would alias in the cache; all of those are inhibited until the alias
//! goes away.

use crate::Machine;
use crate::arena::Arena;
use crate::completion::Completion;
use crate::mmu::VacScope;
use crate::pmap::PmapId;
use crate::pte::{Pte, PteRef};
use crate::system::PmapSystem;
use crate::table::TableId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Handle of a PV entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PvId(pub(crate) u32);

bitflags::bitflags! {
    /// Why a mapping is cache-inhibited.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PvFlags: u8 {
        /// Virtually-addressed cache alias.
        const CI_VAC = 1 << 0;
        /// Requested by the caller.
        const CI_USR = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Per-page attributes.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PageAttrs: u8 {
        const REFERENCED = 1 << 0;
        const MODIFIED   = 1 << 1;
        /// All (matching) mappings of the page are cache-inhibited.
        const CI         = 1 << 2;
    }
}

/// One mapping of a managed page.
#[derive(Debug, Default, Clone)]
pub struct PvEntry {
    pub(crate) pmap: PmapId,
    pub(crate) va: VirtualAddress,
    pub(crate) flags: PvFlags,
    /// Leaf table holding the PTE; `None` for the kernel.
    pub(crate) table: Option<TableId>,
    pub(crate) next: Option<PvId>,
    pub(crate) pm_prev: Option<PvId>,
    pub(crate) pm_next: Option<PvId>,
}

impl PvEntry {
    #[must_use]
    pub const fn pmap(&self) -> PmapId {
        self.pmap
    }

    #[must_use]
    pub const fn va(&self) -> VirtualAddress {
        self.va
    }

    #[must_use]
    pub const fn flags(&self) -> PvFlags {
        self.flags
    }
}

/// Storage for PV entries.
///
/// Allocations that may not wait fail once `capacity` entries are live;
/// waiting allocations always succeed.
#[derive(Debug)]
pub struct PvPool {
    entries: Arena<PvEntry>,
    capacity: usize,
}

impl PvPool {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            entries: Arena::new(),
            capacity,
        }
    }

    pub fn alloc(&mut self, nowait: bool) -> Option<PvId> {
        if nowait && self.entries.len() >= self.capacity {
            return None;
        }
        Some(PvId(self.entries.insert(PvEntry::default())))
    }

    pub fn free(&mut self, pv: PvId) {
        let freed = self.entries.remove(pv.0);
        debug_assert!(freed.is_some(), "double free of {pv:?}");
    }

    /// Number of allocated entries, including ones awaiting release.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn get(&self, pv: PvId) -> Option<&PvEntry> {
        self.entries.get(pv.0)
    }
}

impl core::ops::Index<PvId> for PvPool {
    type Output = PvEntry;

    fn index(&self, pv: PvId) -> &PvEntry {
        &self.entries[pv.0]
    }
}

impl core::ops::IndexMut<PvId> for PvPool {
    fn index_mut(&mut self, pv: PvId) -> &mut PvEntry {
        &mut self.entries[pv.0]
    }
}

/// Machine-dependent state of a managed page.
#[derive(Debug, Default, Clone)]
pub struct PageMd {
    pub(crate) head: Option<PvId>,
    pub(crate) attrs: PageAttrs,
}

impl PageMd {
    /// Folds the used/modified bits of `pte` into the page.
    pub(crate) fn add_um(&mut self, pte: Pte) {
        if pte.used() {
            self.attrs |= PageAttrs::REFERENCED;
        }
        if pte.modified() {
            self.attrs |= PageAttrs::MODIFIED;
        }
    }

    /// Replaces the cached used/modified bits with those of `pte`.
    pub(crate) fn set_um(&mut self, pte: Pte) {
        self.attrs.remove(PageAttrs::REFERENCED | PageAttrs::MODIFIED);
        self.add_um(pte);
    }

    /// The cached used/modified bits in PTE form.
    #[must_use]
    pub(crate) fn um(&self) -> Pte {
        let mut pte = Pte::EMPTY;
        if self.attrs.contains(PageAttrs::REFERENCED) {
            pte = pte | Pte::U;
        }
        if self.attrs.contains(PageAttrs::MODIFIED) {
            pte = pte | Pte::M;
        }
        pte
    }

    #[must_use]
    pub const fn attrs(&self) -> PageAttrs {
        self.attrs
    }

    #[must_use]
    pub const fn is_ci(&self) -> bool {
        self.attrs.contains(PageAttrs::CI)
    }
}

/// A page known to the physical allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ManagedPage {
    pub index: usize,
    pub pa: PhysicalAddress,
}

/// Whether mappings in `a` and `b` can alias each other in the VAC.
#[inline]
const fn matching_pmap(a: PmapId, b: PmapId) -> bool {
    a.0 == b.0 || a.is_kernel() || b.is_kernel()
}

impl<M: Machine> PmapSystem<M> {
    /// The managed page at `pa`; `None` before [`init`](Self::init).
    pub(crate) fn page_of(&self, pa: PhysicalAddress) -> Option<ManagedPage> {
        if !self.initialized {
            return None;
        }
        let pa = pa.trunc_page(self.geom.page_size());
        self.machine
            .page_index(pa)
            .map(|index| ManagedPage { index, pa })
    }

    /// Location of the PTE a PV entry describes.
    pub(crate) fn pv_pte(&self, pv: PvId) -> PteRef {
        let e = &self.pvs[pv];
        if e.pmap.is_kernel() {
            return self.kernel_pte(e.va);
        }
        let Some(t) = e.table else {
            panic!("user PV entry without a table");
        };
        PteRef(self.table_pa(e.pmap, t)).offset(self.geom.pt_index(e.va))
    }

    #[inline]
    const fn conflicting_alias(&self, a: VirtualAddress, b: VirtualAddress) -> bool {
        (a.as_u32() ^ b.as_u32()) & self.alias_mask != 0
    }

    pub(crate) fn pv_alloc(&mut self, nowait: bool) -> Option<PvId> {
        if nowait {
            self.counters.pv_alloc_nowait += 1;
        } else {
            self.counters.pv_alloc_wait += 1;
        }
        self.pvs.alloc(nowait)
    }

    /// PV entries of a page, in list order.
    pub(crate) fn page_pvs(&self, page: usize) -> impl Iterator<Item = PvId> + '_ {
        core::iter::successors(self.pages[page].head, |&pv| self.pvs[pv].next)
    }

    /// Links `pv` for a new mapping and stores its PTE.
    ///
    /// The PTE slot must be invalid, so no TLB invalidation is needed for
    /// the new mapping itself.
    pub(crate) fn pv_enter(
        &mut self,
        pm: PmapId,
        pg: ManagedPage,
        va: VirtualAddress,
        table: Option<TableId>,
        npte: Pte,
        pv: PvId,
    ) {
        self.counters.pv_enter_called += 1;
        self.crit.assert_held();

        debug_assert!(
            !self
                .page_pvs(pg.index)
                .any(|o| self.pvs[o].pmap == pm && self.pvs[o].va == va),
            "{pm:?} va {va} already in PV table"
        );

        let usr_ci = npte.is_ci();
        let npte = npte | Pte::PVLIST;
        let flags = if usr_ci { PvFlags::CI_USR } else { PvFlags::empty() };

        let pm_head = self.pmaps[pm.0].pv_head;
        self.pvs[pv] = PvEntry {
            pmap: pm,
            va,
            flags,
            table,
            next: self.pages[pg.index].head,
            pm_prev: None,
            pm_next: pm_head,
        };
        if let Some(h) = pm_head {
            self.pvs[h].pm_prev = Some(pv);
        }
        self.pmaps[pm.0].pv_head = Some(pv);
        self.pages[pg.index].head = Some(pv);

        let cell = self.cell(self.pv_pte(pv));

        if self.class.has_vac() {
            cell.store(npte);
            self.pv_enter_vac(pm, pg, va, pv, usr_ci);
            return;
        }

        if self.pages[pg.index].is_ci() {
            cell.store(self.pte.set_ci(npte));
            return;
        }

        cell.store(npte);

        if usr_ci {
            self.pages[pg.index].attrs |= PageAttrs::CI;
            self.counters.pv_enter_usr_ci += 1;

            let mut cur = self.pvs[pv].next;
            while let Some(o) = cur {
                self.counters.pv_enter_ci_multi += 1;
                let c = self.cell(self.pv_pte(o));
                loop {
                    let opte = c.load();
                    if c.update(opte, self.pte.set_ci(opte)) {
                        break;
                    }
                }
                let (opm, ova) = (self.pvs[o].pmap, self.pvs[o].va);
                if self.active_pmap(opm) {
                    self.machine.tlb_invalidate(ova);
                }
                cur = self.pvs[o].next;
            }
            if self.class.is_68040() {
                self.machine.dcache_flush_page(pg.pa);
                self.machine.icache_purge_page(pg.pa);
            }
        }
    }

    fn pv_enter_vac(&mut self, pm: PmapId, pg: ManagedPage, va: VirtualAddress, pv: PvId, usr_ci: bool) {
        let mut flags = self.pvs[pv].flags & PvFlags::CI_USR;
        if usr_ci {
            self.counters.pv_enter_usr_ci += 1;
        }

        let mut cur = self.pvs[pv].next;
        while let Some(o) = cur {
            let e = &self.pvs[o];
            if matching_pmap(pm, e.pmap) && self.conflicting_alias(va, e.va) {
                self.counters.pv_enter_vac_ci += 1;
                flags |= PvFlags::CI_VAC;
                break;
            }
            cur = e.next;
        }

        if flags.is_empty() {
            return;
        }

        self.pages[pg.index].attrs |= PageAttrs::CI;
        let (mut flush_s, mut flush_u) = (false, false);
        let mut cur = self.pages[pg.index].head;
        while let Some(o) = cur {
            let opm = self.pvs[o].pmap;
            if matching_pmap(pm, opm) {
                self.counters.pv_enter_ci_multi += 1;
                self.pvs[o].flags |= flags;
                self.cell(self.pv_pte(o)).set(Pte::CI);
                if self.active_pmap(opm) {
                    self.machine.tlb_invalidate(self.pvs[o].va);
                    if opm.is_kernel() {
                        flush_s = true;
                    } else {
                        flush_u = true;
                    }
                }
            }
            cur = self.pvs[o].next;
        }
        match (flush_u, flush_s) {
            (true, true) => self.machine.vac_invalidate(VacScope::All),
            (true, false) => self.machine.vac_invalidate(VacScope::User),
            (false, true) => self.machine.vac_invalidate(VacScope::Supervisor),
            (false, false) => {}
        }
    }

    /// Unlinks the PV entry for `(pm, va)` and hands it to `done`.
    ///
    /// # Panics
    /// If the page has no such mapping.
    pub(crate) fn pv_remove(&mut self, pm: PmapId, pg: ManagedPage, va: VirtualAddress, done: &mut Completion) {
        self.counters.pv_remove_called += 1;
        self.crit.assert_held();

        let mut prev: Option<PvId> = None;
        let mut cur = self.pages[pg.index].head;
        while let Some(o) = cur {
            if self.pvs[o].pmap == pm && self.pvs[o].va == va {
                break;
            }
            prev = cur;
            cur = self.pvs[o].next;
        }
        let Some(pv) = cur else {
            panic!("{pm:?} va {va} missing from PV table");
        };

        let next = self.pvs[pv].next;
        match prev {
            Some(p) => self.pvs[p].next = next,
            None => self.pages[pg.index].head = next,
        }
        self.pm_list_unlink(pv);
        done.pvs.push(pv);

        if !self.pages[pg.index].is_ci() {
            return;
        }
        self.counters.pv_remove_ci += 1;

        if self.class.has_vac() {
            self.pv_remove_vac(pm, pg);
            return;
        }

        if self
            .page_pvs(pg.index)
            .any(|o| self.pvs[o].flags.contains(PvFlags::CI_USR))
        {
            return;
        }
        self.pages[pg.index].attrs.remove(PageAttrs::CI);
        let mut cur = self.pages[pg.index].head;
        while let Some(o) = cur {
            let c = self.cell(self.pv_pte(o));
            loop {
                let opte = c.load();
                if c.update(opte, self.pte.clr_ci(opte)) {
                    break;
                }
            }
            if self.active_pmap(self.pvs[o].pmap) {
                self.machine.tlb_invalidate(self.pvs[o].va);
            }
            cur = self.pvs[o].next;
        }
    }

    fn pv_remove_vac(&mut self, pm: PmapId, pg: ManagedPage) {
        // One user-requested or two alias-inhibited mappings keep the page
        // inhibited.
        let mut keep = PvFlags::CI_USR;
        for o in self.page_pvs(pg.index) {
            let e = &self.pvs[o];
            if !matching_pmap(pm, e.pmap) {
                continue;
            }
            if e.flags.intersects(keep) {
                return;
            }
            keep |= e.flags & PvFlags::CI_VAC;
        }

        let mut others = PvFlags::empty();
        let mut cur = self.pages[pg.index].head;
        while let Some(o) = cur {
            let opm = self.pvs[o].pmap;
            if matching_pmap(pm, opm) {
                self.cell(self.pv_pte(o)).mask(!Pte::CI);
                self.pvs[o].flags.remove(PvFlags::CI_VAC);
                if self.active_pmap(opm) {
                    self.machine.tlb_invalidate(self.pvs[o].va);
                }
            } else {
                others |= self.pvs[o].flags;
            }
            cur = self.pvs[o].next;
        }
        if others.is_empty() {
            self.pages[pg.index].attrs.remove(PageAttrs::CI);
        }
    }

    /// Removes `pv` from its address space's list.
    pub(crate) fn pm_list_unlink(&mut self, pv: PvId) {
        let PvEntry {
            pmap,
            pm_prev,
            pm_next,
            ..
        } = self.pvs[pv];
        match pm_prev {
            Some(p) => self.pvs[p].pm_next = pm_next,
            None => self.pmaps[pmap.0].pv_head = pm_next,
        }
        if let Some(n) = pm_next {
            self.pvs[n].pm_prev = pm_prev;
        }
        let e = &mut self.pvs[pv];
        e.pm_prev = None;
        e.pm_next = None;
    }
}
