//! # The Physical Map
//!
//! [`PmapSystem`] owns everything the pmap keeps: the kernel address space
//! and its PTE window, all user address spaces, the reverse mappings of
//! managed pages and the machine it drives. It is created once by
//! [`bootstrap2`](crate::bootstrap2) and handed around by `&mut`.
//!
//! The machine is uniprocessor; exclusion against interrupt-time users of
//! the kernel map comes from a non-preemptible critical section. Anything
//! that may sleep (page or PV entry allocation with waiting allowed) leaves
//! the section first and revalidates what it saw before sleeping.

use crate::arena::Arena;
use crate::config::MmuType;
use crate::counters::Counters;
use crate::kernel::KernelState;
use crate::mmu::{Geometry, MmuClass, RootLoader};
use crate::pmap::{Pmap, PmapId, PmapStats};
use crate::pte::{PteCell, PteEngine, PteRef};
use crate::pv::{PageAttrs, PageMd, PvEntry, PvPool};
use crate::table::TableId;
use crate::Machine;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::CriticalSection;
use log::trace;

/// The pmap of one machine.
pub struct PmapSystem<M: Machine> {
    pub(crate) machine: M,
    pub(crate) mmu_type: MmuType,
    pub(crate) class: MmuClass,
    pub(crate) geom: Geometry,
    pub(crate) pte: PteEngine,
    pub(crate) root_loader: RootLoader,
    /// Address bits that index the VAC; zero without one.
    pub(crate) alias_mask: u32,
    pub(crate) pmaps: Arena<Pmap>,
    /// User address space loaded in the MMU.
    pub(crate) current: Option<PmapId>,
    pub(crate) pvs: PvPool,
    pub(crate) pages: Vec<PageMd>,
    /// Set by [`init`](Self::init); before that nothing is managed.
    pub(crate) initialized: bool,
    pub(crate) kernel: KernelState,
    pub(crate) crit: CriticalSection,
    pub(crate) counters: Counters,
    /// Runs once, the next time an operation leaves the section to wait.
    #[cfg(test)]
    pub(crate) on_wait: Option<alloc::boxed::Box<dyn FnOnce(&mut PmapSystem<M>)>>,
}

impl<M: Machine> PmapSystem<M> {
    /// Atomic access to one descriptor.
    #[inline]
    pub(crate) fn cell<'a>(&self, r: PteRef) -> PteCell<'a> {
        let words = self.words(r.0, 1);
        PteCell::new(&words[0])
    }

    /// Word access to table or page memory owned by the pmap.
    #[inline]
    pub(crate) fn words<'a>(&self, pa: PhysicalAddress, count: usize) -> &'a [AtomicU32] {
        debug_assert_eq!(pa.as_u32() & 3, 0);
        // SAFETY: The pmap only addresses memory it owns (tables, PT pages,
        // pages handed to zero/copy) and keeps it allocated while in use.
        unsafe { self.machine.phys_to_words(pa, count) }
    }

    /// Runs `f` outside the critical section.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.crit.suspend();
        #[cfg(test)]
        if let Some(other) = self.on_wait.take() {
            other(self);
        }
        let r = f(self);
        self.crit.resume(saved);
        r
    }

    /// Whether the MMU may hold translations of `pm`.
    #[inline]
    pub(crate) fn active_pmap(&self, pm: PmapId) -> bool {
        pm.is_kernel() || self.current == Some(pm)
    }

    #[inline]
    pub(crate) fn active_user_pmap(&self, pm: PmapId) -> bool {
        !pm.is_kernel() && self.current == Some(pm)
    }

    /// Switches the root table of a user address space.
    pub(crate) fn set_lev1map(&mut self, pm: PmapId, t: Option<TableId>, pa: PhysicalAddress) {
        let pmap = &mut self.pmaps[pm.0];
        pmap.lev1 = t;
        pmap.lev1_pa = pa;
        if self.active_user_pmap(pm) {
            // Loading the HP segment table register also purges the user VAC.
            self.machine.load_user_root(self.root_loader.root(pa));
            self.machine.tlb_invalidate_user();
            self.machine.icache_invalidate_all();
        }
    }

    /// Creates an empty user address space on the null segment table.
    pub fn create(&mut self) -> PmapId {
        let id = PmapId(self.pmaps.insert(Pmap::new(self.kernel.null_segtab_pa)));
        trace!("created {id:?}");
        id
    }

    /// Adds a reference to an address space.
    pub fn reference(&mut self, pm: PmapId) {
        let pmap = &mut self.pmaps[pm.0];
        pmap.refcnt += 1;
        debug_assert_ne!(pmap.refcnt, 0);
    }

    /// Drops a reference; the last one frees the address space.
    ///
    /// # Panics
    /// If mappings or tables remain when the last reference goes.
    pub fn destroy(&mut self, pm: PmapId) {
        let pmap = &mut self.pmaps[pm.0];
        assert!(pmap.refcnt > 0, "destroy of unreferenced {pm:?}");
        pmap.refcnt -= 1;
        if pmap.refcnt > 0 {
            return;
        }
        assert!(!pm.is_kernel(), "destroy of the kernel pmap");
        assert!(pmap.lev1.is_none(), "{pm:?} destroyed with tables");
        assert_eq!(pmap.lev1_pa, self.kernel.null_segtab_pa);
        debug_assert!(pmap.tables.is_empty() && pmap.pv_head.is_none());
        if self.current == Some(pm) {
            self.current = None;
        }
        self.pmaps.remove(pm.0);
        trace!("destroyed {pm:?}");
    }

    /// Makes `pm` the current user address space and loads its root table.
    ///
    /// The kernel has its own root pointer, so activating it only records
    /// that no user space is current.
    pub fn activate(&mut self, pm: PmapId) {
        if pm.is_kernel() {
            self.current = None;
            return;
        }
        self.crit.enter();
        self.current = Some(pm);
        let root = self.root_loader.root(self.pmaps[pm.0].lev1_pa);
        self.machine.load_user_root(root);
        self.crit.exit();
    }

    /// Marks `pm` as no longer loaded.
    pub fn deactivate(&mut self, pm: PmapId) {
        if self.current == Some(pm) {
            self.current = None;
        }
    }

    /// The address space currently loaded for user mode.
    #[must_use]
    pub const fn current(&self) -> Option<PmapId> {
        self.current
    }

    /// # Panics
    /// If `pm` was destroyed.
    #[must_use]
    pub fn pmap(&self, pm: PmapId) -> &Pmap {
        &self.pmaps[pm.0]
    }

    #[must_use]
    pub fn stats(&self, pm: PmapId) -> PmapStats {
        self.pmaps[pm.0].stats
    }

    #[must_use]
    pub fn resident_count(&self, pm: PmapId) -> u32 {
        self.pmaps[pm.0].stats.resident_count
    }

    #[must_use]
    pub fn wired_count(&self, pm: PmapId) -> u32 {
        self.pmaps[pm.0].stats.wired_count
    }

    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub const fn class(&self) -> MmuClass {
        self.class
    }

    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geom
    }

    #[must_use]
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    pub const fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Start of managed kernel virtual space and the most it can grow to.
    #[must_use]
    pub const fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (self.kernel.virtual_start, self.kernel.virtual_max)
    }

    /// Current end of mappable kernel virtual space.
    #[must_use]
    pub const fn virtual_end(&self) -> VirtualAddress {
        self.kernel.virtual_end
    }

    /// Physical address of the all-invalid table used by empty address
    /// spaces.
    #[must_use]
    pub const fn null_segtab(&self) -> PhysicalAddress {
        self.kernel.null_segtab_pa
    }

    /// Attributes of a managed page.
    #[must_use]
    pub fn page_attrs(&self, pa: PhysicalAddress) -> Option<PageAttrs> {
        self.page_of(pa).map(|pg| self.pages[pg.index].attrs)
    }

    /// The mappings of a managed page.
    #[must_use]
    pub fn mappings(&self, pa: PhysicalAddress) -> Vec<&PvEntry> {
        self.page_of(pa)
            .map(|pg| self.page_pvs(pg.index).map(|pv| &self.pvs[pv]).collect())
            .unwrap_or_default()
    }

    /// Number of PV entries in use.
    #[must_use]
    pub const fn pv_count(&self) -> usize {
        self.pvs.live()
    }
}

impl<M: Machine> core::fmt::Debug for PmapSystem<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PmapSystem")
            .field("class", &self.class)
            .field("geometry", &self.geom)
            .field("pmaps", &self.pmaps.len())
            .field("current", &self.current)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
