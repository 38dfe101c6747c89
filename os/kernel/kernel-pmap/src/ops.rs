//! # Mapping Operations
//!
//! The interface used by the machine-independent VM system. Every
//! operation runs inside the critical section and hands resources it
//! releases to a [`Completion`], which is drained once the section is
//! left.

use crate::Machine;
use crate::completion::Completion;
use crate::error::{EnterError, Resource};
use crate::mmu::VacScope;
use crate::pmap::PmapId;
use crate::prot::{EnterFlags, MappingFlags, Protection};
use crate::pte::{Pte, PteRef};
use crate::pv::{ManagedPage, PageAttrs};
use crate::system::PmapSystem;
use crate::table::TableId;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::warn;

bitflags::bitflags! {
    /// What [`remove_mapping`](PmapSystem::remove_mapping) has to flush.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    struct RemoveFlags: u8 {
        /// Invalidate the TLB entry.
        const TFLUSH = 1 << 0;
        /// Flush the caches for the page.
        const CFLUSH = 1 << 1;
    }
}

impl<M: Machine> PmapSystem<M> {
    /// Tears down one mapping and drops its hold on `pt`.
    fn remove_mapping(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        pte: PteRef,
        pt: Option<TableId>,
        flags: RemoveFlags,
        done: &mut Completion,
    ) {
        let cell = self.cell(pte);
        let opte = cell.load();
        if !opte.is_valid() {
            return;
        }
        let pa = opte.pa();

        self.pmaps[pm.0].stats.sub_resident(opte.wired());

        if flags.contains(RemoveFlags::CFLUSH) {
            if self.class.is_68040() {
                self.machine.dcache_flush_page(pa);
                self.machine.icache_purge_page(pa);
            }
            if self.class.has_vac() {
                if pm.is_kernel() {
                    self.machine.vac_invalidate(VacScope::Supervisor);
                } else if self.active_user_pmap(pm) {
                    self.machine.vac_invalidate(VacScope::User);
                }
            }
        }

        cell.store(Pte::EMPTY);
        if let Some(t) = pt {
            self.table_release(pm, t, done);
        }

        // The TLB can no longer be reloaded from the PTE.
        if flags.contains(RemoveFlags::TFLUSH) && self.active_pmap(pm) {
            self.machine.tlb_invalidate(va);
        }

        if let Some(pg) = self.page_of(pa) {
            debug_assert!(opte.pvlist(), "managed page {pa} mapped without PV entry");
            self.pages[pg.index].add_um(opte);
            self.pv_remove(pm, pg, va, done);
        } else {
            debug_assert!(!opte.pvlist(), "unmanaged page {pa} on a PV list");
        }
    }

    /// `[sva, eva)` cut at segment boundaries.
    fn segments(&self, sva: VirtualAddress, eva: VirtualAddress) -> Vec<(VirtualAddress, VirtualAddress)> {
        let mut out = Vec::new();
        let mut va = sva;
        while va < eva {
            let next = self.geom.next_seg(va);
            let end = if next.as_u32() == 0 || next > eva { eva } else { next };
            out.push((va, end));
            va = end;
        }
        out
    }

    /// Pages in `[sva, eva)`; both ends must be page aligned.
    fn page_count(&self, sva: VirtualAddress, eva: VirtualAddress) -> u32 {
        let ps = self.geom.page_size();
        debug_assert!(
            sva.is_page_aligned(ps) && eva.is_page_aligned(ps),
            "unaligned range {sva}..{eva}"
        );
        if eva <= sva { 0 } else { (eva - sva).div_ceil(ps.bytes()) }
    }

    fn remove_internal(&mut self, pm: PmapId, sva: VirtualAddress, eva: VirtualAddress, done: &mut Completion) {
        let page = self.geom.page_size().bytes();
        let prm = if self.active_pmap(pm) {
            RemoveFlags::TFLUSH
        } else {
            RemoveFlags::empty()
        };
        let mut all_ci = true;

        self.crit.enter();
        if pm.is_kernel() {
            for i in 0..self.page_count(sva, eva) {
                let va = sva + i * page;
                let r = self.kernel_pte(va);
                let opte = self.cell(r).load();
                if opte.is_valid() {
                    all_ci &= opte.is_ci();
                    self.remove_mapping(pm, va, r, None, prm, done);
                }
            }
            if self.class.has_vac() && !all_ci {
                self.machine.vac_invalidate(VacScope::Supervisor);
            }
            self.crit.exit();
            return;
        }

        for (start, end) in self.segments(sva, eva) {
            // No table means nothing mapped in this segment.
            let Some((first, pt)) = self.pte_lookup(pm, start) else {
                continue;
            };
            for i in 0..self.page_count(start, end) {
                let (va, r) = (start + i * page, first.offset(i));
                let opte = self.cell(r).load();
                if opte.is_valid() {
                    all_ci &= opte.is_ci();
                    self.remove_mapping(pm, va, r, pt, prm, done);
                }
            }
            if let Some(t) = pt {
                self.table_release(pm, t, done);
            }
        }
        if self.class.has_vac() && !all_ci && self.active_user_pmap(pm) {
            self.machine.vac_invalidate(VacScope::User);
        }
        self.crit.exit();
    }

    /// Removes all mappings in `[sva, eva)`.
    pub fn remove(&mut self, pm: PmapId, sva: VirtualAddress, eva: VirtualAddress) {
        let mut done = Completion::new();
        self.remove_internal(pm, sva, eva, &mut done);
        self.finish(done);
    }

    /// Removes every mapping of a user address space at once.
    ///
    /// Only for address spaces no longer visible to any thread; tables are
    /// dropped wholesale instead of being released one by one.
    ///
    /// # Panics
    /// For the kernel address space.
    pub fn remove_all(&mut self, pm: PmapId) -> bool {
        assert!(!pm.is_kernel(), "remove_all on the kernel pmap");
        let mut done = Completion::new();
        self.crit.enter();

        let null = self.kernel.null_segtab_pa;
        self.set_lev1map(pm, None, null);

        // PV entries first: their PTEs are found through the tables.
        while let Some(pv) = self.pmaps[pm.0].pv_head {
            debug_assert_eq!(self.pvs[pv].pmap(), pm);
            let va = self.pvs[pv].va();
            let opte = self.cell(self.pv_pte(pv)).load();
            let Some(pg) = self.page_of(opte.pa()) else {
                panic!("PV entry for {va} maps unmanaged {}", opte.pa());
            };
            self.pages[pg.index].add_um(opte);
            self.pv_remove(pm, pg, va, &mut done);
        }

        let pmap = &mut self.pmaps[pm.0];
        pmap.cache = None;
        done.ptpages.extend(pmap.ptpages.drain());
        pmap.index.clear();
        pmap.tables.clear();
        pmap.stats = crate::PmapStats::default();

        self.crit.exit();
        self.finish(done);
        true
    }

    /// Lowers the protection of every mapping of the page at `pa`.
    ///
    /// Keeping write access changes nothing; keeping read access makes
    /// all mappings read-only; anything else removes them.
    pub fn page_protect(&mut self, pa: PhysicalAddress, prot: Protection) {
        let Some(pg) = self.page_of(pa) else {
            return;
        };
        if prot.contains(Protection::WRITE) {
            return;
        }
        if prot.contains(Protection::READ) {
            self.changebit(pg, Pte::WP, !Pte::EMPTY);
            return;
        }

        let mut done = Completion::new();
        self.crit.enter();
        while let Some(pv) = self.pages[pg.index].head {
            let (pm, va, pt) = {
                let e = &self.pvs[pv];
                (e.pmap, e.va, e.table)
            };
            let r = self.pv_pte(pv);
            self.remove_mapping(pm, va, r, pt, RemoveFlags::TFLUSH | RemoveFlags::CFLUSH, &mut done);
        }
        self.crit.exit();
        self.finish(done);
    }

    /// Sets the protection of the mappings in `[sva, eva)`.
    ///
    /// Without read access the range is removed. Cache inhibition of
    /// existing mappings is kept.
    pub fn protect(&mut self, pm: PmapId, sva: VirtualAddress, eva: VirtualAddress, prot: Protection) {
        if !prot.contains(Protection::READ) {
            self.remove(pm, sva, eva);
            return;
        }

        let page = self.geom.page_size().bytes();
        let removing_write = !prot.contains(Protection::WRITE);
        let need_tflush = self.active_pmap(pm);
        let mut done = Completion::new();

        self.crit.enter();
        for (start, end) in self.segments(sva, eva) {
            let Some((first, pt)) = self.pte_lookup(pm, start) else {
                continue;
            };
            for i in 0..self.page_count(start, end) {
                let (va, r) = (start + i * page, first.offset(i));
                let cell = self.cell(r);
                loop {
                    let opte = cell.load();
                    if !opte.is_valid() {
                        break;
                    }
                    let npte = self.pte.change_prot(opte, prot);
                    if npte == opte {
                        break;
                    }
                    if self.class.is_68040() && removing_write {
                        self.machine.dcache_flush_page(opte.pa());
                        self.machine.icache_purge_page(opte.pa());
                    }
                    if cell.update(opte, npte) {
                        if need_tflush {
                            self.machine.tlb_invalidate(va);
                        }
                        break;
                    }
                }
            }
            if let Some(t) = pt {
                self.table_release(pm, t, &mut done);
            }
        }
        self.crit.exit();
        self.finish(done);
    }

    /// Maps `va` to `pa` in `pm`.
    ///
    /// Physical addresses outside managed memory are mapped
    /// cache-inhibited. An existing mapping of the same page is updated in
    /// place; one of another page is replaced.
    ///
    /// # Errors
    /// [`EnterError::OutOfMemory`] if `flags` contains
    /// [`EnterFlags::CAN_FAIL`] and a table or PV entry is not available
    /// without waiting. Nothing is changed in that case.
    pub fn enter(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<(), EnterError> {
        let nowait = flags.contains(EnterFlags::CAN_FAIL);
        let pg = self.page_of(pa);
        let flags = if pg.is_none() {
            flags | EnterFlags::NOCACHE
        } else {
            flags
        };

        let mut done = Completion::new();
        self.crit.enter();
        let result = self.enter_locked(pm, va, pa, prot, flags, pg, nowait, &mut done);
        self.crit.exit();
        self.finish(done);

        if let Err(e) = result {
            warn!("enter {pm:?} {va} -> {pa}: {e}");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_locked(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
        pg: Option<ManagedPage>,
        nowait: bool,
        done: &mut Completion,
    ) -> Result<(), EnterError> {
        let (r, pt) = self
            .pte_alloc(pm, va, !nowait, done)
            .map_err(EnterError::OutOfMemory)?;
        let cell = self.cell(r);
        let mut npte = self.pte.make(pa, prot, flags);
        let mut opte = cell.load();

        if opte.is_valid() {
            self.counters.enter_valid += 1;
        }

        loop {
            if opte.is_valid() {
                if opte.pa() == npte.pa() {
                    // Protection or wiring change only.
                    if let Some(pg) = pg {
                        self.pages[pg.index].add_um(opte | npte);
                        debug_assert!(opte.pvlist());
                        npte = npte | Pte::PVLIST;
                    }
                    if opte.is_ci() {
                        npte = (npte & !Pte::CMASK) | (opte & Pte::CMASK);
                    }
                    cell.store(npte);

                    let diff = opte ^ npte;
                    if diff.wired() {
                        self.counters.enter_wire_change += 1;
                        let stats = &mut self.pmaps[pm.0].stats;
                        if npte.wired() {
                            stats.wired_count += 1;
                        } else {
                            stats.sub_wired();
                        }
                    }
                    if diff.write_protect() {
                        self.counters.enter_prot_change += 1;
                    }
                    if diff.intersects(Pte::CRIT_BITS) {
                        if self.class.is_68040() {
                            self.machine.dcache_flush_page(npte.pa());
                            self.machine.icache_purge_page(npte.pa());
                        }
                        if self.active_pmap(pm) {
                            self.machine.tlb_invalidate(va);
                            if self.class.has_vac() && diff.is_ci() && npte.is_ci() {
                                self.machine.vac_invalidate(VacScope::All);
                            }
                        }
                    }

                    if let Some(t) = pt {
                        self.table_release(pm, t, done);
                    }
                    return Ok(());
                }

                // A different page: the old mapping goes, the new one
                // inherits the hold taken by the lookup.
                self.counters.enter_pa_change += 1;
                self.remove_mapping(pm, va, r, pt, RemoveFlags::TFLUSH | RemoveFlags::CFLUSH, done);
            }

            debug_assert!(!cell.load().is_valid());
            self.pmaps[pm.0].stats.add_resident(npte.wired());

            let Some(pg) = pg else {
                cell.store(npte);
                return Ok(());
            };

            let pv = if let Some(pv) = done.pvs.pop() {
                self.counters.enter_pv_recycle += 1;
                pv
            } else if let Some(pv) = self.pv_alloc(true) {
                pv
            } else if nowait {
                self.pmaps[pm.0].stats.sub_resident(npte.wired());
                if let Some(t) = pt {
                    self.table_release(pm, t, done);
                }
                return Err(EnterError::OutOfMemory(Resource::PvEntry));
            } else {
                let Some(pv) = self.unlocked(|s| s.pv_alloc(false)) else {
                    panic!("enter: out of PV entries");
                };
                // Someone may have mapped `va` while we slept.
                opte = cell.load();
                if opte.is_valid() {
                    self.pmaps[pm.0].stats.sub_resident(npte.wired());
                    done.pvs.push(pv);
                    continue;
                }
                pv
            };

            self.pv_enter(pm, pg, va, pt, npte, pv);
            return Ok(());
        }
    }

    /// Clears the wired bit of the mapping at `va`.
    ///
    /// # Panics
    /// If nothing can be mapped at `va`.
    pub fn unwire(&mut self, pm: PmapId, va: VirtualAddress) {
        self.crit.enter();
        let Some((r, pt)) = self.pte_lookup(pm, va) else {
            panic!("unwire: no table for {va} in {pm:?}");
        };
        let cell = self.cell(r);
        loop {
            let opte = cell.load();
            debug_assert!(opte.is_valid(), "unwire of unmapped {va}");
            if !opte.wired() {
                break;
            }
            if cell.update(opte, opte & !Pte::WIRED) {
                self.pmaps[pm.0].stats.sub_wired();
                break;
            }
        }
        if let Some(t) = pt {
            self.table_release_held(pm, t);
        }
        self.crit.exit();
    }

    /// Physical address and properties of the mapping at `va`.
    ///
    /// Kernel addresses at or above the current end of kernel space are
    /// never reported as mapped.
    pub fn extract_info(&mut self, pm: PmapId, va: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        if pm.is_kernel() && va >= self.kernel.virtual_end {
            return None;
        }
        self.crit.enter();
        let mut found = None;
        if let Some((r, pt)) = self.pte_lookup(pm, va) {
            let pte = self.cell(r).load();
            if pte.is_valid() {
                let mut flags = MappingFlags::empty();
                flags.set(MappingFlags::WIRED, pte.wired());
                flags.set(MappingFlags::NOCACHE, pte.is_ci());
                found = Some((pte.pa() + va.page_offset(self.geom.page_size()), flags));
            }
            if let Some(t) = pt {
                self.table_release_held(pm, t);
            }
        }
        self.crit.exit();
        found
    }

    pub fn extract(&mut self, pm: PmapId, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.extract_info(pm, va).map(|(pa, _)| pa)
    }

    /// Physical address of a mapped kernel VA.
    ///
    /// Only for addresses known to be mapped; use [`extract`](Self::extract)
    /// otherwise. In release builds an unmapped `va` yields `0xFFFF_FFFF`,
    /// which no page frame can produce.
    ///
    /// # Panics
    /// In debug builds, if nothing is mapped at `va`.
    #[must_use]
    pub fn vtophys(&mut self, va: VirtualAddress) -> PhysicalAddress {
        let pa = self.extract(PmapId::KERNEL, va);
        debug_assert!(pa.is_some(), "vtophys: {va} not mapped");
        pa.unwrap_or(PhysicalAddress::new(u32::MAX))
    }

    /// Whether any mapping of the page has `bit` set; folds what it sees
    /// into the page attributes.
    fn testbit(&mut self, pg: ManagedPage, bit: Pte) -> bool {
        self.crit.enter();
        let found = if self.pages[pg.index].um().intersects(bit) {
            true
        } else {
            let mut seen = Pte::EMPTY;
            for pv in self.page_pvs(pg.index) {
                seen = seen | self.cell(self.pv_pte(pv)).load();
                if seen.intersects(bit) {
                    break;
                }
            }
            self.pages[pg.index].add_um(seen);
            seen.intersects(bit)
        };
        self.crit.exit();
        found
    }

    /// Applies `(pte | set) & mask` to every mapping of the page.
    ///
    /// Returns whether any PTE changed.
    fn changebit(&mut self, pg: ManagedPage, set: Pte, mask: Pte) -> bool {
        // Write-protecting or changing the cache mode needs the page
        // flushed before the first PTE changes.
        let mut cflush = self.class.is_68040()
            && (set.intersects(Pte::WP) || set.intersects(Pte::CMASK) || !mask.intersects(Pte::CMASK));
        let mut changed = false;
        let mut combined = Pte::EMPTY;

        self.crit.enter();
        let mut cur = self.pages[pg.index].head;
        while let Some(pv) = cur {
            let cell = self.cell(self.pv_pte(pv));
            let (opte, diff) = loop {
                let opte = cell.load();
                let npte = (opte | set) & mask;
                let diff = opte ^ npte;
                if diff.is_empty() {
                    break (opte, diff);
                }
                if cflush {
                    self.machine.dcache_flush_page(pg.pa);
                    self.machine.icache_purge_page(pg.pa);
                    cflush = false;
                }
                if cell.update(opte, npte) {
                    changed = true;
                    break (opte, diff);
                }
            };
            combined = combined | opte;
            let (pm, va) = (self.pvs[pv].pmap, self.pvs[pv].va);
            if diff.intersects(Pte::CRIT_BITS) && self.active_pmap(pm) {
                self.machine.tlb_invalidate(va);
            }
            cur = self.pvs[pv].next;
        }

        let md = &mut self.pages[pg.index];
        let um = (md.um() | combined | set) & mask;
        md.set_um(um);
        self.crit.exit();
        changed
    }

    /// Whether the page at `pa` was accessed since the last
    /// [`clear_reference`](Self::clear_reference).
    pub fn is_referenced(&mut self, pa: PhysicalAddress) -> bool {
        self.page_of(pa).is_some_and(|pg| {
            self.pages[pg.index].attrs.contains(PageAttrs::REFERENCED) || self.testbit(pg, Pte::U)
        })
    }

    /// Whether the page at `pa` was written since the last
    /// [`clear_modify`](Self::clear_modify).
    pub fn is_modified(&mut self, pa: PhysicalAddress) -> bool {
        self.page_of(pa).is_some_and(|pg| {
            self.pages[pg.index].attrs.contains(PageAttrs::MODIFIED) || self.testbit(pg, Pte::M)
        })
    }

    pub fn clear_reference(&mut self, pa: PhysicalAddress) -> bool {
        self.page_of(pa).is_some_and(|pg| self.changebit(pg, Pte::EMPTY, !Pte::U))
    }

    pub fn clear_modify(&mut self, pa: PhysicalAddress) -> bool {
        self.page_of(pa).is_some_and(|pg| self.changebit(pg, Pte::EMPTY, !Pte::M))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MmuEvent, SimConfig, boot};
    use crate::{CpuType, MmuType, PmapConfig};
    use kernel_memory_addresses::PageSize;

    fn user_pte(sys: &mut PmapSystem<crate::sim::SimMachine>, pm: PmapId, va: VirtualAddress) -> Option<Pte> {
        let (r, pt) = sys.pte_lookup(pm, va)?;
        let pte = sys.cell(r).load();
        if let Some(t) = pt {
            sys.table_release_held(pm, t);
        }
        Some(pte)
    }

    #[test]
    fn unmanaged_pages_are_mapped_cache_inhibited() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let va = VirtualAddress::new(0x0001_0000);
        sys.enter(pm, va, PhysicalAddress::new(0x00E0_0000), Protection::RW, EnterFlags::empty())
            .expect("blocking enter");
        let (_, flags) = sys.extract_info(pm, va).expect("mapped");
        assert!(flags.contains(MappingFlags::NOCACHE));
        assert_eq!(sys.pv_count(), 0);
    }

    #[test]
    fn rewiring_same_page_updates_in_place() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0002_0000);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::WIRED).expect("enter");
        assert_eq!(sys.wired_count(pm), 1);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("re-enter");
        assert_eq!(sys.wired_count(pm), 0);
        assert_eq!(sys.resident_count(pm), 1);
        assert_eq!(sys.counters().enter_valid, 1);
        assert_eq!(sys.counters().enter_wire_change, 1);
        assert_eq!(sys.mappings(pa).len(), 1);
        assert!(user_pte(&mut sys, pm, va).expect("pte").pvlist());
    }

    #[test]
    fn replacing_page_recycles_pv_entry() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let a = sys.machine_mut().take_page();
        let b = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0002_0000);
        sys.enter(pm, va, a, Protection::RW, EnterFlags::empty()).expect("enter");
        sys.enter(pm, va, b, Protection::READ, EnterFlags::empty()).expect("replace");
        assert_eq!(sys.counters().enter_pa_change, 1);
        assert_eq!(sys.counters().enter_pv_recycle, 1);
        assert!(sys.mappings(a).is_empty());
        assert_eq!(sys.mappings(b).len(), 1);
        assert_eq!(sys.resident_count(pm), 1);
        assert_eq!(sys.pv_count(), 1);
    }

    #[test]
    fn unwire_clears_bit_and_count() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0040_0000);
        sys.enter(pm, va, pa, Protection::READ, EnterFlags::WIRED).expect("enter");
        let holds = sys.pmap(pm).total_holds();
        sys.unwire(pm, va);
        assert_eq!(sys.wired_count(pm), 0);
        assert_eq!(sys.extract_info(pm, va).map(|(_, f)| f), Some(MappingFlags::empty()));
        assert_eq!(sys.pmap(pm).total_holds(), holds);
    }

    #[test]
    fn reference_and_modify_tracking() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0002_0000);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        assert!(!sys.is_referenced(pa));
        assert!(!sys.is_modified(pa));

        // The MMU sets U and M on access.
        let (r, pt) = sys.pte_lookup(pm, va).expect("pte");
        sys.cell(r).set(Pte::U | Pte::M);
        sys.table_release_held(pm, pt.expect("user leaf"));
        assert!(sys.is_modified(pa));
        assert!(sys.is_referenced(pa));

        assert!(sys.clear_modify(pa));
        assert!(!sys.is_modified(pa));
        assert!(sys.is_referenced(pa));
        assert!(sys.clear_reference(pa));
        assert!(!sys.is_referenced(pa));
        assert!(!sys.clear_reference(pa));
    }

    #[test]
    fn write_fault_access_presets_modified() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        sys.enter(pm, VirtualAddress::new(0x2000), pa, Protection::RW, EnterFlags::WRITE)
            .expect("enter");
        assert!(sys.is_modified(pa));
    }

    #[test]
    fn page_protect_read_only_then_remove() {
        let mut sys = boot(&SimConfig::new(PmapConfig::default().with_mmu_type(MmuType::M68030)));
        let pa = sys.machine_mut().take_page();
        let a = sys.create();
        let b = sys.create();
        sys.enter(a, VirtualAddress::new(0x1000), pa, Protection::RW, EnterFlags::empty()).expect("a");
        sys.enter(b, VirtualAddress::new(0x9000), pa, Protection::RW, EnterFlags::empty()).expect("b");

        sys.page_protect(pa, Protection::RW);
        assert!(!user_pte(&mut sys, a, VirtualAddress::new(0x1000)).expect("a").write_protect());

        sys.page_protect(pa, Protection::READ);
        assert!(user_pte(&mut sys, a, VirtualAddress::new(0x1000)).expect("a").write_protect());
        assert!(user_pte(&mut sys, b, VirtualAddress::new(0x9000)).expect("b").write_protect());

        sys.page_protect(pa, Protection::empty());
        assert!(sys.mappings(pa).is_empty());
        assert_eq!(sys.resident_count(a), 0);
        assert_eq!(sys.resident_count(b), 0);
        assert!(!sys.pmap(a).has_lev1());
        assert!(!sys.pmap(b).has_lev1());
        assert_eq!(sys.pv_count(), 0);
    }

    #[test]
    fn protect_on_68040_flushes_when_removing_write() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        sys.activate(pm);
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0003_0000);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        sys.machine_mut().events.clear();
        sys.protect(pm, va, va + 0x1000, Protection::READ | Protection::EXEC);
        let ev = &sys.machine().events;
        assert!(ev.contains(&MmuEvent::DcacheFlush(pa)));
        assert!(ev.contains(&MmuEvent::IcachePurge(pa)));
        assert!(ev.contains(&MmuEvent::Tlb(va)));

        // Same protection again is a no-op.
        sys.machine_mut().events.clear();
        sys.protect(pm, va, va + 0x1000, Protection::READ | Protection::EXEC);
        assert!(sys.machine().events.is_empty());
    }

    #[test]
    fn protect_without_read_removes() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0003_0000);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        sys.protect(pm, va, va + 0x1000, Protection::empty());
        assert_eq!(sys.extract(pm, va), None);
        assert_eq!(sys.resident_count(pm), 0);
    }

    #[test]
    fn remove_spans_segments_and_skips_holes() {
        let cfg = PmapConfig::default()
            .with_mmu_type(MmuType::M68040)
            .with_page_size(PageSize::Size8K);
        let mut sys = boot(&SimConfig::new(cfg));
        let pm = sys.create();
        let seg = sys.geometry().seg_bytes();
        let vas = [
            VirtualAddress::new(0),
            VirtualAddress::new(seg - 0x2000),
            VirtualAddress::new(seg),
            VirtualAddress::new(5 * seg),
        ];
        for va in vas {
            let pa = sys.machine_mut().take_page();
            sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        }
        assert_eq!(sys.resident_count(pm), 4);
        sys.remove(pm, VirtualAddress::new(0x2000), VirtualAddress::new(6 * seg));
        assert_eq!(sys.resident_count(pm), 1);
        assert!(sys.extract(pm, VirtualAddress::new(0)).is_some());
        for va in &vas[1..] {
            assert_eq!(sys.extract(pm, *va), None);
        }

        // Removing again changes nothing.
        let before = sys.stats(pm);
        sys.remove(pm, VirtualAddress::new(0x2000), VirtualAddress::new(6 * seg));
        assert_eq!(sys.stats(pm), before);
    }

    #[test]
    fn hp_remove_of_cacheable_invalidates_user_vac() {
        let cfg = PmapConfig::default()
            .with_mmu_type(MmuType::Hp)
            .with_cpu_type(CpuType::M68020)
            .with_vac_size(Some(0x1_0000));
        let mut sys = boot(&SimConfig::new(cfg));
        let pm = sys.create();
        sys.activate(pm);
        let pa = sys.machine_mut().take_page();
        let va = VirtualAddress::new(0x0001_0000);
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        sys.machine_mut().events.clear();
        sys.remove(pm, va, va + 0x1000);
        assert!(sys.machine().events.contains(&MmuEvent::Vac(VacScope::User)));
    }

    fn hp_vac() -> SimConfig {
        SimConfig::new(
            PmapConfig::default()
                .with_mmu_type(MmuType::Hp)
                .with_cpu_type(CpuType::M68020)
                .with_vac_size(Some(0x1_0000)),
        )
    }

    #[test]
    fn protect_read_only_keeps_translation() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let (va, pa) = (VirtualAddress::new(0x2000), PhysicalAddress::new(0x0010_0000));
        sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
        let resident = sys.resident_count(pm);
        sys.protect(pm, va, va + 0x1000, Protection::READ);
        assert_eq!(sys.extract(pm, va), Some(pa));
        assert!(user_pte(&mut sys, pm, va).expect("pte").write_protect());
        assert_eq!(sys.resident_count(pm), resident);
    }

    #[test]
    fn vac_alias_inhibits_both_mappings() {
        let mut sys = boot(&hp_vac());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        let (a, b) = (VirtualAddress::new(0x2000), VirtualAddress::new(0x3000));
        sys.enter(pm, a, pa, Protection::RW, EnterFlags::empty()).expect("a");
        assert!(!user_pte(&mut sys, pm, a).expect("a").is_ci());
        sys.enter(pm, b, pa, Protection::RW, EnterFlags::empty()).expect("b");

        assert!(user_pte(&mut sys, pm, a).expect("a").is_ci());
        assert!(user_pte(&mut sys, pm, b).expect("b").is_ci());
        let pvs = sys.mappings(pa);
        assert_eq!(pvs.len(), 2);
        assert!(pvs.iter().all(|pv| pv.flags() == crate::PvFlags::CI_VAC));
        assert!(sys.page_attrs(pa).expect("managed").contains(PageAttrs::CI));

        // The alias goes away with the second mapping.
        sys.remove(pm, b, b + 0x1000);
        assert!(!user_pte(&mut sys, pm, a).expect("a").is_ci());
        assert!(sys.mappings(pa).iter().all(|pv| pv.flags().is_empty()));
        assert!(!sys.page_attrs(pa).expect("managed").contains(PageAttrs::CI));
    }

    #[test]
    fn vac_same_color_and_other_pmaps_stay_cached() {
        let mut sys = boot(&hp_vac());
        let (p, q) = (sys.create(), sys.create());
        let pa = sys.machine_mut().take_page();
        sys.enter(p, VirtualAddress::new(0x2000), pa, Protection::RW, EnterFlags::empty()).expect("p");
        sys.enter(p, VirtualAddress::new(0x1_2000), pa, Protection::RW, EnterFlags::empty()).expect("p alias");
        sys.enter(q, VirtualAddress::new(0x5000), pa, Protection::RW, EnterFlags::empty()).expect("q");
        assert!(!user_pte(&mut sys, p, VirtualAddress::new(0x2000)).expect("p").is_ci());
        assert!(!user_pte(&mut sys, q, VirtualAddress::new(0x5000)).expect("q").is_ci());
        assert_eq!(sys.counters().pv_enter_vac_ci, 0);
    }

    #[test]
    fn user_nocache_request_inhibits_page_everywhere() {
        let mut sys = boot(&SimConfig::new(PmapConfig::default().with_mmu_type(MmuType::M68030)));
        let (p, q) = (sys.create(), sys.create());
        let pa = sys.machine_mut().take_page();
        let (va, vb) = (VirtualAddress::new(0x4000), VirtualAddress::new(0x8000));
        sys.enter(p, va, pa, Protection::RW, EnterFlags::empty()).expect("cached");
        sys.enter(q, vb, pa, Protection::RW, EnterFlags::NOCACHE).expect("uncached");
        assert!(user_pte(&mut sys, p, va).expect("p").is_ci());
        assert!(user_pte(&mut sys, q, vb).expect("q").is_ci());

        // A later cacheable mapping of the page is inhibited too.
        let vc = VirtualAddress::new(0xC000);
        sys.enter(p, vc, pa, Protection::READ, EnterFlags::empty()).expect("late");
        assert!(user_pte(&mut sys, p, vc).expect("late").is_ci());

        sys.remove(q, vb, vb + 0x1000);
        assert!(!user_pte(&mut sys, p, va).expect("p").is_ci());
        assert!(!user_pte(&mut sys, p, vc).expect("late").is_ci());
        assert!(!sys.page_attrs(pa).expect("managed").contains(PageAttrs::CI));
    }

    #[test]
    fn nonblocking_enter_without_tables_changes_nothing() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        sys.machine_mut().pages.limit_to(0);
        let r = sys.enter(pm, VirtualAddress::new(0x2000), pa, Protection::RW, EnterFlags::CAN_FAIL);
        assert_eq!(r, Err(EnterError::OutOfMemory(Resource::SegmentTable)));
        assert_eq!(sys.stats(pm), crate::PmapStats::default());
        assert_eq!(sys.pmap(pm).total_holds(), 0);
        assert_eq!(sys.pmap(pm).table_count(), 0);
        assert!(!sys.pmap(pm).has_lev1());
        assert_eq!(sys.pv_count(), 0);
    }

    #[test]
    fn nonblocking_enter_without_pv_entries_rolls_back() {
        let cfg = SimConfig::new(PmapConfig::default().with_pv_capacity(1));
        let mut sys = boot(&cfg);
        let pm = sys.create();
        let a = sys.machine_mut().take_page();
        let b = sys.machine_mut().take_page();
        sys.enter(pm, VirtualAddress::new(0x2000), a, Protection::RW, EnterFlags::empty()).expect("a");
        let stats = sys.stats(pm);
        let holds = sys.pmap(pm).total_holds();

        let r = sys.enter(pm, VirtualAddress::new(0x3000), b, Protection::RW, EnterFlags::CAN_FAIL);
        assert_eq!(r, Err(EnterError::OutOfMemory(Resource::PvEntry)));
        assert_eq!(sys.stats(pm), stats);
        assert_eq!(sys.pmap(pm).total_holds(), holds);
        assert_eq!(sys.extract(pm, VirtualAddress::new(0x3000)), None);

        // Waiting is allowed without the flag.
        sys.enter(pm, VirtualAddress::new(0x3000), b, Protection::RW, EnterFlags::empty()).expect("b");
        assert_eq!(sys.pv_count(), 2);
    }

    #[test]
    fn remove_all_frees_every_table_page() {
        for mmu in [MmuType::M68030, MmuType::M68040] {
            let mut sys = boot(&SimConfig::new(PmapConfig::default().with_mmu_type(mmu)));
            let pm = sys.create();
            sys.activate(pm);
            let targets: Vec<_> = (0..6).map(|_| sys.machine_mut().take_page()).collect();
            let in_use = sys.machine().pages.in_use();
            for (i, &pa) in targets.iter().enumerate() {
                let va = VirtualAddress::new(0x0040_0000 * u32::try_from(i).expect("small") + 0x1000);
                sys.enter(pm, va, pa, Protection::RW, EnterFlags::empty()).expect("enter");
            }
            assert!(sys.machine().pages.in_use() > in_use);
            let (r, pt) = sys.pte_lookup(pm, VirtualAddress::new(0x1000)).expect("pte");
            sys.cell(r).set(Pte::M);
            sys.table_release_held(pm, pt.expect("user leaf"));

            assert!(sys.remove_all(pm));
            assert_eq!(sys.stats(pm), crate::PmapStats::default());
            assert_eq!(sys.pmap(pm).table_count(), 0);
            assert_eq!(sys.pmap(pm).indexed_tables(), 0);
            assert!(sys.pmap(pm).ptpages().is_empty());
            assert_eq!(sys.pmap(pm).lev1_pa(), sys.null_segtab());
            assert_eq!(sys.machine().pages.in_use(), in_use);
            assert_eq!(sys.pv_count(), 0);
            assert!(targets.iter().all(|&pa| sys.mappings(pa).is_empty()));
            assert!(sys.is_modified(targets[0]));
            assert!(sys.machine().events.contains(&MmuEvent::LoadRoot(sys.root_loader.root(sys.null_segtab()))));
            sys.destroy(pm);
        }
    }

    #[test]
    fn enter_then_remove_restores_everything() {
        for cfg in [
            SimConfig::new(PmapConfig::default().with_mmu_type(MmuType::M68030)),
            SimConfig::default(),
            SimConfig::new(PmapConfig::default().with_page_size(PageSize::Size8K)),
            hp_vac(),
        ] {
            let mut sys = boot(&cfg);
            let pm = sys.create();
            let in_use = sys.machine().pages.in_use();
            let pa = sys.machine_mut().take_page();
            let va = VirtualAddress::new(0x0123_4000);
            sys.enter(pm, va, pa, Protection::RW, EnterFlags::WIRED).expect("enter");
            assert_eq!(sys.extract(pm, va + 0x10), Some(pa + 0x10));
            assert_eq!(sys.mappings(pa).len(), 1);
            assert_eq!(sys.mappings(pa)[0].va(), va);

            sys.unwire(pm, va);
            sys.remove(pm, va, va + sys.geometry().page_size().bytes());
            assert_eq!(sys.extract(pm, va), None);
            assert_eq!(sys.pmap(pm).total_holds(), 0);
            assert!(sys.pmap(pm).ptpages().is_empty());
            assert_eq!(sys.machine().pages.in_use(), in_use + 1);
            assert_eq!(sys.pv_count(), 0);
            sys.destroy(pm);
        }
    }

    #[test]
    fn holds_match_valid_entries_and_children() {
        let mut sys = boot(&SimConfig::default());
        let pm = sys.create();
        let pa = sys.machine_mut().take_page();
        // Three pages in one leaf, one in another leaf under the same inner
        // table, one under another inner table.
        let vas = [0x1000, 0x2000, 0x3000, 0x0004_0000, 0x0200_0000].map(VirtualAddress::new);
        for va in vas {
            sys.enter(pm, va, pa, Protection::READ, EnterFlags::empty()).expect("enter");
        }
        // 5 PTEs + 3 leaves linked in inner tables + 2 inner tables in L1.
        assert_eq!(sys.pmap(pm).total_holds(), 10);
        assert_eq!(sys.mappings(pa).len(), 5);
        sys.page_protect(pa, Protection::empty());
        assert_eq!(sys.pmap(pm).total_holds(), 0);
        assert_eq!(sys.pmap(pm).table_count(), 0);
    }

    #[test]
    fn mapping_made_while_waiting_for_a_pv_entry_is_replaced() {
        // No PV entry is available without waiting.
        let mut sys = boot(&SimConfig::new(PmapConfig::default().with_pv_capacity(0)));
        let pm = sys.create();
        let (mine, theirs) = (sys.machine_mut().take_page(), sys.machine_mut().take_page());
        let va = VirtualAddress::new(0x5000);
        let device = PhysicalAddress::new(0x00E0_0000);
        sys.enter(pm, va + 0x1000, device, Protection::READ, EnterFlags::empty()).expect("leaf");
        let waits = sys.counters().pv_alloc_wait;
        let recycled = sys.counters().enter_pv_recycle;

        sys.while_waiting(move |s| {
            s.enter(pm, va, theirs, Protection::READ, EnterFlags::empty()).expect("other");
        });
        sys.enter(pm, va, mine, Protection::RW, EnterFlags::WIRED).expect("enter");
        assert!(sys.on_wait.is_none());

        assert_eq!(sys.extract(pm, va), Some(mine));
        assert!(sys.mappings(theirs).is_empty());
        assert_eq!(sys.mappings(mine).len(), 1);
        assert_eq!(sys.counters().pv_alloc_wait, waits + 2);
        // The other mapping's entry was reused; ours was freed afterwards.
        assert_eq!(sys.counters().enter_pv_recycle, recycled + 1);
        assert_eq!(sys.pv_count(), 1);
        assert_eq!(sys.resident_count(pm), 2);
        assert_eq!(sys.wired_count(pm), 1);
        // Two PTEs in the leaf, the leaf in the inner table, that in level 1.
        assert_eq!(sys.pmap(pm).total_holds(), 4);
    }

    #[test]
    fn page_count_reaches_top_of_address_space() {
        let sys = boot(&SimConfig::default());
        let top = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(sys.page_count(VirtualAddress::new(0xFFFF_D000), top), 2);
        assert_eq!(sys.page_count(top, top), 0);
        assert_eq!(sys.page_count(top, VirtualAddress::new(0xFFFF_E000)), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unaligned range")]
    fn unaligned_kernel_remove_is_rejected() {
        let mut sys = boot(&SimConfig::default());
        let (start, _) = sys.virtual_space();
        sys.remove(PmapId::KERNEL, start, start + 0x10);
    }

    #[test]
    fn vtophys_of_mapped_kernel_page() {
        let mut sys = boot(&SimConfig::default());
        let (start, _) = sys.virtual_space();
        let pa = PhysicalAddress::new(0x0005_0000);
        sys.kenter_pa(start, pa, Protection::READ, EnterFlags::empty());
        assert_eq!(sys.vtophys(start + 0x24), pa + 0x24);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not mapped")]
    fn vtophys_of_unmapped_kernel_page_panics() {
        let mut sys = boot(&SimConfig::default());
        let (start, _) = sys.virtual_space();
        let _ = sys.vtophys(start);
    }

    /// Valid managed PTEs and PV entries describe the same mappings.
    fn assert_pv_consistent(
        sys: &mut PmapSystem<crate::sim::SimMachine>,
        pms: &[PmapId],
        vas: &[VirtualAddress],
        pages: &[PhysicalAddress],
    ) {
        let mut from_ptes = Vec::new();
        for &pm in pms {
            for &va in vas {
                let Some((r, pt)) = sys.pte_lookup(pm, va) else {
                    continue;
                };
                let pte = sys.cell(r).load();
                if let Some(t) = pt {
                    sys.table_release_held(pm, t);
                }
                if !pte.is_valid() {
                    continue;
                }
                let managed = sys.page_attrs(pte.pa()).is_some();
                assert_eq!(pte.pvlist(), managed, "{pm:?} {va}");
                if managed {
                    from_ptes.push((pm, va, pte.pa(), pt));
                }
            }
        }

        let mut from_pvs = Vec::new();
        for &pa in pages {
            for pv in sys.mappings(pa) {
                from_pvs.push((pv.pmap(), pv.va(), pa, pv.table));
            }
        }
        from_ptes.sort();
        from_pvs.sort();
        assert_eq!(from_ptes, from_pvs);
        assert_eq!(sys.pv_count(), from_pvs.len(), "PV entries without a mapping");

        // Each address space lists exactly its own entries.
        for &pm in pms {
            let mut own: Vec<_> = core::iter::successors(sys.pmaps[pm.0].pv_head, |&pv| sys.pvs[pv].pm_next)
                .map(|pv| (sys.pvs[pv].pmap, sys.pvs[pv].va))
                .collect();
            own.sort();
            let expected: Vec<_> = from_pvs.iter().filter(|e| e.0 == pm).map(|e| (e.0, e.1)).collect();
            assert_eq!(own, expected);
        }
    }

    #[test]
    fn pv_lists_track_page_tables_through_mixed_operations() {
        for cfg in [
            SimConfig::new(PmapConfig::default().with_mmu_type(MmuType::M68030)),
            SimConfig::default(),
            hp_vac(),
        ] {
            let mut sys = boot(&cfg);
            let pms = [sys.create(), sys.create(), sys.create()];
            let mut pages: Vec<_> = (0..4).map(|_| sys.machine_mut().take_page()).collect();
            pages.push(PhysicalAddress::new(0x00E0_0000));
            // VAC aliases, neighbours in one leaf and other segments.
            let vas = [
                0x1000, 0x2000, 0x3000, 0x1_1000, 0x1_2000, 0x0040_0000, 0x0040_1000, 0x0100_3000,
            ]
            .map(VirtualAddress::new);

            let mut seed = 0x2545_F491_u32;
            let mut pick = move |n: usize| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as usize % n
            };
            for _ in 0..300 {
                let pm = pms[pick(pms.len())];
                let va = vas[pick(vas.len())];
                let pa = pages[pick(pages.len())];
                match pick(16) {
                    0..=7 => {
                        let prot = if pick(2) == 0 { Protection::RW } else { Protection::READ };
                        let flags = match pick(6) {
                            0 => EnterFlags::NOCACHE,
                            1 => EnterFlags::WIRED,
                            _ => EnterFlags::empty(),
                        };
                        sys.enter(pm, va, pa, prot, flags).expect("blocking enter");
                    }
                    8..=10 => sys.remove(pm, va, va + 0x1000),
                    11 | 12 => sys.protect(pm, va, va + 0x2000, Protection::READ),
                    13 | 14 => {
                        let prot = if pick(2) == 0 { Protection::READ } else { Protection::empty() };
                        sys.page_protect(pa, prot);
                    }
                    _ => assert!(sys.remove_all(pm)),
                }
                assert_pv_consistent(&mut sys, &pms, &vas, &pages);
            }
        }
    }
}
