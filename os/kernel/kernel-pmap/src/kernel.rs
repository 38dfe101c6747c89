//! # The Kernel Address Space
//!
//! Kernel PTEs form one linear array covering the whole 4 GiB supervisor
//! space, the *PTE window*. It is sparsely backed: only the PT pages for
//! `[0, virtual_end)` (and, with a high window, from the window to the end
//! of the address space) exist. They are allocated at bootstrap or by
//! [`growkernel`](PmapSystem::growkernel) and never freed, so kernel
//! mappings need neither hold counts nor table lookups.
//!
//! ```text
//!  kernel VA   0 ────────── virtual_start ───────── virtual_end ──── virtual_max
//!              | image, u-area, L1, scratch,  |  managed KVA  | (growkernel)
//!              | msgbuf, PTE window, bootmap  |               |
//! ```

use crate::Machine;
use crate::mmu::{Geometry, VacScope};
use crate::pmap::PmapId;
use crate::prot::{EnterFlags, Protection};
use crate::pte::{Pte, PteRef, make_ste, ste_valid};
use crate::system::PmapSystem;
use crate::table::TableKind;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_info::memory::PTE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::debug;

/// Address bits of a 68040 segment table entry.
const STE40_TABLE_MASK: u32 = 0xFFFF_FE00;

/// Kernel PT pages, indexed by the range of kernel VA they map.
#[derive(Debug, Clone)]
pub struct KernelPtes {
    window: VirtualAddress,
    geom: Geometry,
    frames: Vec<Option<PhysicalAddress>>,
}

impl KernelPtes {
    #[must_use]
    pub fn new(window: VirtualAddress, geom: Geometry) -> Self {
        let slots = (u32::MAX / geom.ptpage_va_size()) as usize + 1;
        Self {
            window,
            geom,
            frames: vec![None; slots],
        }
    }

    #[inline]
    const fn slot(&self, va: VirtualAddress) -> usize {
        (va.as_u32() / self.geom.ptpage_va_size()) as usize
    }

    /// Base of the linear PTE array.
    #[must_use]
    pub const fn window(&self) -> VirtualAddress {
        self.window
    }

    /// The PT page backing the PTE of `va`.
    #[must_use]
    pub fn frame(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.frames[self.slot(va)]
    }

    pub(crate) fn set(&mut self, va: VirtualAddress, ptpage: PhysicalAddress) {
        let slot = self.slot(va);
        debug_assert!(self.frames[slot].is_none(), "kernel PT page for {va} installed twice");
        self.frames[slot] = Some(ptpage);
    }

    /// Physical location of the PTE mapping `va`.
    #[must_use]
    pub fn pte(&self, va: VirtualAddress) -> Option<PteRef> {
        let per_page = self.geom.page_size().bytes() / PTE_SIZE;
        let index = va.page_number(self.geom.page_size()) & (per_page - 1);
        self.frame(va).map(|pa| PteRef(pa).offset(index))
    }

    /// Virtual address of the PTE mapping `va` inside the window.
    #[must_use]
    pub fn window_va(&self, va: VirtualAddress) -> VirtualAddress {
        self.window + va.page_number(self.geom.page_size()) * PTE_SIZE
    }

    /// Number of backed PT pages.
    #[must_use]
    pub fn backed(&self) -> usize {
        self.frames.iter().flatten().count()
    }
}

/// Fixed kernel layout, established by bootstrap.
#[derive(Debug, Clone)]
pub(crate) struct KernelState {
    pub ptes: KernelPtes,
    pub lev1_pa: PhysicalAddress,
    pub null_segtab_pa: PhysicalAddress,
    /// Scratch mappings for [`zero_page`](PmapSystem::zero_page) and
    /// [`copy_page`](PmapSystem::copy_page).
    pub tmpmap_src: VirtualAddress,
    pub tmpmap_dst: VirtualAddress,
    pub virtual_start: VirtualAddress,
    pub virtual_end: VirtualAddress,
    pub virtual_max: VirtualAddress,
    /// Unused inner segment table space (3-level only).
    pub stnext: PhysicalAddress,
    pub stnext_end: PhysicalAddress,
}

impl<M: Machine> PmapSystem<M> {
    /// PTE of a kernel address.
    ///
    /// # Panics
    /// If no PT page backs `va`.
    pub(crate) fn kernel_pte(&self, va: VirtualAddress) -> PteRef {
        match self.kernel.ptes.pte(va) {
            Some(r) => r,
            None => panic!("no kernel PT page backs {va}"),
        }
    }

    /// Current kernel PTE for `va`, if a PT page backs it.
    #[must_use]
    pub fn kernel_entry(&self, va: VirtualAddress) -> Option<Pte> {
        self.kernel.ptes.pte(va).map(|r| self.cell(r).load())
    }

    /// Maps `va` to `pa` in the kernel without reverse mapping.
    ///
    /// The mapping is always wired. Callers remove it with
    /// [`kremove`](Self::kremove).
    ///
    /// # Panics
    /// If `va` already holds a managed mapping.
    pub fn kenter_pa(&mut self, va: VirtualAddress, pa: PhysicalAddress, prot: Protection, flags: EnterFlags) {
        let cell = self.cell(self.kernel_pte(va));
        let npte = self.pte.make(pa, prot, flags | EnterFlags::WIRED);
        let opte = cell.load();
        cell.store(npte);

        let stats = &mut self.pmaps[PmapId::KERNEL.0].stats;
        if opte.is_valid() {
            assert!(!opte.pvlist(), "kenter_pa at {va}: old mapping was managed");
            if !opte.wired() {
                stats.wired_count += 1;
            }
            self.machine.tlb_invalidate(va);
        } else {
            stats.add_resident(true);
        }
    }

    /// Removes `size` bytes of mappings made with [`kenter_pa`](Self::kenter_pa).
    pub fn kremove(&mut self, va: VirtualAddress, size: u32) {
        let page = self.geom.page_size().bytes();
        let mut all_ci = true;
        let mut count = 0;
        let mut va = va;
        let mut left = size;
        while left != 0 {
            let cell = self.cell(self.kernel_pte(va));
            let opte = cell.load();
            if opte.is_valid() {
                debug_assert!(!opte.pvlist(), "kremove of managed mapping at {va}");
                debug_assert!(opte.wired(), "kremove of unwired mapping at {va}");
                all_ci &= opte.is_ci();
                cell.store(Pte::EMPTY);
                self.machine.tlb_invalidate(va);
                count += 1;
            }
            va = va + page;
            left = left.saturating_sub(page);
        }
        if self.class.has_vac() && !all_ci {
            self.machine.vac_invalidate(VacScope::Supervisor);
        }
        let stats = &mut self.pmaps[PmapId::KERNEL.0].stats;
        stats.resident_count -= count;
        stats.wired_count -= count;
    }

    const fn tmpmap_flags(&self) -> EnterFlags {
        if self.class.has_vac() {
            EnterFlags::WIRED.union(EnterFlags::NOCACHE)
        } else {
            EnterFlags::WIRED
        }
    }

    /// Fills the page at `pa` with zeros through the scratch mapping.
    pub fn zero_page(&mut self, pa: PhysicalAddress) {
        let dst = self.kernel.tmpmap_dst;
        let cell = self.cell(self.kernel_pte(dst));
        debug_assert!(!cell.load().is_valid(), "zero_page scratch mapping busy");
        cell.store(self.pte.make(pa, Protection::RW, self.tmpmap_flags()));

        let words = (self.geom.page_size().bytes() / 4) as usize;
        for w in self.words(pa, words) {
            w.store(0, Ordering::Relaxed);
        }

        cell.store(Pte::EMPTY);
        self.machine.tlb_invalidate(dst);
    }

    /// Copies the page at `src` to `dst` through the scratch mappings.
    pub fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
        let (sva, dva) = (self.kernel.tmpmap_src, self.kernel.tmpmap_dst);
        let scell = self.cell(self.kernel_pte(sva));
        let dcell = self.cell(self.kernel_pte(dva));
        let flags = self.tmpmap_flags();

        debug_assert!(!scell.load().is_valid(), "copy_page source mapping busy");
        scell.store(self.pte.make(src, Protection::READ, flags));
        debug_assert!(!dcell.load().is_valid(), "copy_page destination mapping busy");
        dcell.store(self.pte.make(dst, Protection::RW, flags));

        let words = (self.geom.page_size().bytes() / 4) as usize;
        let from = self.words(src, words);
        let to = self.words(dst, words);
        for (s, d) in from.iter().zip(to) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        scell.store(Pte::EMPTY);
        self.machine.tlb_invalidate(sva);
        dcell.store(Pte::EMPTY);
        self.machine.tlb_invalidate(dva);
    }

    /// A zeroed page for kernel tables.
    fn growkernel_alloc_page(&mut self) -> PhysicalAddress {
        assert!(self.initialized, "growkernel before pmap init");
        let Some(pa) = self.machine.alloc_zeroed_page(false) else {
            panic!("growkernel: out of memory");
        };
        self.zero_page(pa);
        if self.class.is_68040() {
            self.machine.dcache_flush_page(pa);
        }
        pa
    }

    /// Hooks a new kernel PT page mapping `va..` into the kernel tables.
    fn link_kptpage(&mut self, va: VirtualAddress, ptp: PhysicalAddress) {
        let lev1 = PteRef(self.kernel.lev1_pa);
        if !self.geom.is_3l() {
            let entry = self.cell(lev1.offset(self.geom.st1_index(va)));
            assert!(!ste_valid(entry.load_ste()), "kernel segment at {va} already linked");
            entry.store_ste(make_ste(ptp));
            return;
        }

        let leaf = self.geom.table_size(TableKind::Leaf);
        let inner = self.geom.table_size(TableKind::Segment);
        let mut va = va;
        let mut pa = ptp;
        while pa < ptp + self.geom.page_size().bytes() {
            let l1e = self.cell(lev1.offset(self.geom.st1_index(va)));
            if !ste_valid(l1e.load_ste()) {
                if self.kernel.stnext == self.kernel.stnext_end {
                    let page = self.growkernel_alloc_page();
                    self.kernel.stnext = page;
                    self.kernel.stnext_end = page + self.geom.page_size().bytes();
                    self.counters.nkstpages_current += 1;
                }
                l1e.store_ste(make_ste(self.kernel.stnext));
                self.kernel.stnext = self.kernel.stnext + inner;
            }
            let st = PhysicalAddress::new(l1e.load_ste() & STE40_TABLE_MASK);
            self.cell(PteRef(st).offset(self.geom.st_index(va)))
                .store_ste(make_ste(pa));
            va = va + self.geom.seg_bytes();
            pa = pa + leaf;
        }
    }

    /// Makes sure kernel PTEs exist up to `maxkva`; returns the new end
    /// of kernel virtual space.
    ///
    /// # Panics
    /// If `maxkva` lies beyond the kernel's maximum, or no page is free.
    pub fn growkernel(&mut self, maxkva: VirtualAddress) -> VirtualAddress {
        self.crit.enter();
        debug_assert_eq!(
            self.kernel.virtual_end.as_u32() & (self.geom.ptpage_va_size() - 1),
            0
        );

        let mut new_end = self.geom.round_ptpage(maxkva);
        if new_end < self.kernel.virtual_end {
            new_end = self.kernel.virtual_end;
        } else {
            assert!(
                new_end <= self.kernel.virtual_max,
                "growkernel: out of kernel VA space (req={maxkva} limit={})",
                self.kernel.virtual_max
            );
            let step = self.geom.ptpage_va_size();
            let mut va = self.kernel.virtual_end;
            while va < new_end {
                let ptp = self.growkernel_alloc_page();
                self.link_kptpage(va, ptp);
                self.counters.nkptpages_current += 1;

                let window_va = self.kernel.ptes.window_va(va);
                self.kenter_pa(window_va, ptp, Protection::RW, EnterFlags::WIRED | EnterFlags::NOCACHE);
                self.kernel.ptes.set(va, ptp);
                debug!("kernel PT page {ptp} maps {va}");
                va = va + step;
            }
            self.kernel.virtual_end = new_end;
        }

        self.counters.maxkva = new_end.as_u32();
        self.counters.kvalimit = self.kernel.virtual_max.as_u32();
        self.crit.exit();
        new_end
    }

    /// Sets up the virtually-addressed cache geometry.
    ///
    /// # Panics
    /// If `size` is not a power of two or the cache was set up before.
    pub fn init_vac(&mut self, size: u32) {
        if !self.class.has_vac() {
            return;
        }
        assert_eq!(self.alias_mask, 0, "VAC initialized twice");
        assert!(size.is_power_of_two(), "VAC size {size:#x} is not a power of two");
        self.alias_mask = size - 1;
    }

    /// Adjusts `va` so that it shares a cache footprint with `hint`.
    ///
    /// Only the HP MMU has a virtually-addressed cache; elsewhere `va` comes
    /// back unchanged. With `top_down` the result is never above `va`.
    pub fn prefer(&mut self, hint: VirtualAddress, va: VirtualAddress, top_down: bool) -> VirtualAddress {
        if !self.class.has_vac() {
            return va;
        }
        let diff = hint.as_u32().wrapping_sub(va.as_u32()) & self.alias_mask;
        if diff == 0 {
            self.counters.prefer_nochange += 1;
            return va;
        }
        self.counters.prefer_change += 1;
        let mut va = va.as_u32();
        if top_down {
            va = va.wrapping_sub(self.alias_mask + 1);
        }
        VirtualAddress::new(va.wrapping_add(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MmuEvent, SimConfig, boot};
    use crate::{CpuType, MappingFlags, MmuType, PmapConfig};
    use kernel_memory_addresses::PageSize;

    #[test]
    fn window_addresses() {
        let g = Geometry::new(crate::TableDepth::TwoLevel, PageSize::Size4K);
        let mut k = KernelPtes::new(VirtualAddress::new(0x0040_0000), g);
        assert_eq!(k.window_va(VirtualAddress::new(0x0000_5000)).as_u32(), 0x0040_0014);
        assert_eq!(k.pte(VirtualAddress::new(0x5000)), None);
        k.set(VirtualAddress::zero(), PhysicalAddress::new(0x0010_0000));
        assert_eq!(
            k.pte(VirtualAddress::new(0x5000)),
            Some(PteRef(PhysicalAddress::new(0x0010_0014)))
        );
        assert_eq!(k.backed(), 1);
    }

    #[test]
    fn kenter_kremove_keep_kernel_counts() {
        let mut sys = boot(&SimConfig::default());
        let before = sys.stats(PmapId::KERNEL);
        let (start, _) = sys.virtual_space();
        let va = start + 0x1_0000;
        sys.kenter_pa(va, PhysicalAddress::new(0x00E0_0000), Protection::RW, EnterFlags::NOCACHE);
        let pte = sys.kernel_entry(va).expect("backed");
        assert!(pte.is_valid() && pte.wired() && pte.is_ci());
        assert_eq!(sys.stats(PmapId::KERNEL).resident_count, before.resident_count + 1);
        assert_eq!(
            sys.extract_info(PmapId::KERNEL, va + 0x10),
            Some((PhysicalAddress::new(0x00E0_0010), MappingFlags::WIRED | MappingFlags::NOCACHE))
        );
        sys.kremove(va, 0x2000);
        assert_eq!(sys.stats(PmapId::KERNEL), before);
        assert_eq!(sys.extract(PmapId::KERNEL, va), None);
    }

    #[test]
    fn extract_stops_at_kernel_end() {
        let mut sys = boot(&SimConfig::default());
        let end = sys.virtual_end();
        assert_eq!(sys.extract(PmapId::KERNEL, end), None);
    }

    #[test]
    fn hp_kremove_of_cacheable_flushes_vac() {
        let cfg = PmapConfig::default()
            .with_mmu_type(MmuType::Hp)
            .with_cpu_type(CpuType::M68020);
        let mut sys = boot(&SimConfig::new(cfg));
        let (start, _) = sys.virtual_space();
        sys.kenter_pa(start, PhysicalAddress::new(0x3000), Protection::READ, EnterFlags::empty());
        sys.machine_mut().events.clear();
        sys.kremove(start, 0x1000);
        assert!(sys.machine().events.contains(&MmuEvent::Vac(VacScope::Supervisor)));
    }

    #[test]
    fn copy_and_zero_through_scratch() {
        let mut sys = boot(&SimConfig::default());
        let a = sys.machine_mut().take_page();
        let b = sys.machine_mut().take_page();
        sys.machine().write_word(a + 8, 0xDEAD_BEEF);
        sys.copy_page(a, b);
        assert_eq!(sys.machine().read_word(b + 8), 0xDEAD_BEEF);
        sys.zero_page(b);
        assert_eq!(sys.machine().read_word(b + 8), 0);
        let (src, dst) = (sys.kernel.tmpmap_src, sys.kernel.tmpmap_dst);
        assert!(!sys.kernel_entry(src).expect("backed").is_valid());
        assert!(!sys.kernel_entry(dst).expect("backed").is_valid());
    }

    #[test]
    fn growkernel_links_new_pt_pages() {
        for mmu in [MmuType::M68030, MmuType::M68040] {
            let mut sys = boot(&SimConfig::new(PmapConfig::default().with_mmu_type(mmu)));
            let end = sys.virtual_end();
            let step = sys.geometry().ptpage_va_size();
            let kpt = sys.counters().nkptpages_current;

            // Already covered.
            assert_eq!(sys.growkernel(VirtualAddress::new(end.as_u32() - step)), end);
            assert_eq!(sys.counters().nkptpages_current, kpt);

            let new_end = sys.growkernel(end + 1);
            assert_eq!(new_end, end + step);
            assert_eq!(sys.virtual_end(), new_end);
            assert_eq!(sys.counters().nkptpages_current, kpt + 1);
            assert_eq!(sys.counters().maxkva, new_end.as_u32());

            // The new range is usable and walkable by the hardware.
            let pa = PhysicalAddress::new(0x7000);
            sys.kenter_pa(end, pa, Protection::RW, EnterFlags::empty());
            assert_eq!(sys.machine().walk(sys.kernel.lev1_pa, sys.geometry(), end), Some(pa));
        }
    }

    #[test]
    #[should_panic(expected = "out of kernel VA space")]
    fn growkernel_past_limit_panics() {
        let mut sys = boot(&SimConfig::default());
        let (_, max) = sys.virtual_space();
        sys.growkernel(max + 1);
    }

    #[test]
    fn prefer_aligns_to_vac_footprint() {
        let cfg = PmapConfig::default()
            .with_mmu_type(MmuType::Hp)
            .with_cpu_type(CpuType::M68020)
            .with_vac_size(Some(0x1_0000));
        let mut sys = boot(&SimConfig::new(cfg));
        let hint = VirtualAddress::new(0x0000_3000);
        assert_eq!(sys.prefer(hint, VirtualAddress::new(0x0012_3000), false).as_u32(), 0x0012_3000);
        assert_eq!(sys.prefer(hint, VirtualAddress::new(0x0012_0000), false).as_u32(), 0x0012_3000);
        assert_eq!(sys.prefer(hint, VirtualAddress::new(0x0012_0000), true).as_u32(), 0x0011_3000);
        assert_eq!(sys.counters().prefer_change, 2);
        assert_eq!(sys.counters().prefer_nochange, 1);

        let mut plain = boot(&SimConfig::default());
        assert_eq!(plain.prefer(hint, VirtualAddress::new(0x0012_0000), false).as_u32(), 0x0012_0000);
    }
}
