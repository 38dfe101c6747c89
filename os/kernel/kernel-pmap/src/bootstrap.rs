//! # Bootstrap
//!
//! Bringing up the pmap happens in two steps around enabling the MMU.
//!
//! [`bootstrap1`] runs with translation off. It carves the early kernel
//! structures out of the physical memory after the loaded image, builds the
//! kernel tables so that the image, the early structures and the PTE window
//! are mapped, and returns a [`BootLayout`] for the startup code to program
//! the MMU from:
//!
//! ```text
//!  PA:  | kernel image | u-area | L1 | null ST | kernel PT pages | (ST pages) |
//!  VA:  | kernel image | u-area | L1 | tmp src | tmp dst | vmmap | msgbuf |
//!       | PTE window | boot map | managed KVA ...
//! ```
//!
//! [`bootstrap2`] runs with translation on and turns the layout into a
//! [`PmapSystem`]. [`PmapSystem::init`] finally enables reverse mappings,
//! once the physical page allocator knows about managed memory.

use crate::arena::Arena;
use crate::config::{ConfigError, PmapConfig};
use crate::counters::Counters;
use crate::kernel::{KernelPtes, KernelState};
use crate::mmu::{Geometry, MmuClass, TranslationControl};
use crate::pmap::{Pmap, PmapId, PmapStats};
use crate::pte::{Pte, PteEngine, make_ste, ste_valid};
use crate::pv::{PageMd, PvPool};
use crate::system::PmapSystem;
use crate::table::TableKind;
use crate::{Machine, PhysMapper};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::boot::{BootMapFlags, BootParams};
use kernel_info::memory::{kernel_max_address, sysmap_size};
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress};
use kernel_sync::CriticalSection;
use log::{debug, info};

/// Result of [`bootstrap1`].
#[derive(Debug, Clone)]
pub struct BootLayout {
    pub(crate) kernel: KernelState,
    pub(crate) class: MmuClass,
    pub(crate) geom: Geometry,
    /// Virtual address of the kernel level-1 table.
    pub lev1_va: VirtualAddress,
    /// lwp0's u-area.
    pub uarea_pa: PhysicalAddress,
    pub uarea_va: VirtualAddress,
    /// Page of VA for `/dev/mem`-style access.
    pub vmmap: VirtualAddress,
    pub msgbuf_va: VirtualAddress,
    /// Virtual address assigned to each boot map entry, in order.
    pub bootmap_vas: Vec<VirtualAddress>,
    /// First free physical address after everything bootstrap allocated.
    pub nextpa: PhysicalAddress,
    /// Number of kernel PTEs made valid.
    pub entry_count: u32,
    pub nkptpages: u32,
    pub nkstpages: u32,
    /// Value for the translation control register; `None` on the HP MMU.
    pub translation_control: Option<TranslationControl>,
}

impl BootLayout {
    /// Physical address of the kernel level-1 table (SRP / supervisor STP).
    #[must_use]
    pub const fn lev1_pa(&self) -> PhysicalAddress {
        self.kernel.lev1_pa
    }

    #[must_use]
    pub const fn null_segtab_pa(&self) -> PhysicalAddress {
        self.kernel.null_segtab_pa
    }

    /// Base of the linear kernel PTE array.
    #[must_use]
    pub const fn pte_window(&self) -> VirtualAddress {
        self.kernel.ptes.window()
    }

    #[must_use]
    pub const fn virtual_start(&self) -> VirtualAddress {
        self.kernel.virtual_start
    }

    #[must_use]
    pub const fn virtual_end(&self) -> VirtualAddress {
        self.kernel.virtual_end
    }

    #[must_use]
    pub const fn virtual_max(&self) -> VirtualAddress {
        self.kernel.virtual_max
    }

    /// The two scratch pages used for page zeroing and copying.
    #[must_use]
    pub const fn tmpmaps(&self) -> (VirtualAddress, VirtualAddress) {
        (self.kernel.tmpmap_src, self.kernel.tmpmap_dst)
    }

    /// The PT page holding the PTE of `va`, if any.
    #[must_use]
    pub fn kernel_ptpage(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel.ptes.frame(va)
    }
}

/// Physical memory access while translation is off.
struct Early<'m, P: PhysMapper> {
    mapper: &'m P,
    page: PageSize,
}

impl<P: PhysMapper> Early<'_, P> {
    fn word(&self, pa: PhysicalAddress) -> &AtomicU32 {
        // SAFETY: Bootstrap only touches memory past the kernel image that it
        // allocated itself, and nothing else runs yet.
        let words = unsafe { self.mapper.phys_to_words(pa, 1) };
        &words[0]
    }

    fn zero(&self, from: PhysicalAddress, to: PhysicalAddress) {
        let count = ((to - from) / 4) as usize;
        // SAFETY: See `word`.
        let words = unsafe { self.mapper.phys_to_words(from, count) };
        for w in words {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Writes kernel PTEs for `[va, va + size)`; returns how many.
    fn map(&self, ptes: &KernelPtes, va: VirtualAddress, pa: PhysicalAddress, size: u32, proto: Pte) -> u32 {
        let page = self.page.bytes();
        let mut count = 0;
        let mut ofs = 0;
        while ofs < size {
            let Some(r) = ptes.pte(va + ofs) else {
                panic!("bootstrap: no kernel PT page for {}", va + ofs);
            };
            self.word(r.0)
                .store((Pte::for_pa(pa + ofs) | proto).into_bits(), Ordering::Relaxed);
            count += 1;
            ofs += page;
        }
        count
    }
}

/// Builds the kernel tables with translation off.
///
/// # Panics
/// If the boot map places a mapping outside the kernel PT space.
#[allow(clippy::too_many_lines)]
pub fn bootstrap1(mapper: &impl PhysMapper, config: &PmapConfig, params: &BootParams<'_>) -> BootLayout {
    let ps = config.page_size();
    let page = ps.bytes();
    let class = config.class();
    let geom = Geometry::new(class.depth(), ps);
    let early = Early { mapper, page: ps };
    let reloff = params.reloff.as_u32();
    let to_va = |pa: PhysicalAddress| VirtualAddress::new(pa.as_u32().wrapping_sub(reloff));

    let mut nextpa = params.nextpa.round_page(ps);
    let kernimg_end = nextpa;

    // u-area of lwp0
    let uspace = VirtualAddress::new(params.uspace).round_page(ps).as_u32();
    let uarea_pa = nextpa;
    let uarea_va = to_va(uarea_pa);
    nextpa += uspace;

    // Kernel level-1 table. With three levels its page also supplies the
    // first inner segment tables.
    let lev1_pa = nextpa;
    let lev1_va = to_va(lev1_pa);
    nextpa += page;
    let mut nkstpages = 1;
    let mut stnext = lev1_pa + page;
    let mut stnext_end = stnext;
    if geom.is_3l() {
        stnext = lev1_pa + geom.table_size(TableKind::Segment);
    }

    let null_segtab_pa = nextpa;
    nextpa += page;

    // From here on VA and PA allocations diverge.
    let mut nextva = to_va(lev1_pa) + page;
    let tmpmap_src = nextva;
    nextva += page;
    let tmpmap_dst = nextva;
    nextva += page;
    let vmmap = nextva;
    nextva += page;
    let msgbuf_va = nextva;
    nextva += VirtualAddress::new(params.msgbufsize).round_page(ps).as_u32();

    let mut virtual_max = kernel_max_address(ps);
    let step = geom.ptpage_va_size();
    let window = if let Some(sysmap) = params.sysmap_va {
        virtual_max = virtual_max.min(sysmap);
        sysmap
    } else {
        let w = nextva;
        nextva += sysmap_size(ps);
        w
    };

    let mut bootmap_vas = Vec::with_capacity(params.bootmap.len());
    for entry in params.bootmap {
        if entry.needs_va() {
            bootmap_vas.push(nextva);
            nextva += VirtualAddress::new(entry.size).round_page(ps).as_u32();
        } else {
            virtual_max = virtual_max.min(entry.vaddr.trunc_page(ps));
            bootmap_vas.push(entry.vaddr);
        }
    }

    // Initial managed KVA: enough to map all of physical memory.
    let virtual_start = nextva;
    let mut end = geom.round_ptpage(nextva + params.physmem.saturating_mul(page));
    if end > virtual_max || end < virtual_start {
        end = virtual_max;
    }
    let virtual_end = end;

    // Kernel PT pages: [0, virtual_end) and, with a high window, the window
    // up to the end of the address space.
    let mut ranges = vec![(VirtualAddress::zero(), virtual_end.as_u32().div_ceil(step))];
    if let Some(sysmap) = params.sysmap_va {
        let start = VirtualAddress::new(sysmap.as_u32() & !(step - 1));
        ranges.push((start, 0u32.wrapping_sub(start.as_u32()) / step));
    }
    let mut ptes = KernelPtes::new(window, geom);
    let mut kpt = Vec::new();
    for &(start, n) in &ranges {
        for i in 0..n {
            let va = start + i * step;
            ptes.set(va, nextpa);
            kpt.push((va, nextpa));
            nextpa += page;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let nkptpages = kpt.len() as u32;

    early.zero(kernimg_end, nextpa);

    let (ro, rw, ci) = PteEngine::boot_protos(class);
    let mut entry_count = 0;

    let text = params.kernel_text.trunc_page(ps);
    let etext = params.etext.round_page(ps);
    let pa_of = |va: VirtualAddress| PhysicalAddress::new(va.as_u32().wrapping_add(reloff));
    entry_count += early.map(&ptes, text, pa_of(text), etext - text, ro);
    entry_count += early.map(&ptes, etext, pa_of(etext), to_va(kernimg_end) - etext, rw);
    entry_count += early.map(&ptes, uarea_va, uarea_pa, uspace, rw);
    entry_count += early.map(&ptes, lev1_va, lev1_pa, page, ci);
    for &(start, n) in &ranges {
        let Some(first) = ptes.frame(start) else {
            continue;
        };
        // PT pages of one range are physically contiguous.
        entry_count += early.map(&ptes, ptes.window_va(start), first, n * page, ci);
    }
    for (entry, &va) in params.bootmap.iter().zip(&bootmap_vas) {
        if entry.is_mapped() {
            let proto = if entry.flags.contains(BootMapFlags::CI) {
                ci
            } else {
                rw
            };
            let size = VirtualAddress::new(entry.size).round_page(ps).as_u32();
            entry_count += early.map(&ptes, va, entry.paddr, size, proto);
        }
    }

    // Hook the PT pages into the level-1 table.
    let l1 = |va: VirtualAddress| lev1_pa + geom.st1_index(va) * 4;
    for &(va, ptp) in &kpt {
        if !geom.is_3l() {
            early.word(l1(va)).store(make_ste(ptp), Ordering::Relaxed);
            continue;
        }
        let leaf = geom.table_size(TableKind::Leaf);
        let (mut va, mut pa) = (va, ptp);
        while pa < ptp + page {
            let l1e = early.word(l1(va));
            if !ste_valid(l1e.load(Ordering::Relaxed)) {
                if stnext == stnext_end {
                    stnext = nextpa;
                    stnext_end = nextpa + page;
                    nextpa += page;
                    nkstpages += 1;
                    early.zero(stnext, stnext_end);
                }
                l1e.store(make_ste(stnext), Ordering::Relaxed);
                stnext += geom.table_size(TableKind::Segment);
            }
            let st = PhysicalAddress::new(l1e.load(Ordering::Relaxed) & !0x1FF);
            early
                .word(st + geom.st_index(va) * 4)
                .store(make_ste(pa), Ordering::Relaxed);
            va += geom.seg_bytes();
            pa += leaf;
        }
    }

    debug!(
        "bootstrap1: {nkptpages} kernel PT pages, {nkstpages} ST pages, {entry_count} PTEs, KVA {virtual_start}..{virtual_end}"
    );

    BootLayout {
        kernel: KernelState {
            ptes,
            lev1_pa,
            null_segtab_pa,
            tmpmap_src,
            tmpmap_dst,
            virtual_start,
            virtual_end,
            virtual_max,
            stnext,
            stnext_end,
        },
        class,
        geom,
        lev1_va,
        uarea_pa,
        uarea_va,
        vmmap,
        msgbuf_va,
        bootmap_vas,
        nextpa,
        entry_count,
        nkptpages,
        nkstpages,
        translation_control: geom.translation_control(class),
    }
}

/// Creates the pmap once translation is enabled.
///
/// # Errors
/// If the configuration names an MMU and CPU combination the pmap cannot
/// drive.
pub fn bootstrap2<M: Machine>(
    machine: M,
    layout: BootLayout,
    config: &PmapConfig,
) -> Result<PmapSystem<M>, ConfigError> {
    let root_loader = config.validate()?;
    debug_assert_eq!(layout.class, config.class());

    let mut kernel = Pmap::new(layout.kernel.lev1_pa);
    kernel.stats = PmapStats {
        resident_count: layout.entry_count,
        wired_count: layout.entry_count,
    };
    let mut pmaps = Arena::new();
    let id = pmaps.insert(kernel);
    debug_assert_eq!(id, PmapId::KERNEL.0);

    let counters = Counters {
        nkptpages_initial: u64::from(layout.nkptpages),
        nkptpages_current: u64::from(layout.nkptpages),
        nkstpages_initial: u64::from(layout.nkstpages),
        nkstpages_current: u64::from(layout.nkstpages),
        maxkva: layout.kernel.virtual_end.as_u32(),
        kvalimit: layout.kernel.virtual_max.as_u32(),
        ..Counters::default()
    };

    let mut sys = PmapSystem {
        machine,
        mmu_type: config.mmu_type(),
        class: layout.class,
        geom: layout.geom,
        pte: PteEngine::new(layout.class),
        root_loader,
        alias_mask: 0,
        pmaps,
        current: None,
        pvs: PvPool::new(config.pv_capacity()),
        pages: Vec::new(),
        initialized: false,
        kernel: layout.kernel,
        crit: CriticalSection::new(),
        counters,
        #[cfg(test)]
        on_wait: None,
    };

    let page = layout.geom.page_size().bytes();
    // The u-area sits right below the level-1 table.
    let mut pa = layout.uarea_pa;
    while pa < sys.kernel.lev1_pa {
        sys.zero_page(pa);
        pa += page;
    }

    if let Some(size) = config.vac_size() {
        sys.init_vac(size);
    }

    info!(
        "pmap: {:?} MMU, {} pages, {}-level tables, KVA {}..{} (max {})",
        sys.class,
        layout.geom.page_size(),
        if layout.geom.is_3l() { 3 } else { 2 },
        sys.kernel.virtual_start,
        sys.kernel.virtual_end,
        sys.kernel.virtual_max,
    );
    Ok(sys)
}

impl<M: Machine> PmapSystem<M> {
    /// Enables reverse mappings for the pages the allocator manages.
    ///
    /// Before this, every page is treated as unmanaged.
    pub fn init(&mut self) {
        let null = self.kernel.null_segtab_pa;
        self.zero_page(null);
        if self.class.is_68040() {
            self.machine.dcache_flush_page(null);
        }
        self.pages = vec![PageMd::default(); self.machine.managed_pages()];
        self.initialized = true;
        info!("pmap: {} managed pages", self.pages.len());
    }
}
