//! Simulated machine for tests: RAM as atomic words, a page allocator whose
//! supply can be cut off, a kernel VA allocator and a recorder for MMU and
//! cache operations.

use crate::bootstrap::{BootLayout, bootstrap1, bootstrap2};
use crate::config::{ConfigError, PmapConfig};
use crate::mmu::{Geometry, UserRoot, VacScope};
use crate::system::PmapSystem;
use crate::{KvaAlloc, MmuOps, PageAlloc, PhysMapper};
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::boot::{BootMapEntry, BootParams};
use kernel_info::memory::{DEFAULT_MSGBUFSIZE, DEFAULT_USPACE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One MMU or cache operation issued by the pmap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MmuEvent {
    LoadRoot(UserRoot),
    Tlb(VirtualAddress),
    TlbUser,
    IcacheAll,
    DcacheFlush(PhysicalAddress),
    IcachePurge(PhysicalAddress),
    Vac(VacScope),
}

/// Managed physical pages.
#[derive(Debug, Default)]
pub struct SimPages {
    first: PhysicalAddress,
    end: PhysicalAddress,
    page: u32,
    next: PhysicalAddress,
    free: Vec<PhysicalAddress>,
    limit: Option<usize>,
}

impl SimPages {
    /// Lets only `n` more allocations succeed.
    pub fn limit_to(&mut self, n: usize) {
        self.limit = Some(n);
    }

    fn alloc(&mut self) -> Option<PhysicalAddress> {
        if self.limit == Some(0) {
            return None;
        }
        let pa = if let Some(pa) = self.free.pop() {
            pa
        } else if self.next < self.end {
            let pa = self.next;
            self.next += self.page;
            pa
        } else {
            return None;
        };
        if let Some(n) = &mut self.limit {
            *n -= 1;
        }
        Some(pa)
    }

    /// Pages handed out and not returned.
    pub fn in_use(&self) -> usize {
        ((self.next - self.first) / self.page) as usize - self.free.len()
    }
}

/// Kernel VA handed out top-down from the end of managed KVA.
#[derive(Debug, Default)]
struct SimKva {
    low: VirtualAddress,
    top: VirtualAddress,
    free: Vec<(VirtualAddress, u32)>,
}

#[derive(Debug)]
pub struct SimMachine {
    ram: Vec<AtomicU32>,
    pub pages: SimPages,
    kva: SimKva,
    pub events: Vec<MmuEvent>,
    /// Copy of the bootstrap result.
    pub layout: Option<BootLayout>,
}

impl SimMachine {
    pub fn new(ram_bytes: u32) -> Self {
        Self {
            ram: (0..ram_bytes / 4).map(|_| AtomicU32::new(0)).collect(),
            pages: SimPages::default(),
            kva: SimKva::default(),
            events: Vec::new(),
            layout: None,
        }
    }

    fn ram_end(&self) -> PhysicalAddress {
        PhysicalAddress::new(u32::try_from(self.ram.len() * 4).expect("RAM below 4 GiB"))
    }

    /// Hands `[first, end of RAM)` to the page allocator and `[low, top)` to
    /// the KVA allocator.
    fn manage(&mut self, first: PhysicalAddress, page: u32, low: VirtualAddress, top: VirtualAddress) {
        self.pages = SimPages {
            first,
            end: self.ram_end(),
            page,
            next: first,
            free: Vec::new(),
            limit: None,
        };
        self.kva = SimKva {
            low,
            top,
            free: Vec::new(),
        };
    }

    #[must_use]
    pub fn first_managed(&self) -> PhysicalAddress {
        self.pages.first
    }

    /// A zeroed managed page, for use as a mapping target.
    pub fn take_page(&mut self) -> PhysicalAddress {
        self.alloc_zeroed_page(false).expect("sim: out of pages")
    }

    fn word(&self, pa: PhysicalAddress) -> &AtomicU32 {
        &self.ram[(pa.as_u32() / 4) as usize]
    }

    #[must_use]
    pub fn read_word(&self, pa: PhysicalAddress) -> u32 {
        self.word(pa).load(Ordering::Relaxed)
    }

    pub fn write_word(&self, pa: PhysicalAddress, value: u32) {
        self.word(pa).store(value, Ordering::Relaxed);
    }

    /// Translates `va` the way the MMU would, starting at `lev1`.
    #[must_use]
    pub fn walk(&self, lev1: PhysicalAddress, geom: Geometry, va: VirtualAddress) -> Option<PhysicalAddress> {
        let l1e = self.read_word(lev1 + geom.st1_index(va) * 4);
        if l1e & 0x2 == 0 {
            return None;
        }
        let pt = if geom.is_3l() {
            let l2e = self.read_word(PhysicalAddress::new(l1e & !0x1FF) + geom.st_index(va) * 4);
            if l2e & 0x2 == 0 {
                return None;
            }
            l2e & !0x7F
        } else {
            l1e & !0xF
        };
        let pte = self.read_word(PhysicalAddress::new(pt) + geom.pt_index(va) * 4);
        if pte & 0x1 == 0 {
            return None;
        }
        let ps = geom.page_size();
        Some(PhysicalAddress::new(pte & !ps.mask()) + va.page_offset(ps))
    }
}

impl PageAlloc for SimMachine {
    fn alloc_zeroed_page(&mut self, _may_block: bool) -> Option<PhysicalAddress> {
        let pa = self.pages.alloc()?;
        for i in 0..self.pages.page / 4 {
            self.write_word(pa + i * 4, 0);
        }
        Some(pa)
    }

    fn free_page(&mut self, pa: PhysicalAddress) {
        debug_assert!(!self.pages.free.contains(&pa), "sim: double free of {pa}");
        self.pages.free.push(pa);
    }

    fn page_index(&self, pa: PhysicalAddress) -> Option<usize> {
        (pa >= self.pages.first && pa < self.pages.end).then(|| ((pa - self.pages.first) / self.pages.page) as usize)
    }

    fn managed_pages(&self) -> usize {
        ((self.pages.end - self.pages.first) / self.pages.page) as usize
    }
}

impl KvaAlloc for SimMachine {
    fn reserve(&mut self, size: u32, _may_block: bool) -> Option<VirtualAddress> {
        if let Some(i) = self.kva.free.iter().position(|&(_, s)| s == size) {
            return Some(self.kva.free.swap_remove(i).0);
        }
        let top = VirtualAddress::new(self.kva.top.as_u32().checked_sub(size)?);
        if top < self.kva.low {
            return None;
        }
        self.kva.top = top;
        Some(top)
    }

    fn release(&mut self, va: VirtualAddress, size: u32) {
        self.kva.free.push((va, size));
    }
}

impl PhysMapper for SimMachine {
    unsafe fn phys_to_words<'a>(&self, pa: PhysicalAddress, count: usize) -> &'a [AtomicU32] {
        let start = (pa.as_u32() / 4) as usize;
        assert!(start + count <= self.ram.len(), "sim: {pa} outside RAM");
        // SAFETY: The RAM vector is never resized and outlives the system
        // built on top of it.
        unsafe { core::slice::from_raw_parts(self.ram.as_ptr().add(start), count) }
    }
}

impl MmuOps for SimMachine {
    fn load_user_root(&mut self, root: UserRoot) {
        self.events.push(MmuEvent::LoadRoot(root));
    }

    fn tlb_invalidate(&mut self, va: VirtualAddress) {
        self.events.push(MmuEvent::Tlb(va));
    }

    fn tlb_invalidate_user(&mut self) {
        self.events.push(MmuEvent::TlbUser);
    }

    fn icache_invalidate_all(&mut self) {
        self.events.push(MmuEvent::IcacheAll);
    }

    fn dcache_flush_page(&mut self, pa: PhysicalAddress) {
        self.events.push(MmuEvent::DcacheFlush(pa));
    }

    fn icache_purge_page(&mut self, pa: PhysicalAddress) {
        self.events.push(MmuEvent::IcachePurge(pa));
    }

    fn vac_invalidate(&mut self, scope: VacScope) {
        self.events.push(MmuEvent::Vac(scope));
    }
}

/// Machine and image description for [`boot`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub pmap: PmapConfig,
    pub ram_bytes: u32,
    pub sysmap_va: Option<VirtualAddress>,
    pub bootmap: Vec<BootMapEntry>,
}

impl SimConfig {
    pub fn new(pmap: PmapConfig) -> Self {
        Self {
            pmap,
            ram_bytes: 4 << 20,
            sysmap_va: None,
            bootmap: Vec::new(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(PmapConfig::default())
    }
}

/// Runs both bootstrap phases and `init` on a fresh machine.
///
/// The kernel is linked at 0 and loaded at 0: text at 0x2000..0x10000, the
/// rest of the image up to 0x20000.
pub fn try_boot(cfg: &SimConfig) -> Result<PmapSystem<SimMachine>, ConfigError> {
    let page = cfg.pmap.page_size();
    let mut machine = SimMachine::new(cfg.ram_bytes);
    let params = BootParams {
        kernel_text: VirtualAddress::new(0x2000),
        etext: VirtualAddress::new(0x1_0000),
        nextpa: PhysicalAddress::new(0x2_0000),
        reloff: PhysicalAddress::zero(),
        physmem: cfg.ram_bytes / page.bytes(),
        uspace: DEFAULT_USPACE,
        msgbufsize: DEFAULT_MSGBUFSIZE,
        sysmap_va: cfg.sysmap_va,
        bootmap: &cfg.bootmap,
    };
    let layout = bootstrap1(&machine, &cfg.pmap, &params);
    machine.manage(
        layout.nextpa.round_page(page),
        page.bytes(),
        layout.virtual_start(),
        layout.virtual_end(),
    );
    machine.layout = Some(layout.clone());
    let mut sys = bootstrap2(machine, layout, &cfg.pmap)?;
    sys.init();
    sys.machine_mut().events.clear();
    Ok(sys)
}

pub fn boot(cfg: &SimConfig) -> PmapSystem<SimMachine> {
    try_boot(cfg).expect("sim boot")
}

impl PmapSystem<SimMachine> {
    /// Lets `other` run the next time an operation sleeps for memory.
    pub fn while_waiting(&mut self, other: impl FnOnce(&mut Self) + 'static) {
        self.on_wait = Some(Box::new(other));
    }
}
