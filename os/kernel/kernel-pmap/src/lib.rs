//! # m68k Physical Map
//!
//! Machine-dependent virtual memory for Motorola 68k machines: builds and
//! maintains the MMU translation tables of the kernel and of every user
//! address space, and the reverse mappings from physical pages back to the
//! virtual addresses that map them.
//!
//! ## What you get
//! - A [`PmapSystem`] per machine holding every address space, created by
//!   [`bootstrap1`] (MMU off) and [`bootstrap2`] (MMU on).
//! - Mapping operations: [`enter`](PmapSystem::enter),
//!   [`remove`](PmapSystem::remove), [`protect`](PmapSystem::protect),
//!   [`page_protect`](PmapSystem::page_protect),
//!   [`extract`](PmapSystem::extract) and friends.
//! - Referenced/modified tracking per managed page.
//! - Cache coherency for physically and virtually addressed caches.
//! - Kernel growth ([`growkernel`](PmapSystem::growkernel)) and a crash
//!   dump header ([`KcoreHeader`]).
//!
//! ## Supported MMUs
//!
//! | [`MmuType`]           | Class                  | Walk    | User root           |
//! |:----------------------|:-----------------------|:--------|:--------------------|
//! | `M68851`, `M68030`    | [`MmuClass::M68851`]   | 2-level | CRP                 |
//! | `M68040`, `M68060`    | [`MmuClass::M68040`]   | 3-level | URP                 |
//! | `Hp`                  | [`MmuClass::Hp`]       | 2-level | segment table reg.  |
//!
//! ## Collaborators
//!
//! The pmap does not own physical memory or kernel virtual space. It talks
//! to the rest of the kernel through the [`Machine`] traits:
//!
//! ```text
//!             +-------------+
//!  VM  ─────► | PmapSystem  | ──► PageAlloc   zeroed pages, managed page index
//!             |             | ──► KvaAlloc    kernel VA for PT pages
//!             |             | ──► PhysMapper  access to table memory
//!             +-------------+ ──► MmuOps      root loads, TLB and cache control
//! ```
//!
//! ## Concurrency
//!
//! Uniprocessor. Every operation runs inside a non-preemptible
//! [`CriticalSection`](kernel_sync::CriticalSection) and leaves it only
//! around allocations that may sleep; state seen before sleeping is
//! revalidated afterwards.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod bootstrap;
mod completion;
mod config;
mod counters;
mod error;
mod kcore;
mod kernel;
mod mmu;
mod ops;
mod pmap;
mod prot;
mod pte;
mod ptpage;
mod pv;
mod system;
mod table;

#[cfg(test)]
mod sim;

pub use crate::bootstrap::{BootLayout, bootstrap1, bootstrap2};
pub use crate::config::{ConfigError, CpuType, MmuType, PmapConfig};
pub use crate::counters::Counters;
pub use crate::error::{EnterError, Resource};
pub use crate::kcore::{KcoreError, KcoreHeader};
pub use crate::mmu::{Geometry, MmuClass, RootLoader, TableDepth, TranslationControl, UserRoot, VacScope};
pub use crate::pmap::{Pmap, PmapId, PmapStats};
pub use crate::prot::{EnterFlags, MappingFlags, Protection};
pub use crate::pte::{CacheMode, Pte};
pub use crate::pv::{PageAttrs, PvEntry, PvFlags};
pub use crate::system::PmapSystem;

use core::sync::atomic::AtomicU32;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of physical pages.
pub trait PageAlloc {
    /// Allocates one zero-filled page.
    ///
    /// With `may_block` the call may sleep until memory is available and
    /// returns `None` only if memory is permanently exhausted. Without it,
    /// `None` means no page is free right now.
    fn alloc_zeroed_page(&mut self, may_block: bool) -> Option<PhysicalAddress>;

    /// Returns a page obtained from [`alloc_zeroed_page`](Self::alloc_zeroed_page).
    fn free_page(&mut self, pa: PhysicalAddress);

    /// Index of the managed page at `pa`, or `None` for unmanaged memory
    /// (device space, the kernel image).
    fn page_index(&self, pa: PhysicalAddress) -> Option<usize>;

    /// Number of managed pages.
    fn managed_pages(&self) -> usize;
}

/// Source of kernel virtual address ranges.
pub trait KvaAlloc {
    /// Reserves `size` bytes of page-aligned kernel virtual space.
    fn reserve(&mut self, size: u32, may_block: bool) -> Option<VirtualAddress>;

    fn release(&mut self, va: VirtualAddress, size: u32);
}

/// Access to memory by physical address.
pub trait PhysMapper {
    /// Views `count` words at `pa` as atomics.
    ///
    /// # Safety
    /// `pa` must be word aligned, the range must be RAM that stays
    /// allocated for `'a`, and every other access to it must be atomic.
    unsafe fn phys_to_words<'a>(&self, pa: PhysicalAddress, count: usize) -> &'a [AtomicU32];
}

/// MMU and cache control.
///
/// The 68040 and 68060 cache operations act on one physical page; the
/// VAC operations exist on HP machines only and are no-ops elsewhere.
pub trait MmuOps {
    /// Switches the user address space.
    fn load_user_root(&mut self, root: UserRoot);

    /// Invalidates the translation of one kernel or user page.
    fn tlb_invalidate(&mut self, va: VirtualAddress);

    /// Invalidates all user translations.
    fn tlb_invalidate_user(&mut self);

    fn icache_invalidate_all(&mut self);

    /// `CPUSHP DC`: writes back and invalidates the data cache lines of a page.
    fn dcache_flush_page(&mut self, pa: PhysicalAddress);

    /// `CINVP IC`: invalidates the instruction cache lines of a page.
    fn icache_purge_page(&mut self, pa: PhysicalAddress);

    fn vac_invalidate(&mut self, scope: VacScope);
}

/// Everything the pmap needs from the machine.
pub trait Machine: PageAlloc + KvaAlloc + PhysMapper + MmuOps {}

impl<T: PageAlloc + KvaAlloc + PhysMapper + MmuOps> Machine for T {}
