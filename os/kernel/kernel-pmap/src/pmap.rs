//! Address space objects.

use crate::arena::Arena;
use crate::ptpage::PtPagePool;
use crate::pv::PvId;
use crate::table::{Table, TableId, TableKey};
use alloc::collections::BTreeMap;
use kernel_memory_addresses::PhysicalAddress;

/// Handle of an address space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PmapId(pub(crate) u32);

impl PmapId {
    /// The kernel address space, present from bootstrap on.
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 == Self::KERNEL.0
    }
}

/// Resident and wired page counts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PmapStats {
    pub resident_count: u32,
    pub wired_count: u32,
}

impl PmapStats {
    #[inline]
    pub(crate) fn add_resident(&mut self, wired: bool) {
        self.resident_count += 1;
        if wired {
            self.wired_count += 1;
        }
    }

    #[inline]
    pub(crate) fn sub_resident(&mut self, wired: bool) {
        debug_assert!(self.resident_count > 0, "resident count underflow");
        self.resident_count -= 1;
        if wired {
            self.sub_wired();
        }
    }

    #[inline]
    pub(crate) fn sub_wired(&mut self) {
        debug_assert!(self.wired_count > 0, "wired count underflow");
        self.wired_count -= 1;
    }
}

/// One address space.
///
/// A user address space starts out pointing at the shared, all-invalid null
/// segment table. Its own level-1 table is allocated with the first mapping
/// and is dropped again once the last table below it goes away.
#[derive(Debug)]
pub struct Pmap {
    /// Private level-1 table; `None` while on the null table (and always for
    /// the kernel, whose level-1 table is set up at bootstrap).
    pub(crate) lev1: Option<TableId>,
    pub(crate) lev1_pa: PhysicalAddress,
    pub(crate) tables: Arena<Table>,
    pub(crate) index: BTreeMap<TableKey, TableId>,
    /// Last leaf table found by a lookup.
    pub(crate) cache: Option<TableId>,
    pub(crate) ptpages: PtPagePool,
    /// Head of the list of this address space's PV entries.
    pub(crate) pv_head: Option<PvId>,
    pub(crate) stats: PmapStats,
    pub(crate) refcnt: u32,
}

impl Pmap {
    pub(crate) const fn new(lev1_pa: PhysicalAddress) -> Self {
        Self {
            lev1: None,
            lev1_pa,
            tables: Arena::new(),
            index: BTreeMap::new(),
            cache: None,
            ptpages: PtPagePool::new(),
            pv_head: None,
            stats: PmapStats {
                resident_count: 0,
                wired_count: 0,
            },
            refcnt: 1,
        }
    }

    /// Physical address of the table the MMU walks from.
    #[inline]
    #[must_use]
    pub const fn lev1_pa(&self) -> PhysicalAddress {
        self.lev1_pa
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> PmapStats {
        self.stats
    }

    /// Number of live tables, including the level-1 table.
    #[must_use]
    pub const fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Number of tables reachable through the lookup index.
    #[must_use]
    pub fn indexed_tables(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub const fn ptpages(&self) -> &PtPagePool {
        &self.ptpages
    }

    /// Sum of all hold counts.
    #[must_use]
    pub fn total_holds(&self) -> u64 {
        self.tables.iter().map(|(_, t)| u64::from(t.hold)).sum()
    }

    /// Whether a private level-1 table is in use.
    #[must_use]
    pub const fn has_lev1(&self) -> bool {
        self.lev1.is_some()
    }
}
