//! # Tables
//!
//! A *table* is one block of descriptors carved from a PT page: either a
//! leaf page table or, with the 3-level layout, an inner segment table.
//! The level-1 table of a user address space is a segment table without a
//! parent.
//!
//! Tables are reference counted with a *hold count*:
//!
//! - each valid PTE in a leaf table holds its table,
//! - each linked child holds its parent,
//! - code working on a table holds it for the duration.
//!
//! When the count drops to zero the table is unlinked from its parent (or,
//! for the level-1 table, the address space falls back to the null segment
//! table), removed from the lookup index and its slot returned to the PT
//! page. The parent is released in turn.
//!
//! Tables other than level 1 are found through an ordered index keyed by
//! `(segment number << 1) | kind`; leaf lookups go through a one-entry
//! cache first.

use crate::completion::Completion;
use crate::error::Resource;
use crate::pmap::PmapId;
use crate::ptpage::{PtPage, PtPageId};
use crate::pte::{PteRef, make_ste};
use crate::system::PmapSystem;
use crate::{EnterFlags, Machine, Protection};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{debug, trace};

/// What a table holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableKind {
    /// Page table entries.
    Leaf,
    /// Descriptors of lower tables.
    Segment,
}

impl TableKind {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Leaf => 0,
            Self::Segment => 1,
        }
    }
}

/// Handle of a table within its address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableId(pub(crate) u32);

/// Lookup key of a table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableKey(u32);

impl TableKey {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(segnum: u32, kind: TableKind) -> Self {
        debug_assert!(segnum & 0x8000_0000 == 0);
        Self((segnum << 1) | kind.index() as u32)
    }
}

/// One live table.
#[derive(Debug)]
pub struct Table {
    pub(crate) key: TableKey,
    pub(crate) kind: TableKind,
    pub(crate) hold: u32,
    pub(crate) page: PtPageId,
    pub(crate) slot: u16,
    /// Table and entry index that point at this table.
    pub(crate) parent: Option<(TableId, u16)>,
}

impl Table {
    #[must_use]
    pub const fn hold(&self) -> u32 {
        self.hold
    }

    #[must_use]
    pub const fn kind(&self) -> TableKind {
        self.kind
    }
}

impl<M: Machine> PmapSystem<M> {
    /// Physical address of a table.
    pub(crate) fn table_pa(&self, pm: PmapId, t: TableId) -> PhysicalAddress {
        let pmap = &self.pmaps[pm.0];
        let table = &pmap.tables[t.0];
        let page = pmap.ptpages.page(table.page);
        page.pa() + u32::from(table.slot) * self.geom.table_size(table.kind)
    }

    /// Gets a PT page with its slots free, mapped into kernel space.
    ///
    /// Returns `None` only if `may_block` is false and either resource is
    /// short right now.
    pub(crate) fn ptpage_alloc(&mut self, kind: TableKind, may_block: bool) -> Option<PtPage> {
        let size = self.geom.page_size().bytes();
        let Some(kva) = self.machine.reserve(size, may_block) else {
            assert!(!may_block, "out of kernel virtual space for page tables");
            return None;
        };
        let Some(pa) = self.machine.alloc_zeroed_page(may_block) else {
            assert!(!may_block, "out of memory for page tables");
            self.machine.release(kva, size);
            return None;
        };
        self.kenter_pa(kva, pa, Protection::RW, EnterFlags::NOCACHE);

        debug!("PT page {kind:?} at {pa} mapped at {kva}");
        #[allow(clippy::cast_possible_truncation)]
        let capacity = self.geom.tables_per_page(kind) as u16;
        Some(PtPage::new(pa, kva, kind, capacity))
    }

    pub(crate) fn ptpage_free(&mut self, page: &PtPage) {
        let size = self.geom.page_size().bytes();
        debug!("PT page {:?} at {} released", page.kind(), page.pa());
        self.kremove(page.kva(), size);
        self.machine.release(page.kva(), size);
        self.machine.free_page(page.pa());
    }

    /// Takes a table slot, allocating a PT page if no queued page has one.
    ///
    /// Called outside the critical section. The table comes back with one
    /// hold and without a key or parent.
    fn table_alloc(
        &mut self,
        pm: PmapId,
        kind: TableKind,
        may_block: bool,
        done: &mut Completion,
    ) -> Option<TableId> {
        let mut fresh: Option<PtPage> = None;
        let page = loop {
            if let Some(id) = self.pmaps[pm.0].ptpages.head_with_free(kind) {
                // Someone else made a page available while we slept.
                if let Some(unneeded) = fresh.take() {
                    done.ptpages.push(unneeded);
                }
                break id;
            }
            if let Some(p) = fresh.take() {
                break self.pmaps[pm.0].ptpages.insert_head(p);
            }
            fresh = Some(self.ptpage_alloc(kind, may_block)?);
        };

        let pmap = &mut self.pmaps[pm.0];
        let slot = pmap.ptpages.take(page);
        let id = pmap.tables.insert(Table {
            key: TableKey::new(0, kind),
            kind,
            hold: 1,
            page,
            slot,
            parent: None,
        });
        Some(TableId(id))
    }

    /// Gives a table slot back; an emptied PT page goes to `done`.
    fn table_free(&mut self, pm: PmapId, t: TableId, done: &mut Completion) {
        let pmap = &mut self.pmaps[pm.0];
        let Some(table) = pmap.tables.remove(t.0) else {
            panic!("free of a dead table");
        };
        debug_assert!(table.parent.is_none());
        if let Some(page) = pmap.ptpages.put(table.page, table.slot) {
            done.ptpages.push(page);
        }
    }

    #[inline]
    pub(crate) fn table_retain(&mut self, pm: PmapId, t: TableId) {
        let table = &mut self.pmaps[pm.0].tables[t.0];
        table.hold += 1;
        debug_assert_ne!(table.hold, 0);
    }

    /// Drops a hold that cannot be the last one.
    pub(crate) fn table_release_held(&mut self, pm: PmapId, t: TableId) {
        let table = &mut self.pmaps[pm.0].tables[t.0];
        assert!(table.hold > 1, "last hold on a table dropped unexpectedly");
        table.hold -= 1;
    }

    /// Drops a hold; at zero the table is unlinked and freed.
    pub(crate) fn table_release(&mut self, pm: PmapId, t: TableId, done: &mut Completion) {
        let table = &mut self.pmaps[pm.0].tables[t.0];
        debug_assert_ne!(table.hold, 0);
        table.hold -= 1;
        if table.hold != 0 {
            return;
        }
        let parent = table.parent.take();
        let key = table.key;

        let pmap = &mut self.pmaps[pm.0];
        if pmap.cache == Some(t) {
            pmap.cache = None;
        }
        if let Some((st, idx)) = parent {
            let entry = PteRef(self.table_pa(pm, st)).offset(u32::from(idx));
            self.cell(entry).store_ste(0);
            self.pmaps[pm.0].index.remove(&key);
            trace!("unlinked table {key:?} from entry {idx}");
            self.table_release(pm, st, done);
        } else if pmap.lev1 == Some(t) {
            let null = self.kernel.null_segtab_pa;
            self.set_lev1map(pm, None, null);
        }
        self.table_free(pm, t, done);
    }

    /// Finds the table for a segment and takes a hold on it.
    pub(crate) fn table_lookup(&mut self, pm: PmapId, segnum: u32, kind: TableKind) -> Option<TableId> {
        let key = TableKey::new(segnum, kind);
        let pmap = &mut self.pmaps[pm.0];
        let found = match pmap.cache {
            Some(t) if pmap.tables[t.0].key == key => {
                self.counters.pt_cache_hit += 1;
                Some(t)
            }
            _ => {
                self.counters.pt_cache_miss += 1;
                let t = pmap.index.get(&key).copied();
                if kind == TableKind::Leaf {
                    pmap.cache = t;
                }
                t
            }
        };
        if let Some(t) = found {
            self.table_retain(pm, t);
        }
        found
    }

    /// Finds or creates the table for a segment below `parent`.
    ///
    /// The caller's hold on `parent` is consumed: it is either handed to
    /// the new table or dropped. Returns `None` if a table could not be
    /// allocated without blocking.
    #[allow(clippy::too_many_arguments)]
    fn table_insert(
        &mut self,
        pm: PmapId,
        parent: TableId,
        stidx: u32,
        segnum: u32,
        kind: TableKind,
        may_block: bool,
        done: &mut Completion,
    ) -> Option<TableId> {
        if let Some(t) = self.table_lookup(pm, segnum, kind) {
            self.table_release_held(pm, parent);
            return Some(t);
        }

        let Some(t) = self.unlocked(|s| s.table_alloc(pm, kind, may_block, done)) else {
            self.table_release(pm, parent, done);
            return None;
        };
        let key = TableKey::new(segnum, kind);

        // Revalidate: the table may have been created while we slept.
        if let Some(&winner) = self.pmaps[pm.0].index.get(&key) {
            self.table_retain(pm, winner);
            self.table_release(pm, t, done);
            self.table_release_held(pm, parent);
            return Some(winner);
        }

        let pmap = &mut self.pmaps[pm.0];
        let table = &mut pmap.tables[t.0];
        #[allow(clippy::cast_possible_truncation)]
        let slot = stidx as u16;
        table.key = key;
        table.parent = Some((parent, slot));
        pmap.index.insert(key, t);

        let ste = make_ste(self.table_pa(pm, t));
        let entry = PteRef(self.table_pa(pm, parent)).offset(stidx);
        self.cell(entry).store_ste(ste);
        trace!("linked table {key:?} at entry {stidx}");
        Some(t)
    }

    /// PTE for `va` plus a hold on the leaf table containing it.
    ///
    /// Kernel PTEs live in the permanent PTE window and need no hold.
    pub(crate) fn pte_lookup(&mut self, pm: PmapId, va: VirtualAddress) -> Option<(PteRef, Option<TableId>)> {
        if pm.is_kernel() {
            return Some((self.kernel_pte(va), None));
        }
        let t = self.table_lookup(pm, self.geom.segnum(va), TableKind::Leaf)?;
        let pte = PteRef(self.table_pa(pm, t)).offset(self.geom.pt_index(va));
        Some((pte, Some(t)))
    }

    /// Like [`pte_lookup`](Self::pte_lookup), creating tables as needed.
    ///
    /// May leave the critical section while allocating; callers revalidate
    /// anything they observed before.
    pub(crate) fn pte_alloc(
        &mut self,
        pm: PmapId,
        va: VirtualAddress,
        may_block: bool,
        done: &mut Completion,
    ) -> Result<(PteRef, Option<TableId>), Resource> {
        self.crit.assert_held();

        if let Some(found) = self.pte_lookup(pm, va) {
            return Ok(found);
        }

        let mut st = if let Some(l1) = self.pmaps[pm.0].lev1 {
            self.table_retain(pm, l1);
            l1
        } else {
            let st = self
                .unlocked(|s| s.table_alloc(pm, TableKind::Segment, may_block, done))
                .ok_or(Resource::SegmentTable)?;
            if let Some(l1) = self.pmaps[pm.0].lev1 {
                self.table_release(pm, st, done);
                self.table_retain(pm, l1);
                l1
            } else {
                let pa = self.table_pa(pm, st);
                self.set_lev1map(pm, Some(st), pa);
                st
            }
        };

        if self.geom.is_3l() {
            let l1idx = self.geom.st1_index(va);
            st = self
                .table_insert(pm, st, l1idx, l1idx, TableKind::Segment, may_block, done)
                .ok_or(Resource::SegmentTable)?;
        }

        let pt = self
            .table_insert(
                pm,
                st,
                self.geom.st_index(va),
                self.geom.segnum(va),
                TableKind::Leaf,
                may_block,
                done,
            )
            .ok_or(Resource::PageTable)?;
        let pte = PteRef(self.table_pa(pm, pt)).offset(self.geom.pt_index(va));
        Ok((pte, Some(pt)))
    }
}
