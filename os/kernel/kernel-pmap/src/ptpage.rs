//! # Page Table Pages
//!
//! Tables are carved from whole physical pages ("PT pages"). With the
//! 2-level layout a table fills its page; with the 3-level layout a page
//! holds 8 segment tables or 16 (4 KiB) / 64 (8 KiB) leaf tables.
//!
//! Every address space keeps two queues of PT pages, one per
//! [`TableKind`]. The queue order decides which page the next table comes
//! from and tries to keep nearly-full pages at the head, so that lightly
//! used pages drain and can be given back:
//!
//! ```text
//!  head                                              tail
//!  [1 free] -> [2 free] -> [5 free] -> ... -> [0 free] -> [0 free]
//!     ^ allocate from here                      full pages sink
//! ```
//!
//! - Taking the last free slot of a page moves it to the tail.
//! - Returning a slot so that exactly one is free moves the page to the head.
//! - A page with all slots free leaves the queue; the caller frees it later.
//! - Otherwise the page sinks behind its successors while they have at
//!   least as many free slots.

use crate::arena::Arena;
use crate::table::TableKind;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Index of a [`PtPage`] within its address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtPageId(pub(crate) u32);

/// One physical page subdivided into table slots.
#[derive(Debug)]
pub struct PtPage {
    pa: PhysicalAddress,
    kva: VirtualAddress,
    kind: TableKind,
    capacity: u16,
    free: Vec<u16>,
}

impl PtPage {
    /// A page with all `capacity` slots free.
    ///
    /// Slots are handed out from the highest index down.
    #[must_use]
    pub fn new(pa: PhysicalAddress, kva: VirtualAddress, kind: TableKind, capacity: u16) -> Self {
        debug_assert!(capacity > 0);
        Self {
            pa,
            kva,
            kind,
            capacity,
            free: (0..capacity).collect(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    /// Kernel virtual address the page is mapped at.
    #[inline]
    #[must_use]
    pub const fn kva(&self) -> VirtualAddress {
        self.kva
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> TableKind {
        self.kind
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn free_count(&self) -> u16 {
        self.free.len() as u16
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Whether no slot is in use.
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.free_count() == self.capacity
    }
}

/// The PT pages of one address space.
#[derive(Debug, Default)]
pub struct PtPagePool {
    pages: Arena<PtPage>,
    queues: [VecDeque<PtPageId>; 2],
}

impl PtPagePool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Arena::new(),
            queues: [VecDeque::new(), VecDeque::new()],
        }
    }

    #[inline]
    #[must_use]
    pub fn page(&self, id: PtPageId) -> &PtPage {
        &self.pages[id.0]
    }

    /// Number of pages currently owned.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The queue for `kind`, head first.
    pub fn queue(&self, kind: TableKind) -> impl Iterator<Item = PtPageId> + '_ {
        self.queues[kind.index()].iter().copied()
    }

    /// Head page of the queue if it has a free slot.
    #[must_use]
    pub fn head_with_free(&self, kind: TableKind) -> Option<PtPageId> {
        self.queues[kind.index()]
            .front()
            .copied()
            .filter(|&id| self.pages[id.0].free_count() > 0)
    }

    /// Adopts a fresh page at the head of its queue.
    pub fn insert_head(&mut self, page: PtPage) -> PtPageId {
        let kind = page.kind;
        let id = PtPageId(self.pages.insert(page));
        self.queues[kind.index()].push_front(id);
        id
    }

    /// Takes a free slot from `id`.
    ///
    /// # Panics
    /// If the page has no free slot.
    pub fn take(&mut self, id: PtPageId) -> u16 {
        let page = &mut self.pages[id.0];
        let kind = page.kind;
        let Some(slot) = page.free.pop() else {
            panic!("take from a full PT page");
        };
        if page.free.is_empty() {
            let q = &mut self.queues[kind.index()];
            if let Some(pos) = q.iter().position(|&p| p == id)
                && pos + 1 < q.len()
            {
                q.remove(pos);
                q.push_back(id);
            }
        }
        slot
    }

    /// Returns `slot` to `id` and reorders the queue.
    ///
    /// A page that became unused is removed from the pool and handed back.
    pub fn put(&mut self, id: PtPageId, slot: u16) -> Option<PtPage> {
        let page = &mut self.pages[id.0];
        debug_assert!(!page.free.contains(&slot), "double free of table slot {slot}");
        debug_assert!(page.free_count() < page.capacity);
        page.free.push(slot);
        let kind = page.kind;
        let free = page.free_count();
        let unused = page.is_unused();

        let q = &mut self.queues[kind.index()];
        let Some(pos) = q.iter().position(|&p| p == id) else {
            debug_assert!(false, "PT page not queued");
            return None;
        };

        if unused {
            q.remove(pos);
            return self.pages.remove(id.0);
        }
        if free == 1 {
            q.remove(pos);
            q.push_front(id);
            return None;
        }

        let pages = &self.pages;
        let fewer = q
            .iter()
            .skip(pos + 1)
            .position(|&p| pages[p.0].free_count() < free)
            .map(|i| i + pos + 1);
        if let Some(at) = fewer
            && at != pos + 1
            && pages[q[at].0].free_count() != 0
        {
            q.remove(pos);
            // Lands right after the page with fewer free slots.
            q.insert(at, id);
        }
        None
    }

    /// Removes every page, for bulk teardown.
    pub fn drain(&mut self) -> Vec<PtPage> {
        for q in &mut self.queues {
            q.clear();
        }
        let ids: Vec<u32> = self.pages.iter().map(|(i, _)| i).collect();
        let pages = ids.into_iter().filter_map(|i| self.pages.remove(i)).collect();
        self.pages.clear();
        pages
    }
}
