//! # MMU Classes and Table Geometry
//!
//! Three families of MMU are driven by the same pmap:
//!
//! | Class    | CPUs / MMUs              | Walk    | Cache                          |
//! |:---------|:-------------------------|:--------|:-------------------------------|
//! | `M68851` | 68020 + 68851, 68030     | 2-level | physically addressed           |
//! | `M68040` | 68040, 68060             | 3-level | physically addressed, per-PTE mode |
//! | `Hp`     | 68020 + HP MMU (hp300)   | 2-level | virtually addressed (VAC)      |
//!
//! ## Logical address layout
//!
//! ```text
//! 2-level, 4 KiB:  | L1:10 | PT:10 | offset:12 |     (HP MMU compatible)
//! 2-level, 8 KiB:  | L1:8  | PT:11 | offset:13 |
//! 3-level, 4 KiB:  | L1:7 | L2:7 | PT:6 | offset:12 |
//! 3-level, 8 KiB:  | L1:7 | L2:7 | PT:5 | offset:13 |
//! ```
//!
//! A *segment* is the range of addresses served by one leaf table. In the
//! 2-level layout the level-1 table points at leaf tables directly and each
//! leaf table fills a page. In the 3-level layout (fixed by the 68040
//! hardware) leaf tables are 256 or 128 bytes, so several share one page,
//! and inner segment tables of 512 bytes sit between level 1 and the leaves.

use crate::config::MmuType;
use crate::table::TableKind;
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress};
use kernel_registers::{RootPointer51, Tc51, Tcr40};

/// Number of table levels walked by the hardware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableDepth {
    TwoLevel,
    ThreeLevel,
}

/// Family of MMU, selected once at bootstrap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MmuClass {
    /// 68851 and the 68030's on-chip MMU.
    M68851,
    /// 68040 and 68060.
    M68040,
    /// HP's custom MMU with a virtually-addressed cache.
    Hp,
}

impl MmuClass {
    #[must_use]
    pub const fn of(mmu: MmuType) -> Self {
        match mmu {
            MmuType::M68851 | MmuType::M68030 => Self::M68851,
            MmuType::M68040 | MmuType::M68060 => Self::M68040,
            MmuType::Hp => Self::Hp,
        }
    }

    #[inline]
    #[must_use]
    pub const fn depth(self) -> TableDepth {
        match self {
            Self::M68040 => TableDepth::ThreeLevel,
            Self::M68851 | Self::Hp => TableDepth::TwoLevel,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_68040(self) -> bool {
        matches!(self, Self::M68040)
    }

    /// Whether the machine has a virtually-addressed cache.
    #[inline]
    #[must_use]
    pub const fn has_vac(self) -> bool {
        matches!(self, Self::Hp)
    }
}

/// Which half of the virtually-addressed cache to invalidate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VacScope {
    /// `DCIA`: both user and supervisor lines.
    All,
    /// `DCIU`: user lines.
    User,
    /// `DCIS`: supervisor lines.
    Supervisor,
}

/// How the user root table is handed to the MMU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RootLoader {
    /// 68851 / 68030: load the CPU root pointer.
    Crp51,
    /// 68040: `MOVEC` to URP.
    Urp40,
    /// 68060: `MOVEC` to URP, plus branch cache maintenance.
    Urp60,
    /// HP MMU: write the user segment table register.
    HpStp,
}

impl RootLoader {
    #[must_use]
    pub fn root(self, table: PhysicalAddress) -> UserRoot {
        match self {
            Self::Crp51 => UserRoot::Crp(RootPointer51::crp(table)),
            Self::Urp40 => UserRoot::Urp40(table),
            Self::Urp60 => UserRoot::Urp60(table),
            Self::HpStp => UserRoot::HpSegmentTable(table),
        }
    }
}

/// Value loaded into the MMU to switch the user address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserRoot {
    Crp(RootPointer51),
    Urp40(PhysicalAddress),
    Urp60(PhysicalAddress),
    HpSegmentTable(PhysicalAddress),
}

impl UserRoot {
    /// Physical address of the level-1 table.
    #[must_use]
    pub const fn table(&self) -> PhysicalAddress {
        match self {
            Self::Crp(rp) => rp.table(),
            Self::Urp40(pa) | Self::Urp60(pa) | Self::HpSegmentTable(pa) => *pa,
        }
    }
}

/// Translation control register value for the configured walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TranslationControl {
    Tc51(Tc51),
    Tcr40(Tcr40),
}

const SEG_SHIFT_3L: u32 = 18;
const SEG1_SHIFT_3L: u32 = 25;
const L2_COUNT_3L: u32 = 128;
const TABLE_SIZE_3L_L1L2: u32 = L2_COUNT_3L * 4;

/// Index arithmetic for one table layout and page size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    depth: TableDepth,
    page: PageSize,
}

impl Geometry {
    #[must_use]
    pub const fn new(depth: TableDepth, page: PageSize) -> Self {
        Self { depth, page }
    }

    #[inline]
    #[must_use]
    pub const fn depth(&self) -> TableDepth {
        self.depth
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn is_3l(&self) -> bool {
        matches!(self.depth, TableDepth::ThreeLevel)
    }

    /// log2 of the bytes covered by one leaf table.
    #[inline]
    #[must_use]
    pub const fn seg_shift(&self) -> u32 {
        match self.depth {
            TableDepth::ThreeLevel => SEG_SHIFT_3L,
            TableDepth::TwoLevel => 2 * self.page.shift() - 2,
        }
    }

    #[inline]
    #[must_use]
    pub const fn seg_bytes(&self) -> u32 {
        1 << self.seg_shift()
    }

    /// Number of index bits of a leaf table.
    #[inline]
    #[must_use]
    const fn pt_bits(&self) -> u32 {
        match self.depth {
            TableDepth::ThreeLevel => SEG_SHIFT_3L - self.page.shift(),
            TableDepth::TwoLevel => self.page.shift() - 2,
        }
    }

    /// Segment number: identifies the leaf table covering `va`.
    #[inline]
    #[must_use]
    pub const fn segnum(&self, va: VirtualAddress) -> u32 {
        va.as_u32() >> self.seg_shift()
    }

    /// Index into the level-1 table.
    #[inline]
    #[must_use]
    pub const fn st1_index(&self, va: VirtualAddress) -> u32 {
        match self.depth {
            TableDepth::ThreeLevel => va.as_u32() >> SEG1_SHIFT_3L,
            TableDepth::TwoLevel => va.as_u32() >> self.seg_shift(),
        }
    }

    /// Index into the segment table that points at the leaf table.
    #[inline]
    #[must_use]
    pub const fn st_index(&self, va: VirtualAddress) -> u32 {
        match self.depth {
            TableDepth::ThreeLevel => (va.as_u32() >> SEG_SHIFT_3L) & (L2_COUNT_3L - 1),
            TableDepth::TwoLevel => va.as_u32() >> self.seg_shift(),
        }
    }

    /// Index into the leaf table.
    #[inline]
    #[must_use]
    pub const fn pt_index(&self, va: VirtualAddress) -> u32 {
        (va.as_u32() >> self.page.shift()) & ((1 << self.pt_bits()) - 1)
    }

    /// Number of entries of the level-1 table.
    #[must_use]
    pub const fn l1_entries(&self) -> u32 {
        match self.depth {
            TableDepth::ThreeLevel => L2_COUNT_3L,
            TableDepth::TwoLevel => 1 << (32 - self.seg_shift()),
        }
    }

    /// Size in bytes of one table of the given kind.
    #[must_use]
    pub const fn table_size(&self, kind: TableKind) -> u32 {
        match (self.depth, kind) {
            (TableDepth::ThreeLevel, TableKind::Leaf) => (1 << self.pt_bits()) * 4,
            (TableDepth::ThreeLevel, TableKind::Segment) => TABLE_SIZE_3L_L1L2,
            (TableDepth::TwoLevel, _) => self.page.bytes(),
        }
    }

    /// Number of tables of the given kind carved from one page.
    #[must_use]
    pub const fn tables_per_page(&self, kind: TableKind) -> u32 {
        self.page.bytes() / self.table_size(kind)
    }

    /// First segment boundary at or above `va`, wrapping to 0 at the top.
    #[inline]
    #[must_use]
    pub const fn round_seg(&self, va: VirtualAddress) -> VirtualAddress {
        let ofs = self.seg_bytes() - 1;
        VirtualAddress::new(va.as_u32().wrapping_add(ofs) & !ofs)
    }

    /// Start of the segment following the one containing `va`; 0 at the end
    /// of the address space.
    #[inline]
    #[must_use]
    pub const fn next_seg(&self, va: VirtualAddress) -> VirtualAddress {
        self.round_seg(VirtualAddress::new(va.as_u32().wrapping_add(self.page.bytes())))
    }

    /// Bytes of address space mapped by one page of PTEs.
    #[inline]
    #[must_use]
    pub const fn ptpage_va_size(&self) -> u32 {
        (self.page.bytes() / 4) * self.page.bytes()
    }

    #[inline]
    #[must_use]
    pub const fn round_ptpage(&self, va: VirtualAddress) -> VirtualAddress {
        let ofs = self.ptpage_va_size() - 1;
        VirtualAddress::new(va.as_u32().wrapping_add(ofs) & !ofs)
    }

    /// 68851-style TC describing this walk. Also used for crash dumps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tc51(&self) -> Tc51 {
        let ps = self.page.shift() as u8;
        match self.depth {
            TableDepth::ThreeLevel => Tc51::for_walk(ps, 7, 7, (SEG_SHIFT_3L - self.page.shift()) as u8),
            TableDepth::TwoLevel => Tc51::for_walk(
                ps,
                (32 - self.seg_shift()) as u8,
                (self.page.shift() - 2) as u8,
                0,
            ),
        }
    }

    /// Translation control value to program for `class`; the HP MMU has none.
    #[must_use]
    pub const fn translation_control(&self, class: MmuClass) -> Option<TranslationControl> {
        match class {
            MmuClass::M68851 => Some(TranslationControl::Tc51(self.tc51())),
            MmuClass::M68040 => Some(TranslationControl::Tcr40(Tcr40::for_page_size(self.page))),
            MmuClass::Hp => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G2_4K: Geometry = Geometry::new(TableDepth::TwoLevel, PageSize::Size4K);
    const G2_8K: Geometry = Geometry::new(TableDepth::TwoLevel, PageSize::Size8K);
    const G3_4K: Geometry = Geometry::new(TableDepth::ThreeLevel, PageSize::Size4K);
    const G3_8K: Geometry = Geometry::new(TableDepth::ThreeLevel, PageSize::Size8K);

    #[test]
    fn two_level_indices() {
        let va = VirtualAddress::new(0x1234_5678);
        assert_eq!(G2_4K.seg_shift(), 22);
        assert_eq!(G2_4K.segnum(va), 0x1234_5678 >> 22);
        assert_eq!(G2_4K.st1_index(va), G2_4K.st_index(va));
        assert_eq!(G2_4K.pt_index(va), (0x1234_5678 >> 12) & 0x3FF);
        assert_eq!(G2_4K.l1_entries(), 1024);
        assert_eq!(G2_8K.seg_shift(), 24);
        assert_eq!(G2_8K.l1_entries(), 256);
        assert_eq!(G2_8K.pt_index(va), (0x1234_5678 >> 13) & 0x7FF);
    }

    #[test]
    fn three_level_indices() {
        let va = VirtualAddress::new(0xFEDC_BA98);
        assert_eq!(G3_4K.segnum(va), 0xFEDC_BA98 >> 18);
        assert_eq!(G3_4K.st1_index(va), 0xFEDC_BA98 >> 25);
        assert_eq!(G3_4K.st_index(va), (0xFEDC_BA98 >> 18) & 0x7F);
        assert_eq!(G3_4K.pt_index(va), (0xFEDC_BA98 >> 12) & 0x3F);
        assert_eq!(G3_8K.pt_index(va), (0xFEDC_BA98 >> 13) & 0x1F);
    }

    #[test]
    fn table_sizes() {
        assert_eq!(G3_4K.table_size(TableKind::Leaf), 256);
        assert_eq!(G3_8K.table_size(TableKind::Leaf), 128);
        assert_eq!(G3_4K.tables_per_page(TableKind::Leaf), 16);
        assert_eq!(G3_8K.tables_per_page(TableKind::Leaf), 64);
        assert_eq!(G3_4K.tables_per_page(TableKind::Segment), 8);
        assert_eq!(G2_4K.tables_per_page(TableKind::Leaf), 1);
        assert_eq!(G2_8K.tables_per_page(TableKind::Segment), 1);
    }

    #[test]
    fn segment_stepping_wraps_at_top() {
        assert_eq!(G3_4K.next_seg(VirtualAddress::new(0)).as_u32(), 0x4_0000);
        assert_eq!(G3_4K.next_seg(VirtualAddress::new(0x3_F000)).as_u32(), 0x4_0000);
        assert_eq!(G2_4K.next_seg(VirtualAddress::new(0xFFFF_F000)).as_u32(), 0);
        assert_eq!(G2_4K.ptpage_va_size(), 4 << 20);
        assert_eq!(G2_8K.ptpage_va_size(), 16 << 20);
        assert_eq!(G2_4K.round_ptpage(VirtualAddress::new(1)).as_u32(), 4 << 20);
    }

    #[test]
    fn tc_bits_are_consistent() {
        for g in [G2_4K, G2_8K, G3_4K, G3_8K] {
            assert!(g.tc51().is_consistent(), "{g:?}");
        }
        assert_eq!(G2_4K.tc51().into_bits(), 0x82C0_AA00);
        assert_eq!(G3_8K.tc51().tic(), 5);
        assert_eq!(
            G3_4K.translation_control(MmuClass::M68040),
            Some(TranslationControl::Tcr40(Tcr40::for_page_size(PageSize::Size4K)))
        );
        assert_eq!(G2_4K.translation_control(MmuClass::Hp), None);
    }

    #[test]
    fn root_loaders() {
        let pa = PhysicalAddress::new(0x0010_0000);
        assert_eq!(RootLoader::Crp51.root(pa).table(), pa);
        assert_eq!(RootLoader::HpStp.root(pa), UserRoot::HpSegmentTable(pa));
    }
}
