//! # Page Table Entries
//!
//! One 32-bit layout serves all three MMU classes. The 68040 format is the
//! richest; the 68851 and HP formats agree with it on every bit the pmap
//! cares about, and the bits they lack are free for software use:
//!
//! ```text
//!  31                  12 11  10  9 8  7   6 5   4   3   2   1 0
//! +----------------------+---+---+----+---+-----+---+---+---+-----+
//! |  page frame address  |WIR|PVL| UA | S | CM  | M | U |WP | PDT |
//! +----------------------+---+---+----+---+-----+---+---+---+-----+
//! ```
//!
//! | Field | 68040 meaning        | 68851 / HP meaning         | pmap use            |
//! |:------|:---------------------|:---------------------------|:--------------------|
//! | PDT   | resident             | DT = page descriptor       | valid               |
//! | WP    | write protect        | write protect              | read-only           |
//! | CM    | cache mode           | bit 6: cache inhibit (CI)  | cacheability        |
//! | PVL   | global (unused)      | unused                     | managed (has a PV)  |
//! | WIR   | user reserved        | unused                     | wired               |
//!
//! The CI bit of the 68851 is bit 6, which is set for both cache-inhibited
//! modes of the 68040, so one test serves every class.
//!
//! Entries are read and written through [`PteCell`] with relaxed atomics.
//! Updates that must not lose hardware-maintained U/M bits use
//! compare-and-swap.

use crate::mmu::MmuClass;
use crate::prot::{EnterFlags, Protection};
use bitfield_struct::bitfield;
use core::ops::{BitAnd, BitOr, BitXor, Not};
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::PhysicalAddress;

/// Cache mode field of a 68040 PTE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CacheMode {
    WriteThrough = 0,
    CopyBack = 1,
    /// Cache-inhibited, serialized accesses. Same bit pattern as the 68851 CI bit.
    NoCacheSerialized = 2,
    NoCache = 3,
}

impl CacheMode {
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::WriteThrough,
            1 => Self::CopyBack,
            2 => Self::NoCacheSerialized,
            _ => Self::NoCache,
        }
    }
}

/// A page table entry.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Pte {
    /// Bit 0 — resident (68040 PDT) / page descriptor (68851 DT).
    pub resident: bool,

    /// Bit 1 — indirect descriptor (never used by the pmap).
    pub indirect: bool,

    /// Bit 2 — WP: write protected.
    pub write_protect: bool,

    /// Bit 3 — U: used (referenced), set by the MMU.
    pub used: bool,

    /// Bit 4 — M: modified, set by the MMU.
    pub modified: bool,

    /// Bits 5–6 — CM: cache mode.
    #[bits(2, default = CacheMode::WriteThrough)]
    pub cache_mode: CacheMode,

    /// Bit 7 — S: supervisor only.
    pub supervisor: bool,

    /// Bits 8–9 — U0/U1: user page attributes.
    #[bits(2)]
    pub user_attrs: u8,

    /// Bit 10 — software: mapping is on a PV list.
    pub pvlist: bool,

    /// Bit 11 — software: mapping is wired.
    pub wired: bool,

    /// Bits 12–31 — page frame address.
    #[bits(20)]
    pub frame: u32,
}

impl Pte {
    pub const EMPTY: Self = Self::new();
    pub const VALID: Self = Self::new().with_resident(true);
    pub const WP: Self = Self::new().with_write_protect(true);
    pub const U: Self = Self::new().with_used(true);
    pub const M: Self = Self::new().with_modified(true);
    pub const UM: Self = Self::from_bits(Self::U.into_bits() | Self::M.into_bits());
    pub const PVLIST: Self = Self::new().with_pvlist(true);
    pub const WIRED: Self = Self::new().with_wired(true);
    /// The whole cache mode field.
    pub const CMASK: Self = Self::new().with_cache_mode(CacheMode::NoCache);
    /// 68851 / HP cache inhibit; also the "inhibited" bit of both 68040 NC modes.
    pub const CI: Self = Self::new().with_cache_mode(CacheMode::NoCacheSerialized);
    pub const CM_WT: Self = Self::EMPTY;
    pub const CM_CB: Self = Self::new().with_cache_mode(CacheMode::CopyBack);
    pub const CM_NC_SER: Self = Self::CI;
    /// Bits whose change requires an ATC (and possibly cache) flush.
    pub const CRIT_BITS: Self = Self::from_bits(Self::WP.into_bits() | Self::CMASK.into_bits());
    pub const FRAME: Self = Self::from_bits(0xFFFF_F000);

    /// Entry mapping `pa` with no other bits.
    #[inline]
    #[must_use]
    pub const fn for_pa(pa: PhysicalAddress) -> Self {
        Self::from_bits(pa.as_u32() & Self::FRAME.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn pa(self) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & Self::FRAME.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.resident()
    }

    /// Whether the mapping is cache-inhibited (any class).
    #[inline]
    #[must_use]
    pub const fn is_ci(self) -> bool {
        self.into_bits() & Self::CI.into_bits() != 0
    }

    /// Whether any of the bits in `mask` are set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, mask: Self) -> bool {
        self.into_bits() & mask.into_bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }
}

impl BitOr for Pte {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

impl BitAnd for Pte {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() & rhs.into_bits())
    }
}

impl BitXor for Pte {
    type Output = Self;
    fn bitxor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() ^ rhs.into_bits())
    }
}

impl Not for Pte {
    type Output = Self;
    fn not(self) -> Self {
        Self::from_bits(!self.into_bits())
    }
}

/// Segment table entry pointing at a table: `U | DT_SHORT`.
///
/// Bit 3 is "used" on the 68851 and 68040 and reserved-at-one on the HP MMU;
/// bit 1 is `DT_SHORT` / `UTE_RESIDENT`.
pub const STE_PROTO: u32 = 0x8 | 0x2;

/// Builds a segment table entry for a table at `pa`.
#[inline]
#[must_use]
pub const fn make_ste(pa: PhysicalAddress) -> u32 {
    STE_PROTO | pa.as_u32()
}

/// Whether a segment table entry is valid (68851 `DT_SHORT`, 68040 `UDT`
/// resident).
#[inline]
#[must_use]
pub const fn ste_valid(ste: u32) -> bool {
    ste & 0x2 != 0
}

/// Physical location of a PTE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PteRef(pub PhysicalAddress);

impl PteRef {
    /// The entry `n` slots further on.
    #[inline]
    #[must_use]
    pub const fn offset(self, n: u32) -> Self {
        Self(PhysicalAddress::new(self.0.as_u32() + n * 4))
    }
}

/// Atomic view of one PTE in memory.
#[derive(Copy, Clone)]
pub struct PteCell<'a>(&'a AtomicU32);

impl<'a> PteCell<'a> {
    #[inline]
    #[must_use]
    pub const fn new(word: &'a AtomicU32) -> Self {
        Self(word)
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> Pte {
        Pte::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, pte: Pte) {
        self.0.store(pte.into_bits(), Ordering::Relaxed);
    }

    /// Replaces `old` with `new`; fails if the entry changed meanwhile.
    #[inline]
    #[must_use]
    pub fn update(&self, old: Pte, new: Pte) -> bool {
        self.0
            .compare_exchange(old.into_bits(), new.into_bits(), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Reads the word as a segment table entry.
    #[inline]
    #[must_use]
    pub fn load_ste(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_ste(&self, ste: u32) {
        self.0.store(ste, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(&self, bits: Pte) {
        self.0.fetch_or(bits.into_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn mask(&self, mask: Pte) {
        self.0.fetch_and(mask.into_bits(), Ordering::Relaxed);
    }
}

/// Prototype PTEs for the selected MMU class.
#[derive(Debug, Clone)]
pub struct PteEngine {
    is_68040: bool,
    proto: [Pte; 8],
    proto_ci: [Pte; 8],
    proto_um: [Pte; 8],
}

impl PteEngine {
    /// Builds the prototype tables for `class`, indexed by protection.
    #[must_use]
    pub fn new(class: MmuClass) -> Self {
        let is_68040 = class.is_68040();
        let (ro_c, rw_c, ci) = if is_68040 {
            (Pte::CM_WT, Pte::CM_CB, Pte::CM_NC_SER)
        } else {
            (Pte::EMPTY, Pte::EMPTY, Pte::CI)
        };

        let mut proto = [Pte::EMPTY; 8];
        let mut proto_ci = [Pte::EMPTY; 8];
        let mut proto_um = [Pte::EMPTY; 8];
        for bits in 1..=Protection::all().bits() {
            let prot = Protection::from_bits_truncate(bits);
            let (prot_bits, um) = if prot.contains(Protection::WRITE) {
                (Pte::EMPTY, Pte::UM)
            } else {
                (Pte::WP, Pte::U)
            };
            let c = if prot.contains(Protection::WRITE) { rw_c } else { ro_c };
            let i = prot.index();
            proto[i] = Pte::VALID | prot_bits | c;
            proto_ci[i] = Pte::VALID | prot_bits | ci;
            proto_um[i] = um;
        }

        Self {
            is_68040,
            proto,
            proto_ci,
            proto_um,
        }
    }

    /// Builds a PTE mapping `pa`.
    ///
    /// The access bits of `flags` pre-set U/M; `NOCACHE` selects the
    /// cache-inhibited prototypes; `WIRED` sets the wired bit. The managed
    /// bit is left to the PV layer.
    #[must_use]
    pub fn make(&self, pa: PhysicalAddress, prot: Protection, flags: EnterFlags) -> Pte {
        debug_assert!(!prot.is_empty(), "mapping without access");
        let table = if flags.contains(EnterFlags::NOCACHE) {
            &self.proto_ci
        } else {
            &self.proto
        };
        let mut pte = Pte::for_pa(pa) | table[prot.index()] | self.proto_um[flags.access().index()];
        if flags.contains(EnterFlags::WIRED) {
            pte = pte | Pte::WIRED;
        }
        pte
    }

    /// New protection for an existing entry, keeping its cache inhibition.
    #[must_use]
    pub fn change_prot(&self, opte: Pte, prot: Protection) -> Pte {
        let table = if opte.is_ci() { &self.proto_ci } else { &self.proto };
        (opte & !Pte::CRIT_BITS) | table[prot.index()]
    }

    #[must_use]
    pub fn set_ci(&self, pte: Pte) -> Pte {
        (pte & !Pte::CMASK) | if self.is_68040 { Pte::CM_NC_SER } else { Pte::CI }
    }

    #[must_use]
    pub fn clr_ci(&self, pte: Pte) -> Pte {
        let pte = pte & !Pte::CMASK;
        if !self.is_68040 {
            pte
        } else if pte.write_protect() {
            pte | Pte::CM_WT
        } else {
            pte | Pte::CM_CB
        }
    }

    /// Wired boot-time prototypes: read-only, read-write, read-write CI.
    #[must_use]
    pub const fn boot_protos(class: MmuClass) -> (Pte, Pte, Pte) {
        let base = Pte::VALID.with_wired(true);
        if class.is_68040() {
            (
                base.with_write_protect(true).with_cache_mode(CacheMode::WriteThrough),
                base.with_cache_mode(CacheMode::CopyBack),
                base.with_cache_mode(CacheMode::NoCacheSerialized),
            )
        } else {
            (
                base.with_write_protect(true),
                base,
                base.with_cache_mode(CacheMode::NoCacheSerialized),
            )
        }
    }
}
