use bitfield_struct::bitfield;
use kernel_memory_addresses::PageSize;

/// TCR — 68040 / 68060 Translation Control register.
///
/// The table layout of these MMUs is fixed (7/7/x); only the page size is
/// selectable.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Tcr40 {
    /// Bits 0–13 — Reserved on the 68040 (68060 cache mode defaults live here).
    #[bits(14)]
    pub reserved: u16,

    /// Bit 14 — P: page size (0 = 4 KiB, 1 = 8 KiB).
    pub p: bool,

    /// Bit 15 — E: translation enabled.
    pub enable: bool,
}

impl Tcr40 {
    /// Enabled TCR for the given page size.
    #[must_use]
    pub const fn for_page_size(ps: PageSize) -> Self {
        Self::new()
            .with_enable(true)
            .with_p(matches!(ps, PageSize::Size8K))
    }
}
