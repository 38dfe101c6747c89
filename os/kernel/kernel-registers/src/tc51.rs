use bitfield_struct::bitfield;

/// TC — 68851 / 68030 Translation Control register.
///
/// Describes how a logical address is split: `IS` upper bits are ignored,
/// `TIA`..`TID` bits index up to four table levels, and the remaining `PS`
/// bits are the page offset. A zero `TIx` field terminates the walk early.
/// The fields must add up to 32.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Tc51 {
    /// Bits 0–3 — TID: index bits for table level D.
    #[bits(4)]
    pub tid: u8,

    /// Bits 4–7 — TIC: index bits for table level C.
    #[bits(4)]
    pub tic: u8,

    /// Bits 8–11 — TIB: index bits for table level B.
    #[bits(4)]
    pub tib: u8,

    /// Bits 12–15 — TIA: index bits for table level A (the root table).
    #[bits(4)]
    pub tia: u8,

    /// Bits 16–19 — IS: number of ignored upper address bits.
    #[bits(4)]
    pub is: u8,

    /// Bits 20–23 — PS: log2 of the page size.
    #[bits(4)]
    pub ps: u8,

    /// Bit 24 — FCL: function code lookup (use FC as the first level index).
    pub fcl: bool,

    /// Bit 25 — SRE: supervisor accesses translate through the SRP.
    pub sre: bool,

    /// Bits 26–30 — Reserved (must be 0).
    #[bits(5)]
    pub reserved: u8,

    /// Bit 31 — E: translation enabled.
    pub enable: bool,
}

impl Tc51 {
    /// Build an enabled TC value with SRE set for the given index split.
    ///
    /// Unused trailing levels are passed as `0`.
    #[must_use]
    pub const fn for_walk(page_shift: u8, tia: u8, tib: u8, tic: u8) -> Self {
        Self::new()
            .with_enable(true)
            .with_sre(true)
            .with_ps(page_shift)
            .with_tia(tia)
            .with_tib(tib)
            .with_tic(tic)
    }

    /// Index widths in walk order, stopping at the first zero field.
    #[must_use]
    pub fn levels(&self) -> impl Iterator<Item = u8> {
        [self.tia(), self.tib(), self.tic(), self.tid()]
            .into_iter()
            .take_while(|&n| n != 0)
    }

    /// Returns `true` if all fields add up to 32 bits.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let sum: u32 = self.levels().map(u32::from).sum::<u32>()
            + u32::from(self.is())
            + u32::from(self.ps());
        sum == 32
    }
}
