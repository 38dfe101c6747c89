use crate::DescriptorType;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CRP / SRP — 68851 / 68030 root pointer (64-bit long-format descriptor).
///
/// The upper long word carries limit and descriptor type, the lower long word
/// holds the physical address of the root table.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RootPointer51 {
    /// Bits 0–3 — Reserved in the address word (table is 16-byte aligned).
    #[bits(4)]
    pub reserved0: u8,

    /// Bits 4–31 — Root table physical address >> 4.
    #[bits(28)]
    table_16: u32,

    /// Bits 32–33 — DT: type of the descriptors in the root table.
    #[bits(2, default = DescriptorType::Invalid)]
    pub dt: DescriptorType,

    /// Bits 34–40 — Reserved.
    #[bits(7)]
    pub reserved1: u8,

    /// Bit 41 — SG: shared globally (68851 only).
    pub sg: bool,

    /// Bits 42–47 — Reserved.
    #[bits(6)]
    pub reserved2: u8,

    /// Bits 48–62 — LIMIT: index limit for the root table.
    #[bits(15)]
    pub limit: u16,

    /// Bit 63 — L/U: `limit` is a lower limit (0 means no limit).
    pub lower: bool,
}

impl RootPointer51 {
    /// User (CPU) root pointer to a table of short descriptors, no limit.
    #[must_use]
    pub fn crp(table: PhysicalAddress) -> Self {
        Self::new()
            .with_lower(true)
            .with_dt(DescriptorType::Short)
            .with_table(table)
    }

    /// Supervisor root pointer to a table of short descriptors, no limit,
    /// shared globally.
    #[must_use]
    pub fn srp(table: PhysicalAddress) -> Self {
        Self::crp(table).with_sg(true)
    }

    #[must_use]
    pub fn with_table(self, table: PhysicalAddress) -> Self {
        debug_assert_eq!(table.as_u32() & 0xF, 0, "root table must be 16-byte aligned");
        self.with_table_16(table.as_u32() >> 4)
    }

    #[must_use]
    pub const fn table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.table_16() << 4)
    }

    /// The limit/type long word as stored in memory (first word).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn upper_word(&self) -> u32 {
        (self.into_bits() >> 32) as u32
    }

    /// The table address long word (second word).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn lower_word(&self) -> u32 {
        self.into_bits() as u32
    }
}
