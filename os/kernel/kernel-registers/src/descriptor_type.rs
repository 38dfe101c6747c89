/// DT — 68851 descriptor type (bits 0–1 of every descriptor).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorType {
    /// The walk stops with an invalid translation.
    Invalid = 0,
    /// Page descriptor (the walk stops and maps a page).
    Page = 1,
    /// The entry points to a table of short (4-byte) descriptors.
    Short = 2,
    /// The entry points to a table of long (8-byte) descriptors.
    Long = 3,
}

impl DescriptorType {
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::Invalid,
            1 => Self::Page,
            2 => Self::Short,
            _ => Self::Long,
        }
    }

    /// Extract the descriptor type of a raw 32-bit descriptor.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(descriptor: u32) -> Self {
        Self::from_bits((descriptor & 0b11) as u8)
    }
}
