use core::fmt;

/// Base page size of the machine.
///
/// The MMU supports several page sizes but a kernel build runs with exactly
/// one, chosen when the translation control register is programmed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum PageSize {
    /// 4 KiB page (4096 bytes).
    #[default]
    Size4K,
    /// 8 KiB page (8192 bytes).
    Size8K,
}

impl PageSize {
    /// log2 of the page size, i.e. the number of low bits used for the offset.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size8K => 13,
        }
    }

    /// Page size in bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u32 {
        1 << self.shift()
    }

    /// Mask of the in-page offset bits.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u32 {
        self.bytes() - 1
    }

    /// Page size for the given shift, if supported.
    #[must_use]
    pub const fn from_shift(shift: u32) -> Option<Self> {
        match shift {
            12 => Some(Self::Size4K),
            13 => Some(Self::Size8K),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size8K => "8K",
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}
