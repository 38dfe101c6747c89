//! Protection and mapping flags.

bitflags::bitflags! {
    /// Access protection of a mapping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Protection: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Protection {
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Index into the prototype PTE tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.bits() as usize
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`PmapSystem::enter`](crate::PmapSystem::enter) and
    /// [`PmapSystem::kenter_pa`](crate::PmapSystem::kenter_pa).
    ///
    /// The low three bits carry the access type that caused the mapping to
    /// be entered (same layout as [`Protection`]). They seed the
    /// referenced/modified bits of the new PTE.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct EnterFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const EXEC     = 1 << 2;
        /// Mapping is wired (never paged out).
        const WIRED    = 1 << 4;
        /// Mapping is cache-inhibited.
        const NOCACHE  = 1 << 5;
        /// Return an error instead of waiting for memory.
        const CAN_FAIL = 1 << 6;
    }
}

impl EnterFlags {
    /// The access type part of the flags.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn access(self) -> Protection {
        Protection::from_bits_truncate((self.bits() & 0b111) as u8)
    }
}

impl From<Protection> for EnterFlags {
    fn from(prot: Protection) -> Self {
        Self::from_bits_truncate(u32::from(prot.bits()))
    }
}

bitflags::bitflags! {
    /// Properties of an existing mapping, see
    /// [`PmapSystem::extract_info`](crate::PmapSystem::extract_info).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MappingFlags: u8 {
        const WIRED   = 1 << 0;
        const NOCACHE = 1 << 1;
    }
}
