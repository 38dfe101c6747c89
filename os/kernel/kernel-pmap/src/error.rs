use core::fmt;

/// The kind of object an allocation failed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Level-1 or inner segment table.
    SegmentTable,
    /// Leaf page table.
    PageTable,
    /// Reverse-mapping entry of a managed page.
    PvEntry,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SegmentTable => "segment table",
            Self::PageTable => "page table",
            Self::PvEntry => "pv entry",
        })
    }
}

/// Error returned by [`PmapSystem::enter`](crate::PmapSystem::enter).
///
/// Only returned when the caller allowed the mapping to fail
/// ([`EnterFlags::CAN_FAIL`](crate::EnterFlags::CAN_FAIL)); blocking
/// allocations never report failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnterError {
    #[error("out of memory ({0})")]
    OutOfMemory(Resource),
}
