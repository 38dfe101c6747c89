//! # Kernel Boot Information

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

bitflags::bitflags! {
    /// Flags of a [`BootMapEntry`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct BootMapFlags: u8 {
        /// `vaddr` is a fixed virtual address; otherwise the pmap allocates one.
        const FIXEDVA = 1 << 0;
        /// The range at `vaddr` must never be used for kernel virtual space.
        const KEEPOUT = 1 << 1;
        /// Only reserve virtual space; do not map anything.
        const VAONLY  = 1 << 2;
        /// Map cache-inhibited (device registers).
        const CI      = 1 << 3;
    }
}

/// One machine-specific mapping to establish while the MMU is still off.
///
/// Platform code uses these to reserve virtual windows for devices that must
/// be reachable right after translation is enabled (consoles, interrupt
/// controllers), or to fence off ranges that transparent translation
/// registers already cover.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BootMapEntry {
    /// Fixed virtual address (`FIXEDVA` / `KEEPOUT`), ignored otherwise.
    pub vaddr: VirtualAddress,
    /// Physical address to map.
    pub paddr: PhysicalAddress,
    /// Size in bytes (rounded up to whole pages).
    pub size: u32,
    pub flags: BootMapFlags,
}

impl BootMapEntry {
    /// A device window at a pmap-chosen virtual address.
    #[must_use]
    pub const fn device(paddr: PhysicalAddress, size: u32) -> Self {
        Self {
            vaddr: VirtualAddress::zero(),
            paddr,
            size,
            flags: BootMapFlags::CI,
        }
    }

    /// A range of kernel virtual space that must stay unused.
    #[must_use]
    pub const fn keep_out(vaddr: VirtualAddress) -> Self {
        Self {
            vaddr,
            paddr: PhysicalAddress::zero(),
            size: 0,
            flags: BootMapFlags::KEEPOUT,
        }
    }

    /// Whether the pmap has to assign this entry a virtual address.
    #[must_use]
    pub const fn needs_va(&self) -> bool {
        !self
            .flags
            .intersects(BootMapFlags::FIXEDVA.union(BootMapFlags::KEEPOUT))
    }

    /// Whether physical pages get mapped for this entry.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        !self
            .flags
            .intersects(BootMapFlags::VAONLY.union(BootMapFlags::KEEPOUT))
    }
}

/// Information the pmap needs from the startup code, before the MMU is on.
#[derive(Clone, Debug)]
pub struct BootParams<'a> {
    /// Virtual address of the first byte of kernel text.
    pub kernel_text: VirtualAddress,
    /// Virtual address just past the kernel text.
    pub etext: VirtualAddress,
    /// Physical address right after the loaded image (data, bss, symbols).
    pub nextpa: PhysicalAddress,
    /// Physical address at which kernel virtual address 0 was loaded.
    pub reloff: PhysicalAddress,
    /// Number of pages of physical memory.
    pub physmem: u32,
    /// Size of the lwp0 u-area.
    pub uspace: u32,
    /// Size of the kernel message buffer.
    pub msgbufsize: u32,
    /// Fixed high virtual address for the kernel PTE window, if any.
    pub sysmap_va: Option<VirtualAddress>,
    /// Machine-specific boot mappings.
    pub bootmap: &'a [BootMapEntry],
}
