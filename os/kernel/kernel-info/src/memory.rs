//! # Memory Layout

use kernel_memory_addresses::{PageSize, VirtualAddress};

/// Start of kernel virtual address space.
///
/// The kernel shares the address space layout with a 0-based link address;
/// user and supervisor spaces are separate on m68k, so both start at 0.
pub const VM_MIN_KERNEL_ADDRESS: u32 = 0;

/// Start of user virtual address space.
pub const VM_MIN_ADDRESS: u32 = 0;

/// Default size of the lwp0 u-area (PCB and kernel stack).
pub const DEFAULT_USPACE: u32 = 8 * 1024;

/// Default size of the kernel message buffer.
pub const DEFAULT_MSGBUFSIZE: u32 = 8 * 1024;

/// Size in bytes of one page table entry.
pub const PTE_SIZE: u32 = 4;

/// Last kernel virtual address the pmap may hand out: one page below the end
/// of the 4 GiB address space.
#[inline]
#[must_use]
pub const fn kernel_max_address(ps: PageSize) -> VirtualAddress {
    VirtualAddress::new(0u32.wrapping_sub(ps.bytes()))
}

/// Size of the linear array of kernel PTEs covering all of the 4 GiB space.
///
/// `(4 GiB / page size) * sizeof(PTE)`, computed without 64-bit math:
/// 4 MiB with 4 KiB pages, 2 MiB with 8 KiB pages.
#[inline]
#[must_use]
pub const fn sysmap_size(ps: PageSize) -> u32 {
    ((u32::MAX >> ps.shift()) + 1) * PTE_SIZE
}

const _: () = {
    assert!(DEFAULT_USPACE.is_multiple_of(8192));
    assert!(DEFAULT_MSGBUFSIZE.is_multiple_of(4096));
    assert!(VM_MIN_KERNEL_ADDRESS == VM_MIN_ADDRESS);
    assert!(sysmap_size(PageSize::Size4K) == 4 * 1024 * 1024);
    assert!(sysmap_size(PageSize::Size8K) == 2 * 1024 * 1024);
};
