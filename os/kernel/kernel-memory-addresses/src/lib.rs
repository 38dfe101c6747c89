//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses used by the m68k
//! paging and memory management code.
//!
//! ## Overview
//!
//! The m68k family has a flat 32-bit address space, both virtually and
//! physically. This crate prevents mixing virtual and physical addresses at
//! compile time while remaining a zero-cost wrapper around `u32` values.
//!
//! | Type | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | Refers to virtual (MMU translated) memory. |
//! | [`PhysicalAddress`] | Refers to physical memory or device registers. |
//!
//! ## Page Sizes
//!
//! Unlike x86-64, the base page size is a property of the machine and is
//! selected at boot: the MMU translation control register is programmed for
//! either 4 KiB or 8 KiB pages. [`PageSize`] is therefore a runtime value,
//! not a type parameter.
//!
//! - [`PageSize::Size4K`] — 4 KiB pages (68040/68060, most 68030 machines)
//! - [`PageSize::Size8K`] — 8 KiB pages (Sun-3x style 68030 configurations)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let ps = PageSize::Size4K;
//! let va = VirtualAddress::new(0x0001_2345);
//!
//! assert_eq!(va.trunc_page(ps).as_u32(), 0x0001_2000);
//! assert_eq!(va.round_page(ps).as_u32(), 0x0001_3000);
//! assert_eq!(va.page_offset(ps), 0x345);
//! ```
//!
//! ## Arithmetic
//!
//! Addition wraps at 4 GiB the same way the address bus does. Code that walks
//! up to the very top of the address space (the kernel page table window
//! usually ends there) relies on `0xFFFF_F000 + 0x1000 == 0`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use crate::memory_address::MemoryAddress;
pub use crate::page_size::PageSize;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;
