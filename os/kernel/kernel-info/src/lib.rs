//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and boot interface
//! contracts shared between the early (MMU-off) startup code, the physical
//! map and the rest of the kernel.
//!
//! ## Overview
//!
//! On m68k the kernel is linked to run at virtual address
//! [`VM_MIN_KERNEL_ADDRESS`](memory::VM_MIN_KERNEL_ADDRESS) and grows
//! upward. The machine-dependent startup code loads the image somewhere in
//! physical memory, computes the relocation offset, and hands the pmap a
//! [`BootParams`](boot::BootParams) describing what it found. The pmap then
//! builds the initial kernel tables before the MMU is switched on.
//!
//! ### Boot Information ([`boot`])
//! * **Kernel image**: text and end-of-image addresses, relocation offset
//! * **Physical memory size**: number of pages of RAM
//! * **Machine boot map**: device windows and reserved ranges to map (or keep
//!   out of) kernel virtual space before the MMU is enabled
//!
//! ### Memory Layout ([`memory`])
//! * **Kernel base**: where kernel virtual space starts
//! * **Default sizes**: u-area and message buffer
//! * **Upper bound**: the last kernel virtual address the pmap may hand out
//!
//! ## Virtual Memory Architecture
//!
//! The kernel virtual address space is laid out bottom-up:
//!
//! ```text
//! Kernel Virtual Address Space (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐ VM_MIN_KERNEL_ADDRESS
//!             │       Kernel Text & Data        │
//!             ├─────────────────────────────────┤
//!             │ lwp0 u-area, level-1 table,     │
//!             │ scratch pages, message buffer   │
//!             ├─────────────────────────────────┤
//!             │   Kernel PTE window ("Sysmap")  │
//!             ├─────────────────────────────────┤ kernel_virtual_start
//!             │   Managed kernel virtual space  │
//!             ├─────────────────────────────────┤ kernel_virtual_end (grows)
//!             │                                 │
//! 0xFFFF_F000 └─────────────────────────────────┘ kernel_max_address()
//! ```
//!
//! Machines that need the PTE window at a high address (the hp300 family maps
//! its last RAM page at `$FFFF_F000`) may request a fixed window location via
//! [`BootParams::sysmap_va`](boot::BootParams::sysmap_va).
//!
//! ## Safety Guarantees
//!
//! * **No Unsafe Code**: Marked `#![deny(unsafe_code)]`
//! * **Compile-time checks**: Layout constants are validated with `const`
//!   assertions

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
