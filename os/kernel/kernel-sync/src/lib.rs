//! # Kernel synchronization primitives
//!
//! The m68k kernels this workspace targets are uniprocessor. Mutual exclusion
//! for VM data structures is therefore obtained by blocking preemption (raising
//! the interrupt priority level to the VM level) rather than by spinning on a
//! lock word. [`CriticalSection`] is the bookkeeping half of that scheme.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod critical;

pub use critical::{CriticalSection, Suspended};
