//! # Typed m68k MMU Registers
//!
//! Bit layouts of the memory management registers of the 68851 PMMU (and the
//! compatible on-chip MMU of the 68030) and of the 68040/68060 MMU.
//!
//! | Register | CPU | Width | Type |
//! |----------|-----|-------|------|
//! | TC (translation control) | 68851 / 68030 | 32 | [`Tc51`] |
//! | CRP / SRP (root pointers) | 68851 / 68030 | 64 | [`RootPointer51`] |
//! | TCR (translation control) | 68040 / 68060 | 16 | [`Tcr40`] |
//!
//! The 68040 URP/SRP registers hold a bare, 512-byte aligned table address
//! and need no layout of their own.
//!
//! Table descriptors of the 68851 family carry a two-bit descriptor type in
//! their low bits; [`DescriptorType`] names the four encodings. Page and
//! table descriptors written by the pmap use the *short* (32-bit) format
//! exclusively.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod descriptor_type;
pub use descriptor_type::DescriptorType;

#[cfg(feature = "mc68851")]
mod root_pointer51;
#[cfg(feature = "mc68851")]
mod tc51;

#[cfg(feature = "mc68040")]
mod tcr40;

#[cfg(feature = "mc68851")]
pub use root_pointer51::RootPointer51;
#[cfg(feature = "mc68851")]
pub use tc51::Tc51;
#[cfg(feature = "mc68040")]
pub use tcr40::Tcr40;
