//! # Crash Dump Header
//!
//! What a post-mortem reader needs to translate kernel virtual addresses in
//! a memory image: the page size, the kernel base and the kernel table walk
//! described as a 68851 TC/SRP pair. The 68040 walk is expressed the same
//! way (7/7/6 or 7/7/5 bits), so one reader handles every MMU class.

use crate::Machine;
use crate::config::MmuType;
use crate::system::PmapSystem;
use kernel_info::memory::VM_MIN_KERNEL_ADDRESS;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::{RootPointer51, Tc51};

/// Errors translating an address through a dumped table walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KcoreError {
    #[error("{va} is not mapped (level {level})")]
    NotMapped { va: VirtualAddress, level: u8 },
    #[error("physical word at {0} is not in the dump")]
    Unreadable(PhysicalAddress),
    #[error("inconsistent translation control {0:#010x}")]
    BadTc(u32),
}

/// Machine-dependent part of a kernel crash dump header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KcoreHeader {
    pub page_size: u32,
    pub kernbase: VirtualAddress,
    pub mmu_type: MmuType,
    /// Walk of the kernel tables.
    pub tc: Tc51,
    /// Root of the kernel tables.
    pub srp: RootPointer51,
}

impl KcoreHeader {
    /// Translates a kernel virtual address, reading table words with
    /// `read_word`.
    ///
    /// # Errors
    /// If a descriptor on the way is invalid, a word cannot be read, or the
    /// header describes no usable walk.
    pub fn kva_to_pa(
        &self,
        va: VirtualAddress,
        read_word: impl Fn(PhysicalAddress) -> Option<u32>,
    ) -> Result<PhysicalAddress, KcoreError> {
        if !self.tc.is_consistent() {
            return Err(KcoreError::BadTc(self.tc.into_bits()));
        }
        let levels: [u8; 4] = [self.tc.tia(), self.tc.tib(), self.tc.tic(), self.tc.tid()];
        let depth = self.tc.levels().count();
        let page_mask = self.page_size - 1;

        let mut table = self.srp.table();
        let mut shift = 32 - u32::from(self.tc.is());
        for (level, &bits) in levels[..depth].iter().enumerate() {
            let bits = u32::from(bits);
            shift -= bits;
            let index = (va.as_u32() >> shift) & ((1 << bits) - 1);
            let at = table + index * 4;
            let desc = read_word(at).ok_or(KcoreError::Unreadable(at))?;
            #[allow(clippy::cast_possible_truncation)]
            let level = level as u8;

            if usize::from(level) + 1 == depth {
                if desc & 0x1 == 0 {
                    return Err(KcoreError::NotMapped { va, level });
                }
                return Ok(PhysicalAddress::new((desc & !page_mask) | (va.as_u32() & page_mask)));
            }

            if desc & 0x2 == 0 {
                return Err(KcoreError::NotMapped { va, level });
            }
            // The next table is aligned to its own size.
            let next = u32::from(levels[usize::from(level) + 1]);
            let next_size = (1u32 << next) * 4;
            table = PhysicalAddress::new(desc & !(next_size - 1));
        }
        Err(KcoreError::BadTc(self.tc.into_bits()))
    }
}

impl<M: Machine> PmapSystem<M> {
    /// Header describing the kernel address space for crash dumps.
    #[must_use]
    pub fn kcore_header(&self) -> KcoreHeader {
        KcoreHeader {
            page_size: self.geom.page_size().bytes(),
            kernbase: VirtualAddress::new(VM_MIN_KERNEL_ADDRESS),
            mmu_type: self.mmu_type,
            tc: self.geom.tc51(),
            srp: RootPointer51::srp(self.kernel.lev1_pa),
        }
    }
}
