//! Machine configuration handed to the pmap at bootstrap.

use crate::mmu::{MmuClass, RootLoader};
use kernel_memory_addresses::PageSize;
use utils_accessors_derive::{Getters, Setters};

/// The MMU present in the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MmuType {
    M68851,
    M68030,
    M68040,
    M68060,
    Hp,
}

/// The CPU present in the machine.
///
/// A 68060 is frequently reported with [`MmuType::M68040`]; the CPU type
/// decides which root pointer loader is used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuType {
    M68020,
    M68030,
    M68040,
    M68060,
}

/// Errors detected while selecting the MMU class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{mmu:?} MMU does not support {page_size} pages")]
    UnsupportedMmu { mmu: MmuType, page_size: PageSize },
    #[error("no user root loader for a {cpu:?} with a {mmu:?} MMU")]
    NoRootLoader { cpu: CpuType, mmu: MmuType },
    #[error("VAC size {0:#x} is not a power of two")]
    BadVacSize(u32),
}

/// Static configuration of a [`PmapSystem`](crate::PmapSystem).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters, Getters)]
pub struct PmapConfig {
    mmu_type: MmuType,
    cpu_type: CpuType,
    page_size: PageSize,
    /// Live PV entries beyond which non-blocking allocations fail.
    pv_capacity: usize,
    /// Size of the virtually-addressed cache (HP MMU only).
    vac_size: Option<u32>,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            mmu_type: MmuType::M68040,
            cpu_type: CpuType::M68040,
            page_size: PageSize::Size4K,
            pv_capacity: 4096,
            vac_size: None,
        }
    }
}

impl PmapConfig {
    #[must_use]
    pub const fn class(&self) -> MmuClass {
        MmuClass::of(self.mmu_type)
    }

    /// Chooses how the user root table is loaded.
    ///
    /// # Errors
    /// If the MMU cannot run with the configured page size, or no loader
    /// matches the CPU.
    pub const fn root_loader(&self) -> Result<RootLoader, ConfigError> {
        match self.class() {
            MmuClass::M68851 => Ok(RootLoader::Crp51),
            MmuClass::M68040 => match self.cpu_type {
                CpuType::M68040 => Ok(RootLoader::Urp40),
                CpuType::M68060 => Ok(RootLoader::Urp60),
                cpu => Err(ConfigError::NoRootLoader {
                    cpu,
                    mmu: self.mmu_type,
                }),
            },
            MmuClass::Hp => match self.page_size {
                PageSize::Size4K => Ok(RootLoader::HpStp),
                page_size => Err(ConfigError::UnsupportedMmu {
                    mmu: self.mmu_type,
                    page_size,
                }),
            },
        }
    }

    /// Checks the whole configuration.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub const fn validate(&self) -> Result<RootLoader, ConfigError> {
        if let Some(size) = self.vac_size
            && !size.is_power_of_two()
        {
            return Err(ConfigError::BadVacSize(size));
        }
        self.root_loader()
    }
}
