use crate::Machine;
use crate::ptpage::PtPage;
use crate::pv::PvId;
use crate::system::PmapSystem;
use alloc::vec::Vec;

/// Resources released by an operation, given back once it leaves the
/// critical section.
#[derive(Debug, Default)]
pub struct Completion {
    pub(crate) ptpages: Vec<PtPage>,
    pub(crate) pvs: Vec<PvId>,
}

impl Completion {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ptpages: Vec::new(),
            pvs: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptpages.is_empty() && self.pvs.is_empty()
    }

    /// PT pages waiting to be freed.
    #[must_use]
    pub fn ptpages(&self) -> &[PtPage] {
        &self.ptpages
    }
}

impl<M: Machine> PmapSystem<M> {
    /// Frees everything collected in `done`.
    pub(crate) fn finish(&mut self, done: Completion) {
        self.crit.assert_sleepable();
        for page in &done.ptpages {
            self.ptpage_free(page);
        }
        for pv in done.pvs {
            self.pvs.free(pv);
        }
    }
}
