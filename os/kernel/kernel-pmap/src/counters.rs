//! # Event Counters
//!
//! Cheap, always-on instrumentation of the interesting code paths. The
//! counters are plain integers: all updates happen inside the VM critical
//! section of a single CPU.

/// Event counters of a [`PmapSystem`](crate::PmapSystem).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counters {
    /// Leaf table lookups satisfied by the last-used cache.
    pub pt_cache_hit: u64,
    /// Leaf table lookups that went to the index.
    pub pt_cache_miss: u64,

    /// PV entries allocated without waiting.
    pub pv_alloc_nowait: u64,
    /// PV entries allocated with waiting allowed.
    pub pv_alloc_wait: u64,

    pub pv_enter_called: u64,
    /// New mapping was cache-inhibited at the caller's request.
    pub pv_enter_usr_ci: u64,
    /// New mapping created a cache alias in a virtually-addressed cache.
    pub pv_enter_vac_ci: u64,
    /// Existing mappings rewritten because a page became cache-inhibited.
    pub pv_enter_ci_multi: u64,
    pub pv_remove_called: u64,
    /// PV removals from a cache-inhibited page.
    pub pv_remove_ci: u64,

    /// `enter` found a valid mapping at the address.
    pub enter_valid: u64,
    pub enter_wire_change: u64,
    pub enter_prot_change: u64,
    pub enter_pa_change: u64,
    /// `enter` reused the PV entry released by a replaced mapping.
    pub enter_pv_recycle: u64,

    pub nkptpages_initial: u64,
    pub nkptpages_current: u64,
    pub nkstpages_initial: u64,
    pub nkstpages_current: u64,

    pub prefer_change: u64,
    pub prefer_nochange: u64,

    /// Current end of mappable kernel virtual space.
    pub maxkva: u32,
    /// Absolute limit of kernel virtual space.
    pub kvalimit: u32,
}
