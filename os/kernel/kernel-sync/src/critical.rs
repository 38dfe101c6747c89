/// Nesting counter for a non-preemptible section.
///
/// `CriticalSection` tracks how deeply the current code path has entered the
/// VM critical section. Entering raises the nesting depth, exiting lowers it;
/// the section is held while the depth is non-zero.
///
/// Code that may sleep (page allocation with waiting allowed, for example)
/// must not do so while the section is held. [`unlocked`](Self::unlocked)
/// temporarily drops the section around such a call and re-enters it
/// afterward, restoring the previous depth. Anything observed before the call
/// must be revalidated by the caller once it returns.
///
/// # Platform
///
/// The type carries no hardware state. The owner is expected to pair
/// [`enter`](Self::enter) / [`exit`](Self::exit) with its interrupt priority
/// handling where such a thing exists.
///
/// # Examples
///
/// ```
/// use kernel_sync::CriticalSection;
///
/// let mut crit = CriticalSection::new();
/// crit.enter();
/// assert!(crit.is_held());
///
/// let slept = crit.unlocked(|| {
///     // may block here
///     true
/// });
/// assert!(slept);
/// assert!(crit.is_held());
///
/// crit.exit();
/// assert!(!crit.is_held());
/// ```
#[derive(Debug, Default)]
pub struct CriticalSection {
    depth: u32,
}

impl CriticalSection {
    #[must_use]
    pub const fn new() -> Self {
        Self { depth: 0 }
    }

    /// Enters (or nests into) the section.
    #[inline]
    pub const fn enter(&mut self) {
        self.depth += 1;
    }

    /// Leaves one nesting level.
    ///
    /// # Panics
    /// If the section is not held.
    #[inline]
    pub fn exit(&mut self) {
        assert!(self.depth > 0, "critical section exit without enter");
        self.depth -= 1;
    }

    #[inline]
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.depth > 0
    }

    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Debug check that the section is currently held.
    #[inline]
    pub fn assert_held(&self) {
        debug_assert!(self.is_held(), "not in critical section");
    }

    /// Debug check that the caller may block.
    #[inline]
    pub fn assert_sleepable(&self) {
        debug_assert!(!self.is_held(), "may not block in critical section");
    }

    /// Leaves the section completely, remembering the depth.
    ///
    /// Pair with [`resume`](Self::resume). Use this when the code that may
    /// block needs the owner of the section mutably and cannot be expressed
    /// as a closure passed to [`unlocked`](Self::unlocked).
    #[inline]
    #[must_use = "the section must be resumed"]
    pub const fn suspend(&mut self) -> Suspended {
        let depth = self.depth;
        self.depth = 0;
        Suspended { depth }
    }

    /// Re-enters the section at the depth saved by [`suspend`](Self::suspend).
    #[inline]
    pub fn resume(&mut self, saved: Suspended) {
        debug_assert_eq!(self.depth, 0, "resumed with the section held");
        self.depth = saved.depth;
    }

    /// Runs `f` outside the section, then re-enters at the previous depth.
    ///
    /// Calling this without holding the section just runs `f`.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let saved = self.suspend();
        let r = f();
        self.resume(saved);
        r
    }
}

/// Depth of a [`CriticalSection`] while it is suspended.
#[derive(Debug)]
pub struct Suspended {
    depth: u32,
}
