/// Behavior switches of a [`Tracker`][crate::Tracker].
///
/// All setters are `const`, so a configuration can be built in a `static` initializer
/// alongside the tracker that uses it.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Config, Tracker};
///
/// static TRACKER: Tracker = Tracker::with_config(
///     Config::new()
///         .thread_safe(true)
///         .diagnostics(false)
///         .critical_output(false),
/// );
///
/// assert!(TRACKER.config().is_thread_safe());
/// assert!(!TRACKER.config().has_diagnostics());
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    thread_safe: bool,
    diagnostics: bool,
    critical_output: bool,
    purge_on_cleanup: bool,
    passthrough: bool,
}

impl Config {
    /// The default configuration: single-threaded, with diagnostics and warnings enabled,
    /// no purge on cleanup.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            thread_safe: false,
            diagnostics: true,
            critical_output: true,
            purge_on_cleanup: false,
            passthrough: false,
        }
    }

    /// Whether every operation is serialized by a lock so the tracker can be used from many
    /// threads at once.
    ///
    /// Without this, overlapping use from two threads is detected and the losing operation
    /// is abandoned with [`Error::ConcurrentAccess`][crate::Error::ConcurrentAccess].
    #[must_use]
    pub const fn thread_safe(mut self, enabled: bool) -> Self {
        self.thread_safe = enabled;
        self
    }

    /// Whether a diagnostic line is written to the output for every tracked operation.
    ///
    /// Reports are written regardless of this setting.
    #[must_use]
    pub const fn diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Whether warnings about resizing or releasing untracked addresses are written to
    /// standard error. These are written even when diagnostics are disabled.
    #[must_use]
    pub const fn critical_output(mut self, enabled: bool) -> Self {
        self.critical_output = enabled;
        self
    }

    /// Whether [`Tracker::cleanup()`][crate::Tracker::cleanup] releases every outstanding block
    /// before forgetting about it, as
    /// [`Tracker::purge_remaining()`][crate::Tracker::purge_remaining] does.
    ///
    /// # Safety
    ///
    /// When enabled, the caller takes on the safety requirements of
    /// [`Tracker::purge_remaining()`][crate::Tracker::purge_remaining] for every call to
    /// `cleanup()`: no block that is still outstanding at that point may be used or released
    /// afterwards.
    #[must_use]
    pub const unsafe fn purge_on_cleanup(mut self, enabled: bool) -> Self {
        self.purge_on_cleanup = enabled;
        self
    }

    /// Whether the tracker only forwards requests to the raw allocator without recording
    /// anything. Reports of a passthrough tracker are always balanced.
    #[must_use]
    pub const fn passthrough(mut self, enabled: bool) -> Self {
        self.passthrough = enabled;
        self
    }

    /// See [`thread_safe()`][Self::thread_safe].
    #[must_use]
    pub const fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// See [`diagnostics()`][Self::diagnostics].
    #[must_use]
    pub const fn has_diagnostics(&self) -> bool {
        self.diagnostics
    }

    /// See [`critical_output()`][Self::critical_output].
    #[must_use]
    pub const fn has_critical_output(&self) -> bool {
        self.critical_output
    }

    /// See [`purge_on_cleanup()`][Self::purge_on_cleanup].
    #[must_use]
    pub const fn is_purge_on_cleanup(&self) -> bool {
        self.purge_on_cleanup
    }

    /// See [`passthrough()`][Self::passthrough].
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.passthrough
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
