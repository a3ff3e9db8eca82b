//! Call-site provenance attached to every tracked operation.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;

/// The source location an allocation event is attributed to.
///
/// Public tracker operations capture this automatically from their caller via
/// `#[track_caller]`. The `*_at()` family of operations accepts an explicit value instead,
/// which is what instrumentation layers use when they have their own notion of a call site.
///
/// # Examples
///
/// ```
/// use leak_tracker::Site;
///
/// let site = Site::new("parser.rs", 42);
/// assert_eq!(site.file(), "parser.rs");
/// assert_eq!(site.line(), 42);
/// assert_eq!(site.to_string(), "parser.rs L42");
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Site {
    file: &'static str,
    line: u32,
}

impl Site {
    /// Provenance given to records that were patched into existence because a resize or
    /// release targeted an address the tracker had never seen.
    pub const UNTRACKED: Self = Self::new("<untracked origin>", 0);

    /// Provenance given to allocations arriving through the global allocator hook while no
    /// [`SiteScope`] is active on the allocating thread.
    pub const GLOBAL_ALLOCATOR: Self = Self::new("<global allocator>", 0);

    /// Creates a site from a file identifier and a line number.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The site of the caller of the function this is called from.
    ///
    /// Only meaningful inside `#[track_caller]` functions, where it resolves to the location
    /// of the outermost non-tracking caller.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }

    /// The source file identifier.
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.file
    }

    /// The line number within [`file()`][Self::file].
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl From<&'static Location<'static>> for Site {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} L{}", self.file, self.line)
    }
}

thread_local! {
    static CURRENT_SITE: Cell<Option<Site>> = const { Cell::new(None) };
}

/// Attributes allocations made through the global allocator hook on the current thread to a
/// specific source location, for as long as the scope is alive.
///
/// Scopes nest: dropping an inner scope restores the site of the outer one.
///
/// # Examples
///
/// ```
/// use leak_tracker::SiteScope;
///
/// {
///     let _scope = SiteScope::enter();
///     // Allocations through the hook on this thread are attributed to the line above.
///     let _data = vec![1_u8, 2, 3];
/// }
/// ```
#[derive(Debug)]
#[must_use = "allocations are only attributed to the site while the scope is alive"]
pub struct SiteScope {
    previous: Option<Site>,

    _single_threaded: PhantomData<*const ()>,
}

impl SiteScope {
    /// Enters a scope attributed to the caller's location.
    #[track_caller]
    pub fn enter() -> Self {
        Self::enter_at(Site::caller())
    }

    /// Enters a scope attributed to an explicit site.
    pub fn enter_at(site: Site) -> Self {
        let previous = CURRENT_SITE.with(|current| current.replace(Some(site)));

        Self {
            previous,
            _single_threaded: PhantomData,
        }
    }

    /// The site that the innermost active scope on this thread attributes allocations to.
    #[must_use]
    pub fn current() -> Option<Site> {
        // The thread-local may already be gone while the thread is being torn down and
        // its remaining destructors are still releasing memory.
        CURRENT_SITE.try_with(Cell::get).ok().flatten()
    }
}

impl Drop for SiteScope {
    fn drop(&mut self) {
        CURRENT_SITE.with(|current| current.set(self.previous));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(Site: Send, Sync, Copy);
    assert_not_impl_any!(SiteScope: Send, Sync);

    #[track_caller]
    fn capture() -> Site {
        Site::caller()
    }

    #[test]
    fn caller_resolves_to_call_site() {
        let expected_line = line!() + 1;
        let site = capture();

        assert_eq!(site.file(), file!());
        assert_eq!(site.line(), expected_line);
    }

    #[test]
    fn display_matches_diagnostic_format() {
        assert_eq!(Site::new("main.c", 17).to_string(), "main.c L17");
    }

    #[test]
    fn scopes_nest_and_restore() {
        assert_eq!(SiteScope::current(), None);

        let outer = SiteScope::enter_at(Site::new("outer.rs", 1));
        assert_eq!(SiteScope::current(), Some(Site::new("outer.rs", 1)));

        {
            let _inner = SiteScope::enter_at(Site::new("inner.rs", 2));
            assert_eq!(SiteScope::current(), Some(Site::new("inner.rs", 2)));
        }

        assert_eq!(SiteScope::current(), Some(Site::new("outer.rs", 1)));

        drop(outer);
        assert_eq!(SiteScope::current(), None);
    }

    #[test]
    fn scopes_are_per_thread() {
        let _scope = SiteScope::enter_at(Site::new("main_thread.rs", 3));

        let other = std::thread::spawn(SiteScope::current).join().unwrap();

        assert_eq!(other, None);
    }
}
