//! Global allocator hook that routes every heap allocation of the program through a tracker.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;

use crate::pal::{LibcAllocator, RawAllocator};
use crate::tracker::Caller;
use crate::{Site, SiteScope, Tracker};

/// A global allocator that records every allocation of the program in a [`Tracker`].
///
/// Allocations are attributed to the site of the innermost [`SiteScope`] active on the
/// allocating thread, or to [`Site::GLOBAL_ALLOCATOR`] if there is none. Requests made by the
/// tracker itself while it is doing its own bookkeeping are forwarded untracked, and the tracker
/// catches up with them once its bookkeeping is done. Since an allocation request cannot be
/// refused, the hook waits for a tracker that is busy on another thread.
///
/// Layouts with an alignment larger than the raw allocator guarantees are served by
/// [`System`] without being tracked.
///
/// The tracker should be created with [`Config::thread_safe()`][crate::Config::thread_safe]
/// enabled unless the program is truly single-threaded. Its per-operation lines should either be
/// disabled with [`Config::diagnostics()`][crate::Config::diagnostics] or sent to a file or
/// standard error. Writing them to standard output while other threads print can deadlock,
/// because printing may itself allocate while holding the standard output lock.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Allocator, Config, Tracker};
///
/// static TRACKER: Tracker =
///     Tracker::with_config(Config::new().thread_safe(true).diagnostics(false));
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator = Allocator::new(&TRACKER);
///
/// fn main() {
///     let data = vec![1_u8, 2, 3];
///     assert!(!TRACKER.snapshot_records().unwrap().is_empty());
///     drop(data);
/// }
/// ```
pub struct Allocator<B: RawAllocator = LibcAllocator> {
    tracker: &'static Tracker<B>,
}

impl<B: RawAllocator> Allocator<B> {
    /// Creates a hook that routes allocations through `tracker`.
    #[must_use]
    #[inline]
    pub const fn new(tracker: &'static Tracker<B>) -> Self {
        Self { tracker }
    }

    /// The tracker allocations are routed through.
    #[must_use]
    pub const fn tracker(&self) -> &'static Tracker<B> {
        self.tracker
    }

    #[inline]
    fn is_tracked(layout: Layout) -> bool {
        layout.align() <= B::MIN_ALIGN
    }
}

impl<B: RawAllocator> fmt::Debug for Allocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("tracker", &"<tracker>")
            .finish()
    }
}

#[inline]
fn current_site() -> Site {
    SiteScope::current().unwrap_or(Site::GLOBAL_ALLOCATOR)
}

// SAFETY: Every block is served either by the raw allocator, whose contract guarantees
// `B::MIN_ALIGN` alignment and validity for the requested size, or by `System` for larger
// alignments. Which of the two serves a block depends only on its layout, and the layout is
// the same for every call concerning one block, so each block always goes back to the
// allocator it came from.
unsafe impl<B: RawAllocator> GlobalAlloc for Allocator<B> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !Self::is_tracked(layout) {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { System.alloc(layout) };
        }

        self.tracker
            .acquire_for(Caller::Hook, current_site(), layout.size())
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if !Self::is_tracked(layout) {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { System.alloc_zeroed(layout) };
        }

        self.tracker
            .zero_acquire_for(Caller::Hook, current_site(), 1, layout.size())
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !Self::is_tracked(layout) {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { System.realloc(ptr, layout, new_size) };
        }

        // SAFETY: The caller guarantees `ptr` was allocated by this allocator with `layout`,
        // which for a tracked layout means by the raw allocator.
        unsafe {
            self.tracker
                .resize_for(Caller::Hook, current_site(), ptr, new_size)
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !Self::is_tracked(layout) {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { System.dealloc(ptr, layout) };
            return;
        }

        // SAFETY: The caller guarantees `ptr` was allocated by this allocator with `layout`,
        // which for a tracked layout means by the raw allocator.
        unsafe {
            self.tracker
                .release_for(Caller::Hook, current_site(), ptr);
        }
    }
}
