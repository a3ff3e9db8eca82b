use crate::pal::RawAllocator;

/// The C library `malloc` family, as provided by the platform the build is targeting.
///
/// This is the default raw allocator of a [`Tracker`][crate::Tracker]. Tests that need to
/// simulate allocator exhaustion wrap it rather than replace it, so all real memory still
/// comes from here.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcAllocator;

impl LibcAllocator {
    /// Creates a handle to the C library allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

// SAFETY: The C library allocator satisfies the trait contract on all supported platforms,
// with `MIN_ALIGN` matching the guarantee the standard library itself relies on for `malloc`.
// The only deviation from plain `realloc` (zero-size resize) is handled below.
unsafe impl RawAllocator for LibcAllocator {
    const MIN_ALIGN: usize = if cfg!(target_pointer_width = "64") {
        16
    } else {
        8
    };

    #[inline]
    fn acquire(&self, size: usize) -> *mut u8 {
        // SAFETY: No safety requirements.
        unsafe { libc::malloc(size) }.cast()
    }

    #[inline]
    fn zero_acquire(&self, count: usize, size: usize) -> *mut u8 {
        // SAFETY: No safety requirements; calloc checks the product for overflow itself.
        unsafe { libc::calloc(count, size) }.cast()
    }

    #[inline]
    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        // Some C libraries free the block and return null for a zero-size realloc, which
        // would be indistinguishable from failure. We always keep a real block instead.
        let new_size = new_size.max(1);

        // SAFETY: Forwarding the caller's guarantee that `ptr` is null or a live block
        // obtained from malloc/calloc/realloc.
        unsafe { libc::realloc(ptr.cast(), new_size) }.cast()
    }

    #[inline]
    unsafe fn release(&self, ptr: *mut u8) {
        // SAFETY: Forwarding the caller's guarantee that `ptr` is null or a live block
        // obtained from malloc/calloc/realloc.
        unsafe { libc::free(ptr.cast()) }
    }
}
