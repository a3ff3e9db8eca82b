use std::fmt::Debug;

/// The allocator that actually provides memory to a [`Tracker`][crate::Tracker].
///
/// The tracker never manages memory itself: it forwards every request to an implementation of
/// this trait and only observes the outcome. The contract is that of the C `malloc` family,
/// in particular a block can be resized or released knowing only its address.
///
/// # Safety
///
/// Implementations must uphold the following, which the tracker and the global allocator hook
/// rely on for soundness:
///
/// * Every non-null block returned is aligned to at least [`MIN_ALIGN`][Self::MIN_ALIGN] and is
///   valid for reads and writes of the requested number of bytes.
/// * [`zero_acquire()`][Self::zero_acquire] returns zero-filled memory.
/// * [`resize()`][Self::resize] preserves the contents up to the smaller of the old and new
///   size, returns null only on failure (leaving the original block untouched and valid), and
///   returns a valid block even for a new size of zero.
/// * A block stays valid until it is passed to [`release()`][Self::release] or successfully
///   resized.
pub unsafe trait RawAllocator: Debug + Send + Sync + 'static {
    /// The alignment every block returned by this allocator is guaranteed to satisfy.
    const MIN_ALIGN: usize;

    /// Acquires a block of `size` bytes, returning null on failure.
    fn acquire(&self, size: usize) -> *mut u8;

    /// Acquires a zero-filled block of `count * size` bytes, returning null on failure
    /// (including when the product overflows).
    fn zero_acquire(&self, count: usize, size: usize) -> *mut u8;

    /// Resizes a block to `new_size` bytes, possibly moving it.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from this allocator. A null `ptr` behaves
    /// like [`acquire()`][Self::acquire].
    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from this allocator. Releasing null is a
    /// no-op.
    unsafe fn release(&self, ptr: *mut u8);
}
