//! Suppression of tracking for the engine's own bookkeeping allocations.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;

/// How many bypassed requests one thread can remember until the tracker settles them.
const BYPASSED_CAPACITY: usize = 64;

thread_local! {
    // When true, this thread holds the state of a tracker and any allocator call that comes
    // back around through the global allocator hook must go straight to the raw allocator.
    // A plain `Cell<bool>` with const init has no destructor, so it stays accessible for the
    // whole life of the thread, including TLS teardown.
    static INSIDE_ENGINE: Cell<bool> = const { Cell::new(false) };

    // Resizes and releases that went straight to the raw allocator while the flag was set.
    // An array of `Copy` values has no destructor either.
    static BYPASSED: RefCell<[Option<Bypassed>; BYPASSED_CAPACITY]> =
        const { RefCell::new([None; BYPASSED_CAPACITY]) };
}

/// A resize or release that went straight to the raw allocator while the current thread held
/// a tracker's state, for example because the output writer grew or dropped a buffer.
///
/// The tracker applies these to its registry before it lets go of the state, so that no
/// record outlives its block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Bypassed {
    Released { address: usize },
    Resized { from: usize, to: usize, size: usize },
}

/// Marks the current thread as executing engine bookkeeping for as long as the guard lives.
///
/// While a guard is alive on a thread, [`ReentrancyGuard::is_held()`] returns true on that
/// thread and every tracked operation started from that thread is forwarded untracked.
/// The flag is restored on every exit path when the guard is dropped, including unwinding.
#[derive(Debug)]
pub(crate) struct ReentrancyGuard {
    was_held: bool,

    _single_threaded: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    pub(crate) fn enter() -> Self {
        let was_held = INSIDE_ENGINE.with(|flag| flag.replace(true));

        if !was_held {
            // Anything left over belongs to an earlier hold and is meaningless now.
            drop(Self::take_bypassed());
        }

        Self {
            was_held,
            _single_threaded: PhantomData,
        }
    }

    /// Whether the current thread is already inside the engine.
    #[inline]
    pub(crate) fn is_held() -> bool {
        INSIDE_ENGINE.with(Cell::get)
    }

    /// Remembers a request that bypassed tracking while the guard is held. Requests beyond
    /// [`BYPASSED_CAPACITY`] are forgotten.
    pub(crate) fn note_bypassed(bypassed: Bypassed) {
        BYPASSED.with(|queue| {
            let Ok(mut queue) = queue.try_borrow_mut() else {
                return;
            };

            if let Some(slot) = queue.iter_mut().find(|slot| slot.is_none()) {
                *slot = Some(bypassed);
            }
        });
    }

    /// Hands over the remembered requests, oldest first, and forgets them.
    pub(crate) fn take_bypassed() -> impl Iterator<Item = Bypassed> {
        let taken = BYPASSED.with(|queue| {
            queue
                .try_borrow_mut()
                .map(|mut queue| mem::replace(&mut *queue, [None; BYPASSED_CAPACITY]))
                .unwrap_or([None; BYPASSED_CAPACITY])
        });

        taken.into_iter().flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        INSIDE_ENGINE.with(|flag| flag.set(self.was_held));
    }
}
