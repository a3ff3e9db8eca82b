//! Serialization of access to the shared tracker state.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use crate::{Error, Result};

/// Owns the shared state of a tracker and hands out exclusive access to it.
///
/// The state is created lazily on first access, so a tracker can be constructed in a `static`
/// and used by the very first allocation of the process without an explicit init call.
///
/// Every public tracker operation locks exactly once and passes the locked state down to its
/// helpers, so the lock never needs to be re-entrant. In thread-safe mode, callers block until
/// the state is available. Otherwise the lock is only ever tried: single-threaded use never
/// contends, and overlapping use from a second thread is reported instead of blocking.
#[derive(Debug)]
pub(crate) struct ConcurrencyGuard<T> {
    thread_safe: bool,
    state: OnceLock<Mutex<T>>,
}

impl<T> ConcurrencyGuard<T> {
    pub(crate) const fn new(thread_safe: bool) -> Self {
        Self {
            thread_safe,
            state: OnceLock::new(),
        }
    }

    /// Locks the state, creating it with `init` if this is the first access.
    pub(crate) fn lock(&self, init: impl FnOnce() -> T) -> Result<MutexGuard<'_, T>> {
        let mutex = self.state.get_or_init(|| Mutex::new(init()));

        if self.thread_safe {
            return mutex.lock().map_err(|_poisoned| Error::LockPoisoned);
        }

        match mutex.try_lock() {
            Ok(state) => Ok(state),
            Err(TryLockError::Poisoned(_)) => Err(Error::LockPoisoned),
            Err(TryLockError::WouldBlock) => Err(Error::ConcurrentAccess),
        }
    }

    /// Locks the state for a caller that cannot take no for an answer, creating it with `init`
    /// if this is the first access.
    ///
    /// Waits for the lock even when the guard is not thread-safe and ignores poisoning. A panic
    /// while the state was held can only have come from an output writer, which never leaves the
    /// state half updated.
    pub(crate) fn wait(&self, init: impl FnOnce() -> T) -> MutexGuard<'_, T> {
        self.state
            .get_or_init(|| Mutex::new(init()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the state, if it was ever created, for the owner to dispose of.
    pub(crate) fn take(&mut self) -> Option<T> {
        self.state
            .take()
            .map(|mutex| mutex.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}
