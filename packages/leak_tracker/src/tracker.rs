use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;
use std::{fmt, mem, ptr};

use crate::concurrency::ConcurrencyGuard;
use crate::output::Sink;
use crate::pal::{LibcAllocator, RawAllocator};
use crate::reentrancy::{Bypassed, ReentrancyGuard};
use crate::registry::Registry;
use crate::report::{ContentPreview, OutstandingBlock};
use crate::stats::Stats;
use crate::{
    AllocationRecord, Balance, Config, Error, Output, OutputKind, Report, Result, Site,
    StatsSnapshot,
};

/// Everything a tracker knows, protected by its [`ConcurrencyGuard`].
#[derive(Debug)]
struct State {
    registry: Registry,
    stats: Stats,
    tracking: bool,
    sink: Sink,
}

impl State {
    // Must not allocate: this runs inside the first allocation of the process when the tracker
    // is behind the global allocator hook.
    fn new() -> Self {
        Self {
            registry: Registry::new(),
            stats: Stats::new(),
            tracking: true,
            sink: Sink::Stdout,
        }
    }

    /// Disposes of the bookkeeping and hands back the sink, which the caller drops outside the
    /// reentrancy guard because it may own memory the host acquired while being tracked.
    fn into_sink(self) -> Sink {
        self.sink
    }

    /// Applies the resizes and releases that bypassed tracking while this thread held the
    /// state, so that no record outlives its block.
    fn settle_bypassed(&mut self) {
        for bypassed in ReentrancyGuard::take_bypassed() {
            match bypassed {
                Bypassed::Released { address } => {
                    self.registry.evict(address);
                }
                Bypassed::Resized { from, to, size } => {
                    self.move_record(from, to, size);
                }
            }
        }
    }

    /// Points the record of the block at `from`, if there is one, to where the block lives now
    /// and how large it is. Returns the stale record evicted from `to`, if any.
    fn move_record(&mut self, from: usize, to: usize, size: usize) -> Option<AllocationRecord> {
        let handle = self.registry.find(from)?;

        let stale = if to == from {
            None
        } else {
            let stale = self.registry.evict(to);
            self.registry.set_address(handle, to);
            stale
        };

        if let Some(record) = self.registry.get_mut(handle) {
            record.set_size(size);
        }

        stale
    }
}

/// The locked state of a tracker.
///
/// Allocator calls made by the holding thread bypass tracking for as long as this lives, and
/// whatever bypassed is settled into the registry before the lock is released.
struct Locked<'a> {
    // Unlocked before the guard is released.
    state: MutexGuard<'a, State>,
    _reentrancy: ReentrancyGuard,
}

impl Deref for Locked<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.state.settle_bypassed();
    }
}

/// Who is asking the tracker to do something.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Caller {
    /// The host called a tracker method. Every block it hands back is expected to have been
    /// acquired through the tracker, so anything unknown is an anomaly worth a warning. If the
    /// tracker state is unavailable, the request is abandoned.
    Host,

    /// The global allocator hook. Blocks it hands back may legitimately be unknown: acquired
    /// before the tracker saw them, while tracking was off, or during the tracker's own
    /// bookkeeping. Those are forwarded silently. The hook cannot fail a request, so it waits
    /// for the tracker state instead of giving up on it.
    Hook,
}

/// Something unexpected noticed while the state was locked, reported after it is unlocked.
#[derive(Debug)]
enum Anomaly {
    UntrackedResize { address: usize, site: Site },
    UntrackedRelease { address: usize, site: Site },
    StaleRecord(AllocationRecord),
}

/// Tracks every block of memory acquired, resized and released through it, and reports which
/// ones are still outstanding.
///
/// The tracker forwards all requests to a [`RawAllocator`] (the C library allocator by
/// default) and records the address, size and call site of each block that comes back.
/// Diagnostic lines for every operation go to the configured [`Output`], and a
/// [`Report`] of the counters and outstanding blocks is available at any time.
///
/// Blocks can be routed through a tracker in two ways:
///
/// * By calling [`acquire()`][Self::acquire], [`zero_acquire()`][Self::zero_acquire],
///   [`resize()`][Self::resize] and [`release()`][Self::release] directly. These capture the
///   caller's source location as the provenance of the block.
/// * By registering an [`Allocator`][crate::Allocator] wrapping a `'static` tracker as the
///   global allocator, so every heap allocation of the program is tracked.
///
/// All state is created lazily on first use, so a tracker can live in a `static`.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Balance, Output, SharedBuffer, Tracker};
///
/// let output = SharedBuffer::new();
/// let tracker = Tracker::new();
/// tracker.set_output(Some(Output::writer(output.clone()))).unwrap();
///
/// let leaked = tracker.acquire(100);
/// let released = tracker.zero_acquire(4, 8);
/// // SAFETY: The block was acquired from this tracker and not yet released.
/// unsafe { tracker.release(released) };
///
/// assert_eq!(tracker.report().unwrap(), Balance::Imbalanced);
/// assert!(output.contents().contains("UNRELEASED ALLOCATIONS DETECTED"));
///
/// let records = tracker.snapshot_records().unwrap();
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].size(), 100);
/// assert_eq!(records[0].address(), leaked.expose_provenance());
/// # // SAFETY: The block was acquired from this tracker and not yet released.
/// # unsafe { tracker.release(leaked) };
/// ```
#[derive(Debug)]
pub struct Tracker<B: RawAllocator = LibcAllocator> {
    backend: B,
    config: Config,
    state: ConcurrencyGuard<State>,
}

impl Tracker<LibcAllocator> {
    /// Creates a tracker over the C library allocator with the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    /// Creates a tracker over the C library allocator.
    #[must_use]
    pub const fn with_config(config: Config) -> Self {
        Self::with_backend(LibcAllocator::new(), config)
    }
}

impl Default for Tracker<LibcAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: RawAllocator> Tracker<B> {
    /// Creates a tracker that forwards every request to `backend`.
    #[must_use]
    pub const fn with_backend(backend: B, config: Config) -> Self {
        Self {
            backend,
            config,
            state: ConcurrencyGuard::new(config.is_thread_safe()),
        }
    }

    /// The configuration the tracker was created with.
    #[must_use]
    pub const fn config(&self) -> Config {
        self.config
    }

    /// The raw allocator the tracker forwards to.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquires a block of `size` bytes, attributed to the caller's location.
    ///
    /// Returns null if the raw allocator fails or the tracker state is unavailable (see
    /// [`Error`]). The block must be released through [`release()`][Self::release] of the same
    /// tracker.
    #[must_use]
    #[track_caller]
    pub fn acquire(&self, size: usize) -> *mut u8 {
        self.acquire_at(Site::caller(), size)
    }

    /// Like [`acquire()`][Self::acquire] but attributed to an explicit site.
    #[must_use]
    pub fn acquire_at(&self, site: Site, size: usize) -> *mut u8 {
        self.acquire_for(Caller::Host, site, size)
    }

    /// Acquires a zero-filled block of `count * size` bytes, attributed to the caller's
    /// location.
    ///
    /// The block is registered with the size `count * size`. If that product overflows, the
    /// request fails like an allocator failure and returns null.
    #[must_use]
    #[track_caller]
    pub fn zero_acquire(&self, count: usize, size: usize) -> *mut u8 {
        self.zero_acquire_at(Site::caller(), count, size)
    }

    /// Like [`zero_acquire()`][Self::zero_acquire] but attributed to an explicit site.
    #[must_use]
    pub fn zero_acquire_at(&self, site: Site, count: usize, size: usize) -> *mut u8 {
        self.zero_acquire_for(Caller::Host, site, count, size)
    }

    /// Resizes a block to `new_size` bytes, possibly moving it, and attributes it to the
    /// caller's location.
    ///
    /// A null `block` behaves like [`acquire()`][Self::acquire]. Resizing a block the tracker
    /// does not know about prints a warning and starts tracking it from here on.
    ///
    /// Returns the resized block, or null on failure, in which case `block` is untouched and
    /// remains valid.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block acquired from the raw allocator of this tracker,
    /// normally through this tracker.
    #[must_use]
    #[track_caller]
    pub unsafe fn resize(&self, block: *mut u8, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.resize_at(Site::caller(), block, new_size) }
    }

    /// Like [`resize()`][Self::resize] but attributed to an explicit site.
    ///
    /// # Safety
    ///
    /// See [`resize()`][Self::resize].
    #[must_use]
    pub unsafe fn resize_at(&self, site: Site, block: *mut u8, new_size: usize) -> *mut u8 {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.resize_for(Caller::Host, site, block, new_size) }
    }

    /// Releases a block, attributing the release to the caller's location.
    ///
    /// Releasing null does nothing. Releasing a block the tracker does not know about prints a
    /// warning and still releases it.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live block acquired from the raw allocator of this tracker,
    /// normally through this tracker.
    #[track_caller]
    pub unsafe fn release(&self, block: *mut u8) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.release_at(Site::caller(), block) };
    }

    /// Like [`release()`][Self::release] but attributed to an explicit site.
    ///
    /// # Safety
    ///
    /// See [`release()`][Self::release].
    pub unsafe fn release_at(&self, site: Site, block: *mut u8) {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.release_for(Caller::Host, site, block) };
    }

    /// Turns tracking on or off. Tracking is on for a new tracker.
    ///
    /// While tracking is off, every request is forwarded to the raw allocator without being
    /// recorded.
    pub fn set_tracking(&self, enabled: bool) -> Result<()> {
        self.lock_state(Caller::Host, "set_tracking")?.tracking = enabled;

        tracing::debug!(enabled, "leak tracking toggled");
        Ok(())
    }

    /// Whether requests are currently being recorded.
    ///
    /// Always false for a passthrough tracker.
    pub fn is_tracking(&self) -> Result<bool> {
        let tracking = self.lock_state(Caller::Host, "is_tracking")?.tracking;

        Ok(tracking && !self.config.is_passthrough())
    }

    /// Switches the destination of diagnostic lines and reports.
    ///
    /// `None` makes the tracker open a discard sink of its own, which it closes again when the
    /// output is switched away from it or the tracker is cleaned up.
    pub fn set_output(&self, output: Option<Output>) -> Result<()> {
        let sink = output.map_or_else(Sink::discard, Sink::from);
        let kind = sink.kind();

        let previous = mem::replace(
            &mut self.lock_state(Caller::Host, "set_output")?.sink,
            sink,
        );

        tracing::debug!(
            output = ?kind,
            closing_discard = previous.is_self_managed(),
            "leak tracker output switched"
        );

        // Closes a self-managed sink or hands a host writer back to the host allocator.
        drop(previous);

        Ok(())
    }

    /// Describes the current destination of diagnostic lines and reports.
    pub fn output(&self) -> Result<OutputKind> {
        Ok(self.lock_state(Caller::Host, "output")?.sink.kind())
    }

    /// Zeroes all counters. Outstanding blocks stay registered.
    pub fn reset_stats(&self) -> Result<()> {
        self.lock_state(Caller::Host, "reset_stats")?.stats.reset();

        tracing::debug!("leak tracker counters reset");
        Ok(())
    }

    /// Releases every block still outstanding, newest first, counting each as a release.
    ///
    /// # Safety
    ///
    /// No block outstanding at the time of the call may be used or released afterwards. Every
    /// outstanding block must still be live, which holds as long as every block acquired through
    /// this tracker is resized and released only through it or its global allocator hook.
    pub unsafe fn purge_remaining(&self) -> Result<()> {
        let mut state = self.lock_state(Caller::Host, "purge_remaining")?;

        // SAFETY: Forwarding the caller's guarantees.
        let purged = unsafe { self.purge(&mut state) };
        drop(state);

        tracing::debug!(purged, "outstanding blocks purged");
        Ok(())
    }

    /// Returns the tracker to its initial state.
    ///
    /// A self-managed discard sink is closed and the output reverts to standard output. All
    /// outstanding blocks are forgotten, after being released first if
    /// [`Config::purge_on_cleanup()`] is enabled. Counters are zeroed and tracking is turned
    /// back on. The tracker remains usable afterwards.
    pub fn cleanup(&self) -> Result<()> {
        let mut state = self.lock_state(Caller::Host, "cleanup")?;

        let purged = if self.config.is_purge_on_cleanup() {
            // SAFETY: Whoever enabled purging on cleanup took on the guarantees of
            // `purge_remaining()` for every cleanup.
            unsafe { self.purge(&mut state) }
        } else {
            0
        };

        let forgotten = state.registry.len();
        state.registry.clear();
        state.stats.reset();
        state.tracking = true;
        let retired_sink = mem::replace(&mut state.sink, Sink::Stdout);
        drop(state);

        tracing::debug!(purged, forgotten, "leak tracker cleaned up");

        // Dropped with the state unlocked, like in `set_output()`.
        drop(retired_sink);

        Ok(())
    }

    /// Copies of the records of all outstanding blocks, oldest first.
    pub fn snapshot_records(&self) -> Result<Vec<AllocationRecord>> {
        let state = self.lock_state(Caller::Host, "snapshot_records")?;

        Ok(state.registry.iter_oldest_to_newest().copied().collect())
    }

    /// A copy of the counters.
    pub fn stats(&self) -> Result<StatsSnapshot> {
        Ok(self.lock_state(Caller::Host, "stats")?.stats.snapshot())
    }

    /// Takes a [`Report`] of the counters and outstanding blocks without writing it anywhere.
    ///
    /// The report includes a preview of the leading bytes of each outstanding block. Blocks
    /// that another thread is writing to at the same time may show torn contents.
    pub fn to_report(&self) -> Result<Report> {
        let state = self.lock_state(Caller::Host, "to_report")?;

        Ok(build_report(&state))
    }

    /// Writes a report to the current output and tells whether every tracked block has been
    /// released.
    pub fn report(&self) -> Result<Balance> {
        let mut state = self.lock_state(Caller::Host, "report")?;

        let report = build_report(&state);
        state.sink.emit(format_args!("{report}"));

        Ok(report.balance())
    }

    /// Writes a report to `writer` instead of the current output.
    pub fn report_to(&self, writer: &mut impl Write) -> Result<Balance> {
        let report = self.to_report()?;

        write!(writer, "{report}")?;
        writer.flush()?;

        Ok(report.balance())
    }

    pub(crate) fn acquire_for(&self, caller: Caller, site: Site, size: usize) -> *mut u8 {
        if self.bypasses() {
            return self.backend.acquire(size);
        }

        let Ok(mut state) = self.lock_state(caller, "acquire") else {
            return ptr::null_mut();
        };

        if !state.tracking {
            drop(state);
            return self.backend.acquire(size);
        }

        let block = self.backend.acquire(size);
        let mut anomalies = Vec::new();

        if block.is_null() {
            self.diagnose(
                &mut state,
                format_args!("[ACQUIRE] 0x0 <SKIPPING> {{n={size}}} @ {site}\n"),
            );
        } else {
            let address = block.expose_provenance();

            register(&mut state.registry, address, site, size, &mut anomalies);
            state.stats.record_acquire(size);

            self.diagnose(
                &mut state,
                format_args!("[ACQUIRE] {address:#x} {{n={size}}} @ {site}\n"),
            );
        }

        drop(state);
        self.report_anomalies(&anomalies);

        block
    }

    pub(crate) fn zero_acquire_for(
        &self,
        caller: Caller,
        site: Site,
        count: usize,
        size: usize,
    ) -> *mut u8 {
        if self.bypasses() {
            return self.backend.zero_acquire(count, size);
        }

        let Ok(mut state) = self.lock_state(caller, "zero_acquire") else {
            return ptr::null_mut();
        };

        if !state.tracking {
            drop(state);
            return self.backend.zero_acquire(count, size);
        }

        let Some(total) = count.checked_mul(size) else {
            self.diagnose(
                &mut state,
                format_args!(
                    "[ZACQUIR] 0x0 <SKIPPING> {{n={count}*{size} overflows}} @ {site}\n"
                ),
            );
            return ptr::null_mut();
        };

        let block = self.backend.zero_acquire(count, size);
        let mut anomalies = Vec::new();

        if block.is_null() {
            self.diagnose(
                &mut state,
                format_args!("[ZACQUIR] 0x0 <SKIPPING> {{n={total}}} @ {site}\n"),
            );
        } else {
            let address = block.expose_provenance();

            register(&mut state.registry, address, site, total, &mut anomalies);
            state.stats.record_zero_acquire(total);

            self.diagnose(
                &mut state,
                format_args!("[ZACQUIR] {address:#x} {{n={total}}} @ {site}\n"),
            );
        }

        drop(state);
        self.report_anomalies(&anomalies);

        block
    }

    /// # Safety
    ///
    /// `block` must be null or a live block acquired from the raw allocator.
    pub(crate) unsafe fn resize_for(
        &self,
        caller: Caller,
        site: Site,
        block: *mut u8,
        new_size: usize,
    ) -> *mut u8 {
        if self.config.is_passthrough() {
            // SAFETY: Forwarding the caller's guarantees.
            return unsafe { self.backend.resize(block, new_size) };
        }

        if ReentrancyGuard::is_held() {
            // SAFETY: Forwarding the caller's guarantees.
            let resized = unsafe { self.backend.resize(block, new_size) };

            if !block.is_null() && !resized.is_null() {
                ReentrancyGuard::note_bypassed(Bypassed::Resized {
                    from: block.expose_provenance(),
                    to: resized.expose_provenance(),
                    size: new_size,
                });
            }

            return resized;
        }

        let Ok(mut state) = self.lock_state(caller, "resize") else {
            return ptr::null_mut();
        };

        let old_address = block.expose_provenance();
        let known_size = state
            .registry
            .find(old_address)
            .and_then(|handle| state.registry.get(handle))
            .map(AllocationRecord::size);

        if !state.tracking || (known_size.is_none() && caller == Caller::Hook) {
            // SAFETY: Forwarding the caller's guarantees.
            let resized = unsafe { self.backend.resize(block, new_size) };

            // A record left over from while the block was tracked has to follow the block.
            if known_size.is_some() && !resized.is_null() {
                state.move_record(old_address, resized.expose_provenance(), new_size);
            }

            return resized;
        }

        let mut anomalies = Vec::new();

        let (old_size, synthesized) = if let Some(size) = known_size {
            (size, false)
        } else {
            // Resizing null is a plain acquire in disguise, nothing to warn about.
            if !block.is_null() {
                anomalies.push(Anomaly::UntrackedResize {
                    address: old_address,
                    site,
                });
            }

            state.registry.append(old_address, Site::UNTRACKED, 0);
            (0, true)
        };

        self.diagnose(
            &mut state,
            format_args!("[RESIZE ] {old_address:#x} {{n={old_size}}}"),
        );

        // SAFETY: Forwarding the caller's guarantees.
        let resized = unsafe { self.backend.resize(block, new_size) };

        if resized.is_null() {
            // The old block is still valid and keeps whatever record it had.
            if synthesized {
                state.registry.evict(old_address);
            }

            self.diagnose(
                &mut state,
                format_args!(" --> 0x0 {{n={new_size}}} @ {site} <FAILED>\n"),
            );
        } else {
            let new_address = resized.expose_provenance();

            if let Some(stale) = state.move_record(old_address, new_address, new_size) {
                anomalies.push(Anomaly::StaleRecord(stale));
            }

            if let Some(handle) = state.registry.find(new_address) {
                if let Some(record) = state.registry.get_mut(handle) {
                    record.update(site, new_size);
                }
            }

            state.stats.record_resize(old_size, new_size);

            self.diagnose(
                &mut state,
                format_args!(" --> {new_address:#x} {{n={new_size}}} @ {site}\n"),
            );
        }

        drop(state);
        self.report_anomalies(&anomalies);

        resized
    }

    /// # Safety
    ///
    /// `block` must be null or a live block acquired from the raw allocator.
    pub(crate) unsafe fn release_for(&self, caller: Caller, site: Site, block: *mut u8) {
        if block.is_null() {
            return;
        }

        if self.config.is_passthrough() {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.backend.release(block) };
            return;
        }

        let address = block.expose_provenance();

        if ReentrancyGuard::is_held() {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.backend.release(block) };

            ReentrancyGuard::note_bypassed(Bypassed::Released { address });
            return;
        }

        let Ok(mut state) = self.lock_state(caller, "release") else {
            // Leaking the block is the only safe option left.
            return;
        };

        let known = state.registry.find(address);

        if !state.tracking || (known.is_none() && caller == Caller::Hook) {
            // A record left over from while the block was tracked must not outlive the block.
            if let Some(handle) = known {
                state.registry.remove(handle);
            }

            // SAFETY: Forwarding the caller's guarantees.
            unsafe { self.backend.release(block) };
            return;
        }

        let mut anomalies = Vec::new();

        let size = match known.and_then(|handle| state.registry.remove(handle)) {
            Some(record) => {
                state.stats.record_release(record.size());
                record.size()
            }
            None => {
                anomalies.push(Anomaly::UntrackedRelease { address, site });
                state.stats.record_untracked_release();
                0
            }
        };

        self.diagnose(
            &mut state,
            format_args!("[RELEASE] {address:#x} {{n={size}}} @ {site}\n"),
        );

        // SAFETY: Forwarding the caller's guarantees. The record is gone before the block is,
        // so the address cannot be handed out again while still registered.
        unsafe { self.backend.release(block) };

        drop(state);
        self.report_anomalies(&anomalies);
    }

    /// Releases all registered blocks, newest first, and forgets them. Returns how many there
    /// were.
    ///
    /// # Safety
    ///
    /// See [`purge_remaining()`][Self::purge_remaining].
    unsafe fn purge(&self, state: &mut State) -> usize {
        if state.registry.is_empty() {
            return 0;
        }

        self.diagnose(state, format_args!("\n-=[! Purging remaining records... !]=-\n"));

        let addresses: Vec<usize> = state
            .registry
            .iter_newest_to_oldest()
            .map(AllocationRecord::address)
            .collect();
        let mut purged: usize = 0;

        for address in addresses {
            // Writing an earlier line may have released or moved the block through the hook.
            let Some(record) = state
                .registry
                .find(address)
                .and_then(|handle| state.registry.get(handle))
                .copied()
            else {
                continue;
            };

            // SAFETY: The caller guarantees registered blocks are still live.
            let preview = unsafe { ContentPreview::capture(&record) };

            self.diagnose(
                state,
                format_args!(
                    "  % Releasing {:#x}... {{n={}}} :: FROM: {} ; L{}  \
                     (first {} bytes...  |{}|)\n",
                    record.address(),
                    record.size(),
                    record.file(),
                    record.line(),
                    preview.window(),
                    preview
                ),
            );

            let Some(record) = state.registry.evict(address) else {
                continue;
            };

            // SAFETY: The caller guarantees registered blocks are still live and that nobody
            // will touch them after this. The record was removed first, so no block is
            // released twice.
            unsafe {
                self.backend
                    .release(ptr::with_exposed_provenance_mut(record.address()));
            }

            state.stats.record_release(record.size());
            purged = purged.saturating_add(1);
        }

        self.diagnose(state, format_args!("-=[! Purge done. !]=-\n"));

        purged
    }

    /// Requests that must not or need not be recorded go straight to the raw allocator.
    #[inline]
    fn bypasses(&self) -> bool {
        self.config.is_passthrough() || ReentrancyGuard::is_held()
    }

    /// Locks the state on behalf of `caller`, reporting any failure.
    ///
    /// Fails with [`Error::Reentrant`] if this thread already holds the state of a tracker,
    /// since waiting for it would never end.
    fn lock_state(&self, caller: Caller, operation: &'static str) -> Result<Locked<'_>> {
        if ReentrancyGuard::is_held() {
            return Err(Error::Reentrant);
        }

        let reentrancy = ReentrancyGuard::enter();

        let state = match caller {
            Caller::Host => self.state.lock(State::new),
            Caller::Hook => Ok(self.state.wait(State::new)),
        };

        match state {
            Ok(state) => Ok(Locked {
                state,
                _reentrancy: reentrancy,
            }),
            Err(error) => {
                drop(reentrancy);
                report_lock_failure(operation, &error);
                Err(error)
            }
        }
    }

    /// Writes a diagnostic line if enabled, then catches up with whatever the writer did to
    /// tracked blocks in the meantime.
    fn diagnose(&self, state: &mut State, line: fmt::Arguments<'_>) {
        if self.config.has_diagnostics() {
            state.sink.emit(line);
            state.settle_bypassed();
        }
    }

    /// Only called with the state unlocked, so that subscribers are free to allocate and to
    /// take their own locks.
    fn report_anomalies(&self, anomalies: &[Anomaly]) {
        for anomaly in anomalies {
            match anomaly {
                Anomaly::UntrackedResize { address, site } => {
                    tracing::warn!(address, %site, "resize of an address with no tracked record");
                }
                Anomaly::UntrackedRelease { address, site } => {
                    tracing::warn!(
                        address,
                        %site,
                        "release of an address with no tracked record, this may crash"
                    );
                }
                Anomaly::StaleRecord(record) => {
                    tracing::warn!(
                        address = record.address(),
                        size = record.size(),
                        site = %record.site(),
                        "allocator handed out an address that was still tracked, \
                         dropping the stale record"
                    );
                }
            }

            if self.config.has_critical_output() {
                write_critical(anomaly);
            }
        }
    }
}

impl<B: RawAllocator> Drop for Tracker<B> {
    fn drop(&mut self) {
        let sink = {
            let _reentrancy = ReentrancyGuard::enter();
            self.state.take().map(State::into_sink)
        };

        drop(sink);
    }
}

/// Registers a freshly acquired block, evicting any stale record at the same address.
fn register(
    registry: &mut Registry,
    address: usize,
    site: Site,
    size: usize,
    anomalies: &mut Vec<Anomaly>,
) {
    if let Some(stale) = registry.evict(address) {
        anomalies.push(Anomaly::StaleRecord(stale));
    }

    registry.append(address, site, size);
}

fn build_report(state: &State) -> Report {
    let outstanding = state
        .registry
        .iter_oldest_to_newest()
        .map(|record| {
            // SAFETY: Every registered block is live. Resizes and releases of tracked blocks,
            // including ones that bypass tracking, update the registry before the state is
            // unlocked, and we hold the state.
            let preview = unsafe { ContentPreview::capture(record) };
            OutstandingBlock::new(*record, preview)
        })
        .collect();

    Report::new(state.stats.snapshot(), outstanding)
}

fn report_lock_failure(operation: &str, error: &Error) {
    tracing::error!(operation, %error, "leak tracker state is unavailable");

    let mut stderr = io::stderr().lock();
    _ = writeln!(stderr, "[{operation}] Unexpected lock failure: {error}");
}

/// Writes a warning to standard error regardless of the configured output.
#[cfg_attr(test, mutants::skip)] // Too difficult to test stderr output reliably - manually tested.
fn write_critical(anomaly: &Anomaly) {
    let mut stderr = io::stderr().lock();

    _ = match anomaly {
        Anomaly::UntrackedResize { address, site } => writeln!(
            stderr,
            "[RESIZE ] [!!] RESIZING AN ADDRESS WITH NO TRACKED RECORD ({address:#x}) @ {site}; \
             RAW ALLOCATOR USED SOMEWHERE?"
        ),
        Anomaly::UntrackedRelease { address, site } => writeln!(
            stderr,
            "[RELEASE] [!!] RELEASING AN ADDRESS WITH NO TRACKED RECORD ({address:#x}) @ {site}; \
             RAW ALLOCATOR USED SOMEWHERE?\n          [!!] MIGHT CRASH (CONTINUING ANYWAY...)"
        ),
        Anomaly::StaleRecord(record) => writeln!(
            stderr,
            "[!!] ADDRESS {:#x} HANDED OUT AGAIN WHILE STILL TRACKED; \
             DROPPING STALE RECORD {record}",
            record.address()
        ),
    };
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{self, AtomicBool, AtomicUsize};

    use static_assertions::assert_impl_all;
    use tracing::Level;

    use super::*;
    use crate::{ByteBalance, CallBalance, SharedBuffer};

    assert_impl_all!(Tracker: Send, Sync);

    /// The C library allocator, except that it can be told to fail.
    #[derive(Debug, Default)]
    struct Flaky {
        failing: AtomicBool,
        acquire_calls: AtomicUsize,
    }

    impl Flaky {
        fn fail(&self, failing: bool) {
            self.failing.store(failing, atomic::Ordering::Relaxed);
        }

        fn is_failing(&self) -> bool {
            self.failing.load(atomic::Ordering::Relaxed)
        }
    }

    // SAFETY: Every successful request is served by the C library allocator.
    unsafe impl RawAllocator for Flaky {
        const MIN_ALIGN: usize = LibcAllocator::MIN_ALIGN;

        fn acquire(&self, size: usize) -> *mut u8 {
            self.acquire_calls.fetch_add(1, atomic::Ordering::Relaxed);

            if self.is_failing() {
                ptr::null_mut()
            } else {
                LibcAllocator.acquire(size)
            }
        }

        fn zero_acquire(&self, count: usize, size: usize) -> *mut u8 {
            self.acquire_calls.fetch_add(1, atomic::Ordering::Relaxed);

            if self.is_failing() {
                ptr::null_mut()
            } else {
                LibcAllocator.zero_acquire(count, size)
            }
        }

        unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
            if self.is_failing() {
                ptr::null_mut()
            } else {
                // SAFETY: Forwarding the caller's guarantees.
                unsafe { LibcAllocator.resize(ptr, new_size) }
            }
        }

        unsafe fn release(&self, ptr: *mut u8) {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { LibcAllocator.release(ptr) };
        }
    }

    /// Hands out the same block every time and never frees it.
    #[derive(Debug)]
    struct Recycling {
        address: usize,
    }

    impl Recycling {
        fn new() -> Self {
            let block: &'static mut [u8; 64] = Box::leak(Box::new([0; 64]));

            Self {
                address: block.as_mut_ptr().expose_provenance(),
            }
        }
    }

    // SAFETY: The one block is 64 bytes, leaked and therefore valid forever. Tests using this
    // never request more than that.
    unsafe impl RawAllocator for Recycling {
        const MIN_ALIGN: usize = 1;

        fn acquire(&self, _size: usize) -> *mut u8 {
            ptr::with_exposed_provenance_mut(self.address)
        }

        fn zero_acquire(&self, _count: usize, _size: usize) -> *mut u8 {
            ptr::with_exposed_provenance_mut(self.address)
        }

        unsafe fn resize(&self, _ptr: *mut u8, _new_size: usize) -> *mut u8 {
            ptr::with_exposed_provenance_mut(self.address)
        }

        unsafe fn release(&self, _ptr: *mut u8) {}
    }

    fn site(line: u32) -> Site {
        Site::new("main.c", line)
    }

    fn with_buffer<B: RawAllocator>(tracker: &Tracker<B>) -> SharedBuffer {
        let buffer = SharedBuffer::new();
        tracker
            .set_output(Some(Output::writer(buffer.clone())))
            .unwrap();
        buffer
    }

    #[test]
    fn acquire_registers_and_release_forgets() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        let block = tracker.acquire_at(site(10), 100);
        assert!(!block.is_null());
        let address = block.expose_provenance();

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records, vec![AllocationRecord::new(address, site(10), 100)]);

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release_at(site(20), block) };

        assert!(tracker.snapshot_records().unwrap().is_empty());

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.acquires(), 1);
        assert_eq!(stats.releases(), 1);
        assert_eq!(stats.call_balance(), CallBalance::Ok);
        assert_eq!(stats.byte_balance(), ByteBalance::Ok);

        assert_eq!(
            output.contents(),
            format!(
                "[ACQUIRE] {address:#x} {{n=100}} @ main.c L10\n\
                 [RELEASE] {address:#x} {{n=100}} @ main.c L20\n"
            )
        );
    }

    #[test]
    fn acquire_captures_caller_location() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        let expected_line = line!() + 1;
        let block = tracker.acquire(8);

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records[0].file(), file!());
        assert_eq!(records[0].line(), expected_line);

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
    }

    #[test]
    fn failed_acquire_registers_nothing() {
        let tracker = Tracker::with_backend(Flaky::default(), Config::new());
        let output = with_buffer(&tracker);
        tracker.backend().fail(true);

        let block = tracker.acquire_at(site(1), 64);

        assert!(block.is_null());
        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
        assert!(output.contents().contains("<SKIPPING> {n=64}"));
    }

    #[test]
    fn zero_acquire_registers_product() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        let block = tracker.zero_acquire_at(site(3), 4, 25);

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size(), 100);

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.zero_acquires(), 1);
        assert_eq!(stats.acquires(), 0);
        assert_eq!(stats.acquiring_calls(), 1);
        assert_eq!(stats.bytes_acquired(), 100);
        assert!(output.contents().starts_with("[ZACQUIR] "));

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
    }

    #[test]
    fn zero_acquire_overflow_fails_without_calling_allocator() {
        let tracker = Tracker::with_backend(Flaky::default(), Config::new());
        tracker.set_output(None).unwrap();

        let block = tracker.zero_acquire(usize::MAX, 2);

        assert!(block.is_null());
        assert_eq!(
            tracker.backend().acquire_calls.load(atomic::Ordering::Relaxed),
            0
        );
        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
    }

    #[test]
    fn resize_updates_record_in_place() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        let block = tracker.acquire_at(site(1), 10);
        let old_address = block.expose_provenance();

        // SAFETY: Acquired above, not yet released.
        let block = unsafe { tracker.resize_at(site(2), block, 20) };
        assert!(!block.is_null());
        let new_address = block.expose_provenance();

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(
            records,
            vec![AllocationRecord::new(new_address, site(2), 20)]
        );

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.resizes(), 1);
        assert_eq!(stats.acquiring_calls(), 1);
        assert_eq!(stats.bytes_acquired(), 20);

        assert!(output.contents().contains(&format!(
            "[RESIZE ] {old_address:#x} {{n=10}} --> {new_address:#x} {{n=20}} @ main.c L2\n"
        )));

        // SAFETY: Resized above, not yet released.
        unsafe { tracker.release(block) };
        assert_eq!(tracker.stats().unwrap().byte_balance(), ByteBalance::Ok);
    }

    #[test]
    fn resize_of_null_acts_as_acquire() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        // SAFETY: Null is always acceptable.
        let block = unsafe { tracker.resize_at(site(5), ptr::null_mut(), 32) };

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address(), block.expose_provenance());
        assert_eq!(records[0].site(), site(5));

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.acquiring_calls(), 1);
        assert_eq!(stats.resizes(), 1);

        // SAFETY: Resized above, not yet released.
        unsafe { tracker.release(block) };
        assert_eq!(tracker.stats().unwrap().call_balance(), CallBalance::Ok);
    }

    #[test]
    fn resize_of_untracked_block_starts_tracking_it() {
        let tracker = Tracker::with_config(Config::new().critical_output(false));
        tracker.set_output(None).unwrap();

        let untracked = LibcAllocator.acquire(16);

        // SAFETY: The block comes from the same raw allocator the tracker uses.
        let block = unsafe { tracker.resize_at(site(7), untracked, 48) };

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size(), 48);

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.acquiring_calls(), 1);
        assert_eq!(stats.bytes_acquired(), 48);

        // SAFETY: Resized above, not yet released.
        unsafe { tracker.release(block) };
        assert_eq!(tracker.stats().unwrap().call_balance(), CallBalance::Ok);
    }

    #[test]
    fn failed_resize_leaves_record_untouched() {
        let tracker = Tracker::with_backend(Flaky::default(), Config::new());
        let output = with_buffer(&tracker);

        let block = tracker.acquire_at(site(1), 10);
        let before = tracker.snapshot_records().unwrap();
        let stats_before = tracker.stats().unwrap();

        tracker.backend().fail(true);
        // SAFETY: Acquired above, not yet released.
        let resized = unsafe { tracker.resize_at(site(2), block, 1000) };
        tracker.backend().fail(false);

        assert!(resized.is_null());
        assert_eq!(tracker.snapshot_records().unwrap(), before);
        assert_eq!(tracker.stats().unwrap(), stats_before);
        assert!(output.contents().contains("<FAILED>\n"));

        // SAFETY: The failed resize left the block valid.
        unsafe { tracker.release(block) };
    }

    #[test]
    fn failed_resize_of_null_registers_nothing() {
        let tracker = Tracker::with_backend(Flaky::default(), Config::new());
        tracker.set_output(None).unwrap();
        tracker.backend().fail(true);

        // SAFETY: Null is always acceptable.
        let resized = unsafe { tracker.resize_at(site(2), ptr::null_mut(), 8) };

        assert!(resized.is_null());
        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
    }

    #[test]
    fn release_of_null_does_nothing() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        // SAFETY: Null is always acceptable.
        unsafe { tracker.release(ptr::null_mut()) };

        assert_eq!(output.contents(), "");
        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
        assert!(tracker.snapshot_records().unwrap().is_empty());
    }

    #[test]
    fn release_of_untracked_block_is_compensated() {
        let tracker = Tracker::with_config(Config::new().critical_output(false));
        let output = with_buffer(&tracker);

        let untracked = LibcAllocator.acquire(16);
        let address = untracked.expose_provenance();

        // SAFETY: The block comes from the same raw allocator the tracker uses.
        unsafe { tracker.release_at(site(9), untracked) };

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.acquires(), 1);
        assert_eq!(stats.acquiring_calls(), 1);
        assert_eq!(stats.releases(), 1);
        assert_eq!(stats.call_balance(), CallBalance::Ok);
        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert_eq!(
            output.contents(),
            format!("[RELEASE] {address:#x} {{n=0}} @ main.c L9\n")
        );
    }

    #[test]
    fn reused_address_evicts_stale_record() {
        let tracker = Tracker::with_backend(
            Recycling::new(),
            Config::new().critical_output(false),
        );
        tracker.set_output(None).unwrap();

        let first = tracker.acquire_at(site(1), 8);
        // The host releases the block behind the tracker's back and gets it handed out again.
        let second = tracker.acquire_at(site(2), 16);
        assert_eq!(first, second);

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].site(), site(2));
        assert_eq!(records[0].size(), 16);
    }

    #[test]
    fn purge_releases_everything_newest_first() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        let sizes = [10, 20, 30];
        let blocks = sizes.map(|size| tracker.acquire_at(site(1), size));
        let released_before = tracker.stats().unwrap().bytes_released();

        // SAFETY: The blocks are not used after this.
        unsafe { tracker.purge_remaining() }.unwrap();

        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert!(tracker.report().unwrap().is_balanced());

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.releases(), 3);
        assert_eq!(stats.bytes_released(), released_before + 60);
        assert_eq!(stats.call_balance(), CallBalance::Ok);

        let text = output.contents();
        let positions = blocks.map(|block| {
            text.find(&format!("% Releasing {:#x}...", block.expose_provenance()))
                .unwrap()
        });
        assert!(positions[2] < positions[1]);
        assert!(positions[1] < positions[0]);
        assert!(text.contains("-=[! Purge done. !]=-"));
    }

    #[test]
    fn purge_of_empty_registry_prints_nothing() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        // SAFETY: Nothing is outstanding.
        unsafe { tracker.purge_remaining() }.unwrap();

        assert_eq!(output.contents(), "");
    }

    #[test]
    fn surplus_is_only_reachable_through_reset() {
        let tracker = Tracker::with_config(Config::new().critical_output(false));
        tracker.set_output(None).unwrap();

        // Untracked releases alone are compensated and never produce a surplus.
        for _ in 0..3 {
            let untracked = LibcAllocator.acquire(8);
            // SAFETY: The block comes from the same raw allocator the tracker uses.
            unsafe { tracker.release(untracked) };
        }
        let stats = tracker.stats().unwrap();
        assert_eq!(stats.call_balance(), CallBalance::Ok);
        assert_eq!(stats.byte_balance(), ByteBalance::Ok);

        // Resetting between an acquire and its release does.
        let block = tracker.acquire(24);
        tracker.reset_stats().unwrap();
        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.call_balance(), CallBalance::Surplus(1));
        assert_eq!(stats.byte_balance(), ByteBalance::Surplus(24));

        let mut text = Vec::new();
        let balance = tracker.report_to(&mut text).unwrap();
        assert_eq!(balance, Balance::Balanced);
        assert!(String::from_utf8(text).unwrap().contains("THIS SHOULDN'T HAPPEN"));
    }

    #[test]
    fn disabled_tracking_forwards_without_recording() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        tracker.set_tracking(false).unwrap();
        assert!(!tracker.is_tracking().unwrap());

        let block = tracker.acquire(8);
        assert!(!block.is_null());
        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };

        tracker.set_tracking(true).unwrap();
        assert!(tracker.is_tracking().unwrap());

        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
        assert_eq!(output.contents(), "");
    }

    #[test]
    fn release_while_paused_forgets_the_record() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        // Large enough to be handed back to the operating system once released.
        let block = tracker.acquire(8 << 20);
        tracker.set_tracking(false).unwrap();
        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
        tracker.set_tracking(true).unwrap();

        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert_eq!(
            tracker.report_to(&mut Vec::new()).unwrap(),
            Balance::Balanced
        );
        assert!(!output.contents().contains("[RELEASE]"));
        assert_eq!(tracker.stats().unwrap().releases(), 0);
    }

    #[test]
    fn resize_while_paused_moves_the_record() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        let block = tracker.acquire_at(site(5), 16);
        tracker.set_tracking(false).unwrap();
        // SAFETY: Acquired above, not yet released.
        let block = unsafe { tracker.resize(block, 8 << 20) };
        tracker.set_tracking(true).unwrap();

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address(), block.expose_provenance());
        assert_eq!(records[0].size(), 8 << 20);
        assert_eq!(records[0].site(), site(5));
        assert_eq!(tracker.stats().unwrap().resizes(), 0);

        assert_eq!(
            tracker.report_to(&mut Vec::new()).unwrap(),
            Balance::Imbalanced
        );

        // SAFETY: Resized above, not yet released.
        unsafe { tracker.release(block) };
        assert!(tracker.snapshot_records().unwrap().is_empty());
    }

    #[test]
    fn hook_release_while_paused_forgets_the_record() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        let block = tracker.acquire(64);
        tracker.set_tracking(false).unwrap();
        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release_for(Caller::Hook, Site::GLOBAL_ALLOCATOR, block) };
        tracker.set_tracking(true).unwrap();

        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert!(tracker.to_report().unwrap().is_balanced());
    }

    /// What [`Meddling`] does to a tracked block on its first write.
    enum Meddle {
        Release(usize),
        Resize(usize, usize),
    }

    /// An output writer that releases or resizes a tracked block through the global allocator
    /// hook while the tracker is busy writing a line, like a writer growing its buffer would.
    struct Meddling {
        tracker: &'static Tracker,
        action: Option<Meddle>,
        moved_to: Arc<AtomicUsize>,
    }

    impl Meddling {
        fn new(tracker: &'static Tracker, action: Meddle) -> Self {
            Self {
                tracker,
                action: Some(action),
                moved_to: Arc::default(),
            }
        }
    }

    impl Write for Meddling {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.action.take() {
                Some(Meddle::Release(address)) => {
                    let block = ptr::with_exposed_provenance_mut(address);
                    // SAFETY: The test hands over a live block it no longer uses.
                    unsafe {
                        self.tracker
                            .release_for(Caller::Hook, Site::GLOBAL_ALLOCATOR, block);
                    }
                }
                Some(Meddle::Resize(address, size)) => {
                    let block = ptr::with_exposed_provenance_mut(address);
                    // SAFETY: The test hands over a live block it no longer uses.
                    let moved = unsafe {
                        self.tracker
                            .resize_for(Caller::Hook, Site::GLOBAL_ALLOCATOR, block, size)
                    };
                    self.moved_to
                        .store(moved.expose_provenance(), atomic::Ordering::Relaxed);
                }
                None => {}
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn leaked(config: Config) -> &'static Tracker {
        Box::leak(Box::new(Tracker::with_config(config)))
    }

    #[test]
    fn release_by_the_writer_is_caught_up_with() {
        let tracker = leaked(Config::new().critical_output(false));
        let victim = tracker.acquire(32).expose_provenance();
        tracker
            .set_output(Some(Output::writer(Meddling::new(
                tracker,
                Meddle::Release(victim),
            ))))
            .unwrap();

        let block = tracker.acquire(8);

        let records = tracker.snapshot_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address(), block.expose_provenance());

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
        assert_eq!(tracker.report().unwrap(), Balance::Balanced);
    }

    #[test]
    fn resize_by_the_writer_is_caught_up_with() {
        let tracker = leaked(Config::new().critical_output(false));
        let victim = tracker.acquire_at(site(3), 32).expose_provenance();

        let writer = Meddling::new(tracker, Meddle::Resize(victim, 1 << 20));
        let moved_to = Arc::clone(&writer.moved_to);
        tracker.set_output(Some(Output::writer(writer))).unwrap();

        let block = tracker.acquire(8);

        let moved_to = moved_to.load(atomic::Ordering::Relaxed);
        assert_ne!(moved_to, 0);

        let record = tracker
            .snapshot_records()
            .unwrap()
            .into_iter()
            .find(|record| record.site() == site(3))
            .unwrap();
        assert_eq!(record.address(), moved_to);
        assert_eq!(record.size(), 1 << 20);

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
        // SAFETY: Resized by the writer, not yet released.
        unsafe { tracker.release(ptr::with_exposed_provenance_mut(moved_to)) };
        assert!(tracker.snapshot_records().unwrap().is_empty());
    }

    #[test]
    fn purge_skips_blocks_the_writer_released() {
        let tracker = leaked(Config::new().critical_output(false));
        tracker.set_output(None).unwrap();

        let first = tracker.acquire(16).expose_provenance();
        let _second = tracker.acquire(24);
        tracker
            .set_output(Some(Output::writer(Meddling::new(
                tracker,
                Meddle::Release(first),
            ))))
            .unwrap();

        // SAFETY: The purged blocks are never used again.
        unsafe { tracker.purge_remaining() }.unwrap();

        // The writer released the first block while the purge announced itself.
        let stats = tracker.stats().unwrap();
        assert_eq!(stats.releases(), 1);
        assert_eq!(stats.bytes_released(), 24);
        assert!(tracker.snapshot_records().unwrap().is_empty());
    }

    fn warnings(logs: &SharedBuffer) -> usize {
        logs.contents()
            .lines()
            .filter(|line| line.contains("WARN"))
            .count()
    }

    #[test]
    fn untracked_addresses_are_logged_as_warnings() {
        let logs = SharedBuffer::new();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_max_level(Level::WARN)
            .without_time()
            .finish();

        let tracker = Tracker::with_config(Config::new().critical_output(false));
        tracker.set_output(None).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            // SAFETY: Null is always acceptable.
            unsafe { tracker.release(ptr::null_mut()) };
            assert_eq!(warnings(&logs), 0);

            let foreign = LibcAllocator.acquire(16);
            // SAFETY: The block comes from the same raw allocator the tracker uses.
            unsafe { tracker.release(foreign) };
            assert_eq!(warnings(&logs), 1);

            let foreign = LibcAllocator.acquire(16);
            // SAFETY: The block comes from the same raw allocator the tracker uses.
            let resized = unsafe { tracker.resize(foreign, 32) };
            assert_eq!(warnings(&logs), 2);

            // From here on the block is tracked.
            // SAFETY: Resized above, not yet released.
            unsafe { tracker.release(resized) };
            assert_eq!(warnings(&logs), 2);

            // SAFETY: Resizing null acquires a new block.
            let fresh = unsafe { tracker.resize(ptr::null_mut(), 8) };
            // SAFETY: Acquired above, not yet released.
            unsafe { tracker.release(fresh) };
            assert_eq!(warnings(&logs), 2);

            // The global allocator hook sees unknown blocks all the time.
            let foreign = LibcAllocator.acquire(16);
            // SAFETY: The block comes from the same raw allocator the tracker uses.
            unsafe { tracker.release_for(Caller::Hook, Site::GLOBAL_ALLOCATOR, foreign) };
            assert_eq!(warnings(&logs), 2);
        });

        let logs = logs.contents();
        assert!(logs.contains("release of an address with no tracked record"));
        assert!(logs.contains("resize of an address with no tracked record"));
    }

    #[test]
    fn passthrough_records_nothing() {
        let tracker = Tracker::with_config(Config::new().passthrough(true));
        let output = with_buffer(&tracker);

        let leaked = tracker.acquire(8);

        assert!(!tracker.is_tracking().unwrap());
        assert_eq!(tracker.report().unwrap(), Balance::Balanced);
        assert!(!output.contents().contains("[ACQUIRE]"));

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(leaked) };
    }

    #[test]
    fn disabled_diagnostics_still_write_reports() {
        let tracker = Tracker::with_config(Config::new().diagnostics(false));
        let output = with_buffer(&tracker);

        let block = tracker.acquire(8);
        assert_eq!(output.contents(), "");

        assert_eq!(tracker.report().unwrap(), Balance::Imbalanced);
        assert!(output.contents().contains("MISSING 1 release(s)"));

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
    }

    #[test]
    fn calls_from_inside_bookkeeping_are_forwarded_or_refused() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        {
            let _inside = ReentrancyGuard::enter();

            let block = tracker.acquire(8);
            assert!(!block.is_null());
            // SAFETY: Acquired above, not yet released.
            unsafe { tracker.release(block) };

            assert!(matches!(tracker.stats(), Err(Error::Reentrant)));
            assert!(matches!(tracker.set_tracking(false), Err(Error::Reentrant)));
        }

        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
        assert!(tracker.is_tracking().unwrap());
    }

    #[test]
    fn output_switching() {
        let tracker = Tracker::new();
        assert_eq!(tracker.output().unwrap(), OutputKind::Stdout);

        tracker.set_output(None).unwrap();
        assert_eq!(tracker.output().unwrap(), OutputKind::Discard);

        tracker.set_output(Some(Output::Stderr)).unwrap();
        assert_eq!(tracker.output().unwrap(), OutputKind::Stderr);

        let _buffer = with_buffer(&tracker);
        assert_eq!(tracker.output().unwrap(), OutputKind::Custom);
    }

    #[test]
    fn cleanup_resets_everything() {
        let tracker = Tracker::new();
        tracker.set_output(None).unwrap();

        let leaked = tracker.acquire(40);
        tracker.set_tracking(false).unwrap();

        tracker.cleanup().unwrap();

        assert_eq!(tracker.output().unwrap(), OutputKind::Stdout);
        assert!(tracker.snapshot_records().unwrap().is_empty());
        assert_eq!(tracker.stats().unwrap(), StatsSnapshot::default());
        assert!(tracker.is_tracking().unwrap());

        // Still usable afterwards.
        tracker.set_output(None).unwrap();
        let block = tracker.acquire(8);
        assert_eq!(tracker.snapshot_records().unwrap().len(), 1);

        // SAFETY: Both blocks came from the C library allocator and are not used again.
        unsafe {
            tracker.release(block);
        }
        // SAFETY: As above. The tracker forgot this one, so it goes straight to the allocator.
        unsafe {
            LibcAllocator.release(leaked);
        }
    }

    #[test]
    fn cleanup_purges_when_configured() {
        // SAFETY: Outstanding blocks are not used after cleanup.
        let config = unsafe { Config::new().purge_on_cleanup(true) };
        let tracker = Tracker::with_config(config);
        let output = with_buffer(&tracker);

        _ = tracker.acquire(8);
        _ = tracker.acquire(16);

        tracker.cleanup().unwrap();

        assert!(output.contents().contains("-=[! Purging remaining records... !]=-"));
        assert!(tracker.snapshot_records().unwrap().is_empty());
    }

    #[test]
    fn report_lists_outstanding_blocks_with_contents() {
        let tracker = Tracker::new();
        let output = with_buffer(&tracker);

        let block = tracker.acquire_at(site(77), 32);
        // SAFETY: The block is 32 bytes and exclusively ours.
        unsafe { ptr::copy_nonoverlapping(b"still here\0".as_ptr(), block, 11) };

        assert_eq!(tracker.report().unwrap(), Balance::Imbalanced);

        let text = output.contents();
        assert!(text.contains(&format!(
            "  > {:#x} {{n=32 (0x20)}} :: FROM: main.c ; L77  (first 20 bytes...  |still here|)",
            block.expose_provenance()
        )));
        assert!(text.contains("DIFF 32 bytes (0x20)"));

        // SAFETY: Acquired above, not yet released.
        unsafe { tracker.release(block) };
    }
}
