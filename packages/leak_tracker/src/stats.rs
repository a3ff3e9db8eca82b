//! Operation counters and the balance computations derived from them.

use std::cmp::Ordering;
use std::fmt;

/// The counters of a tracker, updated by every tracked operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Stats {
    acquires: u64,
    zero_acquires: u64,
    resizes: u64,
    releases: u64,
    acquiring_calls: u64,
    bytes_acquired: u64,
    bytes_released: u64,
}

impl Stats {
    pub(crate) const fn new() -> Self {
        Self {
            acquires: 0,
            zero_acquires: 0,
            resizes: 0,
            releases: 0,
            acquiring_calls: 0,
            bytes_acquired: 0,
            bytes_released: 0,
        }
    }

    pub(crate) fn record_acquire(&mut self, size: usize) {
        self.acquires = self.acquires.saturating_add(1);
        self.record_acquiring_call(size);
    }

    pub(crate) fn record_zero_acquire(&mut self, size: usize) {
        self.zero_acquires = self.zero_acquires.saturating_add(1);
        self.record_acquiring_call(size);
    }

    /// A block of `old_size` bytes became `new_size` bytes.
    ///
    /// A block with a prior size of zero has never been counted as acquired (it was patched
    /// in for an untracked address), so resizing it counts as its first acquisition.
    pub(crate) fn record_resize(&mut self, old_size: usize, new_size: usize) {
        self.resizes = self.resizes.saturating_add(1);

        if old_size == 0 {
            self.acquiring_calls = self.acquiring_calls.saturating_add(1);
        }

        self.bytes_acquired = self
            .bytes_acquired
            .saturating_add(to_u64(new_size))
            .saturating_sub(to_u64(old_size));
    }

    pub(crate) fn record_release(&mut self, size: usize) {
        self.releases = self.releases.saturating_add(1);
        self.bytes_released = self.bytes_released.saturating_add(to_u64(size));
    }

    /// A release of an address that was never acquired through the tracker.
    ///
    /// Counted as a zero-size acquire immediately followed by its release, so that the
    /// call counts stay balanced despite the anomaly.
    pub(crate) fn record_untracked_release(&mut self) {
        self.record_acquire(0);
        self.record_release(0);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acquires: self.acquires,
            zero_acquires: self.zero_acquires,
            resizes: self.resizes,
            releases: self.releases,
            acquiring_calls: self.acquiring_calls,
            bytes_acquired: self.bytes_acquired,
            bytes_released: self.bytes_released,
        }
    }

    fn record_acquiring_call(&mut self, size: usize) {
        self.acquiring_calls = self.acquiring_calls.saturating_add(1);
        self.bytes_acquired = self.bytes_acquired.saturating_add(to_u64(size));
    }
}

fn to_u64(value: usize) -> u64 {
    value.try_into().expect("usize always fits into u64")
}

/// A point-in-time copy of the counters of a tracker.
///
/// # Examples
///
/// ```
/// use leak_tracker::{CallBalance, Tracker};
///
/// let tracker = Tracker::new();
/// tracker.set_output(None).unwrap();
///
/// let block = tracker.acquire(100);
/// let stats = tracker.stats().unwrap();
/// assert_eq!(stats.acquires(), 1);
/// assert_eq!(stats.call_balance(), CallBalance::Missing(1));
///
/// // SAFETY: The block was acquired from this tracker and not yet released.
/// unsafe { tracker.release(block) };
/// assert_eq!(tracker.stats().unwrap().call_balance(), CallBalance::Ok);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    acquires: u64,
    zero_acquires: u64,
    resizes: u64,
    releases: u64,
    acquiring_calls: u64,
    bytes_acquired: u64,
    bytes_released: u64,
}

impl StatsSnapshot {
    /// Number of successful tracked acquire operations.
    #[must_use]
    pub const fn acquires(&self) -> u64 {
        self.acquires
    }

    /// Number of successful tracked zero-acquire operations.
    #[must_use]
    pub const fn zero_acquires(&self) -> u64 {
        self.zero_acquires
    }

    /// Number of successful tracked resize operations.
    #[must_use]
    pub const fn resizes(&self) -> u64 {
        self.resizes
    }

    /// Number of tracked release operations, including purged blocks.
    #[must_use]
    pub const fn releases(&self) -> u64 {
        self.releases
    }

    /// Number of calls that brought a new block into existence from the point of view of
    /// the tracker: every acquire and zero-acquire, plus resizes of zero-size records.
    #[must_use]
    pub const fn acquiring_calls(&self) -> u64 {
        self.acquiring_calls
    }

    /// Net bytes acquired, including growth and shrinkage through resize.
    #[must_use]
    pub const fn bytes_acquired(&self) -> u64 {
        self.bytes_acquired
    }

    /// Bytes given back through release and purge.
    #[must_use]
    pub const fn bytes_released(&self) -> u64 {
        self.bytes_released
    }

    /// Compares acquiring calls with releasing calls.
    #[must_use]
    pub fn call_balance(&self) -> CallBalance {
        match self.acquiring_calls.cmp(&self.releases) {
            Ordering::Equal => CallBalance::Ok,
            Ordering::Greater => CallBalance::Missing(self.acquiring_calls.abs_diff(self.releases)),
            Ordering::Less => CallBalance::Surplus(self.releases.abs_diff(self.acquiring_calls)),
        }
    }

    /// Compares bytes acquired with bytes released.
    #[must_use]
    pub fn byte_balance(&self) -> ByteBalance {
        match self.bytes_acquired.cmp(&self.bytes_released) {
            Ordering::Equal => ByteBalance::Ok,
            Ordering::Greater => {
                ByteBalance::Diff(self.bytes_acquired.abs_diff(self.bytes_released))
            }
            Ordering::Less => {
                ByteBalance::Surplus(self.bytes_released.abs_diff(self.bytes_acquired))
            }
        }
    }
}

/// Classification of acquiring calls against releasing calls.
#[expect(
    clippy::exhaustive_enums,
    reason = "there are exactly three ways two counts can compare"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallBalance {
    /// Every acquiring call has a matching release.
    Ok,

    /// This many releases are missing.
    Missing(u64),

    /// There were this many more releases than acquiring calls.
    ///
    /// Releases of untracked addresses are compensated for, so this is only reachable if the
    /// counters were reset while blocks were outstanding.
    Surplus(u64),
}

impl fmt::Display for CallBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Missing(count) => write!(f, "MISSING {count} release(s)"),
            Self::Surplus(count) => write!(f, "SURPLUS {count} release(s)"),
        }
    }
}

/// Classification of bytes acquired against bytes released.
#[expect(
    clippy::exhaustive_enums,
    reason = "there are exactly three ways two totals can compare"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteBalance {
    /// All acquired bytes were released.
    Ok,

    /// This many acquired bytes were not released.
    Diff(u64),

    /// This many more bytes were released than acquired.
    Surplus(u64),
}

impl fmt::Display for ByteBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Diff(bytes) => write!(f, "DIFF {bytes} bytes ({bytes:#x})"),
            Self::Surplus(bytes) => write!(f, "SURPLUS {bytes} bytes ({bytes:#x})"),
        }
    }
}
