//! Leak reports: the counters of a tracker plus everything still outstanding.

use std::ffi::c_void;
use std::{fmt, ptr};

use crate::{AllocationRecord, ByteBalance, CallBalance, StatsSnapshot};

/// How many leading bytes of an outstanding block are shown in a report.
pub(crate) const PREVIEW_LEN: usize = 20;

const RULE: &str = "------------------------------------------";

/// Whether every tracked acquisition has been released.
///
/// Returned by [`Tracker::report()`][crate::Tracker::report] and [`Report::balance()`].
#[expect(
    clippy::exhaustive_enums,
    reason = "a registry is either empty or it is not"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Balance {
    /// No tracked allocation is outstanding.
    Balanced,

    /// At least one tracked allocation is outstanding.
    Imbalanced,
}

impl Balance {
    /// Whether this is [`Balance::Balanced`].
    #[must_use]
    pub const fn is_balanced(self) -> bool {
        matches!(self, Self::Balanced)
    }
}

/// The leading bytes of an outstanding block, captured when a report was taken.
///
/// Only the bytes up to the first NUL byte are kept, so blocks holding text show that text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContentPreview {
    bytes: [u8; PREVIEW_LEN],

    // How many bytes were looked at: the block size, capped at PREVIEW_LEN.
    window: usize,
}

impl ContentPreview {
    /// Copies the leading bytes of the block described by `record`.
    ///
    /// # Safety
    ///
    /// The block must still be live and valid for reads of
    /// `min(record.size(), PREVIEW_LEN)` bytes.
    pub(crate) unsafe fn capture(record: &AllocationRecord) -> Self {
        let window = record.size().min(PREVIEW_LEN);
        let mut bytes = [0_u8; PREVIEW_LEN];

        if window > 0 {
            // The block may never have been written to. Copying through the C library keeps
            // its contents opaque to the compiler, which is all a best-effort preview needs.
            // SAFETY: The caller guarantees the source is valid for `window` bytes and the
            // destination is a local array of at least that size.
            unsafe {
                libc::memcpy(
                    bytes.as_mut_ptr().cast(),
                    ptr::with_exposed_provenance::<c_void>(record.address()),
                    window,
                );
            }
        }

        Self { bytes, window }
    }

    /// The number of leading bytes that were looked at.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// The captured bytes, stopping at the first NUL byte.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let looked_at = self.bytes.get(..self.window).unwrap_or_default();

        looked_at.split(|&b| b == 0).next().unwrap_or_default()
    }
}

impl fmt::Display for ContentPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.as_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            };

            write!(f, "{c}")?;
        }

        Ok(())
    }
}

/// One allocation that was still outstanding when a report was taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutstandingBlock {
    record: AllocationRecord,
    preview: ContentPreview,
}

impl OutstandingBlock {
    pub(crate) const fn new(record: AllocationRecord, preview: ContentPreview) -> Self {
        Self { record, preview }
    }

    /// The record describing the block.
    #[must_use]
    pub const fn record(&self) -> &AllocationRecord {
        &self.record
    }

    /// The leading bytes of the block.
    #[must_use]
    pub const fn preview(&self) -> &ContentPreview {
        &self.preview
    }
}

impl fmt::Display for OutstandingBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.record.size();

        write!(
            f,
            "{:#x} {{n={size} ({size:#x})}} :: FROM: {} ; L{}  (first {} bytes...  |{}|)",
            self.record.address(),
            self.record.file(),
            self.record.line(),
            self.preview.window(),
            self.preview
        )
    }
}

/// A point-in-time account of a tracker: its counters and every allocation still outstanding,
/// oldest first.
///
/// Produced by [`Tracker::to_report()`][crate::Tracker::to_report]. The `Display` output is the
/// human-readable report that [`Tracker::report()`][crate::Tracker::report] writes.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Balance, Tracker};
///
/// let tracker = Tracker::new();
/// tracker.set_output(None).unwrap();
///
/// let block = tracker.acquire(100);
///
/// let report = tracker.to_report().unwrap();
/// assert_eq!(report.balance(), Balance::Imbalanced);
/// assert_eq!(report.outstanding().len(), 1);
/// assert_eq!(report.outstanding()[0].record().size(), 100);
///
/// // SAFETY: The block was acquired from this tracker and not yet released.
/// unsafe { tracker.release(block) };
/// assert!(tracker.to_report().unwrap().is_balanced());
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Report {
    stats: StatsSnapshot,
    outstanding: Vec<OutstandingBlock>,
}

impl Report {
    pub(crate) const fn new(stats: StatsSnapshot, outstanding: Vec<OutstandingBlock>) -> Self {
        Self { stats, outstanding }
    }

    /// The counters at the time of the report.
    #[must_use]
    pub const fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    /// The allocations that were outstanding, oldest first.
    #[must_use]
    pub fn outstanding(&self) -> &[OutstandingBlock] {
        &self.outstanding
    }

    /// [`Balance::Balanced`] if and only if nothing was outstanding.
    ///
    /// This looks only at the outstanding allocations. The counters can disagree with it, for
    /// example after [`Tracker::reset_stats()`][crate::Tracker::reset_stats].
    #[must_use]
    pub fn balance(&self) -> Balance {
        if self.outstanding.is_empty() {
            Balance::Balanced
        } else {
            Balance::Imbalanced
        }
    }

    /// Shorthand for `self.balance().is_balanced()`.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.balance().is_balanced()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.stats;

        writeln!(f)?;
        writeln!(f, "{RULE}")?;
        writeln!(f, " >     Displaying leak tracker stats:   <")?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "  - acquires:               {}", stats.acquires())?;
        writeln!(f, "  - zero-acquires:          {}", stats.zero_acquires())?;
        writeln!(f, "  - resizes:                {}", stats.resizes())?;
        writeln!(f, "     Total acquiring calls: {}", stats.acquiring_calls())?;
        writeln!(f, "     Total releasing calls: {}", stats.releases())?;
        writeln!(f, "{RULE}")?;

        match stats.call_balance() {
            CallBalance::Ok => writeln!(f, "                   OK.                  ")?,
            missing @ CallBalance::Missing(_) => writeln!(f, " ===> {missing}")?,
            surplus @ CallBalance::Surplus(_) => {
                writeln!(f, " ===> {surplus}")?;
                writeln!(f, " ===> THIS SHOULDN'T HAPPEN, CHECK LOGS")?;
            }
        }

        writeln!(f, "{RULE}")?;
        writeln!(f, "  - Total bytes acquired:   {}", stats.bytes_acquired())?;
        writeln!(f, "  - Total bytes released:   {}", stats.bytes_released())?;
        writeln!(f, "{RULE}")?;

        match stats.byte_balance() {
            ByteBalance::Ok => writeln!(f, "                   OK.                  ")?,
            diff @ ByteBalance::Diff(_) => writeln!(f, " ===> {diff}")?,
            surplus @ ByteBalance::Surplus(_) => {
                writeln!(f, " ===> {surplus}")?;
                writeln!(f, " ===> THIS SHOULDN'T HAPPEN, CHECK LOGS")?;
            }
        }

        writeln!(f, "{RULE}")?;
        writeln!(f)?;

        if self.outstanding.is_empty() {
            return Ok(());
        }

        writeln!(f)?;
        writeln!(f, "-=[ UNRELEASED ALLOCATIONS DETECTED. ]=-")?;
        writeln!(f)?;
        writeln!(f, "-=[ Displaying remaining records: ]=-")?;

        for block in &self.outstanding {
            writeln!(f, "  > {block}")?;
        }

        writeln!(f, "-=[ Remaining records over. ]=-")?;
        writeln!(f)
    }
}
