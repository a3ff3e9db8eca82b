//! Destinations for the diagnostic text stream.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// A destination for diagnostic lines and reports, chosen by the host.
///
/// Passed to [`Tracker::set_output()`][crate::Tracker::set_output]. Passing `None` there
/// instead makes the tracker open and manage a discard sink of its own.
#[non_exhaustive]
pub enum Output {
    /// The standard output stream of the process. This is the default.
    Stdout,

    /// The standard error stream of the process.
    Stderr,

    /// Any writer owned by the host, such as a file or a [`SharedBuffer`].
    ///
    /// The writer is called while the tracker is locked. It must not call back into the same
    /// tracker through anything other than the global allocator hook.
    Writer(Box<dyn Write + Send>),
}

impl Output {
    /// Wraps a host-provided writer.
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self::Writer(Box::new(writer))
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "Stdout"),
            Self::Stderr => write!(f, "Stderr"),
            Self::Writer(_) => write!(f, "Writer(..)"),
        }
    }
}

/// Describes the current output destination of a tracker.
///
/// Returned by [`Tracker::output()`][crate::Tracker::output].
#[expect(
    clippy::exhaustive_enums,
    reason = "mirrors the set of sinks a tracker can hold, which is closed"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputKind {
    /// The standard output stream.
    Stdout,

    /// The standard error stream.
    Stderr,

    /// A discard sink opened and owned by the tracker itself.
    Discard,

    /// A writer provided by the host.
    Custom,
}

/// The sink a tracker currently writes to.
pub(crate) enum Sink {
    Stdout,
    Stderr,

    // Self-managed: opened by the tracker, closed when switched away from or on cleanup.
    Discard(io::Sink),

    Custom(Box<dyn Write + Send>),
}

impl Sink {
    pub(crate) fn discard() -> Self {
        Self::Discard(io::sink())
    }

    pub(crate) fn kind(&self) -> OutputKind {
        match self {
            Self::Stdout => OutputKind::Stdout,
            Self::Stderr => OutputKind::Stderr,
            Self::Discard(_) => OutputKind::Discard,
            Self::Custom(_) => OutputKind::Custom,
        }
    }

    pub(crate) fn is_self_managed(&self) -> bool {
        matches!(self, Self::Discard(_))
    }

    /// Writes a fragment of diagnostic text and flushes it.
    ///
    /// The diagnostic stream is advisory, so write failures are deliberately dropped.
    pub(crate) fn emit(&mut self, args: fmt::Arguments<'_>) {
        _ = self.write_flushed(args);
    }

    /// Writes a fragment of text and flushes it, surfacing any I/O error.
    pub(crate) fn write_flushed(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout.write_fmt(args)?;
                stdout.flush()
            }
            Self::Stderr => {
                let mut stderr = io::stderr().lock();
                stderr.write_fmt(args)?;
                stderr.flush()
            }
            Self::Discard(sink) => sink.write_fmt(args),
            Self::Custom(writer) => {
                writer.write_fmt(args)?;
                writer.flush()
            }
        }
    }
}

impl From<Output> for Sink {
    fn from(output: Output) -> Self {
        match output {
            Output::Stdout => Self::Stdout,
            Output::Stderr => Self::Stderr,
            Output::Writer(writer) => Self::Custom(writer),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// An in-memory writer whose contents can be read back through any of its clones.
///
/// Useful for capturing the diagnostic stream of a tracker, for example in tests.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Output, SharedBuffer, Tracker};
///
/// let buffer = SharedBuffer::new();
/// let tracker = Tracker::new();
/// tracker.set_output(Some(Output::writer(buffer.clone()))).unwrap();
///
/// let block = tracker.acquire(8);
/// // SAFETY: The block was acquired from this tracker and not yet released.
/// unsafe { tracker.release(block) };
///
/// let diagnostics = buffer.contents();
/// assert!(diagnostics.contains("[ACQUIRE]"));
/// assert!(diagnostics.contains("[RELEASE]"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, with invalid UTF-8 replaced.
    #[must_use]
    pub fn contents(&self) -> String {
        // A panic while holding this lock cannot leave the bytes half-modified in a way that
        // matters for diagnostic text, so poisoning is ignored.
        let bytes = self
            .bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Discards everything written so far.
    pub fn clear(&self) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
