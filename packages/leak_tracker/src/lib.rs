#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Leak detection and allocation accounting for programs that want to know whether every byte
//! they acquire is eventually released.
//!
//! A [`Tracker`] sits between the program and a raw allocator. It forwards every acquire,
//! zero-acquire, resize and release request and records the address, size and source location
//! of each block that is handed out. At any point it can tell whether the program is balanced
//! and list everything that is still outstanding.
//!
//! The core functionality includes:
//! - [`Tracker`] - The tracking engine: interception, counters, reports and lifecycle control
//! - [`Allocator`] - A global allocator that routes every heap allocation through a tracker
//! - [`Report`] - Counters plus the outstanding blocks, oldest first
//! - [`SiteScope`] - Attributes allocations made through the global allocator to a location
//! - [`Config`] - Thread safety, diagnostic output and cleanup behavior
//!
//! This package is not meant for use in production, serving only as a development tool.
//!
//! # Simple usage
//!
//! Call the tracker directly to track individual blocks:
//!
//! ```
//! use leak_tracker::{Balance, Tracker};
//!
//! let tracker = Tracker::new();
//! // Discard the per-operation diagnostic lines.
//! tracker.set_output(None).unwrap();
//!
//! let block = tracker.acquire(64);
//! // SAFETY: The block was acquired from this tracker and not yet released.
//! let block = unsafe { tracker.resize(block, 128) };
//!
//! let mut report = Vec::new();
//! assert_eq!(tracker.report_to(&mut report).unwrap(), Balance::Imbalanced);
//!
//! // SAFETY: The block was resized by this tracker and not yet released.
//! unsafe { tracker.release(block) };
//! assert_eq!(tracker.report().unwrap(), Balance::Balanced);
//! ```
//!
//! # Tracking the whole program
//!
//! Register an [`Allocator`] as the global allocator to track every heap allocation:
//!
//! ```
//! use leak_tracker::{Allocator, Config, SiteScope, Tracker};
//!
//! static TRACKER: Tracker =
//!     Tracker::with_config(Config::new().thread_safe(true).diagnostics(false));
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator = Allocator::new(&TRACKER);
//!
//! fn main() {
//!     let _scope = SiteScope::enter();
//!     let _leaked: &mut [u8; 100] = Box::leak(Box::new([0_u8; 100]));
//!
//!     let records = TRACKER.snapshot_records().unwrap();
//!     assert!(records.iter().any(|r| r.size() == 100 && r.file() == file!()));
//! }
//! ```
//!
//! # Diagnostic output
//!
//! Every tracked operation writes one line to the current output (standard output by default),
//! for example:
//!
//! ```text
//! [ACQUIRE] 0x5581e8c4a2b0 {n=100} @ src/main.rs L12
//! [RESIZE ] 0x5581e8c4a2b0 {n=100} --> 0x5581e8c4a720 {n=200} @ src/main.rs L13
//! [RELEASE] 0x5581e8c4a720 {n=200} @ src/main.rs L14
//! ```
//!
//! Releasing or resizing an address the tracker does not know about additionally writes a
//! warning to standard error. Structured events are emitted through `tracing` for warnings,
//! lock failures and lifecycle changes.
//!
//! # Thread safety
//!
//! A tracker is single-threaded unless created with [`Config::thread_safe()`]. Direct calls on a
//! single-threaded tracker never block: if two threads use it at once, the losing operation
//! is abandoned and reported as [`Error::ConcurrentAccess`]. The global allocator hook cannot
//! give up on a request, so it waits in either mode.
//!
//! # Miri compatibility
//!
//! The tracker calls the C library allocator through FFI, so it cannot be executed under Miri.

mod allocator;
mod concurrency;
mod config;
mod error;
mod output;
mod pal;
mod record;
mod reentrancy;
mod registry;
mod report;
mod site;
mod stats;
mod tracker;

pub use allocator::*;
pub use config::*;
pub use error::*;
pub use output::{Output, OutputKind, SharedBuffer};
pub use pal::{LibcAllocator, RawAllocator};
pub use record::*;
pub use report::{Balance, ContentPreview, OutstandingBlock, Report};
pub use site::*;
pub use stats::{ByteBalance, CallBalance, StatsSnapshot};
pub use tracker::Tracker;
