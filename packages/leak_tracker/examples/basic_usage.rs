//! Tracks a handful of blocks by calling a tracker directly and prints the resulting report.
//!
//! One block is deliberately never released, so the report shows it as outstanding together
//! with a preview of its contents. The tracker purges it on cleanup.
//!
//! Run with: `cargo run --example basic_usage`

use leak_tracker::{Config, Tracker};

fn main() {
    // SAFETY: Nothing uses the leaked block after cleanup.
    let tracker = Tracker::with_config(unsafe { Config::new().purge_on_cleanup(true) });

    let greeting = tracker.acquire(32);
    let message = b"hello, leaks\0";
    // SAFETY: The block is 32 bytes, the message is shorter.
    unsafe { greeting.copy_from_nonoverlapping(message.as_ptr(), message.len()) };

    let table = tracker.zero_acquire(16, 8);
    // SAFETY: Acquired above, not yet released.
    let table = unsafe { tracker.resize(table, 256) };
    // SAFETY: Resized above, not yet released.
    unsafe { tracker.release(table) };

    let balance = tracker.report().unwrap();
    println!();
    println!("Balanced: {}", balance.is_balanced());

    tracker.cleanup().unwrap();
}
