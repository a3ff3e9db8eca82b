//! Routes every heap allocation of the program through a tracker and lists what one piece of
//! code forgot to release.
//!
//! Run with: `cargo run --example global_allocator`

use std::io;

use leak_tracker::{Allocator, Config, SiteScope, Tracker};

static TRACKER: Tracker =
    Tracker::with_config(Config::new().thread_safe(true).diagnostics(false));

#[global_allocator]
static ALLOCATOR: Allocator = Allocator::new(&TRACKER);

fn build_names() -> Vec<String> {
    let _scope = SiteScope::enter();

    let names: Vec<String> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| (*name).to_owned())
        .collect();

    // Forgotten on purpose.
    let _forgotten: &mut Vec<String> = Box::leak(Box::new(names.clone()));

    names
}

fn main() {
    let names = build_names();
    println!("Built {} names", names.len());
    drop(names);

    let scoped: Vec<_> = TRACKER
        .snapshot_records()
        .unwrap()
        .into_iter()
        .filter(|record| record.file() == file!())
        .collect();

    println!("Blocks from this file still outstanding: {}", scoped.len());
    for record in scoped {
        println!("  {record}");
    }

    println!();
    TRACKER.report_to(&mut io::stdout()).unwrap();
}
