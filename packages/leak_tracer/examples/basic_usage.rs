//! Tracks the allocations of one thread of a Rust program and prints a leak report.
//!
//! Run with: `cargo run --example basic_usage`

use std::collections::HashMap;
use std::hint::black_box;
use std::io;

use leak_tracer::{Allocator, intercept};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

fn main() {
    intercept::start_monitoring_this_thread();

    // Released before the report, so not a leak.
    let mut scratch = HashMap::new();
    for i in 0..100 {
        scratch.insert(i, format!("value {i}"));
    }
    black_box(&scratch);
    drop(scratch);

    // Never released.
    let greeting: &'static str =
        Box::leak(String::from("hello from a leaked string").into_boxed_str());
    black_box(greeting);

    intercept::stop_all_monitoring();

    println!("Leak report:");
    intercept::write_leaks(&mut io::stdout().lock()).unwrap();
}
