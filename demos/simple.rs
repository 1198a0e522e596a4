use std::alloc::System;

use tracing_allocations::{TraceLevel, TracerConfig, TracingAllocator};
use tracing_subscriber::prelude::*;

#[global_allocator]
static GLOBAL: TracingAllocator<System> =
    TracingAllocator::new(System, TracerConfig::new(TraceLevel::Stacks, 16));

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Leaked on purpose, so `dump` below has something to report.
    let leaked = Box::new([0u8; 64]);
    std::mem::forget(leaked);

    let kept = Box::new([0u8; 16]);

    println!(
        "live: {} bytes in {} allocations",
        GLOBAL.live_bytes(),
        GLOBAL.live_count()
    );

    GLOBAL.dump();

    drop(kept);
}
