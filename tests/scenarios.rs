use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::Arc;
use std::thread;

use tracing_allocations::{TraceLevel, TracerConfig, TracingAllocator};

fn layout(size: usize) -> Layout {
    Layout::from_size_align(size, 8).unwrap()
}

/// Scenario 1 — BYTES, simple leak: two acquires, release the first, expect
/// the second to remain live.
#[test]
fn bytes_simple_leak() {
    let tracer = TracingAllocator::new(System, TracerConfig::new(TraceLevel::Bytes, 0));
    unsafe {
        let a = tracer.alloc(layout(100));
        let b = tracer.alloc(layout(250));

        tracer.dealloc(a, layout(100));

        assert_eq!(tracer.live_bytes(), 250);
        assert_eq!(tracer.live_count(), 1);

        tracer.dealloc(b, layout(250));
    }
}

#[inline(never)]
unsafe fn alloc_at_site_alpha(tracer: &TracingAllocator<System>, l: Layout) -> *mut u8 {
    tracer.alloc(l)
}

#[inline(never)]
unsafe fn alloc_at_site_beta(tracer: &TracingAllocator<System>, l: Layout) -> *mut u8 {
    tracer.alloc(l)
}

/// Scenario 2 — STACKS, two sites: site alpha allocates 10 bytes three
/// times, site beta allocates 1000 bytes once. Bytes-leaked ranking should
/// put beta first; count-leaked ranking should put alpha first.
#[test]
fn stacks_two_sites_rank_differently_by_bytes_and_count() {
    let tracer = TracingAllocator::new(System, TracerConfig::new(TraceLevel::Stacks, 8));

    unsafe {
        let a1 = alloc_at_site_alpha(&tracer, layout(10));
        let a2 = alloc_at_site_alpha(&tracer, layout(10));
        let a3 = alloc_at_site_alpha(&tracer, layout(10));
        let b1 = alloc_at_site_beta(&tracer, layout(1000));

        assert_eq!(tracer.live_bytes(), 1030);
        assert_eq!(tracer.live_count(), 4);

        // Exercised indirectly through `dump`, which is exhaustively checked
        // at the unit level in `report`; here we only assert the underlying
        // totals the rankings are built from.
        tracer.dump();

        tracer.dealloc(a1, layout(10));
        tracer.dealloc(a2, layout(10));
        tracer.dealloc(a3, layout(10));
        tracer.dealloc(b1, layout(1000));
    }

    assert_eq!(tracer.live_bytes(), 0);
}

/// Scenario 3 — realloc in place (or moved): live bytes reflect only the new
/// size, keyed by whatever address the reallocation actually returned.
#[test]
fn realloc_updates_tracked_entry() {
    let tracer = TracingAllocator::new(System, TracerConfig::new(TraceLevel::Bytes, 0));
    unsafe {
        let p = tracer.alloc(layout(64));
        let q = tracer.realloc(p, layout(64), 128);
        assert!(!q.is_null());

        assert_eq!(tracer.live_bytes(), 128);
        assert_eq!(tracer.live_count(), 1);

        tracer.dealloc(q, layout(128));
    }
    assert_eq!(tracer.live_bytes(), 0);
}

/// Scenario 4 — untrack of a foreign pointer: an address allocated before
/// the tracer ever saw it must not abort or perturb totals when released
/// through the façade.
#[test]
fn untrack_of_pre_existing_allocation_is_tolerated() {
    let tracer = TracingAllocator::new(System, TracerConfig::new(TraceLevel::Bytes, 0));

    let foreign = unsafe { System.alloc(layout(32)) };
    assert!(!foreign.is_null());

    unsafe {
        tracer.dealloc(foreign, layout(32));
    }
    assert_eq!(tracer.live_bytes(), 0);
    assert_eq!(tracer.live_count(), 0);

    // The façade keeps working normally afterwards.
    unsafe {
        let p = tracer.alloc(layout(16));
        assert_eq!(tracer.live_bytes(), 16);
        tracer.dealloc(p, layout(16));
    }
    assert_eq!(tracer.live_bytes(), 0);
}

/// Scenario 5 — capture-unavailable clamp: on every platform this crate
/// supports, stack capture *is* available, so this exercises the unclamped
/// path; the clamp itself (`TracerState::level`) is covered directly in
/// `state`'s unit tests. Here we only check that `Stacks` still behaves
/// sanely end-to-end with a tiny frame budget.
#[test]
fn stacks_level_is_usable_with_a_minimal_frame_budget() {
    let tracer = TracingAllocator::new(System, TracerConfig::new(TraceLevel::Stacks, 1));
    unsafe {
        let p = tracer.alloc(layout(8));
        assert_eq!(tracer.live_count(), 1);
        tracer.dealloc(p, layout(8));
    }
    assert_eq!(tracer.live_bytes(), 0);
}

/// Scenario 6 — concurrent load: N threads each perform M paired
/// acquire/release of varying sizes; at join, nothing remains live.
#[test]
fn concurrent_paired_allocations_net_to_zero() {
    let tracer = Arc::new(TracingAllocator::new(
        System,
        TracerConfig::new(TraceLevel::Bytes, 0),
    ));

    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tracer = Arc::clone(&tracer);
            thread::spawn(move || unsafe {
                for r in 0..ROUNDS {
                    let size = 8 + ((t * 31 + r * 17) % 256);
                    let l = layout(size);
                    let p = tracer.alloc(l);
                    assert!(!p.is_null());
                    tracer.dealloc(p, l);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(tracer.live_bytes(), 0);
    assert_eq!(tracer.live_count(), 0);
}
