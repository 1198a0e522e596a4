//! Trace level configuration.

/// Fidelity at which the tracer tracks allocations, ordered by increasing
/// cost and increasing detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    /// No bookkeeping at all; the façade is a transparent pass-through.
    None,
    /// Track live byte and allocation counts, but no per-site attribution.
    Bytes,
    /// Full fidelity: record size, timestamp, and a captured call stack per
    /// live allocation.
    Stacks,
}

/// Default target stack depth, used when `frames_per_stack` is requested as
/// zero.
pub const DEFAULT_FRAMES_PER_STACK: usize = 8;

/// Hard ceiling on the stack depth a caller may request.
pub const MAX_FRAMES_PER_STACK: usize = 128;

/// Clamps a requested frame budget per §4.3: zero means "use the default",
/// anything above the ceiling is capped.
pub const fn clamp_frames_per_stack(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_FRAMES_PER_STACK
    } else {
        requested.min(MAX_FRAMES_PER_STACK)
    }
}
