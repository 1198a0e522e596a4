//! An instrumented global allocator that tracks live allocations and
//! attributes leaks to call sites.
//!
//! [`TracingAllocator`] wraps an inner [`GlobalAlloc`] and interposes on
//! every `alloc`/`dealloc`/`alloc_zeroed`/`realloc` that passes through it,
//! maintaining a live-allocation map under a separate *bookkeeping*
//! allocator. At [`TraceLevel::Stacks`] it also captures and deduplicates
//! call stacks, so that [`TracingAllocator::dump`] can attribute leaked bytes
//! back to the sites that allocated them.
//!
//! ## Usage
//! ```
//! use std::alloc::System;
//! use tracing_allocations::{TraceLevel, TracerConfig, TracingAllocator};
//!
//! #[global_allocator]
//! static ALLOCATOR: TracingAllocator<System> =
//!     TracingAllocator::new(System, TracerConfig::new(TraceLevel::Bytes, 0));
//!
//! fn main() {
//!     ALLOCATOR.dump();
//! }
//! ```

mod fatal;
mod level;
mod record;
mod report;
mod stack;
mod state;
mod walker;
mod symbolize;

use std::alloc::{GlobalAlloc, Layout, System};

pub use level::TraceLevel;
use state::TracerState;

/// Configuration for a [`TracingAllocator`]: the desired fidelity, the frame
/// budget for captured stacks, and the allocator used to back the tracer's
/// own bookkeeping.
pub struct TracerConfig<B = System> {
    pub level: TraceLevel,
    /// Maximum frames captured per stack at [`TraceLevel::Stacks`]. `0` means
    /// "use the default"; values above the ceiling are capped. See
    /// `level::clamp_frames_per_stack`.
    pub frames_per_stack: usize,
    /// The allocator that backs the tracer's own metadata (allocation
    /// records and captured stacks), kept separate from the allocator being
    /// traced so that tracer bookkeeping never shows up as client traffic.
    pub bookkeeping: B,
}

impl TracerConfig<System> {
    /// Convenience constructor for the common case of bookkeeping against
    /// [`System`].
    pub const fn new(level: TraceLevel, frames_per_stack: usize) -> Self {
        Self {
            level,
            frames_per_stack,
            bookkeeping: System,
        }
    }
}

impl<B> TracerConfig<B> {
    /// Constructs a configuration with an explicit bookkeeping allocator.
    pub const fn with_bookkeeping(level: TraceLevel, frames_per_stack: usize, bookkeeping: B) -> Self {
        Self {
            level,
            frames_per_stack,
            bookkeeping,
        }
    }
}

/// A [`GlobalAlloc`] façade that tracks every live allocation made through
/// it, and can report leaks attributed to call sites at teardown or on
/// demand.
///
/// `U` is the allocator that actually services allocation requests. `B` is
/// the allocator the tracer uses for its own metadata; it defaults to
/// [`System`] and is almost always left at the default unless `U` itself is
/// [`System`] and you want tracer metadata to route elsewhere for
/// visibility in an external profiler.
#[non_exhaustive]
pub struct TracingAllocator<U, B = System> {
    inner: U,
    state: TracerState<B>,
}

impl<U> TracingAllocator<U, System> {
    /// Constructs a tracing allocator wrapping `inner`, configured by
    /// `config`.
    ///
    /// ## Usage
    /// ```
    /// use std::alloc::System;
    /// use tracing_allocations::{TraceLevel, TracerConfig, TracingAllocator};
    ///
    /// #[global_allocator]
    /// static ALLOCATOR: TracingAllocator<System> =
    ///     TracingAllocator::new(System, TracerConfig::new(TraceLevel::Stacks, 16));
    /// ```
    pub const fn new(inner: U, config: TracerConfig<System>) -> Self {
        Self {
            inner,
            state: TracerState::new(config.bookkeeping, config.level, config.frames_per_stack),
        }
    }
}

impl<U, B: GlobalAlloc> TracingAllocator<U, B> {
    /// Constructs a tracing allocator with an explicit bookkeeping allocator
    /// distinct from [`System`].
    pub const fn with_bookkeeping(inner: U, config: TracerConfig<B>) -> Self {
        Self {
            inner,
            state: TracerState::new(config.bookkeeping, config.level, config.frames_per_stack),
        }
    }

    /// Consumes the tracer, freeing all bookkeeping metadata, and returns
    /// the wrapped allocator. Per the tracer's non-goal of not managing
    /// client memory, any allocations still live through `inner` are left
    /// exactly as they are — only the tracer's own records are released.
    pub fn into_inner(self) -> U {
        self.inner
    }

    /// The wrapped allocator, if you need to delegate to it directly.
    pub fn inner(&self) -> &U {
        &self.inner
    }

    /// Total bytes currently tracked as live. Always `0` at
    /// [`TraceLevel::None`].
    pub fn live_bytes(&self) -> usize {
        self.state.live_bytes()
    }

    /// Count of allocations currently tracked as live. Always `0` at
    /// [`TraceLevel::None`].
    pub fn live_count(&self) -> usize {
        self.state.live_count()
    }

    /// Emits a leak report for everything currently live, through
    /// `tracing::trace!` at `target: "tracing_allocations::report"`. A no-op
    /// at [`TraceLevel::None`] or when nothing is live.
    pub fn dump(&self) {
        report::dump(&self.state)
    }
}

unsafe impl<U, B> GlobalAlloc for TracingAllocator<U, B>
where
    U: GlobalAlloc,
    B: GlobalAlloc,
{
    /// Allocates via the inner allocator, then records the new address and
    /// size (§4.4).
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            self.state.track(ptr as usize, layout.size());
        }
        ptr
    }

    /// Forgets the address, then deallocates via the inner allocator, per
    /// §4.4's `release(p)` sequence. For a plain free the allocation never
    /// moves, so untracking before or after the real call is externally
    /// indistinguishable; untrack-first is what the spec table specifies.
    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.state.untrack(ptr as usize);
        self.inner.dealloc(ptr, layout);
    }

    /// Allocates zeroed memory via the inner allocator, then records it
    /// exactly as [`alloc`](Self::alloc) does.
    #[track_caller]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.state.track(ptr as usize, layout.size());
        }
        ptr
    }

    /// Reallocates via the inner allocator first, then retracks: untracks
    /// `old_ptr` and tracks the (possibly identical) new address at
    /// `new_size`. Tracking is only touched on success; on failure the old
    /// block is still valid per `GlobalAlloc::realloc`'s contract, so the
    /// existing record is left exactly as it was (§4.4).
    #[track_caller]
    unsafe fn realloc(&self, old_ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(old_ptr, old_layout, new_size);
        if !new_ptr.is_null() {
            self.state.untrack(old_ptr as usize);
            self.state.track(new_ptr as usize, new_size);
        }
        new_ptr
    }
}
