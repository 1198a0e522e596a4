//! Tracker core: configuration, atomics, mutex, and the two live tables.

use std::alloc::GlobalAlloc;
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::fatal::fatal_assert;
use crate::level::{clamp_frames_per_stack, TraceLevel};
use crate::record::{alloc_one, free_one, AllocationRecord};
use crate::stack::{fingerprint, StackRecord};
use crate::walker::{capture, probe_capture_available, SKIP_PREFIX};

thread_local! {
    /// Re-entrancy guard: set for the duration of any tracer-internal work
    /// that might itself allocate (stack capture, symbol resolution, the
    /// mutex-guarded table operations). Nested allocator calls observed on
    /// the same thread while this is set bypass tracking entirely — the real
    /// allocation still happens, it is just not attributed to anyone. See
    /// SPEC_FULL.md §4.2 for why this is load-bearing rather than cosmetic.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` with the re-entrancy guard held, unless it is already held on
/// this thread, in which case `f` is skipped entirely and `default` is
/// returned instead.
pub(crate) fn guarded<R>(default: R, f: impl FnOnce() -> R) -> R {
    IN_TRACKER.with(|flag| {
        if flag.get() {
            return default;
        }
        flag.set(true);
        let result = f();
        flag.set(false);
        result
    })
}

/// Whether the current thread is already inside [`guarded`] work. Used by
/// the one-time stack-capture probe to avoid recursing into
/// `OnceLock::get_or_init`, which std documents as a deadlock on reentry.
pub(crate) fn is_in_tracker() -> bool {
    IN_TRACKER.with(|flag| flag.get())
}

/// The two live tables, guarded together by one mutex as specified.
struct Inner {
    allocs: HashMap<usize, NonNull<AllocationRecord>>,
    stacks: HashMap<u64, NonNull<StackRecord>>,
}

// The pointers inside `Inner` are exclusively owned by the tracer and only
// ever touched while holding the surrounding `Mutex`.
unsafe impl Send for Inner {}

/// Tracker core: holds configuration, atomics, mutex, and the allocation map
/// plus stack registry. Implements track/untrack; the reporter (in
/// `crate::report`) reads its tables directly while holding the same mutex.
///
/// The tables and the stack-capture-availability probe are lazily
/// initialized behind [`OnceLock`], rather than built eagerly in the
/// constructor: `HashMap`'s default hasher draws its seed at runtime, which
/// cannot happen in a `const fn`, and [`TracerState::new`] must stay `const`
/// so a [`crate::TracingAllocator`] wrapping it can be installed via
/// `#[global_allocator] static ALLOCATOR: ... = ...;`.
pub(crate) struct TracerState<B> {
    pub bookkeeping: B,
    requested_level: TraceLevel,
    pub frames_per_stack: usize,
    live_bytes: AtomicUsize,
    seq: AtomicU64,
    stacks_capture_ok: OnceLock<bool>,
    inner: OnceLock<Mutex<Inner>>,
}

impl<B: GlobalAlloc> TracerState<B> {
    /// Constructs tracker state for the given level and frame budget.
    pub const fn new(bookkeeping: B, requested_level: TraceLevel, frames_per_stack: usize) -> Self {
        Self {
            bookkeeping,
            requested_level,
            frames_per_stack: clamp_frames_per_stack(frames_per_stack),
            live_bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            stacks_capture_ok: OnceLock::new(),
            inner: OnceLock::new(),
        }
    }

    fn tables(&self) -> &Mutex<Inner> {
        self.inner.get_or_init(|| {
            Mutex::new(Inner {
                allocs: HashMap::new(),
                stacks: HashMap::new(),
            })
        })
    }

    /// The effective trace level: the requested level, clamped down from
    /// `Stacks` to `Bytes` the first time stack capture turns out to be
    /// unavailable on this platform (§4.1).
    pub fn level(&self) -> TraceLevel {
        if self.requested_level == TraceLevel::Stacks && !self.stacks_capture_available() {
            TraceLevel::Bytes
        } else {
            self.requested_level
        }
    }

    /// Runs the stack-capture-availability probe at most once. The probe
    /// itself runs inside [`guarded`], since `backtrace::trace` may allocate
    /// internally the first time it runs on a thread; if it does, the nested
    /// allocation calls back into [`TracerState::track`], which calls
    /// `level()` again before the `OnceLock` has finished initializing. The
    /// `is_in_tracker` fast path short-circuits that nested call instead of
    /// letting it reach `get_or_init` a second time, which would deadlock.
    fn stacks_capture_available(&self) -> bool {
        if let Some(&ok) = self.stacks_capture_ok.get() {
            return ok;
        }
        if is_in_tracker() {
            return true;
        }
        *self
            .stacks_capture_ok
            .get_or_init(|| guarded(true, probe_capture_available))
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_count(&self) -> usize {
        self.tables().lock().allocs.len()
    }

    /// Records a new live allocation at `address` of `size` bytes. No-op at
    /// `TraceLevel::None`. Skips tracking entirely (but never the real
    /// allocation) if re-entered on the same thread — see [`guarded`].
    pub fn track(&self, address: usize, size: usize) {
        if self.level() == TraceLevel::None {
            return;
        }
        guarded((), || self.track_inner(address, size));
    }

    fn track_inner(&self, address: usize, size: usize) {
        self.live_bytes.fetch_add(size, Ordering::Relaxed);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut record = AllocationRecord::new(size, seq);

        if self.level() == TraceLevel::Stacks {
            // Skip the two frames belonging to this function and the
            // façade's vtable entry that called it (§4.2).
            let frames = capture(SKIP_PREFIX, self.frames_per_stack);
            if !frames.is_empty() {
                let fp = fingerprint(&frames);
                record.stack_fingerprint = fp;

                let mut guard = self.tables().lock();
                if !guard.stacks.contains_key(&fp) {
                    // SAFETY: freed in `Drop` against the same `bookkeeping`.
                    let stack =
                        unsafe { StackRecord::new(&self.bookkeeping, &frames, self.frames_per_stack) };
                    let ptr = unsafe { alloc_one(&self.bookkeeping, stack) };
                    guard.stacks.insert(fp, ptr);
                }
                drop(guard);
            }
        }

        // SAFETY: freed on the matching `untrack` or in `Drop`.
        let ptr = unsafe { alloc_one(&self.bookkeeping, record) };
        let mut guard = self.tables().lock();
        let prior = guard.allocs.insert(address, ptr);
        fatal_assert!(prior.is_none(), "duplicate address tracked twice");
    }

    /// Forgets a live allocation at `address`. A lookup miss is tolerated
    /// silently: clients may have allocated through `U` before the tracer was
    /// installed (§4.2).
    pub fn untrack(&self, address: usize) {
        if self.level() == TraceLevel::None {
            return;
        }
        guarded((), || self.untrack_inner(address));
    }

    fn untrack_inner(&self, address: usize) {
        let mut guard = self.tables().lock();
        if let Some(ptr) = guard.allocs.remove(&address) {
            drop(guard);
            let size = unsafe { ptr.as_ref().size };
            self.live_bytes.fetch_sub(size, Ordering::Relaxed);
            unsafe { free_one(&self.bookkeeping, ptr) };
        }
    }

    /// Runs `f` with the live tables locked, for the reporter's use. `f`
    /// itself runs under the re-entrancy guard so that any allocations
    /// performed while symbolizing do not recurse back into tracking (and,
    /// since the mutex is already held, would otherwise deadlock).
    pub fn with_tables<R>(&self, f: impl FnOnce(&TablesView<'_, B>) -> R) -> R {
        guarded(None, || {
            let guard = self.tables().lock();
            Some(f(&TablesView {
                state: self,
                allocs: &guard.allocs,
                stacks: &guard.stacks,
            }))
        })
        .expect("with_tables must not be called re-entrantly")
    }
}

/// A read view over the locked tables, handed to the reporter. Borrows from
/// the mutex guard that produced it, so the raw pointers inside `allocs` and
/// `stacks` are valid for the view's whole lifetime.
pub(crate) struct TablesView<'a, B> {
    pub state: &'a TracerState<B>,
    pub allocs: &'a HashMap<usize, NonNull<AllocationRecord>>,
    pub stacks: &'a HashMap<u64, NonNull<StackRecord>>,
}

impl<'a, B> TablesView<'a, B> {
    pub fn alloc_record(&self, ptr: NonNull<AllocationRecord>) -> &'a AllocationRecord {
        // SAFETY: `ptr` came from `self.allocs`, which is only mutated while
        // holding the same mutex that backs this view; the record it points
        // to is therefore alive for at least `'a`.
        unsafe { &*ptr.as_ptr() }
    }

    pub fn stack_record(&self, ptr: NonNull<StackRecord>) -> &'a StackRecord {
        // SAFETY: same reasoning as `alloc_record`, for `self.stacks`.
        unsafe { &*ptr.as_ptr() }
    }
}

impl<B: GlobalAlloc> Drop for TracerState<B> {
    fn drop(&mut self) {
        // Defensive: the caller is responsible for quiescing traffic before
        // teardown, but we take the lock anyway, matching the source.
        let mut guard = self.tables().lock();
        for (_, ptr) in guard.allocs.drain() {
            unsafe { free_one(&self.bookkeeping, ptr) };
        }
        for (_, ptr) in guard.stacks.drain() {
            unsafe {
                (*ptr.as_ptr()).free(&self.bookkeeping);
                free_one(&self.bookkeeping, ptr);
            }
        }
    }
}
