//! Stack capture, via the `backtrace` crate (as used by `kumo-server-memory`
//! and Servo's `AccountingAlloc` elsewhere in this pack).

/// Number of frames belonging to the tracer's own machinery that precede the
/// client's call site when a capture happens inside [`crate::state::TracerState::track`]:
/// the track routine itself, and the façade's `GlobalAlloc` vtable entry that
/// called it. Matches the source's `FRAMES_TO_SKIP`.
pub(crate) const SKIP_PREFIX: usize = 2;

/// Captures up to `target` frames beyond the first `skip`, in call order.
///
/// Marked `#[inline(always)]` so that, in an optimized build, this function
/// does not itself appear as an extra frame between the façade and
/// `backtrace::trace`'s own callback — keeping [`SKIP_PREFIX`] accurate. In
/// an unoptimized build an extra frame or two of our own may leak into the
/// captured stack; this is cosmetic (§4.5 already allows for a shallower- or
/// deeper-than-expected capture).
#[inline(always)]
pub(crate) fn capture(skip: usize, target: usize) -> Vec<usize> {
    if target == 0 {
        return Vec::new();
    }
    let mut frames = Vec::with_capacity(target);
    let mut seen = 0usize;
    backtrace::trace(|frame| {
        seen += 1;
        if seen <= skip {
            return true;
        }
        frames.push(frame.ip() as usize);
        frames.len() < target
    });
    frames
}

/// Probes whether stack capture is available on this platform at all, by
/// requesting a single frame with no skip. The C source does this with a
/// zero-depth request and checks for a zero return; requesting exactly zero
/// frames here would be vacuously empty regardless of platform support, so
/// we ask for one frame instead and treat an empty result as "unsupported".
pub(crate) fn probe_capture_available() -> bool {
    !capture(0, 1).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_respects_target_depth() {
        let frames = capture(0, 3);
        assert!(frames.len() <= 3);
    }

    #[test]
    fn capture_zero_target_yields_nothing() {
        assert!(capture(0, 0).is_empty());
    }

    #[test]
    fn probe_reports_availability() {
        // This only fails on platforms where `backtrace` cannot walk the
        // stack at all; on every platform CI runs this crate's tests on,
        // capture is available.
        assert!(probe_capture_available());
    }
}
