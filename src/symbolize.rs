//! Symbolization: turning raw instruction pointers back into human-readable
//! text, via `backtrace::resolve` (grounded on Servo's
//! `dump_unmeasured_allocations` and `kumo-server-memory`'s `Backtrace::resolve`
//! use elsewhere in this pack).

/// Resolves `frames` to one symbol line per frame, in call order, and joins
/// them with newlines. Per the symbolizer contract (§6), entries may resolve
/// to nothing; emission stops at the first frame that fails to resolve to a
/// non-empty name, rather than leaving a gap in the middle of the trace.
pub(crate) fn symbolize(frames: &[usize]) -> String {
    let mut lines = Vec::with_capacity(frames.len());
    for &ip in frames {
        let mut name = None;
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            if name.is_none() {
                if let Some(n) = symbol.name() {
                    let text = n.to_string();
                    if !text.is_empty() {
                        name = Some(text);
                    }
                }
            }
        });
        match name {
            Some(line) => lines.push(line),
            None => break,
        }
    }
    lines.join("\n")
}
