//! Thread-local diagnostic state for the runtime's `extern "C"` surface.
//!
//! `rt_`/`el_rt_` functions cannot propagate a `Result` across the FFI
//! boundary into JIT-emitted code, and spec.md §7 requires ill-typed calls
//! to raise a native `el` exception rather than abort the process. The
//! accessor that notices the type mismatch records a message here; the
//! caller (an `rt_throw`-wrapping shim, or a test harness) decides what to
//! do with it. This mirrors the teacher's `patch_seq_*` thread-local error
//! pattern, renamed to this runtime's symbol prefix.
//!
//! ```ignore
//! if !value.is_integer() {
//!     set_runtime_error(format!("expected integer, got tag {:#x}", value.0));
//!     return TaggedValue::NIL;
//! }
//! ```

use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_runtime_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

pub fn take_runtime_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_runtime_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_runtime_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// `rt_has_error` — exposed to JIT-emitted code so a call sequence can check
/// for a pending error without risking an FFI string round-trip.
#[unsafe(no_mangle)]
pub extern "C" fn rt_has_error() -> bool {
    has_runtime_error()
}

/// `rt_clear_error`
#[unsafe(no_mangle)]
pub extern "C" fn rt_clear_error() {
    clear_runtime_error();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_take_round_trips() {
        clear_runtime_error();
        assert!(!has_runtime_error());
        set_runtime_error("boom");
        assert!(has_runtime_error());
        assert_eq!(take_runtime_error().as_deref(), Some("boom"));
        assert!(!has_runtime_error());
    }
}
