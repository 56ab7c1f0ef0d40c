//! Lexical environment frames: `{header, parent, values}` where `values`
//! is an alternating symbol/value cons chain, per spec.md §3 and §4.
//!
//! Lookup walks the frame chain outward (innermost frame first, following
//! `parent`), comparing symbols by name rather than by pointer identity —
//! the analyzer may re-intern the same symbol text in different arenas, so
//! pointer equality would wrongly treat two occurrences of the same name
//! as distinct bindings.

use crate::value::{rt_car, rt_cdr, rt_is_pair, rt_make_environment, rt_make_pair, rt_symbol_extract_string};
use el_core::TaggedValue;
use std::ffi::CStr;

#[unsafe(no_mangle)]
pub extern "C" fn rt_environment_add(env: TaggedValue, sym: TaggedValue, val: TaggedValue) -> TaggedValue {
    let ptr = env.as_object_ptr() as *mut crate::objects::EnvironmentObject;
    let binding = rt_make_pair(sym, val);
    let new_values = rt_make_pair(binding, unsafe { (*ptr).values });
    unsafe { (*ptr).values = new_values };
    env
}

/// `rt_environment_get` — walk `env`'s frame chain looking for `sym`.
///
/// # Panics
/// Panics (raised as a runtime exception by the calling convention once
/// `exceptions.rs` wraps this) if `sym` is unbound in every frame, per
/// spec.md §7's "environment lookup failure of an unbound symbol".
#[unsafe(no_mangle)]
pub extern "C" fn rt_environment_get(env: TaggedValue, sym: TaggedValue) -> TaggedValue {
    let target = unsafe { CStr::from_ptr(rt_symbol_extract_string(sym)) }
        .to_string_lossy()
        .into_owned();

    let mut frame = env;
    while !frame.is_nil() {
        let ptr = frame.as_object_ptr() as *const crate::objects::EnvironmentObject;
        let mut bindings = unsafe { (*ptr).values };
        while rt_is_pair(bindings) {
            let binding = rt_car(bindings);
            let bound_sym = rt_car(binding);
            let name = unsafe { CStr::from_ptr(rt_symbol_extract_string(bound_sym)) }.to_string_lossy();
            if name == target {
                return rt_cdr(binding);
            }
            bindings = rt_cdr(bindings);
        }
        frame = unsafe { (*ptr).parent };
    }

    crate::error::set_runtime_error(format!("unbound symbol: {target}"));
    TaggedValue::NIL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{self, GcMode};
    use crate::value::{rt_make_integer, rt_make_symbol};
    use std::ffi::CString;

    fn with_fresh_gc<R>(f: impl FnOnce() -> R) -> R {
        gc::init(GcMode::InterpreterOwned);
        let result = f();
        gc::deinit();
        result
    }

    fn sym(name: &str) -> TaggedValue {
        let c = CString::new(name).unwrap();
        unsafe { rt_make_symbol(c.as_ptr()) }
    }

    #[test]
    fn lookup_finds_binding_in_own_frame() {
        with_fresh_gc(|| {
            let env = rt_make_environment(TaggedValue::NIL);
            rt_environment_add(env, sym("x"), rt_make_integer(1));
            assert_eq!(
                crate::value::rt_integer_value(rt_environment_get(env, sym("x"))),
                1
            );
        });
    }

    #[test]
    fn lookup_falls_through_to_parent() {
        with_fresh_gc(|| {
            let parent = rt_make_environment(TaggedValue::NIL);
            rt_environment_add(parent, sym("x"), rt_make_integer(7));
            let child = rt_make_environment(parent);
            assert_eq!(
                crate::value::rt_integer_value(rt_environment_get(child, sym("x"))),
                7
            );
        });
    }

    #[test]
    fn inner_binding_shadows_outer() {
        with_fresh_gc(|| {
            let parent = rt_make_environment(TaggedValue::NIL);
            rt_environment_add(parent, sym("x"), rt_make_integer(1));
            let child = rt_make_environment(parent);
            rt_environment_add(child, sym("x"), rt_make_integer(2));
            assert_eq!(
                crate::value::rt_integer_value(rt_environment_get(child, sym("x"))),
                2
            );
        });
    }

    #[test]
    fn unbound_symbol_sets_runtime_error() {
        with_fresh_gc(|| {
            crate::error::clear_runtime_error();
            let env = rt_make_environment(TaggedValue::NIL);
            let result = rt_environment_get(env, sym("missing"));
            assert!(result.is_nil());
            assert!(crate::error::has_runtime_error());
        });
    }
}
