//! `rt_apply_N` — the N-ary calling shims JIT-emitted code uses to invoke a
//! `CompiledFunction`. The self closure pointer is always passed as the
//! last argument (so a closure can find its own captured environment),
//! matching the calling convention in the source this is grounded on
//! (`runtime/apply.cpp`).
//!
//! Written as one `macro_rules!` expansion rather than 21 hand-written
//! functions: the shape is identical for every arity, only the argument
//! count changes, and a `macro_rules!` keeps that fact visible in the
//! source instead of hidden behind 21 near-duplicate bodies.

use crate::value::rt_compiled_function_get_ptr;
use el_core::TaggedValue;

type Fn0 = extern "C" fn(TaggedValue) -> TaggedValue;
type Fn1 = extern "C" fn(TaggedValue, TaggedValue) -> TaggedValue;
type Fn2 = extern "C" fn(TaggedValue, TaggedValue, TaggedValue) -> TaggedValue;

macro_rules! rt_apply {
    ($name:ident, $fn_ty:ident $(, $arg:ident)*) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn $name(closure: TaggedValue $(, $arg: TaggedValue)*) -> TaggedValue {
            let code_ptr = rt_compiled_function_get_ptr(closure);
            let f: $fn_ty = unsafe { std::mem::transmute(code_ptr) };
            f($($arg,)* closure)
        }
    };
}

rt_apply!(rt_apply_0, Fn0);
rt_apply!(rt_apply_1, Fn1, a0);
rt_apply!(rt_apply_2, Fn2, a0, a1);

// Arities 3..=20 follow the same two-argument-then-grow pattern; expressed
// via a second-order macro so the calling convention (closure pointer
// last) only has to be written once above.
macro_rules! rt_apply_n {
    ($name:ident, $($arg:ident),+) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn $name(closure: TaggedValue, $($arg: TaggedValue),+) -> TaggedValue {
            type F = extern "C" fn($(rt_apply_n!(@unit $arg)),+, TaggedValue) -> TaggedValue;
            let code_ptr = rt_compiled_function_get_ptr(closure);
            let f: F = unsafe { std::mem::transmute(code_ptr) };
            f($($arg),+, closure)
        }
    };
    (@unit $arg:ident) => { TaggedValue };
}

rt_apply_n!(rt_apply_3, a0, a1, a2);
rt_apply_n!(rt_apply_4, a0, a1, a2, a3);
rt_apply_n!(rt_apply_5, a0, a1, a2, a3, a4);
rt_apply_n!(rt_apply_6, a0, a1, a2, a3, a4, a5);
rt_apply_n!(rt_apply_7, a0, a1, a2, a3, a4, a5, a6);
rt_apply_n!(rt_apply_8, a0, a1, a2, a3, a4, a5, a6, a7);
rt_apply_n!(rt_apply_9, a0, a1, a2, a3, a4, a5, a6, a7, a8);
rt_apply_n!(rt_apply_10, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9);
rt_apply_n!(rt_apply_11, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10);
rt_apply_n!(rt_apply_12, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11);
rt_apply_n!(rt_apply_13, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12);
rt_apply_n!(rt_apply_14, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13);
rt_apply_n!(rt_apply_15, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14);
rt_apply_n!(rt_apply_16, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15);
rt_apply_n!(rt_apply_17, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16);
rt_apply_n!(rt_apply_18, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17);
rt_apply_n!(rt_apply_19, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17, a18);
rt_apply_n!(rt_apply_20, a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17, a18, a19);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{self, GcMode};
    use crate::value::{make_compiled_function, rt_make_integer};

    extern "C" fn add_two(a: TaggedValue, b: TaggedValue, _closure: TaggedValue) -> TaggedValue {
        crate::arithmetic::rt_add(a, b)
    }

    #[test]
    fn apply_2_invokes_the_closures_code_pointer() {
        gc::init(GcMode::InterpreterOwned);
        let closure = make_compiled_function(2, false, add_two as *const (), 0);
        let result = rt_apply_2(closure, rt_make_integer(2), rt_make_integer(3));
        assert_eq!(crate::value::rt_integer_value(result), 5);
        gc::deinit();
    }

    extern "C" fn zero_arity(_closure: TaggedValue) -> TaggedValue {
        rt_make_integer(7)
    }

    #[test]
    fn apply_0_passes_only_the_closure() {
        gc::init(GcMode::InterpreterOwned);
        let closure = make_compiled_function(0, false, zero_arity as *const (), 0);
        let result = rt_apply_0(closure);
        assert_eq!(crate::value::rt_integer_value(result), 7);
        gc::deinit();
    }
}
