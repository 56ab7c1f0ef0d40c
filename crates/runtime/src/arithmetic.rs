//! Numeric and boolean primitives consumed by emitted code.
//!
//! Integer operands stay integers; a float operand on either side promotes
//! the whole operation to float, matching the usual Lisp-family numeric
//! tower (narrowest common representation). `rt_eq` is `=`-style value
//! equality (numeric value, or object identity for everything else), not
//! structural equality over lists — spec.md doesn't define list equality
//! as a runtime primitive, so this stays a thin, total predicate the
//! analyzer can build richer comparisons on top of.

use crate::exceptions::raise_runtime_error;
use crate::value::rt_float_value;
use el_core::TaggedValue;

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

fn as_number(val: TaggedValue) -> Number {
    if val.is_integer() {
        Number::Int(val.as_integer())
    } else if crate::value::rt_is_float(val) {
        Number::Float(rt_float_value(val))
    } else {
        unsafe { raise_runtime_error(&format!("not a number: {:#x}", val.0)) }
    }
}

fn to_tagged(n: Number) -> TaggedValue {
    match n {
        Number::Int(i) => TaggedValue::from_integer(i),
        Number::Float(f) => crate::value::rt_make_float(f),
    }
}

fn binary_numeric(a: TaggedValue, b: TaggedValue, int_op: impl Fn(i64, i64) -> i64, float_op: impl Fn(f64, f64) -> f64) -> TaggedValue {
    match (as_number(a), as_number(b)) {
        (Number::Int(x), Number::Int(y)) => to_tagged(Number::Int(int_op(x, y))),
        (Number::Int(x), Number::Float(y)) => to_tagged(Number::Float(float_op(x as f64, y))),
        (Number::Float(x), Number::Int(y)) => to_tagged(Number::Float(float_op(x, y as f64))),
        (Number::Float(x), Number::Float(y)) => to_tagged(Number::Float(float_op(x, y))),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_add(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    binary_numeric(a, b, |x, y| x.wrapping_add(y), |x, y| x + y)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_sub(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    binary_numeric(a, b, |x, y| x.wrapping_sub(y), |x, y| x - y)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_mul(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    binary_numeric(a, b, |x, y| x.wrapping_mul(y), |x, y| x * y)
}

/// `rt_div` — raises a `DivideByZero` exception for integer division by
/// zero; float division by zero follows IEEE 754 (`inf`/`nan`), matching
/// spec.md §7's runtime-error list ("division by zero" is the integer
/// case the analyzer can't rule out statically).
#[unsafe(no_mangle)]
pub extern "C" fn rt_div(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    match (as_number(a), as_number(b)) {
        (Number::Int(_), Number::Int(0)) => unsafe {
            raise_runtime_error("division by zero")
        },
        (Number::Int(x), Number::Int(y)) => to_tagged(Number::Int(x / y)),
        (Number::Int(x), Number::Float(y)) => to_tagged(Number::Float(x as f64 / y)),
        (Number::Float(x), Number::Int(y)) => to_tagged(Number::Float(x / y as f64)),
        (Number::Float(x), Number::Float(y)) => to_tagged(Number::Float(x / y)),
    }
}

/// `rt_eq` — numeric value equality for numbers, object identity
/// otherwise. Returns a tagged boolean (not a native `bool`) because,
/// unlike the `rt_is_*` tag checks, this is a user-facing `=` the
/// analyzer compiles straight from source and may bind to a variable.
#[unsafe(no_mangle)]
pub extern "C" fn rt_eq(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    let both_numbers = (a.is_integer() || crate::value::rt_is_float(a))
        && (b.is_integer() || crate::value::rt_is_float(b));
    let equal = if both_numbers {
        match (as_number(a), as_number(b)) {
            (Number::Int(x), Number::Int(y)) => x == y,
            (Number::Int(x), Number::Float(y)) => x as f64 == y,
            (Number::Float(x), Number::Int(y)) => x == y as f64,
            (Number::Float(x), Number::Float(y)) => x == y,
        }
    } else {
        a.0 == b.0
    };
    TaggedValue::from_bool(equal)
}

/// `rt_or` — short-circuit is handled by the analyzer/codegen; at the
/// primitive level this is a plain logical-or over truthiness.
#[unsafe(no_mangle)]
pub extern "C" fn rt_or(a: TaggedValue, b: TaggedValue) -> TaggedValue {
    TaggedValue::from_bool(a.is_truthy() || b.is_truthy())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_not(a: TaggedValue) -> TaggedValue {
    TaggedValue::from_bool(!a.is_truthy())
}

/// `rt_is_nil` — also user-facing (source-level `nil?`), so it returns a
/// tagged boolean like `rt_eq`/`rt_or`/`rt_not` rather than a native
/// `bool` the way the internal `value::rt_is_*` tag checks do.
#[unsafe(no_mangle)]
pub extern "C" fn rt_is_nil(a: TaggedValue) -> TaggedValue {
    TaggedValue::from_bool(a.is_nil())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{self, GcMode};
    use crate::value::{rt_integer_value, rt_make_float, rt_make_integer};

    fn with_fresh_gc<R>(f: impl FnOnce() -> R) -> R {
        gc::init(GcMode::InterpreterOwned);
        let result = f();
        gc::deinit();
        result
    }

    #[test]
    fn integer_add_stays_integer() {
        let sum = rt_add(rt_make_integer(2), rt_make_integer(3));
        assert!(sum.is_integer());
        assert_eq!(rt_integer_value(sum), 5);
    }

    #[test]
    fn mixed_add_promotes_to_float() {
        with_fresh_gc(|| {
            let sum = rt_add(rt_make_integer(2), rt_make_float(0.5));
            assert!(crate::value::rt_is_float(sum));
            assert_eq!(rt_float_value(sum), 2.5);
        });
    }

    #[test]
    fn eq_compares_numeric_value_across_representations() {
        with_fresh_gc(|| {
            let a = rt_make_integer(2);
            let b = rt_make_float(2.0);
            assert!(rt_eq(a, b).is_true());
        });
    }

    #[test]
    fn not_and_or_follow_truthiness() {
        assert!(rt_not(TaggedValue::FALSE).is_true());
        assert!(rt_not(TaggedValue::NIL).is_false());
        assert!(rt_or(TaggedValue::FALSE, TaggedValue::NIL).is_true());
        assert!(rt_or(TaggedValue::FALSE, TaggedValue::FALSE).is_false());
    }
}
