//! Constructors, predicates, and accessors over [`TaggedValue`]s.
//!
//! Every `rt_make_*` allocates through [`crate::gc`] and returns a tagged
//! object pointer; every `rt_is_*` is a cheap tag check; accessors assert
//! the tag matches (mirroring the panics `TaggedValue::as_integer` and
//! `as_object_ptr` already raise) because a mismatch here means emitted
//! code or the analyzer generated an ill-typed call, not a runtime-data
//! problem a caller can recover from by checking a return value.
//!
//! String-likes (`String`, `Symbol`, `Keyword`) share [`StrObject`]'s
//! layout but additionally null-terminate their trailing bytes so the
//! `*const c_char` accessors (`rt_string_value` and friends) can be handed
//! straight to C-ABI consumers without a second copy.

use crate::gc::with_gc;
use crate::objects::{
    compiled_function_size, CompiledFunctionObject, EnvironmentObject, InterpretedFunctionObject,
    PairObject, StrObject, VarObject,
};
use el_core::{ObjectHeader, ObjectTag, TaggedValue};
use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::raw::c_char;

unsafe fn alloc_object<T>(tag: ObjectTag, extra_bytes: usize) -> *mut T {
    let size = size_of::<T>() + extra_bytes;
    let ptr = unsafe { with_gc(|gc| gc.malloc_tagged_object(size)) } as *mut T;
    let header_ptr = ptr as *mut ObjectHeader;
    unsafe { header_ptr.write(ObjectHeader::new(tag)) };
    ptr
}

fn alloc_str_like(tag: ObjectTag, text: &str) -> TaggedValue {
    let len = text.len();
    // +1 for a trailing NUL so the raw text pointer is usable as a C string.
    let ptr = unsafe { alloc_object::<StrObject>(tag, len + 1) };
    unsafe {
        (*ptr).length = len as u64;
        let data = (ptr as *mut u8).add(size_of::<StrObject>());
        std::ptr::copy_nonoverlapping(text.as_ptr(), data, len);
        *data.add(len) = 0;
    }
    TaggedValue::from_object_ptr(ptr as *const ())
}

unsafe fn str_like_value<'a>(val: TaggedValue, expected: ObjectTag) -> &'a str {
    assert!(val.is_object(), "value {:#x} is not an object", val.0);
    let ptr = val.as_object_ptr() as *const StrObject;
    let tag = unsafe { (*(ptr as *const ObjectHeader)).object_tag() };
    assert_eq!(tag, expected, "value {:#x} is not a {:?}", val.0, expected);
    unsafe { StrObject::text(ptr) }
}

/// Read a `String`, `Symbol`, or `Keyword` value's text regardless of
/// which of the three it is, for call sites (like exception construction)
/// that accept any of them interchangeably.
///
/// # Safety
/// `val` must be a heap object tagged `String`, `Symbol`, or `Keyword`.
pub unsafe fn str_like_text(val: TaggedValue) -> String {
    assert!(val.is_object(), "value {:#x} is not an object", val.0);
    let ptr = val.as_object_ptr() as *const StrObject;
    let tag = header_tag_of(val);
    assert!(
        matches!(tag, Some(ObjectTag::String) | Some(ObjectTag::Symbol) | Some(ObjectTag::Keyword)),
        "value {:#x} is not string-like",
        val.0
    );
    unsafe { StrObject::text(ptr) }.to_string()
}

fn c_string_ptr(text: &str) -> *const c_char {
    // Safety net for embedded NULs that somehow survive the lexer's escape
    // processing: truncate rather than hand a malformed C string downstream.
    CString::new(text)
        .unwrap_or_else(|_| CString::new(text.replace('\0', "")).unwrap())
        .into_raw() as *const c_char
}

/// Like [`str_like_value`], but returns a pointer straight into the GC
/// object's own NUL-terminated tail (`alloc_str_like` always reserves one
/// trailing byte) instead of copying into a new, unfreed `CString`. Valid
/// for as long as `val`'s object is alive and not relocated (this GC never
/// moves objects).
unsafe fn str_like_c_ptr(val: TaggedValue, expected: ObjectTag) -> *const c_char {
    assert!(val.is_object(), "value {:#x} is not an object", val.0);
    let ptr = val.as_object_ptr() as *const StrObject;
    let tag = unsafe { (*(ptr as *const ObjectHeader)).object_tag() };
    assert_eq!(tag, expected, "value {:#x} is not a {:?}", val.0, expected);
    unsafe { (ptr as *const u8).add(size_of::<StrObject>()) as *const c_char }
}

// --- booleans -----------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_boolean(value: i8) -> TaggedValue {
    TaggedValue::from_bool(value != 0)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_boolean(val: TaggedValue) -> bool {
    val.is_boolean()
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_object(val: TaggedValue) -> bool {
    val.is_object()
}

// --- integers -------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_integer(value: i64) -> TaggedValue {
    TaggedValue::from_integer(value)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_integer(val: TaggedValue) -> bool {
    val.is_integer()
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_integer_value(val: TaggedValue) -> i64 {
    val.as_integer()
}

// --- floats -----------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_float(value: f64) -> TaggedValue {
    let ptr = unsafe { alloc_object::<crate::objects::FloatObject>(ObjectTag::Float, 0) };
    unsafe { (*ptr).value = value };
    TaggedValue::from_object_ptr(ptr as *const ())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_float(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Float)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_float_value(val: TaggedValue) -> f64 {
    assert!(rt_is_float(val), "value {:#x} is not a float", val.0);
    let ptr = val.as_object_ptr() as *const crate::objects::FloatObject;
    unsafe { (*ptr).value }
}

fn header_tag_of(val: TaggedValue) -> Option<ObjectTag> {
    let ptr = val.as_object_ptr() as *const ObjectHeader;
    crate::objects::header_tag(ptr)
}

// --- symbols / keywords / strings ------------------------------------------

/// # Safety
/// `name` must be a valid, NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_make_symbol(name: *const c_char) -> TaggedValue {
    let text = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    alloc_str_like(ObjectTag::Symbol, &text)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_symbol(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Symbol)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_symbol_extract_string(val: TaggedValue) -> *const c_char {
    unsafe { str_like_c_ptr(val, ObjectTag::Symbol) }
}

/// # Safety
/// `name` must be a valid, NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_make_keyword(name: *const c_char) -> TaggedValue {
    let text = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    alloc_str_like(ObjectTag::Keyword, &text)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_keyword(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Keyword)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_keyword_extract_string(val: TaggedValue) -> *const c_char {
    unsafe { str_like_c_ptr(val, ObjectTag::Keyword) }
}

/// # Safety
/// `text` must be a valid, NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_make_string(text: *const c_char) -> TaggedValue {
    let text = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    alloc_str_like(ObjectTag::String, &text)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_string(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::String)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_string_value(val: TaggedValue) -> *const c_char {
    unsafe { str_like_c_ptr(val, ObjectTag::String) }
}

/// Rust-native constructor, used internally (e.g. by `exceptions.rs`) where
/// a `&str` is already in hand and a C-string round-trip would be wasted
/// work.
pub fn make_string(text: &str) -> TaggedValue {
    alloc_str_like(ObjectTag::String, text)
}

// --- vars -------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_var(sym: TaggedValue) -> TaggedValue {
    let ptr = unsafe { alloc_object::<VarObject>(ObjectTag::Var, 0) };
    unsafe {
        (*ptr).sym = sym;
        (*ptr).val = TaggedValue::NIL;
    }
    TaggedValue::from_object_ptr(ptr as *const ())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_var(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Var)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_set_var(v: TaggedValue, val: TaggedValue) {
    assert!(rt_is_var(v), "value {:#x} is not a var", v.0);
    let ptr = v.as_object_ptr() as *mut VarObject;
    unsafe { (*ptr).val = val };
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_deref_var(v: TaggedValue) -> TaggedValue {
    assert!(rt_is_var(v), "value {:#x} is not a var", v.0);
    let ptr = v.as_object_ptr() as *const VarObject;
    unsafe { (*ptr).val }
}

// --- pairs --------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_pair(value: TaggedValue, next: TaggedValue) -> TaggedValue {
    let ptr = unsafe { alloc_object::<PairObject>(ObjectTag::Pair, 0) };
    unsafe {
        (*ptr).value = value;
        (*ptr).next = next;
    }
    TaggedValue::from_object_ptr(ptr as *const ())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_pair(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Pair)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_car(pair: TaggedValue) -> TaggedValue {
    assert!(rt_is_pair(pair), "value {:#x} is not a pair", pair.0);
    let ptr = pair.as_object_ptr() as *const PairObject;
    unsafe { (*ptr).value }
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_cdr(pair: TaggedValue) -> TaggedValue {
    assert!(rt_is_pair(pair), "value {:#x} is not a pair", pair.0);
    let ptr = pair.as_object_ptr() as *const PairObject;
    unsafe { (*ptr).next }
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_set_car(pair: TaggedValue, val: TaggedValue) -> TaggedValue {
    assert!(rt_is_pair(pair), "value {:#x} is not a pair", pair.0);
    let ptr = pair.as_object_ptr() as *mut PairObject;
    unsafe { (*ptr).value = val };
    pair
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_set_cdr(pair: TaggedValue, next: TaggedValue) -> TaggedValue {
    assert!(rt_is_pair(pair), "value {:#x} is not a pair", pair.0);
    let ptr = pair.as_object_ptr() as *mut PairObject;
    unsafe { (*ptr).next = next };
    pair
}

/// Rust-native convenience constructor for a cons chain, most recent cons
/// last; used by tests and by the macro engine's AST-to-value bridge.
pub fn make_pair(value: TaggedValue, next: TaggedValue) -> TaggedValue {
    rt_make_pair(value, next)
}

// --- functions / environments ---------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_interpreted_function(
    arg_names: TaggedValue,
    arity: u64,
    body: TaggedValue,
    env: TaggedValue,
) -> TaggedValue {
    let ptr = unsafe { alloc_object::<InterpretedFunctionObject>(ObjectTag::InterpretedFunction, 0) };
    unsafe {
        (*ptr).arity = arity;
        (*ptr).arg_names = arg_names;
        (*ptr).body = body;
        (*ptr).env = env;
    }
    TaggedValue::from_object_ptr(ptr as *const ())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_interpreted_function(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::InterpretedFunction)
}

/// Construct a `CompiledFunction` wrapping a JIT-emitted code pointer and
/// `env_size` closed-over slots, all initialized to `nil`. Not part of the
/// original `rt_make_*` symbol set (compiled closures are built entirely
/// by emitted code writing directly into a GC allocation) but exposed here
/// so test code and the backend shim have one canonical constructor to
/// call into rather than hand-rolling the layout.
pub fn make_compiled_function(
    arity: u32,
    has_rest: bool,
    fn_ptr: *const (),
    env_size: u64,
) -> TaggedValue {
    let extra = (env_size as usize) * size_of::<TaggedValue>();
    let ptr = unsafe { alloc_object::<CompiledFunctionObject>(ObjectTag::Function, extra) };
    unsafe {
        (*ptr).arity = arity;
        (*ptr).has_rest = has_rest as u32;
        (*ptr).fn_ptr = fn_ptr;
        (*ptr).env_size = env_size;
        let slots = CompiledFunctionObject::env_slots(ptr);
        slots.fill(TaggedValue::NIL);
    }
    debug_assert_eq!(
        compiled_function_size(env_size as usize),
        size_of::<CompiledFunctionObject>() + extra
    );
    TaggedValue::from_object_ptr(ptr as *const ())
}

/// JIT-callable constructor mirroring [`make_compiled_function`], for
/// emitted code building a closure at the point a `lambda` expression is
/// evaluated (as opposed to tests and the macro engine, which call the
/// Rust-native constructor directly). `has_rest` follows the `i8`
/// boolean convention already used by `rt_make_boolean`.
#[unsafe(no_mangle)]
pub extern "C" fn rt_make_compiled_function(
    fn_ptr: *const (),
    arity: u32,
    has_rest: i8,
    env_size: u64,
) -> TaggedValue {
    make_compiled_function(arity, has_rest != 0, fn_ptr, env_size)
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_function(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Function)
}

/// Reads the closed-over slot at `index` out of a compiled closure's
/// environment tail. The backend assigns each free variable a stable
/// index at emission time (§4.6); this is the accessor emitted code
/// calls to read it back.
#[unsafe(no_mangle)]
pub extern "C" fn rt_closure_get_env(closure: TaggedValue, index: u64) -> TaggedValue {
    assert!(
        rt_is_function(closure),
        "value {:#x} is not a compiled function",
        closure.0
    );
    let ptr = closure.as_object_ptr() as *mut CompiledFunctionObject;
    let slots = unsafe { CompiledFunctionObject::env_slots(ptr) };
    slots[index as usize]
}

/// Writes `value` into env slot `index`, returning `closure` so call
/// sites can chain several slot writes, mirroring `rt_set_car`/
/// `rt_set_cdr`'s "returns the mutated object" convention.
#[unsafe(no_mangle)]
pub extern "C" fn rt_closure_set_env(closure: TaggedValue, index: u64, value: TaggedValue) -> TaggedValue {
    assert!(
        rt_is_function(closure),
        "value {:#x} is not a compiled function",
        closure.0
    );
    let ptr = closure.as_object_ptr() as *mut CompiledFunctionObject;
    let slots = unsafe { CompiledFunctionObject::env_slots(ptr) };
    slots[index as usize] = value;
    closure
}

/// `rt_compiled_function_get_ptr` — fetch the raw code pointer so `rt_apply_N`
/// can call it directly.
#[unsafe(no_mangle)]
pub extern "C" fn rt_compiled_function_get_ptr(val: TaggedValue) -> *const () {
    assert!(
        rt_is_function(val),
        "value {:#x} is not a compiled function",
        val.0
    );
    let ptr = val.as_object_ptr() as *const CompiledFunctionObject;
    unsafe { (*ptr).fn_ptr }
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_make_environment(parent: TaggedValue) -> TaggedValue {
    let ptr = unsafe { alloc_object::<EnvironmentObject>(ObjectTag::Environment, 0) };
    unsafe {
        (*ptr).parent = parent;
        (*ptr).values = TaggedValue::NIL;
    }
    TaggedValue::from_object_ptr(ptr as *const ())
}

#[unsafe(no_mangle)]
pub extern "C" fn rt_is_environment(val: TaggedValue) -> bool {
    val.is_object() && header_tag_of(val) == Some(ObjectTag::Environment)
}

// --- printing ---------------------------------------------------------------

/// `rt_print` — render a value for REPL/diagnostic output. Returns the
/// value unchanged (matching the source this is grounded on, which uses
/// `rt_print` as a transparent debug tap inside expression chains).
#[unsafe(no_mangle)]
pub extern "C" fn rt_print(val: TaggedValue) -> TaggedValue {
    println!("{}", format_value(val));
    val
}

pub fn format_value(val: TaggedValue) -> String {
    if val.is_integer() {
        return val.as_integer().to_string();
    }
    if val.is_nil() {
        return "nil".to_string();
    }
    if val.is_true() {
        return "true".to_string();
    }
    if val.is_false() {
        return "false".to_string();
    }
    if !val.is_object() {
        return format!("#<unknown:{:#x}>", val.0);
    }
    match header_tag_of(val) {
        Some(ObjectTag::Float) => rt_float_value(val).to_string(),
        Some(ObjectTag::String) => format!("{:?}", unsafe { str_like_value(val, ObjectTag::String) }),
        Some(ObjectTag::Symbol) => unsafe { str_like_value(val, ObjectTag::Symbol) }.to_string(),
        Some(ObjectTag::Keyword) => format!(":{}", unsafe { str_like_value(val, ObjectTag::Keyword) }),
        Some(ObjectTag::Pair) => format_list(val),
        Some(ObjectTag::Function) => "#<compiled-function>".to_string(),
        Some(ObjectTag::InterpretedFunction) => "#<function>".to_string(),
        Some(ObjectTag::Environment) => "#<environment>".to_string(),
        Some(ObjectTag::Var) => format!("#<var {}>", format_value(rt_deref_var(val))),
        Some(ObjectTag::Exception) => "#<exception>".to_string(),
        None => format!("#<corrupt:{:#x}>", val.0),
    }
}

fn format_list(mut val: TaggedValue) -> String {
    let mut parts = Vec::new();
    while rt_is_pair(val) {
        parts.push(format_value(rt_car(val)));
        val = rt_cdr(val);
    }
    if val.is_nil() {
        format!("({})", parts.join(" "))
    } else {
        format!("({} . {})", parts.join(" "), format_value(val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{self, GcMode};

    fn with_fresh_gc<R>(f: impl FnOnce() -> R) -> R {
        gc::init(GcMode::InterpreterOwned);
        let result = f();
        gc::deinit();
        result
    }

    #[test]
    fn integers_round_trip_without_allocation() {
        let v = rt_make_integer(42);
        assert!(rt_is_integer(v));
        assert_eq!(rt_integer_value(v), 42);
    }

    #[test]
    fn floats_round_trip() {
        with_fresh_gc(|| {
            let v = rt_make_float(3.5);
            assert!(rt_is_float(v));
            assert_eq!(rt_float_value(v), 3.5);
        });
    }

    #[test]
    fn strings_are_nul_terminated_and_readable() {
        with_fresh_gc(|| {
            let v = make_string("hello");
            assert!(rt_is_string(v));
            // Points straight into the GC object's own tail; no ownership to
            // release, unlike a `CString` built off `into_raw`.
            let c_ptr = rt_string_value(v);
            let back = unsafe { CStr::from_ptr(c_ptr) }.to_str().unwrap();
            assert_eq!(back, "hello");
        });
    }

    #[test]
    fn pairs_support_car_cdr_and_mutation() {
        with_fresh_gc(|| {
            let pair = rt_make_pair(rt_make_integer(1), TaggedValue::NIL);
            assert_eq!(rt_integer_value(rt_car(pair)), 1);
            assert!(rt_cdr(pair).is_nil());
            rt_set_cdr(pair, rt_make_integer(2));
            assert_eq!(rt_integer_value(rt_cdr(pair)), 2);
        });
    }

    #[test]
    fn vars_hold_a_mutable_cell() {
        with_fresh_gc(|| {
            let sym = unsafe { rt_make_symbol(c_string_ptr("x")) };
            let v = rt_make_var(sym);
            assert!(rt_deref_var(v).is_nil());
            rt_set_var(v, rt_make_integer(9));
            assert_eq!(rt_integer_value(rt_deref_var(v)), 9);
        });
    }

    #[test]
    fn closure_env_slots_round_trip() {
        with_fresh_gc(|| {
            let closure = rt_make_compiled_function(std::ptr::null(), 0, 0, 2);
            assert!(rt_closure_get_env(closure, 0).is_nil());
            rt_closure_set_env(closure, 1, rt_make_integer(5));
            assert_eq!(rt_integer_value(rt_closure_get_env(closure, 1)), 5);
        });
    }

    #[test]
    fn nil_is_truthy_only_false_is_falsy() {
        assert!(TaggedValue::NIL.is_truthy());
        assert!(TaggedValue::TRUE.is_truthy());
        assert!(!TaggedValue::FALSE.is_truthy());
    }
}
