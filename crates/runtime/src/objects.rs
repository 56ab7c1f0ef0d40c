//! Heap object layouts.
//!
//! Every object begins with an [`ObjectHeader`] (tag + GC mark) from
//! `el-core`. Fixed-size fields follow as a `#[repr(C)]` struct; objects
//! with a variable-length tail (strings, symbols, keywords, exceptions)
//! allocate `size_of::<Fixed>() + tail_len` bytes and address the tail
//! through raw pointer arithmetic, mirroring the C flexible-array-member
//! layouts in spec.md §3. This is the one place in the runtime where raw
//! pointers are unavoidable — the tagged-pointer ABI *is* a raw pointer
//! contract with JIT-emitted code.

use el_core::{ObjectHeader, ObjectTag, TaggedValue};
use std::mem::size_of;
use std::slice;

/// `Float{header, value: f64}`
#[repr(C)]
pub struct FloatObject {
    pub header: ObjectHeader,
    pub value: f64,
}

/// Shared layout for `String`, `Symbol`, and `Keyword`: `{header, length,
/// bytes[]}`. Which one a given allocation represents is determined by the
/// header's `ObjectTag`, not by a separate Rust type.
#[repr(C)]
pub struct StrObject {
    pub header: ObjectHeader,
    pub length: u64,
}

impl StrObject {
    /// # Safety
    /// `ptr` must point at a `StrObject` allocated with at least
    /// `ptr.length` trailing bytes of valid UTF-8.
    pub unsafe fn text<'a>(ptr: *const StrObject) -> &'a str {
        unsafe {
            let len = (*ptr).length as usize;
            let data = (ptr as *const u8).add(size_of::<StrObject>());
            let bytes = slice::from_raw_parts(data, len);
            std::str::from_utf8_unchecked(bytes)
        }
    }
}

/// `Pair{header, value: tagged, next: tagged}`
#[repr(C)]
pub struct PairObject {
    pub header: ObjectHeader,
    pub value: TaggedValue,
    pub next: TaggedValue,
}

/// `Var{header, sym: tagged, val: tagged}`
#[repr(C)]
pub struct VarObject {
    pub header: ObjectHeader,
    pub sym: TaggedValue,
    pub val: TaggedValue,
}

/// `CompiledFunction{header, arity, has_rest, fn_ptr, env_size, env[]}`
#[repr(C)]
pub struct CompiledFunctionObject {
    pub header: ObjectHeader,
    pub arity: u32,
    pub has_rest: u32,
    pub fn_ptr: *const (),
    pub env_size: u64,
}

impl CompiledFunctionObject {
    /// # Safety
    /// `ptr` must point at a `CompiledFunctionObject` allocated with at
    /// least `env_size` trailing `TaggedValue` slots.
    pub unsafe fn env_slots<'a>(ptr: *mut CompiledFunctionObject) -> &'a mut [TaggedValue] {
        unsafe {
            let env_size = (*ptr).env_size as usize;
            let data = (ptr as *mut u8).add(size_of::<CompiledFunctionObject>()) as *mut TaggedValue;
            slice::from_raw_parts_mut(data, env_size)
        }
    }
}

/// `InterpretedFunction{header, arity, arg_names, body, env}`
#[repr(C)]
pub struct InterpretedFunctionObject {
    pub header: ObjectHeader,
    pub arity: u64,
    pub arg_names: TaggedValue,
    pub body: TaggedValue,
    pub env: TaggedValue,
}

/// `Environment{header, parent, values}`: `values` is an alternating
/// sym/val cons chain, per spec.md §3.
#[repr(C)]
pub struct EnvironmentObject {
    pub header: ObjectHeader,
    pub parent: TaggedValue,
    pub values: TaggedValue,
}

/// `Exception{header, unwind_exception, metadata, type_name[], message[]}`.
///
/// `unwind_exception` is the Itanium-ABI `_Unwind_Exception` header
/// (`crate::exceptions::UnwindException`) `el_rt_throw` hands to
/// `_Unwind_RaiseException`; `el_rt_eh_personality` recovers this whole
/// struct from a bare `_Unwind_Exception*` by subtracting the header's
/// offset, exactly as `get_exception_object_from_info` does in the source
/// this is grounded on.
///
/// `type_name` and `message` are both variable-length UTF-8 tails,
/// `type_name` first.
#[repr(C)]
pub struct ExceptionObject {
    pub header: ObjectHeader,
    pub unwind_exception: crate::exceptions::UnwindException,
    pub metadata: TaggedValue,
    pub type_name_len: u32,
    pub message_len: u32,
}

impl ExceptionObject {
    /// # Safety
    /// `ptr` must point at a fully-initialized `ExceptionObject` with
    /// `type_name_len + message_len` trailing UTF-8 bytes.
    pub unsafe fn type_name<'a>(ptr: *const ExceptionObject) -> &'a str {
        unsafe {
            let len = (*ptr).type_name_len as usize;
            let data = (ptr as *const u8).add(size_of::<ExceptionObject>());
            std::str::from_utf8_unchecked(slice::from_raw_parts(data, len))
        }
    }

    /// # Safety
    /// Same preconditions as [`ExceptionObject::type_name`].
    pub unsafe fn message<'a>(ptr: *const ExceptionObject) -> &'a str {
        unsafe {
            let type_name_len = (*ptr).type_name_len as usize;
            let message_len = (*ptr).message_len as usize;
            let data = (ptr as *const u8)
                .add(size_of::<ExceptionObject>())
                .add(type_name_len);
            std::str::from_utf8_unchecked(slice::from_raw_parts(data, message_len))
        }
    }
}

/// Total allocation size for a `String`/`Symbol`/`Keyword` holding `len`
/// bytes of text.
pub fn str_object_size(len: usize) -> usize {
    size_of::<StrObject>() + len
}

/// Total allocation size for a `CompiledFunction` closing over `env_size`
/// slots.
pub fn compiled_function_size(env_size: usize) -> usize {
    size_of::<CompiledFunctionObject>() + env_size * size_of::<TaggedValue>()
}

/// Total allocation size for an `Exception` with the given type-name and
/// message lengths.
pub fn exception_object_size(type_name_len: usize, message_len: usize) -> usize {
    size_of::<ExceptionObject>() + type_name_len + message_len
}

pub fn header_tag(header_ptr: *const ObjectHeader) -> Option<ObjectTag> {
    // Safety: caller guarantees `header_ptr` addresses a live object header;
    // every accessor in `value.rs` establishes this before calling in.
    unsafe { ObjectTag::from_u32((*header_ptr).tag) }
}
