//! el-runtime: tagged values, garbage collection, and exception handling for
//! JIT-emitted `el` code.
//!
//! Every public function prefixed `rt_` or `el_rt_` is part of the ABI
//! contract in spec.md §6 ("Runtime primitive symbol set (consumed by
//! emitted code)") — JIT-emitted machine code calls these by symbol name.
//! They are `extern "C"`, operate entirely on [`el_core::TaggedValue`], and
//! must never panic on a well-typed call; ill-typed calls raise a native
//! `el` exception instead (see [`exceptions`]), matching spec.md §7's
//! "Runtime errors ... Raised as exception objects with a type-name tag."
//!
//! # Modules
//!
//! - `objects`: the heap object layouts (`Pair`, `Var`, `CompiledFunction`,
//!   `InterpretedFunction`, `Environment`, string-likes, `Float`).
//! - `gc`: the mark-and-sweep collector, root discovery, and the
//!   `rt_enter_gc` stack-capturing trampoline.
//! - `value`: constructors (`rt_make_*`), predicates (`rt_is_*`), and
//!   accessors (`rt_car`, `rt_integer_value`, ...).
//! - `environment`: `rt_make_environment`, `rt_environment_add/get`.
//! - `arithmetic`: `rt_add/sub/mul/div/eq/or/not/is_nil`.
//! - `apply`: the `rt_apply_N` N-ary calling shims (N in 0..=20).
//! - `exceptions`: exception allocation, the LSDA decoder, and the
//!   two-phase personality routine.
//! - `error`: thread-local diagnostic state for accessor type mismatches
//!   before they are turned into a thrown exception.

pub mod apply;
pub mod arithmetic;
pub mod environment;
pub mod error;
pub mod exceptions;
pub mod gc;
pub mod objects;
pub mod value;

pub use el_core::{ObjectHeader, ObjectTag, TaggedValue};
pub use gc::{GcMode, GarbageCollector};
