//! el-core: the tagged-pointer ABI shared by the `el` compiler and runtime.
//!
//! This crate has no knowledge of lexing, parsing, or code generation. It
//! exists purely to give both halves of the system (JIT-emitted machine code
//! and the runtime library it calls into) a single, authoritative definition
//! of:
//!
//! - `tagged`: the low-bit tag encoding used by every machine word that
//!   crosses the compiler/runtime boundary.
//! - `header`: the heap object header and type-tag enumeration every GC
//!   object carries.
//! - `statepoint`: the data the backend publishes so the GC can walk the
//!   mutator's stack precisely.
//! - `arena`: bump allocation for source text captured during lexing
//!   (symbol/string lexemes, source file paths).
//!
//! # Modules
//!
//! - `tagged`: pointer tagging (`TaggedValue`) and the constant tag bits.
//! - `header`: `ObjectHeader`, `ObjectTag`.
//! - `statepoint`: `StatepointTable`, `FrameInfo`, `SlotDescriptor`.
//! - `arena`: `TextArena`, a thin wrapper over `bumpalo::Bump`.

pub mod arena;
pub mod header;
pub mod statepoint;
pub mod tagged;

pub use header::{ObjectHeader, ObjectTag};
pub use statepoint::{FrameInfo, SlotDescriptor, SlotKind, StatepointTable};
pub use tagged::{TaggedValue, FALSE_TAG, NIL_TAG, OBJECT_TAG, TAG_MASK, TRUE_TAG};

/// The 8-byte exception-class sentinel native `el` exceptions carry in the
/// platform unwind header, so the personality function can distinguish a
/// native throw from some other language's exception propagating through
/// the same stack. Reproduced from the exception class this runtime is
/// grounded on (`"ELECELEC"`, packed little-endian byte by byte).
pub const EXCEPTION_CLASS: u64 = {
    let bytes = *b"ELECELEC";
    let mut value: u64 = 0;
    let mut i = 0;
    while i < 8 {
        value += (bytes[i] as u64) << (i as u64 * 8);
        i += 1;
    }
    value
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_class_is_stable() {
        // Computed once and pinned so a future refactor of the computation
        // can't silently change the sentinel two native runtimes agree on.
        assert_eq!(EXCEPTION_CLASS, 0x4345_4c45_4345_4c45);
    }
}
