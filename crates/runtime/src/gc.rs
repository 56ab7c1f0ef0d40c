//! Precise mark-and-sweep garbage collection.
//!
//! Root discovery walks the mutator's call stack against backend-published
//! [`StatepointTable`]s (`CompilerOwned` mode) or relies solely on the
//! explicit root set (`InterpreterOwned` mode, used while a macro body is
//! being evaluated by the same tree-walking path the macro engine drives).
//! Mark and sweep follow spec.md §4.8 exactly: a single explicit-stack
//! traversal (no recursion, so long cons chains don't blow the native
//! stack), then one pass over `heap_objects` that frees anything left
//! unmarked and clears the mark bit on everything else.

use crate::objects::{
    CompiledFunctionObject, EnvironmentObject, InterpretedFunctionObject, PairObject, VarObject,
};
use el_core::{FrameInfo, ObjectHeader, ObjectTag, StatepointTable, TaggedValue};
use std::cell::RefCell;
use std::collections::HashSet;

/// Whether the collector may scan the native call stack (the JIT backend
/// emits stack maps for this) or must rely entirely on the explicit root
/// set (no stack maps available, e.g. while the macro engine's fallback
/// evaluator is running).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    CompilerOwned,
    InterpreterOwned,
}

/// The collector. One instance owns the entire GC heap; there is exactly
/// one mutator thread per spec.md §5, so no synchronization is needed.
pub struct GarbageCollector {
    mode: GcMode,
    heap_objects: HashSet<u64>,
    object_roots: HashSet<u64>,
    statepoint_tables: Vec<StatepointTable>,
}

impl GarbageCollector {
    pub fn new(mode: GcMode) -> GarbageCollector {
        GarbageCollector {
            mode,
            heap_objects: HashSet::new(),
            object_roots: HashSet::new(),
            statepoint_tables: Vec::new(),
        }
    }

    pub fn mode(&self) -> GcMode {
        self.mode
    }

    pub fn heap_object_count(&self) -> usize {
        self.heap_objects.len()
    }

    pub fn register_statepoint_table(&mut self, table: StatepointTable) {
        self.statepoint_tables.push(table);
    }

    fn frame_info(&self, return_address: u64) -> Option<&FrameInfo> {
        self.statepoint_tables
            .iter()
            .find_map(|table| table.lookup(return_address))
    }

    /// Allocate `size` bytes of GC-tracked heap memory for a tagged object
    /// and record its (pre-tag) address in `heap_objects`. The caller
    /// writes the object's fields (including the header) before the
    /// pointer is ever observed by a `collect`.
    ///
    /// # Safety
    /// The returned pointer is uninitialized memory; the caller must write
    /// a valid `ObjectHeader` (and the rest of the object) before any GC
    /// safe point is reached.
    pub unsafe fn malloc_tagged_object(&mut self, size: usize) -> *mut u8 {
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        assert!(!ptr.is_null(), "el-runtime: GC heap allocation failed");
        self.heap_objects.insert(ptr as u64);
        ptr
    }

    /// Allocate untagged scratch memory (e.g. backend bookkeeping). Never
    /// tracked by the GC.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        assert!(!ptr.is_null(), "el-runtime: heap allocation failed");
        ptr
    }

    /// # Safety
    /// `ptr` must have come from `malloc_tagged_object` or `malloc` and not
    /// already have been freed.
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { libc::free(ptr as *mut libc::c_void) };
    }

    /// Pin `value` as a GC root until explicitly removed. No-op for
    /// non-object values.
    pub fn add_root(&mut self, value: TaggedValue) {
        if value.is_object() {
            self.object_roots.insert(value.as_object_ptr() as u64);
        }
    }

    pub fn remove_root(&mut self, value: TaggedValue) {
        if value.is_object() {
            self.object_roots.remove(&(value.as_object_ptr() as u64));
        }
    }

    /// Run one collection cycle. `stack_pointer` is the mutator's stack
    /// pointer at the point of entry, as captured by `rt_enter_gc`; it is
    /// ignored in `InterpreterOwned` mode.
    ///
    /// # Safety
    /// In `CompilerOwned` mode, `stack_pointer` must genuinely point at the
    /// mutator's live call stack, and every statepoint table registered
    /// must accurately describe the frames found by walking it — a wrong
    /// table causes the collector to read garbage as a pointer.
    pub unsafe fn collect(&mut self, stack_pointer: *const u8) {
        tracing::debug!(
            heap_objects = self.heap_objects.len(),
            roots = self.object_roots.len(),
            mode = ?self.mode,
            "gc: collection cycle starting"
        );

        let mut worklist: Vec<u64> = Vec::new();

        if self.mode == GcMode::CompilerOwned && !stack_pointer.is_null() {
            unsafe { self.walk_stack(stack_pointer, &mut worklist) };
        }

        for root in &self.object_roots {
            worklist.push(*root);
        }

        unsafe { self.mark(worklist) };
        let collected = self.sweep();

        tracing::debug!(collected, remaining = self.heap_objects.len(), "gc: collection cycle done");
    }

    /// Walk frames from `stack_pointer` outward, consulting the statepoint
    /// tables for each return address, per spec.md §4.8's "Root walk
    /// algorithm".
    ///
    /// # Safety
    /// See [`GarbageCollector::collect`].
    unsafe fn walk_stack(&self, stack_pointer: *const u8, worklist: &mut Vec<u64>) {
        let mut sp = stack_pointer;
        let mut return_address = unsafe { *(sp as *const u64) };
        sp = unsafe { sp.add(size_of_ptr()) };

        while let Some(frame) = self.frame_info(return_address) {
            for slot in &frame.slots {
                if slot.kind() != el_core::SlotKind::Pointer {
                    continue;
                }
                let slot_ptr = unsafe { sp.offset(slot.offset as isize) } as *const u64;
                let candidate = unsafe { *slot_ptr };
                let tagged = TaggedValue(candidate);
                if tagged.is_object() {
                    worklist.push(tagged.as_object_ptr() as u64);
                }
            }

            sp = unsafe { sp.add(frame.frame_size as usize) };
            return_address = unsafe { *(sp as *const u64) };
            sp = unsafe { sp.add(size_of_ptr()) };
        }
    }

    /// Depth-first mark using an explicit worklist, per spec.md §4.8.
    ///
    /// # Safety
    /// Every address in `worklist` must be an address previously returned
    /// by `malloc_tagged_object` and still present in `heap_objects`.
    unsafe fn mark(&mut self, mut worklist: Vec<u64>) {
        while let Some(addr) = worklist.pop() {
            let header_ptr = addr as *mut ObjectHeader;
            let header = unsafe { &mut *header_ptr };
            if header.is_marked() {
                continue;
            }
            header.mark();

            match header.object_tag() {
                ObjectTag::Float | ObjectTag::String | ObjectTag::Symbol | ObjectTag::Keyword => {
                    // Leaves: no children.
                }
                ObjectTag::Pair => {
                    let pair = unsafe { &*(addr as *const PairObject) };
                    push_if_object(pair.value, &mut worklist);
                    push_if_object(pair.next, &mut worklist);
                }
                ObjectTag::Var => {
                    let var = unsafe { &*(addr as *const VarObject) };
                    push_if_object(var.sym, &mut worklist);
                    push_if_object(var.val, &mut worklist);
                }
                ObjectTag::Function => {
                    let func_ptr = addr as *mut CompiledFunctionObject;
                    let slots = unsafe { CompiledFunctionObject::env_slots(func_ptr) };
                    for slot in slots.iter() {
                        push_if_object(*slot, &mut worklist);
                    }
                }
                ObjectTag::InterpretedFunction => {
                    let func = unsafe { &*(addr as *const InterpretedFunctionObject) };
                    push_if_object(func.arg_names, &mut worklist);
                    push_if_object(func.body, &mut worklist);
                    push_if_object(func.env, &mut worklist);
                }
                ObjectTag::Environment => {
                    let env = unsafe { &*(addr as *const EnvironmentObject) };
                    push_if_object(env.parent, &mut worklist);
                    push_if_object(env.values, &mut worklist);
                }
                ObjectTag::Exception => {
                    let exc = unsafe { &*(addr as *const crate::objects::ExceptionObject) };
                    push_if_object(exc.metadata, &mut worklist);
                }
            }
        }
    }

    /// One pass: free anything left unmarked, unmark everything else.
    fn sweep(&mut self) -> usize {
        let mut collected = 0usize;
        let mut survivors = HashSet::with_capacity(self.heap_objects.len());

        for addr in self.heap_objects.drain() {
            let header_ptr = addr as *mut ObjectHeader;
            let header = unsafe { &mut *header_ptr };
            if header.is_marked() {
                header.unmark();
                survivors.insert(addr);
            } else {
                unsafe { self.free(addr as *mut u8) };
                collected += 1;
            }
        }

        self.heap_objects = survivors;
        collected
    }
}

fn push_if_object(value: TaggedValue, worklist: &mut Vec<u64>) {
    if value.is_object() {
        worklist.push(value.as_object_ptr() as u64);
    }
}

fn size_of_ptr() -> usize {
    std::mem::size_of::<usize>()
}

thread_local! {
    static GC: RefCell<Option<GarbageCollector>> = const { RefCell::new(None) };
}

/// Initialize the process-wide collector. Must be called once before any
/// `rt_make_*` constructor runs.
pub fn init(mode: GcMode) {
    GC.with(|cell| *cell.borrow_mut() = Some(GarbageCollector::new(mode)));
}

/// Run `f` with mutable access to the process-wide collector.
///
/// # Panics
/// Panics if [`init`] has not been called yet.
pub fn with_gc<R>(f: impl FnOnce(&mut GarbageCollector) -> R) -> R {
    GC.with(|cell| {
        let mut guard = cell.borrow_mut();
        let gc = guard
            .as_mut()
            .expect("el-runtime: GC used before rt_init_gc");
        f(gc)
    })
}

/// Tear down the process-wide collector, freeing every remaining heap
/// object. Intended for test isolation.
pub fn deinit() {
    GC.with(|cell| cell.borrow_mut().take());
}

/// `rt_gc_init_stackmap` — register a statepoint table published by the
/// backend. A null `stackmap` pointer is treated as "no table to add" (the
/// source this is grounded on does the same).
///
/// # Safety
/// If `stackmap` is non-null, it must point at a table whose layout the
/// backend and this crate agree on; this function decodes nothing itself
/// today (tables are constructed in-process via
/// [`GarbageCollector::register_statepoint_table`]) so it is safe as a
/// stub entry point for backends that publish no stack maps yet.
#[unsafe(no_mangle)]
pub extern "C" fn rt_gc_init_stackmap(stackmap: *const ()) {
    if stackmap.is_null() {
        return;
    }
    tracing::warn!("rt_gc_init_stackmap: raw stackmap blobs are not decoded by this build");
}

/// `rt_gc_add_root`
#[unsafe(no_mangle)]
pub extern "C" fn rt_gc_add_root(obj: u64) {
    with_gc(|gc| gc.add_root(TaggedValue(obj)));
}

/// `rt_gc_remove_root`
#[unsafe(no_mangle)]
pub extern "C" fn rt_gc_remove_root(obj: u64) {
    with_gc(|gc| gc.remove_root(TaggedValue(obj)));
}

/// Architecture-independent GC entry point: capture a stack pointer
/// (already loaded into a register by [`rt_enter_gc`]'s trampoline, or
/// supplied directly by a caller that has no backend stack maps to walk)
/// and run one collection cycle.
///
/// # Safety
/// See [`GarbageCollector::collect`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_enter_gc_impl(stack_pointer: *const u8) {
    unsafe {
        with_gc(|gc| gc.collect(stack_pointer));
    }
}

// `rt_enter_gc` is the naked trampoline spec.md §4.8 and §9 call for: a tiny
// entry point that loads the current stack pointer into the first argument
// register and tail-jumps into `rt_enter_gc_impl`, so the collector sees the
// mutator's true SP at the moment of entry rather than a copy one frame
// removed. No portable Rust equivalent exists (per §9's "Raw stack walking"
// design note), so this is architecture-specific inline assembly.
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".global rt_enter_gc",
    "rt_enter_gc:",
    "mov rdi, rsp",
    "jmp rt_enter_gc_impl",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".global rt_enter_gc",
    "rt_enter_gc:",
    "mov x0, sp",
    "b rt_enter_gc_impl",
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;

    fn with_fresh_gc<R>(f: impl FnOnce() -> R) -> R {
        init(GcMode::InterpreterOwned);
        let result = f();
        deinit();
        result
    }

    #[test]
    fn unreachable_objects_are_collected() {
        with_fresh_gc(|| {
            let a = value::rt_make_integer(1);
            let pair = value::rt_make_pair(a, TaggedValue::NIL);
            with_gc(|gc| gc.add_root(pair));

            assert_eq!(with_gc(|gc| gc.heap_object_count()), 1);

            // Drop the root: the pair becomes unreachable.
            with_gc(|gc| gc.remove_root(pair));
            unsafe { with_gc(|gc| gc.collect(std::ptr::null())) };

            assert_eq!(with_gc(|gc| gc.heap_object_count()), 0);
        });
    }

    #[test]
    fn rooted_chain_survives_collection() {
        with_fresh_gc(|| {
            let tail = value::rt_make_pair(value::rt_make_integer(2), TaggedValue::NIL);
            let head = value::rt_make_pair(value::rt_make_integer(1), tail);
            with_gc(|gc| gc.add_root(head));

            unsafe { with_gc(|gc| gc.collect(std::ptr::null())) };

            // `head` keeps `tail` alive transitively.
            assert_eq!(with_gc(|gc| gc.heap_object_count()), 2);
        });
    }

    #[test]
    fn sweep_clears_marks_for_next_cycle() {
        with_fresh_gc(|| {
            let obj = value::rt_make_integer(7);
            let pair = value::rt_make_pair(obj, TaggedValue::NIL);
            with_gc(|gc| gc.add_root(pair));

            unsafe { with_gc(|gc| gc.collect(std::ptr::null())) };
            unsafe { with_gc(|gc| gc.collect(std::ptr::null())) };

            assert_eq!(with_gc(|gc| gc.heap_object_count()), 1);
        });
    }

    /// Universal invariant from spec §8: every surviving `heap_objects` entry
    /// has its mark bit cleared once `collect` returns, so the next cycle's
    /// mark phase starts from a clean slate rather than inheriting stale
    /// marks from this one.
    #[test]
    fn surviving_objects_have_their_mark_bit_cleared_after_collect() {
        with_fresh_gc(|| {
            let tail = value::rt_make_pair(value::rt_make_integer(2), TaggedValue::NIL);
            let head = value::rt_make_pair(value::rt_make_integer(1), tail);
            with_gc(|gc| gc.add_root(head));

            unsafe { with_gc(|gc| gc.collect(std::ptr::null())) };

            with_gc(|gc| {
                assert_eq!(gc.heap_objects.len(), 2);
                for addr in &gc.heap_objects {
                    let header = unsafe { &*(*addr as *const ObjectHeader) };
                    assert!(
                        !header.is_marked(),
                        "surviving object at {addr:#x} should have its mark bit cleared"
                    );
                }
            });
        });
    }
}
