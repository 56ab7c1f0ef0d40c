//! Statepoint table ABI — the metadata a JIT backend publishes so the GC can
//! find tagged pointer slots on the mutator's stack without cooperation from
//! the mutator itself.
//!
//! This module specifies only the *shape* the backend must publish
//! (`find_frame_for_return_address` in spec terms); the backend that
//! generates these tables is the opaque, consumed service described in
//! spec.md §4.6.

/// Whether a stack slot holds a tagged pointer the GC must trace, or scalar
/// data it should ignore. The spec's convention is `kind < 0` for pointer
/// slots; we keep that as the wire encoding but expose a typed accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Pointer,
    Scalar,
}

impl SlotKind {
    pub fn from_raw(kind: i32) -> SlotKind {
        if kind < 0 {
            SlotKind::Pointer
        } else {
            SlotKind::Scalar
        }
    }
}

/// One tagged-pointer-bearing (or scalar) stack slot within a frame, as an
/// offset from the frame's base.
#[derive(Debug, Clone, Copy)]
pub struct SlotDescriptor {
    pub offset: i32,
    pub raw_kind: i32,
}

impl SlotDescriptor {
    pub fn kind(&self) -> SlotKind {
        SlotKind::from_raw(self.raw_kind)
    }
}

/// Per-call-site frame metadata: how large the frame is (so the GC can step
/// to the caller) and which of its slots are pointers.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub frame_size: u64,
    pub slots: Vec<SlotDescriptor>,
}

/// A backend-published table mapping return addresses to [`FrameInfo`].
/// Several of these can be registered (one per compiled module); the GC
/// queries them in registration order and takes the first match, mirroring
/// `rt_gc_init_stackmap` appending to a list of tables in the source this
/// was distilled from.
#[derive(Debug, Clone, Default)]
pub struct StatepointTable {
    // Kept sorted by `return_address` to binary-search; call sites are
    // registered once per compiled unit, so insertion cost doesn't matter.
    entries: Vec<(u64, FrameInfo)>,
}

impl StatepointTable {
    pub fn new() -> StatepointTable {
        StatepointTable {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, return_address: u64, info: FrameInfo) {
        let pos = self
            .entries
            .partition_point(|(addr, _)| *addr < return_address);
        self.entries.insert(pos, (return_address, info));
    }

    pub fn lookup(&self, return_address: u64) -> Option<&FrameInfo> {
        self.entries
            .binary_search_by(|(addr, _)| addr.cmp(&return_address))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_frame() {
        let mut table = StatepointTable::new();
        table.register(
            0x1000,
            FrameInfo {
                frame_size: 32,
                slots: vec![SlotDescriptor {
                    offset: 8,
                    raw_kind: -1,
                }],
            },
        );
        table.register(
            0x2000,
            FrameInfo {
                frame_size: 16,
                slots: vec![],
            },
        );

        let found = table.lookup(0x1000).expect("frame should be registered");
        assert_eq!(found.frame_size, 32);
        assert_eq!(found.slots[0].kind(), SlotKind::Pointer);

        assert!(table.lookup(0x1500).is_none());
    }

    #[test]
    fn scalar_slots_are_not_pointers() {
        let slot = SlotDescriptor {
            offset: 0,
            raw_kind: 3,
        };
        assert_eq!(slot.kind(), SlotKind::Scalar);
    }
}
