//! Garbage-collected object arena.
//!
//! All heap objects live in a slab of slots indexed by [`HeapId`]. Collection
//! is tri-color mark-sweep: the VM gathers its roots (value stack, frame
//! stack, open upvalues, module cache, interned strings, the thread exception
//! slot) and hands them to [`Heap::collect`], which marks through the object
//! graph with an explicit gray worklist and then sweeps unmarked slots onto a
//! free list.
//!
//! The collector is triggered by a byte-allocation watermark: every
//! allocation adds a size estimate to a running counter and the VM polls
//! [`Heap::gc_pending`] at instruction boundaries (its safe point), so a
//! collection never observes a half-constructed object.

use serde::{Deserialize, Serialize};

use crate::object::HeapData;
use crate::value::Value;

/// Index of an object slot in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap exceeds u32 slots"))
    }
}

/// One arena slot: the object payload plus the header bits every object
/// carries (mark bit, `repr` recursion guard).
#[derive(Debug)]
struct HeapEntry {
    marked: bool,
    in_repr: bool,
    data: HeapData,
}

/// First collection threshold in estimated bytes.
const FIRST_GC_THRESHOLD: usize = 1 << 20;

/// Growth factor applied to the watermark after each collection.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// The garbage-collected arena backing every runtime object.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Total number of collections run, exposed for tests and stats output.
    collections: usize,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            collections: 0,
        }
    }

    /// Allocates a new object, reusing a swept slot when one is available.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.size_estimate();
        let entry = HeapEntry {
            marked: false,
            in_repr: false,
            data,
        };
        if let Some(slot) = self.free.pop() {
            self.entries[slot as usize] = Some(entry);
            HeapId(slot)
        } else {
            let id = HeapId::from_index(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Returns a reference to the object at `id`.
    ///
    /// # Panics
    /// Panics if the slot is empty; reachable objects are never swept, so a
    /// dangling `HeapId` indicates a VM bug, not a user error.
    #[inline]
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()]
            .as_ref()
            .expect("Heap::get: object already swept")
            .data
    }

    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()]
            .as_mut()
            .expect("Heap::get_mut: object already swept")
            .data
    }

    /// Number of live objects, used by GC tests.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[must_use]
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// True once the allocation watermark has been crossed; the VM checks
    /// this at its safe point and calls [`Heap::collect`] with the roots.
    #[inline]
    #[must_use]
    pub fn gc_pending(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Temporarily takes an object's payload out of its slot so the closure
    /// can borrow the heap again (dict lookups hash nested keys, method
    /// calls touch other objects). The payload is put back afterwards; the
    /// window never spans a GC safe point.
    pub fn with_data<R>(&mut self, id: HeapId, f: impl FnOnce(&mut Self, &mut HeapData) -> R) -> R {
        let mut entry = self.entries[id.index()]
            .take()
            .expect("Heap::with_data: object already swept");
        let result = f(self, &mut entry.data);
        self.entries[id.index()] = Some(entry);
        result
    }

    /// The repr recursion guard: returns the previous state and sets it.
    pub fn enter_repr(&mut self, id: HeapId) -> bool {
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("Heap::enter_repr: object already swept");
        std::mem::replace(&mut entry.in_repr, true)
    }

    pub fn leave_repr(&mut self, id: HeapId) {
        if let Some(entry) = self.entries[id.index()].as_mut() {
            entry.in_repr = false;
        }
    }

    /// Runs a full mark-sweep collection over the given roots.
    ///
    /// After the collection every reachable object has a cleared mark bit
    /// and every unreachable slot is on the free list.
    pub fn collect(&mut self, roots: &[Value]) {
        let mut gray: Vec<HeapId> = Vec::with_capacity(64);
        for value in roots {
            self.mark_value(*value, &mut gray);
        }

        // Blacken: pop a gray object, mark everything it references.
        let mut scratch: Vec<Value> = Vec::new();
        while let Some(id) = gray.pop() {
            scratch.clear();
            if let Some(entry) = self.entries[id.index()].as_ref() {
                entry.data.trace(&mut scratch);
            }
            for value in &scratch {
                self.mark_value(*value, &mut gray);
            }
        }

        self.sweep();
        self.collections += 1;
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(FIRST_GC_THRESHOLD);
    }

    /// Marks a value's referent gray if it is an unmarked heap object.
    fn mark_value(&mut self, value: Value, gray: &mut Vec<HeapId>) {
        if let Value::Ref(id) = value {
            self.mark_id(id, gray);
        }
    }

    fn mark_id(&mut self, id: HeapId, gray: &mut Vec<HeapId>) {
        if let Some(entry) = self.entries[id.index()].as_mut() {
            if !entry.marked {
                entry.marked = true;
                gray.push(id);
            }
        }
    }

    /// Frees unmarked slots and clears mark bits on survivors.
    ///
    /// Class objects hold their subclass sets weakly: entries pointing at
    /// swept slots are pruned here rather than keeping subclasses alive.
    fn sweep(&mut self) {
        let mut freed: ahash::AHashSet<HeapId> = ahash::AHashSet::new();
        let mut bytes_freed = 0usize;
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    bytes_freed += entry.data.size_estimate();
                    freed.insert(HeapId::from_index(index));
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes_freed);

        if !freed.is_empty() {
            for slot in &mut self.entries {
                if let Some(entry) = slot {
                    if let HeapData::Class(class) = &mut entry.data {
                        class.subclasses.retain(|sub| !freed.contains(sub));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Str;

    fn str_obj(s: &str) -> HeapData {
        HeapData::Str(Str::new(s.to_owned()))
    }

    #[test]
    fn alloc_and_get() {
        let mut heap = Heap::new();
        let id = heap.alloc(str_obj("hello"));
        match heap.get(id) {
            HeapData::Str(s) => assert_eq!(s.as_str(), "hello"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_roots() {
        let mut heap = Heap::new();
        let kept = heap.alloc(str_obj("kept"));
        let _dropped = heap.alloc(str_obj("dropped"));
        heap.collect(&[Value::Ref(kept)]);
        assert_eq!(heap.live_count(), 1);
        match heap.get(kept) {
            HeapData::Str(s) => assert_eq!(s.as_str(), "kept"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn collect_traces_through_containers() {
        let mut heap = Heap::new();
        let inner = heap.alloc(str_obj("inner"));
        let tuple = heap.alloc(HeapData::Tuple(crate::object::Tuple::new(vec![Value::Ref(inner)])));
        heap.collect(&[Value::Ref(tuple)]);
        assert_eq!(heap.live_count(), 2);
        // A second collection with no roots frees everything.
        heap.collect(&[]);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn slots_are_reused_after_sweep() {
        let mut heap = Heap::new();
        let a = heap.alloc(str_obj("a"));
        heap.collect(&[]);
        let b = heap.alloc(str_obj("b"));
        assert_eq!(a.index(), b.index());
    }
}
