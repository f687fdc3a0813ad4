//! Process-wide string interning.
//!
//! Every string object is canonicalized through the [`Interner`]: at most one
//! heap instance exists per byte content, so identity comparison implies
//! equality and attribute tables can be keyed by `HeapId`. The intern table
//! is part of the GC root set, which keeps interned strings alive for the
//! lifetime of the VM.

use ahash::AHashMap;

use crate::heap::{Heap, HeapId};
use crate::object::{HeapData, Str};
use crate::value::Value;

/// Content-keyed table of canonical string instances.
#[derive(Debug, Default)]
pub struct Interner {
    map: AHashMap<Box<str>, HeapId>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical heap id for `text`, allocating on first use.
    pub fn intern(&mut self, heap: &mut Heap, text: &str) -> HeapId {
        if let Some(id) = self.map.get(text) {
            return *id;
        }
        let id = heap.alloc(HeapData::Str(Str::new(text.to_owned())));
        self.map.insert(text.into(), id);
        id
    }

    /// Looks up an already-interned string without allocating.
    #[must_use]
    pub fn get(&self, text: &str) -> Option<HeapId> {
        self.map.get(text).copied()
    }

    /// Appends every interned string to the GC root list.
    pub fn roots(&self, out: &mut Vec<Value>) {
        out.extend(self.map.values().map(|id| Value::Ref(*id)));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Pre-interned names the VM looks up on hot paths: special methods, the
/// exception fields, and the module metadata attributes.
#[derive(Debug, Clone)]
pub struct SpecialNames {
    pub init: HeapId,
    pub str_: HeapId,
    pub repr: HeapId,
    pub eq: HeapId,
    pub ne: HeapId,
    pub lt: HeapId,
    pub gt: HeapId,
    pub le: HeapId,
    pub ge: HeapId,
    pub hash: HeapId,
    pub getitem: HeapId,
    pub setitem: HeapId,
    pub delitem: HeapId,
    pub iter: HeapId,
    pub call: HeapId,
    pub enter: HeapId,
    pub exit: HeapId,
    pub len: HeapId,
    pub contains: HeapId,
    pub add: HeapId,
    pub radd: HeapId,
    pub sub: HeapId,
    pub rsub: HeapId,
    pub mul: HeapId,
    pub rmul: HeapId,
    pub truediv: HeapId,
    pub rtruediv: HeapId,
    pub floordiv: HeapId,
    pub rfloordiv: HeapId,
    pub mod_: HeapId,
    pub rmod: HeapId,
    pub pow: HeapId,
    pub rpow: HeapId,
    pub lshift: HeapId,
    pub rlshift: HeapId,
    pub rshift: HeapId,
    pub rrshift: HeapId,
    pub or: HeapId,
    pub ror: HeapId,
    pub xor: HeapId,
    pub rxor: HeapId,
    pub and: HeapId,
    pub rand: HeapId,
    pub neg: HeapId,
    pub invert: HeapId,
    pub init_subclass: HeapId,
    pub set_name: HeapId,
    pub name_attr: HeapId,
    pub main: HeapId,
    pub doc: HeapId,
    pub arg: HeapId,
    pub cause: HeapId,
    pub context: HeapId,
    pub traceback: HeapId,
    pub builtins: HeapId,
    pub empty: HeapId,
}

impl SpecialNames {
    pub fn new(interner: &mut Interner, heap: &mut Heap) -> Self {
        let mut i = |s: &str| interner.intern(heap, s);
        Self {
            init: i("__init__"),
            str_: i("__str__"),
            repr: i("__repr__"),
            eq: i("__eq__"),
            ne: i("__ne__"),
            lt: i("__lt__"),
            gt: i("__gt__"),
            le: i("__le__"),
            ge: i("__ge__"),
            hash: i("__hash__"),
            getitem: i("__getitem__"),
            setitem: i("__setitem__"),
            delitem: i("__delitem__"),
            iter: i("__iter__"),
            call: i("__call__"),
            enter: i("__enter__"),
            exit: i("__exit__"),
            len: i("__len__"),
            contains: i("__contains__"),
            add: i("__add__"),
            radd: i("__radd__"),
            sub: i("__sub__"),
            rsub: i("__rsub__"),
            mul: i("__mul__"),
            rmul: i("__rmul__"),
            truediv: i("__truediv__"),
            rtruediv: i("__rtruediv__"),
            floordiv: i("__floordiv__"),
            rfloordiv: i("__rfloordiv__"),
            mod_: i("__mod__"),
            rmod: i("__rmod__"),
            pow: i("__pow__"),
            rpow: i("__rpow__"),
            lshift: i("__lshift__"),
            rlshift: i("__rlshift__"),
            rshift: i("__rshift__"),
            rrshift: i("__rrshift__"),
            or: i("__or__"),
            ror: i("__ror__"),
            xor: i("__xor__"),
            rxor: i("__rxor__"),
            and: i("__and__"),
            rand: i("__rand__"),
            neg: i("__neg__"),
            invert: i("__invert__"),
            init_subclass: i("__init_subclass__"),
            set_name: i("__set_name__"),
            name_attr: i("__name__"),
            main: i("__main__"),
            doc: i("__doc__"),
            arg: i("arg"),
            cause: i("__cause__"),
            context: i("__context__"),
            traceback: i("traceback"),
            builtins: i("__builtins__"),
            empty: i(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_canonical() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "hello");
        let b = interner.intern(&mut heap, "hello");
        let c = interner.intern(&mut heap, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn interned_strings_survive_collection() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let id = interner.intern(&mut heap, "keep");
        let mut roots = Vec::new();
        interner.roots(&mut roots);
        heap.collect(&roots);
        match heap.get(id) {
            HeapData::Str(s) => assert_eq!(s.as_str(), "keep"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
