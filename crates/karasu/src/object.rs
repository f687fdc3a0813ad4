//! Heap object payloads and their GC scan hooks.
//!
//! Every runtime object is a [`HeapData`] variant stored in the arena. The
//! shared header bits (mark, repr guard) live on the heap entry; this module
//! defines the payloads, the `trace` hook the collector uses to walk the
//! object graph, and the structural equality/hash/ordering helpers used for
//! dict keys and the fast comparison paths.

use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::bytecode::chunk::Chunk;
use crate::exceptions::VmResult;
use crate::heap::{Heap, HeapId};
use crate::value::Value;
use crate::vm::Vm;

/// Fixed-seed hasher state so string hashes are stable for the lifetime of
/// the process, as the intern table requires.
fn hasher() -> impl Hasher {
    ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
    .build_hasher()
}

/// Hashes a byte slice with the VM's canonical hash function.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = hasher();
    bytes.hash(&mut h);
    h.finish()
}

/// Hashes an i64 with the VM's canonical hash function.
#[must_use]
pub fn hash_i64(value: i64) -> u64 {
    let mut h = hasher();
    value.hash(&mut h);
    h.finish()
}

/// Character width classification of a string's widest codepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrWidth {
    Ascii,
    Ucs1,
    Ucs2,
    Ucs4,
}

/// Immutable interned string object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Str {
    text: Box<str>,
    char_len: u32,
    width: StrWidth,
    hash: u64,
}

impl Str {
    #[must_use]
    pub fn new(text: String) -> Self {
        let mut char_len = 0u32;
        let mut max = 0u32;
        for ch in text.chars() {
            char_len += 1;
            max = max.max(ch as u32);
        }
        let width = match max {
            0..=0x7f => StrWidth::Ascii,
            0x80..=0xff => StrWidth::Ucs1,
            0x100..=0xffff => StrWidth::Ucs2,
            _ => StrWidth::Ucs4,
        };
        let hash = hash_bytes(text.as_bytes());
        Self {
            text: text.into_boxed_str(),
            char_len,
            width,
            hash,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in codepoints, not bytes.
    #[inline]
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.char_len as usize
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> StrWidth {
        self.width
    }

    /// The cached content hash; never changes once the string is built.
    #[inline]
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The codepoint at character index `index`.
    #[must_use]
    pub fn nth_char(&self, index: usize) -> Option<char> {
        self.text.chars().nth(index)
    }
}

/// Immutable bytes object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bytes {
    data: Vec<u8>,
    hash: u64,
}

impl Bytes {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        let hash = hash_bytes(&data);
        Self { data, hash }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Immutable tuple.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub items: Vec<Value>,
}

impl Tuple {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

/// Mutable list.
#[derive(Debug, Clone, Default)]
pub struct List {
    pub items: Vec<Value>,
}

impl List {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

/// Mutable dict preserving insertion order.
///
/// Keyed by the value hash; each bucket holds the colliding `(key, value)`
/// pairs so equality can be checked properly on lookup.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    map: IndexMap<u64, Vec<(Value, Value)>>,
    len: usize,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up `key` given its precomputed hash.
    #[must_use]
    pub fn get_hashed(&self, heap: &Heap, hash: u64, key: Value) -> Option<Value> {
        let bucket = self.map.get(&hash)?;
        bucket
            .iter()
            .find(|(k, _)| py_eq(heap, *k, key))
            .map(|(_, v)| *v)
    }

    /// Inserts `key -> value`, returning the previous value if the key existed.
    pub fn insert_hashed(&mut self, heap: &Heap, hash: u64, key: Value, value: Value) -> Option<Value> {
        let bucket = self.map.entry(hash).or_default();
        for pair in bucket.iter_mut() {
            if py_eq(heap, pair.0, key) {
                return Some(std::mem::replace(&mut pair.1, value));
            }
        }
        bucket.push((key, value));
        self.len += 1;
        None
    }

    /// Removes `key`, returning its value if present.
    pub fn remove_hashed(&mut self, heap: &Heap, hash: u64, key: Value) -> Option<Value> {
        let bucket = self.map.get_mut(&hash)?;
        let position = bucket.iter().position(|(k, _)| py_eq(heap, *k, key))?;
        let (_, value) = bucket.remove(position);
        self.len -= 1;
        Some(value)
    }

    /// All entries in (bucket) insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.map.values().flat_map(|bucket| bucket.iter().copied()).collect()
    }
}

/// Mutable set built on the same bucket layout as [`Dict`].
#[derive(Debug, Clone, Default)]
pub struct Set {
    map: IndexMap<u64, Vec<Value>>,
    len: usize,
}

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn contains_hashed(&self, heap: &Heap, hash: u64, value: Value) -> bool {
        self.map
            .get(&hash)
            .is_some_and(|bucket| bucket.iter().any(|v| py_eq(heap, *v, value)))
    }

    /// Adds a value; returns false if it was already present.
    pub fn add_hashed(&mut self, heap: &Heap, hash: u64, value: Value) -> bool {
        let bucket = self.map.entry(hash).or_default();
        if bucket.iter().any(|v| py_eq(heap, *v, value)) {
            return false;
        }
        bucket.push(value);
        self.len += 1;
        true
    }

    pub fn remove_hashed(&mut self, heap: &Heap, hash: u64, value: Value) -> bool {
        if let Some(bucket) = self.map.get_mut(&hash) {
            if let Some(position) = bucket.iter().position(|v| py_eq(heap, *v, value)) {
                bucket.remove(position);
                self.len -= 1;
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Value> {
        self.map.values().flat_map(|bucket| bucket.iter().copied()).collect()
    }
}

bitflags::bitflags! {
    /// Immutable flags of a finalized code object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u8 {
        /// Calling the function builds a generator instead of running the body.
        const GENERATOR = 1 << 0;
        /// Generator flagged as awaitable.
        const COROUTINE = 1 << 1;
        /// Extra positional arguments are collected into a tuple.
        const COLLECTS_ARGS = 1 << 2;
        /// Extra keyword arguments are collected into a dict.
        const COLLECTS_KWS = 1 << 3;
        /// Module-level body.
        const MODULE = 1 << 4;
        /// Synthetic class-body function.
        const CLASS_BODY = 1 << 5;
    }
}

impl Serialize for CodeFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for CodeFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits))
    }
}

/// Immutable compiled representation of a function or module body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeObject {
    /// Instruction bytes, constant pool and line map.
    pub chunk: Rc<Chunk>,
    /// Simple name (interned string).
    pub name: HeapId,
    /// Dotted qualified name.
    pub qualname: HeapId,
    /// Source filename.
    pub filename: HeapId,
    /// First statement docstring, if any.
    pub docstring: Option<Value>,
    /// Parameter names without defaults, in declaration order.
    pub required_args: Vec<HeapId>,
    /// Parameter names with defaults (defaults are encoded in the prologue).
    pub optional_args: Vec<HeapId>,
    /// Keyword-only parameter names (after `*args`).
    pub keyword_only_args: Vec<HeapId>,
    /// Local slot names, for diagnostics.
    pub local_names: Vec<HeapId>,
    /// Number of upvalues captured by closures over this code.
    pub upvalue_count: u16,
    pub flags: CodeFlags,
    /// Module the code was compiled in, patched when the module is created.
    pub module: Option<HeapId>,
}

impl CodeObject {
    /// Total number of declared parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.required_args.len()
            + self.optional_args.len()
            + self.keyword_only_args.len()
            + usize::from(self.flags.contains(CodeFlags::COLLECTS_ARGS))
            + usize::from(self.flags.contains(CodeFlags::COLLECTS_KWS))
    }
}

/// A function value: code plus captured upvalue cells.
#[derive(Debug, Clone)]
pub struct Closure {
    pub code: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// A cell mediating access to a captured variable.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    /// Indexes a live slot on the value stack.
    Open(usize),
    /// Owns the value after the slot was popped.
    Closed(Value),
}

/// Special methods with cached per-class slots.
///
/// On class finalization the base chain is walked once per slot; afterwards
/// the VM reads these without a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    Init,
    Str,
    Repr,
    Eq,
    Hash,
    GetItem,
    SetItem,
    Iter,
    Call,
    Enter,
    Exit,
}

pub const SLOT_COUNT: usize = 11;

/// Cached special-method slots, indexed by [`Slot`].
#[derive(Debug, Clone, Default)]
pub struct CachedSlots([Option<Value>; SLOT_COUNT]);

impl CachedSlots {
    #[inline]
    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<Value> {
        self.0[slot as usize]
    }

    #[inline]
    pub fn set(&mut self, slot: Slot, value: Option<Value>) {
        self.0[slot as usize] = value;
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.0.iter().flatten().copied()
    }
}

/// A user-defined (or builtin) class.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: HeapId,
    pub filename: Option<HeapId>,
    pub docstring: Option<Value>,
    pub base: Option<HeapId>,
    /// Attribute table; keys are interned name strings.
    pub methods: AHashMap<HeapId, Value>,
    pub annotations: AHashMap<HeapId, Value>,
    /// Weakly referenced subclasses; pruned by the collector on sweep.
    pub subclasses: Vec<HeapId>,
    pub finalized: bool,
    pub cached: CachedSlots,
}

impl Class {
    #[must_use]
    pub fn new(name: HeapId, base: Option<HeapId>) -> Self {
        Self {
            name,
            filename: None,
            docstring: None,
            base,
            methods: AHashMap::new(),
            annotations: AHashMap::new(),
            subclasses: Vec::new(),
            finalized: false,
            cached: CachedSlots::default(),
        }
    }
}

/// An instance of a class.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class: HeapId,
    pub fields: AHashMap<HeapId, Value>,
}

impl Instance {
    #[must_use]
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            fields: AHashMap::new(),
        }
    }
}

/// A callable attribute bound to its receiver.
#[derive(Debug, Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub callable: Value,
}

/// Positional and keyword arguments passed to a native callable.
#[derive(Debug, Default)]
pub struct NativeArgs {
    pub args: Vec<Value>,
    /// Keyword arguments as (interned name, value) pairs.
    pub kwargs: Vec<(HeapId, Value)>,
}

/// Signature shared by all host-provided callables.
pub type NativeFn = fn(&mut Vm, NativeArgs) -> VmResult<Value>;

/// Binding style of a native callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Function,
    Method,
    StaticMethod,
    ClassMethod,
    Property,
}

/// A host-provided function respecting the bytecode calling convention.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub doc: &'static str,
    pub kind: NativeKind,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

/// A loaded module: its name and global fields table.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: HeapId,
    pub fields: AHashMap<HeapId, Value>,
}

impl Module {
    #[must_use]
    pub fn new(name: HeapId) -> Self {
        Self {
            name,
            fields: AHashMap::new(),
        }
    }
}

/// Resume state of a generator frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Created but never resumed.
    Created,
    /// Suspended at a `YIELD`.
    Suspended,
    /// Currently executing (re-entry is an error).
    Running,
    /// Ran to completion; every further call returns the generator itself.
    Done,
}

/// A suspended frame: a generator or coroutine.
///
/// Owns a private value stack and instruction pointer which are swapped into
/// the thread's active structures on resume and saved back at the next yield.
#[derive(Debug, Clone)]
pub struct Generator {
    pub closure: HeapId,
    pub globals: HeapId,
    pub state: GenState,
    pub ip: usize,
    pub stack: Vec<Value>,
}

impl Generator {
    #[must_use]
    pub fn new(closure: HeapId, globals: HeapId, stack: Vec<Value>) -> Self {
        Self {
            closure,
            globals,
            state: GenState::Created,
            ip: 0,
            stack,
        }
    }
}

/// Lazy integer range.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

/// Iterator over a [`Range`]. Calling it yields the next value, or the
/// iterator itself once exhausted.
#[derive(Debug, Clone, Copy)]
pub struct RangeIter {
    pub current: i64,
    pub stop: i64,
    pub step: i64,
}

/// Index-based iterator over a sequence (list, tuple, str, bytes) or a
/// snapshot of dict keys / set members.
#[derive(Debug, Clone)]
pub struct SeqIter {
    pub seq: Value,
    pub index: usize,
    /// Snapshot for dict/set iteration, taken when the iterator is built.
    pub snapshot: Option<Vec<Value>>,
}

/// Every heap object the runtime knows about.
#[derive(Debug, Clone)]
pub enum HeapData {
    Str(Str),
    Bytes(Bytes),
    BigInt(BigInt),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    Set(Set),
    Code(CodeObject),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Native(NativeFunction),
    Module(Module),
    Generator(Generator),
    Range(Range),
    RangeIter(RangeIter),
    SeqIter(SeqIter),
}

impl HeapData {
    /// User-facing type name; instances report their class name via the VM.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::BigInt(_) => "int",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Code(_) => "code",
            Self::Closure(_) => "function",
            Self::Upvalue(_) => "cell",
            Self::Class(_) => "type",
            Self::Instance(_) => "object",
            Self::BoundMethod(_) => "method",
            Self::Native(_) => "builtin_function_or_method",
            Self::Module(_) => "module",
            Self::Generator(_) => "generator",
            Self::Range(_) => "range",
            Self::RangeIter(_) | Self::SeqIter(_) => "iterator",
        }
    }

    /// Pushes every value this object references, for the mark phase.
    ///
    /// Class subclass sets are deliberately omitted: they are weak.
    pub fn trace(&self, out: &mut Vec<Value>) {
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::BigInt(_) | Self::Native(_) | Self::Range(_) | Self::RangeIter(_) => {}
            Self::Tuple(Tuple { items }) | Self::List(List { items }) => out.extend_from_slice(items),
            Self::Dict(dict) => {
                for bucket in dict.map.values() {
                    for (k, v) in bucket {
                        out.push(*k);
                        out.push(*v);
                    }
                }
            }
            Self::Set(set) => {
                for bucket in set.map.values() {
                    out.extend_from_slice(bucket);
                }
            }
            Self::Code(code) => {
                out.extend_from_slice(code.chunk.constants());
                out.push(Value::Ref(code.name));
                out.push(Value::Ref(code.qualname));
                out.push(Value::Ref(code.filename));
                if let Some(doc) = code.docstring {
                    out.push(doc);
                }
                for id in code
                    .required_args
                    .iter()
                    .chain(&code.optional_args)
                    .chain(&code.keyword_only_args)
                    .chain(&code.local_names)
                {
                    out.push(Value::Ref(*id));
                }
                if let Some(module) = code.module {
                    out.push(Value::Ref(module));
                }
            }
            Self::Closure(closure) => {
                out.push(Value::Ref(closure.code));
                for upvalue in &closure.upvalues {
                    out.push(Value::Ref(*upvalue));
                }
            }
            Self::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    out.push(*value);
                }
            }
            Self::Class(class) => {
                out.push(Value::Ref(class.name));
                if let Some(filename) = class.filename {
                    out.push(Value::Ref(filename));
                }
                if let Some(doc) = class.docstring {
                    out.push(doc);
                }
                if let Some(base) = class.base {
                    out.push(Value::Ref(base));
                }
                for (k, v) in class.methods.iter().chain(&class.annotations) {
                    out.push(Value::Ref(*k));
                    out.push(*v);
                }
                out.extend(class.cached.values());
            }
            Self::Instance(instance) => {
                out.push(Value::Ref(instance.class));
                for (k, v) in &instance.fields {
                    out.push(Value::Ref(*k));
                    out.push(*v);
                }
            }
            Self::BoundMethod(method) => {
                out.push(method.receiver);
                out.push(method.callable);
            }
            Self::Module(module) => {
                out.push(Value::Ref(module.name));
                for (k, v) in &module.fields {
                    out.push(Value::Ref(*k));
                    out.push(*v);
                }
            }
            Self::Generator(generator) => {
                out.push(Value::Ref(generator.closure));
                out.push(Value::Ref(generator.globals));
                out.extend_from_slice(&generator.stack);
            }
            Self::SeqIter(iter) => {
                out.push(iter.seq);
                if let Some(snapshot) = &iter.snapshot {
                    out.extend_from_slice(snapshot);
                }
            }
        }
    }

    /// Rough allocation size used for the GC watermark.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        base + match self {
            Self::Str(s) => s.text.len(),
            Self::Bytes(b) => b.data.len(),
            Self::BigInt(b) => b.to_bytes_le().1.len(),
            Self::Tuple(Tuple { items }) | Self::List(List { items }) => items.len() * std::mem::size_of::<Value>(),
            Self::Dict(d) => d.len() * 2 * std::mem::size_of::<Value>(),
            Self::Set(s) => s.len() * std::mem::size_of::<Value>(),
            Self::Code(code) => code.chunk.len() + code.chunk.constants().len() * std::mem::size_of::<Value>(),
            Self::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapId>(),
            Self::Class(c) => c.methods.len() * 2 * std::mem::size_of::<Value>(),
            Self::Instance(i) => i.fields.len() * 2 * std::mem::size_of::<Value>(),
            Self::Module(m) => m.fields.len() * 2 * std::mem::size_of::<Value>(),
            Self::Generator(g) => g.stack.len() * std::mem::size_of::<Value>(),
            Self::SeqIter(i) => i.snapshot.as_ref().map_or(0, |s| s.len() * std::mem::size_of::<Value>()),
            _ => 0,
        }
    }
}

/// Structural equality without user dunder dispatch.
///
/// Used for dict/set keys, `in` fast paths, and marker-free comparisons.
/// Instance values compare by identity here; the VM layer consults `__eq__`.
#[must_use]
pub fn py_eq(heap: &Heap, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) | (Value::NotImplemented, Value::NotImplemented) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (x as f64) == y,
        (Value::Bool(x), other) | (other, Value::Bool(x)) => py_eq(heap, Value::Int(i64::from(x)), other),
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return true;
            }
            match (heap.get(x), heap.get(y)) {
                (HeapData::Str(s1), HeapData::Str(s2)) => s1.as_str() == s2.as_str(),
                (HeapData::Bytes(b1), HeapData::Bytes(b2)) => b1.as_slice() == b2.as_slice(),
                (HeapData::BigInt(i1), HeapData::BigInt(i2)) => i1 == i2,
                (HeapData::Tuple(t1), HeapData::Tuple(t2)) => {
                    t1.items.len() == t2.items.len()
                        && t1.items.iter().zip(&t2.items).all(|(l, r)| py_eq(heap, *l, *r))
                }
                (HeapData::List(l1), HeapData::List(l2)) => {
                    l1.items.len() == l2.items.len()
                        && l1.items.iter().zip(&l2.items).all(|(l, r)| py_eq(heap, *l, *r))
                }
                _ => false,
            }
        }
        (Value::Int(x), Value::Ref(y)) | (Value::Ref(y), Value::Int(x)) => match heap.get(y) {
            HeapData::BigInt(big) => *big == BigInt::from(x),
            _ => false,
        },
        _ => false,
    }
}

/// Structural ordering for numbers, strings, bytes and sequences.
#[must_use]
pub fn py_cmp(heap: &Heap, a: Value, b: Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y),
        (Value::Int(x), Value::Float(y)) => (x as f64).partial_cmp(&y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(y as f64)),
        (Value::Bool(x), other) => py_cmp(heap, Value::Int(i64::from(x)), other),
        (other, Value::Bool(y)) => py_cmp(heap, other, Value::Int(i64::from(y))),
        (Value::Ref(x), Value::Ref(y)) => match (heap.get(x), heap.get(y)) {
            (HeapData::Str(s1), HeapData::Str(s2)) => Some(s1.as_str().cmp(s2.as_str())),
            (HeapData::Bytes(b1), HeapData::Bytes(b2)) => Some(b1.as_slice().cmp(b2.as_slice())),
            (HeapData::BigInt(i1), HeapData::BigInt(i2)) => Some(i1.cmp(i2)),
            (HeapData::Tuple(t1), HeapData::Tuple(t2)) => seq_cmp(heap, &t1.items, &t2.items),
            (HeapData::List(l1), HeapData::List(l2)) => seq_cmp(heap, &l1.items, &l2.items),
            _ => None,
        },
        (Value::Int(x), Value::Ref(y)) => match heap.get(y) {
            HeapData::BigInt(big) => Some(BigInt::from(x).cmp(big)),
            _ => None,
        },
        (Value::Ref(x), Value::Int(y)) => match heap.get(x) {
            HeapData::BigInt(big) => Some(big.cmp(&BigInt::from(y))),
            _ => None,
        },
        _ => None,
    }
}

fn seq_cmp(heap: &Heap, a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (l, r) in a.iter().zip(b) {
        match py_cmp(heap, *l, *r)? {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// Structural hash; `None` means the value is unhashable.
///
/// Numeric values that compare equal hash equally (`hash(1) == hash(1.0)`),
/// and string hashes come from the cached content hash.
#[must_use]
pub fn py_hash(heap: &Heap, value: Value) -> Option<u64> {
    match value {
        Value::None => Some(hash_i64(0x6e6f_6e65)),
        Value::NotImplemented => Some(hash_i64(0x6e69_6d70)),
        Value::Bool(b) => Some(hash_i64(i64::from(b))),
        Value::Int(i) => Some(hash_i64(i)),
        Value::Float(f) => {
            if f.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&f) {
                Some(hash_i64(f as i64))
            } else {
                Some(hash_bytes(&f.to_bits().to_be_bytes()))
            }
        }
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Some(s.hash()),
            HeapData::Bytes(b) => Some(b.hash()),
            HeapData::BigInt(big) => big.to_i64().map_or_else(
                || {
                    let (_, bytes) = big.to_bytes_le();
                    Some(hash_bytes(&bytes))
                },
                |i| Some(hash_i64(i)),
            ),
            HeapData::Tuple(tuple) => {
                let mut acc = 0x345678_u64;
                for item in &tuple.items {
                    acc = acc.wrapping_mul(1_000_003).wrapping_add(py_hash(heap, *item)?);
                }
                Some(acc)
            }
            HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_) => None,
            // Identity hash for everything else.
            _ => Some(hash_i64(id.index() as i64)),
        },
        Value::Undefined | Value::Handler(_) | Value::Kwargs(_) => None,
    }
}

/// Truthiness following the language's semantics.
#[must_use]
pub fn py_truthy(heap: &Heap, value: Value) -> bool {
    match value {
        Value::None | Value::Undefined => false,
        Value::NotImplemented => true,
        Value::Bool(b) => b,
        Value::Int(i) => i != 0,
        Value::Float(f) => f != 0.0,
        Value::Handler(_) | Value::Kwargs(_) => true,
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => s.char_len() != 0,
            HeapData::Bytes(b) => !b.is_empty(),
            HeapData::BigInt(big) => !num_traits::Zero::is_zero(big),
            HeapData::Tuple(t) => !t.items.is_empty(),
            HeapData::List(l) => !l.items.is_empty(),
            HeapData::Dict(d) => !d.is_empty(),
            HeapData::Set(s) => !s.is_empty(),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_width_and_char_len() {
        let ascii = Str::new("abc".to_owned());
        assert_eq!(ascii.width(), StrWidth::Ascii);
        assert_eq!(ascii.char_len(), 3);

        let latin = Str::new("héllo".to_owned());
        assert_eq!(latin.width(), StrWidth::Ucs1);
        assert_eq!(latin.char_len(), 5);

        let wide = Str::new("日本".to_owned());
        assert_eq!(wide.width(), StrWidth::Ucs2);
        assert_eq!(wide.char_len(), 2);

        let emoji = Str::new("🦀".to_owned());
        assert_eq!(emoji.width(), StrWidth::Ucs4);
        assert_eq!(emoji.char_len(), 1);
    }

    #[test]
    fn equal_strings_hash_equal() {
        let a = Str::new("interned".to_owned());
        let b = Str::new("interned".to_owned());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn int_and_float_hash_consistency() {
        let heap = Heap::new();
        assert_eq!(py_hash(&heap, Value::Int(1)), py_hash(&heap, Value::Float(1.0)));
        assert_eq!(py_hash(&heap, Value::Bool(true)), py_hash(&heap, Value::Int(1)));
    }

    #[test]
    fn dict_insert_get_remove() {
        let mut heap = Heap::new();
        let key = heap.alloc(HeapData::Str(Str::new("k".to_owned())));
        let hash = py_hash(&heap, Value::Ref(key)).unwrap();
        let mut dict = Dict::new();
        assert!(dict.insert_hashed(&heap, hash, Value::Ref(key), Value::Int(1)).is_none());
        assert_eq!(dict.get_hashed(&heap, hash, Value::Ref(key)), Some(Value::Int(1)));
        assert_eq!(
            dict.insert_hashed(&heap, hash, Value::Ref(key), Value::Int(2)),
            Some(Value::Int(1))
        );
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.remove_hashed(&heap, hash, Value::Ref(key)), Some(Value::Int(2)));
        assert!(dict.is_empty());
    }

    #[test]
    fn tuple_ordering_is_lexicographic() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapData::Tuple(Tuple::new(vec![Value::Int(1), Value::Int(2)])));
        let b = heap.alloc(HeapData::Tuple(Tuple::new(vec![Value::Int(1), Value::Int(3)])));
        assert_eq!(py_cmp(&heap, Value::Ref(a), Value::Ref(b)), Some(Ordering::Less));
    }
}
