//! The stack-based virtual machine.
//!
//! A [`Vm`] owns the heap, the value stack, and the call-frame stack, and
//! executes compiled chunks one byte at a time. Instruction boundaries are
//! the VM's safe points: the GC watermark and the asynchronous `SIGNALLED`
//! flag are polled there, so neither can observe a half-built object or
//! fire mid-instruction.
//!
//! Generators get their own private value stacks: resuming one splices its
//! saved slots onto the live stack, runs a nested dispatch loop until the
//! next `YIELD`, and saves the slots back out.

mod arith;
mod calls;
mod fmt;
mod unwind;

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::op::{self, Opcode};
use crate::exceptions::{ExcType, VmErr, VmResult};
use crate::heap::{Heap, HeapId};
use crate::intern::{Interner, SpecialNames};
use crate::io::PrintWriter;
use crate::object::{self, Class, CodeFlags, GenState, HeapData, RangeIter, SeqIter, Slot, Upvalue};
use crate::value::{Handler, HandlerKind, Value};

bitflags::bitflags! {
    /// Per-thread VM flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        const HAS_EXCEPTION = 1 << 0;
        const SIGNALLED = 1 << 1;
        const ENABLE_TRACING = 1 << 2;
        const ENABLE_DISASSEMBLY = 1 << 3;
    }
}

/// Maximum call-frame depth; exceeding it raises `RuntimeError`.
pub const FRAMES_MAX: usize = 256;

/// One activation record.
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    /// Cached chunk of the closure's code object.
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    /// Index of local slot 0 on the value stack.
    pub stack_base: usize,
    /// Module whose fields are this frame's globals.
    pub globals: HeapId,
    /// Generator being driven by this frame, if any.
    pub gen: Option<HeapId>,
}

/// How a nested dispatch loop ended.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Returned(Value),
    Yielded(Value),
}

/// The classes backing primitive values and builtin containers.
#[derive(Debug, Default, Clone)]
pub struct CoreClasses {
    pub object: Option<HeapId>,
    pub int: Option<HeapId>,
    pub float: Option<HeapId>,
    pub bool_: Option<HeapId>,
    pub none: Option<HeapId>,
    pub str_: Option<HeapId>,
    pub bytes: Option<HeapId>,
    pub tuple: Option<HeapId>,
    pub list: Option<HeapId>,
    pub dict: Option<HeapId>,
    pub set: Option<HeapId>,
    pub function: Option<HeapId>,
    pub module: Option<HeapId>,
    pub generator: Option<HeapId>,
    pub range: Option<HeapId>,
    pub type_: Option<HeapId>,
}

/// The virtual machine: heap, interner, thread state, and output sink.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interner: Interner,
    pub(crate) names: SpecialNames,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalue cells, sorted by stack index.
    open_upvalues: Vec<HeapId>,
    /// Module cache keyed by dotted name.
    pub(crate) modules: IndexMap<String, Value>,
    /// Builtin namespace, consulted after module globals.
    pub(crate) builtins: AHashMap<HeapId, Value>,
    /// Exception currently being handled (inside an except clause or during
    /// cleanup-driven re-raise).
    pub(crate) exception: Option<Value>,
    pub(crate) flags: VmFlags,
    signal: Arc<AtomicBool>,
    pub(crate) core: CoreClasses,
    pub(crate) exc_classes: AHashMap<ExcType, HeapId>,
    /// Module search path (from the environment, plus the entry directory).
    pub(crate) module_paths: Vec<std::path::PathBuf>,
    pub(crate) out: Box<dyn PrintWriter>,
}

impl Vm {
    pub fn new(out: Box<dyn PrintWriter>) -> Self {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let names = SpecialNames::new(&mut interner, &mut heap);
        let mut vm = Self {
            heap,
            interner,
            names,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            modules: IndexMap::new(),
            builtins: AHashMap::new(),
            exception: None,
            flags: VmFlags::empty(),
            signal: Arc::new(AtomicBool::new(false)),
            core: CoreClasses::default(),
            exc_classes: AHashMap::new(),
            module_paths: crate::modules::search_path(),
            out,
        };
        crate::builtins::install(&mut vm);
        vm
    }

    /// Handle that asynchronous code (e.g. a signal handler) may set to
    /// request a `KeyboardInterrupt` at the next instruction boundary.
    #[must_use]
    pub fn signal_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.signal)
    }

    // ==================================================================
    // Stack primitives
    // ==================================================================

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.chunk.code()[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_u24(&mut self) -> u32 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = frame.chunk.read_u24(frame.ip);
        frame.ip += 3;
        value
    }

    fn read_operand(&mut self, long: bool) -> usize {
        if long {
            self.read_u24() as usize
        } else {
            self.read_byte() as usize
        }
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = self.read_operand(long);
        self.frame().chunk.constant(index)
    }

    /// Reads a name constant, which is always an interned string.
    fn read_name(&mut self, long: bool) -> HeapId {
        match self.read_constant(long) {
            Value::Ref(id) => id,
            other => panic!("name constant is not a string: {other:?}"),
        }
    }

    pub(crate) fn intern(&mut self, text: &str) -> HeapId {
        self.interner.intern(&mut self.heap, text)
    }

    pub(crate) fn intern_value(&mut self, text: &str) -> Value {
        Value::Ref(self.intern(text))
    }

    /// The canonical name string behind an interned id.
    pub(crate) fn name_str(&self, id: HeapId) -> String {
        match self.heap.get(id) {
            HeapData::Str(s) => s.as_str().to_owned(),
            _ => String::new(),
        }
    }

    // ==================================================================
    // Garbage collection orchestration
    // ==================================================================

    /// Runs a collection with the full root set of §2: value stack, frame
    /// stack, open upvalues, module cache, interned strings, builtins and
    /// the exception slot.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + 64);
        roots.extend_from_slice(&self.stack);
        for frame in &self.frames {
            roots.push(Value::Ref(frame.closure));
            roots.push(Value::Ref(frame.globals));
            if let Some(gen) = frame.gen {
                roots.push(Value::Ref(gen));
            }
        }
        roots.extend(self.open_upvalues.iter().map(|id| Value::Ref(*id)));
        roots.extend(self.modules.values().copied());
        roots.extend(self.builtins.values().copied());
        if let Some(exc) = self.exception {
            roots.push(exc);
        }
        for id in self.exc_classes.values() {
            roots.push(Value::Ref(*id));
        }
        let core = [
            self.core.object,
            self.core.int,
            self.core.float,
            self.core.bool_,
            self.core.none,
            self.core.str_,
            self.core.bytes,
            self.core.tuple,
            self.core.list,
            self.core.dict,
            self.core.set,
            self.core.function,
            self.core.module,
            self.core.generator,
            self.core.range,
            self.core.type_,
        ];
        roots.extend(core.iter().flatten().map(|id| Value::Ref(*id)));
        self.interner.roots(&mut roots);
        self.heap.collect(&roots);
    }

    // ==================================================================
    // Upvalues
    // ==================================================================

    fn capture_upvalue(&mut self, stack_index: usize) -> HeapId {
        for id in &self.open_upvalues {
            if let HeapData::Upvalue(Upvalue::Open(index)) = self.heap.get(*id) {
                if *index == stack_index {
                    return *id;
                }
            }
        }
        let id = self.heap.alloc(HeapData::Upvalue(Upvalue::Open(stack_index)));
        let position = self
            .open_upvalues
            .iter()
            .position(|existing| match self.heap.get(*existing) {
                HeapData::Upvalue(Upvalue::Open(index)) => *index > stack_index,
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, id);
        id
    }

    /// Closes every open upvalue at or above `from`: the captured slot's
    /// value moves into the cell.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let mut kept = Vec::with_capacity(self.open_upvalues.len());
        for id in std::mem::take(&mut self.open_upvalues) {
            let index = match self.heap.get(id) {
                HeapData::Upvalue(Upvalue::Open(index)) => *index,
                _ => continue,
            };
            if index >= from {
                let value = self.stack[index];
                *self.heap.get_mut(id) = HeapData::Upvalue(Upvalue::Closed(value));
            } else {
                kept.push(id);
            }
        }
        self.open_upvalues = kept;
    }

    fn upvalue_cell(&self, index: usize) -> HeapId {
        let closure = self.frame().closure;
        match self.heap.get(closure) {
            HeapData::Closure(c) => c.upvalues[index],
            _ => panic!("frame closure is not a closure"),
        }
    }

    // ==================================================================
    // Dispatch
    // ==================================================================

    /// Runs until the frame at index `base` returns or yields.
    pub(crate) fn execute(&mut self, base: usize) -> VmResult<FrameExit> {
        loop {
            match self.step(base) {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(err) => {
                    let exc = self.materialize_exception(err)?;
                    self.unwind_raise(exc, base)?;
                }
            }
        }
    }

    /// Executes one instruction; `Some(exit)` ends the loop for `base`.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, base: usize) -> VmResult<Option<FrameExit>> {
        // Safe point: cancellation and collection.
        if self.signal.swap(false, Ordering::Relaxed) {
            self.flags.insert(VmFlags::SIGNALLED);
        }
        if self.flags.contains(VmFlags::SIGNALLED) {
            self.flags.remove(VmFlags::SIGNALLED);
            return Err(VmErr::Pending(ExcType::KeyboardInterrupt, String::new()));
        }
        if self.heap.gc_pending() {
            self.collect_garbage();
        }
        if self.flags.contains(VmFlags::ENABLE_TRACING) {
            let frame = self.frame();
            let mut line = String::new();
            frame.chunk.disassemble_instruction(&mut line, frame.ip);
            self.out.write_str(&line);
        }

        let opcode = Opcode(self.read_byte());
        match opcode {
            op::POP => {
                self.pop();
            }
            op::POP_MANY => {
                let count = self.read_byte() as usize;
                let len = self.stack.len() - count;
                self.stack.truncate(len);
            }
            op::DUP => {
                let distance = self.read_byte() as usize;
                self.push(self.peek(distance));
            }
            op::SWAP => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            op::REVERSE => {
                let count = self.read_byte() as usize;
                let len = self.stack.len();
                self.stack[len - count..].reverse();
            }
            op::CONSTANT | op::CONSTANT_LONG => {
                let value = self.read_constant(opcode == op::CONSTANT_LONG);
                self.push(value);
            }
            op::NONE => self.push(Value::None),
            op::TRUE => self.push(Value::Bool(true)),
            op::FALSE => self.push(Value::Bool(false)),
            op::NOT_IMPL => self.push(Value::NotImplemented),

            op::GET_LOCAL | op::GET_LOCAL_LONG => {
                let slot = self.read_operand(opcode == op::GET_LOCAL_LONG);
                let value = self.stack[self.frame().stack_base + slot];
                if value.is_undefined() {
                    return Err(VmErr::name_error(
                        "local variable referenced before assignment",
                    ));
                }
                self.push(value);
            }
            op::SET_LOCAL | op::SET_LOCAL_LONG => {
                let slot = self.read_operand(opcode == op::SET_LOCAL_LONG);
                let base_index = self.frame().stack_base + slot;
                self.stack[base_index] = self.peek(0);
            }
            op::DEL_LOCAL | op::DEL_LOCAL_LONG => {
                let slot = self.read_operand(opcode == op::DEL_LOCAL_LONG);
                let base_index = self.frame().stack_base + slot;
                if self.stack[base_index].is_undefined() {
                    return Err(VmErr::name_error("deleting an unbound local variable"));
                }
                self.stack[base_index] = Value::Undefined;
            }

            op::GET_GLOBAL | op::GET_GLOBAL_LONG => {
                let name = self.read_name(opcode == op::GET_GLOBAL_LONG);
                let value = self.lookup_global(name)?;
                self.push(value);
            }
            op::SET_GLOBAL | op::SET_GLOBAL_LONG => {
                let name = self.read_name(opcode == op::SET_GLOBAL_LONG);
                let value = self.peek(0);
                let globals = self.frame().globals;
                match self.heap.get_mut(globals) {
                    HeapData::Module(module) => {
                        module.fields.insert(name, value);
                    }
                    _ => panic!("frame globals is not a module"),
                }
            }
            op::DEL_GLOBAL | op::DEL_GLOBAL_LONG => {
                let name = self.read_name(opcode == op::DEL_GLOBAL_LONG);
                let globals = self.frame().globals;
                let removed = match self.heap.get_mut(globals) {
                    HeapData::Module(module) => module.fields.remove(&name).is_some(),
                    _ => false,
                };
                if !removed {
                    let text = self.name_str(name);
                    return Err(VmErr::name_error(format!("name '{text}' is not defined")));
                }
            }

            op::GET_UPVALUE | op::GET_UPVALUE_LONG => {
                let index = self.read_operand(opcode == op::GET_UPVALUE_LONG);
                let cell = self.upvalue_cell(index);
                let value = match self.heap.get(cell) {
                    HeapData::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
                    HeapData::Upvalue(Upvalue::Closed(value)) => *value,
                    _ => panic!("upvalue cell corrupt"),
                };
                self.push(value);
            }
            op::SET_UPVALUE | op::SET_UPVALUE_LONG => {
                let index = self.read_operand(opcode == op::SET_UPVALUE_LONG);
                let cell = self.upvalue_cell(index);
                let value = self.peek(0);
                match self.heap.get_mut(cell) {
                    HeapData::Upvalue(upvalue) => match upvalue {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(stored) => *stored = value,
                    },
                    _ => panic!("upvalue cell corrupt"),
                }
            }
            op::CLOSE_UPVALUE => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            op::GET_PROPERTY | op::GET_PROPERTY_LONG => {
                let name = self.read_name(opcode == op::GET_PROPERTY_LONG);
                let obj = self.pop();
                let value = self.get_attribute(obj, name)?;
                self.push(value);
            }
            op::SET_PROPERTY | op::SET_PROPERTY_LONG => {
                let name = self.read_name(opcode == op::SET_PROPERTY_LONG);
                let value = self.pop();
                let obj = self.pop();
                self.set_attribute(obj, name, value)?;
                self.push(value);
            }
            op::DEL_PROPERTY | op::DEL_PROPERTY_LONG => {
                let name = self.read_name(opcode == op::DEL_PROPERTY_LONG);
                let obj = self.pop();
                self.del_attribute(obj, name)?;
            }
            op::GET_SUPER | op::GET_SUPER_LONG => {
                let name = self.read_name(opcode == op::GET_SUPER_LONG);
                let class = self.pop();
                let receiver = self.pop();
                let value = self.get_super(receiver, class, name)?;
                self.push(value);
            }

            op::INVOKE_GETTER => {
                let index = self.pop();
                let obj = self.pop();
                let value = self.subscript_get(obj, index)?;
                self.push(value);
            }
            op::INVOKE_SETTER => {
                let index = self.pop();
                let obj = self.pop();
                let value = self.pop();
                self.subscript_set(obj, index, value)?;
            }
            op::INVOKE_DELETE => {
                let index = self.pop();
                let obj = self.pop();
                self.subscript_del(obj, index)?;
            }
            op::INVOKE_GETSLICE => {
                let step = self.pop();
                let stop = self.pop();
                let start = self.pop();
                let obj = self.pop();
                let value = self.slice_get(obj, start, stop, step)?;
                self.push(value);
            }
            op::INVOKE_SETSLICE => {
                let step = self.pop();
                let stop = self.pop();
                let start = self.pop();
                let obj = self.pop();
                let value = self.pop();
                self.slice_set(obj, start, stop, step, value)?;
            }
            op::INVOKE_DELSLICE => {
                let step = self.pop();
                let stop = self.pop();
                let start = self.pop();
                let obj = self.pop();
                self.slice_del(obj, start, stop, step)?;
            }

            op::ADD | op::SUB | op::MUL | op::DIV | op::FLOORDIV | op::MOD | op::POW | op::SHIFTLEFT
            | op::SHIFTRIGHT | op::BITOR | op::BITXOR | op::BITAND => {
                let rhs = self.pop();
                let lhs = self.pop();
                let result = self.binary_op(opcode, lhs, rhs)?;
                self.push(result);
            }
            op::NEGATE => {
                let value = self.pop();
                let result = self.negate(value)?;
                self.push(result);
            }
            op::NOT => {
                let value = self.pop();
                let truthy = object::py_truthy(&self.heap, value);
                self.push(Value::Bool(!truthy));
            }
            op::BITNEGATE => {
                let value = self.pop();
                let result = self.bit_negate(value)?;
                self.push(result);
            }

            op::EQUAL => {
                let rhs = self.pop();
                let lhs = self.pop();
                let result = self.values_equal(lhs, rhs)?;
                self.push(Value::Bool(result));
            }
            op::LESS | op::GREATER | op::LESS_EQUAL | op::GREATER_EQUAL => {
                let rhs = self.pop();
                let lhs = self.pop();
                let result = self.compare_op(opcode, lhs, rhs)?;
                self.push(Value::Bool(result));
            }
            op::IS => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.push(Value::Bool(value_is(lhs, rhs)));
            }
            op::INVOKE_CONTAINS => {
                let container = self.pop();
                let needle = self.pop();
                let result = self.contains(container, needle)?;
                self.push(Value::Bool(result));
            }

            op::JUMP => {
                let distance = self.read_u16() as usize;
                self.frame_mut().ip += distance;
            }
            op::LOOP => {
                let distance = self.read_u16() as usize;
                self.frame_mut().ip -= distance;
            }
            op::POP_JUMP_IF_FALSE => {
                let distance = self.read_u16() as usize;
                let value = self.pop();
                if !object::py_truthy(&self.heap, value) {
                    self.frame_mut().ip += distance;
                }
            }
            op::POP_JUMP_IF_TRUE => {
                let distance = self.read_u16() as usize;
                let value = self.pop();
                if object::py_truthy(&self.heap, value) {
                    self.frame_mut().ip += distance;
                }
            }
            op::JUMP_IF_FALSE_OR_POP => {
                let distance = self.read_u16() as usize;
                if object::py_truthy(&self.heap, self.peek(0)) {
                    self.pop();
                } else {
                    self.frame_mut().ip += distance;
                }
            }
            op::JUMP_IF_TRUE_OR_POP => {
                let distance = self.read_u16() as usize;
                if object::py_truthy(&self.heap, self.peek(0)) {
                    self.frame_mut().ip += distance;
                } else {
                    self.pop();
                }
            }
            op::EXIT_LOOP | op::EXIT_LOOP_BACK => {
                let regions = self.read_byte();
                let pops = self.read_byte();
                let distance = self.read_u16() as usize;
                let ip = self.frame().ip;
                let target = if opcode == op::EXIT_LOOP {
                    (ip + distance) as u32
                } else {
                    (ip - distance) as u32
                };
                self.begin_pending_jump(regions, pops, target)?;
            }

            op::CALL => {
                let argc = self.read_byte() as usize;
                if matches!(self.peek(0), Value::Kwargs(_)) {
                    self.call_with_kwargs()?;
                } else {
                    self.op_call(argc, Vec::new())?;
                }
            }
            op::KWARGS => {
                let units = self.read_byte();
                self.push(Value::Kwargs(u32::from(units)));
            }
            op::EXPAND_ARGS => {
                let mode = self.read_byte();
                self.push(Value::Kwargs(UNIT_MARKER | u32::from(mode)));
            }
            op::CLOSURE | op::CLOSURE_LONG => {
                let code_value = self.read_constant(opcode == op::CLOSURE_LONG);
                let Some(code_id) = code_value.as_ref_id() else {
                    panic!("closure constant is not a code object");
                };
                let count = self.read_byte() as usize;
                let mut upvalues = Vec::with_capacity(count);
                for _ in 0..count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_u16() as usize;
                    if is_local {
                        let slot = self.frame().stack_base + index;
                        upvalues.push(self.capture_upvalue(slot));
                    } else {
                        let closure = self.frame().closure;
                        let cell = match self.heap.get(closure) {
                            HeapData::Closure(c) => c.upvalues[index],
                            _ => panic!("enclosing frame is not a closure"),
                        };
                        upvalues.push(cell);
                    }
                }
                // Stamp the owning module onto the code object.
                let globals = self.frame().globals;
                if let HeapData::Code(code) = self.heap.get_mut(code_id) {
                    code.module = Some(globals);
                }
                let closure = self.heap.alloc(HeapData::Closure(object::Closure {
                    code: code_id,
                    upvalues,
                }));
                if self.flags.contains(VmFlags::ENABLE_DISASSEMBLY) {
                    let (chunk, name) = match self.heap.get(code_id) {
                        HeapData::Code(code) => (Rc::clone(&code.chunk), self.name_str(code.name)),
                        _ => unreachable!(),
                    };
                    let text = chunk.disassemble(&name);
                    self.out.write_str(&text);
                }
                self.push(Value::Ref(closure));
            }
            op::RETURN => {
                let value = self.pop();
                if let Some(exit) = self.do_return(value, base)? {
                    return Ok(Some(exit));
                }
            }
            op::TEST_UNSET | op::TEST_UNSET_LONG => {
                let slot = self.read_operand(opcode == op::TEST_UNSET_LONG);
                let value = self.stack[self.frame().stack_base + slot];
                self.push(Value::Bool(value.is_undefined()));
            }

            op::PUSH_TRY => {
                let distance = self.read_u16() as usize;
                let target = (self.frame().ip + distance) as u32;
                self.push(Value::Handler(Handler {
                    kind: HandlerKind::Try,
                    target,
                }));
            }
            op::PUSH_FINALLY => {
                let distance = self.read_u16() as usize;
                let target = (self.frame().ip + distance) as u32;
                self.push(Value::Handler(Handler {
                    kind: HandlerKind::Finally,
                    target,
                }));
            }
            op::RAISE => {
                let value = self.pop();
                let exc = self.instantiate_exception(value)?;
                self.chain_context(exc);
                return Err(VmErr::Raised(exc));
            }
            op::RAISE_FROM => {
                let cause = self.pop();
                let value = self.pop();
                let exc = self.instantiate_exception(value)?;
                let cause_exc = self.instantiate_exception(cause)?;
                self.set_exception_field(exc, self.names.cause, cause_exc);
                self.chain_context(exc);
                return Err(VmErr::Raised(exc));
            }
            op::RERAISE => {
                let Some(exc) = self.exception else {
                    return Err(VmErr::runtime_error("no active exception to re-raise"));
                };
                return Err(VmErr::Raised(exc));
            }
            op::FILTER_EXCEPT => {
                let distance = self.read_u16() as usize;
                let filter = self.pop();
                let Some(exc) = self.exception else {
                    return Err(VmErr::runtime_error("except filter with no active exception"));
                };
                if self.exception_matches(exc, filter)? {
                    self.push(exc);
                } else {
                    self.frame_mut().ip += distance;
                }
            }
            op::POP_EXCEPT => {
                let handler = self.pop();
                debug_assert!(handler.is_handler());
                self.exception = None;
                self.flags.remove(VmFlags::HAS_EXCEPTION);
            }
            op::BEGIN_FINALLY => {
                let handler = self.pop();
                debug_assert!(handler.is_handler());
                self.push(Value::Handler(Handler {
                    kind: HandlerKind::Normal,
                    target: 0,
                }));
            }
            op::END_FINALLY => {
                if let Some(exit) = self.finish_cleanup(base, false)? {
                    return Ok(Some(exit));
                }
            }
            op::PUSH_WITH => {
                let distance = self.read_u16() as usize;
                let target = (self.frame().ip + distance) as u32;
                self.enter_with(target)?;
            }
            op::CLEANUP_WITH => {
                if let Some(exit) = self.finish_cleanup(base, true)? {
                    return Ok(Some(exit));
                }
            }

            op::INVOKE_ITER => {
                let value = self.pop();
                let iter = self.make_iterator(value)?;
                self.push(iter);
            }
            op::INVOKE_AWAIT => {
                let value = self.pop();
                let iter = self.make_awaitable(value)?;
                self.push(iter);
            }
            op::YIELD => {
                let value = self.pop();
                return Ok(Some(self.suspend_generator(value)));
            }
            op::YIELD_FROM => {
                let sent = self.pop();
                let inner = self.peek(0);
                let result = self.iterator_next(inner, sent)?;
                if value_is(result, inner) {
                    // Inner iterator exhausted; the delegation yields None
                    // as its own value.
                    self.pop();
                    self.push(Value::None);
                } else {
                    // Re-execute this opcode on resume.
                    self.frame_mut().ip -= 1;
                    return Ok(Some(self.suspend_generator(result)));
                }
            }

            op::CLASS | op::CLASS_LONG => {
                let name = self.read_name(opcode == op::CLASS_LONG);
                let mut class = Class::new(name, None);
                let filename = match self.heap.get(self.frame_code()) {
                    HeapData::Code(code) => Some(code.filename),
                    _ => None,
                };
                class.filename = filename;
                let id = self.heap.alloc(HeapData::Class(class));
                self.push(Value::Ref(id));
            }
            op::INHERIT => {
                let base = self.pop();
                let class_id = self
                    .peek(0)
                    .as_ref_id()
                    .expect("INHERIT without class on stack");
                let base_id = match base {
                    Value::None => self.core.object,
                    Value::Ref(id) if matches!(self.heap.get(id), HeapData::Class(_)) => Some(id),
                    other => {
                        let type_name = self.type_name_of(other);
                        return Err(VmErr::type_error(format!(
                            "class must inherit from a class, not '{type_name}'"
                        )));
                    }
                };
                if let HeapData::Class(class) = self.heap.get_mut(class_id) {
                    class.base = base_id;
                }
            }
            op::CLASS_PROPERTY | op::CLASS_PROPERTY_LONG => {
                let name = self.read_name(opcode == op::CLASS_PROPERTY_LONG);
                let value = self.pop();
                let class_id = self.class_body_class();
                if let HeapData::Class(class) = self.heap.get_mut(class_id) {
                    class.methods.insert(name, value);
                }
            }
            op::FINALIZE => {
                let class_id = self
                    .peek(0)
                    .as_ref_id()
                    .expect("FINALIZE without class on stack");
                self.finalize_class(class_id)?;
            }
            op::ANNOTATE => {
                let name = self.read_name(false);
                let value = self.pop();
                let class_id = self.class_body_class();
                if let HeapData::Class(class) = self.heap.get_mut(class_id) {
                    class.annotations.insert(name, value);
                }
            }
            op::DOCSTRING => {
                let value = self.pop();
                let class_id = self.class_body_class();
                if let HeapData::Class(class) = self.heap.get_mut(class_id) {
                    class.docstring = Some(value);
                }
            }

            op::TUPLE | op::TUPLE_LONG => {
                let count = self.read_operand(opcode == op::TUPLE_LONG);
                let items = self.stack.split_off(self.stack.len() - count);
                let id = self.heap.alloc(HeapData::Tuple(object::Tuple::new(items)));
                self.push(Value::Ref(id));
            }
            op::UNPACK => {
                let count = self.read_byte() as usize;
                let value = self.pop();
                self.unpack_sequence(value, count)?;
            }
            op::MAKE_LIST | op::MAKE_LIST_LONG => {
                let count = self.read_operand(opcode == op::MAKE_LIST_LONG);
                let items = self.stack.split_off(self.stack.len() - count);
                let id = self.heap.alloc(HeapData::List(object::List::new(items)));
                self.push(Value::Ref(id));
            }
            op::MAKE_DICT | op::MAKE_DICT_LONG => {
                let count = self.read_operand(opcode == op::MAKE_DICT_LONG);
                let items = self.stack.split_off(self.stack.len() - count * 2);
                let id = self.heap.alloc(HeapData::Dict(object::Dict::new()));
                for pair in items.chunks(2) {
                    self.dict_insert(id, pair[0], pair[1])?;
                }
                self.push(Value::Ref(id));
            }
            op::MAKE_SET | op::MAKE_SET_LONG => {
                let count = self.read_operand(opcode == op::MAKE_SET_LONG);
                let items = self.stack.split_off(self.stack.len() - count);
                let id = self.heap.alloc(HeapData::Set(object::Set::new()));
                for item in items {
                    self.set_insert(id, item)?;
                }
                self.push(Value::Ref(id));
            }
            op::LIST_APPEND => {
                let slot = self.read_byte() as usize;
                let value = self.pop();
                let list = self.stack[self.frame().stack_base + slot];
                let Some(id) = list.as_ref_id() else {
                    panic!("LIST_APPEND target is not a list");
                };
                if let HeapData::List(list) = self.heap.get_mut(id) {
                    list.items.push(value);
                }
            }
            op::DICT_SET => {
                let slot = self.read_byte() as usize;
                let value = self.pop();
                let key = self.pop();
                let dict = self.stack[self.frame().stack_base + slot];
                let id = dict.as_ref_id().expect("DICT_SET target is not a dict");
                self.dict_insert(id, key, value)?;
            }
            op::SET_ADD => {
                let slot = self.read_byte() as usize;
                let value = self.pop();
                let set = self.stack[self.frame().stack_base + slot];
                let id = set.as_ref_id().expect("SET_ADD target is not a set");
                self.set_insert(id, value)?;
            }

            op::IMPORT | op::IMPORT_LONG => {
                let name = self.read_name(opcode == op::IMPORT_LONG);
                let dotted = self.name_str(name);
                let module = crate::modules::import_module(self, &dotted)?;
                self.push(module);
            }
            op::IMPORT_FROM | op::IMPORT_FROM_LONG => {
                let name = self.read_name(opcode == op::IMPORT_FROM_LONG);
                let module = self.pop();
                let value = self.import_from(module, name)?;
                self.push(value);
            }

            op::INVOKE_STR => {
                let value = self.pop();
                let text = self.value_str(value)?;
                let result = self.intern_value(&text);
                self.push(result);
            }
            op::INVOKE_REPR => {
                let value = self.pop();
                let text = self.value_repr(value)?;
                let result = self.intern_value(&text);
                self.push(result);
            }
            op::NOP => {}
            Opcode(byte) => {
                panic!("unknown opcode {byte} at ip {}", self.frame().ip - 1);
            }
        }
        Ok(None)
    }

    /// The code-object id of the current frame's closure.
    fn frame_code(&self) -> HeapId {
        match self.heap.get(self.frame().closure) {
            HeapData::Closure(c) => c.code,
            _ => panic!("frame closure is not a closure"),
        }
    }

    /// The class under construction in a class-body frame (local slot 0).
    fn class_body_class(&self) -> HeapId {
        self.stack[self.frame().stack_base]
            .as_ref_id()
            .expect("class body without class in slot 0")
    }

    // ==================================================================
    // Globals, attributes
    // ==================================================================

    fn lookup_global(&mut self, name: HeapId) -> VmResult<Value> {
        let globals = self.frame().globals;
        if let HeapData::Module(module) = self.heap.get(globals) {
            if let Some(value) = module.fields.get(&name) {
                return Ok(*value);
            }
        }
        if let Some(value) = self.builtins.get(&name) {
            return Ok(*value);
        }
        let text = self.name_str(name);
        Err(VmErr::name_error(format!("name '{text}' is not defined")))
    }

    /// Looks `name` up along a class's base chain.
    pub(crate) fn lookup_method(&self, class: HeapId, name: HeapId) -> Option<Value> {
        let mut current = Some(class);
        while let Some(id) = current {
            match self.heap.get(id) {
                HeapData::Class(class) => {
                    if let Some(value) = class.methods.get(&name) {
                        return Some(*value);
                    }
                    current = class.base;
                }
                _ => return None,
            }
        }
        None
    }

    /// The class object backing any value.
    pub(crate) fn class_of(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Bool(_) => self.core.bool_,
            Value::Int(_) => self.core.int,
            Value::Float(_) => self.core.float,
            Value::None => self.core.none,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_) => self.core.str_,
                HeapData::Bytes(_) => self.core.bytes,
                HeapData::BigInt(_) => self.core.int,
                HeapData::Tuple(_) => self.core.tuple,
                HeapData::List(_) => self.core.list,
                HeapData::Dict(_) => self.core.dict,
                HeapData::Set(_) => self.core.set,
                HeapData::Closure(_) | HeapData::Native(_) | HeapData::BoundMethod(_) => self.core.function,
                HeapData::Module(_) => self.core.module,
                HeapData::Generator(_) => self.core.generator,
                HeapData::Range(_) | HeapData::RangeIter(_) | HeapData::SeqIter(_) => self.core.range,
                HeapData::Class(_) => self.core.type_,
                HeapData::Instance(instance) => Some(instance.class),
                _ => self.core.object,
            },
            _ => self.core.object,
        }
    }

    /// User-facing type name of a value.
    pub(crate) fn type_name_of(&self, value: Value) -> String {
        match value {
            Value::None => "NoneType".to_owned(),
            Value::NotImplemented => "NotImplementedType".to_owned(),
            Value::Bool(_) => "bool".to_owned(),
            Value::Int(_) => "int".to_owned(),
            Value::Float(_) => "float".to_owned(),
            Value::Undefined | Value::Handler(_) | Value::Kwargs(_) => "<internal>".to_owned(),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    let class = instance.class;
                    match self.heap.get(class) {
                        HeapData::Class(c) => self.name_str(c.name),
                        _ => "object".to_owned(),
                    }
                }
                other => other.type_name().to_owned(),
            },
        }
    }

    pub(crate) fn get_attribute(&mut self, obj: Value, name: HeapId) -> VmResult<Value> {
        if let Value::Ref(id) = obj {
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if let Some(value) = instance.fields.get(&name) {
                        return Ok(*value);
                    }
                    let class = instance.class;
                    if let Some(value) = self.lookup_method(class, name) {
                        return Ok(self.bind_if_method(obj, value));
                    }
                }
                HeapData::Module(module) => {
                    if let Some(value) = module.fields.get(&name) {
                        return Ok(*value);
                    }
                    if name == self.names.name_attr {
                        return Ok(Value::Ref(module.name));
                    }
                }
                HeapData::Class(class) => {
                    if name == self.names.name_attr {
                        return Ok(Value::Ref(class.name));
                    }
                    if name == self.names.doc {
                        return Ok(class.docstring.unwrap_or(Value::None));
                    }
                    if let Some(value) = self.lookup_method(id, name) {
                        return Ok(value);
                    }
                }
                _ => {}
            }
        }
        // Builtin-type method tables.
        if let Some(class) = self.class_of(obj) {
            if let Some(value) = self.lookup_method(class, name) {
                return Ok(self.bind_if_method(obj, value));
            }
        }
        let type_name = self.type_name_of(obj);
        let attr = self.name_str(name);
        Err(VmErr::attribute_error(&type_name, &attr))
    }

    /// Wraps callables fetched through an instance into bound methods.
    pub(crate) fn bind_if_method(&mut self, receiver: Value, value: Value) -> Value {
        let bind = match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(_) => true,
                HeapData::Native(native) => native.kind == object::NativeKind::Method,
                _ => false,
            },
            _ => false,
        };
        if bind {
            let id = self.heap.alloc(HeapData::BoundMethod(object::BoundMethod {
                receiver,
                callable: value,
            }));
            Value::Ref(id)
        } else {
            value
        }
    }

    pub(crate) fn set_attribute(&mut self, obj: Value, name: HeapId, value: Value) -> VmResult<()> {
        let Value::Ref(id) = obj else {
            let type_name = self.type_name_of(obj);
            let attr = self.name_str(name);
            return Err(VmErr::attribute_error(&type_name, &attr));
        };
        match self.heap.get_mut(id) {
            HeapData::Instance(instance) => {
                instance.fields.insert(name, value);
                Ok(())
            }
            HeapData::Module(module) => {
                module.fields.insert(name, value);
                Ok(())
            }
            HeapData::Class(class) => {
                class.methods.insert(name, value);
                let finalized = class.finalized;
                if finalized {
                    self.refresh_cached_slots(id);
                }
                Ok(())
            }
            _ => {
                let type_name = self.type_name_of(obj);
                let attr = self.name_str(name);
                Err(VmErr::attribute_error(&type_name, &attr))
            }
        }
    }

    fn del_attribute(&mut self, obj: Value, name: HeapId) -> VmResult<()> {
        let Value::Ref(id) = obj else {
            let type_name = self.type_name_of(obj);
            let attr = self.name_str(name);
            return Err(VmErr::attribute_error(&type_name, &attr));
        };
        let removed = match self.heap.get_mut(id) {
            HeapData::Instance(instance) => instance.fields.remove(&name).is_some(),
            HeapData::Module(module) => module.fields.remove(&name).is_some(),
            HeapData::Class(class) => class.methods.remove(&name).is_some(),
            _ => false,
        };
        if removed {
            Ok(())
        } else {
            let type_name = self.type_name_of(obj);
            let attr = self.name_str(name);
            Err(VmErr::attribute_error(&type_name, &attr))
        }
    }

    fn get_super(&mut self, receiver: Value, class: Value, name: HeapId) -> VmResult<Value> {
        let Some(class_id) = class.as_ref_id() else {
            return Err(VmErr::type_error("super() outside of a class method"));
        };
        let base = match self.heap.get(class_id) {
            HeapData::Class(c) => c.base,
            _ => return Err(VmErr::type_error("super() outside of a class method")),
        };
        let Some(base) = base else {
            return Err(VmErr::type_error("class has no base class"));
        };
        let Some(method) = self.lookup_method(base, name) else {
            let attr = self.name_str(name);
            let base_name = match self.heap.get(base) {
                HeapData::Class(c) => self.name_str(c.name),
                _ => String::new(),
            };
            return Err(VmErr::attribute_error(&base_name, &attr));
        };
        Ok(self.bind_if_method(receiver, method))
    }

    fn import_from(&mut self, module: Value, name: HeapId) -> VmResult<Value> {
        if let Some(id) = module.as_ref_id() {
            if let HeapData::Module(m) = self.heap.get(id) {
                if let Some(value) = m.fields.get(&name) {
                    return Ok(*value);
                }
                let module_name = self.name_str(m.name);
                let attr = self.name_str(name);
                return Err(VmErr::import_error(format!(
                    "cannot import name '{attr}' from '{module_name}'"
                )));
            }
        }
        Err(VmErr::import_error("import target is not a module"))
    }

    // ==================================================================
    // Class machinery
    // ==================================================================

    /// Finalizes a class: snapshot cached special-method slots, register as
    /// a weak subclass of the base, run `__init_subclass__` and
    /// `__set_name__` hooks.
    pub(crate) fn finalize_class(&mut self, class_id: HeapId) -> VmResult<()> {
        self.compute_cached_slots(class_id);
        let base = match self.heap.get_mut(class_id) {
            HeapData::Class(class) => {
                class.finalized = true;
                class.base
            }
            _ => return Err(VmErr::type_error("FINALIZE on a non-class")),
        };
        if let Some(base_id) = base {
            if let HeapData::Class(base_class) = self.heap.get_mut(base_id) {
                if !base_class.subclasses.contains(&class_id) {
                    base_class.subclasses.push(class_id);
                }
            }
            // __init_subclass__ runs on the base with the new class.
            if let Some(hook) = self.lookup_method(base_id, self.names.init_subclass) {
                self.call_function(hook, vec![Value::Ref(class_id)], Vec::new())?;
            }
        }
        // __set_name__ on attribute values whose class defines it.
        let entries: Vec<(HeapId, Value)> = match self.heap.get(class_id) {
            HeapData::Class(class) => class.methods.iter().map(|(k, v)| (*k, *v)).collect(),
            _ => Vec::new(),
        };
        for (attr_name, value) in entries {
            if let Value::Ref(value_id) = value {
                if let HeapData::Instance(instance) = self.heap.get(value_id) {
                    let value_class = instance.class;
                    if let Some(hook) = self.lookup_method(value_class, self.names.set_name) {
                        let bound = self.bind_if_method(value, hook);
                        self.call_function(bound, vec![Value::Ref(class_id), Value::Ref(attr_name)], Vec::new())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Recomputes cached slots for a class and every finalized subclass.
    pub(crate) fn refresh_cached_slots(&mut self, class_id: HeapId) {
        self.compute_cached_slots(class_id);
        let subclasses: Vec<HeapId> = match self.heap.get(class_id) {
            HeapData::Class(class) => class.subclasses.clone(),
            _ => Vec::new(),
        };
        for sub in subclasses {
            let finalized = matches!(self.heap.get(sub), HeapData::Class(c) if c.finalized);
            if finalized {
                self.refresh_cached_slots(sub);
            }
        }
    }

    fn compute_cached_slots(&mut self, class_id: HeapId) {
        let pairs = [
            (Slot::Init, self.names.init),
            (Slot::Str, self.names.str_),
            (Slot::Repr, self.names.repr),
            (Slot::Eq, self.names.eq),
            (Slot::Hash, self.names.hash),
            (Slot::GetItem, self.names.getitem),
            (Slot::SetItem, self.names.setitem),
            (Slot::Iter, self.names.iter),
            (Slot::Call, self.names.call),
            (Slot::Enter, self.names.enter),
            (Slot::Exit, self.names.exit),
        ];
        for (slot, name) in pairs {
            let found = self.lookup_method(class_id, name);
            if let HeapData::Class(class) = self.heap.get_mut(class_id) {
                class.cached.set(slot, found);
            }
        }
    }

    /// Fetches a cached special-method slot for a value's class.
    pub(crate) fn cached_slot(&self, value: Value, slot: Slot) -> Option<Value> {
        let class = self.class_of(value)?;
        match self.heap.get(class) {
            HeapData::Class(c) => {
                if c.finalized {
                    c.cached.get(slot)
                } else {
                    // Unfinalized classes fall back to a chain walk.
                    let name = self.slot_name(slot);
                    self.lookup_method(class, name)
                }
            }
            _ => None,
        }
    }

    fn slot_name(&self, slot: Slot) -> HeapId {
        match slot {
            Slot::Init => self.names.init,
            Slot::Str => self.names.str_,
            Slot::Repr => self.names.repr,
            Slot::Eq => self.names.eq,
            Slot::Hash => self.names.hash,
            Slot::GetItem => self.names.getitem,
            Slot::SetItem => self.names.setitem,
            Slot::Iter => self.names.iter,
            Slot::Call => self.names.call,
            Slot::Enter => self.names.enter,
            Slot::Exit => self.names.exit,
        }
    }

    // ==================================================================
    // Iterators & generators
    // ==================================================================

    pub(crate) fn make_iterator(&mut self, value: Value) -> VmResult<Value> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Generator(_) | HeapData::RangeIter(_) | HeapData::SeqIter(_) => return Ok(value),
                HeapData::Range(range) => {
                    let iter = RangeIter {
                        current: range.start,
                        stop: range.stop,
                        step: range.step,
                    };
                    let iter_id = self.heap.alloc(HeapData::RangeIter(iter));
                    return Ok(Value::Ref(iter_id));
                }
                HeapData::List(_) | HeapData::Tuple(_) | HeapData::Str(_) | HeapData::Bytes(_) => {
                    let iter_id = self.heap.alloc(HeapData::SeqIter(SeqIter {
                        seq: value,
                        index: 0,
                        snapshot: None,
                    }));
                    return Ok(Value::Ref(iter_id));
                }
                HeapData::Dict(dict) => {
                    let keys: Vec<Value> = dict.entries().into_iter().map(|(k, _)| k).collect();
                    let iter_id = self.heap.alloc(HeapData::SeqIter(SeqIter {
                        seq: value,
                        index: 0,
                        snapshot: Some(keys),
                    }));
                    return Ok(Value::Ref(iter_id));
                }
                HeapData::Set(set) => {
                    let members = set.entries();
                    let iter_id = self.heap.alloc(HeapData::SeqIter(SeqIter {
                        seq: value,
                        index: 0,
                        snapshot: Some(members),
                    }));
                    return Ok(Value::Ref(iter_id));
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.cached_slot(value, Slot::Iter) {
                        let bound = self.bind_if_method(value, method);
                        return self.call_function(bound, Vec::new(), Vec::new());
                    }
                }
                _ => {}
            }
        }
        let type_name = self.type_name_of(value);
        Err(VmErr::type_error(format!("'{type_name}' object is not iterable")))
    }

    fn make_awaitable(&mut self, value: Value) -> VmResult<Value> {
        if let Value::Ref(id) = value {
            if let HeapData::Generator(generator) = self.heap.get(id) {
                let coroutine = {
                    let closure = generator.closure;
                    match self.heap.get(closure) {
                        HeapData::Closure(c) => match self.heap.get(c.code) {
                            HeapData::Code(code) => code.flags.contains(CodeFlags::COROUTINE),
                            _ => false,
                        },
                        _ => false,
                    }
                };
                if coroutine {
                    return Ok(value);
                }
            }
        }
        let type_name = self.type_name_of(value);
        Err(VmErr::type_error(format!("'{type_name}' object is not awaitable")))
    }

    /// Advances an iterator by calling it with an optional sent value.
    /// Returns the iterator itself when it is exhausted.
    pub(crate) fn iterator_next(&mut self, iterator: Value, sent: Value) -> VmResult<Value> {
        if let Value::Ref(id) = iterator {
            match self.heap.get(id) {
                HeapData::Generator(_) => {
                    return match self.resume_generator(id, sent)? {
                        Some(value) => Ok(value),
                        None => Ok(iterator),
                    };
                }
                HeapData::RangeIter(_) | HeapData::SeqIter(_) => {
                    return self.builtin_iterator_next(id);
                }
                _ => {}
            }
        }
        // Fall back to the call protocol.
        self.call_function(iterator, Vec::new(), Vec::new())
    }

    /// Steps a range or sequence iterator; the iterator itself marks
    /// exhaustion.
    pub(crate) fn builtin_iterator_next(&mut self, id: HeapId) -> VmResult<Value> {
        enum Step {
            Value(Value),
            Exhausted,
            Seq(Value, usize),
        }
        // First borrow: advance the iterator state.
        let step = match self.heap.get_mut(id) {
            HeapData::RangeIter(iter) => {
                let more = if iter.step > 0 {
                    iter.current < iter.stop
                } else {
                    iter.current > iter.stop
                };
                if more {
                    let value = iter.current;
                    iter.current += iter.step;
                    Step::Value(Value::Int(value))
                } else {
                    Step::Exhausted
                }
            }
            HeapData::SeqIter(iter) => {
                let index = iter.index;
                iter.index += 1;
                match &iter.snapshot {
                    Some(snapshot) => match snapshot.get(index) {
                        Some(value) => Step::Value(*value),
                        None => Step::Exhausted,
                    },
                    None => Step::Seq(iter.seq, index),
                }
            }
            _ => return Err(VmErr::type_error("object is not an iterator")),
        };
        // Second borrow: resolve sequence elements.
        match step {
            Step::Value(value) => Ok(value),
            Step::Exhausted => Ok(Value::Ref(id)),
            Step::Seq(seq, index) => {
                enum Item {
                    Value(Value),
                    Char(char),
                    Exhausted,
                }
                let item = match seq.as_ref_id().map(|sid| self.heap.get(sid)) {
                    Some(HeapData::List(list)) => list.items.get(index).map_or(Item::Exhausted, |v| Item::Value(*v)),
                    Some(HeapData::Tuple(tuple)) => {
                        tuple.items.get(index).map_or(Item::Exhausted, |v| Item::Value(*v))
                    }
                    Some(HeapData::Str(s)) => s.nth_char(index).map_or(Item::Exhausted, Item::Char),
                    Some(HeapData::Bytes(bytes)) => bytes
                        .as_slice()
                        .get(index)
                        .map_or(Item::Exhausted, |b| Item::Value(Value::Int(i64::from(*b)))),
                    _ => Item::Exhausted,
                };
                match item {
                    Item::Value(value) => Ok(value),
                    Item::Exhausted => Ok(Value::Ref(id)),
                    Item::Char(ch) => {
                        let mut buffer = [0u8; 4];
                        let text = ch.encode_utf8(&mut buffer).to_owned();
                        Ok(self.intern_value(&text))
                    }
                }
            }
        }
    }

    /// Resumes a generator; `None` means it is exhausted.
    pub(crate) fn resume_generator(&mut self, gen_id: HeapId, sent: Value) -> VmResult<Option<Value>> {
        let (state, ip, saved_stack, closure, globals) = match self.heap.get_mut(gen_id) {
            HeapData::Generator(generator) => {
                let state = generator.state;
                match state {
                    GenState::Done => return Ok(None),
                    GenState::Running => {
                        return Err(VmErr::value_error("generator already executing"));
                    }
                    _ => {}
                }
                generator.state = GenState::Running;
                (
                    state,
                    generator.ip,
                    std::mem::take(&mut generator.stack),
                    generator.closure,
                    generator.globals,
                )
            }
            _ => return Err(VmErr::type_error("resume target is not a generator")),
        };

        if self.frames.len() >= FRAMES_MAX {
            return Err(VmErr::runtime_error("maximum recursion depth exceeded"));
        }
        let chunk = match self.heap.get(closure) {
            HeapData::Closure(c) => match self.heap.get(c.code) {
                HeapData::Code(code) => Rc::clone(&code.chunk),
                _ => return Err(VmErr::type_error("generator closure is corrupt")),
            },
            _ => return Err(VmErr::type_error("generator closure is corrupt")),
        };
        let stack_base = self.stack.len();
        self.stack.extend(saved_stack);
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip,
            stack_base,
            globals,
            gen: Some(gen_id),
        });
        if state == GenState::Suspended {
            // The sent value becomes the result of the pending YIELD.
            self.push(sent);
        }

        let base = self.frames.len() - 1;
        match self.execute(base) {
            Ok(FrameExit::Yielded(value)) => Ok(Some(value)),
            Ok(FrameExit::Returned(_)) => {
                if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
                    generator.state = GenState::Done;
                }
                Ok(None)
            }
            Err(err) => {
                if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
                    generator.state = GenState::Done;
                }
                Err(err)
            }
        }
    }

    /// Suspends the current (generator) frame at a yield point.
    fn suspend_generator(&mut self, value: Value) -> FrameExit {
        let frame = self.frames.pop().expect("yield without a frame");
        let gen_id = frame.gen.expect("yield outside of a generator frame");
        self.close_upvalues(frame.stack_base);
        let saved = self.stack.split_off(frame.stack_base);
        if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
            generator.stack = saved;
            generator.ip = frame.ip;
            generator.state = GenState::Suspended;
        }
        FrameExit::Yielded(value)
    }

    // ==================================================================
    // Containers
    // ==================================================================

    pub(crate) fn hash_value(&mut self, value: Value) -> VmResult<u64> {
        match object::py_hash(&self.heap, value) {
            Some(hash) => Ok(hash),
            None => {
                let type_name = self.type_name_of(value);
                Err(VmErr::type_error(format!("unhashable type: '{type_name}'")))
            }
        }
    }

    pub(crate) fn dict_insert(&mut self, dict_id: HeapId, key: Value, value: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        Ok(self.heap.with_data(dict_id, |heap, data| match data {
            HeapData::Dict(dict) => dict.insert_hashed(heap, hash, key, value),
            _ => None,
        }))
    }

    pub(crate) fn dict_get(&mut self, dict_id: HeapId, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        Ok(self.heap.with_data(dict_id, |heap, data| match data {
            HeapData::Dict(dict) => dict.get_hashed(heap, hash, key),
            _ => None,
        }))
    }

    pub(crate) fn dict_remove(&mut self, dict_id: HeapId, key: Value) -> VmResult<Option<Value>> {
        let hash = self.hash_value(key)?;
        Ok(self.heap.with_data(dict_id, |heap, data| match data {
            HeapData::Dict(dict) => dict.remove_hashed(heap, hash, key),
            _ => None,
        }))
    }

    pub(crate) fn set_insert(&mut self, set_id: HeapId, value: Value) -> VmResult<bool> {
        let hash = self.hash_value(value)?;
        Ok(self.heap.with_data(set_id, |heap, data| match data {
            HeapData::Set(set) => set.add_hashed(heap, hash, value),
            _ => false,
        }))
    }

    pub(crate) fn set_contains(&mut self, set_id: HeapId, value: Value) -> VmResult<bool> {
        let hash = self.hash_value(value)?;
        Ok(self.heap.with_data(set_id, |heap, data| match data {
            HeapData::Set(set) => set.contains_hashed(heap, hash, value),
            _ => false,
        }))
    }

    fn unpack_sequence(&mut self, value: Value, count: usize) -> VmResult<()> {
        let items: Vec<Value> = match value.as_ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Tuple(tuple)) => tuple.items.clone(),
            Some(HeapData::List(list)) => list.items.clone(),
            _ => {
                // Generic path: drain an iterator.
                let iterator = self.make_iterator(value)?;
                let mut items = Vec::with_capacity(count);
                loop {
                    let next = self.iterator_next(iterator, Value::None)?;
                    if value_is(next, iterator) {
                        break;
                    }
                    items.push(next);
                    if items.len() > count {
                        break;
                    }
                }
                items
            }
        };
        if items.len() != count {
            return Err(VmErr::value_error(format!(
                "expected {count} values to unpack, got {}",
                items.len()
            )));
        }
        for item in items {
            self.push(item);
        }
        Ok(())
    }
}

/// Identity comparison (`is`): reference identity for heap values, variant
/// and payload equality for immediates.
#[must_use]
pub(crate) fn value_is(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Ref(x), Value::Ref(y)) => x == y,
        (Value::None, Value::None) | (Value::NotImplemented, Value::NotImplemented) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        _ => false,
    }
}

/// Marker flag distinguishing `EXPAND_ARGS` unit markers from the `KWARGS`
/// unit-count marker.
pub(crate) const UNIT_MARKER: u32 = 0x8000_0000;
