//! Calling convention: closures, natives, classes, bound methods,
//! iterators, and the keyword-argument unit protocol.

use std::rc::Rc;

use super::{value_is, CallFrame, FrameExit, Vm, FRAMES_MAX, UNIT_MARKER};
use crate::bytecode::op::arg_mode;
use crate::exceptions::{ExcType, VmErr, VmResult};
use crate::heap::HeapId;
use crate::object::{CodeFlags, Generator, HeapData, Instance, NativeArgs, Slot};
use crate::value::Value;

impl Vm {
    /// `CALL argc`: the callee sits below the arguments.
    pub(crate) fn op_call(&mut self, argc: usize, kwargs: Vec<(HeapId, Value)>) -> VmResult<()> {
        let callee_index = self.stack.len() - argc - 1;
        let callee = self.stack[callee_index];
        let Some(id) = callee.as_ref_id() else {
            let type_name = self.type_name_of(callee);
            return Err(VmErr::type_error(format!("'{type_name}' object is not callable")));
        };
        match self.heap.get(id) {
            HeapData::Closure(_) => self.call_closure(id, argc, kwargs),
            HeapData::BoundMethod(method) => {
                let receiver = method.receiver;
                let callable = method.callable;
                self.stack[callee_index] = callable;
                self.stack.insert(callee_index + 1, receiver);
                self.op_call(argc + 1, kwargs)
            }
            HeapData::Native(native) => {
                let func = native.func;
                let args = self.stack.split_off(callee_index + 1);
                self.pop(); // callee
                let result = func(self, NativeArgs { args, kwargs })?;
                self.push(result);
                Ok(())
            }
            HeapData::Class(_) => self.instantiate_class(id, argc, kwargs),
            HeapData::Generator(_) => {
                if argc > 1 {
                    return Err(VmErr::type_error("generator takes at most one argument"));
                }
                let sent = if argc == 1 { self.pop() } else { Value::None };
                self.pop(); // generator
                let result = match self.resume_generator(id, sent)? {
                    Some(value) => value,
                    None => Value::Ref(id),
                };
                self.push(result);
                Ok(())
            }
            HeapData::RangeIter(_) | HeapData::SeqIter(_) => {
                let len = self.stack.len() - argc;
                self.stack.truncate(len);
                self.pop(); // iterator
                let result = self.builtin_iterator_next(id)?;
                self.push(result);
                Ok(())
            }
            HeapData::Instance(_) => {
                if let Some(call) = self.cached_slot(callee, Slot::Call) {
                    let bound = self.bind_if_method(callee, call);
                    self.stack[callee_index] = bound;
                    self.op_call(argc, kwargs)
                } else {
                    let type_name = self.type_name_of(callee);
                    Err(VmErr::type_error(format!("'{type_name}' object is not callable")))
                }
            }
            _ => {
                let type_name = self.type_name_of(callee);
                Err(VmErr::type_error(format!("'{type_name}' object is not callable")))
            }
        }
    }

    /// A `CALL` whose stack top is a `KWARGS` marker: decode the argument
    /// units, then re-enter the regular call path.
    pub(crate) fn call_with_kwargs(&mut self) -> VmResult<()> {
        let Value::Kwargs(units) = self.pop() else {
            panic!("kwargs call without unit-count marker");
        };
        debug_assert!(units & UNIT_MARKER == 0);

        // Units are popped top-down, which reverses source order.
        enum Unit {
            Positional(Value),
            IterableSpread(Value),
            MappingSpread(Value),
            Keyword(Value, Value),
        }
        let mut reversed: Vec<Unit> = Vec::with_capacity(units as usize);
        for _ in 0..units {
            let Value::Kwargs(marker) = self.pop() else {
                panic!("malformed argument unit");
            };
            let mode = (marker & !UNIT_MARKER) as u8;
            match mode {
                arg_mode::POSITIONAL => {
                    let value = self.pop();
                    reversed.push(Unit::Positional(value));
                }
                arg_mode::ITERABLE_SPREAD => {
                    let value = self.pop();
                    reversed.push(Unit::IterableSpread(value));
                }
                arg_mode::MAPPING_SPREAD => {
                    let value = self.pop();
                    reversed.push(Unit::MappingSpread(value));
                }
                arg_mode::KEYWORD => {
                    let value = self.pop();
                    let name = self.pop();
                    reversed.push(Unit::Keyword(name, value));
                }
                _ => panic!("unknown argument unit mode {mode}"),
            }
        }

        let mut positional: Vec<Value> = Vec::new();
        let mut kwargs: Vec<(HeapId, Value)> = Vec::new();
        for unit in reversed.into_iter().rev() {
            match unit {
                Unit::Positional(value) => positional.push(value),
                Unit::IterableSpread(value) => {
                    let items = self.iterable_to_vec(value)?;
                    positional.extend(items);
                }
                Unit::MappingSpread(value) => {
                    let Some(dict_id) = value.as_ref_id() else {
                        return Err(VmErr::type_error("** argument must be a mapping"));
                    };
                    let entries = match self.heap.get(dict_id) {
                        HeapData::Dict(dict) => dict.entries(),
                        _ => return Err(VmErr::type_error("** argument must be a mapping")),
                    };
                    for (key, value) in entries {
                        let name = self.keyword_name(key)?;
                        kwargs.push((name, value));
                    }
                }
                Unit::Keyword(name, value) => {
                    let name = self.keyword_name(name)?;
                    kwargs.push((name, value));
                }
            }
        }

        // The callee is now on top; rebuild the positional layout.
        let argc = positional.len();
        for value in positional {
            self.push(value);
        }
        self.op_call(argc, kwargs)
    }

    fn keyword_name(&mut self, value: Value) -> VmResult<HeapId> {
        match value.as_ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Str(s)) => {
                let text = s.as_str().to_owned();
                Ok(self.intern(&text))
            }
            _ => Err(VmErr::type_error("keywords must be strings")),
        }
    }

    /// Materializes any iterable into a vector (spread arguments, unpacking).
    pub(crate) fn iterable_to_vec(&mut self, value: Value) -> VmResult<Vec<Value>> {
        if let Some(id) = value.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => return Ok(list.items.clone()),
                HeapData::Tuple(tuple) => return Ok(tuple.items.clone()),
                _ => {}
            }
        }
        let iterator = self.make_iterator(value)?;
        let mut items = Vec::new();
        loop {
            let next = self.iterator_next(iterator, Value::None)?;
            if value_is(next, iterator) {
                return Ok(items);
            }
            items.push(next);
        }
    }

    /// Calls a bytecode closure: bind arguments into the parameter layout,
    /// then either push a frame or build a generator.
    fn call_closure(&mut self, closure_id: HeapId, argc: usize, kwargs: Vec<(HeapId, Value)>) -> VmResult<()> {
        let (code_id, chunk, flags, required, optional, keyword_only) = {
            let closure = match self.heap.get(closure_id) {
                HeapData::Closure(c) => c,
                _ => unreachable!(),
            };
            match self.heap.get(closure.code) {
                HeapData::Code(code) => (
                    closure.code,
                    Rc::clone(&code.chunk),
                    code.flags,
                    code.required_args.clone(),
                    code.optional_args.clone(),
                    code.keyword_only_args.clone(),
                ),
                _ => return Err(VmErr::type_error("closure without a code object")),
            }
        };
        let _ = code_id;

        let callee_index = self.stack.len() - argc - 1;
        let args = self.stack.split_off(callee_index + 1);
        self.pop(); // callee

        let locals = self.bind_arguments(&required, &optional, &keyword_only, flags, args, kwargs)?;

        let globals = self.current_globals(closure_id);

        if flags.contains(CodeFlags::GENERATOR) {
            // Calling a generator function builds a suspended frame.
            let generator = Generator::new(closure_id, globals, locals);
            let id = self.heap.alloc(HeapData::Generator(generator));
            self.push(Value::Ref(id));
            return Ok(());
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(VmErr::runtime_error("maximum recursion depth exceeded"));
        }
        let stack_base = self.stack.len();
        self.stack.extend(locals);
        self.frames.push(CallFrame {
            closure: closure_id,
            chunk,
            ip: 0,
            stack_base,
            globals,
            gen: None,
        });
        Ok(())
    }

    /// The module whose fields serve as globals for a closure: its code
    /// object's owning module, falling back to the caller's.
    fn current_globals(&self, closure_id: HeapId) -> HeapId {
        let module = match self.heap.get(closure_id) {
            HeapData::Closure(c) => match self.heap.get(c.code) {
                HeapData::Code(code) => code.module,
                _ => None,
            },
            _ => None,
        };
        module.unwrap_or_else(|| self.frames.last().expect("call without a frame").globals)
    }

    /// Binds positional and keyword arguments into the canonical local
    /// layout: `[required][optional][*args][keyword-only][**kwargs]`.
    fn bind_arguments(
        &mut self,
        required: &[HeapId],
        optional: &[HeapId],
        keyword_only: &[HeapId],
        flags: CodeFlags,
        args: Vec<Value>,
        kwargs: Vec<(HeapId, Value)>,
    ) -> VmResult<Vec<Value>> {
        let collects_args = flags.contains(CodeFlags::COLLECTS_ARGS);
        let collects_kws = flags.contains(CodeFlags::COLLECTS_KWS);
        let positional_slots = required.len() + optional.len();
        let star_slot = positional_slots;
        let kwonly_base = positional_slots + usize::from(collects_args);
        let kw_slot = kwonly_base + keyword_only.len();
        let total = kw_slot + usize::from(collects_kws);

        let mut locals = vec![Value::Undefined; total];

        let mut extras: Vec<Value> = Vec::new();
        for (index, value) in args.into_iter().enumerate() {
            if index < positional_slots {
                locals[index] = value;
            } else if collects_args {
                extras.push(value);
            } else {
                return Err(VmErr::Pending(
                    ExcType::ArgumentError,
                    format!(
                        "function takes at most {positional_slots} positional arguments ({} given)",
                        index + 1
                    ),
                ));
            }
        }
        if collects_args {
            let tuple = self.heap.alloc(HeapData::Tuple(crate::object::Tuple::new(extras)));
            locals[star_slot] = Value::Ref(tuple);
        }

        let mut extra_kwargs: Vec<(Value, Value)> = Vec::new();
        for (name, value) in kwargs {
            let slot = required
                .iter()
                .chain(optional)
                .position(|param| *param == name)
                .or_else(|| {
                    keyword_only
                        .iter()
                        .position(|param| *param == name)
                        .map(|index| kwonly_base + index)
                });
            match slot {
                Some(slot) => {
                    if !locals[slot].is_undefined() {
                        let text = self.name_str(name);
                        return Err(VmErr::Pending(
                            ExcType::ArgumentError,
                            format!("got multiple values for argument '{text}'"),
                        ));
                    }
                    locals[slot] = value;
                }
                None if collects_kws => extra_kwargs.push((Value::Ref(name), value)),
                None => {
                    let text = self.name_str(name);
                    return Err(VmErr::Pending(
                        ExcType::ArgumentError,
                        format!("got an unexpected keyword argument '{text}'"),
                    ));
                }
            }
        }
        if collects_kws {
            let dict_id = self.heap.alloc(HeapData::Dict(crate::object::Dict::new()));
            for (key, value) in extra_kwargs {
                self.dict_insert(dict_id, key, value)?;
            }
            locals[kw_slot] = Value::Ref(dict_id);
        }

        // Required parameters must all be bound; optionals get their
        // defaults from the prologue.
        for (index, name) in required.iter().enumerate() {
            if locals[index].is_undefined() {
                let text = self.name_str(*name);
                return Err(VmErr::Pending(
                    ExcType::ArgumentError,
                    format!("missing required argument '{text}'"),
                ));
            }
        }
        Ok(locals)
    }

    /// `Class(...)`: allocate an instance and run `__init__` when present.
    /// The builtin value classes construct values instead.
    fn instantiate_class(&mut self, class_id: HeapId, argc: usize, kwargs: Vec<(HeapId, Value)>) -> VmResult<()> {
        let callee_index = self.stack.len() - argc - 1;

        if crate::builtins::is_constructor_class(self, class_id) {
            let args = self.stack.split_off(callee_index + 1);
            self.pop(); // callee
            let result = crate::builtins::construct_core(self, class_id, &NativeArgs { args, kwargs })
                .expect("constructor class changed identity")?;
            self.push(result);
            return Ok(());
        }

        let instance_id = self.heap.alloc(HeapData::Instance(Instance::new(class_id)));
        let instance = Value::Ref(instance_id);

        let init = match self.heap.get(class_id) {
            HeapData::Class(class) => {
                if class.finalized {
                    class.cached.get(Slot::Init)
                } else {
                    self.lookup_method(class_id, self.names.init)
                }
            }
            _ => None,
        };
        match init {
            Some(init) => {
                // Rewrite the callee slot to the bound __init__ and call it;
                // the result is discarded in favor of the instance.
                let bound = self.bind_if_method(instance, init);
                self.stack[callee_index] = bound;
                let before = self.frames.len();
                self.op_call(argc, kwargs)?;
                if self.frames.len() > before {
                    let exit = self.execute(before)?;
                    match exit {
                        FrameExit::Returned(_) => {}
                        FrameExit::Yielded(_) => {
                            return Err(VmErr::type_error("__init__ cannot be a generator"));
                        }
                    }
                } else {
                    self.pop();
                }
                self.push(instance);
                Ok(())
            }
            None => {
                if argc > 0 || !kwargs.is_empty() {
                    // Exception classes take a message argument by default.
                    if self.is_exception_class(class_id) {
                        let args = self.stack.split_off(callee_index + 1);
                        self.pop();
                        if let Some(first) = args.first() {
                            self.set_exception_field(instance, self.names.arg, *first);
                        }
                        self.push(instance);
                        return Ok(());
                    }
                    let name = match self.heap.get(class_id) {
                        HeapData::Class(class) => self.name_str(class.name),
                        _ => String::new(),
                    };
                    return Err(VmErr::type_error(format!("{name}() takes no arguments")));
                }
                self.pop(); // callee
                self.push(instance);
                Ok(())
            }
        }
    }

    pub(crate) fn is_exception_class(&self, class_id: HeapId) -> bool {
        let root = self.exc_classes[&ExcType::BaseException];
        let mut current = Some(class_id);
        while let Some(c) = current {
            if c == root {
                return true;
            }
            current = match self.heap.get(c) {
                HeapData::Class(class) => class.base,
                _ => None,
            };
        }
        false
    }

    /// Re-entrant call helper for natives and VM internals: pushes the
    /// callable and arguments, runs nested dispatch if a frame was pushed,
    /// and returns the result value.
    pub(crate) fn call_function(
        &mut self,
        callable: Value,
        args: Vec<Value>,
        kwargs: Vec<(HeapId, Value)>,
    ) -> VmResult<Value> {
        self.push(callable);
        let argc = args.len();
        for value in args {
            self.push(value);
        }
        let before = self.frames.len();
        self.op_call(argc, kwargs)?;
        if self.frames.len() > before {
            match self.execute(before)? {
                FrameExit::Returned(value) => Ok(value),
                FrameExit::Yielded(value) => Ok(value),
            }
        } else {
            Ok(self.pop())
        }
    }
}
