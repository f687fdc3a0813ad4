//! Raise, unwind, and the pending-action protocol for cleanup regions.
//!
//! Handler records live on the value stack. On a raise the VM scans the
//! current frame's stack region top-down; a `Try` handler catches (the slot
//! is re-tagged `ExceptScope` and control jumps to the except chain), while
//! `Finally`/`With` handlers intercept: the handler slot is replaced by a
//! pending-action marker describing what to do once the cleanup block
//! finishes. `return`, `break` and `continue` crossing cleanup regions use
//! the same markers instead of exceptions.

use super::{value_is, CallFrame, FrameExit, Vm, VmFlags};
use crate::exceptions::{ExcType, VmErr, VmResult};
use crate::heap::HeapId;
use crate::object::{HeapData, Instance, List, Tuple};
use crate::value::{Handler, HandlerKind, Value};

impl Vm {
    /// Turns a `VmErr` into a live exception instance.
    pub(crate) fn materialize_exception(&mut self, err: VmErr) -> VmResult<Value> {
        match err {
            VmErr::Raised(value) => Ok(value),
            VmErr::Pending(exc_type, message) => {
                let exc = self.make_exception(exc_type, &message);
                self.chain_context(exc);
                Ok(exc)
            }
        }
    }

    /// Builds an instance of a builtin exception class.
    pub(crate) fn make_exception(&mut self, exc_type: ExcType, message: &str) -> Value {
        let class = self.exc_classes[&exc_type];
        let mut instance = Instance::new(class);
        if !message.is_empty() {
            let text = self.intern_value(message);
            instance.fields.insert(self.names.arg, text);
        }
        let id = self.heap.alloc(HeapData::Instance(instance));
        Value::Ref(id)
    }

    /// Implicit chaining: the exception being handled becomes the new
    /// exception's `__context__`.
    pub(crate) fn chain_context(&mut self, exc: Value) {
        if let Some(current) = self.exception {
            if !value_is(current, exc) {
                self.set_exception_field(exc, self.names.context, current);
            }
        }
    }

    pub(crate) fn set_exception_field(&mut self, exc: Value, name: HeapId, value: Value) {
        if let Some(id) = exc.as_ref_id() {
            if let HeapData::Instance(instance) = self.heap.get_mut(id) {
                instance.fields.insert(name, value);
            }
        }
    }

    /// `raise C` with a class instantiates it first.
    pub(crate) fn instantiate_exception(&mut self, value: Value) -> VmResult<Value> {
        let is_class = matches!(
            value.as_ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Class(_))
        );
        let instance = if is_class {
            self.call_function(value, Vec::new(), Vec::new())?
        } else {
            value
        };
        if self.is_exception_instance(instance) {
            Ok(instance)
        } else {
            Err(VmErr::type_error("exceptions must derive from BaseException"))
        }
    }

    pub(crate) fn is_exception_instance(&self, value: Value) -> bool {
        let Some(id) = value.as_ref_id() else {
            return false;
        };
        let HeapData::Instance(instance) = self.heap.get(id) else {
            return false;
        };
        self.class_is_exception(instance.class)
    }

    fn class_is_exception(&self, class: HeapId) -> bool {
        let root = self.exc_classes[&ExcType::BaseException];
        let mut current = Some(class);
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

    /// Does the pending exception match an except-clause filter?
    /// `None` matches everything; a tuple matches if any element does.
    pub(crate) fn exception_matches(&mut self, exc: Value, filter: Value) -> VmResult<bool> {
        match filter {
            Value::None => Ok(true),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Class(_) => Ok(self.isinstance(exc, id)),
                HeapData::Tuple(tuple) => {
                    let items = tuple.items.clone();
                    for item in items {
                        if self.exception_matches(exc, item)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(VmErr::type_error(
                    "catching classes that do not derive from BaseException is not allowed",
                )),
            },
            _ => Err(VmErr::type_error(
                "catching classes that do not derive from BaseException is not allowed",
            )),
        }
    }

    /// `isinstance` over the class chain.
    pub(crate) fn isinstance(&self, value: Value, class: HeapId) -> bool {
        let Some(value_class) = self.class_of(value) else {
            return false;
        };
        let mut current = Some(value_class);
        while let Some(c) = current {
            if c == class {
                return true;
            }
            current = match self.heap.get(c) {
                HeapData::Class(k) => k.base,
                _ => None,
            };
        }
        false
    }

    /// Appends a `(closure, offset)` pair to the exception's traceback.
    fn push_traceback(&mut self, exc: Value, frame: &CallFrame) {
        let offset = frame.ip.saturating_sub(1);
        let entry_items = vec![Value::Ref(frame.closure), Value::Int(offset as i64)];
        let entry = self.heap.alloc(HeapData::Tuple(Tuple::new(entry_items)));
        let Some(exc_id) = exc.as_ref_id() else { return };
        let traceback_name = self.names.traceback;
        let existing = match self.heap.get(exc_id) {
            HeapData::Instance(instance) => instance.fields.get(&traceback_name).copied(),
            _ => return,
        };
        match existing.and_then(|v| v.as_ref_id()) {
            Some(list_id) => {
                if let HeapData::List(list) = self.heap.get_mut(list_id) {
                    list.items.push(Value::Ref(entry));
                }
            }
            None => {
                let list = self.heap.alloc(HeapData::List(List::new(vec![Value::Ref(entry)])));
                if let HeapData::Instance(instance) = self.heap.get_mut(exc_id) {
                    instance.fields.insert(traceback_name, Value::Ref(list));
                }
            }
        }
    }

    /// Unwinds after a raise. On success a handler has been set up and the
    /// dispatch loop continues; an `Err` means the exception escaped `base`.
    pub(crate) fn unwind_raise(&mut self, exc: Value, base: usize) -> VmResult<()> {
        self.flags.insert(VmFlags::HAS_EXCEPTION);
        let mut first = true;
        while self.frames.len() > base {
            if first {
                let frame = self.frame_clone_for_traceback();
                self.push_traceback(exc, &frame);
                first = false;
            }
            let stack_base = self.frames.last().expect("no frame").stack_base;
            // Scan this frame's stack region top-down for a handler.
            let mut index = self.stack.len();
            while index > stack_base {
                index -= 1;
                let Value::Handler(handler) = self.stack[index] else {
                    continue;
                };
                match handler.kind {
                    HandlerKind::Try => {
                        self.stack.truncate(index + 1);
                        self.stack[index] = Value::Handler(Handler {
                            kind: HandlerKind::ExceptScope,
                            target: handler.target,
                        });
                        self.exception = Some(exc);
                        self.frames.last_mut().expect("no frame").ip = handler.target as usize;
                        return Ok(());
                    }
                    HandlerKind::Finally | HandlerKind::With => {
                        self.stack.truncate(index);
                        self.push(exc);
                        self.push(Value::Handler(Handler {
                            kind: HandlerKind::PendingRaise,
                            target: 0,
                        }));
                        // Keep the exception visible for RERAISE/context.
                        self.exception = Some(exc);
                        self.frames.last_mut().expect("no frame").ip = handler.target as usize;
                        return Ok(());
                    }
                    // Spent or cleanup-internal markers: discard and keep
                    // scanning below them.
                    HandlerKind::ExceptScope
                    | HandlerKind::Normal
                    | HandlerKind::PendingRaise
                    | HandlerKind::PendingReturn
                    | HandlerKind::PendingJump { .. } => {
                        self.stack.truncate(index);
                    }
                }
            }
            // No handler: pop the frame and record it in the traceback.
            let frame = self.frames.pop().expect("no frame");
            self.close_upvalues(frame.stack_base);
            self.stack.truncate(frame.stack_base);
            if let Some(gen_id) = frame.gen {
                if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
                    generator.state = crate::object::GenState::Done;
                }
            }
            if self.frames.len() > base {
                let caller = self.frame_clone_for_traceback();
                self.push_traceback(exc, &caller);
            }
        }
        self.flags.insert(VmFlags::HAS_EXCEPTION);
        Err(VmErr::Raised(exc))
    }

    fn frame_clone_for_traceback(&self) -> CallFrame {
        self.frames.last().expect("no frame").clone()
    }

    /// Shared `return` machinery: run pending cleanup regions in this frame
    /// first, then actually return.
    pub(crate) fn do_return(&mut self, value: Value, base: usize) -> VmResult<Option<FrameExit>> {
        let stack_base = self.frame().stack_base;
        // Topmost cleanup handler in the frame intercepts the return.
        let mut index = self.stack.len();
        while index > stack_base {
            index -= 1;
            if let Value::Handler(handler) = self.stack[index] {
                if matches!(handler.kind, HandlerKind::Finally | HandlerKind::With) {
                    self.stack.truncate(index);
                    self.push(value);
                    self.push(Value::Handler(Handler {
                        kind: HandlerKind::PendingReturn,
                        target: 0,
                    }));
                    self.frame_mut().ip = handler.target as usize;
                    return Ok(None);
                }
            }
        }

        let frame = self.frames.pop().expect("return without a frame");
        self.close_upvalues(frame.stack_base);
        self.stack.truncate(frame.stack_base);
        if let Some(gen_id) = frame.gen {
            if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
                generator.state = crate::object::GenState::Done;
            }
        }
        if self.frames.len() == base {
            return Ok(Some(FrameExit::Returned(value)));
        }
        self.push(value);
        Ok(None)
    }

    /// `break`/`continue` crossing `regions` cleanup regions: route control
    /// through the topmost one with a pending-jump marker.
    pub(crate) fn begin_pending_jump(&mut self, regions: u8, pops: u8, target: u32) -> VmResult<()> {
        debug_assert!(regions > 0);
        self.enter_next_pending_jump(regions - 1, pops, target)
    }

    /// Sets up the next cleanup region of a pending jump chain.
    fn enter_next_pending_jump(&mut self, remaining: u8, pops: u8, target: u32) -> VmResult<()> {
        let stack_base = self.frame().stack_base;
        let mut index = self.stack.len();
        while index > stack_base {
            index -= 1;
            if let Value::Handler(handler) = self.stack[index] {
                if matches!(handler.kind, HandlerKind::Finally | HandlerKind::With) {
                    self.stack.truncate(index);
                    self.push(Value::Handler(Handler {
                        kind: HandlerKind::PendingJump { remaining, pops },
                        target,
                    }));
                    self.frame_mut().ip = handler.target as usize;
                    return Ok(());
                }
            }
        }
        Err(VmErr::runtime_error("loop exit missing its cleanup region"))
    }

    /// Enters a `with` block: resolve `__enter__`/`__exit__`, push the bound
    /// exit and the handler, call `__enter__`.
    pub(crate) fn enter_with(&mut self, target: u32) -> VmResult<()> {
        let manager = self.pop();
        let enter = self.context_method(manager, self.names.enter)?;
        let exit = self.context_method(manager, self.names.exit)?;
        self.push(exit);
        self.push(Value::Handler(Handler {
            kind: HandlerKind::With,
            target,
        }));
        let result = self.call_function(enter, Vec::new(), Vec::new())?;
        self.push(result);
        Ok(())
    }

    fn context_method(&mut self, manager: Value, name: HeapId) -> VmResult<Value> {
        let found = self.class_of(manager).and_then(|class| self.lookup_method(class, name));
        match found {
            Some(method) => Ok(self.bind_if_method(manager, method)),
            None => {
                let type_name = self.type_name_of(manager);
                Err(VmErr::type_error(format!(
                    "'{type_name}' object does not support the context manager protocol"
                )))
            }
        }
    }

    /// End of a cleanup block (`END_FINALLY` / `CLEANUP_WITH`): pop the
    /// pending-action marker and dispatch on it.
    pub(crate) fn finish_cleanup(&mut self, base: usize, is_with: bool) -> VmResult<Option<FrameExit>> {
        let marker = self.pop();
        let Value::Handler(handler) = marker else {
            panic!("cleanup block without a pending-action marker");
        };

        // Pull the payload (if any) from under the marker.
        let payload = match handler.kind {
            HandlerKind::PendingRaise | HandlerKind::PendingReturn => Some(self.pop()),
            _ => None,
        };

        if is_with {
            let exit = self.pop();
            let (arg_type, arg_value, arg_tb) = match (handler.kind, payload) {
                (HandlerKind::PendingRaise, Some(exc)) => {
                    let class = self.class_of(exc).map_or(Value::None, Value::Ref);
                    let traceback = self.exception_traceback(exc);
                    (class, exc, traceback)
                }
                _ => (Value::None, Value::None, Value::None),
            };
            let suppressed = {
                let result = self.call_function(exit, vec![arg_type, arg_value, arg_tb], Vec::new())?;
                crate::object::py_truthy(&self.heap, result)
            };
            if handler.kind == HandlerKind::PendingRaise && suppressed {
                self.exception = None;
                self.flags.remove(VmFlags::HAS_EXCEPTION);
                return Ok(None);
            }
        }

        match handler.kind {
            HandlerKind::Normal => Ok(None),
            HandlerKind::PendingRaise => {
                let exc = payload.expect("pending raise without payload");
                Err(VmErr::Raised(exc))
            }
            HandlerKind::PendingReturn => {
                let value = payload.expect("pending return without payload");
                self.do_return(value, base)
            }
            HandlerKind::PendingJump { remaining, pops } => {
                if remaining > 0 {
                    self.enter_next_pending_jump(remaining - 1, pops, handler.target)?;
                } else {
                    let len = self.stack.len() - pops as usize;
                    self.stack.truncate(len);
                    self.frame_mut().ip = handler.target as usize;
                }
                Ok(None)
            }
            other => panic!("unexpected cleanup marker {other:?}"),
        }
    }

    fn exception_traceback(&self, exc: Value) -> Value {
        exc.as_ref_id()
            .and_then(|id| match self.heap.get(id) {
                HeapData::Instance(instance) => instance.fields.get(&self.names.traceback).copied(),
                _ => None,
            })
            .unwrap_or(Value::None)
    }
}
