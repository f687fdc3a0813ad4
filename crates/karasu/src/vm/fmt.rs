//! `str()` / `repr()` rendering, including the recursion guard for
//! self-referential containers.

use super::Vm;
use crate::exceptions::VmResult;
use crate::object::{GenState, HeapData, Slot};
use crate::value::Value;

impl Vm {
    /// `str(value)`: strings render bare, instances consult `__str__`,
    /// exceptions default to their message.
    pub(crate) fn value_str(&mut self, value: Value) -> VmResult<String> {
        if let Some(id) = value.as_ref_id() {
            match self.heap.get(id) {
                HeapData::Str(s) => return Ok(s.as_str().to_owned()),
                HeapData::Instance(instance) => {
                    let class = instance.class;
                    if let Some(method) = self.cached_slot(value, Slot::Str) {
                        let bound = self.bind_if_method(value, method);
                        let result = self.call_function(bound, Vec::new(), Vec::new())?;
                        return self.value_str(result);
                    }
                    if self.is_exception_class(class) {
                        let arg = instance.fields.get(&self.names.arg).copied();
                        return match arg {
                            Some(arg) => self.value_str(arg),
                            None => Ok(String::new()),
                        };
                    }
                }
                _ => {}
            }
        }
        self.value_repr(value)
    }

    /// `repr(value)`.
    pub(crate) fn value_repr(&mut self, value: Value) -> VmResult<String> {
        match value {
            Value::None => Ok("None".to_owned()),
            Value::NotImplemented => Ok("NotImplemented".to_owned()),
            Value::Undefined => Ok("<unbound>".to_owned()),
            Value::Bool(true) => Ok("True".to_owned()),
            Value::Bool(false) => Ok("False".to_owned()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(format_float(f)),
            Value::Handler(_) | Value::Kwargs(_) => Ok("<marker>".to_owned()),
            Value::Ref(id) => self.heap_repr(id),
        }
    }

    fn heap_repr(&mut self, id: crate::heap::HeapId) -> VmResult<String> {
        // The in-repr header bit guards recursive containers.
        match self.heap.get(id) {
            HeapData::Str(s) => return Ok(string_repr(s.as_str())),
            HeapData::Bytes(b) => return Ok(bytes_repr(b.as_slice())),
            HeapData::BigInt(big) => return Ok(big.to_string()),
            _ => {}
        }

        if self.heap.enter_repr(id) {
            // Already being rendered further up the chain.
            let placeholder = match self.heap.get(id) {
                HeapData::List(_) => "[...]",
                HeapData::Dict(_) => "{...}",
                HeapData::Set(_) => "{...}",
                HeapData::Tuple(_) => "(...)",
                _ => "...",
            };
            return Ok(placeholder.to_owned());
        }

        let result = self.heap_repr_inner(id);
        self.heap.leave_repr(id);
        result
    }

    fn heap_repr_inner(&mut self, id: crate::heap::HeapId) -> VmResult<String> {
        let value = Value::Ref(id);
        let text = match self.heap.get(id) {
            HeapData::Tuple(tuple) => {
                let items = tuple.items.clone();
                let mut out = String::from("(");
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.value_repr(*item)?);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
                out
            }
            HeapData::List(list) => {
                let items = list.items.clone();
                let mut out = String::from("[");
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.value_repr(*item)?);
                }
                out.push(']');
                out
            }
            HeapData::Dict(dict) => {
                let entries = dict.entries();
                if entries.is_empty() {
                    "{}".to_owned()
                } else {
                    let mut out = String::from("{");
                    for (index, (key, value)) in entries.iter().enumerate() {
                        if index > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.value_repr(*key)?);
                        out.push_str(": ");
                        out.push_str(&self.value_repr(*value)?);
                    }
                    out.push('}');
                    out
                }
            }
            HeapData::Set(set) => {
                let entries = set.entries();
                if entries.is_empty() {
                    "set()".to_owned()
                } else {
                    let mut out = String::from("{");
                    for (index, item) in entries.iter().enumerate() {
                        if index > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.value_repr(*item)?);
                    }
                    out.push('}');
                    out
                }
            }
            HeapData::Closure(closure) => {
                let name = match self.heap.get(closure.code) {
                    HeapData::Code(code) => self.name_str(code.qualname),
                    _ => String::new(),
                };
                format!("<function {name} at 0x{:x}>", id.index())
            }
            HeapData::Native(native) => format!("<built-in function {}>", native.name),
            HeapData::BoundMethod(method) => {
                let callable = self.value_repr(method.callable)?;
                format!("<bound method {callable}>")
            }
            HeapData::Code(code) => {
                let name = self.name_str(code.qualname);
                format!("<code object {name}>")
            }
            HeapData::Class(class) => {
                let name = self.name_str(class.name);
                format!("<class '{name}'>")
            }
            HeapData::Module(module) => {
                let name = self.name_str(module.name);
                format!("<module '{name}'>")
            }
            HeapData::Generator(generator) => {
                let suffix = if generator.state == GenState::Done { " (done)" } else { "" };
                format!("<generator at 0x{:x}{suffix}>", id.index())
            }
            HeapData::Range(range) => {
                if range.step == 1 {
                    format!("range({}, {})", range.start, range.stop)
                } else {
                    format!("range({}, {}, {})", range.start, range.stop, range.step)
                }
            }
            HeapData::RangeIter(_) | HeapData::SeqIter(_) => format!("<iterator at 0x{:x}>", id.index()),
            HeapData::Upvalue(_) => "<cell>".to_owned(),
            HeapData::Instance(instance) => {
                let class = instance.class;
                if let Some(method) = self.cached_slot(value, Slot::Repr) {
                    let bound = self.bind_if_method(value, method);
                    let result = self.call_function(bound, Vec::new(), Vec::new())?;
                    return self.value_str(result);
                }
                let class_name = match self.heap.get(class) {
                    HeapData::Class(c) => self.name_str(c.name),
                    _ => "object".to_owned(),
                };
                if self.is_exception_class(class) {
                    let message = self.value_str(value)?;
                    if message.is_empty() {
                        format!("{class_name}()")
                    } else {
                        format!("{class_name}({})", string_repr(&message))
                    }
                } else {
                    format!("<{class_name} object at 0x{:x}>", id.index())
                }
            }
            HeapData::Str(_) | HeapData::Bytes(_) | HeapData::BigInt(_) => unreachable!("handled above"),
        };
        Ok(text)
    }
}

/// Floats always render with a decimal point or exponent so they read back
/// as floats.
fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Quotes a string the way the language's repr does: single quotes unless
/// the content contains one (and no double quote).
pub(crate) fn string_repr(s: &str) -> String {
    let use_double = s.contains('\'') && !s.contains('"');
    let quote = if use_double { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn bytes_repr(data: &[u8]) -> String {
    let mut out = String::from("b'");
    for byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(*byte as char),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out.push('\'');
    out
}
