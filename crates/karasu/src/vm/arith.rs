//! Arithmetic and comparison dispatch, subscription, and slicing.
//!
//! Two-integer operands take a checked fast path on the host 64-bit type;
//! overflow (or a bigint operand) promotes to arbitrary precision. Anything
//! involving an instance goes through the reflected special-method protocol:
//! `type(a).__op__(a, b)`, then `type(b).__rop__(b, a)`, then `TypeError`.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use super::{value_is, Vm};
use crate::bytecode::op::{self, Opcode};
use crate::exceptions::{VmErr, VmResult};
use crate::heap::HeapId;
use crate::object::{self, HeapData, Slot};
use crate::value::Value;

impl Vm {
    fn op_symbol(opcode: Opcode) -> &'static str {
        match opcode {
            op::ADD => "+",
            op::SUB => "-",
            op::MUL => "*",
            op::DIV => "/",
            op::FLOORDIV => "//",
            op::MOD => "%",
            op::POW => "**",
            op::SHIFTLEFT => "<<",
            op::SHIFTRIGHT => ">>",
            op::BITOR => "|",
            op::BITXOR => "^",
            op::BITAND => "&",
            _ => "?",
        }
    }

    fn dunder_names(&self, opcode: Opcode) -> (HeapId, HeapId) {
        let n = &self.names;
        match opcode {
            op::ADD => (n.add, n.radd),
            op::SUB => (n.sub, n.rsub),
            op::MUL => (n.mul, n.rmul),
            op::DIV => (n.truediv, n.rtruediv),
            op::FLOORDIV => (n.floordiv, n.rfloordiv),
            op::MOD => (n.mod_, n.rmod),
            op::POW => (n.pow, n.rpow),
            op::SHIFTLEFT => (n.lshift, n.rlshift),
            op::SHIFTRIGHT => (n.rshift, n.rrshift),
            op::BITOR => (n.or, n.ror),
            op::BITXOR => (n.xor, n.rxor),
            op::BITAND => (n.and, n.rand),
            _ => (n.add, n.radd),
        }
    }

    fn is_instance_value(&self, value: Value) -> bool {
        matches!(
            value.as_ref_id().map(|id| self.heap.get(id)),
            Some(HeapData::Instance(_))
        )
    }

    fn as_bigint(&self, value: Value) -> Option<BigInt> {
        match value {
            Value::Int(i) => Some(BigInt::from(i)),
            Value::Bool(b) => Some(BigInt::from(i64::from(b))),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::BigInt(big) => Some(big.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Allocates a bigint result, demoting back to `Int` when it fits.
    pub(crate) fn bigint_value(&mut self, big: BigInt) -> Value {
        match big.to_i64() {
            Some(i) => Value::Int(i),
            None => Value::Ref(self.heap.alloc(HeapData::BigInt(big))),
        }
    }

    pub(crate) fn binary_op(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
        // Instance operands dispatch through the class tables.
        if self.is_instance_value(lhs) || self.is_instance_value(rhs) {
            return self.dunder_binary(opcode, lhs, rhs);
        }

        // Integer fast path (bools coerce).
        if let (Some(a), Some(b)) = (lhs.coerce_int(), rhs.coerce_int()) {
            if !matches!(lhs, Value::Float(_)) && !matches!(rhs, Value::Float(_)) {
                return self.int_op(opcode, a, b);
            }
        }

        // Bigint promotion when either side is one.
        let lhs_big = matches!(lhs.as_ref_id().map(|id| self.heap.get(id)), Some(HeapData::BigInt(_)));
        let rhs_big = matches!(rhs.as_ref_id().map(|id| self.heap.get(id)), Some(HeapData::BigInt(_)));
        if lhs_big || rhs_big {
            if let (Some(a), Some(b)) = (self.as_bigint(lhs), self.as_bigint(rhs)) {
                return self.bigint_op(opcode, a, b);
            }
        }

        // Float paths.
        if let (Some(a), Some(b)) = (lhs.coerce_float(), rhs.coerce_float()) {
            return self.float_op(opcode, a, b);
        }

        // Container and string operators.
        if let Some(result) = self.sequence_op(opcode, lhs, rhs)? {
            return Ok(result);
        }

        Err(VmErr::unsupported_operands(
            Self::op_symbol(opcode),
            &self.type_name_of(lhs),
            &self.type_name_of(rhs),
        ))
    }

    fn int_op(&mut self, opcode: Opcode, a: i64, b: i64) -> VmResult<Value> {
        let overflow = |vm: &mut Self, opcode, a: i64, b: i64| {
            vm.bigint_op(opcode, BigInt::from(a), BigInt::from(b))
        };
        match opcode {
            op::ADD => match a.checked_add(b) {
                Some(v) => Ok(Value::Int(v)),
                None => overflow(self, opcode, a, b),
            },
            op::SUB => match a.checked_sub(b) {
                Some(v) => Ok(Value::Int(v)),
                None => overflow(self, opcode, a, b),
            },
            op::MUL => match a.checked_mul(b) {
                Some(v) => Ok(Value::Int(v)),
                None => overflow(self, opcode, a, b),
            },
            op::DIV => {
                if b == 0 {
                    Err(VmErr::zero_division("division by zero"))
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            op::FLOORDIV => {
                if b == 0 {
                    Err(VmErr::zero_division("integer division or modulo by zero"))
                } else {
                    // UFCS avoids the unstable inherent i64::div_floor.
                    Ok(Value::Int(Integer::div_floor(&a, &b)))
                }
            }
            op::MOD => {
                if b == 0 {
                    Err(VmErr::zero_division("integer division or modulo by zero"))
                } else {
                    Ok(Value::Int(Integer::mod_floor(&a, &b)))
                }
            }
            op::POW => {
                if b < 0 {
                    Ok(Value::Float((a as f64).powf(b as f64)))
                } else {
                    match u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp)) {
                        Some(v) => Ok(Value::Int(v)),
                        None => overflow(self, opcode, a, b),
                    }
                }
            }
            op::SHIFTLEFT => {
                if b < 0 {
                    Err(VmErr::value_error("negative shift count"))
                } else if b < 64 {
                    match a.checked_shl(b as u32) {
                        Some(v) if (v >> b) == a => Ok(Value::Int(v)),
                        _ => overflow(self, opcode, a, b),
                    }
                } else {
                    overflow(self, opcode, a, b)
                }
            }
            op::SHIFTRIGHT => {
                if b < 0 {
                    Err(VmErr::value_error("negative shift count"))
                } else {
                    let shift = b.min(63) as u32;
                    Ok(Value::Int(a >> shift))
                }
            }
            op::BITOR => Ok(Value::Int(a | b)),
            op::BITXOR => Ok(Value::Int(a ^ b)),
            op::BITAND => Ok(Value::Int(a & b)),
            _ => unreachable!("non-arithmetic opcode in int_op"),
        }
    }

    fn float_op(&mut self, opcode: Opcode, a: f64, b: f64) -> VmResult<Value> {
        match opcode {
            op::ADD => Ok(Value::Float(a + b)),
            op::SUB => Ok(Value::Float(a - b)),
            op::MUL => Ok(Value::Float(a * b)),
            op::DIV => {
                if b == 0.0 {
                    Err(VmErr::zero_division("float division by zero"))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            op::FLOORDIV => {
                if b == 0.0 {
                    Err(VmErr::zero_division("float floor division by zero"))
                } else {
                    Ok(Value::Float((a / b).floor()))
                }
            }
            op::MOD => {
                if b == 0.0 {
                    Err(VmErr::zero_division("float modulo"))
                } else {
                    // Modulo takes the sign of the divisor.
                    Ok(Value::Float(((a % b) + b) % b))
                }
            }
            op::POW => Ok(Value::Float(a.powf(b))),
            _ => Err(VmErr::unsupported_operands(
                Self::op_symbol(opcode),
                "float",
                "float",
            )),
        }
    }

    fn bigint_op(&mut self, opcode: Opcode, a: BigInt, b: BigInt) -> VmResult<Value> {
        let result = match opcode {
            op::ADD => a + b,
            op::SUB => a - b,
            op::MUL => a * b,
            op::DIV => {
                if b.is_zero() {
                    return Err(VmErr::zero_division("division by zero"));
                }
                let fa = a.to_f64().unwrap_or(f64::INFINITY);
                let fb = b.to_f64().unwrap_or(f64::INFINITY);
                return Ok(Value::Float(fa / fb));
            }
            op::FLOORDIV => {
                if b.is_zero() {
                    return Err(VmErr::zero_division("integer division or modulo by zero"));
                }
                a.div_floor(&b)
            }
            op::MOD => {
                if b.is_zero() {
                    return Err(VmErr::zero_division("integer division or modulo by zero"));
                }
                a.mod_floor(&b)
            }
            op::POW => return self.bigint_pow(a, b),
            op::SHIFTLEFT => {
                let Some(shift) = b.to_u64() else {
                    return Err(VmErr::value_error("shift count out of range"));
                };
                a << shift
            }
            op::SHIFTRIGHT => {
                let Some(shift) = b.to_u64() else {
                    return Err(VmErr::value_error("shift count out of range"));
                };
                a >> shift
            }
            op::BITOR => a | b,
            op::BITXOR => a ^ b,
            op::BITAND => a & b,
            _ => {
                return Err(VmErr::unsupported_operands(Self::op_symbol(opcode), "int", "int"));
            }
        };
        Ok(self.bigint_value(result))
    }

    /// Square-and-multiply exponentiation, polling the cancellation flag
    /// between steps so huge exponents stay interruptible.
    fn bigint_pow(&mut self, base: BigInt, exp: BigInt) -> VmResult<Value> {
        if exp.is_negative() {
            let fa = base.to_f64().unwrap_or(f64::INFINITY);
            let fb = exp.to_f64().unwrap_or(f64::NEG_INFINITY);
            return Ok(Value::Float(fa.powf(fb)));
        }
        let Some(mut exp) = exp.to_u64() else {
            return Err(VmErr::value_error("exponent too large"));
        };
        let mut result = BigInt::from(1);
        let mut factor = base;
        while exp > 0 {
            if self.signal_pending() {
                return Err(VmErr::Pending(crate::exceptions::ExcType::KeyboardInterrupt, String::new()));
            }
            if exp & 1 == 1 {
                result *= &factor;
            }
            exp >>= 1;
            if exp > 0 {
                factor = &factor * &factor;
            }
        }
        Ok(self.bigint_value(result))
    }

    fn signal_pending(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.signal_handle().swap(false, Ordering::Relaxed)
    }

    /// String, bytes, tuple, list and set operators.
    fn sequence_op(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> VmResult<Option<Value>> {
        let (Some(lhs_id), rhs_id) = (lhs.as_ref_id(), rhs.as_ref_id()) else {
            // int * list etc: repetition with the int on the left.
            if let (Some(n), Some(id)) = (lhs.coerce_int(), rhs.as_ref_id()) {
                if opcode == op::MUL {
                    return self.repeat_sequence(id, n).map(Some).or(Ok(None));
                }
            }
            return Ok(None);
        };

        match (self.heap.get(lhs_id), opcode) {
            (HeapData::Str(a), op::ADD) => {
                let Some(HeapData::Str(b)) = rhs_id.map(|id| self.heap.get(id)) else {
                    return Err(VmErr::type_error(format!(
                        "can only concatenate str (not '{}') to str",
                        self.type_name_of(rhs)
                    )));
                };
                let mut text = a.as_str().to_owned();
                text.push_str(b.as_str());
                Ok(Some(self.intern_value(&text)))
            }
            (HeapData::Str(_), op::MUL) => {
                let Some(n) = rhs.coerce_int() else {
                    return Ok(None);
                };
                self.repeat_sequence(lhs_id, n).map(Some)
            }
            (HeapData::Bytes(a), op::ADD) => {
                let Some(HeapData::Bytes(b)) = rhs_id.map(|id| self.heap.get(id)) else {
                    return Ok(None);
                };
                let mut data = a.as_slice().to_vec();
                data.extend_from_slice(b.as_slice());
                let id = self.heap.alloc(HeapData::Bytes(object::Bytes::new(data)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Bytes(_), op::MUL) => {
                let Some(n) = rhs.coerce_int() else {
                    return Ok(None);
                };
                self.repeat_sequence(lhs_id, n).map(Some)
            }
            (HeapData::List(a), op::ADD) => {
                let Some(HeapData::List(b)) = rhs_id.map(|id| self.heap.get(id)) else {
                    return Err(VmErr::type_error(format!(
                        "can only concatenate list (not '{}') to list",
                        self.type_name_of(rhs)
                    )));
                };
                let mut items = a.items.clone();
                items.extend_from_slice(&b.items);
                let id = self.heap.alloc(HeapData::List(object::List::new(items)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::List(_), op::MUL) => {
                let Some(n) = rhs.coerce_int() else {
                    return Ok(None);
                };
                self.repeat_sequence(lhs_id, n).map(Some)
            }
            (HeapData::Tuple(a), op::ADD) => {
                let Some(HeapData::Tuple(b)) = rhs_id.map(|id| self.heap.get(id)) else {
                    return Ok(None);
                };
                let mut items = a.items.clone();
                items.extend_from_slice(&b.items);
                let id = self.heap.alloc(HeapData::Tuple(object::Tuple::new(items)));
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Tuple(_), op::MUL) => {
                let Some(n) = rhs.coerce_int() else {
                    return Ok(None);
                };
                self.repeat_sequence(lhs_id, n).map(Some)
            }
            (HeapData::Set(a), op::BITOR | op::BITAND | op::SUB | op::BITXOR) => {
                let Some(HeapData::Set(b)) = rhs_id.map(|id| self.heap.get(id)) else {
                    return Ok(None);
                };
                let left = a.entries();
                let right = b.entries();
                let result = self.heap.alloc(HeapData::Set(object::Set::new()));
                match opcode {
                    op::BITOR => {
                        for item in left.into_iter().chain(right) {
                            self.set_insert(result, item)?;
                        }
                    }
                    op::BITAND => {
                        let rhs_set = rhs_id.expect("set operand");
                        for item in left {
                            if self.set_contains(rhs_set, item)? {
                                self.set_insert(result, item)?;
                            }
                        }
                    }
                    op::SUB => {
                        let rhs_set = rhs_id.expect("set operand");
                        for item in left {
                            if !self.set_contains(rhs_set, item)? {
                                self.set_insert(result, item)?;
                            }
                        }
                    }
                    op::BITXOR => {
                        let rhs_set = rhs_id.expect("set operand");
                        for item in left {
                            if !self.set_contains(rhs_set, item)? {
                                self.set_insert(result, item)?;
                            }
                        }
                        for item in right {
                            if !self.set_contains(lhs_id, item)? {
                                self.set_insert(result, item)?;
                            }
                        }
                    }
                    _ => unreachable!(),
                }
                Ok(Some(Value::Ref(result)))
            }
            _ => Ok(None),
        }
    }

    /// `seq * n` for strings, bytes, lists and tuples.
    fn repeat_sequence(&mut self, id: HeapId, n: i64) -> VmResult<Value> {
        let n = n.max(0) as usize;
        match self.heap.get(id) {
            HeapData::Str(s) => {
                let text = s.as_str().repeat(n);
                Ok(self.intern_value(&text))
            }
            HeapData::Bytes(b) => {
                let data = b.as_slice().repeat(n);
                let new = self.heap.alloc(HeapData::Bytes(object::Bytes::new(data)));
                Ok(Value::Ref(new))
            }
            HeapData::List(list) => {
                let mut items = Vec::with_capacity(list.items.len() * n);
                for _ in 0..n {
                    items.extend_from_slice(&list.items);
                }
                let new = self.heap.alloc(HeapData::List(object::List::new(items)));
                Ok(Value::Ref(new))
            }
            HeapData::Tuple(tuple) => {
                let mut items = Vec::with_capacity(tuple.items.len() * n);
                for _ in 0..n {
                    items.extend_from_slice(&tuple.items);
                }
                let new = self.heap.alloc(HeapData::Tuple(object::Tuple::new(items)));
                Ok(Value::Ref(new))
            }
            _ => Err(VmErr::type_error("can't multiply this sequence")),
        }
    }

    /// The reflected dunder protocol of the binary operators.
    fn dunder_binary(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> VmResult<Value> {
        let (forward, reflected) = self.dunder_names(opcode);
        if let Some(method) = self.find_type_method(lhs, forward) {
            let bound = self.bind_if_method(lhs, method);
            let result = self.call_function(bound, vec![rhs], Vec::new())?;
            if !result.is_notimpl() {
                return Ok(result);
            }
        }
        if let Some(method) = self.find_type_method(rhs, reflected) {
            let bound = self.bind_if_method(rhs, method);
            let result = self.call_function(bound, vec![lhs], Vec::new())?;
            if !result.is_notimpl() {
                return Ok(result);
            }
        }
        Err(VmErr::unsupported_operands(
            Self::op_symbol(opcode),
            &self.type_name_of(lhs),
            &self.type_name_of(rhs),
        ))
    }

    fn find_type_method(&self, value: Value, name: HeapId) -> Option<Value> {
        let class = self.class_of(value)?;
        self.lookup_method(class, name)
    }

    pub(crate) fn negate(&mut self, value: Value) -> VmResult<Value> {
        match value {
            Value::Int(i) => match i.checked_neg() {
                Some(v) => Ok(Value::Int(v)),
                None => Ok(self.bigint_value(-BigInt::from(i))),
            },
            Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::BigInt(big) => {
                    let negated = -big.clone();
                    Ok(self.bigint_value(negated))
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.find_type_method(value, self.names.neg) {
                        let bound = self.bind_if_method(value, method);
                        return self.call_function(bound, Vec::new(), Vec::new());
                    }
                    Err(VmErr::type_error(format!(
                        "bad operand type for unary -: '{}'",
                        self.type_name_of(value)
                    )))
                }
                _ => Err(VmErr::type_error(format!(
                    "bad operand type for unary -: '{}'",
                    self.type_name_of(value)
                ))),
            },
            _ => Err(VmErr::type_error(format!(
                "bad operand type for unary -: '{}'",
                self.type_name_of(value)
            ))),
        }
    }

    pub(crate) fn bit_negate(&mut self, value: Value) -> VmResult<Value> {
        match value {
            Value::Int(i) => Ok(Value::Int(!i)),
            Value::Bool(b) => Ok(Value::Int(!i64::from(b))),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::BigInt(big) => {
                    let negated = -(big.clone()) - 1;
                    Ok(self.bigint_value(negated))
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.find_type_method(value, self.names.invert) {
                        let bound = self.bind_if_method(value, method);
                        return self.call_function(bound, Vec::new(), Vec::new());
                    }
                    Err(VmErr::type_error(format!(
                        "bad operand type for unary ~: '{}'",
                        self.type_name_of(value)
                    )))
                }
                _ => Err(VmErr::type_error(format!(
                    "bad operand type for unary ~: '{}'",
                    self.type_name_of(value)
                ))),
            },
            _ => Err(VmErr::type_error(format!(
                "bad operand type for unary ~: '{}'",
                self.type_name_of(value)
            ))),
        }
    }

    /// `==` with `__eq__`/`__eq__`-reflected support for instances.
    pub(crate) fn values_equal(&mut self, lhs: Value, rhs: Value) -> VmResult<bool> {
        if self.is_instance_value(lhs) || self.is_instance_value(rhs) {
            if let Some(method) = self.cached_slot(lhs, Slot::Eq) {
                let bound = self.bind_if_method(lhs, method);
                let result = self.call_function(bound, vec![rhs], Vec::new())?;
                if !result.is_notimpl() {
                    return Ok(object::py_truthy(&self.heap, result));
                }
            }
            if let Some(method) = self.cached_slot(rhs, Slot::Eq) {
                let bound = self.bind_if_method(rhs, method);
                let result = self.call_function(bound, vec![lhs], Vec::new())?;
                if !result.is_notimpl() {
                    return Ok(object::py_truthy(&self.heap, result));
                }
            }
            return Ok(value_is(lhs, rhs));
        }
        Ok(object::py_eq(&self.heap, lhs, rhs))
    }

    pub(crate) fn compare_op(&mut self, opcode: Opcode, lhs: Value, rhs: Value) -> VmResult<bool> {
        use std::cmp::Ordering;
        if self.is_instance_value(lhs) || self.is_instance_value(rhs) {
            let name = match opcode {
                op::LESS => self.names.lt,
                op::GREATER => self.names.gt,
                op::LESS_EQUAL => self.names.le,
                op::GREATER_EQUAL => self.names.ge,
                _ => unreachable!("non-comparison opcode"),
            };
            if let Some(method) = self.find_type_method(lhs, name) {
                let bound = self.bind_if_method(lhs, method);
                let result = self.call_function(bound, vec![rhs], Vec::new())?;
                if !result.is_notimpl() {
                    return Ok(object::py_truthy(&self.heap, result));
                }
            }
        }
        let Some(ordering) = object::py_cmp(&self.heap, lhs, rhs) else {
            let symbol = match opcode {
                op::LESS => "<",
                op::GREATER => ">",
                op::LESS_EQUAL => "<=",
                op::GREATER_EQUAL => ">=",
                _ => "?",
            };
            return Err(VmErr::type_error(format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                self.type_name_of(lhs),
                self.type_name_of(rhs)
            )));
        };
        Ok(match opcode {
            op::LESS => ordering == Ordering::Less,
            op::GREATER => ordering == Ordering::Greater,
            op::LESS_EQUAL => ordering != Ordering::Greater,
            op::GREATER_EQUAL => ordering != Ordering::Less,
            _ => false,
        })
    }

    /// `needle in container`.
    pub(crate) fn contains(&mut self, container: Value, needle: Value) -> VmResult<bool> {
        if let Some(id) = container.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => {
                    let items = list.items.clone();
                    for item in items {
                        if self.values_equal(item, needle)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapData::Tuple(tuple) => {
                    let items = tuple.items.clone();
                    for item in items {
                        if self.values_equal(item, needle)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapData::Str(haystack) => {
                    let Some(HeapData::Str(sub)) = needle.as_ref_id().map(|nid| self.heap.get(nid)) else {
                        return Err(VmErr::type_error("'in <string>' requires string as left operand"));
                    };
                    return Ok(haystack.as_str().contains(sub.as_str()));
                }
                HeapData::Dict(_) => {
                    return Ok(self.dict_get(id, needle)?.is_some());
                }
                HeapData::Set(_) => {
                    return self.set_contains(id, needle);
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.find_type_method(container, self.names.contains) {
                        let bound = self.bind_if_method(container, method);
                        let result = self.call_function(bound, vec![needle], Vec::new())?;
                        return Ok(object::py_truthy(&self.heap, result));
                    }
                    // Fall back to iteration.
                    let iterator = self.make_iterator(container)?;
                    loop {
                        let next = self.iterator_next(iterator, Value::None)?;
                        if value_is(next, iterator) {
                            return Ok(false);
                        }
                        if self.values_equal(next, needle)? {
                            return Ok(true);
                        }
                    }
                }
                _ => {}
            }
        }
        Err(VmErr::type_error(format!(
            "argument of type '{}' is not iterable",
            self.type_name_of(container)
        )))
    }

    // ==================================================================
    // Subscription
    // ==================================================================

    /// Wraps a possibly negative index once and bounds-checks it.
    fn normalize_index(&self, index: i64, len: usize, what: &str) -> VmResult<usize> {
        let len = len as i64;
        let wrapped = if index < 0 { index + len } else { index };
        if wrapped < 0 || wrapped >= len {
            Err(VmErr::index_error(format!("{what} index out of range")))
        } else {
            Ok(wrapped as usize)
        }
    }

    pub(crate) fn subscript_get(&mut self, obj: Value, index: Value) -> VmResult<Value> {
        if let Some(id) = obj.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error(format!(
                            "list indices must be integers, not '{}'",
                            self.type_name_of(index)
                        )));
                    };
                    let items_len = list.items.len();
                    let slot = self.normalize_index(i, items_len, "list")?;
                    if let HeapData::List(list) = self.heap.get(id) {
                        return Ok(list.items[slot]);
                    }
                    unreachable!()
                }
                HeapData::Tuple(tuple) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error("tuple indices must be integers"));
                    };
                    let items_len = tuple.items.len();
                    let slot = self.normalize_index(i, items_len, "tuple")?;
                    if let HeapData::Tuple(tuple) = self.heap.get(id) {
                        return Ok(tuple.items[slot]);
                    }
                    unreachable!()
                }
                HeapData::Str(s) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error("string indices must be integers"));
                    };
                    let char_len = s.char_len();
                    let slot = self.normalize_index(i, char_len, "string")?;
                    let ch = match self.heap.get(id) {
                        HeapData::Str(s) => s.nth_char(slot).expect("index checked"),
                        _ => unreachable!(),
                    };
                    let mut buffer = [0u8; 4];
                    let text = ch.encode_utf8(&mut buffer).to_owned();
                    return Ok(self.intern_value(&text));
                }
                HeapData::Bytes(bytes) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error("byte indices must be integers"));
                    };
                    let len = bytes.len();
                    let slot = self.normalize_index(i, len, "bytes")?;
                    if let HeapData::Bytes(bytes) = self.heap.get(id) {
                        return Ok(Value::Int(i64::from(bytes.as_slice()[slot])));
                    }
                    unreachable!()
                }
                HeapData::Dict(_) => {
                    return match self.dict_get(id, index)? {
                        Some(value) => Ok(value),
                        None => {
                            let key = self.value_repr(index)?;
                            Err(VmErr::key_error(key))
                        }
                    };
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.cached_slot(obj, Slot::GetItem) {
                        let bound = self.bind_if_method(obj, method);
                        return self.call_function(bound, vec![index], Vec::new());
                    }
                }
                _ => {}
            }
        }
        Err(VmErr::type_error(format!(
            "'{}' object is not subscriptable",
            self.type_name_of(obj)
        )))
    }

    pub(crate) fn subscript_set(&mut self, obj: Value, index: Value, value: Value) -> VmResult<()> {
        if let Some(id) = obj.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error("list indices must be integers"));
                    };
                    let items_len = list.items.len();
                    let slot = self.normalize_index(i, items_len, "list")?;
                    if let HeapData::List(list) = self.heap.get_mut(id) {
                        list.items[slot] = value;
                    }
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    self.dict_insert(id, index, value)?;
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.cached_slot(obj, Slot::SetItem) {
                        let bound = self.bind_if_method(obj, method);
                        self.call_function(bound, vec![index, value], Vec::new())?;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(VmErr::type_error(format!(
            "'{}' object does not support item assignment",
            self.type_name_of(obj)
        )))
    }

    pub(crate) fn subscript_del(&mut self, obj: Value, index: Value) -> VmResult<()> {
        if let Some(id) = obj.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => {
                    let Some(i) = index.coerce_int() else {
                        return Err(VmErr::type_error("list indices must be integers"));
                    };
                    let items_len = list.items.len();
                    let slot = self.normalize_index(i, items_len, "list")?;
                    if let HeapData::List(list) = self.heap.get_mut(id) {
                        list.items.remove(slot);
                    }
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    return match self.dict_remove(id, index)? {
                        Some(_) => Ok(()),
                        None => {
                            let key = self.value_repr(index)?;
                            Err(VmErr::key_error(key))
                        }
                    };
                }
                HeapData::Instance(_) => {
                    if let Some(method) = self.find_type_method(obj, self.names.delitem) {
                        let bound = self.bind_if_method(obj, method);
                        self.call_function(bound, vec![index], Vec::new())?;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(VmErr::type_error(format!(
            "'{}' object does not support item deletion",
            self.type_name_of(obj)
        )))
    }

    // ==================================================================
    // Slicing
    // ==================================================================

    /// Resolves `(start, stop, step)` to concrete indices over `len`:
    /// negative indices wrap once, out-of-range values clamp.
    fn resolve_slice(&self, start: Value, stop: Value, step: Value, len: usize) -> VmResult<(i64, i64, i64)> {
        let step = match step {
            Value::None => 1,
            other => other
                .coerce_int()
                .ok_or_else(|| VmErr::type_error("slice indices must be integers or None"))?,
        };
        if step == 0 {
            return Err(VmErr::value_error("slice step cannot be zero"));
        }
        let len = len as i64;
        let clamp = |raw: i64, low: i64, high: i64| raw.clamp(low, high);
        let (default_start, default_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
        let resolve = |value: Value, default: i64| -> VmResult<i64> {
            match value {
                Value::None => Ok(default),
                other => {
                    let raw = other
                        .coerce_int()
                        .ok_or_else(|| VmErr::type_error("slice indices must be integers or None"))?;
                    let wrapped = if raw < 0 { raw + len } else { raw };
                    Ok(if step > 0 {
                        clamp(wrapped, 0, len)
                    } else {
                        clamp(wrapped, -1, len - 1)
                    })
                }
            }
        };
        Ok((resolve(start, default_start)?, resolve(stop, default_stop)?, step))
    }

    fn slice_indices(&self, start: Value, stop: Value, step: Value, len: usize) -> VmResult<Vec<usize>> {
        let (start, stop, step) = self.resolve_slice(start, stop, step, len)?;
        let mut indices = Vec::new();
        let mut current = start;
        if step > 0 {
            while current < stop {
                indices.push(current as usize);
                current += step;
            }
        } else {
            while current > stop {
                indices.push(current as usize);
                current += step;
            }
        }
        Ok(indices)
    }

    pub(crate) fn slice_get(&mut self, obj: Value, start: Value, stop: Value, step: Value) -> VmResult<Value> {
        if let Some(id) = obj.as_ref_id() {
            match self.heap.get(id) {
                HeapData::List(list) => {
                    let len = list.items.len();
                    let indices = self.slice_indices(start, stop, step, len)?;
                    let items: Vec<Value> = {
                        let HeapData::List(list) = self.heap.get(id) else {
                            unreachable!()
                        };
                        indices.iter().map(|i| list.items[*i]).collect()
                    };
                    let new = self.heap.alloc(HeapData::List(object::List::new(items)));
                    return Ok(Value::Ref(new));
                }
                HeapData::Tuple(tuple) => {
                    let len = tuple.items.len();
                    let indices = self.slice_indices(start, stop, step, len)?;
                    let items: Vec<Value> = {
                        let HeapData::Tuple(tuple) = self.heap.get(id) else {
                            unreachable!()
                        };
                        indices.iter().map(|i| tuple.items[*i]).collect()
                    };
                    let new = self.heap.alloc(HeapData::Tuple(object::Tuple::new(items)));
                    return Ok(Value::Ref(new));
                }
                HeapData::Str(s) => {
                    let chars: Vec<char> = s.as_str().chars().collect();
                    let indices = self.slice_indices(start, stop, step, chars.len())?;
                    let text: String = indices.into_iter().map(|i| chars[i]).collect();
                    return Ok(self.intern_value(&text));
                }
                HeapData::Bytes(bytes) => {
                    let data = bytes.as_slice().to_vec();
                    let indices = self.slice_indices(start, stop, step, data.len())?;
                    let sliced: Vec<u8> = indices.into_iter().map(|i| data[i]).collect();
                    let new = self.heap.alloc(HeapData::Bytes(object::Bytes::new(sliced)));
                    return Ok(Value::Ref(new));
                }
                _ => {}
            }
        }
        Err(VmErr::type_error(format!(
            "'{}' object cannot be sliced",
            self.type_name_of(obj)
        )))
    }

    pub(crate) fn slice_set(&mut self, obj: Value, start: Value, stop: Value, step: Value, value: Value) -> VmResult<()> {
        let Some(id) = obj.as_ref_id() else {
            return Err(VmErr::type_error("only lists support slice assignment"));
        };
        if !matches!(self.heap.get(id), HeapData::List(_)) {
            return Err(VmErr::type_error("only lists support slice assignment"));
        }
        let replacement = self.iterable_to_vec(value)?;
        let len = match self.heap.get(id) {
            HeapData::List(list) => list.items.len(),
            _ => unreachable!(),
        };
        let (start, stop, step) = self.resolve_slice(start, stop, step, len)?;
        if step != 1 {
            let indices = self.slice_indices(Value::Int(start), Value::Int(stop), Value::Int(step), len)?;
            if indices.len() != replacement.len() {
                return Err(VmErr::value_error(format!(
                    "attempt to assign sequence of size {} to extended slice of size {}",
                    replacement.len(),
                    indices.len()
                )));
            }
            if let HeapData::List(list) = self.heap.get_mut(id) {
                for (slot, item) in indices.into_iter().zip(replacement) {
                    list.items[slot] = item;
                }
            }
            return Ok(());
        }
        let start = start.max(0) as usize;
        let stop = (stop.max(start as i64)) as usize;
        if let HeapData::List(list) = self.heap.get_mut(id) {
            list.items.splice(start..stop, replacement);
        }
        Ok(())
    }

    pub(crate) fn slice_del(&mut self, obj: Value, start: Value, stop: Value, step: Value) -> VmResult<()> {
        let Some(id) = obj.as_ref_id() else {
            return Err(VmErr::type_error("only lists support slice deletion"));
        };
        let len = match self.heap.get(id) {
            HeapData::List(list) => list.items.len(),
            _ => return Err(VmErr::type_error("only lists support slice deletion")),
        };
        let mut indices = self.slice_indices(start, stop, step, len)?;
        indices.sort_unstable();
        if let HeapData::List(list) = self.heap.get_mut(id) {
            for index in indices.into_iter().rev() {
                list.items.remove(index);
            }
        }
        Ok(())
    }
}
