//! The builtin namespace: core type classes and their method tables, the
//! exception class hierarchy, and the builtin functions.
//!
//! Every primitive and container type is backed by a real class object so
//! attribute access, `type()`, and `isinstance()` all go through the same
//! per-class method tables the language uses for user classes.

use strum::IntoEnumIterator;

use crate::exceptions::{ExcType, VmErr, VmResult};
use crate::heap::HeapId;
use crate::object::{self, Class, HeapData, NativeArgs, NativeFunction, NativeKind, Range, Slot};
use crate::value::Value;
use crate::vm::Vm;

/// Installs core classes, exceptions, and builtin functions into a fresh VM.
pub fn install(vm: &mut Vm) {
    install_core_classes(vm);
    install_exception_classes(vm);
    install_builtin_functions(vm);
}

// ======================================================================
// Core classes
// ======================================================================

fn new_class(vm: &mut Vm, name: &str, base: Option<HeapId>) -> HeapId {
    let name_id = vm.intern(name);
    let class = Class::new(name_id, base);
    vm.heap.alloc(HeapData::Class(class))
}

fn add_method(vm: &mut Vm, class: HeapId, name: &'static str, doc: &'static str, func: object::NativeFn) {
    let native = vm.heap.alloc(HeapData::Native(NativeFunction {
        name,
        doc,
        kind: NativeKind::Method,
        func,
    }));
    let name_id = vm.intern(name);
    if let HeapData::Class(class) = vm.heap.get_mut(class) {
        class.methods.insert(name_id, Value::Ref(native));
    }
}

fn install_core_classes(vm: &mut Vm) {
    let object = new_class(vm, "object", None);
    vm.core.object = Some(object);

    let mut make = |vm: &mut Vm, name: &str| new_class(vm, name, Some(object));
    let int = make(vm, "int");
    let float = make(vm, "float");
    let bool_ = new_class(vm, "bool", Some(int));
    let none = make(vm, "NoneType");
    let str_ = make(vm, "str");
    let bytes = make(vm, "bytes");
    let tuple = make(vm, "tuple");
    let list = make(vm, "list");
    let dict = make(vm, "dict");
    let set = make(vm, "set");
    let function = make(vm, "function");
    let module = make(vm, "module");
    let generator = make(vm, "generator");
    let range = make(vm, "range");
    let type_ = make(vm, "type");

    vm.core.int = Some(int);
    vm.core.float = Some(float);
    vm.core.bool_ = Some(bool_);
    vm.core.none = Some(none);
    vm.core.str_ = Some(str_);
    vm.core.bytes = Some(bytes);
    vm.core.tuple = Some(tuple);
    vm.core.list = Some(list);
    vm.core.dict = Some(dict);
    vm.core.set = Some(set);
    vm.core.function = Some(function);
    vm.core.module = Some(module);
    vm.core.generator = Some(generator);
    vm.core.range = Some(range);
    vm.core.type_ = Some(type_);

    // String methods.
    add_method(vm, str_, "upper", "Uppercased copy.", str_upper);
    add_method(vm, str_, "lower", "Lowercased copy.", str_lower);
    add_method(vm, str_, "strip", "Copy with surrounding whitespace removed.", str_strip);
    add_method(vm, str_, "split", "Split on whitespace or a separator.", str_split);
    add_method(vm, str_, "join", "Concatenate an iterable of strings.", str_join);
    add_method(vm, str_, "startswith", "True if the string starts with the prefix.", str_startswith);
    add_method(vm, str_, "endswith", "True if the string ends with the suffix.", str_endswith);
    add_method(vm, str_, "replace", "Copy with occurrences replaced.", str_replace);
    add_method(vm, str_, "find", "Index of a substring, or -1.", str_find);
    add_method(vm, str_, "encode", "UTF-8 bytes of the string.", str_encode);

    // Bytes methods.
    add_method(vm, bytes, "decode", "Decode UTF-8 bytes to a string.", bytes_decode);

    // List methods.
    add_method(vm, list, "append", "Append a value.", list_append);
    add_method(vm, list, "insert", "Insert a value at an index.", list_insert);
    add_method(vm, list, "pop", "Remove and return an element (default last).", list_pop);
    add_method(vm, list, "remove", "Remove the first equal element.", list_remove);
    add_method(vm, list, "extend", "Append every element of an iterable.", list_extend);
    add_method(vm, list, "index", "Index of the first equal element.", list_index);
    add_method(vm, list, "count", "Number of equal elements.", list_count);
    add_method(vm, list, "reverse", "Reverse in place.", list_reverse);
    add_method(vm, list, "sort", "Sort in place.", list_sort);
    add_method(vm, list, "clear", "Remove all elements.", list_clear);
    add_method(vm, list, "copy", "Shallow copy.", list_copy);

    // Tuple methods.
    add_method(vm, tuple, "count", "Number of equal elements.", tuple_count);
    add_method(vm, tuple, "index", "Index of the first equal element.", tuple_index);

    // Dict methods.
    add_method(vm, dict, "get", "Value for a key, or a default.", dict_get_method);
    add_method(vm, dict, "keys", "List of keys.", dict_keys);
    add_method(vm, dict, "values", "List of values.", dict_values);
    add_method(vm, dict, "items", "List of (key, value) tuples.", dict_items);
    add_method(vm, dict, "pop", "Remove a key and return its value.", dict_pop);
    add_method(vm, dict, "clear", "Remove all entries.", dict_clear);
    add_method(vm, dict, "copy", "Shallow copy.", dict_copy);
    add_method(vm, dict, "update", "Insert every entry of another dict.", dict_update);

    // Set methods.
    add_method(vm, set, "add", "Add a member.", set_add);
    add_method(vm, set, "remove", "Remove a member; KeyError if missing.", set_remove);
    add_method(vm, set, "discard", "Remove a member if present.", set_discard);
    add_method(vm, set, "clear", "Remove all members.", set_clear);

    // Finalize everything (computes cached slots, registers subclasses).
    for class in [
        object, int, float, bool_, none, str_, bytes, tuple, list, dict, set, function, module, generator, range,
        type_,
    ] {
        let _ = vm.finalize_class(class);
    }

    // The value-constructing classes are reachable as globals.
    for (name, class) in [
        ("object", object),
        ("int", int),
        ("float", float),
        ("bool", bool_),
        ("str", str_),
        ("bytes", bytes),
        ("tuple", tuple),
        ("list", list),
        ("dict", dict),
        ("set", set),
        ("type", type_),
    ] {
        let name_id = vm.intern(name);
        vm.builtins.insert(name_id, Value::Ref(class));
    }
}

// ======================================================================
// Exception classes
// ======================================================================

fn install_exception_classes(vm: &mut Vm) {
    // Declaration order guarantees parents are created first.
    for exc_type in ExcType::iter() {
        let base = match exc_type.parent() {
            Some(parent) => Some(vm.exc_classes[&parent]),
            None => vm.core.object,
        };
        let name: &'static str = exc_type.into();
        let class = new_class(vm, name, base);
        let _ = vm.finalize_class(class);
        vm.exc_classes.insert(exc_type, class);
        let name_id = vm.intern(name);
        vm.builtins.insert(name_id, Value::Ref(class));
    }
    // Compatibility alias.
    let io_error = vm.intern("IOError");
    let os_error = vm.exc_classes[&ExcType::OSError];
    vm.builtins.insert(io_error, Value::Ref(os_error));
}

// ======================================================================
// Builtin functions
// ======================================================================

fn add_function(vm: &mut Vm, name: &'static str, doc: &'static str, func: object::NativeFn) {
    let native = vm.heap.alloc(HeapData::Native(NativeFunction {
        name,
        doc,
        kind: NativeKind::Function,
        func,
    }));
    let name_id = vm.intern(name);
    vm.builtins.insert(name_id, Value::Ref(native));
}

fn install_builtin_functions(vm: &mut Vm) {
    add_function(vm, "print", "Write values to the output stream.", builtin_print);
    add_function(vm, "len", "Number of elements in a container.", builtin_len);
    add_function(vm, "repr", "Canonical representation of a value.", builtin_repr);
    add_function(vm, "isinstance", "True if the value is an instance of the class.", builtin_isinstance);
    add_function(vm, "issubclass", "True if the class derives from the other.", builtin_issubclass);
    add_function(vm, "hash", "Hash of a value.", builtin_hash);
    add_function(vm, "id", "Identity of a value.", builtin_id);
    add_function(vm, "ord", "Code point of a one-character string.", builtin_ord);
    add_function(vm, "chr", "One-character string for a code point.", builtin_chr);
    add_function(vm, "range", "Lazy integer range.", builtin_range);
    add_function(vm, "abs", "Absolute value.", builtin_abs);
    add_function(vm, "min", "Smallest argument or element.", builtin_min);
    add_function(vm, "max", "Largest argument or element.", builtin_max);
    add_function(vm, "sum", "Sum of an iterable.", builtin_sum);
    add_function(vm, "any", "True if any element is truthy.", builtin_any);
    add_function(vm, "all", "True if every element is truthy.", builtin_all);
    add_function(vm, "sorted", "Sorted list of an iterable.", builtin_sorted);
    add_function(vm, "getattr", "Attribute by name, with optional default.", builtin_getattr);
    add_function(vm, "setattr", "Set an attribute by name.", builtin_setattr);
    add_function(vm, "hasattr", "True if the attribute exists.", builtin_hasattr);
    add_function(vm, "dir", "Attribute names of a value.", builtin_dir);
}

fn arg(args: &NativeArgs, index: usize, func: &str) -> VmResult<Value> {
    args.args.get(index).copied().ok_or_else(|| {
        VmErr::Pending(
            ExcType::ArgumentError,
            format!("{func}() missing required argument {}", index + 1),
        )
    })
}

fn builtin_print(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let mut sep = " ".to_owned();
    let mut end = "\n".to_owned();
    let sep_name = vm.intern("sep");
    let end_name = vm.intern("end");
    for (name, value) in &args.kwargs {
        if *name == sep_name {
            sep = vm.value_str(*value)?;
        } else if *name == end_name {
            end = vm.value_str(*value)?;
        } else {
            let text = vm.name_str(*name);
            return Err(VmErr::type_error(format!(
                "'{text}' is an invalid keyword argument for print()"
            )));
        }
    }
    let mut out = String::new();
    for (index, value) in args.args.iter().enumerate() {
        if index > 0 {
            out.push_str(&sep);
        }
        out.push_str(&vm.value_str(*value)?);
    }
    out.push_str(&end);
    vm.out.write_str(&out);
    Ok(Value::None)
}

fn builtin_len(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "len")?;
    let length = match value.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(s)) => Some(s.char_len()),
        Some(HeapData::Bytes(b)) => Some(b.len()),
        Some(HeapData::Tuple(t)) => Some(t.items.len()),
        Some(HeapData::List(l)) => Some(l.items.len()),
        Some(HeapData::Dict(d)) => Some(d.len()),
        Some(HeapData::Set(s)) => Some(s.len()),
        Some(HeapData::Instance(_)) => None,
        _ => None,
    };
    if let Some(length) = length {
        return Ok(Value::Int(length as i64));
    }
    // __len__ on instances.
    if let Some(class) = vm.class_of(value) {
        if let Some(method) = vm.lookup_method(class, vm.names.len) {
            let bound = vm.bind_if_method(value, method);
            let result = vm.call_function(bound, Vec::new(), Vec::new())?;
            return match result.coerce_int() {
                Some(n) if n >= 0 => Ok(Value::Int(n)),
                _ => Err(VmErr::type_error("__len__ should return a non-negative int")),
            };
        }
    }
    Err(VmErr::type_error(format!(
        "object of type '{}' has no len()",
        vm.type_name_of(value)
    )))
}

fn builtin_repr(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "repr")?;
    let text = vm.value_repr(value)?;
    Ok(vm.intern_value(&text))
}

fn builtin_isinstance(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "isinstance")?;
    let filter = arg(&args, 1, "isinstance")?;
    Ok(Value::Bool(isinstance_filter(vm, value, filter)?))
}

fn isinstance_filter(vm: &mut Vm, value: Value, filter: Value) -> VmResult<bool> {
    match filter.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Class(_)) => Ok(vm.isinstance(value, filter.as_ref_id().expect("checked"))),
        Some(HeapData::Tuple(tuple)) => {
            let items = tuple.items.clone();
            for item in items {
                if isinstance_filter(vm, value, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(VmErr::type_error(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

fn builtin_issubclass(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let sub = arg(&args, 0, "issubclass")?;
    let sup = arg(&args, 1, "issubclass")?;
    let (Some(sub_id), Some(sup_id)) = (sub.as_ref_id(), sup.as_ref_id()) else {
        return Err(VmErr::type_error("issubclass() arguments must be classes"));
    };
    if !matches!(vm.heap.get(sub_id), HeapData::Class(_)) || !matches!(vm.heap.get(sup_id), HeapData::Class(_)) {
        return Err(VmErr::type_error("issubclass() arguments must be classes"));
    }
    let mut current = Some(sub_id);
    while let Some(class) = current {
        if class == sup_id {
            return Ok(Value::Bool(true));
        }
        current = match vm.heap.get(class) {
            HeapData::Class(c) => c.base,
            _ => None,
        };
    }
    Ok(Value::Bool(false))
}

fn builtin_hash(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "hash")?;
    let hash = vm.hash_value(value)?;
    Ok(Value::Int(hash as i64))
}

fn builtin_id(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "id")?;
    let id = match value {
        Value::Ref(id) => id.index() as i64 + 16,
        Value::None => 1,
        Value::NotImplemented => 2,
        Value::Bool(b) => 3 + i64::from(b),
        other => object::py_hash(&vm.heap, other).unwrap_or(5) as i64,
    };
    Ok(Value::Int(id))
}

fn builtin_ord(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "ord")?;
    match value.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(s)) if s.char_len() == 1 => {
            let ch = s.nth_char(0).expect("length checked");
            Ok(Value::Int(i64::from(ch as u32)))
        }
        _ => Err(VmErr::type_error("ord() expects a one-character string")),
    }
}

fn builtin_chr(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "chr")?;
    let Some(code) = value.coerce_int() else {
        return Err(VmErr::type_error("chr() expects an integer"));
    };
    let ch = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| VmErr::value_error("chr() arg not in range"))?;
    let mut buffer = [0u8; 4];
    let text = ch.encode_utf8(&mut buffer).to_owned();
    Ok(vm.intern_value(&text))
}

fn builtin_range(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let ints: Vec<i64> = args
        .args
        .iter()
        .map(|value| {
            value
                .coerce_int()
                .ok_or_else(|| VmErr::type_error("range() arguments must be integers"))
        })
        .collect::<VmResult<_>>()?;
    let range = match ints.as_slice() {
        [stop] => Range {
            start: 0,
            stop: *stop,
            step: 1,
        },
        [start, stop] => Range {
            start: *start,
            stop: *stop,
            step: 1,
        },
        [start, stop, step] => {
            if *step == 0 {
                return Err(VmErr::value_error("range() step must not be zero"));
            }
            Range {
                start: *start,
                stop: *stop,
                step: *step,
            }
        }
        _ => {
            return Err(VmErr::Pending(
                ExcType::ArgumentError,
                "range() takes 1 to 3 arguments".to_owned(),
            ));
        }
    };
    let id = vm.heap.alloc(HeapData::Range(range));
    Ok(Value::Ref(id))
}

fn builtin_abs(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let value = arg(&args, 0, "abs")?;
    match value {
        Value::Int(i) => Ok(match i.checked_abs() {
            Some(v) => Value::Int(v),
            None => vm.bigint_value(-num_bigint::BigInt::from(i)),
        }),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::BigInt(big) => {
                let result = num_traits::Signed::abs(big);
                Ok(vm.bigint_value(result))
            }
            _ => Err(VmErr::type_error("bad operand type for abs()")),
        },
        _ => Err(VmErr::type_error("bad operand type for abs()")),
    }
}

fn extreme(vm: &mut Vm, args: NativeArgs, want_greater: bool, func: &str) -> VmResult<Value> {
    let candidates = if args.args.len() == 1 {
        vm.iterable_to_vec(args.args[0])?
    } else {
        args.args.clone()
    };
    let mut best = match candidates.first() {
        Some(first) => *first,
        None => return Err(VmErr::value_error(format!("{func}() arg is an empty sequence"))),
    };
    for candidate in candidates.into_iter().skip(1) {
        let is_better = if want_greater {
            vm.compare_op(crate::bytecode::op::GREATER, candidate, best)?
        } else {
            vm.compare_op(crate::bytecode::op::LESS, candidate, best)?
        };
        if is_better {
            best = candidate;
        }
    }
    Ok(best)
}

fn builtin_min(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    extreme(vm, args, false, "min")
}

fn builtin_max(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    extreme(vm, args, true, "max")
}

fn builtin_sum(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let items = vm.iterable_to_vec(arg(&args, 0, "sum")?)?;
    let mut total = args.args.get(1).copied().unwrap_or(Value::Int(0));
    for item in items {
        total = vm.binary_op(crate::bytecode::op::ADD, total, item)?;
    }
    Ok(total)
}

fn builtin_any(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let items = vm.iterable_to_vec(arg(&args, 0, "any")?)?;
    Ok(Value::Bool(
        items.into_iter().any(|item| object::py_truthy(&vm.heap, item)),
    ))
}

fn builtin_all(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let items = vm.iterable_to_vec(arg(&args, 0, "all")?)?;
    Ok(Value::Bool(
        items.into_iter().all(|item| object::py_truthy(&vm.heap, item)),
    ))
}

fn builtin_sorted(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let mut items = vm.iterable_to_vec(arg(&args, 0, "sorted")?)?;
    let mut error = None;
    items.sort_by(|a, b| match object::py_cmp(&vm.heap, *a, *b) {
        Some(ordering) => ordering,
        None => {
            error = Some(VmErr::type_error("unorderable types in sorted()"));
            std::cmp::Ordering::Equal
        }
    });
    if let Some(err) = error {
        return Err(err);
    }
    let id = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(id))
}

fn attr_name_id(vm: &mut Vm, value: Value) -> VmResult<HeapId> {
    match value.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(s)) => {
            let text = s.as_str().to_owned();
            Ok(vm.intern(&text))
        }
        _ => Err(VmErr::type_error("attribute name must be a string")),
    }
}

fn builtin_getattr(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let obj = arg(&args, 0, "getattr")?;
    let name = attr_name_id(vm, arg(&args, 1, "getattr")?)?;
    let attr = vm.get_attribute(obj, name);
    match attr {
        Ok(value) => Ok(value),
        Err(err) => match args.args.get(2) {
            Some(default) => Ok(*default),
            None => Err(err),
        },
    }
}

fn builtin_setattr(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let obj = arg(&args, 0, "setattr")?;
    let name = attr_name_id(vm, arg(&args, 1, "setattr")?)?;
    let value = arg(&args, 2, "setattr")?;
    vm.set_attribute(obj, name, value)?;
    Ok(Value::None)
}

fn builtin_hasattr(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let obj = arg(&args, 0, "hasattr")?;
    let name = attr_name_id(vm, arg(&args, 1, "hasattr")?)?;
    Ok(Value::Bool(vm.get_attribute(obj, name).is_ok()))
}

fn builtin_dir(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let obj = arg(&args, 0, "dir")?;
    let mut names: Vec<String> = Vec::new();
    if let Some(id) = obj.as_ref_id() {
        match vm.heap.get(id) {
            HeapData::Instance(instance) => {
                for key in instance.fields.keys() {
                    names.push(vm.name_str(*key));
                }
            }
            HeapData::Module(module) => {
                for key in module.fields.keys() {
                    names.push(vm.name_str(*key));
                }
            }
            _ => {}
        }
    }
    let mut class = vm.class_of(obj);
    while let Some(class_id) = class {
        match vm.heap.get(class_id) {
            HeapData::Class(c) => {
                for key in c.methods.keys() {
                    names.push(vm.name_str(*key));
                }
                class = c.base;
            }
            _ => break,
        }
    }
    names.sort();
    names.dedup();
    let items: Vec<Value> = names.iter().map(|name| vm.intern_value(name)).collect();
    let id = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(id))
}

// ======================================================================
// Core-class constructors
// ======================================================================

/// True if calling the class constructs a builtin value rather than an
/// instance.
pub(crate) fn is_constructor_class(vm: &Vm, class_id: HeapId) -> bool {
    let core = &vm.core;
    [
        core.int, core.float, core.bool_, core.str_, core.bytes, core.tuple, core.list, core.dict, core.set,
        core.type_,
    ]
    .iter()
    .any(|candidate| *candidate == Some(class_id))
}

/// Value construction for the builtin classes (`int(...)`, `list(...)`, ...).
/// Returns `None` when the class is an ordinary user class.
pub(crate) fn construct_core(
    vm: &mut Vm,
    class_id: HeapId,
    args: &NativeArgs,
) -> Option<VmResult<Value>> {
    let core = &vm.core;
    if Some(class_id) == core.int {
        Some(construct_int(vm, args))
    } else if Some(class_id) == core.float {
        Some(construct_float(vm, args))
    } else if Some(class_id) == core.bool_ {
        Some(construct_bool(vm, args))
    } else if Some(class_id) == core.str_ {
        Some(construct_str(vm, args))
    } else if Some(class_id) == core.bytes {
        Some(construct_bytes(vm, args))
    } else if Some(class_id) == core.tuple {
        Some(construct_tuple(vm, args))
    } else if Some(class_id) == core.list {
        Some(construct_list(vm, args))
    } else if Some(class_id) == core.dict {
        Some(construct_dict(vm, args))
    } else if Some(class_id) == core.set {
        Some(construct_set(vm, args))
    } else if Some(class_id) == core.type_ {
        Some(construct_type(vm, args))
    } else {
        None
    }
}

fn construct_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let Some(value) = args.args.first() else {
        return Ok(Value::Int(0));
    };
    match *value {
        Value::Int(_) => Ok(*value),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::BigInt(_) => Ok(*value),
            HeapData::Str(s) => {
                let text = s.as_str().trim().to_owned();
                if let Ok(parsed) = text.parse::<i64>() {
                    Ok(Value::Int(parsed))
                } else {
                    match num_bigint::BigInt::parse_bytes(text.as_bytes(), 10) {
                        Some(big) => Ok(vm.bigint_value(big)),
                        None => Err(VmErr::value_error(format!(
                            "invalid literal for int() with base 10: '{text}'"
                        ))),
                    }
                }
            }
            _ => Err(VmErr::type_error("int() argument must be a number or string")),
        },
        _ => Err(VmErr::type_error("int() argument must be a number or string")),
    }
}

fn construct_float(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let Some(value) = args.args.first() else {
        return Ok(Value::Float(0.0));
    };
    if let Some(f) = value.coerce_float() {
        return Ok(Value::Float(f));
    }
    match value.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(s)) => s
            .as_str()
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| VmErr::value_error("could not convert string to float")),
        Some(HeapData::BigInt(big)) => Ok(Value::Float(
            num_traits::ToPrimitive::to_f64(big).unwrap_or(f64::INFINITY),
        )),
        _ => Err(VmErr::type_error("float() argument must be a number or string")),
    }
}

fn construct_bool(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let value = args.args.first().copied().unwrap_or(Value::Bool(false));
    Ok(Value::Bool(object::py_truthy(&vm.heap, value)))
}

fn construct_str(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let Some(value) = args.args.first() else {
        return Ok(vm.intern_value(""));
    };
    let text = vm.value_str(*value)?;
    Ok(vm.intern_value(&text))
}

fn construct_bytes(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let Some(value) = args.args.first() else {
        let id = vm.heap.alloc(HeapData::Bytes(object::Bytes::new(Vec::new())));
        return Ok(Value::Ref(id));
    };
    let data = match value.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Bytes(b)) => b.as_slice().to_vec(),
        Some(HeapData::Str(_)) => {
            return Err(VmErr::type_error("string argument without an encoding"));
        }
        _ => {
            let items = vm.iterable_to_vec(*value)?;
            let mut data = Vec::with_capacity(items.len());
            for item in items {
                let byte = item
                    .coerce_int()
                    .filter(|i| (0..=255).contains(i))
                    .ok_or_else(|| VmErr::value_error("bytes must be in range(0, 256)"))?;
                data.push(byte as u8);
            }
            data
        }
    };
    let id = vm.heap.alloc(HeapData::Bytes(object::Bytes::new(data)));
    Ok(Value::Ref(id))
}

fn construct_tuple(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let items = match args.args.first() {
        Some(value) => vm.iterable_to_vec(*value)?,
        None => Vec::new(),
    };
    let id = vm.heap.alloc(HeapData::Tuple(object::Tuple::new(items)));
    Ok(Value::Ref(id))
}

fn construct_list(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let items = match args.args.first() {
        Some(value) => vm.iterable_to_vec(*value)?,
        None => Vec::new(),
    };
    let id = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(id))
}

fn construct_dict(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let id = vm.heap.alloc(HeapData::Dict(object::Dict::new()));
    if let Some(value) = args.args.first() {
        match value.as_ref_id().map(|vid| vm.heap.get(vid)) {
            Some(HeapData::Dict(dict)) => {
                let entries = dict.entries();
                for (key, item) in entries {
                    vm.dict_insert(id, key, item)?;
                }
            }
            _ => {
                let pairs = vm.iterable_to_vec(*value)?;
                for pair in pairs {
                    let items = vm.iterable_to_vec(pair)?;
                    let [key, item] = items.as_slice() else {
                        return Err(VmErr::value_error("dict update sequence elements must be pairs"));
                    };
                    vm.dict_insert(id, *key, *item)?;
                }
            }
        }
    }
    for (name, value) in &args.kwargs {
        vm.dict_insert(id, Value::Ref(*name), *value)?;
    }
    Ok(Value::Ref(id))
}

fn construct_set(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    let id = vm.heap.alloc(HeapData::Set(object::Set::new()));
    if let Some(value) = args.args.first() {
        let items = vm.iterable_to_vec(*value)?;
        for item in items {
            vm.set_insert(id, item)?;
        }
    }
    Ok(Value::Ref(id))
}

fn construct_type(vm: &mut Vm, args: &NativeArgs) -> VmResult<Value> {
    match args.args.len() {
        1 => {
            let class = vm
                .class_of(args.args[0])
                .ok_or_else(|| VmErr::type_error("type() of an untyped value"))?;
            Ok(Value::Ref(class))
        }
        3 => Err(VmErr::not_implemented("type() with three arguments is not implemented")),
        _ => Err(VmErr::Pending(
            ExcType::ArgumentError,
            "type() takes 1 or 3 arguments".to_owned(),
        )),
    }
}

// ======================================================================
// String methods
// ======================================================================

fn receiver_str(vm: &Vm, args: &NativeArgs, func: &str) -> VmResult<String> {
    match args.args.first().and_then(Value::as_ref_id).map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(s)) => Ok(s.as_str().to_owned()),
        _ => Err(VmErr::type_error(format!("{func}() requires a string receiver"))),
    }
}

fn str_upper(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "upper")?.to_uppercase();
    Ok(vm.intern_value(&text))
}

fn str_lower(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "lower")?.to_lowercase();
    Ok(vm.intern_value(&text))
}

fn str_strip(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "strip")?;
    Ok(vm.intern_value(text.trim()))
}

fn str_split(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "split")?;
    let parts: Vec<String> = match args.args.get(1).and_then(Value::as_ref_id).map(|id| vm.heap.get(id)) {
        Some(HeapData::Str(sep)) => text.split(sep.as_str()).map(str::to_owned).collect(),
        _ => text.split_whitespace().map(str::to_owned).collect(),
    };
    let items: Vec<Value> = parts.iter().map(|part| vm.intern_value(part)).collect();
    let id = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(id))
}

fn str_join(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let separator = receiver_str(vm, &args, "join")?;
    let iterable = arg(&args, 1, "join")?;
    let items = vm.iterable_to_vec(iterable)?;
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(&separator);
        }
        match item.as_ref_id().map(|id| vm.heap.get(id)) {
            Some(HeapData::Str(s)) => out.push_str(s.as_str()),
            _ => return Err(VmErr::type_error("join() requires an iterable of strings")),
        }
    }
    Ok(vm.intern_value(&out))
}

fn str_startswith(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "startswith")?;
    let prefix = receiver_str(vm, &NativeArgs { args: vec![arg(&args, 1, "startswith")?], kwargs: Vec::new() }, "startswith")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn str_endswith(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "endswith")?;
    let suffix = receiver_str(vm, &NativeArgs { args: vec![arg(&args, 1, "endswith")?], kwargs: Vec::new() }, "endswith")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn str_replace(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "replace")?;
    let from = receiver_str(vm, &NativeArgs { args: vec![arg(&args, 1, "replace")?], kwargs: Vec::new() }, "replace")?;
    let to = receiver_str(vm, &NativeArgs { args: vec![arg(&args, 2, "replace")?], kwargs: Vec::new() }, "replace")?;
    let result = text.replace(&from, &to);
    Ok(vm.intern_value(&result))
}

fn str_find(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "find")?;
    let needle = receiver_str(vm, &NativeArgs { args: vec![arg(&args, 1, "find")?], kwargs: Vec::new() }, "find")?;
    match text.find(&needle) {
        Some(byte_index) => {
            let char_index = text[..byte_index].chars().count();
            Ok(Value::Int(char_index as i64))
        }
        None => Ok(Value::Int(-1)),
    }
}

fn str_encode(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let text = receiver_str(vm, &args, "encode")?;
    let id = vm.heap.alloc(HeapData::Bytes(object::Bytes::new(text.into_bytes())));
    Ok(Value::Ref(id))
}

fn bytes_decode(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let data = match args.args.first().and_then(Value::as_ref_id).map(|id| vm.heap.get(id)) {
        Some(HeapData::Bytes(b)) => b.as_slice().to_vec(),
        _ => return Err(VmErr::type_error("decode() requires a bytes receiver")),
    };
    match String::from_utf8(data) {
        Ok(text) => Ok(vm.intern_value(&text)),
        Err(_) => Err(VmErr::value_error("invalid UTF-8 in bytes")),
    }
}

// ======================================================================
// List methods
// ======================================================================

fn receiver_list(args: &NativeArgs, func: &str) -> VmResult<HeapId> {
    args.args
        .first()
        .and_then(Value::as_ref_id)
        .ok_or_else(|| VmErr::type_error(format!("{func}() requires a list receiver")))
}

fn list_append(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "append")?;
    let value = arg(&args, 1, "append")?;
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            list.items.push(value);
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("append() requires a list receiver")),
    }
}

fn list_insert(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "insert")?;
    let index = arg(&args, 1, "insert")?
        .coerce_int()
        .ok_or_else(|| VmErr::type_error("insert() index must be an integer"))?;
    let value = arg(&args, 2, "insert")?;
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            let len = list.items.len() as i64;
            let position = index.clamp(-len, len);
            let position = if position < 0 { position + len } else { position };
            list.items.insert(position as usize, value);
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("insert() requires a list receiver")),
    }
}

fn list_pop(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "pop")?;
    let index = match args.args.get(1) {
        Some(value) => value
            .coerce_int()
            .ok_or_else(|| VmErr::type_error("pop() index must be an integer"))?,
        None => -1,
    };
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            let len = list.items.len() as i64;
            let position = if index < 0 { index + len } else { index };
            if position < 0 || position >= len {
                return Err(VmErr::index_error("pop index out of range"));
            }
            Ok(list.items.remove(position as usize))
        }
        _ => Err(VmErr::type_error("pop() requires a list receiver")),
    }
}

fn list_remove(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "remove")?;
    let needle = arg(&args, 1, "remove")?;
    let items = match vm.heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => return Err(VmErr::type_error("remove() requires a list receiver")),
    };
    for (index, item) in items.iter().enumerate() {
        if vm.values_equal(*item, needle)? {
            if let HeapData::List(list) = vm.heap.get_mut(id) {
                list.items.remove(index);
            }
            return Ok(Value::None);
        }
    }
    Err(VmErr::value_error("list.remove(x): x not in list"))
}

fn list_extend(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "extend")?;
    let extra = vm.iterable_to_vec(arg(&args, 1, "extend")?)?;
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            list.items.extend(extra);
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("extend() requires a list receiver")),
    }
}

fn list_index(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "index")?;
    let needle = arg(&args, 1, "index")?;
    let items = match vm.heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => return Err(VmErr::type_error("index() requires a list receiver")),
    };
    for (index, item) in items.iter().enumerate() {
        if vm.values_equal(*item, needle)? {
            return Ok(Value::Int(index as i64));
        }
    }
    Err(VmErr::value_error("value not in list"))
}

fn list_count(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "count")?;
    let needle = arg(&args, 1, "count")?;
    let items = match vm.heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => return Err(VmErr::type_error("count() requires a list receiver")),
    };
    let mut count = 0i64;
    for item in items {
        if vm.values_equal(item, needle)? {
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

fn list_reverse(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "reverse")?;
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            list.items.reverse();
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("reverse() requires a list receiver")),
    }
}

fn list_sort(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "sort")?;
    let mut items = match vm.heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => return Err(VmErr::type_error("sort() requires a list receiver")),
    };
    let mut error = None;
    items.sort_by(|a, b| match object::py_cmp(&vm.heap, *a, *b) {
        Some(ordering) => ordering,
        None => {
            error = Some(VmErr::type_error("unorderable types in sort()"));
            std::cmp::Ordering::Equal
        }
    });
    if let Some(err) = error {
        return Err(err);
    }
    if let HeapData::List(list) = vm.heap.get_mut(id) {
        list.items = items;
    }
    Ok(Value::None)
}

fn list_clear(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "clear")?;
    match vm.heap.get_mut(id) {
        HeapData::List(list) => {
            list.items.clear();
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("clear() requires a list receiver")),
    }
}

fn list_copy(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "copy")?;
    let items = match vm.heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => return Err(VmErr::type_error("copy() requires a list receiver")),
    };
    let new = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(new))
}

// ======================================================================
// Tuple methods
// ======================================================================

fn tuple_count(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "count")?;
    let needle = arg(&args, 1, "count")?;
    let items = match vm.heap.get(id) {
        HeapData::Tuple(tuple) => tuple.items.clone(),
        _ => return Err(VmErr::type_error("count() requires a tuple receiver")),
    };
    let mut count = 0i64;
    for item in items {
        if vm.values_equal(item, needle)? {
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

fn tuple_index(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_list(&args, "index")?;
    let needle = arg(&args, 1, "index")?;
    let items = match vm.heap.get(id) {
        HeapData::Tuple(tuple) => tuple.items.clone(),
        _ => return Err(VmErr::type_error("index() requires a tuple receiver")),
    };
    for (index, item) in items.iter().enumerate() {
        if vm.values_equal(*item, needle)? {
            return Ok(Value::Int(index as i64));
        }
    }
    Err(VmErr::value_error("value not in tuple"))
}

// ======================================================================
// Dict methods
// ======================================================================

fn receiver_dict(args: &NativeArgs, func: &str) -> VmResult<HeapId> {
    args.args
        .first()
        .and_then(Value::as_ref_id)
        .ok_or_else(|| VmErr::type_error(format!("{func}() requires a dict receiver")))
}

fn dict_get_method(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "get")?;
    let key = arg(&args, 1, "get")?;
    let default = args.args.get(2).copied().unwrap_or(Value::None);
    Ok(vm.dict_get(id, key)?.unwrap_or(default))
}

fn dict_keys(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "keys")?;
    let keys: Vec<Value> = match vm.heap.get(id) {
        HeapData::Dict(dict) => dict.entries().into_iter().map(|(k, _)| k).collect(),
        _ => return Err(VmErr::type_error("keys() requires a dict receiver")),
    };
    let new = vm.heap.alloc(HeapData::List(object::List::new(keys)));
    Ok(Value::Ref(new))
}

fn dict_values(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "values")?;
    let values: Vec<Value> = match vm.heap.get(id) {
        HeapData::Dict(dict) => dict.entries().into_iter().map(|(_, v)| v).collect(),
        _ => return Err(VmErr::type_error("values() requires a dict receiver")),
    };
    let new = vm.heap.alloc(HeapData::List(object::List::new(values)));
    Ok(Value::Ref(new))
}

fn dict_items(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "items")?;
    let entries = match vm.heap.get(id) {
        HeapData::Dict(dict) => dict.entries(),
        _ => return Err(VmErr::type_error("items() requires a dict receiver")),
    };
    let mut items = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let pair = vm.heap.alloc(HeapData::Tuple(object::Tuple::new(vec![key, value])));
        items.push(Value::Ref(pair));
    }
    let new = vm.heap.alloc(HeapData::List(object::List::new(items)));
    Ok(Value::Ref(new))
}

fn dict_pop(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "pop")?;
    let key = arg(&args, 1, "pop")?;
    match vm.dict_remove(id, key)? {
        Some(value) => Ok(value),
        None => match args.args.get(2) {
            Some(default) => Ok(*default),
            None => {
                let repr = vm.value_repr(key)?;
                Err(VmErr::key_error(repr))
            }
        },
    }
}

fn dict_clear(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "clear")?;
    match vm.heap.get_mut(id) {
        HeapData::Dict(dict) => {
            *dict = object::Dict::new();
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("clear() requires a dict receiver")),
    }
}

fn dict_copy(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "copy")?;
    let entries = match vm.heap.get(id) {
        HeapData::Dict(dict) => dict.entries(),
        _ => return Err(VmErr::type_error("copy() requires a dict receiver")),
    };
    let new = vm.heap.alloc(HeapData::Dict(object::Dict::new()));
    for (key, value) in entries {
        vm.dict_insert(new, key, value)?;
    }
    Ok(Value::Ref(new))
}

fn dict_update(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_dict(&args, "update")?;
    let other = arg(&args, 1, "update")?;
    let entries = match other.as_ref_id().map(|oid| vm.heap.get(oid)) {
        Some(HeapData::Dict(dict)) => dict.entries(),
        _ => return Err(VmErr::type_error("update() requires a dict argument")),
    };
    for (key, value) in entries {
        vm.dict_insert(id, key, value)?;
    }
    Ok(Value::None)
}

// ======================================================================
// Set methods
// ======================================================================

fn receiver_set(args: &NativeArgs, func: &str) -> VmResult<HeapId> {
    args.args
        .first()
        .and_then(Value::as_ref_id)
        .ok_or_else(|| VmErr::type_error(format!("{func}() requires a set receiver")))
}

fn set_add(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_set(&args, "add")?;
    let value = arg(&args, 1, "add")?;
    vm.set_insert(id, value)?;
    Ok(Value::None)
}

fn set_remove(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_set(&args, "remove")?;
    let value = arg(&args, 1, "remove")?;
    let hash = vm.hash_value(value)?;
    let removed = vm.heap.with_data(id, |heap, data| match data {
        HeapData::Set(set) => set.remove_hashed(heap, hash, value),
        _ => false,
    });
    if removed {
        Ok(Value::None)
    } else {
        let repr = vm.value_repr(value)?;
        Err(VmErr::key_error(repr))
    }
}

fn set_discard(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_set(&args, "discard")?;
    let value = arg(&args, 1, "discard")?;
    let hash = vm.hash_value(value)?;
    vm.heap.with_data(id, |heap, data| {
        if let HeapData::Set(set) = data {
            set.remove_hashed(heap, hash, value);
        }
    });
    Ok(Value::None)
}

fn set_clear(vm: &mut Vm, args: NativeArgs) -> VmResult<Value> {
    let id = receiver_set(&args, "clear")?;
    match vm.heap.get_mut(id) {
        HeapData::Set(set) => {
            *set = object::Set::new();
            Ok(Value::None)
        }
        _ => Err(VmErr::type_error("clear() requires a set receiver")),
    }
}
