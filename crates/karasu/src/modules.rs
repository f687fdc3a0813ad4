//! Module resolution and the native-module binding surface.
//!
//! `import a.b.c` loads the chain `a`, `a.b`, `a.b.c`, caching each module
//! under its dotted name and attaching children to their parents. Source
//! modules are searched along `KARASU_PATH` (colon-separated; semicolons on
//! Windows) and executed on first import; native modules register an onload
//! hook that builds a fresh module instance.

use std::path::PathBuf;

use crate::exceptions::{ExcType, VmErr, VmResult};
use crate::heap::HeapId;
use crate::object::{HeapData, Module, NativeFunction, NativeKind};
use crate::value::Value;
use crate::vm::Vm;

/// Source file extension.
pub const SOURCE_EXTENSION: &str = "krs";

/// Builds the module search path from the environment.
#[must_use]
pub fn search_path() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let separator = if cfg!(windows) { ';' } else { ':' };
    if let Ok(var) = std::env::var("KARASU_PATH") {
        for part in var.split(separator) {
            if !part.is_empty() {
                paths.push(PathBuf::from(part));
            }
        }
    }
    paths.push(PathBuf::from("."));
    paths
}

/// Imports a dotted module chain, returning the root module.
///
/// Each segment is cached under its dotted prefix and bound as an attribute
/// of its parent, so `import a.b.c` makes `a.b.c` reachable from `a`.
pub fn import_module(vm: &mut Vm, dotted: &str) -> VmResult<Value> {
    let mut root = None;
    let mut parent: Option<Value> = None;
    let mut prefix = String::new();
    for segment in dotted.split('.') {
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(segment);
        let module = load_module(vm, &prefix)?;
        if let Some(parent_value) = parent {
            let name = vm.intern(segment);
            if let Some(parent_id) = parent_value.as_ref_id() {
                if let HeapData::Module(parent_module) = vm.heap.get_mut(parent_id) {
                    parent_module.fields.insert(name, module);
                }
            }
        }
        if root.is_none() {
            root = Some(module);
        }
        parent = Some(module);
    }
    root.ok_or_else(|| VmErr::import_error("empty module name"))
}

/// Loads one module (cached, native, or from source).
fn load_module(vm: &mut Vm, dotted: &str) -> VmResult<Value> {
    if let Some(module) = vm.modules.get(dotted) {
        return Ok(*module);
    }

    // Native modules first.
    if let Some(onload) = native_onload(dotted) {
        let id = onload(vm);
        let module = Value::Ref(id);
        vm.modules.insert(dotted.to_owned(), module);
        return Ok(module);
    }

    // Then the filesystem.
    let relative: PathBuf = dotted.split('.').collect();
    for base in vm.module_paths.clone() {
        let candidate = base.join(&relative).with_extension(SOURCE_EXTENSION);
        if candidate.is_file() {
            let source = std::fs::read_to_string(&candidate).map_err(|err| {
                VmErr::Pending(ExcType::OSError, format!("could not read {}: {err}", candidate.display()))
            })?;
            let filename = candidate.display().to_string();
            return execute_source_module(vm, dotted, &source, &filename);
        }
    }

    Err(VmErr::import_error(format!("no module named '{dotted}'")))
}

/// Compiles and runs a source module, caching it before execution so cyclic
/// imports observe the partially initialized module.
pub fn execute_source_module(vm: &mut Vm, dotted: &str, source: &str, filename: &str) -> VmResult<Value> {
    let code_id = crate::bytecode::compiler::compile(source, filename, &mut vm.heap, &mut vm.interner)
        .map_err(|err| VmErr::Pending(ExcType::SyntaxError, err.to_string()))?;

    let name = vm.intern(dotted);
    let module_id = vm.heap.alloc(HeapData::Module(Module::new(name)));
    let module = Value::Ref(module_id);
    vm.modules.insert(dotted.to_owned(), module);

    run_module_body(vm, code_id, module_id)?;
    Ok(module)
}

/// Runs a module-flagged code object with the module's fields as globals.
pub fn run_module_body(vm: &mut Vm, code_id: HeapId, module_id: HeapId) -> VmResult<()> {
    // Seed __name__ and __doc__.
    let (docstring, module_name) = match vm.heap.get(code_id) {
        HeapData::Code(code) => (code.docstring, code.module),
        _ => (None, None),
    };
    let _ = module_name;
    if let HeapData::Code(code) = vm.heap.get_mut(code_id) {
        code.module = Some(module_id);
    }
    let name_attr = vm.names.name_attr;
    let doc_attr = vm.names.doc;
    let module_name_id = match vm.heap.get(module_id) {
        HeapData::Module(module) => module.name,
        _ => return Err(VmErr::import_error("module object corrupt")),
    };
    if let HeapData::Module(module) = vm.heap.get_mut(module_id) {
        module.fields.insert(name_attr, Value::Ref(module_name_id));
        module.fields.insert(doc_attr, docstring.unwrap_or(Value::None));
    }

    let closure = vm.heap.alloc(HeapData::Closure(crate::object::Closure {
        code: code_id,
        upvalues: Vec::new(),
    }));
    vm.call_function(Value::Ref(closure), Vec::new(), Vec::new())?;
    Ok(())
}

/// Native-module registry: dotted name to onload hook.
fn native_onload(dotted: &str) -> Option<fn(&mut Vm) -> HeapId> {
    match dotted {
        "time" => Some(module_onload_time),
        _ => None,
    }
}

/// Builds the `time` module: wall-clock time and sleeping.
pub fn module_onload_time(vm: &mut Vm) -> HeapId {
    let name = vm.intern("time");
    let mut module = Module::new(name);

    let mut add = |vm: &mut Vm, module: &mut Module, name: &'static str, doc: &'static str, func: crate::object::NativeFn| {
        let id = vm.heap.alloc(HeapData::Native(NativeFunction {
            name,
            doc,
            kind: NativeKind::Function,
            func,
        }));
        let key = vm.intern(name);
        module.fields.insert(key, Value::Ref(id));
    };
    add(vm, &mut module, "time", "Seconds since the epoch as a float.", time_time);
    add(vm, &mut module, "sleep", "Sleep for the given number of seconds.", time_sleep);

    let name_attr = vm.names.name_attr;
    module.fields.insert(name_attr, Value::Ref(name));
    vm.heap.alloc(HeapData::Module(module))
}

fn time_time(_vm: &mut Vm, _args: crate::object::NativeArgs) -> VmResult<Value> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| VmErr::Pending(ExcType::OSError, "system clock before epoch".to_owned()))?;
    Ok(Value::Float(now.as_secs_f64()))
}

fn time_sleep(vm: &mut Vm, args: crate::object::NativeArgs) -> VmResult<Value> {
    let Some(first) = args.args.first() else {
        return Err(VmErr::Pending(
            ExcType::ArgumentError,
            "sleep() takes exactly one argument".to_owned(),
        ));
    };
    let seconds = first
        .coerce_float()
        .ok_or_else(|| VmErr::type_error("sleep() argument must be a number"))?;
    let _ = vm;
    if seconds > 0.0 {
        std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
    }
    Ok(Value::None)
}
