//! Karasu: a small Python-flavored scripting language.
//!
//! The crate provides the full pipeline: a scanner, a single-pass bytecode
//! compiler, and a stack-based virtual machine with a tracing mark-sweep
//! garbage collector, exception handling, generators, and a module system.
//! [`Interpreter`] is the embedding entry point.

mod builtins;
mod bytecode;
mod exceptions;
mod heap;
mod intern;
mod io;
mod modules;
mod object;
mod run;
mod scanner;
mod value;
mod vm;

pub use crate::{
    exceptions::{CompileError, ExcType, KarasuError},
    io::{CollectStringPrint, NoPrint, PrintWriter, SharedPrint, StdPrint},
    run::Interpreter,
    value::Value,
    vm::{Vm, VmFlags},
};
