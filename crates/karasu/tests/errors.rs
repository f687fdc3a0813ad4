//! Error behavior: the exception taxonomy, runtime failure modes, compiler
//! diagnostics, and bytecode limits.

use std::fmt::Write;

use karasu::{Interpreter, KarasuError, SharedPrint};

fn run(source: &str) -> Result<String, KarasuError> {
    let output = SharedPrint::new();
    let mut interp = Interpreter::with_writer(Box::new(output.handle()));
    interp.interpret_entry(source, "test.krs")?;
    Ok(output.output())
}

fn run_err(source: &str) -> KarasuError {
    run(source).expect_err("expected program to fail")
}

fn check_err(source: &str) -> KarasuError {
    let mut interp = Interpreter::new();
    interp.check(source, "test.krs").expect_err("expected compile error")
}

// ======================================================================
// Runtime errors
// ======================================================================

#[test]
fn division_by_zero() {
    assert_eq!(run_err("1 / 0").exc_type, "ZeroDivisionError");
    assert_eq!(run_err("1 // 0").exc_type, "ZeroDivisionError");
    assert_eq!(run_err("1 % 0").exc_type, "ZeroDivisionError");
    assert_eq!(run_err("1.5 / 0.0").exc_type, "ZeroDivisionError");
}

#[test]
fn index_out_of_range() {
    let err = run_err("a = [1, 2, 3]\na[len(a)]");
    assert_eq!(err.exc_type, "IndexError");
    assert_eq!(run_err("'abc'[3]").exc_type, "IndexError");
    assert_eq!(run_err("[1][-2]").exc_type, "IndexError");
}

#[test]
fn missing_key_and_name() {
    assert_eq!(run_err("{}['missing']").exc_type, "KeyError");
    let err = run_err("print(undefined_name)");
    assert_eq!(err.exc_type, "NameError");
    assert!(err.message.contains("undefined_name"));
}

#[test]
fn attribute_errors() {
    let err = run_err("x = 5\nx.missing");
    assert_eq!(err.exc_type, "AttributeError");
    assert!(err.message.contains("missing"));
}

#[test]
fn type_errors() {
    assert_eq!(run_err("1 + 'a'").exc_type, "TypeError");
    assert_eq!(run_err("len(5)").exc_type, "TypeError");
    assert_eq!(run_err("5()").exc_type, "TypeError");
    assert_eq!(run_err("{[1]: 2}").exc_type, "TypeError");
}

#[test]
fn argument_errors_are_type_errors() {
    let source = "\
def f(a, b):
    return a
f(1)
";
    let err = run_err(source);
    assert_eq!(err.exc_type, "ArgumentError");
    // ArgumentError is a TypeError subclass, so `except TypeError` catches.
    let source = "\
def f(a):
    return a
try:
    f()
except TypeError:
    print('caught')
";
    assert_eq!(run(source).unwrap(), "caught\n");
}

#[test]
fn unexpected_keyword_argument() {
    let source = "\
def f(a):
    return a
f(b=1)
";
    let err = run_err(source);
    assert_eq!(err.exc_type, "ArgumentError");
    assert!(err.message.contains('b'));
}

#[test]
fn value_errors() {
    assert_eq!(run_err("int('not a number')").exc_type, "ValueError");
    assert_eq!(run_err("a, b = [1, 2, 3]").exc_type, "ValueError");
}

#[test]
fn unpacking_errors_report_counts() {
    let err = run_err("a, b, c = [1, 2]");
    assert_eq!(err.exc_type, "ValueError");
    assert!(err.message.contains('3'));
}

#[test]
fn recursion_limit_is_runtime_error() {
    let source = "\
def f():
    return f()
f()
";
    let err = run_err(source);
    assert_eq!(err.exc_type, "RuntimeError");
    assert!(err.message.contains("recursion"));
}

#[test]
fn raising_non_exception_is_type_error() {
    assert_eq!(run_err("raise 5").exc_type, "TypeError");
}

#[test]
fn not_implemented_for_type_with_three_args() {
    let err = run_err("type('X', (), {})");
    assert_eq!(err.exc_type, "NotImplementedError");
}

#[test]
fn traceback_lists_frames_most_recent_last() {
    let source = "\
def inner():
    raise ValueError('deep')
def outer():
    inner()
outer()
";
    let err = run_err(source);
    let traceback = &err.traceback;
    assert!(traceback.starts_with("Traceback (most recent call last):"));
    let outer_at = traceback.find("in outer").expect("outer frame listed");
    let inner_at = traceback.find("in inner").expect("inner frame listed");
    assert!(outer_at < inner_at, "most recent call should come last:\n{traceback}");
    assert!(traceback.ends_with("ValueError: deep"));
}

#[test]
fn generator_already_running() {
    // A generator resumed from within itself reports a ValueError.
    let source = "\
def g():
    yield it()
it = g()
it()
";
    let err = run_err(source);
    assert_eq!(err.exc_type, "ValueError");
}

// ======================================================================
// Compile errors
// ======================================================================

#[test]
fn syntax_error_carries_location_and_caret() {
    let err = check_err("x = 1 +\n");
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(err.traceback.contains("test.krs"));
    assert!(err.traceback.contains('^'));
}

#[test]
fn unterminated_string_is_syntax_error() {
    let err = check_err("x = 'unclosed");
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(err.message.contains("unterminated"));
}

#[test]
fn missing_indent_is_syntax_error() {
    let err = check_err("if True:\npass");
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(err.message.contains("indent"));
}

#[test]
fn break_outside_loop() {
    let err = check_err("break");
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(err.message.contains("break"));
}

#[test]
fn return_outside_function() {
    let err = check_err("return 1");
    assert_eq!(err.exc_type, "SyntaxError");
}

#[test]
fn yield_outside_function() {
    let err = check_err("yield 1");
    assert_eq!(err.exc_type, "SyntaxError");
}

#[test]
fn star_import_is_rejected() {
    let err = check_err("from time import *");
    assert_eq!(err.exc_type, "SyntaxError");
}

#[test]
fn async_for_and_with_are_unimplemented() {
    let err = check_err("async for x in y:\n    pass");
    assert!(err.message.contains("not implemented"));
    let err = check_err("async with x:\n    pass");
    assert!(err.message.contains("not implemented"));
}

#[test]
fn await_outside_async_function() {
    let err = check_err("def f():\n    await g()");
    assert_eq!(err.exc_type, "SyntaxError");
}

#[test]
fn non_default_after_default_parameter() {
    let err = check_err("def f(a=1, b):\n    pass");
    assert_eq!(err.exc_type, "SyntaxError");
}

#[test]
fn import_errors_at_runtime() {
    let err = run_err("import definitely_not_a_real_module");
    assert_eq!(err.exc_type, "ImportError");
}

// ======================================================================
// Bytecode limits
// ======================================================================

/// Generates an `if` whose body emits at least `statements` statements.
fn generate_big_if(statements: usize) -> String {
    let mut code = String::from("flag = False\nif flag:\n");
    for i in 0..statements {
        writeln!(code, "    v{i} = {i}").unwrap();
    }
    code.push_str("print('ok')\n");
    code
}

#[test]
fn moderate_forward_jumps_compile() {
    // A few thousand statements stay inside the 16-bit branch range.
    let source = generate_big_if(2000);
    assert_eq!(run(&source).unwrap(), "ok\n");
}

#[test]
fn far_jump_is_reported() {
    // Enough statements to push the branch distance past 0xFFFF.
    let source = generate_big_if(30_000);
    let err = check_err(&source);
    assert_eq!(err.exc_type, "SyntaxError");
    assert!(
        err.message.contains("unsupported far jump"),
        "unexpected message: {}",
        err.message
    );
}

#[test]
fn many_constants_use_long_operands() {
    // More than 256 distinct constants in one chunk forces the 24-bit
    // constant form.
    let mut code = String::new();
    for i in 0..300 {
        writeln!(code, "v{i} = {}", i * 7 + 1).unwrap();
    }
    writeln!(code, "print(v299)").unwrap();
    assert_eq!(run(&code).unwrap(), format!("{}\n", 299 * 7 + 1));
}

#[test]
fn many_locals_in_function() {
    let mut code = String::from("def f():\n");
    for i in 0..300 {
        writeln!(code, "    v{i} = {i}").unwrap();
    }
    code.push_str("    return v299\nprint(f())\n");
    assert_eq!(run(&code).unwrap(), "299\n");
}
