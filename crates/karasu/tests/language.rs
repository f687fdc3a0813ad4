//! End-to-end language behavior tests: each case compiles and runs a small
//! program and checks its printed output.

use karasu::{Interpreter, KarasuError, SharedPrint};
use pretty_assertions::assert_eq;

fn run(source: &str) -> Result<String, KarasuError> {
    let output = SharedPrint::new();
    let mut interp = Interpreter::with_writer(Box::new(output.handle()));
    interp.interpret_entry(source, "test.krs")?;
    Ok(output.output())
}

fn run_ok(source: &str) -> String {
    match run(source) {
        Ok(output) => output,
        Err(err) => panic!("program failed:\n{err}"),
    }
}

// ======================================================================
// Expressions and statements
// ======================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_ok("print(1 + 2 * 3 - 4)"), "3\n");
    assert_eq!(run_ok("print((1 + 2) * 3)"), "9\n");
    assert_eq!(run_ok("print(2 ** 3 ** 2)"), "512\n");
    assert_eq!(run_ok("print(-2 ** 2)"), "-4\n");
    assert_eq!(run_ok("print(7 // 2, 7 % 2, 7 / 2)"), "3 1 3.5\n");
    assert_eq!(run_ok("print(-7 // 2, -7 % 2)"), "-4 1\n");
}

#[test]
fn bitwise_operators() {
    assert_eq!(run_ok("print(6 & 3, 6 | 3, 6 ^ 3, ~5, 1 << 4, 32 >> 2)"), "2 7 5 -6 16 8\n");
}

#[test]
fn comparison_chaining_evaluates_middle_once() {
    let source = "\
def mid():
    print('mid')
    return 2
print(1 < mid() < 3)
print(1 < mid() < 0)
";
    assert_eq!(run_ok(source), "mid\nTrue\nmid\nFalse\n");
}

#[test]
fn chained_comparison_short_circuits() {
    let source = "\
def boom():
    raise ValueError('should not run')
print(5 < 3 < boom())
";
    assert_eq!(run_ok(source), "False\n");
}

#[test]
fn boolean_operators_short_circuit() {
    assert_eq!(run_ok("print(False and 1)"), "False\n");
    assert_eq!(run_ok("print(0 or 'x')"), "x\n");
    assert_eq!(run_ok("print(not 0, not [1])"), "True False\n");
}

#[test]
fn ternary_expression() {
    assert_eq!(run_ok("print(1 if True else 2)"), "1\n");
    assert_eq!(run_ok("print(1 if False else 2)"), "2\n");
    assert_eq!(run_ok("x = 5\nprint('big' if x > 3 else 'small')"), "big\n");
}

#[test]
fn multi_target_assignment_and_swap() {
    assert_eq!(run_ok("a, b = 1, 2\na, b = b, a\nprint(a, b)"), "2 1\n");
    assert_eq!(run_ok("x = y = 7\nprint(x, y)"), "7 7\n");
    assert_eq!(run_ok("a, (b, c) = 1, (2, 3)\nprint(a, b, c)"), "1 2 3\n");
}

#[test]
fn augmented_assignment_forms() {
    assert_eq!(run_ok("x = 1\nx += 2\nx *= 3\nprint(x)"), "9\n");
    let source = "\
d = {'n': 1}
d['n'] += 10
print(d['n'])
";
    assert_eq!(run_ok(source), "11\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let source = "\
total = 0
i = 0
while True:
    i += 1
    if i > 10:
        break
    if i % 2 == 0:
        continue
    total += i
print(total)
";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn for_loop_over_builtin_containers() {
    assert_eq!(run_ok("for x in [1, 2, 3]:\n    print(x)"), "1\n2\n3\n");
    assert_eq!(run_ok("for c in 'ab':\n    print(c)"), "a\nb\n");
    let source = "\
total = 0
for i in range(5):
    total += i
print(total)
";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn for_else_and_while_else() {
    let source = "\
for i in range(3):
    pass
else:
    print('completed')
for i in range(3):
    break
else:
    print('not printed')
print('done')
";
    assert_eq!(run_ok(source), "completed\ndone\n");
}

#[test]
fn tuple_unpacking_in_for() {
    let source = "\
for k, v in [(1, 'a'), (2, 'b')]:
    print(k, v)
";
    assert_eq!(run_ok(source), "1 a\n2 b\n");
}

// ======================================================================
// Functions
// ======================================================================

#[test]
fn lambda_scenario() {
    assert_eq!(run_ok("assert (lambda x: x + 1)(41) == 42"), "");
}

#[test]
fn function_defaults_evaluate_in_prologue() {
    let source = "\
def greet(name, suffix='!'):
    return name + suffix
print(greet('hi'))
print(greet('hi', '?'))
";
    assert_eq!(run_ok(source), "hi!\nhi?\n");
}

#[test]
fn keyword_arguments() {
    let source = "\
def f(a, b=2, c=3):
    return a * 100 + b * 10 + c
print(f(1))
print(f(1, c=9))
print(f(a=5, b=6, c=7))
";
    assert_eq!(run_ok(source), "123\n129\n567\n");
}

#[test]
fn star_args_and_kwargs_collection() {
    let source = "\
def f(first, *rest, **extra):
    return (first, len(rest), len(extra))
print(f(1))
print(f(1, 2, 3))
print(f(1, 2, x=5, y=6))
";
    assert_eq!(run_ok(source), "(1, 0, 0)\n(1, 2, 0)\n(1, 1, 2)\n");
}

#[test]
fn call_spreads() {
    let source = "\
def add3(a, b, c):
    return a + b + c
args = [1, 2, 3]
print(add3(*args))
kw = {'b': 20, 'c': 30}
print(add3(10, **kw))
";
    assert_eq!(run_ok(source), "6\n60\n");
}

#[test]
fn closures_capture_and_mutate() {
    let source = "\
def counter():
    count = 0
    def bump():
        count = count + 1
        return count
    return bump
c = counter()
print(c())
";
    // Assignment writes through the captured upvalue.
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn closures_survive_frame_return() {
    let source = "\
def make_adder(n):
    def add(x):
        return x + n
    return add
add5 = make_adder(5)
add7 = make_adder(7)
print(add5(1), add7(1))
";
    assert_eq!(run_ok(source), "6 8\n");
}

#[test]
fn recursion() {
    let source = "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)
print(fib(12))
";
    assert_eq!(run_ok(source), "144\n");
}

#[test]
fn decorators_stack() {
    let source = "\
def double(f):
    def wrapped(x):
        return f(x) * 2
    return wrapped
def inc(f):
    def wrapped(x):
        return f(x) + 1
    return wrapped
@double
@inc
def base(x):
    return x
print(base(10))
";
    // double(inc(base)): (10 + 1) * 2
    assert_eq!(run_ok(source), "22\n");
}

// ======================================================================
// Classes
// ======================================================================

#[test]
fn class_attribute_inheritance() {
    let source = "\
class A:
    x = 1
class B(A):
    pass
print(B.x)
";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn instance_fields_and_methods() {
    let source = "\
class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y
    def total(self):
        return self.x + self.y
p = Point(3, 4)
print(p.total())
p.x = 10
print(p.total())
";
    assert_eq!(run_ok(source), "7\n14\n");
}

#[test]
fn method_resolution_walks_bases() {
    let source = "\
class Animal:
    def speak(self):
        return 'generic'
class Dog(Animal):
    pass
print(Dog().speak())
";
    assert_eq!(run_ok(source), "generic\n");
}

#[test]
fn super_calls_base_method() {
    let source = "\
class Base:
    def name(self):
        return 'base'
class Child(Base):
    def name(self):
        return 'child of ' + super().name()
print(Child().name())
";
    assert_eq!(run_ok(source), "child of base\n");
}

#[test]
fn dunder_str_and_repr() {
    let source = "\
class Box:
    def __init__(self, v):
        self.v = v
    def __str__(self):
        return 'Box(' + str(self.v) + ')'
print(Box(3))
";
    assert_eq!(run_ok(source), "Box(3)\n");
}

#[test]
fn dunder_arithmetic_with_reflection() {
    let source = "\
class Vec:
    def __init__(self, x):
        self.x = x
    def __add__(self, other):
        return Vec(self.x + other.x)
    def __radd__(self, other):
        return Vec(self.x + other)
    def __str__(self):
        return 'Vec(' + str(self.x) + ')'
print(Vec(1) + Vec(2))
print(10 + Vec(1))
";
    assert_eq!(run_ok(source), "Vec(3)\nVec(11)\n");
}

#[test]
fn dunder_getitem_setitem() {
    let source = "\
class Wrap:
    def __init__(self):
        self.data = {}
    def __getitem__(self, key):
        return self.data[key]
    def __setitem__(self, key, value):
        self.data[key] = value
w = Wrap()
w['a'] = 5
print(w['a'])
";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn dunder_call_and_eq() {
    let source = "\
class Adder:
    def __init__(self, n):
        self.n = n
    def __call__(self, x):
        return x + self.n
    def __eq__(self, other):
        return self.n == other.n
print(Adder(3)(4))
print(Adder(1) == Adder(1))
print(Adder(1) == Adder(2))
";
    assert_eq!(run_ok(source), "7\nTrue\nFalse\n");
}

#[test]
fn init_subclass_hook_runs() {
    let source = "\
class Base:
    def __init_subclass__(cls):
        print('subclassed:', cls.__name__)
class Child(Base):
    pass
";
    assert_eq!(run_ok(source), "subclassed: Child\n");
}

#[test]
fn isinstance_and_type() {
    let source = "\
class A:
    pass
class B(A):
    pass
b = B()
print(isinstance(b, B), isinstance(b, A), isinstance(b, int))
print(issubclass(B, A), issubclass(A, B))
print(type(5) == int, type('x') == str)
";
    assert_eq!(run_ok(source), "True True False\nTrue False\nTrue True\n");
}

#[test]
fn class_decorator() {
    let source = "\
def tag(cls):
    cls.tagged = True
    return cls
@tag
class Thing:
    pass
print(Thing.tagged)
";
    assert_eq!(run_ok(source), "True\n");
}

// ======================================================================
// Generators
// ======================================================================

#[test]
fn generator_scenario() {
    let source = "\
def g():
    yield 1
    yield 2
print(list(g()))
";
    assert_eq!(run_ok(source), "[1, 2]\n");
}

#[test]
fn generator_for_loop_and_locals() {
    let source = "\
def countdown(n):
    while n > 0:
        yield n
        n -= 1
for x in countdown(3):
    print(x)
";
    assert_eq!(run_ok(source), "3\n2\n1\n");
}

#[test]
fn exhausted_generator_stays_exhausted() {
    let source = "\
def g():
    yield 1
it = g()
print(it() is it)
print(it() is it)
print(it() is it)
";
    // First call yields 1 (not the iterator); every later call returns the
    // iterator itself.
    assert_eq!(run_ok(source), "False\nTrue\nTrue\n");
}

#[test]
fn yield_from_delegates() {
    let source = "\
def inner():
    yield 1
    yield 2
def outer():
    yield 0
    yield from inner()
    yield 3
print(list(outer()))
";
    assert_eq!(run_ok(source), "[0, 1, 2, 3]\n");
}

#[test]
fn generator_expression() {
    assert_eq!(run_ok("print(list(x * x for x in [1, 2, 3]))"), "[1, 4, 9]\n");
    assert_eq!(run_ok("print(sum(x for x in range(5)))"), "10\n");
}

#[test]
fn await_delegates_to_coroutine() {
    let source = "\
async def inner():
    return_value = 41
    yield return_value + 1
async def outer():
    yield await inner()
it = outer()
first = it()
print(first)
";
    assert_eq!(run_ok(source), "42\n");
}

// ======================================================================
// Comprehensions
// ======================================================================

#[test]
fn list_comprehension_with_condition() {
    assert_eq!(run_ok("print([x * 2 for x in range(5) if x % 2 == 0])"), "[0, 4, 8]\n");
}

#[test]
fn nested_comprehension_clauses() {
    assert_eq!(
        run_ok("print([(a, b) for a in range(2) for b in range(2)])"),
        "[(0, 0), (0, 1), (1, 0), (1, 1)]\n"
    );
}

#[test]
fn dict_and_set_comprehensions() {
    assert_eq!(run_ok("d = {x: x * x for x in range(3)}\nprint(d[2])"), "4\n");
    assert_eq!(run_ok("s = {x % 2 for x in range(10)}\nprint(len(s))"), "2\n");
}

#[test]
fn comprehension_captures_enclosing_variables() {
    let source = "\
n = 3
print([x * n for x in range(3)])
";
    assert_eq!(run_ok(source), "[0, 3, 6]\n");
}

// ======================================================================
// Exceptions
// ======================================================================

#[test]
fn try_except_scenario() {
    let source = "\
try:
    raise ValueError('bad')
except ValueError as e:
    print(e)
";
    assert_eq!(run_ok(source), "bad\n");
}

#[test]
fn except_filters_select_clause() {
    let source = "\
def classify(exc):
    try:
        raise exc
    except ValueError:
        return 'value'
    except (KeyError, IndexError):
        return 'lookup'
    except:
        return 'other'
print(classify(ValueError('x')))
print(classify(IndexError('x')))
print(classify(RuntimeError('x')))
";
    assert_eq!(run_ok(source), "value\nlookup\nother\n");
}

#[test]
fn unmatched_exception_propagates() {
    let source = "\
try:
    try:
        raise KeyError('k')
    except ValueError:
        print('wrong')
except KeyError:
    print('caught outside')
";
    assert_eq!(run_ok(source), "caught outside\n");
}

#[test]
fn raise_class_instantiates() {
    let source = "\
try:
    raise ValueError
except ValueError:
    print('instantiated')
";
    assert_eq!(run_ok(source), "instantiated\n");
}

#[test]
fn try_else_runs_without_exception() {
    let source = "\
try:
    x = 1
except ValueError:
    print('no')
else:
    print('else ran')
";
    assert_eq!(run_ok(source), "else ran\n");
}

#[test]
fn finally_runs_on_every_path() {
    let source = "\
def f(fail):
    try:
        if fail:
            raise ValueError('x')
        return 'normal'
    finally:
        print('cleanup')
print(f(False))
try:
    f(True)
except ValueError:
    print('caught')
";
    assert_eq!(run_ok(source), "cleanup\nnormal\ncleanup\ncaught\n");
}

#[test]
fn finally_runs_on_break() {
    let source = "\
for i in range(3):
    try:
        if i == 1:
            break
        print('body', i)
    finally:
        print('fin', i)
print('after')
";
    assert_eq!(run_ok(source), "body 0\nfin 0\nfin 1\nafter\n");
}

#[test]
fn exception_context_chains_implicitly() {
    let source = "\
try:
    try:
        raise ValueError('first')
    except ValueError:
        raise KeyError('second')
except KeyError as e:
    print(e.__context__ is None)
    print(e.__context__)
";
    assert_eq!(run_ok(source), "False\nfirst\n");
}

#[test]
fn raise_from_sets_cause() {
    let source = "\
try:
    try:
        raise ValueError('low')
    except ValueError as low:
        raise RuntimeError('high') from low
except RuntimeError as e:
    print(e.__cause__)
";
    assert_eq!(run_ok(source), "low\n");
}

#[test]
fn bare_raise_reraises() {
    let source = "\
try:
    try:
        raise ValueError('again')
    except ValueError:
        raise
except ValueError as e:
    print('outer', e)
";
    assert_eq!(run_ok(source), "outer again\n");
}

#[test]
fn keyboard_interrupt_not_caught_by_exception() {
    let source = "\
try:
    raise KeyboardInterrupt
except Exception:
    print('wrong')
except BaseException:
    print('right')
";
    assert_eq!(run_ok(source), "right\n");
}

// ======================================================================
// Context managers
// ======================================================================

#[test]
fn with_calls_enter_and_exit() {
    let source = "\
class CM:
    def __enter__(self):
        print('enter')
        return 42
    def __exit__(self, t, v, tb):
        print('exit')
with CM() as value:
    print(value)
print('after')
";
    assert_eq!(run_ok(source), "enter\n42\nexit\nafter\n");
}

#[test]
fn with_exit_runs_on_exception_and_can_suppress() {
    let source = "\
class Suppress:
    def __enter__(self):
        return self
    def __exit__(self, t, v, tb):
        print('exit saw:', v)
        return True
with Suppress():
    raise ValueError('inside')
print('survived')
";
    assert_eq!(run_ok(source), "exit saw: inside\nsurvived\n");
}

#[test]
fn with_exit_runs_on_return() {
    let source = "\
class CM:
    def __enter__(self):
        return self
    def __exit__(self, t, v, tb):
        print('exit')
def f():
    with CM():
        return 'result'
print(f())
";
    assert_eq!(run_ok(source), "exit\nresult\n");
}

#[test]
fn with_exit_runs_on_break() {
    let source = "\
class CM:
    def __enter__(self):
        return self
    def __exit__(self, t, v, tb):
        print('exit')
for i in range(3):
    with CM():
        if i == 1:
            break
        print('body', i)
print('after')
";
    assert_eq!(run_ok(source), "body 0\nexit\nexit\nafter\n");
}

// ======================================================================
// Containers and builtins
// ======================================================================

#[test]
fn list_operations() {
    let source = "\
xs = [3, 1, 2]
xs.append(4)
xs.sort()
print(xs)
print(xs.pop(), xs)
print([0] * 3, [1, 2] + [3])
";
    assert_eq!(run_ok(source), "[1, 2, 3, 4]\n4 [1, 2, 3]\n[0, 0, 0] [1, 2, 3]\n");
}

#[test]
fn dict_operations() {
    let source = "\
d = {'a': 1, 'b': 2}
d['c'] = 3
print(len(d), d['c'], d.get('missing', 0))
del d['a']
print('a' in d, 'b' in d)
print(sorted(d.keys()))
";
    assert_eq!(run_ok(source), "3 3 0\nFalse True\n['b', 'c']\n");
}

#[test]
fn set_operations() {
    let source = "\
s = {1, 2, 3}
s.add(2)
print(len(s))
print(2 in s, 9 in s)
print(sorted({1, 2} | {2, 3}))
print(sorted({1, 2} & {2, 3}))
";
    assert_eq!(run_ok(source), "3\nTrue False\n[1, 2, 3]\n[2]\n");
}

#[test]
fn tuple_round_trip() {
    assert_eq!(run_ok("t = (1, 2, 3)\nprint(tuple(list(t)) == t)"), "True\n");
    assert_eq!(run_ok("print((1,))"), "(1,)\n");
}

#[test]
fn string_methods_and_slicing() {
    let source = "\
s = 'hello world'
print(s.upper())
print(s[0], s[-1], s[0:5], s[::2])
print('-'.join(['a', 'b']))
print('a,b,c'.split(','))
";
    assert_eq!(run_ok(source), "HELLO WORLD\nh d hello hlowrd\na-b\n['a', 'b', 'c']\n");
}

#[test]
fn string_length_is_codepoints() {
    assert_eq!(run_ok("print(len('héllo'))"), "5\n");
    assert_eq!(run_ok("print(len('日本'))"), "2\n");
}

#[test]
fn fstring_interpolation() {
    let source = "\
name = 'world'
n = 3
print(f'hello {name}!')
print(f'{n} squared is {n * n}')
print(f'{name!r}')
print(f'literal {{braces}}')
";
    assert_eq!(run_ok(source), "hello world!\n3 squared is 9\n'world'\nliteral {braces}\n");
}

#[test]
fn string_escapes() {
    assert_eq!(run_ok(r"print('a\tb')"), "a\tb\n");
    assert_eq!(run_ok(r"print('\x41B')"), "AB\n");
    assert_eq!(run_ok(r"print('\101')"), "A\n");
}

#[test]
fn bytes_values() {
    assert_eq!(run_ok("b = b'ab'\nprint(len(b), b[0])"), "2 97\n");
    assert_eq!(run_ok("print('hi'.encode().decode())"), "hi\n");
}

#[test]
fn slicing_clamps_out_of_range() {
    assert_eq!(run_ok("print([1, 2, 3][1:100])"), "[2, 3]\n");
    assert_eq!(run_ok("print([1, 2, 3][-100:2])"), "[1, 2]\n");
    assert_eq!(run_ok("print('abcdef'[::-1])"), "fedcba\n");
}

#[test]
fn negative_index_wraps_once() {
    assert_eq!(run_ok("a = [10, 20, 30]\nprint(a[-len(a)] == a[0])"), "True\n");
}

#[test]
fn builtin_helpers() {
    assert_eq!(run_ok("print(min(3, 1, 2), max([4, 9, 2]))"), "1 9\n");
    assert_eq!(run_ok("print(any([0, 0, 1]), all([1, 0]))"), "True False\n");
    assert_eq!(run_ok("print(abs(-5), ord('A'), chr(66))"), "5 65 B\n");
    assert_eq!(run_ok("print(sorted([3, 1, 2]))"), "[1, 2, 3]\n");
    assert_eq!(run_ok("print(sum(range(101)))"), "5050\n");
}

#[test]
fn getattr_family() {
    let source = "\
class A:
    pass
a = A()
setattr(a, 'x', 5)
print(getattr(a, 'x'), getattr(a, 'missing', 'fallback'), hasattr(a, 'x'))
";
    assert_eq!(run_ok(source), "5 fallback True\n");
}

// ======================================================================
// Big integers
// ======================================================================

#[test]
fn bigint_pow_scenario() {
    assert_eq!(run_ok("print(2 ** 100)"), "1267650600228229401496703205376\n");
}

#[test]
fn int_overflow_promotes() {
    assert_eq!(
        run_ok("print(9223372036854775807 + 1)"),
        "9223372036854775808\n"
    );
    assert_eq!(
        run_ok("print(-9223372036854775807 - 2)"),
        "-9223372036854775809\n"
    );
}

#[test]
fn bigint_round_trips_through_str() {
    let source = "\
n = 2 ** 100 + 12345
print(int(str(n)) == n)
m = -(2 ** 90)
print(int(str(m)) == m)
";
    assert_eq!(run_ok(source), "True\nTrue\n");
}

#[test]
fn bigint_floor_division_and_modulo() {
    assert_eq!(run_ok("print((2 ** 100) % 7)"), "2\n");
    assert_eq!(run_ok("print((-(2 ** 100)) % 7)"), "5\n");
}

// ======================================================================
// Modules
// ======================================================================

#[test]
fn import_native_time_module() {
    let source = "\
import time
t = time.time()
print(type(t) == float, t > 0)
";
    assert_eq!(run_ok(source), "True True\n");
}

#[test]
fn from_import_native_module() {
    let source = "\
from time import time
print(type(time()) == float)
";
    assert_eq!(run_ok(source), "True\n");
}

#[test]
fn import_as_alias() {
    let source = "\
import time as t
print(type(t.time()) == float)
";
    assert_eq!(run_ok(source), "True\n");
}

// ======================================================================
// Misc semantics
// ======================================================================

#[test]
fn is_compares_identity() {
    let source = "\
a = [1]
b = [1]
print(a is a, a is b, a == b)
print(None is None)
";
    assert_eq!(run_ok(source), "True False True\nTrue\n");
}

#[test]
fn del_removes_bindings_and_items() {
    let source = "\
x = 1
del x
xs = [1, 2, 3]
del xs[1]
print(xs)
";
    assert_eq!(run_ok(source), "[1, 3]\n");
}

#[test]
fn docstrings_do_not_execute() {
    let source = "\
def f():
    'the docstring'
    return 1
print(f())
";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn adjacent_string_literals_concatenate() {
    assert_eq!(run_ok("print('ab' 'cd')"), "abcd\n");
}

#[test]
fn deep_collection_printing() {
    assert_eq!(
        run_ok("print({'k': [1, (2, 3)], 'e': {}})"),
        "{'k': [1, (2, 3)], 'e': {}}\n"
    );
}

#[test]
fn recursive_list_repr_uses_ellipsis() {
    let source = "\
xs = [1]
xs.append(xs)
print(xs)
";
    assert_eq!(run_ok(source), "[1, [...]]\n");
}

#[test]
fn float_formatting_keeps_decimal_point() {
    assert_eq!(run_ok("print(1.0, 2.5, 1 / 1)"), "1.0 2.5 1.0\n");
}

#[test]
fn recompiled_source_behaves_identically() {
    let source = "\
def f(n):
    return sum(x * x for x in range(n))
print(f(10))
";
    let first = run_ok(source);
    let second = run_ok(source);
    assert_eq!(first, second);
    assert_eq!(first, "285\n");
}
