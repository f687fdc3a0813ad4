//! Opcode definitions for the bytecode VM.
//!
//! Bytecode is stored as a raw `Vec<u8>`; opcodes are one byte and operands
//! are fetched separately from the byte stream. Most operand-taking opcodes
//! come in a short and a long form: short takes a single `u8` operand, long
//! takes three bytes interpreted big-endian as a `u24`. The compiler picks
//! the long form automatically when an operand exceeds 255. Branch opcodes
//! take an unsigned 16-bit big-endian distance relative to the byte after
//! the operand; `JUMP`-family branches go forward, `LOOP` goes backward.

/// Transparent wrapper for a `u8` making opcode-typed code readable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Opcode(pub u8);

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value.0
    }
}

// === Stack operations ===
/// Discard top of stack.
pub const POP: Opcode = Opcode(0);
/// Discard top n values. Operand: u8 count.
pub const POP_MANY: Opcode = Opcode(1);
/// Copy the value k slots down to the top. Operand: u8 k (0 = TOS).
pub const DUP: Opcode = Opcode(2);
/// Swap the top two values.
pub const SWAP: Opcode = Opcode(3);
/// Reverse the top k values. Operand: u8 k.
pub const REVERSE: Opcode = Opcode(4);

// === Constants & singletons ===
/// Push constant from the pool. Operand: u8 index.
pub const CONSTANT: Opcode = Opcode(5);
/// Push constant (wide pool). Operand: u24 index.
pub const CONSTANT_LONG: Opcode = Opcode(6);
/// Push `None`.
pub const NONE: Opcode = Opcode(7);
/// Push `True`.
pub const TRUE: Opcode = Opcode(8);
/// Push `False`.
pub const FALSE: Opcode = Opcode(9);
/// Push `NotImplemented`.
pub const NOT_IMPL: Opcode = Opcode(10);

// === Locals / globals / upvalues ===
/// Push local slot. Operand: u8 slot.
pub const GET_LOCAL: Opcode = Opcode(11);
pub const GET_LOCAL_LONG: Opcode = Opcode(12);
/// Store TOS to local slot, keeping the value. Operand: u8 slot.
pub const SET_LOCAL: Opcode = Opcode(13);
pub const SET_LOCAL_LONG: Opcode = Opcode(14);
/// Reset a local slot to the unbound sentinel. Operand: u8 slot.
pub const DEL_LOCAL: Opcode = Opcode(15);
pub const DEL_LOCAL_LONG: Opcode = Opcode(16);
/// Push a module global by name constant. Operand: u8 constant index.
pub const GET_GLOBAL: Opcode = Opcode(17);
pub const GET_GLOBAL_LONG: Opcode = Opcode(18);
/// Store TOS to a module global, keeping the value. Operand: u8 constant index.
pub const SET_GLOBAL: Opcode = Opcode(19);
pub const SET_GLOBAL_LONG: Opcode = Opcode(20);
/// Remove a module global. Operand: u8 constant index.
pub const DEL_GLOBAL: Opcode = Opcode(21);
pub const DEL_GLOBAL_LONG: Opcode = Opcode(22);
/// Push an upvalue cell's value. Operand: u8 upvalue index.
pub const GET_UPVALUE: Opcode = Opcode(23);
pub const GET_UPVALUE_LONG: Opcode = Opcode(24);
/// Store TOS through an upvalue cell, keeping the value. Operand: u8 index.
pub const SET_UPVALUE: Opcode = Opcode(25);
pub const SET_UPVALUE_LONG: Opcode = Opcode(26);
/// Close the topmost stack slot into its upvalue cell and pop it.
pub const CLOSE_UPVALUE: Opcode = Opcode(27);

// === Attributes ===
/// Pop obj, push obj.attr. Operand: u8 name constant.
pub const GET_PROPERTY: Opcode = Opcode(28);
pub const GET_PROPERTY_LONG: Opcode = Opcode(29);
/// Stack [obj, value]: set obj.attr, leave value. Operand: u8 name constant.
pub const SET_PROPERTY: Opcode = Opcode(30);
pub const SET_PROPERTY_LONG: Opcode = Opcode(31);
/// Pop obj, delete obj.attr. Operand: u8 name constant.
pub const DEL_PROPERTY: Opcode = Opcode(32);
pub const DEL_PROPERTY_LONG: Opcode = Opcode(33);
/// Stack [receiver, class]: bind the named method of class's base to
/// receiver. Operand: u8 name constant.
pub const GET_SUPER: Opcode = Opcode(34);
pub const GET_SUPER_LONG: Opcode = Opcode(35);

// === Subscription & slicing ===
/// a[b]: pop index, pop obj, push result.
pub const INVOKE_GETTER: Opcode = Opcode(36);
/// a[b] = v: stack [value, obj, index]; pops all three.
pub const INVOKE_SETTER: Opcode = Opcode(37);
/// del a[b]: pop index, pop obj.
pub const INVOKE_DELETE: Opcode = Opcode(38);
/// a[b:c:d]: stack [obj, start, stop, step]; push slice result.
pub const INVOKE_GETSLICE: Opcode = Opcode(39);
/// a[b:c:d] = v: stack [value, obj, start, stop, step]; pops all five.
pub const INVOKE_SETSLICE: Opcode = Opcode(40);
/// del a[b:c:d]: stack [obj, start, stop, step].
pub const INVOKE_DELSLICE: Opcode = Opcode(41);

// === Arithmetic / logical ===
pub const ADD: Opcode = Opcode(42);
pub const SUB: Opcode = Opcode(43);
pub const MUL: Opcode = Opcode(44);
pub const DIV: Opcode = Opcode(45);
pub const FLOORDIV: Opcode = Opcode(46);
pub const MOD: Opcode = Opcode(47);
pub const POW: Opcode = Opcode(48);
pub const SHIFTLEFT: Opcode = Opcode(49);
pub const SHIFTRIGHT: Opcode = Opcode(50);
pub const BITOR: Opcode = Opcode(51);
pub const BITXOR: Opcode = Opcode(52);
pub const BITAND: Opcode = Opcode(53);
pub const NEGATE: Opcode = Opcode(54);
pub const NOT: Opcode = Opcode(55);
pub const BITNEGATE: Opcode = Opcode(56);

// === Comparison ===
pub const EQUAL: Opcode = Opcode(57);
pub const LESS: Opcode = Opcode(58);
pub const GREATER: Opcode = Opcode(59);
pub const LESS_EQUAL: Opcode = Opcode(60);
pub const GREATER_EQUAL: Opcode = Opcode(61);
/// Identity comparison.
pub const IS: Opcode = Opcode(62);
/// Membership test: stack [needle, haystack].
pub const INVOKE_CONTAINS: Opcode = Opcode(63);

// === Control flow ===
/// Unconditional forward jump. Operand: u16 distance.
pub const JUMP: Opcode = Opcode(64);
/// Backward jump. Operand: u16 distance.
pub const LOOP: Opcode = Opcode(65);
/// Pop TOS; jump if falsy. Operand: u16 distance.
pub const POP_JUMP_IF_FALSE: Opcode = Opcode(66);
/// Pop TOS; jump if truthy. Operand: u16 distance.
pub const POP_JUMP_IF_TRUE: Opcode = Opcode(67);
/// Jump if TOS falsy keeping it, otherwise pop. Operand: u16 distance.
pub const JUMP_IF_FALSE_OR_POP: Opcode = Opcode(68);
/// Jump if TOS truthy keeping it, otherwise pop. Operand: u16 distance.
pub const JUMP_IF_TRUE_OR_POP: Opcode = Opcode(69);
/// `break`/`continue` crossing cleanup regions. Operands: u8 region count,
/// u8 leftover-slot pop count, u16 forward distance to the final target.
pub const EXIT_LOOP: Opcode = Opcode(70);
/// Like `EXIT_LOOP` but the final target is a backward distance (continue).
pub const EXIT_LOOP_BACK: Opcode = Opcode(71);

// === Calls & functions ===
/// Call TOS-k with k positional arguments. Operand: u8 count.
pub const CALL: Opcode = Opcode(72);
/// Push a kwargs marker covering the preceding argument units. Operand: u8
/// unit count. Must be followed by `CALL 0`.
pub const KWARGS: Opcode = Opcode(73);
/// Tag the value below as an argument unit. Operand: u8 mode
/// (0 = positional, 1 = iterable spread, 2 = mapping spread, 3 = keyword,
/// where keyword units are [name, value] and get the marker on top).
pub const EXPAND_ARGS: Opcode = Opcode(74);
/// Create a closure from a code-object constant, followed by
/// `upvalue_count` descriptor pairs (is_local: u8, index: u8/u24 pairs as
/// emitted). Operand: u8 constant index.
pub const CLOSURE: Opcode = Opcode(75);
pub const CLOSURE_LONG: Opcode = Opcode(76);
/// Return TOS from the current frame, running pending cleanups first.
pub const RETURN: Opcode = Opcode(77);
/// Push `Bool(local slot is unbound)`. Operand: u8 slot.
pub const TEST_UNSET: Opcode = Opcode(78);
pub const TEST_UNSET_LONG: Opcode = Opcode(79);

// === Exceptions ===
/// Push a `try` handler. Operand: u16 forward distance to the handler.
pub const PUSH_TRY: Opcode = Opcode(80);
/// Raise TOS (classes are instantiated first).
pub const RAISE: Opcode = Opcode(81);
/// Stack [exc, cause]: raise exc with `__cause__` set to cause.
pub const RAISE_FROM: Opcode = Opcode(82);
/// Re-raise the exception currently being handled.
pub const RERAISE: Opcode = Opcode(83);
/// Except-clause filter. Pops the filter (class or tuple); if the pending
/// exception does not match, jump. Otherwise push the exception.
/// Operand: u16 forward distance.
pub const FILTER_EXCEPT: Opcode = Opcode(84);
/// Pop the handler slot and clear the handled exception.
pub const POP_EXCEPT: Opcode = Opcode(85);
/// Normal-path entry to a cleanup block: re-tag the handler as `Normal`.
pub const BEGIN_FINALLY: Opcode = Opcode(86);
/// End of a `finally` block: dispatch on the pending-action marker.
pub const END_FINALLY: Opcode = Opcode(87);

// === Context managers ===
/// Pop the manager, push its bound `__exit__`, push a `with` handler, call
/// `__enter__` and push the result. Operand: u16 forward distance to the
/// cleanup block.
pub const PUSH_WITH: Opcode = Opcode(88);
/// End of a `with` cleanup block: call `__exit__` and dispatch on the
/// pending-action marker.
pub const CLEANUP_WITH: Opcode = Opcode(89);

// === Iteration / generators ===
/// Replace TOS with an iterator over it.
pub const INVOKE_ITER: Opcode = Opcode(90);
/// Await TOS: delegate like `yield from`, restricted to awaitables.
pub const INVOKE_AWAIT: Opcode = Opcode(91);
/// Suspend the generator frame, yielding TOS to the resumer.
pub const YIELD: Opcode = Opcode(92);
/// Delegate to the iterator at TOS until it is exhausted.
pub const YIELD_FROM: Opcode = Opcode(93);

// === Classes ===
/// Create a new class named by the constant. Operand: u8 constant index.
pub const CLASS: Opcode = Opcode(94);
pub const CLASS_LONG: Opcode = Opcode(95);
/// Pop a base class and attach it to the class in local slot 0.
pub const INHERIT: Opcode = Opcode(96);
/// Pop TOS and store it as a named attribute of the class in local slot 0.
/// Operand: u8 name constant.
pub const CLASS_PROPERTY: Opcode = Opcode(97);
pub const CLASS_PROPERTY_LONG: Opcode = Opcode(98);
/// Finalize the class at TOS: snapshot special-method slots, register with
/// the base, run `__init_subclass__` and `__set_name__` hooks.
pub const FINALIZE: Opcode = Opcode(99);
/// Pop an annotation value for the named attribute. Operand: u8 name constant.
pub const ANNOTATE: Opcode = Opcode(100);
/// Pop TOS and store it as the docstring of the class in local slot 0.
pub const DOCSTRING: Opcode = Opcode(101);

// === Containers ===
/// Pop k values, push a tuple. Operand: u8 count.
pub const TUPLE: Opcode = Opcode(102);
pub const TUPLE_LONG: Opcode = Opcode(103);
/// Unpack an iterable at TOS into exactly k values. Operand: u8 count.
pub const UNPACK: Opcode = Opcode(104);
/// Pop k values, push a list. Operand: u8 count.
pub const MAKE_LIST: Opcode = Opcode(105);
pub const MAKE_LIST_LONG: Opcode = Opcode(106);
/// Pop 2k values (key/value pairs), push a dict. Operand: u8 count.
pub const MAKE_DICT: Opcode = Opcode(107);
pub const MAKE_DICT_LONG: Opcode = Opcode(108);
/// Pop k values, push a set. Operand: u8 count.
pub const MAKE_SET: Opcode = Opcode(109);
pub const MAKE_SET_LONG: Opcode = Opcode(110);
/// Pop TOS and append it to the list in the given local slot. Operand: u8 slot.
pub const LIST_APPEND: Opcode = Opcode(111);
/// Pop value then key and insert into the dict in the given local slot.
/// Operand: u8 slot.
pub const DICT_SET: Opcode = Opcode(112);
/// Pop TOS and add it to the set in the given local slot. Operand: u8 slot.
pub const SET_ADD: Opcode = Opcode(113);

// === Imports ===
/// Import the dotted module named by the constant; push the root module of
/// the chain. Operand: u8 constant index.
pub const IMPORT: Opcode = Opcode(114);
pub const IMPORT_LONG: Opcode = Opcode(115);
/// Pop a module, push its named attribute. Operand: u8 name constant.
pub const IMPORT_FROM: Opcode = Opcode(116);
pub const IMPORT_FROM_LONG: Opcode = Opcode(117);

// === String conversion (f-strings) ===
/// Replace TOS with `str(TOS)`.
pub const INVOKE_STR: Opcode = Opcode(118);
/// Replace TOS with `repr(TOS)`.
pub const INVOKE_REPR: Opcode = Opcode(119);

/// No operation.
pub const NOP: Opcode = Opcode(120);
/// Push a `finally` handler. Operand: u16 forward distance to the block.
pub const PUSH_FINALLY: Opcode = Opcode(121);

/// Argument-unit modes for `EXPAND_ARGS`.
pub mod arg_mode {
    pub const POSITIONAL: u8 = 0;
    pub const ITERABLE_SPREAD: u8 = 1;
    pub const MAPPING_SPREAD: u8 = 2;
    pub const KEYWORD: u8 = 3;
}

/// Returns the opcode's printable name for the disassembler.
#[must_use]
pub fn name(op: Opcode) -> &'static str {
    match op {
        POP => "POP",
        POP_MANY => "POP_MANY",
        DUP => "DUP",
        SWAP => "SWAP",
        REVERSE => "REVERSE",
        CONSTANT => "CONSTANT",
        CONSTANT_LONG => "CONSTANT_LONG",
        NONE => "NONE",
        TRUE => "TRUE",
        FALSE => "FALSE",
        NOT_IMPL => "NOT_IMPL",
        GET_LOCAL => "GET_LOCAL",
        GET_LOCAL_LONG => "GET_LOCAL_LONG",
        SET_LOCAL => "SET_LOCAL",
        SET_LOCAL_LONG => "SET_LOCAL_LONG",
        DEL_LOCAL => "DEL_LOCAL",
        DEL_LOCAL_LONG => "DEL_LOCAL_LONG",
        GET_GLOBAL => "GET_GLOBAL",
        GET_GLOBAL_LONG => "GET_GLOBAL_LONG",
        SET_GLOBAL => "SET_GLOBAL",
        SET_GLOBAL_LONG => "SET_GLOBAL_LONG",
        DEL_GLOBAL => "DEL_GLOBAL",
        DEL_GLOBAL_LONG => "DEL_GLOBAL_LONG",
        GET_UPVALUE => "GET_UPVALUE",
        GET_UPVALUE_LONG => "GET_UPVALUE_LONG",
        SET_UPVALUE => "SET_UPVALUE",
        SET_UPVALUE_LONG => "SET_UPVALUE_LONG",
        CLOSE_UPVALUE => "CLOSE_UPVALUE",
        GET_PROPERTY => "GET_PROPERTY",
        GET_PROPERTY_LONG => "GET_PROPERTY_LONG",
        SET_PROPERTY => "SET_PROPERTY",
        SET_PROPERTY_LONG => "SET_PROPERTY_LONG",
        DEL_PROPERTY => "DEL_PROPERTY",
        DEL_PROPERTY_LONG => "DEL_PROPERTY_LONG",
        GET_SUPER => "GET_SUPER",
        GET_SUPER_LONG => "GET_SUPER_LONG",
        INVOKE_GETTER => "INVOKE_GETTER",
        INVOKE_SETTER => "INVOKE_SETTER",
        INVOKE_DELETE => "INVOKE_DELETE",
        INVOKE_GETSLICE => "INVOKE_GETSLICE",
        INVOKE_SETSLICE => "INVOKE_SETSLICE",
        INVOKE_DELSLICE => "INVOKE_DELSLICE",
        ADD => "ADD",
        SUB => "SUB",
        MUL => "MUL",
        DIV => "DIV",
        FLOORDIV => "FLOORDIV",
        MOD => "MOD",
        POW => "POW",
        SHIFTLEFT => "SHIFTLEFT",
        SHIFTRIGHT => "SHIFTRIGHT",
        BITOR => "BITOR",
        BITXOR => "BITXOR",
        BITAND => "BITAND",
        NEGATE => "NEGATE",
        NOT => "NOT",
        BITNEGATE => "BITNEGATE",
        EQUAL => "EQUAL",
        LESS => "LESS",
        GREATER => "GREATER",
        LESS_EQUAL => "LESS_EQUAL",
        GREATER_EQUAL => "GREATER_EQUAL",
        IS => "IS",
        INVOKE_CONTAINS => "INVOKE_CONTAINS",
        JUMP => "JUMP",
        LOOP => "LOOP",
        POP_JUMP_IF_FALSE => "POP_JUMP_IF_FALSE",
        POP_JUMP_IF_TRUE => "POP_JUMP_IF_TRUE",
        JUMP_IF_FALSE_OR_POP => "JUMP_IF_FALSE_OR_POP",
        JUMP_IF_TRUE_OR_POP => "JUMP_IF_TRUE_OR_POP",
        EXIT_LOOP => "EXIT_LOOP",
        EXIT_LOOP_BACK => "EXIT_LOOP_BACK",
        CALL => "CALL",
        KWARGS => "KWARGS",
        EXPAND_ARGS => "EXPAND_ARGS",
        CLOSURE => "CLOSURE",
        CLOSURE_LONG => "CLOSURE_LONG",
        RETURN => "RETURN",
        TEST_UNSET => "TEST_UNSET",
        TEST_UNSET_LONG => "TEST_UNSET_LONG",
        PUSH_TRY => "PUSH_TRY",
        RAISE => "RAISE",
        RAISE_FROM => "RAISE_FROM",
        RERAISE => "RERAISE",
        FILTER_EXCEPT => "FILTER_EXCEPT",
        POP_EXCEPT => "POP_EXCEPT",
        BEGIN_FINALLY => "BEGIN_FINALLY",
        END_FINALLY => "END_FINALLY",
        PUSH_WITH => "PUSH_WITH",
        CLEANUP_WITH => "CLEANUP_WITH",
        INVOKE_ITER => "INVOKE_ITER",
        INVOKE_AWAIT => "INVOKE_AWAIT",
        YIELD => "YIELD",
        YIELD_FROM => "YIELD_FROM",
        CLASS => "CLASS",
        CLASS_LONG => "CLASS_LONG",
        INHERIT => "INHERIT",
        CLASS_PROPERTY => "CLASS_PROPERTY",
        CLASS_PROPERTY_LONG => "CLASS_PROPERTY_LONG",
        FINALIZE => "FINALIZE",
        ANNOTATE => "ANNOTATE",
        DOCSTRING => "DOCSTRING",
        TUPLE => "TUPLE",
        TUPLE_LONG => "TUPLE_LONG",
        UNPACK => "UNPACK",
        MAKE_LIST => "MAKE_LIST",
        MAKE_LIST_LONG => "MAKE_LIST_LONG",
        MAKE_DICT => "MAKE_DICT",
        MAKE_DICT_LONG => "MAKE_DICT_LONG",
        MAKE_SET => "MAKE_SET",
        MAKE_SET_LONG => "MAKE_SET_LONG",
        LIST_APPEND => "LIST_APPEND",
        DICT_SET => "DICT_SET",
        SET_ADD => "SET_ADD",
        IMPORT => "IMPORT",
        IMPORT_LONG => "IMPORT_LONG",
        IMPORT_FROM => "IMPORT_FROM",
        IMPORT_FROM_LONG => "IMPORT_FROM_LONG",
        INVOKE_STR => "INVOKE_STR",
        INVOKE_REPR => "INVOKE_REPR",
        NOP => "NOP",
        PUSH_FINALLY => "PUSH_FINALLY",
        Opcode(other) => {
            debug_assert!(false, "unknown opcode {other}");
            "UNKNOWN"
        }
    }
}
