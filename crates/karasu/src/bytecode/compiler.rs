//! Single-pass bytecode compiler.
//!
//! A recursive-descent parser with Pratt precedence tables consumes the
//! scanner's token stream and emits bytecode directly; there is no AST. Each
//! function (including lambdas, comprehensions, generator expressions and
//! class bodies) gets its own `FnCompiler` frame tracking locals, upvalues,
//! loops and open cleanup regions.
//!
//! A handful of constructs cannot be compiled strictly left to right
//! (multi-target assignment, ternary expressions, comprehension bodies).
//! These snapshot the scanner state and the chunk's write cursor, compile
//! the right-hand parts first, then rewind and re-parse the earlier text.

use ahash::AHashMap;
use num_bigint::BigInt;
use std::rc::Rc;

use super::chunk::Chunk;
use super::op::{self, arg_mode, Opcode};
use crate::exceptions::CompileError;
use crate::heap::{Heap, HeapId};
use crate::intern::Interner;
use crate::object::{CodeFlags, CodeObject, HeapData};
use crate::scanner::{Scanner, ScannerState, Token, TokenKind};
use crate::value::Value;

/// Expression precedence, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code)]
enum Precedence {
    None,
    Assignment,
    Comma,
    MustAssign,
    CanAssign,
    Ternary,
    Or,
    And,
    Not,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    BitUnary,
    Exponent,
    Subscript,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Comma,
            Self::Comma => Self::MustAssign,
            Self::MustAssign => Self::CanAssign,
            Self::CanAssign => Self::Ternary,
            Self::Ternary => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Not,
            Self::Not => Self::Comparison,
            Self::Comparison => Self::BitOr,
            Self::BitOr => Self::BitXor,
            Self::BitXor => Self::BitAnd,
            Self::BitAnd => Self::Shift,
            Self::Shift => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::BitUnary,
            Self::BitUnary => Self::Exponent,
            Self::Exponent => Self::Subscript,
            Self::Subscript => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'ctx> = fn(&mut Compiler<'src, 'ctx>);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

/// What kind of function a `FnCompiler` frame is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnType {
    Module,
    Function,
    Method,
    Lambda,
    ClassBody,
    Comprehension,
}

/// A local variable slot.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: u32,
    captured: bool,
}

/// Recorded upvalue descriptor `(index, is_local)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// Kind of an open cleanup/handler region, tracked at compile time so
/// `break`/`continue`/`return` know what they cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupKind {
    /// Plain `try` handler: one anonymous slot, nothing to run.
    Try,
    /// `try`/`finally`: one slot, cleanup block must run.
    Finally,
    /// `with`: two slots (bound `__exit__` + handler), cleanup must run.
    With,
}

#[derive(Debug, Clone, Copy)]
struct CleanupRegion {
    kind: CleanupKind,
    /// Local-slot index of the region's first stack slot.
    slot: usize,
}

/// Loop bookkeeping for `break`/`continue`.
#[derive(Debug)]
struct LoopCtx {
    /// Bytecode offset `continue` jumps back to.
    start: usize,
    /// Slot count before the loop pushed anything.
    base_slots: usize,
    /// Anonymous slots owned by the loop itself (the iterator).
    iter_slots: usize,
    /// Number of open cleanup regions at loop entry.
    cleanup_base: usize,
    /// Operand offsets of pending break jumps to patch at loop end.
    break_patches: Vec<usize>,
}

/// Per-function compilation state.
struct FnCompiler<'src> {
    chunk: Chunk,
    fn_type: FnType,
    name: String,
    qualname: String,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    flags: CodeFlags,
    required_args: Vec<HeapId>,
    optional_args: Vec<HeapId>,
    keyword_only_args: Vec<HeapId>,
    docstring: Option<Value>,
    loops: Vec<LoopCtx>,
    cleanups: Vec<CleanupRegion>,
    name_consts: AHashMap<HeapId, usize>,
}

impl<'src> FnCompiler<'src> {
    fn new(fn_type: FnType, name: String, qualname: String) -> Self {
        Self {
            chunk: Chunk::new(),
            fn_type,
            name,
            qualname,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            flags: CodeFlags::empty(),
            required_args: Vec::new(),
            optional_args: Vec::new(),
            keyword_only_args: Vec::new(),
            docstring: None,
            loops: Vec::new(),
            cleanups: Vec::new(),
            name_consts: AHashMap::new(),
        }
    }
}

/// Saved parse position: scanner state, token pair, and the chunk cursor.
#[derive(Debug, Clone, Copy)]
struct ParsePoint<'src> {
    scanner: ScannerState<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    chunk_len: usize,
}

/// Classification of an expression statement, decided by a token-level scout
/// before any code is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Expression,
    Assignment { targets: usize },
    Augmented(TokenKind),
    Annotated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StmtKind {
    Simple,
    Compound,
}

/// The compiler driver: token window, function frame stack, and the heap /
/// interner used for constants.
pub struct Compiler<'src, 'ctx> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    error: Option<CompileError>,
    panic_mode: bool,
    filename: String,
    heap: &'ctx mut Heap,
    interner: &'ctx mut Interner,
    frames: Vec<FnCompiler<'src>>,
    /// Parse point at the start of the innermost expression, for ternary
    /// and comprehension rewinds.
    expr_start: ParsePoint<'src>,
    /// Indentation of the statement currently being compiled.
    cur_indent: usize,
    /// Upvalue descriptors of the most recently finished frame, consumed by
    /// `emit_closure`.
    last_upvalues: Vec<UpvalueDesc>,
    /// Set when a docstring helper already compiled the rest of the suite.
    block_done: bool,
}

/// Compiles a module body, returning the heap id of its code object.
pub fn compile(
    source: &str,
    filename: &str,
    heap: &mut Heap,
    interner: &mut Interner,
) -> Result<HeapId, CompileError> {
    let mut compiler = Compiler::new(source, filename, heap, interner);
    compiler.run_module()
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    fn new(source: &'src str, filename: &str, heap: &'ctx mut Heap, interner: &'ctx mut Interner) -> Self {
        let scanner = Scanner::new(source);
        let dummy = Token {
            kind: TokenKind::Eol,
            text: &source[0..0],
            line: 0,
            column: 0,
            width: 0,
            line_start: 0,
        };
        let expr_start = ParsePoint {
            scanner: scanner.save(),
            current: dummy,
            previous: dummy,
            chunk_len: 0,
        };
        Self {
            scanner,
            current: dummy,
            previous: dummy,
            error: None,
            panic_mode: false,
            filename: filename.to_owned(),
            heap,
            interner,
            frames: Vec::new(),
            expr_start,
            cur_indent: 0,
            last_upvalues: Vec::new(),
            block_done: false,
        }
    }

    fn run_module(&mut self) -> Result<HeapId, CompileError> {
        self.frames.push(FnCompiler::new(
            FnType::Module,
            "<module>".to_owned(),
            "<module>".to_owned(),
        ));
        self.advance();

        // Module docstring.
        self.skip_blank_lines();
        if self.check(TokenKind::Str) && !self.error_pending() {
            let point = self.save_point();
            let token = self.current;
            self.advance();
            if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
                if let Ok(text) = decode_str_literal(token.text) {
                    let value = self.intern_value(&text);
                    self.frame_mut().docstring = Some(value);
                }
                if self.check(TokenKind::Eol) {
                    self.advance();
                }
            } else {
                self.restore_point(&point);
            }
        }

        while !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Indentation) {
                if self.previous.indent_width() != 0 && !self.check(TokenKind::Eof) {
                    self.error_at_previous("unexpected indent");
                }
                continue;
            }
            if self.match_token(TokenKind::Eol) {
                continue;
            }
            self.cur_indent = 0;
            self.statement_line();
            if self.panic_mode {
                self.synchronize();
            }
        }

        self.emit_op(op::NONE);
        self.emit_op(op::RETURN);

        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let code = self.finish_frame(CodeFlags::MODULE);
        Ok(self.heap.alloc(HeapData::Code(code)))
    }

    fn skip_blank_lines(&mut self) {
        loop {
            if self.check(TokenKind::Indentation) && self.current.indent_width() == 0 {
                self.advance();
            } else if self.check(TokenKind::Eol) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error_pending(&self) -> bool {
        self.error.is_some()
    }

    // ==================================================================
    // Token plumbing
    // ==================================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.scanner.error_message().to_owned();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn save_point(&self) -> ParsePoint<'src> {
        ParsePoint {
            scanner: self.scanner.save(),
            current: self.current,
            previous: self.previous,
            chunk_len: self.frames.last().map_or(0, |f| f.chunk.len()),
        }
    }

    /// Restores scanner and token window only.
    fn restore_point(&mut self, point: &ParsePoint<'src>) {
        self.scanner.restore(point.scanner);
        self.current = point.current;
        self.previous = point.previous;
    }

    /// Restores scanner/tokens and discards code emitted since the point.
    fn rewind_to(&mut self, point: &ParsePoint<'src>) {
        self.restore_point(point);
        let len = point.chunk_len;
        self.frame_mut().chunk.truncate(len);
    }

    // ==================================================================
    // Errors
    // ==================================================================

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        if self.error.is_some() {
            return;
        }
        let source = self.scanner.source();
        let line_end = source[token.line_start..]
            .find('\n')
            .map_or(source.len(), |i| token.line_start + i);
        let line_text = source[token.line_start..line_end].to_owned();
        let func = self.frames.last().map(|f| f.name.clone());
        self.error = Some(CompileError {
            message: message.to_owned(),
            file: self.filename.clone(),
            line: token.line,
            column: token.column,
            width: token.width,
            func,
            line_text,
        });
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    /// Panic-mode recovery: skip to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Eol {
                return;
            }
            self.advance();
        }
    }

    // ==================================================================
    // Emission helpers
    // ==================================================================

    fn frame(&self) -> &FnCompiler<'src> {
        self.frames.last().expect("no active function frame")
    }

    fn frame_mut(&mut self) -> &mut FnCompiler<'src> {
        self.frames.last_mut().expect("no active function frame")
    }

    fn emit_op(&mut self, opcode: Opcode) {
        let line = self.previous.line.max(1);
        self.frame_mut().chunk.write_op(opcode, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line.max(1);
        self.frame_mut().chunk.write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line.max(1);
        self.frame_mut().chunk.write_u16(value, line);
    }

    /// Emits `short`/`long` with the operand in 8- or 24-bit form.
    fn emit_with_operand(&mut self, short: Opcode, long: Opcode, operand: usize) {
        if operand <= 0xff {
            self.emit_op(short);
            self.emit_byte(operand as u8);
        } else if operand < (1 << 24) {
            self.emit_op(long);
            let line = self.previous.line.max(1);
            self.frame_mut().chunk.write_u24(operand as u32, line);
        } else {
            self.error_at_previous("operand exceeds 24-bit range");
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.frame_mut().chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_operand(op::CONSTANT, op::CONSTANT_LONG, index);
    }

    fn intern_value(&mut self, text: &str) -> Value {
        Value::Ref(self.interner.intern(self.heap, text))
    }

    fn intern_id(&mut self, text: &str) -> HeapId {
        self.interner.intern(self.heap, text)
    }

    /// Constant-pool index of an interned name, deduplicated per function.
    fn name_constant(&mut self, name: &str) -> usize {
        let id = self.interner.intern(self.heap, name);
        if let Some(index) = self.frame().name_consts.get(&id) {
            return *index;
        }
        let index = self.frame_mut().chunk.add_constant(Value::Ref(id));
        self.frame_mut().name_consts.insert(id, index);
        index
    }

    /// Emits a forward jump; returns the operand offset to patch.
    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        self.emit_op(opcode);
        let pos = self.frame().chunk.len();
        self.emit_u16(0xffff);
        pos
    }

    fn patch_jump(&mut self, operand_pos: usize) {
        let target = self.frame().chunk.len();
        let distance = target - (operand_pos + 2);
        if distance > 0xffff {
            self.error_at_previous("unsupported far jump");
            return;
        }
        let [hi, lo] = (distance as u16).to_be_bytes();
        let chunk = &mut self.frame_mut().chunk;
        chunk.patch(operand_pos, hi);
        chunk.patch(operand_pos + 1, lo);
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(op::LOOP);
        let distance = self.frame().chunk.len() + 2 - start;
        if distance > 0xffff {
            self.error_at_previous("unsupported far jump");
            self.emit_u16(0);
            return;
        }
        self.emit_u16(distance as u16);
    }

    // ==================================================================
    // Scopes, locals, upvalues
    // ==================================================================

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frame_mut();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.captured;
            self.frame_mut().locals.pop();
            if captured {
                self.emit_op(op::CLOSE_UPVALUE);
            } else {
                self.emit_op(op::POP);
            }
        }
    }

    /// Registers a local for the value currently on top of the stack.
    fn add_local(&mut self, name: &'src str) {
        let depth = self.frame().scope_depth;
        if self.frame().locals.len() >= (1 << 24) {
            self.error_at_previous("too many local variables in function");
            return;
        }
        self.frame_mut().locals.push(Local {
            name,
            depth,
            captured: false,
        });
    }

    /// Pushes an anonymous stack-slot placeholder (handler records, loop
    /// iterators) so slot accounting matches the runtime stack.
    fn add_placeholder(&mut self) {
        let depth = self.frame().scope_depth;
        self.frame_mut().locals.push(Local {
            name: "",
            depth,
            captured: false,
        });
    }

    fn pop_placeholder(&mut self) {
        let local = self.frame_mut().locals.pop();
        debug_assert!(local.is_some_and(|l| l.name.is_empty()), "placeholder imbalance");
    }

    fn resolve_local_in(frame: &FnCompiler<'src>, name: &str) -> Option<usize> {
        frame
            .locals
            .iter()
            .rposition(|local| !local.name.is_empty() && local.name == name)
    }

    fn resolve_local(&self, name: &str) -> Option<usize> {
        Self::resolve_local_in(self.frame(), name)
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u16, is_local: bool) -> usize {
        let desc = UpvalueDesc { index, is_local };
        let frame = &mut self.frames[frame_index];
        if let Some(existing) = frame.upvalues.iter().position(|u| *u == desc) {
            return existing;
        }
        frame.upvalues.push(desc);
        frame.upvalues.len() - 1
    }

    /// Resolves `name` as an upvalue of `frames[frame_index]`, recursively
    /// capturing through enclosing frames.
    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<usize> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;
        // Module-level names are globals, not upvalues.
        if self.frames[enclosing].fn_type == FnType::Module {
            return None;
        }
        if let Some(local) = Self::resolve_local_in(&self.frames[enclosing], name) {
            self.frames[enclosing].locals[local].captured = true;
            return Some(self.add_upvalue(frame_index, local as u16, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_index, upvalue as u16, false));
        }
        None
    }

    fn compile_name_load(&mut self, name: &str) {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_with_operand(op::GET_LOCAL, op::GET_LOCAL_LONG, slot);
        } else if let Some(index) = self.resolve_upvalue(self.frames.len() - 1, name) {
            self.emit_with_operand(op::GET_UPVALUE, op::GET_UPVALUE_LONG, index);
        } else {
            let index = self.name_constant(name);
            self.emit_with_operand(op::GET_GLOBAL, op::GET_GLOBAL_LONG, index);
        }
    }

    /// Stores TOS into `name` (keeping the value on the stack).
    fn compile_name_store(&mut self, name: &str) {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_with_operand(op::SET_LOCAL, op::SET_LOCAL_LONG, slot);
        } else if let Some(index) = self.resolve_upvalue(self.frames.len() - 1, name) {
            self.emit_with_operand(op::SET_UPVALUE, op::SET_UPVALUE_LONG, index);
        } else {
            let index = self.name_constant(name);
            self.emit_with_operand(op::SET_GLOBAL, op::SET_GLOBAL_LONG, index);
        }
    }

    /// True when assignments in the current frame create locals.
    fn in_function_scope(&self) -> bool {
        !matches!(self.frame().fn_type, FnType::Module)
    }

    /// Pre-declares `name` as a fresh local slot (unbound sentinel) if it
    /// does not already resolve; used before compiling assignment RHS.
    fn predeclare_name(&mut self, name: &'src str) {
        if !self.in_function_scope() {
            return;
        }
        if self.resolve_local(name).is_some() {
            return;
        }
        if self.resolve_upvalue(self.frames.len() - 1, name).is_some() {
            return;
        }
        self.emit_constant(Value::Undefined);
        self.add_local(name);
    }

    // ==================================================================
    // Pratt expression parsing
    // ==================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Ternary);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        let start = self.save_point();
        let outer = std::mem::replace(&mut self.expr_start, start);

        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error_at_previous("expected expression");
            self.expr_start = outer;
            return;
        };
        prefix(self);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let Some(infix) = rule(self.previous.kind).infix else {
                break;
            };
            infix(self);
        }

        self.expr_start = outer;
    }

    /// Parses an expression while discarding the generated code; used for
    /// annotations, which this implementation does not evaluate.
    fn skip_expression(&mut self) {
        let len = self.frame().chunk.len();
        self.expression();
        self.frame_mut().chunk.truncate(len);
    }

    // ---- prefix handlers ----

    fn number(&mut self) {
        let raw: String = self.previous.text.chars().filter(|c| *c != '_').collect();
        let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            self.parse_int_radix(hex, 16)
        } else if let Some(oct) = raw.strip_prefix("0o").or_else(|| raw.strip_prefix("0O")) {
            self.parse_int_radix(oct, 8)
        } else if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
            self.parse_int_radix(bin, 2)
        } else if raw.contains('.') || raw.contains('e') || raw.contains('E') {
            match raw.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => {
                    self.error_at_previous("invalid float literal");
                    Value::None
                }
            }
        } else {
            self.parse_int_radix(&raw, 10)
        };
        self.emit_constant(value);
    }

    fn parse_int_radix(&mut self, digits: &str, radix: u32) -> Value {
        if let Ok(value) = i64::from_str_radix(digits, radix) {
            return Value::Int(value);
        }
        match BigInt::parse_bytes(digits.as_bytes(), radix) {
            Some(big) => Value::Ref(self.heap.alloc(HeapData::BigInt(big))),
            None => {
                self.error_at_previous("invalid integer literal");
                Value::None
            }
        }
    }

    fn string(&mut self) {
        let mut text = match decode_str_literal(self.previous.text) {
            Ok(text) => text,
            Err(message) => {
                self.error_at_previous(message);
                return;
            }
        };
        // Implicit adjacent-literal concatenation.
        while self.check(TokenKind::Str) {
            self.advance();
            match decode_str_literal(self.previous.text) {
                Ok(next) => text.push_str(&next),
                Err(message) => {
                    self.error_at_previous(message);
                    return;
                }
            }
        }
        let value = self.intern_value(&text);
        self.emit_constant(value);
    }

    fn bytes_literal(&mut self) {
        match decode_bytes_literal(self.previous.text) {
            Ok(data) => {
                let id = self.heap.alloc(HeapData::Bytes(crate::object::Bytes::new(data)));
                self.emit_constant(Value::Ref(id));
            }
            Err(message) => self.error_at_previous(message),
        }
    }

    /// f-string: literal segments interleaved with `{expr[!r|!s]}` parts,
    /// each expression compiled by re-entering the compiler with a temporary
    /// scanner pointed at the brace body.
    fn fstring(&mut self) {
        let token = self.previous;
        let Some(body) = strip_quotes(token.text) else {
            self.error_at_previous("malformed f-string literal");
            return;
        };

        let mut parts = 0usize;
        let mut literal = String::new();
        let bytes = body.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'{' if i + 1 < bytes.len() && bytes[i + 1] == b'{' => {
                    literal.push('{');
                    i += 2;
                }
                b'}' if i + 1 < bytes.len() && bytes[i + 1] == b'}' => {
                    literal.push('}');
                    i += 2;
                }
                b'{' => {
                    let Some(end) = find_closing_brace(body, i + 1) else {
                        self.error_at_previous("unmatched '{' in f-string");
                        return;
                    };
                    if !literal.is_empty() {
                        self.emit_literal_part(&std::mem::take(&mut literal), &mut parts);
                    }
                    let mut expr = &body[i + 1..end];
                    let mut conversion = op::INVOKE_STR;
                    if let Some(stripped) = expr.strip_suffix("!r") {
                        expr = stripped;
                        conversion = op::INVOKE_REPR;
                    } else if let Some(stripped) = expr.strip_suffix("!s") {
                        expr = stripped;
                    }
                    if expr.trim().is_empty() {
                        self.error_at_previous("empty expression in f-string");
                        return;
                    }
                    self.compile_embedded_expression(expr);
                    self.emit_op(conversion);
                    if parts > 0 {
                        self.emit_op(op::ADD);
                    }
                    parts += 1;
                    i = end + 1;
                }
                b'}' => {
                    self.error_at_previous("single '}' in f-string");
                    return;
                }
                _ => {
                    let ch_len = utf8_len(c);
                    literal.push_str(&body[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        if !literal.is_empty() || parts == 0 {
            let decoded = match decode_escapes(&literal) {
                Ok(text) => text,
                Err(message) => {
                    self.error_at_previous(message);
                    return;
                }
            };
            let value = self.intern_value(&decoded);
            self.emit_constant(value);
            if parts > 0 {
                self.emit_op(op::ADD);
            }
        }
    }

    fn emit_literal_part(&mut self, raw: &str, parts: &mut usize) {
        let decoded = match decode_escapes(raw) {
            Ok(text) => text,
            Err(message) => {
                self.error_at_previous(message);
                return;
            }
        };
        let value = self.intern_value(&decoded);
        self.emit_constant(value);
        if *parts > 0 {
            self.emit_op(op::ADD);
        }
        *parts += 1;
    }

    /// Re-enters the expression parser over an f-string brace body.
    fn compile_embedded_expression(&mut self, expr: &'src str) {
        let saved_scanner = std::mem::replace(&mut self.scanner, Scanner::new(expr));
        let saved_current = self.current;
        let saved_previous = self.previous;

        self.advance(); // leading indentation token
        if self.current.kind == TokenKind::Indentation {
            self.advance();
        }
        self.expression();
        if !matches!(self.current.kind, TokenKind::Eol | TokenKind::Eof) {
            self.error_at_current("unexpected token in f-string expression");
        }

        self.scanner = saved_scanner;
        self.current = saved_current;
        self.previous = saved_previous;
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::None => self.emit_op(op::NONE),
            TokenKind::True => self.emit_op(op::TRUE),
            TokenKind::False => self.emit_op(op::FALSE),
            _ => unreachable!("literal handler on non-literal token"),
        }
    }

    fn variable(&mut self) {
        let name = self.previous.text;
        if name == "NotImplemented" {
            self.emit_op(op::NOT_IMPL);
            return;
        }
        self.compile_name_load(name);
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(op::NEGATE),
            TokenKind::Plus => {}
            _ => unreachable!("unary handler on unexpected token"),
        }
    }

    fn bit_unary(&mut self) {
        self.parse_precedence(Precedence::BitUnary);
        self.emit_op(op::BITNEGATE);
    }

    fn not_expr(&mut self) {
        self.parse_precedence(Precedence::Not);
        self.emit_op(op::NOT);
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let precedence = rule(operator).precedence;
        // `**` is right-associative.
        if operator == TokenKind::StarStar {
            self.parse_precedence(Precedence::Exponent);
        } else {
            self.parse_precedence(precedence.next());
        }
        self.emit_binary_op(operator);
    }

    fn emit_binary_op(&mut self, operator: TokenKind) {
        let opcode = match operator {
            TokenKind::Plus => op::ADD,
            TokenKind::Minus => op::SUB,
            TokenKind::Star => op::MUL,
            TokenKind::Slash => op::DIV,
            TokenKind::SlashSlash => op::FLOORDIV,
            TokenKind::Percent => op::MOD,
            TokenKind::StarStar => op::POW,
            TokenKind::Amp => op::BITAND,
            TokenKind::Pipe => op::BITOR,
            TokenKind::Caret => op::BITXOR,
            TokenKind::LeftShift => op::SHIFTLEFT,
            TokenKind::RightShift => op::SHIFTRIGHT,
            _ => {
                self.error_at_previous("unexpected binary operator");
                return;
            }
        };
        self.emit_op(opcode);
    }

    /// Comparison with chaining: `a < b < c` evaluates `b` once, using the
    /// duplicated middle operand and a short-circuit jump.
    fn comparison(&mut self) {
        let mut operator = self.previous.kind;
        let mut cleanup_jumps: Vec<usize> = Vec::new();
        loop {
            // Negated forms.
            let negate = match operator {
                TokenKind::Not => {
                    self.consume(TokenKind::In, "expected 'in' after 'not'");
                    operator = TokenKind::In;
                    true
                }
                TokenKind::Is if self.match_token(TokenKind::Not) => true,
                _ => false,
            };

            self.parse_precedence(Precedence::BitOr);

            let chains = rule(self.current.kind).precedence == Precedence::Comparison;
            if chains {
                // [a, b] -> [b, a, b]
                self.emit_op(op::DUP);
                self.emit_byte(0);
                self.emit_op(op::REVERSE);
                self.emit_byte(3);
                self.emit_op(op::SWAP);
            }
            self.emit_comparison_op(operator, negate);
            if !chains {
                break;
            }
            cleanup_jumps.push(self.emit_jump(op::JUMP_IF_FALSE_OR_POP));
            self.advance();
            operator = self.previous.kind;
        }
        if !cleanup_jumps.is_empty() {
            let end = self.emit_jump(op::JUMP);
            for jump in cleanup_jumps {
                self.patch_jump(jump);
            }
            // Short-circuit path: [kept_operand, False] -> [False]
            self.emit_op(op::SWAP);
            self.emit_op(op::POP);
            self.patch_jump(end);
        }
    }

    fn emit_comparison_op(&mut self, operator: TokenKind, negate: bool) {
        match operator {
            TokenKind::EqualEqual => self.emit_op(op::EQUAL),
            TokenKind::BangEqual => {
                self.emit_op(op::EQUAL);
                self.emit_op(op::NOT);
            }
            TokenKind::Less => self.emit_op(op::LESS),
            TokenKind::Greater => self.emit_op(op::GREATER),
            TokenKind::LessEqual => self.emit_op(op::LESS_EQUAL),
            TokenKind::GreaterEqual => self.emit_op(op::GREATER_EQUAL),
            TokenKind::Is => {
                self.emit_op(op::IS);
                if negate {
                    self.emit_op(op::NOT);
                }
            }
            TokenKind::In => {
                self.emit_op(op::INVOKE_CONTAINS);
                if negate {
                    self.emit_op(op::NOT);
                }
            }
            _ => self.error_at_previous("unexpected comparison operator"),
        }
    }

    fn and_expr(&mut self) {
        let jump = self.emit_jump(op::JUMP_IF_FALSE_OR_POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(jump);
    }

    fn or_expr(&mut self) {
        let jump = self.emit_jump(op::JUMP_IF_TRUE_OR_POP);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(jump);
    }

    /// Ternary `a if c else b`, compiled by rewinding: the already-parsed
    /// `a` is discarded, `c` compiled first, then `a` re-parsed.
    fn ternary(&mut self) {
        let lhs = self.expr_start;
        self.rewind_to(&lhs);
        // We are back at the start of `a`; skip it token-wise to reach the
        // condition, which is simplest via a discarded parse.
        let len = self.frame().chunk.len();
        self.parse_precedence(Precedence::Or);
        self.frame_mut().chunk.truncate(len);
        self.consume(TokenKind::If, "expected 'if' in conditional expression");

        self.parse_precedence(Precedence::Or);
        let else_jump = self.emit_jump(op::POP_JUMP_IF_FALSE);
        let after_cond = self.save_point();

        self.restore_point(&lhs);
        self.parse_precedence(Precedence::Or);
        let end_jump = self.emit_jump(op::JUMP);

        self.restore_point(&after_cond);
        self.patch_jump(else_jump);
        self.consume(TokenKind::Else, "expected 'else' in conditional expression");
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn grouping(&mut self) {
        // () / (expr) / (a, b) tuple / (expr for ...) generator expression.
        if self.match_token(TokenKind::RightParen) {
            self.emit_with_operand(op::TUPLE, op::TUPLE_LONG, 0);
            return;
        }
        let start = self.save_point();
        self.expression();
        if self.check(TokenKind::For) {
            self.rewind_to(&start);
            self.comprehension(ComprehensionKind::Generator);
            self.consume(TokenKind::RightParen, "expected ')' after generator expression");
            return;
        }
        if self.check(TokenKind::Comma) {
            let mut count = 1usize;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::RightParen) {
                    break;
                }
                self.expression();
                count += 1;
            }
            self.emit_with_operand(op::TUPLE, op::TUPLE_LONG, count);
        }
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn list_display(&mut self) {
        if self.match_token(TokenKind::RightBracket) {
            self.emit_with_operand(op::MAKE_LIST, op::MAKE_LIST_LONG, 0);
            return;
        }
        let start = self.save_point();
        self.expression();
        if self.check(TokenKind::For) {
            self.rewind_to(&start);
            self.comprehension(ComprehensionKind::List);
            self.consume(TokenKind::RightBracket, "expected ']' after list comprehension");
            return;
        }
        let mut count = 1usize;
        while self.match_token(TokenKind::Comma) {
            if self.check(TokenKind::RightBracket) {
                break;
            }
            self.expression();
            count += 1;
        }
        self.consume(TokenKind::RightBracket, "expected ']' after list literal");
        self.emit_with_operand(op::MAKE_LIST, op::MAKE_LIST_LONG, count);
    }

    fn dict_display(&mut self) {
        if self.match_token(TokenKind::RightBrace) {
            self.emit_with_operand(op::MAKE_DICT, op::MAKE_DICT_LONG, 0);
            return;
        }
        let start = self.save_point();
        self.expression();
        if self.check(TokenKind::Colon) {
            // Dict literal or dict comprehension.
            self.advance();
            self.expression();
            if self.check(TokenKind::For) {
                self.rewind_to(&start);
                self.comprehension(ComprehensionKind::Dict);
                self.consume(TokenKind::RightBrace, "expected '}' after dict comprehension");
                return;
            }
            let mut count = 1usize;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::RightBrace) {
                    break;
                }
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' in dict literal");
                self.expression();
                count += 1;
            }
            self.consume(TokenKind::RightBrace, "expected '}' after dict literal");
            self.emit_with_operand(op::MAKE_DICT, op::MAKE_DICT_LONG, count);
        } else {
            // Set literal or set comprehension.
            if self.check(TokenKind::For) {
                self.rewind_to(&start);
                self.comprehension(ComprehensionKind::Set);
                self.consume(TokenKind::RightBrace, "expected '}' after set comprehension");
                return;
            }
            let mut count = 1usize;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::RightBrace) {
                    break;
                }
                self.expression();
                count += 1;
            }
            self.consume(TokenKind::RightBrace, "expected '}' after set literal");
            self.emit_with_operand(op::MAKE_SET, op::MAKE_SET_LONG, count);
        }
    }

    fn lambda(&mut self) {
        let qualname = format!("{}.<lambda>", self.frame().qualname);
        self.frames.push(FnCompiler::new(FnType::Lambda, "<lambda>".to_owned(), qualname));
        self.begin_scope();
        if !self.check(TokenKind::Colon) {
            self.parameter_list(TokenKind::Colon);
        }
        self.consume(TokenKind::Colon, "expected ':' after lambda parameters");
        self.expression();
        self.emit_op(op::RETURN);
        let code = self.finish_frame(CodeFlags::empty());
        self.emit_closure(code);
    }

    fn dot(&mut self) {
        self.consume(TokenKind::Identifier, "expected attribute name after '.'");
        let name = self.previous.text.to_owned();
        let index = self.name_constant(&name);
        self.emit_with_operand(op::GET_PROPERTY, op::GET_PROPERTY_LONG, index);
    }

    fn subscript(&mut self) {
        // a[i], a[i:j], a[i:j:k]; missing slice components become None.
        if self.slice_components() {
            self.emit_op(op::INVOKE_GETSLICE);
        } else {
            self.emit_op(op::INVOKE_GETTER);
        }
        self.consume(TokenKind::RightBracket, "expected ']' after subscript");
    }

    /// Compiles subscript contents up to (not including) the closing `]`.
    /// Returns true for slice syntax, having pushed start/stop/step.
    fn slice_components(&mut self) -> bool {
        let mut is_slice = false;
        if self.check(TokenKind::Colon) {
            self.emit_op(op::NONE);
            is_slice = true;
        } else {
            self.expression();
        }
        if self.match_token(TokenKind::Colon) {
            is_slice = true;
            if self.check(TokenKind::RightBracket) || self.check(TokenKind::Colon) {
                self.emit_op(op::NONE);
            } else {
                self.expression();
            }
            if self.match_token(TokenKind::Colon) {
                if self.check(TokenKind::RightBracket) {
                    self.emit_op(op::NONE);
                } else {
                    self.expression();
                }
            } else {
                self.emit_op(op::NONE);
            }
        }
        is_slice
    }

    fn call(&mut self) {
        // Scout for keyword arguments or spreads, which switch the call to
        // the argument-unit encoding.
        let complex = self.call_is_complex();
        if complex {
            self.complex_call();
            return;
        }
        let mut count = 0usize;
        if !self.check(TokenKind::RightParen) {
            let first_arg = self.save_point();
            loop {
                self.expression();
                if count == 0 && self.check(TokenKind::For) {
                    // Bare generator-expression argument: f(x for x in xs).
                    self.rewind_to(&first_arg);
                    self.comprehension(ComprehensionKind::Generator);
                    count = 1;
                    break;
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        if count > 0xff {
            self.error_at_previous("too many arguments in call");
            return;
        }
        self.emit_op(op::CALL);
        self.emit_byte(count as u8);
    }

    /// Token-level lookahead deciding whether the call needs keyword/spread
    /// encoding.
    fn call_is_complex(&mut self) -> bool {
        let mut scanner = self.scanner.clone();
        let mut token = self.current;
        let mut depth = 0i32;
        let mut prev_kind = TokenKind::LeftParen;
        loop {
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                TokenKind::Equal if depth == 0 => return true,
                TokenKind::Star | TokenKind::StarStar
                    if depth == 0 && matches!(prev_kind, TokenKind::LeftParen | TokenKind::Comma) =>
                {
                    return true;
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            prev_kind = token.kind;
            token = scanner.scan_token();
        }
    }

    /// Call with keyword arguments and/or spreads: each argument becomes a
    /// marker-tagged unit, closed by `KWARGS n` and `CALL 0`.
    fn complex_call(&mut self) {
        let mut units = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.match_token(TokenKind::Star) {
                    self.expression();
                    self.emit_op(op::EXPAND_ARGS);
                    self.emit_byte(arg_mode::ITERABLE_SPREAD);
                } else if self.match_token(TokenKind::StarStar) {
                    self.expression();
                    self.emit_op(op::EXPAND_ARGS);
                    self.emit_byte(arg_mode::MAPPING_SPREAD);
                } else if self.is_keyword_argument() {
                    self.consume(TokenKind::Identifier, "expected keyword argument name");
                    let name = self.previous.text.to_owned();
                    let value = self.intern_value(&name);
                    self.emit_constant(value);
                    self.consume(TokenKind::Equal, "expected '=' after keyword name");
                    self.expression();
                    self.emit_op(op::EXPAND_ARGS);
                    self.emit_byte(arg_mode::KEYWORD);
                } else {
                    self.expression();
                    self.emit_op(op::EXPAND_ARGS);
                    self.emit_byte(arg_mode::POSITIONAL);
                }
                units += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightParen) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        if units > 0xff {
            self.error_at_previous("too many arguments in call");
            return;
        }
        self.emit_op(op::KWARGS);
        self.emit_byte(units as u8);
        self.emit_op(op::CALL);
        self.emit_byte(0);
    }

    fn is_keyword_argument(&mut self) -> bool {
        if !self.check(TokenKind::Identifier) {
            return false;
        }
        // The identifier is the current token, so the cloned scanner's next
        // token is the one following it.
        let mut scanner = self.scanner.clone();
        scanner.scan_token().kind == TokenKind::Equal
    }

    fn super_expr(&mut self) {
        if self.frame().fn_type != FnType::Method {
            self.error_at_previous("'super' outside of a method");
        }
        self.consume(TokenKind::LeftParen, "expected '(' after 'super'");
        self.consume(TokenKind::RightParen, "expected ')' — super() takes no arguments");
        self.consume(TokenKind::Dot, "expected '.' after super()");
        self.consume(TokenKind::Identifier, "expected method name after 'super().'");
        let name = self.previous.text.to_owned();
        // Receiver and the enclosing class, captured from the class body.
        self.emit_with_operand(op::GET_LOCAL, op::GET_LOCAL_LONG, 0);
        self.compile_name_load("__class__");
        let index = self.name_constant(&name);
        self.emit_with_operand(op::GET_SUPER, op::GET_SUPER_LONG, index);
    }

    fn yield_expr(&mut self) {
        match self.frame().fn_type {
            FnType::Function | FnType::Method | FnType::Lambda | FnType::Comprehension => {}
            _ => self.error_at_previous("'yield' outside of a function"),
        }
        if self.frame().flags.contains(CodeFlags::COROUTINE) {
            // Coroutines may yield; they stay coroutines.
        }
        self.frame_mut().flags |= CodeFlags::GENERATOR;
        if self.match_token(TokenKind::From) {
            self.parse_precedence(Precedence::Ternary);
            self.emit_op(op::INVOKE_ITER);
            // Delegation keeps [iterator, sent] on the stack; the first
            // resume sends None.
            self.emit_op(op::NONE);
            self.emit_op(op::YIELD_FROM);
        } else if self.check(TokenKind::Eol)
            || self.check(TokenKind::Eof)
            || self.check(TokenKind::RightParen)
            || self.check(TokenKind::Semicolon)
        {
            self.emit_op(op::NONE);
            self.emit_op(op::YIELD);
        } else {
            self.parse_precedence(Precedence::Ternary);
            self.emit_op(op::YIELD);
        }
    }

    fn await_expr(&mut self) {
        if !self.frame().flags.contains(CodeFlags::COROUTINE) {
            self.error_at_previous("'await' outside of an async function");
        }
        self.parse_precedence(Precedence::Unary);
        self.emit_op(op::INVOKE_AWAIT);
        self.emit_op(op::NONE);
        self.emit_op(op::YIELD_FROM);
    }

    // ==================================================================
    // Comprehensions
    // ==================================================================

    fn comprehension(&mut self, kind: ComprehensionKind) {
        // Scanner is at the element expression; clauses follow.
        let element = self.save_point();
        let (name, flags, accumulator) = match kind {
            ComprehensionKind::List => ("<listcomp>", CodeFlags::empty(), Some(op::MAKE_LIST)),
            ComprehensionKind::Set => ("<setcomp>", CodeFlags::empty(), Some(op::MAKE_SET)),
            ComprehensionKind::Dict => ("<dictcomp>", CodeFlags::empty(), Some(op::MAKE_DICT)),
            ComprehensionKind::Generator => ("<genexpr>", CodeFlags::GENERATOR, None),
        };
        let qualname = format!("{}.{}", self.frame().qualname, name);
        self.frames.push(FnCompiler::new(FnType::Comprehension, name.to_owned(), qualname));
        self.frame_mut().flags |= flags;
        self.begin_scope();

        if let Some(make) = accumulator {
            let long = match make {
                o if o == op::MAKE_LIST => op::MAKE_LIST_LONG,
                o if o == op::MAKE_SET => op::MAKE_SET_LONG,
                _ => op::MAKE_DICT_LONG,
            };
            self.emit_with_operand(make, long, 0);
            self.add_local("<accumulator>");
        }

        // Skip the element expression(s) token-wise to reach the clauses.
        let len = self.frame().chunk.len();
        self.expression();
        if matches!(kind, ComprehensionKind::Dict) {
            self.consume(TokenKind::Colon, "expected ':' in dict comprehension");
            self.expression();
        }
        self.frame_mut().chunk.truncate(len);

        let mut end_point = self.save_point();
        self.comprehension_clauses(&element, &kind, &mut end_point);

        if accumulator.is_some() {
            self.emit_with_operand(op::GET_LOCAL, op::GET_LOCAL_LONG, 0);
            self.emit_op(op::RETURN);
        } else {
            self.emit_op(op::NONE);
            self.emit_op(op::RETURN);
        }
        let gen_flags = self.frame().flags;
        let code = self.finish_frame(gen_flags);
        self.restore_point(&end_point);
        self.emit_closure(code);
        self.emit_op(op::CALL);
        self.emit_byte(0);
    }

    /// Recursively compiles `for`/`if` clauses; at the innermost position
    /// the element expression is re-parsed and accumulated/yielded.
    fn comprehension_clauses(
        &mut self,
        element: &ParsePoint<'src>,
        kind: &ComprehensionKind,
        end_point: &mut ParsePoint<'src>,
    ) {
        if self.match_token(TokenKind::For) {
            // Pre-declare loop targets.
            let mut names: Vec<&'src str> = Vec::new();
            self.collect_target_names_simple(&mut names);
            for name in &names {
                if self.resolve_local(name).is_none() {
                    self.emit_constant(Value::Undefined);
                    self.add_local(name);
                }
            }
            self.consume(TokenKind::In, "expected 'in' in comprehension");
            // The iterable cannot be an unparenthesized ternary: `if` starts
            // the next clause.
            self.parse_precedence(Precedence::Or);
            self.emit_op(op::INVOKE_ITER);
            self.add_placeholder(); // iterator slot

            let loop_start = self.frame().chunk.len();
            self.emit_op(op::DUP);
            self.emit_byte(0);
            self.emit_op(op::CALL);
            self.emit_byte(0);
            self.emit_op(op::DUP);
            self.emit_byte(1);
            self.emit_op(op::DUP);
            self.emit_byte(1);
            self.emit_op(op::IS);
            let exit_jump = self.emit_jump(op::POP_JUMP_IF_TRUE);
            self.store_unpack_names(&names);

            self.comprehension_clauses(element, kind, end_point);

            self.emit_loop(loop_start);
            self.patch_jump(exit_jump);
            self.emit_op(op::POP_MANY);
            self.emit_byte(2);
            self.pop_placeholder();
        } else if self.match_token(TokenKind::If) {
            self.parse_precedence(Precedence::Or);
            let skip = self.emit_jump(op::POP_JUMP_IF_FALSE);
            self.comprehension_clauses(element, kind, end_point);
            self.patch_jump(skip);
        } else {
            // Innermost: emit the element.
            *end_point = self.save_point();
            self.restore_point(element);
            match kind {
                ComprehensionKind::List => {
                    self.expression();
                    self.emit_op(op::LIST_APPEND);
                    self.emit_byte(0);
                }
                ComprehensionKind::Set => {
                    self.expression();
                    self.emit_op(op::SET_ADD);
                    self.emit_byte(0);
                }
                ComprehensionKind::Dict => {
                    self.expression();
                    self.consume(TokenKind::Colon, "expected ':' in dict comprehension");
                    self.expression();
                    self.emit_op(op::DICT_SET);
                    self.emit_byte(0);
                }
                ComprehensionKind::Generator => {
                    self.expression();
                    self.emit_op(op::YIELD);
                    self.emit_op(op::POP);
                }
            }
            self.restore_point(&*end_point);
        }
    }

    /// Collects the simple names of a `for` target (name or tuple of names).
    fn collect_target_names_simple(&mut self, out: &mut Vec<&'src str>) {
        loop {
            if self.match_token(TokenKind::LeftParen) {
                self.collect_target_names_simple(out);
                self.consume(TokenKind::RightParen, "expected ')' in assignment target");
            } else {
                self.consume(TokenKind::Identifier, "expected name in assignment target");
                out.push(self.previous.text);
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
            if self.check(TokenKind::In) || self.check(TokenKind::RightParen) {
                break;
            }
        }
    }

    /// Stores TOS into the given pre-declared names, unpacking tuples.
    fn store_unpack_names(&mut self, names: &[&'src str]) {
        if names.len() == 1 {
            self.compile_name_store(names[0]);
            self.emit_op(op::POP);
        } else {
            self.emit_op(op::UNPACK);
            self.emit_byte(names.len() as u8);
            self.emit_op(op::REVERSE);
            self.emit_byte(names.len() as u8);
            for name in names {
                self.compile_name_store(name);
                self.emit_op(op::POP);
            }
        }
    }

    // ==================================================================
    // Statements
    // ==================================================================

    /// One logical line: simple statements separated by `;`, or a single
    /// compound statement.
    fn statement_line(&mut self) {
        loop {
            let kind = self.statement();
            if kind == StmtKind::Compound {
                return;
            }
            if self.match_token(TokenKind::Semicolon) {
                if self.check(TokenKind::Eol) {
                    break;
                }
                continue;
            }
            break;
        }
        if !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Eol, "expected end of line after statement");
        }
    }

    fn statement(&mut self) -> StmtKind {
        match self.current.kind {
            TokenKind::If => {
                self.advance();
                self.if_statement();
                StmtKind::Compound
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
                StmtKind::Compound
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
                StmtKind::Compound
            }
            TokenKind::Def => {
                self.advance();
                self.def_statement(false);
                StmtKind::Compound
            }
            TokenKind::Async => {
                self.advance();
                if self.match_token(TokenKind::Def) {
                    self.def_statement(true);
                } else if self.check(TokenKind::For) {
                    self.error_at_current("async for loops are not implemented");
                } else if self.check(TokenKind::With) {
                    self.error_at_current("async with blocks are not implemented");
                } else {
                    self.error_at_current("expected 'def' after 'async'");
                }
                StmtKind::Compound
            }
            TokenKind::Class => {
                self.advance();
                self.class_statement();
                StmtKind::Compound
            }
            TokenKind::At => {
                self.decorated_statement();
                StmtKind::Compound
            }
            TokenKind::Try => {
                self.advance();
                self.try_statement();
                StmtKind::Compound
            }
            TokenKind::With => {
                self.advance();
                self.with_statement();
                StmtKind::Compound
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
                StmtKind::Simple
            }
            TokenKind::Raise => {
                self.advance();
                self.raise_statement();
                StmtKind::Simple
            }
            TokenKind::Import => {
                self.advance();
                self.import_statement();
                StmtKind::Simple
            }
            TokenKind::From => {
                self.advance();
                self.from_import_statement();
                StmtKind::Simple
            }
            TokenKind::Del => {
                self.advance();
                self.del_statement();
                StmtKind::Simple
            }
            TokenKind::Assert => {
                self.advance();
                self.assert_statement();
                StmtKind::Simple
            }
            TokenKind::Pass => {
                self.advance();
                StmtKind::Simple
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
                StmtKind::Simple
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
                StmtKind::Simple
            }
            _ => {
                self.expression_statement();
                StmtKind::Simple
            }
        }
    }

    /// Compiles an indented suite (or inline simple-statement suite) whose
    /// header line sits at `parent_indent`.
    fn block(&mut self, parent_indent: usize) {
        if self.match_token(TokenKind::Eol) {
            let mut body_indent: Option<usize> = None;
            loop {
                if self.check(TokenKind::Eof) {
                    break;
                }
                if !self.check(TokenKind::Indentation) {
                    break;
                }
                let width = self.current.indent_width();
                match body_indent {
                    None => {
                        if width <= parent_indent {
                            self.error_at_current("expected an indented block");
                            return;
                        }
                        body_indent = Some(width);
                    }
                    Some(expected) => {
                        if width < expected {
                            break;
                        }
                        if width > expected {
                            self.error_at_current("unexpected indent");
                            return;
                        }
                    }
                }
                self.advance();
                if self.match_token(TokenKind::Eol) {
                    continue;
                }
                self.cur_indent = width;
                self.statement_line();
                if self.panic_mode {
                    self.synchronize();
                }
            }
            if body_indent.is_none() {
                self.error_at_current("expected an indented block");
            }
        } else {
            self.statement_line();
        }
    }

    /// If the next line sits at `indent` and begins with one of `kinds`,
    /// consumes the indentation and returns true, leaving the keyword as the
    /// current token.
    fn at_dedent_keyword(&mut self, indent: usize, kinds: &[TokenKind]) -> bool {
        if !self.check(TokenKind::Indentation) || self.current.indent_width() != indent {
            return false;
        }
        let point = self.save_point();
        self.advance();
        if kinds.contains(&self.current.kind) {
            return true;
        }
        self.restore_point(&point);
        false
    }

    fn if_statement(&mut self) {
        let indent = self.cur_indent;
        self.expression();
        self.consume(TokenKind::Colon, "expected ':' after condition");
        let then_jump = self.emit_jump(op::POP_JUMP_IF_FALSE);
        self.begin_scope();
        self.block(indent);
        self.end_scope();

        let mut end_jumps = Vec::new();
        if self.at_dedent_keyword(indent, &[TokenKind::Elif, TokenKind::Else]) {
            end_jumps.push(self.emit_jump(op::JUMP));
            self.patch_jump(then_jump);
            loop {
                if self.match_token(TokenKind::Elif) {
                    self.expression();
                    self.consume(TokenKind::Colon, "expected ':' after condition");
                    let next_jump = self.emit_jump(op::POP_JUMP_IF_FALSE);
                    self.begin_scope();
                    self.block(indent);
                    self.end_scope();
                    if self.at_dedent_keyword(indent, &[TokenKind::Elif, TokenKind::Else]) {
                        end_jumps.push(self.emit_jump(op::JUMP));
                        self.patch_jump(next_jump);
                        continue;
                    }
                    self.patch_jump(next_jump);
                    break;
                }
                self.consume(TokenKind::Else, "expected 'elif' or 'else'");
                self.consume(TokenKind::Colon, "expected ':' after 'else'");
                self.begin_scope();
                self.block(indent);
                self.end_scope();
                break;
            }
            for jump in end_jumps {
                self.patch_jump(jump);
            }
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn while_statement(&mut self) {
        let indent = self.cur_indent;
        let loop_start = self.frame().chunk.len();
        self.expression();
        self.consume(TokenKind::Colon, "expected ':' after condition");
        let exit_jump = self.emit_jump(op::POP_JUMP_IF_FALSE);

        self.push_loop(loop_start, 0);
        self.begin_scope();
        self.block(indent);
        self.end_scope();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        if self.at_dedent_keyword(indent, &[TokenKind::Else]) {
            self.advance();
            self.consume(TokenKind::Colon, "expected ':' after 'else'");
            self.begin_scope();
            self.block(indent);
            self.end_scope();
        }
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        let indent = self.cur_indent;
        let mut names: Vec<&'src str> = Vec::new();
        self.collect_target_names_simple(&mut names);
        for name in &names {
            if self.in_function_scope() {
                if self.resolve_local(name).is_none() {
                    self.emit_constant(Value::Undefined);
                    self.add_local(name);
                }
            }
        }
        self.consume(TokenKind::In, "expected 'in' in for statement");
        self.expression_list();
        self.consume(TokenKind::Colon, "expected ':' after for clause");
        self.emit_op(op::INVOKE_ITER);
        self.add_placeholder(); // iterator slot

        let loop_start = self.frame().chunk.len();
        self.emit_op(op::DUP);
        self.emit_byte(0);
        self.emit_op(op::CALL);
        self.emit_byte(0);
        self.emit_op(op::DUP);
        self.emit_byte(1);
        self.emit_op(op::DUP);
        self.emit_byte(1);
        self.emit_op(op::IS);
        let exit_jump = self.emit_jump(op::POP_JUMP_IF_TRUE);

        // At module scope the stores resolve to globals.
        self.store_unpack_names(&names);

        self.push_loop(loop_start, 1);
        self.begin_scope();
        self.block(indent);
        self.end_scope();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        // Exhausted: [iterator, sentinel] remain.
        self.emit_op(op::POP_MANY);
        self.emit_byte(2);
        self.pop_placeholder();

        if self.at_dedent_keyword(indent, &[TokenKind::Else]) {
            self.advance();
            self.consume(TokenKind::Colon, "expected ':' after 'else'");
            self.begin_scope();
            self.block(indent);
            self.end_scope();
        }
        self.pop_loop();
    }

    fn push_loop(&mut self, start: usize, iter_slots: usize) {
        let base_slots = self.frame().locals.len() - iter_slots;
        let cleanup_base = self.frame().cleanups.len();
        self.frame_mut().loops.push(LoopCtx {
            start,
            base_slots,
            iter_slots,
            cleanup_base,
            break_patches: Vec::new(),
        });
    }

    fn pop_loop(&mut self) {
        let ctx = self.frame_mut().loops.pop().expect("loop stack underflow");
        for operand_pos in ctx.break_patches {
            self.patch_jump(operand_pos);
        }
    }

    fn break_statement(&mut self) {
        let Some(loop_index) = self.frame().loops.len().checked_sub(1) else {
            self.error_at_previous("'break' outside of a loop");
            return;
        };
        let (cleanup_base, base_slots, iter_slots) = {
            let ctx = &self.frame().loops[loop_index];
            (ctx.cleanup_base, ctx.base_slots, ctx.iter_slots)
        };
        let crossed = self.frame().cleanups.len() - cleanup_base;
        let _ = iter_slots; // the iterator slot dies with the loop
        if crossed == 0 {
            let pops = self.frame().locals.len() - base_slots;
            if pops > 0 {
                self.emit_op(op::POP_MANY);
                self.emit_byte(pops as u8);
            }
            let operand = self.emit_jump(op::JUMP);
            self.frame_mut().loops[loop_index].break_patches.push(operand);
        } else {
            let lowest_slot = self.frame().cleanups[cleanup_base].slot;
            let pops = lowest_slot - base_slots;
            self.emit_op(op::EXIT_LOOP);
            self.emit_byte(crossed as u8);
            self.emit_byte(pops as u8);
            let operand = self.frame().chunk.len();
            self.emit_u16(0xffff);
            self.frame_mut().loops[loop_index].break_patches.push(operand);
        }
    }

    fn continue_statement(&mut self) {
        let Some(loop_index) = self.frame().loops.len().checked_sub(1) else {
            self.error_at_previous("'continue' outside of a loop");
            return;
        };
        let (cleanup_base, base_slots, iter_slots, start) = {
            let ctx = &self.frame().loops[loop_index];
            (ctx.cleanup_base, ctx.base_slots, ctx.iter_slots, ctx.start)
        };
        let crossed = self.frame().cleanups.len() - cleanup_base;
        if crossed == 0 {
            let pops = self.frame().locals.len() - base_slots - iter_slots;
            if pops > 0 {
                self.emit_op(op::POP_MANY);
                self.emit_byte(pops as u8);
            }
            self.emit_loop(start);
        } else {
            let lowest_slot = self.frame().cleanups[cleanup_base].slot;
            let pops = lowest_slot - base_slots - iter_slots;
            self.emit_op(op::EXIT_LOOP_BACK);
            self.emit_byte(crossed as u8);
            self.emit_byte(pops as u8);
            let here = self.frame().chunk.len() + 2;
            let distance = here - start;
            if distance > 0xffff {
                self.error_at_previous("unsupported far jump");
                self.emit_u16(0);
            } else {
                self.emit_u16(distance as u16);
            }
        }
    }

    fn return_statement(&mut self) {
        if self.frame().fn_type == FnType::Module {
            self.error_at_previous("'return' outside of a function");
        }
        if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) || self.check(TokenKind::Semicolon) {
            self.emit_op(op::NONE);
        } else {
            self.expression_list();
        }
        self.emit_op(op::RETURN);
    }

    fn raise_statement(&mut self) {
        if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) || self.check(TokenKind::Semicolon) {
            self.emit_op(op::RERAISE);
            return;
        }
        self.expression();
        if self.match_token(TokenKind::From) {
            self.expression();
            self.emit_op(op::RAISE_FROM);
        } else {
            self.emit_op(op::RAISE);
        }
    }

    fn assert_statement(&mut self) {
        self.expression();
        let pass_jump = self.emit_jump(op::POP_JUMP_IF_TRUE);
        let index = self.name_constant("AssertionError");
        self.emit_with_operand(op::GET_GLOBAL, op::GET_GLOBAL_LONG, index);
        if self.match_token(TokenKind::Comma) {
            self.expression();
            self.emit_op(op::CALL);
            self.emit_byte(1);
        } else {
            self.emit_op(op::CALL);
            self.emit_byte(0);
        }
        self.emit_op(op::RAISE);
        self.patch_jump(pass_jump);
    }

    fn del_statement(&mut self) {
        loop {
            self.del_target();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    fn del_target(&mut self) {
        self.consume(TokenKind::Identifier, "expected name in del statement");
        let name = self.previous.text;
        if !self.check(TokenKind::Dot) && !self.check(TokenKind::LeftBracket) {
            if let Some(slot) = self.resolve_local(name) {
                self.emit_with_operand(op::DEL_LOCAL, op::DEL_LOCAL_LONG, slot);
            } else if self.resolve_upvalue(self.frames.len() - 1, name).is_some() {
                self.error_at_previous("cannot delete a captured variable");
            } else {
                let index = self.name_constant(name);
                self.emit_with_operand(op::DEL_GLOBAL, op::DEL_GLOBAL_LONG, index);
            }
            return;
        }
        // Attribute / subscript deletion: compile the object chain.
        self.compile_name_load(name);
        loop {
            if self.match_token(TokenKind::Dot) {
                self.consume(TokenKind::Identifier, "expected attribute name after '.'");
                let attr = self.previous.text.to_owned();
                let index = self.name_constant(&attr);
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_with_operand(op::GET_PROPERTY, op::GET_PROPERTY_LONG, index);
                } else {
                    self.emit_with_operand(op::DEL_PROPERTY, op::DEL_PROPERTY_LONG, index);
                    return;
                }
            } else if self.match_token(TokenKind::LeftBracket) {
                let slice = self.slice_components();
                self.consume(TokenKind::RightBracket, "expected ']' after subscript");
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_op(if slice { op::INVOKE_GETSLICE } else { op::INVOKE_GETTER });
                } else {
                    self.emit_op(if slice { op::INVOKE_DELSLICE } else { op::INVOKE_DELETE });
                    return;
                }
            } else {
                self.error_at_current("expected '.' or '[' in del target");
                return;
            }
        }
    }

    // ---- imports ----

    /// Parses a dotted module name, returning the full path and the root
    /// name's token (whose lexeme outlives the parse).
    fn dotted_name(&mut self) -> (String, Token<'src>) {
        self.consume(TokenKind::Identifier, "expected module name");
        let root = self.previous;
        let mut full = root.text.to_owned();
        while self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected name after '.'");
            full.push('.');
            full.push_str(self.previous.text);
        }
        (full, root)
    }

    fn import_statement(&mut self) {
        loop {
            let (full, root) = self.dotted_name();
            let index = self.name_constant(&full);
            self.emit_with_operand(op::IMPORT, op::IMPORT_LONG, index);
            let bind_token = if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected name after 'as'");
                // Drill from the root to the leaf for the alias.
                if full.contains('.') {
                    for part in full.split('.').skip(1) {
                        let part_index = self.name_constant(part);
                        self.emit_with_operand(op::IMPORT_FROM, op::IMPORT_FROM_LONG, part_index);
                    }
                }
                self.previous
            } else {
                root
            };
            self.bind_top_of_stack(bind_token.text);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    fn from_import_statement(&mut self) {
        let (full, _root) = self.dotted_name();
        self.consume(TokenKind::Import, "expected 'import' in from-import");
        if self.check(TokenKind::Star) {
            self.error_at_current("'from X import *' is not supported");
            return;
        }
        let full_index = self.name_constant(&full);
        let parenthesized = self.match_token(TokenKind::LeftParen);
        loop {
            if parenthesized && self.check(TokenKind::RightParen) {
                break;
            }
            self.emit_with_operand(op::IMPORT, op::IMPORT_LONG, full_index);
            // IMPORT pushes the root; drill to the leaf module.
            if full.contains('.') {
                for part in full.split('.').skip(1) {
                    let part_index = self.name_constant(part);
                    self.emit_with_operand(op::IMPORT_FROM, op::IMPORT_FROM_LONG, part_index);
                }
            }
            self.consume(TokenKind::Identifier, "expected name to import");
            let imported = self.previous;
            let imported_index = self.name_constant(imported.text);
            self.emit_with_operand(op::IMPORT_FROM, op::IMPORT_FROM_LONG, imported_index);
            let bind_token = if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected name after 'as'");
                self.previous
            } else {
                imported
            };
            self.bind_top_of_stack(bind_token.text);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        if parenthesized {
            self.consume(TokenKind::RightParen, "expected ')' after import list");
        }
    }

    /// Binds TOS to `name`: a new or existing local in function scope, a
    /// global at module scope.
    fn bind_top_of_stack(&mut self, name: &'src str) {
        if self.in_function_scope() {
            if let Some(slot) = self.resolve_local(name) {
                self.emit_with_operand(op::SET_LOCAL, op::SET_LOCAL_LONG, slot);
                self.emit_op(op::POP);
            } else {
                // The value on top of the stack becomes the new local slot.
                self.add_local(name);
            }
        } else {
            let index = self.name_constant(name);
            self.emit_with_operand(op::SET_GLOBAL, op::SET_GLOBAL_LONG, index);
            self.emit_op(op::POP);
        }
    }

    // ---- try / with ----

    fn try_statement(&mut self) {
        let indent = self.cur_indent;
        self.consume(TokenKind::Colon, "expected ':' after 'try'");

        // Scout ahead: does this try have a finally clause? We need to know
        // before emitting the protected region.
        let has_finally = self.scout_for_clause(indent, TokenKind::Finally);
        let has_except = self.scout_for_clause(indent, TokenKind::Except);

        let mut finally_operand = 0usize;
        if has_finally {
            self.emit_op(op::PUSH_FINALLY);
            finally_operand = self.frame().chunk.len();
            self.emit_u16(0xffff);
            let slot = self.frame().locals.len();
            self.frame_mut().cleanups.push(CleanupRegion {
                kind: CleanupKind::Finally,
                slot,
            });
            self.add_placeholder();
        }

        let mut handler_operand = 0usize;
        if has_except {
            self.emit_op(op::PUSH_TRY);
            handler_operand = self.frame().chunk.len();
            self.emit_u16(0xffff);
            let slot = self.frame().locals.len();
            self.frame_mut().cleanups.push(CleanupRegion {
                kind: CleanupKind::Try,
                slot,
            });
            self.add_placeholder();
        }

        self.begin_scope();
        self.block(indent);
        self.end_scope();

        let mut done_jumps: Vec<usize> = Vec::new();
        if has_except {
            // Normal path: discard the try handler.
            self.emit_op(op::POP);
            self.frame_mut().cleanups.pop();
            self.pop_placeholder();
            let else_jump = self.emit_jump(op::JUMP);

            // Handler entry point.
            self.patch_jump(handler_operand);
            // The unwinder re-tagged the handler slot; model it again.
            self.add_placeholder();
            let mut matched_any = false;
            while self.at_dedent_keyword(indent, &[TokenKind::Except]) {
                self.advance(); // consume 'except'
                matched_any = true;
                let mut bind_name: Option<&'src str> = None;
                if !self.check(TokenKind::Colon) {
                    self.expression();
                    if self.match_token(TokenKind::As) {
                        self.consume(TokenKind::Identifier, "expected name after 'as'");
                        bind_name = Some(self.previous.text);
                    }
                } else {
                    // Bare except: a None filter matches everything.
                    self.emit_op(op::NONE);
                }
                self.emit_op(op::FILTER_EXCEPT);
                let next_jump = self.frame().chunk.len();
                self.emit_u16(0xffff);
                self.consume(TokenKind::Colon, "expected ':' after except clause");
                // The matched exception was pushed by FILTER_EXCEPT.
                let bound_fresh = match bind_name {
                    Some(name) if self.in_function_scope() && self.resolve_local(name).is_none() => {
                        self.add_local(name);
                        true
                    }
                    Some(name) => {
                        self.compile_name_store(name);
                        self.emit_op(op::POP);
                        false
                    }
                    None => {
                        self.emit_op(op::POP);
                        false
                    }
                };
                self.begin_scope();
                self.block(indent);
                self.end_scope();
                if bound_fresh {
                    // The bound exception local dies with the clause.
                    self.emit_op(op::POP);
                    self.frame_mut().locals.pop();
                }
                self.emit_op(op::POP_EXCEPT);
                done_jumps.push(self.emit_jump(op::JUMP));
                self.patch_jump(next_jump);
            }
            if !matched_any {
                self.error_at_current("expected 'except' clause");
            }
            // No clause matched: re-raise.
            self.emit_op(op::RERAISE);
            self.pop_placeholder();

            // Else clause runs on the normal path.
            self.patch_jump(else_jump);
            if self.at_dedent_keyword(indent, &[TokenKind::Else]) {
                self.advance();
                self.consume(TokenKind::Colon, "expected ':' after 'else'");
                self.begin_scope();
                self.block(indent);
                self.end_scope();
            }
            for jump in done_jumps.drain(..) {
                self.patch_jump(jump);
            }
        }

        if has_finally {
            self.frame_mut().cleanups.pop();
            self.emit_op(op::BEGIN_FINALLY);
            self.patch_jump(finally_operand);
            // Handler slot is now the pending-action marker.
            if self.at_dedent_keyword(indent, &[TokenKind::Finally]) {
                self.advance();
            } else {
                self.error_at_current("expected 'finally' clause");
            }
            self.consume(TokenKind::Colon, "expected ':' after 'finally'");
            self.begin_scope();
            self.block(indent);
            self.end_scope();
            self.emit_op(op::END_FINALLY);
            self.pop_placeholder();
        } else if !has_except {
            self.error_at_current("expected 'except' or 'finally' clause");
        }
    }

    /// Looks ahead for a dedent-level clause keyword without consuming input.
    ///
    /// Lines deeper than `indent` belong to the suite; a line at `indent`
    /// must start another clause of this statement for the scan to go on.
    fn scout_for_clause(&mut self, indent: usize, keyword: TokenKind) -> bool {
        let mut scanner = self.scanner.clone();
        let mut token = self.current;
        loop {
            match token.kind {
                TokenKind::Eof => return false,
                TokenKind::Indentation => {
                    let width = token.indent_width();
                    if width < indent {
                        return false;
                    }
                    if width == indent {
                        let next = scanner.scan_token();
                        if next.kind == keyword {
                            return true;
                        }
                        if !matches!(
                            next.kind,
                            TokenKind::Except | TokenKind::Else | TokenKind::Finally
                        ) {
                            return false;
                        }
                        token = next;
                        continue;
                    }
                }
                _ => {}
            }
            token = scanner.scan_token();
        }
    }

    fn with_statement(&mut self) {
        let indent = self.cur_indent;
        self.with_manager(indent);
    }

    fn with_manager(&mut self, indent: usize) {
        self.expression();
        let mut bind_name: Option<&'src str> = None;
        if self.match_token(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected name after 'as'");
            bind_name = Some(self.previous.text);
        }
        // Pre-declare the binding below the handler pair: the manager value
        // is on top, so slide an unbound slot underneath it.
        if let Some(name) = bind_name {
            if self.in_function_scope() && self.resolve_local(name).is_none() {
                self.emit_constant(Value::Undefined);
                self.emit_op(op::SWAP);
                self.add_local(name);
            }
        }

        self.emit_op(op::PUSH_WITH);
        let operand = self.frame().chunk.len();
        self.emit_u16(0xffff);
        let slot = self.frame().locals.len();
        self.frame_mut().cleanups.push(CleanupRegion {
            kind: CleanupKind::With,
            slot,
        });
        self.add_placeholder(); // bound __exit__
        self.add_placeholder(); // handler record

        // __enter__ result is on top.
        match bind_name {
            Some(name) => {
                self.compile_name_store(name);
                self.emit_op(op::POP);
            }
            None => self.emit_op(op::POP),
        }

        if self.match_token(TokenKind::Comma) {
            // Nested manager.
            self.with_manager(indent);
        } else {
            self.consume(TokenKind::Colon, "expected ':' after with clause");
            self.begin_scope();
            self.block(indent);
            self.end_scope();
        }

        self.frame_mut().cleanups.pop();
        self.emit_op(op::BEGIN_FINALLY);
        self.patch_jump(operand);
        self.emit_op(op::CLEANUP_WITH);
        self.pop_placeholder();
        self.pop_placeholder();
    }

    // ---- functions, classes, decorators ----

    fn def_statement(&mut self, is_async: bool) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name_token = self.previous;
        let name = name_token.text.to_owned();
        self.compile_function_body(&name, is_async);
        self.bind_definition(name_token);
    }

    /// Binds the value on top of the stack (a freshly created function or
    /// class) to its declared name, including the class-property side table
    /// when directly inside a class body.
    fn bind_definition(&mut self, name_token: Token<'src>) {
        let name = name_token.text;
        if self.frame().fn_type == FnType::ClassBody && self.frame().scope_depth == 1 {
            self.add_local(name);
            self.emit_op(op::DUP);
            self.emit_byte(0);
            let index = self.name_constant(name);
            self.emit_with_operand(op::CLASS_PROPERTY, op::CLASS_PROPERTY_LONG, index);
        } else if self.in_function_scope() {
            if let Some(slot) = self.resolve_local(name) {
                self.emit_with_operand(op::SET_LOCAL, op::SET_LOCAL_LONG, slot);
                self.emit_op(op::POP);
            } else {
                self.add_local(name);
            }
        } else {
            let index = self.name_constant(name);
            self.emit_with_operand(op::SET_GLOBAL, op::SET_GLOBAL_LONG, index);
            self.emit_op(op::POP);
        }
    }

    fn compile_function_body(&mut self, name: &str, is_async: bool) {
        let def_indent = self.cur_indent;
        let fn_type = if self.frame().fn_type == FnType::ClassBody {
            FnType::Method
        } else {
            FnType::Function
        };
        let qualname = format!("{}.{}", self.frame().qualname, name);
        self.frames.push(FnCompiler::new(fn_type, name.to_owned(), qualname));
        if is_async {
            self.frame_mut().flags |= CodeFlags::GENERATOR | CodeFlags::COROUTINE;
        }
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            self.parameter_list(TokenKind::RightParen);
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        if self.match_token(TokenKind::Arrow) {
            self.skip_expression();
        }
        self.consume(TokenKind::Colon, "expected ':' after function signature");

        // Docstring: a bare leading string literal.
        self.maybe_docstring(def_indent);
        self.block_or_resume(def_indent);

        self.emit_op(op::NONE);
        self.emit_op(op::RETURN);
        let flags = self.frame().flags;
        let code = self.finish_frame(flags);
        self.emit_closure(code);
    }

    /// Detects and records a function docstring; consumes it when present.
    fn maybe_docstring(&mut self, def_indent: usize) {
        if !self.check(TokenKind::Eol) {
            return;
        }
        let point = self.save_point();
        self.advance(); // Eol
        if self.check(TokenKind::Indentation) && self.current.indent_width() > def_indent {
            let width = self.current.indent_width();
            self.advance();
            if self.check(TokenKind::Str) {
                let text_token = self.current;
                self.advance();
                if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
                    if let Ok(text) = decode_str_literal(text_token.text) {
                        let value = self.intern_value(&text);
                        self.frame_mut().docstring = Some(value);
                    }
                    if self.check(TokenKind::Eol) {
                        self.advance();
                    }
                    // Re-synthesize the block context: we consumed the
                    // docstring line, the block continues at `width`.
                    self.resume_block(width);
                    self.block_done = true;
                    return;
                }
            }
        }
        self.restore_point(&point);
    }

    fn block_or_resume(&mut self, def_indent: usize) {
        if self.block_done {
            self.block_done = false;
        } else {
            self.block(def_indent);
        }
    }

    /// Continues compiling an indented suite at a known indentation after
    /// the docstring line was consumed out of band.
    fn resume_block(&mut self, body_indent: usize) {
        loop {
            if self.check(TokenKind::Eof) || !self.check(TokenKind::Indentation) {
                break;
            }
            let width = self.current.indent_width();
            if width < body_indent {
                break;
            }
            if width > body_indent {
                self.error_at_current("unexpected indent");
                return;
            }
            self.advance();
            if self.match_token(TokenKind::Eol) {
                continue;
            }
            self.cur_indent = width;
            self.statement_line();
            if self.panic_mode {
                self.synchronize();
            }
        }
    }

    fn parameter_list(&mut self, terminator: TokenKind) {
        let mut seen_star = false;
        let mut seen_default = false;
        loop {
            if self.check(terminator) {
                break;
            }
            if self.match_token(TokenKind::Star) {
                if seen_star {
                    self.error_at_previous("duplicate '*' in parameter list");
                }
                seen_star = true;
                if self.check(TokenKind::Identifier) {
                    self.advance();
                    let name = self.previous.text;
                    self.frame_mut().flags |= CodeFlags::COLLECTS_ARGS;
                    self.declare_param(name);
                }
            } else if self.match_token(TokenKind::StarStar) {
                self.consume(TokenKind::Identifier, "expected parameter name after '**'");
                let name = self.previous.text;
                self.frame_mut().flags |= CodeFlags::COLLECTS_KWS;
                self.declare_param(name);
                if !self.check(terminator) && !self.check(TokenKind::Comma) {
                    self.error_at_current("'**' parameter must be last");
                }
            } else {
                self.consume(TokenKind::Identifier, "expected parameter name");
                let name = self.previous.text;
                let slot = self.frame().locals.len();
                self.declare_param(name);
                if self.match_token(TokenKind::Colon) {
                    self.skip_expression();
                }
                let id = self.intern_id(name);
                if self.match_token(TokenKind::Equal) {
                    seen_default = true;
                    if seen_star {
                        self.frame_mut().keyword_only_args.push(id);
                    } else {
                        self.frame_mut().optional_args.push(id);
                    }
                    // Prologue: if the slot is unbound, evaluate the default.
                    self.emit_with_operand(op::TEST_UNSET, op::TEST_UNSET_LONG, slot);
                    let skip = self.emit_jump(op::POP_JUMP_IF_FALSE);
                    self.expression();
                    self.emit_with_operand(op::SET_LOCAL, op::SET_LOCAL_LONG, slot);
                    self.emit_op(op::POP);
                    self.patch_jump(skip);
                } else if seen_star {
                    self.error_at_previous("keyword-only parameters require a default value");
                } else {
                    if seen_default {
                        self.error_at_previous("parameter without default follows parameter with default");
                    }
                    self.frame_mut().required_args.push(id);
                }
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
    }

    /// Declares a parameter local. Parameters occupy the first slots and are
    /// bound by the caller, so no placeholder value is emitted.
    fn declare_param(&mut self, name: &'src str) {
        if Self::resolve_local_in(self.frame(), name).is_some() {
            self.error_at_previous("duplicate parameter name");
        }
        self.add_local(name);
    }

    fn class_statement(&mut self) {
        let name_token = self.class_value();
        self.bind_definition(name_token);
    }

    /// Compiles a class declaration, leaving the finished class on the
    /// stack. Returns the class-name token for binding.
    fn class_value(&mut self) -> Token<'src> {
        let indent = self.cur_indent;
        self.consume(TokenKind::Identifier, "expected class name");
        let name_token = self.previous;
        let name = name_token.text.to_owned();

        // Base expression, evaluated before body entry.
        if self.match_token(TokenKind::LeftParen) {
            if self.check(TokenKind::RightParen) {
                self.emit_op(op::NONE);
            } else {
                self.expression();
                if self.check(TokenKind::Comma) {
                    self.error_at_current("multiple inheritance is not supported");
                }
                if self.check(TokenKind::Equal) {
                    self.error_at_current("class keyword arguments are not supported");
                }
            }
            self.consume(TokenKind::RightParen, "expected ')' after base class");
        } else {
            self.emit_op(op::NONE);
        }
        self.consume(TokenKind::Colon, "expected ':' after class header");

        // Synthetic body function taking the base as its single argument.
        let qualname = format!("{}.{}", self.frame().qualname, name);
        self.frames.push(FnCompiler::new(FnType::ClassBody, name.clone(), qualname));
        self.begin_scope();
        self.declare_param("__class__");

        let name_index = self.name_constant(&name);
        self.emit_with_operand(op::CLASS, op::CLASS_LONG, name_index);
        self.emit_with_operand(op::GET_LOCAL, op::GET_LOCAL_LONG, 0);
        self.emit_op(op::INHERIT);
        self.emit_with_operand(op::SET_LOCAL, op::SET_LOCAL_LONG, 0);
        self.emit_op(op::POP);

        // Class docstring.
        self.maybe_class_docstring(indent);
        self.block_or_resume(indent);

        self.emit_with_operand(op::GET_LOCAL, op::GET_LOCAL_LONG, 0);
        self.emit_op(op::FINALIZE);
        self.emit_op(op::RETURN);
        let code = self.finish_frame(CodeFlags::CLASS_BODY);

        // Enclosing scope: [base] closure SWAP CALL 1.
        self.emit_closure(code);
        self.emit_op(op::SWAP);
        self.emit_op(op::CALL);
        self.emit_byte(1);
        name_token
    }

    fn maybe_class_docstring(&mut self, indent: usize) {
        if !self.check(TokenKind::Eol) {
            return;
        }
        let point = self.save_point();
        self.advance();
        if self.check(TokenKind::Indentation) && self.current.indent_width() > indent {
            let width = self.current.indent_width();
            self.advance();
            if self.check(TokenKind::Str) {
                let token = self.current;
                self.advance();
                if self.check(TokenKind::Eol) || self.check(TokenKind::Eof) {
                    if let Ok(text) = decode_str_literal(token.text) {
                        let value = self.intern_value(&text);
                        self.emit_constant(value);
                        self.emit_op(op::DOCSTRING);
                    }
                    if self.check(TokenKind::Eol) {
                        self.advance();
                    }
                    self.resume_block(width);
                    self.block_done = true;
                    return;
                }
            }
        }
        self.restore_point(&point);
    }

    fn decorated_statement(&mut self) {
        let indent = self.cur_indent;
        let mut count = 0usize;
        while self.match_token(TokenKind::At) {
            self.expression();
            count += 1;
            self.consume(TokenKind::Eol, "expected end of line after decorator");
            if self.check(TokenKind::Indentation) {
                if self.current.indent_width() != indent {
                    self.error_at_current("decorator indentation mismatch");
                }
                self.advance();
            }
        }
        // The decorated definition, left on the stack rather than bound.
        let name_token;
        if self.match_token(TokenKind::Def) {
            self.consume(TokenKind::Identifier, "expected function name");
            name_token = self.previous;
            let name = name_token.text.to_owned();
            self.compile_function_body(&name, false);
        } else if self.match_token(TokenKind::Async) {
            self.consume(TokenKind::Def, "expected 'def' after 'async'");
            self.consume(TokenKind::Identifier, "expected function name");
            name_token = self.previous;
            let name = name_token.text.to_owned();
            self.compile_function_body(&name, true);
        } else if self.match_token(TokenKind::Class) {
            name_token = self.class_value();
        } else {
            self.error_at_current("expected 'def' or 'class' after decorator");
            return;
        }
        for _ in 0..count {
            self.emit_op(op::CALL);
            self.emit_byte(1);
        }
        self.bind_definition(name_token);
    }

    // ---- expression statements & assignment ----

    fn expression_statement(&mut self) {
        match self.scout_line() {
            LineKind::Expression => {
                self.expression_list();
                self.emit_op(op::POP);
            }
            LineKind::Assignment { targets } => self.assignment_statement(targets),
            LineKind::Augmented(operator) => self.augmented_statement(operator),
            LineKind::Annotated => self.annotated_statement(),
        }
    }

    /// Comma-separated expressions building a tuple when plural.
    fn expression_list(&mut self) {
        self.expression();
        if self.check(TokenKind::Comma) {
            let mut count = 1usize;
            while self.match_token(TokenKind::Comma) {
                if self.check(TokenKind::Eol)
                    || self.check(TokenKind::Eof)
                    || self.check(TokenKind::Semicolon)
                    || self.check(TokenKind::Colon)
                {
                    break;
                }
                self.expression();
                count += 1;
            }
            self.emit_with_operand(op::TUPLE, op::TUPLE_LONG, count);
        }
    }

    /// Token-level classification of the statement ahead.
    fn scout_line(&mut self) -> LineKind {
        let mut scanner = self.scanner.clone();
        let mut token = self.current;
        let mut depth = 0i32;
        let mut eq_count = 0usize;
        let mut index = 0usize;
        let first_is_name = token.kind == TokenKind::Identifier;
        let mut lambda_depth = 0usize;
        loop {
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => depth -= 1,
                TokenKind::Lambda => lambda_depth += 1,
                TokenKind::Colon if depth == 0 && lambda_depth > 0 => lambda_depth -= 1,
                TokenKind::Colon if depth == 0 && index == 1 && first_is_name => {
                    return LineKind::Annotated;
                }
                TokenKind::Equal if depth == 0 && lambda_depth == 0 => eq_count += 1,
                TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::StarStarEqual
                | TokenKind::SlashEqual
                | TokenKind::SlashSlashEqual
                | TokenKind::PercentEqual
                | TokenKind::AmpEqual
                | TokenKind::PipeEqual
                | TokenKind::CaretEqual
                | TokenKind::LeftShiftEqual
                | TokenKind::RightShiftEqual
                | TokenKind::AtEqual
                    if depth == 0 && lambda_depth == 0 && eq_count == 0 =>
                {
                    return LineKind::Augmented(token.kind);
                }
                TokenKind::Eol | TokenKind::Eof | TokenKind::Semicolon => break,
                _ => {}
            }
            index += 1;
            token = scanner.scan_token();
        }
        if eq_count > 0 {
            LineKind::Assignment { targets: eq_count }
        } else {
            LineKind::Expression
        }
    }

    /// `t1 = t2 = ... = rhs`: the RHS is compiled first, then each target
    /// segment is re-parsed from its saved scanner state.
    fn assignment_statement(&mut self, eq_count: usize) {
        // Record the start of each target segment by skipping them.
        let mut segment_starts: Vec<ParsePoint<'src>> = Vec::with_capacity(eq_count);
        for _ in 0..eq_count {
            segment_starts.push(self.save_point());
            self.skip_target_segment();
            self.consume(TokenKind::Equal, "expected '=' in assignment");
        }

        // Pre-declare simple name targets so their slots exist below the RHS.
        let here = self.save_point();
        for point in &segment_starts {
            self.restore_point(point);
            let names = self.collect_assign_target_names();
            for name in names {
                self.predeclare_name(name);
            }
        }
        self.restore_point(&here);

        // RHS.
        self.expression_list();

        let end_point = self.save_point();
        // Store into each target, left to right.
        for (i, point) in segment_starts.iter().enumerate() {
            let last = i + 1 == segment_starts.len();
            if !last {
                self.emit_op(op::DUP);
                self.emit_byte(0);
            }
            self.restore_point(point);
            self.parse_target_list_store();
        }
        self.restore_point(&end_point);
    }

    /// Skips the tokens of one assignment-target segment (up to `=`).
    fn skip_target_segment(&mut self) {
        let mut depth = 0i32;
        loop {
            match self.current.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => depth -= 1,
                TokenKind::Equal if depth == 0 => return,
                TokenKind::Eol | TokenKind::Eof => {
                    self.error_at_current("malformed assignment");
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Collects plain-name targets of the segment ahead for pre-declaration.
    /// Parenthesized tuple groups are transparent; bracketed subscripts are
    /// opaque (names inside them are loads, not targets).
    fn collect_assign_target_names(&mut self) -> Vec<&'src str> {
        let mut names = Vec::new();
        let mut scanner = self.scanner.clone();
        let mut token = self.current;
        let mut bracket_depth = 0i32;
        let mut prev_kind = TokenKind::Comma;
        loop {
            let next = match token.kind {
                TokenKind::LeftBracket | TokenKind::LeftBrace => {
                    bracket_depth += 1;
                    scanner.scan_token()
                }
                TokenKind::RightBracket | TokenKind::RightBrace => {
                    bracket_depth -= 1;
                    scanner.scan_token()
                }
                TokenKind::Equal if bracket_depth == 0 => break,
                TokenKind::Eol | TokenKind::Eof => break,
                TokenKind::Identifier if bracket_depth == 0 && prev_kind != TokenKind::Dot => {
                    let candidate = token.text;
                    let following = scanner.scan_token();
                    if !matches!(
                        following.kind,
                        TokenKind::Dot | TokenKind::LeftBracket | TokenKind::LeftParen
                    ) {
                        names.push(candidate);
                    }
                    following
                }
                _ => scanner.scan_token(),
            };
            prev_kind = token.kind;
            token = next;
        }
        names
    }

    /// Parses a target list (tuple or single target), consuming the value on
    /// top of the stack.
    fn parse_target_list_store(&mut self) {
        // Count top-level targets first.
        let (count, trailing) = self.count_targets();
        if count > 1 || trailing {
            if count > 0xff {
                self.error_at_current("too many assignment targets");
                return;
            }
            self.emit_op(op::UNPACK);
            self.emit_byte(count as u8);
            self.emit_op(op::REVERSE);
            self.emit_byte(count as u8);
        }
        for i in 0..count {
            self.parse_single_target_store();
            if i + 1 < count {
                self.consume(TokenKind::Comma, "expected ',' in assignment targets");
            }
        }
        // Optional trailing comma.
        self.match_token(TokenKind::Comma);
    }

    /// Counts top-level targets ahead; `trailing` reports a trailing comma
    /// (`a, = x` unpacks a one-element sequence).
    fn count_targets(&mut self) -> (usize, bool) {
        let mut scanner = self.scanner.clone();
        let mut token = self.current;
        let mut depth = 0i32;
        let mut count = 1usize;
        let mut prev_kind = TokenKind::Equal;
        loop {
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Comma if depth == 0 => count += 1,
                TokenKind::Equal | TokenKind::Eol | TokenKind::Eof | TokenKind::Semicolon if depth == 0 => break,
                _ => {}
            }
            prev_kind = token.kind;
            token = scanner.scan_token();
        }
        let trailing = prev_kind == TokenKind::Comma;
        if trailing {
            count -= 1;
        }
        (count, trailing)
    }

    /// Parses one target and stores the value on top of the stack into it,
    /// consuming the value.
    fn parse_single_target_store(&mut self) {
        if self.match_token(TokenKind::LeftParen) {
            self.parse_target_list_store();
            self.consume(TokenKind::RightParen, "expected ')' in assignment target");
            return;
        }
        self.consume(TokenKind::Identifier, "expected assignment target");
        let name = self.previous.text;
        if !self.check(TokenKind::Dot) && !self.check(TokenKind::LeftBracket) {
            if self.frame().fn_type == FnType::ClassBody && self.frame().scope_depth == 1 {
                // Class body: store to the (pre-declared) body local and
                // mirror the value into the class attribute table.
                self.compile_name_store(name);
                let index = self.name_constant(name);
                self.emit_with_operand(op::CLASS_PROPERTY, op::CLASS_PROPERTY_LONG, index);
                return;
            }
            self.compile_name_store(name);
            self.emit_op(op::POP);
            return;
        }
        // Attribute / subscript target chain; value is on top.
        self.compile_name_load(name);
        loop {
            if self.match_token(TokenKind::Dot) {
                self.consume(TokenKind::Identifier, "expected attribute name after '.'");
                let attr = self.previous.text.to_owned();
                let index = self.name_constant(&attr);
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_with_operand(op::GET_PROPERTY, op::GET_PROPERTY_LONG, index);
                } else {
                    // [value, obj] -> SET_PROPERTY expects [obj, value].
                    self.emit_op(op::SWAP);
                    self.emit_with_operand(op::SET_PROPERTY, op::SET_PROPERTY_LONG, index);
                    self.emit_op(op::POP);
                    return;
                }
            } else if self.match_token(TokenKind::LeftBracket) {
                let slice = self.slice_components();
                self.consume(TokenKind::RightBracket, "expected ']' after subscript");
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_op(if slice { op::INVOKE_GETSLICE } else { op::INVOKE_GETTER });
                } else {
                    self.emit_op(if slice { op::INVOKE_SETSLICE } else { op::INVOKE_SETTER });
                    return;
                }
            } else {
                self.error_at_current("invalid assignment target");
                return;
            }
        }
    }

    fn augmented_statement(&mut self, operator: TokenKind) {
        let binary = match operator {
            TokenKind::PlusEqual => TokenKind::Plus,
            TokenKind::MinusEqual => TokenKind::Minus,
            TokenKind::StarEqual => TokenKind::Star,
            TokenKind::StarStarEqual => TokenKind::StarStar,
            TokenKind::SlashEqual => TokenKind::Slash,
            TokenKind::SlashSlashEqual => TokenKind::SlashSlash,
            TokenKind::PercentEqual => TokenKind::Percent,
            TokenKind::AmpEqual => TokenKind::Amp,
            TokenKind::PipeEqual => TokenKind::Pipe,
            TokenKind::CaretEqual => TokenKind::Caret,
            TokenKind::LeftShiftEqual => TokenKind::LeftShift,
            TokenKind::RightShiftEqual => TokenKind::RightShift,
            other => {
                self.error_at_current(&format!("unsupported augmented assignment {other}"));
                return;
            }
        };

        self.consume(TokenKind::Identifier, "expected assignment target");
        let name = self.previous.text;
        if !self.check(TokenKind::Dot) && !self.check(TokenKind::LeftBracket) {
            self.compile_name_load(name);
            self.consume(operator, "expected augmented assignment operator");
            self.expression();
            self.emit_binary_op(binary);
            self.compile_name_store(name);
            self.emit_op(op::POP);
            return;
        }
        self.compile_name_load(name);
        loop {
            if self.match_token(TokenKind::Dot) {
                self.consume(TokenKind::Identifier, "expected attribute name after '.'");
                let attr = self.previous.text.to_owned();
                let index = self.name_constant(&attr);
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_with_operand(op::GET_PROPERTY, op::GET_PROPERTY_LONG, index);
                } else {
                    // [obj]: load, operate, store back.
                    self.emit_op(op::DUP);
                    self.emit_byte(0);
                    self.emit_with_operand(op::GET_PROPERTY, op::GET_PROPERTY_LONG, index);
                    self.consume(operator, "expected augmented assignment operator");
                    self.expression();
                    self.emit_binary_op(binary);
                    self.emit_with_operand(op::SET_PROPERTY, op::SET_PROPERTY_LONG, index);
                    self.emit_op(op::POP);
                    return;
                }
            } else if self.match_token(TokenKind::LeftBracket) {
                let slice = self.slice_components();
                self.consume(TokenKind::RightBracket, "expected ']' after subscript");
                if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                    self.emit_op(if slice { op::INVOKE_GETSLICE } else { op::INVOKE_GETTER });
                } else if slice {
                    // [obj, start, stop, step]
                    for _ in 0..4 {
                        self.emit_op(op::DUP);
                        self.emit_byte(3);
                    }
                    self.emit_op(op::INVOKE_GETSLICE);
                    self.consume(operator, "expected augmented assignment operator");
                    self.expression();
                    self.emit_binary_op(binary);
                    // [obj, start, stop, step, value] -> [value, obj, start, stop, step]
                    self.emit_op(op::REVERSE);
                    self.emit_byte(5);
                    self.emit_op(op::REVERSE);
                    self.emit_byte(4);
                    self.emit_op(op::INVOKE_SETSLICE);
                    return;
                } else {
                    // [obj, index]
                    self.emit_op(op::DUP);
                    self.emit_byte(1);
                    self.emit_op(op::DUP);
                    self.emit_byte(1);
                    self.emit_op(op::INVOKE_GETTER);
                    self.consume(operator, "expected augmented assignment operator");
                    self.expression();
                    self.emit_binary_op(binary);
                    // [obj, index, value] -> [value, obj, index]
                    self.emit_op(op::REVERSE);
                    self.emit_byte(3);
                    self.emit_op(op::SWAP);
                    self.emit_op(op::INVOKE_SETTER);
                    return;
                }
            } else {
                self.error_at_current("invalid augmented assignment target");
                return;
            }
        }
    }

    fn annotated_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected name");
        let name_token = self.previous;
        let name = name_token.text;
        self.consume(TokenKind::Colon, "expected ':' in annotation");
        if self.frame().fn_type == FnType::ClassBody && self.frame().scope_depth == 1 {
            self.expression();
            let index = self.name_constant(name);
            if index > 0xff {
                self.error_at_previous("too many annotated names in class body");
                return;
            }
            self.emit_op(op::ANNOTATE);
            self.emit_byte(index as u8);
            if self.match_token(TokenKind::Equal) {
                self.expression();
                self.add_local(name);
                self.emit_op(op::DUP);
                self.emit_byte(0);
                let prop_index = self.name_constant(name);
                self.emit_with_operand(op::CLASS_PROPERTY, op::CLASS_PROPERTY_LONG, prop_index);
            }
        } else {
            self.skip_expression();
            if self.match_token(TokenKind::Equal) {
                if self.in_function_scope() {
                    self.predeclare_name(name);
                }
                self.expression();
                self.compile_name_store(name);
                self.emit_op(op::POP);
            }
        }
    }

    // ==================================================================
    // Function finalization
    // ==================================================================

    /// Pops the innermost frame and builds its code object. The frame's
    /// upvalue descriptors are stashed for the following `emit_closure`.
    fn finish_frame(&mut self, extra_flags: CodeFlags) -> CodeObject {
        let mut frame = self.frames.pop().expect("frame stack underflow");
        self.last_upvalues = std::mem::take(&mut frame.upvalues);
        let name = self.intern_id(&frame.name);
        let qualname = self.intern_id(&frame.qualname);
        let filename = {
            let f = self.filename.clone();
            self.intern_id(&f)
        };
        let local_names = frame
            .locals
            .iter()
            .filter(|l| !l.name.is_empty())
            .map(|l| self.interner.intern(self.heap, l.name))
            .collect();
        CodeObject {
            chunk: Rc::new(frame.chunk),
            name,
            qualname,
            filename,
            docstring: frame.docstring,
            required_args: frame.required_args,
            optional_args: frame.optional_args,
            keyword_only_args: frame.keyword_only_args,
            local_names,
            upvalue_count: self.last_upvalues.len() as u16,
            flags: frame.flags | extra_flags,
            module: None,
        }
    }

    /// Emits `CLOSURE` for a finished code object, including its upvalue
    /// descriptor table. Must be called right after `finish_frame`, while
    /// the descriptor list is still available.
    fn emit_closure(&mut self, code: CodeObject) {
        let descriptors = std::mem::take(&mut self.last_upvalues);
        debug_assert_eq!(descriptors.len(), code.upvalue_count as usize);
        let id = self.heap.alloc(HeapData::Code(code));
        let index = self.make_constant(Value::Ref(id));
        self.emit_with_operand(op::CLOSURE, op::CLOSURE_LONG, index);
        self.emit_byte(descriptors.len() as u8);
        for desc in descriptors {
            self.emit_byte(u8::from(desc.is_local));
            self.emit_u16(desc.index);
        }
    }
}

/// Comprehension flavors.
#[derive(Debug, Clone, Copy)]
enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

// ======================================================================
// Pratt rule table
// ======================================================================

fn rule<'src, 'ctx>(kind: TokenKind) -> ParseRule<'src, 'ctx> {
    use TokenKind as T;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'ctx>>,
        Option<ParseFn<'src, 'ctx>>,
        Precedence,
    ) = match kind {
        T::Number => (Some(Compiler::number), None, Precedence::None),
        T::Str => (Some(Compiler::string), None, Precedence::None),
        T::FStr => (Some(Compiler::fstring), None, Precedence::None),
        T::BytesLit => (Some(Compiler::bytes_literal), None, Precedence::None),
        T::Identifier => (Some(Compiler::variable), None, Precedence::None),
        T::None | T::True | T::False => (Some(Compiler::literal), None, Precedence::None),
        T::LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        T::LeftBracket => (
            Some(Compiler::list_display),
            Some(Compiler::subscript),
            Precedence::Subscript,
        ),
        T::LeftBrace => (Some(Compiler::dict_display), None, Precedence::None),
        T::Dot => (None, Some(Compiler::dot), Precedence::Call),
        T::Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        T::Plus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        T::Star => (None, Some(Compiler::binary), Precedence::Factor),
        T::Slash | T::SlashSlash | T::Percent => (None, Some(Compiler::binary), Precedence::Factor),
        T::StarStar => (None, Some(Compiler::binary), Precedence::Exponent),
        T::Amp => (None, Some(Compiler::binary), Precedence::BitAnd),
        T::Pipe => (None, Some(Compiler::binary), Precedence::BitOr),
        T::Caret => (None, Some(Compiler::binary), Precedence::BitXor),
        T::LeftShift | T::RightShift => (None, Some(Compiler::binary), Precedence::Shift),
        T::Tilde => (Some(Compiler::bit_unary), None, Precedence::None),
        T::Not => (Some(Compiler::not_expr), Some(Compiler::comparison), Precedence::Comparison),
        T::EqualEqual
        | T::BangEqual
        | T::Less
        | T::Greater
        | T::LessEqual
        | T::GreaterEqual
        | T::In
        | T::Is => (None, Some(Compiler::comparison), Precedence::Comparison),
        T::And => (None, Some(Compiler::and_expr), Precedence::And),
        T::Or => (None, Some(Compiler::or_expr), Precedence::Or),
        T::If => (None, Some(Compiler::ternary), Precedence::Ternary),
        T::Lambda => (Some(Compiler::lambda), None, Precedence::None),
        T::Yield => (Some(Compiler::yield_expr), None, Precedence::None),
        T::Await => (Some(Compiler::await_expr), None, Precedence::None),
        T::Super => (Some(Compiler::super_expr), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

// ======================================================================
// Literal decoding
// ======================================================================

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// Strips prefix letters and quotes from a string-like token lexeme.
fn strip_quotes(lexeme: &str) -> Option<&str> {
    let body = lexeme.trim_start_matches(|c| matches!(c, 'b' | 'B' | 'f' | 'F'));
    let bytes = body.as_bytes();
    if bytes.len() >= 6 && (body.starts_with("'''") || body.starts_with("\"\"\"")) {
        return Some(&body[3..body.len() - 3]);
    }
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0] {
        return Some(&body[1..body.len() - 1]);
    }
    None
}

/// Decodes a plain string literal's lexeme (prefixes, quotes, escapes).
pub(crate) fn decode_str_literal(lexeme: &str) -> Result<String, &'static str> {
    let body = strip_quotes(lexeme).ok_or("malformed string literal")?;
    decode_escapes(body)
}

/// Decodes the escape sequences of a string body.
fn decode_escapes(body: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("dangling escape in string literal");
        };
        match escape {
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '[' => out.push('\u{1b}'),
            '\n' => {}
            'x' => {
                let value = take_hex(&mut chars, 2)?;
                out.push(char::from_u32(value).ok_or("invalid \\x escape")?);
            }
            'u' => {
                let value = take_hex(&mut chars, 4)?;
                out.push(char::from_u32(value).ok_or("invalid \\u escape")?);
            }
            'U' => {
                let value = take_hex(&mut chars, 8)?;
                out.push(char::from_u32(value).ok_or("invalid \\U escape")?);
            }
            d @ '0'..='7' => {
                let mut value = d as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(n @ '0'..='7') => {
                            value = value * 8 + (*n as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                out.push(char::from_u32(value).ok_or("invalid octal escape")?);
            }
            other => {
                // Unknown escapes pass through verbatim.
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn take_hex(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, count: usize) -> Result<u32, &'static str> {
    let mut value = 0u32;
    for _ in 0..count {
        let Some(c) = chars.next() else {
            return Err("truncated hex escape");
        };
        let digit = c.to_digit(16).ok_or("invalid hex escape")?;
        value = value * 16 + digit;
    }
    Ok(value)
}

/// Decodes a bytes literal: ASCII-only, `\u`/`\U` stay literal.
fn decode_bytes_literal(lexeme: &str) -> Result<Vec<u8>, &'static str> {
    let body = strip_quotes(lexeme).ok_or("malformed bytes literal")?;
    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            if !c.is_ascii() {
                return Err("bytes literal may only contain ASCII characters");
            }
            out.push(c as u8);
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("dangling escape in bytes literal");
        };
        match escape {
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '[' => out.push(0x1b),
            'x' => {
                let value = take_hex(&mut chars, 2)?;
                out.push(value as u8);
            }
            d @ '0'..='7' => {
                let mut value = d as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(n @ '0'..='7') => {
                            value = value * 8 + (*n as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                out.push(value as u8);
            }
            other => {
                // \u and \U (and anything else) stay literal in bytes.
                out.push(b'\\');
                if !other.is_ascii() {
                    return Err("bytes literal may only contain ASCII characters");
                }
                out.push(other as u8);
            }
        }
    }
    Ok(out)
}

/// Finds the index of the `}` closing the brace opened just before `start`,
/// skipping nested brackets and quoted strings.
fn find_closing_brace(body: &str, start: usize) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0i32;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'[' | b'(' => depth += 1,
            b']' | b')' => depth -= 1,
            b'}' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::intern::Interner;

    fn compile_source(source: &str) -> Result<(HeapId, Heap), CompileError> {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let id = compile(source, "test.krs", &mut heap, &mut interner)?;
        Ok((id, heap))
    }

    #[test]
    fn compiles_a_simple_module() {
        assert!(compile_source("x = 1\nprint(x)\n").is_ok());
    }

    #[test]
    fn module_code_carries_the_module_flag() {
        let (id, heap) = compile_source("pass\n").unwrap();
        match heap.get(id) {
            HeapData::Code(code) => assert!(code.flags.contains(CodeFlags::MODULE)),
            other => panic!("unexpected heap payload: {other:?}"),
        }
    }

    #[test]
    fn yield_marks_the_function_as_a_generator() {
        let (id, heap) = compile_source("def g():\n    yield 1\n").unwrap();
        let HeapData::Code(module) = heap.get(id) else {
            panic!("module code missing");
        };
        let generator_found = module.chunk.constants().iter().any(|value| {
            value
                .as_ref_id()
                .is_some_and(|cid| match heap.get(cid) {
                    HeapData::Code(code) => code.flags.contains(CodeFlags::GENERATOR),
                    _ => false,
                })
        });
        assert!(generator_found, "no generator-flagged code object emitted");
    }

    #[test]
    fn missing_expression_is_reported_with_location() {
        let err = compile_source("x = +\n").unwrap_err();
        assert!(err.message.contains("expected expression"));
        assert_eq!(err.line, 1);
        assert_eq!(err.file, "test.krs");
    }

    #[test]
    fn parameters_after_defaults_are_rejected() {
        let err = compile_source("def f(a=1, b):\n    pass\n").unwrap_err();
        assert!(err.message.contains("default"));
    }
}
