//! compiler/mod.rs — single-pass Pratt-parser compiler: source bytes in,
//! a [`Function`] (name + arity + [`Chunk`]) out, no intermediate AST.
//!
//! Grounded on `original_source/src/compiler.c` end to end: the
//! `Parser`/`Compiler`/`Local`/`FlowControl` structs, `emitJump`/
//! `emitLoop`/`patchJump`, the break/continue fixup arrays, the
//! `assignVarWithOp[Long]` compound-assignment desugaring, and the
//! `for`/`while`/`do-while` lowering. Functions never close over an
//! enclosing compiler's locals (Cave has no closures), so unlike a
//! Lox-style nested-compiler chain, each `fun` body gets a fresh,
//! independent [`FnCompiler`] sharing only the token stream and interner.

mod rules;

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{CompileDiagnostic, Error, Result};
use crate::opcode::OpCode;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Interner;
use crate::value::{Function, Value};

use rules::{get_rule, Infix, Precedence, Prefix};

const BREAK_MAX: usize = 256;
const CONTINUE_MAX: usize = 256;

/// Sentinel passed as `loop_depth` when compiling code outside any loop;
/// `break`/`continue` there are compile errors.
const NOT_IN_LOOP: i32 = -1;

struct Local<'src> {
    name: &'src [u8],
    depth: i32,
}

#[derive(Clone, Copy)]
struct FlowControl {
    location: usize,
    depth: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Script,
}

struct FnCompiler<'src> {
    function: Function,
    kind: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    breaks: Vec<FlowControl>,
    continues: Vec<FlowControl>,
}

impl<'src> FnCompiler<'src> {
    fn new(kind: FunctionType, name: Option<Rc<str>>, arity: u8) -> FnCompiler<'src> {
        // Slot 0 is always reserved, mirroring `initCompiler`'s blank
        // "self" local (the script/function value itself is never named).
        FnCompiler {
            function: Function::new(name, arity),
            kind,
            locals: vec![Local { name: b"", depth: 0 }],
            scope_depth: 0,
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }

    fn num_locals_at(&self, depth: i32) -> usize {
        self.locals.iter().rev().take_while(|l| l.depth >= depth).count()
    }
}

struct ParserState<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<CompileDiagnostic>,
}

impl<'src> ParserState<'src> {
    fn new(source: &'src [u8]) -> ParserState<'src> {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        ParserState {
            scanner,
            previous: first,
            current: first,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        }
    }
}

/// The single-pass compiler. Owns the parser's token cursor, the
/// in-progress function compiler, and a borrowed reference to the VM's
/// string interner (constants holding identifiers/string literals must
/// intern the same way the VM does, so later `==` by `Rc::ptr_eq` holds).
pub struct Compiler<'src, 'intern> {
    parser: ParserState<'src>,
    fc: FnCompiler<'src>,
    interner: &'intern mut Interner,
}

impl<'src, 'intern> Compiler<'src, 'intern> {
    pub fn new(source: &'src [u8], interner: &'intern mut Interner) -> Compiler<'src, 'intern> {
        Compiler {
            parser: ParserState::new(source),
            fc: FnCompiler::new(FunctionType::Script, None, 0),
            interner,
        }
    }

    /// Builds a compiler pre-seeded with two locals (`frame`, `index`)
    /// at slots 1 and 2, for compiling a single host-supplied expression
    /// against a live VM frame. Grounded on
    /// `original_source/src/compiler.c::initRuntimeCompiler`.
    pub fn new_runtime(source: &'src [u8], interner: &'intern mut Interner) -> Compiler<'src, 'intern> {
        let mut fc = FnCompiler::new(FunctionType::Script, None, 2);
        fc.locals.push(Local {
            name: b"frame",
            depth: 0,
        });
        fc.locals.push(Local {
            name: b"index",
            depth: 0,
        });
        Compiler {
            parser: ParserState::new(source),
            fc,
            interner,
        }
    }

    pub fn compile(mut self) -> Result<Function> {
        while !self.matches(TokenKind::Eof) {
            self.declaration(NOT_IN_LOOP);
        }
        self.consume(TokenKind::Eof, "Expect end of file");
        self.finish()
    }

    /// Compiles a single bare expression followed by `EXTRACT`, per
    /// `original_source/src/compiler.c::runtimeCompile`.
    pub fn compile_runtime(mut self) -> Result<Function> {
        self.expression();
        self.emit_op(OpCode::Extract);
        self.consume(TokenKind::Eof, "Expect end of file");
        self.finish()
    }

    fn finish(mut self) -> Result<Function> {
        self.emit_return();
        if self.parser.had_error {
            return Err(Error::Compile(self.parser.diagnostics));
        }
        Ok(self.fc.function)
    }

    // ---------------- token plumbing ----------------

    fn error_at(&mut self, token: Token<'src>, message: impl Into<String>) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.text()),
        };
        self.parser.diagnostics.push(CompileDiagnostic {
            line: token.line,
            message: format!("Error{location}: {}", message.into()),
        });
    }

    fn error(&mut self, message: impl Into<String>) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: impl Into<String>) {
        self.error_at(self.parser.current, message);
    }

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let text = self.parser.current.text().to_string();
            self.error_at_current(text);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    /// Mirrors `matchRange`: used once, to detect a dangling assignment
    /// operator left over after `parsePrecedence` finishes (an invalid
    /// assignment target).
    fn matches_assignment_operator(&mut self) -> bool {
        use TokenKind::*;
        let matched = matches!(
            self.parser.current.kind,
            Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual | PercentEqual
        );
        if matched {
            self.advance();
        }
        matched
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message.to_string());
    }

    fn line(&self) -> u32 {
        self.parser.previous.line
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.fc.function.chunk
    }

    // ---------------- byte emission ----------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    /// Emits `op` followed by a 24-bit big-endian operand, erroring if it
    /// doesn't fit (mirrors `emitLong`'s `UINT24_COUNT` bound).
    fn emit_long(&mut self, op: OpCode, value: u32) {
        if value > 0x00FF_FFFF {
            self.error("Too large of a value to write to long operation");
            return;
        }
        self.emit_op(op);
        let line = self.line();
        self.chunk_mut().write_u24(value, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.chunk_mut().len() - 2
    }

    fn patch_jump(&mut self, location: usize) {
        // `location` points at the two jump-distance placeholder bytes,
        // immediately after the opcode byte at `location - 1`. A
        // `JUMP_NPOP` instruction has 3 more operand bytes (the pop
        // count) after those two, which the VM also consumes before
        // applying the jump, so the distance must skip them too.
        let is_npop = self.chunk_mut().code[location - 1] == OpCode::JumpNPop as u8;
        let extra = if is_npop { 3 } else { 0 };
        let jump_dist = self.chunk_mut().len() - location - 2 - extra;
        if jump_dist > u16::MAX as usize {
            self.error("Too much code to jump over");
            return;
        }
        self.chunk_mut().patch_u16(location, jump_dist as u16);
    }

    fn emit_loop(&mut self, op: OpCode, loop_start: usize) {
        self.emit_op(op);
        let jump_dist = self.chunk_mut().len() - loop_start + 2;
        if jump_dist > u16::MAX as usize {
            self.error("Loop body too large");
        }
        let line = self.line();
        self.chunk_mut().write_u16(jump_dist as u16, line);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u32 {
        let index = self.chunk_mut().add_constant(value);
        if index > 0x00FF_FFFF {
            self.error("Too many unique constants in one chunk");
            return 0;
        }
        index as u32
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        if index <= u8::MAX as u32 {
            self.emit_bytes(OpCode::Constant as u8, index as u8);
        } else {
            self.emit_long(OpCode::ConstantLong, index);
        }
    }

    // ---------------- break / continue fixups ----------------

    fn num_locals(&self, depth: i32) -> usize {
        self.fc.num_locals_at(depth)
    }

    /// Emits a placeholder `JUMP` (upgraded in place to `JUMP_NPOP` when
    /// the break/continue must first pop locals back to the loop's own
    /// scope), mirroring `emitControlFlow`.
    fn emit_control_flow(&mut self, loop_depth: i32) -> usize {
        let location = self.emit_jump(OpCode::Jump);
        let n = self.num_locals(loop_depth);
        if n > 0 {
            let op_offset = location - 1; // back up to the opcode byte
            self.chunk_mut().code[op_offset] = OpCode::JumpNPop as u8;
            let line = self.line();
            self.chunk_mut().write_u24(n as u32, line);
        }
        location
    }

    fn emit_break(&mut self, loop_depth: i32) {
        if self.fc.breaks.len() == BREAK_MAX {
            self.error("Too many breaks in current loop");
            return;
        }
        let location = self.emit_control_flow(loop_depth);
        self.fc.breaks.push(FlowControl {
            location,
            depth: self.fc.scope_depth,
        });
    }

    fn emit_continue(&mut self, loop_depth: i32) {
        if self.fc.continues.len() == CONTINUE_MAX {
            self.error("Too many continues in current loop");
            return;
        }
        let location = self.emit_control_flow(loop_depth);
        self.fc.continues.push(FlowControl {
            location,
            depth: self.fc.scope_depth,
        });
    }

    fn patch_breaks(&mut self) {
        let depth = self.fc.scope_depth;
        while let Some(last) = self.fc.breaks.last() {
            if last.depth <= depth {
                break;
            }
            let fc = self.fc.breaks.pop().unwrap();
            self.patch_jump(fc.location);
        }
    }

    fn patch_continues(&mut self) {
        let depth = self.fc.scope_depth;
        while let Some(last) = self.fc.continues.last() {
            if last.depth <= depth {
                break;
            }
            let fc = self.fc.continues.pop().unwrap();
            self.patch_jump(fc.location);
        }
    }

    // ---------------- scopes & locals ----------------

    fn begin_scope(&mut self) {
        self.fc.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let n = self.num_locals(self.fc.scope_depth);
        let new_len = self.fc.locals.len() - n;
        self.fc.locals.truncate(new_len);
        self.fc.scope_depth -= 1;
        if n > 1 {
            self.emit_long(OpCode::PopN, n as u32);
        } else if n == 1 {
            self.emit_op(OpCode::Pop);
        }
    }

    fn identifiers_equal(a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    fn resolve_local(&mut self, name: &[u8]) -> Option<u32> {
        for (i, local) in self.fc.locals.iter().enumerate().rev() {
            if Self::identifiers_equal(name, local.name) {
                if local.depth == -1 {
                    self.error("Cannot read local variable in its own initializer");
                }
                return Some(i as u32);
            }
        }
        None
    }

    fn add_local(&mut self, name: &'src [u8]) {
        if self.fc.locals.len() == crate::STACK_MAX {
            self.error("Too many local variables in function");
            return;
        }
        self.fc.locals.push(Local { name, depth: -1 });
    }

    fn declare_variable(&mut self) {
        if self.fc.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        for local in self.fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.fc.scope_depth {
                break;
            }
            if Self::identifiers_equal(name, local.name) {
                self.error("Already a variable with this name in this scope");
            }
        }
        self.add_local(name);
    }

    fn identifier_constant(&mut self, name: &[u8]) -> u32 {
        let text = std::str::from_utf8(name).unwrap_or("");
        let interned = self.interner.intern(text);
        self.make_constant(Value::string(interned))
    }

    fn parse_variable(&mut self, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fc.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.fc.scope_depth == 0 {
            return;
        }
        let last = self.fc.locals.len() - 1;
        self.fc.locals[last].depth = self.fc.scope_depth;
    }

    fn define_variable(&mut self, global: u32) {
        if self.fc.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if global > u8::MAX as u32 {
            self.emit_long(OpCode::DefineGlobalLong, global);
        } else {
            self.emit_bytes(OpCode::DefineGlobal as u8, global as u8);
        }
    }

    // ---------------- expressions ----------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.parser.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expected an expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        self.run_prefix(prefix, can_assign);

        while precedence <= get_rule(self.parser.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.parser.previous.kind).infix {
                self.run_infix(infix, can_assign);
            }
        }

        if can_assign && self.matches_assignment_operator() {
            self.error("Invalid assignment target");
        }
    }

    fn run_prefix(&mut self, prefix: Prefix, can_assign: bool) {
        match prefix {
            Prefix::Grouping => self.grouping(),
            Prefix::Unary => self.unary(),
            Prefix::Number => self.number(),
            Prefix::StringLit => self.string_literal(),
            Prefix::Literal => self.literal(),
            Prefix::Variable => self.variable(can_assign),
        }
    }

    fn run_infix(&mut self, infix: Infix, can_assign: bool) {
        match infix {
            Infix::Call => self.call(),
            Infix::Index => self.index_expr(),
            Infix::Ternary => self.ternary(),
            Infix::Or => self.or_(),
            Infix::And => self.and_(),
            Infix::Binary => self.binary(),
        }
        let _ = can_assign;
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression");
    }

    fn number(&mut self) {
        let text = self.parser.previous.text();
        let value: f64 = text.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn literal(&mut self) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal() called for non-literal token"),
        }
    }

    /// Strips the surrounding quote/interpolation-boundary bytes and
    /// emits the fragment as a string constant; recurses into a chained
    /// `${expr}"..."` tail exactly as `original_source`'s `string()` does.
    fn string_literal(&mut self) {
        let lexeme = self.parser.previous.lexeme;
        let inner = if lexeme.len() >= 2 {
            &lexeme[1..lexeme.len() - 1]
        } else {
            &lexeme[0..0]
        };
        let text = String::from_utf8_lossy(inner).into_owned();
        let interned = self.interner.intern(&text);
        self.emit_constant(Value::string(interned));

        if self.matches(TokenKind::DollarBrace) {
            self.parse_precedence(Precedence::Conditional);
            self.consume(
                TokenKind::RightBrace,
                "Expect '}' after '${' string interpolation",
            );
            self.emit_op(OpCode::InterpolateStr);
            if self.matches(TokenKind::String) {
                self.string_literal();
                self.emit_op(OpCode::InterpolateStr);
            }
        }
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() called for non-unary token"),
        }
    }

    fn binary(&mut self) {
        let operator = self.parser.previous.kind;
        let next_prec = get_rule(operator).precedence.one_higher();
        self.parse_precedence(next_prec);
        let op = match operator {
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Subtract,
            TokenKind::Star => OpCode::Multiply,
            TokenKind::Slash => OpCode::Divide,
            TokenKind::Percent => OpCode::Mod,
            _ => return,
        };
        self.emit_op(op);
    }

    fn ternary(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Conditional);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        self.consume(TokenKind::Colon, "Expect ':' after '?'");
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(else_jump);
    }

    fn or_(&mut self) {
        let short_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(short_jump);
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot have more than 255 arguments");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments");
        count.min(255) as u8
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, arg_count);
    }

    /// One of `INDEX`/`INDEX_RANGE`/`INDEX_RANGE_INTERVAL` depending on
    /// how many `:`-separated slots were present, per
    /// `original_source/src/compiler.c::subindex`.
    fn index_expr(&mut self) {
        if self.check(TokenKind::Colon) {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
        }

        if self.matches(TokenKind::Colon) {
            if self.check(TokenKind::Colon) || self.check(TokenKind::RightSquare) {
                self.emit_op(OpCode::Nil);
            } else {
                self.expression();
            }

            if self.matches(TokenKind::Colon) {
                if self.check(TokenKind::RightSquare) {
                    self.emit_op(OpCode::IndexRange);
                } else {
                    self.expression();
                    self.emit_op(OpCode::IndexRangeInterval);
                }
            } else {
                self.emit_op(OpCode::IndexRange);
            }
        } else {
            self.emit_op(OpCode::Index);
        }

        self.consume(TokenKind::RightSquare, "Expect ']' after arguments");
    }

    fn assign_var_with_op(&mut self, get_op: OpCode, set_op: OpCode, op: OpCode, arg: u32, long: bool) {
        if long {
            self.emit_long(get_op, arg);
        } else {
            self.emit_bytes(get_op as u8, arg as u8);
        }
        self.expression();
        self.emit_op(op);
        if long {
            self.emit_long(set_op, arg);
        } else {
            self.emit_bytes(set_op as u8, arg as u8);
        }
    }

    fn named_variable(&mut self, name: &'src [u8], can_assign: bool) {
        let (get_op, set_op, arg, long);
        if let Some(local_slot) = self.resolve_local(name) {
            arg = local_slot;
            long = arg > u8::MAX as u32;
            get_op = if long { OpCode::GetLocalLong } else { OpCode::GetLocal };
            set_op = if long { OpCode::SetLocalLong } else { OpCode::SetLocal };
        } else {
            arg = self.identifier_constant(name);
            long = arg > u8::MAX as u32;
            get_op = if long { OpCode::GetGlobalLong } else { OpCode::GetGlobal };
            set_op = if long { OpCode::SetGlobalLong } else { OpCode::SetGlobal };
        }

        if !can_assign {
            self.emit_get(get_op, arg, long);
            return;
        }

        if self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_get(set_op, arg, long);
        } else if self.matches(TokenKind::PlusEqual) {
            self.assign_var_with_op(get_op, set_op, OpCode::Add, arg, long);
        } else if self.matches(TokenKind::MinusEqual) {
            self.assign_var_with_op(get_op, set_op, OpCode::Subtract, arg, long);
        } else if self.matches(TokenKind::StarEqual) {
            self.assign_var_with_op(get_op, set_op, OpCode::Multiply, arg, long);
        } else if self.matches(TokenKind::SlashEqual) {
            self.assign_var_with_op(get_op, set_op, OpCode::Divide, arg, long);
        } else if self.matches(TokenKind::PercentEqual) {
            self.assign_var_with_op(get_op, set_op, OpCode::Mod, arg, long);
        } else {
            self.emit_get(get_op, arg, long);
        }
    }

    fn emit_get(&mut self, op: OpCode, arg: u32, long: bool) {
        if long {
            self.emit_long(op, arg);
        } else {
            self.emit_bytes(op as u8, arg as u8);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    // ---------------- statements ----------------

    fn block(&mut self, loop_depth: i32) {
        self.begin_scope();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(loop_depth);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block");
        self.end_scope();
    }

    fn function_body(&mut self, kind: FunctionType, name: Rc<str>) {
        let outer = std::mem::replace(&mut self.fc, FnCompiler::new(kind, Some(name), 0));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.fc.function.arity += 1;
                if self.fc.function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters".to_string());
                }
                let constant = self.parse_variable("Expect parameter name");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body");
        self.block(NOT_IN_LOOP);

        self.emit_return();
        let finished = std::mem::replace(&mut self.fc, outer);
        let function_value = Value::function(Rc::new(finished.function));
        self.emit_constant(function_value);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        self.mark_initialized();
        let name = self.interner.intern(std::str::from_utf8(self.parser.previous.lexeme).unwrap_or(""));
        self.function_body(FunctionType::Function, name);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected Variable name");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration");
        self.define_variable(global);
    }

    fn if_statement(&mut self, loop_depth: i32) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect '(' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(loop_depth);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement(loop_depth);
        } else if self.matches(TokenKind::Elif) {
            self.if_statement(loop_depth);
        }

        self.patch_jump(else_jump);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.fc.kind == FunctionType::Script {
            self.error("Cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn break_statement(&mut self, loop_depth: i32) {
        if loop_depth != NOT_IN_LOOP {
            self.emit_break(loop_depth);
            self.consume(TokenKind::Semicolon, "Expect ';' after break statement");
        } else {
            self.error("must be in a loop or switch");
        }
    }

    fn continue_statement(&mut self, loop_depth: i32) {
        if loop_depth != NOT_IN_LOOP {
            self.emit_continue(loop_depth);
            self.consume(TokenKind::Semicolon, "Expect ';' after break statement");
        } else {
            self.error("must be in a loop");
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.begin_scope();
        let body_depth = self.fc.scope_depth;
        self.statement(body_depth);
        self.end_scope();

        self.patch_continues();
        self.emit_loop(OpCode::Loop, loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.patch_breaks();
    }

    fn do_statement(&mut self) {
        let loop_start = self.chunk_mut().len();

        self.begin_scope();
        let body_depth = self.fc.scope_depth;
        self.statement(body_depth);
        self.end_scope();
        self.patch_continues();

        self.consume(TokenKind::While, "Expect 'while' after do loop body");
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition");
        self.consume(TokenKind::Semicolon, "Expect ';' after condition");

        self.emit_loop(OpCode::LoopIfTrue, loop_start);
        self.patch_breaks();
    }

    fn for_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().len();

        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop  condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clause");

            self.emit_loop(OpCode::Loop, loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_scope();
        let body_depth = self.fc.scope_depth;
        self.statement(body_depth);
        self.end_scope();

        self.patch_continues();
        self.emit_loop(OpCode::Loop, loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.patch_breaks();
        self.end_scope();
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.parser.current.kind {
                Break | Continue | Class | Fun | Var | For | If | Switch | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn statement(&mut self, loop_depth: i32) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.block(loop_depth);
        } else if self.matches(TokenKind::If) {
            self.if_statement(loop_depth);
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Do) {
            self.do_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement(loop_depth);
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement(loop_depth);
        } else {
            self.expression_statement();
        }
    }

    fn declaration(&mut self, loop_depth: i32) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement(loop_depth);
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }
}

/// Compiles a complete Cave source unit into the top-level script
/// function. Equivalent to `original_source/src/compiler.c::compile`.
pub fn compile(source: &[u8], interner: &mut Interner) -> Result<Function> {
    Compiler::new(source, interner).compile()
}

/// Compiles a single expression against pre-bound `frame`/`index` locals,
/// for the host re-entrant evaluation hook (see `vm::RuntimeCall`).
/// Equivalent to `original_source/src/compiler.c::runtimeCompile`.
pub fn runtime_compile(source: &[u8], interner: &mut Interner) -> Result<Function> {
    Compiler::new_runtime(source, interner).compile_runtime()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    fn compile_ok(src: &str) -> Function {
        let mut interner = Interner::new();
        compile(src.as_bytes(), &mut interner).expect("should compile")
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let f = compile_ok("1 + 2 * 3;");
        assert_eq!(f.chunk.code.last().copied(), Some(OpCode::Return as u8));
    }

    #[test]
    fn rejects_break_outside_loop() {
        let mut interner = Interner::new();
        let result = compile(b"break;", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_return_at_top_level() {
        let mut interner = Interner::new();
        let result = compile(b"return 1;", &mut interner);
        assert!(result.is_err());
    }

    #[test]
    fn while_loop_compiles_with_break_and_continue() {
        let f = compile_ok("while (true) { break; }");
        assert!(f.chunk.code.iter().any(|&b| b == OpCode::JumpNPop as u8 || b == OpCode::Jump as u8));
    }

    #[test]
    fn function_declaration_nests_independent_locals() {
        let f = compile_ok("fun add(a, b) { return a + b; } add(1, 2);");
        // The script's own constant pool holds the `add` function value.
        assert!(f
            .chunk
            .constants
            .iter()
            .any(|v| v.as_function().is_some()));
    }

    #[test]
    fn string_interpolation_emits_interpolate_str() {
        let f = compile_ok("print \"a${1}b\";");
        assert!(f.chunk.code.contains(&(OpCode::InterpolateStr as u8)));
    }

    #[test]
    fn indexing_selects_matching_opcode() {
        let simple = compile_ok("var s = \"abc\"; s[0];");
        assert!(simple.chunk.code.contains(&(OpCode::Index as u8)));

        let range = compile_ok("var s = \"abc\"; s[0:1];");
        assert!(range.chunk.code.contains(&(OpCode::IndexRange as u8)));

        let interval = compile_ok("var s = \"abc\"; s[0:1:2];");
        assert!(interval
            .chunk
            .code
            .contains(&(OpCode::IndexRangeInterval as u8)));
    }
}
