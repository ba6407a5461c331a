//! Single-pass Pratt compiler: source text to bytecode, no intermediate
//! tree. Mirrors the source compiler's recursive-descent-plus-
//! precedence-table structure one module function at a time, with two
//! normative redesigns folded in: `break`/`next` are implemented via a
//! per-loop back-patch list instead of being compile errors, and
//! `switch`/`default` compile to a balanced, non-fall-through sequence.

use crate::compiler::scanner::{Scanner, Token, TokenKind};
use crate::diagnostics::{CompileError, CompileErrorKind};
use crate::values::{Obj, ObjFunction, Value};
use crate::vm::{Chunk, OpCode, Vm};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

/// A local variable slot. `depth: None` means "declared but not yet
/// initialized" — reading it in that state is the classic
/// `var a = a;` self-reference bug, caught by [`Parser::resolve_local`].
struct Local<'src> {
    name: &'src str,
    depth: Option<u32>,
    is_captured: bool,
    constant: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
    constant: bool,
}

/// Back-patch bookkeeping for one enclosing loop. `next`/`break` both
/// need to unwind locals declared since the loop body started without
/// disturbing the compiler's own scope-exit bookkeeping, hence
/// `scope_depth` rather than a local count.
struct LoopState {
    loop_start: usize,
    scope_depth: u32,
    break_jumps: Vec<usize>,
}

/// Tracks `self`/`super` validity independently of function nesting:
/// a function nested inside a method is still "in a class" for the
/// purpose of using `self`, but gets its own [`Compiler`] frame.
struct ClassState {
    has_superclass: bool,
}

/// Per-function compilation state: one pushed for the script itself
/// and one more for every nested `fun`/method, mirroring the source
/// compiler's `enclosing`-linked chain (here a `Vec` stack instead of
/// a linked list, since Rust borrowing makes indices easier to work
/// with than raw parent pointers).
struct Compiler<'src> {
    function: *mut ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: u32,
    upvalues: Vec<Upvalue>,
    loops: Vec<LoopState>,
}

impl<'src> Compiler<'src> {
    fn new(function: *mut ObjFunction, function_type: FunctionType) -> Compiler<'src> {
        // Slot 0 always holds the callee itself at runtime. Only
        // methods/initializers ever resolve it by name (`self`); plain
        // functions and the top-level script reserve it under a name
        // no identifier token can ever produce.
        let reserved_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "self",
            FunctionType::Function | FunctionType::Script => "",
        };
        Compiler {
            function,
            function_type,
            locals: vec![Local {
                name: reserved_name,
                depth: Some(0),
                is_captured: false,
                constant: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

type ParseFn<'vm, 'src> = fn(&mut Parser<'vm, 'src>, bool);

struct ParseRule<'vm, 'src> {
    prefix: Option<ParseFn<'vm, 'src>>,
    infix: Option<ParseFn<'vm, 'src>>,
    precedence: Precedence,
}

pub(crate) struct Parser<'vm, 'src> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compilers: Vec<Compiler<'src>>,
    classes: Vec<ClassState>,
}

pub(crate) fn compile(vm: &mut Vm, source: &str) -> Result<*mut ObjFunction, Vec<CompileError>> {
    let function = vm.alloc_function();
    vm.push_compiling_function(function);

    let dummy = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 0,
    };
    let mut parser = Parser {
        vm,
        scanner: Scanner::new(source),
        current: dummy,
        previous: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        compilers: vec![Compiler::new(function, FunctionType::Script)],
        classes: Vec::new(),
    };

    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }

    let had_error = parser.had_error;
    let errors = std::mem::take(&mut parser.errors);
    let (function, _upvalues) = parser.end_compiler();

    if had_error { Err(errors) } else { Ok(function) }
}

impl<'vm, 'src> Parser<'vm, 'src> {
    // ---- token stream -------------------------------------------------

    fn current_compiler(&mut self) -> &mut Compiler<'src> {
        self.compilers.last_mut().expect("no active function compiler")
    }

    fn chunk(&mut self) -> &mut Chunk {
        let f = self.current_compiler().function;
        unsafe { &mut (*f).chunk }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let kind = if self.current.lexeme == "Unterminated string." {
                CompileErrorKind::UnterminatedString
            } else {
                CompileErrorKind::UnexpectedCharacter
            };
            self.error_at_current(kind);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, what: &'static str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(CompileErrorKind::Expected(what));
    }

    // ---- error reporting ------------------------------------------------

    fn error_at(&mut self, line: u32, kind: CompileErrorKind) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        tracing::warn!(line, %kind, "compiler entering panic-mode recovery");
        self.errors.push(CompileError { line, kind });
    }

    fn error(&mut self, kind: CompileErrorKind) {
        let line = self.previous.line;
        self.error_at(line, kind);
    }

    fn error_at_current(&mut self, kind: CompileErrorKind) {
        let line = self.current.line;
        self.error_at(line, kind);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.chunk().write_u16(value, line);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error(CompileErrorKind::LoopBodyTooLarge);
        }
        self.emit_u16(offset as u16);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error(CompileErrorKind::JumpTooLarge);
        }
        self.chunk().patch_u16(offset, jump as u16);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        // Root `value` for the duration of the (possibly allocating,
        // possibly GC-triggering) push onto the constant pool.
        self.vm.stack_push(value);
        let idx = self.chunk().add_constant(value);
        self.vm.stack_pop();
        if idx > u8::MAX as usize {
            self.error(CompileErrorKind::TooManyConstants);
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let ptr = self
            .vm
            .intern_owned_string(name.to_string())
            .expect("compile-time interning runs with an empty value stack");
        self.make_constant(Value::obj(ptr as *mut Obj))
    }

    fn end_compiler(&mut self) -> (*mut ObjFunction, Vec<Upvalue>) {
        self.emit_return();
        let compiler = self.compilers.pop().expect("compiler stack underflow");
        self.vm.pop_compiling_function();
        (compiler.function, compiler.upvalues)
    }

    // ---- scope / locals / upvalues ------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_compiler().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler().scope_depth -= 1;
        let depth = self.current_compiler().scope_depth;
        loop {
            let Some(local) = self.current_compiler().locals.last() else {
                break;
            };
            if !local.depth.is_some_and(|d| d > depth) {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_compiler().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str, constant: bool) {
        if self.current_compiler().locals.len() >= MAX_LOCALS {
            self.error(CompileErrorKind::TooManyLocals);
            return;
        }
        self.current_compiler().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
            constant,
        });
    }

    fn declare_variable(&mut self, name: &'src str, constant: bool) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        let mut duplicate = false;
        for local in self.current_compiler().locals.iter().rev() {
            if let Some(d) = local.depth {
                if d < scope_depth {
                    break;
                }
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error(CompileErrorKind::AlreadyDeclared);
        }
        self.add_local(name, constant);
    }

    fn mark_initialized(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }
        let depth = self.current_compiler().scope_depth;
        let locals = &mut self.current_compiler().locals;
        let last = locals.len() - 1;
        locals[last].depth = Some(depth);
    }

    fn parse_variable(&mut self, what: &'static str, constant: bool) -> u8 {
        self.consume(TokenKind::Identifier, what);
        let name = self.previous.lexeme;
        if self.current_compiler().scope_depth > 0 {
            self.declare_variable(name, constant);
            return 0;
        }
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8, constant: bool) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if constant {
            let name_val = self.chunk().constants[global as usize];
            let name_ptr = name_val.as_string();
            self.vm.global_constants_mut().set(name_ptr, Value::nil());
            self.emit_op(OpCode::DefineGlobalConst);
        } else {
            self.emit_op(OpCode::DefineGlobal);
        }
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, compiler_idx: usize, name: &str) -> Option<(u8, bool)> {
        let locals = &self.compilers[compiler_idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    self.error(CompileErrorKind::ReadInOwnInitializer);
                }
                return Some((i as u8, local.constant));
            }
        }
        None
    }

    fn add_upvalue(&mut self, compiler_idx: usize, index: u8, is_local: bool, constant: bool) -> u8 {
        let upvalues = &mut self.compilers[compiler_idx].upvalues;
        for (i, uv) in upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error(CompileErrorKind::TooManyUpvalues);
            return 0;
        }
        upvalues.push(Upvalue {
            index,
            is_local,
            constant,
        });
        let count = upvalues.len();
        unsafe {
            (*self.compilers[compiler_idx].function).upvalue_count = count as u8;
        }
        (count - 1) as u8
    }

    fn resolve_upvalue(&mut self, compiler_idx: usize, name: &str) -> Option<(u8, bool)> {
        if compiler_idx == 0 {
            return None;
        }
        let enclosing_idx = compiler_idx - 1;
        if let Some((local_idx, constant)) = self.resolve_local(enclosing_idx, name) {
            self.compilers[enclosing_idx].locals[local_idx as usize].is_captured = true;
            let idx = self.add_upvalue(compiler_idx, local_idx, true, constant);
            return Some((idx, constant));
        }
        if let Some((upvalue_idx, constant)) = self.resolve_upvalue(enclosing_idx, name) {
            let idx = self.add_upvalue(compiler_idx, upvalue_idx, false, constant);
            return Some((idx, constant));
        }
        None
    }

    fn resolve_variable(&mut self, compiler_idx: usize, name: &str) -> (OpCode, OpCode, u8, bool) {
        if let Some((idx, constant)) = self.resolve_local(compiler_idx, name) {
            return (OpCode::GetLocal, OpCode::SetLocal, idx, constant);
        }
        if let Some((idx, constant)) = self.resolve_upvalue(compiler_idx, name) {
            return (OpCode::GetUpvalue, OpCode::SetUpvalue, idx, constant);
        }
        let idx = self.identifier_constant(name);
        let name_val = self.chunk().constants[idx as usize];
        let is_const = self.vm.global_constants_mut().contains_key(name_val.as_string());
        (OpCode::GetGlobal, OpCode::SetGlobal, idx, is_const)
    }

    // ---- Pratt table ------------------------------------------------

    fn get_rule(kind: TokenKind) -> ParseRule<'vm, 'src> {
        use TokenKind::*;
        match kind {
            LeftParen => ParseRule {
                prefix: Some(Self::grouping),
                infix: Some(Self::call),
                precedence: Precedence::Call,
            },
            Dot => ParseRule {
                prefix: None,
                infix: Some(Self::dot),
                precedence: Precedence::Call,
            },
            Minus => ParseRule {
                prefix: Some(Self::unary),
                infix: Some(Self::binary),
                precedence: Precedence::Term,
            },
            Plus => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Term,
            },
            Slash => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Factor,
            },
            Star => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Factor,
            },
            Bang => ParseRule {
                prefix: Some(Self::unary),
                infix: None,
                precedence: Precedence::None,
            },
            BangEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Equality,
            },
            EqualEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Equality,
            },
            Greater => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Comparison,
            },
            GreaterEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Comparison,
            },
            Less => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Comparison,
            },
            LessEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Comparison,
            },
            Identifier => ParseRule {
                prefix: Some(Self::variable),
                infix: None,
                precedence: Precedence::None,
            },
            String => ParseRule {
                prefix: Some(Self::string),
                infix: None,
                precedence: Precedence::None,
            },
            Number => ParseRule {
                prefix: Some(Self::number),
                infix: None,
                precedence: Precedence::None,
            },
            And => ParseRule {
                prefix: None,
                infix: Some(Self::and_),
                precedence: Precedence::And,
            },
            Or => ParseRule {
                prefix: None,
                infix: Some(Self::or_),
                precedence: Precedence::Or,
            },
            False | Nil | True => ParseRule {
                prefix: Some(Self::literal),
                infix: None,
                precedence: Precedence::None,
            },
            Super => ParseRule {
                prefix: Some(Self::super_),
                infix: None,
                precedence: Precedence::None,
            },
            SelfKw => ParseRule {
                prefix: Some(Self::self_),
                infix: None,
                precedence: Precedence::None,
            },
            _ => ParseRule {
                prefix: None,
                infix: None,
                precedence: Precedence::None,
            },
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix_rule) = Self::get_rule(self.previous.kind).prefix else {
            self.error(CompileErrorKind::Expected("expression"));
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            let infix_rule = Self::get_rule(self.previous.kind)
                .infix
                .expect("precedence table entry without an infix handler");
            infix_rule(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error(CompileErrorKind::InvalidAssignmentTarget);
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // ---- prefix/infix handlers ------------------------------------------------

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner only ever emits well-formed number lexemes");
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let ptr = self
            .vm
            .intern_owned_string(content.to_string())
            .expect("compile-time interning runs with an empty value stack");
        self.emit_constant(Value::obj(ptr as *mut Obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal() invoked for a non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary() invoked for a non-unary operator"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule_precedence = Self::get_rule(op_kind).precedence;
        self.parse_precedence(rule_precedence.next());
        match op_kind {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() invoked for a non-binary operator"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == MAX_ARGS {
                    self.error(CompileErrorKind::TooManyArguments);
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after arguments");
        argc as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    /// `.` as an infix operator: plain property read, `invoke()`,
    /// assignment, or one of the compound assignments. `/=`/`*=` are
    /// fixed here to always emit `Divide`/`Multiply` respectively —
    /// the source compiler's `dot()` has the `/=` case fall through to
    /// `OP_SUBTRACT` by mistake; that bug is not reproduced.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "property name after '.'");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);

        let compound_op = if !can_assign {
            None
        } else if self.match_token(TokenKind::PlusEqual) {
            Some(OpCode::Add)
        } else if self.match_token(TokenKind::MinusEqual) {
            Some(OpCode::Subtract)
        } else if self.match_token(TokenKind::StarEqual) {
            Some(OpCode::Multiply)
        } else if self.match_token(TokenKind::SlashEqual) {
            Some(OpCode::Divide)
        } else {
            None
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name_idx);
        } else if let Some(op) = compound_op {
            self.emit_op(OpCode::GetPropertyNoPop);
            self.emit_byte(name_idx);
            self.expression();
            self.emit_op(op);
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name_idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_idx);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name_idx);
        }
    }

    /// Shared by plain identifiers, `self`, and the `self`/`super`
    /// synthetic lookups during method compilation: resolves the name
    /// to a local/upvalue/global slot and, for `can_assign` contexts,
    /// handles `=`/`+=`/`-=`/`*=`/`/=`. `/=` and `*=` are both fixed to
    /// always emit their correct opcode — the source compiler's
    /// `named_variable()` has `*=` fall through to `OP_DIVIDE`.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let compiler_idx = self.compilers.len() - 1;
        let (get_op, set_op, arg, is_const) = self.resolve_variable(compiler_idx, name);

        if can_assign && self.match_token(TokenKind::Equal) {
            if is_const {
                self.error(CompileErrorKind::AssignToConstant);
            }
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
            return;
        }

        let compound_op = if !can_assign {
            None
        } else if self.match_token(TokenKind::PlusEqual) {
            Some(OpCode::Add)
        } else if self.match_token(TokenKind::MinusEqual) {
            Some(OpCode::Subtract)
        } else if self.match_token(TokenKind::StarEqual) {
            Some(OpCode::Multiply)
        } else if self.match_token(TokenKind::SlashEqual) {
            Some(OpCode::Divide)
        } else {
            None
        };

        if let Some(op) = compound_op {
            if is_const {
                self.error(CompileErrorKind::AssignToConstant);
            }
            self.emit_op(get_op);
            self.emit_byte(arg);
            self.expression();
            self.emit_op(op);
            self.emit_op(set_op);
            self.emit_byte(arg);
            return;
        }

        self.emit_op(get_op);
        self.emit_byte(arg);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn self_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(CompileErrorKind::SelfOutsideClass);
            return;
        }
        self.named_variable("self", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(CompileErrorKind::SuperOutsideClass);
        } else if !self.classes.last().unwrap().has_superclass {
            self.error(CompileErrorKind::SuperWithoutSuperclass);
        }

        self.consume(TokenKind::Dot, "'.' after 'super'");
        self.consume(TokenKind::Identifier, "superclass method name");
        let name_idx = self.identifier_constant(self.previous.lexeme);

        self.named_variable("self", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_idx);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name_idx);
        }
    }

    // ---- declarations ------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(true);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, constant: bool) {
        let global = self.parse_variable("variable name", constant);

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "';' after variable declaration");
        self.define_variable(global, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("function name", false);
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global, false);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name = self.previous.lexeme;
        let func_ptr = self.vm.alloc_function();
        // Root `func_ptr` as a compiling function *before* interning its
        // name: interning can itself allocate and trigger a GC cycle, and
        // a function with no other roots yet would otherwise be swept.
        self.vm.push_compiling_function(func_ptr);
        let interned = self
            .vm
            .intern_owned_string(name.to_string())
            .expect("compile-time interning runs with an empty value stack");
        unsafe {
            (*func_ptr).name = Some(interned);
        }
        self.compilers.push(Compiler::new(func_ptr, function_type));

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = unsafe { (*func_ptr).arity };
                if arity == u8::MAX {
                    self.error_at_current(CompileErrorKind::TooManyParameters);
                } else {
                    unsafe {
                        (*func_ptr).arity = arity + 1;
                    }
                }
                let param_idx = self.parse_variable("parameter name", false);
                self.define_variable(param_idx, false);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters");
        self.consume(TokenKind::LeftBrace, "'{' before function body");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let value = Value::obj(function as *mut Obj);
        let idx = self.make_constant(value);
        self.emit_op(OpCode::Closure);
        self.emit_byte(idx);

        for uv in &upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Def, "'def' before method name");
        self.consume(TokenKind::Identifier, "method name");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        let function_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_op(OpCode::Method);
        self.emit_byte(name_idx);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "class name");
        let class_name = self.previous.lexeme;
        let name_idx = self.identifier_constant(class_name);
        self.declare_variable(class_name, false);

        self.emit_op(OpCode::Class);
        self.emit_byte(name_idx);
        self.define_variable(name_idx, false);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "superclass name");
            let super_name = self.previous.lexeme;
            if super_name == class_name {
                self.error(CompileErrorKind::ClassInheritsFromItself);
            }
            self.variable(false);

            self.begin_scope();
            self.add_local("super", false);
            self.define_variable(0, false);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "'{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "'}' after class body");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    // ---- statements ------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Next) {
            self.next_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "'}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after value");
        self.emit_op(OpCode::Print);
    }

    /// An expression statement suppresses its trailing `POP` when the
    /// expression is immediately followed by `?`, handing off to
    /// [`Self::ternary_statement`] instead — `cond ? a : b;` is a
    /// statement-level construct, not a value-producing expression.
    fn expression_statement(&mut self) {
        self.expression();
        if self.match_token(TokenKind::QuestionMark) {
            self.ternary_statement();
            return;
        }
        self.consume(TokenKind::Semicolon, "';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn ternary_statement(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.expression();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Colon, "':' in ternary expression");
        self.expression();

        self.patch_jump(else_jump);
        self.consume(TokenKind::Semicolon, "';' after ternary expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "'(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn start_loop(&mut self) -> usize {
        let loop_start = self.chunk().len();
        let scope_depth = self.current_compiler().scope_depth;
        self.current_compiler().loops.push(LoopState {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });
        loop_start
    }

    fn end_loop(&mut self) {
        let loop_state = self.current_compiler().loops.pop().expect("loop stack underflow");
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.start_loop();
        self.consume(TokenKind::LeftParen, "'(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after 'for'");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.start_loop();

        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            // `next` must resume at the increment clause, not jump
            // back to the initializer.
            self.current_compiler().loops.last_mut().unwrap().loop_start = loop_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_loop();
        self.end_scope();
    }

    /// Pop/close every local declared since the loop body's own scope
    /// started, without mutating the compiler's local list — the
    /// block we're jumping out of still ends normally, and its own
    /// `end_scope` will pop those same slots again off the compiler's
    /// bookkeeping (not the runtime stack, which this already balanced).
    fn discard_locals_to_loop_scope(&mut self) {
        let loop_scope_depth = self.current_compiler().loops.last().unwrap().scope_depth;
        let captured_flags: Vec<bool> = self
            .current_compiler()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth.is_some_and(|d| d > loop_scope_depth))
            .map(|l| l.is_captured)
            .collect();
        for is_captured in captured_flags {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        if self.current_compiler().loops.is_empty() {
            self.error(CompileErrorKind::BreakOutsideLoop);
            self.consume(TokenKind::Semicolon, "';' after 'break'");
            return;
        }
        self.consume(TokenKind::Semicolon, "';' after 'break'");
        self.discard_locals_to_loop_scope();
        let jump = self.emit_jump(OpCode::Jump);
        self.current_compiler().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn next_statement(&mut self) {
        if self.current_compiler().loops.is_empty() {
            self.error(CompileErrorKind::NextOutsideLoop);
            self.consume(TokenKind::Semicolon, "';' after 'next'");
            return;
        }
        self.consume(TokenKind::Semicolon, "';' after 'next'");
        self.discard_locals_to_loop_scope();
        let loop_start = self.current_compiler().loops.last().unwrap().loop_start;
        self.emit_loop(loop_start);
    }

    /// `switch`/`case`/`default`, redesigned: every arm ends with an
    /// unconditional jump to the end (no fall-through), `default` is
    /// supported, and the duplicated subject is always popped exactly
    /// once regardless of which arm ran or whether any did.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "'(' after 'switch'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after switch subject");
        self.consume(TokenKind::LeftBrace, "'{' before switch body");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                if seen_default {
                    self.error(CompileErrorKind::Expected("'case' before 'default'"));
                }
                self.emit_op(OpCode::Dup);
                self.expression();
                self.emit_op(OpCode::Equal);
                self.consume(TokenKind::Colon, "':' after case value");
                let next_case = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);

                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
                end_jumps.push(self.emit_jump(OpCode::Jump));

                self.patch_jump(next_case);
                self.emit_op(OpCode::Pop);
            } else if self.match_token(TokenKind::Default) {
                seen_default = true;
                self.consume(TokenKind::Colon, "':' after 'default'");
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
            } else {
                self.error_at_current(CompileErrorKind::Expected("'case' or 'default'"));
                self.advance();
            }
        }

        self.consume(TokenKind::RightBrace, "'}' after switch body");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.emit_op(OpCode::Pop); // the subject DUP'd before every case test
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error(CompileErrorKind::ReturnFromTopLevel);
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.error(CompileErrorKind::ReturnValueFromInitializer);
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after return value");
        self.emit_op(OpCode::Return);
    }
}
