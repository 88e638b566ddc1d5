//! Single-pass recursive-descent compiler.
//!
//! There is no intermediate AST: each grammar production emits bytecode
//! directly into the [`Chunk`] of the function currently being compiled.
//! Parsing errors don't abort the pass — the compiler enters panic mode,
//! swallows tokens until a likely statement boundary, and keeps going so a
//! single source file can report more than one diagnostic.

use crate::chunk::{Chunk, OpCode, ACCESS_GET, ACCESS_SET};
use crate::diagnostic::{Diagnostic, Span};
use crate::object::{Heap, ObjFunction, ObjRef, UpvalueDesc};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

#[derive(PartialEq, PartialOrd, Clone, Copy)]
enum Precedence {
    None,
    Assignment, // =
    Or,
    And,
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
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

#[derive(Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

struct ClassScope {
    has_superclass: bool,
}

/// One nested function's worth of compile-time state: its in-progress
/// chunk, its locals, and its captured-upvalue descriptors.
struct FunctionFrame<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionFrame<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved: `this` for methods, otherwise an unnamed slot
        // the caller's function value occupies.
        let reserved_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        let locals = vec![Local {
            name: Token { kind: TokenKind::Identifier, lexeme: reserved_name, line: 0 },
            depth: 0,
            is_captured: false,
        }];
        Self {
            function: ObjFunction::new(name),
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src> {
    heap: &'src mut Heap,
    scanner: Scanner<'src>,
    source: &'src str,
    previous: Token<'src>,
    current: Token<'src>,
    frames: Vec<FunctionFrame<'src>>,
    classes: Vec<ClassScope>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
}

type ParseFn<'src> = fn(&mut Compiler<'src>, can_assign: bool);

struct Rule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn rule<'src>(kind: TokenKind) -> Rule<'src> {
    use TokenKind::{
        And, Bang, BangEqual, Class as ClassKw, Comma, Dot, Else, Eof, Equal, EqualEqual, Error,
        False, For, Fun, Greater, GreaterEqual, Identifier, If, LeftBrace, LeftParen, Less,
        LessEqual, Minus, Nil, Number, Or, Plus, Return, RightBrace, RightParen, Semicolon,
        Slash, Star, String as StringKw, Super, This, True, Var, While,
    };
    match kind {
        LeftParen => Rule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        Dot => Rule { prefix: None, infix: Some(Compiler::dot), precedence: Precedence::Call },
        Minus => Rule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => Rule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        BangEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => Rule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
        StringKw => Rule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None },
        Number => Rule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None },
        And => Rule { prefix: None, infix: Some(Compiler::and), precedence: Precedence::And },
        Or => Rule { prefix: None, infix: Some(Compiler::or), precedence: Precedence::Or },
        False => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        Nil => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        True => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        This => Rule { prefix: Some(Compiler::this), infix: None, precedence: Precedence::None },
        Super => Rule { prefix: Some(Compiler::super_), infix: None, precedence: Precedence::None },
        RightParen | LeftBrace | RightBrace | Comma | Semicolon | Equal | ClassKw | Else | For
        | Fun | If | Return | Var | While | Error | Eof => {
            Rule { prefix: None, infix: None, precedence: Precedence::None }
        }
    }
}

impl<'src> Compiler<'src> {
    pub fn compile(heap: &'src mut Heap, source: &'src str) -> Result<ObjFunction, Vec<Diagnostic>> {
        let mut compiler = Compiler {
            heap,
            scanner: Scanner::new(source),
            source,
            previous: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
            current: Token { kind: TokenKind::Eof, lexeme: "", line: 0 },
            frames: vec![FunctionFrame::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            diagnostics: Vec::new(),
            panic_mode: false,
        };
        compiler.advance();
        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.consume(TokenKind::Eof, "expected end of expression");
        let function = compiler.end_function();
        if compiler.diagnostics.is_empty() {
            Ok(function)
        } else {
            Err(compiler.diagnostics)
        }
    }

    fn frame(&mut self) -> &mut FunctionFrame<'src> {
        self.frames.last_mut().expect("compiler frame stack is never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.frame().function.chunk
    }

    fn end_function(&mut self) -> ObjFunction {
        self.emit_return();
        self.frames.pop().expect("ended a frame that was never pushed").function
    }

    // --- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn line_span(&self, token: Token<'src>) -> Span {
        let start = token.lexeme.as_ptr() as usize - self.source.as_ptr() as usize;
        Span::new(start, start + token.lexeme.len())
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let span = self.line_span(token);
        let label = if token.kind == TokenKind::Eof {
            "at end of input".to_owned()
        } else {
            format!("near '{}'", token.lexeme)
        };
        let diag = Diagnostic::new(message).with_source(self.source).with_label(span, label);
        self.diagnostics.push(diag);
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
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --- emission helpers --------------------------------------------------

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write_byte(byte, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xff) as u8);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.chunk().add_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u16(idx);
    }

    /// Emit `BOOL` selecting one of the three literal-name constants.
    fn emit_bool(&mut self, name: &'static str) {
        let idx = self.string_constant(name);
        self.emit_op(OpCode::Bool);
        self.emit_u16(idx);
    }

    /// Emit `COMPARE` with an operator selector of `"!"`, `"="`, `">"`, or `"<"`.
    fn emit_compare(&mut self, op: &'static str) {
        let idx = self.string_constant(op);
        self.emit_op(OpCode::Compare);
        self.emit_u16(idx);
    }

    /// Emit `BINARY` with an operator selector of `"+"`, `"-"`, `"*"`, or `"/"`.
    fn emit_binary(&mut self, op: &'static str) {
        let idx = self.string_constant(op);
        self.emit_op(OpCode::Binary);
        self.emit_u16(idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.chunk().patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(message) = self.chunk().emit_loop(loop_start, line) {
            self.error(&message);
        }
    }

    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::Local);
            self.emit_byte(0);
            self.emit_byte(ACCESS_GET);
        } else {
            self.emit_bool("NULL");
        }
        self.emit_op(OpCode::Return);
    }

    /// Intern `s` and add it to the current chunk's constant pool, returning
    /// its index. Used both for identifier names (globals, properties,
    /// methods) and for the short operator/literal-name strings `BOOL`,
    /// `COMPARE`, and `BINARY` select on.
    fn string_constant(&mut self, s: &str) -> u16 {
        let r = self.heap.intern_string(s);
        self.chunk().add_constant(Value::Obj(r))
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.string_constant(name)
    }

    // --- declarations -------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable(name_token);

        self.emit_op(OpCode::Class);
        self.emit_u16(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassScope { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let super_token = self.previous;
            if super_token.lexeme == name_token.lexeme {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(super_token, false);

            self.begin_scope();
            self.add_local(Token { kind: TokenKind::Super, lexeme: "super", line: 0 });
            self.define_variable(0);

            self.named_variable(name_token, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop); // the class value, pushed above for method binding

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expected method name");
        let name_token = self.previous;
        let constant = self.identifier_constant(name_token.lexeme);
        let kind = if name_token.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, name_token);
        self.emit_op(OpCode::Method);
        self.emit_u16(constant);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name_token = self.previous;
        self.declare_variable(name_token);
        let global = if self.frame().scope_depth > 0 { 0 } else { self.identifier_constant(name_token.lexeme) };
        self.mark_initialized();
        self.function(FunctionKind::Function, name_token);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name_token: Token<'src>) {
        let name_ref = self.heap.intern_string(name_token.lexeme);
        self.frames.push(FunctionFrame::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.frame().function.arity += 1;
                if self.frame().function.arity as usize > MAX_ARGS {
                    self.error_at_current("too many parameters");
                }
                self.consume(TokenKind::Identifier, "expected parameter name");
                let param_token = self.previous;
                self.declare_variable(param_token);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        let upvalues = std::mem::take(&mut self.frame().upvalues);
        self.frame().function.upvalue_count = upvalues.len() as u8;
        let function = self.end_function();

        let function_ref = self.heap.alloc_function(function);
        let idx = self.chunk().add_constant(Value::Obj(function_ref));
        self.emit_op(OpCode::Closure);
        self.emit_u16(idx);
        for uv in upvalues {
            self.emit_byte(u8::from(uv.is_local));
            self.emit_byte(uv.index);
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected identifier");
        let name_token = self.previous;
        self.declare_variable(name_token);
        let global = if self.frame().scope_depth > 0 { 0 } else { self.identifier_constant(name_token.lexeme) };

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_bool("NULL");
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.define_variable(global);
    }

    fn declare_variable(&mut self, name_token: Token<'src>) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name_token.lexeme {
                self.error("a variable with this name already exists in this scope");
            }
        }
        self.add_local(name_token);
    }

    fn add_local(&mut self, name_token: Token<'src>) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        self.frame().locals.push(Local { name: name_token, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u16) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_u16(global);
    }

    // --- statements ---------------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn return_statement(&mut self) {
        if self.frame().kind == FunctionKind::Script {
            self.error("cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.error("cannot return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.frame().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame().locals.pop();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    // --- expressions ----------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("expected an expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.expect("infix rule must exist when precedence matched");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let contents = &raw[1..raw.len() - 1];
        let r = self.heap.intern_string(contents);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_bool("FALS"),
            TokenKind::True => self.emit_bool("TRUE"),
            TokenKind::Nil => self.emit_bool("NULL"),
            _ => unreachable!("literal() called on a non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Unary),
            TokenKind::Bang => self.emit_compare("!"),
            _ => unreachable!("unary() called on a non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let next = rule(kind).precedence.next();
        self.parse_precedence(next);
        match kind {
            TokenKind::Plus => self.emit_binary("+"),
            TokenKind::Minus => self.emit_binary("-"),
            TokenKind::Star => self.emit_binary("*"),
            TokenKind::Slash => self.emit_binary("/"),
            TokenKind::BangEqual => {
                self.emit_compare("=");
                self.emit_compare("!");
            }
            TokenKind::EqualEqual => self.emit_compare("="),
            TokenKind::Greater => self.emit_compare(">"),
            TokenKind::GreaterEqual => {
                self.emit_compare("<");
                self.emit_compare("!");
            }
            TokenKind::Less => self.emit_compare("<"),
            TokenKind::LessEqual => {
                self.emit_compare(">");
                self.emit_compare("!");
            }
            _ => unreachable!("binary() called on a non-binary-operator token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("too many arguments");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name_token = self.previous;
        let name = self.identifier_constant(name_token.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_u16(name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(name);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'this' can only be used inside a method");
            return;
        }
        self.named_variable(self.previous, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'super' can only be used inside a method");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("'super' can't be used in a class with no superclass");
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let method_token = self.previous;
        let name = self.identifier_constant(method_token.lexeme);

        let this_token = Token { kind: TokenKind::This, lexeme: "this", line: method_token.line };
        let super_token = Token { kind: TokenKind::Super, lexeme: "super", line: method_token.line };
        self.named_variable(this_token, false);

        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_u16(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_op(OpCode::GetSuper);
            self.emit_u16(name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    /// Emit `LOCAL`/`UPVALUE`/`GLOBAL` access, appending the trailing
    /// `isSet` byte last so get/set share the same operand layout.
    fn named_variable(&mut self, name_token: Token<'src>, can_assign: bool) {
        let top = self.frames.len() - 1;
        enum Slot {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }
        let slot = self
            .resolve_local(top, name_token)
            .map(|i| Slot::Local(i as u8))
            .or_else(|| self.resolve_upvalue(top, name_token).map(|i| Slot::Upvalue(i as u8)))
            .unwrap_or_else(|| Slot::Global(self.identifier_constant(name_token.lexeme)));

        let is_set = can_assign && self.matches(TokenKind::Equal);
        if is_set {
            self.expression();
        }
        let access = if is_set { ACCESS_SET } else { ACCESS_GET };

        match slot {
            Slot::Local(index) => {
                self.emit_op(OpCode::Local);
                self.emit_byte(index);
                self.emit_byte(access);
            }
            Slot::Upvalue(index) => {
                self.emit_op(OpCode::Upvalue);
                self.emit_byte(index);
                self.emit_byte(access);
            }
            Slot::Global(index) => {
                self.emit_op(OpCode::Global);
                self.emit_u16(index);
                self.emit_byte(access);
            }
        }
    }

    fn resolve_local(&mut self, frame_index: usize, name_token: Token<'src>) -> Option<usize> {
        let locals = &self.frames[frame_index].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name.lexeme == name_token.lexeme {
                if local.depth == -1 {
                    self.error("can't read local variable in its own initializer");
                }
                return Some(i);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name_token: Token<'src>) -> Option<usize> {
        if frame_index == 0 {
            return None;
        }
        if let Some(local_slot) = self.resolve_local(frame_index - 1, name_token) {
            self.frames[frame_index - 1].locals[local_slot].is_captured = true;
            return Some(self.add_upvalue(frame_index, local_slot as u8, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(frame_index - 1, name_token) {
            return Some(self.add_upvalue(frame_index, upvalue_slot as u8, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> usize {
        let upvalues = &mut self.frames[frame_index].upvalues;
        for (i, uv) in upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("too many closure variables in one function");
            return 0;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        upvalues.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> ObjFunction {
        let mut heap = Heap::new();
        match Compiler::compile(&mut heap, source) {
            Ok(f) => f,
            Err(diags) => panic!("unexpected compile error: {:?}", diags.iter().map(|d| d.message.clone()).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let function = compile_ok("1 + 2 * 3;");
        assert!(!function.chunk.code.is_empty());
    }

    #[test]
    fn reports_diagnostic_for_missing_semicolon() {
        let mut heap = Heap::new();
        let result = Compiler::compile(&mut heap, "var x = 1");
        assert!(result.is_err());
    }

    #[test]
    fn class_with_superclass_requires_distinct_name() {
        let mut heap = Heap::new();
        let result = Compiler::compile(&mut heap, "class A < A {}");
        assert!(result.is_err());
    }

    #[test]
    fn top_level_return_is_an_error() {
        let mut heap = Heap::new();
        let result = Compiler::compile(&mut heap, "return 1;");
        assert!(result.is_err());
    }
}
