//! Single-pass Pratt compiler. There is no intermediate AST: every
//! expression and statement is turned into bytecode the moment enough
//! tokens have been seen to know what it means. A stack of `FunctionFrame`s
//! tracks one entry per function currently being compiled (innermost last);
//! each frame owns its own `Chunk`, locals array, and upvalue array.

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::gc::Heap;
use crate::object::{Obj, ObjFunction};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// User-declared locals per function, not counting the reserved slot 0 that
/// holds the callee/receiver. The locals array therefore holds up to 257
/// entries; the 257th *user* local is the error.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

#[derive(Clone, Copy)]
struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule {
            prefix: Some(Compiler::grouping),
            infix: Some(Compiler::call),
            precedence: Precedence::Call,
        },
        Dot => ParseRule {
            prefix: None,
            infix: Some(Compiler::dot),
            precedence: Precedence::Call,
        },
        Minus => ParseRule {
            prefix: Some(Compiler::unary),
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        Plus => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        Slash | Star => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Factor,
        },
        Bang => ParseRule {
            prefix: Some(Compiler::unary),
            infix: None,
            precedence: Precedence::None,
        },
        BangEqual | EqualEqual => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Equality,
        },
        Greater | GreaterEqual | Less | LessEqual => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Comparison,
        },
        Identifier => ParseRule {
            prefix: Some(Compiler::variable),
            infix: None,
            precedence: Precedence::None,
        },
        String => ParseRule {
            prefix: Some(Compiler::string),
            infix: None,
            precedence: Precedence::None,
        },
        Number => ParseRule {
            prefix: Some(Compiler::number),
            infix: None,
            precedence: Precedence::None,
        },
        And => ParseRule {
            prefix: None,
            infix: Some(Compiler::and_),
            precedence: Precedence::And,
        },
        Or => ParseRule {
            prefix: None,
            infix: Some(Compiler::or_),
            precedence: Precedence::Or,
        },
        False | True | Nil => ParseRule {
            prefix: Some(Compiler::literal),
            infix: None,
            precedence: Precedence::None,
        },
        This => ParseRule {
            prefix: Some(Compiler::this_),
            infix: None,
            precedence: Precedence::None,
        },
        Super => ParseRule {
            prefix: Some(Compiler::super_),
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

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// -1 is the sentinel "declared but not yet defined" depth; reading a
    /// local at that depth is a use-before-initialization error.
    depth: i32,
    captured: bool,
}

struct Upvalue {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    continue_target: usize,
    breaks: Vec<usize>,
    scope_depth: i32,
}

struct FunctionFrame<'src> {
    chunk: Chunk,
    name: Option<*mut Obj>,
    arity: u8,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<Upvalue>,
    loops: Vec<LoopCtx>,
}

impl<'src> FunctionFrame<'src> {
    fn new(function_type: FunctionType, name: Option<*mut Obj>) -> Self {
        // Slot 0 is reserved for the callee/receiver; giving it a Local
        // entry keeps every other local's index aligned with its stack
        // slot without a separate offset-by-one everywhere else.
        let slot_zero_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        FunctionFrame {
            chunk: Chunk::new(),
            name,
            arity: 0,
            function_type,
            locals: vec![Local {
                name: slot_zero_name,
                depth: 0,
                captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    // Raw pointer rather than `&mut Heap`: a second lifetime parameter on
    // `Compiler` would have to thread through every `ParseFn`, and the rest
    // of this crate already treats the heap as an out-of-band allocator
    // reached through raw pointers.
    heap: *mut Heap,
    frames: Vec<FunctionFrame<'src>>,
    classes: Vec<ClassCtx>,
    is_repl: bool,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, heap: &mut Heap, is_repl: bool) -> Self {
        Compiler {
            scanner: Scanner::new(source),
            previous: Token::synthetic(""),
            current: Token::synthetic(""),
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap: heap as *mut Heap,
            frames: vec![FunctionFrame::new(FunctionType::Script, None)],
            classes: Vec::new(),
            is_repl,
        }
    }

    fn heap_mut(&mut self) -> &mut Heap {
        unsafe { &mut *self.heap }
    }

    fn frame(&self) -> &FunctionFrame<'src> {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut FunctionFrame<'src> {
        self.frames.last_mut().unwrap()
    }

    fn current_chunk(&self) -> &Chunk {
        &self.frame().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.frame_mut().chunk
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let line = self.current.line;
            let message = self.current.lexeme.to_string();
            self.push_error(CompileError::Syntax {
                line,
                lexeme: String::new(),
                message,
            });
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
        if self.check(kind) {
            self.advance();
            return;
        }
        let line = self.current.line;
        let lexeme = self.current.lexeme.to_string();
        self.push_error(CompileError::Syntax {
            line,
            lexeme,
            message: message.to_string(),
        });
    }

    // --- error handling -----------------------------------------------

    fn push_error(&mut self, error: CompileError) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(error);
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
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --- bytecode emission -----------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk_mut().write_op(op, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk_mut().emit_jump(op, line)
    }

    fn patch_jump(&mut self, at: usize) {
        if self.current_chunk_mut().patch_jump(at).is_err() {
            let line = self.previous.line;
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::JumpTooLarge { line, lexeme });
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.current_chunk_mut().emit_loop(loop_start, line).is_err() {
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::JumpTooLarge { line, lexeme });
        }
    }

    /// Emits `short_op` with a one-byte operand when `index` fits, otherwise
    /// `long_op` with a three-byte little-endian operand. Covers every
    /// opcode whose operand is a constant-pool index, since the pool isn't
    /// bounded to 256 entries the way locals/upvalues are.
    fn emit_indexed(&mut self, short_op: OpCode, long_op: OpCode, index: u32) {
        if let Ok(byte) = u8::try_from(index) {
            self.emit_op(short_op);
            self.emit_byte(byte);
        } else {
            self.emit_op(long_op);
            self.emit_byte(index as u8);
            self.emit_byte((index >> 8) as u8);
            self.emit_byte((index >> 16) as u8);
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        match self.current_chunk_mut().add_constant(value) {
            Some(index) => self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index),
            None => {
                let lexeme = self.previous.lexeme.to_string();
                self.push_error(CompileError::TooManyConstants { line, lexeme });
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u32 {
        let obj = self.heap_mut().intern(name);
        let line = self.previous.line;
        match self.current_chunk_mut().add_constant(Value::Object(obj)) {
            Some(index) => index,
            None => {
                self.push_error(CompileError::TooManyConstants {
                    line,
                    lexeme: name.to_string(),
                });
                0
            }
        }
    }

    fn emit_return(&mut self) {
        if self.frame().function_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // --- scopes and variables -----------------------------------------------

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let frame = self.frame_mut();
            frame.scope_depth -= 1;
            frame.scope_depth
        };
        loop {
            let captured = match self.frame().locals.last() {
                Some(local) if local.depth > depth => local.captured,
                _ => break,
            };
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.frame_mut().locals.pop();
        }
    }

    /// Pops (at runtime) every local declared deeper than `depth` without
    /// touching the compiler's own locals bookkeeping, because lexically
    /// we're still inside those scopes — used by `break`/`continue`, which
    /// jump out without ending the scope.
    fn emit_pops_down_to(&mut self, depth: i32) {
        let flags: Vec<bool> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .map(|l| l.captured)
            .collect();
        for captured in flags {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.frame().locals.len() >= MAX_LOCALS + 1 {
            let line = self.previous.line;
            self.push_error(CompileError::TooManyLocals {
                line,
                lexeme: name.to_string(),
            });
            return;
        }
        self.frame_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let depth = self.frame().scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            let line = self.previous.line;
            self.push_error(CompileError::DuplicateLocal {
                line,
                lexeme: name.to_string(),
            });
            return;
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let depth = self.frame().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.frame_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme;
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u32) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Result<Option<u8>, ()> {
        for (i, local) in self.frames[frame_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(());
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        if let Some(i) = self.frames[frame_idx]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return i as u8;
        }
        if self.frames[frame_idx].upvalues.len() >= MAX_UPVALUES {
            let line = self.previous.line;
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::TooManyUpvalues { line, lexeme });
            return 0;
        }
        self.frames[frame_idx]
            .upvalues
            .push(Upvalue { index, is_local });
        (self.frames[frame_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let parent_idx = frame_idx - 1;
        match self.resolve_local(parent_idx, name) {
            Ok(Some(local_idx)) => {
                self.frames[parent_idx].locals[local_idx as usize].captured = true;
                Some(self.add_upvalue(frame_idx, local_idx, true))
            }
            Ok(None) => self
                .resolve_upvalue(parent_idx, name)
                .map(|up_idx| self.add_upvalue(frame_idx, up_idx, false)),
            Err(()) => None,
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u32),
        }

        let frame_idx = self.frames.len() - 1;
        let target = match self.resolve_local(frame_idx, name) {
            Ok(Some(i)) => Target::Local(i),
            Ok(None) => {
                if let Some(i) = self.resolve_upvalue(frame_idx, name) {
                    Target::Upvalue(i)
                } else {
                    Target::Global(self.identifier_constant(name))
                }
            }
            Err(()) => {
                let line = self.previous.line;
                self.push_error(CompileError::Syntax {
                    line,
                    lexeme: name.to_string(),
                    message: "can't read local variable in its own initializer.".to_string(),
                });
                Target::Global(0)
            }
        };
        let assign = can_assign && self.matches(TokenKind::Equal);
        if assign {
            self.expression();
        }
        match target {
            Target::Local(i) => {
                self.emit_op(if assign { OpCode::SetLocal } else { OpCode::GetLocal });
                self.emit_byte(i);
            }
            Target::Upvalue(i) => {
                self.emit_op(if assign { OpCode::SetUpvalue } else { OpCode::GetUpvalue });
                self.emit_byte(i);
            }
            Target::Global(i) if assign => {
                self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, i);
            }
            Target::Global(i) => {
                self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, i);
            }
        }
    }

    // --- expressions -----------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        match get_rule(self.previous.kind).prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                let line = self.previous.line;
                let lexeme = self.previous.lexeme.to_string();
                self.push_error(CompileError::Syntax {
                    line,
                    lexeme,
                    message: "Expect expression.".to_string(),
                });
                return;
            }
        }
        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }
        if can_assign && self.matches(TokenKind::Equal) {
            let line = self.previous.line;
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::InvalidAssignmentTarget { line, lexeme });
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap_mut().intern(content);
        self.emit_constant(Value::Object(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() called on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() called on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let rule: ParseRule<'src> = get_rule(kind);
        self.parse_precedence(rule.precedence.next());
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary() called on non-binary token"),
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

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            let line = self.previous.line;
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::ThisOutsideMethod { line, lexeme });
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        let line = self.previous.line;
        let lexeme = self.previous.lexeme.to_string();
        if self.classes.is_empty() {
            self.push_error(CompileError::SuperOutsideClass { line, lexeme });
        } else if !self.classes.last().unwrap().has_superclass {
            self.push_error(CompileError::SuperOutsideClass { line, lexeme });
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_indexed(OpCode::SuperInvoke, OpCode::SuperInvokeLong, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_indexed(OpCode::GetSuper, OpCode::GetSuperLong, name);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    let line = self.previous.line;
                    let lexeme = self.previous.lexeme.to_string();
                    self.push_error(CompileError::Syntax {
                        line,
                        lexeme,
                        message: "can't have more than 255 arguments.".to_string(),
                    });
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, name);
        }
    }

    // --- statements -----------------------------------------------

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

    fn var_declaration(&mut self) {
        loop {
            let global = self.parse_variable("Expect variable name.");
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.define_variable(global);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name_str = self.previous.lexeme;
        let name_obj = self.heap_mut().intern(name_str);
        self.frames.push(FunctionFrame::new(function_type, Some(name_obj)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.frame().arity;
                if arity == 255 {
                    let line = self.current.line;
                    let lexeme = self.current.lexeme.to_string();
                    self.push_error(CompileError::Syntax {
                        line,
                        lexeme,
                        message: "can't have more than 255 parameters.".to_string(),
                    });
                } else {
                    self.frame_mut().arity = arity + 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.emit_return();

        let frame = self.frames.pop().unwrap();
        let upvalue_count = frame.upvalues.len();
        let func = ObjFunction {
            name: frame.name,
            arity: frame.arity,
            upvalue_count,
            chunk: frame.chunk,
        };
        let func_obj = self.heap_mut().alloc_function(func);
        let line = self.previous.line;
        let index = match self.current_chunk_mut().add_constant(Value::Object(func_obj)) {
            Some(i) => i,
            None => {
                self.push_error(CompileError::TooManyConstants {
                    line,
                    lexeme: name_str.to_string(),
                });
                0
            }
        };
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, index);
        for up in &frame.upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCtx { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            if super_name == class_name {
                let line = self.previous.line;
                self.push_error(CompileError::InvalidSuperclass {
                    line,
                    lexeme: super_name.to_string(),
                });
            }
            self.named_variable(super_name, false);
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.pop().unwrap().has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let function_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_indexed(OpCode::Method, OpCode::MethodLong, constant);
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        if self.is_repl && self.frames.len() == 1 {
            self.emit_op(OpCode::Print);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

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
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let scope_depth = self.frame().scope_depth;
        self.frame_mut().loops.push(LoopCtx {
            continue_target: loop_start,
            breaks: Vec::new(),
            scope_depth,
        });
        self.statement();
        let loop_ctx = self.frame_mut().loops.pop().unwrap();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        for break_jump in loop_ctx.breaks {
            self.patch_jump(break_jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.frame().scope_depth;
        self.frame_mut().loops.push(LoopCtx {
            continue_target: loop_start,
            breaks: Vec::new(),
            scope_depth,
        });
        self.statement();
        let loop_ctx = self.frame_mut().loops.pop().unwrap();

        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        for break_jump in loop_ctx.breaks {
            self.patch_jump(break_jump);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        let line = self.previous.line;
        let lexeme = self.previous.lexeme.to_string();
        if self.frame().loops.is_empty() {
            self.push_error(CompileError::BreakOutsideLoop { line, lexeme });
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        }
        let loop_depth = self.frame().loops.last().unwrap().scope_depth;
        self.emit_pops_down_to(loop_depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.frame_mut().loops.last_mut().unwrap().breaks.push(jump);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        let line = self.previous.line;
        let lexeme = self.previous.lexeme.to_string();
        if self.frame().loops.is_empty() {
            self.push_error(CompileError::ContinueOutsideLoop { line, lexeme });
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        }
        let (target, depth) = {
            let ctx = self.frame().loops.last().unwrap();
            (ctx.continue_target, ctx.scope_depth)
        };
        self.emit_pops_down_to(depth);
        self.emit_loop(target);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    fn return_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }
        if self.frame().function_type == FunctionType::Initializer {
            let line = self.previous.line;
            let lexeme = self.previous.lexeme.to_string();
            self.push_error(CompileError::ReturnFromInit { line, lexeme });
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_op(OpCode::Return);
    }
}

/// Compiles `source` to a top-level script function, or collects every
/// static error seen along the way. On error no bytecode is handed back:
/// the caller must not execute a chunk that came from a failed compile.
pub fn compile(source: &str, heap: &mut Heap, is_repl: bool) -> Result<*mut Obj, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap, is_repl);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_return();

    if compiler.had_error {
        return Err(compiler.errors);
    }

    let frame = compiler.frames.pop().unwrap();
    let upvalue_count = frame.upvalues.len();
    let function = ObjFunction {
        name: None,
        arity: 0,
        upvalue_count,
        chunk: frame.chunk,
    };
    Ok(compiler.heap_mut().alloc_function(function))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_expression_statement() {
        let mut heap = Heap::new();
        let result = compile("print 1 + 2 * 3;", &mut heap, false);
        assert!(result.is_ok());
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("break;", &mut heap, false);
        assert!(matches!(
            result,
            Err(errors) if matches!(errors[0], CompileError::BreakOutsideLoop { .. })
        ));
    }

    #[test]
    fn continue_outside_loop_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("continue;", &mut heap, false);
        assert!(matches!(
            result,
            Err(errors) if matches!(errors[0], CompileError::ContinueOutsideLoop { .. })
        ));
    }

    #[test]
    fn too_many_locals_is_a_compile_error() {
        let mut src = String::from("fun f() {\n");
        for i in 0..300 {
            src.push_str(&format!("var a{i} = 0;\n"));
        }
        src.push_str("}\n");
        let mut heap = Heap::new();
        let result = compile(&src, &mut heap, false);
        assert!(result.is_err());
    }

    #[test]
    fn exactly_256_locals_compiles() {
        let mut src = String::from("fun f() {\n");
        for i in 0..256 {
            src.push_str(&format!("var a{i} = 0;\n"));
        }
        src.push_str("}\n");
        let mut heap = Heap::new();
        let result = compile(&src, &mut heap, false);
        assert!(result.is_ok());
    }

    #[test]
    fn this_outside_method_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("print this;", &mut heap, false);
        assert!(matches!(
            result,
            Err(errors) if matches!(errors[0], CompileError::ThisOutsideMethod { .. })
        ));
    }

    #[test]
    fn invalid_assignment_target_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("1 + 2 = 3;", &mut heap, false);
        assert!(result.is_err());
    }
}
