use crate::builtins::{registry, Arity};
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;

/// Failure to turn expression text into bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (at offset {position})")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Failure while executing compiled bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("'{0}' has no value")]
    Unbound(String),
    #[error("{function}: {message}")]
    Domain {
        function: &'static str,
        message: String,
    },
    #[error("malformed bytecode")]
    Malformed,
}

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the value bound to a symbol slot.
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a % b).
    Rem,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops `argc` values and pushes the result of a registered builtin.
    Call { function: usize, argc: usize },
}

/// A compiled expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Symbol slots read by this expression, in first-use order.
    pub fn references(&self) -> Vec<usize> {
        let mut slots = Vec::new();
        for op in &self.ops {
            if let OpCode::LoadVar(slot) = op {
                if !slots.contains(slot) {
                    slots.push(*slot);
                }
            }
        }
        slots
    }

    pub fn references_slot(&self, slot: usize) -> bool {
        self.ops.iter().any(|op| *op == OpCode::LoadVar(slot))
    }
}

/// Interned identifier names. Slots are stable for the lifetime of the table.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    index: HashMap<String, usize>,
    names: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.index.get(name) {
            return slot;
        }
        let slot = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), slot);
        slot
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, slot: usize) -> &str {
        self.names.get(slot).map(String::as_str).unwrap_or("?")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// An isolated name -> value mapping, addressed by symbol slot.
///
/// Environments are plain vectors so a scratch copy can be seeded from a
/// committed one with `clone_from` without reallocating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    values: Vec<Option<f64>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: usize) -> Option<f64> {
        self.values.get(slot).copied().flatten()
    }

    pub fn set(&mut self, slot: usize, value: f64) {
        if slot >= self.values.len() {
            self.values.resize(slot + 1, None);
        }
        self.values[slot] = Some(value);
    }

    pub fn clear(&mut self, slot: usize) {
        if let Some(value) = self.values.get_mut(slot) {
            *value = None;
        }
    }

    pub fn bound_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// Stack-based virtual machine.
///
/// The VM is stateless; `execute` takes the bytecode, the environment to read
/// symbols from, the random source for sampling builtins and a reusable stack.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        env: &Environment,
        symbols: &SymbolTable,
        rng: &mut dyn RngCore,
        stack: &mut Vec<f64>,
    ) -> Result<f64, EvalError> {
        stack.clear();
        let builtins = registry();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadVar(slot) => {
                    let value = env
                        .get(slot)
                        .ok_or_else(|| EvalError::Unbound(symbols.name(slot).to_string()))?;
                    stack.push(value);
                }
                OpCode::Neg => {
                    let a = stack.pop().ok_or(EvalError::Malformed)?;
                    stack.push(-a);
                }
                OpCode::Call { function, argc } => {
                    if stack.len() < argc {
                        return Err(EvalError::Malformed);
                    }
                    let args_start = stack.len() - argc;
                    let builtin = builtins.get(function).ok_or(EvalError::Malformed)?;
                    let value = (builtin.eval)(&stack[args_start..], rng)?;
                    stack.truncate(args_start);
                    stack.push(value);
                }
                binary => {
                    let b = stack.pop().ok_or(EvalError::Malformed)?;
                    let a = stack.pop().ok_or(EvalError::Malformed)?;
                    let value = match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Rem => a % b,
                        OpCode::Pow => a.powf(b),
                        _ => return Err(EvalError::Malformed),
                    };
                    stack.push(value);
                }
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(value), true) => Ok(value),
            _ => Err(EvalError::Malformed),
        }
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // +, -, *, /, %, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Every identifier the expression reads, excluding function names.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Binary(left, _, right) => {
                left.collect_identifiers(out);
                right.collect_identifiers(out);
            }
            Expr::Unary(_, operand) => operand.collect_identifiers(out),
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_identifiers(out);
                }
            }
        }
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(_) => Err(ParseError::new("unexpected trailing input", parser.offset())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(|ch| ch == 'e' || ch == 'E') {
                    num_str.push(d);
                    chars.next();
                    if let Some(&(_, sign)) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse::<f64>()
                .map_err(|_| ParseError::new(format!("invalid number '{num_str}'"), pos))?;
            tokens.push((Token::Number(value), pos));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((Token::Identifier(ident), pos));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '%' => Token::Percent,
                '^' => Token::Caret,
                ',' => Token::Comma,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(ParseError::new(format!("unexpected character '{other}'"), pos))
                }
            };
            tokens.push((token, pos));
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, p)| *p)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<(), ParseError> {
        let at = self.offset();
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ParseError::new("expected ')'", at)),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                Some(Token::Percent) => '%',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary('-', Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: a^b^c == a^(b^c), and -a^2 == -(a^2).
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let at = self.offset();
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.consume();
                        return Ok(Expr::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_expression()?);
                        if let Some(Token::Comma) = self.peek() {
                            self.consume();
                            continue;
                        }
                        self.expect_rparen()?;
                        break;
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(_) => Err(ParseError::new("unexpected token", at)),
            None => Err(ParseError::new("unexpected end of expression", at)),
        }
    }
}

// --- Evaluator ---

/// Parses, compiles and evaluates expressions against named environments.
///
/// Identifiers are interned into the evaluator's symbol table as they are
/// compiled, so bytecode produced by one evaluator is only meaningful with
/// environments populated through that same evaluator.
#[derive(Debug, Default)]
pub struct Evaluator {
    symbols: SymbolTable,
    stack: Vec<f64>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            stack: Vec::with_capacity(64),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn slot(&mut self, name: &str) -> usize {
        self.symbols.intern(name)
    }

    pub fn compile(&mut self, text: &str) -> Result<Bytecode, ParseError> {
        let expr = parse(text)?;
        let mut ops = Vec::new();
        self.compile_recursive(&expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&mut self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ParseError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => ops.push(OpCode::LoadVar(self.symbols.intern(name))),
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '%' => OpCode::Rem,
                    '^' => OpCode::Pow,
                    other => {
                        return Err(ParseError::new(format!("unknown operator '{other}'"), 0))
                    }
                });
            }
            Expr::Unary(_, operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, args) => {
                let (function, builtin) = registry()
                    .lookup(func)
                    .ok_or_else(|| ParseError::new(format!("unknown function '{func}'"), 0))?;
                let arity_ok = match builtin.arity {
                    Arity::Exact(n) => args.len() == n,
                    Arity::AtLeast(n) => args.len() >= n,
                };
                if !arity_ok {
                    return Err(ParseError::new(
                        format!(
                            "'{func}' expects {} argument(s), got {}",
                            builtin.arity,
                            args.len()
                        ),
                        0,
                    ));
                }
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(OpCode::Call {
                    function,
                    argc: args.len(),
                });
            }
        }
        Ok(())
    }

    pub fn evaluate(
        &mut self,
        code: &Bytecode,
        env: &Environment,
        rng: &mut dyn RngCore,
    ) -> Result<f64, EvalError> {
        VM::execute(code, env, &self.symbols, rng, &mut self.stack)
    }

    pub fn bind(&mut self, env: &mut Environment, name: &str, value: f64) {
        let slot = self.symbols.intern(name);
        env.set(slot, value);
    }

    pub fn unbind(&self, env: &mut Environment, name: &str) {
        if let Some(slot) = self.symbols.lookup(name) {
            env.clear(slot);
        }
    }

    pub fn value_of(&self, env: &Environment, name: &str) -> Option<f64> {
        self.symbols.lookup(name).and_then(|slot| env.get(slot))
    }
}
