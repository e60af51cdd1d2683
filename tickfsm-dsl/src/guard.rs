//! Guard expressions over a JSON context.
//!
//! A guard is a boolean expression that reads fields of the instance
//! context. The language supports:
//!
//! - `ctx.field` - truthiness of a field (`ctx.a.b` walks nested objects)
//! - `ctx.field == value` / `ctx.field != value` - strings, numbers, booleans, null
//! - `ctx.field > n`, `>=`, `<`, `<=` - numeric comparison
//! - `!expr`, `expr && expr`, `expr || expr` - `&&` binds tighter than `||`
//! - `(expr)` - grouping
//!
//! Missing fields read as `null`. Numeric comparisons against a non-number
//! are false.
//!
//! ```
//! use tickfsm_dsl::Guard;
//! use serde_json::json;
//!
//! let guard: Guard = "ctx.voltage > 240 && !ctx.fused".parse().unwrap();
//! assert!(guard.evaluate(&json!({"voltage": 250})));
//! assert!(!guard.evaluate(&json!({"voltage": 250, "fused": true})));
//! ```

use crate::error::DslError;
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

const FIELD_PREFIX: &str = "ctx.";

static NULL: Value = Value::Null;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }

    fn is_ordering(&self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/// Parsed guard syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Field is truthy.
    Field(String),
    /// Field compared against a literal.
    Compare {
        field: String,
        op: CmpOp,
        value: Value,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn evaluate(&self, ctx: &Value) -> bool {
        match self {
            Expr::Field(field) => truthy(lookup(ctx, field)),
            Expr::Compare { field, op, value } => compare(lookup(ctx, field), *op, value),
            Expr::Not(inner) => !inner.evaluate(ctx),
            Expr::And(left, right) => left.evaluate(ctx) && right.evaluate(ctx),
            Expr::Or(left, right) => left.evaluate(ctx) || right.evaluate(ctx),
        }
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field(field) | Expr::Compare { field, .. } => out.push(field),
            Expr::Not(inner) => inner.collect_fields(out),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
        }
    }
}

/// A guard expression together with its source text.
#[derive(Debug, Clone)]
pub struct Guard {
    source: String,
    expr: Expr,
}

impl Guard {
    pub fn parse(source: &str) -> Result<Self, DslError> {
        let tokens = Lexer::new(source).tokenize()?;
        let expr = Parser::new(source, tokens).parse()?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, ctx: &Value) -> bool {
        self.expr.evaluate(ctx)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Context fields the guard reads, in source order, without the `ctx.` prefix.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.expr.collect_fields(&mut fields);
        fields
    }
}

impl FromStr for Guard {
    type Err = DslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Guard::parse(s)
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn lookup<'a>(ctx: &'a Value, field: &str) -> &'a Value {
    field
        .split('.')
        .try_fold(ctx, |value, key| value.as_object()?.get(key))
        .unwrap_or(&NULL)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(actual: &Value, op: CmpOp, expected: &Value) -> bool {
    match op {
        CmpOp::Eq => same(actual, expected),
        CmpOp::Ne => !same(actual, expected),
        _ => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Lt => a < b,
                _ => a <= b,
            },
            _ => false,
        },
    }
}

fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

// =========================================================================
// Lexer
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Literal(Value),
    Op(CmpOp),
    Not,
    And,
    Or,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Field(f) => format!("field 'ctx.{}'", f),
            Token::Literal(v) => format!("literal {}", v),
            Token::Op(op) => format!("'{}'", op.as_str()),
            Token::Not => "'!'".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Open => "'('".to_string(),
            Token::Close => "')'".to_string(),
        }
    }
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn error(&self, offset: usize, reason: impl Into<String>) -> DslError {
        DslError::InvalidGuard {
            expr: self.source.to_string(),
            offset,
            reason: reason.into(),
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().map(|&(_, c)| c) == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, DslError> {
        let mut tokens = Vec::new();
        while let Some(&(offset, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            let token = match c {
                '(' => {
                    self.chars.next();
                    Token::Open
                }
                ')' => {
                    self.chars.next();
                    Token::Close
                }
                '!' => {
                    self.chars.next();
                    if self.eat('=') {
                        Token::Op(CmpOp::Ne)
                    } else {
                        Token::Not
                    }
                }
                '=' => {
                    self.chars.next();
                    if !self.eat('=') {
                        return Err(self.error(offset, "expected '==', found '='"));
                    }
                    Token::Op(CmpOp::Eq)
                }
                '>' | '<' => {
                    self.chars.next();
                    let or_equal = self.eat('=');
                    Token::Op(match (c, or_equal) {
                        ('>', false) => CmpOp::Gt,
                        ('>', true) => CmpOp::Ge,
                        ('<', false) => CmpOp::Lt,
                        _ => CmpOp::Le,
                    })
                }
                '&' | '|' => {
                    self.chars.next();
                    if !self.eat(c) {
                        return Err(self.error(offset, format!("expected '{}{}'", c, c)));
                    }
                    if c == '&' {
                        Token::And
                    } else {
                        Token::Or
                    }
                }
                '"' => Token::Literal(Value::String(self.string(offset)?)),
                '-' | '0'..='9' => Token::Literal(self.number(offset)?),
                c if c.is_alphabetic() || c == '_' => self.word(offset)?,
                other => return Err(self.error(offset, format!("unexpected character '{}'", other))),
            };
            tokens.push((offset, token));
        }
        Ok(tokens)
    }

    fn take_while(&mut self, start: usize, keep: impl Fn(char) -> bool) -> &'a str {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if !keep(c) {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        &self.source[start..end]
    }

    fn word(&mut self, start: usize) -> Result<Token, DslError> {
        let word = self.take_while(start, |c| c.is_alphanumeric() || c == '_' || c == '.');
        match word {
            "true" => Ok(Token::Literal(Value::Bool(true))),
            "false" => Ok(Token::Literal(Value::Bool(false))),
            "null" => Ok(Token::Literal(Value::Null)),
            _ => {
                let Some(path) = word.strip_prefix(FIELD_PREFIX) else {
                    return Err(self.error(start, format!("field '{}' must start with 'ctx.'", word)));
                };
                if path.split('.').any(str::is_empty) {
                    return Err(self.error(start, format!("malformed field path '{}'", word)));
                }
                Ok(Token::Field(path.to_string()))
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Value, DslError> {
        // Sign or first digit, always one byte
        self.chars.next();
        let rest = self.take_while(start + 1, |c| c.is_ascii_digit() || c == '.');
        let literal = &self.source[start..start + 1 + rest.len()];
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.error(start, format!("invalid number '{}'", literal)))
    }

    fn string(&mut self, start: usize) -> Result<String, DslError> {
        self.chars.next();
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(self.error(start, "unterminated string"))
    }
}

// =========================================================================
// Parser
// =========================================================================

/// Recursive descent over tokens:
///
/// ```text
/// or      := and ("||" and)*
/// and     := unary ("&&" unary)*
/// unary   := "!" unary | primary
/// primary := "(" or ")" | FIELD (OP LITERAL)?
/// ```
struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<(usize, Token)>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, DslError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty guard expression"));
        }
        let expr = self.or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(self.error(format!("unexpected {}", token.describe()))),
        }
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn error(&self, reason: impl Into<String>) -> DslError {
        DslError::InvalidGuard {
            expr: self.source.to_string(),
            offset: self.offset(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, DslError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, DslError> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, DslError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, DslError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Open) => {
                let inner = self.or()?;
                if !self.eat(&Token::Close) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(Token::Field(field)) => {
                let Some(Token::Op(op)) = self.peek().cloned() else {
                    return Ok(Expr::Field(field));
                };
                self.pos += 1;
                let value = match self.next() {
                    Some(Token::Literal(value)) => value,
                    _ => return Err(self.error(format!("expected a value after '{}'", op.as_str()))),
                };
                if op.is_ordering() && !value.is_number() {
                    return Err(self.error(format!("'{}' needs a number, got {}", op.as_str(), value)));
                }
                Ok(Expr::Compare { field, op, value })
            }
            Some(token) => Err(DslError::InvalidGuard {
                expr: self.source.to_string(),
                offset,
                reason: format!("unexpected {}", token.describe()),
            }),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
