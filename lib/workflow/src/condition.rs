//! Edge condition expressions.
//!
//! Conditions are evaluated against a JSON view of the run context:
//!
//! ```json
//! { "input": <run input>, "nodes": { "<node key>": <node output> } }
//! ```
//!
//! Supported syntax:
//! - dotted paths (`input.customer.tier`, `nodes.fetch.items.0`)
//! - literals: `'single'` or `"double"` quoted strings, numbers, `true`, `false`, `null`
//! - comparisons: `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`
//! - postfix `exists` (present and not null)
//! - `!`, `&&`, `||` and parentheses
//!
//! Keywords such as `contains` are plain segments after a `.`. Nesting and
//! expression length are bounded.
//!
//! A bare path is tested for truthiness. Missing paths resolve to `null`, so
//! evaluation never fails once an expression has parsed.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// Longest accepted expression, in bytes.
pub const MAX_CONDITION_LEN: usize = 1024;

/// Deepest accepted nesting of parentheses and `!`.
const MAX_DEPTH: usize = 64;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a condition expression.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first syntax problem found.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        if source.len() > MAX_CONDITION_LEN {
            return Err(ConditionError::new(
                MAX_CONDITION_LEN,
                format!("expression longer than {MAX_CONDITION_LEN} bytes"),
            ));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ConditionError::new(
                token.offset,
                format!("unexpected {}", token.kind),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Returns the original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the condition against a context view.
    #[must_use]
    pub fn evaluate(&self, view: &JsonValue) -> bool {
        truthy(&eval(&self.expr, view))
    }
}

/// A syntax error in a condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionError {
    /// Byte offset of the problem.
    pub offset: usize,
    /// What went wrong.
    pub message: String,
}

impl ConditionError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for ConditionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path(Vec<String>),
    Exists(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "identifier '{name}'"),
            Self::Number(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string '{s}'"),
            Self::Dot => f.write_str("'.'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::Not => f.write_str("'!'"),
            Self::And => f.write_str("'&&'"),
            Self::Or => f.write_str("'||'"),
            Self::Op(op) => write!(f, "operator {op:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let bytes: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let (offset, c) = bytes[i];
        let next = bytes.get(i + 1).map(|(_, c)| *c);
        let mut push = |kind: TokenKind, width: usize, i: &mut usize| {
            tokens.push(Token { kind, offset });
            *i += width;
        };

        match c {
            c if c.is_whitespace() => i += 1,
            '.' => push(TokenKind::Dot, 1, &mut i),
            '(' => push(TokenKind::LParen, 1, &mut i),
            ')' => push(TokenKind::RParen, 1, &mut i),
            '&' if next == Some('&') => push(TokenKind::And, 2, &mut i),
            '|' if next == Some('|') => push(TokenKind::Or, 2, &mut i),
            '=' if next == Some('=') => push(TokenKind::Op(CompareOp::Eq), 2, &mut i),
            '!' if next == Some('=') => push(TokenKind::Op(CompareOp::Ne), 2, &mut i),
            '!' => push(TokenKind::Not, 1, &mut i),
            '>' if next == Some('=') => push(TokenKind::Op(CompareOp::Ge), 2, &mut i),
            '>' => push(TokenKind::Op(CompareOp::Gt), 1, &mut i),
            '<' if next == Some('=') => push(TokenKind::Op(CompareOp::Le), 2, &mut i),
            '<' => push(TokenKind::Op(CompareOp::Lt), 1, &mut i),
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < bytes.len() {
                    let (_, ch) = bytes[j];
                    if ch == '\\' {
                        if let Some((_, escaped)) = bytes.get(j + 1) {
                            value.push(*escaped);
                            j += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(ConditionError::new(offset, "unterminated string"));
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    offset,
                });
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < bytes.len() {
                    let ch = bytes[j].1;
                    let fraction = ch == '.'
                        && bytes.get(j + 1).is_some_and(|(_, n)| n.is_ascii_digit())
                        && !tokens.last().is_some_and(|t| t.kind == TokenKind::Dot);
                    if ch.is_ascii_digit() || fraction {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = bytes.get(j).map_or(source.len(), |(o, _)| *o);
                let text = &source[offset..end];
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::new(offset, format!("invalid number '{text}'")))?;
                tokens.push(Token {
                    kind: TokenKind::Number(number),
                    offset,
                });
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j].1.is_ascii_alphanumeric() || bytes[j].1 == '_')
                {
                    j += 1;
                }
                let end = bytes.get(j).map_or(source.len(), |(o, _)| *o);
                let word = &source[offset..end];
                let kind = if word == "contains" {
                    TokenKind::Op(CompareOp::Contains)
                } else {
                    TokenKind::Ident(word.to_string())
                };
                tokens.push(Token { kind, offset });
                i = j;
            }
            other => {
                return Err(ConditionError::new(
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    if tokens.is_empty() {
        return Err(ConditionError::new(0, "empty expression"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map_or(0, |t| t.offset + 1)
    }

    fn descend(&mut self, offset: usize) -> Result<(), ConditionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ConditionError::new(offset, "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek_kind() == Some(&TokenKind::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek_kind() == Some(&TokenKind::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek_kind() == Some(&TokenKind::Not) {
            let offset = self.peek().map_or(0, |t| t.offset);
            self.advance();
            self.descend(offset)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.parse_operand()?;

        if let Some(TokenKind::Ident(word)) = self.peek_kind()
            && word == "exists"
        {
            let offset = self.peek().map_or(0, |t| t.offset);
            self.advance();
            return match lhs {
                Expr::Path(path) => Ok(Expr::Exists(path)),
                _ => Err(ConditionError::new(offset, "'exists' requires a path")),
            };
        }

        if let Some(TokenKind::Op(op)) = self.peek_kind() {
            let op = *op;
            self.advance();
            let rhs = self.parse_operand()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }

        Ok(lhs)
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        let end = self.end_offset();
        let token = self
            .advance()
            .ok_or_else(|| ConditionError::new(end, "unexpected end of expression"))?;

        match token.kind {
            TokenKind::LParen => {
                self.descend(token.offset)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(ConditionError::new(
                        other.offset,
                        format!("expected ')', found {}", other.kind),
                    )),
                    None => Err(ConditionError::new(end, "missing ')'")),
                }
            }
            TokenKind::Str(value) => Ok(Expr::Literal(JsonValue::String(value))),
            TokenKind::Number(n) => Ok(Expr::Literal(number_value(n))),
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(JsonValue::Bool(true))),
                "false" => Ok(Expr::Literal(JsonValue::Bool(false))),
                "null" => Ok(Expr::Literal(JsonValue::Null)),
                "exists" => Err(ConditionError::new(token.offset, "'exists' requires a path")),
                _ => self.parse_path(word),
            },
            other => Err(ConditionError::new(
                token.offset,
                format!("unexpected {other}"),
            )),
        }
    }

    fn parse_path(&mut self, head: String) -> Result<Expr, ConditionError> {
        let mut segments = vec![head];
        while self.peek_kind() == Some(&TokenKind::Dot) {
            self.advance();
            let end = self.end_offset();
            let token = self
                .advance()
                .ok_or_else(|| ConditionError::new(end, "expected path segment"))?;
            match token.kind {
                TokenKind::Ident(name) => segments.push(name),
                TokenKind::Op(CompareOp::Contains) => segments.push("contains".to_string()),
                TokenKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => {
                    segments.push(format!("{}", n as u64));
                }
                other => {
                    return Err(ConditionError::new(
                        token.offset,
                        format!("expected path segment, found {other}"),
                    ));
                }
            }
        }
        Ok(Expr::Path(segments))
    }
}

fn number_value(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
    }
}

fn resolve<'a>(view: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    path.iter().try_fold(view, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn eval(expr: &Expr, view: &JsonValue) -> JsonValue {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(path) => resolve(view, path).cloned().unwrap_or(JsonValue::Null),
        Expr::Exists(path) => {
            JsonValue::Bool(resolve(view, path).is_some_and(|v| !v.is_null()))
        }
        Expr::Not(inner) => JsonValue::Bool(!truthy(&eval(inner, view))),
        Expr::And(lhs, rhs) => {
            JsonValue::Bool(truthy(&eval(lhs, view)) && truthy(&eval(rhs, view)))
        }
        Expr::Or(lhs, rhs) => {
            JsonValue::Bool(truthy(&eval(lhs, view)) || truthy(&eval(rhs, view)))
        }
        Expr::Compare(op, lhs, rhs) => {
            JsonValue::Bool(compare(*op, &eval(lhs, view), &eval(rhs, view)))
        }
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn loosely_equal(lhs: &JsonValue, rhs: &JsonValue) -> bool {
    match (lhs, rhs) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn ordering(lhs: &JsonValue, rhs: &JsonValue) -> Option<Ordering> {
    match (lhs, rhs) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(op: CompareOp, lhs: &JsonValue, rhs: &JsonValue) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(lhs, rhs),
        CompareOp::Ne => !loosely_equal(lhs, rhs),
        CompareOp::Gt => ordering(lhs, rhs) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering(lhs, rhs) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match (lhs, rhs) {
            (JsonValue::String(haystack), JsonValue::String(needle)) => haystack.contains(needle),
            (JsonValue::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
            (JsonValue::Object(map), JsonValue::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}
