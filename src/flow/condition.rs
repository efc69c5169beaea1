//! Step Conditions
//!
//! A small, closed expression language deciding whether a step runs.
//! Conditions are parsed once when a flow definition is loaded and
//! evaluated against the run's Context Store before the step is dispatched.
//!
//! # Grammar
//!
//! ```text
//! expr    := '!' expr | path [ ('==' | '!=') literal ]
//! path    := ident ('.' ident)*
//! literal := "string" | 'string' | number | true | false | null
//! ```
//!
//! The whole expression may be wrapped in `{{ ... }}`.
//!
//! # Example
//!
//! ```
//! use medflow::flow::Condition;
//!
//! let condition = Condition::parse(r#"divergence_check.outcome == "divergent""#).unwrap();
//! assert_eq!(condition.references(), vec!["divergence_check"]);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::ConditionError;
use crate::execution::ContextStore;

/// Dotted path into the Context Store.
///
/// The first segment is a context key; the rest walk JSON object fields
/// (or array indices) of the stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Builds a path from a dotted string such as `divergence_check.outcome`.
    pub fn new(path: &str) -> Self {
        Self {
            segments: path.split('.').map(|s| s.trim().to_string()).collect(),
        }
    }

    /// Context key the path starts from.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Field segments after the root key.
    pub fn fields(&self) -> &[String] {
        &self.segments[1..]
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Path is present and not null.
    Present(KeyPath),
    /// Path equals the literal.
    Equals(KeyPath, Value),
    /// Path is present and differs from the literal.
    NotEquals(KeyPath, Value),
    /// Negation of the inner condition.
    Not(Box<Condition>),
}

impl Condition {
    /// Parses a condition expression.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let mut body = source.trim();
        if let Some(inner) = body.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
            body = inner.trim();
        }
        if body.is_empty() {
            return Err(ConditionError::Empty);
        }

        let tokens = tokenize(body)?;
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.expr()?;

        if let Some((token, offset)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                offset: *offset,
            });
        }

        Ok(condition)
    }

    /// Evaluates the condition against the Context Store.
    ///
    /// Any condition whose path is absent from the store evaluates to
    /// `false`, including under negation.
    pub fn evaluate(&self, context: &ContextStore) -> bool {
        self.eval(context).unwrap_or(false)
    }

    fn eval(&self, context: &ContextStore) -> Option<bool> {
        match self {
            Self::Present(path) => context.lookup(path).map(|v| !v.is_null()),
            Self::Equals(path, literal) => context.lookup(path).map(|v| values_equal(v, literal)),
            Self::NotEquals(path, literal) => {
                context.lookup(path).map(|v| !values_equal(v, literal))
            }
            Self::Not(inner) => inner.eval(context).map(|b| !b),
        }
    }

    /// Context keys (path roots) this condition reads.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Self::Present(path) | Self::Equals(path, _) | Self::NotEquals(path, _) => {
                vec![path.root()]
            }
            Self::Not(inner) => inner.references(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present(path) => write!(f, "{}", path),
            Self::Equals(path, literal) => write!(f, "{} == {}", path, literal),
            Self::NotEquals(path, literal) => write!(f, "{} != {}", path, literal),
            Self::Not(inner) => write!(f, "!{}", inner),
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => left == right,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bang,
    Eq,
    NotEq,
    Dot,
    Ident(String),
    Str(String),
    Number(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Bang => write!(f, "!"),
            Token::Eq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Dot => write!(f, "."),
            Token::Ident(s) | Token::Number(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '!' if matches!(chars.get(i + 1), Some((_, '='))) => {
                tokens.push((Token::NotEq, offset));
                i += 2;
            }
            '!' => {
                tokens.push((Token::Bang, offset));
                i += 1;
            }
            '=' if matches!(chars.get(i + 1), Some((_, '='))) => {
                tokens.push((Token::Eq, offset));
                i += 2;
            }
            '.' => {
                tokens.push((Token::Dot, offset));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    let (_, ch) = chars[i];
                    i += 1;
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(offset));
                }
                tokens.push((Token::Str(value), offset));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                // After a dot the digits are an array index, not a number.
                let index = matches!(tokens.last(), Some((Token::Dot, _)));
                let mut value = String::from(c);
                i += 1;
                while let Some((_, ch)) = chars.get(i) {
                    let numeric = !index && matches!(ch, '.' | 'e' | 'E' | '+' | '-');
                    if ch.is_ascii_digit() || numeric {
                        value.push(*ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Number(value), offset));
            }
            c if is_ident_char(c) => {
                let mut value = String::new();
                while let Some((_, ch)) = chars.get(i) {
                    if is_ident_char(*ch) {
                        value.push(*ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(value), offset));
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    found: other.to_string(),
                    offset,
                });
            }
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[(usize, char)], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|(_, c)| c.is_ascii_digit())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, o)| *o)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expr(&mut self) -> Result<Condition, ConditionError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.expr()?;
            return Ok(Condition::Not(Box::new(inner)));
        }

        let path = self.path()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.pos += 1;
                Ok(Condition::Equals(path, self.literal()?))
            }
            Some(Token::NotEq) => {
                self.pos += 1;
                Ok(Condition::NotEquals(path, self.literal()?))
            }
            _ => Ok(Condition::Present(path)),
        }
    }

    fn path(&mut self) -> Result<KeyPath, ConditionError> {
        let start = self.offset();
        let mut segments = match self.next() {
            Some(Token::Ident(first)) => vec![first],
            _ => return Err(ConditionError::ExpectedPath(start)),
        };

        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            let offset = self.offset();
            match self.next() {
                Some(Token::Ident(segment)) | Some(Token::Number(segment)) => {
                    segments.push(segment)
                }
                _ => return Err(ConditionError::ExpectedPath(offset)),
            }
        }

        Ok(KeyPath { segments })
    }

    fn literal(&mut self) -> Result<Value, ConditionError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Number(n)) => serde_json::from_str::<serde_json::Number>(&n)
                .map(Value::Number)
                .map_err(|_| ConditionError::InvalidLiteral(n)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => Err(ConditionError::InvalidLiteral(word)),
            },
            _ => Err(ConditionError::ExpectedLiteral(offset)),
        }
    }
}
