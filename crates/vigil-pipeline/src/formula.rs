//! Sandboxed arithmetic expressions for `custom_formula` math stages.
//!
//! The language is deliberately tiny: numeric literals, identifiers bound to
//! numeric result fields, `+ - * /`, unary minus and parentheses. Formulas
//! are parsed once when the pipeline is built and evaluated per cycle.
//!
//! ```text
//! expr   = term   { ("+" | "-") term }
//! term   = unary  { ("*" | "/") unary }
//! unary  = "-" unary | primary
//! primary = number | ident | "(" expr ")"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors from parsing or evaluating a formula.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum FormulaError {
    /// The formula is empty or whitespace.
    #[error("formula is empty")]
    Empty,

    /// A character that is not part of the language.
    #[error("unexpected character `{found}` at offset {offset}")]
    UnexpectedChar {
        /// The offending character.
        found: char,
        /// Byte offset in the source.
        offset: usize,
    },

    /// A malformed numeric literal.
    #[error("invalid number `{0}`")]
    InvalidNumber(String),

    /// A token in a position the grammar does not allow.
    #[error("unexpected {found} at offset {offset}")]
    UnexpectedToken {
        /// Description of the token.
        found: String,
        /// Byte offset in the source.
        offset: usize,
    },

    /// The formula ended in the middle of an expression.
    #[error("unexpected end of formula")]
    UnexpectedEnd,

    /// A field name with no value in the referenced result.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// Division by zero during evaluation.
    #[error("division by zero")]
    DivisionByZero,

    /// Parentheses and unary minus nest deeper than the limit.
    #[error("formula nests deeper than {0} levels")]
    TooDeep(usize),

    /// More tokens than the limit.
    #[error("formula has more than {0} tokens")]
    TooLong(usize),
}

/// Deepest allowed nesting of parentheses and unary minus.
pub const MAX_DEPTH: usize = 64;

/// Longest allowed formula, in tokens. Bounds the depth of operator chains.
pub const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {n}"),
            Self::Ident(name) => write!(f, "identifier `{name}`"),
            Self::Plus => f.write_str("`+`"),
            Self::Minus => f.write_str("`-`"),
            Self::Star => f.write_str("`*`"),
            Self::Slash => f.write_str("`/`"),
            Self::LParen => f.write_str("`(`"),
            Self::RParen => f.write_str("`)`"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = offset;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &source[offset..end];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError::InvalidNumber(text.to_owned()))?;
                tokens.push((offset, Token::Number(value)));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = offset;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Ident(source[offset..end].to_owned())));
                continue;
            }
            found => return Err(FormulaError::UnexpectedChar { found, offset }),
        };
        tokens.push((offset, token));
        chars.next();
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn descend(&mut self) -> Result<(), FormulaError> {
        if self.depth >= MAX_DEPTH {
            return Err(FormulaError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Ident(name))) => Ok(Expr::Field(name)),
            Some((_, Token::LParen)) => {
                self.descend()?;
                let inner = self.expr();
                self.depth -= 1;
                let inner = inner?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((offset, found)) => Err(FormulaError::UnexpectedToken {
                        found: found.to_string(),
                        offset,
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((offset, found)) => Err(FormulaError::UnexpectedToken {
                found: found.to_string(),
                offset,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// A parsed arithmetic formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
}

impl Formula {
    /// Parse a formula.
    ///
    /// # Errors
    ///
    /// Returns a [`FormulaError`] describing the first lexical or
    /// syntactic problem.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(FormulaError::TooLong(MAX_TOKENS));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some((offset, found)) = parser.next() {
            return Err(FormulaError::UnexpectedToken {
                found: found.to_string(),
                offset,
            });
        }
        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    /// The formula text as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names the formula refers to, sorted and de-duplicated.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_fields(&self.root, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Evaluate with the given field values.
    ///
    /// # Errors
    ///
    /// Returns [`FormulaError::UnknownField`] for an unbound identifier and
    /// [`FormulaError::DivisionByZero`] when a divisor evaluates to zero.
    pub fn evaluate(&self, fields: &BTreeMap<&str, f64>) -> Result<f64, FormulaError> {
        eval(&self.root, fields)
    }
}

fn collect_fields<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Field(name) => out.push(name),
        Expr::Neg(inner) => collect_fields(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_fields(lhs, out);
            collect_fields(rhs, out);
        }
    }
}

fn eval(expr: &Expr, fields: &BTreeMap<&str, f64>) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Field(name) => fields
            .get(name.as_str())
            .copied()
            .ok_or_else(|| FormulaError::UnknownField(name.clone())),
        Expr::Neg(inner) => Ok(-eval(inner, fields)?),
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, fields)?;
            let b = eval(rhs, fields)?;
            match op {
                BinaryOp::Add => Ok(a + b),
                BinaryOp::Sub => Ok(a - b),
                BinaryOp::Mul => Ok(a * b),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Err(FormulaError::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                }
            }
        }
    }
}
