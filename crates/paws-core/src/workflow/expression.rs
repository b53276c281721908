//! Restricted boolean/comparison expressions for conditions, loop exits and
//! switch values.
//!
//! Grammar (`and` binds tighter than `or`, no parentheses):
//!
//! ```text
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := unary ("and" unary)*
//! unary      := "not" unary | comparison
//! comparison := operand [("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains") operand]
//! operand    := (bare word | quoted string)+
//! ```
//!
//! **Security note:** expressions are tokenized before interpolation, and
//! each operand is resolved on its own. A resolved value can never inject
//! operators into the expression.

use super::context::ExecutionContext;
use super::interpolation::{self, InterpolationError, Reference};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression parsing or evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("malformed expression '{expr}': {reason}")]
    Malformed { expr: String, reason: String },

    #[error("numeric comparison on non-numeric operand '{operand}'")]
    NonNumeric { operand: String },

    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// An operand template. Interpolated at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Or(Vec<Expression>),
    And(Vec<Expression>),
    Not(Box<Expression>),
    Compare {
        left: Operand,
        op: Comparator,
        right: Operand,
    },
    Truthy(Operand),
}

impl Expression {
    /// Parse an expression source string.
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(malformed(src, "empty expression"));
        }
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
        };
        let expr = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(malformed(src, "unexpected trailing tokens"));
        }
        Ok(expr)
    }

    /// Every interpolation reference used by an operand.
    pub fn references(&self) -> Result<Vec<Reference>, ExpressionError> {
        let mut out = Vec::new();
        self.collect_references(&mut out)?;
        Ok(out)
    }

    fn collect_references(&self, out: &mut Vec<Reference>) -> Result<(), ExpressionError> {
        match self {
            Expression::Or(items) | Expression::And(items) => {
                for item in items {
                    item.collect_references(out)?;
                }
            }
            Expression::Not(inner) => inner.collect_references(out)?,
            Expression::Compare { left, right, .. } => {
                out.extend(interpolation::references(&left.0)?);
                out.extend(interpolation::references(&right.0)?);
            }
            Expression::Truthy(operand) => out.extend(interpolation::references(&operand.0)?),
        }
        Ok(())
    }

    /// Evaluate against the context. `and` / `or` short-circuit left to right.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
        match self {
            Expression::Or(items) => {
                for item in items {
                    if item.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expression::And(items) => {
                for item in items {
                    if !item.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expression::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Expression::Truthy(operand) => {
                let value = interpolation::resolve(&operand.0, ctx)?;
                let value = value.trim();
                Ok(!value.is_empty() && !value.eq_ignore_ascii_case("false"))
            }
            Expression::Compare { left, op, right } => {
                let left = interpolation::resolve(&left.0, ctx)?;
                let right = interpolation::resolve(&right.0, ctx)?;
                compare(left.trim(), *op, right.trim())
            }
        }
    }
}

/// Parse and evaluate `expr` in one call.
pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
    Expression::parse(expr)?.evaluate(ctx)
}

fn compare(left: &str, op: Comparator, right: &str) -> Result<bool, ExpressionError> {
    Ok(match op {
        Comparator::Eq => left == right,
        Comparator::Ne => left != right,
        Comparator::Contains => left.contains(right),
        Comparator::Gt | Comparator::Ge | Comparator::Lt | Comparator::Le => {
            let l = parse_number(left)?;
            let r = parse_number(right)?;
            match op {
                Comparator::Gt => l > r,
                Comparator::Ge => l >= r,
                Comparator::Lt => l < r,
                _ => l <= r,
            }
        }
    })
}

fn parse_number(s: &str) -> Result<f64, ExpressionError> {
    s.parse::<f64>()
        .ok()
        .filter(|n| !n.is_nan())
        .ok_or_else(|| ExpressionError::NonNumeric {
            operand: s.to_string(),
        })
}

fn malformed(expr: &str, reason: &str) -> ExpressionError {
    ExpressionError::Malformed {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Cmp(Comparator),
    And,
    Or,
    Not,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let start = i + 1;
            let Some(len) = chars[start..].iter().position(|&ch| ch == c) else {
                return Err(malformed(src, "unterminated quote"));
            };
            tokens.push(Token::Quoted(chars[start..start + len].iter().collect()));
            i = start + len + 1;
            continue;
        }

        if matches!(c, '=' | '!' | '<' | '>') {
            let next = chars.get(i + 1).copied();
            let (op, width) = match (c, next) {
                ('=', Some('=')) => (Comparator::Eq, 2),
                ('!', Some('=')) => (Comparator::Ne, 2),
                ('>', Some('=')) => (Comparator::Ge, 2),
                ('<', Some('=')) => (Comparator::Le, 2),
                ('>', _) => (Comparator::Gt, 1),
                ('<', _) => (Comparator::Lt, 1),
                _ => return Err(malformed(src, &format!("unknown operator at '{c}'"))),
            };
            tokens.push(Token::Cmp(op));
            i += width;
            continue;
        }

        // Bare word. `{{ ... }}` is kept whole even if it contains spaces.
        let mut word = String::new();
        while i < chars.len() {
            let ch = chars[i];
            if ch == '{' && chars.get(i + 1) == Some(&'{') {
                let close = (i + 2..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == '}' && chars[j + 1] == '}');
                let Some(close) = close else {
                    return Err(malformed(src, "unterminated '{{'"));
                };
                word.extend(&chars[i..close + 2]);
                i = close + 2;
                continue;
            }
            if ch.is_whitespace() || matches!(ch, '=' | '!' | '<' | '>' | '"' | '\'') {
                break;
            }
            word.push(ch);
            i += 1;
        }

        tokens.push(match word.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "contains" => Token::Cmp(Comparator::Contains),
            _ => Token::Word(word),
        });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut items = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expression::Or(items)
        })
    }

    fn and_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut items = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expression::And(items)
        })
    }

    fn unary(&mut self) -> Result<Expression, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expression::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expression::Compare { left, op, right });
        }
        Ok(Expression::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand, ExpressionError> {
        let mut parts = Vec::new();
        while let Some(Token::Word(s) | Token::Quoted(s)) = self.peek() {
            parts.push(s.clone());
            self.pos += 1;
        }
        if parts.is_empty() {
            return Err(malformed(self.src, "expected an operand"));
        }
        Ok(Operand(parts.join(" ")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
