//! Step conditions — a small boolean expression language evaluated against
//! the execution tree. No code execution: only paths, literals, comparisons
//! and boolean connectives.
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := unary (("and" | "&&") unary)*
//! unary   := ("not" | "!") unary | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=" | "contains") operand)?
//! operand := "(" expr ")" | string | number | true | false | null | path
//! path    := "${" dotted.path[0] "}" | dotted.path[0]
//! ```
//!
//! A path that does not resolve evaluates to `null`. A bare operand is
//! tested for truthiness (`null`, `false`, `0`, `""`, `[]` and `{}` are false).

use serde_json::Value;

use crate::transform::path::{type_name, Path, PathError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Condition parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("Condition type error: {0}")]
    Type(String),

    #[error("Condition path error: {0}")]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Path),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::Parse {
                offset: *offset,
                message: format!("unexpected {:?}", token),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, tree: &Value) -> Result<bool, ConditionError> {
        Ok(truthy(&eval(&self.expr, tree)?))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, tree: &Value) -> Result<bool, ConditionError> {
    Condition::parse(source)?.evaluate(tree)
}

// ─── Lexer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Op(CompareOp),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Path(String),
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |offset: usize, message: &str| ConditionError::Parse {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    (_, true) => CompareOp::Ge,
                    (_, false) => CompareOp::Gt,
                };
                tokens.push((offset, Token::Op(op)));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, ch)) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some((_, '\\')) => {
                            match chars.get(i + 1) {
                                Some((_, 'n')) => text.push('\n'),
                                Some((_, 't')) => text.push('\t'),
                                Some((_, escaped)) => text.push(*escaped),
                                None => return Err(err(offset, "unterminated string")),
                            }
                            i += 2;
                        }
                        Some((_, ch)) => {
                            text.push(*ch);
                            i += 1;
                        }
                        None => return Err(err(offset, "unterminated string")),
                    }
                }
                tokens.push((offset, Token::Str(text)));
            }
            '$' if next == Some('{') => {
                let mut path = String::new();
                i += 2;
                loop {
                    match chars.get(i) {
                        Some((_, '}')) => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            path.push(*ch);
                            i += 1;
                        }
                        None => return Err(err(offset, "unclosed '${'")),
                    }
                }
                tokens.push((offset, Token::Path(path.trim().to_string())));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, ch)| ch.is_ascii_digit() || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(offset, "invalid number"))?;
                tokens.push((offset, Token::Num(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars.get(i).is_some_and(|(_, ch)| {
                    ch.is_alphanumeric() || matches!(ch, '_' | '.' | '[' | ']' | '-')
                }) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                let token = match word.as_str() {
                    "and" | "AND" => Token::And,
                    "or" | "OR" => Token::Or,
                    "not" | "NOT" => Token::Not,
                    "contains" => Token::Op(CompareOp::Contains),
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Path(word),
                };
                tokens.push((offset, token));
            }
            _ => return Err(err(offset, &format!("unexpected character '{}'", c))),
        }
    }

    if tokens.is_empty() {
        return Err(err(0, "empty condition"));
    }
    Ok(tokens)
}

// ─── Parser ───────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::Parse {
                        offset,
                        message: "missing ')'".to_string(),
                    }),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(p)) => Ok(Expr::Path(Path::parse(&p)?)),
            Some(other) => Err(ConditionError::Parse {
                offset,
                message: format!("expected a value, found {:?}", other),
            }),
            None => Err(ConditionError::Parse {
                offset,
                message: "unexpected end of condition".to_string(),
            }),
        }
    }
}

// ─── Evaluation ───────────────────────────────────────────────────────────

fn eval(expr: &Expr, tree: &Value) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => match path.resolve(tree) {
            Ok(v) => Ok(v.clone()),
            Err(PathError::Missing(_)) => Ok(Value::Null),
            Err(e) => Err(e.into()),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, tree)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, tree)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, tree)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, tree)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, tree)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, tree)?;
            let right = eval(r, tree)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    let type_error = || {
        ConditionError::Type(format!(
            "cannot apply '{}' to {} and {}",
            op.as_str(),
            type_name(left),
            type_name(right)
        ))
    };

    match op {
        CompareOp::Eq => Ok(loose_eq(left, right)),
        CompareOp::Ne => Ok(!loose_eq(left, right)),
        CompareOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
            (Value::String(haystack), Value::Number(n)) => Ok(haystack.contains(&n.to_string())),
            (Value::Array(items), needle) => Ok(items.iter().any(|item| loose_eq(item, needle))),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            (Value::Null, _) => Ok(false),
            _ => Err(type_error()),
        },
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b).ok_or_else(type_error)?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(type_error()),
            };
            Ok(match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

/// Equality with numbers compared by value (`1 == 1.0`).
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
