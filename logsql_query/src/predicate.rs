//! `WHERE` clauses compiled into a form that can be evaluated per record.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};

use crate::{Error, Result, entity::Entity};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

/// A value referenced by a filter or projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Index into [`QueryPlan::entities`](crate::QueryPlan::entities).
    Entity(usize),
    /// Path into a JSON record, e.g. `["request", "method"]`.
    Field(Vec<String>),
    Literal(Literal),
}

impl Operand {
    pub(crate) fn compile(expr: &Expr, entities: &[Entity]) -> Result<Self> {
        match expr {
            Expr::Identifier(ident) if ident.value.starts_with('$') => entities
                .iter()
                .position(|e| e.name == ident.value)
                .map(Self::Entity)
                .ok_or_else(|| {
                    Error::Parse(format!("entity reference {} must not be quoted", ident.value))
                }),
            Expr::Identifier(ident) => Ok(Self::Field(vec![ident.value.clone()])),
            Expr::CompoundIdentifier(idents) => Ok(Self::Field(
                idents.iter().map(|i| i.value.clone()).collect(),
            )),
            Expr::Value(value) => literal(value).map(Self::Literal),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match Self::compile(expr, entities)? {
                Self::Literal(Literal::Number(n)) => Ok(Self::Literal(Literal::Number(-n))),
                _ => Err(unsupported(expr)),
            },
            Expr::Nested(inner) => Self::compile(inner, entities),
            _ => Err(unsupported(expr)),
        }
    }
}

fn literal(value: &SqlValue) -> Result<Literal> {
    match value {
        SqlValue::Number(n, _) => n
            .parse::<f64>()
            .map(Literal::Number)
            .map_err(|_| Error::Parse(format!("invalid number '{n}'"))),
        SqlValue::SingleQuotedString(s) => Ok(Literal::String(s.clone())),
        SqlValue::Boolean(b) => Ok(Literal::Bool(*b)),
        SqlValue::Null => Ok(Literal::Null),
        other => Err(Error::Parse(format!("unsupported literal '{other}'"))),
    }
}

fn unsupported(expr: &Expr) -> Error {
    Error::Parse(format!("unsupported expression '{expr}'"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn from_sql(op: &BinaryOperator) -> Option<Self> {
        Some(match op {
            BinaryOperator::Eq => Self::Eq,
            BinaryOperator::NotEq => Self::NotEq,
            BinaryOperator::Lt => Self::Lt,
            BinaryOperator::LtEq => Self::LtEq,
            BinaryOperator::Gt => Self::Gt,
            BinaryOperator::GtEq => Self::GtEq,
            _ => return None,
        })
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::LtEq => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::GtEq => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Like {
        operand: Operand,
        pattern: Regex,
        negated: bool,
    },
    InList {
        operand: Operand,
        list: Vec<Operand>,
        negated: bool,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    /// A bare boolean column or literal.
    Truthy(Operand),
}

impl Predicate {
    pub fn compile(expr: &Expr, entities: &[Entity]) -> Result<Self> {
        let operand = |e: &Expr| Operand::compile(e, entities);
        let boxed = |e: &Expr| Self::compile(e, entities).map(Box::new);

        Ok(match expr {
            Expr::Nested(inner) => Self::compile(inner, entities)?,
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => Self::And(boxed(left)?, boxed(right)?),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => Self::Or(boxed(left)?, boxed(right)?),
            Expr::BinaryOp { left, op, right } => Self::Compare {
                left: operand(left)?,
                op: CompareOp::from_sql(op)
                    .ok_or_else(|| Error::Parse(format!("unsupported operator '{op}'")))?,
                right: operand(right)?,
            },
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Self::Not(boxed(expr)?),
            Expr::Like {
                negated,
                expr,
                pattern,
                escape_char,
                ..
            } => Self::Like {
                operand: operand(expr)?,
                pattern: like_pattern(pattern, escape_char.is_some(), false)?,
                negated: *negated,
            },
            Expr::ILike {
                negated,
                expr,
                pattern,
                escape_char,
                ..
            } => Self::Like {
                operand: operand(expr)?,
                pattern: like_pattern(pattern, escape_char.is_some(), true)?,
                negated: *negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Self::InList {
                operand: operand(expr)?,
                list: list.iter().map(operand).collect::<Result<_>>()?,
                negated: *negated,
            },
            Expr::IsNull(expr) => Self::IsNull {
                operand: operand(expr)?,
                negated: false,
            },
            Expr::IsNotNull(expr) => Self::IsNull {
                operand: operand(expr)?,
                negated: true,
            },
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_) => {
                Self::Truthy(operand(expr)?)
            }
            _ => return Err(unsupported(expr)),
        })
    }

    /// Evaluate against one record. `resolve` yields the value of an
    /// operand in that record, [`Datum::Null`] when it is absent.
    pub fn evaluate<'a, F>(&'a self, resolve: &F) -> bool
    where
        F: Fn(&'a Operand) -> Datum<'a>,
    {
        match self {
            Self::And(left, right) => left.evaluate(resolve) && right.evaluate(resolve),
            Self::Or(left, right) => left.evaluate(resolve) || right.evaluate(resolve),
            Self::Not(inner) => !inner.evaluate(resolve),
            Self::Compare { left, op, right } => compare(&resolve(left), &resolve(right))
                .is_some_and(|ordering| op.accepts(ordering)),
            Self::Like {
                operand,
                pattern,
                negated,
            } => resolve(operand)
                .as_text()
                .is_some_and(|text| pattern.is_match(&text) != *negated),
            Self::InList {
                operand,
                list,
                negated,
            } => {
                let value = resolve(operand);
                if value.is_null() {
                    return false;
                }
                let found = list
                    .iter()
                    .any(|item| compare(&value, &resolve(item)) == Some(Ordering::Equal));
                found != *negated
            }
            Self::IsNull { operand, negated } => resolve(operand).is_null() != *negated,
            Self::Truthy(operand) => matches!(resolve(operand), Datum::Bool(true)),
        }
    }
}

/// Translate a `LIKE` pattern into an unanchored regex.
fn like_pattern(pattern: &Expr, has_escape: bool, case_insensitive: bool) -> Result<Regex> {
    if has_escape {
        return Err(Error::Parse("LIKE ... ESCAPE is not supported".to_string()));
    }
    let Expr::Value(SqlValue::SingleQuotedString(pattern)) = pattern else {
        return Err(Error::Parse(format!(
            "LIKE pattern must be a string literal, found '{pattern}'"
        )));
    };

    let mut regex = String::with_capacity(pattern.len() + 8);
    let mut buf = [0; 4];
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            c => regex.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    RegexBuilder::new(&regex)
        .dot_matches_new_line(true)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| Error::Parse(format!("invalid LIKE pattern '{pattern}': {e}")))
}

/// The value of an operand in one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum<'a> {
    Null,
    Bool(bool),
    Number(f64),
    Str(&'a str),
    Json(&'a Value),
}

impl<'a> Datum<'a> {
    pub fn from_json(value: &'a Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Self::Json(value), Self::Number),
            Value::String(s) => Self::Str(s),
            Value::Array(_) | Value::Object(_) => Self::Json(value),
        }
    }

    pub fn from_literal(literal: &'a Literal) -> Self {
        match literal {
            Literal::Null => Self::Null,
            Literal::Bool(b) => Self::Bool(*b),
            Literal::Number(n) => Self::Number(*n),
            Literal::String(s) => Self::Str(s),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text form used by `LIKE` and by text output.
    pub fn as_text(&self) -> Option<std::borrow::Cow<'a, str>> {
        use std::borrow::Cow;
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            Self::Number(n) => Some(Cow::Owned(format_number(*n))),
            Self::Str(s) => Some(Cow::Borrowed(*s)),
            Self::Json(v) => Some(Cow::Owned(v.to_string())),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// SQL style comparison: numeric when both sides read as numbers, lexical
/// otherwise. Comparisons involving a null are unknown.
fn compare(left: &Datum<'_>, right: &Datum<'_>) -> Option<Ordering> {
    use Datum::*;
    match (left, right) {
        (Null, _) | (_, Null) => None,
        (Number(a), Number(b)) => a.partial_cmp(b),
        (Number(a), Str(s)) => match parse_number(s) {
            Some(b) => a.partial_cmp(&b),
            None => Some(format_number(*a).as_str().cmp(*s)),
        },
        (Str(s), Number(b)) => match parse_number(s) {
            Some(a) => a.partial_cmp(b),
            None => Some((*s).cmp(format_number(*b).as_str())),
        },
        (Str(a), Str(b)) => match (parse_number(a), parse_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        (Bool(a), Str(s)) => s.parse::<bool>().ok().map(|b| a.cmp(&b)),
        (Str(s), Bool(b)) => s.parse::<bool>().ok().map(|a| a.cmp(b)),
        (Json(a), Json(b)) => (a == b).then_some(Ordering::Equal),
        _ => None,
    }
}
