//! Filter predicates over entity attributes.
//!
//! # Responsibility
//! - Parse the textual predicate form (`title == "A" AND priority > 2`).
//! - Evaluate predicates in memory against pending objects.
//! - Compile predicates into parameterized SQL with the same semantics.
//!
//! # Invariants
//! - Nil never matches an ordered comparison, a string operator, or `!=`
//!   against a non-nil literal; `== nil` / `!= nil` test for presence.
//! - Every compiled comparison is two-valued, so `NOT` agrees with memory.
//! - String operators are case-sensitive and only apply to text attributes.

use crate::db::sql::{quote_ident, ID_COLUMN};
use crate::error::{StackError, StackResult};
use crate::model::instance::EntityInstance;
use crate::model::schema::EntityDescription;
use crate::model::value::{AttributeKind, AttributeValue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Key that addresses the object id instead of a declared attribute.
pub const ID_KEY: &str = "id";

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)^(?:(?P<dq>"(?:[^"\\]|\\.)*")|(?P<sq>'(?:[^'\\]|\\.)*')|(?P<number>-?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)|(?P<symbol>==|!=|<>|<=|>=|&&|\|\||[<>=!()])|(?P<word>[A-Za-z_][A-Za-z0-9_]*))"#,
    )
    .expect("valid predicate token regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateError {
    Syntax {
        input: String,
        /// Byte offset of the offending token.
        position: usize,
        message: String,
    },
}

impl Display for PredicateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax {
                input,
                position,
                message,
            } => write!(
                f,
                "invalid predicate `{input}` at offset {position}: {message}"
            ),
        }
    }
}

impl Error for PredicateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    BeginsWith,
    EndsWith,
}

impl ComparisonOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "CONTAINS",
            Self::BeginsWith => "BEGINSWITH",
            Self::EndsWith => "ENDSWITH",
        }
    }

    fn is_string_op(self) -> bool {
        matches!(self, Self::Contains | Self::BeginsWith | Self::EndsWith)
    }
}

/// Boolean filter over one entity's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        key: String,
        op: ComparisonOp,
        value: AttributeValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(key: impl Into<String>, op: ComparisonOp, value: impl Into<AttributeValue>) -> Self {
        Self::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Eq, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Ne, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Lt, value)
    }

    pub fn le(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Le, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Gt, value)
    }

    pub fn ge(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(key, ComparisonOp::Ge, value)
    }

    pub fn contains(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(key, ComparisonOp::Contains, value.into())
    }

    pub fn begins_with(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(key, ComparisonOp::BeginsWith, value.into())
    }

    pub fn ends_with(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(key, ComparisonOp::EndsWith, value.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut terms) => {
                terms.push(other);
                Self::And(terms)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut terms) => {
                terms.push(other);
                Self::Or(terms)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Parses the textual predicate form.
    ///
    /// Keywords (`AND`, `OR`, `NOT`, `CONTAINS`, `BEGINSWITH`, `ENDSWITH`,
    /// `true`, `false`, `nil`) are case-insensitive; `&&`, `||`, `!`, `=`
    /// and `<>` are accepted as aliases.
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(syntax(input, 0, "predicate is empty"));
        }

        let mut parser = Parser {
            input,
            tokens,
            index: 0,
        };
        let predicate = parser.parse_or()?;
        if parser.index < parser.tokens.len() {
            return Err(parser.error("unexpected trailing token"));
        }
        Ok(predicate)
    }

    /// Evaluates against one object snapshot.
    pub fn evaluate(&self, instance: &EntityInstance) -> bool {
        match self {
            Self::Compare { key, op, value } => compare(&key_value(instance, key), *op, value),
            Self::And(terms) => terms.iter().all(|term| term.evaluate(instance)),
            Self::Or(terms) => terms.iter().any(|term| term.evaluate(instance)),
            Self::Not(inner) => !inner.evaluate(instance),
        }
    }

    /// Checks keys and literal types against `entity`.
    ///
    /// # Errors
    /// - `UnknownAttribute` for undeclared keys.
    /// - `TypeMismatch` for literals of the wrong kind, or string operators
    ///   applied to non-text attributes.
    pub fn validate(&self, entity: &EntityDescription) -> StackResult<()> {
        match self {
            Self::Compare { key, op, value } => {
                let kind = key_kind(entity, key)?;
                let mismatch = |expected: AttributeKind, found: &'static str| StackError::TypeMismatch {
                    entity: entity.name.clone(),
                    attribute: key.clone(),
                    expected,
                    found,
                };
                if op.is_string_op() {
                    if kind != AttributeKind::Text {
                        return Err(mismatch(AttributeKind::Text, kind.label()));
                    }
                    if value.as_text().is_none() {
                        return Err(mismatch(AttributeKind::Text, value.type_name()));
                    }
                } else if !kind.accepts(value) {
                    return Err(mismatch(kind, value.type_name()));
                }
                Ok(())
            }
            Self::And(terms) | Self::Or(terms) => {
                terms.iter().try_for_each(|term| term.validate(entity))
            }
            Self::Not(inner) => inner.validate(entity),
        }
    }

    /// Appends a SQL boolean expression; literals go to `params` in order,
    /// bound through anonymous `?` placeholders.
    pub(crate) fn to_sql(&self, params: &mut Vec<AttributeValue>) -> String {
        match self {
            Self::Compare { key, op, value } => compare_sql(key, *op, value, params),
            Self::And(terms) if terms.is_empty() => "1".to_string(),
            Self::Or(terms) if terms.is_empty() => "0".to_string(),
            Self::And(terms) => join_sql(terms, " AND ", params),
            Self::Or(terms) => join_sql(terms, " OR ", params),
            Self::Not(inner) => format!("NOT ({})", inner.to_sql(params)),
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compare { key, op, value } => write!(f, "{key} {} {value}", op.symbol()),
            Self::And(terms) => write_joined(f, terms, " AND "),
            Self::Or(terms) => write_joined(f, terms, " OR "),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut Formatter<'_>, terms: &[Predicate], separator: &str) -> std::fmt::Result {
    for (index, term) in terms.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        match term {
            Predicate::And(_) | Predicate::Or(_) => write!(f, "({term})")?,
            _ => write!(f, "{term}")?,
        }
    }
    Ok(())
}

/// Declared kind of `key`; the id key is text.
pub(crate) fn key_kind(entity: &EntityDescription, key: &str) -> StackResult<AttributeKind> {
    if key == ID_KEY {
        return Ok(AttributeKind::Text);
    }
    entity
        .attribute(key)
        .map(|attribute| attribute.kind)
        .ok_or_else(|| StackError::UnknownAttribute {
            entity: entity.name.clone(),
            attribute: key.to_string(),
        })
}

/// Value of `key` on `instance`; undeclared keys read as nil.
pub(crate) fn key_value<'a>(instance: &'a EntityInstance, key: &str) -> Cow<'a, AttributeValue> {
    if key == ID_KEY {
        return Cow::Owned(AttributeValue::Text(instance.id().to_string()));
    }
    instance
        .get(key)
        .map_or(Cow::Owned(AttributeValue::Null), Cow::Borrowed)
}

/// Column expression for `key`.
pub(crate) fn key_column(key: &str) -> String {
    if key == ID_KEY {
        quote_ident(ID_COLUMN)
    } else {
        quote_ident(key)
    }
}

fn compare(actual: &AttributeValue, op: ComparisonOp, expected: &AttributeValue) -> bool {
    match op {
        ComparisonOp::Eq if expected.is_null() => actual.is_null(),
        ComparisonOp::Ne if expected.is_null() => !actual.is_null(),
        _ if actual.is_null() || expected.is_null() => false,
        ComparisonOp::Eq => actual.sql_cmp(expected) == Ordering::Equal,
        ComparisonOp::Ne => actual.sql_cmp(expected) != Ordering::Equal,
        ComparisonOp::Lt => actual.sql_cmp(expected) == Ordering::Less,
        ComparisonOp::Le => actual.sql_cmp(expected) != Ordering::Greater,
        ComparisonOp::Gt => actual.sql_cmp(expected) == Ordering::Greater,
        ComparisonOp::Ge => actual.sql_cmp(expected) != Ordering::Less,
        ComparisonOp::Contains | ComparisonOp::BeginsWith | ComparisonOp::EndsWith => {
            match (actual.as_text(), expected.as_text()) {
                (Some(actual), Some(needle)) => match op {
                    ComparisonOp::Contains => actual.contains(needle),
                    ComparisonOp::BeginsWith => actual.starts_with(needle),
                    _ => actual.ends_with(needle),
                },
                _ => false,
            }
        }
    }
}

fn compare_sql(
    key: &str,
    op: ComparisonOp,
    value: &AttributeValue,
    params: &mut Vec<AttributeValue>,
) -> String {
    let column = key_column(key);
    match op {
        ComparisonOp::Eq if value.is_null() => format!("{column} IS NULL"),
        ComparisonOp::Ne if value.is_null() => format!("{column} IS NOT NULL"),
        ComparisonOp::Eq => {
            params.push(value.clone());
            format!("{column} IS ?")
        }
        ComparisonOp::Contains | ComparisonOp::BeginsWith | ComparisonOp::EndsWith => {
            let needle = glob_escape(value.as_text().unwrap_or_default());
            let pattern = match op {
                ComparisonOp::Contains => format!("*{needle}*"),
                ComparisonOp::BeginsWith => format!("{needle}*"),
                _ => format!("*{needle}"),
            };
            params.push(AttributeValue::Text(pattern));
            format!("({column} IS NOT NULL AND {column} GLOB ?)")
        }
        _ if value.is_null() => "0".to_string(),
        _ => {
            params.push(value.clone());
            let symbol = match op {
                ComparisonOp::Ne => "<>",
                other => other.symbol(),
            };
            format!("({column} IS NOT NULL AND {column} {symbol} ?)")
        }
    }
}

fn join_sql(terms: &[Predicate], separator: &str, params: &mut Vec<AttributeValue>) -> String {
    let parts: Vec<String> = terms
        .iter()
        .map(|term| format!("({})", term.to_sql(params)))
        .collect();
    parts.join(separator)
}

/// Escapes GLOB metacharacters so `value` matches literally.
pub(crate) fn glob_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("[*]"),
            '?' => escaped.push_str("[?]"),
            '[' => escaped.push_str("[[]"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Integer(i64),
    Real(f64),
    Symbol(&'static str),
    Word(String),
}

fn syntax(input: &str, position: usize, message: impl Into<String>) -> PredicateError {
    PredicateError::Syntax {
        input: input.to_string(),
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, PredicateError> {
    let mut tokens = Vec::new();
    let mut position = 0;

    while position < input.len() {
        let rest = &input[position..];
        let trimmed = rest.trim_start();
        position += rest.len() - trimmed.len();
        if trimmed.is_empty() {
            break;
        }

        let captures = TOKEN_RE
            .captures(trimmed)
            .ok_or_else(|| syntax(input, position, "unexpected character"))?;
        let token = if let Some(quoted) = captures.name("dq").or_else(|| captures.name("sq")) {
            let text = quoted.as_str();
            Token::Text(unescape(&text[1..text.len() - 1]))
        } else if let Some(number) = captures.name("number") {
            let text = number.as_str();
            if text.contains(['.', 'e', 'E']) {
                Token::Real(
                    text.parse()
                        .map_err(|_| syntax(input, position, "invalid real literal"))?,
                )
            } else {
                Token::Integer(
                    text.parse()
                        .map_err(|_| syntax(input, position, "integer literal out of range"))?,
                )
            }
        } else if let Some(symbol) = captures.name("symbol") {
            match symbol.as_str() {
                "==" | "=" => Token::Symbol("=="),
                "!=" | "<>" => Token::Symbol("!="),
                "<=" => Token::Symbol("<="),
                ">=" => Token::Symbol(">="),
                "<" => Token::Symbol("<"),
                ">" => Token::Symbol(">"),
                "(" => Token::Symbol("("),
                ")" => Token::Symbol(")"),
                "&&" => Token::Word("AND".to_string()),
                "||" => Token::Word("OR".to_string()),
                _ => Token::Word("NOT".to_string()),
            }
        } else {
            Token::Word(captures[0].to_string())
        };

        tokens.push((position, token));
        position += captures[0].len();
    }

    Ok(tokens)
}

fn unescape(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            text.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some(other) => text.push(other),
            None => text.push('\\'),
        }
    }
    text
}

const KEYWORDS: &[&str] = &[
    "AND",
    "OR",
    "NOT",
    "CONTAINS",
    "BEGINSWITH",
    "ENDSWITH",
    "TRUE",
    "FALSE",
    "NIL",
    "NULL",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS
        .iter()
        .any(|keyword| keyword.eq_ignore_ascii_case(word))
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(usize, Token)>,
    index: usize,
}

impl Parser<'_> {
    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .map_or(self.input.len(), |(position, _)| *position)
    }

    fn error(&self, message: &str) -> PredicateError {
        syntax(self.input, self.position(), message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|(_, token)| token.clone());
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let matched =
            matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword));
        if matched {
            self.index += 1;
        }
        matched
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let matched = matches!(self.peek(), Some(Token::Symbol(found)) if *found == symbol);
        if matched {
            self.index += 1;
        }
        matched
    }

    fn parse_or(&mut self) -> Result<Predicate, PredicateError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate, PredicateError> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat_keyword("AND") {
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate, PredicateError> {
        if self.eat_keyword("NOT") {
            return Ok(self.parse_unary()?.negate());
        }
        if self.eat_symbol("(") {
            let inner = self.parse_or()?;
            if !self.eat_symbol(")") {
                return Err(self.error("expected `)`"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Predicate, PredicateError> {
        let key = match self.peek() {
            Some(Token::Word(word)) if !is_keyword(word) => word.clone(),
            _ => return Err(self.error("expected attribute name")),
        };
        self.index += 1;

        let op = match self.peek() {
            Some(Token::Symbol("==")) => ComparisonOp::Eq,
            Some(Token::Symbol("!=")) => ComparisonOp::Ne,
            Some(Token::Symbol("<")) => ComparisonOp::Lt,
            Some(Token::Symbol("<=")) => ComparisonOp::Le,
            Some(Token::Symbol(">")) => ComparisonOp::Gt,
            Some(Token::Symbol(">=")) => ComparisonOp::Ge,
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("CONTAINS") => {
                ComparisonOp::Contains
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("BEGINSWITH") => {
                ComparisonOp::BeginsWith
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("ENDSWITH") => {
                ComparisonOp::EndsWith
            }
            _ => return Err(self.error("expected comparison operator")),
        };
        self.index += 1;

        let value = self.parse_literal()?;
        Ok(Predicate::Compare { key, op, value })
    }

    fn parse_literal(&mut self) -> Result<AttributeValue, PredicateError> {
        let position = self.position();
        let value = match self.advance() {
            Some(Token::Text(text)) => AttributeValue::Text(text),
            Some(Token::Integer(number)) => AttributeValue::Integer(number),
            Some(Token::Real(number)) => AttributeValue::Real(number),
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("true") => {
                AttributeValue::Boolean(true)
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("false") => {
                AttributeValue::Boolean(false)
            }
            Some(Token::Word(word))
                if word.eq_ignore_ascii_case("nil") || word.eq_ignore_ascii_case("null") =>
            {
                AttributeValue::Null
            }
            _ => return Err(syntax(self.input, position, "expected literal value")),
        };
        Ok(value)
    }
}
