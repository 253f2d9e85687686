//! Attribute kinds and values.
//!
//! # Responsibility
//! - Define the closed set of attribute types an entity can declare.
//! - Convert attribute values to and from SQLite storage values.
//! - Provide one ordering shared by SQL sorting and in-memory sorting.
//!
//! # Invariants
//! - Booleans are stored as SQLite integers `0`/`1`.
//! - Ordering follows SQLite's BINARY collation: NULL < numeric < text.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Declared storage type of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Text,
    Integer,
    Real,
    Boolean,
}

impl AttributeKind {
    /// Column type used in generated DDL.
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
        }
    }

    /// Returns whether `value` can be stored in an attribute of this kind.
    ///
    /// `Null` is accepted by every kind; optionality is checked separately.
    pub fn accepts(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (_, AttributeValue::Null)
                | (Self::Text, AttributeValue::Text(_))
                | (Self::Integer, AttributeValue::Integer(_))
                | (Self::Real, AttributeValue::Real(_))
                | (Self::Real, AttributeValue::Integer(_))
                | (Self::Boolean, AttributeValue::Boolean(_))
        )
    }

    /// Coerces an accepted value into this kind's canonical representation.
    pub(crate) fn coerce(self, value: AttributeValue) -> AttributeValue {
        match (self, value) {
            (Self::Real, AttributeValue::Integer(number)) => AttributeValue::Real(number as f64),
            (_, other) => other,
        }
    }
}

impl AttributeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
        }
    }
}

impl Display for AttributeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One attribute value held by an entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
        }
    }

    /// Compares two values the way SQLite orders them with BINARY collation.
    pub fn sql_cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(Numeric::Int(left)), Some(Numeric::Int(right))) => left.cmp(&right),
            (Some(Numeric::Int(left)), Some(Numeric::Real(right))) => int_real_cmp(left, right),
            (Some(Numeric::Real(left)), Some(Numeric::Int(right))) => {
                int_real_cmp(right, left).reverse()
            }
            (Some(Numeric::Real(left)), Some(Numeric::Real(right))) => {
                left.partial_cmp(&right).unwrap_or(Ordering::Equal)
            }
            _ => match (self, other) {
                (Self::Text(left), Self::Text(right)) => left.as_bytes().cmp(right.as_bytes()),
                _ => self.storage_class().cmp(&other.storage_class()),
            },
        }
    }

    /// Decodes one stored column value for an attribute of `kind`.
    pub(crate) fn from_sql(kind: AttributeKind, value: ValueRef<'_>) -> Result<Self, String> {
        match (kind, value) {
            (_, ValueRef::Null) => Ok(Self::Null),
            (AttributeKind::Text, ValueRef::Text(bytes)) => std::str::from_utf8(bytes)
                .map(|text| Self::Text(text.to_string()))
                .map_err(|err| format!("text column is not valid UTF-8: {err}")),
            (AttributeKind::Integer, ValueRef::Integer(number)) => Ok(Self::Integer(number)),
            (AttributeKind::Real, ValueRef::Real(number)) => Ok(Self::Real(number)),
            (AttributeKind::Real, ValueRef::Integer(number)) => Ok(Self::Real(number as f64)),
            (AttributeKind::Boolean, ValueRef::Integer(0)) => Ok(Self::Boolean(false)),
            (AttributeKind::Boolean, ValueRef::Integer(1)) => Ok(Self::Boolean(true)),
            (kind, other) => Err(format!(
                "stored {:?} value does not match declared {kind} attribute",
                other.data_type()
            )),
        }
    }

    fn storage_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) | Self::Integer(_) | Self::Real(_) => 1,
            Self::Text(_) => 2,
        }
    }

    fn numeric(&self) -> Option<Numeric> {
        match self {
            Self::Boolean(value) => Some(Numeric::Int(i64::from(*value))),
            Self::Integer(value) => Some(Numeric::Int(*value)),
            Self::Real(value) => Some(Numeric::Real(*value)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i64),
    Real(f64),
}

/// Exact integer/real comparison; widening to `f64` loses precision past 2^53.
fn int_real_cmp(int: i64, real: f64) -> Ordering {
    // 2^63: first real above every i64.
    const I64_END: f64 = 9_223_372_036_854_775_808.0;
    if real.is_nan() {
        return Ordering::Equal;
    }
    if real >= I64_END {
        return Ordering::Less;
    }
    if real < -I64_END {
        return Ordering::Greater;
    }
    let whole = real.trunc();
    int.cmp(&(whole as i64)).then_with(|| {
        let fraction = real - whole;
        if fraction > 0.0 {
            Ordering::Less
        } else if fraction < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    })
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("nil"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
        }
    }
}

impl ToSql for AttributeValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Boolean(value) => ToSqlOutput::Owned(Value::Integer(i64::from(*value))),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
