//! Entity instances and their identities.
//!
//! # Invariants
//! - An `ObjectId` is generated once and never reused for another record.
//! - An `EntityInstance` belongs to exactly one context (`ContextId`).
//! - Instances handed to callers are snapshots; later merges never mutate them.

use crate::model::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Attribute name to value mapping.
pub type Attributes = BTreeMap<String, AttributeValue>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier of one persisted (or pending) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses the canonical hyphenated form stored in `_id` columns.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Snapshot of one typed, attributed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityInstance {
    id: ObjectId,
    entity: String,
    context: ContextId,
    attributes: Attributes,
}

impl EntityInstance {
    pub(crate) fn new(
        id: ObjectId,
        entity: impl Into<String>,
        context: ContextId,
        attributes: Attributes,
    ) -> Self {
        Self {
            id,
            entity: entity.into(),
            context,
            attributes,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Context this snapshot was produced by.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Returns one attribute, or `None` when the entity does not declare it.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_text)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttributeValue::as_integer)
    }

    pub fn real(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttributeValue::as_real)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AttributeValue::as_bool)
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Re-labels this snapshot as owned by another context.
    pub(crate) fn rehome(mut self, context: ContextId) -> Self {
        self.context = context;
        self
    }
}

/// Builds an [`Attributes`] map from `name => value` pairs.
///
/// ```
/// use lanestore_core::attributes;
/// let attrs = attributes! { "title" => "A", "priority" => 3 };
/// assert_eq!(attrs.len(), 2);
/// ```
#[macro_export]
macro_rules! attributes {
    () => {
        $crate::Attributes::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Attributes::new();
        $(map.insert(::std::string::String::from($name), $crate::AttributeValue::from($value));)+
        map
    }};
}
