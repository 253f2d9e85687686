//! Fetch requests and sort descriptors.

use crate::error::StackResult;
use crate::model::instance::EntityInstance;
use crate::model::schema::EntityDescription;
use crate::query::predicate::{key_kind, key_value, Predicate};
use std::cmp::Ordering;

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }

    /// Nil sorts first when ascending.
    pub(crate) fn compare(&self, left: &EntityInstance, right: &EntityInstance) -> Ordering {
        let ordering = key_value(left, &self.key).sql_cmp(&key_value(right, &self.key));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

/// What to fetch: entity, optional filter, order and page window.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Parses `filter` with [`Predicate::parse`].
    pub fn filter(self, filter: &str) -> StackResult<Self> {
        Ok(self.with_predicate(Predicate::parse(filter)?))
    }

    pub fn sorted_by(mut self, sort: SortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset > 0
    }

    /// Checks predicate and sort keys against `entity`.
    pub(crate) fn validate(&self, entity: &EntityDescription) -> StackResult<()> {
        if let Some(predicate) = &self.predicate {
            predicate.validate(entity)?;
        }
        for sort in &self.sort {
            key_kind(entity, &sort.key)?;
        }
        Ok(())
    }

    pub(crate) fn matches(&self, instance: &EntityInstance) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate.evaluate(instance))
    }

    /// Orders by the sort keys; `Equal` keeps the caller's order.
    pub(crate) fn compare(&self, left: &EntityInstance, right: &EntityInstance) -> Ordering {
        self.sort
            .iter()
            .map(|sort| sort.compare(left, right))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Applies offset and limit to an already ordered list.
    pub(crate) fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let window = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => window.take(limit).collect(),
            None => window.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchRequest, SortDescriptor};
    use crate::attributes;
    use crate::error::StackError;
    use crate::model::instance::{ContextId, EntityInstance, ObjectId};
    use crate::model::schema::{AttributeDescription, EntityDescription};
    use crate::model::value::AttributeValue;

    fn note(title: impl Into<AttributeValue>, priority: i64) -> EntityInstance {
        let title: AttributeValue = title.into();
        EntityInstance::new(
            ObjectId::new(),
            "Note",
            ContextId::next(),
            attributes! { "title" => title, "priority" => priority },
        )
    }

    #[test]
    fn stable_multi_key_sort_with_nil_first() {
        let request = FetchRequest::new("Note")
            .sorted_by(SortDescriptor::descending("priority"))
            .sorted_by(SortDescriptor::ascending("title"));

        let mut notes = vec![
            note("b", 1),
            note(AttributeValue::Null, 2),
            note("a", 1),
            note("c", 2),
        ];
        notes.sort_by(|left, right| request.compare(left, right));

        let titles: Vec<Option<&str>> = notes.iter().map(|n| n.text("title")).collect();
        assert_eq!(titles, vec![None, Some("c"), Some("a"), Some("b")]);
    }

    #[test]
    fn page_applies_offset_then_limit() {
        let request = FetchRequest::new("Note").offset(1).limit(2);
        assert!(request.is_paged());
        assert_eq!(request.page(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(FetchRequest::new("Note").offset(5).page(vec![1, 2]), Vec::<i32>::new());
    }

    #[test]
    fn validate_rejects_unknown_sort_key() {
        let entity = EntityDescription::new("Note").with_attribute(AttributeDescription::text("title"));
        let request = FetchRequest::new("Note").sorted_by(SortDescriptor::ascending("rank"));
        assert!(matches!(
            request.validate(&entity),
            Err(StackError::UnknownAttribute { .. })
        ));
    }
}
