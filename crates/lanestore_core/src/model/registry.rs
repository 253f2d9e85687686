//! Entity factory registry.
//!
//! # Responsibility
//! - Map entity names to factories derived from the schema descriptor.
//! - Build and patch attribute maps with defaults, coercion and type checks.
//! - Validate typed `Entity` implementations against the schema up front.
//!
//! # Invariants
//! - Every factory corresponds to exactly one schema entity.
//! - Unknown entity names fail with `UnknownEntityType`, never a lookup panic.
//! - Required-attribute checks happen at commit time, not at creation time.
//! - Real values are finite once built or patched.

use crate::error::{StackError, StackResult};
use crate::model::instance::{Attributes, EntityInstance};
use crate::model::schema::{EntityDescription, SchemaDescriptor};
use crate::model::value::AttributeValue;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Typed view over one schema entity.
///
/// Implementations are checked against the schema by
/// [`EntityRegistry::register`] before first use.
pub trait Entity: Sized + 'static {
    /// Schema entity this type maps to.
    const ENTITY_NAME: &'static str;

    /// Attribute names this type reads and writes.
    fn attribute_names() -> &'static [&'static str];

    fn to_attributes(&self) -> Attributes;

    fn from_instance(instance: &EntityInstance) -> StackResult<Self>;
}

/// Factory for one entity type, built from its schema description.
#[derive(Debug, Clone)]
pub struct EntityFactory {
    description: EntityDescription,
}

impl EntityFactory {
    fn new(description: EntityDescription) -> Self {
        Self { description }
    }

    pub fn description(&self) -> &EntityDescription {
        &self.description
    }

    /// Builds a complete attribute map for a new instance.
    ///
    /// Omitted attributes take their declared default (or nil).
    pub fn build(&self, mut provided: Attributes) -> StackResult<Attributes> {
        let mut attributes = Attributes::new();
        for attribute in &self.description.attributes {
            let value = match provided.remove(&attribute.name) {
                Some(value) => self.checked(&attribute.name, value)?,
                None => attribute.initial_value(),
            };
            attributes.insert(attribute.name.clone(), value);
        }

        if let Some(unknown) = provided.into_keys().next() {
            return Err(self.unknown_attribute(unknown));
        }

        Ok(attributes)
    }

    /// Applies a partial update onto an existing attribute map.
    pub fn patch(&self, target: &mut Attributes, changes: Attributes) -> StackResult<()> {
        let mut checked = Vec::with_capacity(changes.len());
        for (name, value) in changes {
            let value = self.checked(&name, value)?;
            checked.push((name, value));
        }
        target.extend(checked);
        Ok(())
    }

    /// Rejects nil values for required attributes.
    pub fn validate_required(&self, attributes: &Attributes) -> StackResult<()> {
        for attribute in self.description.attributes.iter().filter(|a| !a.optional) {
            let missing = attributes
                .get(&attribute.name)
                .map_or(true, AttributeValue::is_null);
            if missing {
                return Err(StackError::Validation {
                    entity: self.description.name.clone(),
                    attribute: attribute.name.clone(),
                    message: "required attribute is nil".to_string(),
                });
            }
        }
        Ok(())
    }

    fn checked(&self, name: &str, value: AttributeValue) -> StackResult<AttributeValue> {
        let Some(attribute) = self.description.attribute(name) else {
            return Err(self.unknown_attribute(name.to_string()));
        };
        if !attribute.kind.accepts(&value) {
            return Err(StackError::TypeMismatch {
                entity: self.description.name.clone(),
                attribute: name.to_string(),
                expected: attribute.kind,
                found: value.type_name(),
            });
        }
        let value = attribute.kind.coerce(value);
        // SQLite binds NaN as NULL, which would slip past required checks.
        if matches!(value, AttributeValue::Real(number) if !number.is_finite()) {
            return Err(StackError::Validation {
                entity: self.description.name.clone(),
                attribute: name.to_string(),
                message: "real value must be finite".to_string(),
            });
        }
        Ok(value)
    }

    fn unknown_attribute(&self, attribute: String) -> StackError {
        StackError::UnknownAttribute {
            entity: self.description.name.clone(),
            attribute,
        }
    }
}

/// Registry of entity factories for one schema.
#[derive(Debug)]
pub struct EntityRegistry {
    schema: Arc<SchemaDescriptor>,
    factories: BTreeMap<String, EntityFactory>,
    typed: RwLock<BTreeSet<TypeId>>,
}

impl EntityRegistry {
    /// Builds one factory per schema entity.
    pub fn from_schema(schema: Arc<SchemaDescriptor>) -> Self {
        let factories = schema
            .entities
            .iter()
            .map(|entity| (entity.name.clone(), EntityFactory::new(entity.clone())))
            .collect();
        Self {
            schema,
            factories,
            typed: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.factories.contains_key(entity)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Looks up the factory for `entity`.
    pub fn factory(&self, entity: &str) -> StackResult<&EntityFactory> {
        self.factories
            .get(entity)
            .ok_or_else(|| StackError::UnknownEntityType(entity.to_string()))
    }

    pub fn description(&self, entity: &str) -> StackResult<&EntityDescription> {
        self.factory(entity).map(EntityFactory::description)
    }

    /// Validates a typed entity against the schema and records it.
    ///
    /// Idempotent for already registered types.
    pub fn register<T: Entity>(&self) -> StackResult<()> {
        if self.is_registered::<T>() {
            return Ok(());
        }

        let description = self.description(T::ENTITY_NAME)?;
        if let Some(unknown) = T::attribute_names()
            .iter()
            .find(|name| description.attribute(name).is_none())
        {
            return Err(StackError::UnknownAttribute {
                entity: T::ENTITY_NAME.to_string(),
                attribute: (*unknown).to_string(),
            });
        }

        self.typed.write().insert(TypeId::of::<T>());
        Ok(())
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.typed.read().contains(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::{Entity, EntityRegistry};
    use crate::error::{StackError, StackResult};
    use crate::model::instance::{Attributes, EntityInstance};
    use crate::model::schema::{AttributeDescription, EntityDescription, SchemaDescriptor};
    use crate::model::value::{AttributeKind, AttributeValue};
    use std::sync::Arc;

    fn registry() -> EntityRegistry {
        let schema = SchemaDescriptor::new("Tasks", 1).with_entity(
            EntityDescription::new("Task")
                .with_attribute(AttributeDescription::text("title").required())
                .with_attribute(AttributeDescription::real("estimate"))
                .with_attribute(AttributeDescription::boolean("done").with_default(false)),
        );
        EntityRegistry::from_schema(Arc::new(schema))
    }

    struct Task;

    impl Entity for Task {
        const ENTITY_NAME: &'static str = "Task";

        fn attribute_names() -> &'static [&'static str] {
            &["title", "done"]
        }

        fn to_attributes(&self) -> Attributes {
            Attributes::new()
        }

        fn from_instance(_instance: &EntityInstance) -> StackResult<Self> {
            Ok(Self)
        }
    }

    struct Ghost;

    impl Entity for Ghost {
        const ENTITY_NAME: &'static str = "Task";

        fn attribute_names() -> &'static [&'static str] {
            &["haunts"]
        }

        fn to_attributes(&self) -> Attributes {
            Attributes::new()
        }

        fn from_instance(_instance: &EntityInstance) -> StackResult<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn build_applies_defaults_and_coerces() {
        let registry = registry();
        let factory = registry.factory("Task").unwrap();

        let built = factory
            .build(crate::attributes! { "title" => "write docs", "estimate" => 2 })
            .unwrap();

        assert_eq!(built["estimate"], AttributeValue::Real(2.0));
        assert_eq!(built["done"], AttributeValue::Boolean(false));
    }

    #[test]
    fn build_rejects_unknown_and_mistyped_attributes() {
        let registry = registry();
        let factory = registry.factory("Task").unwrap();

        let unknown = factory
            .build(crate::attributes! { "colour" => "red" })
            .unwrap_err();
        assert!(matches!(unknown, StackError::UnknownAttribute { .. }));

        let mistyped = factory
            .build(crate::attributes! { "done" => "yes" })
            .unwrap_err();
        assert!(matches!(
            mistyped,
            StackError::TypeMismatch {
                expected: AttributeKind::Boolean,
                ..
            }
        ));
    }

    #[test]
    fn non_finite_reals_are_rejected() {
        let registry = registry();
        let factory = registry.factory("Task").unwrap();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = factory
                .build(crate::attributes! { "title" => "t", "estimate" => bad })
                .unwrap_err();
            assert!(matches!(err, StackError::Validation { attribute, .. } if attribute == "estimate"));
        }

        let mut built = factory.build(crate::attributes! { "title" => "t" }).unwrap();
        assert!(factory
            .patch(&mut built, crate::attributes! { "estimate" => f64::NAN })
            .is_err());
        assert_eq!(built["estimate"], AttributeValue::Null);
    }

    #[test]
    fn unknown_entity_is_typed_error() {
        let err = registry().factory("Nope").unwrap_err();
        assert!(matches!(err, StackError::UnknownEntityType(name) if name == "Nope"));
    }

    #[test]
    fn required_attributes_are_checked_separately() {
        let registry = registry();
        let factory = registry.factory("Task").unwrap();
        let built = factory.build(Attributes::new()).unwrap();

        let err = factory.validate_required(&built).unwrap_err();
        assert!(matches!(err, StackError::Validation { attribute, .. } if attribute == "title"));
    }

    #[test]
    fn typed_registration_validates_attribute_names() {
        let registry = self::registry();
        registry.register::<Task>().unwrap();
        assert!(registry.is_registered::<Task>());

        let err = registry.register::<Ghost>().unwrap_err();
        assert!(matches!(err, StackError::UnknownAttribute { attribute, .. } if attribute == "haunts"));
    }
}
