//! Explicit mapping models between two schema versions.
//!
//! A mapping model covers what an inferred migration cannot guess: renamed
//! entities, renamed attributes and values for attributes that become
//! required.

use crate::model::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MAPPING_FILE_SUFFIX: &str = "mapping.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingModel {
    pub source_version: u32,
    pub destination_version: u32,
    /// Source entity name -> destination entity name.
    #[serde(default)]
    pub entity_renames: BTreeMap<String, String>,
    /// Destination entity -> (source attribute -> destination attribute).
    #[serde(default)]
    pub attribute_renames: BTreeMap<String, BTreeMap<String, String>>,
    /// Destination entity -> attribute -> value written into nil cells.
    #[serde(default)]
    pub fill_values: BTreeMap<String, BTreeMap<String, AttributeValue>>,
}

impl MappingModel {
    pub fn new(source_version: u32, destination_version: u32) -> Self {
        Self {
            source_version,
            destination_version,
            entity_renames: BTreeMap::new(),
            attribute_renames: BTreeMap::new(),
            fill_values: BTreeMap::new(),
        }
    }

    pub fn rename_entity(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.entity_renames.insert(from.into(), to.into());
        self
    }

    /// Renames `from` to `to` inside destination entity `entity`.
    pub fn rename_attribute(
        mut self,
        entity: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.attribute_renames
            .entry(entity.into())
            .or_default()
            .insert(from.into(), to.into());
        self
    }

    pub fn fill(
        mut self,
        entity: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.fill_values
            .entry(entity.into())
            .or_default()
            .insert(attribute.into(), value.into());
        self
    }

    pub fn covers(&self, source_version: u32, destination_version: u32) -> bool {
        self.source_version == source_version && self.destination_version == destination_version
    }

    /// Source entity name for destination entity `entity`.
    pub(crate) fn source_entity<'a>(&'a self, entity: &'a str) -> &'a str {
        self.entity_renames
            .iter()
            .find(|(_, to)| to.as_str() == entity)
            .map_or(entity, |(from, _)| from.as_str())
    }

    /// Source attribute name for `attribute` of destination entity `entity`.
    pub(crate) fn source_attribute<'a>(&'a self, entity: &str, attribute: &'a str) -> &'a str {
        self.attribute_renames
            .get(entity)
            .and_then(|renames| renames.iter().find(|(_, to)| to.as_str() == attribute))
            .map_or(attribute, |(from, _)| from.as_str())
    }

    pub(crate) fn fill_value(&self, entity: &str, attribute: &str) -> Option<&AttributeValue> {
        self.fill_values.get(entity)?.get(attribute)
    }

    /// File name used when discovering mapping models next to a model file.
    pub fn file_name(model_name: &str, source_version: u32, destination_version: u32) -> String {
        format!("{model_name}.v{source_version}-v{destination_version}.{MAPPING_FILE_SUFFIX}")
    }

    /// Loads a mapping model from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read mapping model `{}`: {err}", path.display()))?;
        serde_json::from_str(&json)
            .map_err(|err| format!("invalid mapping model `{}`: {err}", path.display()))
    }

    /// Looks for `<model_name>.v<from>-v<to>.mapping.json` inside `dir`.
    pub(crate) fn discover(
        dir: &Path,
        model_name: &str,
        source_version: u32,
        destination_version: u32,
    ) -> Result<Option<Self>, String> {
        let path: PathBuf = dir.join(Self::file_name(
            model_name,
            source_version,
            destination_version,
        ));
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::MappingModel;
    use crate::model::value::AttributeValue;

    #[test]
    fn reverse_lookups_follow_renames() {
        let mapping = MappingModel::new(1, 2)
            .rename_entity("Memo", "Note")
            .rename_attribute("Note", "heading", "title");

        assert_eq!(mapping.source_entity("Note"), "Memo");
        assert_eq!(mapping.source_entity("Tag"), "Tag");
        assert_eq!(mapping.source_attribute("Note", "title"), "heading");
        assert_eq!(mapping.source_attribute("Note", "body"), "body");
    }

    #[test]
    fn discover_reads_versioned_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = MappingModel::new(1, 2).fill("Note", "title", "untitled");
        std::fs::write(
            dir.path().join("Notes.v1-v2.mapping.json"),
            serde_json::to_string(&mapping).unwrap(),
        )
        .unwrap();

        let found = MappingModel::discover(dir.path(), "Notes", 1, 2)
            .unwrap()
            .unwrap();
        assert_eq!(
            found.fill_value("Note", "title"),
            Some(&AttributeValue::from("untitled"))
        );
        assert!(MappingModel::discover(dir.path(), "Notes", 2, 3)
            .unwrap()
            .is_none());
    }
}
