//! Schema descriptor: entity and attribute definitions.
//!
//! # Responsibility
//! - Describe every entity type the store can hold.
//! - Load descriptors from JSON model files or bundle directories.
//! - Reject malformed descriptors before any store is opened.
//!
//! # Invariants
//! - A loaded descriptor is immutable and shared read-only via `Arc`.
//! - Entity and attribute names are plain identifiers; `id` is reserved.
//! - Defaults always match their attribute kind.

use crate::model::value::{AttributeKind, AttributeValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const MODEL_FILE_EXTENSION: &str = "json";
const RESERVED_ATTRIBUTE: &str = "id";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Schema loading and validation errors.
#[derive(Debug)]
pub enum SchemaError {
    /// Model file does not exist.
    NotFound(PathBuf),
    /// Model file exists but cannot be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Model file is not a valid JSON schema document.
    Parse {
        path: Option<PathBuf>,
        message: String,
    },
    /// Descriptor parsed but violates schema rules.
    Invalid(String),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "schema model not found at `{}`", path.display()),
            Self::Io { path, source } => {
                write!(f, "failed to read schema model `{}`: {source}", path.display())
            }
            Self::Parse {
                path: Some(path),
                message,
            } => write!(f, "invalid schema model `{}`: {message}", path.display()),
            Self::Parse {
                path: None,
                message,
            } => write!(f, "invalid schema model: {message}"),
            Self::Invalid(message) => write!(f, "invalid schema: {message}"),
        }
    }
}

impl Error for SchemaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Where a schema descriptor comes from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// Explicit path to a JSON model file.
    ModelFile(PathBuf),
    /// Model file name resolved inside a bundle directory.
    Bundle { dir: PathBuf, model_name: String },
    /// Descriptor already built in-process.
    Descriptor(SchemaDescriptor),
}

impl SchemaSource {
    /// Resolves and validates the descriptor.
    ///
    /// # Errors
    /// - `SchemaError::NotFound` when the model file does not exist.
    /// - `SchemaError::Parse` / `SchemaError::Invalid` for malformed models.
    pub fn resolve(&self) -> Result<SchemaDescriptor, SchemaError> {
        match self {
            Self::ModelFile(path) => SchemaDescriptor::load(path),
            Self::Bundle { dir, model_name } => {
                SchemaDescriptor::load(bundle_model_path(dir, model_name))
            }
            Self::Descriptor(descriptor) => {
                descriptor.validate()?;
                Ok(descriptor.clone())
            }
        }
    }

    /// Store file next to a bundle model: `<dir>/<model_name>.<extension>`.
    pub(crate) fn default_store_path(&self, extension: &str) -> Option<PathBuf> {
        match self {
            Self::Bundle { .. } => self
                .mapping_search_dir()
                .map(|(dir, stem)| dir.join(format!("{stem}.{extension}"))),
            Self::ModelFile(_) | Self::Descriptor(_) => None,
        }
    }

    /// Directory searched for mapping model files, if any.
    pub(crate) fn mapping_search_dir(&self) -> Option<(PathBuf, String)> {
        match self {
            Self::ModelFile(path) => {
                let dir = path.parent()?.to_path_buf();
                let stem = path.file_stem()?.to_str()?.to_string();
                Some((dir, stem))
            }
            Self::Bundle { dir, model_name } => Some((
                dir.clone(),
                model_name
                    .strip_suffix(".json")
                    .unwrap_or(model_name)
                    .to_string(),
            )),
            Self::Descriptor(_) => None,
        }
    }
}

fn bundle_model_path(dir: &Path, model_name: &str) -> PathBuf {
    let file_name = if model_name.ends_with(".json") {
        model_name.to_string()
    } else {
        format!("{model_name}.{MODEL_FILE_EXTENSION}")
    };
    dir.join(file_name)
}

/// Versioned set of entity definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescription>,
}

/// One entity type: a table of records with declared attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

/// One typed attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default = "default_optional")]
    pub optional: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<AttributeValue>,
}

fn default_optional() -> bool {
    true
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            entities: Vec::new(),
        }
    }

    /// Adds one entity; intended for in-process schema construction.
    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(entity);
        self
    }

    /// Parses and validates a JSON schema document.
    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let descriptor: Self = serde_json::from_str(json).map_err(|err| SchemaError::Parse {
            path: None,
            message: err.to_string(),
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Loads and validates a JSON model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SchemaError::NotFound(path.to_path_buf())
            } else {
                SchemaError::Io {
                    path: path.to_path_buf(),
                    source: err,
                }
            }
        })?;

        Self::from_json_str(&json).map_err(|err| match err {
            SchemaError::Parse { message, .. } => SchemaError::Parse {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|entity| entity.name.as_str())
    }

    /// Checks naming, uniqueness and default-value rules.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.version == 0 {
            return Err(SchemaError::Invalid(format!(
                "schema `{}` must have version >= 1",
                self.name
            )));
        }

        let mut entity_names = BTreeSet::new();
        for entity in &self.entities {
            if !is_identifier(&entity.name) {
                return Err(SchemaError::Invalid(format!(
                    "entity name `{}` is not a valid identifier",
                    entity.name
                )));
            }
            if !entity_names.insert(entity.name.as_str()) {
                return Err(SchemaError::Invalid(format!(
                    "entity `{}` is declared twice",
                    entity.name
                )));
            }
            entity.validate()?;
        }

        Ok(())
    }
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let mut names = BTreeSet::new();
        for attribute in &self.attributes {
            if !is_identifier(&attribute.name) {
                return Err(SchemaError::Invalid(format!(
                    "attribute name `{}.{}` is not a valid identifier",
                    self.name, attribute.name
                )));
            }
            if attribute.name == RESERVED_ATTRIBUTE {
                return Err(SchemaError::Invalid(format!(
                    "attribute name `{}.{RESERVED_ATTRIBUTE}` is reserved",
                    self.name
                )));
            }
            if !names.insert(attribute.name.as_str()) {
                return Err(SchemaError::Invalid(format!(
                    "attribute `{}.{}` is declared twice",
                    self.name, attribute.name
                )));
            }
            if let Some(default) = &attribute.default {
                if !attribute.kind.accepts(default) {
                    return Err(SchemaError::Invalid(format!(
                        "default for `{}.{}` is {} but the attribute is {}",
                        self.name,
                        attribute.name,
                        default.type_name(),
                        attribute.kind
                    )));
                }
                if matches!(default, AttributeValue::Real(number) if !number.is_finite()) {
                    return Err(SchemaError::Invalid(format!(
                        "default for `{}.{}` is not a finite real",
                        self.name, attribute.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl AttributeDescription {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
            unique: false,
            default: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Real)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, AttributeKind::Boolean)
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<AttributeValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Value assigned when a create request omits this attribute.
    pub fn initial_value(&self) -> AttributeValue {
        self.default
            .clone()
            .map_or(AttributeValue::Null, |value| self.kind.coerce(value))
    }
}

pub(crate) fn is_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}
