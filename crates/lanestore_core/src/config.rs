//! Stack configuration.
//!
//! # Responsibility
//! - Describe how a stack opens its store (`StackOptions`, built in code).
//! - Load the same settings from a JSON file (`StackConfig`).
//!
//! # Invariants
//! - Relative paths in a config file resolve against the file's directory.
//! - A config names exactly one schema source.

use crate::db::migrations::MappingModel;
use crate::db::{StoreCoordinator, StoreKind};
use crate::error::{StackError, StackResult};
use crate::logging::LogSettings;
use crate::model::schema::{SchemaDescriptor, SchemaSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What happens at open when the stamped schema is out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicy {
    /// Open succeeds; data operations fail until `migrate()` runs.
    #[default]
    Manual,
    /// Open migrates and fails when migration fails.
    Automatic,
}

/// Settings used to build a `PersistenceStack`.
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub store_kind: StoreKind,
    pub store_url: Option<PathBuf>,
    pub schema: SchemaSource,
    pub migration_policy: MigrationPolicy,
    pub mapping_models: Vec<MappingModel>,
}

impl StackOptions {
    pub fn new(store_kind: StoreKind, schema: SchemaSource) -> Self {
        Self {
            store_kind,
            store_url: None,
            schema,
            migration_policy: MigrationPolicy::default(),
            mapping_models: Vec::new(),
        }
    }

    /// In-memory store over an in-process schema; the usual test setup.
    pub fn in_memory(schema: SchemaDescriptor) -> Self {
        Self::new(StoreKind::InMemory, SchemaSource::Descriptor(schema))
    }

    pub fn with_store_url(mut self, url: impl Into<PathBuf>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    pub fn with_migration_policy(mut self, policy: MigrationPolicy) -> Self {
        self.migration_policy = policy;
        self
    }

    pub fn with_mapping_model(mut self, mapping: MappingModel) -> Self {
        self.mapping_models.push(mapping);
        self
    }

    pub(crate) fn into_coordinator(self) -> StoreCoordinator {
        self.mapping_models.into_iter().fold(
            StoreCoordinator::new(self.store_kind, self.store_url, self.schema)
                .with_migration_policy(self.migration_policy),
            StoreCoordinator::with_mapping_model,
        )
    }
}

/// JSON form of [`StackOptions`].
///
/// ```json
/// {
///   "store_kind": "sqlite",
///   "store_url": "data/notes.sqlite3",
///   "bundle_dir": "models",
///   "model_name": "Notes",
///   "migration_policy": "manual",
///   "logging": { "level": "info", "dir": "logs" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub store_kind: StoreKind,
    #[serde(default)]
    pub store_url: Option<PathBuf>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub migration_policy: MigrationPolicy,
    /// Mapping model files loaded ahead of bundle discovery.
    #[serde(default)]
    pub mapping_models: Vec<PathBuf>,
    /// Optional file logging; applied by callers via `logging::init_with`.
    #[serde(default)]
    pub logging: Option<LogSettings>,
}

impl StackConfig {
    pub fn from_json_str(json: &str) -> StackResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| StackError::InvalidConfig(format!("invalid stack config: {err}")))
    }

    /// Loads a config file and resolves its relative paths.
    pub fn from_json_file(path: impl AsRef<Path>) -> StackResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            StackError::InvalidConfig(format!(
                "failed to read stack config `{}`: {err}",
                path.display()
            ))
        })?;

        let config = Self::from_json_str(&json)?;
        match path.parent() {
            Some(base) if !base.as_os_str().is_empty() => Ok(config.relative_to(base)),
            _ => Ok(config),
        }
    }

    /// Rebases every relative path onto `base`.
    pub fn relative_to(mut self, base: &Path) -> Self {
        let rebase = |path: PathBuf| {
            if path.is_relative() {
                base.join(path)
            } else {
                path
            }
        };
        self.store_url = self.store_url.map(rebase);
        self.model_path = self.model_path.map(rebase);
        self.bundle_dir = self.bundle_dir.map(rebase);
        self.mapping_models = self.mapping_models.into_iter().map(rebase).collect();
        if let Some(logging) = self.logging.as_mut() {
            logging.dir = rebase(std::mem::take(&mut logging.dir));
        }
        self
    }

    /// Converts into options, loading mapping model files.
    ///
    /// # Errors
    /// - `InvalidConfig` when the schema source is missing or ambiguous, or
    ///   a mapping model file cannot be loaded.
    pub fn into_options(self) -> StackResult<StackOptions> {
        let schema = match (self.model_path, self.bundle_dir, self.model_name) {
            (Some(path), None, None) => SchemaSource::ModelFile(path),
            (None, Some(dir), Some(model_name)) => SchemaSource::Bundle { dir, model_name },
            (None, None, None) => {
                return Err(StackError::InvalidConfig(
                    "config needs `model_path` or `bundle_dir` + `model_name`".to_string(),
                ))
            }
            _ => {
                return Err(StackError::InvalidConfig(
                    "`model_path` and `bundle_dir` + `model_name` are mutually exclusive"
                        .to_string(),
                ))
            }
        };

        let mapping_models = self
            .mapping_models
            .iter()
            .map(|path| MappingModel::load(path).map_err(StackError::InvalidConfig))
            .collect::<StackResult<Vec<_>>>()?;

        Ok(StackOptions {
            store_kind: self.store_kind,
            store_url: self.store_url,
            schema,
            migration_policy: self.migration_policy,
            mapping_models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MigrationPolicy, StackConfig};
    use crate::db::StoreKind;
    use crate::error::StackError;
    use crate::model::schema::SchemaSource;
    use std::path::Path;

    #[test]
    fn bundle_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("stack.json");
        std::fs::write(
            &config_path,
            r#"{
                "store_kind": "sqlite",
                "store_url": "data/notes.sqlite3",
                "bundle_dir": "models",
                "model_name": "Notes",
                "migration_policy": "automatic",
                "logging": { "dir": "logs" }
            }"#,
        )
        .unwrap();

        let config = StackConfig::from_json_file(&config_path).unwrap();
        assert_eq!(
            config.logging.as_ref().map(|logging| logging.dir.clone()),
            Some(dir.path().join("logs"))
        );
        let options = config.into_options().unwrap();
        assert_eq!(options.store_kind, StoreKind::Sqlite);
        assert_eq!(options.migration_policy, MigrationPolicy::Automatic);
        assert_eq!(
            options.store_url.as_deref(),
            Some(dir.path().join("data/notes.sqlite3").as_path())
        );
        match options.schema {
            SchemaSource::Bundle { dir: bundle, model_name } => {
                assert_eq!(bundle, dir.path().join("models"));
                assert_eq!(model_name, "Notes");
            }
            other => panic!("unexpected schema source: {other:?}"),
        }
    }

    #[test]
    fn ambiguous_schema_source_is_rejected() {
        let config = StackConfig::from_json_str(
            r#"{ "store_kind": "in_memory", "model_path": "a.json", "bundle_dir": "b", "model_name": "c" }"#,
        )
        .unwrap();
        assert!(matches!(
            config.into_options(),
            Err(StackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn policy_defaults_to_manual() {
        let config = StackConfig::from_json_str(
            r#"{ "store_kind": "in_memory", "model_path": "/models/Notes.json" }"#,
        )
        .unwrap();
        assert_eq!(config.migration_policy, MigrationPolicy::Manual);
        let options = config.into_options().unwrap();
        assert!(matches!(
            options.schema,
            SchemaSource::ModelFile(ref path) if path == Path::new("/models/Notes.json")
        ));
    }
}
