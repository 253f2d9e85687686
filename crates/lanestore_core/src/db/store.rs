//! Store coordinator and the shared store handle.
//!
//! # Responsibility
//! - Resolve the schema, open the backing store and stamp fresh stores.
//! - Report and perform schema migration.
//! - Serialize every connection access behind one mutex and hand out
//!   monotonic commit sequence numbers.
//!
//! # Invariants
//! - Data access is refused with `MigrationRequired` while the stamped
//!   schema differs from the loaded one.
//! - Commit sequence numbers are assigned while the connection lock is held,
//!   so sequence order equals commit order.
//! - After `close()` every access fails with `StoreClosed`.

use super::migrations::{plan_migration, MappingModel, MigrationError};
use super::{open_connection, sql, StoreKind};
use crate::config::MigrationPolicy;
use crate::error::{StackError, StackResult};
use crate::model::schema::{SchemaDescriptor, SchemaSource};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Builder that opens a [`StoreHandle`].
#[derive(Debug, Clone)]
pub struct StoreCoordinator {
    kind: StoreKind,
    url: Option<PathBuf>,
    source: SchemaSource,
    policy: MigrationPolicy,
    mapping_models: Vec<MappingModel>,
}

impl StoreCoordinator {
    pub fn new(kind: StoreKind, url: Option<PathBuf>, source: SchemaSource) -> Self {
        Self {
            kind,
            url,
            source,
            policy: MigrationPolicy::default(),
            mapping_models: Vec::new(),
        }
    }

    pub fn with_migration_policy(mut self, policy: MigrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Supplies a mapping model ahead of bundle-directory discovery.
    pub fn with_mapping_model(mut self, mapping: MappingModel) -> Self {
        self.mapping_models.push(mapping);
        self
    }

    /// Opens the store.
    ///
    /// # Errors
    /// - `SchemaNotFound` when the schema source does not resolve.
    /// - `InvalidConfig` when an on-disk kind has no url and the schema is not
    ///   a bundle model (bundles default to `<dir>/<model_name>.<ext>`).
    /// - `Store` for engine failures; `Migration` when the automatic policy
    ///   cannot migrate.
    pub fn open(self) -> StackResult<StoreHandle> {
        let started_at = Instant::now();
        let kind = self.kind;
        info!(
            "event=store_open module=store status=start kind={}",
            kind.label()
        );

        match self.open_inner() {
            Ok(handle) => {
                info!(
                    "event=store_open module=store status=ok kind={} schema_version={} requires_migration={} duration_ms={}",
                    kind.label(),
                    handle.schema().version,
                    handle.requires_migration(),
                    started_at.elapsed().as_millis()
                );
                Ok(handle)
            }
            Err(err) => {
                error!(
                    "event=store_open module=store status=error kind={} duration_ms={} error_code={} error={}",
                    kind.label(),
                    started_at.elapsed().as_millis(),
                    open_error_code(&err),
                    err
                );
                Err(err)
            }
        }
    }

    fn open_inner(mut self) -> StackResult<StoreHandle> {
        let schema = self.source.resolve()?;
        if self.kind.is_on_disk() && self.url.is_none() {
            self.url = self
                .kind
                .default_extension()
                .and_then(|extension| self.source.default_store_path(extension));
            if let Some(url) = &self.url {
                info!(
                    "event=store_open module=store status=default_url kind={} url={}",
                    self.kind.label(),
                    url.display()
                );
            }
        }
        if self.kind.is_on_disk() && self.url.is_none() {
            return Err(StackError::InvalidConfig(format!(
                "store kind `{}` needs a store url",
                self.kind
            )));
        }

        let mut conn = open_connection(self.kind, self.url.as_deref())?;
        let stamped = match sql::read_stamped_schema(&conn)? {
            Some(stamped) => stamped,
            None => {
                let tx = conn.transaction()?;
                sql::create_schema(&tx, &schema)?;
                tx.commit()?;
                schema.clone()
            }
        };

        let handle = StoreHandle {
            inner: Arc::new(StoreInner {
                kind: self.kind,
                url: self.url,
                source: self.source,
                schema: Arc::new(schema),
                mapping_models: self.mapping_models,
                stamped: RwLock::new(stamped),
                connection: Mutex::new(Some(conn)),
                sequence: AtomicU64::new(0),
            }),
        };

        if handle.requires_migration() {
            match self.policy {
                MigrationPolicy::Automatic => handle.migrate()?,
                MigrationPolicy::Manual => warn!(
                    "event=store_open module=store status=pending kind={} stamped_version={} model_version={}",
                    handle.kind().label(),
                    handle.stamped_version(),
                    handle.schema().version
                ),
            }
        }

        Ok(handle)
    }
}

fn open_error_code(err: &StackError) -> &'static str {
    match err {
        StackError::SchemaNotFound(_) => "schema_not_found",
        StackError::Schema(_) => "schema_invalid",
        StackError::InvalidConfig(_) => "invalid_config",
        StackError::Migration(_) => "migration_failed",
        _ => "store_open_failed",
    }
}

struct StoreInner {
    kind: StoreKind,
    url: Option<PathBuf>,
    source: SchemaSource,
    schema: Arc<SchemaDescriptor>,
    mapping_models: Vec<MappingModel>,
    stamped: RwLock<SchemaDescriptor>,
    connection: Mutex<Option<Connection>>,
    sequence: AtomicU64,
}

/// Shared handle to the open backing store. Cloning is cheap.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("kind", &self.inner.kind)
            .field("url", &self.inner.url)
            .field("schema_version", &self.inner.schema.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StoreHandle {
    pub fn kind(&self) -> StoreKind {
        self.inner.kind
    }

    pub fn url(&self) -> Option<&Path> {
        self.inner.url.as_deref()
    }

    /// Schema loaded from the schema source.
    pub fn schema(&self) -> &Arc<SchemaDescriptor> {
        &self.inner.schema
    }

    /// Version recorded inside the store.
    pub fn stamped_version(&self) -> u32 {
        self.inner.stamped.read().version
    }

    /// Whether the stamped schema differs from the loaded one.
    pub fn requires_migration(&self) -> bool {
        *self.inner.stamped.read() != *self.inner.schema
    }

    /// Migrates the store to the loaded schema. No-op when not required.
    ///
    /// # Errors
    /// - `Migration(MappingModelNotFound)` when the change cannot be mapped.
    /// - `Migration(MigrationFailed)` when a step fails; nothing is applied.
    /// - `StoreClosed` after `close()`.
    pub fn migrate(&self) -> StackResult<()> {
        let started_at = Instant::now();
        let mut guard = self.inner.connection.lock();
        let conn = guard.as_mut().ok_or(StackError::StoreClosed)?;

        let stamped = self.inner.stamped.read().clone();
        let schema = &self.inner.schema;
        if stamped == **schema {
            return Ok(());
        }

        info!(
            "event=store_migrate module=store status=start from_version={} to_version={}",
            stamped.version, schema.version
        );

        let result = self
            .find_mapping(stamped.version, schema.version)
            .and_then(|mapping| plan_migration(&stamped, schema, mapping.as_ref()))
            .and_then(|plan| {
                let tx = conn.transaction()?;
                plan.apply(&tx)?;
                sql::stamp_schema(&tx, schema)?;
                tx.commit()?;
                Ok(plan.steps.len())
            });

        match result {
            Ok(steps) => {
                *self.inner.stamped.write() = (**schema).clone();
                info!(
                    "event=store_migrate module=store status=ok from_version={} to_version={} steps={} duration_ms={}",
                    stamped.version,
                    schema.version,
                    steps,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                let error_code = match err {
                    MigrationError::MappingModelNotFound { .. } => "mapping_model_not_found",
                    MigrationError::MigrationFailed(_) => "migration_failed",
                    MigrationError::Store(_) => "store_failed",
                };
                error!(
                    "event=store_migrate module=store status=error from_version={} to_version={} duration_ms={} error_code={} error={}",
                    stamped.version,
                    schema.version,
                    started_at.elapsed().as_millis(),
                    error_code,
                    err
                );
                Err(err.into())
            }
        }
    }

    fn find_mapping(
        &self,
        source_version: u32,
        destination_version: u32,
    ) -> Result<Option<MappingModel>, MigrationError> {
        if let Some(mapping) = self
            .inner
            .mapping_models
            .iter()
            .find(|mapping| mapping.covers(source_version, destination_version))
        {
            return Ok(Some(mapping.clone()));
        }

        let Some((dir, model_name)) = self.inner.source.mapping_search_dir() else {
            return Ok(None);
        };
        MappingModel::discover(&dir, &model_name, source_version, destination_version)
            .map_err(MigrationError::MigrationFailed)
    }

    /// Checkpoints and releases the connection. Idempotent.
    pub fn close(&self) -> StackResult<()> {
        let Some(conn) = self.inner.connection.lock().take() else {
            return Ok(());
        };

        if self.inner.kind == StoreKind::Sqlite {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |_| Ok(()))?;
        }
        conn.close().map_err(|(_, err)| StackError::from(err))?;
        info!(
            "event=store_close module=store status=ok kind={}",
            self.inner.kind.label()
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.lock().is_none()
    }

    /// Runs `f` with the connection after the closed and migration gates.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> StackResult<T>,
    ) -> StackResult<T> {
        let guard = self.inner.connection.lock();
        let conn = guard.as_ref().ok_or(StackError::StoreClosed)?;
        if self.requires_migration() {
            return Err(StackError::MigrationRequired);
        }
        f(conn)
    }

    /// Runs `f` inside one transaction and returns its value with the commit
    /// sequence number. The transaction rolls back when `f` fails.
    pub(crate) fn with_write_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StackResult<T>,
    ) -> StackResult<(T, u64)> {
        let mut guard = self.inner.connection.lock();
        let conn = guard.as_mut().ok_or(StackError::StoreClosed)?;
        if self.requires_migration() {
            return Err(StackError::MigrationRequired);
        }

        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((value, sequence))
    }
}
