//! Operation façade over the store and its two contexts.
//!
//! # Responsibility
//! - Open the store, build the entity registry and spawn both contexts.
//! - Route each operation to the right context: writes to the write
//!   context, reads to the read context, `_in` variants to either.
//! - Offer blocking and completion-callback forms of every operation.
//!
//! # Invariants
//! - The read context merges every write-context commit, in order.
//! - Completions run on the lane that executed the operation.
//! - The façade holds no state besides the handles it routes to.

use crate::config::{StackConfig, StackOptions};
use crate::context::{ChangeSet, Context, ContextKind, ContextScope};
use crate::db::StoreHandle;
use crate::error::StackResult;
use crate::model::instance::{Attributes, EntityInstance, ObjectId};
use crate::model::registry::{Entity, EntityRegistry};
use crate::query::request::FetchRequest;
use log::info;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

/// How `fetch_with` runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Context to fetch in; the read context when unset.
    pub context: Option<ContextKind>,
    /// `Some(false)` blocks until the completion has run; asynchronous
    /// otherwise.
    pub asynchronous: Option<bool>,
}

impl FetchOptions {
    pub fn in_context(mut self, kind: ContextKind) -> Self {
        self.context = Some(kind);
        self
    }

    pub fn blocking(mut self) -> Self {
        self.asynchronous = Some(false);
        self
    }
}

/// Store coordinator, registry and both contexts behind one API.
pub struct PersistenceStack {
    store: StoreHandle,
    registry: Arc<EntityRegistry>,
    write: Context,
    read: Context,
}

impl PersistenceStack {
    /// Opens the store and starts both context lanes.
    ///
    /// # Errors
    /// - `SchemaNotFound`, `Schema`, `InvalidConfig`, `Store` from opening.
    /// - `Migration` under the automatic policy.
    /// - `LaneSpawn` when a lane thread cannot start.
    pub fn open(options: StackOptions) -> StackResult<Self> {
        let started_at = Instant::now();
        let store = options.into_coordinator().open()?;
        let registry = Arc::new(EntityRegistry::from_schema(Arc::clone(store.schema())));
        let write = Context::spawn(ContextKind::Write, store.clone(), Arc::clone(&registry))?;
        let read = Context::spawn(ContextKind::Read, store.clone(), Arc::clone(&registry))?;
        read.observe(&write);

        info!(
            "event=stack_open module=stack status=ok kind={} entities={} write_context={} read_context={} duration_ms={}",
            store.kind(),
            registry.entity_names().len(),
            write.id(),
            read.id(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            store,
            registry,
            write,
            read,
        })
    }

    /// Opens a stack from a JSON config file.
    pub fn from_config_file(path: impl AsRef<Path>) -> StackResult<Self> {
        Self::open(StackConfig::from_json_file(path)?.into_options()?)
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn context(&self, kind: ContextKind) -> &Context {
        match kind {
            ContextKind::Write => &self.write,
            ContextKind::Read => &self.read,
        }
    }

    /// Receiver of every change set `kind` commits from now on.
    pub fn subscribe(&self, kind: ContextKind) -> Receiver<Arc<ChangeSet>> {
        self.context(kind).subscribe()
    }

    pub fn perform(
        &self,
        kind: ContextKind,
        job: impl FnOnce(&mut ContextScope) + Send + 'static,
    ) -> StackResult<()> {
        self.context(kind).perform(job)
    }

    pub fn perform_and_wait<T: Send + 'static>(
        &self,
        kind: ContextKind,
        job: impl FnOnce(&mut ContextScope) -> T + Send + 'static,
    ) -> StackResult<T> {
        self.context(kind).perform_and_wait(job)
    }

    fn run<T: Send + 'static>(
        &self,
        kind: ContextKind,
        job: impl FnOnce(&mut ContextScope) -> StackResult<T> + Send + 'static,
    ) -> StackResult<T> {
        self.context(kind).perform_and_wait(job)?
    }

    /// Commits the write context; `false` when nothing was pending.
    pub fn save(&self) -> StackResult<bool> {
        self.save_in(ContextKind::Write)
    }

    pub fn save_in(&self, kind: ContextKind) -> StackResult<bool> {
        self.run(kind, ContextScope::commit)
    }

    /// Commits the write context and reports to `completion` on its lane.
    pub fn save_async(
        &self,
        completion: impl FnOnce(StackResult<bool>) + Send + 'static,
    ) -> StackResult<()> {
        self.save_in_async(ContextKind::Write, completion)
    }

    pub fn save_in_async(
        &self,
        kind: ContextKind,
        completion: impl FnOnce(StackResult<bool>) + Send + 'static,
    ) -> StackResult<()> {
        self.context(kind).commit_async(completion)
    }

    pub fn rollback_in(&self, kind: ContextKind) -> StackResult<()> {
        self.perform_and_wait(kind, ContextScope::rollback)
    }

    pub fn has_changes_in(&self, kind: ContextKind) -> StackResult<bool> {
        self.perform_and_wait(kind, |scope| scope.has_changes())
    }

    /// Creates a pending object in the write context.
    pub fn create(&self, entity: &str, attributes: Attributes) -> StackResult<EntityInstance> {
        self.create_in(ContextKind::Write, entity, attributes)
    }

    pub fn create_in(
        &self,
        kind: ContextKind,
        entity: &str,
        attributes: Attributes,
    ) -> StackResult<EntityInstance> {
        let entity = entity.to_string();
        self.run(kind, move |scope| scope.create(&entity, attributes))
    }

    /// Records a pending update in the write context.
    pub fn update(
        &self,
        instance: &EntityInstance,
        changes: Attributes,
    ) -> StackResult<EntityInstance> {
        self.update_in(ContextKind::Write, instance, changes)
    }

    pub fn update_in(
        &self,
        kind: ContextKind,
        instance: &EntityInstance,
        changes: Attributes,
    ) -> StackResult<EntityInstance> {
        let instance = instance.clone();
        self.run(kind, move |scope| scope.update(&instance, changes))
    }

    /// Marks `instance` for deletion in the write context.
    pub fn delete(&self, instance: &EntityInstance) -> StackResult<()> {
        self.delete_in(ContextKind::Write, instance)
    }

    pub fn delete_in(&self, kind: ContextKind, instance: &EntityInstance) -> StackResult<()> {
        let instance = instance.clone();
        self.run(kind, move |scope| scope.delete(&instance))
    }

    /// Marks every `entity` object for deletion in the write context.
    pub fn delete_all(&self, entity: &str) -> StackResult<()> {
        self.delete_all_in(ContextKind::Write, entity)
    }

    pub fn delete_all_in(&self, kind: ContextKind, entity: &str) -> StackResult<()> {
        let entity = entity.to_string();
        self.run(kind, move |scope| scope.delete_all(&entity))
    }

    /// Fetches in the read context, blocking.
    pub fn fetch(&self, request: &FetchRequest) -> StackResult<Vec<EntityInstance>> {
        self.fetch_in(ContextKind::Read, request)
    }

    pub fn fetch_in(
        &self,
        kind: ContextKind,
        request: &FetchRequest,
    ) -> StackResult<Vec<EntityInstance>> {
        let request = request.clone();
        self.run(kind, move |scope| scope.fetch(&request))
    }

    /// Fetches in the read context and reports to `completion` on its lane.
    pub fn fetch_async(
        &self,
        request: FetchRequest,
        completion: impl FnOnce(StackResult<Vec<EntityInstance>>) + Send + 'static,
    ) -> StackResult<()> {
        self.fetch_with(request, FetchOptions::default(), completion)
    }

    /// Fetches per `options`; the completion always runs on the fetching lane.
    pub fn fetch_with(
        &self,
        request: FetchRequest,
        options: FetchOptions,
        completion: impl FnOnce(StackResult<Vec<EntityInstance>>) + Send + 'static,
    ) -> StackResult<()> {
        let kind = options.context.unwrap_or(ContextKind::Read);
        let job = move |scope: &mut ContextScope| completion(scope.fetch(&request));
        if options.asynchronous.unwrap_or(true) {
            self.perform(kind, job)
        } else {
            self.perform_and_wait(kind, job)
        }
    }

    pub fn count(&self, request: &FetchRequest) -> StackResult<usize> {
        self.count_in(ContextKind::Read, request)
    }

    pub fn count_in(&self, kind: ContextKind, request: &FetchRequest) -> StackResult<usize> {
        let request = request.clone();
        self.run(kind, move |scope| scope.count(&request))
    }

    /// Loads one object by id in the read context.
    pub fn object_with_id(&self, entity: &str, id: ObjectId) -> StackResult<EntityInstance> {
        self.object_with_id_in(ContextKind::Read, entity, id)
    }

    pub fn object_with_id_in(
        &self,
        kind: ContextKind,
        entity: &str,
        id: ObjectId,
    ) -> StackResult<EntityInstance> {
        let entity = entity.to_string();
        self.run(kind, move |scope| scope.object_with_id(&entity, id))
    }

    /// Validates `T` against the schema for typed access.
    pub fn register<T: Entity>(&self) -> StackResult<()> {
        self.registry.register::<T>()
    }

    /// Typed create in the write context.
    pub fn create_object<T: Entity + Send>(&self, value: T) -> StackResult<EntityInstance> {
        self.run(ContextKind::Write, move |scope| scope.create_object(&value))
    }

    /// Typed fetch in the read context.
    pub fn fetch_objects<T: Entity + Send>(&self, request: &FetchRequest) -> StackResult<Vec<T>> {
        let request = request.clone();
        self.run(ContextKind::Read, move |scope| scope.fetch_objects::<T>(&request))
    }

    pub fn requires_migration(&self) -> bool {
        self.store.requires_migration()
    }

    pub fn migrate(&self) -> StackResult<()> {
        self.store.migrate()
    }

    /// Closes the store; context lanes stay up and report `StoreClosed`.
    pub fn close(&self) -> StackResult<()> {
        self.store.close()
    }
}

impl std::fmt::Debug for PersistenceStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceStack")
            .field("store", &self.store)
            .field("write", &self.write)
            .field("read", &self.read)
            .finish()
    }
}
