//! Working set of one execution context.
//!
//! # Responsibility
//! - Track registered objects and pending inserts, updates, deletes and
//!   delete-all requests.
//! - Flush pending changes in one transaction and broadcast the change set.
//! - Answer fetches with the store state overlaid by pending changes.
//! - Merge change sets committed by other contexts.
//!
//! # Invariants
//! - A failed commit leaves every pending change as it was.
//! - Commit order inside the transaction: delete-all, deletes, updates,
//!   inserts.
//! - Merges are last-writer-wins by commit sequence.
//! - Only fetches and updates register objects; commits and merges refresh
//!   registered objects but never add new ones.
//! - Ties left by the sort keys are broken by store row order, pending
//!   inserts last, with or without pending changes.

use crate::context::change_set::{ChangeSet, CommitBus};
use crate::context::lane::LaneState;
use crate::context::ContextKind;
use crate::db::{sql, StoreHandle};
use crate::error::{StackError, StackResult};
use crate::model::instance::{Attributes, ContextId, EntityInstance, ObjectId};
use crate::model::registry::{Entity, EntityRegistry};
use crate::model::schema::EntityDescription;
use crate::query::predicate::{Predicate, ID_KEY};
use crate::query::request::FetchRequest;
use crate::query::sql::{compile_count, compile_fetch, run_count, run_fetch};
use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Mutable state of one context, reachable only on its lane.
///
/// Handed to closures passed to `perform` / `perform_and_wait`.
pub struct ContextScope {
    id: ContextId,
    kind: ContextKind,
    store: StoreHandle,
    registry: Arc<EntityRegistry>,
    bus: Arc<CommitBus>,
    registered: HashMap<ObjectId, EntityInstance>,
    inserted: Vec<EntityInstance>,
    updated: BTreeMap<ObjectId, EntityInstance>,
    deleted: BTreeMap<ObjectId, String>,
    cleared: BTreeSet<String>,
    last_merged_sequence: u64,
}

impl ContextScope {
    pub(crate) fn new(
        id: ContextId,
        kind: ContextKind,
        store: StoreHandle,
        registry: Arc<EntityRegistry>,
        bus: Arc<CommitBus>,
    ) -> Self {
        Self {
            id,
            kind,
            store,
            registry,
            bus,
            registered: HashMap::new(),
            inserted: Vec::new(),
            updated: BTreeMap::new(),
            deleted: BTreeMap::new(),
            cleared: BTreeSet::new(),
            last_merged_sequence: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Creates a pending object of `entity`.
    ///
    /// # Errors
    /// - `UnknownEntityType`, `UnknownAttribute` or `TypeMismatch`.
    pub fn create(&mut self, entity: &str, attributes: Attributes) -> StackResult<EntityInstance> {
        let attributes = self.registry.factory(entity)?.build(attributes)?;
        let instance = EntityInstance::new(ObjectId::new(), entity, self.id, attributes);
        self.inserted.push(instance.clone());
        Ok(instance)
    }

    /// Applies `changes` on top of the latest state of `instance`: its
    /// pending update if any, otherwise the stored row.
    ///
    /// # Errors
    /// - `ForeignContextInstance` when `instance` belongs to another context.
    /// - `ObjectNotFound` when the object is pending deletion or no longer
    ///   stored.
    pub fn update(
        &mut self,
        instance: &EntityInstance,
        changes: Attributes,
    ) -> StackResult<EntityInstance> {
        self.check_owner(instance)?;
        let factory = self.registry.factory(instance.entity())?;

        if let Some(pending) = self
            .inserted
            .iter_mut()
            .find(|pending| pending.id() == instance.id())
        {
            factory.patch(pending.attributes_mut(), changes)?;
            return Ok(pending.clone());
        }
        if self.deleted.contains_key(&instance.id()) || self.cleared.contains(instance.entity()) {
            return Err(StackError::ObjectNotFound(instance.id()));
        }

        let mut next = match self.updated.get(&instance.id()) {
            Some(pending) => pending.clone(),
            None => {
                let stored = self.load_committed(instance.entity(), instance.id())?;
                self.registered.insert(stored.id(), stored.clone());
                stored
            }
        };
        factory.patch(next.attributes_mut(), changes)?;
        self.updated.insert(next.id(), next.clone());
        Ok(next)
    }

    /// Marks `instance` for deletion; a pending insert is simply dropped.
    pub fn delete(&mut self, instance: &EntityInstance) -> StackResult<()> {
        self.check_owner(instance)?;
        self.registry.factory(instance.entity())?;

        if let Some(position) = self
            .inserted
            .iter()
            .position(|pending| pending.id() == instance.id())
        {
            self.inserted.remove(position);
            return Ok(());
        }

        self.updated.remove(&instance.id());
        self.deleted
            .insert(instance.id(), instance.entity().to_string());
        Ok(())
    }

    /// Marks every object of `entity` for deletion, pending inserts included.
    pub fn delete_all(&mut self, entity: &str) -> StackResult<()> {
        self.registry.factory(entity)?;
        self.inserted.retain(|pending| pending.entity() != entity);
        self.updated.retain(|_, pending| pending.entity() != entity);
        self.deleted.retain(|_, owner| owner != entity);
        self.cleared.insert(entity.to_string());
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.cleared.is_empty())
    }

    /// Discards every pending change.
    pub fn rollback(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        self.cleared.clear();
    }

    /// Writes pending changes and broadcasts them.
    ///
    /// Returns `false` when nothing was pending.
    ///
    /// # Errors
    /// - `Validation` for required attributes left nil.
    /// - `Store` for engine failures such as unique violations.
    /// - `ObjectNotFound` when an updated object no longer exists.
    pub fn commit(&mut self) -> StackResult<bool> {
        if !self.has_changes() {
            return Ok(false);
        }

        let started_at = Instant::now();
        info!(
            "event=context_commit module=context status=start kind={} context={} inserted={} updated={} deleted={} cleared={}",
            self.kind,
            self.id,
            self.inserted.len(),
            self.updated.len(),
            self.deleted.len(),
            self.cleared.len()
        );

        match self.write_pending() {
            Ok(changes) => {
                let subscribers = self.bus.publish(&changes);
                info!(
                    "event=context_commit module=context status=ok kind={} context={} sequence={} changes={} subscribers={} duration_ms={}",
                    self.kind,
                    self.id,
                    changes.sequence,
                    changes.len(),
                    subscribers,
                    started_at.elapsed().as_millis()
                );
                Ok(true)
            }
            Err(err) => {
                error!(
                    "event=context_commit module=context status=error kind={} context={} duration_ms={} error_code={} error={}",
                    self.kind,
                    self.id,
                    started_at.elapsed().as_millis(),
                    commit_error_code(&err),
                    err
                );
                Err(err)
            }
        }
    }

    fn write_pending(&mut self) -> StackResult<Arc<ChangeSet>> {
        for instance in self.inserted.iter().chain(self.updated.values()) {
            self.registry
                .factory(instance.entity())?
                .validate_required(instance.attributes())?;
        }

        let registry = &self.registry;
        let (removed, sequence) = self.store.with_write_transaction(|tx| {
            let mut removed = Vec::new();
            for entity in &self.cleared {
                removed.extend(sql::delete_all_rows(tx, entity)?);
            }
            for (id, entity) in &self.deleted {
                sql::delete_row(tx, entity, *id)?;
                removed.push(*id);
            }
            for instance in self.updated.values() {
                let description = registry.description(instance.entity())?;
                if sql::update_row(tx, description, instance.id(), instance.attributes())? == 0 {
                    return Err(StackError::ObjectNotFound(instance.id()));
                }
            }
            for instance in &self.inserted {
                let description = registry.description(instance.entity())?;
                sql::insert_row(tx, description, instance.id(), instance.attributes())?;
            }
            Ok(removed)
        })?;

        let mut seen = HashSet::new();
        let deleted: Vec<ObjectId> = removed.into_iter().filter(|id| seen.insert(*id)).collect();
        let inserted = std::mem::take(&mut self.inserted);
        let updated: Vec<EntityInstance> = std::mem::take(&mut self.updated).into_values().collect();
        self.deleted.clear();
        self.cleared.clear();

        for id in &deleted {
            self.registered.remove(id);
        }
        for instance in &updated {
            self.refresh(instance.clone());
        }

        Ok(Arc::new(ChangeSet {
            sequence,
            origin: self.kind,
            origin_context: self.id,
            inserted,
            updated,
            deleted,
        }))
    }

    /// Fetches matching objects, pending changes included.
    pub fn fetch(&mut self, request: &FetchRequest) -> StackResult<Vec<EntityInstance>> {
        let started_at = Instant::now();
        let registry = Arc::clone(&self.registry);
        let description = registry.description(&request.entity)?;
        request.validate(description)?;

        let overlay = self.has_pending_for(&request.entity);
        let results = self.collect(description, request, overlay)?;

        let pending: HashSet<ObjectId> = self
            .inserted
            .iter()
            .map(EntityInstance::id)
            .chain(self.updated.keys().copied())
            .collect();
        for instance in results.iter().filter(|found| !pending.contains(&found.id())) {
            self.remember(instance);
        }

        debug!(
            "event=context_fetch module=context status=ok kind={} context={} entity={} overlay={} count={} duration_ms={}",
            self.kind,
            self.id,
            request.entity,
            overlay,
            results.len(),
            started_at.elapsed().as_millis()
        );
        Ok(results)
    }

    /// Number of objects `fetch(request)` would return.
    pub fn count(&mut self, request: &FetchRequest) -> StackResult<usize> {
        let registry = Arc::clone(&self.registry);
        let description = registry.description(&request.entity)?;
        request.validate(description)?;
        if self.has_pending_for(&request.entity) {
            return Ok(self.collect(description, request, true)?.len());
        }

        let query = compile_count(description, request.predicate.as_ref());
        let total = self
            .store
            .with_connection(|conn| Ok(run_count(conn, &query)?))?;

        let after_offset = total.saturating_sub(request.offset);
        Ok(request
            .limit
            .map_or(after_offset, |limit| after_offset.min(limit)))
    }

    /// Loads one object by id, pending changes included.
    pub fn object_with_id(&mut self, entity: &str, id: ObjectId) -> StackResult<EntityInstance> {
        let request =
            FetchRequest::new(entity).with_predicate(Predicate::eq(ID_KEY, id.to_string()));
        self.fetch(&request)?
            .into_iter()
            .next()
            .ok_or(StackError::ObjectNotFound(id))
    }

    /// Latest state of `id` known to this context without touching the store.
    ///
    /// Committed objects are known once fetched or updated here.
    pub fn registered_object(&self, id: ObjectId) -> Option<EntityInstance> {
        if self.deleted.contains_key(&id) {
            return None;
        }
        self.updated
            .get(&id)
            .or_else(|| self.inserted.iter().find(|pending| pending.id() == id))
            .or_else(|| self.registered.get(&id))
            .cloned()
    }

    /// Number of committed objects this context has registered.
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn last_merged_sequence(&self) -> u64 {
        self.last_merged_sequence
    }

    /// Typed create; `T` must be registered with the entity registry.
    pub fn create_object<T: Entity>(&mut self, value: &T) -> StackResult<EntityInstance> {
        self.registry.register::<T>()?;
        self.create(T::ENTITY_NAME, value.to_attributes())
    }

    /// Typed fetch of `T::ENTITY_NAME` objects.
    pub fn fetch_objects<T: Entity>(&mut self, request: &FetchRequest) -> StackResult<Vec<T>> {
        self.registry.register::<T>()?;
        if request.entity != T::ENTITY_NAME {
            return Err(StackError::UnknownEntityType(request.entity.clone()));
        }
        self.fetch(request)?.iter().map(T::from_instance).collect()
    }

    /// Applies a change set committed by another context.
    pub fn merge(&mut self, changes: &ChangeSet) {
        if changes.origin_context == self.id || changes.sequence <= self.last_merged_sequence {
            return;
        }

        for instance in &changes.updated {
            self.refresh(instance.clone().rehome(self.id));
        }
        for id in &changes.deleted {
            self.registered.remove(id);
            self.updated.remove(id);
            self.deleted.remove(id);
        }
        self.last_merged_sequence = changes.sequence;

        info!(
            "event=context_merge module=context status=ok kind={} context={} sequence={} origin={} inserted={} updated={} deleted={}",
            self.kind,
            self.id,
            changes.sequence,
            changes.origin,
            changes.inserted.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
    }

    fn check_owner(&self, instance: &EntityInstance) -> StackResult<()> {
        if instance.context() == self.id {
            return Ok(());
        }
        Err(StackError::ForeignContextInstance {
            object: instance.id(),
            owner: instance.context(),
            context: self.id,
        })
    }

    fn remember(&mut self, instance: &EntityInstance) {
        self.registered.insert(instance.id(), instance.clone());
    }

    /// Replaces a registered snapshot; unknown objects stay unregistered.
    fn refresh(&mut self, instance: EntityInstance) {
        if let Some(slot) = self.registered.get_mut(&instance.id()) {
            *slot = instance;
        }
    }

    fn load_committed(&self, entity: &str, id: ObjectId) -> StackResult<EntityInstance> {
        let description = self.registry.description(entity)?;
        let request =
            FetchRequest::new(entity).with_predicate(Predicate::eq(ID_KEY, id.to_string()));
        let query = compile_fetch(description, &request, false);
        let rows = self
            .store
            .with_connection(|conn| Ok(run_fetch(conn, description, &query)?))?;
        rows.into_iter()
            .next()
            .map(|(id, attributes)| EntityInstance::new(id, entity, self.id, attributes))
            .ok_or(StackError::ObjectNotFound(id))
    }

    /// Runs `request`; with `overlay` every stored row is read in row order
    /// and pending changes are applied before filtering, sorting and paging.
    fn collect(
        &self,
        description: &EntityDescription,
        request: &FetchRequest,
        overlay: bool,
    ) -> StackResult<Vec<EntityInstance>> {
        if !overlay {
            let query = compile_fetch(description, request, true);
            let rows = self
                .store
                .with_connection(|conn| Ok(run_fetch(conn, description, &query)?))?;
            return Ok(rows
                .into_iter()
                .map(|(id, attributes)| {
                    EntityInstance::new(id, &request.entity, self.id, attributes)
                })
                .collect());
        }

        let rows = if self.cleared.contains(&request.entity) {
            Vec::new()
        } else {
            let query = compile_fetch(description, &FetchRequest::new(&request.entity), false);
            self.store
                .with_connection(|conn| Ok(run_fetch(conn, description, &query)?))?
        };
        let stored = rows
            .into_iter()
            .map(|(id, attributes)| EntityInstance::new(id, &request.entity, self.id, attributes))
            .collect();
        Ok(request.page(self.overlay_pending(request, stored)))
    }

    fn has_pending_for(&self, entity: &str) -> bool {
        self.cleared.contains(entity)
            || self.inserted.iter().any(|pending| pending.entity() == entity)
            || self.updated.values().any(|pending| pending.entity() == entity)
            || self.deleted.values().any(|owner| owner == entity)
    }

    /// Replaces stored rows with pending state, drops pending deletes and
    /// appends matching pending inserts. `stored` holds every row of the
    /// entity in row order.
    fn overlay_pending(
        &self,
        request: &FetchRequest,
        stored: Vec<EntityInstance>,
    ) -> Vec<EntityInstance> {
        let mut results: Vec<EntityInstance> = stored
            .into_iter()
            .filter(|row| !self.deleted.contains_key(&row.id()))
            .map(|row| self.updated.get(&row.id()).cloned().unwrap_or(row))
            .filter(|current| request.matches(current))
            .collect();
        results.extend(
            self.inserted
                .iter()
                .filter(|pending| pending.entity() == request.entity)
                .filter(|pending| request.matches(pending))
                .cloned(),
        );

        if !request.sort.is_empty() {
            results.sort_by(|left, right| request.compare(left, right));
        }
        results
    }
}

impl LaneState for ContextScope {
    fn merge(&mut self, changes: &ChangeSet) {
        ContextScope::merge(self, changes);
    }
}

fn commit_error_code(err: &StackError) -> &'static str {
    match err {
        StackError::Validation { .. } => "validation_failed",
        StackError::ObjectNotFound(_) => "object_not_found",
        StackError::MigrationRequired => "migration_required",
        StackError::StoreClosed => "store_closed",
        other if other.is_constraint_violation() => "constraint_violation",
        _ => "commit_failed",
    }
}
