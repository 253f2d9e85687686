//! Execution contexts: a working set bound to a serialized lane.
//!
//! # Responsibility
//! - Spawn the lane that owns a context's `ContextScope`.
//! - Marshal calls onto that lane, blocking or fire-and-forget.
//! - Publish commit events and let other contexts subscribe to them.
//!
//! # Invariants
//! - A context's working set is only reachable from its own lane.
//! - Commit events reach each subscriber in commit order.
//!
//! # See also
//! - `stack` for the façade routing operations to the right context.

mod change_set;
mod lane;
mod scope;

pub use change_set::ChangeSet;
pub use scope::ContextScope;

use crate::db::StoreHandle;
use crate::error::StackResult;
use crate::model::instance::ContextId;
use crate::model::registry::EntityRegistry;
use change_set::CommitBus;
use lane::Lane;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Background lane; default target of mutations.
    Write,
    /// Foreground lane; default target of reads. Merges write commits.
    Read,
}

impl ContextKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

impl Display for ContextKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One execution context and its lane.
pub struct Context {
    id: ContextId,
    kind: ContextKind,
    lane: Lane<ContextScope>,
    bus: Arc<CommitBus>,
}

impl Context {
    pub(crate) fn spawn(
        kind: ContextKind,
        store: StoreHandle,
        registry: Arc<EntityRegistry>,
    ) -> StackResult<Self> {
        let id = ContextId::next();
        let bus = Arc::new(CommitBus::default());
        let scope = ContextScope::new(id, kind, store, registry, Arc::clone(&bus));
        let lane = Lane::spawn(kind, id, scope)?;
        Ok(Self {
            id,
            kind,
            lane,
            bus,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Runs `job` on this context's lane without waiting.
    pub fn perform(&self, job: impl FnOnce(&mut ContextScope) + Send + 'static) -> StackResult<()> {
        self.lane.perform(job)
    }

    /// Runs `job` on this context's lane and returns its result.
    ///
    /// # Errors
    /// - `ReentrantCall` when called from this context's own lane.
    /// - `LaneClosed` when the lane is gone.
    pub fn perform_and_wait<T: Send + 'static>(
        &self,
        job: impl FnOnce(&mut ContextScope) -> T + Send + 'static,
    ) -> StackResult<T> {
        self.lane.perform_and_wait(job)
    }

    /// Commits on this context's lane and hands the outcome to `completion`
    /// there.
    pub fn commit_async(
        &self,
        completion: impl FnOnce(StackResult<bool>) + Send + 'static,
    ) -> StackResult<()> {
        self.perform(move |scope| completion(scope.commit()))
    }

    /// Receiver of every change set this context commits from now on.
    pub fn subscribe(&self) -> Receiver<Arc<ChangeSet>> {
        self.bus.channel()
    }

    /// Makes this context merge every commit of `source`.
    pub(crate) fn observe(&self, source: &Context) {
        source.bus.subscribe(self.lane.merge_subscriber());
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
