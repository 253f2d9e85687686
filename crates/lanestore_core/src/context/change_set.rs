//! Commit events and their delivery.

use crate::context::ContextKind;
use crate::model::instance::{ContextId, EntityInstance, ObjectId};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// Payload of one commit event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Store-wide commit sequence number; strictly increasing.
    pub sequence: u64,
    pub origin: ContextKind,
    pub origin_context: ContextId,
    /// Snapshots of inserted objects, in insertion order.
    pub inserted: Vec<EntityInstance>,
    /// Snapshots of updated objects.
    pub updated: Vec<EntityInstance>,
    /// Ids of removed objects, including every id removed by a delete-all.
    pub deleted: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn changed_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.inserted
            .iter()
            .chain(&self.updated)
            .map(EntityInstance::id)
            .chain(self.deleted.iter().copied())
    }
}

type Subscriber = Box<dyn Fn(&Arc<ChangeSet>) -> bool + Send>;

/// Fan-out of one context's commit events.
///
/// Subscribers return `false` once their receiving end is gone and are
/// dropped on the next publish.
#[derive(Default)]
pub(crate) struct CommitBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl CommitBus {
    pub(crate) fn subscribe(&self, subscriber: impl Fn(&Arc<ChangeSet>) -> bool + Send + 'static) {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    pub(crate) fn channel(&self) -> Receiver<Arc<ChangeSet>> {
        let (sender, receiver) = mpsc::channel();
        self.subscribe(move |changes| sender.send(Arc::clone(changes)).is_ok());
        receiver
    }

    /// Delivers `changes` to every live subscriber; returns how many remain.
    pub(crate) fn publish(&self, changes: &Arc<ChangeSet>) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber(changes));
        subscribers.len()
    }
}
