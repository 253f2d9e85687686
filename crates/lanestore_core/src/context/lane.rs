//! Serialized worker lanes.
//!
//! # Responsibility
//! - Own one piece of state on a dedicated thread.
//! - Run submitted jobs one at a time, in submission order.
//! - Apply incoming change sets before any queued job.
//!
//! # Invariants
//! - State is only touched on the lane thread.
//! - Pending merges are drained before every job, in commit order.
//! - A blocking call targeting the calling lane fails instead of waiting.

use crate::context::change_set::ChangeSet;
use crate::context::ContextKind;
use crate::error::{StackError, StackResult};
use crate::model::instance::ContextId;
use log::{error, info};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// State owned by a lane.
pub(crate) trait LaneState: Send + 'static {
    fn merge(&mut self, changes: &ChangeSet);
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum LaneMessage<S> {
    Run(Job<S>),
    /// Wakes the lane so it drains the merge queue.
    MergeReady,
    Shutdown,
}

thread_local! {
    static CURRENT_LANE: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Lane the calling thread belongs to, if any.
pub(crate) fn current_lane() -> Option<ContextId> {
    CURRENT_LANE.with(Cell::get)
}

pub(crate) struct Lane<S: LaneState> {
    id: ContextId,
    kind: ContextKind,
    jobs: Sender<LaneMessage<S>>,
    merges: Sender<Arc<ChangeSet>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: LaneState> Lane<S> {
    pub(crate) fn spawn(kind: ContextKind, id: ContextId, state: S) -> StackResult<Self> {
        let (jobs, job_queue) = mpsc::channel();
        let (merges, merge_queue) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("lanestore-{kind}"))
            .spawn(move || run_lane(id, kind, state, job_queue, merge_queue))
            .map_err(StackError::LaneSpawn)?;

        Ok(Self {
            id,
            kind,
            jobs,
            merges,
            handle: Some(handle),
        })
    }

    /// Queues `job` and returns immediately.
    pub(crate) fn perform(&self, job: impl FnOnce(&mut S) + Send + 'static) -> StackResult<()> {
        self.jobs
            .send(LaneMessage::Run(Box::new(job)))
            .map_err(|_| StackError::LaneClosed(self.kind))
    }

    /// Queues `job` and blocks until it has run.
    ///
    /// # Errors
    /// - `ReentrantCall` when called from this lane's own thread.
    /// - `LaneClosed` when the lane stopped before answering.
    pub(crate) fn perform_and_wait<T: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> T + Send + 'static,
    ) -> StackResult<T> {
        if current_lane() == Some(self.id) {
            return Err(StackError::ReentrantCall(self.kind));
        }

        let (reply, answer) = mpsc::sync_channel(1);
        self.perform(move |state| {
            // The caller is blocked on `answer`, so the receiver is alive.
            let _ = reply.send(job(state));
        })?;
        answer.recv().map_err(|_| StackError::LaneClosed(self.kind))
    }

    /// Callback that forwards change sets into this lane's merge queue.
    ///
    /// Returns `false` once the lane has stopped.
    pub(crate) fn merge_subscriber(&self) -> impl Fn(&Arc<ChangeSet>) -> bool + Send + 'static {
        let merges = self.merges.clone();
        let wake = self.jobs.clone();
        move |changes| {
            merges.send(Arc::clone(changes)).is_ok() && wake.send(LaneMessage::MergeReady).is_ok()
        }
    }
}

impl<S: LaneState> Drop for Lane<S> {
    fn drop(&mut self) {
        let _ = self.jobs.send(LaneMessage::Shutdown);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if current_lane() == Some(self.id) {
            return;
        }
        if handle.join().is_err() {
            error!(
                "event=lane_stop module=context status=error kind={} context={} error_code=lane_panicked",
                self.kind, self.id
            );
        }
    }
}

fn run_lane<S: LaneState>(
    id: ContextId,
    kind: ContextKind,
    mut state: S,
    jobs: Receiver<LaneMessage<S>>,
    merges: Receiver<Arc<ChangeSet>>,
) {
    CURRENT_LANE.with(|lane| lane.set(Some(id)));
    info!("event=lane_start module=context status=ok kind={kind} context={id}");

    let mut processed: u64 = 0;
    while let Ok(message) = jobs.recv() {
        for changes in merges.try_iter() {
            state.merge(&changes);
        }

        match message {
            LaneMessage::Run(job) => {
                processed += 1;
                if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                    error!(
                        "event=lane_job module=context status=error kind={kind} context={id} error_code=job_panicked"
                    );
                }
            }
            LaneMessage::MergeReady => {}
            LaneMessage::Shutdown => break,
        }
    }

    info!("event=lane_stop module=context status=ok kind={kind} context={id} jobs={processed}");
}
