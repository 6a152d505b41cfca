//! In-process listener registry for job lifecycle hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::application::job::Job;
use crate::models::{RusqueError, RusqueResult};

/// Named lifecycle hooks fired by the producer, worker and job pipeline.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Event {
    /// Fired by the producer before an envelope is pushed. A listener may
    /// return [`HookFlow::DontPerform`] to abort the enqueue.
    BeforeEnqueue,

    /// Fired by the producer after an envelope has been pushed.
    AfterEnqueue,

    /// Fired once per worker at startup, before the first job.
    BeforeFirstFork,

    /// Fired by the worker before each job's child execution is started.
    BeforeFork,

    /// Fired inside the child execution, before the job performs.
    AfterFork,

    /// Fired by the job before its handler runs. A listener may return
    /// [`HookFlow::DontPerform`] to skip the handler cleanly.
    BeforePerform,

    /// Fired by the job after its handler ran successfully.
    AfterPerform,

    /// Fired when a job fails, before the failure record is persisted.
    OnFailure,
}

/// Outcome a listener reports back to the dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookFlow {
    /// Carry on with the pipeline.
    Continue,

    /// Skip the guarded step. Honoured by `BeforePerform` (skip the handler,
    /// job is neither processed nor failed) and `BeforeEnqueue` (abort the
    /// push); ignored elsewhere.
    DontPerform,
}

/// Data passed to listeners, varying per event.
#[derive(Debug)]
pub enum HookData<'a> {
    /// Payload for `BeforeEnqueue` / `AfterEnqueue`.
    Enqueue {
        class: &'a str,
        args: &'a Value,
        queue: &'a str,
    },

    /// Payload for `BeforeFirstFork`: the worker's identity.
    Worker { id: &'a str },

    /// Payload for the per-job hooks.
    Job(&'a Job),

    /// Payload for `OnFailure`.
    Failure {
        error: &'a RusqueError,
        job: &'a Job,
    },
}

/// A registered hook listener. Errors propagate to the caller and, for the
/// per-job hooks, fail the job.
pub type Listener = Arc<dyn Fn(&HookData) -> RusqueResult<HookFlow> + Send + Sync>;

/// Maps event names to ordered listener lists.
///
/// Listeners run synchronously, in insertion order, on the triggering task.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<Event, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for given event.
    ///
    /// The caller keeps a clone of the `Arc` if it intends to remove the
    /// listener later.
    pub fn listen(&self, event: Event, listener: Listener) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.entry(event).or_default().push(listener);
    }

    /// Remove the first listener registered for given event that is the same
    /// allocation as `listener`.
    pub fn stop_listening(&self, event: Event, listener: &Listener) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(registered) = listeners.get_mut(&event) {
            if let Some(pos) = registered.iter().position(|l| Arc::ptr_eq(l, listener)) {
                registered.remove(pos);
            }
        }
    }

    /// Invoke every listener registered for given event, in insertion order.
    ///
    /// Stops at the first listener that returns [`HookFlow::DontPerform`] or
    /// an error; later listeners are not invoked.
    pub fn trigger(&self, event: Event, data: &HookData) -> RusqueResult<HookFlow> {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(&event) {
                Some(registered) => registered.clone(),
                None => return Ok(HookFlow::Continue),
            }
        };

        for listener in snapshot {
            if listener(data)? == HookFlow::DontPerform {
                return Ok(HookFlow::DontPerform);
            }
        }
        Ok(HookFlow::Continue)
    }

    /// Drop every registered listener.
    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }
}
