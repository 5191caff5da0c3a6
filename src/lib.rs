//! Deterministic, replay-driven workflow orchestration core.
//!
//! duraflow records an append-only log of [`Event`]s per workflow instance and
//! re-executes (replays) the orchestrator function against that log to
//! reconstruct its state after every completion, restart, or control command.
//! The crate provides:
//!
//! - Public data model: [`Event`], [`Action`]
//! - [`OrchestrationContext`] with [`futures::ActivityFuture`] as the single
//!   suspension point of the strictly sequential programming model
//! - [`run_turn`]: the single-poll replay driver
//! - [`runtime`]: dispatchers that execute activities with bounded retry and
//!   persist history via a [`providers::HistoryStore`]
//! - [`client`]: control-plane operations (start, suspend, resume, rewind,
//!   terminate) and the submit-or-check wait protocol
//! - [`api`]: the HTTP create/check endpoint

use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod api;
pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::ActivityFuture;
pub use error::{ActivityError, ClientError, StoreError, WaitError};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{OrchestrationHandler, Runtime, RuntimeOptions, RuntimeStatus};

/// Message prefix used for replay-divergence failures so callers can tell
/// them apart from ordinary activity errors.
pub const NONDETERMINISM_PREFIX: &str = "nondeterministic:";

// Internal JSON codec for the typed helpers. Payloads travel as strings on
// the wire; a JSON string value round-trips as its raw content.
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
        }
    }
}

/// Append-only history entries persisted by a provider and consumed during
/// replay. Activity events carry a correlation `id` assigned in call-site
/// ordinal order; replay re-pairs scheduling and completion by that id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance began executing the named orchestrator with the given input.
    OrchestratorStarted { name: String, input: String },
    /// An activity invocation was scheduled.
    ActivityScheduled { id: u64, name: String, input: String },
    /// An activity finished successfully.
    ActivityCompleted { id: u64, result: String },
    /// An activity failed terminally (after any dispatcher retries).
    ActivityFailed { id: u64, error: String },
    /// Orchestrator ran to completion with a final output.
    OrchestratorCompleted { output: String },
    /// Orchestrator failed terminally.
    OrchestratorFailed { error: String },
    /// Control: pause replay for this instance.
    SuspendRequested { reason: String },
    /// Control: resume a suspended instance.
    ResumeRequested,
    /// Control: re-drive a failed instance from its last successful step.
    RewindRequested,
    /// Control: stop the instance unconditionally.
    TerminateRequested { reason: String },
    /// Orchestrator restarted as a fresh execution seeded with new input.
    OrchestratorContinuedAsNew { input: String },
}

/// Declarative decisions produced by one replay turn. The runtime
/// materializes these into work items and history events; the turn itself
/// has no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Invoke an activity out of process.
    CallActivity { id: u64, name: String, input: String },
    /// End this execution and start a new one with the given input.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_correlation_id: u64,
    pub(crate) claimed_schedule_ids: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
    pub(crate) turn_index: u64,
    pub(crate) logging_enabled_this_poll: bool,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut max_id = 0u64;
        for ev in &history {
            match ev {
                Event::ActivityScheduled { id, .. }
                | Event::ActivityCompleted { id, .. }
                | Event::ActivityFailed { id, .. } => max_id = max_id.max(*id),
                _ => {}
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            claimed_schedule_ids: HashSet::new(),
            nondeterminism_error: None,
            turn_index: 0,
            logging_enabled_this_poll: false,
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        // A new decision means this poll is making forward progress.
        self.logging_enabled_this_poll = true;
        self.actions.push(a);
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling activities and
/// replay-safe helpers. Cheap to clone; all clones share one turn state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule an activity and return the future correlated to it. During
    /// replay the call adopts the `ActivityScheduled` event recorded at the
    /// same ordinal position; a name/input mismatch there is a fatal
    /// nondeterminism error for the instance.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        ActivityFuture {
            name: name.into(),
            input: input.into(),
            claimed_id: Cell::new(None),
            ctx: self.clone(),
        }
    }

    /// Typed helper: serializes the input; pair with
    /// [`ActivityFuture::into_typed`] for the result.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> ActivityFuture {
        let payload = codec::encode(input).expect("encode activity input");
        self.schedule_activity(name, payload)
    }

    /// End the current execution and restart with fresh history seeded by
    /// `input`. Takes effect when the turn finishes.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let input: String = input.into();
        inner.record_action(Action::ContinueAsNew { input });
    }

    /// Typed variant of [`continue_as_new`](Self::continue_as_new).
    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) {
        let payload = codec::encode(input).expect("encode continue-as-new input");
        self.continue_as_new(payload);
    }

    /// Zero-based replay turn counter assigned by the runtime, for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Whether this poll made forward progress. The `durable_*!` log macros
    /// gate on this so replayed code stays silent.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    // Safety: fut is a local that is never moved after this call.
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Everything one replay turn produced: the history including any newly
/// appended `ActivityScheduled` events, the pure decisions, the orchestrator
/// output if it ran to completion, a divergence error if replay did not
/// match recorded history, and the scheduling ids the orchestrator claimed.
#[derive(Debug)]
pub struct TurnResult<O> {
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub output: Option<O>,
    pub nondeterminism: Option<String>,
    pub claimed_ids: HashSet<u64>,
}

/// Poll the orchestrator once against `history`. Replays recorded events up
/// to the first activity whose result is absent (the next suspension point)
/// or to completion; never blocks.
pub fn run_turn<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let mut fut = orchestrator(ctx.clone());
    let output = match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            Some(out)
        }
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let inner = ctx.inner.lock().unwrap();
    TurnResult {
        history: inner.history.clone(),
        actions,
        output,
        nondeterminism: inner.nondeterminism_error.clone(),
        claimed_ids: inner.claimed_schedule_ids.clone(),
    }
}
