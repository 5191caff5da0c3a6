use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Future for one scheduled activity, resolved from history during replay.
///
/// Polling performs two steps:
/// 1. Claim the next unclaimed `ActivityScheduled` event in history order.
///    The ordinal position must carry the same name and input the
///    orchestrator is requesting now; anything else records a
///    nondeterminism error and the turn never resolves.
/// 2. Resolve from the `ActivityCompleted`/`ActivityFailed` event matched by
///    the claimed correlation id, or stay pending: this is the instance's
///    suspension point.
pub struct ActivityFuture {
    pub(crate) name: String,
    pub(crate) input: String,
    pub(crate) claimed_id: Cell<Option<u64>>,
    pub(crate) ctx: OrchestrationContext,
}

enum ClaimOutcome {
    Adopted(u64),
    Mismatch(String),
    New,
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.ctx.inner.lock().unwrap();
        let inner = &mut *guard;

        if this.claimed_id.get().is_none() {
            let mut outcome = ClaimOutcome::New;
            for e in &inner.history {
                if let Event::ActivityScheduled { id, name, input } = e {
                    if inner.claimed_schedule_ids.contains(id) {
                        continue;
                    }
                    if name != &this.name || input != &this.input {
                        outcome = ClaimOutcome::Mismatch(format!(
                            "nondeterministic: schedule mismatch at ordinal {id}: history recorded \
                             ActivityScheduled('{name}') but orchestrator requested ActivityScheduled('{}')",
                            this.name
                        ));
                    } else {
                        outcome = ClaimOutcome::Adopted(*id);
                    }
                    break;
                }
            }
            let id = match outcome {
                ClaimOutcome::Adopted(id) => id,
                ClaimOutcome::Mismatch(msg) => {
                    inner.nondeterminism_error = Some(msg);
                    return Poll::Pending;
                }
                ClaimOutcome::New => {
                    let id = inner.next_id();
                    inner.history.push(Event::ActivityScheduled {
                        id,
                        name: this.name.clone(),
                        input: this.input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id,
                        name: this.name.clone(),
                        input: this.input.clone(),
                    });
                    id
                }
            };
            inner.claimed_schedule_ids.insert(id);
            this.claimed_id.set(Some(id));
        }

        let our_id = this.claimed_id.get().expect("claimed above");
        for e in &inner.history {
            match e {
                Event::ActivityCompleted { id, result } if *id == our_id => {
                    return Poll::Ready(Ok(result.clone()));
                }
                Event::ActivityFailed { id, error } if *id == our_id => {
                    return Poll::Ready(Err(error.clone()));
                }
                _ => {}
            }
        }
        Poll::Pending
    }
}

impl ActivityFuture {
    /// Await the activity result decoded to a typed value.
    pub fn into_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> {
        async move {
            let raw = self.await?;
            crate::codec::decode::<Out>(&raw)
        }
    }
}

// poll() projects &mut self freely into the inner cells; keep that sound.
const fn assert_unpin<T: Unpin>() {}
const _: () = assert_unpin::<ActivityFuture>();
