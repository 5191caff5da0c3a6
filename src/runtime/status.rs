use std::collections::HashSet;

use crate::Event;

/// High-level instance status. Always derived by folding history, never
/// stored directly; the event sequence is the sole source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    NotFound,
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { error: String },
    Terminated,
    ContinuedAsNew { input: String },
}

impl RuntimeStatus {
    /// Terminal statuses end the instance: `Completed`, `Failed` (unless
    /// rewound), `Terminated`. `ContinuedAsNew` ends one execution but the
    /// instance rolls over to a fresh one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed { .. } | RuntimeStatus::Failed { .. } | RuntimeStatus::Terminated
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuntimeStatus::NotFound => "NotFound",
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Suspended => "Suspended",
            RuntimeStatus::Completed { .. } => "Completed",
            RuntimeStatus::Failed { .. } => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::ContinuedAsNew { .. } => "ContinuedAsNew",
        }
    }

    /// Fold the transition table over an execution's history. Events that
    /// would be illegal transitions for the current status leave it
    /// unchanged; the runtime refuses to append those in the first place,
    /// and the fold stays total either way.
    pub fn fold(events: &[Event]) -> RuntimeStatus {
        let mut status = RuntimeStatus::Pending;
        // Resume returns the instance to whatever state suspension parked.
        let mut pre_suspend: Option<RuntimeStatus> = None;
        for e in events {
            match e {
                Event::OrchestratorStarted { .. } => match status {
                    RuntimeStatus::Pending => status = RuntimeStatus::Running,
                    RuntimeStatus::Suspended => {
                        if matches!(pre_suspend, Some(RuntimeStatus::Pending)) {
                            pre_suspend = Some(RuntimeStatus::Running);
                        }
                    }
                    _ => {}
                },
                Event::OrchestratorCompleted { output } => {
                    if matches!(status, RuntimeStatus::Running) {
                        status = RuntimeStatus::Completed { output: output.clone() };
                    }
                }
                Event::OrchestratorFailed { error } => {
                    if matches!(status, RuntimeStatus::Running) {
                        status = RuntimeStatus::Failed { error: error.clone() };
                    }
                }
                Event::OrchestratorContinuedAsNew { input } => {
                    if matches!(status, RuntimeStatus::Running) {
                        status = RuntimeStatus::ContinuedAsNew { input: input.clone() };
                    }
                }
                Event::SuspendRequested { .. } => {
                    if matches!(status, RuntimeStatus::Running | RuntimeStatus::Pending) {
                        pre_suspend = Some(status.clone());
                        status = RuntimeStatus::Suspended;
                    }
                }
                Event::ResumeRequested => {
                    if matches!(status, RuntimeStatus::Suspended) {
                        status = pre_suspend.take().unwrap_or(RuntimeStatus::Running);
                    }
                }
                Event::RewindRequested => {
                    if matches!(status, RuntimeStatus::Failed { .. }) {
                        status = RuntimeStatus::Running;
                    }
                }
                Event::TerminateRequested { .. } => {
                    if !status.is_terminal() {
                        status = RuntimeStatus::Terminated;
                    }
                }
                Event::ActivityScheduled { .. } | Event::ActivityCompleted { .. } | Event::ActivityFailed { .. } => {}
            }
        }
        status
    }
}

/// Project raw history into the view replay and dispatch operate on: each
/// `RewindRequested` masks the preceding `OrchestratorFailed` and any
/// `ActivityFailed` whose activity never completed, so the failed step reads
/// as unresolved and gets re-driven. Raw history stays append-only.
pub fn effective_history(events: &[Event]) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    for e in events {
        match e {
            Event::RewindRequested => {
                let completed: HashSet<u64> = out
                    .iter()
                    .filter_map(|e| match e {
                        Event::ActivityCompleted { id, .. } => Some(*id),
                        _ => None,
                    })
                    .collect();
                out.retain(|e| match e {
                    Event::OrchestratorFailed { .. } => false,
                    Event::ActivityFailed { id, .. } => completed.contains(id),
                    _ => true,
                });
                out.push(Event::RewindRequested);
            }
            _ => out.push(e.clone()),
        }
    }
    out
}

/// Scheduled activities with no terminal completion in the given (effective)
/// history, in schedule order.
pub fn unresolved_activities(events: &[Event]) -> Vec<(u64, String, String)> {
    let resolved: HashSet<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    events
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, name, input } if !resolved.contains(id) => {
                Some((*id, name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Name and input recorded by the execution's `OrchestratorStarted` event.
pub fn descriptor(events: &[Event]) -> Option<(String, String)> {
    events.iter().find_map(|e| match e {
        Event::OrchestratorStarted { name, input } => Some((name.clone(), input.clone())),
        _ => None,
    })
}

/// Detect a scheduled activity the orchestrator never awaited this turn:
/// replay divergence from code that schedules less than history recorded.
pub fn first_unawaited_schedule(events: &[Event], claimed: &HashSet<u64>) -> Option<String> {
    events.iter().find_map(|e| match e {
        Event::ActivityScheduled { id, name, .. } if !claimed.contains(id) => Some(format!(
            "nondeterministic: recorded ActivityScheduled('{name}') id={id} was not awaited by the orchestrator"
        )),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Event {
        Event::OrchestratorStarted {
            name: "W".into(),
            input: "{}".into(),
        }
    }

    #[test]
    fn fold_walks_the_happy_path() {
        let mut h = vec![started()];
        assert_eq!(RuntimeStatus::fold(&h), RuntimeStatus::Running);
        h.push(Event::OrchestratorCompleted { output: "out".into() });
        assert_eq!(RuntimeStatus::fold(&h), RuntimeStatus::Completed { output: "out".into() });
    }

    #[test]
    fn suspend_resume_round_trips_to_prior_state() {
        let h = vec![
            started(),
            Event::SuspendRequested { reason: "Timeout".into() },
            Event::ResumeRequested,
        ];
        assert_eq!(RuntimeStatus::fold(&h), RuntimeStatus::Running);
    }

    #[test]
    fn rewind_reopens_a_failed_instance() {
        let h = vec![
            started(),
            Event::ActivityScheduled { id: 1, name: "A".into(), input: String::new() },
            Event::ActivityFailed { id: 1, error: "boom".into() },
            Event::OrchestratorFailed { error: "boom".into() },
            Event::RewindRequested,
        ];
        assert_eq!(RuntimeStatus::fold(&h), RuntimeStatus::Running);
        let eff = effective_history(&h);
        assert!(!eff.iter().any(|e| matches!(e, Event::ActivityFailed { .. })));
        assert_eq!(unresolved_activities(&eff), vec![(1, "A".into(), String::new())]);
    }

    #[test]
    fn illegal_transitions_leave_status_unchanged() {
        // Resume without a suspension, rewind without a failure.
        let h = vec![started(), Event::ResumeRequested, Event::RewindRequested];
        assert_eq!(RuntimeStatus::fold(&h), RuntimeStatus::Running);
        // Terminate is unconditional from any non-terminal state...
        let mut h2 = vec![started(), Event::TerminateRequested { reason: "op".into() }];
        assert_eq!(RuntimeStatus::fold(&h2), RuntimeStatus::Terminated);
        // ...but never resurrects a completed instance.
        h2 = vec![
            started(),
            Event::OrchestratorCompleted { output: "out".into() },
            Event::TerminateRequested { reason: "op".into() },
        ];
        assert_eq!(RuntimeStatus::fold(&h2), RuntimeStatus::Completed { output: "out".into() });
    }

    #[test]
    fn rewind_keeps_activities_that_completed_before_the_failure() {
        let h = vec![
            started(),
            Event::ActivityScheduled { id: 1, name: "A".into(), input: String::new() },
            Event::ActivityCompleted { id: 1, result: "r1".into() },
            Event::ActivityScheduled { id: 2, name: "B".into(), input: String::new() },
            Event::ActivityFailed { id: 2, error: "boom".into() },
            Event::OrchestratorFailed { error: "boom".into() },
            Event::RewindRequested,
        ];
        let eff = effective_history(&h);
        assert!(eff.iter().any(|e| matches!(e, Event::ActivityCompleted { id: 1, .. })));
        assert_eq!(unresolved_activities(&eff), vec![(2, "B".into(), String::new())]);
    }
}
