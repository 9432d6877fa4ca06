// ABOUTME: Lifecycle state model for task runs and flow runs
// ABOUTME: Defines legal transitions, derived predicates, and child-state reduction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A point in a task run's or flow run's lifecycle. States are immutable
/// values: a transition always constructs a fresh `State`, never mutates one
/// in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum State {
    Scheduled,
    Pending,
    Running,
    Success {
        result: Value,
    },
    Failed {
        message: String,
    },
    Skipped,
    /// Waiting out a retry delay. `run_count` is the number of attempts that
    /// have already executed; the next attempt is `run_count + 1`.
    Retrying {
        start_time: DateTime<Utc>,
        run_count: u32,
    },
    TimedOut {
        message: String,
    },
    TriggerFailed {
        message: String,
    },
    /// A mapped parent after expansion; its effective terminal status is
    /// derived from its children via [`reduce_children`], never persisted.
    Mapped {
        children: u32,
    },
    Cancelled,
}

#[derive(Error, Debug, PartialEq)]
#[error("illegal transition from {from} to {to}")]
pub struct IllegalTransition {
    pub from: String,
    pub to: String,
}

impl State {
    pub fn success(result: Value) -> Self {
        State::Success { result }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        State::Failed {
            message: message.into(),
        }
    }

    /// Terminal success. `Skipped` and `Mapped` count as success-like: a
    /// skipped task satisfies its downstream dependencies, and a mapped
    /// parent's real outcome lives in its children.
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            State::Success { .. } | State::Skipped | State::Mapped { .. }
        )
    }

    /// Terminal failure-like: `Failed`, `TimedOut`, or `TriggerFailed`.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            State::Failed { .. } | State::TimedOut { .. } | State::TriggerFailed { .. }
        )
    }

    /// Still waiting to run: `Scheduled`, `Pending`, or `Retrying`.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            State::Scheduled | State::Pending | State::Retrying { .. }
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, State::Running)
    }

    /// No further lifecycle step will be taken from this state.
    pub fn is_finished(&self) -> bool {
        !self.is_pending() && !self.is_running()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, State::Mapped { .. })
    }

    /// The result payload, present only for `Success`.
    pub fn result(&self) -> Option<&Value> {
        match self {
            State::Success { result } => Some(result),
            _ => None,
        }
    }

    /// The reason carried by a failure-like state.
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            State::Failed { message }
            | State::TimedOut { message }
            | State::TriggerFailed { message } => Some(message),
            _ => None,
        }
    }

    /// Validate that `next` is a legal successor of `self`. Terminal states
    /// are sinks: no transition leaves one. Retry intent is carried by the
    /// pending-class `Retrying` state, so `Retrying -> Running` is ordinary.
    /// A pending-class run may fail without ever running (a trigger
    /// rejection, or a mapped expansion with nothing to map over).
    pub fn validate_transition(&self, next: &State) -> Result<(), IllegalTransition> {
        let legal = match self {
            State::Scheduled | State::Pending => matches!(
                next,
                State::Running
                    | State::TriggerFailed { .. }
                    | State::Failed { .. }
                    | State::Skipped
                    | State::Mapped { .. }
                    | State::Cancelled
            ),
            State::Retrying { .. } => matches!(
                next,
                State::Running | State::TriggerFailed { .. } | State::Cancelled
            ),
            State::Running => matches!(
                next,
                State::Success { .. }
                    | State::Failed { .. }
                    | State::TimedOut { .. }
                    | State::Retrying { .. }
                    | State::Cancelled
            ),
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            Err(IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// Fold sibling states into one aggregate: `Failed` if any child is
/// failure-like (the first such child's reason wins), `Success` carrying the
/// index-ordered array of child results if every child is success-like, and
/// `Running` while any child is still in progress.
pub fn reduce_children(states: &[State]) -> State {
    if let Some(failed) = states.iter().find(|s| s.is_failed()) {
        return State::Failed {
            message: failed
                .failure_message()
                .unwrap_or("child task run failed")
                .to_string(),
        };
    }

    if states.iter().all(State::is_successful) {
        let results = states
            .iter()
            .map(|s| s.result().cloned().unwrap_or(Value::Null))
            .collect();
        return State::Success {
            result: Value::Array(results),
        };
    }

    State::Running
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Scheduled => "scheduled",
            State::Pending => "pending",
            State::Running => "running",
            State::Success { .. } => "success",
            State::Failed { .. } => "failed",
            State::Skipped => "skipped",
            State::Retrying { .. } => "retrying",
            State::TimedOut { .. } => "timed_out",
            State::TriggerFailed { .. } => "trigger_failed",
            State::Mapped { .. } => "mapped",
            State::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}
