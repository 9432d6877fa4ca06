// ABOUTME: Dynamic mapping engine expanding a mapped task over upstream collections
// ABOUTME: Transitions the parent to Mapped and advances per-index child runs

use futures::future::join_all;
use tracing::{debug, info};

use super::error::{EngineError, Result};
use super::pool::ExecutionPool;
use super::sync::{Proposal, StateSync, TaskRunHandle};
use super::task_runner::TaskRunner;
use crate::flow::Task;
use crate::state::State;

/// What one upstream edge contributes to a mapped task, resolved by the flow
/// runner from the upstream's recorded state and, for a mapped upstream, its
/// children.
#[derive(Debug, Clone)]
pub enum EdgeView {
    /// Unmapped edge. The upstream's whole result reaches every child.
    Plain(State),
    /// Mapped edge resolved to one state per map index.
    PerIndex(Vec<State>),
    /// Mapped edge whose upstream finished without producing a collection.
    Blocked(State),
}

/// The parent handle and the child handles touched by one expansion step.
#[derive(Debug)]
pub struct MapOutcome {
    pub parent: State,
    pub children: Vec<TaskRunHandle>,
}

pub struct Mapper<'a> {
    sync: &'a StateSync,
    pool: &'a ExecutionPool,
}

impl<'a> Mapper<'a> {
    pub fn new(sync: &'a StateSync, pool: &'a ExecutionPool) -> Self {
        Self { sync, pool }
    }

    /// Advance a mapped task by one step: expand the parent if it is still
    /// pending, then give every child whose per-index dependencies are
    /// finished one lifecycle step. `raw_upstream` and `views` are aligned
    /// with the task's upstream edges in edge order.
    pub async fn run_mapped(
        &self,
        task: &Task,
        parent: &mut TaskRunHandle,
        raw_upstream: &[State],
        views: &[EdgeView],
    ) -> Result<MapOutcome> {
        if parent.state.is_finished() && !parent.state.is_mapped() {
            debug!(task_id = %task.id, state = %parent.state, "mapped parent already finished");
            return Ok(MapOutcome {
                parent: parent.state.clone(),
                children: Vec::new(),
            });
        }

        if parent.state.is_running() {
            debug!(task_id = %task.id, "mapped parent owned by another executor");
            return Ok(MapOutcome {
                parent: parent.state.clone(),
                children: Vec::new(),
            });
        }

        if parent.state.is_pending() {
            // the parent gates on the raw upstream states, so a mapped
            // upstream still counts as finished while its children retry
            if !task.trigger.evaluate(raw_upstream) {
                let message = format!("trigger '{}' rejected upstream states", task.trigger);
                info!(task_id = %task.id, "{message}");
                self.sync
                    .propose_task(parent, State::TriggerFailed { message })
                    .await?;
                return Ok(MapOutcome {
                    parent: parent.state.clone(),
                    children: Vec::new(),
                });
            }

            let children = match plan_expansion(&task.id, views)? {
                Expansion::Width(children) => children,
                Expansion::Blocked(state) => {
                    // a failed or non-collection upstream is a runtime
                    // outcome for this run, not a graph problem
                    let message =
                        format!("upstream finished in state {state}, no collection to map over");
                    info!(task_id = %task.id, "{message}");
                    self.sync
                        .propose_task(parent, State::Failed { message })
                        .await?;
                    return Ok(MapOutcome {
                        parent: parent.state.clone(),
                        children: Vec::new(),
                    });
                }
            };
            info!(task_id = %task.id, children, "expanding mapped task");
            if self.sync.propose_task(parent, State::Mapped { children }).await?
                == Proposal::Superseded
                && !parent.state.is_mapped()
            {
                return Ok(MapOutcome {
                    parent: parent.state.clone(),
                    children: Vec::new(),
                });
            }
        }

        // the recorded width is authoritative on a resumed pass
        let width = match &parent.state {
            State::Mapped { children } => *children,
            other => {
                return Err(EngineError::graph(format!(
                    "mapped parent '{}' in unexpected state {other}",
                    task.id
                )))
            }
        };

        let steps = (0..width).map(|index| self.run_child(task, parent, views, index));
        let children = join_all(steps)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        Ok(MapOutcome {
            parent: parent.state.clone(),
            children,
        })
    }

    /// One lifecycle step for the child at `index`. A child whose per-index
    /// dependencies are not all finished is left untouched.
    async fn run_child(
        &self,
        task: &Task,
        parent: &TaskRunHandle,
        views: &[EdgeView],
        index: u32,
    ) -> Result<TaskRunHandle> {
        let mut child = self
            .sync
            .load_task(&parent.flow_run_id, &task.id, Some(index))
            .await?;

        let mut upstream = Vec::with_capacity(views.len());
        for view in views {
            let state = match view {
                EdgeView::Plain(state) | EdgeView::Blocked(state) => state.clone(),
                EdgeView::PerIndex(states) => states.get(index as usize).cloned().ok_or_else(
                    || {
                        EngineError::graph(format!(
                            "mapped task '{}' has no upstream child at index {index}",
                            task.id
                        ))
                    },
                )?,
            };
            upstream.push(state);
        }

        if upstream.iter().any(|s| !s.is_finished()) {
            debug!(task_id = %task.id, index, "child dependencies not finished yet");
            return Ok(child);
        }

        let runner = TaskRunner::new(self.sync, self.pool);
        runner.run_one(task, &mut child, &upstream).await?;
        Ok(child)
    }
}

/// How an expansion can proceed: `Width` children, or blocked on a mapped
/// upstream that finished without a collection.
enum Expansion {
    Width(u32),
    Blocked(State),
}

/// The number of children an expansion produces: the common length of every
/// mapped-edge collection feeding the task. Disagreeing lengths are a graph
/// problem; a blocked upstream is reported to the caller to classify.
fn plan_expansion(task_id: &str, views: &[EdgeView]) -> Result<Expansion> {
    let mut width: Option<usize> = None;
    for view in views {
        match view {
            EdgeView::Plain(_) => {}
            EdgeView::PerIndex(states) => match width {
                None => width = Some(states.len()),
                Some(w) if w == states.len() => {}
                Some(w) => {
                    return Err(EngineError::graph(format!(
                        "mapped task '{task_id}' has upstream collections of lengths {w} and {}",
                        states.len()
                    )))
                }
            },
            EdgeView::Blocked(state) => return Ok(Expansion::Blocked(state.clone())),
        }
    }

    width
        .map(|w| Expansion::Width(w as u32))
        .ok_or_else(|| EngineError::graph(format!("mapped task '{task_id}' has no mapped upstream edge")))
}
