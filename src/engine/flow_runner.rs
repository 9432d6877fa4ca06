// ABOUTME: Single-pass flow orchestration over topological batches of task runs
// ABOUTME: Resumable against the store, with cancellation checks between batches

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::error::{EngineError, Result};
use super::mapper::{EdgeView, Mapper};
use super::pool::ExecutionPool;
use super::sync::{FlowRunHandle, Proposal, StateSync, TaskRunHandle};
use super::task_runner::TaskRunner;
use crate::config::EngineConfig;
use crate::flow::{Flow, Task};
use crate::state::{reduce_children, State};
use crate::store::RunStore;

/// Working set of task-run handles for one pass, keyed by task id and map
/// index. Mapped parents sit at index `None` next to their children.
struct RunLedger {
    runs: HashMap<(String, Option<u32>), TaskRunHandle>,
}

impl RunLedger {
    fn new() -> Self {
        Self {
            runs: HashMap::new(),
        }
    }

    fn insert(&mut self, handle: TaskRunHandle) {
        self.runs
            .insert((handle.task_id.clone(), handle.map_index), handle);
    }

    fn get(&self, task_id: &str) -> Option<&TaskRunHandle> {
        self.runs.get(&(task_id.to_string(), None))
    }

    /// The recorded state of a task's parent-level run, `Pending` if the run
    /// has not been created yet.
    fn parent_state(&self, task_id: &str) -> State {
        self.get(task_id)
            .map(|h| h.state.clone())
            .unwrap_or(State::Pending)
    }

    /// Index-ordered child states of a mapped task. A child that has not
    /// been created yet reads as `Pending`.
    fn child_states(&self, task_id: &str, width: u32) -> Vec<State> {
        (0..width)
            .map(|i| {
                self.runs
                    .get(&(task_id.to_string(), Some(i)))
                    .map(|h| h.state.clone())
                    .unwrap_or(State::Pending)
            })
            .collect()
    }

    fn unfinished_mut(&mut self) -> impl Iterator<Item = &mut TaskRunHandle> {
        self.runs.values_mut().filter(|h| !h.state.is_finished())
    }
}

/// One unit of work for a batch: either a single lifecycle step for an
/// unmapped task, or an expansion step for a mapped one.
enum Dispatch {
    Plain {
        task: Task,
        run: TaskRunHandle,
        upstream: Vec<State>,
    },
    Mapped {
        task: Task,
        parent: TaskRunHandle,
        raw: Vec<State>,
        views: Vec<EdgeView>,
    },
}

/// Drives one resumable pass over a flow run. Each pass walks the graph in
/// topological batches, gives every ready task run one lifecycle step, and
/// finalizes the flow run when every task run is finished. Tasks waiting out
/// a retry delay leave the flow `Running` for a later pass to pick up.
pub struct FlowRunner {
    sync: StateSync,
    pool: ExecutionPool,
}

impl FlowRunner {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self::with_pool(store, ExecutionPool::new(4))
    }

    pub fn with_pool(store: Arc<dyn RunStore>, pool: ExecutionPool) -> Self {
        Self {
            sync: StateSync::new(store),
            pool,
        }
    }

    pub fn from_config(store: Arc<dyn RunStore>, config: &EngineConfig) -> Self {
        let pool = ExecutionPool::new(config.max_concurrent_tasks)
            .with_default_timeout(config.default_task_timeout);
        Self::with_pool(store, pool)
    }

    /// Run one pass over every task in the flow.
    pub async fn run(&self, flow: &Flow, flow_run_id: &str) -> Result<State> {
        self.run_subset(flow, flow_run_id, None).await
    }

    /// Run one pass restricted to `only`, when given. A restricted pass never
    /// finalizes the flow run: untouched tasks still count as unfinished.
    #[instrument(skip(self, flow, only))]
    pub async fn run_subset(
        &self,
        flow: &Flow,
        flow_run_id: &str,
        only: Option<&HashSet<String>>,
    ) -> Result<State> {
        flow.validate()?;

        let info = self.sync.load_flow(flow_run_id).await?;
        let mut flow_run = FlowRunHandle::from_info(&info);

        if flow_run.state.is_finished() {
            info!(state = %flow_run.state, "flow run already finished");
            return Ok(flow_run.state);
        }

        let mut ledger = RunLedger::new();
        for task_run in info.task_runs {
            ledger.insert(TaskRunHandle::from_info(flow_run_id, task_run));
        }

        if flow_run.state.is_pending()
            && self.sync.propose_flow(&mut flow_run, State::Running).await?
                == Proposal::Superseded
            && flow_run.state.is_finished()
        {
            return Ok(flow_run.state);
        }

        for batch in flow.execution_batches()? {
            // an external actor may have cancelled the run mid-pass
            let remote = self.sync.load_flow(flow_run_id).await?;
            flow_run.state = remote.state;
            flow_run.version = remote.version;
            if flow_run.state == State::Cancelled {
                warn!("flow run cancelled, abandoning remaining batches");
                self.cancel_remaining(&mut ledger).await;
                return Ok(State::Cancelled);
            }

            let mut jobs = Vec::new();
            for task_id in &batch {
                if let Some(only) = only {
                    if !only.contains(task_id) {
                        continue;
                    }
                }
                if let Some(job) = self.prepare(flow, flow_run_id, task_id, &ledger).await? {
                    jobs.push(job);
                }
            }

            let results = join_all(jobs.into_iter().map(|job| self.dispatch_one(job))).await;
            for handles in results {
                for handle in handles? {
                    ledger.insert(handle);
                }
            }
        }

        if only.is_some() {
            return Ok(State::Running);
        }

        let states: Vec<State> = flow
            .tasks()
            .map(|task| effective_state(task, &ledger))
            .collect();

        if states.iter().any(|s| !s.is_finished()) {
            info!("task runs still outstanding, leaving flow running");
            return Ok(State::Running);
        }

        // the flow-level fold is the child reduction with the collected
        // results dropped; every state is finished here, so an unreduced
        // remainder can only mean a cancelled run
        let final_state = match reduce_children(&states) {
            failed @ State::Failed { .. } => failed,
            State::Success { .. } => State::Success {
                result: Value::Null,
            },
            _ => State::Cancelled,
        };

        info!(state = %final_state, "finalizing flow run");
        self.sync.propose_flow(&mut flow_run, final_state).await?;
        Ok(flow_run.state)
    }

    /// Build the dispatch job for one task, or `None` when its dependencies
    /// are not ready this pass.
    async fn prepare(
        &self,
        flow: &Flow,
        flow_run_id: &str,
        task_id: &str,
        ledger: &RunLedger,
    ) -> Result<Option<Dispatch>> {
        let task = flow
            .task(task_id)
            .ok_or_else(|| EngineError::graph(format!("batch references unknown task '{task_id}'")))?;

        let run = match ledger.get(task_id) {
            Some(handle) => handle.clone(),
            None => self.sync.load_task(flow_run_id, task_id, None).await?,
        };

        let edges = flow.upstream_edges(task_id);
        let mut raw = Vec::with_capacity(edges.len());
        let mut gating = Vec::with_capacity(edges.len());
        for edge in &edges {
            let upstream_task = flow.task(&edge.upstream).ok_or_else(|| {
                EngineError::graph(format!("edge references unknown task '{}'", edge.upstream))
            })?;
            raw.push(ledger.parent_state(&edge.upstream));
            // a mapped edge gates on the raw upstream state, so expansion can
            // proceed while individual upstream children are still retrying
            if edge.mapped {
                gating.push(ledger.parent_state(&edge.upstream));
            } else {
                gating.push(effective_state(upstream_task, ledger));
            }
        }

        if gating.iter().any(|s| !s.is_finished()) {
            debug!(task_id, "dependencies not finished, skipping this pass");
            return Ok(None);
        }

        if !task.mapped {
            return Ok(Some(Dispatch::Plain {
                task: task.clone(),
                run,
                upstream: gating,
            }));
        }

        let mut views = Vec::with_capacity(edges.len());
        for (edge, gate) in edges.iter().zip(&gating) {
            let view = if edge.mapped {
                match ledger.parent_state(&edge.upstream) {
                    State::Success {
                        result: Value::Array(items),
                    } => EdgeView::PerIndex(items.into_iter().map(State::success).collect()),
                    State::Mapped { children } => {
                        EdgeView::PerIndex(ledger.child_states(&edge.upstream, children))
                    }
                    other => EdgeView::Blocked(other),
                }
            } else {
                EdgeView::Plain(gate.clone())
            };
            views.push(view);
        }

        Ok(Some(Dispatch::Mapped {
            task: task.clone(),
            parent: run,
            raw,
            views,
        }))
    }

    async fn dispatch_one(&self, job: Dispatch) -> Result<Vec<TaskRunHandle>> {
        match job {
            Dispatch::Plain {
                task,
                mut run,
                upstream,
            } => {
                let runner = TaskRunner::new(&self.sync, &self.pool);
                runner.run_one(&task, &mut run, &upstream).await?;
                Ok(vec![run])
            }
            Dispatch::Mapped {
                task,
                mut parent,
                raw,
                views,
            } => {
                let mapper = Mapper::new(&self.sync, &self.pool);
                let outcome = mapper.run_mapped(&task, &mut parent, &raw, &views).await?;
                let mut handles = vec![parent];
                handles.extend(outcome.children);
                Ok(handles)
            }
        }
    }

    /// Propose `Cancelled` to every non-finished task run. Conflicts are
    /// absorbed: whatever state won remotely stands.
    async fn cancel_remaining(&self, ledger: &mut RunLedger) {
        for handle in ledger.unfinished_mut() {
            if let Err(e) = self.sync.propose_task(handle, State::Cancelled).await {
                warn!(task_id = %handle.task_id, error = %e, "failed to cancel task run");
            }
        }
    }
}

/// The state a task contributes to downstream gating and to the flow-level
/// fold. For a mapped task this is the reduction of its children; for
/// everything else, the recorded state itself.
fn effective_state(task: &Task, ledger: &RunLedger) -> State {
    let parent = ledger.parent_state(&task.id);
    if task.mapped {
        if let State::Mapped { children } = parent {
            return reduce_children(&ledger.child_states(&task.id, children));
        }
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Task;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_linear_flow_reaches_success() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;

        let mut flow = Flow::new();
        flow.add_task(Task::constant("a", json!(1)))
            .add_task(Task::constant("b", json!(2)))
            .add_edge("a", "b");

        let runner = FlowRunner::new(Arc::new(store.clone()));
        let state = runner.run(&flow, "fr-1").await.unwrap();
        assert_eq!(
            state,
            State::Success {
                result: Value::Null
            }
        );

        let (flow_state, version) = store.flow_run("fr-1").await.unwrap();
        assert!(flow_state.is_successful());
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_missing_flow_run_is_an_error() {
        let store = InMemoryStore::new();
        let mut flow = Flow::new();
        flow.add_task(Task::constant("a", json!(1)));

        let runner = FlowRunner::new(Arc::new(store));
        let err = runner.run(&flow, "ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected_before_any_proposal() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;

        let mut flow = Flow::new();
        flow.add_task(Task::constant("a", json!(1)))
            .add_task(Task::constant("b", json!(2)))
            .add_edge("a", "b")
            .add_edge("b", "a");

        let runner = FlowRunner::new(Arc::new(store.clone()));
        let err = runner.run(&flow, "fr-1").await.unwrap_err();
        assert!(matches!(err, EngineError::Flow(_)));
        assert_eq!(store.proposal_count().await, 0);
    }
}
