// ABOUTME: Flow graph definition with tasks, dependency edges, and triggers
// ABOUTME: Validates the DAG and plans batched topological execution order

use async_trait::async_trait;
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::{Direction, Graph};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::state::State;

#[derive(Error, Debug, PartialEq)]
pub enum FlowError {
    #[error("edge references unknown task '{task}'")]
    UnknownTask { task: String },

    #[error("task '{task}' depends on itself")]
    SelfDependency { task: String },

    #[error("dependency cycle involving task '{task}'")]
    CircularDependency { task: String },

    #[error("task '{task}' is marked mapped but has no mapped upstream edge")]
    NotMapped { task: String },
}

/// Execution-time identity handed to a task body. `attempt` persists across
/// engine restarts (it is derived from the stored `Retrying` state), so a
/// body can distinguish a first attempt from a retried one.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub flow_run_id: String,
    pub task_run_id: String,
    pub task_id: String,
    pub map_index: Option<u32>,
    pub attempt: u32,
}

/// A unit of work. Inputs are the upstream results in edge order; for a
/// mapped child, the element at the child's map index.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self, ctx: &RunContext, inputs: Vec<Value>) -> anyhow::Result<Value>;
}

/// A body that ignores its inputs and returns a fixed value. Useful as the
/// collection source feeding a mapped task.
pub struct ConstantWork(pub Value);

#[async_trait]
impl Work for ConstantWork {
    async fn run(&self, _ctx: &RunContext, _inputs: Vec<Value>) -> anyhow::Result<Value> {
        Ok(self.0.clone())
    }
}

/// Predicate over upstream states deciding whether a task run proceeds.
/// A task with no upstream dependencies always proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    AllSuccessful,
    AllFinished,
    AnySuccessful,
    AnyFailed,
    Always,
}

impl Trigger {
    pub fn evaluate(&self, upstream: &[State]) -> bool {
        if upstream.is_empty() {
            return true;
        }
        match self {
            Trigger::AllSuccessful => upstream.iter().all(State::is_successful),
            Trigger::AllFinished => upstream.iter().all(State::is_finished),
            Trigger::AnySuccessful => upstream.iter().any(State::is_successful),
            Trigger::AnyFailed => upstream.iter().any(State::is_failed),
            Trigger::Always => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::AllSuccessful => "all_successful",
            Trigger::AllFinished => "all_finished",
            Trigger::AnySuccessful => "any_successful",
            Trigger::AnyFailed => "any_failed",
            Trigger::Always => "always",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node definition: identity, body, trigger, and retry policy. The
/// `mapped` flag is set by [`Flow::add_mapped_edge`] when the task's input
/// is computed element-wise over an upstream collection.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub trigger: Trigger,
    /// Additional attempts after the first; `max_retries: 1` means two runs.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub mapped: bool,
    work: Arc<dyn Work>,
}

impl Task {
    pub fn new(id: impl Into<String>, work: impl Work + 'static) -> Self {
        Self {
            id: id.into(),
            trigger: Trigger::default(),
            max_retries: 0,
            retry_delay: Duration::ZERO,
            timeout: None,
            mapped: false,
            work: Arc::new(work),
        }
    }

    /// A task whose body returns a fixed value.
    pub fn constant(id: impl Into<String>, value: Value) -> Self {
        Self::new(id, ConstantWork(value))
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn work(&self) -> Arc<dyn Work> {
        Arc::clone(&self.work)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("max_retries", &self.max_retries)
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// A directed dependency. `mapped` marks an edge whose downstream input is
/// computed element-wise over the upstream's output collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
    pub mapped: bool,
}

/// The static dependency graph of task definitions.
#[derive(Clone, Default)]
pub struct Flow {
    tasks: IndexMap<String, Task>,
    edges: Vec<Edge>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> &mut Self {
        self.tasks.insert(task.id.clone(), task);
        self
    }

    pub fn add_edge(&mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> &mut Self {
        self.edges.push(Edge {
            upstream: upstream.into(),
            downstream: downstream.into(),
            mapped: false,
        });
        self
    }

    /// Add a mapped dependency and mark the downstream task as mapped.
    pub fn add_mapped_edge(
        &mut self,
        upstream: impl Into<String>,
        downstream: impl Into<String>,
    ) -> &mut Self {
        let downstream = downstream.into();
        if let Some(task) = self.tasks.get_mut(&downstream) {
            task.mapped = true;
        }
        self.edges.push(Edge {
            upstream: upstream.into(),
            downstream,
            mapped: true,
        });
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Incoming edges of `task_id`, in insertion order. This order is the
    /// input order handed to the task body.
    pub fn upstream_edges(&self, task_id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.downstream == task_id)
            .collect()
    }

    /// Check edge endpoints, self-dependencies, mapped-flag consistency, and
    /// acyclicity.
    pub fn validate(&self) -> Result<(), FlowError> {
        for edge in &self.edges {
            for endpoint in [&edge.upstream, &edge.downstream] {
                if !self.tasks.contains_key(endpoint) {
                    return Err(FlowError::UnknownTask {
                        task: endpoint.clone(),
                    });
                }
            }
            if edge.upstream == edge.downstream {
                return Err(FlowError::SelfDependency {
                    task: edge.upstream.clone(),
                });
            }
        }

        for task in self.tasks.values() {
            if task.mapped
                && !self
                    .edges
                    .iter()
                    .any(|e| e.mapped && e.downstream == task.id)
            {
                return Err(FlowError::NotMapped {
                    task: task.id.clone(),
                });
            }
        }

        self.sorted_nodes().map(|_| ())
    }

    /// Batches of task ids in topological order; every task in a batch has
    /// all of its dependencies in earlier batches, so batch members can be
    /// dispatched concurrently.
    pub fn execution_batches(&self) -> Result<Vec<Vec<String>>, FlowError> {
        let (graph, sorted) = self.sorted_nodes()?;

        let mut batches = Vec::new();
        let mut completed: Vec<NodeIndex> = Vec::new();
        let mut remaining = sorted;

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|&node| {
                graph
                    .neighbors_directed(node, Direction::Incoming)
                    .all(|dep| completed.contains(&dep))
            });

            if ready.is_empty() {
                // unreachable once toposort has succeeded
                break;
            }

            batches.push(ready.iter().map(|&n| graph[n].clone()).collect());
            completed.extend(&ready);
            remaining = blocked;
        }

        Ok(batches)
    }

    fn sorted_nodes(&self) -> Result<(Graph<String, ()>, Vec<NodeIndex>), FlowError> {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();

        for id in self.tasks.keys() {
            let node = graph.add_node(id.clone());
            indices.insert(id.clone(), node);
        }

        for edge in &self.edges {
            if let (Some(&up), Some(&down)) =
                (indices.get(&edge.upstream), indices.get(&edge.downstream))
            {
                graph.add_edge(up, down, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| FlowError::CircularDependency {
            task: graph[cycle.node_id()].clone(),
        })?;

        Ok((graph, sorted))
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish()
    }
}
