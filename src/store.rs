// ABOUTME: Remote run-store interface with versioned fetch and propose operations
// ABOUTME: Includes an in-memory reference implementation used by tests and local runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::State;

/// Authoritative snapshot of a flow run and all of its task-run records.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRunInfo {
    pub id: String,
    pub state: State,
    pub version: u64,
    pub task_runs: Vec<TaskRunInfo>,
}

/// Authoritative snapshot of one task run. `map_index` is `None` for an
/// unmapped task and `Some(i)` for the i-th child of a mapped expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunInfo {
    pub id: String,
    pub task_id: String,
    pub map_index: Option<u32>,
    pub state: State,
    pub version: u64,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("version conflict on {kind} run {id}: proposal against version {expected}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
    },

    #[error("flow run not found: {id}")]
    FlowRunNotFound { id: String },

    #[error("task run not found: {id}")]
    TaskRunNotFound { id: String },

    #[error("store backend error")]
    Backend(#[from] anyhow::Error),
}

/// The remote store collaborator. All engine mutation goes through the
/// version-checked `set_*` operations: a proposal succeeds and increments the
/// stored version iff `expected_version` matches, otherwise the store is left
/// untouched and `VersionConflict` is returned.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn flow_run_info(&self, flow_run_id: &str) -> Result<FlowRunInfo, StoreError>;

    /// Return the task run keyed by `(flow_run_id, task_id, map_index)`,
    /// creating a fresh `Pending` record at version 0 if none exists.
    async fn task_run_info(
        &self,
        flow_run_id: &str,
        task_id: &str,
        map_index: Option<u32>,
    ) -> Result<TaskRunInfo, StoreError>;

    async fn set_flow_run_state(
        &self,
        flow_run_id: &str,
        expected_version: u64,
        state: State,
    ) -> Result<(), StoreError>;

    async fn set_task_run_state(
        &self,
        task_run_id: &str,
        expected_version: u64,
        state: State,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct FlowRunRecord {
    state: State,
    version: u64,
}

#[derive(Debug, Clone)]
struct TaskRunRecord {
    id: String,
    flow_run_id: String,
    task_id: String,
    map_index: Option<u32>,
    state: State,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    flow_runs: HashMap<String, FlowRunRecord>,
    task_runs: HashMap<String, TaskRunRecord>,
    flow_proposals: u64,
    task_proposals: u64,
}

/// In-memory `RunStore`. Seeding and inspection helpers let tests express
/// pre-existing runs (a downstream already failed, a task claimed by another
/// executor) and assert on versions and proposal counts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a flow run in `Pending` at version 0.
    pub async fn insert_flow_run(&self, flow_run_id: &str) {
        let mut inner = self.inner.write().await;
        inner.flow_runs.insert(
            flow_run_id.to_string(),
            FlowRunRecord {
                state: State::Pending,
                version: 0,
            },
        );
    }

    /// Seed an unmapped task run in `Pending` at version 0.
    pub async fn insert_task_run(&self, task_run_id: &str, flow_run_id: &str, task_id: &str) {
        self.insert_task_run_with_state(task_run_id, flow_run_id, task_id, State::Pending, 0)
            .await;
    }

    pub async fn insert_task_run_with_state(
        &self,
        task_run_id: &str,
        flow_run_id: &str,
        task_id: &str,
        state: State,
        version: u64,
    ) {
        let mut inner = self.inner.write().await;
        inner.task_runs.insert(
            task_run_id.to_string(),
            TaskRunRecord {
                id: task_run_id.to_string(),
                flow_run_id: flow_run_id.to_string(),
                task_id: task_id.to_string(),
                map_index: None,
                state,
                version,
            },
        );
    }

    /// Overwrite a flow run's state as an external actor would: no version
    /// check, version still incremented.
    pub async fn cancel_flow_run(&self, flow_run_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.flow_runs.get_mut(flow_run_id) {
            record.state = State::Cancelled;
            record.version += 1;
        }
    }

    pub async fn flow_run(&self, flow_run_id: &str) -> Option<(State, u64)> {
        let inner = self.inner.read().await;
        inner
            .flow_runs
            .get(flow_run_id)
            .map(|r| (r.state.clone(), r.version))
    }

    pub async fn task_run(&self, task_run_id: &str) -> Option<TaskRunInfo> {
        let inner = self.inner.read().await;
        inner.task_runs.get(task_run_id).map(record_info)
    }

    /// Every task run sharing `task_id` within the flow run: for a mapped
    /// task, the parent plus all children.
    pub async fn task_runs_for(&self, flow_run_id: &str, task_id: &str) -> Vec<TaskRunInfo> {
        let inner = self.inner.read().await;
        let mut runs: Vec<TaskRunInfo> = inner
            .task_runs
            .values()
            .filter(|r| r.flow_run_id == flow_run_id && r.task_id == task_id)
            .map(record_info)
            .collect();
        runs.sort_by_key(|r| r.map_index);
        runs
    }

    pub async fn child_run(
        &self,
        flow_run_id: &str,
        task_id: &str,
        map_index: u32,
    ) -> Option<TaskRunInfo> {
        self.task_runs_for(flow_run_id, task_id)
            .await
            .into_iter()
            .find(|r| r.map_index == Some(map_index))
    }

    /// Total number of propose calls received, accepted or not.
    pub async fn proposal_count(&self) -> u64 {
        let inner = self.inner.read().await;
        inner.flow_proposals + inner.task_proposals
    }
}

fn record_info(record: &TaskRunRecord) -> TaskRunInfo {
    TaskRunInfo {
        id: record.id.clone(),
        task_id: record.task_id.clone(),
        map_index: record.map_index,
        state: record.state.clone(),
        version: record.version,
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn flow_run_info(&self, flow_run_id: &str) -> Result<FlowRunInfo, StoreError> {
        let inner = self.inner.read().await;
        let record = inner
            .flow_runs
            .get(flow_run_id)
            .ok_or_else(|| StoreError::FlowRunNotFound {
                id: flow_run_id.to_string(),
            })?;

        let task_runs = inner
            .task_runs
            .values()
            .filter(|r| r.flow_run_id == flow_run_id)
            .map(record_info)
            .collect();

        Ok(FlowRunInfo {
            id: flow_run_id.to_string(),
            state: record.state.clone(),
            version: record.version,
            task_runs,
        })
    }

    async fn task_run_info(
        &self,
        flow_run_id: &str,
        task_id: &str,
        map_index: Option<u32>,
    ) -> Result<TaskRunInfo, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(record) = inner.task_runs.values().find(|r| {
            r.flow_run_id == flow_run_id && r.task_id == task_id && r.map_index == map_index
        }) {
            return Ok(record_info(record));
        }

        let record = TaskRunRecord {
            id: Uuid::new_v4().to_string(),
            flow_run_id: flow_run_id.to_string(),
            task_id: task_id.to_string(),
            map_index,
            state: State::Pending,
            version: 0,
        };
        let info = record_info(&record);
        inner.task_runs.insert(record.id.clone(), record);
        Ok(info)
    }

    async fn set_flow_run_state(
        &self,
        flow_run_id: &str,
        expected_version: u64,
        state: State,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.flow_proposals += 1;

        let record = inner
            .flow_runs
            .get_mut(flow_run_id)
            .ok_or_else(|| StoreError::FlowRunNotFound {
                id: flow_run_id.to_string(),
            })?;

        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                kind: "flow",
                id: flow_run_id.to_string(),
                expected: expected_version,
            });
        }

        record.state = state;
        record.version += 1;
        Ok(())
    }

    async fn set_task_run_state(
        &self,
        task_run_id: &str,
        expected_version: u64,
        state: State,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.task_proposals += 1;

        let record = inner
            .task_runs
            .get_mut(task_run_id)
            .ok_or_else(|| StoreError::TaskRunNotFound {
                id: task_run_id.to_string(),
            })?;

        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                kind: "task",
                id: task_run_id.to_string(),
                expected: expected_version,
            });
        }

        record.state = state;
        record.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_run_created_on_miss() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;

        let info = store.task_run_info("fr-1", "t1", None).await.unwrap();
        assert_eq!(info.state, State::Pending);
        assert_eq!(info.version, 0);

        // the same key resolves to the same record
        let again = store.task_run_info("fr-1", "t1", None).await.unwrap();
        assert_eq!(again.id, info.id);

        // a different map index is a different record
        let child = store.task_run_info("fr-1", "t1", Some(0)).await.unwrap();
        assert_ne!(child.id, info.id);
    }

    #[tokio::test]
    async fn test_accepted_proposal_increments_version() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;
        store.insert_task_run("tr-1", "fr-1", "t1").await;

        store
            .set_task_run_state("tr-1", 0, State::Running)
            .await
            .unwrap();
        store
            .set_task_run_state("tr-1", 1, State::success(json!(1)))
            .await
            .unwrap();

        let info = store.task_run("tr-1").await.unwrap();
        assert_eq!(info.version, 2);
        assert!(info.state.is_successful());
    }

    #[tokio::test]
    async fn test_stale_proposal_rejected_and_store_untouched() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;
        store.insert_task_run("tr-1", "fr-1", "t1").await;

        store
            .set_task_run_state("tr-1", 0, State::Running)
            .await
            .unwrap();

        let err = store
            .set_task_run_state("tr-1", 0, State::failed("stale writer"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let info = store.task_run("tr-1").await.unwrap();
        assert_eq!(info.state, State::Running);
        assert_eq!(info.version, 1);
    }

    #[tokio::test]
    async fn test_flow_run_info_collects_task_runs() {
        let store = InMemoryStore::new();
        store.insert_flow_run("fr-1").await;
        store.insert_flow_run("fr-2").await;
        store.insert_task_run("tr-1", "fr-1", "t1").await;
        store.insert_task_run("tr-2", "fr-2", "t1").await;

        let info = store.flow_run_info("fr-1").await.unwrap();
        assert_eq!(info.task_runs.len(), 1);
        assert_eq!(info.task_runs[0].id, "tr-1");
    }
}
