// ABOUTME: Synchronization layer reconciling local transitions with the remote store
// ABOUTME: Optimistic-concurrency proposals where a losing writer adopts the remote state

use std::sync::Arc;
use tracing::{debug, warn};

use super::error::Result;
use crate::state::State;
use crate::store::{FlowRunInfo, RunStore, StoreError, TaskRunInfo};

/// Local working copy of one task-run record. The handle tracks the version
/// the engine believes the store holds; every accepted proposal advances it
/// by exactly one.
#[derive(Debug, Clone)]
pub struct TaskRunHandle {
    pub id: String,
    pub flow_run_id: String,
    pub task_id: String,
    pub map_index: Option<u32>,
    pub state: State,
    pub version: u64,
}

impl TaskRunHandle {
    pub fn from_info(flow_run_id: &str, info: TaskRunInfo) -> Self {
        Self {
            id: info.id,
            flow_run_id: flow_run_id.to_string(),
            task_id: info.task_id,
            map_index: info.map_index,
            state: info.state,
            version: info.version,
        }
    }

    fn adopt(&mut self, info: TaskRunInfo) {
        self.id = info.id;
        self.state = info.state;
        self.version = info.version;
    }
}

/// Local working copy of the flow-run record.
#[derive(Debug, Clone)]
pub struct FlowRunHandle {
    pub id: String,
    pub state: State,
    pub version: u64,
}

impl FlowRunHandle {
    pub fn from_info(info: &FlowRunInfo) -> Self {
        Self {
            id: info.id.clone(),
            state: info.state.clone(),
            version: info.version,
        }
    }
}

/// Outcome of a propose operation. `Superseded` means another writer won the
/// optimistic race: the handle now carries the re-fetched remote state, the
/// original proposal is dropped, and the caller must not retry it blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    Accepted,
    Superseded,
}

/// Mediates every engine mutation of the remote store.
pub struct StateSync {
    store: Arc<dyn RunStore>,
}

impl StateSync {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn load_flow(&self, flow_run_id: &str) -> Result<FlowRunInfo> {
        Ok(self.store.flow_run_info(flow_run_id).await?)
    }

    /// Fetch-or-create the task run keyed by `(flow_run_id, task_id, map_index)`.
    pub async fn load_task(
        &self,
        flow_run_id: &str,
        task_id: &str,
        map_index: Option<u32>,
    ) -> Result<TaskRunHandle> {
        let info = self
            .store
            .task_run_info(flow_run_id, task_id, map_index)
            .await?;
        Ok(TaskRunHandle::from_info(flow_run_id, info))
    }

    /// Propose a task-run transition against the handle's version. The
    /// transition must be legal under the state model; an illegal proposal
    /// is rejected here without touching the store.
    pub async fn propose_task(&self, run: &mut TaskRunHandle, state: State) -> Result<Proposal> {
        run.state.validate_transition(&state)?;
        match self
            .store
            .set_task_run_state(&run.id, run.version, state.clone())
            .await
        {
            Ok(()) => {
                debug!(
                    task_id = %run.task_id,
                    version = run.version + 1,
                    state = %state,
                    "task run transition accepted"
                );
                run.version += 1;
                run.state = state;
                Ok(Proposal::Accepted)
            }
            Err(StoreError::VersionConflict { .. }) => {
                let info = self
                    .store
                    .task_run_info(&run.flow_run_id, &run.task_id, run.map_index)
                    .await?;
                warn!(
                    task_id = %run.task_id,
                    proposed = %state,
                    remote = %info.state,
                    "task run proposal superseded by a concurrent writer"
                );
                run.adopt(info);
                Ok(Proposal::Superseded)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Propose a flow-run transition against the handle's version.
    pub async fn propose_flow(&self, run: &mut FlowRunHandle, state: State) -> Result<Proposal> {
        run.state.validate_transition(&state)?;
        match self
            .store
            .set_flow_run_state(&run.id, run.version, state.clone())
            .await
        {
            Ok(()) => {
                debug!(version = run.version + 1, state = %state, "flow run transition accepted");
                run.version += 1;
                run.state = state;
                Ok(Proposal::Accepted)
            }
            Err(StoreError::VersionConflict { .. }) => {
                let info = self.store.flow_run_info(&run.id).await?;
                warn!(
                    proposed = %state,
                    remote = %info.state,
                    "flow run proposal superseded by a concurrent writer"
                );
                run.state = info.state;
                run.version = info.version;
                Ok(Proposal::Superseded)
            }
            Err(e) => Err(e.into()),
        }
    }
}
